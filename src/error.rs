use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("file descriptor {0} above reference limit")]
    FdExhausted(i32),

    #[error("flow table full")]
    FlowTableFull,

    #[error("tap disconnected")]
    TapDisconnected,

    #[error("network namespace gone")]
    NamespaceGone,

    #[error("invalid packet: {0}")]
    InvalidPacket(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Last OS error, as our error type.
    pub fn last_os() -> Self {
        Error::Io(io::Error::last_os_error())
    }
}
