//! tapnat - user-space tap-to-socket network translator
//!
//! Terminates L2 Ethernet frames on a tap channel (Unix stream socket with
//! length-prefixed frames, or a tuntap device inside a network namespace) and
//! re-originates the carried TCP/UDP/ICMP traffic over ordinary kernel
//! sockets owned by an unprivileged user.

pub mod config;
pub mod ctx;
pub mod dataplane;
pub mod error;
pub mod event;
pub mod netns;
pub mod protocol;
pub mod tap;
pub mod telemetry;
pub mod util;

pub use error::{Error, Result};
