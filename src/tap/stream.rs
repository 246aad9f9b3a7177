//! Stream-mode tap: Unix socket carrying length-prefixed Ethernet frames
//!
//! Wire format: repeating `[u32 length, big endian][raw frame]`, no handshake
//! and no versioning. Exactly one frame may be split across a read boundary;
//! its tail is completed with a blocking receive so the stream stays framed.

use crate::event::claim_fd;
use crate::{Error, Result};
use std::os::unix::io::RawFd;
use tracing::info;

/// Length prefix on every stream frame
pub const FRAME_PREFIX: usize = 4;

fn unix_sockaddr(path: &str) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut sa: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    sa.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= sa.sun_path.len() {
        return Err(Error::Config(format!("socket path too long: {path}")));
    }
    for (i, b) in bytes.iter().enumerate() {
        sa.sun_path[i] = *b as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((sa, len as libc::socklen_t))
}

/// Probe whether a path has a live listener; a dead socket file answers
/// connect() with ENOENT/ECONNREFUSED/EACCES and is ours to take.
fn path_available(path: &str) -> bool {
    let (sa, sl) = match unix_sockaddr(path) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return false;
    }
    let ret = unsafe { libc::connect(fd, &sa as *const _ as *const libc::sockaddr, sl) };
    let err = std::io::Error::last_os_error().raw_os_error();
    unsafe { libc::close(fd) };
    ret != 0
        && matches!(
            err,
            Some(libc::ENOENT) | Some(libc::ECONNREFUSED) | Some(libc::EACCES)
        )
}

/// Create the listening socket for the hypervisor to connect to.
///
/// With no explicit path, tries `/tmp/tapnat_1.socket` through
/// `/tmp/tapnat_100.socket` and takes the first free one.
pub fn sock_unix_open(path: Option<&str>) -> Result<(RawFd, String)> {
    let path = match path {
        Some(p) => p.to_string(),
        None => (1..=100)
            .map(|n| format!("/tmp/tapnat_{n}.socket"))
            .find(|p| path_available(p))
            .ok_or_else(|| Error::Config("no free socket path in /tmp".into()))?,
    };

    let fd = claim_fd(unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;

    let _ = std::fs::remove_file(&path);
    let (sa, sl) = unix_sockaddr(&path)?;
    if unsafe { libc::bind(fd, &sa as *const _ as *const libc::sockaddr, sl) } < 0 {
        let e = Error::last_os();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    if unsafe { libc::listen(fd, 1) } < 0 {
        let e = Error::last_os();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    info!("tap socket listening on {path}");
    Ok((fd, path))
}

/// Accept a tap client connection.
pub fn accept_client(listen_fd: RawFd) -> Result<RawFd> {
    let fd = claim_fd(unsafe {
        libc::accept4(
            listen_fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    Ok(fd)
}

/// Complete a frame whose tail did not make it into the last read.
/// Blocking on purpose: the peer has committed to the frame by sending its
/// length, and nothing else can be parsed until it arrives.
pub fn recv_remainder(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    let mut got = 0;
    while got < buf.len() {
        let n = unsafe {
            libc::recv(
                fd,
                buf[got..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - got,
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::Io(err));
        }
        if n == 0 {
            return Err(Error::TapDisconnected);
        }
        got += n as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_sockaddr_too_long() {
        let long = "x".repeat(200);
        assert!(unix_sockaddr(&long).is_err());
        assert!(unix_sockaddr("/tmp/ok.socket").is_ok());
    }

    #[test]
    fn test_sock_unix_open_and_accept() {
        let path = format!("/tmp/tapnat_test_{}.socket", std::process::id());
        let (listen_fd, bound) = sock_unix_open(Some(&path)).unwrap();
        assert_eq!(bound, path);

        // connect a client, accept it
        let (sa, sl) = unix_sockaddr(&path).unwrap();
        let client =
            unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        assert!(client >= 0);
        let ret = unsafe { libc::connect(client, &sa as *const _ as *const libc::sockaddr, sl) };
        assert_eq!(ret, 0);
        let conn = accept_client(listen_fd).unwrap();
        assert!(conn >= 0);

        unsafe {
            libc::close(conn);
            libc::close(client);
            libc::close(listen_fd);
        }
        let _ = std::fs::remove_file(&path);
    }
}
