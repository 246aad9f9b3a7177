//! Event loop core: typed epoll references, epoll and timerfd wrappers
//!
//! Every file descriptor registered with the loop carries a 64-bit reference:
//!
//! ```text
//!  bits  0..8   kind (FdKind)
//!  bits  8..32  file descriptor (so every fd must stay below 2^24)
//!  bits 32..64  kind-specific payload (flow index, port+pif, UDP ref)
//! ```
//!
//! The reference encoding is the only contract between the loop and the
//! protocol handlers: dispatch is strictly by kind.

use crate::{Error, Result};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Highest fd representable in the 24-bit reference field.
pub const FD_REF_MAX: i32 = (1 << 24) - 1;

/// Interface a socket was created on: init namespace or peer namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pif {
    Host = 0,
    Splice = 1,
}

impl Pif {
    fn from_u8(v: u8) -> Pif {
        if v == 1 {
            Pif::Splice
        } else {
            Pif::Host
        }
    }
}

/// What kind of handler owns a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FdKind {
    Tcp = 0,
    TcpSplice = 1,
    TcpListen = 2,
    TcpTimer = 3,
    Udp = 4,
    Ping = 5,
    NsQuitInotify = 6,
    NsQuitTimer = 7,
    TapNs = 8,
    TapStream = 9,
    TapListen = 10,
}

impl FdKind {
    fn from_u8(v: u8) -> Option<FdKind> {
        Some(match v {
            0 => FdKind::Tcp,
            1 => FdKind::TcpSplice,
            2 => FdKind::TcpListen,
            3 => FdKind::TcpTimer,
            4 => FdKind::Udp,
            5 => FdKind::Ping,
            6 => FdKind::NsQuitInotify,
            7 => FdKind::NsQuitTimer,
            8 => FdKind::TapNs,
            9 => FdKind::TapStream,
            10 => FdKind::TapListen,
            _ => return None,
        })
    }
}

/// Payload of a UDP socket reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpRef {
    pub v6: bool,
    /// Datagrams on this socket may be spliced between namespaces
    pub splice: bool,
    /// Bound at startup for a forwarded port (as opposed to ephemeral)
    pub orig: bool,
    pub pif: Pif,
    pub port: u16,
}

impl UdpRef {
    fn encode(&self) -> u32 {
        (self.v6 as u32) << 21
            | (self.splice as u32) << 20
            | (self.orig as u32) << 19
            | (self.pif as u32) << 16
            | self.port as u32
    }

    fn decode(data: u32) -> UdpRef {
        UdpRef {
            v6: data & 1 << 21 != 0,
            splice: data & 1 << 20 != 0,
            orig: data & 1 << 19 != 0,
            pif: Pif::from_u8((data >> 16) as u8 & 0x7),
            port: data as u16,
        }
    }
}

/// Typed epoll reference: fd, owning handler kind, kind-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpollRef {
    pub kind: FdKind,
    pub fd: RawFd,
    pub data: u32,
}

impl EpollRef {
    pub fn new(kind: FdKind, fd: RawFd, data: u32) -> Self {
        debug_assert!(fd >= 0 && fd <= FD_REF_MAX);
        Self { kind, fd, data }
    }

    pub fn udp(fd: RawFd, uref: UdpRef) -> Self {
        Self::new(FdKind::Udp, fd, uref.encode())
    }

    /// Listening TCP socket: forwarded port and namespace side.
    pub fn tcp_listen(fd: RawFd, pif: Pif, port: u16) -> Self {
        Self::new(FdKind::TcpListen, fd, (pif as u32) << 16 | port as u32)
    }

    pub fn as_udp(&self) -> UdpRef {
        UdpRef::decode(self.data)
    }

    pub fn listen_port(&self) -> u16 {
        self.data as u16
    }

    pub fn listen_pif(&self) -> Pif {
        Pif::from_u8((self.data >> 16) as u8)
    }

    /// Flow table index carried by Tcp/TcpTimer/Ping references.
    pub fn flow(&self) -> u32 {
        self.data
    }

    pub fn to_u64(self) -> u64 {
        (self.kind as u64) | (self.fd as u64) << 8 | (self.data as u64) << 32
    }

    pub fn from_u64(v: u64) -> Option<Self> {
        Some(Self {
            kind: FdKind::from_u8(v as u8)?,
            fd: (v >> 8) as i32 & FD_REF_MAX,
            data: (v >> 32) as u32,
        })
    }
}

/// Validate a freshly created fd against the 24-bit reference limit, closing
/// it when it doesn't fit. Every fd entering the epoll set passes this gate.
pub fn claim_fd(fd: RawFd) -> Result<RawFd> {
    if fd < 0 {
        return Err(Error::last_os());
    }
    if fd > FD_REF_MAX {
        unsafe { libc::close(fd) };
        return Err(Error::FdExhausted(fd));
    }
    Ok(fd)
}

/// The epoll set owned by the event loop.
#[derive(Debug)]
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os());
        }
        Ok(Self { fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, r: Option<EpollRef>) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: r.map(|r| r.to_u64()).unwrap_or(0),
        };
        let ret = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    pub fn add(&self, events: u32, r: EpollRef) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, r.fd, events, Some(r))
    }

    pub fn modify(&self, events: u32, r: EpollRef) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, r.fd, events, Some(r))
    }

    pub fn del(&self, fd: RawFd) {
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, None);
    }

    /// Wait for events; returns the number of ready descriptors.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::Io(err));
            }
            return Ok(n as usize);
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Create a monotonic timerfd, unarmed.
pub fn timerfd_create() -> Result<RawFd> {
    let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
    claim_fd(fd)
}

/// Arm (or disarm with a zero duration) a one-shot timerfd.
pub fn timerfd_arm(fd: RawFd, after: Duration) -> Result<()> {
    let it = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: after.as_secs() as libc::time_t,
            tv_nsec: after.subsec_nanos() as libc::c_long,
        },
    };
    if unsafe { libc::timerfd_settime(fd, 0, &it, std::ptr::null_mut()) } < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

/// Arm a one-shot timerfd, returning the previously pending value in seconds
/// (0 when it had already expired or was never set).
pub fn timerfd_arm_get_old(fd: RawFd, after: Duration) -> Result<u64> {
    let it = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: after.as_secs() as libc::time_t,
            tv_nsec: after.subsec_nanos() as libc::c_long,
        },
    };
    let mut old = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
    };
    if unsafe { libc::timerfd_settime(fd, 0, &it, &mut old) } < 0 {
        return Err(Error::last_os());
    }
    Ok(old.it_value.tv_sec as u64)
}

/// True if the timer still has a pending expiry.
pub fn timerfd_is_armed(fd: RawFd) -> bool {
    let mut cur = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
    };
    if unsafe { libc::timerfd_gettime(fd, &mut cur) } < 0 {
        return false;
    }
    cur.it_value.tv_sec != 0 || cur.it_value.tv_nsec != 0
}

/// Drain the expiry counter of a timerfd or eventfd-like descriptor.
pub fn drain_counter(fd: RawFd) {
    let mut buf = [0u8; 8];
    unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_round_trip() {
        let r = EpollRef::new(FdKind::Tcp, 0x00ab_cdef, 0xdead_beef);
        let back = EpollRef::from_u64(r.to_u64()).unwrap();
        assert_eq!(back.kind, FdKind::Tcp);
        assert_eq!(back.fd, 0x00ab_cdef);
        assert_eq!(back.data, 0xdead_beef);
    }

    #[test]
    fn test_udp_ref_round_trip() {
        let u = UdpRef {
            v6: true,
            splice: false,
            orig: true,
            pif: Pif::Splice,
            port: 5353,
        };
        let r = EpollRef::udp(7, u);
        assert_eq!(EpollRef::from_u64(r.to_u64()).unwrap().as_udp(), u);
    }

    #[test]
    fn test_listen_ref() {
        let r = EpollRef::tcp_listen(9, Pif::Host, 2222);
        let back = EpollRef::from_u64(r.to_u64()).unwrap();
        assert_eq!(back.listen_port(), 2222);
        assert_eq!(back.listen_pif(), Pif::Host);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(EpollRef::from_u64(0xff).is_none());
    }

    #[test]
    fn test_timerfd_arm_and_read() {
        let fd = timerfd_create().unwrap();
        timerfd_arm(fd, Duration::from_secs(100)).unwrap();
        assert!(timerfd_is_armed(fd));
        let old = timerfd_arm_get_old(fd, Duration::from_secs(50)).unwrap();
        assert!(old > 0);
        timerfd_arm(fd, Duration::ZERO).unwrap();
        assert!(!timerfd_is_armed(fd));
        unsafe { libc::close(fd) };
    }
}
