//! Spliced TCP: loopback connections relayed socket-to-socket
//!
//! In namespace mode, a connection whose peer is loopback never needs L2
//! translation: the other end lives in the other namespace. The accepted
//! socket is paired with a socket connected to the same loopback port on the
//! far side and bytes are relayed directly.
//!
//! The relay borrows the main engine's buffer discipline: data is peeked,
//! written to the other socket, and only the bytes actually written are
//! consumed with MSG_TRUNC, so backpressure needs no user-space queue.

use crate::ctx::{sockaddr_from, Ctx};
use crate::dataplane::flow::FlowCommon;
use crate::event::{claim_fd, Epoll, EpollRef, FdKind, Pif};
use crate::util::Stamp;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use tracing::{debug, trace};

const CONNECTING: u8 = 1 << 0;
const ESTABLISHED: u8 = 1 << 1;
const FIN_A: u8 = 1 << 2;
const FIN_B: u8 = 1 << 3;
const CLOSED: u8 = 0;

/// Seconds without traffic before a spliced connection is reset
const SPLICE_ACT_TIMEOUT: i64 = 7200;

const RELAY_CHUNK: usize = 32 << 10;

/// A spliced connection: side 0 is the accepted socket, side 1 the one we
/// connected on the opposite interface.
#[derive(Debug)]
pub struct TcpSpliceConn {
    pub common: FlowCommon,
    pub s: [RawFd; 2],
    pub events: u8,
    pub ts: i64,
}

impl TcpSpliceConn {
    /// Deferred hook: report closure to the flow scan.
    pub fn defer(&mut self) -> bool {
        if self.events != CLOSED {
            return false;
        }
        for s in &mut self.s {
            if *s >= 0 {
                unsafe { libc::close(*s) };
                *s = -1;
            }
        }
        true
    }

    /// Periodic activity check from the flow timer.
    pub fn timer(&mut self, now: Stamp) {
        if self.events != CLOSED && now.secs - self.ts > SPLICE_ACT_TIMEOUT {
            debug!("spliced connection activity timeout");
            self.events = CLOSED;
        }
    }
}

fn splice_ref(fd: RawFd, idx: u32, side: usize) -> EpollRef {
    EpollRef::new(FdKind::TcpSplice, fd, idx << 1 | side as u32)
}

/// Take over an accepted loopback connection; returns false when this
/// connection is not spliceable and belongs to the tap engine.
pub fn conn_from_sock(
    ctx: &mut Ctx,
    idx: u32,
    listen_ref: EpollRef,
    sock: RawFd,
    peer: (IpAddr, u16),
) -> bool {
    if ctx.mode != crate::config::Mode::Ns || !peer.0.is_loopback() {
        return false;
    }

    let v6 = matches!(peer.0, IpAddr::V6(_));
    let pif = listen_ref.listen_pif();
    let port = listen_ref.listen_port();
    let target_port = match pif {
        // Accepted in the namespace: connect on the host side
        Pif::Splice => ctx.tcp.fwd_out.remap(port),
        // Accepted on the host: connect inside the namespace
        Pif::Host => ctx.tcp.fwd_in.remap(port),
    };
    let target: SocketAddr = if v6 {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), target_port)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), target_port)
    };

    let domain = if v6 { libc::AF_INET6 } else { libc::AF_INET };
    let mksock = || unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    let raw = match pif {
        Pif::Splice => mksock(),
        // The connecting socket must live in the peer namespace; the fd
        // table is shared with the namespace child
        Pif::Host => {
            let mut fd = -1;
            if ctx.netns.call(|| fd = mksock()).is_err() {
                fd = -1;
            }
            fd
        }
    };
    let other = match claim_fd(raw) {
        Ok(fd) => fd,
        Err(_) => {
            unsafe { libc::close(sock) };
            ctx.flows.alloc_cancel(idx);
            return true;
        }
    };

    let (sa, sl) = sockaddr_from(&target);
    let ret = unsafe { libc::connect(other, &sa.sa, sl) };
    let connecting = if ret == 0 {
        false
    } else if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINPROGRESS) {
        true
    } else {
        unsafe {
            libc::close(sock);
            libc::close(other);
        }
        ctx.flows.alloc_cancel(idx);
        return true;
    };

    let mut conn = TcpSpliceConn {
        common: FlowCommon::default(),
        s: [sock, other],
        events: if connecting { CONNECTING } else { ESTABLISHED },
        ts: 0,
    };
    conn.common.pif[0] = pif;
    conn.common.pif[1] = match pif {
        Pif::Splice => Pif::Host,
        Pif::Host => Pif::Splice,
    };

    let ev_in = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    let _ = ctx.epoll.add(ev_in, splice_ref(sock, idx, 0));
    let ev_other = if connecting {
        (libc::EPOLLOUT | libc::EPOLLRDHUP) as u32
    } else {
        ev_in
    };
    let _ = ctx.epoll.add(ev_other, splice_ref(other, idx, 1));

    trace!(idx, port, ?pif, "spliced connection");
    ctx.flows
        .set(idx, crate::dataplane::flow::Flow::TcpSplice(conn));
    true
}

/// Move bytes from one side to the other until either runs dry. Returns
/// false when the connection must close.
fn relay(conn: &mut TcpSpliceConn, epoll: &Epoll, idx: u32, from: usize) -> bool {
    let to = 1 - from;
    let mut chunk = [0u8; RELAY_CHUNK];

    loop {
        let n = unsafe {
            libc::recv(
                conn.s[from],
                chunk.as_mut_ptr() as *mut libc::c_void,
                RELAY_CHUNK,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return matches!(
                err.raw_os_error(),
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR)
            );
        }
        if n == 0 {
            // EOF: mirror the shutdown, full close once both sides are done
            unsafe { libc::shutdown(conn.s[to], libc::SHUT_WR) };
            conn.events |= if from == 0 { FIN_A } else { FIN_B };
            return conn.events & (FIN_A | FIN_B) != FIN_A | FIN_B;
        }

        let m = unsafe {
            libc::send(
                conn.s[to],
                chunk.as_ptr() as *const libc::c_void,
                n as usize,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if m < 0 {
            let err = std::io::Error::last_os_error();
            if matches!(
                err.raw_os_error(),
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
            ) {
                // Receiver full: wait for it to drain, the unsent bytes
                // stay in the source socket
                let ev = (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP) as u32;
                let _ = epoll.modify(ev, splice_ref(conn.s[to], idx, to));
                return true;
            }
            return false;
        }

        // Consume exactly what was delivered
        unsafe {
            libc::recv(
                conn.s[from],
                std::ptr::null_mut(),
                m as usize,
                libc::MSG_TRUNC | libc::MSG_DONTWAIT,
            )
        };
        if (m as usize) < n as usize {
            let ev = (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP) as u32;
            let _ = epoll.modify(ev, splice_ref(conn.s[to], idx, to));
            return true;
        }
    }
}

/// Readiness on either socket of a spliced connection.
pub fn sock_handler(ctx: &mut Ctx, r: EpollRef, events: u32, now: Stamp) {
    let idx = r.data >> 1;
    let side = (r.data & 1) as usize;

    let epoll = &ctx.epoll;
    let Some(conn) = (match ctx.flows.at_mut(idx) {
        crate::dataplane::flow::Flow::TcpSplice(c) => Some(c),
        _ => None,
    }) else {
        return;
    };
    if conn.events == CLOSED {
        return;
    }
    conn.ts = now.secs;

    if events & libc::EPOLLERR as u32 != 0 {
        conn.events = CLOSED;
        return;
    }

    if conn.events & CONNECTING != 0 {
        if side == 1 && events & libc::EPOLLOUT as u32 != 0 {
            let mut so: libc::c_int = 0;
            let mut sl = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockopt(
                    conn.s[1],
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut so as *mut _ as *mut libc::c_void,
                    &mut sl,
                )
            };
            if ret < 0 || so != 0 {
                conn.events = CLOSED;
                return;
            }
            conn.events = ESTABLISHED;
            let ev = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
            let _ = epoll.modify(ev, splice_ref(conn.s[1], idx, 1));
            // The accepted side may have queued data while we connected
            if !relay(conn, epoll, idx, 0) {
                conn.events = CLOSED;
            }
        }
        return;
    }

    if events & libc::EPOLLOUT as u32 != 0 {
        // This side drained: resume pulling from the other one
        let ev = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        let _ = epoll.modify(ev, splice_ref(conn.s[side], idx, side));
        if !relay(conn, epoll, idx, 1 - side) {
            conn.events = CLOSED;
            return;
        }
    }

    if events & libc::EPOLLIN as u32 != 0 && !relay(conn, epoll, idx, side) {
        conn.events = CLOSED;
        return;
    }

    if events & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0 {
        // Drain whatever is left, then treat as EOF
        if !relay(conn, epoll, idx, side) {
            conn.events = CLOSED;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_relay_moves_bytes_and_consumes() {
        // a0 <-> a1 spliced to b0 <-> b1; writing into a0 must surface at b1
        let (a0, a1) = sock_pair();
        let (b0, b1) = sock_pair();
        let epoll = Epoll::new().unwrap();

        let mut conn = TcpSpliceConn {
            common: FlowCommon::default(),
            s: [a1, b0],
            events: ESTABLISHED,
            ts: 0,
        };

        let msg = b"spliced payload";
        let n = unsafe {
            libc::send(
                a0,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        assert_eq!(n as usize, msg.len());

        assert!(relay(&mut conn, &epoll, 0, 0));

        let mut out = [0u8; 64];
        let m = unsafe {
            libc::recv(
                b1,
                out.as_mut_ptr() as *mut libc::c_void,
                out.len(),
                libc::MSG_DONTWAIT,
            )
        };
        assert_eq!(m as usize, msg.len());
        assert_eq!(&out[..msg.len()], msg);

        // Source was consumed, not just peeked
        let again = unsafe {
            libc::recv(
                a1,
                out.as_mut_ptr() as *mut libc::c_void,
                out.len(),
                libc::MSG_DONTWAIT,
            )
        };
        assert_eq!(again, -1);

        for fd in [a0, a1, b0, b1] {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn test_relay_eof_mirrors_shutdown() {
        let (a0, a1) = sock_pair();
        let (b0, b1) = sock_pair();
        let epoll = Epoll::new().unwrap();

        let mut conn = TcpSpliceConn {
            common: FlowCommon::default(),
            s: [a1, b0],
            events: ESTABLISHED,
            ts: 0,
        };

        unsafe { libc::shutdown(a0, libc::SHUT_WR) };
        assert!(relay(&mut conn, &epoll, 0, 0));
        assert_eq!(conn.events & FIN_A, FIN_A);

        // The far side observes EOF
        let mut out = [0u8; 8];
        let m = unsafe {
            libc::recv(
                b1,
                out.as_mut_ptr() as *mut libc::c_void,
                out.len(),
                libc::MSG_DONTWAIT,
            )
        };
        assert_eq!(m, 0);

        for fd in [a0, a1, b0, b1] {
            unsafe { libc::close(fd) };
        }
    }
}
