//! Tap transport: framing, L2/L3 demux, batched frame emission
//!
//! Both transports deliver raw Ethernet frames: the stream side with a
//! 32-bit length prefix per frame, the namespace side straight off the
//! tuntap device. Incoming packets are regrouped by L4 tuple so the protocol
//! engines see whole batches; outgoing frames are staged by the engines in
//! pre-cooked buffers and written out in one vector write per flush.

pub mod pool;
pub mod stream;
pub mod tun;

use crate::config::Mode;
use crate::ctx::Ctx;
use crate::dataplane::{icmp, tcp, udp};
use crate::protocol::{ethernet, ipv4, ipv6, EtherType};
use crate::util::{write_remainder, Stamp};
use crate::{Error, Result};
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use tracing::{debug, info, trace, warn};

/// Receive buffer for one tap read
pub const TAP_BUF_BYTES: usize = 256 * 1024;

/// Room reserved past the receive fill level so a split frame can always be
/// completed in place
const TAP_BUF_TAIL: usize = ethernet::MAX_FRAME_SIZE + stream::FRAME_PREFIX;

/// Per-frame bytes reserved in transmit buffers for the stream length prefix
pub const FRAME_PREFIX: usize = stream::FRAME_PREFIX;

/// Maximum distinct L4 tuples tracked per tap read
const TAP_SEQS: usize = 128;

/// Maximum packets grouped into one batch
const BATCH_MAX_PKTS: usize = 512;

/// Seconds between repeated can't-process-fragment diagnostics
const FRAGMENT_MSG_RATE: i64 = 10;

/// A run of tap packets sharing protocol and address/port tuple, handed to
/// one protocol engine in a single call.
pub struct L4Batch<'a> {
    pub v6: bool,
    pub proto: u8,
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub sport: u16,
    pub dport: u16,
    /// L4 slices: header plus payload
    pub pkts: Vec<&'a [u8]>,
}

pub struct TapCtx {
    pub mode: Mode,
    /// Tap data channel, -1 while no client is connected
    pub fd: RawFd,
    /// Listening Unix socket (stream mode)
    pub fd_listen: RawFd,
    pub sock_path: Option<String>,
    rx_buf: Vec<u8>,
    frag_warn_last: i64,
    frag_dropped: u64,
}

impl TapCtx {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            fd: -1,
            fd_listen: -1,
            sock_path: None,
            rx_buf: vec![0u8; TAP_BUF_BYTES + TAP_BUF_TAIL],
            frag_warn_last: 0,
            frag_dropped: 0,
        }
    }

    /// Send a batch of finalized frames; returns how many frames were fully
    /// written. A short vector write is completed frame-aligned via the
    /// per-frame fallback so no frame is ever torn.
    pub fn send_frames(&self, iov: &[libc::iovec]) -> usize {
        if self.fd < 0 || iov.is_empty() {
            return 0;
        }
        match self.mode {
            Mode::Stream => {
                let mut mh: libc::msghdr = unsafe { std::mem::zeroed() };
                mh.msg_iov = iov.as_ptr() as *mut libc::iovec;
                mh.msg_iovlen = iov.len();
                let n = unsafe { libc::sendmsg(self.fd, &mh, libc::MSG_NOSIGNAL) };
                if n < 0 {
                    debug!("tap send error: {}", std::io::Error::last_os_error());
                    return 0;
                }
                let total: usize = iov.iter().map(|v| v.iov_len).sum();
                if (n as usize) < total && write_remainder(self.fd, iov, n as usize).is_err() {
                    // Count the frames that made it out whole
                    let mut sent = 0usize;
                    let mut left = n as usize;
                    for v in iov {
                        if left < v.iov_len {
                            break;
                        }
                        left -= v.iov_len;
                        sent += 1;
                    }
                    return sent;
                }
                iov.len()
            }
            Mode::Ns => {
                for (i, v) in iov.iter().enumerate() {
                    let n = unsafe { libc::writev(self.fd, v, 1) };
                    if n < 0 {
                        let err = std::io::Error::last_os_error();
                        if err.raw_os_error() != Some(libc::EAGAIN) {
                            debug!("tap write error: {err}");
                        }
                        return i;
                    }
                }
                iov.len()
            }
        }
    }
}

/// Stamp the stream length prefix and return the iovec covering the frame as
/// the transport wants it: prefix included on stream, bare frame on tuntap.
pub fn finalize_frame(mode: Mode, buf: &mut [u8], frame_len: usize) -> libc::iovec {
    buf[..FRAME_PREFIX].copy_from_slice(&(frame_len as u32).to_be_bytes());
    match mode {
        Mode::Stream => libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: FRAME_PREFIX + frame_len,
        },
        Mode::Ns => libc::iovec {
            iov_base: buf[FRAME_PREFIX..].as_ptr() as *mut libc::c_void,
            iov_len: frame_len,
        },
    }
}

/// Accept a tap client on the listening Unix socket.
pub fn listen_handler(ctx: &mut Ctx) {
    let fd = match stream::accept_client(ctx.tap.fd_listen) {
        Ok(fd) => fd,
        Err(e) => {
            warn!("tap accept failed: {e}");
            return;
        }
    };

    if ctx.tap.fd != -1 {
        info!("tap client already connected, rejecting new one");
        unsafe { libc::close(fd) };
        return;
    }

    ctx.tap.fd = fd;
    let r = crate::event::EpollRef::new(crate::event::FdKind::TapStream, fd, 0);
    if let Err(e) = ctx
        .epoll
        .add((libc::EPOLLIN | libc::EPOLLRDHUP) as u32, r)
    {
        warn!("can't watch tap client: {e}");
        unsafe { libc::close(fd) };
        ctx.tap.fd = -1;
        return;
    }
    info!("tap client connected");
}

/// Drop the stream tap client; with --one-off the process is done.
fn sock_reset(ctx: &mut Ctx) {
    info!("tap client disconnected");
    if ctx.opts.one_off {
        std::process::exit(0);
    }
    if ctx.tap.fd != -1 {
        ctx.epoll.del(ctx.tap.fd);
        unsafe { libc::close(ctx.tap.fd) };
        ctx.tap.fd = -1;
    }
}

/// Stream-mode tap readiness: reassemble length-prefixed frames, demux.
pub fn handler_stream(ctx: &mut Ctx, events: u32, now: Stamp) {
    if events & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
        sock_reset(ctx);
        return;
    }

    let fd = ctx.tap.fd;
    let mut buf = std::mem::take(&mut ctx.tap.rx_buf);

    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            TAP_BUF_BYTES,
            libc::MSG_DONTWAIT,
        )
    };
    if n <= 0 {
        ctx.tap.rx_buf = buf;
        if n == 0 {
            sock_reset(ctx);
        } else {
            let err = std::io::Error::last_os_error();
            if !matches!(
                err.raw_os_error(),
                Some(libc::EAGAIN) | Some(libc::EINTR)
            ) {
                sock_reset(ctx);
            }
        }
        return;
    }

    let mut frames: Vec<(usize, usize)> = Vec::new();
    let mut p = 0usize;
    let mut avail = n as usize;
    let mut desync = false;

    loop {
        // Complete a prefix split across the read boundary
        if avail > 0 && avail < FRAME_PREFIX {
            if stream::recv_remainder(fd, &mut buf[p + avail..p + FRAME_PREFIX]).is_err() {
                desync = true;
            }
            avail = FRAME_PREFIX;
        }
        if avail < FRAME_PREFIX || desync {
            break;
        }

        let len = u32::from_be_bytes([buf[p], buf[p + 1], buf[p + 2], buf[p + 3]]) as usize;
        p += FRAME_PREFIX;
        avail -= FRAME_PREFIX;

        if len > ethernet::MAX_FRAME_SIZE {
            // Nothing sane can follow a frame this long; drop the client
            warn!("oversized tap frame ({len} bytes), resetting");
            desync = true;
            break;
        }

        // At most one frame can be cut short by the read; complete it
        if len > avail {
            if stream::recv_remainder(fd, &mut buf[p + avail..p + len]).is_err() {
                desync = true;
                break;
            }
            avail = len;
        }

        if len >= ethernet::HEADER_SIZE {
            frames.push((p, len));
        }
        p += len;
        avail -= len;
    }

    demux_frames(ctx, &buf, &frames, now);
    ctx.tap.rx_buf = buf;

    if desync {
        sock_reset(ctx);
    }
}

/// Namespace-mode tap readiness: one frame per read from the tuntap device.
/// Read errors other than EAGAIN/EINTR are fatal here, there is no client to
/// re-accept.
pub fn handler_ns(ctx: &mut Ctx, events: u32, now: Stamp) -> Result<()> {
    if events & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
        return Err(Error::TapDisconnected);
    }

    let fd = ctx.tap.fd;
    let mut buf = std::mem::take(&mut ctx.tap.rx_buf);
    let mut frames: Vec<(usize, usize)> = Vec::new();
    let mut off = 0usize;

    while off + ethernet::MAX_FRAME_SIZE <= TAP_BUF_BYTES {
        let n = unsafe {
            libc::read(
                fd,
                buf[off..].as_mut_ptr() as *mut libc::c_void,
                ethernet::MAX_FRAME_SIZE,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EINTR) => continue,
                _ => {
                    ctx.tap.rx_buf = buf;
                    return Err(Error::TapDisconnected);
                }
            }
        }
        if n == 0 {
            break;
        }
        if n as usize >= ethernet::HEADER_SIZE {
            frames.push((off, n as usize));
        }
        off += n as usize;
    }

    demux_frames(ctx, &buf, &frames, now);
    ctx.tap.rx_buf = buf;
    Ok(())
}

/// Demux a read's worth of Ethernet frames: learn the guest MAC, split by
/// ethertype, group contiguous packets by L4 tuple, feed the engines.
fn demux_frames(ctx: &mut Ctx, buf: &[u8], frames: &[(usize, usize)], now: Stamp) {
    let mut batches: Vec<L4Batch<'_>> = Vec::new();

    // Descriptors into the shared receive buffer, bounds-checked once here
    let mut packets = pool::Pool::new(buf);
    for &(off, len) in frames {
        packets.add(off, len);
    }

    for frame in packets.iter() {
        let eh = match ethernet::EthernetHeader::parse(frame) {
            Ok(eh) => eh,
            Err(_) => continue,
        };

        let src_mac = eh.src();
        if !src_mac.is_multicast() && src_mac != ctx.mac_guest {
            debug!("guest MAC learned: {src_mac}");
            ctx.mac_guest = src_mac;
            update_l2(ctx);
        }

        match eh.ethertype() {
            Some(EtherType::Ipv4) if ctx.ip4.enabled => {
                demux4(ctx, eh.payload(), &mut batches, now)
            }
            Some(EtherType::Ipv6) if ctx.ip6.enabled => {
                demux6(ctx, eh.payload(), &mut batches, now)
            }
            Some(EtherType::Arp) => {
                trace!("ARP on tap left to the address responder")
            }
            _ => {}
        }
    }

    for batch in &batches {
        ctx.stats.tap_batches.inc();
        match batch.proto as i32 {
            libc::IPPROTO_TCP => tcp::tap_handler(ctx, batch, now),
            libc::IPPROTO_UDP => udp::tap_handler(ctx, batch, now),
            _ => {}
        }
    }
}

fn fragment_drop(ctx: &mut Ctx, now: Stamp) {
    ctx.tap.frag_dropped += 1;
    ctx.stats.ip_fragments_dropped.inc();
    if now.secs - ctx.tap.frag_warn_last > FRAGMENT_MSG_RATE {
        warn!(
            "can't process IP fragments ({} dropped)",
            ctx.tap.frag_dropped
        );
        ctx.tap.frag_warn_last = now.secs;
        ctx.tap.frag_dropped = 0;
    }
}

fn batch_add<'a>(
    batches: &mut Vec<L4Batch<'a>>,
    v6: bool,
    proto: u8,
    saddr: IpAddr,
    daddr: IpAddr,
    sport: u16,
    dport: u16,
    l4: &'a [u8],
) {
    // Most runs are contiguous: check the batch being filled first, then
    // fall back to the rest in reverse
    if let Some(seq) = batches.iter_mut().rev().find(|b| {
        b.proto == proto
            && b.sport == sport
            && b.dport == dport
            && b.saddr == saddr
            && b.daddr == daddr
    }) {
        if seq.pkts.len() < BATCH_MAX_PKTS {
            seq.pkts.push(l4);
            return;
        }
    }
    if batches.len() >= TAP_SEQS {
        warn!("too many distinct flows in one tap read, dropping packet");
        return;
    }
    batches.push(L4Batch {
        v6,
        proto,
        saddr,
        daddr,
        sport,
        dport,
        pkts: vec![l4],
    });
}

fn demux4<'a>(ctx: &mut Ctx, l3: &'a [u8], batches: &mut Vec<L4Batch<'a>>, now: Stamp) {
    let iph = match ipv4::Ipv4Header::parse(l3) {
        Ok(h) => h,
        Err(_) => return,
    };

    if iph.is_fragment() {
        fragment_drop(ctx, now);
        return;
    }

    let saddr = iph.src_addr();
    let daddr = iph.dst_addr();
    if saddr.is_loopback() || daddr.is_loopback() {
        debug!("loopback address on tap interface: {saddr} -> {daddr}");
        return;
    }
    if !saddr.is_unspecified() && saddr != ctx.ip4.addr_seen {
        ctx.ip4.addr_seen = saddr;
    }

    let l4 = iph.payload();
    match iph.protocol() as i32 {
        libc::IPPROTO_ICMP => {
            icmp::tap_handler(ctx, false, IpAddr::V4(saddr), IpAddr::V4(daddr), l4, now)
        }
        proto @ (libc::IPPROTO_TCP | libc::IPPROTO_UDP) => {
            if l4.len() < 8 {
                return;
            }
            let sport = u16::from_be_bytes([l4[0], l4[1]]);
            let dport = u16::from_be_bytes([l4[2], l4[3]]);
            batch_add(
                batches,
                false,
                proto as u8,
                IpAddr::V4(saddr),
                IpAddr::V4(daddr),
                sport,
                dport,
                l4,
            );
        }
        _ => trace!("unsupported IPv4 protocol {} on tap", iph.protocol()),
    }
}

fn demux6<'a>(ctx: &mut Ctx, l3: &'a [u8], batches: &mut Vec<L4Batch<'a>>, now: Stamp) {
    let ip6h = match ipv6::Ipv6Header::parse(l3) {
        Ok(h) => h,
        Err(_) => return,
    };
    let (proto, l4_off) = match ip6h.upper_layer() {
        Ok(v) => v,
        Err(_) => return,
    };
    if proto == 44 {
        fragment_drop(ctx, now);
        return;
    }

    let saddr = ip6h.src_addr();
    let daddr = ip6h.dst_addr();
    if saddr.is_loopback() || daddr.is_loopback() {
        debug!("loopback address on tap interface: {saddr} -> {daddr}");
        return;
    }
    if !saddr.is_unspecified() {
        if crate::protocol::types::is_link_local(&saddr) {
            ctx.ip6.addr_ll_seen = saddr;
        } else if saddr != ctx.ip6.addr_seen {
            ctx.ip6.addr_seen = saddr;
        }
    }

    let l4_end = (ipv6::HEADER_SIZE + ip6h.payload_length() as usize).min(l3.len());
    if l4_off >= l4_end {
        return;
    }
    let l4 = &l3[l4_off..l4_end];

    match proto as i32 {
        libc::IPPROTO_ICMPV6 => {
            icmp::tap_handler(ctx, true, IpAddr::V6(saddr), IpAddr::V6(daddr), l4, now)
        }
        libc::IPPROTO_TCP | libc::IPPROTO_UDP => {
            if l4.len() < 8 {
                return;
            }
            let sport = u16::from_be_bytes([l4[0], l4[1]]);
            let dport = u16::from_be_bytes([l4[2], l4[3]]);
            batch_add(
                batches,
                true,
                proto as u8,
                IpAddr::V6(saddr),
                IpAddr::V6(daddr),
                sport,
                dport,
                l4,
            );
        }
        _ => trace!("unsupported IPv6 protocol {proto} on tap"),
    }
}

/// Rewrite the Ethernet scaffolding of every pre-cooked transmit buffer after
/// the guest MAC changes.
pub fn update_l2(ctx: &mut Ctx) {
    tcp::update_l2_bufs(&mut ctx.tcp, ctx.mac_guest, ctx.mac);
    udp::update_l2_bufs(&mut ctx.udp, ctx.mac_guest, ctx.mac);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_frame_stream_vs_ns() {
        let mut buf = vec![0u8; 64];
        let iov = finalize_frame(Mode::Stream, &mut buf, 20);
        assert_eq!(iov.iov_len, 24);
        assert_eq!(&buf[..4], &[0, 0, 0, 20]);

        let iov = finalize_frame(Mode::Ns, &mut buf, 20);
        assert_eq!(iov.iov_len, 20);
        assert_eq!(iov.iov_base as usize, buf[FRAME_PREFIX..].as_ptr() as usize);
    }

    #[test]
    fn test_fragment_drop_rate_limited() {
        let opts = crate::config::Options {
            addr4: Some("10.0.0.1".parse().unwrap()),
            gw4: Some("10.0.0.254".parse().unwrap()),
            ..Default::default()
        };
        let mut ctx = Ctx::new(opts).unwrap();

        let t0 = Stamp { secs: 100, nanos: 0 };
        fragment_drop(&mut ctx, t0);
        let first_warn = ctx.tap.frag_warn_last;
        assert_eq!(first_warn, 100);
        assert_eq!(ctx.stats.ip_fragments_dropped.get(), 1);

        // Within the rate window: counted, not re-announced
        let t1 = Stamp { secs: 105, nanos: 0 };
        fragment_drop(&mut ctx, t1);
        assert_eq!(ctx.tap.frag_warn_last, first_warn);
        assert_eq!(ctx.stats.ip_fragments_dropped.get(), 2);

        // Past the window: announced again, pending count reset
        let t2 = Stamp {
            secs: 100 + FRAGMENT_MSG_RATE + 1,
            nanos: 0,
        };
        fragment_drop(&mut ctx, t2);
        assert_eq!(ctx.tap.frag_warn_last, t2.secs);
        assert_eq!(ctx.tap.frag_dropped, 0);
    }

    #[test]
    fn test_batch_grouping() {
        let l4 = [0u8; 8];
        let mut batches = Vec::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "203.0.113.9".parse().unwrap();
        for _ in 0..3 {
            batch_add(&mut batches, false, 6, a, b, 1000, 80, &l4);
        }
        batch_add(&mut batches, false, 6, a, b, 1001, 80, &l4);
        batch_add(&mut batches, false, 17, a, b, 1000, 80, &l4);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].pkts.len(), 3);
        assert_eq!(batches[1].pkts.len(), 1);
        assert_eq!(batches[2].proto, 17);
    }
}
