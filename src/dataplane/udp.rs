//! UDP port-binding engine with loopback splice fast path
//!
//! No real connections: the first datagram the guest sends from a source
//! port binds a host socket to that port so replies find their way back;
//! bindings expire after 180 s of silence, tracked through per-category
//! activity bitmaps scanned on the flow timer.
//!
//! In namespace mode, datagrams between the two loopback interfaces skip L2
//! translation entirely: one socket in each namespace, relays via
//! recvmmsg/sendmmsg, no frames built.

use crate::config::Mode;
use crate::ctx::{sockaddr_from, Ctx};
use crate::dataplane::fwd::FwdPorts;
use crate::event::{EpollRef, FdKind, Pif, UdpRef};
use crate::protocol::types::is_link_local;
use crate::protocol::{checksum, ethernet, ipv4, ipv6, udp as udphdr, EtherType, MacAddr};
use crate::tap::{finalize_frame, L4Batch, FRAME_PREFIX};
use crate::util::{PortBitmap, Stamp};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use tracing::{debug, trace};

/// Seconds of inactivity before an ephemeral or local binding expires
pub const UDP_CONN_TIMEOUT: i64 = 180;
/// Max datagrams moved per socket readiness (stream mode; namespace mode
/// receives one at a time, which measures faster there)
pub const UDP_MAX_FRAMES: usize = 32;

// Activity flags on tap-facing port bindings
const PORT_LOCAL: u8 = 1 << 0;
const PORT_LOOPBACK: u8 = 1 << 1;
const PORT_GUA: u8 = 1 << 2;
const PORT_DNS_FWD: u8 = 1 << 3;

/// Activity bitmap categories
const ACT_TAP: usize = 0;
const ACT_SPLICE_INIT: usize = 1;
const ACT_SPLICE_NS: usize = 2;
const ACT_TYPES: usize = 3;

const PAYLOAD_OFF4: usize =
    FRAME_PREFIX + ethernet::HEADER_SIZE + ipv4::MIN_HEADER_SIZE + udphdr::HEADER_SIZE;
const PAYLOAD_OFF6: usize =
    FRAME_PREFIX + ethernet::HEADER_SIZE + ipv6::HEADER_SIZE + udphdr::HEADER_SIZE;
const BUF_SIZE: usize = PAYLOAD_OFF6 + 65536;

#[derive(Debug, Clone, Copy)]
struct TapPort {
    sock: RawFd,
    flags: u8,
    ts: i64,
}

impl Default for TapPort {
    fn default() -> Self {
        Self {
            sock: -1,
            flags: 0,
            ts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SplicePort {
    sock: RawFd,
    ts: i64,
}

impl Default for SplicePort {
    fn default() -> Self {
        Self { sock: -1, ts: 0 }
    }
}

pub struct UdpCtx {
    pub fwd_in: FwdPorts,
    pub fwd_out: FwdPorts,

    /// Socket bound on behalf of a tap-side source port, per version
    tap_map: [Vec<TapPort>; 2],
    /// Loopback sockets in the init namespace, indexed by bound port
    splice_init: [Vec<SplicePort>; 2],
    /// Loopback sockets in the peer namespace
    splice_ns: [Vec<SplicePort>; 2],

    /// Ports with running activity timers, per (version, category)
    act: [[PortBitmap; ACT_TYPES]; 2],

    bufs4: Vec<Vec<u8>>,
    bufs6: Vec<Vec<u8>>,
}

impl Default for UdpCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpCtx {
    pub fn new() -> Self {
        Self {
            fwd_in: FwdPorts::new(),
            fwd_out: FwdPorts::new(),
            tap_map: [vec![TapPort::default(); 65536], vec![TapPort::default(); 65536]],
            splice_init: [
                vec![SplicePort::default(); 65536],
                vec![SplicePort::default(); 65536],
            ],
            splice_ns: [
                vec![SplicePort::default(); 65536],
                vec![SplicePort::default(); 65536],
            ],
            act: Default::default(),
            bufs4: (0..UDP_MAX_FRAMES).map(|_| vec![0u8; BUF_SIZE]).collect(),
            bufs6: (0..UDP_MAX_FRAMES).map(|_| vec![0u8; BUF_SIZE]).collect(),
        }
    }
}

/// Cook the transmit-side L2 scaffolding.
pub fn init_buffers(udp: &mut UdpCtx, mac_guest: MacAddr, mac_local: MacAddr) {
    for buf in &mut udp.bufs4 {
        ethernet::write_header(&mut buf[FRAME_PREFIX..], mac_guest, mac_local, EtherType::Ipv4);
    }
    for buf in &mut udp.bufs6 {
        ethernet::write_header(&mut buf[FRAME_PREFIX..], mac_guest, mac_local, EtherType::Ipv6);
    }
}

pub fn update_l2_bufs(udp: &mut UdpCtx, mac_guest: MacAddr, mac_local: MacAddr) {
    for buf in udp.bufs4.iter_mut().chain(udp.bufs6.iter_mut()) {
        ethernet::update_macs(&mut buf[FRAME_PREFIX..], mac_guest, mac_local);
    }
}

/// Create and register a bound UDP socket.
fn udp_sock(
    ctx: &mut Ctx,
    v6: bool,
    bind_addr: Option<IpAddr>,
    ifname: Option<&str>,
    port: u16,
    uref: UdpRef,
) -> Option<RawFd> {
    match crate::ctx::sock_l4(
        &ctx.epoll,
        v6,
        libc::IPPROTO_UDP,
        bind_addr,
        ifname,
        port,
        |fd| EpollRef::udp(fd, uref),
    ) {
        Ok(fd) => Some(fd),
        Err(e) => {
            debug!("UDP: can't bind port {port} (v6 {v6}): {e}");
            None
        }
    }
}

/// Bind the forwarded-port sockets for one port; `ns` binds loopback inside
/// the peer namespace (outbound direction), otherwise the host side.
pub fn sock_init(ctx: &mut Ctx, ns: bool, port: u16) {
    let splice = ctx.mode == Mode::Ns;
    for v6 in [false, true] {
        if (v6 && !ctx.ip6.enabled) || (!v6 && !ctx.ip4.enabled) {
            continue;
        }
        let uref = UdpRef {
            v6,
            splice,
            orig: true,
            pif: if ns { Pif::Splice } else { Pif::Host },
            port,
        };
        let bind_addr = if ns {
            Some(if v6 {
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            } else {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            })
        } else {
            None
        };
        let sock = udp_sock(ctx, v6, bind_addr, None, port, uref);
        if let Some(fd) = sock {
            let v = v6 as usize;
            if ns {
                ctx.udp.splice_ns[v][port as usize].sock = fd;
            } else if splice {
                ctx.udp.splice_init[v][port as usize].sock = fd;
            }
        }
    }
}

/// New loopback socket for the reply direction of a splice; bound to the
/// datagram's source port, in the namespace `ns` says.
fn splice_new(ctx: &mut Ctx, v6: bool, src: u16, ns: bool) -> RawFd {
    let uref = UdpRef {
        v6,
        splice: true,
        orig: false,
        pif: if ns { Pif::Splice } else { Pif::Host },
        port: src,
    };
    let bind_addr = Some(if v6 {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    });

    let fd = if ns {
        let mut fd = None;
        // The socket itself must be created and bound in the peer namespace
        let mkref = |fd: RawFd| EpollRef::udp(fd, uref);
        let epoll = &ctx.epoll;
        let res = ctx.netns.call(|| {
            fd = crate::ctx::sock_l4(epoll, v6, libc::IPPROTO_UDP, bind_addr, None, src, mkref)
                .ok();
        });
        if res.is_err() {
            return -1;
        }
        fd.unwrap_or(-1)
    } else {
        udp_sock(ctx, v6, bind_addr, None, src, uref).unwrap_or(-1)
    };

    if fd >= 0 {
        let v = v6 as usize;
        if ns {
            ctx.udp.splice_ns[v][src as usize].sock = fd;
            ctx.udp.act[v][ACT_SPLICE_NS].set(src);
        } else {
            ctx.udp.splice_init[v][src as usize].sock = fd;
            ctx.udp.act[v][ACT_SPLICE_INIT].set(src);
        }
    }
    fd
}

/// Source port of a received datagram if it came over loopback, so it can be
/// spliced; None sends it down the tap path.
fn splice_port(v6: bool, addr: &libc::sockaddr_storage) -> Option<u16> {
    unsafe {
        if v6 {
            let sa6 = &*(addr as *const _ as *const libc::sockaddr_in6);
            let a = Ipv6Addr::from(sa6.sin6_addr.s6_addr);
            a.is_loopback().then(|| u16::from_be(sa6.sin6_port))
        } else {
            let sa4 = &*(addr as *const _ as *const libc::sockaddr_in);
            let a = Ipv4Addr::from(u32::from_be(sa4.sin_addr.s_addr));
            a.is_loopback().then(|| u16::from_be(sa4.sin_port))
        }
    }
}

/// Relay a run of spliced datagrams out of the opposite namespace, source
/// port preserved through the reverse delta.
#[allow(clippy::too_many_arguments)]
fn splice_sendfrom(
    ctx: &mut Ctx,
    bufs: &[Vec<u8>],
    msg_lens: &[usize],
    run: std::ops::Range<usize>,
    src: u16,
    dst: u16,
    pif: Pif,
    v6: bool,
    orig: bool,
    now: Stamp,
) {
    let v = v6 as usize;
    let src = match pif {
        Pif::Splice => ctx.udp.fwd_out.remap_back(src),
        Pif::Host => ctx.udp.fwd_in.remap_back(src),
    };

    let sock = match pif {
        Pif::Splice => {
            let mut s = ctx.udp.splice_init[v][src as usize].sock;
            if s < 0 && orig {
                s = splice_new(ctx, v6, src, false);
            }
            ctx.udp.splice_ns[v][dst as usize].ts = now.secs;
            ctx.udp.splice_init[v][src as usize].ts = now.secs;
            s
        }
        Pif::Host => {
            let mut s = ctx.udp.splice_ns[v][src as usize].sock;
            if s < 0 && orig {
                s = splice_new(ctx, v6, src, true);
            }
            ctx.udp.splice_init[v][dst as usize].ts = now.secs;
            ctx.udp.splice_ns[v][src as usize].ts = now.secs;
            s
        }
    };
    if sock < 0 {
        return;
    }

    let dest: SocketAddr = if v6 {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), dst)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), dst)
    };
    let (sa, sl) = sockaddr_from(&dest);

    let payload_off = if v6 { PAYLOAD_OFF6 } else { PAYLOAD_OFF4 };
    let mut iovs = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; UDP_MAX_FRAMES];
    let mut mmh: [libc::mmsghdr; UDP_MAX_FRAMES] = unsafe { std::mem::zeroed() };
    // The address union starts with the sockaddr itself
    let sa_ptr = &sa as *const _ as *mut libc::c_void;
    let count = run.len();
    for (k, i) in run.enumerate() {
        iovs[k] = libc::iovec {
            iov_base: bufs[i][payload_off..].as_ptr() as *mut libc::c_void,
            iov_len: msg_lens[i],
        };
        mmh[k].msg_hdr.msg_name = sa_ptr;
        mmh[k].msg_hdr.msg_namelen = sl;
        mmh[k].msg_hdr.msg_iov = &mut iovs[k];
        mmh[k].msg_hdr.msg_iovlen = 1;
    }

    let n = unsafe {
        libc::sendmmsg(sock, mmh.as_mut_ptr(), count as u32, libc::MSG_NOSIGNAL)
    };
    if n < 0 {
        trace!("splice sendmmsg failed: {}", std::io::Error::last_os_error());
    }
}

/// Fill IPv4 + UDP headers for one datagram toward the tap, applying the
/// reverse address policy to the source.
fn update_hdr4(
    ctx: &mut Ctx,
    buf: &mut [u8],
    peer: (Ipv4Addr, u16),
    dstport: u16,
    datalen: usize,
    now: Stamp,
) -> usize {
    let (mut src, srcport) = peer;
    let v = 0usize;

    let dns_reply = ctx.ip4.dns_match.is_some()
        && Some(src) == ctx.ip4.dns_host
        && srcport == 53
        && ctx.udp.tap_map[v][dstport as usize].flags & PORT_DNS_FWD != 0;
    if dns_reply {
        src = ctx.ip4.dns_match.unwrap();
    } else if src.is_loopback() || src == ctx.ip4.addr_seen {
        let tp = &mut ctx.udp.tap_map[v][srcport as usize];
        tp.ts = now.secs;
        tp.flags |= PORT_LOCAL;
        if src.is_loopback() {
            tp.flags |= PORT_LOOPBACK;
        } else {
            tp.flags &= !PORT_LOOPBACK;
        }
        ctx.udp.act[v][ACT_TAP].set(srcport);
        src = ctx.ip4.gw;
    }

    let ip_off = FRAME_PREFIX + ethernet::HEADER_SIZE;
    let udp_off = ip_off + ipv4::MIN_HEADER_SIZE;
    let udp_len = udphdr::HEADER_SIZE + datalen;

    ipv4::write_header(
        &mut buf[ip_off..],
        src,
        ctx.ip4.addr_seen,
        libc::IPPROTO_UDP as u8,
        udp_len as u16,
    );
    udphdr::fill_header(&mut buf[udp_off..], srcport, dstport, datalen as u16);
    let pseudo = checksum::pseudo_v4(src, ctx.ip4.addr_seen, libc::IPPROTO_UDP as u8, udp_len as u16);
    let csum = checksum::l4(pseudo, &buf[udp_off..udp_off + udp_len]);
    udphdr::set_checksum(&mut buf[udp_off..], csum);

    ethernet::HEADER_SIZE + ipv4::MIN_HEADER_SIZE + udp_len
}

/// IPv6 variant: link-local traffic keeps link-local scope, local sources
/// reflect to the gateway or our link-local, GUA use is remembered.
fn update_hdr6(
    ctx: &mut Ctx,
    buf: &mut [u8],
    peer: (Ipv6Addr, u16),
    dstport: u16,
    datalen: usize,
    now: Stamp,
) -> usize {
    let (mut src, srcport) = peer;
    let v = 1usize;
    let mut dst = ctx.ip6.addr_seen;

    if is_link_local(&src) {
        dst = ctx.ip6.addr_ll_seen;
    } else if ctx.ip6.dns_match.is_some()
        && Some(src) == ctx.ip6.dns_host
        && srcport == 53
        && ctx.udp.tap_map[v][dstport as usize].flags & PORT_DNS_FWD != 0
    {
        src = ctx.ip6.dns_match.unwrap();
    } else if src.is_loopback() || src == ctx.ip6.addr_seen || src == ctx.ip6.addr {
        let tp = &mut ctx.udp.tap_map[v][srcport as usize];
        tp.ts = now.secs;
        tp.flags |= PORT_LOCAL;
        if src.is_loopback() {
            tp.flags |= PORT_LOOPBACK;
        } else {
            tp.flags &= !PORT_LOOPBACK;
        }
        if src == ctx.ip6.addr {
            tp.flags |= PORT_GUA;
        } else {
            tp.flags &= !PORT_GUA;
        }
        ctx.udp.act[v][ACT_TAP].set(srcport);

        dst = ctx.ip6.addr_ll_seen;
        src = if is_link_local(&ctx.ip6.gw) {
            ctx.ip6.gw
        } else {
            ctx.ip6.addr_ll
        };
    }

    let ip_off = FRAME_PREFIX + ethernet::HEADER_SIZE;
    let udp_off = ip_off + ipv6::HEADER_SIZE;
    let udp_len = udphdr::HEADER_SIZE + datalen;

    ipv6::write_header(
        &mut buf[ip_off..],
        &src,
        &dst,
        libc::IPPROTO_UDP as u8,
        udp_len as u16,
    );
    udphdr::fill_header(&mut buf[udp_off..], srcport, dstport, datalen as u16);
    let pseudo = checksum::pseudo_v6(&src, &dst, libc::IPPROTO_UDP as u8, udp_len as u32);
    let csum = checksum::l4(pseudo, &buf[udp_off..udp_off + udp_len]);
    udphdr::set_checksum(&mut buf[udp_off..], csum);

    ethernet::HEADER_SIZE + ipv6::HEADER_SIZE + udp_len
}

/// Emit a run of received datagrams as tap frames.
#[allow(clippy::too_many_arguments)]
fn tap_send(
    ctx: &mut Ctx,
    bufs: &mut [Vec<u8>],
    msg_lens: &[usize],
    addrs: &[libc::sockaddr_storage],
    run: std::ops::Range<usize>,
    dstport: u16,
    v6: bool,
    now: Stamp,
) {
    let mut iovs = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; UDP_MAX_FRAMES];
    let mut count = 0;

    for i in run {
        let frame_len = if v6 {
            let sa6 = unsafe { &*(&addrs[i] as *const _ as *const libc::sockaddr_in6) };
            let peer = (
                Ipv6Addr::from(sa6.sin6_addr.s6_addr),
                u16::from_be(sa6.sin6_port),
            );
            update_hdr6(ctx, &mut bufs[i], peer, dstport, msg_lens[i], now)
        } else {
            let sa4 = unsafe { &*(&addrs[i] as *const _ as *const libc::sockaddr_in) };
            let peer = (
                Ipv4Addr::from(u32::from_be(sa4.sin_addr.s_addr)),
                u16::from_be(sa4.sin_port),
            );
            update_hdr4(ctx, &mut bufs[i], peer, dstport, msg_lens[i], now)
        };
        iovs[count] = finalize_frame(ctx.mode, &mut bufs[i], frame_len);
        count += 1;
    }

    ctx.tap.send_frames(&iovs[..count]);
}

/// Readiness on a bound UDP socket: receive a batch, split it into splice
/// and tap runs, forward each.
pub fn sock_handler(ctx: &mut Ctx, r: EpollRef, events: u32, now: Stamp) {
    if events & libc::EPOLLIN as u32 == 0 {
        return;
    }
    let uref = r.as_udp();
    let v6 = uref.v6;

    let mut dstport = uref.port;
    match uref.pif {
        Pif::Splice => dstport = ctx.udp.fwd_out.remap(dstport),
        Pif::Host => dstport = ctx.udp.fwd_in.remap(dstport),
    }

    let max = if ctx.mode == Mode::Stream { UDP_MAX_FRAMES } else { 1 };
    let payload_off = if v6 { PAYLOAD_OFF6 } else { PAYLOAD_OFF4 };

    let mut bufs = std::mem::take(if v6 { &mut ctx.udp.bufs6 } else { &mut ctx.udp.bufs4 });
    let mut addrs: [libc::sockaddr_storage; UDP_MAX_FRAMES] = unsafe { std::mem::zeroed() };
    let mut msg_lens = [0usize; UDP_MAX_FRAMES];

    let n = {
        let mut iovs = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; UDP_MAX_FRAMES];
        let mut mmh: [libc::mmsghdr; UDP_MAX_FRAMES] = unsafe { std::mem::zeroed() };
        for i in 0..max {
            iovs[i] = libc::iovec {
                iov_base: bufs[i][payload_off..].as_mut_ptr() as *mut libc::c_void,
                iov_len: BUF_SIZE - payload_off,
            };
            mmh[i].msg_hdr.msg_name = &mut addrs[i] as *mut _ as *mut libc::c_void;
            mmh[i].msg_hdr.msg_namelen =
                std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            mmh[i].msg_hdr.msg_iov = &mut iovs[i];
            mmh[i].msg_hdr.msg_iovlen = 1;
        }
        let n = unsafe {
            libc::recvmmsg(
                r.fd,
                mmh.as_mut_ptr(),
                max as u32,
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
            )
        };
        for i in 0..n.max(0) as usize {
            msg_lens[i] = mmh[i].msg_len as usize;
        }
        n
    };
    if n <= 0 {
        if v6 {
            ctx.udp.bufs6 = bufs;
        } else {
            ctx.udp.bufs4 = bufs;
        }
        return;
    }
    let n = n as usize;
    ctx.stats.udp_datagrams.add(n as u64);

    let mut i = 0;
    while i < n {
        let splice_from = if uref.splice {
            splice_port(v6, &addrs[i])
        } else {
            None
        };
        let mut m = i + 1;
        if uref.splice {
            while m < n && splice_port(v6, &addrs[m]) == splice_from {
                m += 1;
            }
        } else {
            m = n;
        }

        match splice_from {
            Some(src) => splice_sendfrom(
                ctx,
                &bufs,
                &msg_lens,
                i..m,
                src,
                dstport,
                uref.pif,
                v6,
                uref.orig,
                now,
            ),
            None => tap_send(ctx, &mut bufs, &msg_lens, &addrs, i..m, dstport, v6, now),
        }
        i = m;
    }

    if v6 {
        ctx.udp.bufs6 = bufs;
    } else {
        ctx.udp.bufs4 = bufs;
    }
}

/// Batch of datagrams from the tap sharing source and destination ports:
/// apply the address policy, bind or reuse the source-port socket, send.
pub fn tap_handler(ctx: &mut Ctx, batch: &L4Batch<'_>, now: Stamp) {
    let v6 = batch.v6;
    let v = v6 as usize;
    let src = batch.sport;
    let dst = batch.dport;

    let mut dest_addr = batch.daddr;
    let mut bind_addr: Option<IpAddr> = None;
    let mut bind_if: Option<String> = None;

    match batch.daddr {
        IpAddr::V4(d) => {
            if ctx.ip4.dns_match == Some(d) && dst == 53 {
                dest_addr = IpAddr::V4(ctx.ip4.dns_host.unwrap_or(d));
                ctx.udp.tap_map[v][src as usize].ts = now.secs;
                ctx.udp.tap_map[v][src as usize].flags |= PORT_DNS_FWD;
                ctx.udp.act[v][ACT_TAP].set(src);
            } else if d == ctx.ip4.gw && !ctx.opts.no_map_gw {
                let flags = ctx.udp.tap_map[v][dst as usize].flags;
                if flags & PORT_LOCAL == 0 || flags & PORT_LOOPBACK != 0 {
                    dest_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
                } else {
                    dest_addr = IpAddr::V4(ctx.ip4.addr_seen);
                }
            }
        }
        IpAddr::V6(d) => {
            if ctx.ip6.dns_match == Some(d) && dst == 53 {
                dest_addr = IpAddr::V6(ctx.ip6.dns_host.unwrap_or(d));
                ctx.udp.tap_map[v][src as usize].ts = now.secs;
                ctx.udp.tap_map[v][src as usize].flags |= PORT_DNS_FWD;
                ctx.udp.act[v][ACT_TAP].set(src);
            } else if d == ctx.ip6.gw && !ctx.opts.no_map_gw {
                let flags = ctx.udp.tap_map[v][dst as usize].flags;
                if flags & PORT_LOCAL == 0 || flags & PORT_LOOPBACK != 0 {
                    dest_addr = IpAddr::V6(Ipv6Addr::LOCALHOST);
                } else if flags & PORT_GUA != 0 {
                    dest_addr = IpAddr::V6(ctx.ip6.addr);
                } else {
                    dest_addr = IpAddr::V6(ctx.ip6.addr_seen);
                }
            } else if is_link_local(&d) {
                bind_addr = Some(IpAddr::V6(ctx.ip6.addr_ll));
            }
        }
    }

    if !dest_addr.is_loopback() {
        if v6 {
            if bind_addr.is_none() {
                bind_addr = ctx.ip6.addr_out.map(IpAddr::V6);
            }
            bind_if = ctx.ip6.ifname_out.clone();
        } else {
            bind_addr = ctx.ip4.addr_out.map(IpAddr::V4);
            bind_if = ctx.ip4.ifname_out.clone();
        }
    }

    let sock = {
        let existing = ctx.udp.tap_map[v][src as usize].sock;
        if existing >= 0 {
            existing
        } else {
            let uref = UdpRef {
                v6,
                splice: false,
                orig: false,
                pif: Pif::Host,
                port: src,
            };
            match udp_sock(ctx, v6, bind_addr, bind_if.as_deref(), src, uref) {
                Some(fd) => {
                    ctx.udp.tap_map[v][src as usize].sock = fd;
                    ctx.udp.act[v][ACT_TAP].set(src);
                    fd
                }
                None => return,
            }
        }
    };
    ctx.udp.tap_map[v][src as usize].ts = now.secs;

    let dest = SocketAddr::new(dest_addr, ctx.udp.fwd_out.remap(dst));
    let (sa, sl) = sockaddr_from(&dest);

    let mut iovs = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; crate::tap::pool::POOL_MAX];
    let mut mmh: [libc::mmsghdr; crate::tap::pool::POOL_MAX] = unsafe { std::mem::zeroed() };
    let mut count = 0;

    for pkt in &batch.pkts {
        if count == crate::tap::pool::POOL_MAX {
            break;
        }
        let Ok(uh) = udphdr::UdpHeader::parse(pkt) else {
            continue;
        };
        let payload = uh.payload();
        iovs[count] = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        mmh[count].msg_hdr.msg_name = &sa as *const _ as *mut libc::c_void;
        mmh[count].msg_hdr.msg_namelen = sl;
        mmh[count].msg_hdr.msg_iov = &mut iovs[count];
        mmh[count].msg_hdr.msg_iovlen = 1;
        count += 1;
    }
    if count == 0 {
        return;
    }

    let n = unsafe { libc::sendmmsg(sock, mmh.as_mut_ptr(), count as u32, libc::MSG_NOSIGNAL) };
    if n < 0 {
        trace!(
            "UDP sendmmsg to {dest} failed: {}",
            std::io::Error::last_os_error()
        );
    } else {
        ctx.stats.udp_datagrams.add(n as u64);
    }
}

fn expire_port(ctx: &mut Ctx, v: usize, t: usize, port: u16, now: Stamp) {
    let sock = match t {
        ACT_TAP => {
            let tp = &mut ctx.udp.tap_map[v][port as usize];
            if now.secs - tp.ts <= UDP_CONN_TIMEOUT {
                return;
            }
            tp.flags = 0;
            std::mem::replace(&mut tp.sock, -1)
        }
        ACT_SPLICE_INIT => {
            let sp = &mut ctx.udp.splice_init[v][port as usize];
            if now.secs - sp.ts <= UDP_CONN_TIMEOUT {
                return;
            }
            std::mem::replace(&mut sp.sock, -1)
        }
        _ => {
            let sp = &mut ctx.udp.splice_ns[v][port as usize];
            if now.secs - sp.ts <= UDP_CONN_TIMEOUT {
                return;
            }
            std::mem::replace(&mut sp.sock, -1)
        }
    };

    if sock >= 0 {
        trace!(port, "UDP binding expired");
        ctx.epoll.del(sock);
        unsafe { libc::close(sock) };
        ctx.udp.act[v][t].clear(port);
    }
}

/// Periodic pass: expire idle bindings found via the activity bitmaps.
pub fn timer(ctx: &mut Ctx, now: Stamp) {
    for v in 0..2 {
        if (v == 0 && !ctx.ip4.enabled) || (v == 1 && !ctx.ip6.enabled) {
            continue;
        }
        for t in 0..ACT_TYPES {
            let ports: Vec<u16> = ctx.udp.act[v][t].iter_set().collect();
            for port in ports {
                expire_port(ctx, v, t, port, now);
            }
        }
    }
}

/// Close or open forwarded-port sockets after a map change (AUTO rescans).
/// Ports forwarded in the opposite direction are skipped so the two maps
/// can't feed each other.
pub fn port_rebind(ctx: &mut Ctx, outbound: bool) {
    let mut to_close: Vec<RawFd> = Vec::new();
    let mut to_open: Vec<u16> = Vec::new();
    {
        let (fmap, rmap) = if outbound {
            (&ctx.udp.fwd_out.map, &ctx.udp.fwd_in.map)
        } else {
            (&ctx.udp.fwd_in.map, &ctx.udp.fwd_out.map)
        };
        let socks = if outbound {
            &ctx.udp.splice_ns
        } else {
            &ctx.udp.splice_init
        };
        for port in 0..=65535u16 {
            if !fmap.isset(port) {
                for v in 0..2 {
                    if socks[v][port as usize].sock >= 0 {
                        to_close.push(socks[v][port as usize].sock);
                    }
                }
                continue;
            }
            if rmap.isset(port) {
                continue;
            }
            if (ctx.ip4.enabled && socks[0][port as usize].sock == -1)
                || (ctx.ip6.enabled && socks[1][port as usize].sock == -1)
            {
                to_open.push(port);
            }
        }
    }

    for fd in to_close {
        ctx.epoll.del(fd);
        unsafe { libc::close(fd) };
    }
    {
        let socks = if outbound {
            &mut ctx.udp.splice_ns
        } else {
            &mut ctx.udp.splice_init
        };
        for v in 0..2 {
            for port in 0..=65535usize {
                if socks[v][port].sock >= 0 {
                    let keep = if outbound {
                        ctx.udp.fwd_out.map.isset(port as u16)
                    } else {
                        ctx.udp.fwd_in.map.isset(port as u16)
                    };
                    if !keep {
                        socks[v][port].sock = -1;
                    }
                }
            }
        }
    }
    for port in to_open {
        sock_init(ctx, outbound, port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_port_defaults() {
        let udp = UdpCtx::new();
        assert_eq!(udp.tap_map[0][1234].sock, -1);
        assert_eq!(udp.splice_ns[1][80].sock, -1);
    }

    #[test]
    fn test_expiry_clears_binding() {
        let opts = crate::config::Options {
            addr4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            gw4: Some(Ipv4Addr::new(10, 0, 0, 254)),
            ..Default::default()
        };
        let mut ctx = Ctx::new(opts).unwrap();

        // Plant an expired binding with a real socket
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        ctx.udp.tap_map[0][5000].sock = fd;
        ctx.udp.tap_map[0][5000].ts = 0;
        ctx.udp.tap_map[0][5000].flags = PORT_LOCAL;
        ctx.udp.act[0][ACT_TAP].set(5000);

        let now = Stamp {
            secs: UDP_CONN_TIMEOUT + 5,
            nanos: 0,
        };
        timer(&mut ctx, now);

        assert_eq!(ctx.udp.tap_map[0][5000].sock, -1);
        assert_eq!(ctx.udp.tap_map[0][5000].flags, 0);
        assert!(!ctx.udp.act[0][ACT_TAP].isset(5000));
    }

    fn test_ctx() -> Ctx {
        let opts = crate::config::Options {
            addr4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            gw4: Some(Ipv4Addr::new(10, 0, 0, 254)),
            dns4: Some(Ipv4Addr::new(1, 1, 1, 1)),
            dns_match4: Some(Ipv4Addr::new(10, 0, 0, 254)),
            ..Default::default()
        };
        Ctx::new(opts).unwrap()
    }

    #[test]
    fn test_update_hdr4_dns_reply_rewrite() {
        let mut ctx = test_ctx();
        let now = Stamp { secs: 100, nanos: 0 };

        // The query went out through the redirect, marking the source port
        ctx.udp.tap_map[0][55000].flags = PORT_DNS_FWD;

        let mut buf = vec![0u8; BUF_SIZE];
        let frame_len = update_hdr4(
            &mut ctx,
            &mut buf,
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            55000,
            16,
            now,
        );

        // Source presented back as the match address, not the real resolver
        let ip = crate::protocol::ipv4::Ipv4Header::parse(
            &buf[FRAME_PREFIX + ethernet::HEADER_SIZE..],
        )
        .unwrap();
        assert_eq!(ip.src_addr(), Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(ip.dst_addr(), ctx.ip4.addr_seen);
        assert_eq!(
            frame_len,
            ethernet::HEADER_SIZE + ipv4::MIN_HEADER_SIZE + udphdr::HEADER_SIZE + 16
        );

        // Without the flag, a reply from the same resolver is not rewritten
        ctx.udp.tap_map[0][55001].flags = 0;
        let mut buf2 = vec![0u8; BUF_SIZE];
        update_hdr4(
            &mut ctx,
            &mut buf2,
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            55001,
            16,
            now,
        );
        let ip2 = crate::protocol::ipv4::Ipv4Header::parse(
            &buf2[FRAME_PREFIX + ethernet::HEADER_SIZE..],
        )
        .unwrap();
        assert_eq!(ip2.src_addr(), Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn test_update_hdr4_loopback_snat() {
        let mut ctx = test_ctx();
        let now = Stamp { secs: 200, nanos: 0 };

        let mut buf = vec![0u8; BUF_SIZE];
        update_hdr4(&mut ctx, &mut buf, (Ipv4Addr::LOCALHOST, 8080), 40000, 4, now);

        // Loopback sources reflect to the gateway and get flagged
        let ip = crate::protocol::ipv4::Ipv4Header::parse(
            &buf[FRAME_PREFIX + ethernet::HEADER_SIZE..],
        )
        .unwrap();
        assert_eq!(ip.src_addr(), Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(
            ctx.udp.tap_map[0][8080].flags & (PORT_LOCAL | PORT_LOOPBACK),
            PORT_LOCAL | PORT_LOOPBACK
        );
        assert!(ctx.udp.act[0][ACT_TAP].isset(8080));
        assert_eq!(ctx.udp.tap_map[0][8080].ts, now.secs);

        // UDP checksum verifies with the pseudo-header
        let udp_off = FRAME_PREFIX + ethernet::HEADER_SIZE + ipv4::MIN_HEADER_SIZE;
        let udp_len = udphdr::HEADER_SIZE + 4;
        assert_eq!(
            checksum::checksum(
                &buf[udp_off..udp_off + udp_len],
                checksum::pseudo_v4(
                    ip.src_addr(),
                    ip.dst_addr(),
                    libc::IPPROTO_UDP as u8,
                    udp_len as u16
                )
            ),
            0
        );
    }

    #[test]
    fn test_fresh_binding_survives_timer() {
        let opts = crate::config::Options {
            addr4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            gw4: Some(Ipv4Addr::new(10, 0, 0, 254)),
            ..Default::default()
        };
        let mut ctx = Ctx::new(opts).unwrap();

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        let now = Stamp {
            secs: 1000,
            nanos: 0,
        };
        ctx.udp.tap_map[0][6000].sock = fd;
        ctx.udp.tap_map[0][6000].ts = now.secs - 30;
        ctx.udp.act[0][ACT_TAP].set(6000);

        timer(&mut ctx, now);
        assert_eq!(ctx.udp.tap_map[0][6000].sock, fd);
        assert!(ctx.udp.act[0][ACT_TAP].isset(6000));
        unsafe { libc::close(fd) };
    }
}
