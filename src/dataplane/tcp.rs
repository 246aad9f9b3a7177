//! TCP translation engine
//!
//! Each connection is a pair of half-flows: the tap side speaks TCP segments
//! with the guest, the socket side is an ordinary kernel TCP socket. The
//! engine mirrors observable TCP dynamics (window, MSS, window scaling, ACK
//! progress) from one side onto the other and never implements congestion
//! control or reassembly itself.
//!
//! Instead of a state machine, cumulative connection events drive behavior;
//! the three fundamental state bits (SOCK_ACCEPTED, TAP_SYN_RCVD,
//! ESTABLISHED) are mutually exclusive and clear each other when set. A
//! connection with no events is closed and gets collected by the deferred
//! flow pass.
//!
//! Data from the socket is read with MSG_PEEK behind a discard prefix for
//! bytes the guest has not acknowledged yet, staged into pre-cooked frame
//! buffers, and the sequence cursor only advances when the batched tap write
//! reports the frames out. The guest's cumulative ACK then consumes the
//! kernel buffer with MSG_TRUNC.

use crate::ctx::{sock_set_bufsize, sockaddr_from, Ctx};
use crate::dataplane::flow::{Flow, FlowCommon, FlowTable, TAP_SIDE};
use crate::dataplane::fwd::{FwdMode, FwdPorts};
use crate::event::{claim_fd, timerfd_arm, timerfd_arm_get_old, timerfd_is_armed, Epoll, EpollRef,
                   FdKind, Pif};
use crate::protocol::types::is_link_local;
use crate::protocol::{checksum, ethernet, ipv4, ipv6, tcp as tcphdr, EtherType, InAny, MacAddr};
use crate::tap::{finalize_frame, L4Batch, TapCtx, FRAME_PREFIX};
use crate::util::Stamp;
use crate::Result;
use std::hash::Hasher;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{debug, trace, warn};

// Connection events. Setting any of the three state bits clears the rest;
// the observer bits only make sense under the state noted beside them.
pub const SOCK_ACCEPTED: u8 = 1 << 0; // implies SYN sent to tap
pub const TAP_SYN_RCVD: u8 = 1 << 1; // implies socket connecting
pub const ESTABLISHED: u8 = 1 << 2;
pub const TAP_SYN_ACK_SENT: u8 = 1 << 3; // with TAP_SYN_RCVD
pub const SOCK_FIN_RCVD: u8 = 1 << 3; // with ESTABLISHED
pub const SOCK_FIN_SENT: u8 = 1 << 4;
pub const TAP_FIN_RCVD: u8 = 1 << 5;
pub const TAP_FIN_SENT: u8 = 1 << 6;
pub const TAP_FIN_ACKED: u8 = 1 << 7;
pub const CLOSED: u8 = 0;
const CONN_STATE_BITS: u8 = SOCK_ACCEPTED | TAP_SYN_RCVD | ESTABLISHED;

// Connection flags
pub const STALLED: u8 = 1 << 0;
pub const LOCAL: u8 = 1 << 1;
pub const ACTIVE_CLOSE: u8 = 1 << 2;
pub const ACK_TO_TAP_DUE: u8 = 1 << 3;
pub const ACK_FROM_TAP_DUE: u8 = 1 << 4;

// Frame flags handed to send_flag()
pub const FL_FIN: u8 = tcphdr::FLAG_FIN;
pub const FL_SYN: u8 = tcphdr::FLAG_SYN;
pub const FL_RST: u8 = tcphdr::FLAG_RST;
pub const FL_ACK: u8 = tcphdr::FLAG_ACK;
/// Send two identical ACK frames to trigger fast retransmit host-side
pub const FL_DUP_ACK: u8 = 1 << 5;
/// Send a bare ACK only if one is due
pub const ACK_IF_NEEDED: u8 = 0;

pub const TCP_FRAMES: usize = 128;
const MAX_WS: u8 = 8;
pub const MAX_WINDOW: u32 = 1 << 24;
const MSS_DEFAULT: u16 = 536;
const WINDOW_DEFAULT: u16 = 14600; // RFC 6928
pub const SOCK_POOL_SIZE: usize = 32;
const MAX_RETRANS: u8 = 3;
const LOW_RTT_TABLE_SIZE: usize = 8;
const LOW_RTT_THRESHOLD_US: u32 = 10;

const ACK_INTERVAL: Duration = Duration::from_millis(10);
const SYN_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const FIN_TIMEOUT: Duration = Duration::from_secs(60);
const ACT_TIMEOUT: Duration = Duration::from_secs(7200);

const SNDBUF_SMALL: u32 = 128 << 10;
const SNDBUF_BIG: u32 = 4 << 20;

// Frame buffer geometry: [len prefix][ethernet][ip][tcp + options][payload]
const ETH_OFF: usize = FRAME_PREFIX;
const IP_OFF: usize = ETH_OFF + ethernet::HEADER_SIZE;
const L4_OFF4: usize = IP_OFF + ipv4::MIN_HEADER_SIZE;
const L4_OFF6: usize = IP_OFF + ipv6::HEADER_SIZE;
const PAYLOAD_OFF4: usize = L4_OFF4 + tcphdr::MIN_HEADER_SIZE;
const PAYLOAD_OFF6: usize = L4_OFF6 + tcphdr::MIN_HEADER_SIZE;
const FRAME_BUF_SIZE: usize = PAYLOAD_OFF6 + 65536;

/// Largest MSS we can carry per family, L2..L4 headers subtracted.
const fn mss_max(v6: bool) -> u16 {
    let hdr = if v6 {
        PAYLOAD_OFF6 - FRAME_PREFIX
    } else {
        PAYLOAD_OFF4 - FRAME_PREFIX
    };
    (((u16::MAX as usize) - hdr) & !3) as u16
}

// Sequence comparisons, valid while the distance stays within +/- 2^31.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Per-connection state, one flow table slot.
#[derive(Debug)]
pub struct TcpConn {
    pub common: FlowCommon,
    pub sock: RawFd,
    /// Deadline timer, created on first arm
    pub timer: RawFd,
    pub events: u8,
    pub flags: u8,
    pub in_epoll: bool,

    pub sndbuf: u32,
    pub mss: u16,
    pub ws_from_tap: u8,
    pub ws_to_tap: u8,
    pub wnd_from_tap: u16,
    pub wnd_to_tap: u16,

    pub seq_to_tap: u32,
    pub seq_ack_from_tap: u32,
    pub seq_from_tap: u32,
    pub seq_ack_to_tap: u32,
    pub seq_init_from_tap: u32,
    pub seq_init_to_tap: u32,
    pub seq_dup_ack_approx: u8,
    pub retrans: u8,
}

impl TcpConn {
    pub fn new(sock: RawFd) -> Self {
        Self {
            common: FlowCommon::default(),
            sock,
            timer: -1,
            events: CLOSED,
            flags: 0,
            in_epoll: false,
            sndbuf: WINDOW_DEFAULT as u32,
            mss: MSS_DEFAULT,
            ws_from_tap: 0,
            ws_to_tap: 0,
            wnd_from_tap: WINDOW_DEFAULT,
            wnd_to_tap: WINDOW_DEFAULT,
            seq_to_tap: 0,
            seq_ack_from_tap: 0,
            seq_from_tap: 0,
            seq_ack_to_tap: 0,
            seq_init_from_tap: 0,
            seq_init_to_tap: 0,
            seq_dup_ack_approx: 0,
            retrans: 0,
        }
    }

    /// Remote address as presented to the guest.
    pub fn faddr(&self) -> InAny {
        self.common.side[TAP_SIDE].forward_addr
    }
    /// Guest-side local port.
    pub fn eport(&self) -> u16 {
        self.common.side[TAP_SIDE].endpoint_port
    }
    /// Remote port as presented to the guest.
    pub fn fport(&self) -> u16 {
        self.common.side[TAP_SIDE].forward_port
    }
    pub fn set_faddr(&mut self, a: InAny) {
        self.common.side[TAP_SIDE].forward_addr = a;
    }
    pub fn set_eport(&mut self, p: u16) {
        self.common.side[TAP_SIDE].endpoint_port = p;
    }
    pub fn set_fport(&mut self, p: u16) {
        self.common.side[TAP_SIDE].forward_port = p;
    }

    pub fn v4(&self) -> bool {
        self.faddr().is_v4()
    }

    pub fn has(&self, set: u8) -> bool {
        self.events & set == set
    }

    pub fn is_closing(&self) -> bool {
        self.events & (SOCK_FIN_RCVD | TAP_FIN_RCVD) != 0
    }

    /// Deferred hook: report closure so the flow pass can retire the slot.
    pub fn defer(&mut self) -> bool {
        if self.events != CLOSED {
            return false;
        }
        if self.sock >= 0 {
            unsafe { libc::close(self.sock) };
            self.sock = -1;
        }
        if self.timer >= 0 {
            unsafe { libc::close(self.timer) };
            self.timer = -1;
        }
        true
    }
}

/// TCP_INFO as the kernel fills it; newer fields are only trusted when the
/// returned length covers them.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpInfo {
    pub tcpi_state: u8,
    pub tcpi_ca_state: u8,
    pub tcpi_retransmits: u8,
    pub tcpi_probes: u8,
    pub tcpi_backoff: u8,
    pub tcpi_options: u8,
    pub tcpi_wscale: u8, // snd:4 rcv:4
    pub tcpi_flags: u8,
    pub tcpi_rto: u32,
    pub tcpi_ato: u32,
    pub tcpi_snd_mss: u32,
    pub tcpi_rcv_mss: u32,
    pub tcpi_unacked: u32,
    pub tcpi_sacked: u32,
    pub tcpi_lost: u32,
    pub tcpi_retrans: u32,
    pub tcpi_fackets: u32,
    pub tcpi_last_data_sent: u32,
    pub tcpi_last_ack_sent: u32,
    pub tcpi_last_data_recv: u32,
    pub tcpi_last_ack_recv: u32,
    pub tcpi_pmtu: u32,
    pub tcpi_rcv_ssthresh: u32,
    pub tcpi_rtt: u32,
    pub tcpi_rttvar: u32,
    pub tcpi_snd_ssthresh: u32,
    pub tcpi_snd_cwnd: u32,
    pub tcpi_advmss: u32,
    pub tcpi_reordering: u32,
    pub tcpi_rcv_rtt: u32,
    pub tcpi_rcv_space: u32,
    pub tcpi_total_retrans: u32,
    pub tcpi_pacing_rate: u64,
    pub tcpi_max_pacing_rate: u64,
    pub tcpi_bytes_acked: u64,
    pub tcpi_bytes_received: u64,
    pub tcpi_segs_out: u32,
    pub tcpi_segs_in: u32,
    pub tcpi_notsent_bytes: u32,
    pub tcpi_min_rtt: u32,
    pub tcpi_data_segs_in: u32,
    pub tcpi_data_segs_out: u32,
    pub tcpi_delivery_rate: u64,
    pub tcpi_busy_time: u64,
    pub tcpi_rwnd_limited: u64,
    pub tcpi_sndbuf_limited: u64,
    pub tcpi_delivered: u32,
    pub tcpi_delivered_ce: u32,
    pub tcpi_bytes_sent: u64,
    pub tcpi_bytes_retrans: u64,
    pub tcpi_dsack_dups: u32,
    pub tcpi_reord_seen: u32,
    pub tcpi_rcv_ooopack: u32,
    pub tcpi_snd_wnd: u32,
}

impl TcpInfo {
    pub fn snd_wscale(&self) -> u8 {
        self.tcpi_wscale >> 4
    }
    pub fn has_bytes_acked(len: usize) -> bool {
        len >= std::mem::offset_of!(TcpInfo, tcpi_bytes_acked) + 8
    }
    pub fn has_min_rtt(len: usize) -> bool {
        len >= std::mem::offset_of!(TcpInfo, tcpi_min_rtt) + 4
    }
    pub fn has_snd_wnd(len: usize) -> bool {
        len >= std::mem::offset_of!(TcpInfo, tcpi_snd_wnd) + 4
    }
}

fn tcp_info(fd: RawFd) -> Option<(TcpInfo, usize)> {
    let mut info = TcpInfo::default();
    let mut sl = std::mem::size_of::<TcpInfo>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut sl,
        )
    };
    if ret < 0 {
        return None;
    }
    Some((info, sl as usize))
}

/// One pre-cooked frame staging pool: Ethernet and IP scaffolding filled at
/// startup, per-frame fields patched as segments are queued, all frames
/// written to the tap in one flush.
pub struct FramePool {
    v6: bool,
    bufs: Vec<Vec<u8>>,
    lens: Vec<usize>,
    /// Flow indices whose seq_to_tap advances by lens[i] once frame i is out
    seq_update: Vec<Option<u32>>,
    used: usize,
}

impl FramePool {
    fn new(v6: bool) -> Self {
        Self {
            v6,
            bufs: (0..TCP_FRAMES).map(|_| vec![0u8; FRAME_BUF_SIZE]).collect(),
            lens: vec![0; TCP_FRAMES],
            seq_update: vec![None; TCP_FRAMES],
            used: 0,
        }
    }

    fn cook(&mut self, mac_guest: MacAddr, mac_local: MacAddr) {
        let ethertype = if self.v6 { EtherType::Ipv6 } else { EtherType::Ipv4 };
        for buf in &mut self.bufs {
            ethernet::write_header(&mut buf[ETH_OFF..], mac_guest, mac_local, ethertype);
            if self.v6 {
                ipv6::write_header(
                    &mut buf[IP_OFF..],
                    &Ipv6Addr::UNSPECIFIED,
                    &Ipv6Addr::UNSPECIFIED,
                    libc::IPPROTO_TCP as u8,
                    0,
                );
            } else {
                ipv4::write_header(
                    &mut buf[IP_OFF..],
                    Ipv4Addr::UNSPECIFIED,
                    Ipv4Addr::UNSPECIFIED,
                    libc::IPPROTO_TCP as u8,
                    0,
                );
            }
        }
    }

    fn update_l2(&mut self, mac_guest: MacAddr, mac_local: MacAddr) {
        for buf in &mut self.bufs {
            ethernet::update_macs(&mut buf[ETH_OFF..], mac_guest, mac_local);
        }
    }

    fn payload_off(&self) -> usize {
        if self.v6 {
            PAYLOAD_OFF6
        } else {
            PAYLOAD_OFF4
        }
    }

    fn room(&self) -> usize {
        TCP_FRAMES - self.used
    }
}

/// Flush a staging pool to the tap; sequence cursors advance only for frames
/// the transport reports out.
fn pool_flush(pool: &mut FramePool, tap: &TapCtx, flows: &mut FlowTable) {
    if pool.used == 0 {
        return;
    }
    let mode = tap.mode;
    let iovs: Vec<libc::iovec> = (0..pool.used)
        .map(|i| {
            let len = pool.lens[i];
            finalize_frame(mode, &mut pool.bufs[i], len)
        })
        .collect();
    let sent = tap.send_frames(&iovs);

    for i in 0..sent {
        if let Some(flow) = pool.seq_update[i] {
            if let Some(conn) = flows.at_mut(flow).tcp_mut() {
                let plen = pool.lens[i]
                    - (pool.payload_off() - FRAME_PREFIX)
                    - frame_optlen(&pool.bufs[i], pool.v6);
                conn.seq_to_tap = conn.seq_to_tap.wrapping_add(plen as u32);
            }
        }
    }
    if sent < pool.used {
        trace!(queued = pool.used, sent, "short tap flush, rest stays in socket buffers");
    }
    for s in &mut pool.seq_update[..pool.used] {
        *s = None;
    }
    pool.used = 0;
}

/// TCP option bytes present in a staged frame past the fixed header.
fn frame_optlen(buf: &[u8], v6: bool) -> usize {
    let l4 = if v6 { L4_OFF6 } else { L4_OFF4 };
    ((buf[l4 + 12] >> 4) as usize) * 4 - tcphdr::MIN_HEADER_SIZE
}

pub struct TcpCtx {
    pub fwd_in: FwdPorts,
    pub fwd_out: FwdPorts,

    data4: FramePool,
    data6: FramePool,
    flags4: FramePool,
    flags6: FramePool,

    /// Shared scratch for bytes already sent but not yet acknowledged:
    /// MSG_PEEK copies them here so only the unsent tail reaches the frames
    discard: Vec<u8>,

    pool4: [RawFd; SOCK_POOL_SIZE],
    pool6: [RawFd; SOCK_POOL_SIZE],

    low_rtt_dst: [InAny; LOW_RTT_TABLE_SIZE],

    /// Kernel reports tcpi_snd_wnd (seen at least once at runtime)
    pub kernel_snd_wnd: bool,

    /// Listening sockets per port for AUTO rebinds: [v4, v6]
    pub listen_host: Vec<[RawFd; 2]>,
    pub listen_ns: Vec<[RawFd; 2]>,
}

impl Default for TcpCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpCtx {
    pub fn new() -> Self {
        Self {
            fwd_in: FwdPorts::new(),
            fwd_out: FwdPorts::new(),
            data4: FramePool::new(false),
            data6: FramePool::new(true),
            flags4: FramePool::new(false),
            flags6: FramePool::new(true),
            discard: vec![0u8; MAX_WINDOW as usize],
            pool4: [-1; SOCK_POOL_SIZE],
            pool6: [-1; SOCK_POOL_SIZE],
            low_rtt_dst: [InAny::UNSPECIFIED; LOW_RTT_TABLE_SIZE],
            kernel_snd_wnd: false,
            listen_host: vec![[-1, -1]; 65536],
            listen_ns: vec![[-1, -1]; 65536],
        }
    }

    fn rtt_dst_low(&self, faddr: &InAny) -> bool {
        self.low_rtt_dst.iter().any(|a| a == faddr)
    }

    /// Track destinations the kernel reports a sub-threshold minimum RTT
    /// for; round-robin replacement once the table is full, unspecified
    /// entries act as holes.
    fn rtt_dst_check(&mut self, faddr: &InAny, info: &TcpInfo, info_len: usize) {
        if !TcpInfo::has_min_rtt(info_len)
            || info.tcpi_min_rtt == 0
            || info.tcpi_min_rtt > LOW_RTT_THRESHOLD_US
        {
            return;
        }
        let mut hole = None;
        for (i, a) in self.low_rtt_dst.iter().enumerate() {
            if a == faddr {
                return;
            }
            if hole.is_none() && a.is_unspecified() {
                hole = Some(i);
            }
        }
        let Some(mut hole) = hole else { return };
        self.low_rtt_dst[hole] = *faddr;
        hole = (hole + 1) % LOW_RTT_TABLE_SIZE;
        self.low_rtt_dst[hole] = InAny::UNSPECIFIED;
    }
}

/// Cook the pre-built L2/L3 scaffolding once addressing is known.
pub fn init_buffers(tcp: &mut TcpCtx, mac_guest: MacAddr, mac_local: MacAddr) {
    tcp.data4.cook(mac_guest, mac_local);
    tcp.data6.cook(mac_guest, mac_local);
    tcp.flags4.cook(mac_guest, mac_local);
    tcp.flags6.cook(mac_guest, mac_local);
}

pub fn update_l2_bufs(tcp: &mut TcpCtx, mac_guest: MacAddr, mac_local: MacAddr) {
    tcp.data4.update_l2(mac_guest, mac_local);
    tcp.data6.update_l2(mac_guest, mac_local);
    tcp.flags4.update_l2(mac_guest, mac_local);
    tcp.flags6.update_l2(mac_guest, mac_local);
}

/// Deferred flush of the staged frame pools, flags before data per family.
pub fn defer_flush(ctx: &mut Ctx) {
    pool_flush(&mut ctx.tcp.flags6, &ctx.tap, &mut ctx.flows);
    pool_flush(&mut ctx.tcp.flags4, &ctx.tap, &mut ctx.flows);
    pool_flush(&mut ctx.tcp.data6, &ctx.tap, &mut ctx.flows);
    pool_flush(&mut ctx.tcp.data4, &ctx.tap, &mut ctx.flows);
}

// --- epoll and timer plumbing ---

fn conn_epoll_events(events: u8, flags: u8) -> u32 {
    if events == CLOSED {
        return 0;
    }
    if events & ESTABLISHED != 0 {
        if events & TAP_FIN_SENT != 0 {
            return libc::EPOLLET as u32;
        }
        if flags & STALLED != 0 {
            return (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32;
        }
        return (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if events == TAP_SYN_RCVD {
        return (libc::EPOLLOUT | libc::EPOLLET | libc::EPOLLRDHUP) as u32;
    }
    libc::EPOLLRDHUP as u32
}

fn epoll_ctl(epoll: &Epoll, conn: &mut TcpConn, idx: u32) {
    if conn.events == CLOSED {
        if conn.in_epoll {
            epoll.del(conn.sock);
        }
        if conn.timer != -1 {
            epoll.del(conn.timer);
        }
        return;
    }

    let r = EpollRef::new(FdKind::Tcp, conn.sock, idx);
    let events = conn_epoll_events(conn.events, conn.flags);
    let res = if conn.in_epoll {
        epoll.modify(events, r)
    } else {
        epoll.add(events, r)
    };
    if res.is_ok() {
        conn.in_epoll = true;
    }
}

/// Arm the per-connection deadline timer from current events and flags.
fn timer_ctl(epoll: &Epoll, conn: &mut TcpConn, idx: u32) {
    if conn.events == CLOSED {
        return;
    }

    if conn.timer == -1 {
        let fd = match unsafe {
            claim_fd(libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK))
        } {
            Ok(fd) => fd,
            Err(e) => {
                debug!("flow {idx}: failed to get timer: {e}");
                return;
            }
        };
        let r = EpollRef::new(FdKind::TcpTimer, fd, idx);
        if epoll.add((libc::EPOLLIN | libc::EPOLLET) as u32, r).is_err() {
            unsafe { libc::close(fd) };
            return;
        }
        conn.timer = fd;
    }

    let after = if conn.flags & ACK_TO_TAP_DUE != 0 {
        ACK_INTERVAL
    } else if conn.flags & ACK_FROM_TAP_DUE != 0 {
        if conn.events & ESTABLISHED == 0 {
            SYN_TIMEOUT
        } else {
            ACK_TIMEOUT
        }
    } else if conn.has(SOCK_FIN_SENT | TAP_FIN_ACKED) {
        FIN_TIMEOUT
    } else {
        ACT_TIMEOUT
    };

    trace!(idx, ?after, "timer armed");
    let _ = timerfd_arm(conn.timer, after);
}

/// Set (`flag`) or clear (`!flag`) a connection flag, updating epoll and the
/// timer where the flag affects them.
fn conn_flag(epoll: &Epoll, conn: &mut TcpConn, idx: u32, flag: u8, set: bool) {
    if set {
        if conn.flags & flag != 0 {
            // Re-setting ACK_FROM_TAP_DUE reschedules the existing timer
            if flag == ACK_FROM_TAP_DUE {
                timer_ctl(epoll, conn, idx);
            }
            return;
        }
        conn.flags |= flag;
    } else {
        if conn.flags & flag == 0 {
            return;
        }
        conn.flags &= !flag;
    }

    if flag == STALLED {
        epoll_ctl(epoll, conn, idx);
    }
    if (set && (flag == ACK_FROM_TAP_DUE || flag == ACK_TO_TAP_DUE))
        || (!set && flag == ACK_FROM_TAP_DUE && conn.flags & ACK_TO_TAP_DUE != 0)
        || (!set && flag == ACK_TO_TAP_DUE && conn.flags & ACK_FROM_TAP_DUE != 0)
    {
        timer_ctl(epoll, conn, idx);
    }
}

/// Record a connection event; state bits displace each other, CLOSED drops
/// the connection from the hash index.
fn conn_event(flows: &mut FlowTable, epoll: &Epoll, idx: u32, event: u8) {
    let key = {
        let Some(conn) = flows.at_mut(idx).tcp_mut() else {
            return;
        };
        if event != CLOSED && conn.events & event == event {
            return;
        }
        let was = conn.events;
        if event == CLOSED || event & CONN_STATE_BITS != 0 {
            conn.events = event;
        } else {
            conn.events |= event;
        }
        trace!(idx, event, was, now = conn.events, "connection event");
        (conn.faddr(), conn.eport(), conn.fport())
    };

    if event == CLOSED {
        flows.hash_remove(idx, &key.0, key.1, key.2);
        if let Some(conn) = flows.at_mut(idx).tcp_mut() {
            epoll_ctl(epoll, conn, idx);
        }
        return;
    }

    let Some(conn) = flows.at_mut(idx).tcp_mut() else {
        return;
    };
    if event == TAP_FIN_RCVD && conn.events & SOCK_FIN_RCVD == 0 {
        conn_flag(epoll, conn, idx, ACTIVE_CLOSE, true);
    } else {
        epoll_ctl(epoll, conn, idx);
    }
    if conn.has(SOCK_FIN_SENT | TAP_FIN_ACKED) {
        timer_ctl(epoll, conn, idx);
    }
}

// --- socket helpers ---

/// Scale SO_SNDBUF between thresholds (full use up to SNDBUF_SMALL, half
/// above SNDBUF_BIG) so the advertised window doesn't overcommit the socket.
fn get_sndbuf(conn: &mut TcpConn) {
    let mut v: libc::c_int = 0;
    let mut sl = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            conn.sock,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut v as *mut _ as *mut libc::c_void,
            &mut sl,
        )
    };
    if ret < 0 {
        conn.sndbuf = WINDOW_DEFAULT as u32;
        return;
    }
    let v = v as u64;
    let scaled = if v >= SNDBUF_BIG as u64 {
        v / 2
    } else if v > SNDBUF_SMALL as u64 {
        v - v * (v - SNDBUF_SMALL as u64) / ((SNDBUF_BIG - SNDBUF_SMALL) as u64) / 2
    } else {
        v
    };
    conn.sndbuf = scaled.min(i32::MAX as u64) as u32;
}

fn sock_pool_take(pool: &mut [RawFd; SOCK_POOL_SIZE]) -> Option<RawFd> {
    for s in pool.iter_mut() {
        if *s >= 0 {
            return Some(std::mem::replace(s, -1));
        }
    }
    None
}

fn conn_new_sock(v6: bool, low_rmem: bool, low_wmem: bool) -> Result<RawFd> {
    let domain = if v6 { libc::AF_INET6 } else { libc::AF_INET };
    let fd = claim_fd(unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    })?;
    sock_set_bufsize(fd, low_rmem, low_wmem);
    Ok(fd)
}

/// Get a connectable socket in the init namespace, preferring the pool; an
/// empty pool falls back to a fresh socket to keep latency down, refill
/// happens on the periodic tick.
fn conn_sock(tcp: &mut TcpCtx, v6: bool, low_rmem: bool, low_wmem: bool) -> Result<RawFd> {
    let pool = if v6 { &mut tcp.pool6 } else { &mut tcp.pool4 };
    if let Some(fd) = sock_pool_take(pool) {
        return Ok(fd);
    }
    conn_new_sock(v6, low_rmem, low_wmem)
}

/// Refill the pre-opened socket pools outside the data path.
pub fn sock_pool_refill(ctx: &mut Ctx) {
    for v6 in [false, true] {
        if (v6 && !ctx.ip6.enabled) || (!v6 && !ctx.ip4.enabled) {
            continue;
        }
        let pool = if v6 { &mut ctx.tcp.pool6 } else { &mut ctx.tcp.pool4 };
        for slot in pool.iter_mut() {
            if *slot >= 0 {
                continue;
            }
            match conn_new_sock(v6, ctx.low_rmem, ctx.low_wmem) {
                Ok(fd) => *slot = fd,
                Err(_) => break,
            }
        }
    }
}

// --- initial sequence, hashing ---

/// RFC 6528-style initial sequence: keyed hash of the four-tuple plus a
/// 32ns-tick counter.
fn seq_init(ctx: &Ctx, conn: &mut TcpConn, now: Stamp) {
    let our_addr = if conn.v4() {
        InAny::from_v4(ctx.ip4.addr)
    } else {
        InAny::from_v6(ctx.ip6.addr)
    };
    let mut h = siphasher::sip::SipHasher24::new_with_keys(ctx.secret.0, ctx.secret.1);
    h.write(&conn.faddr().0);
    h.write(&our_addr.0);
    h.write_u64((conn.fport() as u64) << 16 | conn.eport() as u64);
    let hash = h.finish();

    let isn = ((hash >> 32) as u32 ^ hash as u32).wrapping_add(now.ticks_32ns());
    conn.seq_to_tap = isn;
    conn.seq_init_to_tap = isn;
}

// --- frame construction ---

/// Fill IP and TCP headers plus checksums for one staged frame; returns the
/// total frame length (without the stream prefix) and the IPv4 header
/// checksum for possible reuse.
#[allow(clippy::too_many_arguments)]
fn fill_frame(
    buf: &mut [u8],
    v6: bool,
    ip4_ctx_daddr: Ipv4Addr,
    ip6_daddr: Ipv6Addr,
    conn: &TcpConn,
    flags: u8,
    optlen: usize,
    payload_len: usize,
    seq: u32,
    reuse_check: Option<u16>,
) -> (usize, u16) {
    let l4_off = if v6 { L4_OFF6 } else { L4_OFF4 };
    let l4_len = tcphdr::MIN_HEADER_SIZE + optlen + payload_len;
    let doff_words = ((tcphdr::MIN_HEADER_SIZE + optlen) / 4) as u8;

    tcphdr::fill_header(
        &mut buf[l4_off..],
        conn.fport(),
        conn.eport(),
        seq,
        conn.seq_ack_to_tap,
        flags & (tcphdr::FLAG_FIN | tcphdr::FLAG_SYN | tcphdr::FLAG_RST | tcphdr::FLAG_ACK
            | tcphdr::FLAG_PSH),
        conn.wnd_to_tap,
        doff_words,
    );

    let mut check = 0u16;
    if v6 {
        let saddr = conn.faddr().v6();
        ipv6::write_header(
            &mut buf[IP_OFF..],
            &saddr,
            &ip6_daddr,
            libc::IPPROTO_TCP as u8,
            l4_len as u16,
        );
        let pseudo = checksum::pseudo_v6(&saddr, &ip6_daddr, libc::IPPROTO_TCP as u8, l4_len as u32);
        let csum = checksum::l4(pseudo, &buf[l4_off..l4_off + l4_len]);
        tcphdr::set_checksum(&mut buf[l4_off..], csum);
    } else {
        let saddr = conn.faddr().v4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        check = ipv4::patch_header(
            &mut buf[IP_OFF..],
            saddr,
            ip4_ctx_daddr,
            l4_len as u16,
            reuse_check,
        );
        let pseudo =
            checksum::pseudo_v4(saddr, ip4_ctx_daddr, libc::IPPROTO_TCP as u8, l4_len as u16);
        let csum = checksum::l4(pseudo, &buf[l4_off..l4_off + l4_len]);
        tcphdr::set_checksum(&mut buf[l4_off..], csum);
    }

    let frame_len = (l4_off - FRAME_PREFIX) + l4_len;
    (frame_len, check)
}

/// Destination address for frames we originate toward the guest.
fn tap_daddr4(ctx: &Ctx) -> Ipv4Addr {
    ctx.ip4.addr_seen
}

// --- ACK/window mirroring ---

/// Reconcile the ACK owed to the guest and the window advertised to it.
///
/// Returns true when either changed. With TCP_INFO byte counts available the
/// ACK tracks what the kernel actually acknowledged; small send buffers,
/// low-RTT destinations, closing connections and forced updates short-cut to
/// acknowledging everything buffered.
fn update_seqack_wnd(
    ctx: &mut Ctx,
    idx: u32,
    force_seq: bool,
    tinfo: Option<(TcpInfo, usize)>,
) -> bool {
    let kernel_snd_wnd = ctx.tcp.kernel_snd_wnd;
    let rtt_low = {
        let Some(conn) = ctx.flows.at(idx).tcp() else {
            return false;
        };
        ctx.tcp.rtt_dst_low(&conn.faddr())
    };

    let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
        return false;
    };
    let prev_wnd_to_tap = (conn.wnd_to_tap as u32) << conn.ws_to_tap;
    let prev_ack_to_tap = conn.seq_ack_to_tap;

    let mut tinfo = tinfo;
    let mut fetch_info = |sock: RawFd, t: &mut Option<(TcpInfo, usize)>| -> bool {
        if t.is_none() {
            *t = tcp_info(sock);
        }
        t.is_some()
    };

    let mut info_has_bytes_acked = false;
    if let Some((_, len)) = tinfo {
        info_has_bytes_acked = TcpInfo::has_bytes_acked(len);
    }

    if conn.sndbuf < SNDBUF_SMALL
        || rtt_low
        || conn.is_closing()
        || conn.flags & LOCAL != 0
        || force_seq
    {
        conn.seq_ack_to_tap = conn.seq_from_tap;
        if seq_lt(conn.seq_ack_to_tap, prev_ack_to_tap) {
            conn.seq_ack_to_tap = prev_ack_to_tap;
        }
    } else if conn.seq_ack_to_tap != conn.seq_from_tap {
        if !fetch_info(conn.sock, &mut tinfo) {
            return false;
        }
        let (info, len) = tinfo.unwrap();
        info_has_bytes_acked = TcpInfo::has_bytes_acked(len);
        if info_has_bytes_acked {
            conn.seq_ack_to_tap =
                (info.tcpi_bytes_acked as u32).wrapping_add(conn.seq_init_from_tap);
            if seq_lt(conn.seq_ack_to_tap, prev_ack_to_tap) {
                conn.seq_ack_to_tap = prev_ack_to_tap;
            }
        } else {
            // Optimistic fallback: bytes in our buffer count as delivered
            conn.seq_ack_to_tap = conn.seq_from_tap;
            if seq_lt(conn.seq_ack_to_tap, prev_ack_to_tap) {
                conn.seq_ack_to_tap = prev_ack_to_tap;
            }
        }
    }
    let _ = info_has_bytes_acked;

    let mut new_wnd_to_tap = prev_wnd_to_tap;
    if !kernel_snd_wnd {
        get_sndbuf(conn);
        new_wnd_to_tap = conn.sndbuf.min(MAX_WINDOW);
        conn.wnd_to_tap = ((new_wnd_to_tap >> conn.ws_to_tap) as u32).min(u16::MAX as u32) as u16;
    } else {
        let have_info = if tinfo.is_none() && prev_wnd_to_tap > WINDOW_DEFAULT as u32 {
            false
        } else {
            fetch_info(conn.sock, &mut tinfo)
        };

        if have_info {
            let (info, len) = tinfo.unwrap();
            if TcpInfo::has_snd_wnd(len) {
                if conn.flags & LOCAL != 0 || rtt_low {
                    new_wnd_to_tap = info.tcpi_snd_wnd;
                } else {
                    get_sndbuf(conn);
                    new_wnd_to_tap = info.tcpi_snd_wnd.min(conn.sndbuf);
                }
            }
            new_wnd_to_tap = new_wnd_to_tap.min(MAX_WINDOW);
            if conn.events & ESTABLISHED == 0 {
                new_wnd_to_tap = new_wnd_to_tap.max(WINDOW_DEFAULT as u32);
            }
            conn.wnd_to_tap =
                ((new_wnd_to_tap >> conn.ws_to_tap) as u32).min(u16::MAX as u32) as u16;
        }
    }

    let changed = new_wnd_to_tap != prev_wnd_to_tap || conn.seq_ack_to_tap != prev_ack_to_tap;
    if conn.wnd_to_tap == 0 {
        conn_flag(&ctx.epoll, conn, idx, ACK_TO_TAP_DUE, true);
    }
    changed
}

/// ACK number from the guest: drop the retransmit deadline when everything
/// was covered, reschedule when progress was partial.
fn update_seqack_from_tap(epoll: &Epoll, conn: &mut TcpConn, idx: u32, seq: u32) {
    if seq == conn.seq_to_tap {
        conn_flag(epoll, conn, idx, ACK_FROM_TAP_DUE, false);
    }
    if seq_gt(seq, conn.seq_ack_from_tap) {
        if seq_lt(seq, conn.seq_to_tap) {
            conn_flag(epoll, conn, idx, ACK_FROM_TAP_DUE, true);
        }
        conn.retrans = 0;
        conn.seq_ack_from_tap = seq;
    }
}

/// Window advertised by the tap, unscaled on the wire past the SYN.
fn tap_window_update(conn: &mut TcpConn, wnd: u32) {
    let wnd = (wnd << conn.ws_from_tap).min(MAX_WINDOW);
    conn.wnd_from_tap = ((wnd >> conn.ws_from_tap) as u32).min(u16::MAX as u32) as u16;
}

// --- flag segments to tap ---

/// Queue a payload-less segment (flags only) to the tap. With flags == 0
/// (ACK_IF_NEEDED) an ACK goes out only if one is due. Returns Err on a
/// connection that had to be closed.
fn send_flag(ctx: &mut Ctx, idx: u32, mut flags: u8) -> std::result::Result<(), ()> {
    // Flush early so the pools always have room for frame + duplicate
    if ctx.tcp.flags4.room() < 2 {
        pool_flush(&mut ctx.tcp.flags4, &ctx.tap, &mut ctx.flows);
    }
    if ctx.tcp.flags6.room() < 2 {
        pool_flush(&mut ctx.tcp.flags6, &ctx.tap, &mut ctx.flows);
    }

    let (sock, v4, faddr, local) = {
        let Some(conn) = ctx.flows.at(idx).tcp() else {
            return Err(());
        };
        if seq_ge(conn.seq_ack_to_tap, conn.seq_from_tap)
            && flags == ACK_IF_NEEDED
            && conn.wnd_to_tap != 0
        {
            return Ok(());
        }
        (conn.sock, conn.v4(), conn.faddr(), conn.flags & LOCAL != 0)
    };

    let Some((info, info_len)) = tcp_info(sock) else {
        conn_event(&mut ctx.flows, &ctx.epoll, idx, CLOSED);
        return Err(());
    };

    if !ctx.tcp.kernel_snd_wnd && TcpInfo::has_snd_wnd(info_len) && info.tcpi_snd_wnd != 0 {
        ctx.tcp.kernel_snd_wnd = true;
    }
    if !local {
        ctx.tcp.rtt_dst_check(&faddr, &info, info_len);
    }

    if !update_seqack_wnd(ctx, idx, flags != 0, Some((info, info_len))) && flags == ACK_IF_NEEDED {
        return Ok(());
    }

    // Options only go out on SYN segments: MSS, NOP, window scale
    let mut optlen = 0;
    let mut opts = [0u8; 8];
    let daddr4 = tap_daddr4(ctx);
    let (daddr6, mss_for_syn, ws_to_tap) = {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        if flags & FL_SYN != 0 {
            conn.ws_to_tap = MAX_WS.min(info.snd_wscale());
            (
                tap_daddr6_raw(&ctx.ip6, &conn.faddr()),
                (info.tcpi_snd_mss as u16).min(mss_max(!conn.v4())),
                conn.ws_to_tap,
            )
        } else {
            if flags & FL_RST == 0 {
                flags |= FL_ACK;
            }
            (tap_daddr6_raw(&ctx.ip6, &conn.faddr()), 0, 0)
        }
    };
    if flags & FL_SYN != 0 {
        tcphdr::write_syn_opts(&mut opts, mss_for_syn, ws_to_tap);
        optlen = 8;
    }

    let dup = flags & FL_DUP_ACK != 0;
    {
        let (flows, tcp) = (&mut ctx.flows, &mut ctx.tcp);
        let Some(conn) = flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        let pool = if v4 { &mut tcp.flags4 } else { &mut tcp.flags6 };

        let i = pool.used;
        let buf = &mut pool.bufs[i];
        buf[if v4 { L4_OFF4 } else { L4_OFF6 } + tcphdr::MIN_HEADER_SIZE
            ..if v4 { L4_OFF4 } else { L4_OFF6 } + tcphdr::MIN_HEADER_SIZE + optlen]
            .copy_from_slice(&opts[..optlen]);
        let (frame_len, _) = fill_frame(
            buf,
            !v4,
            daddr4,
            daddr6,
            conn,
            flags,
            optlen,
            0,
            conn.seq_to_tap,
            None,
        );
        pool.lens[i] = frame_len;
        pool.seq_update[i] = None;
        pool.used += 1;

        if flags & FL_ACK != 0 {
            let due = seq_lt(conn.seq_ack_to_tap, conn.seq_from_tap);
            conn_flag(&ctx.epoll, conn, idx, ACK_TO_TAP_DUE, due);
        }
        if flags & FL_FIN != 0 {
            conn_flag(&ctx.epoll, conn, idx, ACK_FROM_TAP_DUE, true);
        }
        // RFC 793, 3.1: SYN and FIN occupy one sequence number
        if flags & (FL_FIN | FL_SYN) != 0 {
            conn.seq_to_tap = conn.seq_to_tap.wrapping_add(1);
        }

        if dup {
            let (a, b) = pool.bufs.split_at_mut(pool.used);
            b[0][..FRAME_PREFIX + frame_len].copy_from_slice(&a[i][..FRAME_PREFIX + frame_len]);
            pool.lens[pool.used] = frame_len;
            pool.seq_update[pool.used] = None;
            pool.used += 1;
        }
    }
    Ok(())
}

fn tap_daddr6_raw(ip6: &crate::ctx::Ip6Ctx, faddr: &InAny) -> Ipv6Addr {
    if !faddr.is_v4() && is_link_local(&faddr.v6()) {
        ip6.addr_ll_seen
    } else {
        ip6.addr_seen
    }
}

/// Reset to tap: send RST, mark closed.
fn rst(ctx: &mut Ctx, idx: u32) {
    let events = match ctx.flows.at(idx).tcp() {
        Some(c) => c.events,
        None => return,
    };
    if events == CLOSED {
        return;
    }
    debug!(idx, "TCP reset to tap");
    ctx.stats.tcp_resets.inc();
    if send_flag(ctx, idx, FL_RST).is_ok() {
        conn_event(&mut ctx.flows, &ctx.epoll, idx, CLOSED);
    }
}

// --- data socket -> tap ---

/// Move new socket data toward the tap, in window, in MSS-sized frames.
///
/// The receive iovec starts with a discard slot covering what was already
/// sent but not acknowledged; MSG_PEEK leaves everything in the kernel
/// buffer until the guest's ACK consumes it.
fn data_from_sock(ctx: &mut Ctx, idx: u32) -> std::result::Result<(), ()> {
    let (v4, sock, mss, wnd_scaled, mut already_sent, seq_start, events) = {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        let wnd = (conn.wnd_from_tap as u32) << conn.ws_from_tap;
        let already = conn.seq_to_tap.wrapping_sub(conn.seq_ack_from_tap);
        (
            conn.v4(),
            conn.sock,
            conn.mss as usize,
            wnd,
            already,
            conn.seq_to_tap,
            conn.events,
        )
    };

    if (already_sent as i32) < 0 {
        // RFC 761, section 2.1: ACK ahead of what we sent; resync
        trace!(idx, "ACK sequence gap, resetting cursor");
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        conn.seq_to_tap = conn.seq_ack_from_tap;
        already_sent = 0;
    }
    let seq_start = if already_sent == 0 {
        ctx.flows.at(idx).tcp().map(|c| c.seq_to_tap).unwrap_or(seq_start)
    } else {
        seq_start
    };

    if wnd_scaled == 0 || already_sent >= wnd_scaled {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        conn_flag(&ctx.epoll, conn, idx, STALLED, true);
        conn_flag(&ctx.epoll, conn, idx, ACK_FROM_TAP_DUE, true);
        return Ok(());
    }

    let mut fill_bufs = ((wnd_scaled - already_sent) as usize).div_ceil(mss);
    let mut iov_rem = 0usize;
    if fill_bufs > TCP_FRAMES {
        fill_bufs = TCP_FRAMES;
    } else {
        iov_rem = ((wnd_scaled - already_sent) as usize) % mss;
    }

    // Make room in the staging pool up front; flushing mid-fill would race
    // the receive below
    let need_flush = {
        let pool = if v4 { &ctx.tcp.data4 } else { &ctx.tcp.data6 };
        pool.used + fill_bufs > TCP_FRAMES
    };
    if need_flush {
        pool_flush(
            if v4 { &mut ctx.tcp.data4 } else { &mut ctx.tcp.data6 },
            &ctx.tap,
            &mut ctx.flows,
        );
    }

    let len = {
        let tcp = &mut ctx.tcp;
        let pool = if v4 { &mut tcp.data4 } else { &mut tcp.data6 };
        let payload_off = pool.payload_off();

        let mut iov: Vec<libc::iovec> = Vec::with_capacity(fill_bufs + 1);
        iov.push(libc::iovec {
            iov_base: tcp.discard.as_mut_ptr() as *mut libc::c_void,
            iov_len: already_sent as usize,
        });
        for i in 0..fill_bufs {
            let buf = &mut pool.bufs[pool.used + i];
            iov.push(libc::iovec {
                iov_base: buf[payload_off..].as_mut_ptr() as *mut libc::c_void,
                iov_len: mss,
            });
        }
        if iov_rem > 0 {
            iov[fill_bufs].iov_len = iov_rem;
        }

        let mut mh: libc::msghdr = unsafe { std::mem::zeroed() };
        mh.msg_iov = iov.as_mut_ptr();
        mh.msg_iovlen = iov.len();

        loop {
            let n = unsafe { libc::recvmsg(sock, &mut mh, libc::MSG_PEEK) };
            if n >= 0 {
                break n as usize;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return Ok(()),
                _ => {
                    rst(ctx, idx);
                    return Err(());
                }
            }
        }
    };

    if len == 0 {
        // EOF: once the socket-side FIN is seen and not yet mirrored, tell
        // the guest
        if events & (SOCK_FIN_RCVD | TAP_FIN_SENT) == SOCK_FIN_RCVD {
            if send_flag(ctx, idx, FL_FIN | FL_ACK).is_err() {
                rst(ctx, idx);
                return Err(());
            }
            conn_event(&mut ctx.flows, &ctx.epoll, idx, TAP_FIN_SENT);
        }
        return Ok(());
    }

    if len <= already_sent as usize {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        conn_flag(&ctx.epoll, conn, idx, STALLED, true);
        return Ok(());
    }
    let sendlen = len - already_sent as usize;

    {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        conn_flag(&ctx.epoll, conn, idx, STALLED, false);
    }

    let send_bufs = sendlen.div_ceil(mss);
    let last_len = sendlen - (send_bufs - 1) * mss;

    // Likely some new data was acked too
    update_seqack_wnd(ctx, idx, false, None);

    let daddr4 = tap_daddr4(ctx);
    {
        let (flows, tcp) = (&mut ctx.flows, &mut ctx.tcp);
        let Some(conn) = flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        let daddr6 = tap_daddr6_raw(&ctx.ip6, &conn.faddr());
        let pool = if v4 { &mut tcp.data4 } else { &mut tcp.data6 };

        let mut seq = seq_start;
        let mut prev_check: Option<u16> = None;
        for i in 0..send_bufs {
            let plen = if i == send_bufs - 1 { last_len } else { mss };
            // Reuse the IPv4 header checksum across middle frames of a
            // same-size run
            let reuse = if i > 0 && i < send_bufs - 1 { prev_check } else { None };
            let slot = pool.used;
            let (frame_len, check) = fill_frame(
                &mut pool.bufs[slot],
                !v4,
                daddr4,
                daddr6,
                conn,
                tcphdr::FLAG_ACK | if plen > 0 { tcphdr::FLAG_PSH } else { 0 },
                0,
                plen,
                seq,
                reuse,
            );
            prev_check = Some(check);
            pool.lens[slot] = frame_len;
            pool.seq_update[slot] = Some(idx);
            pool.used += 1;
            seq = seq.wrapping_add(plen as u32);
        }

        conn_flag(&ctx.epoll, conn, idx, ACK_FROM_TAP_DUE, true);
    }
    Ok(())
}

/// Discard bytes the guest acknowledged from the socket buffer.
fn sock_consume(conn: &TcpConn, ack_seq: u32) -> std::result::Result<(), ()> {
    // Out-of-order ACKs were already consumed; never rewind
    if seq_le(ack_seq, conn.seq_ack_from_tap) {
        return Ok(());
    }
    let n = ack_seq.wrapping_sub(conn.seq_ack_from_tap) as usize;
    let ret = unsafe {
        libc::recv(
            conn.sock,
            std::ptr::null_mut(),
            n,
            libc::MSG_DONTWAIT | libc::MSG_TRUNC,
        )
    };
    if ret < 0 {
        return Err(());
    }
    Ok(())
}

// --- data tap -> socket ---

/// Deliver a batch of same-tuple data segments from the guest to the socket.
/// Returns packets consumed, or Err to reset the connection.
fn data_from_tap(
    ctx: &mut Ctx,
    idx: u32,
    pkts: &[&[u8]],
) -> std::result::Result<usize, ()> {
    let (events, seq_from_tap0, seq_ack_from_tap0, wnd0) = {
        let Some(conn) = ctx.flows.at(idx).tcp() else {
            return Err(());
        };
        (
            conn.events,
            conn.seq_from_tap,
            conn.seq_ack_from_tap,
            conn.wnd_from_tap,
        )
    };
    if events == CLOSED {
        return Ok(pkts.len());
    }
    debug_assert!(events & ESTABLISHED != 0);

    let mut iov: Vec<libc::iovec> = Vec::with_capacity(pkts.len());
    let mut seq_from_tap = seq_from_tap0;
    let mut max_ack_seq = seq_ack_from_tap0;
    let mut max_ack_seq_wnd = wnd0 as u32;
    let mut ack = false;
    let mut fin = false;
    let mut retr = false;
    let mut keep: Option<usize> = None;

    let mut i = 0usize;
    while i < pkts.len() {
        let p = pkts[i];
        let th = match tcphdr::TcpHeader::parse(p) {
            Ok(th) => th,
            Err(_) => return Err(()),
        };

        if th.is_rst() {
            conn_event(&mut ctx.flows, &ctx.epoll, idx, CLOSED);
            return Ok(1);
        }

        let data = th.payload();
        let seq = th.seq();
        let ack_seq = th.ack_seq();

        if th.is_ack() {
            ack = true;
            if seq_ge(ack_seq, seq_ack_from_tap0) && seq_ge(ack_seq, max_ack_seq) {
                // Fast re-transmit trigger: pure duplicate ACK
                retr = data.is_empty()
                    && !th.is_fin()
                    && ack_seq == max_ack_seq
                    && th.window() as u32 == max_ack_seq_wnd;
                max_ack_seq_wnd = th.window() as u32;
                max_ack_seq = ack_seq;
            }
        }
        if th.is_fin() {
            fin = true;
        }

        if !data.is_empty() {
            let seq_offset = seq_from_tap.wrapping_sub(seq);
            let seq_end = seq.wrapping_add(data.len() as u32);
            if (seq_offset as i32) >= 0 && seq_le(seq_end, seq_from_tap) {
                // Entirely before the cursor: drop
            } else if (seq_offset as i32) < 0 {
                // Entirely past the cursor: keep for a later pass once a
                // straddling segment advances it
                if keep.is_none() {
                    keep = Some(i);
                }
                i += 1;
                continue;
            } else {
                let off = seq_offset as usize;
                iov.push(libc::iovec {
                    iov_base: data[off..].as_ptr() as *mut libc::c_void,
                    iov_len: data.len() - off,
                });
                seq_from_tap = seq_from_tap.wrapping_add((data.len() - off) as u32);

                if keep == Some(i) {
                    keep = None;
                }
                if let Some(k) = keep {
                    // revisit the out-of-order run
                    i = k;
                    continue;
                }
            }
        }
        i += 1;
    }

    // On socket flush failure pretend there was no ACK and retry later
    if ack {
        let consume_ok = {
            let Some(conn) = ctx.flows.at(idx).tcp() else {
                return Err(());
            };
            sock_consume(conn, max_ack_seq).is_ok()
        };
        if consume_ok {
            let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
                return Err(());
            };
            update_seqack_from_tap(&ctx.epoll, conn, idx, max_ack_seq);
        }
    }
    {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return Err(());
        };
        tap_window_update(conn, max_ack_seq_wnd);
    }

    if retr {
        trace!(idx, ack = max_ack_seq, "fast re-transmit");
        {
            let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
                return Err(());
            };
            conn.seq_to_tap = max_ack_seq;
        }
        let _ = data_from_sock(ctx, idx);
    }

    let mut partial_send = false;
    if !iov.is_empty() {
        let sock = ctx.flows.at(idx).tcp().map(|c| c.sock).ok_or(())?;
        let mut mh: libc::msghdr = unsafe { std::mem::zeroed() };
        mh.msg_iov = iov.as_mut_ptr();
        mh.msg_iovlen = iov.len();

        let n = loop {
            let n = unsafe {
                libc::sendmsg(sock, &mh, libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL)
            };
            if n >= 0 {
                break n as u32;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EPIPE) => {
                    // The peer is gone; ack what we swallowed, then reset
                    if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
                        conn.seq_from_tap = seq_from_tap;
                    }
                    let _ = send_flag(ctx, idx, FL_ACK);
                    return Err(());
                }
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                    let _ = send_flag(ctx, idx, ACK_IF_NEEDED);
                    return Ok(pkts.len());
                }
                _ => return Err(()),
            }
        };

        let queued = seq_from_tap.wrapping_sub(seq_from_tap0);
        if n < queued {
            partial_send = true;
            if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
                conn.seq_from_tap = seq_from_tap0.wrapping_add(n);
            }
            let _ = send_flag(ctx, idx, ACK_IF_NEEDED);
        } else if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            conn.seq_from_tap = seq_from_tap0.wrapping_add(n);
        }
    }

    if keep.is_some() {
        // An 8-bit stamp suppresses duplicate-ACK storms; collisions once
        // per 256 bytes of matching payload just skip one trigger (fast
        // retransmit is a SHOULD in RFC 5681, 3.2)
        let send_dup = {
            let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
                return Err(());
            };
            if conn.seq_dup_ack_approx != (conn.seq_from_tap & 0xff) as u8 {
                conn.seq_dup_ack_approx = (conn.seq_from_tap & 0xff) as u8;
                true
            } else {
                false
            }
        };
        if send_dup {
            let _ = send_flag(ctx, idx, FL_ACK | FL_DUP_ACK);
        }
        return Ok(pkts.len());
    }

    let (tap_fin_sent, all_acked) = {
        let Some(conn) = ctx.flows.at(idx).tcp() else {
            return Err(());
        };
        (
            conn.events & TAP_FIN_SENT != 0,
            conn.seq_ack_from_tap == conn.seq_to_tap,
        )
    };
    if ack && tap_fin_sent && all_acked {
        conn_event(&mut ctx.flows, &ctx.epoll, idx, TAP_FIN_ACKED);
    }

    if fin && !partial_send {
        if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            conn.seq_from_tap = conn.seq_from_tap.wrapping_add(1);
        }
        conn_event(&mut ctx.flows, &ctx.epoll, idx, TAP_FIN_RCVD);
    } else {
        let _ = send_flag(ctx, idx, ACK_IF_NEEDED);
    }

    Ok(pkts.len())
}

// --- connection setup ---

/// Connection request from the guest (SYN on the tap): validate, map the
/// gateway to loopback, open a host socket and connect.
fn conn_from_tap(ctx: &mut Ctx, batch: &L4Batch<'_>, th: &tcphdr::TcpHeader<'_>, now: Stamp) {
    let Some(idx) = ctx.flows.alloc() else {
        ctx.stats.flow_table_full.inc();
        return;
    };

    let sport = th.src_port();
    let dport = th.dst_port();
    let (saddr, daddr) = (batch.saddr, batch.daddr);

    let invalid = sport == 0
        || dport == 0
        || match (saddr, daddr) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                s.is_unspecified()
                    || s.is_broadcast()
                    || s.is_multicast()
                    || d.is_unspecified()
                    || d.is_broadcast()
                    || d.is_multicast()
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                s.is_unspecified() || s.is_multicast() || d.is_unspecified() || d.is_multicast()
            }
            _ => true,
        };
    if invalid {
        debug!("invalid endpoint in TCP SYN: {saddr}:{sport} -> {daddr}:{dport}");
        ctx.flows.alloc_cancel(idx);
        return;
    }

    let v6 = batch.v6;
    let sock = match conn_sock(&mut ctx.tcp, v6, ctx.low_rmem, ctx.low_wmem) {
        Ok(s) => s,
        Err(_) => {
            ctx.flows.alloc_cancel(idx);
            return;
        }
    };

    // Gateway mapping: what the guest sends to its gateway lands on the host
    let mut connect_addr = daddr;
    if !ctx.opts.no_map_gw {
        match daddr {
            IpAddr::V4(d) if d == ctx.ip4.gw => {
                connect_addr = IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
            IpAddr::V6(d) if d == ctx.ip6.gw => {
                connect_addr = IpAddr::V6(Ipv6Addr::LOCALHOST)
            }
            _ => {}
        }
    }
    let connect_port = ctx.tcp.fwd_out.remap(dport);

    if let IpAddr::V6(a) = connect_addr {
        if is_link_local(&a) {
            let bind = SocketAddr::V6(SocketAddrV6::new(ctx.ip6.addr_ll, 0, 0, ctx.ip6.ifi));
            if crate::ctx::bind_fd(sock, &bind).is_err() {
                unsafe { libc::close(sock) };
                ctx.flows.alloc_cancel(idx);
                return;
            }
        }
    }

    let mut conn = TcpConn::new(sock);
    conn.set_faddr(InAny::from_ip(daddr));
    conn.set_eport(sport);
    conn.set_fport(dport);
    conn.common.pif[crate::dataplane::flow::SOCK_SIDE] = Pif::Host;
    conn.common.pif[TAP_SIDE] = Pif::Host;
    conn.wnd_to_tap = WINDOW_DEFAULT;

    let mss = tcphdr::opt_get(th.options(), tcphdr::OPT_MSS)
        .map(|v| v as u16)
        .unwrap_or(MSS_DEFAULT)
        .min(mss_max(v6));
    let mss_opt = mss as libc::c_int;
    unsafe {
        libc::setsockopt(
            sock,
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            &mss_opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as u32,
        );
    }
    conn.mss = mss;

    conn.ws_from_tap = tcphdr::opt_get(th.options(), tcphdr::OPT_WS)
        .map(|v| (v as u8).min(MAX_WS))
        .unwrap_or(0);

    // RFC 7323, 2.2: the window in the SYN is never scaled
    conn.wnd_from_tap = (th.window() >> conn.ws_from_tap).max(1);

    conn.seq_init_from_tap = th.seq();
    conn.seq_from_tap = conn.seq_init_from_tap.wrapping_add(1);
    conn.seq_ack_to_tap = conn.seq_from_tap;
    seq_init(ctx, &mut conn, now);
    conn.seq_ack_from_tap = conn.seq_to_tap;
    conn.events = TAP_SYN_RCVD;

    let key = (conn.faddr(), conn.eport(), conn.fport());
    ctx.flows.set(idx, Flow::Tcp(conn));
    ctx.flows.hash_insert(idx, &key.0, key.1, key.2);

    // If nothing could ever listen there, the bind probe succeeds and we
    // know to reset right away; failure with EADDRNOTAVAIL/EACCES means a
    // genuinely remote destination
    let probe = SocketAddr::new(connect_addr, connect_port);
    let (sa, sl) = sockaddr_from(&probe);
    let bound = unsafe { libc::bind(sock, &sa.sa, sl) } == 0;
    if bound {
        rst(ctx, idx); // nobody is listening then
        return;
    }
    let errno = std::io::Error::last_os_error().raw_os_error();
    if !matches!(errno, Some(libc::EADDRNOTAVAIL) | Some(libc::EACCES)) {
        if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            conn.flags |= LOCAL;
        }
    }

    let loopback = connect_addr.is_loopback()
        || matches!(connect_addr, IpAddr::V6(a) if is_link_local(&a));
    if !loopback {
        bind_outbound(ctx, sock, v6);
    }

    let target = SocketAddr::new(connect_addr, connect_port);
    let (sa, sl) = sockaddr_from(&target);
    let ret = unsafe { libc::connect(sock, &sa.sa, sl) };
    if ret != 0 {
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINPROGRESS) {
            rst(ctx, idx);
            return;
        }
        if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            get_sndbuf(conn);
        }
    } else {
        if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            get_sndbuf(conn);
        }
        if send_flag(ctx, idx, FL_SYN | FL_ACK).is_err() {
            return;
        }
        conn_event(&mut ctx.flows, &ctx.epoll, idx, TAP_SYN_ACK_SENT | TAP_SYN_RCVD);
    }

    if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
        epoll_ctl(&ctx.epoll, conn, idx);
    }
}

fn bind_outbound(ctx: &Ctx, sock: RawFd, v6: bool) {
    if v6 {
        if let Some(addr) = ctx.ip6.addr_out {
            let _ = crate::ctx::bind_fd(sock, &SocketAddr::V6(SocketAddrV6::new(addr, 0, 0, 0)));
        }
        if let Some(ifname) = &ctx.ip6.ifname_out {
            let _ = crate::ctx::bind_to_device(sock, ifname);
        }
    } else {
        if let Some(addr) = ctx.ip4.addr_out {
            let _ = crate::ctx::bind_fd(sock, &SocketAddr::V4(SocketAddrV4::new(addr, 0)));
        }
        if let Some(ifname) = &ctx.ip4.ifname_out {
            let _ = crate::ctx::bind_to_device(sock, ifname);
        }
    }
}

/// SNAT of inbound peers: loopback and our own observed addresses become the
/// gateway so the guest routes replies back through us.
pub fn snat_inbound(ctx: &Ctx, addr: &mut InAny) {
    if let Some(a4) = addr.v4() {
        if a4.is_loopback() || a4.is_unspecified() || a4 == ctx.ip4.addr_seen {
            *addr = InAny::from_v4(ctx.ip4.gw);
        }
    } else {
        let a6 = addr.v6();
        if a6.is_loopback() || a6 == ctx.ip6.addr_seen || a6 == ctx.ip6.addr {
            if is_link_local(&ctx.ip6.gw) {
                *addr = InAny::from_v6(ctx.ip6.gw);
            } else {
                *addr = InAny::from_v6(ctx.ip6.addr_ll);
            }
        }
    }
}

/// Host-originated connection accepted on a listening socket: the guest is
/// the server. SYN goes to the tap with parameters mirrored from the socket.
fn tap_conn_from_sock(
    ctx: &mut Ctx,
    idx: u32,
    dstport: u16,
    sock: RawFd,
    peer: (IpAddr, u16),
    now: Stamp,
) {
    let mut conn = TcpConn::new(sock);
    let mut faddr = InAny::from_ip(peer.0);
    snat_inbound(ctx, &mut faddr);
    conn.set_faddr(faddr);
    conn.set_fport(peer.1);
    conn.set_eport(ctx.tcp.fwd_in.remap(dstport));
    conn.common.pif[crate::dataplane::flow::SOCK_SIDE] = Pif::Host;
    conn.common.pif[TAP_SIDE] = Pif::Host;

    seq_init(ctx, &mut conn, now);
    conn.seq_ack_from_tap = conn.seq_to_tap;
    conn.wnd_from_tap = WINDOW_DEFAULT;

    let key = (conn.faddr(), conn.eport(), conn.fport());
    ctx.flows.set(idx, Flow::Tcp(conn));
    ctx.flows.hash_insert(idx, &key.0, key.1, key.2);
    conn_event(&mut ctx.flows, &ctx.epoll, idx, SOCK_ACCEPTED);

    if send_flag(ctx, idx, FL_SYN).is_err() {
        return;
    }
    {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return;
        };
        conn_flag(&ctx.epoll, conn, idx, ACK_FROM_TAP_DUE, true);
        get_sndbuf(conn);
    }
}

/// Readiness on a listening socket: accept, validate, splice or translate.
pub fn listen_handler(ctx: &mut Ctx, r: EpollRef, now: Stamp) {
    let Some(idx) = ctx.flows.alloc() else {
        ctx.stats.flow_table_full.inc();
        return;
    };

    let mut sa = crate::ctx::SockaddrAny::zeroed();
    let mut sl = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let sock = unsafe {
        libc::accept4(
            r.fd,
            &mut sa.sa as *mut libc::sockaddr,
            &mut sl,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    let sock = match claim_fd(sock) {
        Ok(s) => s,
        Err(_) => {
            ctx.flows.alloc_cancel(idx);
            return;
        }
    };

    let Some(peer) = sa.to_addr() else {
        unsafe { libc::close(sock) };
        ctx.flows.alloc_cancel(idx);
        return;
    };

    let invalid = peer.1 == 0
        || match peer.0 {
            IpAddr::V4(a) => a.is_unspecified() || a.is_broadcast() || a.is_multicast(),
            IpAddr::V6(a) => a.is_unspecified() || a.is_multicast(),
        };
    if invalid {
        warn!("invalid endpoint from TCP accept(): {}:{}", peer.0, peer.1);
        unsafe { libc::close(sock) };
        ctx.flows.alloc_cancel(idx);
        return;
    }

    if crate::dataplane::tcp_splice::conn_from_sock(ctx, idx, r, sock, peer) {
        return;
    }

    tap_conn_from_sock(ctx, idx, r.listen_port(), sock, peer, now);
}

/// Deferred connect() completion, driven by EPOLLOUT.
fn connect_finish(ctx: &mut Ctx, idx: u32) {
    let sock = match ctx.flows.at(idx).tcp() {
        Some(c) => c.sock,
        None => return,
    };
    let mut so: libc::c_int = 0;
    let mut sl = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            sock,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so as *mut _ as *mut libc::c_void,
            &mut sl,
        )
    };
    if ret < 0 || so != 0 {
        rst(ctx, idx);
        return;
    }

    if send_flag(ctx, idx, FL_SYN | FL_ACK).is_err() {
        return;
    }
    conn_event(&mut ctx.flows, &ctx.epoll, idx, TAP_SYN_ACK_SENT | TAP_SYN_RCVD);
    if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
        conn_flag(&ctx.epoll, conn, idx, ACK_FROM_TAP_DUE, true);
    }
}

/// SYN,ACK from the guest answering our SYN: window, scale and MSS come from
/// the segment, the connection is established.
fn conn_from_sock_finish(ctx: &mut Ctx, idx: u32, th: &tcphdr::TcpHeader<'_>) {
    {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return;
        };
        tap_window_update(conn, th.window() as u32);
        conn.ws_from_tap = tcphdr::opt_get(th.options(), tcphdr::OPT_WS)
            .map(|v| (v as u8).min(MAX_WS))
            .unwrap_or(0);
        // First value is not scaled
        conn.wnd_from_tap = (conn.wnd_from_tap >> conn.ws_from_tap).max(1);
        conn.mss = tcphdr::opt_get(th.options(), tcphdr::OPT_MSS)
            .map(|v| v as u16)
            .unwrap_or(MSS_DEFAULT)
            .min(mss_max(!conn.v4()));

        conn.seq_init_from_tap = th.seq().wrapping_add(1);
        conn.seq_from_tap = conn.seq_init_from_tap;
        conn.seq_ack_to_tap = conn.seq_from_tap;
    }
    conn_event(&mut ctx.flows, &ctx.epoll, idx, ESTABLISHED);

    // The client may have sent data already
    let _ = data_from_sock(ctx, idx);
    let _ = send_flag(ctx, idx, FL_ACK);
}

// --- handlers ---

/// Batch of TCP segments from the tap sharing one tuple.
pub fn tap_handler(ctx: &mut Ctx, batch: &L4Batch<'_>, now: Stamp) {
    let mut i = 0;
    while i < batch.pkts.len() {
        match tap_handler_one(ctx, batch, i, now) {
            0 => break,
            n => i += n,
        }
    }
}

fn tap_handler_one(ctx: &mut Ctx, batch: &L4Batch<'_>, i: usize, now: Stamp) -> usize {
    let pkts = &batch.pkts[i..];
    let th = match tcphdr::TcpHeader::parse(pkts[0]) {
        Ok(th) => th,
        Err(_) => return 1,
    };

    let faddr = InAny::from_ip(batch.daddr);
    let sidx = ctx.flows.hash_lookup(&faddr, th.src_port(), th.dst_port());

    let Some(sidx) = sidx else {
        // New connection from tap
        if th.is_syn() && !th.is_ack() {
            conn_from_tap(ctx, batch, &th, now);
        }
        return 1;
    };
    let idx = sidx.flow;

    if th.is_rst() {
        conn_event(&mut ctx.flows, &ctx.epoll, idx, CLOSED);
        return 1;
    }

    let events = match ctx.flows.at(idx).tcp() {
        Some(c) => c.events,
        None => return 1,
    };

    if th.is_ack() && events & ESTABLISHED == 0 {
        if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            update_seqack_from_tap(&ctx.epoll, conn, idx, th.ack_seq());
        }
    }

    // Establishing, connection from socket
    if events & SOCK_ACCEPTED != 0 {
        if th.is_syn() && th.is_ack() && !th.is_fin() {
            conn_from_sock_finish(ctx, idx, &th);
            return 1;
        }
        rst(ctx, idx);
        return pkts.len();
    }

    // Establishing, connection from tap
    if events & TAP_SYN_RCVD != 0 {
        if events & TAP_SYN_ACK_SENT == 0 {
            rst(ctx, idx);
            return pkts.len();
        }
        conn_event(&mut ctx.flows, &ctx.epoll, idx, ESTABLISHED);

        if th.is_fin() {
            {
                let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
                    return 1;
                };
                conn.seq_from_tap = conn.seq_from_tap.wrapping_add(1);
                unsafe { libc::shutdown(conn.sock, libc::SHUT_WR) };
            }
            let _ = send_flag(ctx, idx, FL_ACK);
            conn_event(&mut ctx.flows, &ctx.epoll, idx, SOCK_FIN_SENT);
            return 1;
        }
        if !th.is_ack() {
            rst(ctx, idx);
            return pkts.len();
        }
        if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            tap_window_update(conn, th.window() as u32);
        }
        let _ = data_from_sock(ctx, idx);
        if pkts.len() == 1 {
            return 1;
        }
    }

    // Established but no longer accepting data from tap
    let events = match ctx.flows.at(idx).tcp() {
        Some(c) => c.events,
        None => return 1,
    };
    if events & TAP_FIN_RCVD != 0 {
        let closed = {
            let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
                return 1;
            };
            update_seqack_from_tap(&ctx.epoll, conn, idx, th.ack_seq());
            conn.events & SOCK_FIN_RCVD != 0 && conn.seq_ack_from_tap == conn.seq_to_tap
        };
        if closed {
            conn_event(&mut ctx.flows, &ctx.epoll, idx, CLOSED);
        }
        return 1;
    }

    // Established, accepting data
    let count = match data_from_tap(ctx, idx, pkts) {
        Ok(n) => n,
        Err(_) => {
            // Discard the rest of the batch, our RST invalidates it anyway
            rst(ctx, idx);
            return pkts.len();
        }
    };

    let mut ack_due = false;
    {
        let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
            return count;
        };
        conn_flag(&ctx.epoll, conn, idx, STALLED, false);
        if conn.seq_ack_to_tap != conn.seq_from_tap {
            ack_due = true;
        }
    }

    let (fin_rcvd, fin_sent) = {
        let Some(conn) = ctx.flows.at(idx).tcp() else {
            return count;
        };
        (
            conn.events & TAP_FIN_RCVD != 0,
            conn.events & SOCK_FIN_SENT != 0,
        )
    };
    if fin_rcvd && !fin_sent {
        {
            let Some(conn) = ctx.flows.at(idx).tcp() else {
                return count;
            };
            unsafe { libc::shutdown(conn.sock, libc::SHUT_WR) };
        }
        conn_event(&mut ctx.flows, &ctx.epoll, idx, SOCK_FIN_SENT);
        let _ = send_flag(ctx, idx, FL_ACK);
        ack_due = false;
    }

    if ack_due {
        if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            conn_flag(&ctx.epoll, conn, idx, ACK_TO_TAP_DUE, true);
        }
    }

    count
}

/// Readiness on a connection socket.
pub fn sock_handler(ctx: &mut Ctx, r: EpollRef, events: u32) {
    let idx = r.flow();
    let conn_events = match ctx.flows.at(idx).tcp() {
        Some(c) => c.events,
        None => return,
    };
    if conn_events == CLOSED {
        return;
    }

    if events & libc::EPOLLERR as u32 != 0 {
        rst(ctx, idx);
        return;
    }

    if conn_events & TAP_FIN_SENT != 0 && events & libc::EPOLLHUP as u32 != 0 {
        conn_event(&mut ctx.flows, &ctx.epoll, idx, CLOSED);
        return;
    }

    if conn_events & ESTABLISHED != 0 {
        if conn_events & (SOCK_FIN_SENT | TAP_FIN_ACKED) == SOCK_FIN_SENT | TAP_FIN_ACKED {
            conn_event(&mut ctx.flows, &ctx.epoll, idx, CLOSED);
        }
        if events & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0 {
            conn_event(&mut ctx.flows, &ctx.epoll, idx, SOCK_FIN_RCVD);
        }
        if events & libc::EPOLLIN as u32 != 0 {
            let _ = data_from_sock(ctx, idx);
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            update_seqack_wnd(ctx, idx, false, None);
        }
        return;
    }

    // EPOLLHUP during handshake: reset
    if events & libc::EPOLLHUP as u32 != 0 {
        rst(ctx, idx);
        return;
    }

    // Data during handshake tap-side: check later
    if conn_events & SOCK_ACCEPTED != 0 {
        return;
    }

    if conn_events == TAP_SYN_RCVD && events & libc::EPOLLOUT as u32 != 0 {
        connect_finish(ctx, idx);
    }
}

/// Per-connection timer expiry: ACK, retransmit or reset.
pub fn timer_handler(ctx: &mut Ctx, r: EpollRef) {
    let idx = r.flow();
    let (timer, flags, events, retrans) = match ctx.flows.at(idx).tcp() {
        Some(c) => (c.timer, c.flags, c.events, c.retrans),
        None => return,
    };
    if timer < 0 {
        return;
    }

    // If the timer is currently armed this event came from an earlier
    // setting that was since rescheduled: discard it
    if timerfd_is_armed(timer) {
        return;
    }

    if flags & ACK_TO_TAP_DUE != 0 {
        let _ = send_flag(ctx, idx, ACK_IF_NEEDED);
        if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
            timer_ctl(&ctx.epoll, conn, idx);
        }
    } else if flags & ACK_FROM_TAP_DUE != 0 {
        if events & ESTABLISHED == 0 {
            debug!(idx, "handshake timeout");
            rst(ctx, idx);
        } else if events & (SOCK_FIN_SENT | TAP_FIN_ACKED) == SOCK_FIN_SENT | TAP_FIN_ACKED {
            debug!(idx, "FIN timeout");
            rst(ctx, idx);
        } else if retrans == MAX_RETRANS {
            debug!(idx, "retransmissions count exceeded");
            rst(ctx, idx);
        } else {
            debug!(idx, "ACK timeout, retry");
            {
                let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() else {
                    return;
                };
                conn.retrans += 1;
                conn.seq_to_tap = conn.seq_ack_from_tap;
            }
            let _ = data_from_sock(ctx, idx);
            if let Some(conn) = ctx.flows.at_mut(idx).tcp_mut() {
                timer_ctl(&ctx.epoll, conn, idx);
            }
        }
    } else {
        // Activity timeout if this wasn't a stale arm from a dropped flag
        let old = timerfd_arm_get_old(timer, ACT_TIMEOUT).unwrap_or(0);
        if old == ACT_TIMEOUT.as_secs() {
            debug!(idx, "activity timeout");
            rst(ctx, idx);
        }
    }
}

// --- initialisation ---

/// Open listening sockets for inbound forwarded ports on the host side.
pub fn sock_init_host(ctx: &mut Ctx) {
    let ports: Vec<u16> = ctx.tcp.fwd_in.map.iter_set().collect();
    for port in ports {
        sock_init_port(ctx, port);
    }
}

/// Host-side listening sockets for one inbound forwarded port.
pub fn sock_init_port(ctx: &mut Ctx, port: u16) {
    for v6 in [false, true] {
        if (v6 && !ctx.ip6.enabled) || (!v6 && !ctx.ip4.enabled) {
            continue;
        }
        let fd = crate::ctx::sock_l4(
            &ctx.epoll,
            v6,
            libc::IPPROTO_TCP,
            None,
            None,
            port,
            |fd| EpollRef::tcp_listen(fd, Pif::Host, port),
        );
        match fd {
            Ok(fd) => {
                sock_set_bufsize(fd, ctx.low_rmem, ctx.low_wmem);
                if ctx.tcp.fwd_in.mode == FwdMode::Auto {
                    ctx.tcp.listen_host[port as usize][v6 as usize] = fd;
                }
            }
            Err(e) => debug!("TCP: can't bind port {port} (v6: {v6}): {e}"),
        }
    }
}

/// Bind one loopback listening socket in the peer namespace for an outbound
/// forwarded port. Runs inside the namespace.
pub fn ns_sock_init_port(ctx: &mut Ctx, port: u16) {
    for v6 in [false, true] {
        if (v6 && !ctx.ip6.enabled) || (!v6 && !ctx.ip4.enabled) {
            continue;
        }
        let bind: IpAddr = if v6 {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        let fd = crate::ctx::sock_l4(
            &ctx.epoll,
            v6,
            libc::IPPROTO_TCP,
            Some(bind),
            None,
            port,
            |fd| EpollRef::tcp_listen(fd, Pif::Splice, port),
        );
        match fd {
            Ok(fd) => {
                sock_set_bufsize(fd, ctx.low_rmem, ctx.low_wmem);
                if ctx.tcp.fwd_out.mode == FwdMode::Auto {
                    ctx.tcp.listen_ns[port as usize][v6 as usize] = fd;
                }
            }
            Err(e) => debug!("TCP: can't bind ns port {port} (v6: {v6}): {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_compare_wraparound() {
        assert!(seq_lt(0xffff_fff0, 0x10));
        assert!(seq_gt(0x10, 0xffff_fff0));
        assert!(seq_le(5, 5));
        assert!(seq_ge(5, 5));
        assert!(!seq_lt(5, 5));
        // agrees with signed arithmetic over the +/- 2^31 window
        assert!(seq_lt(0, 0x7fff_ffff));
        assert!(!seq_lt(0, 0x8000_0001));
    }

    #[test]
    fn test_event_state_bits_exclusive() {
        let mut flows = FlowTable::new((3, 4));
        let epoll = Epoll::new().unwrap();
        let idx = flows.alloc().unwrap();
        let mut conn = TcpConn::new(-1);
        conn.events = SOCK_ACCEPTED;
        flows.set(idx, Flow::Tcp(conn));

        conn_event(&mut flows, &epoll, idx, ESTABLISHED);
        assert_eq!(flows.at(idx).tcp().unwrap().events, ESTABLISHED);

        conn_event(&mut flows, &epoll, idx, SOCK_FIN_RCVD);
        assert_eq!(
            flows.at(idx).tcp().unwrap().events,
            ESTABLISHED | SOCK_FIN_RCVD
        );

        conn_event(&mut flows, &epoll, idx, CLOSED);
        assert_eq!(flows.at(idx).tcp().unwrap().events, CLOSED);
    }

    #[test]
    fn test_epoll_events_by_state() {
        // STALLED wants edge-triggered write readiness too
        assert_eq!(
            conn_epoll_events(ESTABLISHED, STALLED),
            (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32
        );
        assert_eq!(
            conn_epoll_events(ESTABLISHED, 0),
            (libc::EPOLLIN | libc::EPOLLRDHUP) as u32
        );
        // FIN sent to tap: only hangup interest remains
        assert_eq!(
            conn_epoll_events(ESTABLISHED | TAP_FIN_SENT, 0),
            libc::EPOLLET as u32
        );
        assert_eq!(
            conn_epoll_events(TAP_SYN_RCVD, 0),
            (libc::EPOLLOUT | libc::EPOLLET | libc::EPOLLRDHUP) as u32
        );
        assert_eq!(conn_epoll_events(CLOSED, 0), 0);
    }

    #[test]
    fn test_snat_inbound_idempotent() {
        let opts = crate::config::Options {
            addr4: Some(Ipv4Addr::new(192, 168, 1, 5)),
            gw4: Some(Ipv4Addr::new(192, 168, 1, 1)),
            ..Default::default()
        };
        let ctx = Ctx::new(opts).unwrap();

        let mut addr = InAny::from_v4(Ipv4Addr::LOCALHOST);
        snat_inbound(&ctx, &mut addr);
        assert_eq!(addr.v4(), Some(Ipv4Addr::new(192, 168, 1, 1)));

        // Applying the rewrite again is a no-op
        let before = addr;
        snat_inbound(&ctx, &mut addr);
        assert_eq!(addr, before);

        // Unrelated remote addresses pass through
        let mut remote = InAny::from_v4(Ipv4Addr::new(203, 0, 113, 9));
        snat_inbound(&ctx, &mut remote);
        assert_eq!(remote.v4(), Some(Ipv4Addr::new(203, 0, 113, 9)));
    }

    #[test]
    fn test_low_rtt_table_round_robin() {
        let mut tcp = TcpCtx::new();
        let mut info = TcpInfo {
            tcpi_min_rtt: 5,
            ..Default::default()
        };
        let full_len = std::mem::size_of::<TcpInfo>();

        for i in 0..LOW_RTT_TABLE_SIZE as u8 {
            let a = InAny::from_v4(Ipv4Addr::new(10, 0, 0, i + 1));
            tcp.rtt_dst_check(&a, &info, full_len);
        }
        assert!(tcp.rtt_dst_low(&InAny::from_v4(Ipv4Addr::new(10, 0, 0, 1))));

        // Above threshold: not recorded
        info.tcpi_min_rtt = 50;
        let far = InAny::from_v4(Ipv4Addr::new(10, 9, 9, 9));
        tcp.rtt_dst_check(&far, &info, full_len);
        assert!(!tcp.rtt_dst_low(&far));
    }

    #[test]
    fn test_mss_clamp() {
        assert!(mss_max(false) > mss_max(true));
        assert_eq!(mss_max(false) % 4, 0);
        assert!((mss_max(true) as usize) + PAYLOAD_OFF6 - FRAME_PREFIX <= u16::MAX as usize);
    }

    #[test]
    fn test_tap_window_update_scaling() {
        let mut conn = TcpConn::new(-1);
        conn.ws_from_tap = 7;
        tap_window_update(&mut conn, 512);
        assert_eq!(conn.wnd_from_tap, 512);

        // Scaled value clamps at MAX_WINDOW
        tap_window_update(&mut conn, 65535);
        assert_eq!(
            conn.wnd_from_tap as u32,
            (MAX_WINDOW >> 7).min(u16::MAX as u32)
        );
    }
}
