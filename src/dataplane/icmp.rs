//! ICMP/ICMPv6 echo translation over dgram "ping" sockets
//!
//! Each (remote address, echo id) pair seen from the tap gets one Linux
//! dgram ping socket bound to the id, so replies come back carrying it. The
//! kernel rewrites ids on its side; we rewrite them back to what the guest
//! chose before re-framing the reply onto the tap.

use crate::ctx::{sockaddr_from, Ctx};
use crate::dataplane::flow::{Flow, FlowCommon, TAP_SIDE};
use crate::event::{claim_fd, EpollRef, FdKind};
use crate::protocol::{checksum, ethernet, icmp as icmphdr, ipv4, ipv6, EtherType, InAny};
use crate::tap::{finalize_frame, FRAME_PREFIX};
use crate::util::Stamp;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use tracing::{debug, trace};

/// Seconds without guest activity before an echo flow expires
pub const PING_TIMEOUT: u64 = 60;

/// One echo exchange tracked in the flow table.
#[derive(Debug)]
pub struct PingFlow {
    pub common: FlowCommon,
    pub sock: RawFd,
    /// Last tap-side activity, seconds
    pub ts: i64,
    /// Echo id as the guest chose it
    pub id: u16,
    /// Last sequence sent, -1 before the first request
    pub seq: i32,
    pub v6: bool,
}

impl PingFlow {
    /// Expire hook from the flow timer pass.
    pub fn expire(&mut self, icmp: &mut IcmpCtx) -> bool {
        debug!(id = self.id, "ICMP echo flow timed out");
        if self.sock >= 0 {
            unsafe { libc::close(self.sock) };
            self.sock = -1;
        }
        icmp.id_map[self.v6 as usize][self.id as usize] = None;
        true
    }
}

pub struct IcmpCtx {
    /// (version, echo id) to flow index
    pub id_map: [Vec<Option<u32>>; 2],
    /// Frame scratch for replies toward the tap
    scratch: Vec<u8>,
}

impl Default for IcmpCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl IcmpCtx {
    pub fn new() -> Self {
        Self {
            id_map: [vec![None; 65536], vec![None; 65536]],
            scratch: vec![0u8; FRAME_PREFIX + 65536 + ethernet::HEADER_SIZE],
        }
    }
}

fn ping_sock(v6: bool, id: u16) -> crate::Result<RawFd> {
    let (domain, proto) = if v6 {
        (libc::AF_INET6, libc::IPPROTO_ICMPV6)
    } else {
        (libc::AF_INET, libc::IPPROTO_ICMP)
    };
    let fd = claim_fd(unsafe {
        libc::socket(
            domain,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            proto,
        )
    })?;

    // Ping sockets use the echo id as their local "port": binding it makes
    // the kernel keep the guest's id on the wire
    let bind = if v6 {
        SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), id)
    } else {
        SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), id)
    };
    let (sa, sl) = sockaddr_from(&bind);
    if unsafe { libc::bind(fd, &sa.sa, sl) } < 0 {
        // Not fatal: the id the kernel picks gets rewritten on replies
        trace!(id, "ping socket bind failed, kernel id will differ");
    }
    Ok(fd)
}

/// Echo request from the guest.
pub fn tap_handler(ctx: &mut Ctx, v6: bool, _saddr: IpAddr, daddr: IpAddr, l4: &[u8], now: Stamp) {
    let echo = match icmphdr::IcmpEcho::parse(l4) {
        Ok(e) => e,
        Err(_) => return,
    };
    if !echo.is_echo_request(v6) {
        trace!("unhandled ICMP type {} from tap", echo.icmp_type());
        return;
    }
    let id = echo.id();

    let idx = match ctx.icmp.id_map[v6 as usize][id as usize] {
        Some(idx) if matches!(ctx.flows.at(idx), Flow::Ping4(_) | Flow::Ping6(_)) => idx,
        _ => {
            let Some(idx) = ctx.flows.alloc() else {
                ctx.stats.flow_table_full.inc();
                return;
            };
            let sock = match ping_sock(v6, id) {
                Ok(s) => s,
                Err(e) => {
                    debug!("cannot open ping socket: {e}");
                    ctx.flows.alloc_cancel(idx);
                    return;
                }
            };
            let r = EpollRef::new(FdKind::Ping, sock, idx);
            if ctx.epoll.add(libc::EPOLLIN as u32, r).is_err() {
                unsafe { libc::close(sock) };
                ctx.flows.alloc_cancel(idx);
                return;
            }

            let mut flow = PingFlow {
                common: FlowCommon::default(),
                sock,
                ts: now.secs,
                id,
                seq: -1,
                v6,
            };
            flow.common.side[TAP_SIDE].forward_addr = InAny::from_ip(daddr);
            flow.common.side[TAP_SIDE].endpoint_port = id;
            let flow = if v6 { Flow::Ping6(flow) } else { Flow::Ping4(flow) };
            ctx.flows.set(idx, flow);
            ctx.icmp.id_map[v6 as usize][id as usize] = Some(idx);
            debug!(id, %daddr, "new ICMP echo flow");
            idx
        }
    };

    let seq = echo.sequence();
    {
        let Some(flow) = ctx.flows.at_mut(idx).ping_mut() else {
            return;
        };
        flow.ts = now.secs;
        flow.seq = seq as i32;
        flow.common.side[TAP_SIDE].forward_addr = InAny::from_ip(daddr);

        let dest = SocketAddr::new(daddr, 0);
        let (sa, sl) = sockaddr_from(&dest);
        let n = unsafe {
            libc::sendto(
                flow.sock,
                l4.as_ptr() as *const libc::c_void,
                l4.len(),
                libc::MSG_NOSIGNAL,
                &sa.sa,
                sl,
            )
        };
        if n < 0 {
            debug!(
                id,
                seq,
                "ping send failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    ctx.stats.icmp_requests.inc();
}

/// Echo reply on a ping socket: rewrite the id back and frame it to the tap.
pub fn sock_handler(ctx: &mut Ctx, r: EpollRef, now: Stamp) {
    let idx = r.flow();

    loop {
        let (sock, id, v6, last_seq) = {
            let Some(flow) = ctx.flows.at_mut(idx).ping_mut() else {
                return;
            };
            (flow.sock, flow.id, flow.v6, flow.seq)
        };

        let mut scratch = std::mem::take(&mut ctx.icmp.scratch);
        let l4_off = FRAME_PREFIX
            + ethernet::HEADER_SIZE
            + if v6 { ipv6::HEADER_SIZE } else { ipv4::MIN_HEADER_SIZE };

        let mut sa = crate::ctx::SockaddrAny::zeroed();
        let mut sl = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let room = scratch.len() - l4_off;
        let n = unsafe {
            libc::recvfrom(
                sock,
                scratch[l4_off..].as_mut_ptr() as *mut libc::c_void,
                room,
                libc::MSG_DONTWAIT,
                &mut sa.sa as *mut libc::sockaddr,
                &mut sl,
            )
        };
        if n < 0 {
            ctx.icmp.scratch = scratch;
            return;
        }
        let n = n as usize;
        if n < icmphdr::ECHO_HEADER_SIZE {
            ctx.icmp.scratch = scratch;
            continue;
        }

        let reply_ok = icmphdr::IcmpEcho::parse(&scratch[l4_off..l4_off + n])
            .map(|e| e.is_echo_reply(v6))
            .unwrap_or(false);
        if !reply_ok {
            ctx.icmp.scratch = scratch;
            continue;
        }

        {
            let echo = icmphdr::IcmpEcho::parse(&scratch[l4_off..l4_off + n]).unwrap();
            if echo.sequence() as i32 != last_seq {
                trace!(
                    id,
                    seq = echo.sequence(),
                    expected = last_seq,
                    "unexpected echo reply sequence"
                );
            }
        }

        // Give the reply the id the guest knows
        icmphdr::set_id(&mut scratch[l4_off..], id);

        // Source address, SNAT'd like any inbound peer
        let mut src = match sa.to_addr() {
            Some((a, _)) => InAny::from_ip(a),
            None => {
                ctx.icmp.scratch = scratch;
                continue;
            }
        };
        crate::dataplane::tcp::snat_inbound(ctx, &mut src);

        let frame_len = if v6 {
            let saddr = src.v6();
            let daddr = if crate::protocol::types::is_link_local(&saddr) {
                ctx.ip6.addr_ll_seen
            } else {
                ctx.ip6.addr_seen
            };
            let pseudo =
                checksum::pseudo_v6(&saddr, &daddr, libc::IPPROTO_ICMPV6 as u8, n as u32);
            let csum = checksum::l4(pseudo, &scratch[l4_off..l4_off + n]);
            icmphdr::set_checksum(&mut scratch[l4_off..], csum);

            ethernet::write_header(
                &mut scratch[FRAME_PREFIX..],
                ctx.mac_guest,
                ctx.mac,
                EtherType::Ipv6,
            );
            ipv6::write_header(
                &mut scratch[FRAME_PREFIX + ethernet::HEADER_SIZE..],
                &saddr,
                &daddr,
                libc::IPPROTO_ICMPV6 as u8,
                n as u16,
            );
            ethernet::HEADER_SIZE + ipv6::HEADER_SIZE + n
        } else {
            let csum = checksum::icmp4(&scratch[l4_off..l4_off + n]);
            icmphdr::set_checksum(&mut scratch[l4_off..], csum);

            let saddr = src.v4().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
            ethernet::write_header(
                &mut scratch[FRAME_PREFIX..],
                ctx.mac_guest,
                ctx.mac,
                EtherType::Ipv4,
            );
            ipv4::write_header(
                &mut scratch[FRAME_PREFIX + ethernet::HEADER_SIZE..],
                saddr,
                ctx.ip4.addr_seen,
                libc::IPPROTO_ICMP as u8,
                n as u16,
            );
            ethernet::HEADER_SIZE + ipv4::MIN_HEADER_SIZE + n
        };

        let iov = finalize_frame(ctx.mode, &mut scratch, frame_len);
        ctx.tap.send_frames(&[iov]);
        ctx.stats.icmp_replies.inc();

        if let Some(flow) = ctx.flows.at_mut(idx).ping_mut() {
            flow.ts = now.secs;
        }
        ctx.icmp.scratch = scratch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_flow_expire_clears_id_map() {
        let mut icmp = IcmpCtx::new();
        icmp.id_map[0][0x1234] = Some(7);
        let mut flow = PingFlow {
            common: FlowCommon::default(),
            sock: -1,
            ts: 0,
            id: 0x1234,
            seq: 3,
            v6: false,
        };
        assert!(flow.expire(&mut icmp));
        assert!(icmp.id_map[0][0x1234].is_none());
    }
}
