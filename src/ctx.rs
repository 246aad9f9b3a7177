//! Execution context: process-wide state threaded through every handler
//!
//! There are no globals; everything the handlers touch lives here, split into
//! per-subsystem fields so disjoint borrows stay simple.

use crate::config::{Mode, Options};
use crate::dataplane::flow::FlowTable;
use crate::dataplane::fwd::ProcScanner;
use crate::dataplane::icmp::IcmpCtx;
use crate::dataplane::tcp::TcpCtx;
use crate::dataplane::udp::UdpCtx;
use crate::event::{claim_fd, Epoll, EpollRef};
use crate::netns::NetnsCtx;
use crate::protocol::types::{is_link_local, MacAddr};
use crate::tap::TapCtx;
use crate::telemetry::Metrics;
use crate::util::sysctl_mem_max;
use crate::{Error, Result};
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use tracing::debug;

/// Socket receive/send buffers are requested this large unless the probed
/// sysctl limits are below SNDBUF_BIG.
pub const SOCK_BUF_SIZE: i32 = i32::MAX / 2;
const SNDBUF_BIG: u64 = 4 << 20;

/// IPv4 side of the execution context.
#[derive(Debug, Clone)]
pub struct Ip4Ctx {
    pub enabled: bool,
    /// Address the guest uses
    pub addr: Ipv4Addr,
    pub gw: Ipv4Addr,
    /// Most recent source address seen from the tap
    pub addr_seen: Ipv4Addr,
    pub addr_out: Option<Ipv4Addr>,
    pub ifname_out: Option<String>,
    pub dns_host: Option<Ipv4Addr>,
    pub dns_match: Option<Ipv4Addr>,
}

/// IPv6 side of the execution context.
#[derive(Debug, Clone)]
pub struct Ip6Ctx {
    pub enabled: bool,
    pub addr: Ipv6Addr,
    pub gw: Ipv6Addr,
    /// Our link-local address on the outbound interface
    pub addr_ll: Ipv6Addr,
    pub addr_seen: Ipv6Addr,
    pub addr_ll_seen: Ipv6Addr,
    pub addr_out: Option<Ipv6Addr>,
    pub ifname_out: Option<String>,
    /// Scope id for link-local binds
    pub ifi: u32,
    pub dns_host: Option<Ipv6Addr>,
    pub dns_match: Option<Ipv6Addr>,
}

pub struct Ctx {
    pub mode: Mode,
    pub opts: Options,

    pub ip4: Ip4Ctx,
    pub ip6: Ip6Ctx,

    /// Guest MAC, learned from tap frames
    pub mac_guest: MacAddr,
    /// MAC we present as the gateway side
    pub mac: MacAddr,

    /// 128-bit siphash secret, random per process
    pub secret: (u64, u64),

    pub epoll: Epoll,
    pub flows: FlowTable,
    pub tcp: TcpCtx,
    pub udp: UdpCtx,
    pub icmp: IcmpCtx,
    pub tap: TapCtx,
    pub netns: NetnsCtx,
    pub fwd_scan: ProcScanner,
    pub stats: Metrics,

    /// Probed sysctl limits said the kernel caps receive/send buffers low
    pub low_rmem: bool,
    pub low_wmem: bool,
}

impl Ctx {
    pub fn new(opts: Options) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let secret = (rng.next_u64(), rng.next_u64());

        let ip4 = Ip4Ctx {
            enabled: opts.addr4.is_some(),
            addr: opts.addr4.unwrap_or(Ipv4Addr::UNSPECIFIED),
            gw: opts.gw4.unwrap_or(Ipv4Addr::UNSPECIFIED),
            addr_seen: opts.addr4.unwrap_or(Ipv4Addr::UNSPECIFIED),
            addr_out: opts.outbound4,
            ifname_out: opts.outbound_if4.clone(),
            dns_host: opts.dns4,
            dns_match: opts.dns_match4.or(match (opts.dns4, opts.gw4) {
                // A loopback resolver is unreachable from the guest: present
                // it on the gateway address and redirect
                (Some(dns), Some(gw)) if dns.is_loopback() => Some(gw),
                _ => None,
            }),
        };

        let addr6 = opts.addr6.unwrap_or(Ipv6Addr::UNSPECIFIED);
        let ip6 = Ip6Ctx {
            enabled: opts.addr6.is_some(),
            addr: addr6,
            gw: opts.gw6.unwrap_or(Ipv6Addr::UNSPECIFIED),
            addr_ll: link_local_for(&addr6),
            addr_seen: addr6,
            addr_ll_seen: link_local_for(&addr6),
            addr_out: opts.outbound6,
            ifname_out: opts.outbound_if6.clone(),
            ifi: 0,
            dns_host: opts.dns6,
            dns_match: opts.dns_match6.or(match (opts.dns6, opts.gw6) {
                (Some(dns), Some(gw)) if dns.is_loopback() => Some(gw),
                _ => None,
            }),
        };

        let low_rmem = sysctl_mem_max("rmem_max").map_or(false, |v| v < SNDBUF_BIG);
        let low_wmem = sysctl_mem_max("wmem_max").map_or(false, |v| v < SNDBUF_BIG);
        if low_rmem || low_wmem {
            debug!(low_rmem, low_wmem, "low socket buffer limits, kernel sizing kept");
        }

        Ok(Self {
            mode: opts.mode,
            ip4,
            ip6,
            mac_guest: MacAddr::BROADCAST,
            mac: MacAddr([0x9a, 0x55, 0x9a, 0x55, 0x9a, 0x55]),
            secret,
            epoll: Epoll::new()?,
            flows: FlowTable::new(secret),
            tcp: TcpCtx::new(),
            udp: UdpCtx::new(),
            icmp: IcmpCtx::new(),
            tap: TapCtx::new(opts.mode),
            netns: NetnsCtx::default(),
            fwd_scan: ProcScanner::default(),
            stats: Metrics::new(),
            low_rmem,
            low_wmem,
            opts,
        })
    }
}

/// Derive an EUI-64-ish link-local address from the configured global one;
/// good enough as a stable source for frames we originate.
fn link_local_for(addr: &Ipv6Addr) -> Ipv6Addr {
    if is_link_local(addr) {
        return *addr;
    }
    let o = addr.octets();
    Ipv6Addr::new(
        0xfe80,
        0,
        0,
        0,
        u16::from_be_bytes([o[8], o[9]]),
        u16::from_be_bytes([o[10], o[11]]),
        u16::from_be_bytes([o[12], o[13]]),
        u16::from_be_bytes([o[14] | 0x02, o[15]]),
    )
}

/// Create, bind and register an L4 socket.
///
/// Covers listening TCP sockets, bound UDP sockets and dgram ping sockets;
/// the typed reference lands in the epoll set so readiness dispatches to the
/// owning engine. For ping sockets `port` carries the echo id.
pub fn sock_l4(
    epoll: &Epoll,
    v6: bool,
    proto: i32,
    bind_addr: Option<IpAddr>,
    ifname: Option<&str>,
    port: u16,
    mkref: impl FnOnce(RawFd) -> EpollRef,
) -> Result<RawFd> {
    let (domain, sock_type) = match proto {
        libc::IPPROTO_TCP => (
            if v6 { libc::AF_INET6 } else { libc::AF_INET },
            libc::SOCK_STREAM,
        ),
        _ => (
            if v6 { libc::AF_INET6 } else { libc::AF_INET },
            libc::SOCK_DGRAM,
        ),
    };

    let fd = claim_fd(unsafe {
        libc::socket(domain, sock_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, proto)
    })?;

    let close_on_err = |e: Error| -> Error {
        unsafe { libc::close(fd) };
        e
    };

    let one: libc::c_int = 1;
    if v6 {
        unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            );
        }
    }
    if proto == libc::IPPROTO_TCP {
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            );
        }
    }

    if let Some(name) = ifname {
        bind_to_device(fd, name).map_err(close_on_err)?;
    }

    let addr = match (v6, bind_addr) {
        (false, Some(IpAddr::V4(a))) => SocketAddr::V4(SocketAddrV4::new(a, port)),
        (false, _) => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
        (true, Some(IpAddr::V6(a))) => SocketAddr::V6(SocketAddrV6::new(a, port, 0, 0)),
        (true, _) => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
    };
    bind_fd(fd, &addr).map_err(close_on_err)?;

    if proto == libc::IPPROTO_TCP && unsafe { libc::listen(fd, 128) } < 0 {
        return Err(close_on_err(Error::last_os()));
    }

    let r = mkref(fd);
    epoll
        .add(libc::EPOLLIN as u32, r)
        .map_err(close_on_err)?;
    Ok(fd)
}

/// Raw sockaddr storage big enough for either family.
pub union SockaddrAny {
    pub sa: libc::sockaddr,
    pub sa4: libc::sockaddr_in,
    pub sa6: libc::sockaddr_in6,
    pub storage: libc::sockaddr_storage,
}

impl SockaddrAny {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    /// Decode into (address, port), if the family is one we speak.
    pub fn to_addr(&self) -> Option<(IpAddr, u16)> {
        unsafe {
            match self.sa.sa_family as i32 {
                libc::AF_INET => {
                    let a = Ipv4Addr::from(u32::from_be(self.sa4.sin_addr.s_addr));
                    Some((IpAddr::V4(a), u16::from_be(self.sa4.sin_port)))
                }
                libc::AF_INET6 => {
                    let a = Ipv6Addr::from(self.sa6.sin6_addr.s6_addr);
                    Some((IpAddr::V6(a), u16::from_be(self.sa6.sin6_port)))
                }
                _ => None,
            }
        }
    }
}

/// Encode a socket address for connect/bind/sendto.
pub fn sockaddr_from(addr: &SocketAddr) -> (SockaddrAny, libc::socklen_t) {
    let mut sa = SockaddrAny::zeroed();
    match addr {
        SocketAddr::V4(a) => {
            sa.sa4 = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            (sa, std::mem::size_of::<libc::sockaddr_in>() as u32)
        }
        SocketAddr::V6(a) => {
            sa.sa6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            (sa, std::mem::size_of::<libc::sockaddr_in6>() as u32)
        }
    }
}

pub fn bind_fd(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let (sa, sl) = sockaddr_from(addr);
    if unsafe { libc::bind(fd, &sa.sa, sl) } < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

pub fn bind_to_device(fd: RawFd, ifname: &str) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr() as *const libc::c_void,
            ifname.len() as u32,
        )
    };
    if ret < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

/// Request large socket buffers, unless the probed limits are low.
pub fn sock_set_bufsize(fd: RawFd, low_rmem: bool, low_wmem: bool) {
    let v = SOCK_BUF_SIZE;
    unsafe {
        if !low_rmem {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &v as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            );
        }
        if !low_wmem {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &v as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_local_derivation() {
        let ll = link_local_for(&"2001:db8::1:2".parse().unwrap());
        assert!(is_link_local(&ll));
        // Already link-local stays untouched
        let a: Ipv6Addr = "fe80::1234".parse().unwrap();
        assert_eq!(link_local_for(&a), a);
    }

    #[test]
    fn test_sockaddr_round_trip() {
        let addr: SocketAddr = "192.0.2.5:40000".parse().unwrap();
        let (sa, _) = sockaddr_from(&addr);
        assert_eq!(
            sa.to_addr(),
            Some((addr.ip(), addr.port()))
        );

        let addr6: SocketAddr = "[2001:db8::7]:443".parse().unwrap();
        let (sa6, _) = sockaddr_from(&addr6);
        assert_eq!(sa6.to_addr(), Some((addr6.ip(), addr6.port())));
    }
}
