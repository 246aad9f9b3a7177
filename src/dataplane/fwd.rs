//! Forwarded-port configuration and discovery
//!
//! Each direction (inbound toward the tap, outbound from it) carries a mode,
//! a bitmap of forwarded ports, and a per-port remap delta. Deltas are stored
//! as wrapping 16-bit offsets; the reverse map is precomputed so that
//! `rdelta[p + delta[p]] == -delta[p] (mod 2^16)` and the remap is an
//! involution.
//!
//! AUTO mode discovers ports by scanning `/proc/net/{tcp,tcp6,udp,udp6}`
//! (with the namespace's own procfs for the outbound direction) for sockets
//! in TCP listening or UDP unconnected-bound state.

use crate::util::PortBitmap;
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use tracing::warn;

/// TCP_LISTEN in the kernel's tcp_states.h
const TCP_STATE_LISTEN: u32 = 0x0a;
/// TCP_CLOSE, which is how an unconnected bound UDP socket shows up
const UDP_STATE_UNCONNECTED: u32 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FwdMode {
    #[default]
    None,
    Spec,
    Auto,
    All,
}

/// Port map for one protocol and direction.
pub struct FwdPorts {
    pub mode: FwdMode,
    pub map: PortBitmap,
    pub delta: Box<[u16; 65536]>,
    pub rdelta: Box<[u16; 65536]>,
}

impl Default for FwdPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl FwdPorts {
    pub fn new() -> Self {
        Self {
            mode: FwdMode::None,
            map: PortBitmap::new(),
            delta: vec![0u16; 65536].into_boxed_slice().try_into().unwrap(),
            rdelta: vec![0u16; 65536].into_boxed_slice().try_into().unwrap(),
        }
    }

    /// Forward a port in SPEC mode, optionally remapped to `target`.
    pub fn add(&mut self, port: u16, target: Option<u16>) {
        self.map.set(port);
        if let Some(t) = target {
            self.delta[port as usize] = t.wrapping_sub(port);
        }
    }

    /// Precompute the reverse map from the forward deltas.
    pub fn invert_portmap(&mut self) {
        for port in 0..=65535u16 {
            let delta = self.delta[port as usize];
            if delta != 0 {
                let mapped = port.wrapping_add(delta);
                self.rdelta[mapped as usize] = delta.wrapping_neg();
            }
        }
    }

    /// Destination port after the forward remap.
    pub fn remap(&self, port: u16) -> u16 {
        port.wrapping_add(self.delta[port as usize])
    }

    /// Source port after the reverse remap.
    pub fn remap_back(&self, port: u16) -> u16 {
        port.wrapping_add(self.rdelta[port as usize])
    }
}

/// Parse a forwarded-port specification: `none`, `auto`, `all`, or a
/// comma-separated list of ports and ranges with optional remap targets,
/// e.g. `22`, `22:2222`, `2000-2010`, `2000-2010:3000`.
pub fn parse_spec(spec: &str, fwd: &mut FwdPorts) -> Result<()> {
    match spec {
        "none" => {
            fwd.mode = FwdMode::None;
            return Ok(());
        }
        "auto" => {
            fwd.mode = FwdMode::Auto;
            return Ok(());
        }
        "all" => {
            fwd.mode = FwdMode::All;
            for port in 1..=65535u16 {
                fwd.map.set(port);
            }
            return Ok(());
        }
        _ => {}
    }

    fwd.mode = FwdMode::Spec;
    for part in spec.split(',') {
        let (range, target) = match part.split_once(':') {
            Some((r, t)) => {
                let t: u16 = t
                    .parse()
                    .map_err(|_| Error::Config(format!("bad target port in '{part}'")))?;
                (r, Some(t))
            }
            None => (part, None),
        };

        let (lo, hi) = match range.split_once('-') {
            Some((a, b)) => {
                let lo: u16 = a
                    .parse()
                    .map_err(|_| Error::Config(format!("bad port in '{part}'")))?;
                let hi: u16 = b
                    .parse()
                    .map_err(|_| Error::Config(format!("bad port in '{part}'")))?;
                if hi < lo {
                    return Err(Error::Config(format!("reversed range '{part}'")));
                }
                (lo, hi)
            }
            None => {
                let p: u16 = range
                    .parse()
                    .map_err(|_| Error::Config(format!("bad port in '{part}'")))?;
                (p, p)
            }
        };

        for (i, port) in (lo..=hi).enumerate() {
            fwd.add(port, target.map(|t| t + i as u16));
        }
    }
    Ok(())
}

/// Cached procfs handles for the periodic AUTO-mode scans, one per
/// (protocol, version, namespace) combination.
#[derive(Default)]
pub struct ProcScanner {
    files: [[Option<File>; 2]; 4],
}

impl ProcScanner {
    fn slot(proto_udp: bool, v6: bool) -> usize {
        (proto_udp as usize) << 1 | v6 as usize
    }

    /// Scan one procfs socket table, setting bits for listening/bound ports.
    /// Ports set in `exclude` are cleared instead, so the opposite direction's
    /// forwards don't loop back.
    pub fn scan(
        &mut self,
        proto_udp: bool,
        v6: bool,
        ns: bool,
        map: &mut PortBitmap,
        exclude: &PortBitmap,
    ) {
        let path = match (proto_udp, v6) {
            (false, false) => "/proc/net/tcp",
            (false, true) => "/proc/net/tcp6",
            (true, false) => "/proc/net/udp",
            (true, true) => "/proc/net/udp6",
        };
        let want_state = if proto_udp {
            UDP_STATE_UNCONNECTED
        } else {
            TCP_STATE_LISTEN
        };

        let slot = &mut self.files[Self::slot(proto_udp, v6)][ns as usize];
        if slot.is_none() {
            // In namespace context the caller has already entered the netns,
            // so the same path refers to the peer's table; the fd stays valid
            // for that namespace afterwards.
            match File::open(path) {
                Ok(f) => *slot = Some(f),
                Err(_) => return,
            }
        }
        let file = slot.as_mut().unwrap();
        if let Err(e) = file.seek(SeekFrom::Start(0)) {
            warn!("lseek() failed on {path}: {e}");
            return;
        }

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let _ = reader.read_line(&mut line); // header
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if let Some((port, state)) = parse_proc_net_line(&line) {
                if state != want_state {
                    continue;
                }
                if exclude.isset(port) {
                    map.clear(port);
                } else {
                    map.set(port);
                }
            }
        }
    }
}

/// Pull local port and socket state out of a /proc/net/{tcp,udp}* line:
/// `  sl  local_address rem_address   st ...`
fn parse_proc_net_line(line: &str) -> Option<(u16, u32)> {
    let mut fields = line.split_whitespace();
    let _sl = fields.next()?;
    let local = fields.next()?;
    let _remote = fields.next()?;
    let state = fields.next()?;

    let port_hex = local.rsplit(':').next()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let state = u32::from_str_radix(state, 16).ok()?;
    Some((port, state))
}

/// Refresh AUTO-mode forward maps from procfs and rebind the listening
/// sockets they drive. The outbound direction scans the peer namespace's
/// tables (from inside it); each direction excludes the other's map so
/// forwards can't loop back on themselves.
pub fn auto_rescan(ctx: &mut crate::ctx::Ctx) {
    use crate::config::Mode;

    let tcp_out_auto = ctx.tcp.fwd_out.mode == FwdMode::Auto;
    let udp_out_auto = ctx.udp.fwd_out.mode == FwdMode::Auto;
    let tcp_in_auto = ctx.tcp.fwd_in.mode == FwdMode::Auto;
    let udp_in_auto = ctx.udp.fwd_in.mode == FwdMode::Auto;

    if ctx.mode == Mode::Ns && (tcp_out_auto || udp_out_auto) {
        let (nfd, ufd) = ctx.netns.fds();
        let crate::ctx::Ctx {
            tcp,
            udp,
            fwd_scan,
            ip4,
            ip6,
            ..
        } = ctx;
        let res = crate::netns::call_raw(nfd, ufd, || {
            if tcp_out_auto {
                tcp.fwd_out.map.clear_all();
                if ip4.enabled {
                    fwd_scan.scan(false, false, true, &mut tcp.fwd_out.map, &tcp.fwd_in.map);
                }
                if ip6.enabled {
                    fwd_scan.scan(false, true, true, &mut tcp.fwd_out.map, &tcp.fwd_in.map);
                }
            }
            if udp_out_auto {
                udp.fwd_out.map.clear_all();
                if ip4.enabled {
                    fwd_scan.scan(true, false, true, &mut udp.fwd_out.map, &udp.fwd_in.map);
                    fwd_scan.scan(false, false, true, &mut udp.fwd_out.map, &udp.fwd_in.map);
                }
                if ip6.enabled {
                    fwd_scan.scan(true, true, true, &mut udp.fwd_out.map, &udp.fwd_in.map);
                    fwd_scan.scan(false, true, true, &mut udp.fwd_out.map, &udp.fwd_in.map);
                }
            }
        });
        if res.is_err() {
            warn!("can't scan bound ports in the peer namespace");
        }
    }

    if tcp_in_auto {
        let crate::ctx::Ctx {
            tcp,
            fwd_scan,
            ip4,
            ip6,
            ..
        } = ctx;
        tcp.fwd_in.map.clear_all();
        if ip4.enabled {
            fwd_scan.scan(false, false, false, &mut tcp.fwd_in.map, &tcp.fwd_out.map);
        }
        if ip6.enabled {
            fwd_scan.scan(false, true, false, &mut tcp.fwd_in.map, &tcp.fwd_out.map);
        }
    }
    if udp_in_auto {
        let crate::ctx::Ctx {
            udp,
            fwd_scan,
            ip4,
            ip6,
            ..
        } = ctx;
        udp.fwd_in.map.clear_all();
        if ip4.enabled {
            fwd_scan.scan(true, false, false, &mut udp.fwd_in.map, &udp.fwd_out.map);
            fwd_scan.scan(false, false, false, &mut udp.fwd_in.map, &udp.fwd_out.map);
        }
        if ip6.enabled {
            fwd_scan.scan(true, true, false, &mut udp.fwd_in.map, &udp.fwd_out.map);
            fwd_scan.scan(false, true, false, &mut udp.fwd_in.map, &udp.fwd_out.map);
        }
    }

    if tcp_in_auto {
        tcp_port_rebind(ctx, false);
    }
    if tcp_out_auto {
        let (nfd, ufd) = ctx.netns.fds();
        let _ = crate::netns::call_raw(nfd, ufd, || tcp_port_rebind_inner(ctx, true));
    }
    if udp_in_auto {
        crate::dataplane::udp::port_rebind(ctx, false);
    }
    if udp_out_auto {
        let (nfd, ufd) = ctx.netns.fds();
        let _ =
            crate::netns::call_raw(nfd, ufd, || crate::dataplane::udp::port_rebind(ctx, true));
    }
}

fn tcp_port_rebind(ctx: &mut crate::ctx::Ctx, outbound: bool) {
    tcp_port_rebind_inner(ctx, outbound)
}

/// Open and close TCP listening sockets to match the (re)scanned map. The
/// outbound variant must already be running in the peer namespace.
fn tcp_port_rebind_inner(ctx: &mut crate::ctx::Ctx, outbound: bool) {
    for port in 0..=65535u16 {
        let (fwd, excl) = if outbound {
            (&ctx.tcp.fwd_out, &ctx.tcp.fwd_in)
        } else {
            (&ctx.tcp.fwd_in, &ctx.tcp.fwd_out)
        };
        let want = fwd.map.isset(port) && !excl.map.isset(port);
        let socks = if outbound {
            &mut ctx.tcp.listen_ns
        } else {
            &mut ctx.tcp.listen_host
        };

        if !want {
            for v in 0..2 {
                let fd = socks[port as usize][v];
                if fd >= 0 {
                    ctx.epoll.del(fd);
                    unsafe { libc::close(fd) };
                    socks[port as usize][v] = -1;
                }
            }
            continue;
        }

        let missing = (ctx.ip4.enabled && socks[port as usize][0] == -1)
            || (ctx.ip6.enabled && socks[port as usize][1] == -1);
        if missing {
            if outbound {
                crate::dataplane::tcp::ns_sock_init_port(ctx, port);
            } else {
                crate::dataplane::tcp::sock_init_port(ctx, port);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_range() {
        let mut fwd = FwdPorts::new();
        parse_spec("22,2000-2002", &mut fwd).unwrap();
        assert_eq!(fwd.mode, FwdMode::Spec);
        assert!(fwd.map.isset(22));
        assert!(fwd.map.isset(2000));
        assert!(fwd.map.isset(2002));
        assert!(!fwd.map.isset(2003));
    }

    #[test]
    fn test_remap_involution() {
        let mut fwd = FwdPorts::new();
        parse_spec("22:2222,80:8080,2000-2002:3000", &mut fwd).unwrap();
        fwd.invert_portmap();

        for port in fwd.map.iter_set().collect::<Vec<_>>() {
            let mapped = fwd.remap(port);
            assert_eq!(fwd.remap_back(mapped), port);
            // rdelta[p + delta[p]] = (2^16 - delta[p]) mod 2^16
            let delta = fwd.delta[port as usize];
            assert_eq!(fwd.rdelta[mapped as usize], delta.wrapping_neg());
        }
        assert_eq!(fwd.remap(22), 2222);
        assert_eq!(fwd.remap(2001), 3001);
    }

    #[test]
    fn test_parse_modes() {
        let mut fwd = FwdPorts::new();
        parse_spec("auto", &mut fwd).unwrap();
        assert_eq!(fwd.mode, FwdMode::Auto);

        let mut fwd = FwdPorts::new();
        parse_spec("all", &mut fwd).unwrap();
        assert_eq!(fwd.mode, FwdMode::All);
        assert!(fwd.map.isset(443));
        assert!(!fwd.map.isset(0));

        let mut fwd = FwdPorts::new();
        parse_spec("none", &mut fwd).unwrap();
        assert_eq!(fwd.mode, FwdMode::None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut fwd = FwdPorts::new();
        assert!(parse_spec("2010-2000", &mut fwd).is_err());
        assert!(parse_spec("http", &mut fwd).is_err());
        assert!(parse_spec("22:x", &mut fwd).is_err());
    }

    #[test]
    fn test_proc_net_line_parse() {
        let line = "   0: 00000000:0016 00000000:0000 0A 00000000:00000000 \
                    00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0";
        assert_eq!(parse_proc_net_line(line), Some((0x16, 0x0a)));
        assert_eq!(parse_proc_net_line("garbage"), None);
    }
}
