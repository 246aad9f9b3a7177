//! UDP ephemeral bindings over the stream tap: the guest's first datagram
//! from a source port opens a socket bound to it, replies come back as tap
//! frames with the reverse rewrite applied.

use std::io::Read;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tapnat::config::Options;
use tapnat::ctx::Ctx;
use tapnat::dataplane::{icmp, tcp, udp};
use tapnat::event::{EpollRef, FdKind};
use tapnat::protocol::checksum;
use tapnat::tap;
use tapnat::util::Stamp;

const GUEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const GW: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);

fn test_ctx() -> (Ctx, UnixStream) {
    let opts = Options {
        addr4: Some(GUEST),
        gw4: Some(GW),
        ..Default::default()
    };
    let mut ctx = Ctx::new(opts).unwrap();
    tcp::init_buffers(&mut ctx.tcp, ctx.mac_guest, ctx.mac);
    udp::init_buffers(&mut ctx.udp, ctx.mac_guest, ctx.mac);

    let (ours, theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let fd = std::os::unix::io::IntoRawFd::into_raw_fd(ours);
    ctx.tap.fd = fd;
    let r = EpollRef::new(FdKind::TapStream, fd, 0);
    ctx.epoll
        .add((libc::EPOLLIN | libc::EPOLLRDHUP) as u32, r)
        .unwrap();
    theirs
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    (ctx, theirs)
}

fn drive(ctx: &mut Ctx, timeout_ms: i32) {
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 32];
    let n = ctx.epoll.wait(&mut events, timeout_ms).unwrap();
    let now = Stamp::now();
    for ev in events.iter().take(n) {
        let Some(r) = EpollRef::from_u64(ev.u64) else {
            continue;
        };
        match r.kind {
            FdKind::Udp => udp::sock_handler(ctx, r, ev.events, now),
            FdKind::Ping => icmp::sock_handler(ctx, r, now),
            FdKind::TapStream => tap::handler_stream(ctx, ev.events, now),
            FdKind::Tcp => tcp::sock_handler(ctx, r, ev.events),
            _ => {}
        }
    }
    tcp::defer_flush(ctx);
    let tapnat::ctx::Ctx { flows, icmp, .. } = ctx;
    flows.defer_pass(now, icmp);
}

fn udp_frame(sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut u = vec![0u8; 8];
    u[0..2].copy_from_slice(&sport.to_be_bytes());
    u[2..4].copy_from_slice(&dport.to_be_bytes());
    u[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    u.extend_from_slice(payload);
    let csum = checksum::l4(
        checksum::pseudo_v4(GUEST, dst, 17, u.len() as u16),
        &u,
    );
    u[6..8].copy_from_slice(&csum.to_be_bytes());

    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((20 + u.len()) as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&GUEST.octets());
    ip[16..20].copy_from_slice(&dst.octets());
    let c = checksum::ipv4_header(&ip);
    ip[10..12].copy_from_slice(&c.to_be_bytes());
    ip.extend_from_slice(&u);

    let mut f = Vec::new();
    f.extend_from_slice(&[0x9a, 0x55, 0x9a, 0x55, 0x9a, 0x55]);
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x07]);
    f.extend_from_slice(&0x0800u16.to_be_bytes());
    f.extend_from_slice(&ip);
    f
}

fn send_tap_frame(tap: &mut UnixStream, frame: &[u8]) {
    use std::io::Write;
    tap.write_all(&(frame.len() as u32).to_be_bytes()).unwrap();
    tap.write_all(frame).unwrap();
}

fn recv_tap_frame(tap: &mut UnixStream) -> Option<Vec<u8>> {
    let mut len = [0u8; 4];
    tap.read_exact(&mut len).ok()?;
    let len = u32::from_be_bytes(len) as usize;
    let mut frame = vec![0u8; len];
    tap.read_exact(&mut frame).ok()?;
    Some(frame)
}

/// Guest datagram to the gateway address lands on the host loopback; the
/// reply returns as a frame with source rewritten back to the gateway.
#[test]
fn ephemeral_binding_round_trip() {
    let (mut ctx, mut tap_peer) = test_ctx();

    let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    server
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let port = server.local_addr().unwrap().port();

    send_tap_frame(
        &mut tap_peer,
        &udp_frame(55000, GW, port, b"query"),
    );

    // The binding opens and the datagram arrives on the server
    let mut buf = [0u8; 64];
    let (n, from) = {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            drive(&mut ctx, 50);
            match server.recv_from(&mut buf) {
                Ok(v) => break v,
                Err(_) if Instant::now() < deadline => continue,
                Err(e) => panic!("server never saw the datagram: {e}"),
            }
        }
    };
    assert_eq!(&buf[..n], b"query");
    assert_eq!(from.port(), 55000);

    // Reply goes back through the bound socket and onto the tap
    server.send_to(b"reply", from).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let frame = loop {
        drive(&mut ctx, 50);
        if let Some(f) = recv_tap_frame(&mut tap_peer) {
            break f;
        }
        assert!(Instant::now() < deadline, "no reply frame on tap");
    };

    // Ethernet + IPv4 + UDP, loopback source reflected to the gateway
    assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), 0x0800);
    let ip = &frame[14..];
    assert_eq!(ip[9], 17);
    assert_eq!(Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]), GW);
    assert_eq!(Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]), GUEST);
    let udp_part = &ip[20..];
    assert_eq!(u16::from_be_bytes([udp_part[0], udp_part[1]]), port);
    assert_eq!(u16::from_be_bytes([udp_part[2], udp_part[3]]), 55000);
    assert_eq!(&udp_part[8..13], b"reply");
}

/// Datagrams from two guest source ports get two distinct bindings.
#[test]
fn distinct_source_ports_distinct_bindings() {
    let (mut ctx, mut tap_peer) = test_ctx();

    let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    server
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let port = server.local_addr().unwrap().port();

    send_tap_frame(&mut tap_peer, &udp_frame(50001, GW, port, b"a"));
    send_tap_frame(&mut tap_peer, &udp_frame(50002, GW, port, b"b"));

    let mut sources = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while sources.len() < 2 && Instant::now() < deadline {
        drive(&mut ctx, 50);
        let mut buf = [0u8; 16];
        while let Ok((_, from)) = server.recv_from(&mut buf) {
            sources.push(from.port());
        }
    }
    sources.sort_unstable();
    assert_eq!(sources, vec![50001, 50002]);
}
