//! Stream-mode TCP translation, driven over a socketpair standing in for
//! the hypervisor: guest frames go in with length prefixes, translated
//! frames come back out the same way.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tapnat::config::Options;
use tapnat::ctx::Ctx;
use tapnat::dataplane::{icmp, tcp, tcp_splice, udp};
use tapnat::event::{EpollRef, FdKind};
use tapnat::protocol::checksum;
use tapnat::tap;
use tapnat::util::Stamp;

const GUEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const GW: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
const GUEST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

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

/// One pass of the event loop, mirroring the dispatch in the binary.
fn drive(ctx: &mut Ctx, timeout_ms: i32) {
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 32];
    let n = ctx.epoll.wait(&mut events, timeout_ms).unwrap();
    let now = Stamp::now();
    for ev in events.iter().take(n) {
        let Some(r) = EpollRef::from_u64(ev.u64) else {
            continue;
        };
        match r.kind {
            FdKind::Tcp => tcp::sock_handler(ctx, r, ev.events),
            FdKind::TcpSplice => tcp_splice::sock_handler(ctx, r, ev.events, now),
            FdKind::TcpListen => tcp::listen_handler(ctx, r, now),
            FdKind::TcpTimer => tcp::timer_handler(ctx, r),
            FdKind::Udp => udp::sock_handler(ctx, r, ev.events, now),
            FdKind::Ping => icmp::sock_handler(ctx, r, now),
            FdKind::TapStream => tap::handler_stream(ctx, ev.events, now),
            _ => {}
        }
    }
    tcp::defer_flush(ctx);
    let tapnat::ctx::Ctx { flows, icmp, .. } = ctx;
    flows.defer_pass(now, icmp);
}

fn eth_frame(payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0x9a, 0x55, 0x9a, 0x55, 0x9a, 0x55]); // to the translator
    f.extend_from_slice(&GUEST_MAC);
    f.extend_from_slice(&0x0800u16.to_be_bytes());
    f.extend_from_slice(payload);
    f
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, l4: &[u8]) -> Vec<u8> {
    let mut p = vec![0u8; 20];
    p[0] = 0x45;
    let total = 20 + l4.len() as u16;
    p[2..4].copy_from_slice(&total.to_be_bytes());
    p[6] = 0x40; // DF
    p[8] = 64;
    p[9] = proto;
    p[12..16].copy_from_slice(&src.octets());
    p[16..20].copy_from_slice(&dst.octets());
    let csum = checksum::ipv4_header(&p);
    p[10..12].copy_from_slice(&csum.to_be_bytes());
    p.extend_from_slice(l4);
    p
}

#[allow(clippy::too_many_arguments)]
fn tcp_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    wnd: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut t = vec![0u8; 20];
    t[0..2].copy_from_slice(&sport.to_be_bytes());
    t[2..4].copy_from_slice(&dport.to_be_bytes());
    t[4..8].copy_from_slice(&seq.to_be_bytes());
    t[8..12].copy_from_slice(&ack.to_be_bytes());
    t[12] = 5 << 4;
    t[13] = flags;
    t[14..16].copy_from_slice(&wnd.to_be_bytes());
    t.extend_from_slice(payload);
    let csum = checksum::l4(
        checksum::pseudo_v4(src, dst, 6, t.len() as u16),
        &t,
    );
    t[16..18].copy_from_slice(&csum.to_be_bytes());
    t
}

fn send_tap_frame(tap: &mut UnixStream, frame: &[u8]) {
    tap.write_all(&(frame.len() as u32).to_be_bytes()).unwrap();
    tap.write_all(frame).unwrap();
}

/// Read one length-prefixed frame off the tap, if any arrives in time.
fn recv_tap_frame(tap: &mut UnixStream) -> Option<Vec<u8>> {
    let mut len = [0u8; 4];
    tap.read_exact(&mut len).ok()?;
    let len = u32::from_be_bytes(len) as usize;
    let mut frame = vec![0u8; len];
    tap.read_exact(&mut frame).ok()?;
    Some(frame)
}

struct ParsedTcp {
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: Vec<u8>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

fn parse_tcp_frame(frame: &[u8]) -> Option<ParsedTcp> {
    if frame.len() < 14 + 20 + 20 || u16::from_be_bytes([frame[12], frame[13]]) != 0x0800 {
        return None;
    }
    let ip = &frame[14..];
    let ihl = ((ip[0] & 0xf) * 4) as usize;
    if ip[9] != 6 {
        return None;
    }
    let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    let t = &ip[ihl..total];
    let doff = ((t[12] >> 4) * 4) as usize;
    Some(ParsedTcp {
        sport: u16::from_be_bytes([t[0], t[1]]),
        dport: u16::from_be_bytes([t[2], t[3]]),
        seq: u32::from_be_bytes([t[4], t[5], t[6], t[7]]),
        ack: u32::from_be_bytes([t[8], t[9], t[10], t[11]]),
        flags: t[13],
        payload: t[doff..].to_vec(),
        src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
        dst: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
    })
}

const SYN: u8 = 0x02;
const ACK: u8 = 0x10;
const PSH: u8 = 0x08;

/// Guest connects out through the gateway address; the translator maps it to
/// loopback, completes the handshake, and relays data both ways.
#[test]
fn outbound_connection_handshake_and_echo() {
    let (mut ctx, mut tap_peer) = test_ctx();

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    // Guest SYN toward the gateway: destination maps to 127.0.0.1
    let syn = tcp_segment(GUEST, GW, 40000, port, 1000, 0, SYN, 65535, &[]);
    send_tap_frame(&mut tap_peer, &eth_frame(&ipv4_packet(GUEST, GW, 6, &syn)));

    // SYN is processed, connect() races the loop; drive until SYN,ACK
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut synack = None;
    while Instant::now() < deadline && synack.is_none() {
        drive(&mut ctx, 50);
        if let Some(frame) = recv_tap_frame(&mut tap_peer) {
            synack = parse_tcp_frame(&frame);
        }
    }
    let synack = synack.expect("no SYN,ACK from translator");
    assert_eq!(synack.flags & (SYN | ACK), SYN | ACK);
    assert_eq!(synack.src, GW);
    assert_eq!(synack.dst, GUEST);
    assert_eq!(synack.sport, port);
    assert_eq!(synack.dport, 40000);
    assert_eq!(synack.ack, 1001);

    let (mut server, _) = listener.accept().expect("no connection on listener");
    server.set_nonblocking(false).unwrap();
    server
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    // Guest completes the handshake, then pushes data in its own segment
    let payload = b"hello through the tap";
    let ack_seq = synack.seq.wrapping_add(1);
    let bare_ack = tcp_segment(GUEST, GW, 40000, port, 1001, ack_seq, ACK, 65535, &[]);
    send_tap_frame(
        &mut tap_peer,
        &eth_frame(&ipv4_packet(GUEST, GW, 6, &bare_ack)),
    );
    drive(&mut ctx, 50);

    let data = tcp_segment(
        GUEST,
        GW,
        40000,
        port,
        1001,
        ack_seq,
        ACK | PSH,
        65535,
        payload,
    );
    send_tap_frame(&mut tap_peer, &eth_frame(&ipv4_packet(GUEST, GW, 6, &data)));

    let mut got = vec![0u8; payload.len()];
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        drive(&mut ctx, 50);
        match server.read_exact(&mut got) {
            Ok(()) => break,
            Err(_) if Instant::now() < deadline => continue,
            Err(e) => panic!("server never saw guest data: {e}"),
        }
    }
    assert_eq!(&got, payload);

    // Server answers; the translator mirrors it onto the tap with the
    // server's bytes and a growing sequence
    server.write_all(b"pong").unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut reply = None;
    while Instant::now() < deadline && reply.is_none() {
        drive(&mut ctx, 50);
        if let Some(frame) = recv_tap_frame(&mut tap_peer) {
            let p = parse_tcp_frame(&frame).unwrap();
            if !p.payload.is_empty() {
                reply = Some(p);
            }
        }
    }
    let reply = reply.expect("no data frame toward guest");
    assert_eq!(reply.payload, b"pong");
    assert_eq!(reply.seq, ack_seq);
    assert_eq!(reply.ack, 1001 + payload.len() as u32);
}

/// SYNs to ports nothing listens on answer with RST, not silence.
#[test]
fn outbound_connection_refused_resets() {
    let (mut ctx, mut tap_peer) = test_ctx();

    // Grab an ephemeral port and close it so nothing listens there
    let port = {
        let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        l.local_addr().unwrap().port()
    };

    let syn = tcp_segment(GUEST, GW, 41000, port, 7, 0, SYN, 1024, &[]);
    send_tap_frame(&mut tap_peer, &eth_frame(&ipv4_packet(GUEST, GW, 6, &syn)));

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut rst_seen = false;
    while Instant::now() < deadline && !rst_seen {
        drive(&mut ctx, 50);
        if let Some(frame) = recv_tap_frame(&mut tap_peer) {
            let p = parse_tcp_frame(&frame).unwrap();
            rst_seen = p.flags & 0x04 != 0;
        }
    }
    assert!(rst_seen, "expected RST for refused connection");
}

/// Sockets stay below the 24-bit reference limit by construction; the claim
/// gate reports anything else as an error without registering it.
#[test]
fn fd_claim_gate() {
    let fd: RawFd = unsafe { libc::dup(0) };
    assert!(tapnat::event::claim_fd(fd).is_ok());
    unsafe { libc::close(fd) };
    assert!(tapnat::event::claim_fd(-1).is_err());
}
