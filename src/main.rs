use clap::Parser;
use std::path::PathBuf;
use tapnat::config::{self, Mode, Options};
use tapnat::ctx::Ctx;
use tapnat::dataplane::{fwd, icmp, tcp, tcp_splice, udp};
use tapnat::event::{EpollRef, FdKind};
use tapnat::telemetry::init_logging;
use tapnat::util::Stamp;
use tapnat::{tap, Error};
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "tapnat")]
#[command(about = "User-space tap-to-socket network translator")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket path for the tap stream (stream mode)
    #[arg(short = 's', long)]
    socket: Option<String>,

    /// Attach to a network namespace: PID or path (selects ns mode)
    #[arg(long)]
    netns: Option<String>,

    /// User namespace path to attach before the network namespace
    #[arg(long)]
    userns: Option<String>,

    /// Attach the network namespace only, no user namespace
    #[arg(long)]
    netns_only: bool,

    /// Tap interface name inside the namespace
    #[arg(short = 'i', long)]
    ifname: Option<String>,

    /// Exit once the first tap client disconnects
    #[arg(long)]
    one_off: bool,

    /// IPv4 address the guest uses
    #[arg(long)]
    addr: Option<std::net::Ipv4Addr>,

    /// IPv4 gateway address
    #[arg(long)]
    gw: Option<std::net::Ipv4Addr>,

    /// IPv4 DNS server presented via redirection
    #[arg(long)]
    dns: Option<std::net::Ipv4Addr>,

    /// IPv6 address the guest uses
    #[arg(long)]
    addr6: Option<std::net::Ipv6Addr>,

    /// IPv6 gateway address
    #[arg(long)]
    gw6: Option<std::net::Ipv6Addr>,

    /// IPv6 DNS server presented via redirection
    #[arg(long)]
    dns6: Option<std::net::Ipv6Addr>,

    /// Never map the gateway address to the host
    #[arg(long)]
    no_map_gw: bool,

    /// Inbound TCP ports: none, auto, all, or a spec like "22,80:8080"
    #[arg(short = 't', long)]
    tcp_in: Option<String>,

    /// Outbound TCP ports bound in the namespace (ns mode)
    #[arg(short = 'T', long)]
    tcp_out: Option<String>,

    /// Inbound UDP ports
    #[arg(short = 'u', long)]
    udp_in: Option<String>,

    /// Outbound UDP ports (ns mode)
    #[arg(short = 'U', long)]
    udp_out: Option<String>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: pretty, compact, json
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    fn into_options(self) -> Result<Options, Error> {
        let mut opts = Options {
            socket_path: self.socket,
            userns: self.userns,
            netns_only: self.netns_only,
            one_off: self.one_off,
            addr4: self.addr,
            gw4: self.gw,
            dns4: self.dns,
            addr6: self.addr6,
            gw6: self.gw6,
            dns6: self.dns6,
            no_map_gw: self.no_map_gw,
            log_level: self.log_level,
            log_format: self.log_format,
            ..Options::default()
        };
        if let Some(netns) = self.netns {
            opts.mode = Mode::Ns;
            opts.netns = Some(netns);
            opts.ifname = "tap0".into();
        }
        if let Some(ifname) = self.ifname {
            opts.ifname = ifname;
        }
        if let Some(s) = self.tcp_in {
            opts.tcp_in = s;
        }
        if let Some(s) = self.tcp_out {
            opts.tcp_out = s;
        }
        if let Some(s) = self.udp_in {
            opts.udp_in = s;
        }
        if let Some(s) = self.udp_out {
            opts.udp_out = s;
        }

        if let Some(path) = self.config {
            let file = config::load(&path)?;
            opts.merge_file(&file)?;
        }
        opts.validate()?;
        Ok(opts)
    }
}

fn main() {
    let cli = Cli::parse();
    let opts = match cli.into_options() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("[ERROR] {e}");
            std::process::exit(1);
        }
    };

    init_logging(opts.log_level.as_deref(), opts.log_format.as_deref());

    let mut ctx = match Ctx::new(opts) {
        Ok(c) => c,
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = setup(&mut ctx) {
        error!("startup failed: {e}");
        std::process::exit(1);
    }

    match run(&mut ctx) {
        Ok(()) | Err(Error::NamespaceGone) => {
            info!("done");
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

/// Bring up the tap transport, forwarding maps, sockets and frame buffers.
fn setup(ctx: &mut Ctx) -> Result<(), Error> {
    // Forwarding configuration first, everything below binds from it
    let (tcp_in, tcp_out, udp_in, udp_out) = (
        ctx.opts.tcp_in.clone(),
        ctx.opts.tcp_out.clone(),
        ctx.opts.udp_in.clone(),
        ctx.opts.udp_out.clone(),
    );
    fwd::parse_spec(&tcp_in, &mut ctx.tcp.fwd_in)?;
    fwd::parse_spec(&tcp_out, &mut ctx.tcp.fwd_out)?;
    fwd::parse_spec(&udp_in, &mut ctx.udp.fwd_in)?;
    fwd::parse_spec(&udp_out, &mut ctx.udp.fwd_out)?;
    ctx.tcp.fwd_in.invert_portmap();
    ctx.tcp.fwd_out.invert_portmap();
    ctx.udp.fwd_in.invert_portmap();
    ctx.udp.fwd_out.invert_portmap();

    tcp::init_buffers(&mut ctx.tcp, ctx.mac_guest, ctx.mac);
    udp::init_buffers(&mut ctx.udp, ctx.mac_guest, ctx.mac);

    match ctx.mode {
        Mode::Stream => {
            let (fd, path) = tap::stream::sock_unix_open(ctx.opts.socket_path.as_deref())?;
            ctx.tap.fd_listen = fd;
            ctx.tap.sock_path = Some(path);
            let r = EpollRef::new(FdKind::TapListen, fd, 0);
            ctx.epoll.add(libc::EPOLLIN as u32, r)?;
        }
        Mode::Ns => {
            let netns = ctx.opts.netns.clone().unwrap();
            let userns = ctx.opts.userns.clone();
            let netns_only = ctx.opts.netns_only;
            ctx.netns.open(&netns, userns.as_deref(), netns_only)?;
            ctx.netns.quit_watch_init(&ctx.epoll)?;

            // The tuntap device lives in the peer namespace; the shared fd
            // table makes the descriptor ours once the child returns
            let ifname = ctx.opts.ifname.clone();
            let mut tap_fd = -1;
            ctx.netns.call(|| {
                tap_fd = tap::tun::tun_open(&ifname).unwrap_or(-1);
            })?;
            if tap_fd < 0 {
                return Err(Error::Config(format!("can't open tap device {ifname}")));
            }
            ctx.tap.fd = tap_fd;
            let r = EpollRef::new(FdKind::TapNs, tap_fd, 0);
            ctx.epoll.add(libc::EPOLLIN as u32, r)?;
            info!("attached to namespace, tap device {ifname}");
        }
    }

    // Initial AUTO scans populate the maps before the first binds
    fwd::auto_rescan(ctx);

    tcp::sock_init_host(ctx);
    let host_udp_ports: Vec<u16> = ctx.udp.fwd_in.map.iter_set().collect();
    for port in host_udp_ports {
        udp::sock_init(ctx, false, port);
    }

    if ctx.mode == Mode::Ns {
        let tcp_ns_ports: Vec<u16> = ctx.tcp.fwd_out.map.iter_set().collect();
        let udp_ns_ports: Vec<u16> = ctx.udp.fwd_out.map.iter_set().collect();
        let (nfd, ufd) = ctx.netns.fds();
        tapnat::netns::call_raw(nfd, ufd, || {
            for &port in &tcp_ns_ports {
                tcp::ns_sock_init_port(ctx, port);
            }
            for &port in &udp_ns_ports {
                udp::sock_init(ctx, true, port);
            }
        })?;
    }

    tcp::sock_pool_refill(ctx);
    info!("ready");
    Ok(())
}

/// The event loop: wait, dispatch by reference kind, run the deferred
/// handlers, then the periodic ones.
fn run(ctx: &mut Ctx) -> Result<(), Error> {
    const MAX_EVENTS: usize = 128;
    const PERIODIC_INTERVAL_MS: i64 = 1000;

    let mut events =
        [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    let mut last_periodic = Stamp::now();

    loop {
        let n = ctx.epoll.wait(&mut events, PERIODIC_INTERVAL_MS as i32)?;
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
                FdKind::TapListen => tap::listen_handler(ctx),
                FdKind::TapNs => tap::handler_ns(ctx, ev.events, now)?,
                FdKind::NsQuitInotify => ctx.netns.quit_inotify_handler()?,
                FdKind::NsQuitTimer => ctx.netns.quit_timer_handler()?,
            }
        }

        // Deferred: flush staged tap frames, then collect closed flows and
        // run per-flow timers
        tcp::defer_flush(ctx);
        let tapnat::ctx::Ctx { flows, icmp, .. } = ctx;
        flows.defer_pass(now, icmp);

        if now.diff_ms(&last_periodic) >= PERIODIC_INTERVAL_MS {
            last_periodic = now;
            udp::timer(ctx, now);
            tcp::sock_pool_refill(ctx);
            if ctx.tcp.fwd_in.mode == fwd::FwdMode::Auto
                || ctx.tcp.fwd_out.mode == fwd::FwdMode::Auto
                || ctx.udp.fwd_in.mode == fwd::FwdMode::Auto
                || ctx.udp.fwd_out.mode == fwd::FwdMode::Auto
            {
                fwd::auto_rescan(ctx);
            }
            debug!(flows = ctx.flows.active_count(), "{}", ctx.stats.summary());
        }
    }
}
