// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rtp2httpd CLI entry point.
//!
//! Parses CLI flags and an optional INI config file, installs the logger,
//! constructs a [`Worker`], and runs the reactor loop until a termination
//! signal arrives. Mirrors the teacher's tool binaries
//! (`tools/hdds-latency-probe/src/main.rs`): `main()` stays a thin
//! parse-then-delegate shim, with `anyhow` only here at the edge to attach
//! context to startup failures before choosing the exit code (§6.3).
//!
//! The reactor loop itself lives here rather than in `worker.rs` because it
//! has to own every socket map (HTTP connections, multicast groups, FCC
//! unicast bursts, RTSP control connections) alongside the `Worker` it
//! drives; splitting that across two files would just move the coupling,
//! not remove it.

use anyhow::Context;
use clap::Parser;
use rtp2httpd::buffer::PacketBuffer;
use rtp2httpd::client::{Client, Engine};
use rtp2httpd::config::{self, Config, GlobalConfig};
use rtp2httpd::control::{self, ControlCommand};
use rtp2httpd::error::{HttpError, UpstreamError};
use rtp2httpd::fcc::{self, FccAction, FccEngine, FccType};
use rtp2httpd::fec::FecGeometry;
use rtp2httpd::http::{self, Request, Route};
use rtp2httpd::ingress::{MulticastIngress, UnicastIngress};
use rtp2httpd::logging::{self, Verbosity};
use rtp2httpd::m3u;
use rtp2httpd::reactor::{SourceKind, TimerKind};
use rtp2httpd::rtsp::{self, RtspAction, RtspEngine, RtspState};
use rtp2httpd::service::Service;
use rtp2httpd::snapshot::{self, SnapshotCapture};
use rtp2httpd::worker::Worker;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

type ClientId = u64;

/// rtp2httpd: multicast-to-unicast IPTV gateway with Fast Channel Change.
#[derive(Parser, Debug)]
#[command(name = "rtp2httpd", version, about)]
struct Cli {
    /// Path to an INI-style config file (§6.3).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[arg(long)]
    listen_addr: Option<String>,

    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    #[arg(long)]
    max_clients: Option<usize>,

    #[arg(long)]
    worker_count: Option<usize>,

    #[arg(long)]
    buffer_pool_max_size: Option<usize>,

    #[arg(long)]
    token: Option<String>,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    udpxy_compat: bool,

    #[arg(long)]
    video_snapshot: bool,

    #[arg(long)]
    ffmpeg_path: Option<String>,

    /// 0 fatal, 1 error, 2 warn, 3 info, 4 debug (§7).
    #[arg(short = 'v', long)]
    verbosity: Option<u8>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("rtp2httpd: fatal: {e:#}");
        std::process::exit(1);
    }
}

/// Overlay CLI flags on top of whatever the config file (or its defaults)
/// already set — only flags the user actually passed take effect (§6.3).
fn apply_cli_overrides(global: &mut GlobalConfig, cli: &Cli) {
    if let Some(addr) = &cli.listen_addr {
        if let Ok(parsed) = addr.parse() {
            global.listen_addr = parsed;
        } else {
            log::warn!("--listen-addr {addr:?} is not an IPv4 address, ignoring");
        }
    }
    if let Some(port) = cli.listen_port {
        global.listen_port = port;
    }
    if let Some(n) = cli.max_clients {
        global.max_clients = n;
    }
    if let Some(n) = cli.worker_count {
        global.worker_count = n;
    }
    if let Some(n) = cli.buffer_pool_max_size {
        global.buffer_pool_max_size = n;
    }
    if let Some(token) = &cli.token {
        global.token = Some(token.clone());
    }
    if let Some(hostname) = &cli.hostname {
        global.hostname = Some(hostname.clone());
    }
    if cli.udpxy_compat {
        global.udpxy_compat = true;
    }
    if cli.video_snapshot {
        global.video_snapshot = true;
    }
    if let Some(path) = &cli.ffmpeg_path {
        global.ffmpeg_path = Some(path.clone());
    }
    if let Some(v) = cli.verbosity {
        global.verbosity = v;
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination_signal(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install SIGTERM/SIGINT handlers that flip a static flag instead of
/// tearing down state from inside the handler (§6.3's graceful-drain exit
/// path has to run on the reactor thread, not a signal stack).
fn install_signal_flag() -> &'static AtomicBool {
    unsafe {
        libc::signal(libc::SIGTERM, handle_termination_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_termination_signal as libc::sighandler_t);
    }
    &SHUTDOWN_REQUESTED
}

/// Whether a forwarded multicast datagram is RTP-framed media (header must
/// be stripped before handing payload to an HTTP client, §6.1) or raw UDP
/// passthrough (the `/udp/` udpxy alias, forwarded byte for byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Rtp,
    Raw,
}

/// One multicast group this worker has joined, fanned out to every client
/// currently subscribed to it (§4.6, §5: "shared by reference with every
/// client's egress queue that needs to forward it").
struct McastGroupEntry {
    ingress: MulticastIngress,
    token: mio::Token,
    framing: Framing,
    subscribers: Vec<ClientId>,
    fec: Option<FecIngress>,
}

/// The FEC parity socket joined alongside a group's media socket, when the
/// service names a sibling `fec_port` (§4.6).
struct FecIngress {
    ingress: MulticastIngress,
    token: mio::Token,
}

/// A client's RTSP control connection and the control-plane state driving
/// it (§4.3).
struct RtspConn {
    stream: mio::net::TcpStream,
    #[allow(dead_code)]
    token: mio::Token,
    url: String,
    read_buf: Vec<u8>,
}

/// What stage a client's `/http/` proxy connection to the upstream server is
/// at (§6.1 "HTTP reverse proxy, with M3U rewrite").
enum HttpProxyPhase {
    /// Connecting or connected but the GET request hasn't been written yet.
    Requesting,
    /// Request sent, waiting for/parsing the response status line and
    /// headers.
    Headers,
    /// Headers parsed, body is not a playlist: forward each chunk straight
    /// to the client as it arrives.
    BodyPassthrough,
    /// Headers parsed, body looks like an M3U playlist: buffer the whole
    /// thing so it can be rewritten as one unit, the same way a local
    /// playlist is (`m3u::rewrite_proxied`).
    BodyBuffered { buf: Vec<u8> },
}

/// A client's outbound connection to an `/http/` proxy target.
struct HttpProxyConn {
    stream: mio::net::TcpStream,
    #[allow(dead_code)]
    token: mio::Token,
    read_buf: Vec<u8>,
    phase: HttpProxyPhase,
    request: Vec<u8>,
    requested_path: String,
    base_url: String,
}

/// Everything a started stream needs beyond the bare `Client` record:
/// joined multicast groups (shared across clients), FCC burst sockets, and
/// RTSP control connections, plus the token<->client reverse maps the
/// dispatch loop needs to route a readiness event back to its owner.
#[derive(Default)]
struct Streaming {
    mcast_groups: HashMap<(Ipv4Addr, u16), McastGroupEntry>,
    mcast_token_key: HashMap<mio::Token, (Ipv4Addr, u16)>,
    fec_token_key: HashMap<mio::Token, (Ipv4Addr, u16)>,
    fcc_unicast: HashMap<ClientId, UnicastIngress>,
    fcc_unicast_token: HashMap<mio::Token, ClientId>,
    rtsp_conns: HashMap<ClientId, RtspConn>,
    rtsp_token_client: HashMap<mio::Token, ClientId>,
    http_proxy_conns: HashMap<ClientId, HttpProxyConn>,
    http_proxy_token_client: HashMap<mio::Token, ClientId>,
    client_http_token: HashMap<ClientId, mio::Token>,
    next_mcast_index: usize,
}

impl Streaming {
    /// Join `group:port` if not already joined, and return its token.
    /// Joining the same group a second time (a second client requesting an
    /// already-live channel) is a no-op at the kernel level and reuses the
    /// existing socket (§8).
    fn ensure_multicast_group(
        &mut self,
        worker: &mut Worker,
        global: &GlobalConfig,
        group: Ipv4Addr,
        port: u16,
        framing: Framing,
        fec_port: Option<u16>,
    ) -> std::io::Result<mio::Token> {
        if let Some(entry) = self.mcast_groups.get(&(group, port)) {
            return Ok(entry.token);
        }
        let mut ingress = MulticastIngress::bind(group, port, global.multicast_interface)?;
        if fec_port.is_some() {
            ingress = ingress.with_fec(FecGeometry::default());
        }
        let token = worker.reactor.allocate_token();
        ingress.register(worker.reactor.registry(), token)?;
        if let Some(secs) = global.multicast_rejoin_interval_secs {
            worker.timers.schedule(
                Duration::from_secs(secs),
                TimerKind::MulticastRejoin { ingress_token: token },
            );
        }

        // The parity socket joins the same group on its own sibling port; a
        // failure here just means this group runs without FEC recovery
        // rather than failing the whole join (§4.6 treats FEC as a loss
        // mitigation, not a hard dependency).
        let fec = match fec_port {
            Some(fport) => match MulticastIngress::bind(group, fport, global.multicast_interface) {
                Ok(mut fec_ingress) => {
                    let ftoken = worker.reactor.allocate_token();
                    match fec_ingress.register(worker.reactor.registry(), ftoken) {
                        Ok(()) => {
                            self.fec_token_key.insert(ftoken, (group, port));
                            Some(FecIngress { ingress: fec_ingress, token: ftoken })
                        }
                        Err(e) => {
                            log::warn!("failed to register fec socket for {group}:{fport}: {e}");
                            None
                        }
                    }
                }
                Err(e) => {
                    log::warn!("failed to bind fec socket for {group}:{fport}: {e}");
                    None
                }
            },
            None => None,
        };

        self.next_mcast_index += 1;
        self.mcast_groups.insert(
            (group, port),
            McastGroupEntry {
                ingress,
                token,
                framing,
                subscribers: Vec::new(),
                fec,
            },
        );
        self.mcast_token_key.insert(token, (group, port));
        Ok(token)
    }

    fn subscribe(&mut self, group: Ipv4Addr, port: u16, client_id: ClientId) {
        if let Some(entry) = self.mcast_groups.get_mut(&(group, port)) {
            if !entry.subscribers.contains(&client_id) {
                entry.subscribers.push(client_id);
            }
        }
    }

    /// Drop `client_id` from every group it subscribed to, tearing down a
    /// group's socket once its last subscriber leaves (§4.1's "same tick"
    /// teardown guarantee, generalized from one client to the shared
    /// group).
    fn unsubscribe_from_all_groups(&mut self, worker: &mut Worker, client_id: ClientId) {
        let mut emptied = Vec::new();
        for (key, entry) in self.mcast_groups.iter_mut() {
            entry.subscribers.retain(|&id| id != client_id);
            if entry.subscribers.is_empty() {
                emptied.push(*key);
            }
        }
        for key in emptied {
            if let Some(mut entry) = self.mcast_groups.remove(&key) {
                let _ = entry.ingress.deregister(worker.reactor.registry());
                self.mcast_token_key.remove(&entry.token);
                if let Some(mut fec) = entry.fec {
                    let _ = fec.ingress.deregister(worker.reactor.registry());
                    self.fec_token_key.remove(&fec.token);
                }
            }
        }
    }

    fn close_fcc_unicast(&mut self, worker: &mut Worker, client_id: ClientId) {
        if let Some(mut unicast) = self.fcc_unicast.remove(&client_id) {
            let _ = unicast.deregister(worker.reactor.registry());
        }
        self.fcc_unicast_token.retain(|_, id| *id != client_id);
    }

    fn close_rtsp(&mut self, worker: &mut Worker, client_id: ClientId) {
        if let Some(mut conn) = self.rtsp_conns.remove(&client_id) {
            let _ = worker.reactor.registry().deregister(&mut conn.stream);
        }
        self.rtsp_token_client.retain(|_, id| *id != client_id);
    }

    fn close_http_proxy(&mut self, worker: &mut Worker, client_id: ClientId) {
        if let Some(mut conn) = self.http_proxy_conns.remove(&client_id) {
            let _ = worker.reactor.registry().deregister(&mut conn.stream);
        }
        self.http_proxy_token_client.retain(|_, id| *id != client_id);
    }

    /// Tear a client all the way down: let its engine emit whatever
    /// clean-up action it needs (FCC leave, RTSP teardown), close every
    /// socket it owns, unsubscribe it from shared multicast groups, and
    /// finally drop the `Client` record itself.
    fn teardown_client(
        &mut self,
        worker: &mut Worker,
        connections: &mut HashMap<mio::Token, mio::net::TcpStream>,
        read_buffers: &mut HashMap<mio::Token, Vec<u8>>,
        sources: &mut HashMap<mio::Token, SourceKind>,
        client_id: ClientId,
    ) {
        if let Some(client) = worker.clients.get_mut(&client_id) {
            match &mut client.engine {
                Engine::Fcc(engine) => {
                    for action in engine.terminate() {
                        if let FccAction::SendLeave { target, group, fcc_type } = action {
                            if let Some(unicast) = self.fcc_unicast.get(&client_id) {
                                let _ = unicast.send_to(&fcc::wire::build_leave(fcc_type, group), target);
                            }
                        }
                    }
                }
                Engine::Rtsp(engine) => {
                    if let Some(RtspAction::SendTeardown { session }) = engine.teardown() {
                        if let Some(conn) = self.rtsp_conns.get_mut(&client_id) {
                            let _ = conn
                                .stream
                                .write_all(&rtsp::wire::build_teardown(&conn.url, &session));
                        }
                    }
                }
                Engine::None => {}
            }
        }

        self.close_fcc_unicast(worker, client_id);
        self.close_rtsp(worker, client_id);
        self.close_http_proxy(worker, client_id);
        self.unsubscribe_from_all_groups(worker, client_id);

        if let Some(token) = self.client_http_token.remove(&client_id) {
            sources.remove(&token);
            read_buffers.remove(&token);
            if let Some(mut stream) = connections.remove(&token) {
                let _ = worker.reactor.registry().deregister(&mut stream);
            }
        }
        worker.remove_client(client_id);
    }
}

/// The supervisor control socket (§6.4): a Unix domain socket accepting
/// short-lived local connections that push `disconnect`/`loglevel`
/// commands and receive periodic status snapshots. Entirely optional —
/// only set up when `control-socket-path` is configured.
#[derive(Default)]
struct ControlState {
    listener: Option<mio::net::UnixListener>,
    listener_token: Option<mio::Token>,
    conns: HashMap<mio::Token, mio::net::UnixStream>,
    bufs: HashMap<mio::Token, Vec<u8>>,
}

/// Bind the control socket, removing a stale socket file left behind by a
/// prior crashed worker first (binding to an existing path otherwise fails
/// with `AddrInUse`).
fn bind_control_socket(worker: &mut Worker, path: &str) -> std::io::Result<(mio::net::UnixListener, mio::Token)> {
    let _ = std::fs::remove_file(path);
    let mut listener = mio::net::UnixListener::bind(path)?;
    let token = worker.reactor.allocate_token();
    worker.reactor.registry().register(&mut listener, token, mio::Interest::READABLE)?;
    Ok((listener, token))
}

/// Accept every pending control connection this tick (§6.4).
fn accept_control_connections(control: &mut ControlState, worker: &mut Worker) {
    let Some(listener) = &control.listener else {
        return;
    };
    loop {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                let token = worker.reactor.allocate_token();
                if let Err(e) = worker.reactor.registry().register(&mut stream, token, mio::Interest::READABLE) {
                    log::debug!("failed to register control connection: {e}");
                    continue;
                }
                control.conns.insert(token, stream);
                control.bufs.insert(token, Vec::new());
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                log::debug!("control socket accept error: {e}");
                break;
            }
        }
    }
}

/// Read and apply whatever newline-terminated commands have arrived on one
/// control connection, returning `true` if the connection should be torn
/// down (peer closed or errored).
fn dispatch_control(
    control: &mut ControlState,
    streaming: &mut Streaming,
    worker: &mut Worker,
    connections: &mut HashMap<mio::Token, mio::net::TcpStream>,
    read_buffers: &mut HashMap<mio::Token, Vec<u8>>,
    sources: &mut HashMap<mio::Token, SourceKind>,
    token: mio::Token,
) -> bool {
    let mut scratch = [0u8; 1024];
    let mut closed = false;
    loop {
        let Some(stream) = control.conns.get_mut(&token) else {
            return true;
        };
        match stream.read(&mut scratch) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => {
                control.bufs.entry(token).or_default().extend_from_slice(&scratch[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => {
                closed = true;
                break;
            }
        }
    }

    let buf = control.bufs.entry(token).or_default();
    while let Some(newline) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=newline).collect();
        let Ok(line) = std::str::from_utf8(&line) else {
            continue;
        };
        match control::parse_command(line) {
            Some(ControlCommand::ForceDisconnectClient { client_id }) => {
                log::info!("control socket: force-disconnecting client {client_id}");
                streaming.teardown_client(worker, connections, read_buffers, sources, client_id);
            }
            Some(ControlCommand::SetLogLevel { verbosity }) => {
                log::info!("control socket: setting log level to {verbosity}");
                worker.set_log_level(Verbosity(verbosity));
            }
            None => log::debug!("control socket: ignoring malformed command {line:?}"),
        }
    }

    closed
}

/// Build this worker's current status snapshot (§6.4).
fn build_status_snapshot(worker: &Worker) -> control::StatusSnapshot {
    control::StatusSnapshot {
        worker_pid: worker.pid,
        verbosity: worker.log_level,
        pool: worker.buffer_pool.stats(),
        clients: worker
            .clients
            .values()
            .map(|c| control::ClientStatusRow {
                client_id: c.id,
                remote_addr: c.remote_addr.to_string(),
                bytes_sent: c.bytes_sent,
                bandwidth_bits_per_second: c.bandwidth.bits_per_second(),
                slow: c.slow,
                backpressure_events: c.backpressure_events,
            })
            .collect(),
    }
}

/// Push the current status snapshot to every connected control client,
/// dropping any that error on write (§6.4).
fn push_status_to_control_clients(control: &mut ControlState, worker: &Worker) {
    if control.conns.is_empty() {
        return;
    }
    let rendered = build_status_snapshot(worker).render();
    let mut dead = Vec::new();
    for (&token, stream) in control.conns.iter_mut() {
        if stream.write_all(rendered.as_bytes()).is_err() {
            dead.push(token);
        }
    }
    for token in dead {
        if let Some(mut stream) = control.conns.remove(&token) {
            let _ = worker.reactor.registry().deregister(&mut stream);
        }
        control.bufs.remove(&token);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("loading config file {}", path.display()))?,
        None => Config::default(),
    };
    apply_cli_overrides(&mut config.global, &cli);

    logging::init(Verbosity(config.global.verbosity));
    log::info!(
        "rtp2httpd starting, listening on {}:{}",
        config.global.listen_addr,
        config.global.listen_port
    );

    let mut worker = Worker::new(&config.global).context("constructing worker runtime")?;

    let listen_addr = SocketAddr::V4(SocketAddrV4::new(config.global.listen_addr, config.global.listen_port));
    let mut listener = mio::net::TcpListener::bind(listen_addr).context("binding HTTP listen socket")?;
    let listener_token = worker.reactor.allocate_token();
    worker
        .reactor
        .registry()
        .register(&mut listener, listener_token, mio::Interest::READABLE)
        .context("registering HTTP listener with reactor")?;

    let mut sources: HashMap<mio::Token, SourceKind> = HashMap::new();
    sources.insert(listener_token, SourceKind::HttpListener);

    let mut connections: HashMap<mio::Token, mio::net::TcpStream> = HashMap::new();
    let mut read_buffers: HashMap<mio::Token, Vec<u8>> = HashMap::new();
    let mut streaming = Streaming::default();

    let mut control = ControlState::default();
    if let Some(path) = config.global.control_socket_path.clone() {
        match bind_control_socket(&mut worker, &path) {
            Ok((listener, token)) => {
                sources.insert(token, SourceKind::ControlSocket);
                control.listener = Some(listener);
                control.listener_token = Some(token);
                worker
                    .timers
                    .schedule(Duration::from_secs(5), TimerKind::ControlStatusPush);
            }
            Err(e) => log::warn!("failed to bind control socket at {path}: {e}"),
        }
    }

    worker
        .timers
        .schedule(Duration::from_secs(1), TimerKind::BandwidthSampleTick);

    let shutdown = install_signal_flag();

    while !shutdown.load(Ordering::Relaxed) {
        let now = std::time::Instant::now();
        let wait = worker.timers.next_wait(now).unwrap_or(Duration::from_secs(1));
        let ready = worker.reactor.poll(Some(wait))?;

        for (token, readable, writable) in ready {
            if token == listener_token {
                accept_connections(&mut listener, &mut worker, &mut sources, &mut connections);
                continue;
            }
            if Some(token) == control.listener_token {
                if readable {
                    accept_control_connections(&mut control, &mut worker);
                }
                continue;
            }
            if control.conns.contains_key(&token) {
                if readable {
                    let should_close = dispatch_control(
                        &mut control,
                        &mut streaming,
                        &mut worker,
                        &mut connections,
                        &mut read_buffers,
                        &mut sources,
                        token,
                    );
                    if should_close {
                        if let Some(mut stream) = control.conns.remove(&token) {
                            let _ = worker.reactor.registry().deregister(&mut stream);
                        }
                        control.bufs.remove(&token);
                    }
                }
                continue;
            }
            if connections.contains_key(&token) {
                if !readable {
                    continue;
                }
                let mut should_close = false;
                if let Some(stream) = connections.get_mut(&token) {
                    let buf = read_buffers.entry(token).or_default();
                    match read_available(stream, buf) {
                        Ok(closed) => {
                            if closed {
                                should_close = true;
                            } else if handle_request_if_ready(
                                stream,
                                buf,
                                &mut worker,
                                &config,
                                &mut streaming,
                                token,
                            ) {
                                should_close = true;
                            }
                        }
                        Err(_) => should_close = true,
                    }
                }
                if should_close {
                    if let Some(client_id) = streaming
                        .client_http_token
                        .iter()
                        .find(|(_, t)| **t == token)
                        .map(|(id, _)| *id)
                    {
                        streaming.teardown_client(
                            &mut worker,
                            &mut connections,
                            &mut read_buffers,
                            &mut sources,
                            client_id,
                        );
                    } else {
                        connections.remove(&token);
                        read_buffers.remove(&token);
                        sources.remove(&token);
                    }
                }
                continue;
            }
            if let Some(&key) = streaming.mcast_token_key.get(&token) {
                if readable {
                    dispatch_multicast(&mut streaming, &mut worker, &config.global, key);
                }
                continue;
            }
            if let Some(&key) = streaming.fec_token_key.get(&token) {
                if readable {
                    dispatch_fec(&mut streaming, &mut worker, &config.global, key);
                }
                continue;
            }
            if let Some(&client_id) = streaming.fcc_unicast_token.get(&token) {
                if readable {
                    dispatch_fcc_unicast(&mut streaming, &mut worker, &config.global, client_id);
                }
                continue;
            }
            if let Some(&client_id) = streaming.rtsp_token_client.get(&token) {
                dispatch_rtsp(&mut streaming, &mut worker, &config.global, client_id, readable, writable);
                continue;
            }
            if let Some(&client_id) = streaming.http_proxy_token_client.get(&token) {
                dispatch_http_proxy(&mut streaming, &mut worker, client_id, readable, writable);
                continue;
            }
        }

        for fired in worker.timers.drain_expired(std::time::Instant::now()) {
            match fired {
                TimerKind::BandwidthSampleTick => {
                    for id in worker.on_bandwidth_tick() {
                        log::warn!("client {id} disconnected: sustained egress saturation");
                        streaming.teardown_client(
                            &mut worker,
                            &mut connections,
                            &mut read_buffers,
                            &mut sources,
                            id,
                        );
                    }
                    worker
                        .timers
                        .schedule(Duration::from_secs(1), TimerKind::BandwidthSampleTick);
                }
                TimerKind::MulticastRejoin { ingress_token } => {
                    if let Some(key) = streaming.mcast_token_key.get(&ingress_token).copied() {
                        if let Some(entry) = streaming.mcast_groups.get(&key) {
                            let _ = entry.ingress.rejoin();
                            if let Some(fec) = &entry.fec {
                                let _ = fec.ingress.rejoin();
                            }
                        }
                        if let Some(secs) = config.global.multicast_rejoin_interval_secs {
                            worker.timers.schedule(
                                Duration::from_secs(secs),
                                TimerKind::MulticastRejoin { ingress_token },
                            );
                        }
                    }
                }
                TimerKind::FccResponseTimeout { client_id } => {
                    on_fcc_response_timeout(&mut streaming, &mut worker, &config.global, client_id);
                }
                TimerKind::RtspKeepalive { client_id } => {
                    on_rtsp_keepalive(&mut streaming, &mut worker, client_id);
                }
                TimerKind::RtspResponseTimeout { client_id } => {
                    let still_waiting = worker
                        .clients
                        .get(&client_id)
                        .map(|c| matches!(&c.engine, Engine::Rtsp(e) if e.state() != RtspState::Playing))
                        .unwrap_or(false);
                    if still_waiting {
                        log::warn!("client {client_id} rtsp response timeout, tearing down");
                        streaming.teardown_client(
                            &mut worker,
                            &mut connections,
                            &mut read_buffers,
                            &mut sources,
                            client_id,
                        );
                    }
                }
                TimerKind::SendBatchFlush { .. } => {}
                TimerKind::ControlStatusPush => {
                    push_status_to_control_clients(&mut control, &worker);
                    worker
                        .timers
                        .schedule(Duration::from_secs(5), TimerKind::ControlStatusPush);
                }
            }
        }

        for id in pump_all_clients(&mut worker, &streaming, &connections) {
            streaming.teardown_client(&mut worker, &mut connections, &mut read_buffers, &mut sources, id);
        }
    }

    log::info!("received termination signal, draining and exiting");
    let ids: Vec<_> = worker.clients.keys().copied().collect();
    for id in ids {
        streaming.teardown_client(&mut worker, &mut connections, &mut read_buffers, &mut sources, id);
    }
    if let Some(path) = &config.global.control_socket_path {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

/// Accept every pending connection on the HTTP listen socket this tick,
/// registering each for readability before the next request body shows up
/// (§4.1, §6.1).
fn accept_connections(
    listener: &mut mio::net::TcpListener,
    worker: &mut Worker,
    sources: &mut HashMap<mio::Token, SourceKind>,
    connections: &mut HashMap<mio::Token, mio::net::TcpStream>,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                let token = worker.reactor.allocate_token();
                if let Err(e) = worker
                    .reactor
                    .registry()
                    .register(&mut stream, token, mio::Interest::READABLE)
                {
                    log::debug!("failed to register accepted connection: {e}");
                    continue;
                }
                // The owning client_id is not known until the request line
                // is parsed; HttpClient's placeholder id is never read back
                // out of `sources` before then (dispatch routes purely off
                // `connections`/`streaming.client_http_token`).
                sources.insert(token, SourceKind::HttpClient { client_id: u64::MAX });
                connections.insert(token, stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                log::debug!("accept error: {e}");
                break;
            }
        }
    }
}

/// Drain whatever is available on `stream` into `buf` without blocking.
/// Returns `true` if the peer closed the connection.
fn read_available(stream: &mut mio::net::TcpStream, buf: &mut Vec<u8>) -> std::io::Result<bool> {
    let mut scratch = [0u8; 4096];
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => return Ok(true),
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Parse and route one HTTP request out of `buf` if a full request has
/// arrived, start whichever stream it names, and write response headers.
/// Returns whether the connection should be closed (error response, or a
/// write failure on an already-dead socket).
fn handle_request_if_ready(
    stream: &mut mio::net::TcpStream,
    buf: &mut Vec<u8>,
    worker: &mut Worker,
    config: &Config,
    streaming: &mut Streaming,
    token: mio::Token,
) -> bool {
    let (request, consumed) = match http::parse_request(buf) {
        Ok(Some(pair)) => pair,
        Ok(None) => return false,
        Err(e) => {
            let _ = stream.write_all(http::error_response_headers(&e).as_bytes());
            return true;
        }
    };
    buf.drain(..consumed);

    if let Err(e) = http::check_hostname(&request, config.global.hostname.as_deref()) {
        let _ = stream.write_all(http::error_response_headers(&e).as_bytes());
        return true;
    }
    if let Err(e) = http::check_token(&request, config.global.token.as_deref()) {
        let _ = stream.write_all(http::error_response_headers(&e).as_bytes());
        return true;
    }

    let statics = config::static_path_map(&config.global);
    let route = match http::route(&request.path, &statics) {
        Ok(r) => r,
        Err(e) => {
            let _ = stream.write_all(http::error_response_headers(&e).as_bytes());
            return true;
        }
    };

    match route {
        Route::Static { name } => {
            let body = format!("{name} page is not served by the core data plane\n");
            let headers = http::stream_response_headers("text/plain");
            let _ = stream.write_all(headers.as_bytes());
            let _ = stream.write_all(body.as_bytes());
            true
        }
        Route::Playlist => {
            let playlist = build_playlist_from_config(config);
            let base_url = format!(
                "http://{}",
                request
                    .header("Host")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}:{}", config.global.listen_addr, config.global.listen_port))
            );
            let rendered = m3u::render(&m3u::rewrite_proxied(&playlist, &base_url));
            let headers = http::stream_response_headers("audio/x-mpegurl");
            let _ = stream.write_all(headers.as_bytes());
            let _ = stream.write_all(rendered.as_bytes());
            true
        }
        Route::HttpProxy { host, port, path } => {
            start_http_proxy_stream(stream, worker, &config.global, streaming, token, &request, host, port, path)
        }
        Route::NamedService { name } => {
            let Some(service) = config
                .services
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, s)| s.clone())
            else {
                let err = HttpError::NoRoute { path: request.path.clone() };
                let _ = stream.write_all(http::error_response_headers(&err).as_bytes());
                return true;
            };
            start_named_service(stream, worker, &config.global, streaming, token, &request, service)
        }
        Route::Udp { group, port } => {
            start_multicast_stream(stream, worker, &config.global, streaming, token, &request, group, port)
        }
        Route::Rtp { group, port, .. } => {
            // `http::route` never populates fcc/fcc-type/fec from the query
            // string (§6.1's table routes on path alone); pull them
            // straight off the request here instead.
            let fcc_addr = request.query_param("fcc").map(str::to_string);
            let fcc_type = request.query_param("fcc-type").map(str::to_string);
            let fec_port = request.query_param("fec").and_then(|s| s.parse::<u16>().ok());
            start_rtp_stream(
                stream, worker, &config.global, streaming, token, &request, group, port, fcc_addr, fcc_type,
                fec_port,
            )
        }
        Route::Rtsp { host, port, path, .. } => {
            start_rtsp_stream(stream, worker, &config.global, streaming, token, &request, host, port, path)
        }
    }
}

fn build_playlist_from_config(config: &Config) -> m3u::Playlist {
    let channels = config
        .services
        .iter()
        .map(|(name, service)| {
            let url = match service {
                Service::MulticastRtp { group, port, .. } => format!("rtp://{group}:{port}"),
                Service::MulticastUdp { group, port } => format!("udp://{group}:{port}"),
                Service::Rtsp { host, port, path, .. } => format!("rtsp://{host}:{port}/{path}"),
                Service::Http { host, port, path } => format!("http://{host}:{port}/{path}"),
            };
            m3u::Channel {
                extinf_duration: "-1".to_string(),
                title: name.clone(),
                extra_tags: Vec::new(),
                url,
            }
        })
        .collect();
    m3u::Playlist { channels }
}

fn remote_addr_of(stream: &mio::net::TcpStream) -> SocketAddr {
    stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
}

fn start_named_service(
    stream: &mut mio::net::TcpStream,
    worker: &mut Worker,
    global: &GlobalConfig,
    streaming: &mut Streaming,
    token: mio::Token,
    request: &Request,
    service: Service,
) -> bool {
    match service {
        Service::MulticastRtp { group, port, fcc, fec_port } => {
            let (fcc_addr, fcc_type) = match fcc {
                Some(target) => (
                    Some(target.addr.to_string()),
                    Some(
                        match target.fcc_type {
                            FccType::Telecom => "telecom",
                            FccType::Huawei => "huawei",
                        }
                        .to_string(),
                    ),
                ),
                None => (None, None),
            };
            start_rtp_stream(
                stream, worker, global, streaming, token, request, group, port, fcc_addr, fcc_type, fec_port,
            )
        }
        Service::MulticastUdp { group, port } => {
            start_multicast_stream(stream, worker, global, streaming, token, request, group, port)
        }
        Service::Rtsp { host, port, path, .. } => {
            start_rtsp_stream(stream, worker, global, streaming, token, request, host, port, path)
        }
        Service::Http { host, port, path } => {
            start_http_proxy_stream(stream, worker, global, streaming, token, request, host, port, path)
        }
    }
}

fn start_multicast_stream(
    stream: &mut mio::net::TcpStream,
    worker: &mut Worker,
    global: &GlobalConfig,
    streaming: &mut Streaming,
    token: mio::Token,
    request: &Request,
    group: Ipv4Addr,
    port: u16,
) -> bool {
    let remote_addr = remote_addr_of(stream);
    let client_id = worker.allocate_client_id();
    let service = Service::from_udp_path(group, port);
    let wants_snapshot = request.wants_snapshot() && global.video_snapshot && global.ffmpeg_path.is_some();

    let mut client = Client::new(client_id, worker.pid, remote_addr, service, Engine::None, global.queue_limit_bytes);
    if wants_snapshot {
        client.snapshot = Some(SnapshotCapture::new());
    }
    worker.clients.insert(client_id, client);
    streaming.client_http_token.insert(client_id, token);

    let content_type = if wants_snapshot { "image/jpeg" } else { "video/mp2t" };
    if stream.write_all(http::stream_response_headers(content_type).as_bytes()).is_err() {
        return true;
    }

    match streaming.ensure_multicast_group(worker, global, group, port, Framing::Raw, None) {
        Ok(_) => streaming.subscribe(group, port, client_id),
        Err(e) => log::warn!("udp multicast join for {group}:{port} failed: {e}"),
    }
    false
}

fn start_rtp_stream(
    stream: &mut mio::net::TcpStream,
    worker: &mut Worker,
    global: &GlobalConfig,
    streaming: &mut Streaming,
    token: mio::Token,
    request: &Request,
    group: Ipv4Addr,
    port: u16,
    fcc_addr: Option<String>,
    fcc_type_str: Option<String>,
    fec_port: Option<u16>,
) -> bool {
    let remote_addr = remote_addr_of(stream);
    let client_id = worker.allocate_client_id();

    let fcc_target: Option<SocketAddrV4> = fcc_addr.as_deref().and_then(|s| s.parse().ok());
    let fcc_type_hint = fcc_type_str.as_deref().map(|s| match s {
        "huawei" => FccType::Huawei,
        _ => FccType::Telecom,
    });
    let service = Service::from_rtp_path(group, port, fcc_target, fcc_type_hint, fec_port);
    let wants_snapshot = request.wants_snapshot() && global.video_snapshot && global.ffmpeg_path.is_some();

    let mut engine = match fcc_target {
        Some(target) => {
            let resolved_type = fcc_type_hint.unwrap_or_else(|| FccType::infer_from_port(target.port()));
            Engine::Fcc(FccEngine::new(target, SocketAddrV4::new(group, port), resolved_type))
        }
        None => Engine::None,
    };

    // An FCC burst needs its own unicast socket; fall back to a plain
    // multicast join if one can't be bound rather than hanging the client
    // waiting for a join acknowledgment that will never arrive.
    let mut unicast_socket = None;
    if let Engine::Fcc(_) = &engine {
        let bound = match global.fcc_listen_port_range {
            Some((lo, hi)) => UnicastIngress::bind_in_range(global.unicast_interface, lo, hi),
            None => UnicastIngress::bind_ephemeral(global.unicast_interface),
        };
        match bound {
            Ok(mut unicast) => {
                let utoken = worker.reactor.allocate_token();
                match unicast.register(worker.reactor.registry(), utoken) {
                    Ok(()) => unicast_socket = Some((utoken, unicast)),
                    Err(e) => log::warn!("failed to register FCC unicast socket: {e}"),
                }
            }
            Err(e) => log::warn!("failed to bind FCC unicast socket: {e}"),
        }
        if unicast_socket.is_none() {
            engine = Engine::None;
        }
    }

    let mut client = Client::new(client_id, worker.pid, remote_addr, service, engine, global.queue_limit_bytes);
    if wants_snapshot {
        client.snapshot = Some(SnapshotCapture::new());
    }
    worker.clients.insert(client_id, client);
    streaming.client_http_token.insert(client_id, token);

    let content_type = if wants_snapshot { "image/jpeg" } else { "video/mp2t" };
    if stream.write_all(http::stream_response_headers(content_type).as_bytes()).is_err() {
        return true;
    }

    if let Some((utoken, unicast)) = unicast_socket {
        streaming.fcc_unicast_token.insert(utoken, client_id);
        streaming.fcc_unicast.insert(client_id, unicast);
        let mut join_action = None;
        if let Some(client) = worker.clients.get_mut(&client_id) {
            if let Engine::Fcc(engine) = &mut client.engine {
                join_action = Some(engine.start());
            }
        }
        if let Some(FccAction::SendJoin { target, group, fcc_type }) = join_action {
            if let Some(unicast) = streaming.fcc_unicast.get(&client_id) {
                let _ = unicast.send_to(&fcc::wire::build_join(fcc_type, group), target);
            }
        }
        return false;
    }

    match streaming.ensure_multicast_group(worker, global, group, port, Framing::Rtp, fec_port) {
        Ok(_) => streaming.subscribe(group, port, client_id),
        Err(e) => log::warn!("multicast join for {group}:{port} failed: {e}"),
    }
    false
}

fn start_rtsp_stream(
    stream: &mut mio::net::TcpStream,
    worker: &mut Worker,
    global: &GlobalConfig,
    streaming: &mut Streaming,
    token: mio::Token,
    request: &Request,
    host: String,
    port: u16,
    path: String,
) -> bool {
    let resolved = format!("{host}:{port}")
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next());
    let Some(addr) = resolved else {
        let err = HttpError::Upstream(UpstreamError::Refused("rtsp host could not be resolved".to_string()));
        let _ = stream.write_all(http::error_response_headers(&err).as_bytes());
        return true;
    };

    let mut upstream = match mio::net::TcpStream::connect(addr) {
        Ok(s) => s,
        Err(e) => {
            let err = HttpError::Upstream(e.into());
            let _ = stream.write_all(http::error_response_headers(&err).as_bytes());
            return true;
        }
    };
    let rtoken = worker.reactor.allocate_token();
    if let Err(e) = worker
        .reactor
        .registry()
        .register(&mut upstream, rtoken, mio::Interest::READABLE | mio::Interest::WRITABLE)
    {
        let err = HttpError::Upstream(e.into());
        let _ = stream.write_all(http::error_response_headers(&err).as_bytes());
        return true;
    }

    let tz_offset = request.header("User-Agent").map(rtsp::parse_tz_offset_minutes).unwrap_or(0);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let seek_value = request.query_param(&global.seek_param_name);
    let seek = rtsp::parse_seek(seek_value, global.seek_offset_seconds, now, tz_offset);
    let path_with_seek = match &seek {
        Some(s) => format!("{path}?{}={}", global.seek_param_name, rtsp::render_seek_param(s)),
        None => path.clone(),
    };
    let url = format!("rtsp://{host}:{port}/{path_with_seek}");

    let remote_addr = remote_addr_of(stream);
    let client_id = worker.allocate_client_id();
    let service = Service::from_rtsp_path(host, port, path, None);
    let wants_snapshot = request.wants_snapshot() && global.video_snapshot && global.ffmpeg_path.is_some();

    let mut client = Client::new(
        client_id,
        worker.pid,
        remote_addr,
        service,
        Engine::Rtsp(RtspEngine::new(true)),
        global.queue_limit_bytes,
    );
    if wants_snapshot {
        client.snapshot = Some(SnapshotCapture::new());
    }
    worker.clients.insert(client_id, client);
    streaming.client_http_token.insert(client_id, token);
    streaming.rtsp_conns.insert(
        client_id,
        RtspConn { stream: upstream, token: rtoken, url, read_buf: Vec::new() },
    );
    streaming.rtsp_token_client.insert(rtoken, client_id);
    worker.timers.schedule(rtsp::RESPONSE_TIMEOUT, TimerKind::RtspResponseTimeout { client_id });

    if let Some(client) = worker.clients.get_mut(&client_id) {
        if let Engine::Rtsp(engine) = &mut client.engine {
            let _ = engine.start();
        }
    }

    let content_type = if wants_snapshot { "image/jpeg" } else { "video/mp2t" };
    stream.write_all(http::stream_response_headers(content_type).as_bytes()).is_err()
}

/// Open the outbound side of an `/http/` reverse-proxy request (§6.1). The
/// response headers this gateway sends its own client aren't known until
/// the upstream answers, so unlike the other `start_*` functions nothing is
/// written to `stream` here — the status line and body are both queued
/// through the client's ordinary egress path once `dispatch_http_proxy`
/// has something to send.
fn start_http_proxy_stream(
    stream: &mut mio::net::TcpStream,
    worker: &mut Worker,
    global: &GlobalConfig,
    streaming: &mut Streaming,
    token: mio::Token,
    request: &Request,
    host: String,
    port: u16,
    path: String,
) -> bool {
    let resolved = format!("{host}:{port}").to_socket_addrs().ok().and_then(|mut it| it.next());
    let Some(addr) = resolved else {
        let err = HttpError::Upstream(UpstreamError::Refused("http proxy host could not be resolved".to_string()));
        let _ = stream.write_all(http::error_response_headers(&err).as_bytes());
        return true;
    };

    let mut upstream = match mio::net::TcpStream::connect(addr) {
        Ok(s) => s,
        Err(e) => {
            let err = HttpError::Upstream(e.into());
            let _ = stream.write_all(http::error_response_headers(&err).as_bytes());
            return true;
        }
    };
    let utoken = worker.reactor.allocate_token();
    if let Err(e) =
        worker
            .reactor
            .registry()
            .register(&mut upstream, utoken, mio::Interest::READABLE | mio::Interest::WRITABLE)
    {
        let err = HttpError::Upstream(e.into());
        let _ = stream.write_all(http::error_response_headers(&err).as_bytes());
        return true;
    }

    let path_and_query = match &request.raw_query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.clone(),
    };
    let req_bytes = http::build_proxy_request(&host, &path_and_query);

    let remote_addr = remote_addr_of(stream);
    let client_id = worker.allocate_client_id();
    let service = Service::Http { host: host.clone(), port, path: path.clone() };
    let client = Client::new(client_id, worker.pid, remote_addr, service, Engine::None, global.queue_limit_bytes);
    worker.clients.insert(client_id, client);
    streaming.client_http_token.insert(client_id, token);

    let base_url = format!(
        "http://{}",
        request
            .header("Host")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", global.listen_addr, global.listen_port))
    );

    streaming.http_proxy_conns.insert(
        client_id,
        HttpProxyConn {
            stream: upstream,
            token: utoken,
            read_buf: Vec::new(),
            phase: HttpProxyPhase::Requesting,
            request: req_bytes,
            requested_path: path,
            base_url,
        },
    );
    streaming.http_proxy_token_client.insert(utoken, client_id);
    false
}

/// Copy `bytes` into a client's egress queue, diverting into its snapshot
/// capture instead of the ordinary media path while one is in progress
/// (§4.6). Shared by every forwarding path (plain multicast, FCC hand-off,
/// RTSP media) since all three eventually reduce to "some bytes arrived for
/// this client".
fn forward_bytes_to_client(worker: &mut Worker, global: &GlobalConfig, client_id: ClientId, bytes: &[u8]) {
    let pool = worker.buffer_pool.clone();
    let mut ready_jpeg = None;
    let mut snapshot_failed = false;

    if let Some(client) = worker.clients.get_mut(&client_id) {
        if let Some(capture) = client.snapshot.as_mut() {
            if capture.push(bytes) {
                let capture = client.snapshot.take().expect("just matched Some");
                match (global.ffmpeg_path.as_deref(), global.video_snapshot) {
                    (Some(path), true) => match snapshot::capture_jpeg(path, global.ffmpeg_args.as_deref(), capture.into_bytes()) {
                        Ok(jpeg) => ready_jpeg = Some(jpeg),
                        Err(e) => {
                            log::warn!("snapshot capture for client {client_id} failed: {e}");
                            snapshot_failed = true;
                        }
                    },
                    _ => snapshot_failed = true,
                }
            }
            if ready_jpeg.is_none() && !snapshot_failed {
                return;
            }
        } else {
            client.enqueue_bytes(&pool, bytes);
            return;
        }
    }

    if let Some(jpeg) = ready_jpeg {
        if let Some(client) = worker.clients.get_mut(&client_id) {
            client.enqueue_bytes(&pool, &jpeg);
            client.done = true;
        }
    }
    let _ = snapshot_failed;
}

/// Drive every zero-copy send queue once per reactor tick, regardless of
/// which socket became ready: completions surface on `EPOLLERR`, not
/// `EPOLLOUT` (§4.1, §4.5), and a steady multicast feed keeps this loop
/// spinning often enough that a dedicated flush timer per client would add
/// bookkeeping without buying lower latency. Returns clients whose queue
/// has now fully drained after being marked `done` (a completed snapshot),
/// which the caller must tear down.
fn pump_all_clients(
    worker: &mut Worker,
    streaming: &Streaming,
    connections: &HashMap<mio::Token, mio::net::TcpStream>,
) -> Vec<ClientId> {
    let mut finished = Vec::new();
    for (client_id, client) in worker.clients.iter_mut() {
        let Some(token) = streaming.client_http_token.get(client_id) else {
            continue;
        };
        let Some(stream) = connections.get(token) else {
            continue;
        };
        let fd = stream.as_raw_fd();
        if client.egress.queue_bytes() > 0 {
            if let Err(e) = client.sender.pump(fd, &mut client.egress, false) {
                log::debug!("client {client_id} send pump error: {e}");
            }
        }
        if let Err(e) = client.sender.reap_completions(fd, &mut client.egress) {
            log::debug!("client {client_id} reap error: {e}");
        }
        if client.done && client.egress.queue_bytes() == 0 {
            finished.push(*client_id);
        }
    }
    finished
}

/// Drain one multicast group's socket and fan each packet out to its
/// subscribers (§4.6, §5's shared-buffer forwarding).
fn dispatch_multicast(streaming: &mut Streaming, worker: &mut Worker, global: &GlobalConfig, key: (Ipv4Addr, u16)) {
    let (batch, framing, subscribers) = {
        let Some(entry) = streaming.mcast_groups.get_mut(&key) else {
            return;
        };
        let batch = match entry.ingress.drain_batch(&worker.buffer_pool) {
            Ok(batch) => batch,
            Err(e) => {
                log::debug!("multicast ingress read error for {:?}: {e}", key);
                return;
            }
        };
        (batch, entry.framing, entry.subscribers.clone())
    };
    if batch.is_empty() {
        return;
    }

    // FEC observation happens in its own short-lived borrow of
    // `streaming.mcast_groups`, separate from the subscriber fan-out below
    // (which may itself need to re-borrow `streaming` to join a steady-state
    // multicast group on an FCC hand-off).
    let mut packets: Vec<(rtp2httpd::buffer::PacketBuffer, Vec<u8>, usize)> = Vec::with_capacity(batch.len());
    for buf in batch {
        let bytes_snapshot: Vec<u8> = buf.bytes().to_vec();
        let offset = match framing {
            Framing::Rtp => match rtp2httpd::rtp::parse(&bytes_snapshot) {
                Some(header) => {
                    if let Some(entry) = streaming.mcast_groups.get_mut(&key) {
                        if let Some(fec) = entry.ingress.fec_mut() {
                            fec.observe_media(header.sequence_number, &bytes_snapshot[header.payload_offset..]);
                        }
                    }
                    header.payload_offset
                }
                None => continue,
            },
            Framing::Raw => 0,
        };
        packets.push((buf, bytes_snapshot, offset));
    }

    for (buf, bytes_snapshot, offset) in packets {
        fanout_media_packet(streaming, worker, global, &subscribers, &buf, &bytes_snapshot, offset);
    }
}

/// Fan one arrived (or FEC-recovered) media packet out to every subscriber
/// of the group it belongs to, the same way regardless of whether it came
/// off the wire or was reconstructed from parity (§4.6, §5's shared-buffer
/// forwarding).
fn fanout_media_packet(
    streaming: &mut Streaming,
    worker: &mut Worker,
    global: &GlobalConfig,
    subscribers: &[ClientId],
    buf: &rtp2httpd::buffer::PacketBuffer,
    bytes_snapshot: &[u8],
    offset: usize,
) {
    for &client_id in subscribers {
        let mut fcc_fanout = None;
        let mut plain_forward = false;
        let mut wants_copy = false;

        if let Some(client) = worker.clients.get_mut(&client_id) {
            let service = client.service.clone();
            match &mut client.engine {
                Engine::None => {
                    plain_forward = true;
                    wants_copy = client.snapshot.is_some();
                }
                Engine::Fcc(engine) => {
                    let actions = engine.on_multicast_packet(bytes_snapshot);
                    if let Service::MulticastRtp { group, port, fec_port, .. } = service {
                        fcc_fanout = Some((group, port, fec_port, actions));
                    }
                }
                Engine::Rtsp(_) => {}
            }
        }

        if plain_forward {
            if wants_copy {
                forward_bytes_to_client(worker, global, client_id, &bytes_snapshot[offset..]);
            } else if let Some(client) = worker.clients.get_mut(&client_id) {
                let len = buf.len().saturating_sub(offset);
                client.egress.enqueue(buf.clone(), offset, len);
            }
        }
        if let Some((group, port, fec_port, actions)) = fcc_fanout {
            apply_fcc_actions(streaming, worker, global, client_id, group, port, fec_port, actions);
        }
    }
}

/// Drain one group's FEC parity socket and feed each packet to the media
/// socket's decoder; a recovered packet is synthesized back into a minimal
/// RTP packet and fanned out exactly like a normal arrival. The parity
/// wire format itself is unspecified (§9's open question); a parity
/// packet's RTP timestamp field is read as the covered column's base
/// sequence number, matching the convention the FEC geometry choice in
/// `fec.rs` documents for this gateway's target headends (see DESIGN.md).
fn dispatch_fec(streaming: &mut Streaming, worker: &mut Worker, global: &GlobalConfig, key: (Ipv4Addr, u16)) {
    let (batch, subscribers) = {
        let Some(entry) = streaming.mcast_groups.get_mut(&key) else {
            return;
        };
        let Some(fec) = &entry.fec else {
            return;
        };
        let batch = match fec.ingress.drain_batch(&worker.buffer_pool) {
            Ok(batch) => batch,
            Err(e) => {
                log::debug!("fec ingress read error for {:?}: {e}", key);
                return;
            }
        };
        (batch, entry.subscribers.clone())
    };
    if batch.is_empty() || subscribers.is_empty() {
        return;
    }

    let mut recovered_packets: Vec<(u16, Vec<u8>)> = Vec::new();
    for buf in batch {
        let bytes = buf.bytes().to_vec();
        let Some(header) = rtp2httpd::rtp::parse(&bytes) else {
            continue;
        };
        let base_seq = header.timestamp as u16;
        if let Some(entry) = streaming.mcast_groups.get_mut(&key) {
            if let Some(decoder) = entry.ingress.fec_mut() {
                if let Some(recovered) = decoder.observe_parity(base_seq, &bytes[header.payload_offset..]) {
                    recovered_packets.push((recovered.sequence_number, recovered.payload));
                }
            }
        }
    }

    for (sequence_number, payload) in recovered_packets {
        let mut synthetic = Vec::with_capacity(rtp2httpd::rtp::MIN_HEADER_LEN + payload.len());
        synthetic.push(0x80); // version 2, no padding/extension/csrc
        synthetic.push(33); // MPEG-TS payload type
        synthetic.extend_from_slice(&sequence_number.to_be_bytes());
        synthetic.extend_from_slice(&0u32.to_be_bytes()); // timestamp
        synthetic.extend_from_slice(&0u32.to_be_bytes()); // ssrc
        synthetic.extend_from_slice(&payload);

        let Some(buf) = worker.buffer_pool.acquire(&synthetic) else {
            log::debug!("buffer pool exhausted, dropping fec-recovered packet");
            continue;
        };
        log::debug!("fec recovered seq={sequence_number} for group {:?}", key);
        fanout_media_packet(
            streaming,
            worker,
            global,
            &subscribers,
            &buf,
            &synthetic,
            rtp2httpd::rtp::MIN_HEADER_LEN,
        );
    }
}

/// Apply every `FccAction` an engine transition produced, in order.
fn apply_fcc_actions(
    streaming: &mut Streaming,
    worker: &mut Worker,
    global: &GlobalConfig,
    client_id: ClientId,
    group: Ipv4Addr,
    port: u16,
    fec_port: Option<u16>,
    actions: Vec<FccAction>,
) {
    for action in actions {
        match action {
            FccAction::Forward(payload) => {
                forward_bytes_to_client(worker, global, client_id, &payload);
            }
            FccAction::CloseUnicastSocket => {
                streaming.close_fcc_unicast(worker, client_id);
            }
            FccAction::JoinMulticast => {
                match streaming.ensure_multicast_group(worker, global, group, port, Framing::Rtp, fec_port) {
                    Ok(_) => streaming.subscribe(group, port, client_id),
                    Err(e) => log::warn!("fcc multicast join for {group}:{port} failed: {e}"),
                }
            }
            FccAction::LogFallbackTimeout => {
                log::warn!("client {client_id}: FCC server response timeout, falling back to multicast");
            }
            FccAction::SendLeave { target, group, fcc_type } => {
                if let Some(unicast) = streaming.fcc_unicast.get(&client_id) {
                    let _ = unicast.send_to(&fcc::wire::build_leave(fcc_type, group), target);
                }
            }
            FccAction::SendJoin { .. } | FccAction::StartResponseTimer | FccAction::Disconnect => {}
        }
    }
}

/// Drain one client's FCC unicast burst socket: control packets advance the
/// handshake, media packets forward and (once UNICAST_ACTIVE) trigger the
/// parallel multicast join (§4.2).
fn dispatch_fcc_unicast(streaming: &mut Streaming, worker: &mut Worker, global: &GlobalConfig, client_id: ClientId) {
    let Some(unicast) = streaming.fcc_unicast.get(&client_id) else {
        return;
    };
    let batch = match unicast.drain_batch(&worker.buffer_pool) {
        Ok(b) => b,
        Err(e) => {
            log::debug!("fcc unicast read error for client {client_id}: {e}");
            return;
        }
    };
    if batch.is_empty() {
        return;
    }

    let Some((group, port, fec_port)) = worker.clients.get(&client_id).and_then(|c| match &c.service {
        Service::MulticastRtp { group, port, fec_port, .. } => Some((*group, *port, *fec_port)),
        _ => None,
    }) else {
        return;
    };

    for buf in batch {
        let bytes: Vec<u8> = buf.bytes().to_vec();
        let is_control = fcc::wire::is_control_packet(&bytes);
        let mut start_timer = false;
        let mut actions = Vec::new();

        if let Some(client) = worker.clients.get_mut(&client_id) {
            if let Engine::Fcc(engine) = &mut client.engine {
                if is_control {
                    if matches!(engine.on_ack(), Some(FccAction::StartResponseTimer)) {
                        start_timer = true;
                    }
                } else {
                    actions = engine.on_unicast_packet(&bytes);
                    if let Some(join) = engine.begin_multicast_join() {
                        actions.push(join);
                    }
                }
            }
        }

        if start_timer {
            worker.timers.schedule(fcc::RESPONSE_TIMEOUT, TimerKind::FccResponseTimeout { client_id });
        }
        if !actions.is_empty() {
            apply_fcc_actions(streaming, worker, global, client_id, group, port, fec_port, actions);
        }
    }
}

/// The 80ms FCC response timer fired: fall back to multicast if the engine
/// is still waiting on the server's burst (§4.2 scenario 2); a no-op if the
/// hand-off already happened before the timer fired.
fn on_fcc_response_timeout(streaming: &mut Streaming, worker: &mut Worker, global: &GlobalConfig, client_id: ClientId) {
    let mut actions = Vec::new();
    let mut group_port_fec = None;
    if let Some(client) = worker.clients.get_mut(&client_id) {
        let service = client.service.clone();
        if let Engine::Fcc(engine) = &mut client.engine {
            actions = engine.on_response_timeout();
            if let Service::MulticastRtp { group, port, fec_port, .. } = service {
                group_port_fec = Some((group, port, fec_port));
            }
        }
    }
    if actions.is_empty() {
        return;
    }
    if let Some((group, port, fec_port)) = group_port_fec {
        apply_fcc_actions(streaming, worker, global, client_id, group, port, fec_port, actions);
    }
}

/// Drive one client's RTSP control connection: on first writability after
/// `connect()` send DESCRIBE, then parse whatever responses/interleaved
/// media frames have arrived (§4.3).
fn dispatch_rtsp(
    streaming: &mut Streaming,
    worker: &mut Worker,
    _global: &GlobalConfig,
    client_id: ClientId,
    readable: bool,
    writable: bool,
) {
    if writable {
        let mut describe_action = None;
        if let Some(client) = worker.clients.get_mut(&client_id) {
            if let Engine::Rtsp(engine) = &mut client.engine {
                if engine.state() == RtspState::Connecting {
                    let url = streaming.rtsp_conns.get(&client_id).map(|c| c.url.clone()).unwrap_or_default();
                    describe_action = Some(engine.on_connected(url));
                }
            }
        }
        if let Some(RtspAction::SendDescribe { url }) = describe_action {
            if let Some(conn) = streaming.rtsp_conns.get_mut(&client_id) {
                let _ = conn.stream.write_all(&rtsp::wire::build_describe(&url));
            }
        }
    }

    if !readable {
        return;
    }

    {
        let Some(conn) = streaming.rtsp_conns.get_mut(&client_id) else {
            return;
        };
        let mut scratch = [0u8; 4096];
        loop {
            match conn.stream.read(&mut scratch) {
                Ok(0) => {
                    if let Some(client) = worker.clients.get_mut(&client_id) {
                        if let Engine::Rtsp(engine) = &mut client.engine {
                            let _ = engine.on_connection_lost();
                        }
                    }
                    return;
                }
                Ok(n) => conn.read_buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => return,
            }
        }
    }

    process_rtsp_buffer(streaming, worker, client_id);
}

fn process_rtsp_buffer(streaming: &mut Streaming, worker: &mut Worker, client_id: ClientId) {
    loop {
        let Some(conn) = streaming.rtsp_conns.get_mut(&client_id) else {
            return;
        };
        if conn.read_buf.first() == Some(&b'$') {
            let Some((_channel, payload, consumed)) = rtsp::wire::parse_interleaved_frame(&conn.read_buf) else {
                return;
            };
            let payload = payload.to_vec();
            conn.read_buf.drain(..consumed);

            let mut action = None;
            if let Some(client) = worker.clients.get_mut(&client_id) {
                if let Engine::Rtsp(engine) = &mut client.engine {
                    action = engine.on_media_packet(payload);
                }
            }
            if let Some(RtspAction::Forward(payload)) = action {
                let pool = worker.buffer_pool.clone();
                if let Some(client) = worker.clients.get_mut(&client_id) {
                    client.enqueue_bytes(&pool, &payload);
                }
            }
            continue;
        }

        let Some((response, consumed)) = rtsp::wire::parse_response(&conn.read_buf) else {
            return;
        };
        conn.read_buf.drain(..consumed);
        handle_rtsp_response(streaming, worker, client_id, response);
    }
}

fn handle_rtsp_response(streaming: &mut Streaming, worker: &mut Worker, client_id: ClientId, response: rtsp::wire::Response) {
    let mut outgoing = None;
    let mut just_started_playing = false;

    if let Some(client) = worker.clients.get_mut(&client_id) {
        if let Engine::Rtsp(engine) = &mut client.engine {
            if (200..300).contains(&response.status) {
                match engine.state() {
                    RtspState::DescribeSent => outgoing = Some(engine.on_describe_ok()),
                    RtspState::SetupSent => {
                        let session = response.session_id().unwrap_or_default();
                        outgoing = Some(engine.on_setup_ok(session));
                    }
                    RtspState::PlaySent => {
                        engine.on_play_ok();
                        just_started_playing = true;
                    }
                    RtspState::TeardownSent => engine.on_teardown_ok(),
                    _ => {}
                }
            } else {
                outgoing = Some(engine.on_server_error(response.status, response.reason.clone()));
            }
        }
    }

    if just_started_playing {
        worker.timers.schedule(rtsp::KEEPALIVE_INTERVAL, TimerKind::RtspKeepalive { client_id });
    }

    let Some(action) = outgoing else {
        return;
    };
    let Some(conn) = streaming.rtsp_conns.get_mut(&client_id) else {
        return;
    };
    match action {
        RtspAction::SendSetup { session } => {
            let interleaved = worker
                .clients
                .get(&client_id)
                .map(|c| matches!(&c.engine, Engine::Rtsp(e) if e.interleaved()))
                .unwrap_or(true);
            let req = rtsp::wire::build_setup(&conn.url, interleaved, session.as_deref(), 0);
            let _ = conn.stream.write_all(&req);
        }
        RtspAction::SendPlay { session } => {
            let _ = conn.stream.write_all(&rtsp::wire::build_play(&conn.url, &session));
        }
        RtspAction::LogError(msg) => log::error!("{msg}"),
        _ => {}
    }
}

/// Drive one client's `/http/` proxy connection: write the relayed GET once
/// writable, then parse the upstream response head and forward or buffer
/// its body depending on what it looks like (§6.1).
fn dispatch_http_proxy(streaming: &mut Streaming, worker: &mut Worker, client_id: ClientId, readable: bool, writable: bool) {
    if writable {
        let still_requesting = streaming
            .http_proxy_conns
            .get(&client_id)
            .map(|c| matches!(c.phase, HttpProxyPhase::Requesting))
            .unwrap_or(false);
        if still_requesting {
            if let Some(conn) = streaming.http_proxy_conns.get_mut(&client_id) {
                match conn.stream.write_all(&conn.request) {
                    Ok(()) => conn.phase = HttpProxyPhase::Headers,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => {
                        finish_http_proxy(streaming, worker, client_id);
                        return;
                    }
                }
            }
        }
    }

    if !readable {
        return;
    }

    {
        let Some(conn) = streaming.http_proxy_conns.get_mut(&client_id) else {
            return;
        };
        let mut scratch = [0u8; 4096];
        loop {
            match conn.stream.read(&mut scratch) {
                Ok(0) => {
                    finish_http_proxy(streaming, worker, client_id);
                    return;
                }
                Ok(n) => conn.read_buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    finish_http_proxy(streaming, worker, client_id);
                    return;
                }
            }
        }
    }

    process_http_proxy_buffer(streaming, worker, client_id);
}

/// Parse the upstream response head once it has fully arrived, then either
/// start forwarding the body straight through or start buffering it for an
/// M3U rewrite, depending on [`http::UpstreamResponseHead::looks_like_playlist`].
fn process_http_proxy_buffer(streaming: &mut Streaming, worker: &mut Worker, client_id: ClientId) {
    if matches!(
        streaming.http_proxy_conns.get(&client_id).map(|c| &c.phase),
        Some(HttpProxyPhase::Headers)
    ) {
        let Some(conn) = streaming.http_proxy_conns.get_mut(&client_id) else {
            return;
        };
        match http::parse_response_head(&conn.read_buf) {
            Ok(Some((head, consumed))) => {
                conn.read_buf.drain(..consumed);
                if head.looks_like_playlist(&conn.requested_path) {
                    let leftover = std::mem::take(&mut conn.read_buf);
                    conn.phase = HttpProxyPhase::BodyBuffered { buf: leftover };
                } else {
                    let content_type = head
                        .header("Content-Type")
                        .map(str::to_string)
                        .unwrap_or_else(|| "application/octet-stream".to_string());
                    conn.phase = HttpProxyPhase::BodyPassthrough;
                    let headers = http::stream_response_headers(&content_type);
                    let pool = worker.buffer_pool.clone();
                    if let Some(client) = worker.clients.get_mut(&client_id) {
                        client.enqueue_bytes(&pool, headers.as_bytes());
                    }
                }
            }
            Ok(None) => return,
            Err(_) => {
                finish_http_proxy(streaming, worker, client_id);
                return;
            }
        }
    }

    let Some(conn) = streaming.http_proxy_conns.get_mut(&client_id) else {
        return;
    };
    match &mut conn.phase {
        HttpProxyPhase::BodyPassthrough => {
            if conn.read_buf.is_empty() {
                return;
            }
            let chunk = std::mem::take(&mut conn.read_buf);
            let pool = worker.buffer_pool.clone();
            if let Some(client) = worker.clients.get_mut(&client_id) {
                client.enqueue_bytes(&pool, &chunk);
            }
        }
        HttpProxyPhase::BodyBuffered { buf } => {
            if !conn.read_buf.is_empty() {
                buf.extend_from_slice(&conn.read_buf);
                conn.read_buf.clear();
            }
        }
        _ => {}
    }
}

/// The upstream connection closed or errored: render and flush whatever a
/// buffered playlist body parsed to, then mark the client `done` so the
/// reactor tears it down once its egress queue drains (§4.1).
fn finish_http_proxy(streaming: &mut Streaming, worker: &mut Worker, client_id: ClientId) {
    let Some(conn) = streaming.http_proxy_conns.get_mut(&client_id) else {
        return;
    };
    let rendered = match &conn.phase {
        HttpProxyPhase::BodyBuffered { buf } => {
            let body = String::from_utf8_lossy(buf).into_owned();
            let playlist = m3u::parse(&body);
            Some(m3u::render(&m3u::rewrite_proxied(&playlist, &conn.base_url)))
        }
        _ => None,
    };

    let pool = worker.buffer_pool.clone();
    if let Some(client) = worker.clients.get_mut(&client_id) {
        if let Some(rendered) = rendered {
            let headers = http::stream_response_headers("audio/x-mpegurl");
            client.enqueue_bytes(&pool, headers.as_bytes());
            client.enqueue_bytes(&pool, rendered.as_bytes());
        }
        client.done = true;
    }
}

/// The RTSP keepalive timer fired: send an OPTIONS keepalive if still
/// PLAYING and reschedule (§4.3, §5).
fn on_rtsp_keepalive(streaming: &mut Streaming, worker: &mut Worker, client_id: ClientId) {
    let mut action = None;
    let mut still_playing = false;
    if let Some(client) = worker.clients.get_mut(&client_id) {
        if let Engine::Rtsp(engine) = &mut client.engine {
            action = engine.on_keepalive_timer();
            still_playing = engine.state() == RtspState::Playing;
        }
    }
    if let Some(RtspAction::SendKeepalive { session }) = action {
        if let Some(conn) = streaming.rtsp_conns.get_mut(&client_id) {
            let _ = conn.stream.write_all(&rtsp::wire::build_keepalive(&conn.url, &session));
        }
    }
    if still_playing {
        worker.timers.schedule(rtsp::KEEPALIVE_INTERVAL, TimerKind::RtspKeepalive { client_id });
    }
}
