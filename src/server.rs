//! Server edge engine
//!
//! Accepts tunnel connections, groups them by client id once their INIT
//! arrives, and routes every envelope to its [`ServerSession`]. Runs the
//! liveness ticker that pings each client with the miner ids the server
//! holds, closing whatever the client disavows in its PONG.

use crate::codec::{Envelope, EnvelopeType, FrameCodec, InitPayload};
use crate::config::ServerConfig;
use crate::liveness::{self, spawn_filler_loop, split_miner_ids, OfflineTracker};
use crate::pool::{DispatchRegistry, EnvelopeSink, Tunnel, TunnelEvent};
use crate::session::{ServerSession, SessionRegistry};
use crate::status::{LogSink, OfflineNotifier, StatusSink, StatusUpdate};
use crate::Result;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Depth of the tunnel event channel feeding the router
const EVENT_DEPTH: usize = 256;

/// Cadence of per-session status snapshots
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of offline-record sweeps
const OFFLINE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Sessions younger than this are exempt from INIT reconciliation; their
/// LOGIN may still be racing the client's announced snapshot
const RECONCILE_MIN_AGE: Duration = Duration::from_secs(5);

/// One running server edge
pub struct ServerInstance {
    default_pool: String,
    obfuscate: bool,
    ping_interval: Duration,
    init_timeout: Duration,
    codec: FrameCodec,
    registry: Arc<DispatchRegistry>,
    sessions: Arc<SessionRegistry<ServerSession>>,
    offline: Arc<OfflineTracker>,
    status: Arc<dyn StatusSink>,
    /// All accepted tunnels; client id filled in once INIT arrives
    tunnels: Mutex<HashMap<u64, TunnelEntry>>,
    next_tunnel_id: AtomicU64,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct TunnelEntry {
    tunnel: Arc<Tunnel>,
    client_id: Option<String>,
}

impl ServerInstance {
    /// Start with the default log-based status sinks
    pub async fn start(cfg: ServerConfig) -> Result<Arc<Self>> {
        let sink = Arc::new(LogSink);
        Self::start_with(cfg, Arc::clone(&sink) as _, sink as _).await
    }

    /// Validate the config, bind the tunnel listener, and spawn the accept,
    /// router, liveness, and status tasks.
    pub async fn start_with(
        cfg: ServerConfig,
        status: Arc<dyn StatusSink>,
        notifier: Arc<dyn OfflineNotifier>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let codec = FrameCodec::new(&cfg.secret_key, cfg.obfuscate)?;
        let listener = TcpListener::bind(&cfg.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "server listening on {} (default pool {}, obfuscation {})",
            local_addr,
            cfg.pool_address,
            if cfg.obfuscate { "on" } else { "off" }
        );

        let offline = OfflineTracker::new(Duration::from_secs(cfg.offline_grace_secs), notifier);
        let (events_tx, events_rx) = mpsc::channel::<TunnelEvent>(EVENT_DEPTH);

        let instance = Arc::new(Self {
            default_pool: cfg.pool_address.clone(),
            obfuscate: cfg.obfuscate,
            ping_interval: Duration::from_secs(cfg.ping_interval_secs),
            init_timeout: Duration::from_secs(cfg.init_timeout_secs),
            codec,
            registry: DispatchRegistry::new(),
            sessions: SessionRegistry::new(),
            offline: Arc::clone(&offline),
            status,
            tunnels: Mutex::new(HashMap::new()),
            next_tunnel_id: AtomicU64::new(1),
            local_addr,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = instance.tasks.lock().await;
        tasks.push(offline.spawn_sweep_loop(OFFLINE_SWEEP_INTERVAL));

        let acceptor = Arc::clone(&instance);
        let accept_events = events_tx;
        tasks.push(tokio::spawn(async move {
            acceptor.accept_loop(listener, accept_events).await;
        }));

        let router = Arc::clone(&instance);
        tasks.push(tokio::spawn(async move {
            router.route_events(events_rx).await;
        }));

        let pinger = Arc::clone(&instance);
        tasks.push(tokio::spawn(async move {
            pinger.liveness_loop().await;
        }));

        let reporter = Arc::clone(&instance);
        tasks.push(tokio::spawn(async move {
            reporter.status_loop().await;
        }));
        drop(tasks);

        Ok(instance)
    }

    /// Address clients should dial
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live server-side session count
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Miner ids currently held for one client
    fn client_miner_ids(&self, client_id: &str) -> Vec<String> {
        self.sessions
            .sessions()
            .iter()
            .filter(|s| s.client_id() == client_id)
            .map(|s| s.miner_id().to_string())
            .collect()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, events: mpsc::Sender<TunnelEvent>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.next_tunnel_id.fetch_add(1, Ordering::SeqCst);
                    debug!("tunnel {} accepted from {}", id, peer);
                    let tunnel = Tunnel::start(id, stream, self.codec.clone(), events.clone());
                    if self.obfuscate {
                        spawn_filler_loop(Arc::clone(&tunnel));
                    }
                    self.tunnels.lock().await.insert(
                        id,
                        TunnelEntry {
                            tunnel,
                            client_id: None,
                        },
                    );

                    // a tunnel that never sends INIT (scanner, idle connect)
                    // must not hold a slot forever
                    let watchdog = Arc::clone(&self);
                    tokio::spawn(async move {
                        tokio::time::sleep(watchdog.init_timeout).await;
                        let tunnels = watchdog.tunnels.lock().await;
                        if let Some(entry) = tunnels.get(&id) {
                            if entry.client_id.is_none() {
                                warn!("tunnel {} sent no init, dropping", id);
                                entry.tunnel.close();
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("tunnel accept failed: {}", e);
                }
            }
        }
    }

    async fn route_events(self: Arc<Self>, mut events: mpsc::Receiver<TunnelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::Envelope {
                    tunnel_id,
                    envelope,
                } => {
                    // a LOGIN dials the downstream pool, which can take
                    // seconds; never let that stall the router
                    if envelope.kind == EnvelopeType::Login {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            this.handle_login(envelope).await;
                        });
                    } else {
                        self.route_envelope(tunnel_id, envelope).await;
                    }
                }
                TunnelEvent::Closed { tunnel_id } => {
                    let entry = self.tunnels.lock().await.remove(&tunnel_id);
                    if let Some(TunnelEntry {
                        client_id: Some(client_id),
                        ..
                    }) = entry
                    {
                        self.registry.remove_conn(&client_id, tunnel_id).await;
                    }
                }
            }
        }
    }

    async fn route_envelope(&self, tunnel_id: u64, envelope: Envelope) {
        match envelope.kind {
            EnvelopeType::Init => self.handle_init(tunnel_id, envelope).await,
            EnvelopeType::Pong => self.handle_pong(envelope).await,
            EnvelopeType::Register => {
                debug!(
                    "register from client {} ignored (out-of-band registration not enabled)",
                    envelope.client_id
                );
            }
            EnvelopeType::Ping => {
                // this edge initiates pings; an inbound one is a protocol
                // mismatch worth logging, nothing more
                debug!("unexpected ping from client {}", envelope.client_id);
            }
            _ => match self.sessions.get(&envelope.miner_id) {
                Some(session) => session.handle_envelope(envelope).await,
                None => {
                    debug!(
                        "no session for miner {} ({})",
                        envelope.miner_id, envelope.kind
                    );
                    if envelope.kind == EnvelopeType::Data {
                        self.reply_error(&envelope, "unknown miner id").await;
                    }
                }
            },
        }
    }

    /// Adopt a tunnel into its client's dispatch and reconcile the client's
    /// announced miner set against the sessions held here.
    async fn handle_init(&self, tunnel_id: u64, envelope: Envelope) {
        let payload = match InitPayload::decode(&envelope.data) {
            Ok(p) => p,
            Err(e) => {
                warn!("bad init payload on tunnel {}: {}", tunnel_id, e);
                return;
            }
        };
        let client_id = envelope.client_id;

        let tunnel = {
            let mut tunnels = self.tunnels.lock().await;
            match tunnels.get_mut(&tunnel_id) {
                Some(entry) => {
                    entry.client_id = Some(client_id.clone());
                    Arc::clone(&entry.tunnel)
                }
                None => return,
            }
        };
        let dispatch = self.registry.get_or_create(&client_id).await;
        dispatch.set_conn(tunnel).await;
        info!(
            "tunnel {} joined client {} (local ip {}, {} miner(s) announced)",
            tunnel_id,
            client_id,
            payload.local_ip,
            payload.miner_ids.len()
        );

        // sessions the client no longer announces are orphans; spare the
        // very young ones whose LOGIN may still be in flight
        for session in self.sessions.sessions() {
            if session.client_id() == client_id
                && !payload.miner_ids.contains(&session.miner_id().to_string())
                && session.started_at().elapsed() > RECONCILE_MIN_AGE
            {
                debug!("miner {} not announced by client, closing", session.miner_id());
                session.teardown(false).await;
            }
        }
    }

    /// Open a session for a LOGIN; a duplicate LOGIN (client resend) gets
    /// its ack again, a backend dial failure gets an ERROR
    async fn handle_login(&self, envelope: Envelope) {
        let dispatch = self.registry.get_or_create(&envelope.client_id).await;

        if self.sessions.contains(&envelope.miner_id) {
            let ack = Envelope::new(EnvelopeType::Login, &envelope.client_id, &envelope.miner_id);
            if let Err(e) = dispatch.send(&ack).await {
                debug!("duplicate login ack failed: {}", e);
            }
            return;
        }

        if let Err(e) = ServerSession::open(
            &envelope,
            &self.default_pool,
            dispatch,
            Arc::clone(&self.sessions),
            Arc::clone(&self.offline),
        )
        .await
        {
            warn!("login for miner {} failed: {}", envelope.miner_id, e);
            self.reply_error(&envelope, &e.to_string()).await;
        }
    }

    /// The PONG lists the ids the client does not recognize: close them.
    /// A client may only disavow its own miners.
    async fn handle_pong(&self, envelope: Envelope) {
        if let Some(dispatch) = self.registry.get(&envelope.client_id).await {
            dispatch.mark_pong().await;
        }
        for miner_id in split_miner_ids(&envelope.data) {
            if let Some(session) = self.sessions.get(&miner_id) {
                if session.client_id() != envelope.client_id {
                    debug!(
                        "pong from client {} names foreign miner {}, ignoring",
                        envelope.client_id, miner_id
                    );
                    continue;
                }
                info!("miner {} disavowed by client, closing", miner_id);
                session.teardown(false).await;
            }
        }
    }

    async fn reply_error(&self, envelope: &Envelope, reason: &str) {
        if let Some(dispatch) = self.registry.get(&envelope.client_id).await {
            let error = Envelope::error(&envelope.client_id, &envelope.miner_id, reason);
            if let Err(e) = dispatch.send(&error).await {
                debug!("error reply failed: {}", e);
            }
        }
    }

    /// Ping every client with the miner ids held for it, on a jittered
    /// cadence so many servers never probe in lockstep
    async fn liveness_loop(self: Arc<Self>) {
        loop {
            let jittered = {
                let base = self.ping_interval.as_millis() as u64;
                let spread = rand::thread_rng().gen_range(base / 2..=base + base / 2);
                Duration::from_millis(spread.max(1))
            };
            tokio::time::sleep(jittered).await;

            for client_id in self.registry.client_ids().await {
                if let Some(dispatch) = self.registry.get(&client_id).await {
                    let ids = self.client_miner_ids(&client_id);
                    liveness::send_ping(&dispatch, &ids).await;
                }
            }
        }
    }

    async fn status_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            for session in self.sessions.sessions() {
                let rtt = match self.registry.get(session.client_id()).await {
                    Some(dispatch) => dispatch.rtt().await,
                    None => None,
                };
                self.status
                    .publish(StatusUpdate {
                        client_id: session.client_id().to_string(),
                        miner_id: session.miner_id().to_string(),
                        miner_ip: session.miner_ip().to_string(),
                        pool_address: session.pool_address().to_string(),
                        bytes_transferred: session.bytes_transferred(),
                        connected_for: session.started_at().elapsed(),
                        rtt,
                    })
                    .await;
            }
        }
    }

    /// Stop all tasks and close every session and tunnel
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for session in self.sessions.sessions() {
            session.teardown(false).await;
        }
        for entry in self.tunnels.lock().await.values() {
            entry.tunnel.close();
        }
        info!("server stopped");
    }
}
