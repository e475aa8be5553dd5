//! Client edge engine
//!
//! Listens for miner TCP connections, wraps each in a [`MinerSession`], and
//! multiplexes them over the tunnel pool. A single router task consumes the
//! pool's event channel and steers every inbound envelope to its session by
//! miner id.

use crate::codec::{Envelope, EnvelopeType, FrameCodec};
use crate::config::ClientConfig;
use crate::liveness::{pong_reply, split_miner_ids};
use crate::pool::{
    AnnounceFn, EnvelopeSink, PoolConfig, PoolError, TunnelEvent, TunnelPool,
};
use crate::session::{MinerSession, SessionRegistry};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Depth of the tunnel event channel feeding the router
const EVENT_DEPTH: usize = 256;

/// One running client edge
pub struct ClientInstance {
    client_id: String,
    pool: Arc<TunnelPool>,
    sessions: Arc<SessionRegistry<MinerSession>>,
    pool_address: Option<String>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInstance {
    /// Validate the config, dial the initial tunnel, bind the miner
    /// listener, and spawn the accept and router tasks.
    ///
    /// Startup fails if the server cannot be reached at all; once running,
    /// the refill loop absorbs tunnel loss.
    pub async fn start(cfg: ClientConfig) -> Result<Arc<Self>> {
        cfg.validate()?;
        let client_id = cfg.effective_client_id();
        let codec = FrameCodec::new(&cfg.secret_key, cfg.obfuscate)?;

        let (events_tx, events_rx) = mpsc::channel::<TunnelEvent>(EVENT_DEPTH);
        let sessions: Arc<SessionRegistry<MinerSession>> = SessionRegistry::new();
        let announce: AnnounceFn = {
            let sessions = Arc::clone(&sessions);
            Arc::new(move || sessions.ids())
        };
        let pool = TunnelPool::new(
            PoolConfig {
                remote_addr: cfg.remote.clone(),
                max_conn: cfg.max_conn,
                client_id: client_id.clone(),
            },
            codec,
            events_tx,
            announce,
        );

        pool.refill().await;
        if pool.len().await == 0 {
            return Err(Error::Pool(PoolError::NoTunnel));
        }

        let listener = TcpListener::bind(&cfg.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "client {} listening on {} ({} tunnel(s) to {})",
            client_id,
            local_addr,
            pool.len().await,
            cfg.remote
        );

        let instance = Arc::new(Self {
            client_id,
            pool: Arc::clone(&pool),
            sessions,
            pool_address: if cfg.pool_address.is_empty() {
                None
            } else {
                Some(cfg.pool_address.clone())
            },
            local_addr,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = instance.tasks.lock().await;
        tasks.push(pool.spawn_refill_loop());

        let acceptor = Arc::clone(&instance);
        tasks.push(tokio::spawn(async move {
            acceptor.accept_loop(listener).await;
        }));

        let router = Arc::clone(&instance);
        tasks.push(tokio::spawn(async move {
            router.route_events(events_rx).await;
        }));
        drop(tasks);

        Ok(instance)
    }

    /// Address miners should connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Live miner session count
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Pooled tunnel count
    pub async fn tunnel_count(&self) -> usize {
        self.pool.len().await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("miner connection from {}", peer);
                    MinerSession::spawn(
                        stream,
                        &self.client_id,
                        self.pool_address.clone(),
                        Arc::clone(&self.pool) as Arc<dyn EnvelopeSink>,
                        Arc::clone(&self.sessions),
                    );
                }
                Err(e) => {
                    warn!("miner accept failed: {}", e);
                }
            }
        }
    }

    /// Steer every inbound envelope to its session; answer pings inline
    async fn route_events(self: Arc<Self>, mut events: mpsc::Receiver<TunnelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::Envelope { envelope, .. } => {
                    if envelope.kind == EnvelopeType::Ping {
                        self.handle_ping(&envelope.data).await;
                        continue;
                    }
                    match self.sessions.get(&envelope.miner_id) {
                        Some(session) => session.handle_envelope(envelope).await,
                        None => {
                            // tell the server this circuit is gone here
                            debug!(
                                "no session for miner {} ({}), replying close",
                                envelope.miner_id, envelope.kind
                            );
                            if envelope.kind == EnvelopeType::Data {
                                let close =
                                    Envelope::close(&self.client_id, &envelope.miner_id);
                                if let Err(e) = self.pool.send(&close).await {
                                    debug!("close reply failed: {}", e);
                                }
                            }
                        }
                    }
                }
                TunnelEvent::Closed { tunnel_id } => {
                    self.pool.remove(tunnel_id).await;
                }
            }
        }
    }

    /// PONG with the subset of pinged ids this edge does not hold
    async fn handle_ping(&self, data: &[u8]) {
        let pinged = split_miner_ids(data);
        let held = self.sessions.ids();
        let pong = pong_reply(&self.client_id, &pinged, &held);
        if let Err(e) = self.pool.send(&pong).await {
            warn!("pong send failed: {}", e);
        }
    }

    /// Stop all tasks and close every tunnel and session
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for session in self.sessions.sessions() {
            session.teardown(false).await;
        }
        self.pool.close_all().await;
        info!("client {} stopped", self.client_id);
    }
}
