//! Client-side tunnel pool
//!
//! Maintains `max_conn` tunnels to the server. Dispatch is round robin over
//! an ordered id list; a tunnel found closed at dispatch time is replaced
//! synchronously. A background loop tops the pool back up every 5 seconds,
//! so a dropped tunnel costs at most one refill tick. Every fresh tunnel
//! announces the client's live miner ids in an INIT handshake so the server
//! can reconcile its side.

use super::{try_times, EnvelopeSink, PoolError, Tunnel, TunnelEvent, SEND_BACKOFF, SEND_TRIES};
use crate::codec::{Envelope, EnvelopeType, FrameCodec, InitPayload};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of the miner ids announced on every INIT handshake
pub type AnnounceFn = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server tunnel endpoint
    pub remote_addr: String,
    /// Target pool size
    pub max_conn: usize,
    /// Logical client instance id
    pub client_id: String,
}

struct PoolInner {
    tunnels: HashMap<u64, Arc<Tunnel>>,
    /// Ordered ids for round robin; mutation is atomic w.r.t. cursor reads
    order: Vec<u64>,
}

/// The client's tunnel pool (one logical client instance -> one server)
pub struct TunnelPool {
    cfg: PoolConfig,
    codec: FrameCodec,
    inner: Mutex<PoolInner>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    events: mpsc::Sender<TunnelEvent>,
    announce: AnnounceFn,
}

impl TunnelPool {
    pub fn new(
        cfg: PoolConfig,
        codec: FrameCodec,
        events: mpsc::Sender<TunnelEvent>,
        announce: AnnounceFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            codec,
            inner: Mutex::new(PoolInner {
                tunnels: HashMap::new(),
                order: Vec::new(),
            }),
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            events,
            announce,
        })
    }

    /// Number of pooled tunnels
    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    /// Round-robin tunnel selection.
    ///
    /// A closed tunnel is replaced synchronously (dial + INIT) before
    /// returning. An empty pool gets one dial attempt; `None` only when
    /// that also fails.
    pub async fn get(&self) -> Option<Arc<Tunnel>> {
        let picked = {
            let inner = self.inner.lock().await;
            if inner.order.is_empty() {
                None
            } else {
                let index = self.cursor.fetch_add(1, Ordering::SeqCst) % inner.order.len();
                let id = inner.order[index];
                inner.tunnels.get(&id).cloned()
            }
        };

        match picked {
            Some(tunnel) if !tunnel.is_closed() => Some(tunnel),
            Some(dead) => {
                self.remove(dead.id()).await;
                match self.dial().await {
                    Ok(tunnel) => Some(tunnel),
                    Err(e) => {
                        warn!("tunnel replacement dial failed: {}", e);
                        None
                    }
                }
            }
            None => match self.dial().await {
                Ok(tunnel) => Some(tunnel),
                Err(e) => {
                    warn!("tunnel dial failed on empty pool: {}", e);
                    None
                }
            },
        }
    }

    /// Dial one tunnel, run the INIT handshake, insert it into the pool
    pub async fn dial(&self) -> Result<Arc<Tunnel>, PoolError> {
        let stream = TcpStream::connect(&self.cfg.remote_addr)
            .await
            .map_err(|e| PoolError::Dial(self.cfg.remote_addr.clone(), e))?;
        let local_ip = stream
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tunnel = Tunnel::start(id, stream, self.codec.clone(), self.events.clone());

        let payload = InitPayload {
            local_ip,
            miner_ids: (self.announce)(),
        };
        let init = Envelope::with_data(
            EnvelopeType::Init,
            &self.cfg.client_id,
            "",
            payload.encode()?,
        );
        tunnel.write_envelope(&init).await?;

        let mut inner = self.inner.lock().await;
        debug_assert!(!inner.order.contains(&id));
        inner.tunnels.insert(id, Arc::clone(&tunnel));
        inner.order.push(id);
        debug!(
            "tunnel {} -> {} established ({} pooled)",
            id,
            tunnel.peer(),
            inner.order.len()
        );
        Ok(tunnel)
    }

    /// Close and drop one tunnel; the id never reappears
    pub async fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(tunnel) = inner.tunnels.remove(&id) {
            tunnel.close();
        }
        inner.order.retain(|&t| t != id);
    }

    /// Top the pool back up to `max_conn`
    pub async fn refill(&self) {
        // sweep closed tunnels first so the target count means live tunnels
        let dead: Vec<u64> = {
            let inner = self.inner.lock().await;
            inner
                .tunnels
                .values()
                .filter(|t| t.is_closed())
                .map(|t| t.id())
                .collect()
        };
        for id in dead {
            self.remove(id).await;
        }

        while self.len().await < self.cfg.max_conn {
            match self.dial().await {
                Ok(_) => {}
                Err(e) => {
                    warn!("pool refill dial failed, retrying next tick: {}", e);
                    break;
                }
            }
        }
    }

    /// Spawn the 5-second refill loop
    pub fn spawn_refill_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            // first wake after one full interval: callers refill eagerly
            // before spawning the loop, and an immediate tick can mask a
            // just-removed tunnel from observers of the pool size
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + super::REFILL_INTERVAL,
                super::REFILL_INTERVAL,
            );
            loop {
                ticker.tick().await;
                pool.refill().await;
            }
        })
    }

    /// Close every tunnel (instance shutdown)
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        for tunnel in inner.tunnels.values() {
            tunnel.close();
        }
        inner.tunnels.clear();
        inner.order.clear();
        info!("tunnel pool closed");
    }
}

#[async_trait]
impl EnvelopeSink for TunnelPool {
    /// Send one envelope over any pooled tunnel, with bounded retries.
    ///
    /// A failed write removes the offending tunnel so the retry lands on a
    /// different (or freshly dialed) one.
    async fn send(&self, envelope: &Envelope) -> Result<(), PoolError> {
        try_times(SEND_TRIES, SEND_BACKOFF, || async {
            let tunnel = self.get().await.ok_or(PoolError::NoTunnel)?;
            match tunnel.write_envelope(envelope).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.remove(tunnel.id()).await;
                    Err(e)
                }
            }
        })
        .await
    }
}
