//! Server-side tunnel dispatch
//!
//! One [`ClientDispatch`] per observed client id accumulates the inbound
//! tunnel sockets that client dialed and round-robins envelopes among them.
//! When a dispatch loses its last tunnel it is evicted from the registry,
//! so a future re-INIT starts from a clean slate.

use super::{try_times, EnvelopeSink, PoolError, Tunnel, SEND_BACKOFF, SEND_TRIES};
use crate::codec::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct DispatchInner {
    conns: HashMap<u64, Arc<Tunnel>>,
    order: Vec<u64>,
}

/// All tunnels belonging to one logical client instance
pub struct ClientDispatch {
    client_id: String,
    inner: Mutex<DispatchInner>,
    cursor: AtomicUsize,
    started_at: Instant,
    /// Outstanding ping probe, if any (send instant)
    ping_sent_at: Mutex<Option<Instant>>,
    /// Last measured client<->server round trip
    rtt: Mutex<Option<Duration>>,
}

impl ClientDispatch {
    pub fn new(client_id: &str) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.to_string(),
            inner: Mutex::new(DispatchInner {
                conns: HashMap::new(),
                order: Vec::new(),
            }),
            cursor: AtomicUsize::new(0),
            started_at: Instant::now(),
            ping_sent_at: Mutex::new(None),
            rtt: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Register an inbound tunnel under this client
    pub async fn set_conn(&self, tunnel: Arc<Tunnel>) {
        let mut inner = self.inner.lock().await;
        let id = tunnel.id();
        if inner.conns.insert(id, tunnel).is_none() {
            inner.order.push(id);
        }
        debug!(
            "client {} now has {} tunnel(s)",
            self.client_id,
            inner.order.len()
        );
    }

    /// Round-robin over this client's live tunnels
    pub async fn get_conn(&self) -> Option<Arc<Tunnel>> {
        let mut inner = self.inner.lock().await;
        // at most one full lap before giving up
        for _ in 0..inner.order.len() {
            if inner.order.is_empty() {
                return None;
            }
            let index = self.cursor.fetch_add(1, Ordering::SeqCst) % inner.order.len();
            let id = inner.order[index];
            match inner.conns.get(&id) {
                Some(tunnel) if !tunnel.is_closed() => return Some(Arc::clone(tunnel)),
                _ => {
                    inner.conns.remove(&id);
                    inner.order.retain(|&t| t != id);
                }
            }
        }
        None
    }

    /// Drop one tunnel after a read/write failure
    pub async fn del_conn(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(tunnel) = inner.conns.remove(&id) {
            tunnel.close();
        }
        inner.order.retain(|&t| t != id);
    }

    pub async fn conn_count(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    /// Record a ping probe send instant
    pub async fn mark_ping(&self) {
        *self.ping_sent_at.lock().await = Some(Instant::now());
    }

    /// Resolve an outstanding probe into an RTT measurement
    pub async fn mark_pong(&self) {
        let mut sent = self.ping_sent_at.lock().await;
        if let Some(at) = sent.take() {
            *self.rtt.lock().await = Some(at.elapsed());
        }
    }

    pub async fn rtt(&self) -> Option<Duration> {
        *self.rtt.lock().await
    }
}

#[async_trait]
impl EnvelopeSink for ClientDispatch {
    async fn send(&self, envelope: &Envelope) -> Result<(), PoolError> {
        try_times(SEND_TRIES, SEND_BACKOFF, || async {
            let tunnel = self.get_conn().await.ok_or(PoolError::NoTunnel)?;
            match tunnel.write_envelope(envelope).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.del_conn(tunnel.id()).await;
                    Err(e)
                }
            }
        })
        .await
    }
}

/// Injectable registry of dispatches, keyed by client id.
///
/// Scoped to one running server instance; multiple instances can coexist
/// in one process (and in tests).
#[derive(Default)]
pub struct DispatchRegistry {
    inner: Mutex<HashMap<String, Arc<ClientDispatch>>>,
}

impl DispatchRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<ClientDispatch>> {
        self.inner.lock().await.get(client_id).cloned()
    }

    pub async fn get_or_create(&self, client_id: &str) -> Arc<ClientDispatch> {
        let mut inner = self.inner.lock().await;
        inner
            .entry(client_id.to_string())
            .or_insert_with(|| ClientDispatch::new(client_id))
            .clone()
    }

    /// Drop a tunnel from its dispatch; evict the dispatch when it holds
    /// no tunnels so a re-INIT starts clean.
    pub async fn remove_conn(&self, client_id: &str, tunnel_id: u64) {
        let dispatch = match self.get(client_id).await {
            Some(d) => d,
            None => return,
        };
        dispatch.del_conn(tunnel_id).await;
        if dispatch.conn_count().await == 0 {
            self.inner.lock().await.remove(client_id);
            debug!("client {} evicted (no tunnels left)", client_id);
        }
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::pool::TunnelEvent;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    async fn test_tunnel(id: u64) -> Arc<Tunnel> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            // hold the socket open
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let codec = FrameCodec::new("0123456789abcdef", false).unwrap();
        let (events_tx, _events_rx) = mpsc::channel::<TunnelEvent>(4);
        Tunnel::start(id, stream, codec, events_tx)
    }

    #[tokio::test]
    async fn test_dispatch_round_robin() {
        let dispatch = ClientDispatch::new("c1");
        dispatch.set_conn(test_tunnel(1).await).await;
        dispatch.set_conn(test_tunnel(2).await).await;
        assert_eq!(dispatch.conn_count().await, 2);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(dispatch.get_conn().await.unwrap().id());
        }
        assert!(seen.contains(&1));
        assert!(seen.contains(&2));
    }

    #[tokio::test]
    async fn test_dispatch_skips_closed() {
        let dispatch = ClientDispatch::new("c1");
        let t1 = test_tunnel(1).await;
        let t2 = test_tunnel(2).await;
        dispatch.set_conn(Arc::clone(&t1)).await;
        dispatch.set_conn(Arc::clone(&t2)).await;

        t1.close();
        for _ in 0..4 {
            assert_eq!(dispatch.get_conn().await.unwrap().id(), 2);
        }
        assert_eq!(dispatch.conn_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_evicts_empty_dispatch() {
        let registry = DispatchRegistry::new();
        let dispatch = registry.get_or_create("c1").await;
        dispatch.set_conn(test_tunnel(1).await).await;
        assert_eq!(registry.len().await, 1);

        registry.remove_conn("c1", 1).await;
        assert!(registry.is_empty().await);
        // a re-INIT starts clean
        let fresh = registry.get_or_create("c1").await;
        assert_eq!(fresh.conn_count().await, 0);
    }
}
