//! Client-side virtual circuit
//!
//! One [`MinerSession`] per accepted miner socket. The run task performs
//! the gated LOGIN handshake, then relays local reads as DATA envelopes
//! through the tunnel pool, one in flight at a time. Inbound envelopes are
//! routed here by the client engine.

use super::{AckGate, SessionError, SessionRegistry};
use crate::codec::{Envelope, EnvelopeType, LoginPayload};
use crate::pool::EnvelopeSink;
use crate::READ_CHUNK;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// A miner connection multiplexed over the tunnel pool
pub struct MinerSession {
    miner_id: String,
    client_id: String,
    gate: AckGate,
    local_write: Mutex<OwnedWriteHalf>,
    sink: Arc<dyn EnvelopeSink>,
    registry: Arc<SessionRegistry<MinerSession>>,
    closed: AtomicBool,
    /// Wakes the run task out of a blocked local read on teardown
    close_notify: Notify,
    started_at: Instant,
    bytes: AtomicU64,
}

impl MinerSession {
    /// Register a new session for an accepted miner socket and spawn its
    /// run task. The session owns the socket from here on.
    pub fn spawn(
        stream: TcpStream,
        client_id: &str,
        pool_address: Option<String>,
        sink: Arc<dyn EnvelopeSink>,
        registry: Arc<SessionRegistry<MinerSession>>,
    ) -> Arc<Self> {
        let miner_ip = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        let miner_id = format!("{:016x}", rand::random::<u64>());
        stream.set_nodelay(true).ok();
        let (mut read_half, write_half) = stream.into_split();

        let session = Arc::new(Self {
            miner_id: miner_id.clone(),
            client_id: client_id.to_string(),
            gate: AckGate::new(),
            local_write: Mutex::new(write_half),
            sink,
            registry: Arc::clone(&registry),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            started_at: Instant::now(),
            bytes: AtomicU64::new(0),
        });
        registry.insert(&miner_id, Arc::clone(&session));

        let runner = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = runner.login(pool_address, miner_ip).await {
                warn!("miner {} login failed: {}", runner.miner_id, e);
                runner.teardown(false).await;
                return;
            }
            // an ERROR reply may have torn the session down while the
            // login gate was still held
            if runner.is_closed() {
                return;
            }
            info!("miner {} logged in", runner.miner_id);

            let mut buf = [0u8; READ_CHUNK];
            loop {
                // register before the closed check so a teardown landing
                // in between still wakes the select below
                let closed = runner.close_notify.notified();
                tokio::pin!(closed);
                closed.as_mut().enable();
                if runner.is_closed() {
                    break;
                }
                let read = tokio::select! {
                    read = read_half.read(&mut buf) => read,
                    _ = &mut closed => break,
                };
                match read {
                    Ok(0) => {
                        debug!("miner {} local socket closed", runner.miner_id);
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = runner.forward(&buf[..n]).await {
                            warn!("miner {} send failed: {}", runner.miner_id, e);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("miner {} local read error: {}", runner.miner_id, e);
                        break;
                    }
                }
            }
            runner.teardown(true).await;
        });

        session
    }

    pub fn miner_id(&self) -> &str {
        &self.miner_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Gated LOGIN handshake: released by the server's LOGIN-ack
    async fn login(&self, pool_address: Option<String>, miner_ip: String) -> Result<(), SessionError> {
        let payload = LoginPayload {
            pool_address: pool_address.unwrap_or_default(),
            miner_ip,
        };
        let login = Envelope::with_data(
            EnvelopeType::Login,
            &self.client_id,
            &self.miner_id,
            payload.encode()?,
        );
        self.gate.send_gated(self.sink.as_ref(), login).await
    }

    /// Send one chunk of local bytes as a gated DATA envelope
    async fn forward(&self, chunk: &[u8]) -> Result<(), SessionError> {
        self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        let data = Envelope::data(&self.client_id, &self.miner_id, chunk.to_vec());
        self.gate.send_gated(self.sink.as_ref(), data).await
    }

    /// Route an inbound envelope for this miner id (called by the engine)
    pub async fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            // LOGIN doubles as the login-ack in the reverse direction
            EnvelopeType::Ack | EnvelopeType::Login => self.gate.release().await,
            EnvelopeType::Data => {
                self.bytes
                    .fetch_add(envelope.data.len() as u64, Ordering::Relaxed);
                let write_ok = {
                    let mut writer = self.local_write.lock().await;
                    writer.write_all(&envelope.data).await.is_ok()
                };
                if !write_ok {
                    debug!("miner {} local write failed", self.miner_id);
                    self.teardown(true).await;
                    return;
                }
                // server-side gate waits on this
                let ack = Envelope::ack(&self.client_id, &self.miner_id);
                if let Err(e) = self.sink.send(&ack).await {
                    warn!("miner {} ack send failed: {}", self.miner_id, e);
                    self.teardown(false).await;
                }
            }
            EnvelopeType::Close => {
                debug!("miner {} closed by peer", self.miner_id);
                self.teardown(false).await;
            }
            EnvelopeType::Error => {
                warn!(
                    "miner {} peer error: {}",
                    self.miner_id,
                    String::from_utf8_lossy(&envelope.data)
                );
                self.teardown(false).await;
            }
            other => debug!("miner {} ignoring {} envelope", self.miner_id, other),
        }
    }

    /// Idempotent teardown: close the local socket, deregister, and
    /// (optionally) tell the peer. Concurrent callers race harmlessly.
    pub async fn teardown(&self, notify_peer: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_waiters();
        self.registry.remove(&self.miner_id);
        // release any sender stuck in the gate so its task can exit
        self.gate.release().await;
        {
            let mut writer = self.local_write.lock().await;
            writer.shutdown().await.ok();
        }
        if notify_peer {
            let close = Envelope::close(&self.client_id, &self.miner_id);
            if let Err(e) = self.sink.send(&close).await {
                debug!("miner {} close notify failed: {}", self.miner_id, e);
            }
        }
        info!(
            "miner {} session ended ({} bytes)",
            self.miner_id,
            self.bytes.load(Ordering::Relaxed)
        );
    }
}
