//! Server-side virtual circuit
//!
//! A [`ServerSession`] exists for every LOGIN the server accepted. It owns
//! a [`BackendRelay`] to the downstream pool and pumps the pool's replies
//! back through the client's dispatch as gated DATA envelopes.

use super::{AckGate, SessionError, SessionRegistry};
use crate::codec::{Envelope, EnvelopeType, LoginPayload};
use crate::liveness::OfflineTracker;
use crate::pool::{ClientDispatch, EnvelopeSink};
use crate::relay::BackendRelay;
use crate::status::OfflineRecord;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// One miner circuit bridged to a downstream pool connection
pub struct ServerSession {
    miner_id: String,
    client_id: String,
    miner_ip: String,
    relay: BackendRelay,
    gate: AckGate,
    dispatch: Arc<ClientDispatch>,
    registry: Arc<SessionRegistry<ServerSession>>,
    offline: Arc<OfflineTracker>,
    closed: AtomicBool,
    started_at: Instant,
    stopped_at: Mutex<Option<Instant>>,
    bytes: AtomicU64,
}

impl ServerSession {
    /// Accept a LOGIN: dial the requested pool, register the session, ack
    /// the login, and spawn the downstream pump.
    ///
    /// A dial failure propagates without registering anything, so the
    /// caller can answer with an ERROR envelope.
    pub async fn open(
        login: &Envelope,
        default_pool: &str,
        dispatch: Arc<ClientDispatch>,
        registry: Arc<SessionRegistry<ServerSession>>,
        offline: Arc<OfflineTracker>,
    ) -> Result<Arc<Self>, SessionError> {
        let payload = LoginPayload::decode(&login.data)?;
        let pool_addr = if payload.pool_address.is_empty() {
            default_pool.to_string()
        } else {
            payload.pool_address
        };

        let (relay, inbound) = BackendRelay::connect(&pool_addr).await?;

        // a LOGIN resend may have raced us past the caller's duplicate
        // check; the first session wins and gets its ack repeated
        if let Some(existing) = registry.get(&login.miner_id) {
            relay.close();
            let ack = Envelope::new(EnvelopeType::Login, &login.client_id, &login.miner_id);
            if let Err(e) = dispatch.send(&ack).await {
                debug!("duplicate login ack failed: {}", e);
            }
            return Ok(existing);
        }

        // a reconnect within the grace period is not an outage
        offline.cancel(&login.client_id, &payload.miner_ip);
        let session = Arc::new(Self {
            miner_id: login.miner_id.clone(),
            client_id: login.client_id.clone(),
            miner_ip: payload.miner_ip,
            relay,
            gate: AckGate::new(),
            dispatch,
            registry: Arc::clone(&registry),
            offline,
            closed: AtomicBool::new(false),
            started_at: Instant::now(),
            stopped_at: Mutex::new(None),
            bytes: AtomicU64::new(0),
        });
        registry.insert(&session.miner_id, Arc::clone(&session));

        // login-ack releases the client-side gate
        let ack = Envelope::new(EnvelopeType::Login, &session.client_id, &session.miner_id);
        if let Err(e) = session.dispatch.send(&ack).await {
            session.teardown(false).await;
            return Err(e.into());
        }
        info!(
            "miner {} ({}) logged in, pool {}",
            session.miner_id,
            session.miner_ip,
            session.relay.address()
        );

        let pump = Arc::clone(&session);
        tokio::spawn(async move {
            pump.run_pump(inbound).await;
        });

        Ok(session)
    }

    pub fn miner_id(&self) -> &str {
        &self.miner_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn miner_ip(&self) -> &str {
        &self.miner_ip
    }

    pub fn pool_address(&self) -> &str {
        self.relay.address()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<Instant> {
        *self.stopped_at.lock().expect("session clock poisoned")
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Downstream -> client pump: one gated DATA per chunk
    async fn run_pump(&self, mut inbound: tokio::sync::mpsc::Receiver<Bytes>) {
        while let Some(chunk) = inbound.recv().await {
            if self.is_closed() {
                return;
            }
            self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            let data = Envelope::data(&self.client_id, &self.miner_id, chunk.to_vec());
            if let Err(e) = self.gate.send_gated(self.dispatch.as_ref(), data).await {
                warn!("miner {} pool relay send failed: {}", self.miner_id, e);
                break;
            }
        }
        // downstream hung up (or the gate gave up)
        self.teardown(true).await;
    }

    /// Route an inbound envelope for this miner id (called by the engine)
    pub async fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeType::Ack => self.gate.release().await,
            EnvelopeType::Data => {
                let len = envelope.data.len() as u64;
                let relayed = self.relay.send(Bytes::from(envelope.data)).await;
                // ack regardless: a dead relay still releases the client's
                // gate so its task can observe the CLOSE that follows
                let ack = Envelope::ack(&self.client_id, &self.miner_id);
                if let Err(e) = self.dispatch.send(&ack).await {
                    debug!("miner {} ack send failed: {}", self.miner_id, e);
                }
                match relayed {
                    Ok(()) => {
                        self.bytes.fetch_add(len, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("miner {} pool write failed: {}", self.miner_id, e);
                        self.teardown(true).await;
                    }
                }
            }
            EnvelopeType::Close => {
                debug!("miner {} closed by client", self.miner_id);
                self.teardown(false).await;
            }
            EnvelopeType::Error => {
                warn!(
                    "miner {} client error: {}",
                    self.miner_id,
                    String::from_utf8_lossy(&envelope.data)
                );
                self.teardown(false).await;
            }
            other => debug!("miner {} ignoring {} envelope", self.miner_id, other),
        }
    }

    /// Idempotent teardown: close the relay, deregister, queue the offline
    /// record, and (optionally) tell the client. Returns true only for the
    /// call that performed it.
    pub async fn teardown(&self, notify_peer: bool) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let stopped = Instant::now();
        *self.stopped_at.lock().expect("session clock poisoned") = Some(stopped);
        self.registry.remove(&self.miner_id);
        self.gate.release().await;
        self.relay.close();
        self.offline.record(OfflineRecord {
            client_id: self.client_id.clone(),
            miner_id: self.miner_id.clone(),
            miner_ip: self.miner_ip.clone(),
            pool_address: self.relay.address().to_string(),
            bytes_transferred: self.bytes.load(Ordering::Relaxed),
            disconnected_at: stopped,
        });
        if notify_peer {
            let close = Envelope::close(&self.client_id, &self.miner_id);
            if let Err(e) = self.dispatch.send(&close).await {
                debug!("miner {} close notify failed: {}", self.miner_id, e);
            }
        }
        info!(
            "miner {} session ended ({} bytes)",
            self.miner_id,
            self.bytes.load(Ordering::Relaxed)
        );
        true
    }
}
