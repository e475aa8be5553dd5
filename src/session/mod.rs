//! Virtual circuits (sessions) and their stop-and-wait flow control
//!
//! A session is one end-user (miner) TCP connection multiplexed over the
//! tunnels, identified by its miner id. The client side backs a session
//! with the local socket, the server side with a backend relay; both run
//! the same [`AckGate`]: one unacknowledged DATA in flight, bounded
//! resends, then close. That gate is what keeps a single slow miner from
//! flooding a shared tunnel.

mod client;
mod server;

pub use client::MinerSession;
pub use server::ServerSession;

use crate::codec::Envelope;
use crate::pool::{EnvelopeSink, PoolError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::debug;

/// How long to wait for an ACK before resending
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Resend attempts before the session closes
pub const MAX_RESENDS: usize = 3;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No acknowledgement after {0} resends")]
    AckTimeout(usize),

    #[error("Session closed")]
    Closed,

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Relay error: {0}")]
    Relay(#[from] crate::relay::RelayError),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

enum GateState {
    Ready,
    /// A DATA/LOGIN is outstanding; kept for resends
    Waiting(Envelope),
}

/// Stop-and-wait send gate.
///
/// [`AckGate::send_gated`] transmits one envelope and blocks until the
/// matching ACK releases the gate, resending on timeout up to
/// [`MAX_RESENDS`] times. Callers drive it from a single task per session,
/// so at most one envelope is ever outstanding per circuit.
pub struct AckGate {
    state: AsyncMutex<GateState>,
    notify: Notify,
}

impl Default for AckGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AckGate {
    pub fn new() -> Self {
        Self {
            state: AsyncMutex::new(GateState::Ready),
            notify: Notify::new(),
        }
    }

    /// Whether an envelope is outstanding
    pub async fn is_waiting(&self) -> bool {
        matches!(*self.state.lock().await, GateState::Waiting(_))
    }

    /// Release the gate (matching ACK or LOGIN-ack arrived)
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        *state = GateState::Ready;
        self.notify.notify_waiters();
    }

    /// Send `envelope` through `sink` and wait for release.
    ///
    /// On timeout the stored envelope is resent; after [`MAX_RESENDS`]
    /// unanswered sends the gate fails and the owning session must close.
    pub async fn send_gated(
        &self,
        sink: &dyn EnvelopeSink,
        envelope: Envelope,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock().await;
            *state = GateState::Waiting(envelope.clone());
        }
        sink.send(&envelope).await?;

        for attempt in 0..=MAX_RESENDS {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_waiting().await {
                return Ok(());
            }
            match tokio::time::timeout(ACK_TIMEOUT, notified).await {
                Ok(()) => {
                    if !self.is_waiting().await {
                        return Ok(());
                    }
                }
                Err(_) if attempt < MAX_RESENDS => {
                    debug!("ack timeout, resending {}", envelope);
                    let pending = {
                        let state = self.state.lock().await;
                        match &*state {
                            GateState::Waiting(env) => env.clone(),
                            GateState::Ready => return Ok(()),
                        }
                    };
                    sink.send(&pending).await?;
                }
                Err(_) => break,
            }
        }
        Err(SessionError::AckTimeout(MAX_RESENDS))
    }
}

/// Injectable session table, generic over the concrete session type.
///
/// Scoped to one running instance; no process-wide state. A removed id
/// never reappears: sessions insert themselves exactly once at creation.
pub struct SessionRegistry<S> {
    inner: Mutex<HashMap<String, Arc<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, id: &str, session: Arc<S>) {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .insert(id.to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<S>> {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<S>> {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .contains_key(id)
    }

    /// Snapshot of live session ids
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of live sessions
    pub fn sessions(&self) -> Vec<Arc<S>> {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
