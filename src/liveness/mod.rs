//! Liveness probing, session reconciliation, and traffic shaping
//!
//! The server periodically PINGs every client with the miner ids it holds
//! for that client; the client PONGs back the subset it does NOT recognize,
//! and the server closes those orphaned circuits. RTT is measured over the
//! same exchange. [`OfflineTracker`] debounces offline notifications with a
//! reconnect grace period, and [`spawn_filler_loop`] keeps an obfuscated
//! tunnel's wire busy with filler frames at randomized intervals.

use crate::codec::{Envelope, EnvelopeType};
use crate::pool::{ClientDispatch, EnvelopeSink, Tunnel};
use crate::status::{OfflineNotifier, OfflineRecord};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default interval between reconciliation pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default grace period before a closed circuit is reported offline
pub const DEFAULT_OFFLINE_GRACE: Duration = Duration::from_secs(60);

/// Filler frame cadence bounds (seconds)
const FILLER_MIN_SECS: u64 = 3;
const FILLER_MAX_SECS: u64 = 15;

/// Join miner ids into a PING/PONG payload
pub fn join_miner_ids(ids: &[String]) -> Vec<u8> {
    ids.join(",").into_bytes()
}

/// Split a PING/PONG payload back into miner ids
pub fn split_miner_ids(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Send one reconciliation PING to a client: the payload lists every miner
/// id the server currently holds for it. Records the probe instant for RTT.
pub async fn send_ping(dispatch: &ClientDispatch, known_ids: &[String]) {
    let ping = Envelope::with_data(
        EnvelopeType::Ping,
        dispatch.client_id(),
        "",
        join_miner_ids(known_ids),
    );
    dispatch.mark_ping().await;
    if let Err(e) = dispatch.send(&ping).await {
        warn!("ping to client {} failed: {}", dispatch.client_id(), e);
    }
}

/// Build the PONG reply: echo back only the ids the client does not hold
pub fn pong_reply(client_id: &str, pinged: &[String], held: &[String]) -> Envelope {
    let unknown: Vec<String> = pinged
        .iter()
        .filter(|id| !held.contains(id))
        .cloned()
        .collect();
    Envelope::with_data(EnvelopeType::Pong, client_id, "", join_miner_ids(&unknown))
}

struct TrackedOffline {
    record: OfflineRecord,
    reported_after: Instant,
}

/// Debounces offline notifications.
///
/// A circuit that closes and is replaced within the grace period (miner
/// restart, tunnel blip) never reaches the notifier; only records still
/// pending when the sweep passes their deadline are reported.
pub struct OfflineTracker {
    grace: Duration,
    pending: Mutex<Vec<TrackedOffline>>,
    notifier: Arc<dyn OfflineNotifier>,
}

impl OfflineTracker {
    pub fn new(grace: Duration, notifier: Arc<dyn OfflineNotifier>) -> Arc<Self> {
        Arc::new(Self {
            grace,
            pending: Mutex::new(Vec::new()),
            notifier,
        })
    }

    /// Record a circuit closure; it will be reported after the grace period
    /// unless cancelled by a reconnect.
    pub fn record(&self, record: OfflineRecord) {
        let deadline = record.disconnected_at + self.grace;
        self.pending
            .lock()
            .expect("offline tracker poisoned")
            .push(TrackedOffline {
                record,
                reported_after: deadline,
            });
    }

    /// A miner with this ip/client reconnected; drop any pending records
    /// for it so no stale offline report fires.
    pub fn cancel(&self, client_id: &str, miner_ip: &str) {
        self.pending
            .lock()
            .expect("offline tracker poisoned")
            .retain(|t| !(t.record.client_id == client_id && t.record.miner_ip == miner_ip));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("offline tracker poisoned").len()
    }

    /// Report and drop every record past its grace deadline
    pub async fn sweep(&self) {
        let due: Vec<OfflineRecord> = {
            let mut pending = self.pending.lock().expect("offline tracker poisoned");
            let now = Instant::now();
            let mut due = Vec::new();
            pending.retain(|t| {
                if t.reported_after <= now {
                    due.push(t.record.clone());
                    false
                } else {
                    true
                }
            });
            due
        };
        for record in due {
            self.notifier.notify_offline(record).await;
        }
    }

    /// Sweep on a fixed cadence
    pub fn spawn_sweep_loop(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                tracker.sweep().await;
            }
        })
    }
}

/// Keep an obfuscated tunnel's wire pattern irregular: write a filler frame
/// every 3-15 seconds until the tunnel closes.
pub fn spawn_filler_loop(tunnel: Arc<Tunnel>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let secs = rand::thread_rng().gen_range(FILLER_MIN_SECS..=FILLER_MAX_SECS);
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if tunnel.is_closed() {
                break;
            }
            if let Err(e) = tunnel.write_filler().await {
                debug!("tunnel {} filler write failed: {}", tunnel.id(), e);
                break;
            }
        }
    })
}
