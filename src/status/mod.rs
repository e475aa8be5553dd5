//! Operator-facing status reporting
//!
//! The engines publish periodic per-session snapshots and one-shot offline
//! records through the sinks defined here. The default [`LogSink`] writes
//! them to the log; deployments wanting a webhook or database implement the
//! traits themselves and inject their sink at engine construction.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::info;

/// Point-in-time snapshot of one live circuit
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub client_id: String,
    pub miner_id: String,
    pub miner_ip: String,
    pub pool_address: String,
    pub bytes_transferred: u64,
    pub connected_for: Duration,
    /// Last measured client<->server round trip, when known
    pub rtt: Option<Duration>,
}

/// A circuit that went offline
#[derive(Debug, Clone)]
pub struct OfflineRecord {
    pub client_id: String,
    pub miner_id: String,
    pub miner_ip: String,
    pub pool_address: String,
    pub bytes_transferred: u64,
    pub disconnected_at: Instant,
}

/// Receives periodic status snapshots
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, update: StatusUpdate);
}

/// Receives offline notifications once per closed circuit, after the
/// reconnect grace period has elapsed
#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    async fn notify_offline(&self, record: OfflineRecord);
}

/// Default sink: everything goes to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn publish(&self, update: StatusUpdate) {
        info!(
            client_id = %update.client_id,
            miner_id = %update.miner_id,
            miner_ip = %update.miner_ip,
            pool = %update.pool_address,
            bytes = update.bytes_transferred,
            connected_secs = update.connected_for.as_secs(),
            rtt_ms = update.rtt.map(|d| d.as_millis() as u64),
            "session status"
        );
    }
}

#[async_trait]
impl OfflineNotifier for LogSink {
    async fn notify_offline(&self, record: OfflineRecord) {
        info!(
            client_id = %record.client_id,
            miner_id = %record.miner_id,
            miner_ip = %record.miner_ip,
            pool = %record.pool_address,
            bytes = record.bytes_transferred,
            "miner offline"
        );
    }
}
