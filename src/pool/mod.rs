//! Tunnel pooling and dispatch
//!
//! The client keeps a pool of `max_conn` tunnels to the server and
//! round-robins envelopes across them ([`TunnelPool`]); the server groups
//! inbound tunnels by logical client id and fans out the same way
//! ([`ClientDispatch`]). Any single tunnel may be mid-reconnection at any
//! time, so every send goes through the bounded-retry [`try_times`] helper.

mod client_pool;
mod dispatch;
mod tunnel;

pub use client_pool::{AnnounceFn, PoolConfig, TunnelPool};
pub use dispatch::{ClientDispatch, DispatchRegistry};
pub use tunnel::{Tunnel, TunnelEvent};

use crate::codec::Envelope;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Attempts per envelope send before the owning session gives up
pub const SEND_TRIES: usize = 3;

/// Backoff between send attempts
pub const SEND_BACKOFF: Duration = Duration::from_secs(1);

/// Pool refill cadence
pub const REFILL_INTERVAL: Duration = Duration::from_secs(5);

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No tunnel available")]
    NoTunnel,

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Dial {0} failed: {1}")]
    Dial(String, std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can carry an envelope to the peer.
///
/// Implemented by [`TunnelPool`] (client side) and [`ClientDispatch`]
/// (server side) so session code is symmetric across both edges.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<(), PoolError>;
}

/// Run `f` up to `max_tries` times, sleeping `backoff` between failures.
///
/// Returns the first success or the last error. Never retries forever:
/// callers that exhaust their tries close the owning session.
pub async fn try_times<F, Fut, T, E>(max_tries: usize, backoff: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 0..max_tries {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < max_tries {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err.expect("max_tries must be > 0"))
}
