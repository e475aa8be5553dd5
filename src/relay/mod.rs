//! Backend relay - bridges one server-side session to a real downstream
//! TCP endpoint (the mining pool)
//!
//! The relay exclusively owns its socket. Bytes from the session go out
//! through [`BackendRelay::send`]; bytes from the pool come back on the
//! receiver returned by [`BackendRelay::connect`]. When the downstream
//! connection ends, both directions shut down and the receiver closes.

use crate::READ_CHUNK;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Dial timeout for the downstream address
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel depth between session and relay tasks
const CHANNEL_DEPTH: usize = 64;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Dial {0} failed: {1}")]
    Dial(String, std::io::Error),

    #[error("Dial {0} timed out")]
    DialTimeout(String),

    #[error("Relay closed")]
    Closed,
}

/// Handle to a running backend relay
pub struct BackendRelay {
    addr: String,
    outbound: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
    /// Cancels both relay tasks; also fires when the handle is dropped
    shutdown: watch::Sender<bool>,
}

impl BackendRelay {
    /// Dial the downstream address and start the relay tasks.
    ///
    /// Returns the handle plus the channel of bytes the downstream sends
    /// back. Dial failure is immediate; no tasks are left behind.
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::Receiver<Bytes>), RelayError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RelayError::DialTimeout(addr.to_string()))?
            .map_err(|e| RelayError::Dial(addr.to_string(), e))?;
        stream.set_nodelay(true).ok();

        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));
        // both tasks select on this so close() interrupts blocked IO; a
        // watch wakeup is never lost even if it races task startup
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // session -> downstream
        let writer_closed = Arc::clone(&closed);
        let writer_addr = addr.to_string();
        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    chunk = outbound_rx.recv() => chunk,
                    _ = writer_shutdown.changed() => break,
                };
                match chunk {
                    Some(chunk) => {
                        if let Err(e) = write_half.write_all(&chunk).await {
                            debug!("write to pool {} failed: {}", writer_addr, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            write_half.shutdown().await.ok();
        });

        // downstream -> session
        let reader_closed = Arc::clone(&closed);
        let reader_addr = addr.to_string();
        let mut reader_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                if reader_closed.load(Ordering::SeqCst) {
                    break;
                }
                let read = tokio::select! {
                    read = read_half.read(&mut buf) => read,
                    _ = reader_shutdown.changed() => break,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if inbound_tx
                            .send(Bytes::copy_from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("read from pool {} failed: {}", reader_addr, e);
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // dropping inbound_tx closes the receiver, unblocking the pump
        });

        Ok((
            Self {
                addr: addr.to_string(),
                outbound: outbound_tx,
                closed,
                shutdown: shutdown_tx,
            },
            inbound_rx,
        ))
    }

    /// Downstream address this relay is bridged to
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Push session bytes toward the downstream endpoint.
    ///
    /// The closed flag is checked before the channel send, so a send racing
    /// relay teardown returns [`RelayError::Closed`] instead of panicking.
    pub async fn send(&self, data: Bytes) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.outbound.send(data).await.map_err(|_| RelayError::Closed)
    }

    /// Whether either direction has shut down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent shutdown of both directions.
    ///
    /// Interrupts the relay tasks even while they are parked in a read or
    /// channel recv: the downstream socket gets its FIN and the inbound
    /// receiver closes without waiting for the handle to be dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}
