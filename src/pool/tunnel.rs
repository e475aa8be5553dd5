//! One physical tunnel connection
//!
//! A tunnel exclusively owns its TCP socket: the write half lives behind a
//! mutex on the [`Tunnel`] itself, the read half is consumed by a spawned
//! reader task that forwards decoded envelopes to the owner's event channel.
//! Closing is one-shot; a closed tunnel is never written again and its
//! owner removes it on the next dispatch.

use super::PoolError;
use crate::codec::{read_frame, Envelope, FrameCodec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace, warn};

/// Event emitted by a tunnel's reader task
#[derive(Debug)]
pub enum TunnelEvent {
    /// A decoded envelope arrived on this tunnel
    Envelope {
        tunnel_id: u64,
        envelope: Envelope,
    },
    /// The tunnel died (EOF, IO error, decode failure, or local close)
    Closed { tunnel_id: u64 },
}

/// An established tunnel connection
pub struct Tunnel {
    id: u64,
    peer: String,
    writer: Mutex<OwnedWriteHalf>,
    codec: FrameCodec,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Tunnel {
    /// Take over an established stream: split it, spawn the reader task,
    /// return the shared handle.
    pub fn start(
        id: u64,
        stream: TcpStream,
        codec: FrameCodec,
        events: mpsc::Sender<TunnelEvent>,
    ) -> Arc<Self> {
        stream.set_nodelay(true).ok();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (mut read_half, write_half) = stream.into_split();

        let tunnel = Arc::new(Self {
            id,
            peer,
            writer: Mutex::new(write_half),
            codec: codec.clone(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });

        let reader = Arc::clone(&tunnel);
        tokio::spawn(async move {
            loop {
                let body = tokio::select! {
                    result = read_frame(&mut read_half) => match result {
                        Ok(body) => body,
                        Err(e) => {
                            debug!("tunnel {} read ended: {}", reader.id, e);
                            break;
                        }
                    },
                    _ = reader.close_notify.notified() => break,
                };
                match reader.codec.decode(&body) {
                    Ok(Some(envelope)) => {
                        if events
                            .send(TunnelEvent::Envelope {
                                tunnel_id: reader.id,
                                envelope,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => {
                        trace!("tunnel {} discarded filler frame", reader.id);
                    }
                    Err(e) => {
                        // protocol integrity failure closes the whole tunnel
                        warn!("tunnel {} decode failed, closing: {}", reader.id, e);
                        break;
                    }
                }
            }
            reader.close();
            let _ = events.send(TunnelEvent::Closed { tunnel_id: reader.id }).await;
        });

        tunnel
    }

    /// Tunnel id, unique within its owner
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address, for logs
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Encode and write one envelope; a failed write closes the tunnel
    pub async fn write_envelope(&self, envelope: &Envelope) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::TunnelClosed);
        }
        let frame = self.codec.encode(envelope)?;
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&frame).await {
            self.close();
            return Err(PoolError::Io(e));
        }
        Ok(())
    }

    /// Write a filler-only frame (obfuscation keepalive)
    pub async fn write_filler(&self) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::TunnelClosed);
        }
        let frame = self.codec.encode_filler()?;
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&frame).await {
            self.close();
            return Err(PoolError::Io(e));
        }
        Ok(())
    }

    /// One-shot close; unblocks the reader task
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EnvelopeType;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tunnel_write_and_read() {
        let codec = FrameCodec::new("0123456789abcdef", false).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let server_codec = codec.clone();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Tunnel::start(1, stream, server_codec, events_tx)
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let (client_events_tx, _client_events_rx) = mpsc::channel(16);
        let client_tunnel = Tunnel::start(2, client_stream, codec, client_events_tx);
        let _server_tunnel = accept.await.unwrap();

        client_tunnel
            .write_envelope(&Envelope::data("c1", "m1", b"ping".to_vec()))
            .await
            .unwrap();

        match events_rx.recv().await.unwrap() {
            TunnelEvent::Envelope { tunnel_id, envelope } => {
                assert_eq!(tunnel_id, 1);
                assert_eq!(envelope.kind, EnvelopeType::Data);
                assert_eq!(envelope.data, b"ping");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_tunnel_rejects_writes() {
        let codec = FrameCodec::new("0123456789abcdef", false).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let tunnel = Tunnel::start(7, stream, codec, events_tx);

        tunnel.close();
        assert!(tunnel.is_closed());
        assert!(matches!(
            tunnel.write_envelope(&Envelope::ack("c1", "m1")).await,
            Err(PoolError::TunnelClosed)
        ));
        // reader task reports the close
        match events_rx.recv().await.unwrap() {
            TunnelEvent::Closed { tunnel_id } => assert_eq!(tunnel_id, 7),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
