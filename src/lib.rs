//! # Miner Tunnel
//!
//! An encrypted, traffic-obfuscating TCP tunnel that multiplexes many
//! independent miner sessions between a client edge and a server edge,
//! relaying each session to a backend pool address chosen per session.
//!
//! ## Features
//!
//! - **Fixed-key AES-CBC encryption** of every frame (pre-shared secret)
//! - **Traffic obfuscation** via byte interleaving and filler frames
//! - **Pooled tunnels** with round-robin dispatch and lazy reconnection
//! - **Stop-and-wait flow control** per miner session (one DATA in flight)
//! - **Ping/pong reconciliation** that purges sessions dead on the far side
//!
//! ## Architecture
//!
//! ```text
//! miner socket ── Session (client) ── Codec ── Tunnel Pool ── network ──
//!   Tunnel Dispatch ── Codec ── Session (server) ── Backend Relay ── pool
//! ```
//!
//! The reverse path carries response bytes and the control frames
//! (ACK, PING/PONG, CLOSE, ERROR).

pub mod client;
pub mod codec;
pub mod config;
pub mod liveness;
pub mod pool;
pub mod relay;
pub mod server;
pub mod session;
pub mod status;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum frame body size (16 MiB). Frames grow as needed below this cap.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read chunk size for miner and backend sockets.
pub const READ_CHUNK: usize = 1024;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(String),
}
