//! Wire codec - envelope serialization, encryption, obfuscation, framing
//!
//! Every frame on a tunnel is `[4-byte big-endian length][body]`, where the
//! body is the msgpack-encoded [`Envelope`], optionally interleaved with
//! filler bytes, then AES-CBC encrypted with the pre-shared key.

mod crypto;
mod envelope;
mod frame;
mod obfuscate;

pub use crypto::{normalize_key, Cipher};
pub use envelope::{Envelope, EnvelopeType, InitPayload, LoginPayload};
pub use frame::{read_frame, FrameCodec};
pub use obfuscate::{build_filler, deinterleave, interleave, is_filler, FILLER_MARKER};

use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Envelope encoding failed: {0}")]
    Encoding(#[from] rmp_serde::encode::Error),

    #[error("Envelope decoding failed: {0}")]
    Decoding(#[from] rmp_serde::decode::Error),

    #[error("Data hash mismatch: got={got} want={want}")]
    Integrity { got: String, want: String },

    #[error("Decryption failed (wrong key or corrupted stream)")]
    Decryption,

    #[error("Secret key is empty")]
    EmptyKey,

    #[error("Secret key too long: {0} bytes (max 32)")]
    KeyTooLong(usize),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Unknown envelope type: {0}")]
    UnknownType(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
