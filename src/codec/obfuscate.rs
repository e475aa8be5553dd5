//! Traffic-shape obfuscation
//!
//! Two mechanisms, both keyed off the shared obfuscation flag:
//!
//! - **Interleaving**: one pseudo-random filler byte is inserted before every
//!   plaintext byte prior to encryption, doubling the apparent payload size.
//!   The receiver keeps every second byte after decryption.
//! - **Filler frames**: whole frames of random bytes tagged with a fixed
//!   marker prefix, sent periodically so the tunnel never falls silent.
//!   Receivers discard them after decode without touching any session.

use rand::Rng;

/// Marker prefix identifying a filler-only frame body
pub const FILLER_MARKER: &[u8; 12] = b"random-relay";

/// Filler body length bounds (marker excluded)
const FILLER_MIN: usize = 10;
const FILLER_MAX: usize = 102;

/// Insert one random filler byte (1..=255) before every data byte
pub fn interleave(data: &[u8]) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut result = Vec::with_capacity(data.len() * 2);
    for &b in data {
        result.push(rng.gen_range(1..=255u8));
        result.push(b);
    }
    result
}

/// Undo [`interleave`]: keep every second byte
pub fn deinterleave(data: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, &b)| b)
        .collect()
}

/// Build a filler frame body: marker + 10..102 random bytes
pub fn build_filler() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(FILLER_MIN..=FILLER_MAX);
    let mut data = Vec::with_capacity(FILLER_MARKER.len() + len);
    data.extend_from_slice(FILLER_MARKER);
    for _ in 0..len {
        data.push(rng.gen_range(1..=255u8));
    }
    data
}

/// Check whether a decoded body is filler
pub fn is_filler(data: &[u8]) -> bool {
    data.starts_with(FILLER_MARKER)
}
