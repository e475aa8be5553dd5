//! AES-CBC encryption with the normalized pre-shared key
//!
//! The IV is the leading 16 bytes of the normalized key rather than a random
//! nonce. This is a known weakening (identical plaintext under the same key
//! encrypts identically across sessions) kept deliberately: both ends derive
//! the IV from the shared secret and no IV travels on the wire. Changing it
//! would break interoperability with the deployed protocol.

use super::CodecError;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes256};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size in bytes; also the IV length
const BLOCK: usize = 16;

/// Maximum key length before normalization
const MAX_KEY_LEN: usize = 32;

/// Normalize a configured secret key.
///
/// Keys longer than 32 bytes are rejected; shorter keys are right-padded
/// with `'0'` bytes to the next multiple of 16. Normalizing an
/// already-normalized key returns it unchanged.
pub fn normalize_key(key: &str) -> Result<Vec<u8>, CodecError> {
    if key.is_empty() {
        return Err(CodecError::EmptyKey);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CodecError::KeyTooLong(key.len()));
    }
    let mut bytes = key.as_bytes().to_vec();
    while bytes.len() % BLOCK != 0 {
        bytes.push(b'0');
    }
    Ok(bytes)
}

/// AES-CBC cipher bound to one normalized key
#[derive(Clone)]
pub enum Cipher {
    Aes128 { key: [u8; 16] },
    Aes256 { key: [u8; 32] },
}

impl Cipher {
    /// Build a cipher from a configured (unnormalized) secret key
    pub fn new(secret_key: &str) -> Result<Self, CodecError> {
        let key = normalize_key(secret_key)?;
        match key.len() {
            16 => {
                let mut k = [0u8; 16];
                k.copy_from_slice(&key);
                Ok(Cipher::Aes128 { key: k })
            }
            32 => {
                let mut k = [0u8; 32];
                k.copy_from_slice(&key);
                Ok(Cipher::Aes256 { key: k })
            }
            // normalize_key only yields 16 or 32 under the 32-byte cap
            n => Err(CodecError::KeyTooLong(n)),
        }
    }

    fn iv(&self) -> [u8; BLOCK] {
        let mut iv = [0u8; BLOCK];
        match self {
            Cipher::Aes128 { key } => iv.copy_from_slice(&key[..BLOCK]),
            Cipher::Aes256 { key } => iv.copy_from_slice(&key[..BLOCK]),
        }
        iv
    }

    /// Encrypt with PKCS7 padding
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let iv = self.iv();
        match self {
            Cipher::Aes128 { key } => Aes128CbcEnc::new(key.into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Cipher::Aes256 { key } => Aes256CbcEnc::new(key.into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        }
    }

    /// Decrypt and strip PKCS7 padding
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let iv = self.iv();
        let result = match self {
            Cipher::Aes128 { key } => Aes128CbcDec::new(key.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            Cipher::Aes256 { key } => Aes256CbcDec::new(key.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        };
        result.map_err(|_| CodecError::Decryption)
    }
}
