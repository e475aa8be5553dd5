//! Length-prefixed frame encode/decode and the async stream de-framer
//!
//! Wire format:
//! ```text
//! +-------------------------------+
//! |    Length (4B, big endian)    |
//! +-------------------------------+
//! |  AES-CBC( interleave?(body) ) |
//! +-------------------------------+
//! ```
//! where `body` is the msgpack envelope or a filler payload.

use super::{obfuscate, Cipher, CodecError, Envelope};
use crate::MAX_FRAME_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Shared per-endpoint frame codec: one cipher, one obfuscation flag.
///
/// Both ends of a tunnel must be constructed with the same key and flag.
#[derive(Clone)]
pub struct FrameCodec {
    cipher: Cipher,
    obfuscate: bool,
}

impl FrameCodec {
    pub fn new(secret_key: &str, obfuscate: bool) -> Result<Self, CodecError> {
        Ok(Self {
            cipher: Cipher::new(secret_key)?,
            obfuscate,
        })
    }

    /// Whether interleaving and filler frames are enabled
    pub fn obfuscation_enabled(&self) -> bool {
        self.obfuscate
    }

    /// Encode an envelope into a complete frame (length prefix included)
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        self.seal(&envelope.encode()?)
    }

    /// Encode a filler-only frame
    pub fn encode_filler(&self) -> Result<Vec<u8>, CodecError> {
        self.seal(&obfuscate::build_filler())
    }

    fn seal(&self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        let body = if self.obfuscate {
            self.cipher.encrypt(&obfuscate::interleave(body))
        } else {
            self.cipher.encrypt(body)
        };
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame body (length prefix already stripped by the reader).
    ///
    /// Returns `None` for filler frames, which carry no envelope.
    pub fn decode(&self, body: &[u8]) -> Result<Option<Envelope>, CodecError> {
        let plain = self.cipher.decrypt(body)?;
        let plain = if self.obfuscate {
            obfuscate::deinterleave(&plain)
        } else {
            plain
        };
        if obfuscate::is_filler(&plain) {
            return Ok(None);
        }
        Envelope::decode(&plain).map(Some)
    }
}

/// Read one frame body from the stream.
///
/// Reads exactly 4 length bytes, then exactly that many body bytes; a short
/// read awaits more data rather than yielding a partial frame. Oversized
/// length fields are a protocol error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EnvelopeType;

    fn roundtrip(codec: &FrameCodec, payload: &[u8]) -> Envelope {
        let env = Envelope::data("c1", "m1", payload.to_vec());
        let frame = codec.encode(&env).unwrap();
        // strip the 4-byte prefix the stream reader consumes
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        codec.decode(&frame[4..]).unwrap().unwrap()
    }

    #[test]
    fn test_roundtrip_plain() {
        let codec = FrameCodec::new("0123456789abcdef", false).unwrap();
        for payload in [&b""[..], b"1", b"hello", &[0u8; 4096]] {
            let decoded = roundtrip(&codec, payload);
            assert_eq!(decoded.data, payload);
            assert_eq!(decoded.kind, EnvelopeType::Data);
        }
    }

    #[test]
    fn test_roundtrip_obfuscated() {
        let codec = FrameCodec::new("0123456789abcdef", true).unwrap();
        for payload in [&b""[..], b"1", b"stratum submit", &[7u8; 2048]] {
            assert_eq!(roundtrip(&codec, payload).data, payload);
        }
    }

    #[test]
    fn test_corruption_never_decodes_silently() {
        let codec = FrameCodec::new("0123456789abcdef", false).unwrap();
        let env = Envelope::data("c1", "m1", b"important bytes".to_vec());
        let frame = codec.encode(&env).unwrap();

        for i in 4..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[i] ^= 0xFF;
            match codec.decode(&corrupted[4..]) {
                Err(_) => {}
                Ok(None) => panic!("corrupted frame decoded as filler"),
                Ok(Some(decoded)) => {
                    // CBC bit-flips that survive unpadding and msgpack must
                    // still trip the payload hash, never return wrong bytes.
                    panic!("corrupted frame decoded: {}", decoded);
                }
            }
        }
    }

    #[test]
    fn test_filler_frame_discarded() {
        let codec = FrameCodec::new("0123456789abcdef", true).unwrap();
        let frame = codec.encode_filler().unwrap();
        assert!(codec.decode(&frame[4..]).unwrap().is_none());
    }

    #[test]
    fn test_mismatched_flag_fails() {
        let sender = FrameCodec::new("0123456789abcdef", true).unwrap();
        let receiver = FrameCodec::new("0123456789abcdef", false).unwrap();
        let env = Envelope::data("c1", "m1", b"payload".to_vec());
        let frame = sender.encode(&env).unwrap();
        // interleaved bytes are not a valid envelope
        assert!(receiver.decode(&frame[4..]).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_exact() {
        let codec = FrameCodec::new("0123456789abcdef", false).unwrap();
        let env = Envelope::data("c1", "m1", b"chunk".to_vec());
        let mut wire = codec.encode(&env).unwrap();
        // a second frame directly behind the first
        wire.extend(codec.encode(&Envelope::ack("c1", "m1")).unwrap());

        let mut cursor = std::io::Cursor::new(wire);
        let first = read_frame(&mut cursor).await.unwrap();
        assert_eq!(codec.decode(&first).unwrap().unwrap().data, b"chunk");
        let second = read_frame(&mut cursor).await.unwrap();
        assert_eq!(
            codec.decode(&second).unwrap().unwrap().kind,
            EnvelopeType::Ack
        );
    }
}
