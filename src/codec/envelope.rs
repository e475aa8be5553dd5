//! Protocol envelope carried inside every frame
//!
//! Envelopes are serialized as msgpack maps with stable field names
//! (`client_id`, `miner_id`, `type`, `data`, `hash`) - wire compatibility
//! depends on those names never changing. `hash` is the CRC32-IEEE checksum
//! of `data`, rendered as a decimal string, verified at decode time.

use super::CodecError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Envelope types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeType {
    /// Open a session: payload is a [`LoginPayload`]
    Login = 0,
    /// Tunnel handshake: payload is an [`InitPayload`]
    Init = 1,
    /// Session bytes
    Data = 2,
    /// Liveness probe carrying the sender's known miner ids
    Ping = 3,
    /// Probe reply carrying the miner ids the sender does not know
    Pong = 4,
    /// Acknowledge a DATA or LOGIN
    Ack = 5,
    /// Peer-side failure for this miner id
    Error = 6,
    /// Session teardown
    Close = 7,
    /// Reserved for out-of-band registration
    Register = 8,
}

impl TryFrom<u8> for EnvelopeType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(EnvelopeType::Login),
            1 => Ok(EnvelopeType::Init),
            2 => Ok(EnvelopeType::Data),
            3 => Ok(EnvelopeType::Ping),
            4 => Ok(EnvelopeType::Pong),
            5 => Ok(EnvelopeType::Ack),
            6 => Ok(EnvelopeType::Error),
            7 => Ok(EnvelopeType::Close),
            8 => Ok(EnvelopeType::Register),
            _ => Err(CodecError::UnknownType(value)),
        }
    }
}

impl Serialize for EnvelopeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for EnvelopeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        EnvelopeType::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnvelopeType::Login => "login",
            EnvelopeType::Init => "init",
            EnvelopeType::Data => "data",
            EnvelopeType::Ping => "ping",
            EnvelopeType::Pong => "pong",
            EnvelopeType::Ack => "ack",
            EnvelopeType::Error => "error",
            EnvelopeType::Close => "close",
            EnvelopeType::Register => "register",
        };
        f.write_str(name)
    }
}

/// The structured protocol message carried inside one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical client instance id
    #[serde(rename = "client_id")]
    pub client_id: String,
    /// Virtual circuit id within that client
    #[serde(rename = "miner_id")]
    pub miner_id: String,
    /// Checksum of `data`, set at encode time, verified at decode time.
    /// Empty for internally-constructed control envelopes.
    #[serde(rename = "hash")]
    pub hash: String,
    /// Envelope type
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Payload bytes
    #[serde(rename = "data", with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Envelope {
    /// Create an envelope with empty payload
    pub fn new(kind: EnvelopeType, client_id: &str, miner_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            miner_id: miner_id.to_string(),
            hash: String::new(),
            kind,
            data: Vec::new(),
        }
    }

    /// Create an envelope carrying payload bytes
    pub fn with_data(kind: EnvelopeType, client_id: &str, miner_id: &str, data: Vec<u8>) -> Self {
        let mut env = Self::new(kind, client_id, miner_id);
        env.data = data;
        env
    }

    /// Create a DATA envelope
    pub fn data(client_id: &str, miner_id: &str, data: Vec<u8>) -> Self {
        Self::with_data(EnvelopeType::Data, client_id, miner_id, data)
    }

    /// Create an ACK envelope
    pub fn ack(client_id: &str, miner_id: &str) -> Self {
        Self::new(EnvelopeType::Ack, client_id, miner_id)
    }

    /// Create a CLOSE envelope
    pub fn close(client_id: &str, miner_id: &str) -> Self {
        Self::new(EnvelopeType::Close, client_id, miner_id)
    }

    /// Create an ERROR envelope with a human-readable reason
    pub fn error(client_id: &str, miner_id: &str, reason: &str) -> Self {
        Self::with_data(
            EnvelopeType::Error,
            client_id,
            miner_id,
            reason.as_bytes().to_vec(),
        )
    }

    /// Serialize, setting `hash` over the payload
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut env = self.clone();
        env.hash = crc32fast::hash(&env.data).to_string();
        Ok(rmp_serde::to_vec_named(&env)?)
    }

    /// Deserialize and verify `hash` against the payload.
    ///
    /// An empty hash skips verification; control envelopes built without
    /// `encode` carry no checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let env: Envelope = rmp_serde::from_slice(bytes)?;
        if !env.hash.is_empty() {
            let want = crc32fast::hash(&env.data).to_string();
            if env.hash != want {
                return Err(CodecError::Integrity {
                    got: env.hash,
                    want,
                });
            }
        }
        Ok(env)
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "client_id={},miner_id={},type={},data_size={}",
            self.client_id,
            self.miner_id,
            self.kind,
            self.data.len()
        )
    }
}

/// LOGIN payload: where this miner's bytes should end up
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginPayload {
    /// Explicit backend pool address; empty means use the server default
    #[serde(rename = "pool_address")]
    pub pool_address: String,
    /// Apparent IP of the originating miner
    #[serde(rename = "miner_ip")]
    pub miner_ip: String,
}

impl LoginPayload {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// INIT payload: announced on every fresh tunnel dial
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitPayload {
    /// Local IP hint for the server's status view
    #[serde(rename = "local_ip")]
    pub local_ip: String,
    /// Miner ids the client currently holds open, for server reconciliation
    #[serde(rename = "miner_ids")]
    pub miner_ids: Vec<String>,
}

impl InitPayload {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let original = Envelope::data("c1", "m1", b"Hello, World!".to_vec());
        let bytes = original.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        assert_eq!(decoded.client_id, "c1");
        assert_eq!(decoded.miner_id, "m1");
        assert_eq!(decoded.kind, EnvelopeType::Data);
        assert_eq!(decoded.data, b"Hello, World!");
        assert!(!decoded.hash.is_empty());
    }

    #[test]
    fn test_hash_mismatch_rejected() {
        let mut env = Envelope::data("c1", "m1", b"payload".to_vec());
        env.hash = "12345".to_string();
        let bytes = rmp_serde::to_vec_named(&env).unwrap();

        match Envelope::decode(&bytes) {
            Err(CodecError::Integrity { .. }) => {}
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_hash_skips_verification() {
        let env = Envelope::ack("c1", "m1");
        let bytes = rmp_serde::to_vec_named(&env).unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, EnvelopeType::Ack);
    }

    #[test]
    fn test_envelope_type_from_u8() {
        assert_eq!(EnvelopeType::try_from(0).unwrap(), EnvelopeType::Login);
        assert_eq!(EnvelopeType::try_from(8).unwrap(), EnvelopeType::Register);
        assert!(EnvelopeType::try_from(9).is_err());
    }

    #[test]
    fn test_login_payload_roundtrip() {
        let payload = LoginPayload {
            pool_address: "pool.example.com:3333".to_string(),
            miner_ip: "10.0.0.7".to_string(),
        };
        let decoded = LoginPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded.pool_address, "pool.example.com:3333");
        assert_eq!(decoded.miner_ip, "10.0.0.7");
    }
}
