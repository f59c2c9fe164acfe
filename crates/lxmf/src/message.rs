use std::collections::BTreeMap;

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use serde_bytes::ByteBuf;

use reticulum::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use reticulum::identity::{Identity, PrivateIdentity, SIGNATURE_LENGTH};

use crate::error::LxmfError;

pub const MAX_FIELDS: usize = 16;

/// Field key marking a bzip2-compressed content body.
pub const FIELD_CONTENT_BZ2: u8 = 0xFB;

const MIN_WIRE_LENGTH: usize = ADDRESS_HASH_SIZE * 2 + SIGNATURE_LENGTH;
const COMPRESS_THRESHOLD: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Generating,
    Outbound,
    Sending,
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    timestamp: f64,
    title: ByteBuf,
    content: ByteBuf,
    fields: BTreeMap<u8, ByteBuf>,
}

/// An addressed LXMF message: destination and source hashes, signed
/// msgpack payload of timestamp, title, content and up to 16 fields.
/// Wire layout: destination || source || signature || payload.
#[derive(Debug, Clone)]
pub struct LxmfMessage {
    pub source: AddressHash,
    pub destination: AddressHash,
    pub title: String,
    pub content: Vec<u8>,
    pub timestamp: f64,
    pub fields: BTreeMap<u8, Vec<u8>>,
    pub state: MessageState,
}

impl LxmfMessage {
    pub fn new(
        source: AddressHash,
        destination: AddressHash,
        title: &str,
        content: &[u8],
        timestamp: f64,
    ) -> Self {
        Self {
            source,
            destination,
            title: title.into(),
            content: content.to_vec(),
            timestamp,
            fields: BTreeMap::new(),
            state: MessageState::Generating,
        }
    }

    pub fn set_field(&mut self, key: u8, value: &[u8]) -> Result<(), LxmfError> {
        if !self.fields.contains_key(&key) && self.fields.len() >= MAX_FIELDS {
            return Err(LxmfError::PoolExhausted);
        }
        self.fields.insert(key, value.to_vec());
        Ok(())
    }

    fn encode_payload(&self) -> Result<Vec<u8>, LxmfError> {
        let mut fields: BTreeMap<u8, ByteBuf> = self
            .fields
            .iter()
            .map(|(key, value)| (*key, ByteBuf::from(value.clone())))
            .collect();

        // Long bodies ride compressed when that actually shrinks them.
        let content = if self.content.len() > COMPRESS_THRESHOLD {
            match reticulum::crypt::compress::bz2_compress(&self.content) {
                Ok(compressed) if compressed.len() < self.content.len() => {
                    fields.insert(FIELD_CONTENT_BZ2, ByteBuf::from(Vec::new()));
                    compressed
                }
                _ => self.content.clone(),
            }
        } else {
            self.content.clone()
        };

        let payload = Payload {
            timestamp: self.timestamp,
            title: ByteBuf::from(self.title.as_bytes().to_vec()),
            content: ByteBuf::from(content),
            fields,
        };
        rmp_serde::to_vec(&payload).map_err(|err| LxmfError::Encode(err.to_string()))
    }

    /// Message id: SHA-256 over destination, source and payload. Stable
    /// across transports; the key of every dedup ring and store entry.
    pub fn message_id(&self) -> Result<Hash, LxmfError> {
        let payload = self.encode_payload()?;
        Ok(Hash::new(
            Hash::generator()
                .chain_update(self.destination.as_slice())
                .chain_update(self.source.as_slice())
                .chain_update(&payload)
                .finalize()
                .into(),
        ))
    }

    /// Serializes and signs the message with the source identity.
    pub fn pack(&self, identity: &PrivateIdentity) -> Result<Vec<u8>, LxmfError> {
        let payload = self.encode_payload()?;

        let mut signed = Vec::with_capacity(ADDRESS_HASH_SIZE * 2 + payload.len());
        signed.extend_from_slice(self.destination.as_slice());
        signed.extend_from_slice(self.source.as_slice());
        signed.extend_from_slice(&payload);
        let signature = identity.sign(&signed);

        let mut out = Vec::with_capacity(MIN_WIRE_LENGTH + payload.len());
        out.extend_from_slice(self.destination.as_slice());
        out.extend_from_slice(self.source.as_slice());
        out.extend_from_slice(&signature.to_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parses a wire message without verifying its signature; callers
    /// verify once the source identity is known.
    pub fn unpack(bytes: &[u8]) -> Result<(Self, Vec<u8>), LxmfError> {
        if bytes.len() <= MIN_WIRE_LENGTH {
            return Err(LxmfError::Decode("message too short".into()));
        }

        let destination = AddressHash::try_from_slice(&bytes[..ADDRESS_HASH_SIZE])
            .map_err(|_| LxmfError::Decode("bad destination hash".into()))?;
        let source =
            AddressHash::try_from_slice(&bytes[ADDRESS_HASH_SIZE..ADDRESS_HASH_SIZE * 2])
                .map_err(|_| LxmfError::Decode("bad source hash".into()))?;

        let signature = bytes[ADDRESS_HASH_SIZE * 2..MIN_WIRE_LENGTH].to_vec();
        let payload_bytes = &bytes[MIN_WIRE_LENGTH..];

        let payload: Payload = rmp_serde::from_slice(payload_bytes)
            .map_err(|err| LxmfError::Decode(err.to_string()))?;

        if payload.fields.len() > MAX_FIELDS + 1 {
            return Err(LxmfError::Decode("too many fields".into()));
        }

        let compressed = payload.fields.contains_key(&FIELD_CONTENT_BZ2);
        let content = if compressed {
            reticulum::crypt::compress::bz2_decompress(payload.content.as_ref())
                .map_err(|_| LxmfError::Decode("bad compressed content".into()))?
        } else {
            payload.content.to_vec()
        };

        let fields = payload
            .fields
            .into_iter()
            .filter(|(key, _)| *key != FIELD_CONTENT_BZ2)
            .map(|(key, value)| (key, value.to_vec()))
            .collect();

        let title = String::from_utf8(payload.title.to_vec())
            .map_err(|_| LxmfError::Decode("title is not utf-8".into()))?;

        Ok((
            Self {
                source,
                destination,
                title,
                content,
                timestamp: payload.timestamp,
                fields,
                state: MessageState::Generating,
            },
            signature,
        ))
    }

    /// Verifies the wire signature against the claimed source identity.
    pub fn verify(bytes: &[u8], signature: &[u8], identity: &Identity) -> Result<(), LxmfError> {
        if bytes.len() <= MIN_WIRE_LENGTH {
            return Err(LxmfError::Decode("message too short".into()));
        }

        let mut signed = Vec::new();
        signed.extend_from_slice(&bytes[..ADDRESS_HASH_SIZE * 2]);
        signed.extend_from_slice(&bytes[MIN_WIRE_LENGTH..]);

        let signature =
            Signature::from_slice(signature).map_err(|_| LxmfError::InvalidSignature)?;
        identity.verify(&signed, &signature).map_err(|_| LxmfError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{LxmfMessage, FIELD_CONTENT_BZ2, MAX_FIELDS};
    use crate::error::LxmfError;
    use reticulum::hash::AddressHash;
    use reticulum::identity::PrivateIdentity;

    fn sample() -> (LxmfMessage, PrivateIdentity) {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let message = LxmfMessage::new(
            AddressHash::new_from_slice(b"source"),
            AddressHash::new_from_slice(b"destination"),
            "greeting",
            b"hello over the mesh",
            1_700_000_000.5,
        );
        (message, identity)
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let (mut message, identity) = sample();
        message.set_field(1, b"attachment").expect("field");

        let wire = message.pack(&identity).expect("packed");
        let (restored, signature) = LxmfMessage::unpack(&wire).expect("unpacked");

        assert_eq!(restored.source, message.source);
        assert_eq!(restored.destination, message.destination);
        assert_eq!(restored.title, "greeting");
        assert_eq!(restored.content, b"hello over the mesh");
        assert_eq!(restored.timestamp, message.timestamp);
        assert_eq!(restored.fields.get(&1).map(Vec::as_slice), Some(&b"attachment"[..]));

        LxmfMessage::verify(&wire, &signature, identity.as_identity()).expect("valid signature");
    }

    #[test]
    fn tampered_message_fails_verification() {
        let (message, identity) = sample();
        let mut wire = message.pack(&identity).expect("packed");
        let (_, signature) = LxmfMessage::unpack(&wire).expect("unpacked");

        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(
            LxmfMessage::verify(&wire, &signature, identity.as_identity()),
            Err(LxmfError::InvalidSignature)
        );
    }

    #[test]
    fn long_content_is_transparently_compressed() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let body = b"repetitive mesh content ".repeat(64);
        let message = LxmfMessage::new(
            AddressHash::new_from_slice(b"source"),
            AddressHash::new_from_slice(b"destination"),
            "bulk",
            &body,
            0.0,
        );

        let wire = message.pack(&identity).expect("packed");
        assert!(wire.len() < body.len(), "compressed wire form is smaller");

        let (restored, _) = LxmfMessage::unpack(&wire).expect("unpacked");
        assert_eq!(restored.content, body);
        assert!(!restored.fields.contains_key(&FIELD_CONTENT_BZ2), "marker field stripped");
    }

    #[test]
    fn field_pool_is_bounded() {
        let (mut message, _) = sample();
        for key in 0..MAX_FIELDS as u8 {
            message.set_field(key, b"value").expect("field slot");
        }
        assert_eq!(message.set_field(0xEE, b"overflow"), Err(LxmfError::PoolExhausted));

        // Overwriting an existing key is always allowed.
        message.set_field(0, b"updated").expect("overwrite");
    }

    #[test]
    fn message_id_is_stable_and_content_bound() {
        let (message, _) = sample();
        let first = message.message_id().expect("id");
        let second = message.message_id().expect("id");
        assert_eq!(first, second);

        let mut altered = message.clone();
        altered.content = b"different body".to_vec();
        assert_ne!(first, altered.message_id().expect("id"));
    }
}
