use core::fmt;
use std::time::{Duration, Instant};

use ed25519_dalek::Signature;

use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, HASH_SIZE};
use crate::identity::{Identity, PrivateIdentity, SIGNATURE_LENGTH};
use crate::packet::{DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType};

pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROOF_PAYLOAD_LENGTH: usize = HASH_SIZE + SIGNATURE_LENGTH;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Failed,
}

pub type ReceiptCallback = Box<dyn FnMut(&ReceiptEvent) + Send>;

/// Snapshot handed to receipt callbacks.
#[derive(Debug, Clone)]
pub struct ReceiptEvent {
    pub packet_hash: Hash,
    pub truncated_hash: AddressHash,
    pub status: ReceiptStatus,
    pub rtt: Duration,
}

/// Observable bound to a sent packet: SENT until a matching proof arrives
/// (DELIVERED) or the timeout fires (FAILED).
pub struct PacketReceipt {
    packet_hash: Hash,
    truncated_hash: AddressHash,
    sent_at: Instant,
    timeout: Duration,
    status: ReceiptStatus,
    on_delivery: Option<ReceiptCallback>,
    on_timeout: Option<ReceiptCallback>,
}

impl PacketReceipt {
    pub fn new(packet: &Packet, timeout: Duration, sent_at: Instant) -> Self {
        Self {
            packet_hash: packet.hash(),
            truncated_hash: packet.truncated_hash(),
            sent_at,
            timeout,
            status: ReceiptStatus::Sent,
            on_delivery: None,
            on_timeout: None,
        }
    }

    pub fn packet_hash(&self) -> &Hash {
        &self.packet_hash
    }

    pub fn truncated_hash(&self) -> &AddressHash {
        &self.truncated_hash
    }

    pub fn status(&self) -> ReceiptStatus {
        self.status
    }

    pub fn set_delivery_callback(&mut self, callback: ReceiptCallback) {
        self.on_delivery = Some(callback);
    }

    pub fn set_timeout_callback(&mut self, callback: ReceiptCallback) {
        self.on_timeout = Some(callback);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn event(&self, now: Instant) -> ReceiptEvent {
        ReceiptEvent {
            packet_hash: self.packet_hash,
            truncated_hash: self.truncated_hash,
            status: self.status,
            rtt: now.duration_since(self.sent_at),
        }
    }

    /// Marks the receipt delivered and fires the delivery callback once.
    pub fn conclude_delivered(&mut self, now: Instant) {
        if self.status != ReceiptStatus::Sent {
            return;
        }
        self.status = ReceiptStatus::Delivered;
        let event = self.event(now);
        if let Some(callback) = self.on_delivery.as_mut() {
            callback(&event);
        }
    }

    pub fn conclude_failed(&mut self, now: Instant) {
        if self.status != ReceiptStatus::Sent {
            return;
        }
        self.status = ReceiptStatus::Failed;
        let event = self.event(now);
        if let Some(callback) = self.on_timeout.as_mut() {
            callback(&event);
        }
    }

    /// True when the timeout elapsed; the receipt transitions to FAILED and
    /// the timeout callback fires.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.status != ReceiptStatus::Sent {
            return false;
        }
        if now.duration_since(self.sent_at) < self.timeout {
            return false;
        }
        self.conclude_failed(now);
        true
    }
}

impl fmt::Debug for PacketReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketReceipt({}, {:?})", self.truncated_hash, self.status)
    }
}

/// Explicit delivery proof: the full packet hash signed by the destination
/// identity, addressed back through the reverse table.
pub fn build_proof(packet: &Packet, identity: &PrivateIdentity) -> Packet {
    let hash = packet.hash();
    let signature = identity.sign(hash.as_slice());

    let mut data = PacketDataBuffer::new();
    data.chain_safe_write(hash.as_slice()).chain_safe_write(&signature.to_bytes());

    Packet {
        header: Header {
            packet_type: PacketType::Proof,
            destination_type: DestinationType::Single,
            ..Default::default()
        },
        destination: packet.truncated_hash(),
        transport: None,
        context: PacketContext::None,
        data,
    }
}

/// Validates a proof payload against the original packet hash and the
/// claimed destination identity.
pub fn validate_proof(
    proof_payload: &[u8],
    expected_hash: &Hash,
    identity: &Identity,
) -> Result<(), RnsError> {
    if proof_payload.len() < PROOF_PAYLOAD_LENGTH {
        return Err(RnsError::Truncated);
    }

    let (hash_part, signature_part) = proof_payload.split_at(HASH_SIZE);
    if hash_part != expected_hash.as_slice() {
        return Err(RnsError::IncorrectHash);
    }

    let signature = Signature::from_slice(&signature_part[..SIGNATURE_LENGTH])
        .map_err(|_| RnsError::CryptoError)?;
    identity.verify(hash_part, &signature)
}
