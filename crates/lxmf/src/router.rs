use std::time::Instant;

use reticulum::destination::link::LinkId;
use reticulum::destination::{new_in, SingleInputDestination};
use reticulum::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use reticulum::identity::{Identity, PrivateIdentity, SIGNATURE_LENGTH};
use reticulum::slots::{HashRing, SlotArray};
use reticulum::storage::StorageAdapter;
use reticulum::transport::{SendOutcome, Transport};

use crate::error::LxmfError;
use crate::message::{LxmfMessage, MessageState};
use crate::propagation::{self, PropagationManager, PropagationSelection};

pub const OUTBOUND_RING: usize = 16;
pub const DIRECT_LINK_POOL: usize = 8;
pub const SEEN_RING: usize = 64;

/// Field carrying a delivery proof: message id followed by an Ed25519
/// signature over it.
pub const FIELD_DELIVERY_PROOF: u8 = 0xFA;

const DELIVERY_PROOF_LENGTH: usize = 32 + SIGNATURE_LENGTH;
const DIRECT_DELIVERY_TIMEOUT_SECS: u64 = 60;

/// The router's view of the RNS below it. `Transport` implements this
/// directly; tests substitute a capture adapter.
pub trait Adapter {
    fn known_identity(&self, destination: &AddressHash) -> Option<Identity>;
    fn has_path(&self, destination: &AddressHash) -> bool;
    fn send(&mut self, destination: AddressHash, payload: &[u8]) -> Result<(), LxmfError>;
}

impl Adapter for Transport {
    fn known_identity(&self, destination: &AddressHash) -> Option<Identity> {
        Transport::known_identity(self, destination)
    }

    fn has_path(&self, destination: &AddressHash) -> bool {
        Transport::has_path(self, destination)
    }

    fn send(&mut self, destination: AddressHash, payload: &[u8]) -> Result<(), LxmfError> {
        match self.send_data(destination, payload, false, Instant::now()) {
            Ok(SendOutcome::Sent(_)) | Ok(SendOutcome::PathPending) => Ok(()),
            Err(_) => Err(LxmfError::Transport),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
    MessageReceived { message: LxmfMessage, verified: bool },
    MessageDelivered { message_id: Hash },
    MessageFailed { message_id: Hash },
    /// A message was handed to a propagation node for later pickup.
    MessagePropagated { message_id: Hash, node: AddressHash },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundPhase {
    Queued,
    /// Sent toward the destination; awaiting its delivery proof.
    SentDirect { sent_at: u64 },
    /// Resting at a propagation node; no timeout, the destination may be
    /// offline for a long time.
    SentPropagated,
}

struct OutboundEntry {
    id: Hash,
    destination: AddressHash,
    wire: Vec<u8>,
    phase: OutboundPhase,
}

#[derive(Debug, Clone, Copy)]
struct DirectLink {
    destination: AddressHash,
    link_id: LinkId,
}

/// Outbound LXMF routing: a 16-slot ring of pending messages, direct
/// delivery when a path exists, store-and-forward through a propagation
/// node otherwise, and a 64-entry dedup ring on the receive side.
pub struct LxmfRouter {
    identity: PrivateIdentity,
    delivery_hash: AddressHash,
    outbound: SlotArray<OutboundEntry, OUTBOUND_RING>,
    direct_links: SlotArray<DirectLink, DIRECT_LINK_POOL>,
    seen: HashRing<Hash, SEEN_RING>,
    propagation: PropagationManager,
    events: Vec<RouterEvent>,
}

impl LxmfRouter {
    pub fn new(identity: PrivateIdentity, selection: PropagationSelection) -> Self {
        let delivery_hash = new_in(identity.clone(), "lxmf", "delivery").desc.address_hash;
        Self {
            identity,
            delivery_hash,
            outbound: SlotArray::new(),
            direct_links: SlotArray::new(),
            seen: HashRing::new(),
            propagation: PropagationManager::new(selection),
            events: Vec::new(),
        }
    }

    /// Our inbound messaging endpoint, for registration with the transport.
    pub fn delivery_destination(&self) -> SingleInputDestination {
        new_in(self.identity.clone(), "lxmf", "delivery")
    }

    pub fn delivery_hash(&self) -> &AddressHash {
        &self.delivery_hash
    }

    pub fn propagation_mut(&mut self) -> &mut PropagationManager {
        &mut self.propagation
    }

    pub fn take_events(&mut self) -> Vec<RouterEvent> {
        core::mem::take(&mut self.events)
    }

    //***********************************************************************//
    // Outbound

    /// Queues a message for delivery. The ring holds 16 in-flight
    /// messages; overflow is rejected, never silently dropped.
    pub fn enqueue(&mut self, mut message: LxmfMessage) -> Result<Hash, LxmfError> {
        message.state = MessageState::Outbound;
        let id = message.message_id()?;
        let wire = message.pack(&self.identity)?;
        let destination = message.destination;

        self.outbound
            .allocate(OutboundEntry { id, destination, wire, phase: OutboundPhase::Queued })
            .map(|_| id)
            .ok_or(LxmfError::PoolExhausted)
    }

    pub fn pending_count(&self) -> usize {
        self.outbound.len()
    }

    /// One delivery pass: queued messages go direct when the stack knows
    /// the destination, otherwise to the selected propagation node.
    pub fn process_outbound<A: Adapter>(&mut self, adapter: &mut A, now: u64) {
        let mut sent = Vec::new();
        let mut propagated = Vec::new();

        for (slot, entry) in self.outbound.iter() {
            if entry.phase != OutboundPhase::Queued {
                continue;
            }

            if adapter.known_identity(&entry.destination).is_some()
                || adapter.has_path(&entry.destination)
            {
                sent.push(slot);
            } else if let Some(node) = self.propagation.select(now) {
                if node != entry.destination {
                    propagated.push((slot, node));
                }
            }
        }

        for slot in sent {
            let (destination, wire, id) = {
                let Some(entry) = self.outbound.get(slot) else { continue };
                (entry.destination, entry.wire.clone(), entry.id)
            };
            match adapter.send(destination, &wire) {
                Ok(()) => {
                    if let Some(entry) = self.outbound.get_mut(slot) {
                        entry.phase = OutboundPhase::SentDirect { sent_at: now };
                    }
                }
                Err(_) => {
                    log::warn!("lxmf: direct send of {} failed, keeping queued", id);
                }
            }
        }

        for (slot, node) in propagated {
            let (destination, wire, id) = {
                let Some(entry) = self.outbound.get(slot) else { continue };
                (entry.destination, entry.wire.clone(), entry.id)
            };

            let mut envelope = Vec::with_capacity(ADDRESS_HASH_SIZE + wire.len());
            envelope.extend_from_slice(destination.as_slice());
            envelope.extend_from_slice(&wire);

            match adapter.send(node, &envelope) {
                Ok(()) => {
                    if let Some(entry) = self.outbound.get_mut(slot) {
                        entry.phase = OutboundPhase::SentPropagated;
                    }
                    self.events.push(RouterEvent::MessagePropagated { message_id: id, node });
                }
                Err(_) => {
                    log::warn!("lxmf: handoff of {} to propagation node failed", id);
                }
            }
        }

        // Direct sends without a proof inside the window fail.
        let mut failed = Vec::new();
        for (slot, entry) in self.outbound.iter() {
            if let OutboundPhase::SentDirect { sent_at } = entry.phase {
                if now.saturating_sub(sent_at) > DIRECT_DELIVERY_TIMEOUT_SECS {
                    failed.push((slot, entry.id));
                }
            }
        }
        for (slot, id) in failed {
            self.outbound.release(slot);
            self.events.push(RouterEvent::MessageFailed { message_id: id });
        }
    }

    //***********************************************************************//
    // Inbound

    /// A payload delivered to our `lxmf.delivery` destination: either an
    /// addressed message (answered with a delivery proof) or a proof for
    /// one of ours.
    pub fn handle_inbound<A: Adapter>(
        &mut self,
        payload: &[u8],
        adapter: &mut A,
    ) -> Result<(), LxmfError> {
        let (message, signature) = LxmfMessage::unpack(payload)?;

        if message.destination != self.delivery_hash {
            return Err(LxmfError::Decode("not addressed to this delivery endpoint".into()));
        }

        if let Some(proof) = message.fields.get(&FIELD_DELIVERY_PROOF) {
            return self.handle_delivery_proof(proof, &message.source, adapter);
        }

        let id = message.message_id()?;
        if !self.seen.insert(id) {
            log::debug!("lxmf: duplicate message {}", id);
            return Err(LxmfError::Duplicate);
        }

        let verified = match adapter.known_identity(&message.source) {
            Some(identity) => LxmfMessage::verify(payload, &signature, &identity).is_ok(),
            None => false,
        };

        // Answer with a delivery proof so the sender's state machine can
        // conclude.
        let proof = self.build_delivery_proof(&id, message.source);
        if let Ok(wire) = proof {
            let _ = adapter.send(message.source, &wire);
        }

        self.events.push(RouterEvent::MessageReceived { message, verified });
        Ok(())
    }

    fn build_delivery_proof(
        &self,
        message_id: &Hash,
        to: AddressHash,
    ) -> Result<Vec<u8>, LxmfError> {
        let signature = self.identity.sign(message_id.as_slice());

        let mut proof_value = Vec::with_capacity(DELIVERY_PROOF_LENGTH);
        proof_value.extend_from_slice(message_id.as_slice());
        proof_value.extend_from_slice(&signature.to_bytes());

        let mut proof = LxmfMessage::new(self.delivery_hash, to, "", b"", 0.0);
        proof.set_field(FIELD_DELIVERY_PROOF, &proof_value)?;
        proof.pack(&self.identity)
    }

    fn handle_delivery_proof<A: Adapter>(
        &mut self,
        proof: &[u8],
        prover: &AddressHash,
        adapter: &mut A,
    ) -> Result<(), LxmfError> {
        if proof.len() < DELIVERY_PROOF_LENGTH {
            return Err(LxmfError::Decode("short delivery proof".into()));
        }

        let id_bytes: [u8; 32] =
            proof[..32].try_into().map_err(|_| LxmfError::Decode("bad proof id".into()))?;
        let id = Hash::new(id_bytes);

        let Some(slot) = self.outbound.find(|entry| entry.id == id) else {
            return Ok(());
        };

        // The proof must come from the message's destination and verify
        // under its announced identity.
        let destination = self.outbound.get(slot).map(|entry| entry.destination);
        if destination != Some(*prover) {
            return Err(LxmfError::InvalidSignature);
        }
        if let Some(identity) = destination.and_then(|hash| adapter.known_identity(&hash)) {
            let signature = ed25519_dalek::Signature::from_slice(&proof[32..DELIVERY_PROOF_LENGTH])
                .map_err(|_| LxmfError::InvalidSignature)?;
            identity
                .verify(id.as_slice(), &signature)
                .map_err(|_| LxmfError::InvalidSignature)?;
        }

        self.outbound.release(slot);
        self.events.push(RouterEvent::MessageDelivered { message_id: id });
        Ok(())
    }

    //***********************************************************************//
    // Propagation node role

    /// Ingests a store-and-forward envelope (destination || message wire)
    /// on behalf of an offline recipient.
    pub fn handle_propagation_envelope(
        &mut self,
        payload: &[u8],
        storage: &mut dyn StorageAdapter,
    ) -> Result<bool, LxmfError> {
        if payload.len() <= ADDRESS_HASH_SIZE {
            return Err(LxmfError::Decode("short propagation envelope".into()));
        }

        let destination = AddressHash::try_from_slice(&payload[..ADDRESS_HASH_SIZE])
            .map_err(|_| LxmfError::Decode("bad envelope destination".into()))?;
        let wire = &payload[ADDRESS_HASH_SIZE..];

        // Transient id over the full wire form keys the store.
        let transient_id = Hash::new_from_slice(wire);
        propagation::store_message(storage, &destination, &transient_id, wire)
    }

    /// Drains the stored queue for a destination that came online.
    pub fn sync_queue_for(
        &mut self,
        destination: &AddressHash,
        storage: &mut dyn StorageAdapter,
    ) -> Result<Vec<Vec<u8>>, LxmfError> {
        propagation::sync_queue(storage, destination)
    }

    //***********************************************************************//
    // Direct link bookkeeping

    pub fn note_link(&mut self, destination: AddressHash, link_id: LinkId) -> Result<(), LxmfError> {
        if let Some(slot) = self.direct_links.find(|link| link.destination == destination) {
            if let Some(link) = self.direct_links.get_mut(slot) {
                link.link_id = link_id;
            }
            return Ok(());
        }
        self.direct_links
            .allocate(DirectLink { destination, link_id })
            .map(|_| ())
            .ok_or(LxmfError::PoolExhausted)
    }

    pub fn link_for(&self, destination: &AddressHash) -> Option<LinkId> {
        let slot = self.direct_links.find(|link| link.destination == *destination)?;
        self.direct_links.get(slot).map(|link| link.link_id)
    }

    pub fn drop_link(&mut self, link_id: &LinkId) {
        self.direct_links.retain(|link| link.link_id != *link_id);
    }
}
