use std::time::{Duration, Instant};

use crate::destination::link::LinkId;
use crate::hash::AddressHash;
use crate::iface::IfaceId;
use crate::packet::{Header, HeaderType, Packet, TransportType};
use crate::slots::SlotArray;

pub const LINK_TABLE_SLOTS: usize = 8;

pub const DEFAULT_PROOF_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(360);

#[derive(Debug, Copy, Clone)]
pub struct TransitLinkEntry {
    pub link_id: LinkId,
    pub next_hop: AddressHash,
    pub next_hop_iface: IfaceId,
    pub received_on: IfaceId,
    pub original_destination: AddressHash,
    pub taken_hops: u8,
    pub validated: bool,
    pub last_activity: Instant,
    pub proof_deadline: Instant,
}

/// Transit bookkeeping for links crossing this node: each entry remembers
/// the two neighbor interfaces so link traffic and proofs can be shuttled
/// in both directions. Unvalidated entries expire at the proof deadline,
/// validated ones on idle timeout.
pub struct TransitLinkTable {
    entries: SlotArray<TransitLinkEntry, LINK_TABLE_SLOTS>,
    proof_timeout: Duration,
    idle_timeout: Duration,
}

impl TransitLinkTable {
    pub fn new(proof_timeout: Duration, idle_timeout: Duration) -> Self {
        Self { entries: SlotArray::new(), proof_timeout, idle_timeout }
    }

    pub fn add(
        &mut self,
        link_request: &Packet,
        next_hop: AddressHash,
        next_hop_iface: IfaceId,
        received_on: IfaceId,
        now: Instant,
    ) -> bool {
        let link_id = link_request.truncated_hash();
        if self.entries.find(|entry| entry.link_id == link_id).is_some() {
            return true;
        }

        match self.entries.allocate(TransitLinkEntry {
            link_id,
            next_hop,
            next_hop_iface,
            received_on,
            original_destination: link_request.destination,
            taken_hops: link_request.header.hops + 1,
            validated: false,
            last_activity: now,
            proof_deadline: now + self.proof_timeout,
        }) {
            Some(_) => true,
            None => {
                log::warn!("link-table: full, not carrying link {}", link_id);
                false
            }
        }
    }

    pub fn get(&self, link_id: &LinkId) -> Option<&TransitLinkEntry> {
        self.entries.get(self.entries.find(|entry| entry.link_id == *link_id)?)
    }

    /// Forwards a link-addressed packet toward the destination side.
    pub fn forward(&mut self, packet: &Packet) -> Option<(Packet, IfaceId)> {
        let index = self.entries.find(|entry| entry.link_id == packet.destination)?;
        let entry = self.entries.get_mut(index)?;
        entry.last_activity = Instant::now();

        let forwarded = Packet {
            header: Header { hops: packet.header.hops + 1, ..packet.header },
            ..*packet
        };
        Some((forwarded, entry.next_hop_iface))
    }

    /// A proof for the link request travels back toward the initiator; the
    /// entry is validated on the way.
    pub fn handle_proof(&mut self, proof: &Packet) -> Option<(Packet, IfaceId)> {
        let index = self.entries.find(|entry| entry.link_id == proof.destination)?;
        let entry = self.entries.get_mut(index)?;
        entry.validated = true;
        entry.last_activity = Instant::now();

        let backwards = Packet {
            header: Header {
                header_type: HeaderType::Type2,
                transport_type: TransportType::Transport,
                hops: proof.header.hops + 1,
                ..proof.header
            },
            transport: Some(entry.next_hop),
            ..*proof
        };
        Some((backwards, entry.received_on))
    }

    /// Routes traffic from the destination side back to the initiator side.
    pub fn backward(&mut self, packet: &Packet) -> Option<(Packet, IfaceId)> {
        let index = self.entries.find(|entry| entry.link_id == packet.destination)?;
        let entry = self.entries.get_mut(index)?;
        if !entry.validated {
            return None;
        }
        entry.last_activity = Instant::now();

        let backwards = Packet {
            header: Header { hops: packet.header.hops + 1, ..packet.header },
            ..*packet
        };
        Some((backwards, entry.received_on))
    }

    /// Removes expired entries and returns their ids so closes can
    /// propagate in both directions.
    pub fn remove_stale(&mut self, now: Instant) -> Vec<TransitLinkEntry> {
        let mut stale = Vec::new();
        for index in 0..LINK_TABLE_SLOTS {
            let expired = self
                .entries
                .get(index)
                .map(|entry| {
                    if entry.validated {
                        now.duration_since(entry.last_activity) > self.idle_timeout
                    } else {
                        now >= entry.proof_deadline
                    }
                })
                .unwrap_or(false);
            if expired {
                if let Some(entry) = self.entries.release(index) {
                    stale.push(entry);
                }
            }
        }
        stale
    }

    pub fn drop_via_iface(&mut self, iface: IfaceId) {
        self.entries
            .retain(|entry| entry.next_hop_iface != iface && entry.received_on != iface);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
