use std::time::{Duration, Instant};

use crate::hash::AddressHash;
use crate::iface::IfaceId;
use crate::slots::SlotArray;

pub const PATH_TABLE_SLOTS: usize = 16;
pub const REVERSE_TABLE_SLOTS: usize = 8;
pub const TUNNEL_TABLE_SLOTS: usize = 16;

pub const REVERSE_ENTRY_TTL: Duration = Duration::from_secs(30);
pub const TUNNEL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Copy, Clone)]
pub struct PathEntry {
    pub destination: AddressHash,
    pub next_hop: AddressHash,
    pub iface: IfaceId,
    pub hops: u8,
    pub updated_at: Instant,
}

/// Next-hop routing state learned from announces. A fixed 16-slot array:
/// new destinations are rejected when every slot is taken, existing entries
/// refresh in place when the new path is no worse.
pub struct PathTable {
    entries: SlotArray<PathEntry, PATH_TABLE_SLOTS>,
}

impl PathTable {
    pub fn new() -> Self {
        Self { entries: SlotArray::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&PathEntry> {
        self.entries
            .get(self.entries.find(|entry| entry.destination == *destination)?)
    }

    pub fn next_hop_iface(&self, destination: &AddressHash) -> Option<IfaceId> {
        self.get(destination).map(|entry| entry.iface)
    }

    /// Learns or refreshes a path. Returns false when the table is full or
    /// the offered path is worse than the stored one.
    pub fn learn(
        &mut self,
        destination: AddressHash,
        next_hop: AddressHash,
        iface: IfaceId,
        hops: u8,
        now: Instant,
    ) -> bool {
        if let Some(index) = self.entries.find(|entry| entry.destination == destination) {
            let Some(entry) = self.entries.get_mut(index) else { return false };
            if hops > entry.hops {
                return false;
            }
            entry.next_hop = next_hop;
            entry.iface = iface;
            entry.hops = hops;
            entry.updated_at = now;
            return true;
        }

        match self.entries.allocate(PathEntry { destination, next_hop, iface, hops, updated_at: now })
        {
            Some(_) => {
                log::info!(
                    "path: {} reachable over {} hops via {} on {}",
                    destination,
                    hops,
                    next_hop,
                    iface
                );
                true
            }
            None => {
                log::warn!("path: table full, dropping route to {}", destination);
                false
            }
        }
    }

    pub fn drop_via_iface(&mut self, iface: IfaceId) {
        self.entries.retain(|entry| entry.iface != iface);
    }

    pub fn remove(&mut self, destination: &AddressHash) {
        self.entries.retain(|entry| entry.destination != *destination);
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone)]
pub struct ReverseEntry {
    pub packet_hash: AddressHash,
    pub receiving_iface: IfaceId,
    pub outbound_iface: IfaceId,
    pub recorded_at: Instant,
}

/// Return routes for proofs: packet hash of a forwarded packet, mapped to
/// the interface it arrived on. Overflow rejects the entry; the proof will
/// simply not be routed back through this node.
pub struct ReverseTable {
    entries: SlotArray<ReverseEntry, REVERSE_TABLE_SLOTS>,
}

impl ReverseTable {
    pub fn new() -> Self {
        Self { entries: SlotArray::new() }
    }

    pub fn record(
        &mut self,
        packet_hash: AddressHash,
        receiving_iface: IfaceId,
        outbound_iface: IfaceId,
        now: Instant,
    ) -> bool {
        if self.entries.find(|entry| entry.packet_hash == packet_hash).is_some() {
            return true;
        }
        match self.entries.allocate(ReverseEntry {
            packet_hash,
            receiving_iface,
            outbound_iface,
            recorded_at: now,
        }) {
            Some(_) => true,
            None => {
                log::warn!("reverse: table full, dropping return route");
                false
            }
        }
    }

    /// Consumes the return route for a proof.
    pub fn take(&mut self, packet_hash: &AddressHash) -> Option<ReverseEntry> {
        let index = self.entries.find(|entry| entry.packet_hash == *packet_hash)?;
        self.entries.release(index)
    }

    pub fn expire(&mut self, now: Instant) {
        self.entries
            .retain(|entry| now.duration_since(entry.recorded_at) <= REVERSE_ENTRY_TTL);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for ReverseTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TunnelEntry {
    pub tunnel_id: AddressHash,
    pub iface: IfaceId,
    pub established_at: Instant,
    pub last_heard: Instant,
}

/// Bindings to remote transport nodes that survive an interface flap: a
/// reconnecting interface re-adopts the paths of its tunnel.
pub struct TunnelTable {
    entries: SlotArray<TunnelEntry, TUNNEL_TABLE_SLOTS>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self { entries: SlotArray::new() }
    }

    pub fn bind(&mut self, tunnel_id: AddressHash, iface: IfaceId, now: Instant) -> bool {
        if let Some(index) = self.entries.find(|entry| entry.tunnel_id == tunnel_id) {
            if let Some(entry) = self.entries.get_mut(index) {
                entry.iface = iface;
                entry.last_heard = now;
            }
            return true;
        }
        match self.entries.allocate(TunnelEntry {
            tunnel_id,
            iface,
            established_at: now,
            last_heard: now,
        }) {
            Some(_) => true,
            None => {
                log::warn!("tunnel: table full, rejecting {}", tunnel_id);
                false
            }
        }
    }

    pub fn get(&self, tunnel_id: &AddressHash) -> Option<&TunnelEntry> {
        self.entries.get(self.entries.find(|entry| entry.tunnel_id == *tunnel_id)?)
    }

    pub fn expire(&mut self, now: Instant) {
        self.entries.retain(|entry| now.duration_since(entry.last_heard) <= TUNNEL_TTL);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for TunnelTable {
    fn default() -> Self {
        Self::new()
    }
}
