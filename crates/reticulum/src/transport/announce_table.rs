use std::time::{Duration, Instant};

use crate::hash::AddressHash;
use crate::iface::IfaceId;
use crate::packet::Packet;
use crate::slots::SlotArray;

pub const ANNOUNCE_TABLE_SLOTS: usize = 8;
pub const HELD_ANNOUNCE_SLOTS: usize = 8;
pub const RATE_TABLE_SLOTS: usize = 8;
pub const ANNOUNCE_QUEUE_SLOTS: usize = 32;

pub const ANNOUNCE_RETRY_LIMIT: u8 = 3;
const ANNOUNCE_RETRY_BASE: Duration = Duration::from_secs(4);
const HELD_ANNOUNCE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct AnnounceEntry {
    destination: AddressHash,
    packet: Packet,
    received_on: IfaceId,
    retries: u8,
    next_retransmit: Instant,
}

/// Queued announce retransmissions for transit operation, with exponential
/// back-off between repeats. Overflow rejects: the announce still routed,
/// it just will not be repeated by this node.
pub struct AnnounceTable {
    entries: SlotArray<AnnounceEntry, ANNOUNCE_TABLE_SLOTS>,
}

impl AnnounceTable {
    pub fn new() -> Self {
        Self { entries: SlotArray::new() }
    }

    pub fn add(
        &mut self,
        destination: AddressHash,
        packet: Packet,
        received_on: IfaceId,
        now: Instant,
    ) -> bool {
        if self.entries.find(|entry| entry.destination == destination).is_some() {
            return true;
        }
        match self.entries.allocate(AnnounceEntry {
            destination,
            packet,
            received_on,
            retries: 0,
            next_retransmit: now + ANNOUNCE_RETRY_BASE,
        }) {
            Some(_) => true,
            None => {
                log::warn!("announce: retransmit table full, not repeating {}", destination);
                false
            }
        }
    }

    /// Due retransmissions; each entry backs off exponentially and leaves
    /// the table after its retry budget.
    pub fn due_retransmissions(&mut self, now: Instant) -> Vec<(Packet, IfaceId)> {
        let mut due = Vec::new();

        for (_, entry) in self.entries.iter_mut() {
            if entry.next_retransmit <= now && entry.retries < ANNOUNCE_RETRY_LIMIT {
                entry.retries += 1;
                entry.next_retransmit = now + ANNOUNCE_RETRY_BASE * 2u32.pow(entry.retries as u32);
                due.push((entry.packet, entry.received_on));
            }
        }

        self.entries.retain(|entry| entry.retries < ANNOUNCE_RETRY_LIMIT);
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for AnnounceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct HeldAnnounce {
    destination: AddressHash,
    packet: Packet,
    received_on: IfaceId,
    release_at: Instant,
}

/// Rate-limited announces wait here instead of being dropped outright; a
/// full pool rejects and the announce is simply suppressed.
pub struct HeldAnnounces {
    entries: SlotArray<HeldAnnounce, HELD_ANNOUNCE_SLOTS>,
}

impl HeldAnnounces {
    pub fn new() -> Self {
        Self { entries: SlotArray::new() }
    }

    pub fn hold(
        &mut self,
        destination: AddressHash,
        packet: Packet,
        received_on: IfaceId,
        now: Instant,
    ) -> bool {
        if self.entries.find(|held| held.destination == destination).is_some() {
            return true;
        }
        self.entries
            .allocate(HeldAnnounce {
                destination,
                packet,
                received_on,
                release_at: now + HELD_ANNOUNCE_DELAY,
            })
            .is_some()
    }

    pub fn due_releases(&mut self, now: Instant) -> Vec<(AddressHash, Packet, IfaceId)> {
        let mut due = Vec::new();
        for index in 0..HELD_ANNOUNCE_SLOTS {
            let release = self
                .entries
                .get(index)
                .map(|held| held.release_at <= now)
                .unwrap_or(false);
            if release {
                if let Some(held) = self.entries.release(index) {
                    due.push((held.destination, held.packet, held.received_on));
                }
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for HeldAnnounces {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub target: Duration,
    pub grace: u32,
    pub penalty: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { target: Duration::from_secs(2), grace: 10, penalty: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateEntry {
    destination: AddressHash,
    last_announce: Instant,
    violations: u32,
    blocked_until: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RateDecision {
    Pass,
    Hold,
    Block,
}

/// Per-origin announce pacing: announces inside the target interval count
/// as violations; exhausting the grace budget blocks the origin for the
/// penalty window. The table is fixed-size; unknown origins beyond its
/// capacity pass unmetered.
pub struct AnnounceRateTable {
    entries: SlotArray<RateEntry, RATE_TABLE_SLOTS>,
    limit: RateLimit,
}

impl AnnounceRateTable {
    pub fn new(limit: RateLimit) -> Self {
        Self { entries: SlotArray::new(), limit }
    }

    pub fn check(&mut self, destination: &AddressHash, now: Instant) -> RateDecision {
        let Some(index) = self.entries.find(|entry| entry.destination == *destination) else {
            if self.entries
                .allocate(RateEntry {
                    destination: *destination,
                    last_announce: now,
                    violations: 0,
                    blocked_until: None,
                })
                .is_none()
            {
                log::warn!("announce: rate table full, {} unmetered", destination);
            }
            return RateDecision::Pass;
        };

        let Some(entry) = self.entries.get_mut(index) else { return RateDecision::Pass };

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return RateDecision::Block;
            }
            entry.blocked_until = None;
            entry.violations = 0;
        }

        let decision = if now.duration_since(entry.last_announce) < self.limit.target {
            entry.violations += 1;
            if entry.violations >= self.limit.grace {
                entry.violations = 0;
                entry.blocked_until = Some(now + self.limit.penalty);
                RateDecision::Block
            } else {
                RateDecision::Hold
            }
        } else {
            RateDecision::Pass
        };

        entry.last_announce = now;
        decision
    }
}

#[derive(Debug, Clone)]
struct QueuedAnnounce {
    raw: Vec<u8>,
    queued_at: Instant,
}

/// Per-interface outbound announce queue, 32 deep. Overflow drops the
/// newest announce with a log line; propagation stays eventually
/// consistent through later retransmissions.
pub struct AnnounceQueue {
    entries: SlotArray<QueuedAnnounce, ANNOUNCE_QUEUE_SLOTS>,
}

impl AnnounceQueue {
    pub fn new() -> Self {
        Self { entries: SlotArray::new() }
    }

    pub fn enqueue(&mut self, raw: Vec<u8>, now: Instant) -> bool {
        match self.entries.allocate(QueuedAnnounce { raw, queued_at: now }) {
            Some(_) => true,
            None => {
                log::warn!("announce: interface queue full, dropping announce");
                false
            }
        }
    }

    /// Drains the queue oldest-first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut queued: Vec<QueuedAnnounce> = Vec::new();
        for index in 0..ANNOUNCE_QUEUE_SLOTS {
            if let Some(entry) = self.entries.release(index) {
                queued.push(entry);
            }
        }
        queued.sort_by_key(|entry| entry.queued_at);
        queued.into_iter().map(|entry| entry.raw).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for AnnounceQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{
        AnnounceQueue, AnnounceRateTable, AnnounceTable, RateDecision, RateLimit,
        ANNOUNCE_QUEUE_SLOTS,
    };
    use crate::hash::AddressHash;
    use crate::iface::IfaceId;
    use crate::packet::Packet;

    fn hash(tag: u64) -> AddressHash {
        AddressHash::new_from_slice(&tag.to_be_bytes())
    }

    #[test]
    fn retransmissions_back_off_and_expire() {
        let mut table = AnnounceTable::new();
        let now = Instant::now();

        table.add(hash(1), Packet::default(), IfaceId(0), now);

        let first = now + Duration::from_secs(5);
        assert_eq!(table.due_retransmissions(first).len(), 1);
        assert!(table.due_retransmissions(first).is_empty(), "backed off");

        let second = first + Duration::from_secs(10);
        assert_eq!(table.due_retransmissions(second).len(), 1);
        let third = second + Duration::from_secs(20);
        assert_eq!(table.due_retransmissions(third).len(), 1);

        // Retry budget exhausted, entry evicted.
        let fourth = third + Duration::from_secs(40);
        assert!(table.due_retransmissions(fourth).is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn rate_limiter_holds_then_blocks() {
        let limit =
            RateLimit { target: Duration::from_secs(2), grace: 3, penalty: Duration::from_secs(30) };
        let mut table = AnnounceRateTable::new(limit);
        let origin = hash(7);
        let mut now = Instant::now();

        assert_eq!(table.check(&origin, now), RateDecision::Pass);

        // Two rapid repeats: held, third violation trips the block.
        now += Duration::from_millis(100);
        assert_eq!(table.check(&origin, now), RateDecision::Hold);
        now += Duration::from_millis(100);
        assert_eq!(table.check(&origin, now), RateDecision::Hold);
        now += Duration::from_millis(100);
        assert_eq!(table.check(&origin, now), RateDecision::Block);

        // Still inside the penalty window.
        now += Duration::from_secs(5);
        assert_eq!(table.check(&origin, now), RateDecision::Block);

        // Penalty over, well-spaced announces pass again.
        now += Duration::from_secs(31);
        assert_eq!(table.check(&origin, now), RateDecision::Pass);
        now += Duration::from_secs(3);
        assert_eq!(table.check(&origin, now), RateDecision::Pass);
    }

    #[test]
    fn queue_drains_in_fifo_order_and_bounds() {
        let mut queue = AnnounceQueue::new();
        let now = Instant::now();

        for index in 0..ANNOUNCE_QUEUE_SLOTS {
            assert!(queue.enqueue(vec![index as u8], now + Duration::from_millis(index as u64)));
        }
        assert!(!queue.enqueue(vec![0xff], now + Duration::from_secs(1)));

        let drained = queue.drain();
        assert_eq!(drained.len(), ANNOUNCE_QUEUE_SLOTS);
        assert_eq!(drained[0], vec![0u8]);
        assert_eq!(drained[31], vec![31u8]);
        assert_eq!(queue.len(), 0);
    }
}
