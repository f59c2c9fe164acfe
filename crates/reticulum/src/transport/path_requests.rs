use std::time::{Duration, Instant};

use rand_core::{CryptoRngCore, OsRng};
use sha2::Digest;

use crate::destination::DestinationName;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType,
};
use crate::slots::{HashRing, SlotArray};

pub const PATH_REQUEST_SLOTS: usize = 8;
pub const DISCOVERY_TAG_RING: usize = 32;

pub const DEFAULT_PATH_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The well-known PLAIN destination every node listens on for path
/// discovery.
pub fn path_request_destination() -> AddressHash {
    let name = DestinationName::new("rnstransport", "path.request");
    AddressHash::new_from_hash(&Hash::new(
        Hash::generator().chain_update(name.as_name_hash_slice()).finalize().into(),
    ))
}

/// Path request payload: target destination hash followed by a random
/// discovery tag for duplicate suppression.
pub fn build_path_request(target: &AddressHash, tag: &AddressHash) -> Packet {
    let mut data = PacketDataBuffer::new();
    data.chain_safe_write(target.as_slice()).chain_safe_write(tag.as_slice());

    Packet {
        header: Header {
            destination_type: DestinationType::Plain,
            packet_type: PacketType::Data,
            ..Default::default()
        },
        destination: path_request_destination(),
        transport: None,
        context: PacketContext::None,
        data,
    }
}

pub fn parse_path_request(payload: &[u8]) -> Option<(AddressHash, AddressHash)> {
    if payload.len() < ADDRESS_HASH_SIZE * 2 {
        return None;
    }
    let target = AddressHash::try_from_slice(&payload[..ADDRESS_HASH_SIZE]).ok()?;
    let tag =
        AddressHash::try_from_slice(&payload[ADDRESS_HASH_SIZE..ADDRESS_HASH_SIZE * 2]).ok()?;
    Some((target, tag))
}

pub struct PathRequestEntry {
    pub destination: AddressHash,
    pub tag: AddressHash,
    pub requested_at: Instant,
    pub timeout: Duration,
    /// Plaintext payload waiting for the path; encrypted and transmitted
    /// once the resolving announce supplies the destination identity.
    pub pending_payload: Option<Vec<u8>>,
    pub want_receipt: bool,
}

/// In-flight path discovery, eight requests at a time, with a ring of
/// recently seen discovery tags so rebroadcast storms die out.
pub struct PathRequests {
    entries: SlotArray<PathRequestEntry, PATH_REQUEST_SLOTS>,
    seen_tags: HashRing<AddressHash, DISCOVERY_TAG_RING>,
    timeout: Duration,
}

impl PathRequests {
    pub fn new(timeout: Duration) -> Self {
        Self { entries: SlotArray::new(), seen_tags: HashRing::new(), timeout }
    }

    /// Opens a request toward `destination`, generating its tag. Returns
    /// the request packet, or `None` when the pool is full or a request is
    /// already in flight.
    pub fn open(
        &mut self,
        destination: AddressHash,
        pending_payload: Option<Vec<u8>>,
        want_receipt: bool,
        now: Instant,
    ) -> Option<Packet> {
        if let Some(index) = self.entries.find(|entry| entry.destination == destination) {
            // Piggyback on the in-flight request.
            if let Some(entry) = self.entries.get_mut(index) {
                if entry.pending_payload.is_none() {
                    entry.pending_payload = pending_payload;
                    entry.want_receipt |= want_receipt;
                }
            }
            return None;
        }

        let tag = random_tag(OsRng);
        self.seen_tags.insert(tag);

        match self.entries.allocate(PathRequestEntry {
            destination,
            tag,
            requested_at: now,
            timeout: self.timeout,
            pending_payload,
            want_receipt,
        }) {
            Some(_) => Some(build_path_request(&destination, &tag)),
            None => {
                log::warn!("path-request: pool full, dropping request for {}", destination);
                None
            }
        }
    }

    /// An announce for `destination` arrived; the pending frame (if any)
    /// is handed back for transmission.
    pub fn resolve(&mut self, destination: &AddressHash) -> Option<PathRequestEntry> {
        let index = self.entries.find(|entry| entry.destination == *destination)?;
        self.entries.release(index)
    }

    /// Expired requests; the caller fails their receipts.
    pub fn expired(&mut self, now: Instant) -> Vec<PathRequestEntry> {
        let mut expired = Vec::new();
        for index in 0..PATH_REQUEST_SLOTS {
            let is_expired = self
                .entries
                .get(index)
                .map(|entry| now.duration_since(entry.requested_at) >= entry.timeout)
                .unwrap_or(false);
            if is_expired {
                if let Some(entry) = self.entries.release(index) {
                    expired.push(entry);
                }
            }
        }
        expired
    }

    /// Tag-based duplicate suppression for requests seen on the wire.
    /// Returns true the first time a tag is seen.
    pub fn tag_is_new(&mut self, tag: AddressHash) -> bool {
        self.seen_tags.insert(tag)
    }

    pub fn has_request(&self, destination: &AddressHash) -> bool {
        self.entries.find(|entry| entry.destination == *destination).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn random_tag<R: CryptoRngCore>(mut rng: R) -> AddressHash {
    let mut bytes = [0u8; ADDRESS_HASH_SIZE];
    rng.fill_bytes(&mut bytes);
    AddressHash::new(bytes)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{parse_path_request, PathRequests, PATH_REQUEST_SLOTS};
    use crate::hash::AddressHash;

    fn hash(tag: u64) -> AddressHash {
        AddressHash::new_from_slice(&tag.to_be_bytes())
    }

    fn requests() -> PathRequests {
        PathRequests::new(Duration::from_secs(15))
    }

    #[test]
    fn request_packet_carries_target_and_tag() {
        let mut pool = requests();
        let packet = pool.open(hash(1), None, false, Instant::now()).expect("request");

        let (target, _tag) = parse_path_request(packet.data.as_slice()).expect("payload");
        assert_eq!(target, hash(1));
        assert_eq!(packet.destination, super::path_request_destination());
    }

    #[test]
    fn duplicate_requests_piggyback() {
        let mut pool = requests();
        let now = Instant::now();

        assert!(pool.open(hash(1), None, false, now).is_some());
        assert!(pool.open(hash(1), Some(vec![1, 2, 3]), true, now).is_none());
        assert_eq!(pool.len(), 1);

        let entry = pool.resolve(&hash(1)).expect("entry");
        assert_eq!(entry.pending_payload, Some(vec![1, 2, 3]));
        assert!(entry.want_receipt);
    }

    #[test]
    fn pool_rejects_on_overflow() {
        let mut pool = requests();
        let now = Instant::now();

        for index in 0..PATH_REQUEST_SLOTS as u64 {
            assert!(pool.open(hash(index), None, false, now).is_some());
        }
        assert!(pool.open(hash(99), None, false, now).is_none());
    }

    #[test]
    fn requests_expire() {
        let mut pool = requests();
        let now = Instant::now();

        pool.open(hash(1), Some(vec![9]), true, now);
        assert!(pool.expired(now + Duration::from_secs(5)).is_empty());

        let expired = pool.expired(now + Duration::from_secs(16));
        assert_eq!(expired.len(), 1);
        assert!(expired[0].want_receipt);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn tags_deduplicate() {
        let mut pool = requests();
        let tag = hash(77);
        assert!(pool.tag_is_new(tag));
        assert!(!pool.tag_is_new(tag));
    }
}
