use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::crypt::compress::{bz2_compress, bz2_decompress};
use crate::destination::link::LinkId;
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use crate::slots::SlotArray;

pub const MAP_HASH_SIZE: usize = 8;
pub const MAX_PARTS: usize = 1024;
pub const MAX_RESOURCES_PER_LINK: usize = 8;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_LIMIT: u8 = 5;

const ADVERTISEMENT_FIXED_LEN: usize = ADDRESS_HASH_SIZE + 1 + 4 + 2 + 2;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

fn map_hash(part: &[u8]) -> [u8; MAP_HASH_SIZE] {
    let digest = Hash::new_from_slice(part);
    let mut out = [0u8; MAP_HASH_SIZE];
    out.copy_from_slice(&digest.as_slice()[..MAP_HASH_SIZE]);
    out
}

/// Advertisement for a pending transfer: transfer hash, compression flag,
/// total size, part size, part count, then one 8-byte map hash per part for
/// selective retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub transfer_hash: AddressHash,
    pub compressed: bool,
    pub total_size: u32,
    pub part_size: u16,
    pub part_count: u16,
    pub map_hashes: Vec<[u8; MAP_HASH_SIZE]>,
}

impl ResourceAdvertisement {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(ADVERTISEMENT_FIXED_LEN + self.map_hashes.len() * MAP_HASH_SIZE);
        out.extend_from_slice(self.transfer_hash.as_slice());
        out.push(if self.compressed { FLAG_COMPRESSED } else { 0 });
        out.extend_from_slice(&self.total_size.to_be_bytes());
        out.extend_from_slice(&self.part_size.to_be_bytes());
        out.extend_from_slice(&self.part_count.to_be_bytes());
        for hash in &self.map_hashes {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() < ADVERTISEMENT_FIXED_LEN {
            return Err(RnsError::Truncated);
        }

        let transfer_hash = AddressHash::try_from_slice(&bytes[..ADDRESS_HASH_SIZE])?;
        let mut idx = ADDRESS_HASH_SIZE;

        let compressed = bytes[idx] & FLAG_COMPRESSED != 0;
        idx += 1;

        let total_size = u32::from_be_bytes(
            bytes[idx..idx + 4].try_into().map_err(|_| RnsError::Truncated)?,
        );
        idx += 4;
        let part_size =
            u16::from_be_bytes(bytes[idx..idx + 2].try_into().map_err(|_| RnsError::Truncated)?);
        idx += 2;
        let part_count =
            u16::from_be_bytes(bytes[idx..idx + 2].try_into().map_err(|_| RnsError::Truncated)?);
        idx += 2;

        if part_size == 0 || part_count as usize > MAX_PARTS {
            return Err(RnsError::MalformedPacket);
        }
        if bytes.len() < idx + part_count as usize * MAP_HASH_SIZE {
            return Err(RnsError::Truncated);
        }

        let mut map_hashes = Vec::with_capacity(part_count as usize);
        for part in 0..part_count as usize {
            let start = idx + part * MAP_HASH_SIZE;
            let mut hash = [0u8; MAP_HASH_SIZE];
            hash.copy_from_slice(&bytes[start..start + MAP_HASH_SIZE]);
            map_hashes.push(hash);
        }

        Ok(Self { transfer_hash, compressed, total_size, part_size, part_count, map_hashes })
    }
}

/// Part re-request payload: big-endian u16 indices.
pub fn encode_part_request(indices: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(indices.len() * 2);
    for index in indices {
        out.extend_from_slice(&index.to_be_bytes());
    }
    out
}

pub fn decode_part_request(bytes: &[u8]) -> Result<Vec<u16>, RnsError> {
    if bytes.len() % 2 != 0 {
        return Err(RnsError::MalformedPacket);
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Sending side of a transfer. The payload is compressed when that shrinks
/// it, split into parts, and parts are served on request until the receiver
/// confirms completion.
pub struct ResourceSender {
    transfer_hash: AddressHash,
    parts: Vec<Vec<u8>>,
    part_size: u16,
    total_size: u32,
    compressed: bool,
    map_hashes: Vec<[u8; MAP_HASH_SIZE]>,
}

impl ResourceSender {
    pub fn new(data: &[u8], part_size: u16) -> Result<Self, RnsError> {
        if part_size == 0 {
            return Err(RnsError::InvalidArgument);
        }

        let compressed_data = bz2_compress(data)?;
        let (payload, compressed) = if compressed_data.len() < data.len() {
            (compressed_data, true)
        } else {
            (data.to_vec(), false)
        };

        let part_count = payload.len().div_ceil(part_size as usize).max(1);
        if part_count > MAX_PARTS {
            return Err(RnsError::OutOfMemory);
        }

        let parts: Vec<Vec<u8>> = if payload.is_empty() {
            vec![Vec::new()]
        } else {
            payload.chunks(part_size as usize).map(<[u8]>::to_vec).collect()
        };
        let map_hashes = parts.iter().map(|part| map_hash(part)).collect();

        Ok(Self {
            transfer_hash: AddressHash::new_from_slice(data),
            parts,
            part_size,
            total_size: payload.len() as u32,
            compressed,
            map_hashes,
        })
    }

    pub fn transfer_hash(&self) -> &AddressHash {
        &self.transfer_hash
    }

    pub fn advertisement(&self) -> ResourceAdvertisement {
        ResourceAdvertisement {
            transfer_hash: self.transfer_hash,
            compressed: self.compressed,
            total_size: self.total_size,
            part_size: self.part_size,
            part_count: self.parts.len() as u16,
            map_hashes: self.map_hashes.clone(),
        }
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, index: u16) -> Option<&[u8]> {
        self.parts.get(index as usize).map(Vec::as_slice)
    }

    pub fn parts_for_request(&self, indices: &[u16]) -> Vec<(u16, Vec<u8>)> {
        indices
            .iter()
            .filter_map(|index| self.part(*index).map(|part| (*index, part.to_vec())))
            .collect()
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResourceStatus {
    Advertised,
    Transferring,
    Complete,
    Rejected,
    Failed,
}

/// Receiving side. Parts land in pre-allocated slots keyed by index, each
/// validated against its map hash and filled exactly once.
pub struct ResourceReceiver {
    advertisement: ResourceAdvertisement,
    parts: Vec<Option<Vec<u8>>>,
    status: ResourceStatus,
    last_activity: Instant,
    retries: u8,
}

impl ResourceReceiver {
    pub fn new(advertisement: ResourceAdvertisement) -> Self {
        let part_count = advertisement.part_count as usize;
        Self {
            advertisement,
            parts: vec![None; part_count],
            status: ResourceStatus::Advertised,
            last_activity: Instant::now(),
            retries: 0,
        }
    }

    pub fn accept(&mut self) {
        if self.status == ResourceStatus::Advertised {
            self.status = ResourceStatus::Transferring;
        }
    }

    pub fn reject(&mut self) {
        self.status = ResourceStatus::Rejected;
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    pub fn transfer_hash(&self) -> &AddressHash {
        &self.advertisement.transfer_hash
    }

    pub fn receive_part(&mut self, index: u16, data: &[u8]) -> Result<(), RnsError> {
        if self.status != ResourceStatus::Transferring {
            return Err(RnsError::InvalidArgument);
        }
        let slot = self.parts.get_mut(index as usize).ok_or(RnsError::InvalidArgument)?;

        let expected = self.advertisement.map_hashes.get(index as usize).copied();
        if expected != Some(map_hash(data)) {
            return Err(RnsError::IncorrectHash);
        }

        self.last_activity = Instant::now();
        if slot.is_none() {
            *slot = Some(data.to_vec());
        }
        Ok(())
    }

    pub fn missing(&self) -> Vec<u16> {
        self.parts
            .iter()
            .enumerate()
            .filter_map(|(index, part)| part.is_none().then_some(index as u16))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(Option::is_some)
    }

    /// Concatenates the parts, verifies the transfer hash and decompresses.
    pub fn finalize(&mut self) -> Result<Vec<u8>, RnsError> {
        if !self.is_complete() {
            return Err(RnsError::InvalidArgument);
        }

        let mut payload = Vec::with_capacity(self.advertisement.total_size as usize);
        for part in self.parts.iter().flatten() {
            payload.extend_from_slice(part);
        }

        let data = if self.advertisement.compressed { bz2_decompress(&payload)? } else { payload };

        if AddressHash::new_from_slice(&data) != self.advertisement.transfer_hash {
            self.status = ResourceStatus::Failed;
            return Err(RnsError::IncorrectHash);
        }

        self.status = ResourceStatus::Complete;
        Ok(data)
    }

    fn retry_due(&self, now: Instant, interval: Duration) -> bool {
        self.status == ResourceStatus::Transferring
            && !self.is_complete()
            && now.duration_since(self.last_activity) >= interval
    }
}

struct LinkResources {
    incoming: SlotArray<ResourceReceiver, MAX_RESOURCES_PER_LINK>,
    outgoing: SlotArray<ResourceSender, MAX_RESOURCES_PER_LINK>,
}

impl LinkResources {
    fn new() -> Self {
        Self { incoming: SlotArray::new(), outgoing: SlotArray::new() }
    }
}

/// Per-link transfer bookkeeping with bounded pools on both sides, plus the
/// periodic re-request of missing parts.
pub struct ResourceManager {
    links: HashMap<LinkId, LinkResources>,
    retry_interval: Duration,
    retry_limit: u8,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::new_with_config(DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_LIMIT)
    }

    pub fn new_with_config(retry_interval: Duration, retry_limit: u8) -> Self {
        Self { links: HashMap::new(), retry_interval, retry_limit }
    }

    pub fn add_outgoing(
        &mut self,
        link_id: LinkId,
        sender: ResourceSender,
    ) -> Result<(), RnsError> {
        self.links
            .entry(link_id)
            .or_insert_with(LinkResources::new)
            .outgoing
            .allocate(sender)
            .map(|_| ())
            .ok_or(RnsError::PoolExhausted)
    }

    pub fn add_incoming(
        &mut self,
        link_id: LinkId,
        receiver: ResourceReceiver,
    ) -> Result<(), RnsError> {
        self.links
            .entry(link_id)
            .or_insert_with(LinkResources::new)
            .incoming
            .allocate(receiver)
            .map(|_| ())
            .ok_or(RnsError::PoolExhausted)
    }

    pub fn outgoing_mut(
        &mut self,
        link_id: &LinkId,
        transfer_hash: &AddressHash,
    ) -> Option<&mut ResourceSender> {
        let resources = self.links.get_mut(link_id)?;
        let index =
            resources.outgoing.find(|sender| sender.transfer_hash() == transfer_hash)?;
        resources.outgoing.get_mut(index)
    }

    pub fn incoming_mut(
        &mut self,
        link_id: &LinkId,
        transfer_hash: &AddressHash,
    ) -> Option<&mut ResourceReceiver> {
        let resources = self.links.get_mut(link_id)?;
        let index =
            resources.incoming.find(|receiver| receiver.transfer_hash() == transfer_hash)?;
        resources.incoming.get_mut(index)
    }

    pub fn remove_link(&mut self, link_id: &LinkId) {
        self.links.remove(link_id);
    }

    /// Stalled incoming transfers re-request their missing parts until the
    /// retry budget runs out, then fail.
    pub fn retry_requests(&mut self, now: Instant) -> Vec<(LinkId, AddressHash, Vec<u16>)> {
        let mut requests = Vec::new();
        let retry_interval = self.retry_interval;
        let retry_limit = self.retry_limit;

        for (link_id, resources) in self.links.iter_mut() {
            for (_, receiver) in resources.incoming.iter_mut() {
                if !receiver.retry_due(now, retry_interval) {
                    continue;
                }
                if receiver.retries >= retry_limit {
                    log::warn!(
                        "resource({}): retry limit reached, failing transfer",
                        receiver.transfer_hash()
                    );
                    receiver.status = ResourceStatus::Failed;
                    continue;
                }
                receiver.retries += 1;
                receiver.last_activity = now;
                requests.push((*link_id, *receiver.transfer_hash(), receiver.missing()));
            }

            resources.incoming.retain(|receiver| {
                !matches!(receiver.status(), ResourceStatus::Failed | ResourceStatus::Rejected)
            });
        }

        requests
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{
        decode_part_request, encode_part_request, ResourceAdvertisement, ResourceManager,
        ResourceReceiver, ResourceSender, ResourceStatus, MAX_RESOURCES_PER_LINK,
    };
    use crate::error::RnsError;
    use crate::hash::AddressHash;

    fn transfer(data: &[u8], part_size: u16) -> Vec<u8> {
        let sender = ResourceSender::new(data, part_size).expect("sender");
        let advertisement = ResourceAdvertisement::from_bytes(&sender.advertisement().to_bytes())
            .expect("advertisement");

        let mut receiver = ResourceReceiver::new(advertisement);
        receiver.accept();

        for (index, part) in sender.parts_for_request(&receiver.missing()) {
            receiver.receive_part(index, &part).expect("part accepted");
        }

        receiver.finalize().expect("verified payload")
    }

    #[test]
    fn full_transfer_roundtrip() {
        let data = b"resource payload ".repeat(100);
        assert_eq!(transfer(&data, 64), data);
    }

    #[test]
    fn empty_payload_transfer() {
        assert_eq!(transfer(b"", 64), b"");
    }

    #[test]
    fn corrupted_part_is_rejected() {
        let data = b"hash-checked payload".repeat(8);
        let sender = ResourceSender::new(&data, 32).expect("sender");
        let mut receiver = ResourceReceiver::new(sender.advertisement());
        receiver.accept();

        let mut part = sender.part(0).expect("part").to_vec();
        part[0] ^= 0x01;
        assert_eq!(receiver.receive_part(0, &part), Err(RnsError::IncorrectHash));
        assert!(receiver.missing().contains(&0));
    }

    #[test]
    fn selective_retransmission_completes_transfer() {
        let data = b"0123456789".repeat(20);
        let sender = ResourceSender::new(&data, 16).expect("sender");
        let mut receiver = ResourceReceiver::new(sender.advertisement());
        receiver.accept();

        // Deliver everything except parts 1 and 3.
        for (index, part) in sender.parts_for_request(&receiver.missing()) {
            if index != 1 && index != 3 {
                receiver.receive_part(index, &part).expect("part accepted");
            }
        }
        assert_eq!(receiver.missing(), vec![1, 3]);

        let request = decode_part_request(&encode_part_request(&receiver.missing()))
            .expect("request roundtrip");
        for (index, part) in sender.parts_for_request(&request) {
            receiver.receive_part(index, &part).expect("part accepted");
        }

        assert_eq!(receiver.finalize().expect("payload"), data);
    }

    #[test]
    fn rejected_transfer_accepts_no_parts() {
        let sender = ResourceSender::new(b"unwanted", 4).expect("sender");
        let mut receiver = ResourceReceiver::new(sender.advertisement());
        receiver.reject();

        let part = sender.part(0).expect("part");
        assert!(receiver.receive_part(0, part).is_err());
        assert_eq!(receiver.status(), ResourceStatus::Rejected);
    }

    #[test]
    fn per_link_pools_are_bounded() {
        let mut manager = ResourceManager::new();
        let link_id = AddressHash::new_from_slice(b"link");

        for _ in 0..MAX_RESOURCES_PER_LINK {
            let sender = ResourceSender::new(b"data", 4).expect("sender");
            manager.add_outgoing(link_id, sender).expect("slot");
        }
        let sender = ResourceSender::new(b"data", 4).expect("sender");
        assert_eq!(manager.add_outgoing(link_id, sender), Err(RnsError::PoolExhausted));
    }

    #[test]
    fn stalled_transfer_retries_then_fails() {
        let mut manager = ResourceManager::new_with_config(Duration::from_millis(1), 2);
        let link_id = AddressHash::new_from_slice(b"link");

        let sender = ResourceSender::new(b"stalled data", 4).expect("sender");
        let mut receiver = ResourceReceiver::new(sender.advertisement());
        receiver.accept();
        let transfer_hash = *receiver.transfer_hash();
        manager.add_incoming(link_id, receiver).expect("slot");

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(manager.retry_requests(later).len(), 1);
        let even_later = later + Duration::from_secs(1);
        assert_eq!(manager.retry_requests(even_later).len(), 1);

        // Retry budget exhausted: transfer fails and its slot is released.
        let final_tick = even_later + Duration::from_secs(1);
        assert!(manager.retry_requests(final_tick).is_empty());
        assert!(manager.incoming_mut(&link_id, &transfer_hash).is_none());
    }
}
