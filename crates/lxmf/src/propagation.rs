use reticulum::hash::{AddressHash, Hash};
use reticulum::storage::StorageAdapter;

use crate::error::LxmfError;

pub const MAX_CANDIDATES: usize = 16;
const STORE_PREFIX: &str = "lxmf.store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationSelection {
    /// Rank candidates by recency and link quality.
    Auto,
    /// Always use the operator-pinned node.
    Pinned(AddressHash),
}

#[derive(Debug, Clone, Copy)]
pub struct PropagationNode {
    pub hash: AddressHash,
    pub last_seen: u64,
    /// Link-quality heuristic in [0, 1]; hop count and interface bitrate
    /// folded in by the caller.
    pub link_quality: f32,
}

impl PropagationNode {
    fn score(&self, now: u64) -> f32 {
        let age = now.saturating_sub(self.last_seen) as f32;
        let recency = (1.0 - age / 3600.0).clamp(0.0, 1.0);
        0.6 * recency + 0.4 * self.link_quality.clamp(0.0, 1.0)
    }
}

/// Tracks announced propagation nodes and picks the store-and-forward
/// target: the pinned node when configured, otherwise the best-ranked
/// candidate.
pub struct PropagationManager {
    candidates: Vec<PropagationNode>,
    selection: PropagationSelection,
}

impl PropagationManager {
    pub fn new(selection: PropagationSelection) -> Self {
        Self { candidates: Vec::new(), selection }
    }

    pub fn selection(&self) -> PropagationSelection {
        self.selection
    }

    pub fn set_selection(&mut self, selection: PropagationSelection) {
        self.selection = selection;
    }

    pub fn note_candidate(&mut self, hash: AddressHash, link_quality: f32, now: u64) {
        if let Some(existing) = self.candidates.iter_mut().find(|node| node.hash == hash) {
            existing.last_seen = now;
            existing.link_quality = link_quality;
            return;
        }

        if self.candidates.len() >= MAX_CANDIDATES {
            // Replace the stalest candidate.
            if let Some(index) = self
                .candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, node)| node.last_seen)
                .map(|(index, _)| index)
            {
                self.candidates[index] = PropagationNode { hash, last_seen: now, link_quality };
            }
            return;
        }

        self.candidates.push(PropagationNode { hash, last_seen: now, link_quality });
    }

    pub fn select(&self, now: u64) -> Option<AddressHash> {
        match self.selection {
            PropagationSelection::Pinned(hash) => Some(hash),
            PropagationSelection::Auto => self
                .candidates
                .iter()
                .max_by(|a, b| {
                    a.score(now)
                        .partial_cmp(&b.score(now))
                        .unwrap_or(core::cmp::Ordering::Equal)
                })
                .map(|node| node.hash),
        }
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }
}

fn store_key(destination: &AddressHash, message_id: &Hash) -> String {
    format!("{}.{}.{}", STORE_PREFIX, destination.to_hex_string(), message_id)
}

fn queue_prefix(destination: &AddressHash) -> String {
    format!("{}.{}.", STORE_PREFIX, destination.to_hex_string())
}

/// Store-and-forward message store on a propagation node, keyed by
/// destination and message id through the storage adapter.
pub fn store_message(
    storage: &mut dyn StorageAdapter,
    destination: &AddressHash,
    message_id: &Hash,
    wire: &[u8],
) -> Result<bool, LxmfError> {
    let key = store_key(destination, message_id);
    if storage.read_blob(&key).map_err(|_| LxmfError::Storage)?.is_some() {
        return Ok(false);
    }
    storage.write_blob(&key, wire).map_err(|_| LxmfError::Storage)?;
    Ok(true)
}

pub fn queued_count(
    storage: &dyn StorageAdapter,
    destination: &AddressHash,
) -> Result<usize, LxmfError> {
    Ok(storage.list_keys(&queue_prefix(destination)).map_err(|_| LxmfError::Storage)?.len())
}

/// Hands over and removes every message queued for `destination`.
pub fn sync_queue(
    storage: &mut dyn StorageAdapter,
    destination: &AddressHash,
) -> Result<Vec<Vec<u8>>, LxmfError> {
    let keys = storage.list_keys(&queue_prefix(destination)).map_err(|_| LxmfError::Storage)?;

    let mut messages = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(wire) = storage.read_blob(&key).map_err(|_| LxmfError::Storage)? {
            messages.push(wire);
        }
        storage.delete(&key).map_err(|_| LxmfError::Storage)?;
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::{
        queued_count, store_message, sync_queue, PropagationManager, PropagationSelection,
        MAX_CANDIDATES,
    };
    use reticulum::hash::{AddressHash, Hash};
    use reticulum::storage::MemoryStorage;

    fn hash(tag: u64) -> AddressHash {
        AddressHash::new_from_slice(&tag.to_be_bytes())
    }

    #[test]
    fn auto_selection_prefers_fresh_high_quality_nodes() {
        let mut manager = PropagationManager::new(PropagationSelection::Auto);
        assert!(manager.select(1000).is_none());

        manager.note_candidate(hash(1), 0.9, 1000);
        manager.note_candidate(hash(2), 0.9, 10);
        manager.note_candidate(hash(3), 0.1, 1000);

        assert_eq!(manager.select(1000), Some(hash(1)));
    }

    #[test]
    fn pinned_selection_overrides_ranking() {
        let mut manager = PropagationManager::new(PropagationSelection::Pinned(hash(9)));
        manager.note_candidate(hash(1), 1.0, 1000);
        assert_eq!(manager.select(1000), Some(hash(9)));
    }

    #[test]
    fn candidate_table_is_bounded() {
        let mut manager = PropagationManager::new(PropagationSelection::Auto);
        for index in 0..(MAX_CANDIDATES as u64 + 4) {
            manager.note_candidate(hash(index), 0.5, index);
        }
        assert_eq!(manager.candidate_count(), MAX_CANDIDATES);
    }

    #[test]
    fn store_and_sync_roundtrip() {
        let mut storage = MemoryStorage::new();
        let destination = hash(42);

        let first_id = Hash::new_from_slice(b"msg-1");
        let second_id = Hash::new_from_slice(b"msg-2");
        assert!(store_message(&mut storage, &destination, &first_id, b"wire-1").expect("stored"));
        assert!(store_message(&mut storage, &destination, &second_id, b"wire-2").expect("stored"));

        // Duplicate store is a no-op.
        assert!(!store_message(&mut storage, &destination, &first_id, b"wire-1").expect("ok"));
        assert_eq!(queued_count(&storage, &destination).expect("count"), 2);

        let synced = sync_queue(&mut storage, &destination).expect("synced");
        assert_eq!(synced.len(), 2);
        assert!(synced.contains(&b"wire-1".to_vec()));

        // The queue drains on sync.
        assert_eq!(queued_count(&storage, &destination).expect("count"), 0);
        assert!(sync_queue(&mut storage, &destination).expect("synced").is_empty());
    }

    #[test]
    fn queues_are_per_destination() {
        let mut storage = MemoryStorage::new();
        let id = Hash::new_from_slice(b"msg");

        store_message(&mut storage, &hash(1), &id, b"for-one").expect("stored");
        store_message(&mut storage, &hash(2), &id, b"for-two").expect("stored");

        let synced = sync_queue(&mut storage, &hash(1)).expect("synced");
        assert_eq!(synced, vec![b"for-one".to_vec()]);
        assert_eq!(queued_count(&storage, &hash(2)).expect("count"), 1);
    }
}
