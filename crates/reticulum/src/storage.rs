use std::collections::HashMap;

use crate::error::RnsError;
use crate::identity::{KnownDestinations, PrivateIdentity};

pub const IDENTITY_KEY: &str = "identity";
pub const KNOWN_DESTINATIONS_KEY: &str = "known_destinations";

/// Persistence boundary of the node. Backed by any key-value store or
/// filesystem the host provides; the core never touches storage directly.
pub trait StorageAdapter: Send {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, RnsError>;
    fn write_blob(&mut self, key: &str, bytes: &[u8]) -> Result<(), RnsError>;
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, RnsError>;
    fn delete(&mut self, key: &str) -> Result<(), RnsError>;
}

/// In-memory adapter: the fallback when the real backend fails, and the
/// default for tests.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorage {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, RnsError> {
        Ok(self.blobs.get(key).cloned())
    }

    fn write_blob(&mut self, key: &str, bytes: &[u8]) -> Result<(), RnsError> {
        self.blobs.insert(key.into(), bytes.to_vec());
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, RnsError> {
        let mut keys: Vec<String> =
            self.blobs.keys().filter(|key| key.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&mut self, key: &str) -> Result<(), RnsError> {
        self.blobs.remove(key);
        Ok(())
    }
}

/// Loads the node identity from its 64-byte blob, generating and persisting
/// a fresh one on first boot. A failing adapter degrades to a transient
/// in-memory identity with a single warning.
pub fn load_or_create_identity(storage: &mut dyn StorageAdapter) -> PrivateIdentity {
    match storage.read_blob(IDENTITY_KEY) {
        Ok(Some(blob)) => match PrivateIdentity::from_private_key_bytes(&blob) {
            Ok(identity) => return identity,
            Err(_) => {
                log::warn!("storage: corrupt identity blob, generating a new identity");
            }
        },
        Ok(None) => {}
        Err(_) => {
            log::warn!("storage: unavailable, running with a memory-only identity");
            return PrivateIdentity::new_from_rand(rand_core::OsRng);
        }
    }

    let identity = PrivateIdentity::new_from_rand(rand_core::OsRng);
    if storage.write_blob(IDENTITY_KEY, &identity.to_private_key_bytes()).is_err() {
        log::warn!("storage: could not persist identity, it will not survive restart");
    }
    identity
}

pub fn save_known_destinations(
    storage: &mut dyn StorageAdapter,
    known: &KnownDestinations,
) -> Result<(), RnsError> {
    let snapshot = known.to_snapshot()?;
    storage.write_blob(KNOWN_DESTINATIONS_KEY, &snapshot)
}

pub fn load_known_destinations(storage: &dyn StorageAdapter) -> KnownDestinations {
    match storage.read_blob(KNOWN_DESTINATIONS_KEY) {
        Ok(Some(blob)) => KnownDestinations::from_snapshot(&blob).unwrap_or_else(|_| {
            log::warn!("storage: corrupt known-destinations snapshot, starting empty");
            KnownDestinations::new()
        }),
        _ => KnownDestinations::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        load_known_destinations, load_or_create_identity, save_known_destinations, MemoryStorage,
        StorageAdapter, IDENTITY_KEY,
    };
    use crate::hash::AddressHash;
    use crate::identity::{KnownDestinations, PrivateIdentity};
    use rand_core::OsRng;

    #[test]
    fn identity_survives_reboot() {
        let mut storage = MemoryStorage::new();

        let first = load_or_create_identity(&mut storage);
        let second = load_or_create_identity(&mut storage);
        assert_eq!(first.address_hash(), second.address_hash());

        let blob = storage.read_blob(IDENTITY_KEY).expect("read").expect("blob");
        assert_eq!(blob.len(), 64);
    }

    #[test]
    fn known_destinations_roundtrip_through_storage() {
        let mut storage = MemoryStorage::new();
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let destination = AddressHash::new_from_rand(OsRng);

        let mut known = KnownDestinations::new();
        known.remember(destination, identity.as_identity(), 10);
        save_known_destinations(&mut storage, &known).expect("saved");

        let restored = load_known_destinations(&storage);
        assert!(restored.recall(&destination).is_some());
    }

    #[test]
    fn list_and_delete() {
        let mut storage = MemoryStorage::new();
        storage.write_blob("msg.1", b"a").expect("write");
        storage.write_blob("msg.2", b"b").expect("write");
        storage.write_blob("other", b"c").expect("write");

        assert_eq!(storage.list_keys("msg.").expect("list"), vec!["msg.1", "msg.2"]);

        storage.delete("msg.1").expect("delete");
        assert_eq!(storage.list_keys("msg.").expect("list"), vec!["msg.2"]);
    }
}
