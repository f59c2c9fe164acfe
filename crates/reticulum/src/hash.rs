use core::fmt;

use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};

use crate::error::RnsError;

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_HASH_SIZE: usize = 16;
pub const RATCHET_ID_SIZE: usize = 10;
pub const NAME_HASH_LENGTH: usize = 10;

pub fn full_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::new().chain_update(data).finalize().into()
}

/// Full SHA-256 digest.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash([u8; HASH_SIZE]);

/// The first 16 bytes of a SHA-256 digest: the stable wire address of
/// identities, destinations, links and packets.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash, Default)]
pub struct AddressHash([u8; ADDRESS_HASH_SIZE]);

/// The first 10 bytes of SHA-256 over a ratchet public key; selects the
/// decryption ratchet inside a destination's ring.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct RatchetId([u8; RATCHET_ID_SIZE]);

impl Hash {
    pub fn generator() -> Sha256 {
        Sha256::new()
    }

    pub const fn new(hash: [u8; HASH_SIZE]) -> Self {
        Self(hash)
    }

    pub fn new_from_slice(data: &[u8]) -> Self {
        Self(full_hash(data))
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut data = [0u8; HASH_SIZE];
        rng.fill_bytes(&mut data);
        Self::new_from_slice(&data)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }
}

impl AddressHash {
    pub const fn new(hash: [u8; ADDRESS_HASH_SIZE]) -> Self {
        Self(hash)
    }

    pub const fn new_empty() -> Self {
        Self([0u8; ADDRESS_HASH_SIZE])
    }

    pub fn new_from_slice(data: &[u8]) -> Self {
        Self::new_from_hash(&Hash::new_from_slice(data))
    }

    pub fn new_from_hash(hash: &Hash) -> Self {
        let mut truncated = [0u8; ADDRESS_HASH_SIZE];
        truncated.copy_from_slice(&hash.0[..ADDRESS_HASH_SIZE]);
        Self(truncated)
    }

    pub fn new_from_rand<R: CryptoRngCore>(rng: R) -> Self {
        Self::new_from_hash(&Hash::new_from_rand(rng))
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() != ADDRESS_HASH_SIZE {
            return Err(RnsError::IncorrectHash);
        }
        let mut bytes = [0u8; ADDRESS_HASH_SIZE];
        bytes.copy_from_slice(data);
        Ok(Self(bytes))
    }

    pub fn new_from_hex_string(hex_string: &str) -> Result<Self, RnsError> {
        let decoded = hex::decode(hex_string).map_err(|_| RnsError::IncorrectHash)?;
        Self::try_from_slice(&decoded)
    }

    pub fn to_hex_string(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; ADDRESS_HASH_SIZE] {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

impl RatchetId {
    pub fn new_from_public(ratchet_public: &[u8]) -> Self {
        let digest = full_hash(ratchet_public);
        let mut id = [0u8; RATCHET_ID_SIZE];
        id.copy_from_slice(&digest[..RATCHET_ID_SIZE]);
        Self(id)
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() != RATCHET_ID_SIZE {
            return Err(RnsError::IncorrectHash);
        }
        let mut bytes = [0u8; RATCHET_ID_SIZE];
        bytes.copy_from_slice(data);
        Ok(Self(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Hash> for AddressHash {
    fn from(hash: Hash) -> Self {
        Self::new_from_hash(&hash)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", hex::encode(self.0))
    }
}

impl fmt::Display for RatchetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{AddressHash, RatchetId, RATCHET_ID_SIZE};

    #[test]
    fn address_hex_string_roundtrip() {
        let original = AddressHash::new_from_rand(OsRng);
        let restored =
            AddressHash::new_from_hex_string(&original.to_hex_string()).expect("valid hash");
        assert_eq!(restored, original);
    }

    #[test]
    fn address_hash_rejects_wrong_length() {
        assert!(AddressHash::try_from_slice(&[0u8; 15]).is_err());
        assert!(AddressHash::new_from_hex_string("abcd").is_err());
    }

    #[test]
    fn ratchet_id_is_deterministic_and_ten_bytes() {
        let public = [7u8; 32];
        let first = RatchetId::new_from_public(&public);
        let second = RatchetId::new_from_public(&public);
        assert_eq!(first, second);
        assert_eq!(first.as_slice().len(), RATCHET_ID_SIZE);
    }
}
