use core::fmt;

use ed25519_dalek::{ed25519::signature::Signer, Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

use crate::crypt::fernet::{Fernet, PlainText, Token, FERNET_KEY_SIZE};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const PRIVATE_KEY_LENGTH: usize = PUBLIC_KEY_LENGTH * 2;
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;
pub const DERIVED_KEY_LENGTH: usize = FERNET_KEY_SIZE;

/// Public half of a participant: X25519 key-agreement key, Ed25519 verifying
/// key, and the 16-byte truncated hash of the 64 bytes of public material.
#[derive(Copy, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub address_hash: AddressHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let hash = Hash::new(
            Hash::generator()
                .chain_update(public_key.as_bytes())
                .chain_update(verifying_key.as_bytes())
                .finalize()
                .into(),
        );

        Self { public_key, verifying_key, address_hash: AddressHash::new_from_hash(&hash) }
    }

    pub fn new_from_slices(public_key: &[u8], verifying_key: &[u8]) -> Result<Self, RnsError> {
        if public_key.len() != PUBLIC_KEY_LENGTH || verifying_key.len() != PUBLIC_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }

        let mut agreement = [0u8; PUBLIC_KEY_LENGTH];
        agreement.copy_from_slice(public_key);

        let mut verifying = [0u8; PUBLIC_KEY_LENGTH];
        verifying.copy_from_slice(verifying_key);
        let verifying_key =
            VerifyingKey::from_bytes(&verifying).map_err(|_| RnsError::CryptoError)?;

        Ok(Self::new(PublicKey::from(agreement), verifying_key))
    }

    /// 64 bytes: X25519 public || Ed25519 verifying.
    pub fn to_public_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.public_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.verifying_key.as_bytes());
        bytes
    }

    pub fn from_public_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }
        Self::new_from_slices(&bytes[..PUBLIC_KEY_LENGTH], &bytes[PUBLIC_KEY_LENGTH..])
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.as_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.verifying_key.verify_strict(data, signature).map_err(|_| RnsError::IncorrectSignature)
    }

    /// Static-DH encryption to this identity: ephemeral X25519 public key
    /// followed by a Fernet token under the HKDF-derived key.
    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        plaintext: &[u8],
        salt: Option<&[u8]>,
    ) -> Result<Vec<u8>, RnsError> {
        encrypt_to_public_key(rng, &self.public_key, plaintext, salt)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_hash)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(PublicKey::from([0u8; PUBLIC_KEY_LENGTH]), VerifyingKey::default())
    }
}

/// Full keypair: X25519 static secret plus Ed25519 signing key.
#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    private_key: StaticSecret,
    sign_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(private_key: StaticSecret, sign_key: SigningKey) -> Self {
        Self {
            identity: Identity::new((&private_key).into(), sign_key.verifying_key()),
            private_key,
            sign_key,
        }
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let sign_key = SigningKey::generate(&mut rng);
        let private_key = StaticSecret::random_from_rng(rng);
        Self::new(private_key, sign_key)
    }

    /// Deterministic identity for tests and fixed node names.
    pub fn new_from_name(name: &str) -> Self {
        let hash = Hash::new_from_slice(name.as_bytes());
        let private_key = StaticSecret::from(hash.to_bytes());

        let hash = Hash::new_from_slice(hash.as_slice());
        let sign_key = SigningKey::from_bytes(hash.as_bytes());

        Self::new(private_key, sign_key)
    }

    /// Restores an identity from the persisted 64-byte blob
    /// (X25519 seed || Ed25519 seed).
    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }

        let mut private_key = [0u8; PUBLIC_KEY_LENGTH];
        private_key.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        let mut sign_key = [0u8; PUBLIC_KEY_LENGTH];
        sign_key.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);

        Ok(Self::new(StaticSecret::from(private_key), SigningKey::from_bytes(&sign_key)))
    }

    pub fn to_private_key_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.private_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.sign_key.as_bytes());
        bytes
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.identity.address_hash
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.sign_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.identity.verify(data, signature)
    }

    pub fn exchange(&self, public_key: &PublicKey) -> SharedSecret {
        self.private_key.diffie_hellman(public_key)
    }

    pub fn derive_key(&self, public_key: &PublicKey, salt: Option<&[u8]>) -> DerivedKey {
        DerivedKey::new_from_private_key(&self.private_key, public_key, salt)
    }

    /// Reverses `Identity::encrypt`: reads the leading ephemeral public key,
    /// derives the shared key and opens the Fernet token.
    pub fn decrypt(&self, ciphertext: &[u8], salt: Option<&[u8]>) -> Result<Vec<u8>, RnsError> {
        decrypt_with_private_key(&self.private_key, ciphertext, salt)
    }
}

impl fmt::Display for PrivateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity.address_hash)
    }
}

/// 32 bytes of HKDF-SHA256 output over an X25519 shared secret, split
/// 16/16 into the Fernet signing and encryption halves.
pub struct DerivedKey {
    key: [u8; DERIVED_KEY_LENGTH],
}

impl DerivedKey {
    pub fn new(shared_key: &SharedSecret, salt: Option<&[u8]>) -> Self {
        let mut key = [0u8; DERIVED_KEY_LENGTH];
        let _ = Hkdf::<Sha256>::new(salt, shared_key.as_bytes()).expand(&[], &mut key);
        Self { key }
    }

    pub fn new_empty() -> Self {
        Self { key: [0u8; DERIVED_KEY_LENGTH] }
    }

    pub fn new_from_private_key(
        priv_key: &StaticSecret,
        pub_key: &PublicKey,
        salt: Option<&[u8]>,
    ) -> Self {
        Self::new(&priv_key.diffie_hellman(pub_key), salt)
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LENGTH] {
        &self.key
    }

    pub fn fernet<R: CryptoRngCore + Copy>(&self, rng: R) -> Fernet<R> {
        Fernet::new_from_key(&self.key, rng)
    }
}

pub fn encrypt_to_public_key<R: CryptoRngCore + Copy>(
    rng: R,
    public_key: &PublicKey,
    plaintext: &[u8],
    salt: Option<&[u8]>,
) -> Result<Vec<u8>, RnsError> {
    let secret = EphemeralSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&secret);
    let derived = DerivedKey::new(&secret.diffie_hellman(public_key), salt);

    let mut out = vec![0u8; PUBLIC_KEY_LENGTH + plaintext.len() + 64];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());

    let token_len = derived
        .fernet(rng)
        .encrypt(PlainText::from(plaintext), &mut out[PUBLIC_KEY_LENGTH..])?
        .len();

    out.truncate(PUBLIC_KEY_LENGTH + token_len);
    Ok(out)
}

pub fn decrypt_with_private_key(
    private_key: &StaticSecret,
    ciphertext: &[u8],
    salt: Option<&[u8]>,
) -> Result<Vec<u8>, RnsError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(RnsError::Truncated);
    }

    let mut pub_bytes = [0u8; PUBLIC_KEY_LENGTH];
    pub_bytes.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let ephemeral_public = PublicKey::from(pub_bytes);

    let derived = DerivedKey::new_from_private_key(private_key, &ephemeral_public, salt);
    let fernet = derived.fernet(rand_core::OsRng);

    let token = fernet.verify(Token::from(&ciphertext[PUBLIC_KEY_LENGTH..]))?;
    let mut out = vec![0u8; ciphertext.len()];
    let plain_len = fernet.decrypt(token, &mut out)?.as_bytes().len();
    out.truncate(plain_len);
    Ok(out)
}

const KNOWN_DESTINATIONS_SLOTS: usize = 192;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownDestinationRecord {
    pub public_bytes: ByteBuf,
    pub ratchet: Option<ByteBuf>,
    pub last_seen: u64,
}

struct KnownSlot {
    destination: AddressHash,
    record: KnownDestinationRecord,
}

/// Bounded cache of destinations learned from announces: public key material
/// plus the most recent ratchet public key. Eviction is LRU by last-seen.
#[derive(Default)]
pub struct KnownDestinations {
    slots: Vec<KnownSlot>,
}

impl KnownDestinations {
    pub fn new() -> Self {
        Self { slots: Vec::with_capacity(KNOWN_DESTINATIONS_SLOTS) }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn remember(&mut self, destination: AddressHash, identity: &Identity, now: u64) {
        let public_bytes = ByteBuf::from(identity.to_public_bytes().to_vec());

        if let Some(slot) = self.slot_mut(&destination) {
            slot.record.public_bytes = public_bytes;
            slot.record.last_seen = now;
            return;
        }

        if self.slots.len() >= KNOWN_DESTINATIONS_SLOTS {
            self.evict_oldest();
        }

        self.slots.push(KnownSlot {
            destination,
            record: KnownDestinationRecord { public_bytes, ratchet: None, last_seen: now },
        });
    }

    pub fn recall(&self, destination: &AddressHash) -> Option<Identity> {
        self.slots
            .iter()
            .find(|slot| slot.destination == *destination)
            .and_then(|slot| Identity::from_public_bytes(slot.record.public_bytes.as_ref()).ok())
    }

    pub fn remember_ratchet(
        &mut self,
        destination: &AddressHash,
        ratchet_public: [u8; PUBLIC_KEY_LENGTH],
        now: u64,
    ) -> bool {
        match self.slot_mut(destination) {
            Some(slot) => {
                slot.record.ratchet = Some(ByteBuf::from(ratchet_public.to_vec()));
                slot.record.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn recall_ratchet(&self, destination: &AddressHash) -> Option<[u8; PUBLIC_KEY_LENGTH]> {
        self.slots
            .iter()
            .find(|slot| slot.destination == *destination)
            .and_then(|slot| slot.record.ratchet.as_ref())
            .and_then(|ratchet| ratchet.as_ref().try_into().ok())
    }

    /// Snapshot for the persistence adapter, msgpack encoded.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, RnsError> {
        let entries: Vec<(ByteBuf, KnownDestinationRecord)> = self
            .slots
            .iter()
            .map(|slot| (ByteBuf::from(slot.destination.to_bytes().to_vec()), slot.record.clone()))
            .collect();
        rmp_serde::to_vec(&entries).map_err(|_| RnsError::StorageUnavailable)
    }

    pub fn from_snapshot(data: &[u8]) -> Result<Self, RnsError> {
        let entries: Vec<(ByteBuf, KnownDestinationRecord)> =
            rmp_serde::from_slice(data).map_err(|_| RnsError::StorageUnavailable)?;

        let mut cache = Self::new();
        for (destination, record) in entries.into_iter().take(KNOWN_DESTINATIONS_SLOTS) {
            let destination = AddressHash::try_from_slice(destination.as_ref())?;
            cache.slots.push(KnownSlot { destination, record });
        }
        Ok(cache)
    }

    fn slot_mut(&mut self, destination: &AddressHash) -> Option<&mut KnownSlot> {
        self.slots.iter_mut().find(|slot| slot.destination == *destination)
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.record.last_seen)
            .map(|(index, _)| index)
        {
            self.slots.swap_remove(oldest);
        }
    }
}
