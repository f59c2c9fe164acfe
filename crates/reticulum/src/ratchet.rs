use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypt::fernet::{PlainText, Token};
use crate::error::RnsError;
use crate::hash::RatchetId;
use crate::identity::{decrypt_with_private_key, DerivedKey, PUBLIC_KEY_LENGTH};

pub const RATCHET_LENGTH: usize = PUBLIC_KEY_LENGTH;
pub const DEFAULT_RATCHET_INTERVAL_SECS: u64 = 1800;
pub const MAX_RETAINED_RATCHETS: usize = 128;

/// A short-lived X25519 keypair used for forward-secret encryption to a
/// destination. Identified on the wire by the first 10 bytes of the SHA-256
/// of its public key.
pub struct Ratchet {
    secret: StaticSecret,
    created: u64,
}

impl Ratchet {
    pub fn new<R: CryptoRngCore>(rng: R, created: u64) -> Self {
        Self { secret: StaticSecret::random_from_rng(rng), created }
    }

    pub fn from_secret_bytes(bytes: [u8; RATCHET_LENGTH], created: u64) -> Self {
        Self { secret: StaticSecret::from(bytes), created }
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn public(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn public_bytes(&self) -> [u8; RATCHET_LENGTH] {
        *self.public().as_bytes()
    }

    pub fn id(&self) -> RatchetId {
        RatchetId::new_from_public(self.public().as_bytes())
    }

    pub fn secret_bytes(&self) -> [u8; RATCHET_LENGTH] {
        self.secret.to_bytes()
    }

    /// Fernet token under HKDF(X25519(self, peer)).
    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        peer_public: &PublicKey,
        plaintext: &[u8],
        salt: Option<&[u8]>,
    ) -> Result<Vec<u8>, RnsError> {
        let derived = DerivedKey::new(&self.secret.diffie_hellman(peer_public), salt);
        let fernet = derived.fernet(rng);

        let mut out = vec![0u8; plaintext.len() + 64];
        let token_len = fernet.encrypt(PlainText::from(plaintext), &mut out)?.len();
        out.truncate(token_len);
        Ok(out)
    }

    pub fn decrypt(
        &self,
        peer_public: &PublicKey,
        token_bytes: &[u8],
        salt: Option<&[u8]>,
    ) -> Result<Vec<u8>, RnsError> {
        let derived = DerivedKey::new(&self.secret.diffie_hellman(peer_public), salt);
        let fernet = derived.fernet(rand_core::OsRng);

        let token = fernet.verify(Token::from(token_bytes))?;
        let mut out = vec![0u8; token_bytes.len()];
        let plain_len = fernet.decrypt(token, &mut out)?.as_bytes().len();
        out.truncate(plain_len);
        Ok(out)
    }

    /// Opens an ephemeral-key envelope (ephemeral public || Fernet token)
    /// addressed to this ratchet.
    pub fn decrypt_envelope(
        &self,
        ciphertext: &[u8],
        salt: Option<&[u8]>,
    ) -> Result<Vec<u8>, RnsError> {
        decrypt_with_private_key(&self.secret, ciphertext, salt)
    }
}

/// Per-destination ratchet ring. The newest entry encrypts outbound
/// announces; older entries stay available for in-flight inbound traffic.
pub struct RatchetRing {
    ratchets: Vec<Ratchet>,
    interval_secs: u64,
    retained: usize,
    last_rotation: u64,
}

impl RatchetRing {
    pub fn new() -> Self {
        Self {
            ratchets: Vec::new(),
            interval_secs: DEFAULT_RATCHET_INTERVAL_SECS,
            retained: MAX_RETAINED_RATCHETS,
            last_rotation: 0,
        }
    }

    pub fn with_interval(interval_secs: u64) -> Self {
        Self { interval_secs, ..Self::new() }
    }

    pub fn len(&self) -> usize {
        self.ratchets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratchets.is_empty()
    }

    pub fn set_retained(&mut self, retained: usize) -> Result<(), RnsError> {
        if retained == 0 || retained > MAX_RETAINED_RATCHETS {
            return Err(RnsError::InvalidArgument);
        }
        self.retained = retained;
        self.ratchets.truncate(retained);
        Ok(())
    }

    /// Appends a fresh ratchet when `interval_secs` has elapsed since the
    /// last rotation, or immediately when forced. Returns true on rotation.
    pub fn rotate<R: CryptoRngCore>(&mut self, rng: R, now: u64, force: bool) -> bool {
        let due = self.ratchets.is_empty() || now >= self.last_rotation + self.interval_secs;
        if !force && !due {
            return false;
        }

        self.ratchets.insert(0, Ratchet::new(rng, now));
        self.ratchets.truncate(self.retained);
        self.last_rotation = now;
        true
    }

    pub fn current(&self) -> Option<&Ratchet> {
        self.ratchets.first()
    }

    pub fn current_public(&self) -> Option<[u8; RATCHET_LENGTH]> {
        self.current().map(Ratchet::public_bytes)
    }

    pub fn get(&self, id: &RatchetId) -> Option<&Ratchet> {
        self.ratchets.iter().find(|ratchet| ratchet.id() == *id)
    }

    /// Ratchet-id addressed decryption. An id outside the ring fails with
    /// `UnknownRatchet`.
    pub fn decrypt_with_id(
        &self,
        id: &RatchetId,
        ciphertext: &[u8],
        salt: Option<&[u8]>,
    ) -> Result<Vec<u8>, RnsError> {
        let ratchet = self.get(id).ok_or(RnsError::UnknownRatchet)?;
        ratchet.decrypt_envelope(ciphertext, salt)
    }

    /// Trial decryption against the whole ring, newest first. Used for
    /// envelopes that do not carry a ratchet id.
    pub fn try_decrypt(&self, ciphertext: &[u8], salt: Option<&[u8]>) -> Option<Vec<u8>> {
        self.ratchets
            .iter()
            .find_map(|ratchet| ratchet.decrypt_envelope(ciphertext, salt).ok())
    }
}

impl Default for RatchetRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{Ratchet, RatchetRing, DEFAULT_RATCHET_INTERVAL_SECS, MAX_RETAINED_RATCHETS};
    use crate::hash::RatchetId;
    use crate::identity::encrypt_to_public_key;

    #[test]
    fn ratchet_pair_roundtrip() {
        let alice = Ratchet::new(OsRng, 0);
        let bob = Ratchet::new(OsRng, 0);

        let token = alice
            .encrypt(OsRng, &bob.public(), b"ratcheted", Some(b"salt"))
            .expect("token");
        let plain = bob.decrypt(&alice.public(), &token, Some(b"salt")).expect("plaintext");
        assert_eq!(plain, b"ratcheted");
    }

    #[test]
    fn rotation_respects_interval() {
        let mut ring = RatchetRing::new();
        assert!(ring.rotate(OsRng, 1000, false), "first rotation installs a ratchet");
        assert!(!ring.rotate(OsRng, 1001, false), "interval not yet elapsed");
        assert!(ring.rotate(OsRng, 1000 + DEFAULT_RATCHET_INTERVAL_SECS, false));
        assert!(ring.rotate(OsRng, 1002, true), "forced rotation always appends");
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn ring_is_bounded() {
        let mut ring = RatchetRing::new();
        for index in 0..(MAX_RETAINED_RATCHETS + 10) {
            ring.rotate(OsRng, index as u64, true);
        }
        assert_eq!(ring.len(), MAX_RETAINED_RATCHETS);
    }

    #[test]
    fn decrypt_with_id_selects_older_ratchet() {
        let mut ring = RatchetRing::new();
        for index in 0..5 {
            ring.rotate(OsRng, index, true);
        }

        // Encrypt to the oldest retained ratchet; its id must still resolve.
        let target = ring.ratchets.last().expect("ratchet");
        let target_id = target.id();
        let ciphertext =
            encrypt_to_public_key(OsRng, &target.public(), b"late packet", None).expect("envelope");

        let plain = ring.decrypt_with_id(&target_id, &ciphertext, None).expect("plaintext");
        assert_eq!(plain, b"late packet");
    }

    #[test]
    fn unknown_ratchet_id_is_rejected() {
        let mut ring = RatchetRing::new();
        ring.rotate(OsRng, 0, true);

        let foreign = RatchetId::new_from_public(&[0xaa; 32]);
        let err = ring.decrypt_with_id(&foreign, &[0u8; 64], None).expect_err("unknown id");
        assert_eq!(err, crate::error::RnsError::UnknownRatchet);
    }

    #[test]
    fn forward_secrecy_across_rotations() {
        let mut ring = RatchetRing::new();
        let mut envelopes = Vec::new();

        for index in 0..5u64 {
            ring.rotate(OsRng, index, true);
            let current = ring.current().expect("ratchet");
            let envelope = encrypt_to_public_key(
                OsRng,
                &current.public(),
                format!("packet {index}").as_bytes(),
                None,
            )
            .expect("envelope");
            envelopes.push((current.id(), envelope));
        }

        // Every envelope decrypts through its own ratchet id.
        for (index, (id, envelope)) in envelopes.iter().enumerate() {
            let plain = ring.decrypt_with_id(id, envelope, None).expect("plaintext");
            assert_eq!(plain, format!("packet {index}").as_bytes());
        }

        // A single compromised ratchet opens only its own envelope.
        let compromised = ring.get(&envelopes[2].0).expect("ratchet");
        for (index, (_, envelope)) in envelopes.iter().enumerate() {
            let result = compromised.decrypt_envelope(envelope, None);
            assert_eq!(result.is_ok(), index == 2);
        }
    }
}
