pub mod link;

use core::{fmt, marker::PhantomData};

use ed25519_dalek::Signature;
use rand_core::{CryptoRngCore, OsRng};
use sha2::Digest;
use x25519_dalek::PublicKey;

use crate::crypt::fernet::{Fernet, PlainText, Token};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, NAME_HASH_LENGTH};
use crate::identity::{Identity, PrivateIdentity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, Packet, PacketContext, PacketDataBuffer,
    PacketType, TransportType,
};
use crate::ratchet::{RatchetRing, RATCHET_LENGTH};
use crate::slots::SlotArray;
use crate::time::now_unix;

pub const RAND_HASH_LENGTH: usize = 10;
pub const MIN_ANNOUNCE_DATA_LENGTH: usize =
    PUBLIC_KEY_LENGTH * 2 + NAME_HASH_LENGTH + RAND_HASH_LENGTH + SIGNATURE_LENGTH;

pub const MAX_REQUEST_HANDLERS: usize = 8;
pub const MAX_PATH_RESPONSES: usize = 8;

//***************************************************************************//

pub trait Direction {}

pub struct Input;
pub struct Output;

impl Direction for Input {}
impl Direction for Output {}

//***************************************************************************//

pub trait Type {
    fn destination_type() -> DestinationType;
}

pub struct Single;
pub struct Plain;
pub struct Group;

impl Type for Single {
    fn destination_type() -> DestinationType {
        DestinationType::Single
    }
}

impl Type for Plain {
    fn destination_type() -> DestinationType {
        DestinationType::Plain
    }
}

impl Type for Group {
    fn destination_type() -> DestinationType {
        DestinationType::Group
    }
}

/// GROUP destinations share a 16-byte symmetric key; both Fernet halves are
/// derived from it.
pub fn group_encrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let fernet = Fernet::new_from_slices(key, key, OsRng);
    let mut out = vec![0u8; data.len() + 64];
    let token_len = fernet.encrypt(PlainText::from(data), &mut out)?.len();
    out.truncate(token_len);
    Ok(out)
}

pub fn group_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let fernet = Fernet::new_from_slices(key, key, OsRng);
    let verified = fernet.verify(Token::from(data))?;
    let mut out = vec![0u8; data.len()];
    let plain_len = fernet.decrypt(verified, &mut out)?.as_bytes().len();
    out.truncate(plain_len);
    Ok(out)
}

#[derive(Copy, Clone)]
pub struct DestinationName {
    pub hash: Hash,
}

impl DestinationName {
    pub fn new(app_name: &str, aspects: &str) -> Self {
        let hash = Hash::new(
            Hash::generator()
                .chain_update(app_name.as_bytes())
                .chain_update(".".as_bytes())
                .chain_update(aspects.as_bytes())
                .finalize()
                .into(),
        );

        Self { hash }
    }

    pub fn new_from_hash_slice(hash_slice: &[u8]) -> Self {
        let mut hash = [0u8; 32];
        let len = hash_slice.len().min(32);
        hash[..len].copy_from_slice(&hash_slice[..len]);
        Self { hash: Hash::new(hash) }
    }

    pub fn as_name_hash_slice(&self) -> &[u8] {
        &self.hash.as_slice()[..NAME_HASH_LENGTH]
    }
}

#[derive(Copy, Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub address_hash: AddressHash,
    pub name: DestinationName,
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_hash)
    }
}

pub struct AnnounceInfo<'a> {
    pub destination: SingleOutputDestination,
    pub app_data: &'a [u8],
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
}

/// Announce payload: pub_key || verifying_key || name_hash || random_hash ||
/// [ratchet] || signature || app_data. The signature additionally covers the
/// destination hash; the header context flag marks a ratchet-bearing
/// announce.
pub struct DestinationAnnounce;

impl DestinationAnnounce {
    pub fn validate(packet: &Packet) -> Result<AnnounceInfo<'_>, RnsError> {
        if packet.header.packet_type != PacketType::Announce {
            return Err(RnsError::MalformedPacket);
        }

        let announce_data = packet.data.as_slice();
        if announce_data.len() < MIN_ANNOUNCE_DATA_LENGTH {
            return Err(RnsError::Truncated);
        }

        let mut offset = 0usize;

        let public_key = &announce_data[offset..offset + PUBLIC_KEY_LENGTH];
        offset += PUBLIC_KEY_LENGTH;
        let verifying_key = &announce_data[offset..offset + PUBLIC_KEY_LENGTH];
        offset += PUBLIC_KEY_LENGTH;

        let identity = Identity::new_from_slices(public_key, verifying_key)?;

        let name_hash = &announce_data[offset..offset + NAME_HASH_LENGTH];
        offset += NAME_HASH_LENGTH;
        let rand_hash = &announce_data[offset..offset + RAND_HASH_LENGTH];
        offset += RAND_HASH_LENGTH;

        let name = DestinationName::new_from_hash_slice(name_hash);
        let expected_hash = create_address_hash(&identity.address_hash, &name);
        if expected_hash != packet.destination {
            return Err(RnsError::IncorrectHash);
        }

        let with_ratchet = packet.header.context_flag == ContextFlag::Set;
        let remaining = announce_data.len() - offset;
        let ratchet_len = if with_ratchet { RATCHET_LENGTH } else { 0 };
        if remaining < ratchet_len + SIGNATURE_LENGTH {
            return Err(RnsError::Truncated);
        }

        let ratchet = if with_ratchet {
            let slice = &announce_data[offset..offset + RATCHET_LENGTH];
            offset += RATCHET_LENGTH;
            let mut bytes = [0u8; RATCHET_LENGTH];
            bytes.copy_from_slice(slice);
            Some(bytes)
        } else {
            None
        };

        let signature = &announce_data[offset..offset + SIGNATURE_LENGTH];
        offset += SIGNATURE_LENGTH;
        let app_data = &announce_data[offset..];

        let mut signed_data = PacketDataBuffer::new();
        signed_data
            .chain_write(packet.destination.as_slice())?
            .chain_write(public_key)?
            .chain_write(verifying_key)?
            .chain_write(name_hash)?
            .chain_write(rand_hash)?;
        if let Some(ratchet) = &ratchet {
            signed_data.chain_write(ratchet)?;
        }
        if !app_data.is_empty() {
            signed_data.chain_write(app_data)?;
        }

        let signature = Signature::from_slice(signature).map_err(|_| RnsError::CryptoError)?;
        identity.verify(signed_data.as_slice(), &signature)?;

        Ok(AnnounceInfo {
            destination: SingleOutputDestination::new(identity, name),
            app_data,
            ratchet,
        })
    }
}

type RequestHandler = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct RequestHandlerEntry {
    path_hash: AddressHash,
    handler: RequestHandler,
}

#[derive(Debug, Copy, Clone)]
pub struct PathResponseEntry {
    pub tag: AddressHash,
    pub queued_at: u64,
}

pub struct Destination<I, D: Direction, T: Type> {
    pub direction: PhantomData<D>,
    pub r#type: PhantomData<T>,
    pub identity: I,
    pub desc: DestinationDesc,
    ratchets: Option<RatchetRing>,
    enforce_ratchets: bool,
    request_handlers: SlotArray<RequestHandlerEntry, MAX_REQUEST_HANDLERS>,
    path_responses: SlotArray<PathResponseEntry, MAX_PATH_RESPONSES>,
}

impl<I, D: Direction, T: Type> Destination<I, D, T> {
    pub fn destination_type(&self) -> DestinationType {
        <T as Type>::destination_type()
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.desc.address_hash
    }

    /// Registers a handler for Request-context payloads addressed to
    /// `path_hash`. Fails with `PoolExhausted` when all handler slots are
    /// taken.
    pub fn register_request_handler(
        &mut self,
        path_hash: AddressHash,
        handler: RequestHandler,
    ) -> Result<(), RnsError> {
        if self.request_handlers.find(|entry| entry.path_hash == path_hash).is_some() {
            return Err(RnsError::InvalidArgument);
        }
        self.request_handlers
            .allocate(RequestHandlerEntry { path_hash, handler })
            .map(|_| ())
            .ok_or(RnsError::PoolExhausted)
    }

    pub fn deregister_request_handler(&mut self, path_hash: &AddressHash) -> bool {
        match self.request_handlers.find(|entry| entry.path_hash == *path_hash) {
            Some(index) => self.request_handlers.release(index).is_some(),
            None => false,
        }
    }

    pub fn handle_request(&mut self, path_hash: &AddressHash, payload: &[u8]) -> Option<Vec<u8>> {
        let index = self.request_handlers.find(|entry| entry.path_hash == *path_hash)?;
        let entry = self.request_handlers.get_mut(index)?;
        (entry.handler)(payload)
    }

    /// Queues a pending path response; duplicates for the same tag refresh
    /// the slot instead of consuming another.
    pub fn queue_path_response(&mut self, tag: AddressHash, now: u64) -> Result<(), RnsError> {
        if let Some(index) = self.path_responses.find(|entry| entry.tag == tag) {
            if let Some(entry) = self.path_responses.get_mut(index) {
                entry.queued_at = now;
            }
            return Ok(());
        }
        self.path_responses
            .allocate(PathResponseEntry { tag, queued_at: now })
            .map(|_| ())
            .ok_or(RnsError::PoolExhausted)
    }

    pub fn drain_path_responses(&mut self) -> Vec<PathResponseEntry> {
        let mut drained = Vec::new();
        for index in 0..MAX_PATH_RESPONSES {
            if let Some(entry) = self.path_responses.release(index) {
                drained.push(entry);
            }
        }
        drained
    }
}

impl Destination<PrivateIdentity, Input, Single> {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(identity.address_hash(), &name);
        let pub_identity = *identity.as_identity();

        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity: pub_identity, name, address_hash },
            ratchets: None,
            enforce_ratchets: false,
            request_handlers: SlotArray::new(),
            path_responses: SlotArray::new(),
        }
    }

    /// Installs an initial ratchet and enables per-announce rotation.
    pub fn enable_ratchets(&mut self, interval_secs: u64) {
        let mut ring = RatchetRing::with_interval(interval_secs);
        ring.rotate(OsRng, now_unix(), true);
        self.ratchets = Some(ring);
    }

    pub fn ratchets_enabled(&self) -> bool {
        self.ratchets.is_some()
    }

    pub fn enforce_ratchets(&mut self, enforce: bool) {
        self.enforce_ratchets = enforce;
    }

    /// Appends a new ratchet when the rotation interval elapsed, or
    /// immediately when forced.
    pub fn rotate_ratchets(&mut self, force: bool) -> bool {
        match self.ratchets.as_mut() {
            Some(ring) => ring.rotate(OsRng, now_unix(), force),
            None => false,
        }
    }

    pub fn ratchet_ring(&self) -> Option<&RatchetRing> {
        self.ratchets.as_ref()
    }

    /// Opens a SINGLE-destination envelope. A ratchet-bearing ciphertext is
    /// matched against the ring; plain identity decryption is the fallback
    /// unless ratchets are enforced.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, bool), RnsError> {
        let salt = self.desc.address_hash.to_bytes();

        if let Some(ring) = self.ratchets.as_ref() {
            if let Some(plaintext) = ring.try_decrypt(ciphertext, Some(&salt)) {
                return Ok((plaintext, true));
            }
            if self.enforce_ratchets {
                return Err(RnsError::UnknownRatchet);
            }
        }

        let plaintext = self.identity.decrypt(ciphertext, Some(&salt))?;
        Ok((plaintext, false))
    }

    pub fn announce<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        // Announce randomness: 5 random bytes followed by a 5-byte
        // big-endian unix timestamp, so peers can order announce freshness.
        let mut rand_hash = [0u8; RAND_HASH_LENGTH];
        let mut rng_mut = rng;
        rng_mut.fill_bytes(&mut rand_hash[..RAND_HASH_LENGTH / 2]);
        let emitted = now_unix().to_be_bytes();
        rand_hash[RAND_HASH_LENGTH / 2..].copy_from_slice(&emitted[3..8]);

        let ratchet = match self.ratchets.as_mut() {
            Some(ring) => {
                ring.rotate(rng_mut, now_unix(), false);
                ring.current_public()
            }
            None => None,
        };

        let pub_key = self.identity.as_identity().public_key_bytes();
        let verifying_key = self.identity.as_identity().verifying_key_bytes();
        let name_hash = self.desc.name.as_name_hash_slice();

        let mut signed_data = PacketDataBuffer::new();
        signed_data
            .chain_write(self.desc.address_hash.as_slice())?
            .chain_write(pub_key)?
            .chain_write(verifying_key)?
            .chain_write(name_hash)?
            .chain_write(&rand_hash)?;
        if let Some(ratchet) = &ratchet {
            signed_data.chain_write(ratchet)?;
        }
        if let Some(data) = app_data {
            if !data.is_empty() {
                signed_data.chain_write(data)?;
            }
        }
        let signature = self.identity.sign(signed_data.as_slice());

        let mut packet_data = PacketDataBuffer::new();
        packet_data
            .chain_write(pub_key)?
            .chain_write(verifying_key)?
            .chain_write(name_hash)?
            .chain_write(&rand_hash)?;
        if let Some(ratchet) = &ratchet {
            packet_data.chain_write(ratchet)?;
        }
        packet_data.chain_write(&signature.to_bytes())?;
        if let Some(data) = app_data {
            if !data.is_empty() {
                packet_data.chain_write(data)?;
            }
        }

        Ok(Packet {
            header: Header {
                header_type: HeaderType::Type1,
                context_flag: if ratchet.is_some() { ContextFlag::Set } else { ContextFlag::Unset },
                transport_type: TransportType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                ..Default::default()
            },
            destination: self.desc.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        })
    }

    /// An announce re-issued in answer to a path request.
    pub fn path_response<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        let mut announce = self.announce(rng, app_data)?;
        announce.context = PacketContext::PathResponse;
        Ok(announce)
    }
}

impl Destination<Identity, Output, Single> {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity.address_hash, &name);
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity, name, address_hash },
            ratchets: None,
            enforce_ratchets: false,
            request_handlers: SlotArray::new(),
            path_responses: SlotArray::new(),
        }
    }

    /// Encrypts to this destination, preferring `ratchet` when the peer has
    /// announced one.
    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        plaintext: &[u8],
        ratchet: Option<[u8; RATCHET_LENGTH]>,
    ) -> Result<Vec<u8>, RnsError> {
        let salt = self.desc.address_hash.to_bytes();
        match ratchet {
            Some(ratchet_public) => crate::identity::encrypt_to_public_key(
                rng,
                &PublicKey::from(ratchet_public),
                plaintext,
                Some(&salt),
            ),
            None => self.identity.encrypt(rng, plaintext, Some(&salt)),
        }
    }
}

impl<D: Direction> Destination<(), D, Plain> {
    pub fn new_plain(name: DestinationName) -> Self {
        let address_hash = create_plain_address_hash(&name);
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity: (),
            desc: DestinationDesc { identity: Identity::default(), name, address_hash },
            ratchets: None,
            enforce_ratchets: false,
            request_handlers: SlotArray::new(),
            path_responses: SlotArray::new(),
        }
    }
}

fn create_address_hash(identity_hash: &AddressHash, name: &DestinationName) -> AddressHash {
    AddressHash::new_from_hash(&Hash::new(
        Hash::generator()
            .chain_update(name.as_name_hash_slice())
            .chain_update(identity_hash.as_slice())
            .finalize()
            .into(),
    ))
}

fn create_plain_address_hash(name: &DestinationName) -> AddressHash {
    AddressHash::new_from_hash(&Hash::new(
        Hash::generator().chain_update(name.as_name_hash_slice()).finalize().into(),
    ))
}

pub type SingleInputDestination = Destination<PrivateIdentity, Input, Single>;
pub type SingleOutputDestination = Destination<Identity, Output, Single>;
pub type PlainInputDestination = Destination<(), Input, Plain>;
pub type PlainOutputDestination = Destination<(), Output, Plain>;

pub fn new_in(identity: PrivateIdentity, app_name: &str, aspect: &str) -> SingleInputDestination {
    SingleInputDestination::new(identity, DestinationName::new(app_name, aspect))
}

pub fn new_out(identity: Identity, app_name: &str, aspect: &str) -> SingleOutputDestination {
    SingleOutputDestination::new(identity, DestinationName::new(app_name, aspect))
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{
        group_decrypt, group_encrypt, new_in, DestinationAnnounce, DestinationName,
        SingleInputDestination, SingleOutputDestination,
    };
    use crate::error::RnsError;
    use crate::identity::PrivateIdentity;
    use crate::packet::ContextFlag;

    fn make_destination() -> SingleInputDestination {
        new_in(PrivateIdentity::new_from_rand(OsRng), "example_utilities", "announcesample.fruits")
    }

    #[test]
    fn announce_validates() {
        let mut destination = make_destination();
        let announce = destination.announce(OsRng, None).expect("valid announce packet");
        let info = DestinationAnnounce::validate(&announce).expect("valid announce");
        assert_eq!(
            info.destination.desc.address_hash, destination.desc.address_hash,
            "announced destination resolves to the same address"
        );
        assert!(info.ratchet.is_none());
    }

    #[test]
    fn announce_signature_covers_app_data() {
        let mut destination = make_destination();
        let app_data = b"fruit stand";
        let announce = destination.announce(OsRng, Some(app_data)).expect("valid announce");

        let mut tampered = announce;
        let payload = tampered.data.as_mut_slice();
        let app_data_offset = 32 + 32 + 10 + 10 + 64;
        payload[app_data_offset] ^= 0x01;

        match DestinationAnnounce::validate(&tampered) {
            Ok(_) => panic!("tampered app_data must fail signature verification"),
            Err(err) => assert_eq!(err, RnsError::IncorrectSignature),
        }
    }

    #[test]
    fn announce_includes_ratchet_when_enabled() {
        let mut destination = make_destination();
        destination.enable_ratchets(1800);

        let announce = destination.announce(OsRng, None).expect("valid announce");
        assert_eq!(announce.header.context_flag, ContextFlag::Set);

        let info = DestinationAnnounce::validate(&announce).expect("valid announce");
        assert_eq!(info.ratchet, destination.ratchet_ring().and_then(|ring| ring.current_public()));
    }

    #[test]
    fn encrypt_to_announced_ratchet_roundtrip() {
        let mut receiver = make_destination();
        receiver.enable_ratchets(1800);
        let announce = receiver.announce(OsRng, None).expect("valid announce");
        let info = DestinationAnnounce::validate(&announce).expect("valid announce");

        let sender: SingleOutputDestination = info.destination;
        let ciphertext = sender.encrypt(OsRng, b"ratcheted hello", info.ratchet).expect("envelope");

        let (plaintext, via_ratchet) = receiver.decrypt(&ciphertext).expect("plaintext");
        assert_eq!(plaintext, b"ratcheted hello");
        assert!(via_ratchet);
    }

    #[test]
    fn encrypt_without_ratchet_roundtrip() {
        let mut receiver = make_destination();
        let announce = receiver.announce(OsRng, None).expect("valid announce");
        let info = DestinationAnnounce::validate(&announce).expect("valid announce");

        let ciphertext =
            info.destination.encrypt(OsRng, b"static hello", None).expect("envelope");
        let (plaintext, via_ratchet) = receiver.decrypt(&ciphertext).expect("plaintext");
        assert_eq!(plaintext, b"static hello");
        assert!(!via_ratchet);
    }

    #[test]
    fn enforced_ratchets_reject_static_envelopes() {
        let mut receiver = make_destination();
        receiver.enable_ratchets(1800);
        receiver.enforce_ratchets(true);

        let announce = receiver.announce(OsRng, None).expect("valid announce");
        let info = DestinationAnnounce::validate(&announce).expect("valid announce");
        let ciphertext = info.destination.encrypt(OsRng, b"static", None).expect("envelope");

        assert_eq!(receiver.decrypt(&ciphertext), Err(RnsError::UnknownRatchet));
    }

    #[test]
    fn destination_hash_is_name_and_identity_bound() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let first = SingleInputDestination::new(
            identity.clone(),
            DestinationName::new("app", "one"),
        );
        let second =
            SingleInputDestination::new(identity, DestinationName::new("app", "two"));
        assert_ne!(first.desc.address_hash, second.desc.address_hash);
    }

    #[test]
    fn request_handler_pool_is_bounded() {
        let mut destination = make_destination();
        for index in 0..8u64 {
            let path = crate::hash::AddressHash::new_from_slice(&index.to_be_bytes());
            destination
                .register_request_handler(path, Box::new(|_| None))
                .expect("slot available");
        }

        let overflow = crate::hash::AddressHash::new_from_slice(b"overflow");
        assert_eq!(
            destination.register_request_handler(overflow, Box::new(|_| None)),
            Err(RnsError::PoolExhausted)
        );
    }

    #[test]
    fn path_response_pool_is_bounded_and_deduplicates() {
        let mut destination = make_destination();

        for index in 0..8u64 {
            let tag = crate::hash::AddressHash::new_from_slice(&index.to_be_bytes());
            destination.queue_path_response(tag, index).expect("slot available");
        }

        // A repeated tag refreshes in place instead of taking a slot.
        let repeat = crate::hash::AddressHash::new_from_slice(&3u64.to_be_bytes());
        destination.queue_path_response(repeat, 99).expect("refresh");

        let overflow = crate::hash::AddressHash::new_from_slice(b"overflow tag");
        assert_eq!(
            destination.queue_path_response(overflow, 100),
            Err(RnsError::PoolExhausted)
        );

        let drained = destination.drain_path_responses();
        assert_eq!(drained.len(), 8);
        assert!(drained.iter().any(|entry| entry.tag == repeat && entry.queued_at == 99));
        assert!(destination.drain_path_responses().is_empty());
    }

    #[test]
    fn group_key_roundtrip() {
        let key = [0x42u8; 16];
        let ciphertext = group_encrypt(&key, b"group traffic").expect("ciphertext");
        let plaintext = group_decrypt(&key, &ciphertext).expect("plaintext");
        assert_eq!(plaintext, b"group traffic");

        let wrong_key = [0x43u8; 16];
        assert!(group_decrypt(&wrong_key, &ciphertext).is_err());
    }
}
