use core::fmt;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signature, SigningKey};
use rand_core::OsRng;

use crate::buffer::OutputBuffer;
use crate::error::RnsError;
use crate::hash::{AddressHash, ADDRESS_HASH_SIZE};
use crate::identity::{Identity, PrivateIdentity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType, PACKET_MDU,
};
use crate::slots::SlotArray;

use super::DestinationDesc;

pub const KEEP_ALIVE_REQUEST: u8 = 0xFF;
pub const KEEP_ALIVE_RESPONSE: u8 = 0xFE;
pub const MAX_PENDING_REQUESTS: usize = 8;

pub const DEFAULT_ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkStatus {
    Pending = 0x00,
    Handshake = 0x01,
    Active = 0x02,
    Closed = 0x03,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        matches!(self, LinkStatus::Pending | LinkStatus::Handshake)
    }
}

pub type LinkId = AddressHash;

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Activated,
    Data { payload: Vec<u8>, context: PacketContext },
    Closed,
}

#[allow(clippy::large_enum_variant)]
pub enum LinkHandleResult {
    None,
    Activated,
    /// A packet to transmit in response (proof, keep-alive answer).
    Respond(Packet),
    KeepAlive,
}

#[derive(Copy, Clone)]
pub struct LinkConfig {
    pub establishment_timeout: Duration,
    pub inactivity_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            establishment_timeout: DEFAULT_ESTABLISHMENT_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }
}

/// An encrypted bidirectional session between two destinations, keyed by a
/// fresh X25519 exchange. The initiator sends a LINKREQUEST carrying its
/// ephemeral public keys; the responder proves it, both sides derive the
/// session key, and the first data packet activates the link.
pub struct Link {
    id: LinkId,
    destination: DestinationDesc,
    ephemeral_identity: PrivateIdentity,
    peer_identity: Option<Identity>,
    session_key: Option<crate::identity::DerivedKey>,
    is_initiator: bool,
    status: LinkStatus,
    config: LinkConfig,
    request_time: Instant,
    last_activity: Instant,
    rtt: Duration,
    hops: u8,
    pending_requests: SlotArray<AddressHash, MAX_PENDING_REQUESTS>,
    events: Vec<LinkEvent>,
}

impl Link {
    /// Outbound link toward a known destination. `request()` produces the
    /// LINKREQUEST and moves the link to PENDING.
    pub fn new(destination: DestinationDesc, config: LinkConfig) -> Self {
        let now = Instant::now();
        Self {
            id: AddressHash::new_empty(),
            destination,
            ephemeral_identity: PrivateIdentity::new_from_rand(OsRng),
            peer_identity: None,
            session_key: None,
            is_initiator: true,
            status: LinkStatus::Pending,
            config,
            request_time: now,
            last_activity: now,
            rtt: Duration::ZERO,
            hops: 0,
            pending_requests: SlotArray::new(),
            events: Vec::new(),
        }
    }

    /// Responder-side link built from an inbound LINKREQUEST. The caller
    /// must transmit `prove()` to complete the handshake.
    pub fn new_from_request(
        packet: &Packet,
        signing_key: SigningKey,
        destination: DestinationDesc,
        config: LinkConfig,
    ) -> Result<Self, RnsError> {
        if packet.data.len() < PUBLIC_KEY_LENGTH * 2 {
            return Err(RnsError::Truncated);
        }

        let data = packet.data.as_slice();
        let peer_identity = Identity::new_from_slices(
            &data[..PUBLIC_KEY_LENGTH],
            &data[PUBLIC_KEY_LENGTH..PUBLIC_KEY_LENGTH * 2],
        )?;

        let link_id = packet.truncated_hash();
        log::debug!("link: create from request {}", link_id);

        let now = Instant::now();
        let mut link = Self {
            id: link_id,
            destination,
            ephemeral_identity: PrivateIdentity::new(
                x25519_dalek::StaticSecret::random_from_rng(OsRng),
                signing_key,
            ),
            peer_identity: None,
            session_key: None,
            is_initiator: false,
            status: LinkStatus::Pending,
            config,
            request_time: now,
            last_activity: now,
            rtt: Duration::ZERO,
            hops: packet.header.hops,
            pending_requests: SlotArray::new(),
            events: Vec::new(),
        };

        link.handshake(peer_identity);
        Ok(link)
    }

    pub fn request(&mut self) -> Packet {
        let mut packet_data = PacketDataBuffer::new();
        packet_data.safe_write(self.ephemeral_identity.as_identity().public_key_bytes());
        packet_data.safe_write(self.ephemeral_identity.as_identity().verifying_key_bytes());

        let packet = Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            destination: self.destination.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };

        self.status = LinkStatus::Pending;
        self.id = packet.truncated_hash();
        self.request_time = Instant::now();
        self.last_activity = self.request_time;

        packet
    }

    /// Link request proof: signature over id || pub || verifying, payload
    /// carries signature || ephemeral public key.
    pub fn prove(&mut self) -> Packet {
        log::debug!("link({}): prove", self.id);

        let mut signed = PacketDataBuffer::new();
        signed
            .chain_safe_write(self.id.as_slice())
            .chain_safe_write(self.ephemeral_identity.as_identity().public_key_bytes())
            .chain_safe_write(self.ephemeral_identity.as_identity().verifying_key_bytes());

        let signature = self.ephemeral_identity.sign(signed.as_slice());

        let mut packet_data = PacketDataBuffer::new();
        packet_data
            .chain_safe_write(&signature.to_bytes())
            .chain_safe_write(self.ephemeral_identity.as_identity().public_key_bytes());

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkRequestProof,
            data: packet_data,
        }
    }

    /// Proof for a delivered data packet.
    pub fn prove_packet(&self, packet: &Packet) -> Packet {
        let hash = packet.hash().to_bytes();
        let signature = self.ephemeral_identity.sign(&hash).to_bytes();

        let mut packet_data = PacketDataBuffer::new();
        packet_data.chain_safe_write(&hash).chain_safe_write(&signature);

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkProof,
            data: packet_data,
        }
    }

    pub fn handle_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        if packet.destination != self.id {
            return LinkHandleResult::None;
        }

        match packet.header.packet_type {
            PacketType::Data => self.handle_data_packet(packet),
            PacketType::Proof => self.handle_proof_packet(packet),
            _ => LinkHandleResult::None,
        }
    }

    fn handle_proof_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        if self.status != LinkStatus::Pending
            || !self.is_initiator
            || packet.context != PacketContext::LinkRequestProof
        {
            return LinkHandleResult::None;
        }

        match validate_proof_packet(&self.destination, &self.id, packet) {
            Ok(identity) => {
                log::debug!("link({}): request proved", self.id);
                self.rtt = self.request_time.elapsed();
                self.hops = packet.header.hops;
                self.handshake(identity);
                LinkHandleResult::None
            }
            Err(_) => {
                log::warn!("link({}): proof is not valid", self.id);
                LinkHandleResult::None
            }
        }
    }

    fn handle_data_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        if self.status == LinkStatus::Closed {
            return LinkHandleResult::None;
        }

        match packet.context {
            PacketContext::None
            | PacketContext::Request
            | PacketContext::Response
            | PacketContext::Channel
            | PacketContext::LinkIdentify => {
                let mut buffer = [0u8; PACKET_MDU];
                match self.decrypt(packet.data.as_slice(), &mut buffer) {
                    Ok(plain_text) => {
                        self.touch();
                        self.activate();
                        log::trace!("link({}): data {}B", self.id, plain_text.len());
                        let payload = plain_text.to_vec();
                        self.events.push(LinkEvent::Data { payload, context: packet.context });
                        LinkHandleResult::Respond(self.prove_packet(packet))
                    }
                    Err(_) => {
                        log::warn!("link({}): can't decrypt packet", self.id);
                        LinkHandleResult::None
                    }
                }
            }
            PacketContext::KeepAlive => {
                let first = packet.data.as_slice().first().copied();
                if first == Some(KEEP_ALIVE_REQUEST) {
                    self.touch();
                    self.activate();
                    return LinkHandleResult::Respond(
                        self.keep_alive_packet(KEEP_ALIVE_RESPONSE),
                    );
                }
                if first == Some(KEEP_ALIVE_RESPONSE) {
                    self.touch();
                    return LinkHandleResult::KeepAlive;
                }
                LinkHandleResult::None
            }
            PacketContext::LinkRtt => {
                let mut buffer = [0u8; PACKET_MDU];
                if let Ok(plain_text) = self.decrypt(packet.data.as_slice(), &mut buffer) {
                    if let Ok(rtt) = rmp_serde::from_slice::<f32>(plain_text) {
                        self.rtt = Duration::from_secs_f32(rtt.max(0.0));
                        self.touch();
                        log::trace!("link({}): peer rtt {:.3}s", self.id, rtt);
                    }
                }
                LinkHandleResult::None
            }
            PacketContext::LinkClose => {
                log::debug!("link({}): remote close", self.id);
                self.close();
                LinkHandleResult::None
            }
            _ => LinkHandleResult::None,
        }
    }

    pub fn data_packet(&self, data: &[u8]) -> Result<Packet, RnsError> {
        self.data_packet_with_context(data, PacketContext::None)
    }

    pub fn data_packet_with_context(
        &self,
        data: &[u8],
        context: PacketContext,
    ) -> Result<Packet, RnsError> {
        if self.status == LinkStatus::Closed {
            return Err(RnsError::LinkTimeout);
        }

        let mut packet_data = PacketDataBuffer::new();
        let cipher_len = {
            let cipher = self.encrypt(data, packet_data.acquire_buf_max())?;
            cipher.len()
        };
        packet_data.resize(cipher_len);

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context,
            data: packet_data,
        })
    }

    /// Shares the measured round-trip time with the peer after activation.
    pub fn rtt_packet(&self) -> Result<Packet, RnsError> {
        let encoded = rmp_serde::to_vec(&self.rtt.as_secs_f32())
            .map_err(|_| RnsError::InvalidArgument)?;
        self.data_packet_with_context(&encoded, PacketContext::LinkRtt)
    }

    pub fn keep_alive_packet(&self, data: u8) -> Packet {
        let mut packet_data = PacketDataBuffer::new();
        packet_data.safe_write(&[data]);

        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::KeepAlive,
            data: packet_data,
        }
    }

    /// LinkClose notification for the peer; the local side is closed
    /// immediately.
    pub fn close_packet(&mut self) -> Packet {
        let packet = Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkClose,
            data: PacketDataBuffer::new_from_slice(self.id.as_slice()),
        };
        self.close();
        packet
    }

    pub fn encrypt<'a>(&self, text: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        let key = self.session_key.as_ref().ok_or(RnsError::CryptoError)?;
        let token = key.fernet(OsRng).encrypt(text.into(), out_buf)?;
        Ok(token.as_bytes())
    }

    pub fn decrypt<'a>(&self, data: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        let key = self.session_key.as_ref().ok_or(RnsError::CryptoError)?;
        let fernet = key.fernet(OsRng);
        let token = fernet.verify(data.into())?;
        let plain = fernet.decrypt(token, out_buf)?;
        Ok(plain.as_bytes())
    }

    /// First data traffic after the handshake activates the link.
    fn activate(&mut self) {
        if self.status == LinkStatus::Handshake {
            self.status = LinkStatus::Active;
            log::debug!("link({}): activated", self.id);
            self.events.push(LinkEvent::Activated);
        }
    }

    /// Transitions into HANDSHAKE: the session key is derived from the
    /// ephemeral exchange, salted with the link id.
    fn handshake(&mut self, peer_identity: Identity) {
        log::debug!("link({}): handshake", self.id);

        self.session_key = Some(
            self.ephemeral_identity
                .derive_key(&peer_identity.public_key, Some(self.id.as_slice())),
        );
        self.peer_identity = Some(peer_identity);
        self.status = LinkStatus::Handshake;
        self.touch();
    }

    pub fn close(&mut self) {
        if self.status == LinkStatus::Closed {
            return;
        }
        self.status = LinkStatus::Closed;
        self.events.push(LinkEvent::Closed);
        log::debug!("link({}): closed", self.id);
    }

    /// Establishment and inactivity timers; fires during the owner's tick.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let expired = match self.status {
            LinkStatus::Pending | LinkStatus::Handshake => {
                now.duration_since(self.request_time) > self.config.establishment_timeout
            }
            LinkStatus::Active => {
                now.duration_since(self.last_activity) > self.config.inactivity_timeout
            }
            LinkStatus::Closed => false,
        };

        if expired {
            log::warn!("link({}): timeout in {:?}", self.id, self.status);
            self.close();
        }
        expired
    }

    pub fn track_request(&mut self, request_id: AddressHash) -> Result<(), RnsError> {
        self.pending_requests.allocate(request_id).map(|_| ()).ok_or(RnsError::PoolExhausted)
    }

    pub fn conclude_request(&mut self, request_id: &AddressHash) -> bool {
        match self.pending_requests.find(|id| id == request_id) {
            Some(index) => self.pending_requests.release(index).is_some(),
            None => false,
        }
    }

    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        core::mem::take(&mut self.events)
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn hops(&self) -> u8 {
        self.hops
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn peer_identity(&self) -> Option<&Identity> {
        self.peer_identity.as_ref()
    }

    pub fn destination(&self) -> &DestinationDesc {
        &self.destination
    }

    pub fn elapsed(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link({} {:?})", self.id, self.status)
    }
}

fn validate_proof_packet(
    destination: &DestinationDesc,
    id: &LinkId,
    packet: &Packet,
) -> Result<Identity, RnsError> {
    const MIN_PROOF_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;
    const SIGN_DATA_LEN: usize = ADDRESS_HASH_SIZE + PUBLIC_KEY_LENGTH * 2;

    if packet.data.len() < MIN_PROOF_LEN {
        return Err(RnsError::Truncated);
    }

    let data = packet.data.as_slice();
    let peer_public = &data[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH];
    let verifying_key = destination.identity.verifying_key_bytes();

    let mut proof_data = [0u8; SIGN_DATA_LEN];
    let sign_data_len = {
        let mut output = OutputBuffer::new(&mut proof_data);
        output.write(id.as_slice())?;
        output.write(peer_public)?;
        output.write(verifying_key)?;
        output.offset()
    };

    let identity = Identity::new_from_slices(peer_public, verifying_key)?;
    let signature =
        Signature::from_slice(&data[..SIGNATURE_LENGTH]).map_err(|_| RnsError::CryptoError)?;

    identity.verify(&proof_data[..sign_data_len], &signature)?;

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rand_core::OsRng;

    use super::{Link, LinkConfig, LinkEvent, LinkHandleResult, LinkStatus};
    use crate::destination::{new_in, SingleInputDestination};
    use crate::identity::PrivateIdentity;
    use crate::packet::PacketContext;

    fn make_destination() -> SingleInputDestination {
        new_in(PrivateIdentity::new_from_rand(OsRng), "link_tests", "session")
    }

    fn establish() -> (Link, Link) {
        let destination = make_destination();

        let mut initiator = Link::new(destination.desc, LinkConfig::default());
        let request = initiator.request();

        let mut responder = Link::new_from_request(
            &request,
            destination.identity.sign_key().clone(),
            destination.desc,
            LinkConfig::default(),
        )
        .expect("valid link request");

        let proof = responder.prove();
        initiator.handle_packet(&proof);

        (initiator, responder)
    }

    #[test]
    fn proof_moves_initiator_to_handshake() {
        let (initiator, responder) = establish();
        assert_eq!(initiator.status(), LinkStatus::Handshake);
        assert_eq!(responder.status(), LinkStatus::Handshake);
        assert_eq!(initiator.id(), responder.id());
    }

    #[test]
    fn first_data_packet_activates_both_sides() {
        let (initiator, mut responder) = establish();

        let data = initiator.data_packet(b"over the link").expect("data packet");
        let result = responder.handle_packet(&data);
        assert_eq!(responder.status(), LinkStatus::Active);

        let events = responder.take_events();
        assert!(events.iter().any(|event| matches!(event, LinkEvent::Activated)));
        assert!(events.iter().any(
            |event| matches!(event, LinkEvent::Data { payload, .. } if payload == b"over the link")
        ));

        // The delivered packet is proven back to the sender.
        match result {
            LinkHandleResult::Respond(proof) => {
                assert_eq!(proof.context, PacketContext::LinkProof);
            }
            _ => panic!("expected a packet proof"),
        }
    }

    #[test]
    fn keep_alive_is_answered_and_not_delivered() {
        let (mut initiator, mut responder) = establish();

        let request = initiator.keep_alive_packet(super::KEEP_ALIVE_REQUEST);
        match responder.handle_packet(&request) {
            LinkHandleResult::Respond(response) => {
                assert_eq!(response.context, PacketContext::KeepAlive);
                assert!(matches!(
                    initiator.handle_packet(&response),
                    LinkHandleResult::KeepAlive
                ));
            }
            _ => panic!("keep-alive request expects a response"),
        }

        assert!(!responder
            .take_events()
            .iter()
            .any(|event| matches!(event, LinkEvent::Data { .. })));
    }

    #[test]
    fn establishment_timeout_closes_pending_link() {
        let destination = make_destination();
        let config = LinkConfig {
            establishment_timeout: Duration::from_millis(1),
            ..LinkConfig::default()
        };
        let mut link = Link::new(destination.desc, config);
        let _request = link.request();

        assert!(link.check_timeout(Instant::now() + Duration::from_millis(10)));
        assert_eq!(link.status(), LinkStatus::Closed);
    }

    #[test]
    fn remote_close_is_observed() {
        let (mut initiator, mut responder) = establish();

        // Activate first.
        let data = initiator.data_packet(b"x").expect("data packet");
        responder.handle_packet(&data);

        let close = initiator.close_packet();
        assert_eq!(initiator.status(), LinkStatus::Closed);

        responder.handle_packet(&close);
        assert_eq!(responder.status(), LinkStatus::Closed);
        assert!(responder
            .take_events()
            .iter()
            .any(|event| matches!(event, LinkEvent::Closed)));
    }

    #[test]
    fn rtt_report_updates_the_peer() {
        let (mut initiator, mut responder) = establish();

        // Activate with a first data packet.
        let data = initiator.data_packet(b"x").expect("data packet");
        responder.handle_packet(&data);

        let report = initiator.rtt_packet().expect("rtt packet");
        responder.handle_packet(&report);

        let difference = if responder.rtt() > initiator.rtt() {
            responder.rtt() - initiator.rtt()
        } else {
            initiator.rtt() - responder.rtt()
        };
        assert!(difference < Duration::from_millis(1), "rtt survives the f32 encoding");
    }

    #[test]
    fn pending_request_pool_is_bounded() {
        let (mut initiator, _responder) = establish();

        for index in 0..8u64 {
            let id = crate::hash::AddressHash::new_from_slice(&index.to_be_bytes());
            initiator.track_request(id).expect("slot available");
        }

        let overflow = crate::hash::AddressHash::new_from_slice(b"overflow");
        assert_eq!(
            initiator.track_request(overflow),
            Err(crate::error::RnsError::PoolExhausted)
        );

        let settled = crate::hash::AddressHash::new_from_slice(&2u64.to_be_bytes());
        assert!(initiator.conclude_request(&settled));
        assert!(!initiator.conclude_request(&settled));
        assert!(initiator.track_request(overflow).is_ok());
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let destination = make_destination();

        let mut initiator = Link::new(destination.desc, LinkConfig::default());
        let request = initiator.request();

        let mut responder = Link::new_from_request(
            &request,
            destination.identity.sign_key().clone(),
            destination.desc,
            LinkConfig::default(),
        )
        .expect("valid link request");

        let mut proof = responder.prove();
        proof.data.as_mut_slice()[3] ^= 0x01;
        initiator.handle_packet(&proof);
        assert_eq!(initiator.status(), LinkStatus::Pending);
    }
}
