pub mod announce_table;
pub mod link_table;
pub mod path_requests;
pub mod path_table;

use std::time::{Duration, Instant};

use rand_core::OsRng;

use crate::config::TransportConfig;
use crate::destination::link::{
    Link, LinkEvent, LinkHandleResult, LinkId, KEEP_ALIVE_REQUEST,
};
use crate::destination::{DestinationAnnounce, SingleInputDestination};
use crate::error::RnsError;
use crate::hash::AddressHash;
use crate::iface::{IfaceId, InterfaceMode};
use crate::identity::{encrypt_to_public_key, KnownDestinations, PrivateIdentity};
use crate::packet::{
    DestinationType, Header, HeaderType, Packet, PacketContext, PacketType, TransportType,
    MAX_HOPS,
};
use crate::receipt::{build_proof, validate_proof, PacketReceipt};
use crate::slots::{HashRing, SlotArray};
use crate::time::now_unix;

use announce_table::{
    AnnounceQueue, AnnounceRateTable, AnnounceTable, HeldAnnounces, RateDecision,
};
use link_table::{TransitLinkTable, DEFAULT_IDLE_TIMEOUT, DEFAULT_PROOF_TIMEOUT};
use path_requests::{parse_path_request, path_request_destination, PathRequests};
use path_table::{PathTable, ReverseTable, TunnelTable};

pub const PACKET_HASHLIST_SLOTS: usize = 64;
pub const RECEIPT_SLOTS: usize = 8;
pub const MAX_INTERFACES: usize = 8;
pub const MAX_LOCAL_DESTINATIONS: usize = 16;
pub const MAX_LOCAL_LINKS: usize = 8;

const LINK_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// An outbound frame bound for one interface; drained by the host driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub iface: IfaceId,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A packet addressed to a local destination was decrypted.
    PacketDelivered { destination: AddressHash, payload: Vec<u8>, via_ratchet: bool },
    AnnounceReceived { destination: AddressHash, hops: u8, app_data: Vec<u8>, iface: IfaceId },
    /// A pending send's path resolved and the frame went out.
    PathResolved { destination: AddressHash, receipt: Option<usize> },
    /// Path discovery timed out; the pending send was failed.
    SendFailed { destination: AddressHash },
    LinkActivated { link_id: LinkId },
    LinkData { link_id: LinkId, payload: Vec<u8>, context: PacketContext },
    LinkClosed { link_id: LinkId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame queued; the receipt slot observes delivery when requested.
    Sent(Option<usize>),
    /// No path yet: a path request went out and the payload is parked.
    PathPending,
}

struct IfaceRecord {
    id: IfaceId,
    mode: InterfaceMode,
    online: bool,
    announce_queue: AnnounceQueue,
    rx_packets: u64,
    tx_packets: u64,
    rx_errors: u64,
}

struct ReceiptEntry {
    receipt: PacketReceipt,
    destination: AddressHash,
}

/// The routing hub. Owns every table; the host holds the value and drives
/// it from one cooperative context: `inbound` per received frame, `tick`
/// once per scheduling quantum, then `take_outgoing`/`take_events`.
pub struct Transport {
    config: TransportConfig,
    identity: PrivateIdentity,
    interfaces: Vec<IfaceRecord>,
    destinations: SlotArray<SingleInputDestination, MAX_LOCAL_DESTINATIONS>,
    known: KnownDestinations,
    path_table: PathTable,
    reverse_table: ReverseTable,
    tunnels: TunnelTable,
    announce_table: AnnounceTable,
    held_announces: HeldAnnounces,
    rates: AnnounceRateTable,
    path_requests: PathRequests,
    link_table: TransitLinkTable,
    receipts: SlotArray<ReceiptEntry, RECEIPT_SLOTS>,
    packet_hashlist: HashRing<AddressHash, PACKET_HASHLIST_SLOTS>,
    out_links: SlotArray<Link, MAX_LOCAL_LINKS>,
    in_links: SlotArray<Link, MAX_LOCAL_LINKS>,
    last_link_keepalive: Option<Instant>,
    outgoing: Vec<TxFrame>,
    events: Vec<TransportEvent>,
}

impl Transport {
    pub fn new(identity: PrivateIdentity, config: TransportConfig) -> Self {
        Self {
            rates: AnnounceRateTable::new(config.announce_rate),
            path_requests: PathRequests::new(config.path_request_timeout),
            link_table: TransitLinkTable::new(DEFAULT_PROOF_TIMEOUT, DEFAULT_IDLE_TIMEOUT),
            config,
            identity,
            interfaces: Vec::new(),
            destinations: SlotArray::new(),
            known: KnownDestinations::new(),
            path_table: PathTable::new(),
            reverse_table: ReverseTable::new(),
            tunnels: TunnelTable::new(),
            announce_table: AnnounceTable::new(),
            held_announces: HeldAnnounces::new(),
            receipts: SlotArray::new(),
            packet_hashlist: HashRing::new(),
            out_links: SlotArray::new(),
            in_links: SlotArray::new(),
            last_link_keepalive: None,
            outgoing: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn identity(&self) -> &PrivateIdentity {
        &self.identity
    }

    //***********************************************************************//
    // Interfaces

    pub fn register_interface(&mut self, mode: InterfaceMode) -> Result<IfaceId, RnsError> {
        if self.interfaces.len() >= MAX_INTERFACES {
            return Err(RnsError::PoolExhausted);
        }
        let id = IfaceId(self.interfaces.len() as u8);
        self.interfaces.push(IfaceRecord {
            id,
            mode,
            online: false,
            announce_queue: AnnounceQueue::new(),
            rx_packets: 0,
            tx_packets: 0,
            rx_errors: 0,
        });
        Ok(id)
    }

    pub fn set_interface_online(&mut self, iface: IfaceId, online: bool) {
        if let Some(record) = self.iface_mut(iface) {
            record.online = online;
        }
    }

    /// The host observed a write failure: the interface goes offline and
    /// its routes are released so traffic can fail over.
    pub fn interface_write_failed(&mut self, iface: IfaceId) {
        log::warn!("tp({}): write failure on {}, marking offline", self.config.name, iface);
        if let Some(record) = self.iface_mut(iface) {
            record.online = false;
        }
        self.path_table.drop_via_iface(iface);
        self.link_table.drop_via_iface(iface);
    }

    pub fn interface_counters(&self, iface: IfaceId) -> Option<(u64, u64, u64)> {
        self.interfaces
            .iter()
            .find(|record| record.id == iface)
            .map(|record| (record.rx_packets, record.tx_packets, record.rx_errors))
    }

    fn iface_mut(&mut self, iface: IfaceId) -> Option<&mut IfaceRecord> {
        self.interfaces.iter_mut().find(|record| record.id == iface)
    }

    //***********************************************************************//
    // Local destinations

    pub fn add_destination(
        &mut self,
        destination: SingleInputDestination,
    ) -> Result<AddressHash, RnsError> {
        let hash = destination.desc.address_hash;
        if self.destinations.find(|dest| dest.desc.address_hash == hash).is_some() {
            return Err(RnsError::InvalidArgument);
        }
        self.destinations
            .allocate(destination)
            .map(|_| hash)
            .ok_or(RnsError::PoolExhausted)
    }

    pub fn destination_mut(
        &mut self,
        hash: &AddressHash,
    ) -> Option<&mut SingleInputDestination> {
        let index = self.destinations.find(|dest| dest.desc.address_hash == *hash)?;
        self.destinations.get_mut(index)
    }

    /// Builds and broadcasts an announce for a local destination.
    pub fn announce_local(
        &mut self,
        hash: &AddressHash,
        app_data: Option<&[u8]>,
    ) -> Result<(), RnsError> {
        let index = self
            .destinations
            .find(|dest| dest.desc.address_hash == *hash)
            .ok_or(RnsError::UnknownDestination)?;
        let destination = self.destinations.get_mut(index).ok_or(RnsError::UnknownDestination)?;

        let packet = destination.announce(OsRng, app_data)?;
        let raw = packet.to_bytes()?;
        self.packet_hashlist.insert(packet.truncated_hash());
        self.broadcast(raw, None);
        Ok(())
    }

    //***********************************************************************//
    // Outbound

    /// Encrypts and sends a datagram to a SINGLE destination. With no path
    /// and no identity, the payload parks behind a path request.
    pub fn send_data(
        &mut self,
        destination: AddressHash,
        payload: &[u8],
        want_receipt: bool,
        now: Instant,
    ) -> Result<SendOutcome, RnsError> {
        let Some(identity) = self.known.recall(&destination) else {
            return self.park_behind_path_request(destination, payload, want_receipt, now);
        };

        let ratchet = self.known.recall_ratchet(&destination);
        let packet = self.build_data_packet(&destination, &identity, ratchet, payload)?;

        if self.path_table.get(&destination).is_none() && !self.config.broadcast_unknown {
            return self.park_behind_path_request(destination, payload, want_receipt, now);
        }

        let receipt = if want_receipt { self.allocate_receipt(&packet, destination, now) } else { None };
        self.route_and_queue(packet, None)?;
        Ok(SendOutcome::Sent(receipt))
    }

    fn park_behind_path_request(
        &mut self,
        destination: AddressHash,
        payload: &[u8],
        want_receipt: bool,
        now: Instant,
    ) -> Result<SendOutcome, RnsError> {
        match self.path_requests.open(destination, Some(payload.to_vec()), want_receipt, now) {
            Some(request) => {
                let raw = request.to_bytes()?;
                self.packet_hashlist.insert(request.truncated_hash());
                self.broadcast(raw, None);
                Ok(SendOutcome::PathPending)
            }
            // Piggybacked on an in-flight request for this destination.
            None if self.path_requests.has_request(&destination) => Ok(SendOutcome::PathPending),
            None => Err(RnsError::PoolExhausted),
        }
    }

    fn build_data_packet(
        &self,
        destination: &AddressHash,
        identity: &crate::identity::Identity,
        ratchet: Option<[u8; 32]>,
        payload: &[u8],
    ) -> Result<Packet, RnsError> {
        let salt = destination.to_bytes();
        let ciphertext = match ratchet {
            Some(ratchet_public) => encrypt_to_public_key(
                OsRng,
                &x25519_dalek::PublicKey::from(ratchet_public),
                payload,
                Some(&salt),
            )?,
            None => identity.encrypt(OsRng, payload, Some(&salt))?,
        };

        let mut packet = Packet {
            header: Header {
                destination_type: DestinationType::Single,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            destination: *destination,
            transport: None,
            context: PacketContext::None,
            data: Default::default(),
        };
        if packet.data.write(&ciphertext).is_err() {
            return Err(RnsError::OutOfMemory);
        }
        Ok(packet)
    }

    fn allocate_receipt(
        &mut self,
        packet: &Packet,
        destination: AddressHash,
        now: Instant,
    ) -> Option<usize> {
        let receipt = PacketReceipt::new(packet, self.config.receipt_timeout, now);
        match self.receipts.allocate(ReceiptEntry { receipt, destination }) {
            Some(slot) => Some(slot),
            None => {
                log::warn!("tp({}): receipt pool full, sending unobserved", self.config.name);
                None
            }
        }
    }

    pub fn receipt_mut(&mut self, slot: usize) -> Option<&mut PacketReceipt> {
        self.receipts.get_mut(slot).map(|entry| &mut entry.receipt)
    }

    /// Routes a packet: a known path sends directly (promoting to HEADER_2
    /// through multi-hop next hops), otherwise announces and, when enabled,
    /// unresolved data fall back to broadcast.
    fn route_and_queue(&mut self, packet: Packet, exclude: Option<IfaceId>) -> Result<(), RnsError> {
        self.packet_hashlist.insert(packet.truncated_hash());

        let routed = self.path_table.get(&packet.destination).map(|entry| (*entry, entry.hops));
        if let Some((entry, hops)) = routed {
            let packet = if hops <= 1 || packet.header.header_type == HeaderType::Type2 {
                packet
            } else {
                Packet {
                    header: Header {
                        header_type: HeaderType::Type2,
                        transport_type: TransportType::Transport,
                        ..packet.header
                    },
                    transport: Some(entry.next_hop),
                    ..packet
                }
            };
            let raw = packet.to_bytes()?;
            self.queue_tx(entry.iface, raw);
            return Ok(());
        }

        // Announces and link-addressed traffic have no path entry of their
        // own; they flood outward.
        if packet.header.packet_type == PacketType::Announce
            || packet.header.destination_type == DestinationType::Link
            || self.config.broadcast_unknown
        {
            let raw = packet.to_bytes()?;
            self.broadcast(raw, exclude);
            return Ok(());
        }

        log::trace!("tp({}): no route for {}", self.config.name, packet.destination);
        Err(RnsError::UnknownDestination)
    }

    fn broadcast(&mut self, raw: Vec<u8>, exclude: Option<IfaceId>) {
        let targets: Vec<IfaceId> = self
            .interfaces
            .iter()
            .filter(|record| record.online && record.mode.is_out() && Some(record.id) != exclude)
            .map(|record| record.id)
            .collect();
        for iface in targets {
            self.queue_tx(iface, raw.clone());
        }
    }

    fn queue_tx(&mut self, iface: IfaceId, raw: Vec<u8>) {
        if let Some(record) = self.iface_mut(iface) {
            if !record.online {
                return;
            }
            record.tx_packets += 1;
        }
        self.outgoing.push(TxFrame { iface, raw });
    }

    pub fn take_outgoing(&mut self) -> Vec<TxFrame> {
        core::mem::take(&mut self.outgoing)
    }

    pub fn take_events(&mut self) -> Vec<TransportEvent> {
        core::mem::take(&mut self.events)
    }

    //***********************************************************************//
    // Links

    /// Opens an outbound link to a known destination.
    pub fn open_link(&mut self, destination: AddressHash) -> Result<LinkId, RnsError> {
        let identity = self.known.recall(&destination).ok_or(RnsError::UnknownDestination)?;

        let desc = crate::destination::DestinationDesc {
            identity,
            address_hash: destination,
            name: crate::destination::DestinationName::new_from_hash_slice(
                destination.as_slice(),
            ),
        };

        let mut link = Link::new(desc, self.config.link);
        let request = link.request();
        let link_id = *link.id();

        if self.out_links.allocate(link).is_none() {
            return Err(RnsError::PoolExhausted);
        }

        self.route_and_queue(request, None)?;
        Ok(link_id)
    }

    /// Sends an encrypted payload over an ACTIVE link.
    pub fn send_on_link(&mut self, link_id: &LinkId, payload: &[u8]) -> Result<(), RnsError> {
        let packet = if let Some(index) = self.out_links.find(|link| link.id() == link_id) {
            self.out_links
                .get(index)
                .ok_or(RnsError::UnknownDestination)?
                .data_packet(payload)?
        } else if let Some(index) = self.in_links.find(|link| link.id() == link_id) {
            self.in_links
                .get(index)
                .ok_or(RnsError::UnknownDestination)?
                .data_packet(payload)?
        } else {
            return Err(RnsError::UnknownDestination);
        };
        self.route_and_queue(packet, None)
    }

    pub fn close_link(&mut self, link_id: &LinkId) {
        let mut close_packets = Vec::new();
        for pool in [&mut self.out_links, &mut self.in_links] {
            if let Some(index) = pool.find(|link| link.id() == link_id) {
                if let Some(link) = pool.get_mut(index) {
                    close_packets.push(link.close_packet());
                }
            }
        }
        for packet in close_packets {
            let _ = self.route_and_queue(packet, None);
        }
    }

    //***********************************************************************//
    // Inbound

    pub fn inbound(&mut self, raw: &[u8], iface: IfaceId, now: Instant) {
        let packet = match Packet::from_bytes(raw) {
            Ok(packet) => packet,
            Err(_) => {
                if let Some(record) = self.iface_mut(iface) {
                    record.rx_errors += 1;
                }
                log::debug!("tp({}): malformed frame on {}", self.config.name, iface);
                return;
            }
        };

        if let Some(record) = self.iface_mut(iface) {
            record.rx_packets += 1;
        }

        // Duplicate suppression across every interface.
        if !self.packet_hashlist.insert(packet.truncated_hash()) {
            log::trace!("tp({}): dropping duplicate {}", self.config.name, packet);
            return;
        }

        match packet.header.packet_type {
            PacketType::Announce => self.handle_announce(&packet, iface, now),
            PacketType::Data => self.handle_data(&packet, iface, now),
            PacketType::LinkRequest => self.handle_link_request(&packet, iface, now),
            PacketType::Proof => self.handle_proof(&packet, iface, now),
        }
    }

    fn handle_announce(&mut self, packet: &Packet, iface: IfaceId, now: Instant) {
        match self.rates.check(&packet.destination, now) {
            RateDecision::Pass => {}
            RateDecision::Hold => {
                self.held_announces.hold(packet.destination, *packet, iface, now);
                return;
            }
            RateDecision::Block => {
                log::info!(
                    "tp({}): announce rate limit for {}",
                    self.config.name,
                    packet.destination
                );
                return;
            }
        }

        self.process_announce(packet, iface, now);
    }

    fn process_announce(&mut self, packet: &Packet, iface: IfaceId, now: Instant) {
        let (identity, ratchet, app_data) = match DestinationAnnounce::validate(packet) {
            Ok(info) => {
                (info.destination.desc.identity, info.ratchet, info.app_data.to_vec())
            }
            Err(_) => {
                log::debug!(
                    "tp({}): invalid announce for {}",
                    self.config.name,
                    packet.destination
                );
                return;
            }
        };

        self.known.remember(packet.destination, &identity, now_unix());
        if let Some(ratchet) = ratchet {
            self.known.remember_ratchet(&packet.destination, ratchet, now_unix());
        }

        let next_hop = packet.transport.unwrap_or(packet.destination);
        let hops = packet.header.hops.saturating_add(1);
        self.path_table.learn(packet.destination, next_hop, iface, hops, now);

        // A parked send can go out now.
        if let Some(entry) = self.path_requests.resolve(&packet.destination) {
            if let Some(payload) = entry.pending_payload {
                match self.send_data(packet.destination, &payload, entry.want_receipt, now) {
                    Ok(SendOutcome::Sent(receipt)) => {
                        self.events.push(TransportEvent::PathResolved {
                            destination: packet.destination,
                            receipt,
                        });
                    }
                    _ => {
                        self.events
                            .push(TransportEvent::SendFailed { destination: packet.destination });
                    }
                }
            } else {
                self.events
                    .push(TransportEvent::PathResolved { destination: packet.destination, receipt: None });
            }
        }

        self.events.push(TransportEvent::AnnounceReceived {
            destination: packet.destination,
            hops: packet.header.hops,
            app_data,
            iface,
        });

        // Propagation: every other live outbound interface sees the
        // announce once, hops bumped; transit nodes also queue a repeat
        // with their own transport id.
        if let Ok(raw) = self.propagated_announce(packet).to_bytes() {
            let targets: Vec<IfaceId> = self
                .interfaces
                .iter()
                .filter(|record| record.online && record.mode.is_out() && record.id != iface)
                .map(|record| record.id)
                .collect();
            for target in targets {
                if let Some(record) = self.iface_mut(target) {
                    record.announce_queue.enqueue(raw.clone(), now);
                }
            }
        }

        if self.config.transit_enabled {
            self.announce_table.add(packet.destination, *packet, iface, now);
        }
    }

    fn propagated_announce(&self, packet: &Packet) -> Packet {
        let mut propagated = *packet;
        propagated.header.hops = packet.header.hops.saturating_add(1).min(MAX_HOPS);
        if self.config.transit_enabled {
            propagated.header.header_type = HeaderType::Type2;
            propagated.header.transport_type = TransportType::Transport;
            propagated.transport = Some(*self.identity.address_hash());
        }
        propagated
    }

    fn handle_data(&mut self, packet: &Packet, iface: IfaceId, now: Instant) {
        if packet.header.destination_type == DestinationType::Link {
            self.handle_link_packet(packet, iface, now);
            return;
        }

        // Path discovery runs over a fixed PLAIN destination.
        if packet.destination == path_request_destination() {
            self.handle_path_request(packet, iface, now);
            return;
        }

        if let Some(index) =
            self.destinations.find(|dest| dest.desc.address_hash == packet.destination)
        {
            let decrypted = self
                .destinations
                .get_mut(index)
                .map(|dest| dest.decrypt(packet.data.as_slice()));
            match decrypted {
                Some(Ok((payload, via_ratchet))) => {
                    let proof = self
                        .destinations
                        .get(index)
                        .map(|dest| build_proof(packet, &dest.identity));
                    self.events.push(TransportEvent::PacketDelivered {
                        destination: packet.destination,
                        payload,
                        via_ratchet,
                    });
                    if let Some(proof) = proof {
                        if let Ok(raw) = proof.to_bytes() {
                            self.packet_hashlist.insert(proof.truncated_hash());
                            self.queue_tx(iface, raw);
                        }
                    }
                }
                Some(Err(error)) => {
                    log::debug!(
                        "tp({}): dropping undecryptable packet for {}: {}",
                        self.config.name,
                        packet.destination,
                        error
                    );
                }
                None => {}
            }
            return;
        }

        // Not ours: transit nodes forward along the known path.
        if self.config.transit_enabled {
            self.forward_transit(packet, iface, now);
        }
    }

    fn forward_transit(&mut self, packet: &Packet, iface: IfaceId, now: Instant) {
        let Some(entry) = self.path_table.get(&packet.destination).copied() else {
            return;
        };
        if entry.iface == iface {
            return;
        }
        if packet.header.hops >= MAX_HOPS {
            return;
        }

        let mut forwarded = *packet;
        forwarded.header.hops += 1;
        if entry.hops > 1 {
            forwarded.header.header_type = HeaderType::Type2;
            forwarded.header.transport_type = TransportType::Transport;
            forwarded.transport = Some(entry.next_hop);
        } else {
            forwarded.header.header_type = HeaderType::Type1;
            forwarded.transport = None;
        }

        if let Ok(raw) = forwarded.to_bytes() {
            // Remember the way back for the proof.
            self.reverse_table.record(packet.truncated_hash(), iface, entry.iface, now);
            self.queue_tx(entry.iface, raw);
        }
    }

    fn handle_path_request(&mut self, packet: &Packet, iface: IfaceId, now: Instant) {
        let Some((target, tag)) = parse_path_request(packet.data.as_slice()) else {
            return;
        };
        if !self.path_requests.tag_is_new(tag) {
            return;
        }

        if let Some(index) = self.destinations.find(|dest| dest.desc.address_hash == target) {
            let response = self
                .destinations
                .get_mut(index)
                .and_then(|dest| dest.path_response(OsRng, None).ok());
            if let Some(response) = response {
                if let Ok(raw) = response.to_bytes() {
                    self.packet_hashlist.insert(response.truncated_hash());
                    self.queue_tx(iface, raw);
                }
            }
            return;
        }

        // Transit nodes spread the request away from its origin.
        if self.config.transit_enabled {
            if let Ok(raw) = packet.to_bytes() {
                self.broadcast(raw, Some(iface));
            }
        }
    }

    fn handle_link_request(&mut self, packet: &Packet, iface: IfaceId, now: Instant) {
        if let Some(index) =
            self.destinations.find(|dest| dest.desc.address_hash == packet.destination)
        {
            let link = self.destinations.get(index).and_then(|dest| {
                Link::new_from_request(
                    packet,
                    dest.identity.sign_key().clone(),
                    dest.desc,
                    self.config.link,
                )
                .ok()
            });

            let Some(mut link) = link else { return };
            let proof = link.prove();

            if self.in_links.allocate(link).is_none() {
                log::warn!("tp({}): inbound link pool full", self.config.name);
                return;
            }
            if let Ok(raw) = proof.to_bytes() {
                self.packet_hashlist.insert(proof.truncated_hash());
                self.queue_tx(iface, raw);
            }
            return;
        }

        // Transit: remember the hop pair, then pass the request onward.
        if self.config.transit_enabled {
            if let Some(entry) = self.path_table.get(&packet.destination).copied() {
                if entry.iface != iface {
                    self.link_table.add(packet, entry.next_hop, entry.iface, iface, now);
                    self.forward_transit(packet, iface, now);
                }
            }
        }
    }

    fn handle_proof(&mut self, packet: &Packet, iface: IfaceId, now: Instant) {
        if packet.context == PacketContext::LinkRequestProof {
            // Initiator side of a pending link.
            let mut handled = false;
            for (_, link) in self.out_links.iter_mut() {
                if link.id() == &packet.destination {
                    link.handle_packet(packet);
                    handled = true;
                }
            }
            self.drain_link_events();
            if handled {
                return;
            }

            if self.config.transit_enabled {
                if let Some((backwards, out_iface)) = self.link_table.handle_proof(packet) {
                    if let Ok(raw) = backwards.to_bytes() {
                        self.queue_tx(out_iface, raw);
                    }
                }
            }
            return;
        }

        // Explicit delivery proof: hash || signature.
        let payload = packet.data.as_slice();
        let mut concluded = None;
        for (slot, entry) in self.receipts.iter_mut() {
            if entry.receipt.truncated_hash() == &packet.destination {
                if let Some(identity) = self.known.recall(&entry.destination) {
                    if validate_proof(payload, entry.receipt.packet_hash(), &identity).is_ok() {
                        entry.receipt.conclude_delivered(now);
                        concluded = Some(slot);
                    }
                }
                break;
            }
        }
        if let Some(slot) = concluded {
            self.receipts.release(slot);
            return;
        }

        // Transit: hand the proof back along the recorded reverse route.
        if self.config.transit_enabled {
            if let Some(entry) = self.reverse_table.take(&packet.destination) {
                if entry.outbound_iface == iface || entry.receiving_iface != iface {
                    let mut backwards = *packet;
                    backwards.header.hops = backwards.header.hops.saturating_add(1);
                    if let Ok(raw) = backwards.to_bytes() {
                        self.queue_tx(entry.receiving_iface, raw);
                    }
                }
            }
        }
    }

    fn handle_link_packet(&mut self, packet: &Packet, iface: IfaceId, _now: Instant) {
        let mut responses = Vec::new();
        let mut handled = false;

        for pool in [&mut self.out_links, &mut self.in_links] {
            if let Some(index) = pool.find(|link| link.id() == &packet.destination) {
                if let Some(link) = pool.get_mut(index) {
                    match link.handle_packet(packet) {
                        LinkHandleResult::Respond(response) => responses.push(response),
                        LinkHandleResult::Activated
                        | LinkHandleResult::KeepAlive
                        | LinkHandleResult::None => {}
                    }
                    handled = true;
                }
            }
        }

        self.drain_link_events();

        for response in responses {
            if let Ok(raw) = response.to_bytes() {
                self.packet_hashlist.insert(response.truncated_hash());
                self.queue_tx(iface, raw);
            }
        }

        if handled || !self.config.transit_enabled {
            return;
        }

        // Transit link traffic: shuttle between the recorded neighbor
        // interfaces.
        let routed = match self.link_table.get(&packet.destination) {
            Some(entry) if entry.received_on == iface => self.link_table.forward(packet),
            Some(_) => self.link_table.backward(packet),
            None => None,
        };
        if let Some((forwarded, out_iface)) = routed {
            if let Ok(raw) = forwarded.to_bytes() {
                self.queue_tx(out_iface, raw);
            }
        }
    }

    fn drain_link_events(&mut self) {
        let mut events = Vec::new();
        for pool in [&mut self.out_links, &mut self.in_links] {
            for (_, link) in pool.iter_mut() {
                let link_id = *link.id();
                for event in link.take_events() {
                    events.push(match event {
                        LinkEvent::Activated => TransportEvent::LinkActivated { link_id },
                        LinkEvent::Data { payload, context } => {
                            TransportEvent::LinkData { link_id, payload, context }
                        }
                        LinkEvent::Closed => TransportEvent::LinkClosed { link_id },
                    });
                }
            }
        }
        self.events.extend(events);
    }

    //***********************************************************************//
    // Periodic work

    pub fn tick(&mut self, now: Instant) {
        // Receipt timeouts.
        let mut failed = Vec::new();
        for (slot, entry) in self.receipts.iter_mut() {
            if entry.receipt.check_timeout(now) {
                failed.push(slot);
            }
        }
        for slot in failed {
            self.receipts.release(slot);
        }

        // Path request expiry fails the pending send.
        for entry in self.path_requests.expired(now) {
            log::debug!(
                "tp({}): path request for {} timed out",
                self.config.name,
                entry.destination
            );
            if entry.pending_payload.is_some() {
                self.events.push(TransportEvent::SendFailed { destination: entry.destination });
            }
        }

        // Held announces release back into the pipeline.
        let released = self.held_announces.due_releases(now);
        for (_, packet, iface) in released {
            self.process_announce(&packet, iface, now);
        }

        // Transit announce retransmissions.
        if self.config.transit_enabled {
            for (packet, received_on) in self.announce_table.due_retransmissions(now) {
                let propagated = self.propagated_announce(&packet);
                if let Ok(raw) = propagated.to_bytes() {
                    self.broadcast(raw, Some(received_on));
                }
            }
        }

        // Local link timers and keepalives.
        self.run_link_timers(now);

        // Transit link teardown propagates a close both ways.
        for entry in self.link_table.remove_stale(now) {
            if entry.validated {
                let close = Packet {
                    header: Header {
                        destination_type: DestinationType::Link,
                        packet_type: PacketType::Data,
                        ..Default::default()
                    },
                    destination: entry.link_id,
                    transport: None,
                    context: PacketContext::LinkClose,
                    data: Default::default(),
                };
                if let Ok(raw) = close.to_bytes() {
                    self.queue_tx(entry.received_on, raw.clone());
                    self.queue_tx(entry.next_hop_iface, raw);
                }
            }
        }

        self.reverse_table.expire(now);
        self.tunnels.expire(now);

        // Flush per-interface announce queues.
        let mut queued: Vec<(IfaceId, Vec<Vec<u8>>)> = Vec::new();
        for record in self.interfaces.iter_mut() {
            if record.online && record.announce_queue.len() > 0 {
                queued.push((record.id, record.announce_queue.drain()));
            }
        }
        for (iface, frames) in queued {
            for raw in frames {
                self.queue_tx(iface, raw);
            }
        }
    }

    fn run_link_timers(&mut self, now: Instant) {
        let keepalive_due = match self.last_link_keepalive {
            Some(last) => now.duration_since(last) >= LINK_KEEPALIVE_INTERVAL,
            None => false,
        };
        if self.last_link_keepalive.is_none() {
            self.last_link_keepalive = Some(now);
        }

        let mut keepalives = Vec::new();

        for pool in [&mut self.out_links, &mut self.in_links] {
            for (_, link) in pool.iter_mut() {
                link.check_timeout(now);
                if keepalive_due
                    && link.is_initiator()
                    && link.status() == crate::destination::link::LinkStatus::Active
                {
                    keepalives.push(link.keep_alive_packet(KEEP_ALIVE_REQUEST));
                }
            }
        }
        if keepalive_due {
            self.last_link_keepalive = Some(now);
        }

        self.drain_link_events();

        // Closed links leave their pools after events drained.
        for pool in [&mut self.out_links, &mut self.in_links] {
            let stale: Vec<usize> = pool
                .iter()
                .filter(|(_, link)| {
                    link.status() == crate::destination::link::LinkStatus::Closed
                })
                .map(|(index, _)| index)
                .collect();
            for index in stale {
                pool.release(index);
            }
        }

        for packet in keepalives {
            let _ = self.route_and_queue(packet, None);
        }
    }

    //***********************************************************************//
    // Introspection for the host

    pub fn has_path(&self, destination: &AddressHash) -> bool {
        self.path_table.get(destination).is_some()
    }

    pub fn known_identity(&self, destination: &AddressHash) -> Option<crate::identity::Identity> {
        self.known.recall(destination)
    }

    pub fn known_destinations_mut(&mut self) -> &mut KnownDestinations {
        &mut self.known
    }

    pub fn link_status(&self, link_id: &LinkId) -> Option<crate::destination::link::LinkStatus> {
        for pool in [&self.out_links, &self.in_links] {
            if let Some(index) = pool.find(|link| link.id() == link_id) {
                return pool.get(index).map(|link| link.status());
            }
        }
        None
    }

    pub fn bind_tunnel(&mut self, tunnel_id: AddressHash, iface: IfaceId, now: Instant) -> bool {
        self.tunnels.bind(tunnel_id, iface, now)
    }
}
