use core::fmt;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::RnsError;
use crate::hash::AddressHash;
use crate::iface::{CarrierFlag, Interface, InterfaceMode, InterfaceStats};
use crate::slots::SlotArray;

pub const SERVICE_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e3";
pub const RX_CHAR_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e5";
pub const TX_CHAR_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e4";
pub const IDENTITY_CHAR_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e6";

pub const FRAGMENT_HEADER_SIZE: usize = 5;
pub const MIN_MTU: usize = 23;
pub const MAX_MTU: usize = 512;
pub const REQUESTED_MTU: usize = 517;

pub const MAX_PEERS: usize = 7;
pub const KEEPALIVE_BYTE: u8 = 0x00;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

const BLACKLIST_THRESHOLD: u32 = 3;
const BLACKLIST_BASE_SECS: u64 = 60;
const BLACKLIST_MAX_FACTOR: u64 = 8;

const FRAGMENT_START: u8 = 0x01;
const FRAGMENT_CONTINUE: u8 = 0x02;
const FRAGMENT_END: u8 = 0x03;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Role arbitration: the numerically lower MAC initiates and becomes the
/// central; self-connections are rejected.
pub fn should_initiate_connection(local: &MacAddr, remote: &MacAddr) -> bool {
    local != remote && local < remote
}

/// Splits a payload into MTU-sized fragments with the 5-byte header:
/// type, big-endian sequence, big-endian total count. A payload fitting a
/// single fragment is typed END with total 1.
pub fn fragment(payload: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, RnsError> {
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(RnsError::InvalidArgument);
    }

    let chunk_size = mtu - FRAGMENT_HEADER_SIZE;
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(chunk_size).collect()
    };

    let total = chunks.len();
    if total > u16::MAX as usize {
        return Err(RnsError::OutOfMemory);
    }

    let mut fragments = Vec::with_capacity(total);
    for (sequence, chunk) in chunks.iter().enumerate() {
        let fragment_type = if total == 1 {
            FRAGMENT_END
        } else if sequence == 0 {
            FRAGMENT_START
        } else if sequence == total - 1 {
            FRAGMENT_END
        } else {
            FRAGMENT_CONTINUE
        };

        let mut out = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
        out.push(fragment_type);
        out.extend_from_slice(&(sequence as u16).to_be_bytes());
        out.extend_from_slice(&(total as u16).to_be_bytes());
        out.extend_from_slice(chunk);
        fragments.push(out);
    }

    Ok(fragments)
}

struct ParsedFragment<'a> {
    sequence: u16,
    total: u16,
    payload: &'a [u8],
    is_start: bool,
}

fn parse_fragment(frame: &[u8]) -> Option<ParsedFragment<'_>> {
    if frame.len() < FRAGMENT_HEADER_SIZE {
        return None;
    }
    let fragment_type = frame[0];
    if !(FRAGMENT_START..=FRAGMENT_END).contains(&fragment_type) {
        return None;
    }

    let sequence = u16::from_be_bytes([frame[1], frame[2]]);
    let total = u16::from_be_bytes([frame[3], frame[4]]);
    if total == 0 || sequence >= total {
        return None;
    }

    Some(ParsedFragment {
        sequence,
        total,
        payload: &frame[FRAGMENT_HEADER_SIZE..],
        is_start: fragment_type == FRAGMENT_START || total == 1,
    })
}

/// Per-peer reassembly session. Out-of-order fragments fill their slot
/// exactly once; a new START discards any incomplete predecessor; silence
/// beyond the timeout drops the session.
pub struct Reassembler {
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    last_activity: Instant,
}

impl Reassembler {
    fn new(total: u16, now: Instant) -> Self {
        Self { slots: vec![None; total as usize], received: 0, last_activity: now }
    }

    fn feed(&mut self, parsed: &ParsedFragment<'_>, now: Instant) -> Option<Vec<u8>> {
        self.last_activity = now;

        let slot = self.slots.get_mut(parsed.sequence as usize)?;
        if slot.is_none() {
            *slot = Some(parsed.payload.to_vec());
            self.received += 1;
        }

        if self.received == self.slots.len() {
            let mut payload = Vec::new();
            for part in self.slots.iter().flatten() {
                payload.extend_from_slice(part);
            }
            Some(payload)
        } else {
            None
        }
    }

    fn stale(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) > timeout
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlePeerState {
    Discovered,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
    Blacklisted,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BleRole {
    Central,
    Peripheral,
}

pub struct BlePeer {
    pub mac: MacAddr,
    pub identity: Option<AddressHash>,
    pub state: BlePeerState,
    pub role: Option<BleRole>,
    pub last_seen: Instant,
    pub rssi: i16,
    pub connection_attempts: u32,
    pub connection_successes: u32,
    consecutive_failures: u32,
    pub mtu: usize,
    blacklisted_until: Option<Instant>,
    handshake_deadline: Option<Instant>,
    last_keepalive: Option<Instant>,
    identity_sent: bool,
}

impl BlePeer {
    fn new(mac: MacAddr, rssi: i16, now: Instant) -> Self {
        Self {
            mac,
            identity: None,
            state: BlePeerState::Discovered,
            role: None,
            last_seen: now,
            rssi,
            connection_attempts: 0,
            connection_successes: 0,
            consecutive_failures: 0,
            mtu: MIN_MTU,
            blacklisted_until: None,
            handshake_deadline: None,
            last_keepalive: None,
            identity_sent: false,
        }
    }

    pub fn rssi_score(&self) -> f32 {
        ((self.rssi as f32 + 100.0) / 60.0).clamp(0.0, 1.0)
    }

    pub fn history_score(&self) -> f32 {
        self.connection_successes as f32 / self.connection_attempts.max(1) as f32
    }

    pub fn recency_score(&self, now: Instant) -> f32 {
        let age = now.duration_since(self.last_seen).as_secs_f32();
        (1.0 - age / 60.0).clamp(0.0, 1.0)
    }

    pub fn score(&self, now: Instant) -> f32 {
        0.60 * self.rssi_score() + 0.30 * self.history_score() + 0.10 * self.recency_score(now)
    }

    /// Exponential blacklist: three consecutive failures cost 60 s, each
    /// further failure doubles the hold, capped at eight minutes.
    fn register_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= BLACKLIST_THRESHOLD {
            let factor = 2u64
                .saturating_pow(self.consecutive_failures - BLACKLIST_THRESHOLD)
                .min(BLACKLIST_MAX_FACTOR);
            let hold = Duration::from_secs(BLACKLIST_BASE_SECS * factor);
            self.state = BlePeerState::Blacklisted;
            self.blacklisted_until = Some(now + hold);
            log::warn!("ble: peer {} blacklisted for {:?}", self.mac, hold);
        } else {
            self.state = BlePeerState::Discovered;
        }
        self.role = None;
        self.handshake_deadline = None;
    }

    fn register_success(&mut self) {
        self.connection_successes += 1;
        self.consecutive_failures = 0;
        self.blacklisted_until = None;
    }

    pub fn blacklisted_until(&self) -> Option<Instant> {
        self.blacklisted_until
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    HandshakeComplete { mac: MacAddr, identity: AddressHash, is_central: bool },
    ReassemblyTimeout { mac: MacAddr },
    PeerDisconnected { mac: MacAddr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleDriverEvent {
    Discovered { mac: MacAddr, rssi: i16 },
    Connected { mac: MacAddr, mtu: usize, is_central: bool },
    Disconnected { mac: MacAddr },
    Frame { mac: MacAddr, data: Vec<u8> },
}

/// Host-provided GATT radio. The driver owns scanning, advertising, the
/// service table and characteristic I/O; all protocol behavior (roles,
/// handshake, fragmentation, scoring, blacklist) lives above it. Platform
/// settling delays are driver policy and must not leak into the protocol.
pub trait BleDriver: Send {
    fn start(&mut self) -> Result<(), RnsError>;
    fn stop(&mut self);
    fn poll_events(&mut self) -> Vec<BleDriverEvent>;
    fn connect(&mut self, mac: &MacAddr) -> Result<(), RnsError>;
    fn disconnect(&mut self, mac: &MacAddr);
    fn write(&mut self, mac: &MacAddr, data: &[u8]) -> Result<(), RnsError>;
}

#[derive(Debug, Clone)]
pub struct BleConfig {
    pub name: String,
    pub local_mac: MacAddr,
    pub local_identity: AddressHash,
    pub max_peers: usize,
    pub keepalive_interval: Duration,
    pub handshake_timeout: Duration,
    pub reassembly_timeout: Duration,
}

impl BleConfig {
    pub fn new(local_mac: MacAddr, local_identity: AddressHash) -> Self {
        Self {
            name: "ble0".into(),
            local_mac,
            local_identity,
            max_peers: MAX_PEERS,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

/// BLE v2.2 sub-interface: MAC-sorted role arbitration, 16-byte identity
/// handshake, 5-byte-header fragmentation and per-peer reassembly, peer
/// scoring with exponential blacklist, and 15-second keepalives.
pub struct BleInterface {
    config: BleConfig,
    driver: Box<dyn BleDriver>,
    peers: SlotArray<BlePeer, MAX_PEERS>,
    reassembly: HashMap<MacAddr, Reassembler>,
    events: Vec<BleEvent>,
    stats: InterfaceStats,
    carrier: CarrierFlag,
    online: bool,
}

impl BleInterface {
    pub fn new(config: BleConfig, driver: Box<dyn BleDriver>) -> Self {
        Self {
            config,
            driver,
            peers: SlotArray::new(),
            reassembly: HashMap::new(),
            events: Vec::new(),
            stats: InterfaceStats::default(),
            carrier: CarrierFlag::default(),
            online: false,
        }
    }

    pub fn take_events(&mut self) -> Vec<BleEvent> {
        core::mem::take(&mut self.events)
    }

    pub fn peer(&self, mac: &MacAddr) -> Option<&BlePeer> {
        self.peers.get(self.peers.find(|peer| peer.mac == *mac)?)
    }

    fn peer_index(&self, mac: &MacAddr) -> Option<usize> {
        self.peers.find(|peer| peer.mac == *mac)
    }

    fn on_discovered(&mut self, mac: MacAddr, rssi: i16, now: Instant) {
        if mac == self.config.local_mac {
            return;
        }

        if let Some(index) = self.peer_index(&mac) {
            if let Some(peer) = self.peers.get_mut(index) {
                peer.rssi = rssi;
                peer.last_seen = now;
            }
            return;
        }

        if self.peers.allocate(BlePeer::new(mac, rssi, now)).is_none() {
            // Table full: replace the weakest idle peer if the newcomer
            // scores better.
            let candidate = BlePeer::new(mac, rssi, now);
            let weakest = self
                .peers
                .iter()
                .filter(|(_, peer)| peer.state == BlePeerState::Discovered)
                .min_by(|(_, a), (_, b)| {
                    a.score(now).partial_cmp(&b.score(now)).unwrap_or(core::cmp::Ordering::Equal)
                })
                .map(|(index, _)| index);

            if let Some(index) = weakest {
                let replace = self
                    .peers
                    .get(index)
                    .map(|peer| peer.score(now) < candidate.score(now))
                    .unwrap_or(false);
                if replace {
                    self.peers.release(index);
                    self.peers.allocate(candidate);
                    return;
                }
            }
            log::debug!("ble({}): peer table full, ignoring {}", self.config.name, mac);
        }
    }

    fn on_connected(&mut self, mac: MacAddr, mtu: usize, is_central: bool, now: Instant) {
        let local_identity = self.config.local_identity;
        let handshake_timeout = self.config.handshake_timeout;

        let Some(index) = self.peer_index(&mac) else { return };
        let send_identity = {
            let Some(peer) = self.peers.get_mut(index) else { return };
            peer.state = BlePeerState::Handshaking;
            peer.role = Some(if is_central { BleRole::Central } else { BleRole::Peripheral });
            peer.mtu = mtu.clamp(MIN_MTU, MAX_MTU);
            peer.last_seen = now;
            peer.handshake_deadline = Some(now + handshake_timeout);
            is_central
        };

        // The central opens the handshake by writing its identity to the
        // peer's RX characteristic.
        if send_identity {
            if self.driver.write(&mac, local_identity.as_slice()).is_ok() {
                if let Some(peer) = self.peers.get_mut(index) {
                    peer.identity_sent = true;
                }
            }
        }
    }

    fn on_disconnected(&mut self, mac: MacAddr, now: Instant) {
        self.reassembly.remove(&mac);
        let Some(index) = self.peer_index(&mac) else { return };
        let Some(peer) = self.peers.get_mut(index) else { return };

        match peer.state {
            BlePeerState::Connected => {
                peer.state = BlePeerState::Discovered;
                peer.role = None;
                peer.identity_sent = false;
                self.events.push(BleEvent::PeerDisconnected { mac });
            }
            BlePeerState::Connecting | BlePeerState::Handshaking => {
                peer.register_failure(now);
            }
            _ => {
                peer.state = BlePeerState::Discovered;
            }
        }
    }

    fn on_frame(&mut self, mac: MacAddr, data: &[u8], now: Instant) -> Option<Vec<u8>> {
        let local_identity = self.config.local_identity;
        let index = self.peer_index(&mac)?;

        // Keepalive: refresh activity, never delivered upward.
        if data.len() == 1 && data[0] == KEEPALIVE_BYTE {
            if let Some(peer) = self.peers.get_mut(index) {
                peer.last_seen = now;
            }
            if let Some(session) = self.reassembly.get_mut(&mac) {
                session.last_activity = now;
            }
            return None;
        }

        // A 16-byte frame from a peer with no mapped identity is the
        // handshake.
        let needs_identity =
            self.peers.get(index).map(|peer| peer.identity.is_none()).unwrap_or(false);
        if data.len() == 16 && needs_identity {
            let identity = AddressHash::try_from_slice(data).ok()?;
            let (is_central, identity_sent) = {
                let peer = self.peers.get_mut(index)?;
                peer.identity = Some(identity);
                peer.state = BlePeerState::Connected;
                peer.handshake_deadline = None;
                peer.last_seen = now;
                peer.register_success();
                (
                    peer.role == Some(BleRole::Central),
                    peer.identity_sent,
                )
            };

            // The peripheral answers with its own identity.
            if !identity_sent && self.driver.write(&mac, local_identity.as_slice()).is_ok() {
                if let Some(peer) = self.peers.get_mut(index) {
                    peer.identity_sent = true;
                }
            }

            log::info!("ble({}): handshake complete with {} ({})", self.config.name, mac, identity);
            self.events.push(BleEvent::HandshakeComplete { mac, identity, is_central });
            return None;
        }

        // Application data requires an identified peer.
        if needs_identity {
            log::debug!("ble({}): dropping frame from unidentified {}", self.config.name, mac);
            return None;
        }

        let parsed = parse_fragment(data)?;
        if let Some(peer) = self.peers.get_mut(index) {
            peer.last_seen = now;
        }

        // Out-of-order delivery is supported: any valid fragment may open
        // the session. A START that does not fit the open session (total
        // mismatch, or slot 0 already filled with different data) marks a
        // new transfer and discards the incomplete one; a retransmitted
        // START is just a duplicate and refreshes activity.
        let restart = match self.reassembly.get(&mac) {
            None => true,
            Some(session) => {
                parsed.is_start
                    && (session.slots.len() != parsed.total as usize
                        || session
                            .slots
                            .first()
                            .and_then(|slot| slot.as_deref())
                            .map(|filled| filled != parsed.payload)
                            .unwrap_or(false))
            }
        };
        if restart {
            self.reassembly.insert(mac, Reassembler::new(parsed.total, now));
        }

        let session = self.reassembly.get_mut(&mac)?;
        if session.slots.len() != parsed.total as usize {
            // Total mismatch against the open session: treat as garbage.
            return None;
        }

        match session.feed(&parsed, now) {
            Some(payload) => {
                self.reassembly.remove(&mac);
                self.stats.count_rx(payload.len());
                Some(payload)
            }
            None => None,
        }
    }

    fn run_timers(&mut self, now: Instant) {
        // Handshake deadlines.
        let mut failed = Vec::new();
        for (index, peer) in self.peers.iter() {
            if peer.state == BlePeerState::Handshaking {
                if let Some(deadline) = peer.handshake_deadline {
                    if now >= deadline {
                        failed.push((index, peer.mac));
                    }
                }
            }
        }
        for (index, mac) in failed {
            log::warn!("ble({}): handshake timeout for {}", self.config.name, mac);
            self.driver.disconnect(&mac);
            if let Some(peer) = self.peers.get_mut(index) {
                peer.register_failure(now);
            }
        }

        // Reassembly sessions.
        let timeout = self.config.reassembly_timeout;
        let stale: Vec<MacAddr> = self
            .reassembly
            .iter()
            .filter(|(_, session)| session.stale(now, timeout))
            .map(|(mac, _)| *mac)
            .collect();
        for mac in stale {
            log::warn!("ble({}): reassembly timeout for {}", self.config.name, mac);
            self.reassembly.remove(&mac);
            self.events.push(BleEvent::ReassemblyTimeout { mac });
        }

        // Blacklist expiry.
        for (_, peer) in self.peers.iter_mut() {
            if peer.state == BlePeerState::Blacklisted {
                if let Some(until) = peer.blacklisted_until {
                    if now >= until {
                        peer.state = BlePeerState::Discovered;
                        peer.blacklisted_until = None;
                    }
                }
            }
        }

        // Keepalives to connected peers.
        let interval = self.config.keepalive_interval;
        let mut due = Vec::new();
        for (index, peer) in self.peers.iter() {
            if peer.state == BlePeerState::Connected {
                let send = match peer.last_keepalive {
                    Some(last) => now.duration_since(last) >= interval,
                    None => true,
                };
                if send {
                    due.push((index, peer.mac));
                }
            }
        }
        for (index, mac) in due {
            let _ = self.driver.write(&mac, &[KEEPALIVE_BYTE]);
            if let Some(peer) = self.peers.get_mut(index) {
                peer.last_keepalive = Some(now);
            }
        }
    }

    /// Picks the best DISCOVERED candidate whose MAC is higher than ours
    /// (making us the lower-MAC initiator) and opens a connection.
    fn attempt_connections(&mut self, now: Instant) {
        let local_mac = self.config.local_mac;
        let connected = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                matches!(
                    peer.state,
                    BlePeerState::Connected | BlePeerState::Connecting | BlePeerState::Handshaking
                )
            })
            .count();
        if connected >= self.config.max_peers {
            return;
        }

        let best = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.state == BlePeerState::Discovered
                    && should_initiate_connection(&local_mac, &peer.mac)
            })
            .max_by(|(_, a), (_, b)| {
                a.score(now).partial_cmp(&b.score(now)).unwrap_or(core::cmp::Ordering::Equal)
            })
            .map(|(index, peer)| (index, peer.mac));

        if let Some((index, mac)) = best {
            if let Some(peer) = self.peers.get_mut(index) {
                peer.state = BlePeerState::Connecting;
                peer.connection_attempts += 1;
            }
            if self.driver.connect(&mac).is_err() {
                if let Some(peer) = self.peers.get_mut(index) {
                    peer.register_failure(now);
                }
            }
        }
    }
}

impl Interface for BleInterface {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn mode(&self) -> InterfaceMode {
        InterfaceMode::FULL
    }

    fn mtu(&self) -> usize {
        MAX_MTU
    }

    fn bitrate(&self) -> u64 {
        125_000
    }

    fn start(&mut self) -> Result<(), RnsError> {
        self.driver.start()?;
        self.online = true;
        log::info!("ble({}): started as {}", self.config.name, self.config.local_mac);
        Ok(())
    }

    fn stop(&mut self) {
        self.driver.stop();
        self.online = false;
    }

    fn online(&self) -> bool {
        self.online
    }

    fn poll(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for event in self.driver.poll_events() {
            match event {
                BleDriverEvent::Discovered { mac, rssi } => self.on_discovered(mac, rssi, now),
                BleDriverEvent::Connected { mac, mtu, is_central } => {
                    self.on_connected(mac, mtu, is_central, now)
                }
                BleDriverEvent::Disconnected { mac } => self.on_disconnected(mac, now),
                BleDriverEvent::Frame { mac, data } => {
                    if let Some(payload) = self.on_frame(mac, &data, now) {
                        frames.push(payload);
                    }
                }
            }
        }

        self.run_timers(now);
        self.attempt_connections(now);

        frames
    }

    fn send_outgoing(&mut self, frame: &[u8]) -> Result<(), RnsError> {
        let targets: Vec<(MacAddr, usize)> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.state == BlePeerState::Connected)
            .map(|(_, peer)| (peer.mac, peer.mtu))
            .collect();

        if targets.is_empty() {
            return Ok(());
        }

        let mut sent_any = false;
        for (mac, mtu) in targets {
            let fragments = fragment(frame, mtu)?;
            let mut peer_ok = true;
            for piece in &fragments {
                if self.driver.write(&mac, piece).is_err() {
                    peer_ok = false;
                    break;
                }
            }
            sent_any |= peer_ok;
        }

        if sent_any {
            self.stats.count_tx(frame.len());
            Ok(())
        } else {
            self.carrier.raise();
            Err(RnsError::InterfaceWriteFailure)
        }
    }

    fn stats(&self) -> &InterfaceStats {
        &self.stats
    }

    fn carrier_changed(&mut self) -> bool {
        self.carrier.read_and_clear()
    }
}
