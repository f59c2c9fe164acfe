use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::error::RnsError;
use crate::hash::{full_hash, AddressHash};
use crate::iface::{CarrierFlag, Interface, InterfaceMode, InterfaceStats};

pub const DEFAULT_GROUP_ID: &str = "reticulum";
pub const DISCOVERY_PORT: u16 = 29716;
pub const DATA_PORT: u16 = 42671;

pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(1600);
pub const DEFAULT_PEERING_TIMEOUT: Duration = Duration::from_millis(22_000);
pub const DEFAULT_MCAST_ECHO_TIMEOUT: Duration = Duration::from_millis(6_500);
pub const DEFAULT_PEER_JOB_INTERVAL: Duration = Duration::from_millis(4_000);

/// Reverse peerings go out at 3.25 announce intervals.
const REVERSE_PEERING_FACTOR: f64 = 3.25;

const DISCOVERY_TOKEN_SIZE: usize = 32;
const MAX_PEERS: usize = 64;

const RECENT_PACKETS: usize = 48;
const RECENT_PACKET_TTL: Duration = Duration::from_millis(750);

#[derive(Debug, Clone)]
pub struct AutoInterfaceConfig {
    pub name: String,
    pub group_id: String,
    pub discovery_port: u16,
    pub data_port: u16,
    pub announce_interval: Duration,
    pub peering_timeout: Duration,
    pub mcast_echo_timeout: Duration,
    pub peer_job_interval: Duration,
    /// NIC index the link-local scope refers to.
    pub scope_id: u32,
    /// Explicit link-local address; probed from the NIC when unset.
    pub link_local: Option<Ipv6Addr>,
}

impl Default for AutoInterfaceConfig {
    fn default() -> Self {
        Self {
            name: "auto0".into(),
            group_id: DEFAULT_GROUP_ID.into(),
            discovery_port: DISCOVERY_PORT,
            data_port: DATA_PORT,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            peering_timeout: DEFAULT_PEERING_TIMEOUT,
            mcast_echo_timeout: DEFAULT_MCAST_ECHO_TIMEOUT,
            peer_job_interval: DEFAULT_PEER_JOB_INTERVAL,
            scope_id: 0,
            link_local: None,
        }
    }
}

impl AutoInterfaceConfig {
    pub fn unicast_discovery_port(&self) -> u16 {
        self.discovery_port + 1
    }

    pub fn reverse_peering_interval(&self) -> Duration {
        self.announce_interval.mul_f64(REVERSE_PEERING_FACTOR)
    }
}

/// Multicast group for a peer group: ff12:0: followed by bytes 2..13 of
/// SHA-256(group id) as network-order pairs.
pub fn group_address(group_id: &str) -> Ipv6Addr {
    let digest = full_hash(group_id.as_bytes());
    let pair = |index: usize| u16::from_be_bytes([digest[index], digest[index + 1]]);

    Ipv6Addr::new(
        0xff12,
        0x0000,
        pair(2),
        pair(4),
        pair(6),
        pair(8),
        pair(10),
        pair(12),
    )
}

/// Discovery token: SHA-256(group id || textual link-local address).
pub fn discovery_token(group_id: &str, link_local: &Ipv6Addr) -> [u8; DISCOVERY_TOKEN_SIZE] {
    let mut input = Vec::with_capacity(group_id.len() + 48);
    input.extend_from_slice(group_id.as_bytes());
    input.extend_from_slice(link_local.to_string().as_bytes());
    full_hash(&input)
}

#[derive(Debug, Clone, Copy)]
pub struct AutoPeer {
    pub address: Ipv6Addr,
    pub data_port: u16,
    pub last_heard: Instant,
}

/// Data-path duplicate suppression: a short deque of recent packet hashes
/// with a sub-second TTL, absorbing the multicast/unicast double delivery.
pub struct RecentPackets {
    entries: VecDeque<(AddressHash, Instant)>,
}

impl RecentPackets {
    pub fn new() -> Self {
        Self { entries: VecDeque::with_capacity(RECENT_PACKETS) }
    }

    /// True when the frame is new; duplicates within the TTL are rejected.
    pub fn check_and_insert(&mut self, hash: AddressHash, now: Instant) -> bool {
        while let Some((_, seen)) = self.entries.front() {
            if now.duration_since(*seen) > RECENT_PACKET_TTL {
                self.entries.pop_front();
            } else {
                break;
            }
        }

        if self.entries.iter().any(|(seen_hash, _)| *seen_hash == hash) {
            return false;
        }

        if self.entries.len() == RECENT_PACKETS {
            self.entries.pop_front();
        }
        self.entries.push_back((hash, now));
        true
    }
}

impl Default for RecentPackets {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingReversePeering {
    address: Ipv6Addr,
    due: Instant,
}

/// Discovery and carrier-detection state machine, independent of sockets.
/// The socket shell feeds datagrams in and executes the actions ticked out.
pub struct AutoInterfaceState {
    config: AutoInterfaceConfig,
    link_local: Ipv6Addr,
    token: [u8; DISCOVERY_TOKEN_SIZE],
    peers: Vec<AutoPeer>,
    pending_reverse: Vec<PendingReversePeering>,
    multicast_echo_at: Option<Instant>,
    initial_echo_received: bool,
    first_announce_at: Option<Instant>,
    last_announce_at: Option<Instant>,
    announces_sent: u64,
    firewall_warned: bool,
    carrier_ok: bool,
    carrier: CarrierFlag,
}

impl AutoInterfaceState {
    pub fn new(config: AutoInterfaceConfig, link_local: Ipv6Addr) -> Self {
        let token = discovery_token(&config.group_id, &link_local);
        Self {
            config,
            link_local,
            token,
            peers: Vec::new(),
            pending_reverse: Vec::new(),
            multicast_echo_at: None,
            initial_echo_received: false,
            first_announce_at: None,
            last_announce_at: None,
            announces_sent: 0,
            firewall_warned: false,
            carrier_ok: true,
            carrier: CarrierFlag::default(),
        }
    }

    pub fn link_local(&self) -> &Ipv6Addr {
        &self.link_local
    }

    pub fn token(&self) -> &[u8; DISCOVERY_TOKEN_SIZE] {
        &self.token
    }

    pub fn peers(&self) -> &[AutoPeer] {
        &self.peers
    }

    pub fn carrier_ok(&self) -> bool {
        self.carrier_ok
    }

    pub fn carrier_changed(&mut self) -> bool {
        self.carrier.read_and_clear()
    }

    /// The link-local address moved: recompute the token, forget the echo
    /// history and signal the transition.
    pub fn set_link_local(&mut self, link_local: Ipv6Addr) {
        if link_local == self.link_local {
            return;
        }
        log::info!(
            "auto({}): link-local address changed {} -> {}",
            self.config.name,
            self.link_local,
            link_local
        );
        self.link_local = link_local;
        self.token = discovery_token(&self.config.group_id, &link_local);
        self.multicast_echo_at = None;
        self.initial_echo_received = false;
        self.first_announce_at = None;
        self.announces_sent = 0;
        self.carrier.raise();
    }

    /// A datagram on the multicast or unicast discovery path.
    pub fn handle_discovery(&mut self, source: Ipv6Addr, payload: &[u8], now: Instant) {
        if payload.len() != DISCOVERY_TOKEN_SIZE {
            return;
        }

        if source == self.link_local {
            self.multicast_echo_at = Some(now);
            if !self.initial_echo_received {
                self.initial_echo_received = true;
                log::debug!("auto({}): initial multicast echo received", self.config.name);
            }
            if !self.carrier_ok {
                self.carrier_ok = true;
                self.carrier.raise();
                log::info!("auto({}): carrier recovered", self.config.name);
            }
            return;
        }

        let expected = discovery_token(&self.config.group_id, &source);
        if payload != expected {
            log::trace!("auto({}): invalid discovery token from {}", self.config.name, source);
            return;
        }

        let is_new = self.refresh_peer(source, now);
        if is_new {
            // Answer a newly seen multicast peer with a unicast token inside
            // the next reverse-peering window.
            self.schedule_reverse_peering(source, now);
        }
    }

    fn refresh_peer(&mut self, address: Ipv6Addr, now: Instant) -> bool {
        if let Some(peer) = self.peers.iter_mut().find(|peer| peer.address == address) {
            peer.last_heard = now;
            return false;
        }

        if self.peers.len() >= MAX_PEERS {
            log::warn!("auto({}): peer table full, ignoring {}", self.config.name, address);
            return false;
        }

        log::info!("auto({}): peer {} added", self.config.name, address);
        self.peers.push(AutoPeer { address, data_port: self.config.data_port, last_heard: now });
        true
    }

    fn schedule_reverse_peering(&mut self, address: Ipv6Addr, now: Instant) {
        if self.pending_reverse.iter().any(|pending| pending.address == address) {
            return;
        }
        self.pending_reverse.push(PendingReversePeering {
            address,
            due: now + self.config.reverse_peering_interval(),
        });
    }

    pub fn due_reverse_peerings(&mut self, now: Instant) -> Vec<Ipv6Addr> {
        let mut due = Vec::new();
        self.pending_reverse.retain(|pending| {
            if pending.due <= now {
                due.push(pending.address);
                false
            } else {
                true
            }
        });
        due
    }

    /// True when the multicast announce is due this tick.
    pub fn announce_due(&mut self, now: Instant) -> bool {
        let due = match self.last_announce_at {
            Some(last) => now.duration_since(last) >= self.config.announce_interval,
            None => true,
        };
        if due {
            self.last_announce_at = Some(now);
            self.first_announce_at.get_or_insert(now);
            self.announces_sent += 1;
        }
        due
    }

    /// Echo watchdog: no own echo inside the timeout means our multicasts
    /// are not reaching the segment.
    pub fn carrier_tick(&mut self, now: Instant) {
        if self.announces_sent == 0 {
            return;
        }

        let reference = self.multicast_echo_at.or(self.first_announce_at);
        let lost = match reference {
            Some(instant) => now.duration_since(instant) > self.config.mcast_echo_timeout,
            None => false,
        };

        if lost && self.carrier_ok {
            self.carrier_ok = false;
            self.carrier.raise();
            log::warn!(
                "auto({}): carrier lost, no multicast echo within {:?}",
                self.config.name,
                self.config.mcast_echo_timeout
            );
        }

        if !self.initial_echo_received && !self.firewall_warned {
            if let Some(first) = self.first_announce_at {
                if now.duration_since(first) > self.config.announce_interval * 3 {
                    self.firewall_warned = true;
                    log::warn!(
                        "auto({}): no multicast echo ever received, a local firewall may be \
                         dropping multicast traffic",
                        self.config.name
                    );
                }
            }
        }
    }

    /// Peer housekeeping: expire peers not heard inside the timeout.
    pub fn peer_job(&mut self, now: Instant) {
        let timeout = self.config.peering_timeout;
        let name = self.config.name.clone();
        self.peers.retain(|peer| {
            let alive = now.duration_since(peer.last_heard) <= timeout;
            if !alive {
                log::info!("auto({}): peer {} expired", name, peer.address);
            }
            alive
        });
    }
}

enum SocketSet {
    Offline,
    Online { discovery: UdpSocket, unicast_discovery: UdpSocket, data: UdpSocket },
}

/// IPv6 link-local multicast interface: token-based peer discovery over a
/// derived multicast group, unicast reverse peering, and unicast data
/// exchange with every live peer.
pub struct AutoInterface {
    config: AutoInterfaceConfig,
    state: AutoInterfaceState,
    sockets: SocketSet,
    recent: RecentPackets,
    stats: InterfaceStats,
    last_peer_job: Option<Instant>,
    online: bool,
}

impl AutoInterface {
    pub fn new(config: AutoInterfaceConfig) -> Self {
        let link_local =
            config.link_local.unwrap_or(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        Self {
            state: AutoInterfaceState::new(config.clone(), link_local),
            config,
            sockets: SocketSet::Offline,
            recent: RecentPackets::new(),
            stats: InterfaceStats::default(),
            last_peer_job: None,
            online: false,
        }
    }

    pub fn state(&self) -> &AutoInterfaceState {
        &self.state
    }

    fn group_socket_addr(&self) -> SocketAddrV6 {
        SocketAddrV6::new(
            group_address(&self.config.group_id),
            self.config.discovery_port,
            0,
            self.config.scope_id,
        )
    }

    fn bind_udp(&self, port: u16) -> Result<UdpSocket, RnsError> {
        let address = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, self.config.scope_id);
        let socket =
            std::net::UdpSocket::bind(address).map_err(|_| RnsError::InterfaceWriteFailure)?;
        socket.set_nonblocking(true).map_err(|_| RnsError::InterfaceWriteFailure)?;
        UdpSocket::from_std(socket).map_err(|_| RnsError::InterfaceWriteFailure)
    }

    /// Best-effort probe of the NIC's link-local source address: a connected
    /// UDP socket reveals the source the host routes with.
    fn probe_link_local(&self) -> Option<Ipv6Addr> {
        if let Some(configured) = self.config.link_local {
            return Some(configured);
        }

        let probe =
            std::net::UdpSocket::bind(("::", 0)).ok()?;
        let target =
            SocketAddrV6::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0xffff), 9, 0, self.config.scope_id);
        probe.connect(target).ok()?;
        match probe.local_addr().ok()? {
            SocketAddr::V6(address) => Some(*address.ip()),
            SocketAddr::V4(_) => None,
        }
    }

    fn drain_discovery(socket: &UdpSocket, state: &mut AutoInterfaceState, now: Instant) {
        let mut buffer = [0u8; 64];
        while let Ok((len, source)) = socket.try_recv_from(&mut buffer) {
            if let SocketAddr::V6(source) = source {
                state.handle_discovery(*source.ip(), &buffer[..len], now);
            }
        }
    }
}

impl Interface for AutoInterface {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn mode(&self) -> InterfaceMode {
        InterfaceMode::FULL
    }

    fn mtu(&self) -> usize {
        1196
    }

    fn bitrate(&self) -> u64 {
        10_000_000
    }

    fn start(&mut self) -> Result<(), RnsError> {
        if let Some(link_local) = self.probe_link_local() {
            self.state.set_link_local(link_local);
        }

        let discovery = self.bind_udp(self.config.discovery_port)?;
        discovery
            .join_multicast_v6(&group_address(&self.config.group_id), self.config.scope_id)
            .map_err(|_| RnsError::InterfaceWriteFailure)?;

        let unicast_discovery = self.bind_udp(self.config.unicast_discovery_port())?;
        let data = self.bind_udp(self.config.data_port)?;

        self.sockets = SocketSet::Online { discovery, unicast_discovery, data };
        self.online = true;
        log::info!(
            "auto({}): started, group {} token {}",
            self.config.name,
            self.group_socket_addr(),
            hex::encode(self.state.token())
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.sockets = SocketSet::Offline;
        self.online = false;
    }

    fn online(&self) -> bool {
        self.online
    }

    fn poll(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        let rebind = {
            let SocketSet::Online { discovery, unicast_discovery, data } = &self.sockets else {
                return frames;
            };

            Self::drain_discovery(discovery, &mut self.state, now);
            Self::drain_discovery(unicast_discovery, &mut self.state, now);

            let mut buffer = [0u8; 2048];
            while let Ok((len, _)) = data.try_recv_from(&mut buffer) {
                let frame = &buffer[..len];
                let hash = AddressHash::new_from_slice(frame);
                if self.recent.check_and_insert(hash, now) {
                    self.stats.count_rx(len);
                    frames.push(frame.to_vec());
                }
            }

            if self.state.announce_due(now) {
                let group = self.group_socket_addr();
                let _ = discovery.try_send_to(self.state.token(), group.into());
            }

            for peer in self.state.due_reverse_peerings(now) {
                let target = SocketAddrV6::new(
                    peer,
                    self.config.unicast_discovery_port(),
                    0,
                    self.config.scope_id,
                );
                let _ = unicast_discovery.try_send_to(self.state.token(), target.into());
            }

            self.state.carrier_tick(now);

            let peer_job_due = match self.last_peer_job {
                Some(last) => now.duration_since(last) >= self.config.peer_job_interval,
                None => true,
            };

            if peer_job_due {
                self.last_peer_job = Some(now);
                self.state.peer_job(now);
                self.probe_link_local()
                    .filter(|probed| probed != self.state.link_local())
            } else {
                None
            }
        };

        // Address change: close and rebind the data and unicast discovery
        // sockets, recompute the discovery token.
        if let Some(link_local) = rebind {
            self.state.set_link_local(link_local);
            let old = core::mem::replace(&mut self.sockets, SocketSet::Offline);
            if let SocketSet::Online { discovery, unicast_discovery, data } = old {
                // The old sockets must release their ports first.
                drop(unicast_discovery);
                drop(data);
                match (
                    self.bind_udp(self.config.unicast_discovery_port()),
                    self.bind_udp(self.config.data_port),
                ) {
                    (Ok(unicast_discovery), Ok(data)) => {
                        self.sockets =
                            SocketSet::Online { discovery, unicast_discovery, data };
                    }
                    _ => {
                        log::warn!(
                            "auto({}): rebind after address change failed",
                            self.config.name
                        );
                        self.online = false;
                    }
                }
            }
        }

        frames
    }

    fn send_outgoing(&mut self, frame: &[u8]) -> Result<(), RnsError> {
        let SocketSet::Online { data, .. } = &self.sockets else {
            return Err(RnsError::InterfaceWriteFailure);
        };

        let mut sent_any = false;
        for peer in self.state.peers() {
            let target =
                SocketAddrV6::new(peer.address, peer.data_port, 0, self.config.scope_id);
            if data.try_send_to(frame, target.into()).is_ok() {
                sent_any = true;
            }
        }

        if sent_any || self.state.peers().is_empty() {
            self.stats.count_tx(frame.len());
            Ok(())
        } else {
            Err(RnsError::InterfaceWriteFailure)
        }
    }

    fn stats(&self) -> &InterfaceStats {
        &self.stats
    }

    fn carrier_changed(&mut self) -> bool {
        self.state.carrier_changed()
    }
}
