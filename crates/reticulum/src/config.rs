use std::time::Duration;

use crate::destination::link::LinkConfig;
use crate::hash::AddressHash;
use crate::transport::announce_table::RateLimit;

pub const DEFAULT_RATCHET_INTERVAL_SECS: u64 = 1800;

#[derive(Clone)]
pub struct TransportConfig {
    pub name: String,
    /// Re-emit non-local packets along known paths.
    pub transit_enabled: bool,
    /// Broadcast data packets with no known route instead of holding them
    /// behind a path request.
    pub broadcast_unknown: bool,
    pub announce_rate: RateLimit,
    pub path_request_timeout: Duration,
    pub receipt_timeout: Duration,
    pub link: LinkConfig,
    pub ratchet_interval_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "rns".into(),
            transit_enabled: false,
            broadcast_unknown: false,
            announce_rate: RateLimit::default(),
            path_request_timeout: crate::transport::path_requests::DEFAULT_PATH_REQUEST_TIMEOUT,
            receipt_timeout: crate::receipt::DEFAULT_RECEIPT_TIMEOUT,
            link: LinkConfig::default(),
            ratchet_interval_secs: DEFAULT_RATCHET_INTERVAL_SECS,
        }
    }
}

/// Host-level configuration: the transport core plus the optional pinned
/// LXMF propagation node.
#[derive(Clone, Default)]
pub struct NodeConfig {
    pub transport: TransportConfig,
    pub propagation_node: Option<AddressHash>,
}
