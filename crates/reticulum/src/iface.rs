pub mod auto;
pub mod ble;
pub mod udp;

use core::fmt;
use std::time::Instant;

use crate::error::RnsError;

/// Connectivity direction flags.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct InterfaceMode(u8);

impl InterfaceMode {
    pub const IN: InterfaceMode = InterfaceMode(0b01);
    pub const OUT: InterfaceMode = InterfaceMode(0b10);
    pub const FULL: InterfaceMode = InterfaceMode(0b11);

    pub fn is_in(&self) -> bool {
        self.0 & Self::IN.0 != 0
    }

    pub fn is_out(&self) -> bool {
        self.0 & Self::OUT.0 != 0
    }
}

/// Transport-assigned handle for a registered interface; the key every
/// routing table stores.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct IfaceId(pub u8);

impl fmt::Display for IfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iface#{}", self.0)
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub rx_errors: u64,
}

impl InterfaceStats {
    pub fn count_rx(&mut self, bytes: usize) {
        self.rx_bytes += bytes as u64;
        self.rx_frames += 1;
    }

    pub fn count_tx(&mut self, bytes: usize) {
        self.tx_bytes += bytes as u64;
        self.tx_frames += 1;
    }

    pub fn count_rx_error(&mut self) {
        self.rx_errors += 1;
    }
}

/// Read-and-clear carrier transition flag: the first reader after a
/// transition sees true, later readers false.
#[derive(Debug, Default)]
pub struct CarrierFlag {
    changed: bool,
}

impl CarrierFlag {
    pub fn raise(&mut self) {
        self.changed = true;
    }

    pub fn read_and_clear(&mut self) -> bool {
        core::mem::take(&mut self.changed)
    }
}

/// The link-layer adapter contract. Adapters are polled from a single
/// cooperative context: `poll` performs non-blocking I/O and returns the
/// frames that arrived since the last tick; it never blocks.
pub trait Interface: Send {
    fn name(&self) -> &str;

    fn mode(&self) -> InterfaceMode {
        InterfaceMode::FULL
    }

    fn mtu(&self) -> usize;

    /// Estimated bitrate in bits per second.
    fn bitrate(&self) -> u64;

    fn start(&mut self) -> Result<(), RnsError>;

    fn stop(&mut self);

    fn online(&self) -> bool;

    /// Non-blocking service tick; returns inbound frames in receive order.
    fn poll(&mut self, now: Instant) -> Vec<Vec<u8>>;

    /// Queues one outbound frame. Failure marks the interface offline and
    /// raises the carrier flag; the caller drops the frame and may retry
    /// through another route.
    fn send_outgoing(&mut self, frame: &[u8]) -> Result<(), RnsError>;

    fn stats(&self) -> &InterfaceStats;

    /// Read-and-clear carrier transition indicator.
    fn carrier_changed(&mut self) -> bool {
        false
    }
}
