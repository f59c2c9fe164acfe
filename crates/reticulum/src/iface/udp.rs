use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::UdpSocket;

use crate::error::RnsError;
use crate::iface::{CarrierFlag, Interface, InterfaceMode, InterfaceStats};

/// Point-to-point UDP interface: one raw packet per datagram. Used by the
/// integration suites and as the simplest real adapter.
pub struct UdpInterface {
    name: String,
    bind_addr: SocketAddr,
    forward_addr: SocketAddr,
    socket: Option<UdpSocket>,
    stats: InterfaceStats,
    carrier: CarrierFlag,
}

impl UdpInterface {
    pub fn new(name: &str, bind_addr: SocketAddr, forward_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            forward_addr,
            socket: None,
            stats: InterfaceStats::default(),
            carrier: CarrierFlag::default(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Points the interface at a (possibly newly learned) peer address.
    pub fn set_forward(&mut self, forward_addr: SocketAddr) {
        self.forward_addr = forward_addr;
    }
}

impl Interface for UdpInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> InterfaceMode {
        InterfaceMode::FULL
    }

    fn mtu(&self) -> usize {
        1064
    }

    fn bitrate(&self) -> u64 {
        10_000_000
    }

    fn start(&mut self) -> Result<(), RnsError> {
        let socket =
            std::net::UdpSocket::bind(self.bind_addr).map_err(|_| RnsError::InterfaceWriteFailure)?;
        socket.set_nonblocking(true).map_err(|_| RnsError::InterfaceWriteFailure)?;
        self.socket =
            Some(UdpSocket::from_std(socket).map_err(|_| RnsError::InterfaceWriteFailure)?);
        log::info!("udp({}): bound to {}", self.name, self.bind_addr);
        Ok(())
    }

    fn stop(&mut self) {
        self.socket = None;
    }

    fn online(&self) -> bool {
        self.socket.is_some()
    }

    fn poll(&mut self, _now: Instant) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let Some(socket) = self.socket.as_ref() else {
            return frames;
        };

        let mut buffer = [0u8; 2048];
        while let Ok((len, _)) = socket.try_recv_from(&mut buffer) {
            self.stats.count_rx(len);
            frames.push(buffer[..len].to_vec());
        }
        frames
    }

    fn send_outgoing(&mut self, frame: &[u8]) -> Result<(), RnsError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(RnsError::InterfaceWriteFailure);
        };

        match socket.try_send_to(frame, self.forward_addr) {
            Ok(_) => {
                self.stats.count_tx(frame.len());
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                // Kernel buffer pressure: drop this frame, stay online.
                log::warn!("udp({}): send would block, dropping frame", self.name);
                Ok(())
            }
            Err(_) => {
                log::warn!("udp({}): send failed, marking offline", self.name);
                self.socket = None;
                self.carrier.raise();
                Err(RnsError::InterfaceWriteFailure)
            }
        }
    }

    fn stats(&self) -> &InterfaceStats {
        &self.stats
    }

    fn carrier_changed(&mut self) -> bool {
        self.carrier.read_and_clear()
    }
}
