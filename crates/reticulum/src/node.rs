use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::RnsError;
use crate::iface::{IfaceId, Interface};
use crate::transport::{Transport, TransportEvent};

const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Cooperative driver: owns the transport and the interface adapters and
/// runs everything from one context. Each pass polls every interface for
/// inbound frames, feeds them to the transport, runs the transport timers
/// and flushes the outbound queue. No component ever blocks the loop.
pub struct Node {
    transport: Transport,
    interfaces: Vec<(IfaceId, Box<dyn Interface>)>,
    cancel: CancellationToken,
}

impl Node {
    pub fn new(transport: Transport) -> Self {
        Self { transport, interfaces: Vec::new(), cancel: CancellationToken::new() }
    }

    pub fn with_config(
        identity: crate::identity::PrivateIdentity,
        config: NodeConfig,
    ) -> Self {
        Self::new(Transport::new(identity, config.transport))
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers and starts an interface adapter. Must run inside the tokio
    /// runtime context, socket-backed adapters bind on start.
    pub fn add_interface(&mut self, mut interface: Box<dyn Interface>) -> Result<IfaceId, RnsError> {
        let id = self.transport.register_interface(interface.mode())?;
        interface.start()?;
        self.transport.set_interface_online(id, interface.online());
        log::info!("node: interface {} registered as {}", interface.name(), id);
        self.interfaces.push((id, interface));
        Ok(id)
    }

    /// One scheduler pass. Kept public so tests and embedding hosts can
    /// drive the node at their own cadence.
    pub fn tick_once(&mut self, now: Instant) -> Vec<TransportEvent> {
        for (id, interface) in self.interfaces.iter_mut() {
            for frame in interface.poll(now) {
                self.transport.inbound(&frame, *id, now);
            }
            if interface.carrier_changed() {
                log::info!("node: carrier change on {}", interface.name());
                self.transport.set_interface_online(*id, interface.online());
            }
        }

        self.transport.tick(now);

        for frame in self.transport.take_outgoing() {
            let Some((id, interface)) =
                self.interfaces.iter_mut().find(|(id, _)| *id == frame.iface)
            else {
                continue;
            };
            if interface.send_outgoing(&frame.raw).is_err() {
                self.transport.interface_write_failed(*id);
            }
        }

        self.transport.take_events()
    }

    /// Runs the cooperative loop until cancelled. Events are handed to
    /// `on_event` inside the loop; the callback must return promptly.
    pub async fn run<F: FnMut(TransportEvent)>(&mut self, mut on_event: F) {
        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for event in self.tick_once(Instant::now()) {
                        on_event(event);
                    }
                }
            }
        }

        for (_, interface) in self.interfaces.iter_mut() {
            interface.stop();
        }
    }
}
