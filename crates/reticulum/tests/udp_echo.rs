use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand_core::OsRng;

use reticulum::config::TransportConfig;
use reticulum::destination::new_in;
use reticulum::iface::udp::UdpInterface;
use reticulum::iface::{IfaceId, Interface, InterfaceMode};
use reticulum::identity::PrivateIdentity;
use reticulum::transport::{SendOutcome, Transport, TransportEvent};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("socket address")
}

struct UdpNode {
    transport: Transport,
    iface: UdpInterface,
    iface_id: IfaceId,
}

impl UdpNode {
    fn new(name: &str) -> Self {
        let mut iface = UdpInterface::new(name, addr(0), addr(1));
        iface.start().expect("bind");

        let mut transport = Transport::new(
            PrivateIdentity::new_from_rand(OsRng),
            TransportConfig { name: name.into(), ..Default::default() },
        );
        let iface_id = transport.register_interface(InterfaceMode::FULL).expect("iface slot");
        transport.set_interface_online(iface_id, true);

        Self { transport, iface, iface_id }
    }

    fn local_addr(&self) -> SocketAddr {
        self.iface.local_addr().expect("bound address")
    }

    fn service(&mut self, now: Instant) -> Vec<TransportEvent> {
        for frame in self.iface.poll(now) {
            self.transport.inbound(&frame, self.iface_id, now);
        }
        self.transport.tick(now);
        for frame in self.transport.take_outgoing() {
            let _ = self.iface.send_outgoing(&frame.raw);
        }
        self.transport.take_events()
    }
}

/// Echo round-trip over real loopback sockets: announce, then a tracked
/// datagram whose proof concludes the receipt.
#[tokio::test(flavor = "current_thread")]
async fn udp_echo_roundtrip() {
    let mut receiver = UdpNode::new("receiver");
    let mut sender = UdpNode::new("sender");

    let receiver_addr = receiver.local_addr();
    let sender_addr = sender.local_addr();
    receiver.iface.set_forward(sender_addr);
    sender.iface.set_forward(receiver_addr);

    let destination = new_in(PrivateIdentity::new_from_rand(OsRng), "udp_tests", "echo");
    let dest_hash = receiver.transport.add_destination(destination).expect("destination");

    receiver.transport.announce_local(&dest_hash, Some(b"echo")).expect("announce");

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut announced = false;
    while Instant::now() < deadline && !announced {
        let now = Instant::now();
        receiver.service(now);
        for event in sender.service(now) {
            if matches!(event, TransportEvent::AnnounceReceived { destination, .. } if destination == dest_hash)
            {
                announced = true;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(announced, "announce crossed the loopback");

    let outcome = sender
        .transport
        .send_data(dest_hash, b"ping", true, Instant::now())
        .expect("send accepted");
    assert!(matches!(outcome, SendOutcome::Sent(Some(_))));

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut delivered = false;
    while Instant::now() < deadline && !delivered {
        let now = Instant::now();
        for event in receiver.service(now) {
            if matches!(event, TransportEvent::PacketDelivered { ref payload, .. } if payload == b"ping")
            {
                delivered = true;
            }
        }
        sender.service(now);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(delivered, "payload delivered within the deadline");
}
