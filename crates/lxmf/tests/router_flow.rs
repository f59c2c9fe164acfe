use std::collections::HashMap;

use rand_core::OsRng;

use lxmf::error::LxmfError;
use lxmf::message::LxmfMessage;
use lxmf::propagation::{queued_count, PropagationSelection};
use lxmf::router::{Adapter, LxmfRouter, RouterEvent, OUTBOUND_RING};
use reticulum::hash::AddressHash;
use reticulum::identity::{Identity, PrivateIdentity};
use reticulum::storage::MemoryStorage;

/// Capture adapter: records sends and serves identity/path lookups from a
/// fixed map.
#[derive(Default)]
struct MockAdapter {
    identities: HashMap<AddressHash, Identity>,
    sends: Vec<(AddressHash, Vec<u8>)>,
}

impl MockAdapter {
    fn learn(&mut self, destination: AddressHash, identity: &Identity) {
        self.identities.insert(destination, *identity);
    }

    fn take_sends(&mut self) -> Vec<(AddressHash, Vec<u8>)> {
        core::mem::take(&mut self.sends)
    }
}

impl Adapter for MockAdapter {
    fn known_identity(&self, destination: &AddressHash) -> Option<Identity> {
        self.identities.get(destination).copied()
    }

    fn has_path(&self, destination: &AddressHash) -> bool {
        self.identities.contains_key(destination)
    }

    fn send(&mut self, destination: AddressHash, payload: &[u8]) -> Result<(), LxmfError> {
        self.sends.push((destination, payload.to_vec()));
        Ok(())
    }
}

struct Endpoint {
    router: LxmfRouter,
    adapter: MockAdapter,
    identity: PrivateIdentity,
}

impl Endpoint {
    fn new(selection: PropagationSelection) -> Self {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        Self {
            router: LxmfRouter::new(identity.clone(), selection),
            adapter: MockAdapter::default(),
            identity,
        }
    }

    fn hash(&self) -> AddressHash {
        *self.router.delivery_hash()
    }
}

#[test]
fn direct_delivery_concludes_with_a_proof() {
    let mut alice = Endpoint::new(PropagationSelection::Auto);
    let mut bob = Endpoint::new(PropagationSelection::Auto);

    alice.adapter.learn(bob.hash(), bob.identity.as_identity());
    bob.adapter.learn(alice.hash(), alice.identity.as_identity());

    let message =
        LxmfMessage::new(alice.hash(), bob.hash(), "ping", b"direct delivery", 1000.0);
    let message_id = alice.router.enqueue(message).expect("queued");
    assert_eq!(alice.router.pending_count(), 1);

    alice.router.process_outbound(&mut alice.adapter, 1000);
    let sends = alice.adapter.take_sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, bob.hash());

    bob.router.handle_inbound(&sends[0].1, &mut bob.adapter).expect("delivered");
    assert!(bob.router.take_events().iter().any(|event| matches!(
        event,
        RouterEvent::MessageReceived { message, verified: true }
            if message.content == b"direct delivery"
    )));

    // Bob's delivery proof travels back and releases the outbound slot.
    let proofs = bob.adapter.take_sends();
    assert_eq!(proofs.len(), 1);
    assert_eq!(proofs[0].0, alice.hash());

    alice.router.handle_inbound(&proofs[0].1, &mut alice.adapter).expect("proof accepted");
    assert!(alice.router.take_events().iter().any(|event| matches!(
        event,
        RouterEvent::MessageDelivered { message_id: id } if *id == message_id
    )));
    assert_eq!(alice.router.pending_count(), 0);
}

#[test]
fn duplicate_messages_are_dropped_by_the_seen_ring() {
    let mut alice = Endpoint::new(PropagationSelection::Auto);
    let mut bob = Endpoint::new(PropagationSelection::Auto);

    alice.adapter.learn(bob.hash(), bob.identity.as_identity());

    let message = LxmfMessage::new(alice.hash(), bob.hash(), "once", b"only once", 1.0);
    alice.router.enqueue(message).expect("queued");
    alice.router.process_outbound(&mut alice.adapter, 1);
    let sends = alice.adapter.take_sends();

    bob.router.handle_inbound(&sends[0].1, &mut bob.adapter).expect("first copy");
    assert_eq!(
        bob.router.handle_inbound(&sends[0].1, &mut bob.adapter),
        Err(LxmfError::Duplicate)
    );

    let received = bob
        .router
        .take_events()
        .into_iter()
        .filter(|event| matches!(event, RouterEvent::MessageReceived { .. }))
        .count();
    assert_eq!(received, 1);
}

#[test]
fn unknown_source_is_delivered_unverified() {
    let mut alice = Endpoint::new(PropagationSelection::Auto);
    let mut bob = Endpoint::new(PropagationSelection::Auto);

    alice.adapter.learn(bob.hash(), bob.identity.as_identity());

    let message = LxmfMessage::new(alice.hash(), bob.hash(), "hi", b"stranger", 1.0);
    alice.router.enqueue(message).expect("queued");
    alice.router.process_outbound(&mut alice.adapter, 1);
    let sends = alice.adapter.take_sends();

    // Bob never heard Alice's announce.
    bob.router.handle_inbound(&sends[0].1, &mut bob.adapter).expect("accepted");
    assert!(bob.router.take_events().iter().any(|event| matches!(
        event,
        RouterEvent::MessageReceived { verified: false, .. }
    )));
}

#[test]
fn outbound_ring_is_bounded() {
    let mut alice = Endpoint::new(PropagationSelection::Auto);
    let destination = AddressHash::new_from_slice(b"somewhere");

    for index in 0..OUTBOUND_RING {
        let message = LxmfMessage::new(
            alice.hash(),
            destination,
            "bulk",
            format!("message {index}").as_bytes(),
            index as f64,
        );
        alice.router.enqueue(message).expect("slot");
    }

    let overflow = LxmfMessage::new(alice.hash(), destination, "bulk", b"overflow", 99.0);
    assert_eq!(alice.router.enqueue(overflow), Err(LxmfError::PoolExhausted));
}

#[test]
fn propagation_fallback_stores_and_delivers_on_sync() {
    // N1 targets N3 through N2, a propagation node; N3 is offline.
    let node_hash = AddressHash::new_from_slice(b"propagation node");
    let mut alice = Endpoint::new(PropagationSelection::Pinned(node_hash));
    let mut node = Endpoint::new(PropagationSelection::Auto);
    let mut carol = Endpoint::new(PropagationSelection::Auto);
    let mut store = MemoryStorage::new();

    carol.adapter.learn(alice.hash(), alice.identity.as_identity());

    let message =
        LxmfMessage::new(alice.hash(), carol.hash(), "later", b"store and forward", 100.0);
    let message_id = alice.router.enqueue(message).expect("queued");

    // Alice cannot reach Carol; the message goes to the node instead.
    alice.router.process_outbound(&mut alice.adapter, 100);
    let sends = alice.adapter.take_sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, node_hash);
    assert!(alice.router.take_events().iter().any(|event| matches!(
        event,
        RouterEvent::MessagePropagated { node, .. } if *node == node_hash
    )));

    // The node stores it for Carol.
    assert!(node
        .router
        .handle_propagation_envelope(&sends[0].1, &mut store)
        .expect("stored"));
    assert_eq!(queued_count(&store, &carol.hash()).expect("count"), 1);

    // The sender's slot stays pending while the message rests at the node.
    alice.router.process_outbound(&mut alice.adapter, 10_000);
    assert_eq!(alice.router.pending_count(), 1);
    assert!(!alice
        .router
        .take_events()
        .iter()
        .any(|event| matches!(event, RouterEvent::MessageFailed { .. })));

    // Carol comes online and syncs her queue.
    let queued = node.router.sync_queue_for(&carol.hash(), &mut store).expect("synced");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued_count(&store, &carol.hash()).expect("count"), 0);

    carol.router.handle_inbound(&queued[0], &mut carol.adapter).expect("delivered");
    assert!(carol.router.take_events().iter().any(|event| matches!(
        event,
        RouterEvent::MessageReceived { message, verified: true }
            if message.content == b"store and forward"
    )));

    // Carol's proof reaches Alice and concludes the transfer.
    let proofs = carol.adapter.take_sends();
    assert_eq!(proofs.len(), 1);
    alice.adapter.learn(carol.hash(), carol.identity.as_identity());
    alice.router.handle_inbound(&proofs[0].1, &mut alice.adapter).expect("proof accepted");

    assert!(alice.router.take_events().iter().any(|event| matches!(
        event,
        RouterEvent::MessageDelivered { message_id: id } if *id == message_id
    )));
    assert_eq!(alice.router.pending_count(), 0);
}
