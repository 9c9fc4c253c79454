//! Dispatcher end to end over the in-process bus, a memory store and a
//! scripted transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier};
use tokio::sync::mpsc;

use neptune_protocol::crypto::{open, SealedPayload};
use neptune_protocol::{
    BusMessage, ChannelFanout, CryptoProvider, Dispatcher, DispatcherConfig, DropReason,
    InternalBus, MemoryStore, MessageBus, NodeCrypto, OutgoingMessage, ProtocolError,
    RelayOutcome,
};
use neptune_transport::mock::MockTransport;
use neptune_transport::{
    DefaultRoutingStrategy, RelayMessage, Transport, TransportEvent, TransportManager,
};

const KEY: &str = "deployment-secret";
const BOB_SEED: [u8; 32] = [9u8; 32];

struct Node {
    dispatcher: Dispatcher,
    store: Arc<MemoryStore>,
    crypto: Arc<NodeCrypto>,
    mock: Arc<MockTransport>,
    _events: mpsc::Receiver<TransportEvent>,
}

async fn node(name: &str, start_transport: bool) -> Node {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let crypto = Arc::new(NodeCrypto::from_seed([7u8; 32]));
    let store = Arc::new(MemoryStore::new());
    let (manager, events) = TransportManager::new(DefaultRoutingStrategy);
    let manager = Arc::new(manager);
    let mock = Arc::new(MockTransport::new(&format!("{name}-mock")));
    manager.add(mock.clone()).await;
    if start_transport {
        mock.start().await.unwrap();
    }

    let bus: Arc<dyn MessageBus> = Arc::new(InternalBus::named(name));
    let dispatcher = Dispatcher::new(
        DispatcherConfig::new(name, KEY).with_max_hops(5),
        crypto.clone(),
        store.clone(),
        manager,
        bus.clone(),
    )
    .unwrap();
    bus.start().await.unwrap();

    Node {
        dispatcher,
        store,
        crypto,
        mock,
        _events: events,
    }
}

fn bob_public_key() -> String {
    NodeCrypto::from_seed(BOB_SEED).public_key_hex()
}

/// Poll until `check` returns something or two seconds pass.
async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time")
}

fn relay_for(crypto: &NodeCrypto, id: &str, from: &str, to: &str, text: &str) -> RelayMessage {
    let outgoing = OutgoingMessage {
        from: from.into(),
        to: to.into(),
        message_id: id.into(),
        message: text.into(),
        source_node: "origin".into(),
        timestamp: 1_700_000_000,
    };
    let payload = crypto
        .encrypt_string(&serde_json::to_string(&outgoing).unwrap(), KEY)
        .unwrap();
    let mut relay = RelayMessage::new(id, from, to, payload);
    relay.timestamp = outgoing.timestamp;
    relay
}

#[tokio::test]
async fn local_recipient_gets_sealed_signed_record() {
    let n1 = node("node1", true).await;
    n1.store.add_user("bob", bob_public_key()).await;

    let id = n1.dispatcher.dispatch("alice@node1", "bob@node1", "hi bob").await.unwrap();

    let store = n1.store.clone();
    let record = eventually(|| {
        let store = store.clone();
        async move { store.inbox("bob@node1").await.pop() }
    })
    .await;

    assert_eq!(record.message_id, id);
    assert_eq!(record.from, "alice@node1");
    assert_eq!(record.hops, 0);
    assert!(record.route.is_empty());
    assert!(record.inbox && !record.read);

    let sealed = SealedPayload::from_hex(&record.payload).unwrap();
    assert_eq!(open(&sealed, &BOB_SEED).unwrap(), b"hi bob");

    let sig_bytes = hex::decode(&record.signature).unwrap();
    let signature = Signature::from_slice(&sig_bytes).unwrap();
    assert!(n1.crypto.verifying_key().verify(b"hi bob", &signature).is_ok());
    assert!(n1.mock.sent().is_empty());
}

#[tokio::test]
async fn remote_recipient_is_forwarded_then_delivered_downstream() {
    let n1 = node("node1", true).await;
    let id = n1.dispatcher.dispatch("alice@node1", "bob@node2", "over the wire").await.unwrap();

    let mock = n1.mock.clone();
    let envelope = eventually(|| {
        let mock = mock.clone();
        async move { mock.sent().pop() }
    })
    .await;

    let relay = RelayMessage::from_envelope(&envelope).unwrap();
    assert_eq!(relay.id, id);
    assert_eq!(relay.to, "bob@node2");
    assert_eq!(relay.hops, 1);
    assert_eq!(relay.max_hops, 5);
    assert_eq!(relay.history.len(), 1);
    assert!(relay.has_visited("node1"));

    let n2 = node("node2", true).await;
    n2.store.add_user("bob", bob_public_key()).await;
    let outcome = n2.dispatcher.on_transport_message(&envelope).await.unwrap();
    assert!(matches!(outcome, RelayOutcome::Delivered { .. }));

    let inbox = n2.store.inbox("bob@node2").await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].hops, 0);
    assert_eq!(inbox[0].route, vec!["node1".to_string()]);
    let sealed = SealedPayload::from_hex(&inbox[0].payload).unwrap();
    assert_eq!(open(&sealed, &BOB_SEED).unwrap(), b"over the wire");
}

#[tokio::test]
async fn intermediate_node_extends_history() {
    let mid = node("mid", true).await;
    let mut relay = relay_for(&mid.crypto, "m-chain", "alice@a", "bob@z", "x");
    relay.hops = 2;
    relay.history = vec!["a:1".into(), "b:2".into()];

    let outcome = mid.dispatcher.on_transport_message(&relay.to_envelope()).await.unwrap();
    assert_eq!(outcome, RelayOutcome::Forwarded { node: "z".into(), hops: 3 });

    let sent = RelayMessage::from_envelope(&mid.mock.sent()[0]).unwrap();
    assert_eq!(sent.hops, 3);
    assert_eq!(sent.history.len(), 3);
    assert_eq!(sent.visited().collect::<Vec<_>>(), vec!["a", "b", "mid"]);
    assert_eq!(sent.payload, relay.payload);
}

#[tokio::test]
async fn hop_ceiling_and_loops_are_dropped() {
    let mid = node("mid", true).await;

    let mut spent = relay_for(&mid.crypto, "m-spent", "alice@a", "bob@z", "x");
    spent.hops = spent.max_hops;
    assert_eq!(
        mid.dispatcher.on_transport_message(&spent.to_envelope()).await.unwrap(),
        RelayOutcome::Dropped(DropReason::HopLimit { hops: 5, max_hops: 5 })
    );

    let mut looped = relay_for(&mid.crypto, "m-loop", "alice@a", "bob@z", "x");
    looped.hops = 2;
    looped.history = vec!["mid:1".into(), "b:2".into()];
    assert_eq!(
        mid.dispatcher.on_transport_message(&looped.to_envelope()).await.unwrap(),
        RelayOutcome::Dropped(DropReason::Loop)
    );

    assert!(mid.mock.sent().is_empty());
}

#[tokio::test]
async fn repeated_message_is_dropped_once_seen() {
    let mid = node("mid", true).await;
    let envelope = relay_for(&mid.crypto, "m-dup", "alice@a", "bob@z", "x").to_envelope();

    assert!(matches!(
        mid.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Forwarded { .. }
    ));
    assert_eq!(
        mid.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Dropped(DropReason::Duplicate)
    );
    assert_eq!(mid.mock.sent().len(), 1);
}

#[tokio::test]
async fn no_active_transport_is_undeliverable() {
    let n1 = node("node1", false).await;
    let envelope = relay_for(&n1.crypto, "m-stuck", "alice@node1", "bob@node2", "x").to_envelope();
    assert_eq!(
        n1.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Dropped(DropReason::Undeliverable)
    );
}

#[tokio::test]
async fn undeliverable_message_can_be_retried() {
    let n1 = node("node1", false).await;
    let envelope =
        relay_for(&n1.crypto, "m-retry", "alice@node1", "bob@node2", "x").to_envelope();
    assert_eq!(
        n1.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Dropped(DropReason::Undeliverable)
    );

    n1.mock.start().await.unwrap();
    assert_eq!(
        n1.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Forwarded { node: "node2".into(), hops: 1 }
    );
    assert_eq!(
        n1.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Dropped(DropReason::Duplicate)
    );
    assert_eq!(n1.mock.sent().len(), 1);
}

#[tokio::test]
async fn recipient_added_later_receives_the_retry() {
    let n1 = node("node1", true).await;
    let envelope = relay_for(&n1.crypto, "m-late", "alice@a", "bob@node1", "x").to_envelope();
    assert_eq!(
        n1.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Dropped(DropReason::UnknownRecipient)
    );

    n1.store.add_user("bob", bob_public_key()).await;
    assert!(matches!(
        n1.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Delivered { .. }
    ));
    assert_eq!(n1.store.inbox("bob@node1").await.len(), 1);
}

#[tokio::test]
async fn looped_message_stays_dropped() {
    let mid = node("mid", true).await;
    let mut looped = relay_for(&mid.crypto, "m-loop-again", "alice@a", "bob@z", "x");
    looped.history = vec!["mid:1".into()];
    looped.hops = 1;
    let envelope = looped.to_envelope();
    assert_eq!(
        mid.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Dropped(DropReason::Loop)
    );
    assert_eq!(
        mid.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Dropped(DropReason::Duplicate)
    );
}

#[tokio::test]
async fn unknown_local_user_is_dropped() {
    let n1 = node("node1", true).await;
    let envelope = relay_for(&n1.crypto, "m-ghost", "alice@a", "ghost@node1", "x").to_envelope();
    assert_eq!(
        n1.dispatcher.on_transport_message(&envelope).await.unwrap(),
        RelayOutcome::Dropped(DropReason::UnknownRecipient)
    );
    assert!(n1.store.inbox("ghost@node1").await.is_empty());
}

struct Recorder(Mutex<Vec<(String, String)>>);

#[async_trait]
impl ChannelFanout for Recorder {
    async fn fan_out(&self, channel: &str, message: &OutgoingMessage) -> Result<(), ProtocolError> {
        self.0.lock().unwrap().push((channel.to_owned(), message.message.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn channel_traffic_goes_to_fanout() {
    let n1 = node("node1", true).await;
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    n1.dispatcher.set_fanout(recorder.clone());

    n1.dispatcher.dispatch("alice@node1", "#general", "hello all").await.unwrap();
    let seen = eventually(|| {
        let recorder = recorder.clone();
        async move { recorder.0.lock().unwrap().first().cloned() }
    })
    .await;
    assert_eq!(seen, ("#general".to_string(), "hello all".to_string()));
    assert!(n1.mock.sent().is_empty());
}

#[tokio::test]
async fn garbage_on_the_bus_is_dropped() {
    let n1 = node("node1", true).await;
    let outcome = n1
        .dispatcher
        .on_relayed(BusMessage {
            message_id: "m".into(),
            source_node: "elsewhere".into(),
            payload: "not transit ciphertext".into(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, RelayOutcome::Dropped(DropReason::Malformed(_))));
}

#[tokio::test]
async fn bad_addresses_are_rejected_before_publish() {
    let n1 = node("node1", true).await;
    for (from, to) in [
        ("alice", "bob@node1"),
        ("alice@node1", "bob"),
        ("alice@node1", "@node1"),
        ("alice@node1", "#no spaces"),
    ] {
        let err = n1.dispatcher.dispatch(from, to, "x").await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument(_)), "{from} -> {to}");
    }
}
