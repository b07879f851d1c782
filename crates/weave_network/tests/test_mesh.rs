use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use weave_network::payload::chat_text;
use weave_network::{
    Message, MessageKind, NetworkConfig, NetworkError, NodeIdentity, PeerId, SharedPage,
    WeaveNode, listener, on_kind,
};

const WAIT: Duration = Duration::from_secs(5);

async fn started(name: &str) -> WeaveNode {
    started_with(name, NetworkConfig::local()).await
}

async fn started_with(name: &str, config: NetworkConfig) -> WeaveNode {
    let node = WeaveNode::new(NodeIdentity::generate(name), config);
    node.start().await.unwrap();
    node
}

fn port(node: &WeaveNode) -> u16 {
    node.local_addr().unwrap().port()
}

/// Collects every message a node's listeners see.
fn record(node: &WeaveNode) -> Arc<Mutex<Vec<Message>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    node.add_message_listener(listener(move |m| {
        sink.lock().push(m.clone());
        Ok(())
    }));
    seen
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_two_nodes_connect_and_chat() {
    let a = started("alice").await;
    let b = started("bob").await;
    let b_seen = record(&b);

    assert!(b.connect_to_peer("127.0.0.1", port(&a)).await);
    wait_until(|| a.peer(b.node_id()).is_some()).await;

    let a_view: Vec<PeerId> = a.connected_peers().into_iter().map(|p| p.peer_id).collect();
    let b_view: Vec<PeerId> = b.connected_peers().into_iter().map(|p| p.peer_id).collect();
    assert_eq!(a_view, vec![b.node_id().clone()]);
    assert_eq!(b_view, vec![a.node_id().clone()]);

    let sent = a.broadcast(&Message::chat(a.identity(), "hi")).await.unwrap();
    assert_eq!(sent, 1);

    wait_until(|| b_seen.lock().iter().any(|m| m.kind() == MessageKind::ChatMessage)).await;
    let seen = b_seen.lock().clone();
    let chat = seen
        .iter()
        .find(|m| m.kind() == MessageKind::ChatMessage)
        .unwrap();
    assert_eq!(chat.sender_id, *a.node_id());
    assert_eq!(chat.sender_name, "alice");
    assert_eq!(chat_text(chat), Some("hi"));

    // Alice's CONNECT acknowledgment was delivered before her chat.
    assert_eq!(seen[0].kind(), MessageKind::Connect);
    assert_eq!(seen[0].sender_id, *a.node_id());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_unicast_reaches_only_target() {
    let hub = started("hub").await;
    let x = started("x").await;
    let y = started("y").await;
    let x_seen = record(&x);
    let y_seen = record(&y);

    assert!(x.connect_to_peer("127.0.0.1", port(&hub)).await);
    assert!(y.connect_to_peer("127.0.0.1", port(&hub)).await);
    wait_until(|| hub.peer_count() == 2).await;

    let page = SharedPage::new("https://example.com", "Example")
        .into_message(hub.identity())
        .unwrap();
    assert!(hub.send_to_peer(x.node_id(), &page).await.unwrap());

    wait_until(|| x_seen.lock().iter().any(|m| m.kind() == MessageKind::SharePage)).await;
    let received = x_seen
        .lock()
        .iter()
        .find(|m| m.kind() == MessageKind::SharePage)
        .cloned()
        .unwrap();
    assert_eq!(received.payload_as::<SharedPage>().unwrap().url, "https://example.com");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(y_seen.lock().iter().all(|m| m.kind() != MessageKind::SharePage));

    for node in [&hub, &x, &y] {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_stop_notifies_peers() {
    let a = started("leaver").await;
    let b = started("stayer").await;
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&disconnects);
    b.add_message_listener(on_kind(MessageKind::Disconnect, move |m| {
        sink.lock().push(m.sender_id.clone());
        Ok(())
    }));

    assert!(b.connect_to_peer("127.0.0.1", port(&a)).await);
    wait_until(|| a.peer_count() == 1).await;

    a.stop().await;
    assert!(a.connected_peers().is_empty());

    wait_until(|| b.connected_peers().is_empty()).await;
    wait_until(|| disconnects.lock().len() == 1).await;
    assert_eq!(disconnects.lock()[0], *a.node_id());

    b.stop().await;
}

#[tokio::test]
async fn test_restart_after_stop_is_refused() {
    let node = started("once").await;
    node.stop().await;
    assert!(!node.is_running());
    assert!(matches!(node.start().await, Err(NetworkError::Stopped)));
}

#[tokio::test]
async fn test_bind_conflict_reports_address() {
    let first = started("first").await;
    let taken = first.local_addr().unwrap();

    let mut config = NetworkConfig::local();
    config.listen_addr = taken;
    let second = WeaveNode::new(NodeIdentity::generate("second"), config);

    match second.start().await {
        Err(NetworkError::Bind { addr, .. }) => assert_eq!(addr, taken),
        other => panic!("expected bind error, got {other:?}"),
    }
    first.stop().await;
}

#[tokio::test]
async fn test_silent_peer_evicted_by_liveness() {
    let mut config = NetworkConfig::local();
    config.liveness_interval = Duration::from_millis(50);
    config.peer_timeout = Duration::from_millis(200);
    let strict = started_with("strict", config).await;
    let quiet = started("quiet").await;

    assert!(quiet.connect_to_peer("127.0.0.1", port(&strict)).await);
    wait_until(|| strict.peer_count() == 1).await;

    // No traffic: the strict node drops quiet, whose reader then sees the close.
    wait_until(|| strict.peer_count() == 0).await;
    wait_until(|| quiet.peer_count() == 0).await;

    strict.stop().await;
    quiet.stop().await;
}

#[tokio::test]
async fn test_traffic_keeps_peer_alive() {
    let mut config = NetworkConfig::local();
    config.liveness_interval = Duration::from_millis(50);
    config.peer_timeout = Duration::from_millis(300);
    let strict = started_with("strict", config).await;
    let chatty = started("chatty").await;

    assert!(chatty.connect_to_peer("127.0.0.1", port(&strict)).await);
    wait_until(|| strict.peer_count() == 1).await;

    for i in 0..8 {
        chatty
            .broadcast(&Message::chat(chatty.identity(), format!("ping {i}")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(strict.peer(chatty.node_id()).is_some());

    strict.stop().await;
    chatty.stop().await;
}
