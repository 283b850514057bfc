use tavern_core::CommandTag;
use tavern_services::{ConnectionState, SessionMode};

use crate::*;

async fn wait_for_mode(client: &TestClient, mode: SessionMode) {
    let mut rx = client.lifecycle.subscribe_mode();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|m| *m == mode))
        .await
        .expect("mode change timed out")
        .expect("mode channel closed");
}

#[tokio::test]
async fn host_going_away_falls_back_to_standalone() {
    let host = start_host(test_config()).await;
    let bob = TestClient::player(&host, "Bob").await;

    host.stop();
    wait_for_mode(&bob, SessionMode::Standalone).await;

    assert_eq!(bob.lifecycle.state(), ConnectionState::Disconnected);
    assert_eq!(bob.replica.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(bob.replica.standalones.load(Ordering::SeqCst), 1);
    // Commands after the loss are silently dropped.
    assert!(!bob.ctx().send(CommandTag::Message, vec![]));
}

#[tokio::test]
async fn deliberate_disconnect_keeps_replica() {
    let host = start_host(test_config()).await;
    let bob = TestClient::player(&host, "Bob").await;

    bob.lifecycle.disconnect().await;
    assert_eq!(bob.lifecycle.state(), ConnectionState::Disconnected);
    assert!(wait_until(Duration::from_secs(5), || host.host.players().is_empty()).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.replica.teardowns.load(Ordering::SeqCst), 0);
    assert_eq!(bob.replica.standalones.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pending_drag_is_flushed_on_disconnect() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let bob = TestClient::player(&host, "Bob").await;

    alice
        .ctx()
        .coalescer()
        .enqueue(CommandTag::UpdateTokenMove, vec![serde_json::json!("Orc"), serde_json::json!(9)]);
    alice.lifecycle.disconnect().await;

    let got = bob.wait_for(CommandTag::UpdateTokenMove, 1).await;
    assert_eq!(got[0].params[1], serde_json::json!(9));
}

#[tokio::test]
async fn client_can_rejoin_after_fallback() {
    let first = start_host(test_config()).await;
    let bob = TestClient::player(&first, "Bob").await;
    first.stop();
    wait_for_mode(&bob, SessionMode::Standalone).await;

    let second = start_host(test_config()).await;
    bob.lifecycle.connect(&second.address()).await.unwrap();
    assert_eq!(bob.lifecycle.state(), ConnectionState::Connected);
    assert!(matches!(bob.lifecycle.mode(), SessionMode::Joined { .. }));
}
