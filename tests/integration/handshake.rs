use tavern_core::{HandshakeError, Role};
use tavern_services::{ConnectionError, ConnectionState, SessionMode};

use crate::*;

#[tokio::test]
async fn accepted_join_carries_host_policy() {
    let mut config = test_config();
    config.server.policy.movement_locked = true;
    let host = start_host(config).await;

    let alice = TestClient::new("Alice", Role::Gm, GM_PASSWORD);
    let policy = alice.lifecycle.connect(&host.address()).await.unwrap();

    assert!(policy.movement_locked);
    assert!(alice.ctx().policy().movement_locked);
    assert_eq!(alice.lifecycle.state(), ConnectionState::Connected);
    assert!(matches!(alice.lifecycle.mode(), SessionMode::Joined { .. }));
    assert!(wait_until(Duration::from_secs(5), || host.host.players().len() == 1).await);
    assert_eq!(host.host.players(), vec![("Alice".to_string(), Role::Gm)]);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let host = start_host(test_config()).await;

    let mallory = TestClient::new("Mallory", Role::Gm, PLAYER_PASSWORD);
    let err = mallory.lifecycle.connect(&host.address()).await.unwrap_err();

    match err {
        ConnectionError::Handshake(HandshakeError::Rejected(message)) => {
            assert!(message.contains("password"), "unexpected message {message:?}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(mallory.lifecycle.state(), ConnectionState::Disconnected);
    assert_eq!(mallory.lifecycle.mode(), SessionMode::Standalone);
    assert!(host.host.players().is_empty());
}

#[tokio::test]
async fn duplicate_name_is_rejected_case_insensitively() {
    let host = start_host(test_config()).await;
    let _bob = TestClient::player(&host, "Bob").await;

    let impostor = TestClient::new("BOB", Role::Player, PLAYER_PASSWORD);
    let err = impostor.lifecycle.connect(&host.address()).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::Handshake(HandshakeError::Rejected(ref m)) if m.contains("already in use")
    ));
    assert_eq!(host.host.players().len(), 1);
}

#[tokio::test]
async fn name_is_free_again_after_leaving() {
    let host = start_host(test_config()).await;
    let bob = TestClient::player(&host, "Bob").await;
    bob.lifecycle.disconnect().await;
    assert!(wait_until(Duration::from_secs(5), || host.host.players().is_empty()).await);

    let again = TestClient::new("bob", Role::Player, PLAYER_PASSWORD);
    again.lifecycle.connect(&host.address()).await.unwrap();
}

#[tokio::test]
async fn unreachable_host_leaves_client_disconnected() {
    // Bind and immediately drop to get a port nobody listens on.
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let client = TestClient::new("Eve", Role::Player, PLAYER_PASSWORD);
    assert!(client
        .lifecycle
        .connect(&format!("127.0.0.1:{port}"))
        .await
        .is_err());
    assert_eq!(client.lifecycle.state(), ConnectionState::Disconnected);
    assert_eq!(client.replica.standalones.load(Ordering::SeqCst), 0);
}
