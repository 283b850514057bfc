use serde_json::json;
use tavern_core::{Command, CommandTag, Role, ServerPolicy};
use tavern_services::SessionMode;

use crate::*;

#[tokio::test]
async fn roster_is_announced_on_join_and_leave() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let bob = TestClient::player(&host, "Bob").await;

    let seen_by_bob = bob.wait_for(CommandTag::PlayerConnected, 2).await;
    let names: Vec<String> = seen_by_bob.iter().map(|c| c.param(0).unwrap()).collect();
    assert_eq!(names, vec!["Alice", "Bob"]);
    assert_eq!(seen_by_bob[0].param::<Role>(1).unwrap(), Role::Gm);

    let seen_by_alice = alice.wait_for(CommandTag::PlayerConnected, 2).await;
    assert_eq!(seen_by_alice[1].param::<String>(0).unwrap(), "Bob");

    bob.lifecycle.disconnect().await;
    let gone = alice.wait_for(CommandTag::PlayerDisconnected, 1).await;
    assert_eq!(gone[0].param::<String>(0).unwrap(), "Bob");
}

#[tokio::test]
async fn commands_reach_others_in_order_but_not_sender() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let bob = TestClient::player(&host, "Bob").await;
    let carol = TestClient::player(&host, "Carol").await;

    for i in 0..50 {
        assert!(alice.ctx().send(CommandTag::Message, vec![json!(i)]));
    }

    for client in [&bob, &carol] {
        let got = client.wait_for(CommandTag::Message, 50).await;
        let order: Vec<i64> = got.iter().map(|c| c.param(0).unwrap()).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice.received_tag(CommandTag::Message).is_empty());
}

#[tokio::test]
async fn campaign_snapshot_is_kept_for_late_joiners() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let snapshot = json!({"zones": ["Cellar", "Tower"]});

    alice.ctx().send(CommandTag::SetCampaign, vec![snapshot.clone()]);
    assert!(wait_until(Duration::from_secs(5), || host.host.campaign().is_some()).await);
    assert_eq!(host.host.campaign().unwrap(), snapshot);

    let dave = TestClient::player(&host, "Dave").await;
    let got = dave.wait_for(CommandTag::SetCampaign, 1).await;
    assert_eq!(got[0].params, vec![snapshot]);
}

#[tokio::test]
async fn joiners_during_campaign_updates_end_on_the_latest_snapshot() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;

    let gm = alice.ctx().clone();
    let updates = tokio::spawn(async move {
        for round in 0..300 {
            gm.send(CommandTag::SetCampaign, vec![json!({ "round": round })]);
            tokio::task::yield_now().await;
        }
    });
    let mut players = Vec::new();
    for name in ["Bob", "Carol", "Dave", "Erin"] {
        players.push(TestClient::player(&host, name).await);
    }
    updates.await.unwrap();

    let latest = json!({ "round": 299 });
    assert!(wait_until(Duration::from_secs(5), || host.host.campaign() == Some(latest.clone())).await);
    for player in &players {
        let last_snapshot = || {
            player
                .received_tag(CommandTag::SetCampaign)
                .last()
                .map(|c| c.params.clone())
        };
        let settled = wait_until(Duration::from_secs(5), || {
            last_snapshot() == Some(vec![latest.clone()])
        })
        .await;
        assert!(settled, "player ended on {:?}", last_snapshot());
    }
}

#[tokio::test]
async fn only_the_gm_changes_policy() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let bob = TestClient::player(&host, "Bob").await;

    let sneaky = ServerPolicy {
        players_can_reveal_vision: true,
        ..Default::default()
    };
    bob.ctx().send(CommandTag::SetServerPolicy, vec![json!(sneaky)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!host.host.policy().players_can_reveal_vision);

    let locked = ServerPolicy {
        movement_locked: true,
        ..Default::default()
    };
    alice.ctx().send(CommandTag::SetServerPolicy, vec![json!(locked)]);
    assert!(wait_until(Duration::from_secs(5), || bob.ctx().policy().movement_locked).await);
    assert!(wait_until(Duration::from_secs(5), || alice.ctx().policy().movement_locked).await);
    assert!(host.host.policy().movement_locked);
}

#[tokio::test]
async fn gm_can_boot_a_player() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let bob = TestClient::player(&host, "Bob").await;

    alice.ctx().send(CommandTag::BootPlayer, vec![json!("bob")]);

    let mut mode = bob.lifecycle.subscribe_mode();
    tokio::time::timeout(
        Duration::from_secs(5),
        mode.wait_for(|m| *m == SessionMode::Standalone),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(bob.replica.standalones.load(Ordering::SeqCst), 1);
    assert!(wait_until(Duration::from_secs(5), || host.host.players().len() == 1).await);
}

#[tokio::test]
async fn heartbeat_is_not_relayed() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let bob = TestClient::player(&host, "Bob").await;

    alice.ctx().send(CommandTag::Heartbeat, vec![]);
    alice.ctx().send(CommandTag::PutToken, vec![json!("Goblin")]);

    let tokens = bob.wait_for(CommandTag::PutToken, 1).await;
    assert_eq!(tokens[0], Command::new(CommandTag::PutToken, vec![json!("Goblin")]));
    // Sent before the token, so it would have arrived first if relayed.
    assert!(bob.received_tag(CommandTag::Heartbeat).is_empty());
}

#[tokio::test]
async fn coalesced_drag_sends_only_final_position() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let bob = TestClient::player(&host, "Bob").await;

    for step in 0..20 {
        alice
            .ctx()
            .coalescer()
            .enqueue(CommandTag::UpdateTokenMove, vec![json!("Orc"), json!(step), json!(step)]);
    }
    alice.ctx().coalescer().flush();

    let got = bob.wait_for(CommandTag::UpdateTokenMove, 1).await;
    assert_eq!(got[0].params, vec![json!("Orc"), json!(19), json!(19)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.received_tag(CommandTag::UpdateTokenMove).len(), 1);
}

#[tokio::test]
async fn coalescer_ticker_sends_without_flush() {
    let mut config = test_config();
    config.coalescer.interval_ms = 20;
    let host = start_host(test_config()).await;
    let alice = TestClient::with_config("Alice", Role::Gm, GM_PASSWORD, config);
    alice.lifecycle.connect(&host.address()).await.unwrap();
    host.wait_for_player("Alice").await;
    let bob = TestClient::player(&host, "Bob").await;

    alice
        .ctx()
        .coalescer()
        .enqueue(CommandTag::UpdateTokenMove, vec![json!("Orc"), json!(3), json!(4)]);
    let got = bob.wait_for(CommandTag::UpdateTokenMove, 1).await;
    assert_eq!(got[0].params[1], json!(3));
}
