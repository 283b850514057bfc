use bytes::Bytes;
use serde_json::json;
use tavern_core::AssetId;
use tavern_services::StoreError;

use crate::*;

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<u8>>().into()
}

#[tokio::test]
async fn missing_asset_is_fetched_from_host_in_chunks() {
    let host = start_host(test_config()).await;
    // Four default-sized chunks and a partial one.
    let data = payload(140_000);
    let id = host.host.store().put("dungeon.png", data.clone()).id();

    let bob = TestClient::player(&host, "Bob").await;
    assert!(!bob.ctx().store().contains(&id));

    let asset = bob
        .ctx()
        .request_asset(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(asset.id(), id);
    assert_eq!(asset.name(), "dungeon.png");
    assert_eq!(asset.bytes(), &data);
    assert!(bob.ctx().store().contains(&id));
    assert!(bob.ctx().transfers().consumers().is_empty());
}

#[tokio::test]
async fn concurrent_requests_all_complete() {
    let host = start_host(test_config()).await;
    let ids: Vec<AssetId> = (0..3)
        .map(|i| host.host.store().put(format!("tile-{i}.png"), payload(50_000 + i)).id())
        .collect();

    let bob = TestClient::player(&host, "Bob").await;
    let ctx = bob.ctx().clone();
    let fetches = ids.iter().map(|id| {
        let ctx = ctx.clone();
        let id = *id;
        tokio::spawn(async move { ctx.request_asset(id, Duration::from_secs(5)).await })
    });
    let handles: Vec<_> = fetches.collect();
    for (handle, id) in handles.into_iter().zip(&ids) {
        let asset = handle.await.unwrap().unwrap();
        assert_eq!(asset.id(), *id);
    }
}

#[tokio::test]
async fn unknown_asset_times_out() {
    let host = start_host(test_config()).await;
    let bob = TestClient::player(&host, "Bob").await;
    let id = AssetId::of(b"nobody has this");

    let err = bob
        .ctx()
        .request_asset(id, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Timeout(id));
    assert_eq!(bob.ctx().store().pending_waiters(&id), 0);
}

#[tokio::test]
async fn published_asset_reaches_host_and_peers() {
    let host = start_host(test_config()).await;
    let alice = TestClient::gm(&host, "Alice").await;
    let bob = TestClient::player(&host, "Bob").await;

    let asset = alice.ctx().publish_asset("handout.txt", Bytes::from_static(b"the key is under the mat"));
    let id = asset.id();

    assert!(wait_until(Duration::from_secs(5), || host.host.store().contains(&id)).await);
    assert!(wait_until(Duration::from_secs(5), || bob.ctx().store().contains(&id)).await);
}

#[tokio::test]
async fn large_published_asset_is_streamed_to_host_and_peers() {
    let mut config = test_config();
    config.transfer.bulk_rate_bytes_per_sec = 0;
    let host = start_host(config.clone()).await;

    let alice = TestClient::with_config("Alice", Role::Gm, GM_PASSWORD, config.clone());
    alice.lifecycle.connect(&host.address()).await.unwrap();
    host.wait_for_player("Alice").await;
    let bob = TestClient::with_config("Bob", Role::Player, PLAYER_PASSWORD, config);
    bob.lifecycle.connect(&host.address()).await.unwrap();
    host.wait_for_player("Bob").await;

    // Bigger than one frame can carry, even before any encoding overhead.
    let data = payload(9 * 1024 * 1024);
    let id = alice.ctx().publish_asset("world-map.png", data.clone()).id();

    // Commands are not stuck behind the upload.
    alice.ctx().send(CommandTag::Message, vec![json!("still here")]);
    bob.wait_for(CommandTag::Message, 1).await;

    assert!(
        wait_until(Duration::from_secs(30), || host.host.store().contains(&id)).await,
        "host never stored the uploaded asset"
    );
    assert!(
        wait_until(Duration::from_secs(30), || bob.ctx().store().contains(&id)).await,
        "peer never received the uploaded asset"
    );
    assert_eq!(bob.ctx().store().get(&id).unwrap().bytes(), &data);
    assert_eq!(host.host.store().get(&id).unwrap().name(), "world-map.png");
    assert!(bob.ctx().transfers().consumers().is_empty());
}

#[tokio::test]
async fn get_async_callback_fires_when_asset_arrives() {
    let host = start_host(test_config()).await;
    let id = host.host.store().put("portrait.png", payload(10_000)).id();
    let bob = TestClient::player(&host, "Bob").await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    bob.ctx().store().get_async(id, move |asset| {
        let _ = tx.send(asset.len());
    });
    bob.ctx()
        .send(tavern_core::CommandTag::GetAsset, vec![serde_json::json!(id)]);

    let len = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(len, 10_000);
}
