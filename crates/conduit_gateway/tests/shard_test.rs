//! Shard manager against an in-memory gateway.

mod test_utils;

use conduit_error::GatewayErrorKind;
use conduit_gateway::{SessionPhase, ShardManager};
use serde_json::json;
use std::time::Duration;
use test_utils::{credentials, mock_gateway, test_config};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_shards_identify_in_order_with_spacing() {
    let (connector, mut gateway) = mock_gateway();
    let mut config = test_config();
    config.identify_interval_ms = 5_000;
    let manager = std::sync::Arc::new(ShardManager::new(config, 2, connector).expect("manager"));

    let connecting = {
        let manager = std::sync::Arc::clone(&manager);
        tokio::spawn(async move { manager.connect_all(&credentials()).await })
    };

    let mut first = gateway.accept().await;
    first.hello(45_000);
    let identify = first.expect_op(2).await;
    let first_at = Instant::now();
    assert_eq!(identify["d"]["shard"], json!([0, 2]));
    first.ready("s0", 1);

    let mut second = gateway.accept().await;
    second.hello(45_000);
    let identify = second.expect_op(2).await;
    assert_eq!(identify["d"]["shard"], json!([1, 2]));
    assert!(Instant::now() - first_at >= Duration::from_secs(5));
    second.ready("s1", 1);

    connecting.await.expect("task").expect("all shards connect");
    assert_eq!(
        manager.statuses(),
        vec![(0, SessionPhase::Connected), (1, SessionPhase::Connected)]
    );
    assert_eq!(
        manager.shard(1).and_then(|s| s.session_id()).as_deref(),
        Some("s1")
    );

    manager.disconnect_all().await.expect("disconnect");
    assert_eq!(first.expect_close().await, Some(1000));
    assert_eq!(second.expect_close().await, Some(1000));
    assert_eq!(
        manager.statuses(),
        vec![(0, SessionPhase::Disconnected), (1, SessionPhase::Disconnected)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_events_from_every_shard_share_registry() {
    let (connector, mut gateway) = mock_gateway();
    let manager = std::sync::Arc::new(ShardManager::new(test_config(), 2, connector).expect("manager"));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager.events().on("GUILD_CREATE", move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(*event.shard());
        }
    });

    let connecting = {
        let manager = std::sync::Arc::clone(&manager);
        tokio::spawn(async move { manager.connect_all(&credentials()).await })
    };
    let mut conns = Vec::new();
    for session_id in ["a", "b"] {
        let mut conn = gateway.accept().await;
        conn.hello(45_000);
        conn.expect_op(2).await;
        conn.ready(session_id, 1);
        conns.push(conn);
    }
    connecting.await.expect("task").expect("connected");

    conns[1].dispatch("GUILD_CREATE", 2, json!({"id": "1"}));
    conns[0].dispatch("GUILD_CREATE", 2, json!({"id": "2"}));
    let mut shards = vec![
        rx.recv().await.expect("first"),
        rx.recv().await.expect("second"),
    ];
    shards.sort();
    assert_eq!(shards, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_guild_routing_and_empty_disconnect() {
    let (connector, _gateway) = mock_gateway();
    let manager = ShardManager::new(test_config(), 4, connector.clone()).expect("manager");
    assert_eq!(manager.len(), 4);
    assert_eq!(manager.shard_for_guild(3 << 22).shard().index, 3);
    assert!(manager.shard(4).is_none());

    // Nothing is running, so there is nothing to fail.
    manager.disconnect_all().await.expect("no-op");
    let err = ShardManager::new(test_config(), 0, connector).expect_err("zero shards");
    assert_eq!(*err.kind(), GatewayErrorKind::InvalidShardCount(0));
}
