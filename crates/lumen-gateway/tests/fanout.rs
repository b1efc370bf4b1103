//! Fanout routing across gateway processes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use lumen_gateway::fanout::{server_topic, GLOBAL_TOPIC};
use lumen_gateway::{
    ClientBindings, ClientStorage, FanoutPlan, FanoutRouter, KeyboardEvent, MemoryStore,
    ServerRegistry, TalkEvent, TalkType,
};

const THRESHOLD: usize = 3;

fn registry(store: &Arc<MemoryStore>) -> ServerRegistry {
    ServerRegistry::new(store.clone(), Duration::from_secs(35))
}

fn router(store: &Arc<MemoryStore>) -> FanoutRouter {
    FanoutRouter::new(
        store.clone(),
        registry(store),
        ClientBindings::new(store.clone(), "A"),
        THRESHOLD,
    )
}

async fn go_live(store: &Arc<MemoryStore>, sids: &[&str]) {
    let now = chrono::Utc::now().timestamp();
    let registry = registry(store);
    for sid in sids {
        registry.set(sid, now).await.unwrap();
    }
}

async fn connect(store: &Arc<MemoryStore>, sid: &str, cid: i64, uid: i64) {
    ClientBindings::new(store.clone(), sid)
        .bind("chat", cid, uid)
        .await
        .unwrap();
}

fn private(sender_id: i64, receiver_id: i64) -> TalkEvent {
    TalkEvent {
        sender_id,
        receiver_id,
        talk_type: TalkType::Private,
        record_id: 1,
        sequence: 1,
    }
}

fn targeted(sids: &[&str]) -> FanoutPlan {
    FanoutPlan::Targeted(sids.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>())
}

#[tokio::test]
async fn test_small_cluster_uses_global_topic() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B"]).await;
    connect(&store, "B", 1, 9).await;

    let report = router(&store).publish(&private(3, 9)).await;
    assert_eq!(report.plan, FanoutPlan::Global);
    assert_eq!(report.published, 1);

    let published = store.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, GLOBAL_TOPIC);
    let frame: serde_json::Value = serde_json::from_str(&published[0].payload).unwrap();
    assert_eq!(frame["event"], "im.message");
    assert_eq!(frame["content"]["receiver_id"], 9);
}

#[tokio::test]
async fn test_large_cluster_targets_hosting_servers() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B", "C", "D", "E"]).await;
    connect(&store, "A", 1, 3).await;
    connect(&store, "C", 1, 9).await;
    connect(&store, "D", 1, 77).await;

    let report = router(&store).publish(&private(3, 9)).await;
    assert_eq!(report.plan, targeted(&["A", "C"]));
    assert_eq!(report.published, 2);
    assert_eq!(report.failed, 0);

    let topics: Vec<String> = store.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(topics, vec![server_topic("A"), server_topic("C")]);
}

#[tokio::test]
async fn test_server_hosting_both_users_is_targeted_once() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B", "C", "D"]).await;
    connect(&store, "B", 1, 3).await;
    connect(&store, "B", 2, 9).await;

    let report = router(&store).publish(&private(3, 9)).await;
    assert_eq!(report.plan, targeted(&["B"]));
    assert_eq!(store.published().len(), 1);
}

#[tokio::test]
async fn test_offline_users_publish_nothing() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B", "C", "D"]).await;

    let report = router(&store).publish(&private(3, 9)).await;
    assert_eq!(report.plan, targeted(&[]));
    assert_eq!(report.published, 0);
    assert!(store.published().is_empty());
}

#[tokio::test]
async fn test_group_messages_are_global() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B", "C", "D", "E"]).await;

    let mut event = private(3, 100);
    event.talk_type = TalkType::Group;
    let report = router(&store).publish(&event).await;
    assert_eq!(report.plan, FanoutPlan::Global);
}

#[tokio::test]
async fn test_registry_failure_falls_back_to_global() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B", "C", "D", "E"]).await;
    store.fail_keys_with_prefix("server_ids");

    let report = router(&store).publish(&private(3, 9)).await;
    assert_eq!(report.plan, FanoutPlan::Global);
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn test_binding_failure_includes_server() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B", "C", "D", "E"]).await;
    connect(&store, "A", 1, 3).await;
    store.fail_keys_with_prefix("ws:E:");

    let report = router(&store).publish(&private(3, 9)).await;
    assert_eq!(report.plan, targeted(&["A", "E"]));
}

#[tokio::test]
async fn test_publish_failure_is_reported_not_raised() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B", "C", "D", "E"]).await;
    connect(&store, "A", 1, 3).await;
    connect(&store, "C", 1, 9).await;
    store.fail_topic(server_topic("A"));

    let report = router(&store).publish(&private(3, 9)).await;
    assert_eq!(report.published, 1);
    assert_eq!(report.failed, 1);
    let topics: Vec<String> = store.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(topics, vec![server_topic("C")]);
}

#[tokio::test]
async fn test_keyboard_is_always_global() {
    let store = Arc::new(MemoryStore::recording());
    go_live(&store, &["A", "B", "C", "D", "E"]).await;

    let report = router(&store)
        .publish_keyboard(&KeyboardEvent {
            sender_id: 3,
            receiver_id: 9,
        })
        .await;
    assert_eq!(report.plan, FanoutPlan::Global);
    let published = store.published();
    assert_eq!(published[0].topic, GLOBAL_TOPIC);
    assert!(published[0].payload.contains("im.message.keyboard"));
}
