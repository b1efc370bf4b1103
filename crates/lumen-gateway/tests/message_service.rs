//! Message creation through to delivery on locally connected clients.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{mock_pair, Peer, RecordingHandler};
use lumen_gateway::{
    Client, ClientBindings, FanoutRouter, FanoutSubscriber, Hub, HubSettings, MemoryGroupDirectory,
    MemoryMessageRepository, MemoryStore, MessageService, NewMessage, SequenceGenerator,
    ServerRegistry, TalkType,
};
use tokio_util::sync::CancellationToken;

struct Cluster {
    store: Arc<MemoryStore>,
    hub: Hub,
    groups: Arc<MemoryGroupDirectory>,
    repository: Arc<MemoryMessageRepository>,
    service: MessageService,
    cancel: CancellationToken,
}

impl Cluster {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::recording());
        let bindings = ClientBindings::new(store.clone(), "A");
        let registry = ServerRegistry::new(store.clone(), Duration::from_secs(35));
        registry.set("A", chrono::Utc::now().timestamp()).await.unwrap();

        let hub = Hub::new(HubSettings::default()).with_storage(Arc::new(bindings.clone()));
        hub.channels().get_or_create("chat");
        let groups = Arc::new(MemoryGroupDirectory::new());
        let repository = Arc::new(MemoryMessageRepository::new());

        let router = Arc::new(FanoutRouter::new(store.clone(), registry, bindings, 3));
        let sequences = SequenceGenerator::new(store.clone(), Duration::from_secs(3600))
            .with_seed(repository.clone());
        let service = MessageService::new(sequences, repository.clone(), router);

        let cancel = CancellationToken::new();
        let subscriber = FanoutSubscriber::new(
            store.clone(),
            "A",
            hub.channels().clone(),
            groups.clone(),
            true,
        );
        tokio::spawn(subscriber.run(cancel.clone()));
        // let the subscription register before anything is published
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            store,
            hub,
            groups,
            repository,
            service,
            cancel,
        }
    }

    async fn connect(&self, uid: i64) -> Peer {
        let (conn, mut peer) = mock_pair();
        let channel = self.hub.channels().get_or_create("chat");
        Client::open(
            self.hub.clone(),
            conn,
            uid,
            channel,
            Arc::new(RecordingHandler::default()),
        )
        .await;
        peer.next_event("connect").await;
        peer
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test_private_message_reaches_both_participants() {
    let cluster = Cluster::start().await;
    let mut sender = cluster.connect(3).await;
    let mut receiver = cluster.connect(9).await;

    let record = cluster
        .service
        .send(NewMessage {
            sender_id: 3,
            talk_type: TalkType::Private,
            receiver_id: 9,
            body: serde_json::json!({"text": "hello"}),
        })
        .await
        .unwrap();
    assert_eq!(record.sequence, 1);
    assert_eq!(record.record_id, 1);

    for peer in [&mut sender, &mut receiver] {
        let frame = peer.next_event("im.message").await;
        assert_eq!(frame["content"]["record_id"], 1);
        assert_eq!(frame["content"]["sequence"], 1);
        assert!(frame["ack_id"].is_string());
    }
    assert_eq!(cluster.repository.saved(), 1);
}

#[tokio::test]
async fn test_group_message_reaches_members() {
    let cluster = Cluster::start().await;
    cluster.groups.set_members(100, vec![3, 9]);
    let mut member = cluster.connect(9).await;
    let mut outsider = cluster.connect(11).await;

    cluster
        .service
        .send(NewMessage {
            sender_id: 3,
            talk_type: TalkType::Group,
            receiver_id: 100,
            body: serde_json::Value::Null,
        })
        .await
        .unwrap();

    let frame = member.next_event("im.message").await;
    assert_eq!(frame["content"]["talk_type"], 2);
    outsider.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_forward_allocates_contiguous_sequences() {
    let cluster = Cluster::start().await;
    cluster
        .service
        .send(NewMessage {
            sender_id: 9,
            talk_type: TalkType::Private,
            receiver_id: 3,
            body: serde_json::Value::Null,
        })
        .await
        .unwrap();

    let records = cluster
        .service
        .forward(
            3,
            TalkType::Private,
            9,
            vec![serde_json::json!("a"), serde_json::json!("b"), serde_json::json!("c")],
        )
        .await
        .unwrap();

    let sequences: Vec<i64> = records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);
    assert_eq!(cluster.repository.saved(), 4);
}

#[tokio::test]
async fn test_keyboard_goes_to_receiver_only() {
    let cluster = Cluster::start().await;
    let mut sender = cluster.connect(3).await;
    let mut receiver = cluster.connect(9).await;

    cluster.service.keyboard(3, 9).await;

    let frame = receiver.next_event("im.message.keyboard").await;
    assert_eq!(frame["content"]["sender_id"], 3);
    assert!(frame.get("ack_id").is_none());
    sender.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_sequence_failure_creates_nothing() {
    let cluster = Cluster::start().await;
    cluster.store.fail_keys_with_prefix("im:sequence");

    let result = cluster
        .service
        .send(NewMessage {
            sender_id: 3,
            talk_type: TalkType::Private,
            receiver_id: 9,
            body: serde_json::Value::Null,
        })
        .await;

    assert!(result.is_err());
    assert_eq!(cluster.repository.saved(), 0);
    assert!(cluster.store.published().is_empty());
}
