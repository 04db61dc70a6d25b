use async_trait::async_trait;
use deskchat_crypto_core::EncryptionService;
use deskchat_messaging::{
    ChannelEvent, ConversationId, DeliveryState, Message, MessageId, MessageStatus, Sender,
};
use deskchat_node::messaging::{
    ChatUpdate, MessagingContext, MessagingOrchestrator, PipelineConfig, StoredHistory,
};
use deskchat_node::realtime::{
    ChannelError, ConnectionState, EventStream, LocalTransport, RealtimeChannel,
    RealtimeTransport,
};
use deskchat_node::storage::{keys, save_json, KeyValueStore, MemoryStore};
use futures::StreamExt;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn plaintext() -> PipelineConfig {
    PipelineConfig {
        encryption_enabled: false,
        ..PipelineConfig::default()
    }
}

fn context(transport: &LocalTransport) -> MessagingContext {
    MessagingContext::new(
        Arc::new(MemoryStore::new()),
        Arc::new(transport.clone()),
        "ws",
    )
}

async fn id_of(chat: &MessagingOrchestrator, content: &str) -> MessageId {
    chat.messages()
        .await
        .into_iter()
        .find(|shown| shown.message.content == content)
        .map(|shown| shown.message.id)
        .expect("message is visible")
}

/// Channel that records every publish and rejects messages whose content is
/// listed in `failing`.
struct ScriptedChannel {
    state: watch::Sender<ConnectionState>,
    published: Mutex<Vec<Message>>,
    failing: Mutex<HashSet<String>>,
}

impl ScriptedChannel {
    fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Detached);
        Arc::new(Self {
            state,
            published: Mutex::default(),
            failing: Mutex::default(),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn fail_on(&self, content: &str) {
        self.failing.lock().unwrap().insert(content.to_owned());
    }

    fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn published(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.content.clone())
            .collect()
    }
}

#[async_trait]
impl RealtimeChannel for ScriptedChannel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn publish(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        let ChannelEvent::Message { message } = event else {
            return Ok(());
        };
        self.published.lock().unwrap().push(message.clone());
        if self.failing.lock().unwrap().contains(&message.content) {
            return Err(ChannelError::Rejected("scripted failure".into()));
        }
        Ok(())
    }

    fn events(&self) -> EventStream {
        futures::stream::pending().boxed()
    }
}

struct ScriptedTransport(Arc<ScriptedChannel>);

impl RealtimeTransport for ScriptedTransport {
    fn channel(&self, _name: &str) -> Arc<dyn RealtimeChannel> {
        Arc::clone(&self.0) as Arc<dyn RealtimeChannel>
    }
}

#[tokio::test]
async fn offline_messages_reach_peer_in_order_after_reconnect() {
    let transport = LocalTransport::new();
    let encryption = Arc::new(EncryptionService::new());
    let conversation = ConversationId::new("c1");

    let customer = MessagingOrchestrator::open(
        context(&transport).with_encryption(Arc::clone(&encryption)),
        conversation.clone(),
        PipelineConfig::default(),
    )
    .await;
    let agent = MessagingOrchestrator::open(
        context(&transport).with_encryption(Arc::clone(&encryption)),
        conversation.clone(),
        PipelineConfig {
            sender: Sender::agent(Some("a1".into()), Some("Dana".into())),
            ..PipelineConfig::default()
        },
    )
    .await;
    settle().await;

    assert!(customer.send_message("first", None).await);
    assert!(customer.send_message("second", None).await);
    assert_eq!(customer.queued_messages().await.len(), 2);
    let first = id_of(&customer, "first").await;
    assert_eq!(
        customer.delivery_state(&first).await,
        Some(DeliveryState::Queued { retry_count: 0 })
    );

    transport.attach("c1");

    let customer_ref = &customer;
    wait_until(move || async move { !customer_ref.has_queued_messages().await }).await;
    let agent_ref = &agent;
    wait_until(move || async move { agent_ref.messages().await.len() == 2 }).await;

    let received: Vec<String> = agent
        .messages()
        .await
        .into_iter()
        .map(|shown| shown.message.content)
        .collect();
    assert_eq!(received, vec!["first", "second"]);
    assert!(agent
        .messages()
        .await
        .iter()
        .all(|shown| !shown.message.is_offline_origin()));

    for shown in customer.messages().await {
        assert_eq!(shown.status, MessageStatus::Sent);
    }
}

#[tokio::test]
async fn failed_drain_stops_at_first_failure_and_keeps_order() {
    let channel = ScriptedChannel::new();
    let context = MessagingContext::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedTransport(Arc::clone(&channel))),
        "ws",
    );
    let chat = MessagingOrchestrator::open(
        context,
        "c1".into(),
        PipelineConfig {
            auto_retry: false,
            ..plaintext()
        },
    )
    .await;

    for content in ["m1", "m2", "m3"] {
        assert!(chat.send_message(content, None).await);
    }
    let m1 = id_of(&chat, "m1").await;
    let m2 = id_of(&chat, "m2").await;
    let m3 = id_of(&chat, "m3").await;

    channel.fail_on("m2");
    channel.set_state(ConnectionState::Attached);

    let chat_ref = &chat;
    let m2_ref = &m2;
    wait_until(move || async move {
        matches!(
            chat_ref.delivery_state(m2_ref).await,
            Some(DeliveryState::Failed { .. })
        )
    })
    .await;

    assert_eq!(channel.published(), vec!["m1", "m2"]);
    assert_eq!(chat.delivery_state(&m1).await, Some(DeliveryState::Sent));
    assert_eq!(
        chat.delivery_state(&m2).await,
        Some(DeliveryState::Failed { retry_count: 1 })
    );
    assert_eq!(
        chat.delivery_state(&m3).await,
        Some(DeliveryState::Queued { retry_count: 0 })
    );

    let queued = chat.queued_messages().await;
    assert_eq!(
        queued.iter().map(|entry| entry.id.clone()).collect::<Vec<_>>(),
        vec![m2.clone(), m3.clone()]
    );
    assert_eq!(queued[0].retry_count, 1);

    // A message sent behind the backlog waits its turn.
    assert!(chat.send_message("m4", None).await);
    assert_eq!(channel.published(), vec!["m1", "m2"]);

    channel.recover();
    let outcome = chat.drain_queue().await;
    assert_eq!(outcome.delivered, 3);
    assert_eq!(outcome.remaining, 0);
    assert_eq!(outcome.failed, None);
    assert_eq!(channel.published(), vec!["m1", "m2", "m2", "m3", "m4"]);

    for shown in chat.messages().await {
        assert_eq!(shown.status, MessageStatus::Sent, "{}", shown.message.content);
    }
}

#[tokio::test]
async fn duplicate_inbound_messages_are_shown_once() {
    let transport = LocalTransport::new();
    transport.attach("c1");
    let chat = MessagingOrchestrator::open(context(&transport), "c1".into(), plaintext()).await;
    let mut updates = chat.subscribe_updates();
    settle().await;

    let channel = transport.channel("c1");
    let inbound = Message::new("c1".into(), Sender::agent(None, Some("Dana".into())), "hi there");
    let mut replay = inbound.clone();
    replay.mark_offline_origin();
    let elsewhere = Message::new("c2".into(), Sender::agent(None, None), "wrong room");

    for event in [inbound.clone(), inbound.clone(), replay, elsewhere] {
        channel
            .publish(ChannelEvent::Message { message: event })
            .await
            .unwrap();
    }

    let chat_ref = &chat;
    wait_until(move || async move { chat_ref.total_messages().await >= 1 }).await;
    settle().await;

    let messages = chat.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message.id, inbound.id);
    assert_eq!(messages[0].status, MessageStatus::Sent);

    let mut added = 0;
    while let Ok(update) = updates.try_recv() {
        if matches!(update, ChatUpdate::MessageAdded(_)) {
            added += 1;
        }
    }
    assert_eq!(added, 1);
}

#[tokio::test]
async fn history_pages_back_twenty_at_a_time() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let messages: Vec<Message> = (0..45)
        .map(|i| {
            let mut message = Message::new("c1".into(), Sender::default(), format!("m{i}"));
            message.timestamp = 1_000 + i;
            message
        })
        .collect();
    save_json(
        store.as_ref(),
        &keys::messages("c1"),
        &StoredHistory {
            messages,
            last_updated: 2_000,
        },
    )
    .unwrap();

    let context = MessagingContext::new(store, Arc::new(LocalTransport::new()), "ws");
    let chat = MessagingOrchestrator::open(context, "c1".into(), plaintext()).await;

    let visible = chat.messages().await;
    assert_eq!(visible.len(), 20);
    assert_eq!(visible[0].message.content, "m25");
    assert_eq!(visible[19].message.content, "m44");
    assert!(chat.has_more().await);
    assert_eq!(chat.total_messages().await, 45);

    assert!(chat.load_more_messages().await);
    assert_eq!(chat.messages().await.len(), 40);
    assert!(chat.has_more().await);

    assert!(chat.load_more_messages().await);
    let visible = chat.messages().await;
    assert_eq!(visible.len(), 45);
    assert_eq!(visible[0].message.content, "m0");
    assert!(!chat.has_more().await);

    assert!(!chat.load_more_messages().await);
    assert!(!chat.is_loading().await);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_is_debounced_across_peers() {
    let transport = LocalTransport::new();
    transport.attach("c1");
    let customer = MessagingOrchestrator::open(context(&transport), "c1".into(), plaintext()).await;
    let agent = MessagingOrchestrator::open(context(&transport), "c1".into(), plaintext()).await;
    settle().await;

    let customer_id = customer.typing_user_id().to_owned();
    assert_ne!(customer_id, agent.typing_user_id());

    customer.handle_input_change("h").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    customer.handle_input_change("he").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(agent.is_user_typing(&customer_id));
    assert!(!customer.is_user_typing(&customer_id));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(agent.is_user_typing(&customer_id));

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(!agent.is_user_typing(&customer_id));
    assert!(agent.typing_users().is_empty());
}

#[tokio::test]
async fn encrypted_messages_travel_sealed() {
    let transport = LocalTransport::new();
    transport.attach("c1");
    let encryption = Arc::new(EncryptionService::new());

    let sender_store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let sender_context = MessagingContext::new(
        Arc::clone(&sender_store),
        Arc::new(transport.clone()),
        "ws",
    )
    .with_encryption(Arc::clone(&encryption));
    let sender =
        MessagingOrchestrator::open(sender_context, "c1".into(), PipelineConfig::default()).await;
    let receiver = MessagingOrchestrator::open(
        context(&transport).with_encryption(Arc::clone(&encryption)),
        "c1".into(),
        PipelineConfig::default(),
    )
    .await;
    settle().await;

    let mut wire = transport.channel("c1").events();
    assert!(sender.send_message("card ends 4242", None).await);

    match wire.next().await {
        Some(ChannelEvent::Message { message }) => {
            assert!(message.content.is_empty());
            assert!(message.is_encrypted());
        }
        other => panic!("unexpected event {other:?}"),
    }

    let receiver_ref = &receiver;
    wait_until(move || async move { receiver_ref.total_messages().await == 1 }).await;
    assert_eq!(receiver.messages().await[0].message.content, "card ends 4242");

    let raw = sender_store.get(&keys::messages("c1")).unwrap().unwrap();
    assert!(!raw.contains("4242"));
    let listed = sender_store.get(&keys::conversations("ws")).unwrap().unwrap();
    assert!(!listed.contains("4242"));

    sender.rotate_key().await.unwrap();
    assert_eq!(sender.current_key_version(), 2);
    assert_eq!(receiver.current_key_version(), 2);
}
