//! End-to-end messaging tests over the in-memory broker.
//!
//! Producers and receivers share one [`InMemoryBroker`], so every scenario
//! runs the real send path, offset negotiation, and dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use proto_messaging::codec::{encode_envelope, wrap};
use proto_messaging::test_utils::{
    constant_filter, panics_once_filter, test_message, wait_until, CountingListener,
    OtherTestMessage, RecordingErrorListener, TestMessage,
};
use proto_messaging::{
    ErrorKind, FilterChain, InMemoryBroker, InitialOffset, ListenerConfiguration, ListenerError,
    MessageListener, MessageMetadata, MessagingConfig, MessagingContext, MessagingError,
    PredicateFilter, ReceiverConfiguration, SendOptions, TopicConsumerState,
};

const WAIT: Duration = Duration::from_secs(5);
/// Long enough for several polls to come back empty.
const SETTLE: Duration = Duration::from_millis(300);

fn context(broker: &InMemoryBroker) -> MessagingContext {
    MessagingContext::new(Arc::new(broker.clone()), MessagingConfig::for_test())
}

async fn wait_for_polling(ctx: &MessagingContext, topic: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while ctx.consumer_state(topic).await != Some(TopicConsumerState::Polling) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "consumer for {} never started polling",
            topic
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn send_all(ctx: &MessagingContext, topics: &[&str], text: &str) -> usize {
    let producer = ctx.create_producer("test", "Source", FilterChain::new());
    let handles = producer.send(&test_message(text), SendOptions::new(), topics);
    let sent = handles.len();
    for handle in handles {
        handle.await.expect("send failed");
    }
    sent
}

#[tokio::test]
async fn test_send_and_receive() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let errors = RecordingErrorListener::new();
    let listener = CountingListener::<TestMessage>::new();

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .initial_offset(InitialOffset::Latest)
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::new(errors.clone()).listener(config))
        .await
        .unwrap();
    wait_for_polling(&ctx, "Topic1").await;

    let producer = ctx.create_producer("orders", "Orders", FilterChain::new());
    let handles = producer.send(
        &test_message("hello"),
        SendOptions::new().traceability_id("trace-1"),
        &["Topic1"],
    );
    assert_eq!(handles.len(), 1);
    for handle in handles {
        let receipt = handle.await.unwrap();
        assert_eq!(receipt.topic, "Topic1");
    }

    assert!(wait_until(|| listener.count() == 1, WAIT).await);
    tokio::time::sleep(SETTLE).await;
    assert_eq!(listener.count(), 1);
    assert_eq!(listener.payloads()[0].text, "hello");

    let metadata = &listener.metadata()[0];
    assert_eq!(metadata.src_topic, "Topic1");
    assert_eq!(metadata.origin_topic, "Orders");
    assert_eq!(metadata.traceability_id, "trace-1");
    assert_eq!(metadata.key.src_topic(), Some("Topic1"));
    assert_eq!(
        metadata.key.message_type(),
        Some("proto_messaging.test.TestMessage")
    );
    assert_eq!(errors.count(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_latest_skips_history() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let listener = CountingListener::<TestMessage>::new();

    send_all(&ctx, &["Topic1"], "before").await;

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .build()
        .unwrap();
    let receiver = ReceiverConfiguration::new(RecordingErrorListener::new()).listener(config);
    ctx.create_receiver(receiver).await.unwrap();
    wait_for_polling(&ctx, "Topic1").await;

    send_all(&ctx, &["Topic1"], "after").await;

    assert!(wait_until(|| listener.count() == 1, WAIT).await);
    tokio::time::sleep(SETTLE).await;
    let texts: Vec<String> = listener.payloads().into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["after".to_string()]);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_earliest_replays_history() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let listener = CountingListener::<TestMessage>::with_offset(InitialOffset::Earliest);

    send_all(&ctx, &["Topic1"], "first").await;
    send_all(&ctx, &["Topic1"], "second").await;

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .build()
        .unwrap();
    let receiver = ReceiverConfiguration::new(RecordingErrorListener::new()).listener(config);
    ctx.create_receiver(receiver).await.unwrap();

    assert!(wait_until(|| listener.count() == 2, WAIT).await);
    assert_eq!(
        ctx.negotiated_offset("Topic1").await,
        Some(InitialOffset::Earliest)
    );

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_panicking_filter_skips_only_one_record() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let errors = RecordingErrorListener::new();
    let listener = CountingListener::<TestMessage>::with_offset(InitialOffset::Earliest);

    send_all(&ctx, &["Topic1"], "first").await;
    send_all(&ctx, &["Topic1"], "second").await;

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .filter(panics_once_filter())
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::new(errors.clone()).listener(config))
        .await
        .unwrap();

    assert!(wait_until(|| listener.count() == 1, WAIT).await);
    assert_eq!(listener.payloads()[0].text, "second");
    assert_eq!(errors.kinds(), vec![ErrorKind::FilterFailed]);
    assert_eq!(
        ctx.consumer_state("Topic1").await,
        Some(TopicConsumerState::Polling)
    );

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_filter_blocks_delivery_silently() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let errors = RecordingErrorListener::new();
    let listener = CountingListener::<TestMessage>::new();

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .filter(constant_filter(true))
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::new(errors.clone()).listener(config))
        .await
        .unwrap();
    wait_for_polling(&ctx, "Topic1").await;

    send_all(&ctx, &["Topic1"], "filtered").await;

    tokio::time::sleep(SETTLE).await;
    assert_eq!(listener.count(), 0);
    assert_eq!(errors.count(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unknown_payload_reported_once() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let errors = RecordingErrorListener::new();
    let listener = CountingListener::<TestMessage>::new();

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::new(errors.clone()).listener(config))
        .await
        .unwrap();
    wait_for_polling(&ctx, "Topic1").await;

    let producer = ctx.create_producer("other", "Other", FilterChain::new());
    for handle in producer.send(&OtherTestMessage { id: 9 }, SendOptions::new(), &["Topic1"]) {
        handle.await.unwrap();
    }

    assert!(wait_until(|| errors.count() == 1, WAIT).await);
    tokio::time::sleep(SETTLE).await;
    assert_eq!(errors.count_of(ErrorKind::UnsupportedPayload), 1);
    assert_eq!(
        errors.descriptions(),
        vec![
            "Received unsupported payload. Source: Topic1, Type: \
             proto_messaging.test.OtherTestMessage"
                .to_string()
        ]
    );
    assert_eq!(listener.count(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_two_types_share_one_consumer() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let text_listener = CountingListener::<TestMessage>::with_offset(InitialOffset::Latest);
    let id_listener = CountingListener::<OtherTestMessage>::with_offset(InitialOffset::Earliest);

    send_all(&ctx, &["Shared"], "history").await;

    let text_config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Shared")
        .listener(Arc::clone(&text_listener))
        .build()
        .unwrap();
    let id_config = ListenerConfiguration::builder::<OtherTestMessage>()
        .topic("Shared")
        .listener(Arc::clone(&id_listener))
        .build()
        .unwrap();
    ctx.create_receiver(
        ReceiverConfiguration::new(RecordingErrorListener::new())
            .listener(text_config)
            .listener(id_config),
    )
    .await
    .unwrap();
    wait_for_polling(&ctx, "Shared").await;

    assert_eq!(broker.consumers_created(), 1);
    assert_eq!(ctx.topics().await, vec!["Shared".to_string()]);
    // Latest (-1) outranks Earliest (-3).
    assert_eq!(
        ctx.negotiated_offset("Shared").await,
        Some(InitialOffset::Latest)
    );

    let producer = ctx.create_producer("ids", "Ids", FilterChain::new());
    for handle in producer.send(&OtherTestMessage { id: 3 }, SendOptions::new(), &["Shared"]) {
        handle.await.unwrap();
    }
    send_all(&ctx, &["Shared"], "live").await;

    assert!(
        wait_until(
            || id_listener.count() == 1 && text_listener.count() == 1,
            WAIT
        )
        .await
    );
    assert_eq!(id_listener.payloads()[0].id, 3);
    assert_eq!(text_listener.payloads()[0].text, "live");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_send_filter_skips_destination() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);

    let filters = FilterChain::new().with(Arc::new(PredicateFilter::topic("A")));
    let producer = ctx.create_producer("fanout", "Source", filters);
    let handles = producer.send(&test_message("x"), SendOptions::new(), &["A", "B"]);

    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].topic(), "B");
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(broker.records("A", 0).is_empty());
    assert_eq!(broker.records("B", 0).len(), 1);
    assert_eq!(broker.sender_count("A"), 0);
}

#[tokio::test]
async fn test_offset_beyond_commit_falls_back_to_latest() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let errors = RecordingErrorListener::new();
    let listener = CountingListener::<TestMessage>::new();

    send_all(&ctx, &["Topic1"], "old").await;
    broker.set_committed("Topic1", 0, 1);

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .initial_offset(InitialOffset::At(10))
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::new(errors.clone()).listener(config))
        .await
        .unwrap();
    wait_for_polling(&ctx, "Topic1").await;

    assert_eq!(errors.count_of(ErrorKind::OffsetNegotiationFailed), 1);
    assert_eq!(
        ctx.negotiated_offset("Topic1").await,
        Some(InitialOffset::Latest)
    );

    send_all(&ctx, &["Topic1"], "new").await;
    assert!(wait_until(|| listener.count() == 1, WAIT).await);
    assert_eq!(listener.payloads()[0].text, "new");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_second_receiver_rejected() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);

    let build = || {
        ListenerConfiguration::builder::<TestMessage>()
            .topic("Topic1")
            .listener(CountingListener::<TestMessage>::new())
            .build()
            .unwrap()
    };
    ctx.create_receiver(ReceiverConfiguration::default().listener(build()))
        .await
        .unwrap();

    let result = ctx
        .create_receiver(ReceiverConfiguration::default().listener(build()))
        .await;
    assert!(matches!(
        result,
        Err(MessagingError::AlreadyInitialized("Receiver"))
    ));
    assert_eq!(broker.consumers_created(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_register_without_receiver_fails() {
    let ctx = context(&InMemoryBroker::new());
    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(CountingListener::<TestMessage>::new())
        .build()
        .unwrap();

    let err = ctx.register(config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_create_producer_is_idempotent() {
    let ctx = context(&InMemoryBroker::new());

    let first = ctx.create_producer("p", "Source", FilterChain::new());
    let second = ctx.create_producer("p", "Elsewhere", FilterChain::new());
    let other = ctx.create_producer("q", "Source", FilterChain::new());

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(second.source_topic(), "Source");
    assert!(ctx.producer("p").is_some());
    assert!(ctx.producer("missing").is_none());
}

#[tokio::test]
async fn test_late_registration_starts_new_topic() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let first = CountingListener::<TestMessage>::new();
    let late = CountingListener::<TestMessage>::new();

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&first))
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::default().listener(config))
        .await
        .unwrap();

    let late_config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic2")
        .listener(Arc::clone(&late))
        .build()
        .unwrap();
    ctx.register(late_config).await.unwrap();
    wait_for_polling(&ctx, "Topic1").await;
    wait_for_polling(&ctx, "Topic2").await;

    assert_eq!(broker.consumers_created(), 2);
    send_all(&ctx, &["Topic2"], "late").await;

    assert!(wait_until(|| late.count() == 1, WAIT).await);
    assert_eq!(first.count(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_record_does_not_stop_consumer() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);
    let errors = RecordingErrorListener::new();
    let listener = CountingListener::<TestMessage>::new();

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::new(errors.clone()).listener(config))
        .await
        .unwrap();
    wait_for_polling(&ctx, "Topic1").await;

    broker.append(
        "Topic1",
        0,
        Some(b"Topic1|proto_messaging.test.TestMessage".to_vec()),
        Some(vec![0xff, 0xff, 0xff]),
    );
    let envelope = wrap(&test_message("valid"), "Raw", None);
    broker.append(
        "Topic1",
        0,
        Some(b"Topic1|proto_messaging.test.TestMessage".to_vec()),
        Some(encode_envelope(&envelope)),
    );

    assert!(wait_until(|| listener.count() == 1, WAIT).await);
    assert_eq!(errors.count_of(ErrorKind::CorruptEnvelope), 1);
    assert_eq!(listener.metadata()[0].origin_topic, "Raw");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_consumers_and_senders() {
    let broker = InMemoryBroker::new();
    let ctx = context(&broker);

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topics(["Topic1", "Topic2"])
        .listener(CountingListener::<TestMessage>::new())
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::default().listener(config))
        .await
        .unwrap();
    wait_for_polling(&ctx, "Topic1").await;
    wait_for_polling(&ctx, "Topic2").await;

    assert_eq!(send_all(&ctx, &["Out1", "Out2"], "bye").await, 2);

    ctx.shutdown().await;

    assert_eq!(broker.consumers_closed(), 2);
    assert_eq!(broker.senders_closed(), 2);
    assert_eq!(
        ctx.consumer_state("Topic1").await,
        Some(TopicConsumerState::Closed)
    );
    assert_eq!(
        ctx.consumer_state("Topic2").await,
        Some(TopicConsumerState::Closed)
    );
}

/// Listener that reads consumer state from the context mid-delivery.
#[derive(Default)]
struct ReentrantListener {
    ctx: OnceLock<Arc<MessagingContext>>,
    entered: AtomicBool,
    seen: Mutex<Option<Option<TopicConsumerState>>>,
}

#[async_trait]
impl MessageListener<TestMessage> for ReentrantListener {
    async fn on_message(
        &self,
        _metadata: &MessageMetadata,
        _payload: &TestMessage,
    ) -> Result<(), ListenerError> {
        self.entered.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Some(ctx) = self.ctx.get() {
            let state = ctx.consumer_state("Topic1").await;
            *self.seen.lock().unwrap() = Some(state);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_lets_listener_call_back_into_context() {
    let broker = InMemoryBroker::new();
    let ctx = Arc::new(context(&broker));
    let listener = Arc::new(ReentrantListener::default());
    let _ = listener.ctx.set(Arc::clone(&ctx));

    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .build()
        .unwrap();
    ctx.create_receiver(ReceiverConfiguration::default().listener(config))
        .await
        .unwrap();
    wait_for_polling(&ctx, "Topic1").await;

    send_all(&ctx, &["Topic1"], "hello").await;
    assert!(wait_until(|| listener.entered.load(Ordering::SeqCst), WAIT).await);

    tokio::time::timeout(Duration::from_secs(3), ctx.shutdown())
        .await
        .expect("shutdown did not complete while a listener was using the context");

    assert!(listener.seen.lock().unwrap().is_some());
    assert_eq!(
        ctx.consumer_state("Topic1").await,
        Some(TopicConsumerState::Closed)
    );
}
