use super::*;
use crate::codec::{encode_envelope, wrap};
use crate::error::ErrorKind;
use crate::key::KeyPolicy;
use crate::test_utils::{
    constant_filter, panics_once_filter, test_message, CountingListener, FailingListener, OtherTestMessage,
    RecordingErrorListener, TestMessage, TestMessageWithExtension, TraceTag, TRACE_TAG_EXTENSION,
};

fn processor(errors: &Arc<RecordingErrorListener>) -> MessageProcessor {
    MessageProcessor::new(
        "Topic1",
        0,
        Arc::new(TypeRegistry::new()),
        Arc::clone(errors) as Arc<dyn PlatformErrorListener>,
    )
}

fn key() -> MessageKey {
    MessageKey::parse("Topic1|proto_messaging.test.TestMessage", KeyPolicy::Lenient).unwrap()
}

fn test_message_bytes(text: &str) -> Vec<u8> {
    encode_envelope(&wrap(&test_message(text), "Upstream", Some("trace-7")))
}

fn listening_to_test_message(
    listener: &Arc<CountingListener<TestMessage>>,
) -> ListenerConfiguration {
    ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(listener))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_delivers_registered_type() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    processor
        .register_additional(&listening_to_test_message(&listener))
        .await;

    let dispatch = processor
        .process(&test_message_bytes("hello"), "Topic1", key(), 17)
        .await;

    assert_eq!(
        dispatch,
        Dispatch::Delivered {
            listeners: 1,
            failures: 0
        }
    );
    assert_eq!(listener.count(), 1);
    assert_eq!(listener.payloads()[0].text, "hello");
    let metadata = &listener.metadata()[0];
    assert_eq!(metadata.src_topic, "Topic1");
    assert_eq!(metadata.offset, 17);
    assert_eq!(metadata.traceability_id, "trace-7");
    assert_eq!(metadata.origin_topic, "Upstream");
    assert_eq!(
        metadata.key.message_type(),
        Some("proto_messaging.test.TestMessage")
    );
    assert_eq!(errors.count(), 0);
}

#[tokio::test]
async fn test_filtered_message_is_neither_delivered_nor_reported() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .filter(constant_filter(true))
        .build()
        .unwrap();
    processor.register_additional(&config).await;

    let dispatch = processor
        .process(&test_message_bytes("hello"), "Topic1", key(), 0)
        .await;

    assert_eq!(dispatch, Dispatch::Filtered);
    assert_eq!(listener.count(), 0);
    assert_eq!(errors.count(), 0);
}

#[tokio::test]
async fn test_panicking_filter_rejects_only_that_message() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .filter(panics_once_filter())
        .build()
        .unwrap();
    processor.register_additional(&config).await;

    let first = processor
        .process(&test_message_bytes("first"), "Topic1", key(), 0)
        .await;
    let second = processor
        .process(&test_message_bytes("second"), "Topic1", key(), 1)
        .await;

    assert_eq!(first, Dispatch::Rejected);
    assert_eq!(
        second,
        Dispatch::Delivered {
            listeners: 1,
            failures: 0
        }
    );
    assert_eq!(listener.payloads()[0].text, "second");
    assert_eq!(errors.kinds(), vec![ErrorKind::FilterFailed]);
}

#[tokio::test]
async fn test_disabled_filter_lets_message_through() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    let filter = constant_filter(true);
    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .filter(Arc::clone(&filter))
        .build()
        .unwrap();
    processor.register_additional(&config).await;
    filter.disable();

    processor
        .process(&test_message_bytes("hello"), "Topic1", key(), 0)
        .await;

    assert_eq!(listener.count(), 1);
}

#[tokio::test]
async fn test_unknown_type_is_reported_once() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    processor
        .register_additional(&listening_to_test_message(&listener))
        .await;

    let mut envelope = wrap(&test_message("hello"), "", None);
    envelope.payload_type_name = "UnknownType".to_string();
    let dispatch = processor
        .process(&encode_envelope(&envelope), "Topic1", key(), 0)
        .await;

    assert_eq!(dispatch, Dispatch::Rejected);
    assert_eq!(listener.count(), 0);
    assert_eq!(errors.kinds(), vec![ErrorKind::UnsupportedPayload]);
    assert_eq!(
        errors.descriptions()[0],
        "Received unsupported payload. Source: Topic1, Type: UnknownType"
    );
}

#[tokio::test]
async fn test_generic_fallback_receives_envelope() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let generic = CountingListener::<Envelope>::new();
    let config = ListenerConfiguration::builder::<Envelope>()
        .topic("Topic1")
        .listener(Arc::clone(&generic))
        .build()
        .unwrap();
    processor.register_additional(&config).await;

    processor
        .process(&test_message_bytes("hello"), "Topic1", key(), 3)
        .await;

    assert_eq!(generic.count(), 1);
    let envelope = &generic.payloads()[0];
    assert_eq!(envelope.payload_type_name, "proto_messaging.test.TestMessage");
    assert_eq!(errors.count(), 0);
}

#[tokio::test]
async fn test_registered_type_takes_precedence_over_fallback() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let typed = CountingListener::<TestMessage>::new();
    let generic = CountingListener::<Envelope>::new();
    processor
        .register_additional(&listening_to_test_message(&typed))
        .await;
    processor
        .register_additional(
            &ListenerConfiguration::builder::<Envelope>()
                .topic("Topic1")
                .listener(Arc::clone(&generic))
                .build()
                .unwrap(),
        )
        .await;

    processor
        .process(&test_message_bytes("hello"), "Topic1", key(), 0)
        .await;
    processor
        .process(
            &encode_envelope(&wrap(&OtherTestMessage { id: 9 }, "", None)),
            "Topic1",
            key(),
            1,
        )
        .await;

    assert_eq!(typed.count(), 1);
    assert_eq!(generic.count(), 1);
    assert_eq!(
        generic.payloads()[0].payload_type_name,
        "proto_messaging.test.OtherTestMessage"
    );
}

#[tokio::test]
async fn test_corrupt_envelope_is_reported() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    processor
        .register_additional(&listening_to_test_message(&listener))
        .await;

    let dispatch = processor
        .process(&[0xff, 0xff, 0xff], "Topic1", key(), 0)
        .await;

    assert_eq!(dispatch, Dispatch::Rejected);
    assert_eq!(errors.kinds(), vec![ErrorKind::CorruptEnvelope]);
    assert_eq!(listener.count(), 0);
}

#[tokio::test]
async fn test_failing_listener_does_not_stop_others() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::new(FailingListener))
        .listener(Arc::clone(&listener))
        .build()
        .unwrap();
    processor.register_additional(&config).await;

    let dispatch = processor
        .process(&test_message_bytes("hello"), "Topic1", key(), 0)
        .await;

    assert_eq!(
        dispatch,
        Dispatch::Delivered {
            listeners: 2,
            failures: 1
        }
    );
    assert_eq!(listener.count(), 1);
    assert_eq!(errors.kinds(), vec![ErrorKind::DeliveryFailed]);
    assert!(errors.descriptions()[0].contains("FailingListener"));
}

#[tokio::test]
async fn test_two_types_share_topic_and_offset_takes_largest() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let first = CountingListener::<TestMessage>::with_offset(InitialOffset::Earliest);
    let second = CountingListener::<OtherTestMessage>::with_offset(InitialOffset::At(5));
    processor
        .register_additional(
            &ListenerConfiguration::builder::<TestMessage>()
                .topic("Topic1")
                .listener(Arc::clone(&first))
                .build()
                .unwrap(),
        )
        .await;
    assert_eq!(processor.initial_offset().await, InitialOffset::Earliest);

    processor
        .register_additional(
            &ListenerConfiguration::builder::<OtherTestMessage>()
                .topic("Topic1")
                .listener(Arc::clone(&second))
                .build()
                .unwrap(),
        )
        .await;

    assert_eq!(processor.supported_type_count().await, 2);
    assert_eq!(processor.initial_offset().await, InitialOffset::At(5));

    processor
        .process(&test_message_bytes("hello"), "Topic1", key(), 0)
        .await;
    processor
        .process(
            &encode_envelope(&wrap(&OtherTestMessage { id: 9 }, "", None)),
            "Topic1",
            key(),
            1,
        )
        .await;

    assert_eq!(first.count(), 1);
    assert_eq!(second.count(), 1);
    assert_eq!(second.payloads()[0].id, 9);
}

#[tokio::test]
async fn test_registering_same_listener_twice_delivers_once() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    let config = listening_to_test_message(&listener);
    processor.register_additional(&config).await;
    processor.register_additional(&config).await;

    processor
        .process(&test_message_bytes("hello"), "Topic1", key(), 0)
        .await;

    assert_eq!(listener.count(), 1);
}

#[tokio::test]
async fn test_extensions_reach_listener_metadata() {
    let errors = RecordingErrorListener::new();
    let processor = processor(&errors);
    let listener = CountingListener::<TestMessage>::new();
    let config = ListenerConfiguration::builder::<TestMessage>()
        .topic("Topic1")
        .listener(Arc::clone(&listener))
        .extension_registry(ExtensionRegistry::empty().with(TRACE_TAG_EXTENSION, "trace_tag"))
        .build()
        .unwrap();
    processor.register_additional(&config).await;

    let sent = TestMessageWithExtension {
        text: "hello".to_string(),
        count: 1,
        trace: Some(TraceTag {
            tag: "blue".to_string(),
        }),
    };
    processor
        .process(&encode_envelope(&wrap(&sent, "", None)), "Topic1", key(), 0)
        .await;

    let metadata = &listener.metadata()[0];
    let tag: TraceTag = metadata
        .extensions
        .message(TRACE_TAG_EXTENSION)
        .unwrap()
        .unwrap();
    assert_eq!(tag.tag, "blue");
    assert_eq!(listener.payloads()[0].text, "hello");
}
