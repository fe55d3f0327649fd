//! Test utilities and mock implementations.
//!
//! Hand-declared test payloads plus recording listeners and filters for
//! exercising receivers and producers without a real broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::codec::Payload;
use crate::error::{ErrorKind, PlatformError, PlatformErrorListener};
use crate::filter::{MessageFilter, PredicateFilter};
use crate::listener::{InitialOffset, ListenerError, MessageListener, MessageMetadata};

/// Field number of the trace tag extension carried by [`TestMessageWithExtension`].
pub const TRACE_TAG_EXTENSION: u32 = 100;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TestMessage {
    #[prost(string, tag = "1")]
    pub text: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub count: i32,
}

impl ::prost::Name for TestMessage {
    const NAME: &'static str = "TestMessage";
    const PACKAGE: &'static str = "proto_messaging.test";
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OtherTestMessage {
    #[prost(int64, tag = "1")]
    pub id: i64,
}

impl ::prost::Name for OtherTestMessage {
    const NAME: &'static str = "OtherTestMessage";
    const PACKAGE: &'static str = "proto_messaging.test";
}

/// Extension value attached at [`TRACE_TAG_EXTENSION`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceTag {
    #[prost(string, tag = "1")]
    pub tag: ::prost::alloc::string::String,
}

/// Sender-side view of `TestMessage` that also sets the trace tag extension.
///
/// Shares the wire name of [`TestMessage`], so receivers registered for
/// `TestMessage` parse it and see the extension only through the registry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TestMessageWithExtension {
    #[prost(string, tag = "1")]
    pub text: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub count: i32,
    #[prost(message, optional, tag = "100")]
    pub trace: ::core::option::Option<TraceTag>,
}

impl ::prost::Name for TestMessageWithExtension {
    const NAME: &'static str = "TestMessage";
    const PACKAGE: &'static str = "proto_messaging.test";
}

pub fn test_message(text: &str) -> TestMessage {
    TestMessage {
        text: text.to_string(),
        count: 1,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Listener that records every delivery.
pub struct CountingListener<M> {
    received: Mutex<Vec<(MessageMetadata, M)>>,
    initial_offset: InitialOffset,
}

impl<M> CountingListener<M> {
    pub fn new() -> Arc<Self> {
        Self::with_offset(InitialOffset::Latest)
    }

    pub fn with_offset(initial_offset: InitialOffset) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            initial_offset,
        })
    }

    pub fn count(&self) -> usize {
        lock(&self.received).len()
    }
}

impl<M: Clone> CountingListener<M> {
    pub fn payloads(&self) -> Vec<M> {
        lock(&self.received).iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn metadata(&self) -> Vec<MessageMetadata> {
        lock(&self.received).iter().map(|(md, _)| md.clone()).collect()
    }
}

#[async_trait]
impl<M: Payload + Clone> MessageListener<M> for CountingListener<M> {
    async fn on_message(
        &self,
        metadata: &MessageMetadata,
        payload: &M,
    ) -> Result<(), ListenerError> {
        lock(&self.received).push((metadata.clone(), payload.clone()));
        Ok(())
    }

    fn initial_offset(&self, _topic: &str) -> InitialOffset {
        self.initial_offset
    }
}

/// Listener that always returns an error.
#[derive(Default)]
pub struct FailingListener;

#[async_trait]
impl<M: Payload> MessageListener<M> for FailingListener {
    async fn on_message(
        &self,
        _metadata: &MessageMetadata,
        _payload: &M,
    ) -> Result<(), ListenerError> {
        Err("listener rejected message".into())
    }
}

/// Listener that panics on every message.
#[derive(Default)]
pub struct PanickingListener;

#[async_trait]
impl<M: Payload> MessageListener<M> for PanickingListener {
    async fn on_message(
        &self,
        _metadata: &MessageMetadata,
        _payload: &M,
    ) -> Result<(), ListenerError> {
        panic!("listener blew up");
    }
}

/// Error listener that keeps every reported error.
#[derive(Default)]
pub struct RecordingErrorListener {
    errors: Mutex<Vec<PlatformError>>,
}

impl RecordingErrorListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        lock(&self.errors).len()
    }

    pub fn kinds(&self) -> Vec<ErrorKind> {
        lock(&self.errors).iter().map(PlatformError::kind).collect()
    }

    pub fn descriptions(&self) -> Vec<String> {
        lock(&self.errors)
            .iter()
            .map(|e| e.description().to_string())
            .collect()
    }

    pub fn count_of(&self, kind: ErrorKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

impl PlatformErrorListener for RecordingErrorListener {
    fn on_error(&self, error: PlatformError) {
        lock(&self.errors).push(error);
    }
}

/// Filter that returns `result` for every message.
pub fn constant_filter(result: bool) -> Arc<dyn MessageFilter> {
    Arc::new(PredicateFilter::new(move |_, _| result))
}

/// Filter that panics on its first call and lets everything through after.
pub fn panics_once_filter() -> Arc<dyn MessageFilter> {
    let fired = AtomicBool::new(false);
    Arc::new(PredicateFilter::new(move |_, _| {
        if !fired.swap(true, Ordering::SeqCst) {
            panic!("filter exploded");
        }
        false
    }))
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
