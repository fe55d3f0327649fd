//! proto-messaging - typed protobuf publish/subscribe
//!
//! A protocol layer between application code and a partitioned,
//! offset-addressed log broker. Payloads of several protobuf types share a
//! topic inside a self-describing envelope; receivers negotiate a safe start
//! offset per topic and route each record to the listeners registered for
//! its payload type.

pub mod broker;
pub mod codec;
pub mod config;
pub mod configuration;
pub mod context;
pub mod error;
pub mod filter;
pub mod key;
pub mod listener;
pub mod producer;
pub mod proto;
pub mod receiver;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broker::{BrokerClient, DeliveryReceipt, InMemoryBroker};
pub use codec::{ExtensionRegistry, ExtensionSet, Payload};
pub use config::MessagingConfig;
pub use configuration::{ListenerConfiguration, ReceiverConfiguration};
pub use context::MessagingContext;
pub use error::{
    ErrorKind, LoggingErrorListener, MessagingError, PlatformError, PlatformErrorListener, Result,
};
pub use filter::{FilterChain, MessageFilter, PredicateFilter};
pub use key::{KeyPolicy, MessageKey};
pub use listener::{InitialOffset, ListenerError, MessageListener, MessageMetadata};
pub use producer::{MessageProducer, SendHandle, SendOptions};
pub use proto::Envelope;
pub use receiver::TopicConsumerState;
