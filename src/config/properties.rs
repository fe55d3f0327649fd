//! Broker property generation.

use std::collections::HashMap;

use tracing::info;

use super::MessagingConfig;
use crate::broker::BrokerProperties;

/// 50 MiB, the largest record the layer expects to move.
const MAX_RECORD_BYTES: &str = "52428800";

impl MessagingConfig {
    /// Properties for the consumer of `topic`.
    ///
    /// Client and group ids derive from the lowercased topic name, so every
    /// process consuming a topic joins the same group.
    pub fn consumer_properties(&self, topic: &str) -> BrokerProperties {
        let topic = topic.to_lowercase();
        let mut properties = BrokerProperties::new();
        properties.insert("bootstrap.servers".into(), self.bootstrap_servers.clone());
        properties.insert("enable.auto.commit".into(), "true".into());
        properties.insert("max.partition.fetch.bytes".into(), MAX_RECORD_BYTES.into());
        properties.insert("reconnect.backoff.ms".into(), "3000".into());
        properties.insert("retry.backoff.ms".into(), "1000".into());
        properties.insert("client.id".into(), topic.clone());
        properties.insert("group.id".into(), format!("{}Consumer", topic));

        apply_overrides(&mut properties, &self.consumer, "consumer");
        properties
    }

    /// Properties for the sender bound to destination `topic`.
    pub fn sender_properties(&self, topic: &str) -> BrokerProperties {
        let mut properties = BrokerProperties::new();
        properties.insert("bootstrap.servers".into(), self.bootstrap_servers.clone());
        properties.insert("reconnect.backoff.ms".into(), "3000".into());
        properties.insert("retry.backoff.ms".into(), "3000".into());
        properties.insert("message.max.bytes".into(), MAX_RECORD_BYTES.into());
        properties.insert("linger.ms".into(), "1".into());
        properties.insert(
            "client.id".into(),
            format!("{}->{}", self.client_id_prefix, topic.to_lowercase()),
        );

        apply_overrides(&mut properties, &self.sender, "sender");
        properties
    }
}

fn apply_overrides(
    properties: &mut BrokerProperties,
    overrides: &HashMap<String, String>,
    role: &str,
) {
    for (key, value) in overrides {
        if let Some(previous) = properties.insert(key.clone(), value.clone()) {
            if &previous != value {
                info!(
                    role = role,
                    property = %key,
                    from = %previous,
                    to = %value,
                    "Overriding broker property"
                );
            }
        }
    }
}
