// Message Domain Model

use std::collections::BTreeMap;

/// Broker-assigned tag identifying one delivery on one channel
pub type DeliveryTag = u64;

/// Broker-assigned identifier of an active subscription
pub type ConsumerTag = String;

/// Typed value carried in queue arguments and message headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

/// Field table passed with a queue declaration (`x-dead-letter-*` etc.)
pub type QueueArguments = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

/// Basic properties sent with a published message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub headers: BTreeMap<String, FieldValue>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }
}

/// A message pushed by the broker to a consumer
///
/// The raw body is decoded by the queue service; `delivery_tag` is what the
/// ack/nack for this exact delivery must reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub consumer_tag: ConsumerTag,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}
