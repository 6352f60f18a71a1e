//! The canonical message envelope shared by every backend.
//!
//! A [`Message`] is a [`MessageHeader`] plus a [`MessageBody`]. Producers take
//! messages built by the application; consumers hand back messages decoded
//! from the wire by [`crate::codec`]. The gateway never looks inside a body.
//!
//! # Sentinels
//!
//! Two header types never come from an application:
//!
//! - [`MessageType::None`] is what a receive returns when nothing arrived in
//!   time, so a receive never yields an empty batch.
//! - [`MessageType::Unacceptable`] stands in for anything that could not be
//!   decoded. It carries whatever id/topic could be salvaged so that retry
//!   and dead-letter accounting still apply to it.

use std::{collections::BTreeMap, fmt, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use strum::{Display, EnumString};

/// Arbitrary user metadata carried next to the canonical header fields.
pub type Bag = BTreeMap<String, serde_json::Value>;

/// Bag key used by consumers to remember the broker's delivery tag.
pub const DELIVERY_TAG: &str = "delivery-tag";
/// Bag key used by pull-style consumers to remember the receipt handle.
pub const RECEIPT_HANDLE: &str = "receipt-handle";
/// Bag key stamped on requeued clones with the id of the first delivery.
pub const ORIGINAL_MESSAGE_ID: &str = "original-message-id";
/// Bag key producers read the FIFO deduplication id from.
pub const DEDUPLICATION_ID: &str = "deduplication-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum MessageType {
    #[strum(serialize = "MT_COMMAND")]
    Command,
    #[strum(serialize = "MT_EVENT")]
    Event,
    #[strum(serialize = "MT_NONE")]
    None,
    #[strum(serialize = "MT_UNACCEPTABLE")]
    Unacceptable,
}

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

name_type!(
    /// Logical topic a message is published to.
    RoutingKey
);
name_type!(
    /// Logical queue a consumer reads from.
    ChannelName
);
name_type!(
    /// Logical consumer group.
    SubscriptionName
);

#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct MessageHeader {
    #[builder(into, default = uuid::Uuid::new_v4().to_string())]
    message_id: String,
    #[builder(into)]
    topic: RoutingKey,
    message_type: MessageType,
    #[builder(default = Utc::now())]
    timestamp: DateTime<Utc>,
    #[builder(into)]
    correlation_id: Option<String>,
    #[builder(into)]
    reply_to: Option<String>,
    #[builder(into, default = String::from("text/plain"))]
    content_type: String,
    #[builder(default)]
    handled_count: u32,
    #[builder(into)]
    partition_key: Option<String>,
    #[builder(default)]
    delayed: Duration,
    #[builder(into)]
    subject: Option<String>,
    #[builder(into)]
    data_schema: Option<String>,
    #[builder(into)]
    source: Option<String>,
    #[builder(default)]
    bag: Bag,
}

impl MessageHeader {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn topic(&self) -> &RoutingKey {
        &self.topic
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn handled_count(&self) -> u32 {
        self.handled_count
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn delayed(&self) -> Duration {
        self.delayed
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn data_schema(&self) -> Option<&str> {
        self.data_schema.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn bag(&self) -> &Bag {
        &self.bag
    }

    pub fn bag_mut(&mut self) -> &mut Bag {
        &mut self.bag
    }

    /// Returns a bag entry as text. Strings come back as-is, other JSON
    /// values as their JSON text.
    pub fn bag_str(&self, key: &str) -> Option<String> {
        self.bag.get(key).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn increment_handled_count(&mut self) {
        self.handled_count = self.handled_count.saturating_add(1);
    }

    /// Raises the handled count to `count`; never lowers it.
    pub fn raise_handled_count(&mut self, count: u32) {
        self.handled_count = self.handled_count.max(count);
    }

    pub fn set_delayed(&mut self, delayed: Duration) {
        self.delayed = delayed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    bytes: Bytes,
    content_type: String,
}

impl MessageBody {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::new(value.into(), "text/plain")
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new(), "text/plain")
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Lossy UTF-8 view of the body, for logging.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// The "nothing arrived" sentinel.
    pub fn none() -> Self {
        Self {
            header: MessageHeader::builder()
                .message_id(String::new())
                .topic(RoutingKey::default())
                .message_type(MessageType::None)
                .build(),
            body: MessageBody::empty(),
        }
    }

    /// The "could not decode" sentinel, keeping whatever was salvaged.
    pub fn unacceptable(topic: RoutingKey, message_id: Option<String>) -> Self {
        Self {
            header: MessageHeader::builder()
                .maybe_message_id(message_id)
                .topic(topic)
                .message_type(MessageType::Unacceptable)
                .build(),
            body: MessageBody::empty(),
        }
    }

    pub fn id(&self) -> &str {
        self.header.message_id()
    }

    pub fn is_none(&self) -> bool {
        self.header.message_type() == MessageType::None
    }

    pub fn is_unacceptable(&self) -> bool {
        self.header.message_type() == MessageType::Unacceptable
    }

    /// Copy used when a delivery is sent back to its queue: same id, one more
    /// handled, and the first delivery's id stamped into the bag once.
    pub fn requeue_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.header.increment_handled_count();
        clone
            .header
            .bag
            .entry(ORIGINAL_MESSAGE_ID.to_owned())
            .or_insert_with(|| serde_json::Value::String(self.id().to_owned()));
        clone.header.bag.remove(DELIVERY_TAG);
        clone.header.bag.remove(RECEIPT_HANDLE);
        clone
    }
}
