//! SNS/SQS message attributes <-> [`Message`].
//!
//! Both services cap a message at ten attributes, so only the canonical
//! fields get attributes of their own. The bag, together with the rarely set
//! header fields, is packed into one JSON `bag` attribute.
//!
//! Messages arrive either raw (attributes on the SQS message itself) or
//! wrapped in an SNS notification document when raw delivery is off. Both
//! shapes decode to the same [`Message`].
//!
//! An absent `message-type` attribute decodes as
//! [`MessageType::Unacceptable`]. This deliberately differs from the AMQP
//! decoder, which assumes an event.

use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;

use super::*;
use crate::message::{
    Bag, Message, MessageBody, MessageHeader, MessageType, RoutingKey, DELIVERY_TAG,
    RECEIPT_HANDLE,
};

/// Packed into the bag when a body is not valid UTF-8.
const BODY_ENCODING: &str = "body-encoding";
const BASE64: &str = "base64";

/// System attribute SQS uses to count receives.
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

/// Header fields that ride inside the packed bag instead of their own
/// attribute.
const PACKED: &[&str] = &[PARTITION_KEY, SUBJECT, DATA_SCHEMA, SOURCE, BODY_ENCODING];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase", tag = "DataType")]
pub enum AttributeValue {
    #[serde(rename_all = "PascalCase")]
    String { string_value: String },
    #[serde(rename_all = "PascalCase")]
    Number { string_value: String },
    #[serde(rename_all = "PascalCase")]
    Binary { binary_value: Vec<u8> },
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String {
            string_value: value.into(),
        }
    }

    pub fn number(value: impl ToString) -> Self {
        Self::Number {
            string_value: value.to_string(),
        }
    }

    pub fn data_type(&self) -> &'static str {
        match self {
            Self::String { .. } => "String",
            Self::Number { .. } => "Number",
            Self::Binary { .. } => "Binary",
        }
    }

    /// Text view of the value; binary attributes are read as UTF-8.
    pub fn as_text(&self) -> String {
        match self {
            Self::String { string_value } | Self::Number { string_value } => string_value.clone(),
            Self::Binary { binary_value } => String::from_utf8_lossy(binary_value).into_owned(),
        }
    }
}

/// An outgoing SNS publish or SQS send.
#[derive(Debug, Clone, PartialEq)]
pub struct SqsEnvelope {
    pub body: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// A message as returned by `ReceiveMessage`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqsReceived {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub md5_of_body: Option<String>,
    pub attributes: HashMap<String, AttributeValue>,
    pub system_attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnsNotification {
    message_id: Option<String>,
    topic_arn: Option<String>,
    subject: Option<String>,
    message: String,
    #[serde(default)]
    message_attributes: HashMap<String, SnsAttribute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnsAttribute {
    #[serde(rename = "Type")]
    kind: String,
    value: String,
}

impl SnsAttribute {
    fn into_attribute(self) -> AttributeValue {
        match self.kind.as_str() {
            "Number" => AttributeValue::Number {
                string_value: self.value,
            },
            "Binary" => match base64::engine::general_purpose::STANDARD.decode(&self.value) {
                Ok(binary_value) => AttributeValue::Binary { binary_value },
                Err(_) => AttributeValue::String {
                    string_value: self.value,
                },
            },
            _ => AttributeValue::String {
                string_value: self.value,
            },
        }
    }
}

/// Short topic name from a topic ARN (`arn:partition:sns:region:account:name`).
pub fn topic_from_arn(arn: &str) -> Option<&str> {
    arn.split(':').nth(5).filter(|name| !name.is_empty())
}

pub fn encode(message: &Message) -> SqsEnvelope {
    let header = &message.header;
    let mut attributes = BTreeMap::new();

    attributes.insert(ID.to_owned(), AttributeValue::string(header.message_id()));
    attributes.insert(TOPIC.to_owned(), AttributeValue::string(header.topic().as_str()));
    attributes.insert(
        CONTENT_TYPE.to_owned(),
        AttributeValue::string(header.content_type()),
    );
    attributes.insert(
        MESSAGE_TYPE.to_owned(),
        AttributeValue::string(header.message_type().to_string()),
    );
    attributes.insert(
        TIMESTAMP.to_owned(),
        AttributeValue::string(format_timestamp(header.timestamp())),
    );
    attributes.insert(
        HANDLED_COUNT.to_owned(),
        AttributeValue::number(header.handled_count()),
    );
    if let Some(correlation_id) = header.correlation_id() {
        attributes.insert(
            CORRELATION_ID.to_owned(),
            AttributeValue::string(correlation_id),
        );
    }
    if let Some(reply_to) = header.reply_to() {
        attributes.insert(REPLY_TO.to_owned(), AttributeValue::string(reply_to));
    }
    if !header.delayed().is_zero() {
        attributes.insert(
            DELAY_MILLISECONDS.to_owned(),
            AttributeValue::number(delay_to_millis(header.delayed())),
        );
    }

    let mut packed: serde_json::Map<String, serde_json::Value> = header
        .bag()
        .iter()
        .filter(|(key, _)| {
            !is_reserved(key) && key.as_str() != DELIVERY_TAG && key.as_str() != RECEIPT_HANDLE
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let extras = [
        (PARTITION_KEY, header.partition_key()),
        (SUBJECT, header.subject()),
        (DATA_SCHEMA, header.data_schema()),
        (SOURCE, header.source()),
    ];
    for (name, value) in extras {
        if let Some(value) = value {
            packed.insert(name.to_owned(), serde_json::Value::from(value));
        }
    }

    let body = match std::str::from_utf8(message.body.bytes()) {
        Ok(text) => text.to_owned(),
        Err(_) => {
            packed.insert(BODY_ENCODING.to_owned(), serde_json::Value::from(BASE64));
            base64::engine::general_purpose::STANDARD.encode(message.body.bytes())
        }
    };

    attributes.insert(
        BAG.to_owned(),
        AttributeValue::string(serde_json::Value::Object(packed).to_string()),
    );

    SqsEnvelope { body, attributes }
}

pub fn decode(received: &SqsReceived) -> Message {
    if let Some(expected) = &received.md5_of_body {
        let actual = hex::encode(md5::compute(received.body.as_bytes()).as_ref());
        if !actual.eq_ignore_ascii_case(expected) {
            tracing::warn!(
                message_id = %received.message_id,
                expected = %expected,
                actual = %actual,
                "Message body failed its MD5 check"
            );
            return with_receipt(
                Message::unacceptable(RoutingKey::default(), Some(received.message_id.clone())),
                received,
            );
        }
    }

    let unwrapped = unwrap(received);
    let read = |name: &str| unwrapped.attributes.get(name).map(AttributeValue::as_text);

    let topic = RoutingKey::new(
        read(TOPIC)
            .or_else(|| unwrapped.topic_arn.as_deref().and_then(topic_from_arn).map(str::to_owned))
            .unwrap_or_default(),
    );

    let message_id = read(ID)
        .or_else(|| unwrapped.notification_id.clone())
        .unwrap_or_else(|| received.message_id.clone());

    let message_type = match parse_message_type(read(MESSAGE_TYPE).as_deref()) {
        Field::Present(t) => t,
        Field::Absent => {
            tracing::warn!(%message_id, "Message has no message type attribute");
            return with_receipt(Message::unacceptable(topic, Some(message_id)), received);
        }
        Field::Malformed(raw) => {
            tracing::warn!(%message_id, %raw, "Message has an unknown message type");
            return with_receipt(Message::unacceptable(topic, Some(message_id)), received);
        }
    };

    let mut bag: Bag = match read(BAG) {
        None => Bag::new(),
        Some(raw) => match serde_json::from_str::<Bag>(&raw) {
            Ok(bag) => bag,
            Err(e) => {
                tracing::warn!(%message_id, "Ignoring malformed bag attribute: {e}");
                Bag::new()
            }
        },
    };
    let mut take = |name: &str| {
        bag.remove(name).map(|value| match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
    };
    let partition_key = take(PARTITION_KEY);
    let subject = take(SUBJECT).or_else(|| unwrapped.subject.clone());
    let data_schema = take(DATA_SCHEMA);
    let source = take(SOURCE);
    let body_encoding = take(BODY_ENCODING);
    bag.retain(|key, _| !PACKED.contains(&key.as_str()));

    let content_type = read(CONTENT_TYPE).unwrap_or_else(|| "text/plain".to_owned());

    let body = if body_encoding.as_deref() == Some(BASE64) {
        match base64::engine::general_purpose::STANDARD.decode(&unwrapped.body) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::warn!(%message_id, "Body is not valid base64: {e}");
                return with_receipt(Message::unacceptable(topic, Some(message_id)), received);
            }
        }
    } else {
        Bytes::from(unwrapped.body.clone())
    };

    let mut handled_count = read(HANDLED_COUNT)
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(0);
    if let Some(receives) = received
        .system_attributes
        .get(APPROXIMATE_RECEIVE_COUNT)
        .and_then(|raw| raw.parse::<u32>().ok())
    {
        handled_count = handled_count.max(receives.saturating_sub(1));
    }

    let delayed = read(DELAY_MILLISECONDS)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .map(delay_from_millis)
        .unwrap_or_default();

    let timestamp = read(TIMESTAMP)
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    bag.insert(
        RECEIPT_HANDLE.to_owned(),
        serde_json::Value::from(received.receipt_handle.clone()),
    );

    let header = MessageHeader::builder()
        .message_id(message_id)
        .topic(topic)
        .message_type(message_type)
        .timestamp(timestamp)
        .maybe_correlation_id(read(CORRELATION_ID))
        .maybe_reply_to(read(REPLY_TO))
        .content_type(content_type.clone())
        .handled_count(handled_count)
        .maybe_partition_key(partition_key)
        .delayed(delayed)
        .maybe_subject(subject)
        .maybe_data_schema(data_schema)
        .maybe_source(source)
        .bag(bag)
        .build();

    Message::new(header, MessageBody::new(body, content_type))
}

/// Reads the receipt handle a consumer stamped into the bag.
pub fn receipt_handle(message: &Message) -> Option<String> {
    message
        .header
        .bag_str(RECEIPT_HANDLE)
        .filter(|handle| !handle.is_empty())
}

struct Unwrapped {
    attributes: HashMap<String, AttributeValue>,
    body: String,
    topic_arn: Option<String>,
    subject: Option<String>,
    notification_id: Option<String>,
}

fn unwrap(received: &SqsReceived) -> Unwrapped {
    if !received.attributes.contains_key(ID) {
        if let Ok(notification) = serde_json::from_str::<SnsNotification>(&received.body) {
            return Unwrapped {
                attributes: notification
                    .message_attributes
                    .into_iter()
                    .map(|(k, v)| (k, v.into_attribute()))
                    .collect(),
                body: notification.message,
                topic_arn: notification.topic_arn,
                subject: notification.subject,
                notification_id: notification.message_id,
            };
        }
    }

    Unwrapped {
        attributes: received.attributes.clone(),
        body: received.body.clone(),
        topic_arn: None,
        subject: None,
        notification_id: None,
    }
}

fn with_receipt(mut message: Message, received: &SqsReceived) -> Message {
    message.header.bag_mut().insert(
        RECEIPT_HANDLE.to_owned(),
        serde_json::Value::from(received.receipt_handle.clone()),
    );
    message
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn received_from(envelope: SqsEnvelope) -> SqsReceived {
        SqsReceived {
            message_id: "sqs-1".to_owned(),
            receipt_handle: "rh-1".to_owned(),
            md5_of_body: Some(hex::encode(md5::compute(envelope.body.as_bytes()).as_ref())),
            body: envelope.body,
            attributes: envelope.attributes.into_iter().collect(),
            system_attributes: HashMap::new(),
        }
    }

    fn sample() -> Message {
        let mut bag = Bag::new();
        bag.insert("tenant".to_owned(), json!("acme"));
        bag.insert("limits".to_owned(), json!({"max": 10}));
        bag.insert("ratio".to_owned(), json!(0.5));

        let header = MessageHeader::builder()
            .message_id("m-1")
            .topic("orders")
            .message_type(MessageType::Event)
            .correlation_id("c-1")
            .content_type("application/json")
            .handled_count(4)
            .partition_key("customer-7")
            .subject("order placed")
            .delayed(Duration::from_millis(2500))
            .bag(bag)
            .build();

        Message::new(header, MessageBody::new(&b"{\"a\":1}"[..], "application/json"))
    }

    #[test]
    fn test_attribute_budget() {
        let envelope = encode(&sample());
        assert!(envelope.attributes.len() <= 10);
        assert!(envelope.attributes.contains_key(BAG));
    }

    #[test]
    fn test_round_trip() {
        let decoded = decode(&received_from(encode(&sample())));

        assert_eq!(decoded.id(), "m-1");
        assert_eq!(decoded.header.topic().as_str(), "orders");
        assert_eq!(decoded.header.message_type(), MessageType::Event);
        assert_eq!(decoded.header.correlation_id(), Some("c-1"));
        assert_eq!(decoded.header.content_type(), "application/json");
        assert_eq!(decoded.header.handled_count(), 4);
        assert_eq!(decoded.header.partition_key(), Some("customer-7"));
        assert_eq!(decoded.header.subject(), Some("order placed"));
        assert_eq!(decoded.header.delayed(), Duration::from_millis(2500));
        assert_eq!(decoded.body.bytes().as_ref(), b"{\"a\":1}");

        let bag = decoded.header.bag();
        assert_eq!(bag.get("tenant"), Some(&json!("acme")));
        assert_eq!(bag.get("limits"), Some(&json!({"max": 10})));
        assert_eq!(bag.get("ratio"), Some(&json!(0.5)));
        assert!(!bag.contains_key(PARTITION_KEY));
        assert_eq!(receipt_handle(&decoded).as_deref(), Some("rh-1"));
    }

    #[test]
    fn test_binary_body_round_trip() {
        let mut message = sample();
        message.body = MessageBody::new(vec![0xff, 0x00, 0xfe], "application/octet-stream");

        let decoded = decode(&received_from(encode(&message)));

        assert_eq!(decoded.body.bytes().as_ref(), &[0xff, 0x00, 0xfe]);
        assert!(!decoded.header.bag().contains_key(BODY_ENCODING));
    }

    #[test]
    fn test_absent_message_type_is_unacceptable() {
        let mut received = received_from(encode(&sample()));
        received.attributes.remove(MESSAGE_TYPE);

        let decoded = decode(&received);
        assert!(decoded.is_unacceptable());
        assert_eq!(decoded.id(), "m-1");
        assert_eq!(decoded.header.topic().as_str(), "orders");
        assert_eq!(receipt_handle(&decoded).as_deref(), Some("rh-1"));
    }

    #[test]
    fn test_md5_mismatch_is_unacceptable() {
        let mut received = received_from(encode(&sample()));
        received.md5_of_body = Some("00000000000000000000000000000000".to_owned());

        assert!(decode(&received).is_unacceptable());
    }

    #[test]
    fn test_sns_notification_is_unwrapped() {
        let envelope = encode(&sample());
        let attributes: serde_json::Map<String, serde_json::Value> = envelope
            .attributes
            .iter()
            .filter(|(k, _)| k.as_str() != TOPIC)
            .map(|(k, v)| {
                (
                    k.clone(),
                    json!({"Type": v.data_type(), "Value": v.as_text()}),
                )
            })
            .collect();

        let notification = json!({
            "Type": "Notification",
            "MessageId": "sns-9",
            "TopicArn": "arn:aws:sns:eu-west-1:123456789012:orders-topic",
            "Message": envelope.body,
            "Timestamp": "2024-01-01T00:00:00.000Z",
            "MessageAttributes": attributes,
        });

        let received = SqsReceived {
            message_id: "sqs-2".to_owned(),
            receipt_handle: "rh-2".to_owned(),
            body: notification.to_string(),
            ..Default::default()
        };

        let decoded = decode(&received);
        assert_eq!(decoded.id(), "m-1");
        assert_eq!(decoded.header.topic().as_str(), "orders-topic");
        assert_eq!(decoded.header.message_type(), MessageType::Event);
        assert_eq!(decoded.body.bytes().as_ref(), b"{\"a\":1}");
    }

    #[test]
    fn test_receive_count_raises_handled_count() {
        let mut received = received_from(encode(&sample()));
        received
            .system_attributes
            .insert(APPROXIMATE_RECEIVE_COUNT.to_owned(), "8".to_owned());

        assert_eq!(decode(&received).header.handled_count(), 7);

        received
            .system_attributes
            .insert(APPROXIMATE_RECEIVE_COUNT.to_owned(), "2".to_owned());
        assert_eq!(decode(&received).header.handled_count(), 4);
    }

    #[test]
    fn test_topic_from_arn() {
        assert_eq!(
            topic_from_arn("arn:aws:sns:us-east-1:123456789012:orders"),
            Some("orders")
        );
        assert_eq!(topic_from_arn("orders"), None);
    }

    #[test]
    fn test_binary_attributes_read_as_text() {
        let mut received = received_from(encode(&sample()));
        received.attributes.insert(
            CORRELATION_ID.to_owned(),
            AttributeValue::Binary {
                binary_value: b"c-bin".to_vec(),
            },
        );

        assert_eq!(decode(&received).header.correlation_id(), Some("c-bin"));
    }
}
