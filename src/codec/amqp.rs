//! AMQP headers <-> [`Message`].
//!
//! Canonical fields travel both as AMQP basic properties (where the protocol
//! has a slot for them) and as named headers. Bag entries become headers of
//! their own, since AMQP puts no practical limit on header count.
//!
//! An absent `message-type` header decodes as [`MessageType::Event`]. The SQS
//! decoder treats the same situation as unacceptable; see
//! [`super::sqs`].

use std::str::FromStr;

use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};

use super::*;
use crate::message::{
    Bag, Message, MessageBody, MessageHeader, MessageType, RoutingKey, DELIVERY_TAG,
    RECEIPT_HANDLE,
};

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Longest value an AMQP short string can hold, in bytes.
const SHORT_STRING_MAX: usize = 255;

/// `None` when `value` does not fit a short string. The full value still
/// travels as a header.
fn short(value: &str) -> Option<ShortString> {
    (value.len() <= SHORT_STRING_MAX).then(|| ShortString::from(value))
}

/// An outgoing AMQP publish, minus the exchange (the producer picks that).
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpEnvelope {
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl AmqpEnvelope {
    pub fn header(&self, name: &str) -> Option<&AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|headers| lookup(headers, name))
    }
}

/// A delivery as handed over by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

pub fn encode(message: &Message) -> AmqpEnvelope {
    let header = &message.header;
    let mut headers = FieldTable::default();

    let mut put = |name: &str, value: AMQPValue| {
        headers.insert(ShortString::from(name), value);
    };

    put(ID, long_string(header.message_id()));
    put(TOPIC, long_string(header.topic().as_str()));
    put(CONTENT_TYPE, long_string(header.content_type()));
    put(MESSAGE_TYPE, long_string(&header.message_type().to_string()));
    put(TIMESTAMP, long_string(&format_timestamp(header.timestamp())));
    put(
        HANDLED_COUNT,
        AMQPValue::LongInt(i32::try_from(header.handled_count()).unwrap_or(i32::MAX)),
    );

    let optional = [
        (CORRELATION_ID, header.correlation_id()),
        (REPLY_TO, header.reply_to()),
        (PARTITION_KEY, header.partition_key()),
        (SUBJECT, header.subject()),
        (DATA_SCHEMA, header.data_schema()),
        (SOURCE, header.source()),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            put(name, long_string(value));
        }
    }

    if !header.delayed().is_zero() {
        let millis = delay_to_millis(header.delayed());
        put(DELAY_MILLISECONDS, AMQPValue::LongLongInt(millis));
        put(X_DELAY, AMQPValue::LongLongInt(millis));
    }

    for (key, value) in header.bag() {
        if is_reserved(key) || key == DELIVERY_TAG || key == RECEIPT_HANDLE {
            continue;
        }
        if key.len() > SHORT_STRING_MAX {
            tracing::warn!(message_id = %header.message_id(), "Dropping bag entry with an over-long key");
            continue;
        }
        put(key, json_to_amqp(value));
    }

    let mut properties = BasicProperties::default()
        .with_timestamp(header.timestamp().timestamp().max(0) as u64)
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);

    if let Some(message_id) = short(header.message_id()) {
        properties = properties.with_message_id(message_id);
    }
    if let Some(content_type) = short(message.body.content_type()) {
        properties = properties.with_content_type(content_type);
    }
    if let Some(correlation_id) = header.correlation_id().and_then(short) {
        properties = properties.with_correlation_id(correlation_id);
    }
    if let Some(reply_to) = header.reply_to().and_then(short) {
        properties = properties.with_reply_to(reply_to);
    }

    AmqpEnvelope {
        routing_key: header.topic().to_string(),
        properties,
        body: message.body.bytes().to_vec(),
    }
}

pub fn decode(delivery: &AmqpDelivery) -> Message {
    let empty = FieldTable::default();
    let headers = delivery.properties.headers().as_ref().unwrap_or(&empty);
    let read = |name: &str| lookup(headers, name).and_then(amqp_to_string);

    let topic = RoutingKey::new(read(TOPIC).unwrap_or_else(|| delivery.routing_key.clone()));

    let message_id = read(ID).or_else(|| {
        delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
    });
    let Some(message_id) = message_id else {
        tracing::warn!(topic = %topic, tag = delivery.delivery_tag, "Delivery has no message id");
        return tagged(Message::unacceptable(topic, None), delivery);
    };

    let message_type = match parse_message_type(read(MESSAGE_TYPE).as_deref()) {
        Field::Present(t) => t,
        Field::Absent => MessageType::Event,
        Field::Malformed(raw) => {
            tracing::warn!(%message_id, %raw, "Delivery has an unknown message type");
            return tagged(Message::unacceptable(topic, Some(message_id)), delivery);
        }
    };

    let timestamp = read(TIMESTAMP)
        .as_deref()
        .and_then(parse_timestamp)
        .or_else(|| {
            delivery
                .properties
                .timestamp()
                .as_ref()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(*secs as i64, 0))
        })
        .unwrap_or_else(Utc::now);

    let handled_count = match lookup(headers, HANDLED_COUNT) {
        None => 0,
        Some(value) => match amqp_to_i64(value) {
            Some(count) => u32::try_from(count.max(0)).unwrap_or(u32::MAX),
            None => {
                tracing::warn!(%message_id, "Ignoring malformed handled count");
                0
            }
        },
    };

    let delayed = lookup(headers, DELAY_MILLISECONDS)
        .or_else(|| lookup(headers, X_DELAY))
        .and_then(amqp_to_i64)
        .map(delay_from_millis)
        .unwrap_or_default();

    let content_type = read(CONTENT_TYPE)
        .or_else(|| {
            delivery
                .properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_owned())
        })
        .unwrap_or_else(|| "text/plain".to_owned());

    let correlation_id = read(CORRELATION_ID).or_else(|| {
        delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
    });
    let reply_to = read(REPLY_TO).or_else(|| {
        delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|r| r.as_str().to_owned())
    });

    let mut bag: Bag = headers
        .inner()
        .iter()
        .filter(|(key, _)| !is_reserved(key.as_str()))
        .map(|(key, value)| (key.as_str().to_owned(), amqp_to_json(value)))
        .collect();
    bag.insert(
        DELIVERY_TAG.to_owned(),
        serde_json::Value::from(delivery.delivery_tag),
    );

    let header = MessageHeader::builder()
        .message_id(message_id)
        .topic(topic)
        .message_type(message_type)
        .timestamp(timestamp)
        .maybe_correlation_id(correlation_id)
        .maybe_reply_to(reply_to)
        .content_type(content_type.clone())
        .handled_count(handled_count)
        .maybe_partition_key(read(PARTITION_KEY))
        .delayed(delayed)
        .maybe_subject(read(SUBJECT))
        .maybe_data_schema(read(DATA_SCHEMA))
        .maybe_source(read(SOURCE))
        .bag(bag)
        .build();

    Message::new(
        header,
        MessageBody::new(Bytes::copy_from_slice(&delivery.body), content_type),
    )
}

/// Sentinels still need their delivery tag so they can be settled.
fn tagged(mut message: Message, delivery: &AmqpDelivery) -> Message {
    message.header.bag_mut().insert(
        DELIVERY_TAG.to_owned(),
        serde_json::Value::from(delivery.delivery_tag),
    );
    message
}

/// Reads the delivery tag a consumer stamped into the bag.
pub fn delivery_tag(message: &Message) -> Option<u64> {
    match message.header.bag().get(DELIVERY_TAG)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => u64::from_str(s).ok(),
        _ => None,
    }
}

pub fn lookup<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table.inner().get(&ShortString::from(name))
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

/// Header values may arrive as text or as raw bytes depending on the client
/// that wrote them.
pub fn amqp_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        AMQPValue::ByteArray(bytes) => Some(String::from_utf8_lossy(bytes.as_slice()).into_owned()),
        AMQPValue::Void => None,
        other => match amqp_to_json(other) {
            serde_json::Value::String(s) => Some(s),
            json => Some(json.to_string()),
        },
    }
}

pub fn amqp_to_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        AMQPValue::Float(v) => Some(*v as i64),
        AMQPValue::Double(v) => Some(*v as i64),
        other => amqp_to_string(other).and_then(|s| s.trim().parse().ok()),
    }
}

pub fn amqp_to_json(value: &AMQPValue) -> serde_json::Value {
    use serde_json::Value;

    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(f64::from(*v)),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_owned()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ByteArray(bytes) => match std::str::from_utf8(bytes.as_slice()) {
            Ok(text) => Value::String(text.to_owned()),
            Err(_) => Value::String(base64::engine::general_purpose::STANDARD.encode(bytes.as_slice())),
        },
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), amqp_to_json(v)))
                .collect(),
        ),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{other:?}")),
    }
}

/// Arrays and objects are written as their JSON text.
pub fn json_to_amqp(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;

    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => long_string(&n.to_string()),
        },
        Value::String(s) => long_string(s),
        other => long_string(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn delivery_from(envelope: AmqpEnvelope, tag: u64) -> AmqpDelivery {
        AmqpDelivery {
            delivery_tag: tag,
            redelivered: false,
            exchange: "switchyard".to_owned(),
            routing_key: envelope.routing_key,
            properties: envelope.properties,
            body: envelope.body,
        }
    }

    fn sample() -> Message {
        let mut bag = Bag::new();
        bag.insert("tenant".to_owned(), json!("acme"));
        bag.insert("attempt".to_owned(), json!(3));
        bag.insert("flag".to_owned(), json!(true));

        let header = MessageHeader::builder()
            .message_id("m-1")
            .topic("orders")
            .message_type(MessageType::Command)
            .correlation_id("c-1")
            .reply_to("replies")
            .content_type("application/json")
            .handled_count(2)
            .delayed(Duration::from_secs(2))
            .bag(bag)
            .build();

        Message::new(header, MessageBody::new(&b"{\"a\":1}"[..], "application/json"))
    }

    #[test]
    fn test_round_trip_preserves_canonical_fields_and_bag() {
        let message = sample();
        let decoded = decode(&delivery_from(encode(&message), 9));

        assert_eq!(decoded.id(), "m-1");
        assert_eq!(decoded.header.topic().as_str(), "orders");
        assert_eq!(decoded.header.message_type(), MessageType::Command);
        assert_eq!(decoded.header.correlation_id(), Some("c-1"));
        assert_eq!(decoded.header.reply_to(), Some("replies"));
        assert_eq!(decoded.header.content_type(), "application/json");
        assert_eq!(decoded.header.handled_count(), 2);
        assert_eq!(decoded.header.delayed(), Duration::from_secs(2));
        assert_eq!(decoded.body.bytes().as_ref(), b"{\"a\":1}");

        let bag = decoded.header.bag();
        assert_eq!(bag.get("tenant"), Some(&json!("acme")));
        assert_eq!(bag.get("attempt"), Some(&json!(3)));
        assert_eq!(bag.get("flag"), Some(&json!(true)));
        assert_eq!(delivery_tag(&decoded), Some(9));
    }

    #[test]
    fn test_long_ids_travel_only_as_headers() {
        let long = "x".repeat(300);
        let mut message = sample();
        message.header = MessageHeader::builder()
            .message_id(long.as_str())
            .topic("orders")
            .message_type(MessageType::Command)
            .correlation_id(long.as_str())
            .build();

        let envelope = encode(&message);
        assert!(envelope.properties.message_id().is_none());
        assert!(envelope.properties.correlation_id().is_none());

        let decoded = decode(&delivery_from(envelope, 1));
        assert_eq!(decoded.id(), long);
        assert_eq!(decoded.header.correlation_id(), Some(long.as_str()));
    }

    #[test]
    fn test_nested_bag_values_become_json_text() {
        let mut message = sample();
        message
            .header
            .bag_mut()
            .insert("nested".to_owned(), json!({"k": [1, 2]}));

        let decoded = decode(&delivery_from(encode(&message), 1));

        assert_eq!(
            decoded.header.bag().get("nested"),
            Some(&json!("{\"k\":[1,2]}"))
        );
    }

    #[test]
    fn test_absent_message_type_defaults_to_event() {
        let mut envelope = encode(&sample());
        let headers = envelope.properties.headers().clone().unwrap();
        let mut stripped = FieldTable::default();
        for (k, v) in headers.inner() {
            if k.as_str() != MESSAGE_TYPE {
                stripped.insert(k.clone(), v.clone());
            }
        }
        envelope.properties = envelope.properties.with_headers(stripped);

        let decoded = decode(&delivery_from(envelope, 1));
        assert_eq!(decoded.header.message_type(), MessageType::Event);
    }

    #[test]
    fn test_unknown_message_type_is_unacceptable() {
        let mut headers = FieldTable::default();
        headers.insert(ID.into(), long_string("m-2"));
        headers.insert(MESSAGE_TYPE.into(), long_string("MT_SOMETHING"));

        let delivery = AmqpDelivery {
            delivery_tag: 4,
            redelivered: false,
            exchange: String::new(),
            routing_key: "orders".to_owned(),
            properties: BasicProperties::default().with_headers(headers),
            body: b"x".to_vec(),
        };

        let decoded = decode(&delivery);
        assert!(decoded.is_unacceptable());
        assert_eq!(decoded.id(), "m-2");
        assert_eq!(decoded.header.topic().as_str(), "orders");
        assert_eq!(delivery_tag(&decoded), Some(4));
    }

    #[test]
    fn test_missing_headers_fall_back_to_properties() {
        let delivery = AmqpDelivery {
            delivery_tag: 1,
            redelivered: false,
            exchange: String::new(),
            routing_key: "orders".to_owned(),
            properties: BasicProperties::default()
                .with_message_id("from-props".into())
                .with_content_type("application/octet-stream".into())
                .with_correlation_id("corr".into()),
            body: vec![1, 2, 3],
        };

        let decoded = decode(&delivery);
        assert_eq!(decoded.id(), "from-props");
        assert_eq!(decoded.header.message_type(), MessageType::Event);
        assert_eq!(decoded.header.content_type(), "application/octet-stream");
        assert_eq!(decoded.header.correlation_id(), Some("corr"));
        assert_eq!(decoded.header.handled_count(), 0);
    }

    #[test]
    fn test_elapsed_negative_delay_and_byte_headers() {
        let mut headers = FieldTable::default();
        headers.insert(ID.into(), AMQPValue::ByteArray(b"bytes-id".to_vec().into()));
        headers.insert(HANDLED_COUNT.into(), long_string("5"));
        headers.insert(X_DELAY.into(), AMQPValue::LongLongInt(-1500));

        let delivery = AmqpDelivery {
            delivery_tag: 1,
            redelivered: true,
            exchange: String::new(),
            routing_key: "orders".to_owned(),
            properties: BasicProperties::default().with_headers(headers),
            body: Vec::new(),
        };

        let decoded = decode(&delivery);
        assert_eq!(decoded.id(), "bytes-id");
        assert_eq!(decoded.header.handled_count(), 5);
        assert_eq!(decoded.header.delayed(), Duration::from_millis(1500));
        assert!(!decoded.header.bag().contains_key(X_DELAY));
    }

    #[test]
    fn test_no_id_anywhere_is_unacceptable() {
        let delivery = AmqpDelivery {
            delivery_tag: 2,
            redelivered: false,
            exchange: String::new(),
            routing_key: "orders".to_owned(),
            properties: BasicProperties::default(),
            body: Vec::new(),
        };

        let decoded = decode(&delivery);
        assert!(decoded.is_unacceptable());
        assert_eq!(decoded.header.topic().as_str(), "orders");
    }
}
