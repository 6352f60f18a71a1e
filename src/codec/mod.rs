//! Mapping between [`Message`](crate::message::Message) and each broker's
//! native header/attribute representation.
//!
//! Both directions are pure. Decoding is total: anything malformed comes
//! back as the unacceptable sentinel with whatever id and topic could be
//! salvaged, and the cause is logged here rather than raised.

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};

use crate::message::MessageType;

pub mod amqp;
pub mod sqs;

pub const ID: &str = "id";
pub const TOPIC: &str = "topic";
pub const CONTENT_TYPE: &str = "content-type";
pub const CORRELATION_ID: &str = "correlation-id";
pub const HANDLED_COUNT: &str = "handled-count";
pub const MESSAGE_TYPE: &str = "message-type";
pub const TIMESTAMP: &str = "timestamp";
pub const REPLY_TO: &str = "reply-to";
pub const BAG: &str = "bag";
pub const DELAY_MILLISECONDS: &str = "delay-milliseconds";
pub const PARTITION_KEY: &str = "partition-key";
pub const SUBJECT: &str = "subject";
pub const DATA_SCHEMA: &str = "data-schema";
pub const SOURCE: &str = "source";

/// Header read by the RabbitMQ delayed-message exchange. The broker flips its
/// sign once the delay has elapsed.
pub const X_DELAY: &str = "x-delay";

/// Names that are never treated as bag entries.
pub const RESERVED: &[&str] = &[
    ID,
    TOPIC,
    CONTENT_TYPE,
    CORRELATION_ID,
    HANDLED_COUNT,
    MESSAGE_TYPE,
    TIMESTAMP,
    REPLY_TO,
    BAG,
    DELAY_MILLISECONDS,
    PARTITION_KEY,
    SUBJECT,
    DATA_SCHEMA,
    SOURCE,
    X_DELAY,
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

/// Outcome of reading one canonical field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Field<T> {
    Present(T),
    Absent,
    Malformed(String),
}

pub(crate) fn parse_message_type(raw: Option<&str>) -> Field<MessageType> {
    match raw {
        None => Field::Absent,
        Some(raw) => match MessageType::from_str(raw.trim()) {
            Ok(t) => Field::Present(t),
            Err(_) => Field::Malformed(raw.to_owned()),
        },
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Brokers may report an elapsed delay as negative; the header always holds
/// the magnitude that was asked for.
pub(crate) fn delay_from_millis(millis: i64) -> Duration {
    Duration::from_millis(millis.unsigned_abs())
}

pub(crate) fn delay_to_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sign_is_normalized() {
        assert_eq!(delay_from_millis(-2000), Duration::from_secs(2));
        assert_eq!(delay_from_millis(2000), Duration::from_secs(2));
        assert_eq!(delay_from_millis(0), Duration::ZERO);
        assert_eq!(delay_from_millis(i64::MIN), Duration::from_millis(1 << 63));
    }

    #[test]
    fn test_message_type_field() {
        assert_eq!(parse_message_type(None), Field::Absent);
        assert_eq!(
            parse_message_type(Some("MT_COMMAND")),
            Field::Present(MessageType::Command)
        );
        assert!(matches!(
            parse_message_type(Some("bogus")),
            Field::Malformed(_)
        ));
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
