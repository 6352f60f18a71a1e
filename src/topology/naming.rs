//! Broker-specific name normalization.
//!
//! Every function here is deterministic and idempotent: feeding an output
//! back in returns it unchanged.

/// Longest SQS queue name, `.fifo` suffix included.
pub const SQS_MAX_LEN: usize = 80;
/// Longest SNS topic name, `.fifo` suffix included.
pub const SNS_MAX_LEN: usize = 256;
/// AMQP short strings are limited to 255 bytes.
pub const AMQP_MAX_LEN: usize = 255;

pub const FIFO_SUFFIX: &str = ".fifo";

fn is_aws_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn aws_name(name: &str, fifo: bool, max_len: usize) -> String {
    let stem = if fifo {
        name.strip_suffix(FIFO_SUFFIX).unwrap_or(name)
    } else {
        name
    };

    let budget = if fifo { max_len - FIFO_SUFFIX.len() } else { max_len };
    let mut normalized: String = stem
        .chars()
        .map(|c| if is_aws_name_char(c) { c } else { '_' })
        .take(budget)
        .collect();

    if fifo {
        normalized.push_str(FIFO_SUFFIX);
    }
    normalized
}

/// SQS queue name: alphanumerics, `-` and `_` only, at most 80 characters,
/// FIFO queues end in `.fifo`.
pub fn sqs_queue_name(name: &str, fifo: bool) -> String {
    aws_name(name, fifo, SQS_MAX_LEN)
}

/// SNS topic name: same charset as SQS, at most 256 characters.
pub fn sns_topic_name(name: &str, fifo: bool) -> String {
    aws_name(name, fifo, SNS_MAX_LEN)
}

/// AMQP exchange, queue and routing key names. Any character is allowed, so
/// this only truncates, on a character boundary.
pub fn amqp_name(name: &str) -> String {
    if name.len() <= AMQP_MAX_LEN {
        return name.to_owned();
    }

    let mut end = AMQP_MAX_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqs_dots_replaced_and_truncated() {
        let long = format!("orders.{}", "x".repeat(100));

        let normalized = sqs_queue_name(&long, false);
        assert_eq!(normalized.len(), SQS_MAX_LEN);
        assert!(normalized.starts_with("orders_xxx"));
        assert!(!normalized.contains('.'));

        assert_eq!(sqs_queue_name(&long, false), normalized);
        assert_eq!(sqs_queue_name(&normalized, false), normalized);
    }

    #[test]
    fn test_fifo_suffix_is_kept_within_limit() {
        let long = format!("payments.{}", "y".repeat(100));

        let normalized = sqs_queue_name(&long, true);
        assert_eq!(normalized.len(), SQS_MAX_LEN);
        assert!(normalized.ends_with(".fifo"));
        assert_eq!(sqs_queue_name(&normalized, true), normalized);

        assert_eq!(sqs_queue_name("payments.fifo", true), "payments.fifo");
        assert_eq!(sqs_queue_name("payments", true), "payments.fifo");
    }

    #[test]
    fn test_sns_limit() {
        let normalized = sns_topic_name(&"t".repeat(300), false);
        assert_eq!(normalized.len(), SNS_MAX_LEN);
        assert_eq!(sns_topic_name("order.created", false), "order_created");
    }

    #[test]
    fn test_amqp_truncates_on_char_boundary() {
        assert_eq!(amqp_name("orders.created"), "orders.created");

        let long = "é".repeat(200);
        let normalized = amqp_name(&long);
        assert!(normalized.len() <= AMQP_MAX_LEN);
        assert_eq!(normalized.chars().count(), 127);
        assert_eq!(amqp_name(&normalized), normalized);
    }
}
