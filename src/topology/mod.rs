//! Reconciling the topology a producer or consumer needs with what the broker
//! already has.
//!
//! Backend-specific provisioners live next to their backends
//! ([`crate::amqp::topology`], [`crate::aws::topology`]); this module holds
//! the pieces they share.

use strum::{Display, EnumString};

pub mod naming;

/// How much the gateway is allowed to do to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
pub enum TopologyPolicy {
    /// Declare whatever is missing. Safe to repeat.
    #[default]
    Create,
    /// Check that everything exists, changing nothing.
    Validate,
    /// Trust the configuration and make no broker calls at all.
    Assume,
}

/// Result of a read-only existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Existence<A> {
    Found(A),
    NotFound,
}

impl<A> Existence<A> {
    pub fn found(self) -> Option<A> {
        match self {
            Self::Found(address) => Some(address),
            Self::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

impl<A> From<Option<A>> for Existence<A> {
    fn from(value: Option<A>) -> Self {
        match value {
            Some(address) => Self::Found(address),
            None => Self::NotFound,
        }
    }
}

/// Dead-letter target and the delivery budget before a message is sent there.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct RedrivePolicy {
    /// Queue (channel) dead-lettered messages end up in.
    #[builder(into)]
    pub dead_letter_channel: String,
    /// Routing key used to reach it; defaults to the channel name.
    #[builder(into)]
    pub dead_letter_routing_key: Option<String>,
    #[builder(default = 3)]
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn routing_key(&self) -> &str {
        self.dead_letter_routing_key
            .as_deref()
            .unwrap_or(&self.dead_letter_channel)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_policy_parses_from_config_strings() {
        assert_eq!(TopologyPolicy::from_str("Validate").unwrap(), TopologyPolicy::Validate);
        assert_eq!(TopologyPolicy::default(), TopologyPolicy::Create);
        assert_eq!(TopologyPolicy::Assume.to_string(), "Assume");
    }

    #[test]
    fn test_redrive_routing_key_defaults_to_channel() {
        let policy = RedrivePolicy::builder().dead_letter_channel("orders.dlq").build();
        assert_eq!(policy.routing_key(), "orders.dlq");
        assert_eq!(policy.max_receive_count, 3);

        let policy = RedrivePolicy::builder()
            .dead_letter_channel("orders.dlq")
            .dead_letter_routing_key("dead")
            .build();
        assert_eq!(policy.routing_key(), "dead");
    }
}
