use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid configuration: {message}"))]
    Configuration { message: String },

    #[snafu(display("Broker unreachable at {target}: {reason}"))]
    BrokerUnreachable {
        target: String,
        reason: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Channel failure on {target}: {reason}"))]
    ChannelFailure {
        target: String,
        reason: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Broker rejected message {message_id} on {target}: {reason}"))]
    PublishRejected {
        message_id: String,
        target: String,
        reason: String,
    },

    #[snafu(display("Operation on {target} was cancelled"))]
    Cancelled { target: String },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Whatever {
            message: format!("serialization failed: {e}"),
            source: Some(e.into()),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::config(format!("invalid url: {e}"))
    }
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unreachable(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BrokerUnreachable {
            target: target.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn unreachable_from(target: impl Into<String>, e: impl Into<eyre::Report>) -> Self {
        let report = e.into();
        Self::BrokerUnreachable {
            target: target.into(),
            reason: format!("{report}"),
            source: Some(report),
        }
    }

    pub fn channel_failure(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ChannelFailure {
            target: target.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn channel_failure_from(target: impl Into<String>, e: impl Into<eyre::Report>) -> Self {
        let report = e.into();
        Self::ChannelFailure {
            target: target.into(),
            reason: format!("{report}"),
            source: Some(report),
        }
    }

    pub fn rejected(
        message_id: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::PublishRejected {
            message_id: message_id.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(target: impl Into<String>) -> Self {
        Self::Cancelled {
            target: target.into(),
        }
    }

    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        let report = e.into();
        Self::Whatever {
            message: format!("{report}"),
            source: Some(report),
        }
    }

    /// Faults the resilience policy is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnreachable { .. } | Self::ChannelFailure { .. }
        )
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::BrokerUnreachable { .. })
    }

    /// Re-labels a channel failure as broker unreachable, keeping the cause.
    pub fn into_unreachable(self) -> Self {
        match self {
            Self::ChannelFailure {
                target,
                reason,
                source,
            } => Self::BrokerUnreachable {
                target,
                reason,
                source,
            },
            other => other,
        }
    }

    /// Re-labels a transient fault as a channel failure, keeping the cause.
    pub fn into_channel_failure(self) -> Self {
        match self {
            Self::BrokerUnreachable {
                target,
                reason,
                source,
            } => Self::ChannelFailure {
                target,
                reason,
                source,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::unreachable("orders", "connection refused").is_transient());
        assert!(Error::channel_failure("orders", "socket closed").is_transient());
        assert!(!Error::config("missing uri").is_transient());
        assert!(!Error::rejected("1", "orders", "queue full").is_transient());
        assert!(!Error::cancelled("orders").is_transient());
    }

    #[test]
    fn test_relabel_keeps_context() {
        let err = Error::channel_failure("orders", "not found").into_unreachable();
        match err {
            Error::BrokerUnreachable { target, reason, .. } => {
                assert_eq!(target, "orders");
                assert_eq!(reason, "not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
