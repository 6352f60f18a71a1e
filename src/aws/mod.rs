//! SNS/SQS backend.
//!
//! Publications go to an SNS topic ([`SnsProducer`]) or straight to an SQS
//! queue ([`SqsProducer`]). Subscriptions read an SQS queue, optionally
//! subscribed to an SNS topic so the pair behaves like an exchange-bound
//! queue. SNS has no delayed delivery, so delayed topic publishes go through
//! the scheduler. SQS delays natively up to fifteen minutes.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    message::{ChannelName, RoutingKey, SubscriptionName},
    pool::{ConnectionPool, Endpoint, PoolKey},
    topology::{RedrivePolicy, TopologyPolicy},
};

pub mod client;
pub mod consumer;
pub mod memory;
pub mod producer;
pub mod sdk;
pub mod topology;

pub use client::{AwsClients, SnsApi, SqsApi, StsApi};
pub use consumer::{SqsChannelFactory, SqsConsumer};
pub use producer::{SnsProducer, SqsProducer};

pub type AwsPool = ConnectionPool<AwsEndpoint, AwsClients>;

/// Longest delay SQS applies to a send.
pub const MAX_SEND_DELAY: Duration = Duration::from_secs(900);
/// Longest visibility timeout SQS accepts.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);
/// Most messages one `ReceiveMessage` returns.
pub const MAX_RECEIVE_BATCH: u8 = 10;
/// Longest long-poll wait.
pub const MAX_WAIT: Duration = Duration::from_secs(20);

/// Region, endpoint override and credentials for one AWS account.
#[derive(Clone, Debug)]
pub struct AwsEndpoint {
    region: String,
    endpoint_url: Option<Url>,
    profile: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<SecretString>,
}

impl AwsEndpoint {
    pub fn new(region: impl Into<String>) -> Result<Self> {
        let region = region.into();
        if region.trim().is_empty() {
            return Err(Error::config("AWS region must not be empty"));
        }
        Ok(Self {
            region,
            endpoint_url: None,
            profile: None,
            access_key_id: None,
            secret_access_key: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let region = config
            .aws_region
            .clone()
            .ok_or_else(|| Error::config("SWITCHYARD_AWS_REGION is not set"))?;
        let mut endpoint = Self::new(region)?;
        if let Some(url) = &config.aws_endpoint {
            endpoint = endpoint.with_endpoint(url)?;
        }
        if let Some(profile) = &config.aws_profile {
            endpoint = endpoint.with_profile(profile);
        }
        Ok(endpoint)
    }

    /// Points every client at a non-AWS endpoint, e.g. LocalStack.
    pub fn with_endpoint(mut self, url: &str) -> Result<Self> {
        self.endpoint_url = Some(Url::parse(url)?);
        Ok(self)
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(SecretString::from(secret_access_key.into()));
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn endpoint_url(&self) -> Option<&Url> {
        self.endpoint_url.as_ref()
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub(crate) fn credentials(&self) -> Option<(&str, &SecretString)> {
        self.access_key_id
            .as_deref()
            .zip(self.secret_access_key.as_ref())
    }

    /// ARN partition the region belongs to.
    pub fn partition(&self) -> &'static str {
        partition_for(&self.region)
    }
}

pub fn partition_for(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

impl Endpoint for AwsEndpoint {
    fn pool_key(&self) -> PoolKey {
        let fingerprint = self
            .secret_access_key
            .as_ref()
            .map(|secret| {
                let digest = Sha256::digest(secret.expose_secret().as_bytes());
                hex::encode(&digest[..8])
            })
            .unwrap_or_default();

        PoolKey::new(format!(
            "aws://{}@{}/{}/{}#{}",
            self.access_key_id.as_deref().unwrap_or_default(),
            self.region,
            self.endpoint_url
                .as_ref()
                .map(Url::as_str)
                .unwrap_or("default"),
            self.profile.as_deref().unwrap_or_default(),
            fingerprint
        ))
    }
}

/// How a topic name is turned into an ARN when checking it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
pub enum TopicFindBy {
    /// The routing key already is the topic ARN.
    ExactAddress,
    /// Build the ARN from partition, region, account and name.
    #[default]
    Convention,
    /// Scan `ListTopics` for the name. Rate limited by AWS.
    Name,
}

/// How a queue is identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
pub enum QueueFindBy {
    #[default]
    Name,
    /// The channel name is the queue URL.
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct TopicAttributes {
    #[builder(default)]
    pub find_by: TopicFindBy,
    #[builder(default)]
    pub fifo: bool,
    #[builder(default)]
    pub content_based_deduplication: bool,
}

impl Default for TopicAttributes {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct SqsAttributes {
    #[builder(default)]
    pub find_by: QueueFindBy,
    #[builder(default = Duration::from_secs(30))]
    pub visibility_timeout: Duration,
    #[builder(default)]
    pub delay: Duration,
    #[builder(default = Duration::from_secs(4 * 24 * 60 * 60))]
    pub retention: Duration,
    #[builder(default)]
    pub fifo: bool,
    #[builder(default)]
    pub content_based_deduplication: bool,
    /// Deliver SNS notifications without the JSON wrapper.
    #[builder(default = true)]
    pub raw_message_delivery: bool,
    pub redrive: Option<RedrivePolicy>,
}

impl Default for SqsAttributes {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// An SQS queue, optionally fed by the SNS topic named by `routing_key`.
#[derive(Debug, Clone, bon::Builder)]
pub struct SqsSubscription {
    #[builder(into)]
    pub name: SubscriptionName,
    #[builder(into)]
    pub channel_name: ChannelName,
    #[builder(into)]
    pub routing_key: RoutingKey,
    #[builder(default)]
    pub topic: TopicAttributes,
    /// Read the queue directly, with no topic in front of it.
    #[builder(default)]
    pub point_to_point: bool,
    #[builder(default)]
    pub queue: SqsAttributes,
    #[builder(default)]
    pub policy: TopologyPolicy,
    #[builder(default = 1)]
    pub batch_size: u8,
}

impl SqsSubscription {
    pub fn batch_size(&self) -> i32 {
        i32::from(self.batch_size.clamp(1, MAX_RECEIVE_BATCH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions() {
        assert_eq!(partition_for("eu-west-1"), "aws");
        assert_eq!(partition_for("cn-north-1"), "aws-cn");
        assert_eq!(partition_for("us-gov-west-1"), "aws-us-gov");
    }

    #[test]
    fn test_pool_key_fingerprints_secret() {
        let a = AwsEndpoint::new("eu-west-1")
            .unwrap()
            .with_credentials("AKIA1", "very-secret");
        let b = AwsEndpoint::new("EU-WEST-1")
            .unwrap()
            .with_credentials("akia1", "very-secret");
        let c = AwsEndpoint::new("eu-west-1")
            .unwrap()
            .with_credentials("AKIA1", "rotated");

        assert_eq!(a.pool_key(), b.pool_key());
        assert_ne!(a.pool_key(), c.pool_key());
        assert!(!a.pool_key().as_str().contains("very-secret"));
    }

    #[test]
    fn test_endpoint_from_config() {
        let config = Config {
            aws_region: Some("us-east-1".to_owned()),
            aws_endpoint: Some("http://localhost:4566".to_owned()),
            ..Config::default()
        };
        let endpoint = AwsEndpoint::from_config(&config).unwrap();
        assert_eq!(endpoint.region(), "us-east-1");
        assert_eq!(
            endpoint.endpoint_url().map(Url::as_str),
            Some("http://localhost:4566/")
        );

        assert!(matches!(
            AwsEndpoint::from_config(&Config::default()),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_batch_size_is_clamped() {
        let subscription = SqsSubscription::builder()
            .name("billing")
            .channel_name("orders")
            .routing_key("orders")
            .batch_size(50)
            .build();
        assert_eq!(subscription.batch_size(), 10);
    }
}
