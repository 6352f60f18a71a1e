//! Topic, queue and subscription provisioning on SNS/SQS.
//!
//! Under [`TopologyPolicy::Assume`] nothing is looked up: the configured
//! routing key is the topic ARN, and the channel name and dead-letter channel
//! are the queue URLs.

use std::collections::HashMap;

use super::{
    partition_for, AwsClients, QueueFindBy, SqsAttributes, SqsSubscription, TopicAttributes,
    TopicFindBy,
};
use crate::{
    codec::sqs::topic_from_arn,
    error::{Error, Result},
    topology::{
        naming::{sns_topic_name, sqs_queue_name},
        Existence, TopologyPolicy,
    },
};

fn missing(what: &str, name: &str) -> Error {
    Error::unreachable(name, format!("{what} {name} does not exist"))
}

/// Finds a topic's ARN the way its [`TopicFindBy`] says to.
pub struct TopicLookup {
    find_by: TopicFindBy,
    /// Convention ARNs by topic name, so the caller identity is fetched once.
    conventions: papaya::HashMap<String, String>,
}

impl TopicLookup {
    pub fn new(find_by: TopicFindBy) -> Self {
        Self {
            find_by,
            conventions: papaya::HashMap::new(),
        }
    }

    pub fn find_by(&self) -> TopicFindBy {
        self.find_by
    }

    /// `arn:{partition}:sns:{region}:{account}:{name}`.
    pub async fn convention_arn(&self, clients: &AwsClients, name: &str) -> Result<String> {
        if let Some(arn) = self.conventions.pin().get(name) {
            return Ok(arn.clone());
        }

        let account = clients.sts.account_id().await?;
        let arn = format!(
            "arn:{}:sns:{}:{account}:{name}",
            partition_for(clients.region()),
            clients.region()
        );
        tracing::debug!(topic = name, %arn, "Resolved topic ARN by convention");
        self.conventions.pin().insert(name.to_owned(), arn.clone());
        Ok(arn)
    }

    /// Read-only: never creates the topic.
    pub async fn validate(&self, clients: &AwsClients, name: &str) -> Result<Existence<String>> {
        match self.find_by {
            TopicFindBy::ExactAddress => clients.sns.topic_exists(name).await,
            TopicFindBy::Convention => {
                let arn = self.convention_arn(clients, name).await?;
                clients.sns.topic_exists(&arn).await
            }
            TopicFindBy::Name => clients.sns.find_topic(name).await,
        }
    }
}

/// Topic name after normalization, or the ARN itself for exact lookups.
fn topic_target(routing_key: &str, attributes: &TopicAttributes) -> String {
    match attributes.find_by {
        TopicFindBy::ExactAddress => routing_key.to_owned(),
        _ => sns_topic_name(routing_key, attributes.fifo),
    }
}

/// Makes sure the topic for `routing_key` exists. Returns its ARN, or the
/// routing key itself under [`TopologyPolicy::Assume`].
pub async fn ensure_topic(
    clients: &AwsClients,
    lookup: &TopicLookup,
    routing_key: &str,
    attributes: &TopicAttributes,
    policy: TopologyPolicy,
) -> Result<String> {
    match policy {
        TopologyPolicy::Assume => Ok(routing_key.to_owned()),
        TopologyPolicy::Validate => {
            let target = topic_target(routing_key, attributes);
            lookup
                .validate(clients, &target)
                .await?
                .found()
                .ok_or_else(|| missing("topic", &target))
        }
        TopologyPolicy::Create => {
            let short = match attributes.find_by {
                TopicFindBy::ExactAddress => topic_from_arn(routing_key).unwrap_or(routing_key),
                _ => routing_key,
            };
            let name = sns_topic_name(short, attributes.fifo);

            let mut topic_attributes = HashMap::new();
            if attributes.fifo {
                topic_attributes.insert("FifoTopic".to_owned(), "true".to_owned());
                topic_attributes.insert(
                    "ContentBasedDeduplication".to_owned(),
                    attributes.content_based_deduplication.to_string(),
                );
            }

            tracing::debug!(topic = %name, "Creating topic");
            clients.sns.create_topic(&name, topic_attributes).await
        }
    }
}

/// Where a consumer reads from and where it dead-letters to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAddress {
    pub name: String,
    pub url: String,
    pub dead_letter_url: Option<String>,
}

fn last_segment(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}

fn queue_name(channel: &str, attributes: &SqsAttributes) -> String {
    match attributes.find_by {
        QueueFindBy::Url => last_segment(channel).to_owned(),
        QueueFindBy::Name => sqs_queue_name(channel, attributes.fifo),
    }
}

async fn url_of(clients: &AwsClients, name: &str) -> Result<String> {
    clients
        .sqs
        .queue_url(name)
        .await?
        .found()
        .ok_or_else(|| missing("queue", name))
}

/// Read-only URL lookup for the queue behind `channel`. Never creates it.
pub async fn locate_queue(
    clients: &AwsClients,
    channel: &str,
    attributes: &SqsAttributes,
    policy: TopologyPolicy,
) -> Result<Existence<String>> {
    match (policy, attributes.find_by) {
        (TopologyPolicy::Assume, _) | (_, QueueFindBy::Url) => {
            Ok(Existence::Found(channel.to_owned()))
        }
        (_, QueueFindBy::Name) => {
            clients
                .sqs
                .queue_url(&queue_name(channel, attributes))
                .await
        }
    }
}

async fn arn_of(clients: &AwsClients, url: &str) -> Result<String> {
    clients
        .sqs
        .queue_arn(url)
        .await?
        .found()
        .ok_or_else(|| missing("queue", url))
}

/// SQS attribute map for a queue. A redrive policy sends messages to
/// `dead_letter_arn` after one more receive than the configured budget, so
/// the consumer's own dead-lettering always runs first.
pub fn queue_attributes(
    attributes: &SqsAttributes,
    dead_letter_arn: Option<&str>,
) -> HashMap<String, String> {
    let mut map = HashMap::from([
        (
            "VisibilityTimeout".to_owned(),
            attributes.visibility_timeout.as_secs().to_string(),
        ),
        (
            "DelaySeconds".to_owned(),
            attributes.delay.as_secs().min(900).to_string(),
        ),
        (
            "MessageRetentionPeriod".to_owned(),
            attributes.retention.as_secs().to_string(),
        ),
    ]);

    if attributes.fifo {
        map.insert("FifoQueue".to_owned(), "true".to_owned());
        map.insert(
            "ContentBasedDeduplication".to_owned(),
            attributes.content_based_deduplication.to_string(),
        );
    }

    if let (Some(redrive), Some(arn)) = (&attributes.redrive, dead_letter_arn) {
        map.insert(
            "RedrivePolicy".to_owned(),
            serde_json::json!({
                "deadLetterTargetArn": arn,
                "maxReceiveCount": redrive.max_receive_count.saturating_add(1).to_string(),
            })
            .to_string(),
        );
    }

    map
}

/// Makes sure the queue behind `channel` exists, along with its dead-letter
/// queue when a redrive policy is configured.
pub async fn ensure_queue(
    clients: &AwsClients,
    channel: &str,
    attributes: &SqsAttributes,
    policy: TopologyPolicy,
) -> Result<QueueAddress> {
    let name = queue_name(channel, attributes);
    let dead_letter_name = attributes
        .redrive
        .as_ref()
        .map(|redrive| sqs_queue_name(&redrive.dead_letter_channel, attributes.fifo));

    match policy {
        TopologyPolicy::Assume => Ok(QueueAddress {
            name: last_segment(channel).to_owned(),
            url: channel.to_owned(),
            dead_letter_url: attributes
                .redrive
                .as_ref()
                .map(|redrive| redrive.dead_letter_channel.clone()),
        }),
        TopologyPolicy::Validate => {
            let url = match attributes.find_by {
                QueueFindBy::Url => {
                    arn_of(clients, channel).await?;
                    channel.to_owned()
                }
                QueueFindBy::Name => url_of(clients, &name).await?,
            };
            let dead_letter_url = match &dead_letter_name {
                Some(dlq) => Some(url_of(clients, dlq).await?),
                None => None,
            };
            Ok(QueueAddress {
                name,
                url,
                dead_letter_url,
            })
        }
        TopologyPolicy::Create => {
            let mut dead_letter = None;
            if let Some(dlq) = &dead_letter_name {
                let mut dlq_attributes = HashMap::from([(
                    "MessageRetentionPeriod".to_owned(),
                    attributes.retention.as_secs().to_string(),
                )]);
                if attributes.fifo {
                    dlq_attributes.insert("FifoQueue".to_owned(), "true".to_owned());
                }
                tracing::debug!(queue = %dlq, "Creating dead-letter queue");
                let url = clients.sqs.create_queue(dlq, dlq_attributes).await?;
                let arn = arn_of(clients, &url).await?;
                dead_letter = Some((url, arn));
            }

            tracing::debug!(queue = %name, "Creating queue");
            let url = clients
                .sqs
                .create_queue(
                    &name,
                    queue_attributes(attributes, dead_letter.as_ref().map(|(_, arn)| arn.as_str())),
                )
                .await?;

            Ok(QueueAddress {
                name,
                url,
                dead_letter_url: dead_letter.map(|(url, _)| url),
            })
        }
    }
}

fn queue_policy(queue_arn: &str, topic_arn: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "AllowTopicToSend",
            "Effect": "Allow",
            "Principal": { "Service": "sns.amazonaws.com" },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": { "ArnEquals": { "aws:SourceArn": topic_arn } },
        }],
    })
    .to_string()
}

/// Makes sure the subscription's queue exists and, unless it is
/// point-to-point, that it is subscribed to its topic. The subscription is
/// looked up before subscribing so repeated calls never bind twice.
pub async fn ensure_subscription(
    clients: &AwsClients,
    lookup: &TopicLookup,
    subscription: &SqsSubscription,
) -> Result<QueueAddress> {
    let queue = ensure_queue(
        clients,
        subscription.channel_name.as_str(),
        &subscription.queue,
        subscription.policy,
    )
    .await?;

    if subscription.point_to_point || subscription.policy == TopologyPolicy::Assume {
        return Ok(queue);
    }

    let topic = ensure_topic(
        clients,
        lookup,
        subscription.routing_key.as_str(),
        &subscription.topic,
        subscription.policy,
    )
    .await?;
    let queue_arn = arn_of(clients, &queue.url).await?;
    let subscribed = clients.sns.subscription_exists(&topic, &queue_arn).await?;

    match (subscription.policy, subscribed) {
        (_, Existence::Found(())) => {
            tracing::debug!(%topic, queue = %queue.name, "Queue already subscribed");
        }
        (TopologyPolicy::Create, Existence::NotFound) => {
            tracing::info!(%topic, queue = %queue.name, "Subscribing queue to topic");
            clients
                .sns
                .subscribe(&topic, &queue_arn, subscription.queue.raw_message_delivery)
                .await?;
            clients
                .sqs
                .set_queue_attributes(
                    &queue.url,
                    HashMap::from([("Policy".to_owned(), queue_policy(&queue_arn, &topic))]),
                )
                .await?;
        }
        (_, Existence::NotFound) => {
            return Err(missing("subscription of", &queue.name));
        }
    }

    Ok(queue)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        aws::{memory::MemoryCloud, AwsEndpoint},
        pool::{CloseSignal, Connector},
        topology::RedrivePolicy,
    };

    async fn clients(cloud: &MemoryCloud) -> Arc<AwsClients> {
        let endpoint = AwsEndpoint::new("eu-west-1").unwrap();
        cloud.connect(&endpoint, CloseSignal::detached()).await.unwrap()
    }

    #[tokio::test]
    async fn test_convention_arn_is_cached() {
        let cloud = MemoryCloud::new();
        let clients = clients(&cloud).await;
        let lookup = TopicLookup::new(TopicFindBy::Convention);

        let first = lookup.convention_arn(&clients, "orders").await.unwrap();
        let second = lookup.convention_arn(&clients, "orders").await.unwrap();

        assert_eq!(first, "arn:aws:sns:eu-west-1:000000000000:orders");
        assert_eq!(first, second);
        assert_eq!(cloud.calls().identity_lookups, 1);
    }

    #[tokio::test]
    async fn test_every_lookup_strategy_finds_a_created_topic() {
        let cloud = MemoryCloud::new();
        let clients = clients(&cloud).await;
        let arn = clients
            .sns
            .create_topic("orders", HashMap::new())
            .await
            .unwrap();

        for (find_by, name) in [
            (TopicFindBy::ExactAddress, arn.as_str()),
            (TopicFindBy::Convention, "orders"),
            (TopicFindBy::Name, "orders"),
        ] {
            let found = TopicLookup::new(find_by).validate(&clients, name).await.unwrap();
            assert_eq!(found, Existence::Found(arn.clone()), "{find_by}");
        }

        let missing = TopicLookup::new(TopicFindBy::Name)
            .validate(&clients, "payments")
            .await
            .unwrap();
        assert_eq!(missing, Existence::NotFound);
    }

    #[tokio::test]
    async fn test_assume_returns_routing_key_without_calls() {
        let cloud = MemoryCloud::new();
        let clients = clients(&cloud).await;
        let lookup = TopicLookup::new(TopicFindBy::Convention);

        let resolved = ensure_topic(
            &clients,
            &lookup,
            "orders",
            &TopicAttributes::default(),
            TopologyPolicy::Assume,
        )
        .await
        .unwrap();

        assert_eq!(resolved, "orders");
        assert_eq!(cloud.calls().connects, 1);
        assert_eq!(cloud.calls().creates(), 0);
        assert_eq!(cloud.calls().identity_lookups, 0);
    }

    #[tokio::test]
    async fn test_fifo_names_and_redrive_attributes() {
        let cloud = MemoryCloud::new();
        let clients = clients(&cloud).await;
        let attributes = SqsAttributes::builder()
            .fifo(true)
            .visibility_timeout(Duration::from_secs(60))
            .redrive(
                RedrivePolicy::builder()
                    .dead_letter_channel("orders.dead")
                    .max_receive_count(3)
                    .build(),
            )
            .build();

        let address = ensure_queue(&clients, "orders.v1", &attributes, TopologyPolicy::Create)
            .await
            .unwrap();

        assert_eq!(address.name, "orders_v1.fifo");
        assert!(address.dead_letter_url.is_some());
        assert!(cloud.queue_exists("orders_dead.fifo"));

        let created = cloud.queue_attributes("orders_v1.fifo").unwrap();
        assert_eq!(created.get("FifoQueue").map(String::as_str), Some("true"));
        assert_eq!(created.get("VisibilityTimeout").map(String::as_str), Some("60"));
        let redrive: serde_json::Value =
            serde_json::from_str(created.get("RedrivePolicy").unwrap()).unwrap();
        assert_eq!(redrive["maxReceiveCount"], "4");
    }

    #[tokio::test]
    async fn test_assume_takes_queue_urls_verbatim() {
        let cloud = MemoryCloud::new();
        let clients = clients(&cloud).await;
        let attributes = SqsAttributes::builder()
            .redrive(
                RedrivePolicy::builder()
                    .dead_letter_channel("https://sqs.eu-west-1.amazonaws.com/000000000000/orders-dlq")
                    .max_receive_count(3)
                    .build(),
            )
            .build();
        let before = cloud.calls();

        let address = ensure_queue(
            &clients,
            "https://sqs.eu-west-1.amazonaws.com/000000000000/orders",
            &attributes,
            TopologyPolicy::Assume,
        )
        .await
        .unwrap();

        assert_eq!(address.name, "orders");
        assert_eq!(
            address.url,
            "https://sqs.eu-west-1.amazonaws.com/000000000000/orders"
        );
        assert_eq!(
            address.dead_letter_url.as_deref(),
            Some("https://sqs.eu-west-1.amazonaws.com/000000000000/orders-dlq")
        );
        assert_eq!(cloud.calls(), before);
    }

    #[test]
    fn test_queue_name_from_url() {
        let attributes = SqsAttributes::builder().find_by(QueueFindBy::Url).build();
        assert_eq!(
            queue_name(
                "https://sqs.eu-west-1.amazonaws.com/000000000000/orders",
                &attributes
            ),
            "orders"
        );
    }
}
