use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;

use super::{
    client::{SnsPublish, SqsSend},
    topology::{self, TopicLookup},
    AwsClients, AwsEndpoint, AwsPool, SqsAttributes, TopicAttributes, MAX_SEND_DELAY,
};
use crate::{
    channel::MessageProducer,
    codec,
    confirm::{PendingConfirmations, PublishObserver},
    error::Result,
    message::{Message, RoutingKey, DEDUPLICATION_ID},
    scheduler::{Scheduler, TokioScheduler},
    topology::TopologyPolicy,
};

/// `(group id, deduplication id)` for a FIFO destination. The group falls
/// back to the topic; the deduplication id is only ever taken from the bag.
fn fifo_ids(fifo: bool, message: &Message) -> (Option<String>, Option<String>) {
    if !fifo {
        return (None, None);
    }
    let group = message
        .header
        .partition_key()
        .map(str::to_owned)
        .unwrap_or_else(|| message.header.topic().to_string());
    (Some(group), message.header.bag_str(DEDUPLICATION_ID))
}

/// What producers of both kinds share: the pool, the resolved-address memo
/// and the publish observer.
struct Publisher {
    pool: Arc<AwsPool>,
    endpoint: AwsEndpoint,
    policy: TopologyPolicy,
    scheduler: Arc<dyn Scheduler>,
    confirmations: PendingConfirmations,
    resolved: papaya::HashMap<RoutingKey, String>,
}

impl Publisher {
    fn new(
        pool: Arc<AwsPool>,
        endpoint: AwsEndpoint,
        policy: TopologyPolicy,
        scheduler: Option<Arc<dyn Scheduler>>,
        observer: Option<PublishObserver>,
    ) -> Self {
        Self {
            pool,
            endpoint,
            policy,
            scheduler: scheduler.unwrap_or_else(|| Arc::new(TokioScheduler::new())),
            confirmations: match observer {
                Some(observer) => PendingConfirmations::with_observer(observer),
                None => PendingConfirmations::new(),
            },
            resolved: papaya::HashMap::new(),
        }
    }

    async fn clients(&self) -> Result<Arc<AwsClients>> {
        self.pool.acquire(&self.endpoint).await
    }

    fn memoized(&self, topic: &RoutingKey) -> Option<String> {
        self.resolved.pin().get(topic).cloned()
    }

    fn remember(&self, topic: &RoutingKey, address: &str) {
        self.resolved.pin().insert(topic.clone(), address.to_owned());
    }

    /// Reports the outcome and turns a transient fault into a channel
    /// failure after reconnecting.
    async fn settle(&self, message: &Message, outcome: Result<String>, target: &str) -> Result<()> {
        match outcome {
            Ok(broker_id) => {
                self.confirmations.notify(true, message.id());
                tracing::debug!(message_id = %message.id(), %broker_id, destination = target, "Published");
                Ok(())
            }
            Err(e) => {
                self.confirmations.notify(false, message.id());
                if !e.is_transient() {
                    return Err(e);
                }
                if e.is_unreachable() {
                    self.resolved.pin().remove(message.header.topic());
                }
                tracing::warn!(
                    region = self.endpoint.region(),
                    destination = target,
                    "Publish failed, resetting clients: {e}"
                );
                if let Err(reset) = self.pool.reset(&self.endpoint).await {
                    tracing::error!("Reconnect failed: {reset}");
                }
                Err(e.into_channel_failure())
            }
        }
    }
}

/// Publishes to SNS topics. SNS cannot delay a message, so delayed publishes
/// are handed to the scheduler.
#[derive(Clone)]
pub struct SnsProducer {
    inner: Arc<SnsInner>,
}

struct SnsInner {
    publisher: Publisher,
    topic: TopicAttributes,
    lookup: TopicLookup,
}

#[bon::bon]
impl SnsProducer {
    #[builder]
    pub fn new(
        pool: Arc<AwsPool>,
        endpoint: AwsEndpoint,
        #[builder(default)] topic: TopicAttributes,
        #[builder(default)] policy: TopologyPolicy,
        scheduler: Option<Arc<dyn Scheduler>>,
        observer: Option<PublishObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(SnsInner {
                publisher: Publisher::new(pool, endpoint, policy, scheduler, observer),
                lookup: TopicLookup::new(topic.find_by),
                topic,
            }),
        }
    }
}

impl SnsProducer {
    pub async fn publish(&self, message: Message) -> Result<()> {
        self.publish_delayed(message, Duration::ZERO).await
    }

    pub async fn publish_delayed(&self, mut message: Message, delay: Duration) -> Result<()> {
        let topic_arn = self.inner.resolve(message.header.topic()).await?;

        if !delay.is_zero() {
            message.header.set_delayed(delay);
            tracing::debug!(message_id = %message.id(), %topic_arn, ?delay, "Handing delayed publish to the scheduler");
            let inner = self.inner.clone();
            self.inner.publisher.scheduler.schedule(
                delay,
                Box::pin(async move {
                    if let Err(e) = inner.send(&topic_arn, &message).await {
                        tracing::error!(message_id = %message.id(), "Delayed publish failed: {e}");
                    }
                }),
            );
            return Ok(());
        }

        self.inner.send(&topic_arn, &message).await
    }
}

impl SnsInner {
    async fn resolve(&self, topic: &RoutingKey) -> Result<String> {
        if let Some(arn) = self.publisher.memoized(topic) {
            return Ok(arn);
        }

        let clients = self.publisher.clients().await?;
        let arn = topology::ensure_topic(
            &clients,
            &self.lookup,
            topic.as_str(),
            &self.topic,
            self.publisher.policy,
        )
        .await
        .map_err(|e| {
            tracing::error!(%topic, "Could not resolve topic: {e}");
            e
        })?;

        self.publisher.remember(topic, &arn);
        Ok(arn)
    }

    async fn send(&self, topic_arn: &str, message: &Message) -> Result<()> {
        let (group_id, deduplication_id) = fifo_ids(self.topic.fifo, message);
        let request = SnsPublish {
            topic_arn: topic_arn.to_owned(),
            envelope: codec::sqs::encode(message),
            subject: message.header.subject().map(str::to_owned),
            group_id,
            deduplication_id,
        };

        let outcome = match self.publisher.clients().await {
            Ok(clients) => clients.sns.publish(request).await,
            Err(e) => Err(e),
        };
        self.publisher.settle(message, outcome, topic_arn).await
    }
}

impl MessageProducer for SnsProducer {
    fn publish(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(SnsProducer::publish(self, message))
    }

    fn publish_delayed(&self, message: Message, delay: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(SnsProducer::publish_delayed(self, message, delay))
    }
}

/// Sends straight to SQS queues, named by each message's topic. Delays are
/// native and capped at fifteen minutes.
#[derive(Clone)]
pub struct SqsProducer {
    inner: Arc<SqsInner>,
}

struct SqsInner {
    publisher: Publisher,
    queue: SqsAttributes,
}

#[bon::bon]
impl SqsProducer {
    #[builder]
    pub fn new(
        pool: Arc<AwsPool>,
        endpoint: AwsEndpoint,
        #[builder(default)] queue: SqsAttributes,
        #[builder(default)] policy: TopologyPolicy,
        observer: Option<PublishObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(SqsInner {
                publisher: Publisher::new(pool, endpoint, policy, None, observer),
                queue,
            }),
        }
    }
}

impl SqsProducer {
    pub async fn publish(&self, message: Message) -> Result<()> {
        self.publish_delayed(message, Duration::ZERO).await
    }

    /// The message header keeps the requested delay even when the send is
    /// clamped.
    pub async fn publish_delayed(&self, mut message: Message, delay: Duration) -> Result<()> {
        let queue_url = self.inner.resolve(message.header.topic()).await?;

        let mut send_delay = delay;
        if !delay.is_zero() {
            message.header.set_delayed(delay);
            if delay > MAX_SEND_DELAY {
                tracing::warn!(
                    message_id = %message.id(),
                    requested = ?delay,
                    applied = ?MAX_SEND_DELAY,
                    "Delay exceeds the SQS maximum, clamping"
                );
                send_delay = MAX_SEND_DELAY;
            }
        }

        let (group_id, deduplication_id) = fifo_ids(self.inner.queue.fifo, &message);
        let request = SqsSend {
            queue_url: queue_url.clone(),
            envelope: codec::sqs::encode(&message),
            delay: send_delay,
            group_id,
            deduplication_id,
        };

        let outcome = match self.inner.publisher.clients().await {
            Ok(clients) => clients.sqs.send(request).await,
            Err(e) => Err(e),
        };
        self.inner.publisher.settle(&message, outcome, &queue_url).await
    }
}

impl SqsInner {
    async fn resolve(&self, topic: &RoutingKey) -> Result<String> {
        if let Some(url) = self.publisher.memoized(topic) {
            return Ok(url);
        }

        let clients = self.publisher.clients().await?;
        let address =
            topology::ensure_queue(&clients, topic.as_str(), &self.queue, self.publisher.policy)
                .await
                .map_err(|e| {
                    tracing::error!(%topic, "Could not resolve queue: {e}");
                    e
                })?;

        self.publisher.remember(topic, &address.url);
        Ok(address.url)
    }
}

impl MessageProducer for SqsProducer {
    fn publish(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(SqsProducer::publish(self, message))
    }

    fn publish_delayed(&self, message: Message, delay: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(SqsProducer::publish_delayed(self, message, delay))
    }
}
