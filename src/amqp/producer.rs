use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;

use super::{topology, AmqpChannel, AmqpEndpoint, AmqpPool, Exchange};
use crate::{
    channel::MessageProducer,
    codec,
    confirm::{PendingConfirmations, PublishObserver},
    error::{Error, Result},
    message::{Message, RoutingKey},
    scheduler::{Scheduler, TokioScheduler},
    topology::{naming::amqp_name, TopologyPolicy},
};

/// Publishes to one exchange with publisher confirms.
///
/// Delays ride on the `x-delay` header when the exchange was declared through
/// the delayed-message plugin, and go through the scheduler otherwise.
#[derive(Clone)]
pub struct AmqpProducer {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Arc<AmqpPool>,
    endpoint: AmqpEndpoint,
    exchange: Exchange,
    policy: TopologyPolicy,
    scheduler: Arc<dyn Scheduler>,
    confirmations: PendingConfirmations,
    channel: tokio::sync::Mutex<Option<Arc<dyn AmqpChannel>>>,
    resolved: papaya::HashMap<RoutingKey, String>,
}

#[bon::bon]
impl AmqpProducer {
    #[builder]
    pub fn new(
        pool: Arc<AmqpPool>,
        endpoint: AmqpEndpoint,
        exchange: Exchange,
        #[builder(default)] policy: TopologyPolicy,
        scheduler: Option<Arc<dyn Scheduler>>,
        observer: Option<PublishObserver>,
    ) -> Self {
        let confirmations = match observer {
            Some(observer) => PendingConfirmations::with_observer(observer),
            None => PendingConfirmations::new(),
        };

        Self {
            inner: Arc::new(Inner {
                pool,
                endpoint,
                exchange,
                policy,
                scheduler: scheduler.unwrap_or_else(|| Arc::new(TokioScheduler::new())),
                confirmations,
                channel: tokio::sync::Mutex::new(None),
                resolved: papaya::HashMap::new(),
            }),
        }
    }
}

impl AmqpProducer {
    /// Publishes now and waits for the broker's confirmation.
    pub async fn publish(&self, message: Message) -> Result<()> {
        self.publish_delayed(message, Duration::ZERO).await
    }

    pub async fn publish_delayed(&self, mut message: Message, delay: Duration) -> Result<()> {
        let exchange = self.inner.resolve(message.header.topic()).await?;

        if !delay.is_zero() {
            message.header.set_delayed(delay);

            if !self.inner.exchange.supports_delay {
                tracing::debug!(
                    message_id = %message.id(),
                    %exchange,
                    ?delay,
                    "Exchange cannot delay, handing message to the scheduler"
                );
                let inner = self.inner.clone();
                self.inner.scheduler.schedule(
                    delay,
                    Box::pin(async move {
                        if let Err(e) = inner.send(&exchange, &message).await {
                            tracing::error!(message_id = %message.id(), "Delayed publish failed: {e}");
                        }
                    }),
                );
                return Ok(());
            }
        }

        self.inner.send(&exchange, &message).await
    }

    /// Publishes still awaiting a broker confirmation.
    pub fn pending_confirmations(&self) -> usize {
        self.inner.confirmations.len()
    }

    pub async fn close(&self) -> Result<()> {
        let channel = self.inner.channel.lock().await.take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

impl Inner {
    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let mut cached = self.channel.lock().await;
        if let Some(channel) = cached.as_ref().filter(|channel| channel.is_open()) {
            return Ok(channel.clone());
        }

        let connection = self.pool.acquire(&self.endpoint).await?;
        let channel = connection.open_channel().await?;
        channel.enable_confirms().await?;
        *cached = Some(channel.clone());
        Ok(channel)
    }

    async fn resolve(&self, topic: &RoutingKey) -> Result<String> {
        if let Some(exchange) = self.resolved.pin().get(topic) {
            return Ok(exchange.clone());
        }

        let exchange = match self.policy {
            TopologyPolicy::Assume => amqp_name(&self.exchange.name),
            policy => {
                let channel = self.channel().await?;
                topology::ensure_exchange(channel.as_ref(), &self.exchange, policy)
                    .await
                    .map_err(|e| {
                        tracing::error!(%topic, "Could not resolve exchange: {e}");
                        e
                    })?
            }
        };

        self.resolved.pin().insert(topic.clone(), exchange.clone());
        Ok(exchange)
    }

    async fn send(&self, exchange: &str, message: &Message) -> Result<()> {
        let mut envelope = codec::amqp::encode(message);
        envelope.routing_key = amqp_name(&envelope.routing_key);

        let channel = self.channel().await?;
        let published = match channel.publish(exchange, envelope).await {
            Ok(published) => published,
            Err(e) => return Err(self.fault(e).await),
        };

        let tracked = self.confirmations.watch(published.sequence, message.id());
        match published.confirmation.await {
            Ok(true) => {
                tracked.settle(true);
                tracing::debug!(message_id = %message.id(), exchange, "Published");
                Ok(())
            }
            Ok(false) => {
                tracked.settle(false);
                tracing::warn!(message_id = %message.id(), exchange, "Broker refused message");
                Err(Error::rejected(message.id(), exchange, "broker nacked the publish"))
            }
            Err(e) => {
                tracked.settle(false);
                Err(self.fault(e).await)
            }
        }
    }

    /// Socket-level faults drop the cached channel and reconnect before the
    /// caller sees a channel failure.
    async fn fault(&self, e: Error) -> Error {
        if !e.is_transient() {
            return e;
        }

        tracing::warn!(endpoint = %self.endpoint.display_url(), "Publish failed, resetting connection: {e}");
        self.channel.lock().await.take();
        if let Err(reset) = self.pool.reset(&self.endpoint).await {
            tracing::error!("Reconnect failed: {reset}");
        }
        e.into_channel_failure()
    }
}

impl MessageProducer for AmqpProducer {
    fn publish(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(AmqpProducer::publish(self, message))
    }

    fn publish_delayed(&self, message: Message, delay: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(AmqpProducer::publish_delayed(self, message, delay))
    }
}
