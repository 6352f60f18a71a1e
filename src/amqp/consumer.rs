use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    time::Instant,
};

use super::{topology, AmqpChannel, AmqpEndpoint, AmqpPool, AmqpSubscription};
use crate::{
    channel::{Channel, ChannelFactory, ConsumerState, MessageConsumer},
    codec::{
        self,
        amqp::{delivery_tag, AmqpDelivery},
    },
    error::{Error, Result},
    message::Message,
    scheduler::{Scheduler, TokioScheduler},
    topology::{naming::amqp_name, Existence},
};

/// Longest single wait while draining the local delivery buffer.
const POLL_INCREMENT: Duration = Duration::from_millis(100);

type Deliveries = mpsc::UnboundedReceiver<AmqpDelivery>;

/// Reads one queue. The broker pushes deliveries into a local buffer;
/// [`AmqpConsumer::receive`] drains it.
pub struct AmqpConsumer {
    pool: Arc<AmqpPool>,
    endpoint: AmqpEndpoint,
    subscription: AmqpSubscription,
    scheduler: Arc<dyn Scheduler>,
    queue: String,
    consumer_tag: String,
    state: Mutex<ConsumerState>,
    channel: Mutex<Option<Arc<dyn AmqpChannel>>>,
    buffer: tokio::sync::Mutex<Option<Deliveries>>,
    /// Delivery tag to message id, for deliveries not yet settled.
    outstanding: papaya::HashMap<u64, String>,
}

#[bon::bon]
impl AmqpConsumer {
    #[builder]
    pub fn new(
        pool: Arc<AmqpPool>,
        endpoint: AmqpEndpoint,
        subscription: AmqpSubscription,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Self {
        let queue = amqp_name(subscription.channel_name.as_str());
        let consumer_tag = format!("{}-{}", subscription.name, uuid::Uuid::new_v4());

        Self {
            pool,
            endpoint,
            subscription,
            scheduler: scheduler.unwrap_or_else(|| Arc::new(TokioScheduler::new())),
            queue,
            consumer_tag,
            state: Mutex::new(ConsumerState::Disconnected),
            channel: Mutex::new(None),
            buffer: tokio::sync::Mutex::new(None),
            outstanding: papaya::HashMap::new(),
        }
    }
}

impl AmqpConsumer {
    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConsumerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            tracing::trace!(queue = %self.queue, from = %*current, to = %state, "Consumer state");
            *current = state;
        }
    }

    pub fn subscription(&self) -> &AmqpSubscription {
        &self.subscription
    }

    /// Deliveries handed out and not yet acked, rejected or requeued.
    pub fn outstanding(&self) -> usize {
        self.outstanding.pin().len()
    }

    fn live_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|channel| channel.is_open())
    }

    fn forget_channel(&self) {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Tags are scoped to their channel; the broker redelivers these.
        self.outstanding.pin().clear();
        self.set_state(ConsumerState::Disconnected);
    }

    async fn reset(&self, cause: &Error) {
        tracing::warn!(queue = %self.queue, "Resetting connection after: {cause}");
        self.forget_channel();
        if let Err(e) = self.pool.reset(&self.endpoint).await {
            tracing::error!(queue = %self.queue, "Reconnect failed: {e}");
        }
    }

    async fn connect(&self) -> Result<Deliveries> {
        self.set_state(ConsumerState::Provisioning);

        let attempt = async {
            let connection = self.pool.acquire(&self.endpoint).await?;
            let channel = connection.open_channel().await?;
            topology::ensure_subscription(channel.as_ref(), &self.subscription).await?;
            let deliveries = channel
                .consume(&self.queue, &self.consumer_tag, self.subscription.batch_size)
                .await?;
            Ok::<_, Error>((channel, deliveries))
        };

        match attempt.await {
            Ok((channel, deliveries)) => {
                *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel);
                self.outstanding.pin().clear();
                self.set_state(ConsumerState::Consuming);
                tracing::info!(queue = %self.queue, tag = %self.consumer_tag, "Consuming");
                Ok(deliveries)
            }
            Err(e) => {
                if e.is_unreachable() {
                    self.reset(&e).await;
                } else {
                    self.forget_channel();
                }
                Err(e)
            }
        }
    }

    /// Provisions the subscription and starts consuming without waiting for
    /// a message.
    pub async fn start(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_none() || self.live_channel().is_none() {
            *buffer = Some(self.connect().await?);
        }
        Ok(())
    }

    /// Waits up to `timeout` for deliveries. Returns at most the
    /// subscription's batch size, or a single "none" message on timeout.
    pub async fn receive(&self, timeout: Duration) -> Result<Vec<Message>> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_none() || self.live_channel().is_none() {
            buffer.take();
            *buffer = Some(self.connect().await?);
        }
        let Some(deliveries) = buffer.as_mut() else {
            return Err(Error::channel_failure(&self.queue, "not consuming"));
        };

        self.set_state(ConsumerState::Receiving);
        let limit = usize::from(self.subscription.batch_size.max(1));
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();
        let mut closed = false;

        loop {
            while batch.len() < limit {
                match deliveries.try_recv() {
                    Ok(delivery) => batch.push(delivery),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
            if !batch.is_empty() || closed {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = (deadline - now).min(POLL_INCREMENT);
            match tokio::time::timeout(slice, deliveries.recv()).await {
                Ok(Some(delivery)) => batch.push(delivery),
                Ok(None) => closed = true,
                Err(_) => {}
            }
        }

        if closed && batch.is_empty() {
            buffer.take();
            let e = Error::channel_failure(&self.queue, "broker stopped delivering");
            self.reset(&e).await;
            if self.queue_missing().await {
                return Err(Error::unreachable(&self.queue, "queue no longer exists"));
            }
            return Err(e);
        }

        if batch.is_empty() {
            self.set_state(ConsumerState::Idle);
            return Ok(vec![Message::none()]);
        }

        let messages = batch
            .iter()
            .map(|delivery| {
                let message = codec::amqp::decode(delivery);
                self.outstanding
                    .pin()
                    .insert(delivery.delivery_tag, message.id().to_owned());
                message
            })
            .collect();

        if closed {
            buffer.take();
            self.forget_channel();
        } else {
            self.set_state(ConsumerState::Consuming);
        }
        Ok(messages)
    }

    async fn queue_missing(&self) -> bool {
        let check = async {
            let connection = self.pool.acquire(&self.endpoint).await?;
            let channel = connection.open_channel().await?;
            let exists = channel.queue_exists(&self.queue).await;
            channel.close().await?;
            exists
        };
        matches!(check.await, Ok(Existence::NotFound))
    }

    /// Takes `message` out of the outstanding set. `None` means it was never
    /// handed out by this channel or was already settled.
    fn claim(&self, message: &Message) -> Option<(u64, Arc<dyn AmqpChannel>)> {
        let Some(tag) = delivery_tag(message) else {
            tracing::warn!(message_id = %message.id(), "Message carries no delivery tag");
            return None;
        };
        if self.outstanding.pin().remove(&tag).is_none() {
            tracing::debug!(message_id = %message.id(), tag, "Delivery already settled");
            return None;
        }
        match self.live_channel() {
            Some(channel) => Some((tag, channel)),
            None => {
                tracing::warn!(
                    message_id = %message.id(),
                    tag,
                    "Channel closed before settling, the broker will redeliver"
                );
                None
            }
        }
    }

    async fn settled(&self, outcome: Result<()>) -> Result<()> {
        if let Err(e) = &outcome {
            if e.is_transient() {
                self.reset(e).await;
            }
        }
        outcome
    }

    pub async fn acknowledge(&self, message: &Message) -> Result<()> {
        let Some((tag, channel)) = self.claim(message) else {
            return Ok(());
        };
        tracing::debug!(message_id = %message.id(), tag, "Acknowledging");
        self.settled(channel.ack(tag).await).await
    }

    /// Without requeue the broker dead-letters the message when a redrive
    /// policy is configured, and drops it otherwise.
    pub async fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        let Some((tag, channel)) = self.claim(message) else {
            return Ok(());
        };
        if !requeue && self.subscription.redrive.is_none() {
            tracing::warn!(message_id = %message.id(), queue = %self.queue, "Rejected with no dead-letter queue, dropping");
        } else {
            tracing::info!(message_id = %message.id(), requeue, "Rejecting");
        }
        self.settled(channel.nack(tag, requeue).await).await
    }

    /// Sends a copy back to this queue after `delay`, then acks the original.
    /// Once the redrive budget is spent the message is rejected instead and
    /// `false` is returned.
    pub async fn requeue(&self, message: &Message, delay: Duration) -> Result<bool> {
        if let Some(redrive) = &self.subscription.redrive {
            if message.header.handled_count() >= redrive.max_receive_count {
                tracing::warn!(
                    message_id = %message.id(),
                    handled = message.header.handled_count(),
                    "Requeue budget spent, dead-lettering"
                );
                self.reject(message, false).await?;
                return Ok(false);
            }
        }

        let Some(tag) = delivery_tag(message) else {
            tracing::warn!(message_id = %message.id(), "Message carries no delivery tag");
            return Ok(false);
        };
        if self.outstanding.pin().get(&tag).is_none() {
            tracing::debug!(message_id = %message.id(), tag, "Delivery already settled");
            return Ok(false);
        }

        let mut copy = message.requeue_clone();
        copy.header.set_delayed(delay);
        let mut envelope = codec::amqp::encode(&copy);
        envelope.routing_key = self.queue.clone();

        let republished = if delay.is_zero() {
            self.republish("", &copy, envelope).await
        } else if self.subscription.exchange.supports_delay
            && self.subscription.exchange.routes_by_key()
        {
            let exchange = amqp_name(&self.subscription.exchange.name);
            self.republish(&exchange, &copy, envelope).await
        } else {
            let pool = self.pool.clone();
            let endpoint = self.endpoint.clone();
            let id = copy.id().to_owned();
            self.scheduler.schedule(
                delay,
                Box::pin(async move {
                    let sent = async {
                        let connection = pool.acquire(&endpoint).await?;
                        let channel = connection.open_channel().await?;
                        let published = channel.publish("", envelope).await?;
                        published.confirmation.await?;
                        channel.close().await
                    };
                    if let Err(e) = sent.await {
                        tracing::error!(message_id = %id, "Delayed requeue failed: {e}");
                    }
                }),
            );
            Ok(())
        };

        self.settled(republished).await?;
        tracing::debug!(message_id = %message.id(), ?delay, "Requeued");
        self.acknowledge(message).await?;
        Ok(true)
    }

    async fn republish(
        &self,
        exchange: &str,
        copy: &Message,
        envelope: codec::amqp::AmqpEnvelope,
    ) -> Result<()> {
        let channel = self
            .live_channel()
            .ok_or_else(|| Error::channel_failure(&self.queue, "channel closed"))?;
        let published = channel.publish(exchange, envelope).await?;
        if published.confirmation.await? {
            Ok(())
        } else {
            Err(Error::rejected(copy.id(), exchange, "broker refused requeued copy"))
        }
    }

    /// Throws away every ready message, and anything already buffered
    /// locally. A missing queue counts as empty.
    pub async fn purge(&self) -> Result<()> {
        {
            let mut buffer = self.buffer.lock().await;
            if let Some(deliveries) = buffer.as_mut() {
                if let Some(channel) = self.live_channel() {
                    while let Ok(delivery) = deliveries.try_recv() {
                        self.outstanding.pin().remove(&delivery.delivery_tag);
                        channel.ack(delivery.delivery_tag).await?;
                    }
                }
            }
        }

        let connection = self.pool.acquire(&self.endpoint).await?;
        let channel = connection.open_channel().await?;
        let purged = channel.purge(&self.queue).await;
        if let Err(e) = channel.close().await {
            tracing::debug!(queue = %self.queue, "Error closing purge channel: {e}");
        }

        match purged? {
            Existence::Found(count) => {
                tracing::info!(queue = %self.queue, count, "Purged queue");
            }
            Existence::NotFound => {
                tracing::debug!(queue = %self.queue, "Queue does not exist, nothing to purge");
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.buffer.lock().await.take();
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.forget_channel();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

impl MessageConsumer for AmqpConsumer {
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<Vec<Message>>> {
        Box::pin(AmqpConsumer::receive(self, timeout))
    }

    fn acknowledge<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<()>> {
        Box::pin(AmqpConsumer::acknowledge(self, message))
    }

    fn reject<'a>(&'a self, message: &'a Message, requeue: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(AmqpConsumer::reject(self, message, requeue))
    }

    fn requeue<'a>(&'a self, message: &'a Message, delay: Duration) -> BoxFuture<'a, Result<bool>> {
        Box::pin(AmqpConsumer::requeue(self, message, delay))
    }

    fn purge(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(AmqpConsumer::purge(self))
    }
}

/// Creates provisioned [`AmqpConsumer`] channels against one broker.
#[derive(Clone)]
pub struct AmqpChannelFactory {
    pool: Arc<AmqpPool>,
    endpoint: AmqpEndpoint,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl AmqpChannelFactory {
    pub fn new(pool: Arc<AmqpPool>, endpoint: AmqpEndpoint) -> Self {
        Self {
            pool,
            endpoint,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

impl ChannelFactory for AmqpChannelFactory {
    type Subscription = AmqpSubscription;

    fn create_channel<'a>(
        &'a self,
        subscription: &'a AmqpSubscription,
    ) -> BoxFuture<'a, Result<Channel>> {
        Box::pin(async move {
            let consumer = AmqpConsumer::builder()
                .pool(self.pool.clone())
                .endpoint(self.endpoint.clone())
                .subscription(subscription.clone())
                .maybe_scheduler(self.scheduler.clone())
                .build();
            consumer.start().await?;
            Ok(Channel::new(
                subscription.channel_name.clone(),
                subscription.routing_key.clone(),
                consumer,
            ))
        })
    }
}
