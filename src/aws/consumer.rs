use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures_util::future::BoxFuture;

use super::{
    client::SqsSend,
    topology::{self, QueueAddress, TopicLookup},
    AwsClients, AwsEndpoint, AwsPool, SqsSubscription, MAX_VISIBILITY_TIMEOUT, MAX_WAIT,
};
use crate::{
    channel::{Channel, ChannelFactory, ConsumerState, MessageConsumer},
    codec::{self, sqs::receipt_handle},
    error::{Error, Result},
    message::Message,
    topology::Existence,
};

/// Reads one SQS queue by long polling. Messages stay in flight until they
/// are acknowledged, rejected or requeued, or their visibility lapses.
pub struct SqsConsumer {
    pool: Arc<AwsPool>,
    endpoint: AwsEndpoint,
    subscription: SqsSubscription,
    lookup: TopicLookup,
    state: Mutex<ConsumerState>,
    address: tokio::sync::Mutex<Option<QueueAddress>>,
    /// Receipt handle to message id, for messages not yet settled.
    outstanding: papaya::HashMap<String, String>,
}

#[bon::bon]
impl SqsConsumer {
    #[builder]
    pub fn new(pool: Arc<AwsPool>, endpoint: AwsEndpoint, subscription: SqsSubscription) -> Self {
        Self {
            pool,
            endpoint,
            lookup: TopicLookup::new(subscription.topic.find_by),
            subscription,
            state: Mutex::new(ConsumerState::Disconnected),
            address: tokio::sync::Mutex::new(None),
            outstanding: papaya::HashMap::new(),
        }
    }
}

impl SqsConsumer {
    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConsumerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            tracing::trace!(channel = %self.subscription.channel_name, from = %*current, to = %state, "Consumer state");
            *current = state;
        }
    }

    pub fn subscription(&self) -> &SqsSubscription {
        &self.subscription
    }

    /// Messages handed out and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.outstanding.pin().len()
    }

    async fn clients(&self) -> Result<Arc<AwsClients>> {
        self.pool.acquire(&self.endpoint).await
    }

    /// Forgets the resolved queue and reconnects. The next receive
    /// provisions again.
    async fn reset(&self, cause: &Error) {
        tracing::warn!(channel = %self.subscription.channel_name, "Resetting clients after: {cause}");
        self.address.lock().await.take();
        self.set_state(ConsumerState::Disconnected);
        if let Err(e) = self.pool.reset(&self.endpoint).await {
            tracing::error!(channel = %self.subscription.channel_name, "Reconnect failed: {e}");
        }
    }

    async fn provision(&self) -> Result<QueueAddress> {
        let mut address = self.address.lock().await;
        if let Some(known) = address.as_ref() {
            return Ok(known.clone());
        }

        self.set_state(ConsumerState::Provisioning);
        let attempt = async {
            let clients = self.clients().await?;
            topology::ensure_subscription(&clients, &self.lookup, &self.subscription).await
        };

        match attempt.await {
            Ok(resolved) => {
                tracing::info!(
                    channel = %self.subscription.channel_name,
                    queue = %resolved.name,
                    "Consuming"
                );
                *address = Some(resolved.clone());
                self.set_state(ConsumerState::Consuming);
                Ok(resolved)
            }
            Err(e) => {
                self.set_state(ConsumerState::Disconnected);
                Err(e)
            }
        }
    }

    /// Provisions the queue, and its subscription, without receiving.
    pub async fn start(&self) -> Result<()> {
        self.provision().await.map(|_| ())
    }

    /// Long-polls for up to `timeout`, capped at twenty seconds. Returns at
    /// most the subscription's batch size, or a single "none" message when
    /// nothing arrived.
    pub async fn receive(&self, timeout: Duration) -> Result<Vec<Message>> {
        let address = self.provision().await?;
        self.set_state(ConsumerState::Receiving);

        let polled = match self.clients().await {
            Ok(clients) => {
                clients
                    .sqs
                    .receive(
                        &address.url,
                        self.subscription.batch_size(),
                        timeout.min(MAX_WAIT),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        let received = match polled {
            Ok(Existence::Found(received)) => received,
            Ok(Existence::NotFound) => {
                let e = Error::unreachable(&address.name, "queue no longer exists");
                self.reset(&e).await;
                return Err(e);
            }
            Err(e) if e.is_transient() => {
                self.reset(&e).await;
                return Err(e.into_channel_failure());
            }
            Err(e) => {
                self.set_state(ConsumerState::Consuming);
                return Err(e);
            }
        };

        if received.is_empty() {
            self.set_state(ConsumerState::Idle);
            return Ok(vec![Message::none()]);
        }

        let messages = received
            .iter()
            .map(|raw| {
                let message = codec::sqs::decode(raw);
                if !raw.receipt_handle.is_empty() {
                    self.outstanding
                        .pin()
                        .insert(raw.receipt_handle.clone(), message.id().to_owned());
                }
                message
            })
            .collect();

        self.set_state(ConsumerState::Consuming);
        Ok(messages)
    }

    /// Takes `message` out of the outstanding set. `None` means it was never
    /// handed out by this consumer or was already settled.
    async fn claim(&self, message: &Message) -> Option<(String, QueueAddress)> {
        let Some(receipt) = receipt_handle(message) else {
            tracing::warn!(message_id = %message.id(), "Message carries no receipt handle");
            return None;
        };
        if self.outstanding.pin().remove(&receipt).is_none() {
            tracing::debug!(message_id = %message.id(), "Message already settled");
            return None;
        }
        match self.address.lock().await.clone() {
            Some(address) => Some((receipt, address)),
            None => {
                tracing::warn!(
                    message_id = %message.id(),
                    "Queue was reset before settling, the message will reappear"
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
        let Some((receipt, address)) = self.claim(message).await else {
            return Ok(());
        };
        tracing::debug!(message_id = %message.id(), queue = %address.name, "Deleting");
        let outcome = async {
            self.clients()
                .await?
                .sqs
                .delete(&address.url, &receipt)
                .await
        };
        self.settled(outcome.await).await
    }

    /// Without requeue the message is copied to the dead-letter queue, when
    /// there is one, and deleted. With requeue it becomes visible again
    /// immediately.
    pub async fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        let Some((receipt, address)) = self.claim(message).await else {
            return Ok(());
        };

        let outcome = async {
            let clients = self.clients().await?;
            if requeue {
                tracing::info!(message_id = %message.id(), "Rejecting back to the queue");
                return clients
                    .sqs
                    .change_visibility(&address.url, &receipt, Duration::ZERO)
                    .await;
            }

            match &address.dead_letter_url {
                Some(dead_letter_url) => {
                    tracing::info!(message_id = %message.id(), queue = %address.name, "Dead-lettering");
                    let (group_id, deduplication_id) = if self.subscription.queue.fifo {
                        (
                            Some(
                                message
                                    .header
                                    .partition_key()
                                    .unwrap_or(message.header.topic().as_str())
                                    .to_owned(),
                            ),
                            Some(message.id().to_owned()),
                        )
                    } else {
                        (None, None)
                    };
                    clients
                        .sqs
                        .send(SqsSend {
                            queue_url: dead_letter_url.clone(),
                            envelope: codec::sqs::encode(message),
                            delay: Duration::ZERO,
                            group_id,
                            deduplication_id,
                        })
                        .await?;
                }
                None => {
                    tracing::warn!(
                        message_id = %message.id(),
                        queue = %address.name,
                        "Rejected with no dead-letter queue, dropping"
                    );
                }
            }
            clients.sqs.delete(&address.url, &receipt).await
        };
        self.settled(outcome.await).await
    }

    /// Hides the message for `delay` so it is received again. Once the
    /// redrive budget is spent the message is rejected instead and `false`
    /// is returned.
    pub async fn requeue(&self, message: &Message, delay: Duration) -> Result<bool> {
        if let Some(redrive) = &self.subscription.queue.redrive {
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

        let Some(receipt) = receipt_handle(message) else {
            tracing::warn!(message_id = %message.id(), "Message carries no receipt handle");
            return Ok(false);
        };
        if self.outstanding.pin().remove(&receipt).is_none() {
            tracing::debug!(message_id = %message.id(), "Message already settled");
            return Ok(false);
        }
        let Some(address) = self.address.lock().await.clone() else {
            return Ok(false);
        };

        let visibility = delay.min(MAX_VISIBILITY_TIMEOUT);
        if visibility < delay {
            tracing::warn!(message_id = %message.id(), requested = ?delay, applied = ?visibility, "Requeue delay exceeds the visibility maximum, clamping");
        }
        let outcome = async {
            self.clients()
                .await?
                .sqs
                .change_visibility(&address.url, &receipt, visibility)
                .await
        };
        self.settled(outcome.await).await?;
        tracing::debug!(message_id = %message.id(), ?visibility, "Requeued");
        Ok(true)
    }

    /// Deletes every message in the queue. A missing queue counts as empty,
    /// and purging never provisions one.
    pub async fn purge(&self) -> Result<()> {
        let channel = self.subscription.channel_name.as_str();
        let clients = self.clients().await?;
        let known = self.address.lock().await.as_ref().map(|address| address.url.clone());
        let url = match known {
            Some(url) => Existence::Found(url),
            None => {
                topology::locate_queue(
                    &clients,
                    channel,
                    &self.subscription.queue,
                    self.subscription.policy,
                )
                .await?
            }
        };

        let purged = match url {
            Existence::Found(url) => clients.sqs.purge(&url).await?,
            Existence::NotFound => Existence::NotFound,
        };
        self.outstanding.pin().clear();
        match purged {
            Existence::Found(()) => tracing::info!(%channel, "Purged queue"),
            Existence::NotFound => {
                tracing::debug!(%channel, "Queue does not exist, nothing to purge");
            }
        }
        Ok(())
    }

    /// Drops the resolved queue. In-flight messages reappear once their
    /// visibility lapses.
    pub async fn close(&self) -> Result<()> {
        self.address.lock().await.take();
        self.outstanding.pin().clear();
        self.set_state(ConsumerState::Disconnected);
        Ok(())
    }
}

impl MessageConsumer for SqsConsumer {
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<Vec<Message>>> {
        Box::pin(SqsConsumer::receive(self, timeout))
    }

    fn acknowledge<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<()>> {
        Box::pin(SqsConsumer::acknowledge(self, message))
    }

    fn reject<'a>(&'a self, message: &'a Message, requeue: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(SqsConsumer::reject(self, message, requeue))
    }

    fn requeue<'a>(&'a self, message: &'a Message, delay: Duration) -> BoxFuture<'a, Result<bool>> {
        Box::pin(SqsConsumer::requeue(self, message, delay))
    }

    fn purge(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(SqsConsumer::purge(self))
    }
}

/// Creates provisioned [`SqsConsumer`] channels in one region.
#[derive(Clone)]
pub struct SqsChannelFactory {
    pool: Arc<AwsPool>,
    endpoint: AwsEndpoint,
}

impl SqsChannelFactory {
    pub fn new(pool: Arc<AwsPool>, endpoint: AwsEndpoint) -> Self {
        Self { pool, endpoint }
    }
}

impl ChannelFactory for SqsChannelFactory {
    type Subscription = SqsSubscription;

    fn create_channel<'a>(
        &'a self,
        subscription: &'a SqsSubscription,
    ) -> BoxFuture<'a, Result<Channel>> {
        Box::pin(async move {
            let consumer = SqsConsumer::builder()
                .pool(self.pool.clone())
                .endpoint(self.endpoint.clone())
                .subscription(subscription.clone())
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
