//! The backend-neutral contract applications program against.
//!
//! [`MessageProducer`] and [`MessageConsumer`] are implemented by every
//! backend. A [`Channel`] wraps one consumer for a handler loop: it receives
//! in batches, hands messages out one at a time, and forwards settlement.
//! A [`ChannelFactory`] turns a backend's subscription descriptor into a
//! provisioned channel.

use std::{collections::VecDeque, time::Duration};

use futures_util::future::BoxFuture;
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    message::{ChannelName, Message, RoutingKey},
};

/// Where a consumer is in its lifecycle. Any detected channel loss sends it
/// back to `Disconnected`, and the next receive provisions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConsumerState {
    Disconnected,
    Provisioning,
    Consuming,
    Receiving,
    Idle,
}

pub trait MessageProducer: Send + Sync {
    fn publish(&self, message: Message) -> BoxFuture<'_, Result<()>>;

    fn publish_delayed(&self, message: Message, delay: Duration) -> BoxFuture<'_, Result<()>>;

    fn publish_until<'a>(
        &'a self,
        message: Message,
        delay: Duration,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        let target = message.header.topic().to_string();
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::cancelled(target)),
                published = self.publish_delayed(message, delay) => published,
            }
        })
    }
}

pub trait MessageConsumer: Send + Sync {
    /// Never returns an empty batch: a timeout yields one "none" message.
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<Vec<Message>>>;

    /// Settling an unknown or already settled message is a no-op.
    fn acknowledge<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<()>>;

    fn reject<'a>(&'a self, message: &'a Message, requeue: bool) -> BoxFuture<'a, Result<()>>;

    /// Returns `false` when the message was dead-lettered instead.
    fn requeue<'a>(&'a self, message: &'a Message, delay: Duration) -> BoxFuture<'a, Result<bool>>;

    fn purge(&self) -> BoxFuture<'_, Result<()>>;

    fn receive_until<'a>(
        &'a self,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Message>>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::cancelled("receive")),
                received = self.receive(timeout) => received,
            }
        })
    }
}

pub struct Channel {
    name: ChannelName,
    routing_key: RoutingKey,
    consumer: Box<dyn MessageConsumer>,
    buffer: tokio::sync::Mutex<VecDeque<Message>>,
}

impl Channel {
    pub fn new(
        name: ChannelName,
        routing_key: RoutingKey,
        consumer: impl MessageConsumer + 'static,
    ) -> Self {
        Self {
            name,
            routing_key,
            consumer: Box::new(consumer),
            buffer: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    /// Next message, from the local buffer when one is waiting.
    pub async fn receive(&self, timeout: Duration) -> Result<Message> {
        let mut buffer = self.buffer.lock().await;
        if let Some(message) = buffer.pop_front() {
            return Ok(message);
        }

        let mut batch = self.consumer.receive(timeout).await?.into_iter();
        let first = batch.next().unwrap_or_else(Message::none);
        buffer.extend(batch);
        Ok(first)
    }

    pub async fn receive_until(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled(self.name.to_string())),
            received = self.receive(timeout) => received,
        }
    }

    pub async fn acknowledge(&self, message: &Message) -> Result<()> {
        self.consumer.acknowledge(message).await
    }

    pub async fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        self.consumer.reject(message, requeue).await
    }

    pub async fn requeue(&self, message: &Message, delay: Duration) -> Result<bool> {
        self.consumer.requeue(message, delay).await
    }

    /// Discards buffered messages and purges the underlying queue.
    pub async fn purge(&self) -> Result<()> {
        let buffered: Vec<Message> = self.buffer.lock().await.drain(..).collect();
        for message in &buffered {
            self.consumer.acknowledge(message).await?;
        }
        self.consumer.purge().await
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

/// Builds provisioned channels from a backend's subscription descriptor.
pub trait ChannelFactory: Send + Sync {
    type Subscription: Send + Sync;

    fn create_channel<'a>(
        &'a self,
        subscription: &'a Self::Subscription,
    ) -> BoxFuture<'a, Result<Channel>>;
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use super::*;
    use crate::message::{MessageBody, MessageHeader, MessageType};

    #[derive(Default, Clone)]
    struct ScriptedConsumer {
        batches: Arc<Mutex<VecDeque<Vec<Message>>>>,
        acks: Arc<AtomicUsize>,
        purges: Arc<AtomicUsize>,
    }

    fn message(id: &str) -> Message {
        Message::new(
            MessageHeader::builder()
                .message_id(id)
                .topic("orders")
                .message_type(MessageType::Event)
                .build(),
            MessageBody::text(id),
        )
    }

    impl MessageConsumer for ScriptedConsumer {
        fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<Vec<Message>>> {
            Box::pin(async move {
                let next = self.batches.lock().unwrap().pop_front();
                match next {
                    Some(batch) => Ok(batch),
                    None => {
                        tokio::time::sleep(timeout).await;
                        Ok(vec![Message::none()])
                    }
                }
            })
        }

        fn acknowledge<'a>(&'a self, _: &'a Message) -> BoxFuture<'a, Result<()>> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn reject<'a>(&'a self, _: &'a Message, _: bool) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn requeue<'a>(&'a self, _: &'a Message, _: Duration) -> BoxFuture<'a, Result<bool>> {
            Box::pin(async { Ok(true) })
        }

        fn purge(&self) -> BoxFuture<'_, Result<()>> {
            self.purges.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_hands_out_batch_one_at_a_time() {
        let consumer = ScriptedConsumer::default();
        consumer
            .batches
            .lock()
            .unwrap()
            .push_back(vec![message("a"), message("b")]);
        let channel = Channel::new("orders".into(), "orders".into(), consumer.clone());

        assert_eq!(channel.receive(Duration::from_secs(1)).await.unwrap().id(), "a");
        assert_eq!(channel.buffered().await, 1);
        assert_eq!(channel.receive(Duration::from_secs(1)).await.unwrap().id(), "b");
        assert!(channel.receive(Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_settles_buffered_messages() {
        let consumer = ScriptedConsumer::default();
        consumer
            .batches
            .lock()
            .unwrap()
            .push_back(vec![message("a"), message("b"), message("c")]);
        let channel = Channel::new("orders".into(), "orders".into(), consumer.clone());

        channel.receive(Duration::from_secs(1)).await.unwrap();
        channel.purge().await.unwrap();

        assert_eq!(channel.buffered().await, 0);
        assert_eq!(consumer.acks.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.purges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_until_returns_promptly_on_cancel() {
        let channel = Channel::new(
            "orders".into(),
            "orders".into(),
            ScriptedConsumer::default(),
        );
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let started = tokio::time::Instant::now();
        let result = channel
            .receive_until(Duration::from_secs(30), &cancel)
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
