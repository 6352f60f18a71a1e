//! The slice of AMQP the gateway needs, as object-safe traits.
//!
//! [`rabbitmq`](super::rabbitmq) implements these over `lapin`;
//! [`memory`](super::memory) implements them in-process.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use lapin::{types::FieldTable, ExchangeKind};
use tokio::sync::mpsc;

use crate::{
    codec::amqp::{AmqpDelivery, AmqpEnvelope},
    error::Result,
    pool::Connection,
    topology::Existence,
};

pub trait AmqpConnection: Connection {
    fn open_channel(&self) -> BoxFuture<'_, Result<Arc<dyn AmqpChannel>>>;
}

impl std::fmt::Debug for dyn AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub arguments: FieldTable,
}

/// A publish the broker has accepted for delivery but not yet confirmed.
pub struct Published {
    /// Position of this publish on its channel since confirms were enabled.
    pub sequence: u64,
    /// Resolves to `true` on ack and `false` on nack.
    pub confirmation: BoxFuture<'static, Result<bool>>,
}

/// One AMQP channel.
///
/// Read-only existence checks never mutate the broker and report a missing
/// target as [`Existence::NotFound`] rather than as an error.
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    fn declare_exchange(&self, declaration: ExchangeDeclaration) -> BoxFuture<'_, Result<()>>;

    fn exchange_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<()>>>;

    fn declare_queue(&self, declaration: QueueDeclaration) -> BoxFuture<'_, Result<()>>;

    /// Reports the number of ready messages when the queue exists.
    fn queue_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<u32>>>;

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Puts the channel in publisher-confirm mode. Sequence numbers start at 1.
    fn enable_confirms(&self) -> BoxFuture<'_, Result<()>>;

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        envelope: AmqpEnvelope,
    ) -> BoxFuture<'a, Result<Published>>;

    /// Starts pushing deliveries from `queue` into the returned buffer. The
    /// buffer closes when the channel does.
    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<mpsc::UnboundedReceiver<AmqpDelivery>>>;

    fn ack(&self, delivery_tag: u64) -> BoxFuture<'_, Result<()>>;

    /// Negative acknowledgement. Without requeue the broker dead-letters the
    /// message when the queue has a dead-letter exchange, and drops it
    /// otherwise.
    fn nack(&self, delivery_tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>>;

    /// Removes every ready message. A missing queue is reported, not raised.
    fn purge<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Existence<u32>>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
