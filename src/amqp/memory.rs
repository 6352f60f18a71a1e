//! An in-process AMQP broker.
//!
//! Models the parts of RabbitMQ the gateway relies on: direct, fanout and
//! topic routing, the default exchange, the `x-delayed-message` plugin,
//! dead-letter exchanges, `x-max-length` with every overflow mode,
//! `x-message-ttl`, prefetch, and redelivery of unacked messages when a
//! connection drops. Every declaring call is counted so tests can assert
//! that nothing was created.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, ExchangeKind,
};
use tokio::{sync::mpsc, time::Instant};

use super::{
    topology::{X_DEAD_LETTER_EXCHANGE, X_DEAD_LETTER_ROUTING_KEY, X_DELAYED_TYPE, X_MAX_LENGTH,
        X_MESSAGE_TTL, X_OVERFLOW},
    transport::{ExchangeDeclaration, Published, QueueDeclaration},
    AmqpChannel, AmqpConnection, AmqpEndpoint, OverflowBehavior,
};
use crate::{
    codec::{
        amqp::{amqp_to_i64, amqp_to_string, lookup, AmqpDelivery, AmqpEnvelope},
        X_DELAY,
    },
    error::{Error, Result},
    pool::{CloseSignal, Connection, Connector},
    topology::Existence,
};

const DELAYED_MESSAGE: &str = "x-delayed-message";

/// Snapshot of how often each broker operation was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    pub connects: usize,
    pub exchange_declares: usize,
    pub queue_declares: usize,
    pub binds: usize,
    pub passive_checks: usize,
    pub publishes: usize,
}

impl CallCounts {
    /// Calls that could have changed the broker's topology.
    pub fn creates(&self) -> usize {
        self.exchange_declares + self.queue_declares + self.binds
    }
}

#[derive(Default)]
struct Calls {
    connects: AtomicUsize,
    exchange_declares: AtomicUsize,
    queue_declares: AtomicUsize,
    binds: AtomicUsize,
    passive_checks: AtomicUsize,
    publishes: AtomicUsize,
}

impl Calls {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CallCounts {
        CallCounts {
            connects: self.connects.load(Ordering::Relaxed),
            exchange_declares: self.exchange_declares.load(Ordering::Relaxed),
            queue_declares: self.queue_declares.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            passive_checks: self.passive_checks.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct ExchangeState {
    kind: ExchangeKind,
    /// Routing used by an `x-delayed-message` exchange once a delay elapses.
    delayed_type: Option<ExchangeKind>,
}

impl ExchangeState {
    fn routing_kind(&self) -> &ExchangeKind {
        self.delayed_type.as_ref().unwrap_or(&self.kind)
    }

    fn is_delayed(&self) -> bool {
        matches!(&self.kind, ExchangeKind::Custom(kind) if kind == DELAYED_MESSAGE)
    }
}

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Vec<u8>,
    redelivered: bool,
    enqueued: Instant,
}

struct QueueConsumer {
    channel: u64,
    prefetch: u16,
    tx: mpsc::UnboundedSender<AmqpDelivery>,
}

#[derive(Default)]
struct QueueState {
    arguments: FieldTable,
    ready: VecDeque<Stored>,
    consumers: Vec<QueueConsumer>,
    next_consumer: usize,
}

impl QueueState {
    fn max_length(&self) -> Option<usize> {
        lookup(&self.arguments, X_MAX_LENGTH)
            .and_then(amqp_to_i64)
            .and_then(|n| usize::try_from(n).ok())
    }

    fn overflow(&self) -> OverflowBehavior {
        lookup(&self.arguments, X_OVERFLOW)
            .and_then(amqp_to_string)
            .and_then(|raw| OverflowBehavior::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn ttl(&self) -> Option<Duration> {
        lookup(&self.arguments, X_MESSAGE_TTL)
            .and_then(amqp_to_i64)
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }

    fn dead_letter_target(&self, routing_key: &str) -> Option<(String, String)> {
        let exchange = lookup(&self.arguments, X_DEAD_LETTER_EXCHANGE).and_then(amqp_to_string)?;
        let routing_key = lookup(&self.arguments, X_DEAD_LETTER_ROUTING_KEY)
            .and_then(amqp_to_string)
            .unwrap_or_else(|| routing_key.to_owned());
        Some((exchange, routing_key))
    }
}

struct Unacked {
    queue: String,
    channel: u64,
    stored: Stored,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    /// Channel id to connection id.
    channels: HashMap<u64, u64>,
    next_tag: u64,
}

enum Enqueued {
    Accepted,
    Rejected,
}

impl BrokerState {
    fn bound_queues(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(state) = self.exchanges.get(exchange) else {
            return Err(Error::unreachable(exchange, "no exchange with that name"));
        };
        let kind = state.routing_kind();

        Ok(self
            .bindings
            .iter()
            .filter(|(bound, _, _)| bound == exchange)
            .filter(|(_, _, pattern)| match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(pattern, routing_key),
                _ => pattern == routing_key,
            })
            .map(|(_, queue, _)| queue.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    /// Routes a message and reports whether every matched queue took it.
    fn route(&mut self, exchange: &str, stored: Stored) -> Result<bool> {
        let queues = self.bound_queues(exchange, &stored.routing_key)?;
        if queues.is_empty() {
            tracing::debug!(exchange, routing_key = %stored.routing_key, "Message was unroutable");
        }

        let mut accepted = true;
        for queue in queues {
            if let Enqueued::Rejected = self.enqueue(&queue, stored.clone()) {
                accepted = false;
            }
        }
        Ok(accepted)
    }

    fn enqueue(&mut self, queue: &str, stored: Stored) -> Enqueued {
        let Some(state) = self.queues.get_mut(queue) else {
            return Enqueued::Rejected;
        };

        let mut dead = Vec::new();
        if let Some(max) = state.max_length() {
            if state.ready.len() >= max {
                match state.overflow() {
                    OverflowBehavior::RejectPublish => return Enqueued::Rejected,
                    OverflowBehavior::RejectPublishDlx => {
                        self.dead_letter(queue, stored);
                        return Enqueued::Rejected;
                    }
                    OverflowBehavior::DropHead => {
                        if let Some(head) = state.ready.pop_front() {
                            dead.push(head);
                        }
                    }
                }
            }
        }

        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(Stored {
                enqueued: Instant::now(),
                ..stored
            });
        }
        for head in dead {
            self.dead_letter(queue, head);
        }
        self.dispatch(queue);
        Enqueued::Accepted
    }

    fn dead_letter(&mut self, queue: &str, stored: Stored) {
        let target = self
            .queues
            .get(queue)
            .and_then(|state| state.dead_letter_target(&stored.routing_key));

        let Some((exchange, routing_key)) = target else {
            tracing::debug!(queue, "Dropping message with no dead-letter exchange");
            return;
        };

        let dead = Stored {
            routing_key,
            redelivered: false,
            ..stored
        };
        if let Err(e) = self.route(&exchange, dead) {
            tracing::warn!(queue, "Dead-lettering failed: {e}");
        }
    }

    fn in_flight(&self, channel: u64) -> usize {
        self.unacked.values().filter(|u| u.channel == channel).count()
    }

    /// Pushes ready messages to consumers with spare prefetch.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get(queue) else {
                return;
            };
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let count = state.consumers.len();
            let start = state.next_consumer % count;
            let chosen = (0..count).map(|i| (start + i) % count).find(|&i| {
                let consumer = &state.consumers[i];
                consumer.prefetch == 0
                    || self.in_flight(consumer.channel) < usize::from(consumer.prefetch)
            });
            let Some(index) = chosen else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;

            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            let Some(stored) = state.ready.pop_front() else {
                return;
            };

            if let Some(ttl) = state.ttl() {
                if stored.enqueued.elapsed() >= ttl {
                    self.dead_letter(queue, stored);
                    continue;
                }
            }

            state.next_consumer = index + 1;
            let consumer = &state.consumers[index];
            let delivery = AmqpDelivery {
                delivery_tag: tag,
                redelivered: stored.redelivered,
                exchange: stored.exchange.clone(),
                routing_key: stored.routing_key.clone(),
                properties: stored.properties.clone(),
                body: stored.body.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                state.consumers.remove(index);
                state.ready.push_front(stored);
                continue;
            }

            let channel = consumer.channel;
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_owned(),
                    channel,
                    stored,
                },
            );
        }
    }

    /// Forgets a channel's consumers and returns its unacked messages.
    fn drop_channel(&mut self, channel: u64) {
        for state in self.queues.values_mut() {
            state.consumers.retain(|consumer| consumer.channel != channel);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();

        let mut touched = BTreeSet::new();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(state) = self.queues.get_mut(&unacked.queue) {
                    state.ready.push_front(Stored {
                        redelivered: true,
                        ..unacked.stored
                    });
                    touched.insert(unacked.queue);
                }
            }
        }
        self.channels.remove(&channel);
        for queue in touched {
            self.dispatch(&queue);
        }
    }
}

/// `*` matches one dot-separated word, `#` matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Handle to an in-process broker. Clones share the broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    calls: Arc<Calls>,
    connections: Arc<Mutex<Vec<Weak<MemoryConnection>>>>,
    refuse: Arc<AtomicBool>,
    hold: Arc<AtomicBool>,
    ids: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn calls(&self) -> CallCounts {
        self.calls.snapshot()
    }

    /// Makes every new connection attempt fail until called with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// While set, publisher confirmations never arrive.
    pub fn hold_confirmations(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Drops every open connection, as a broker restart would.
    pub fn kill_connections(&self) {
        let connections: Vec<Arc<MemoryConnection>> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|connection| connection.upgrade())
            .collect();

        for connection in connections {
            connection.shut_down();
            connection.on_close.fire();
        }
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state()
            .exchanges
            .get(name)
            .map(|exchange| exchange.kind.clone())
    }

    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.state()
            .queues
            .get(name)
            .map(|queue| queue.arguments.clone())
    }

    /// Ready (not yet delivered) messages in `name`.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state().queues.get(name).map(|queue| queue.ready.len())
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state().bindings.iter().cloned().collect()
    }

    /// Removes a queue out from under its consumers.
    pub fn delete_queue(&self, name: &str) {
        let mut state = self.state();
        if state.queues.remove(name).is_some() {
            state.bindings.retain(|(_, queue, _)| queue != name);
            state.unacked.retain(|_, unacked| unacked.queue != name);
            tracing::info!(queue = name, "Queue deleted");
        }
    }

    fn publish_now(&self, exchange: &str, stored: Stored) -> Result<bool> {
        self.state().route(exchange, stored)
    }
}

impl Connector<AmqpEndpoint, dyn AmqpConnection> for MemoryBroker {
    fn connect<'a>(
        &'a self,
        endpoint: &'a AmqpEndpoint,
        on_close: CloseSignal,
    ) -> BoxFuture<'a, Result<Arc<dyn AmqpConnection>>> {
        Box::pin(async move {
            Calls::bump(&self.calls.connects);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::unreachable(
                    endpoint.display_url().as_str(),
                    "connection refused",
                ));
            }

            let connection = Arc::new(MemoryConnection {
                id: self.next_id(),
                broker: self.clone(),
                open: AtomicBool::new(true),
                on_close,
            });
            self.connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::downgrade(&connection));

            Ok(connection as Arc<dyn AmqpConnection>)
        })
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    open: AtomicBool,
    on_close: CloseSignal,
}

impl MemoryConnection {
    fn shut_down(&self) {
        self.open.store(false, Ordering::SeqCst);

        let mut state = self.broker.state();
        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, connection)| **connection == self.id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            state.drop_channel(channel);
        }
    }
}

impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shut_down();
            Ok(())
        })
    }
}

impl AmqpConnection for MemoryConnection {
    fn open_channel(&self) -> BoxFuture<'_, Result<Arc<dyn AmqpChannel>>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(Error::channel_failure("memory", "connection is closed"));
            }

            let id = self.broker.next_id();
            self.broker.state().channels.insert(id, self.id);

            Ok(Arc::new(MemoryChannel {
                id,
                broker: self.broker.clone(),
                open: AtomicBool::new(true),
                confirms: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
            }) as Arc<dyn AmqpChannel>)
        })
    }
}

pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    open: AtomicBool,
    confirms: AtomicBool,
    sequence: AtomicU64,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::channel_failure("memory", "channel is closed"))
        }
    }
}

fn x_delay(properties: &BasicProperties) -> Option<i64> {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| lookup(headers, X_DELAY))
        .and_then(amqp_to_i64)
}

/// The delayed-message plugin reports an elapsed delay as negative.
fn flip_x_delay(properties: BasicProperties, millis: i64) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();
    headers.insert(ShortString::from(X_DELAY), AMQPValue::LongLongInt(-millis));
    properties.with_headers(headers)
}

impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.state().channels.contains_key(&self.id)
    }

    fn declare_exchange(&self, declaration: ExchangeDeclaration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            Calls::bump(&self.broker.calls.exchange_declares);

            let delayed_type = lookup(&declaration.arguments, X_DELAYED_TYPE)
                .and_then(amqp_to_string)
                .map(|kind| match kind.as_str() {
                    "fanout" => ExchangeKind::Fanout,
                    "topic" => ExchangeKind::Topic,
                    "headers" => ExchangeKind::Headers,
                    _ => ExchangeKind::Direct,
                });

            let mut state = self.broker.state();
            if let Some(existing) = state.exchanges.get(&declaration.name) {
                if existing.kind != declaration.kind {
                    return Err(Error::channel_failure(
                        &declaration.name,
                        "exchange redeclared with a different type",
                    ));
                }
                return Ok(());
            }
            state.exchanges.insert(
                declaration.name,
                ExchangeState {
                    kind: declaration.kind,
                    delayed_type,
                },
            );
            Ok(())
        })
    }

    fn exchange_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<()>>> {
        Box::pin(async move {
            self.check_open()?;
            Calls::bump(&self.broker.calls.passive_checks);
            Ok(self
                .broker
                .state()
                .exchanges
                .contains_key(name)
                .then_some(())
                .into())
        })
    }

    fn declare_queue(&self, declaration: QueueDeclaration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            Calls::bump(&self.broker.calls.queue_declares);

            let mut state = self.broker.state();
            match state.queues.get(&declaration.name) {
                Some(existing) if existing.arguments != declaration.arguments => {
                    Err(Error::channel_failure(
                        &declaration.name,
                        "queue redeclared with different arguments",
                    ))
                }
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(
                        declaration.name,
                        QueueState {
                            arguments: declaration.arguments,
                            ..Default::default()
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    fn queue_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<u32>>> {
        Box::pin(async move {
            self.check_open()?;
            Calls::bump(&self.broker.calls.passive_checks);
            Ok(self
                .broker
                .state()
                .queues
                .get(name)
                .map(|queue| u32::try_from(queue.ready.len()).unwrap_or(u32::MAX))
                .into())
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            Calls::bump(&self.broker.calls.binds);

            let mut state = self.broker.state();
            if !state.queues.contains_key(queue) {
                return Err(Error::unreachable(queue, "no queue with that name"));
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(Error::unreachable(exchange, "no exchange with that name"));
            }
            state.bindings.insert((
                exchange.to_owned(),
                queue.to_owned(),
                routing_key.to_owned(),
            ));
            Ok(())
        })
    }

    fn enable_confirms(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            self.confirms.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        envelope: AmqpEnvelope,
    ) -> BoxFuture<'a, Result<Published>> {
        Box::pin(async move {
            self.check_open()?;
            Calls::bump(&self.broker.calls.publishes);
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

            let stored = Stored {
                exchange: exchange.to_owned(),
                routing_key: envelope.routing_key,
                properties: envelope.properties,
                body: envelope.body,
                redelivered: false,
                enqueued: Instant::now(),
            };

            let delayed = {
                let state = self.broker.state();
                match state.exchanges.get(exchange) {
                    Some(ex) if ex.is_delayed() => x_delay(&stored.properties).filter(|ms| *ms > 0),
                    _ => None,
                }
            };

            let accepted = match delayed {
                Some(millis) => {
                    let broker = self.broker.clone();
                    let exchange = exchange.to_owned();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(millis.unsigned_abs())).await;
                        let stored = Stored {
                            properties: flip_x_delay(stored.properties, millis),
                            ..stored
                        };
                        if let Err(e) = broker.publish_now(&exchange, stored) {
                            tracing::warn!(%exchange, "Delayed delivery failed: {e}");
                        }
                    });
                    true
                }
                None => self.broker.publish_now(exchange, stored)?,
            };

            let confirmed = accepted || !self.confirms.load(Ordering::SeqCst);
            let confirmation: BoxFuture<'static, Result<bool>> =
                if self.broker.hold.load(Ordering::SeqCst) {
                    Box::pin(futures_util::future::pending())
                } else {
                    Box::pin(async move { Ok(confirmed) })
                };
            Ok(Published {
                sequence,
                confirmation,
            })
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<mpsc::UnboundedReceiver<AmqpDelivery>>> {
        Box::pin(async move {
            self.check_open()?;
            let (tx, rx) = mpsc::unbounded_channel();

            let mut state = self.broker.state();
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Err(Error::unreachable(queue, "no queue with that name"));
            };
            queue_state.consumers.push(QueueConsumer {
                channel: self.id,
                prefetch,
                tx,
            });
            tracing::debug!(queue, consumer_tag, prefetch, "Consumer registered");
            state.dispatch(queue);

            Ok(rx)
        })
    }

    fn ack(&self, delivery_tag: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            let mut state = self.broker.state();
            match state.unacked.remove(&delivery_tag) {
                Some(unacked) if unacked.channel == self.id => {
                    state.dispatch(&unacked.queue);
                    Ok(())
                }
                Some(unacked) => {
                    state.unacked.insert(delivery_tag, unacked);
                    Err(Error::channel_failure("memory", "delivery tag belongs to another channel"))
                }
                None => Err(Error::channel_failure(
                    "memory",
                    format!("unknown delivery tag {delivery_tag}"),
                )),
            }
        })
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_open()?;
            let mut state = self.broker.state();
            let Some(unacked) = state.unacked.remove(&delivery_tag) else {
                return Err(Error::channel_failure(
                    "memory",
                    format!("unknown delivery tag {delivery_tag}"),
                ));
            };

            if requeue {
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(Stored {
                        redelivered: true,
                        ..unacked.stored
                    });
                }
            } else {
                state.dead_letter(&unacked.queue, unacked.stored);
            }
            state.dispatch(&unacked.queue);
            Ok(())
        })
    }

    fn purge<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Existence<u32>>> {
        Box::pin(async move {
            self.check_open()?;
            let mut state = self.broker.state();
            Ok(state
                .queues
                .get_mut(queue)
                .map(|queue| {
                    let purged = queue.ready.len();
                    queue.ready.clear();
                    u32::try_from(purged).unwrap_or(u32::MAX)
                })
                .into())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            self.broker.state().drop_channel(self.id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_patterns() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("payments.*", "orders.created"));
    }
}
