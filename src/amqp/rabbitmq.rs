//! [`AmqpConnection`] and [`AmqpChannel`] over `lapin`.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::{future::BoxFuture, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::FieldTable,
    ConnectionProperties,
};
use secrecy::ExposeSecret;
use tokio::sync::mpsc;

use super::{
    transport::{ExchangeDeclaration, Published, QueueDeclaration},
    AmqpChannel, AmqpConnection, AmqpEndpoint,
};
use crate::{
    codec::amqp::{AmqpDelivery, AmqpEnvelope},
    error::{Error, Result},
    pool::{CloseSignal, Connection, Connector},
    topology::Existence,
};

const REPLY_SUCCESS: u16 = 200;

fn is_not_found(e: &lapin::Error) -> bool {
    matches!(
        e,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

/// Sorts lapin errors into the gateway's taxonomy. A missing target means the
/// broker cannot serve us; everything else is a channel fault.
fn classify(target: &str, e: lapin::Error) -> Error {
    match e {
        e if is_not_found(&e) => Error::unreachable_from(target, e),
        e @ (lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_)) => {
            Error::unreachable_from(target, e)
        }
        e => Error::channel_failure_from(target, e),
    }
}

/// Opens `lapin` connections for the pool.
#[derive(Debug, Clone, Default)]
pub struct RabbitConnector;

impl Connector<AmqpEndpoint, dyn AmqpConnection> for RabbitConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a AmqpEndpoint,
        on_close: CloseSignal,
    ) -> BoxFuture<'a, Result<Arc<dyn AmqpConnection>>> {
        Box::pin(async move {
            let target = endpoint.display_url().to_string();
            let uri = endpoint.connection_uri()?;

            let mut properties = ConnectionProperties::default();
            if let Some(name) = endpoint.connection_name() {
                properties = properties.with_connection_name(name.into());
            }

            tracing::debug!(%target, "Connecting to broker");
            let connection = lapin::Connection::connect(uri.expose_secret(), properties)
                .await
                .map_err(|e| Error::unreachable_from(&target, e))?;

            connection.on_error({
                let target = target.clone();
                move |e| {
                    tracing::warn!(%target, "Broker connection failed: {e}");
                    on_close.fire();
                }
            });

            Ok(Arc::new(RabbitConnection {
                inner: Arc::new(connection),
                target,
            }) as Arc<dyn AmqpConnection>)
        })
    }
}

pub struct RabbitConnection {
    inner: Arc<lapin::Connection>,
    target: String,
}

impl Connection for RabbitConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.is_open() {
                return Ok(());
            }
            self.inner
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|e| classify(&self.target, e))
        })
    }
}

impl AmqpConnection for RabbitConnection {
    fn open_channel(&self) -> BoxFuture<'_, Result<Arc<dyn AmqpChannel>>> {
        Box::pin(async move {
            let channel = self
                .inner
                .create_channel()
                .await
                .map_err(|e| classify(&self.target, e))?;

            Ok(Arc::new(RabbitChannel {
                channel,
                connection: self.inner.clone(),
                target: self.target.clone(),
                sequence: tokio::sync::Mutex::new(0),
                confirms: AtomicU64::new(0),
            }) as Arc<dyn AmqpChannel>)
        })
    }
}

pub struct RabbitChannel {
    channel: lapin::Channel,
    /// Passive declares of missing targets close the channel they run on, so
    /// existence checks get a throwaway channel from here.
    connection: Arc<lapin::Connection>,
    target: String,
    /// Held across a publish so sequence numbers match the broker's order.
    sequence: tokio::sync::Mutex<u64>,
    confirms: AtomicU64,
}

impl RabbitChannel {
    async fn passive<T, F, Fut>(&self, name: &str, check: F) -> Result<Existence<T>>
    where
        F: FnOnce(lapin::Channel) -> Fut,
        Fut: std::future::Future<Output = lapin::Result<T>>,
    {
        let scratch = self
            .connection
            .create_channel()
            .await
            .map_err(|e| classify(&self.target, e))?;

        match check(scratch.clone()).await {
            Ok(found) => {
                if let Err(e) = scratch.close(REPLY_SUCCESS, "done").await {
                    tracing::debug!(name, "Error closing scratch channel: {e}");
                }
                Ok(Existence::Found(found))
            }
            Err(e) if is_not_found(&e) => Ok(Existence::NotFound),
            Err(e) => Err(classify(name, e)),
        }
    }
}

impl AmqpChannel for RabbitChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn declare_exchange(&self, declaration: ExchangeDeclaration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.channel
                .exchange_declare(
                    &declaration.name,
                    declaration.kind,
                    ExchangeDeclareOptions {
                        durable: declaration.durable,
                        ..Default::default()
                    },
                    declaration.arguments,
                )
                .await
                .map_err(|e| classify(&declaration.name, e))
        })
    }

    fn exchange_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<()>>> {
        Box::pin(self.passive(name, move |channel| async move {
            channel
                .exchange_declare(
                    name,
                    lapin::ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
        }))
    }

    fn declare_queue(&self, declaration: QueueDeclaration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.channel
                .queue_declare(
                    &declaration.name,
                    QueueDeclareOptions {
                        durable: declaration.durable,
                        ..Default::default()
                    },
                    declaration.arguments,
                )
                .await
                .map(|_| ())
                .map_err(|e| classify(&declaration.name, e))
        })
    }

    fn queue_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<u32>>> {
        Box::pin(self.passive(name, move |channel| async move {
            channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map(|queue| queue.message_count())
        }))
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| classify(queue, e))
        })
    }

    fn enable_confirms(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| classify(&self.target, e))?;
            self.confirms.store(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        envelope: AmqpEnvelope,
    ) -> BoxFuture<'a, Result<Published>> {
        Box::pin(async move {
            let mut sequence = self.sequence.lock().await;

            let confirm = self
                .channel
                .basic_publish(
                    exchange,
                    &envelope.routing_key,
                    BasicPublishOptions::default(),
                    &envelope.body,
                    envelope.properties,
                )
                .await
                .map_err(|e| classify(exchange, e))?;

            *sequence += 1;
            let target = exchange.to_owned();
            let confirms_enabled = self.confirms.load(Ordering::SeqCst) == 1;

            Ok(Published {
                sequence: *sequence,
                confirmation: Box::pin(async move {
                    match confirm.await.map_err(|e| classify(&target, e))? {
                        Confirmation::Ack(_) => Ok(true),
                        Confirmation::Nack(_) => Ok(false),
                        Confirmation::NotRequested => Ok(!confirms_enabled),
                    }
                }),
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
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| classify(queue, e))?;

            let mut consumer = self
                .channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| classify(queue, e))?;

            let (tx, rx) = mpsc::unbounded_channel();
            let queue = queue.to_owned();
            tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    let delivery = match delivery {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            tracing::warn!(%queue, "Consumer stream failed: {e}");
                            break;
                        }
                    };
                    let forwarded = AmqpDelivery {
                        delivery_tag: delivery.delivery_tag,
                        redelivered: delivery.redelivered,
                        exchange: delivery.exchange.as_str().to_owned(),
                        routing_key: delivery.routing_key.as_str().to_owned(),
                        properties: delivery.properties,
                        body: delivery.data,
                    };
                    if tx.send(forwarded).is_err() {
                        break;
                    }
                }
                tracing::debug!(%queue, "Consumer stream ended");
            });

            Ok(rx)
        })
    }

    fn ack(&self, delivery_tag: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
                .map_err(|e| classify(&self.target, e))
        })
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue,
                    },
                )
                .await
                .map_err(|e| classify(&self.target, e))
        })
    }

    fn purge<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Existence<u32>>> {
        Box::pin(async move {
            if !self.queue_exists(queue).await?.is_found() {
                return Ok(Existence::NotFound);
            }
            self.channel
                .queue_purge(queue, QueuePurgeOptions::default())
                .await
                .map(Existence::Found)
                .map_err(|e| classify(queue, e))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.is_open() {
                return Ok(());
            }
            self.channel
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|e| classify(&self.target, e))
        })
    }
}
