//! Exchange, queue and dead-letter provisioning on an AMQP broker.

use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    ExchangeKind,
};

use super::{
    transport::{ExchangeDeclaration, QueueDeclaration},
    AmqpChannel, AmqpSubscription, Exchange, OverflowBehavior, QueueAttributes,
};
use crate::{
    codec::delay_to_millis,
    error::{Error, Result},
    topology::{naming::amqp_name, TopologyPolicy},
};

pub const X_MESSAGE_TTL: &str = "x-message-ttl";
pub const X_MAX_LENGTH: &str = "x-max-length";
pub const X_OVERFLOW: &str = "x-overflow";
pub const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const X_HA_POLICY: &str = "x-ha-policy";
pub const X_DELAYED_TYPE: &str = "x-delayed-type";

const DELAYED_MESSAGE: &str = "x-delayed-message";

fn kind_name(kind: &ExchangeKind) -> &str {
    match kind {
        ExchangeKind::Direct => "direct",
        ExchangeKind::Fanout => "fanout",
        ExchangeKind::Headers => "headers",
        ExchangeKind::Topic => "topic",
        ExchangeKind::Custom(name) => name,
    }
}

fn text(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

/// A delay-capable exchange is declared through the delayed-message plugin,
/// which routes like the configured kind once a message's delay is up.
pub fn exchange_declaration(exchange: &Exchange) -> ExchangeDeclaration {
    let name = amqp_name(&exchange.name);
    if !exchange.supports_delay {
        return ExchangeDeclaration {
            name,
            kind: exchange.kind.clone(),
            durable: exchange.durable,
            arguments: FieldTable::default(),
        };
    }

    let mut arguments = FieldTable::default();
    arguments.insert(
        ShortString::from(X_DELAYED_TYPE),
        text(kind_name(&exchange.kind)),
    );
    ExchangeDeclaration {
        name,
        kind: ExchangeKind::Custom(DELAYED_MESSAGE.to_owned()),
        durable: exchange.durable,
        arguments,
    }
}

/// Where rejected messages go: `(exchange, routing key)`.
pub type DeadLetterTarget = (String, String);

/// Queue arguments for `attributes`. Exactly one `x-overflow` is written, and
/// only alongside a length limit.
pub fn queue_arguments(
    queue: &str,
    attributes: &QueueAttributes,
    dead_letter: Option<&DeadLetterTarget>,
) -> FieldTable {
    let mut arguments = FieldTable::default();

    if let Some(ttl) = attributes.message_ttl {
        arguments.insert(
            ShortString::from(X_MESSAGE_TTL),
            AMQPValue::LongLongInt(delay_to_millis(ttl)),
        );
    }

    if let Some(max_length) = attributes.max_length {
        arguments.insert(
            ShortString::from(X_MAX_LENGTH),
            AMQPValue::LongLongInt(i64::from(max_length)),
        );

        let overflow = match (attributes.overflow, dead_letter) {
            (OverflowBehavior::RejectPublishDlx, None) => {
                tracing::warn!(
                    queue,
                    "reject-publish-dlx needs a dead-letter exchange, using reject-publish"
                );
                OverflowBehavior::RejectPublish
            }
            (overflow, _) => overflow,
        };
        arguments.insert(ShortString::from(X_OVERFLOW), text(&overflow.to_string()));
    }

    if let Some((exchange, routing_key)) = dead_letter {
        arguments.insert(ShortString::from(X_DEAD_LETTER_EXCHANGE), text(exchange));
        arguments.insert(ShortString::from(X_DEAD_LETTER_ROUTING_KEY), text(routing_key));
    }

    if attributes.high_availability {
        arguments.insert(ShortString::from(X_HA_POLICY), text("all"));
    }

    arguments
}

fn missing(what: &str, name: &str) -> Error {
    Error::unreachable(name, format!("{what} {name} does not exist"))
}

/// Makes sure the exchange is there. Returns its normalized name.
pub async fn ensure_exchange(
    channel: &dyn AmqpChannel,
    exchange: &Exchange,
    policy: TopologyPolicy,
) -> Result<String> {
    let declaration = exchange_declaration(exchange);
    let name = declaration.name.clone();

    match policy {
        TopologyPolicy::Assume => {}
        TopologyPolicy::Validate => {
            if !channel.exchange_exists(&name).await?.is_found() {
                return Err(missing("exchange", &name));
            }
        }
        TopologyPolicy::Create => {
            tracing::debug!(exchange = %name, "Declaring exchange");
            channel.declare_exchange(declaration).await?;
        }
    }
    Ok(name)
}

/// Makes sure everything `subscription` reads from is there: its exchange,
/// its queue and bindings, and its dead-letter exchange and queue when it has
/// a redrive policy. Returns the normalized queue name.
pub async fn ensure_subscription(
    channel: &dyn AmqpChannel,
    subscription: &AmqpSubscription,
) -> Result<String> {
    let queue = amqp_name(subscription.channel_name.as_str());
    let exchange = ensure_exchange(channel, &subscription.exchange, subscription.policy).await?;

    let dead_letter = subscription.redrive.as_ref().map(|redrive| {
        (
            subscription.exchange.dead_letter_exchange(),
            amqp_name(redrive.routing_key()),
            amqp_name(&redrive.dead_letter_channel),
        )
    });

    match subscription.policy {
        TopologyPolicy::Assume => {}
        TopologyPolicy::Validate => {
            if !channel.queue_exists(&queue).await?.is_found() {
                return Err(missing("queue", &queue));
            }
            if let Some((dlx, _, dlq)) = &dead_letter {
                if !channel.exchange_exists(dlx).await?.is_found() {
                    return Err(missing("exchange", dlx));
                }
                if !channel.queue_exists(dlq).await?.is_found() {
                    return Err(missing("queue", dlq));
                }
            }
        }
        TopologyPolicy::Create => {
            if let Some((dlx, routing_key, dlq)) = &dead_letter {
                channel
                    .declare_exchange(ExchangeDeclaration {
                        name: dlx.clone(),
                        kind: ExchangeKind::Direct,
                        durable: true,
                        arguments: FieldTable::default(),
                    })
                    .await?;
                channel
                    .declare_queue(QueueDeclaration {
                        name: dlq.clone(),
                        durable: true,
                        arguments: FieldTable::default(),
                    })
                    .await?;
                channel.bind_queue(dlq, dlx, routing_key).await?;
            }

            let target = dead_letter
                .as_ref()
                .map(|(dlx, routing_key, _)| (dlx.clone(), routing_key.clone()));
            tracing::debug!(%queue, %exchange, "Declaring queue");
            channel
                .declare_queue(QueueDeclaration {
                    name: queue.clone(),
                    durable: subscription.attributes.durable,
                    arguments: queue_arguments(&queue, &subscription.attributes, target.as_ref()),
                })
                .await?;

            let routing_key = amqp_name(subscription.routing_key.as_str());
            channel.bind_queue(&queue, &exchange, &routing_key).await?;

            // Delayed requeues are routed back by queue name.
            if subscription.exchange.supports_delay
                && subscription.exchange.routes_by_key()
                && routing_key != queue
            {
                channel.bind_queue(&queue, &exchange, &queue).await?;
            }
        }
    }

    Ok(queue)
}
