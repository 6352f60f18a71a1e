//! A broker-agnostic messaging gateway.
//!
//! Applications publish and consume [`Message`]s through [`MessageProducer`]
//! and [`MessageConsumer`]; the [`amqp`] and [`aws`] backends map them onto
//! RabbitMQ and SNS/SQS, provisioning queues, exchanges, topics and
//! subscriptions on first use according to a [`TopologyPolicy`].

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod amqp;
pub mod aws;
pub mod blocking;
pub mod channel;
pub mod codec;
pub mod config;
pub mod confirm;
pub mod error;
pub mod message;
pub mod pool;
pub mod resilience;
pub mod scheduler;
pub mod topology;

pub use channel::{Channel, ChannelFactory, ConsumerState, MessageConsumer, MessageProducer};
pub use config::Config;
pub use error::{Error, Result};
pub use message::{
    ChannelName, Message, MessageBody, MessageHeader, MessageType, RoutingKey, SubscriptionName,
};
pub use topology::{RedrivePolicy, TopologyPolicy};

/// Installs the global subscriber, filtered by `SWITCHYARD_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SWITCHYARD_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SWITCHYARD_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}
