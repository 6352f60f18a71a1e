//! Blocking wrappers for callers outside an async runtime.
//!
//! Each wrapper owns a handle to a runtime and waits on the async
//! operation. Calling them from inside a runtime panics, as
//! [`tokio::runtime::Runtime::block_on`] does.

use std::{sync::Arc, time::Duration};

use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{Channel, MessageConsumer, MessageProducer},
    error::{Error, Result},
    message::Message,
};

/// A multi-threaded runtime, so scheduled sends and broker I/O keep running
/// between blocking calls.
pub fn runtime() -> Result<Arc<Runtime>> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("switchyard")
        .build()
        .map(Arc::new)
        .map_err(Error::internal)
}

pub struct BlockingProducer<P> {
    runtime: Arc<Runtime>,
    producer: P,
}

impl<P: MessageProducer> BlockingProducer<P> {
    pub fn new(runtime: Arc<Runtime>, producer: P) -> Self {
        Self { runtime, producer }
    }

    pub fn publish(&self, message: Message) -> Result<()> {
        self.runtime.block_on(self.producer.publish(message))
    }

    pub fn publish_delayed(&self, message: Message, delay: Duration) -> Result<()> {
        self.runtime
            .block_on(self.producer.publish_delayed(message, delay))
    }

    pub fn publish_until(
        &self,
        message: Message,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.runtime
            .block_on(self.producer.publish_until(message, delay, cancel))
    }

    pub fn get_ref(&self) -> &P {
        &self.producer
    }
}

pub struct BlockingConsumer<C> {
    runtime: Arc<Runtime>,
    consumer: C,
}

impl<C: MessageConsumer> BlockingConsumer<C> {
    pub fn new(runtime: Arc<Runtime>, consumer: C) -> Self {
        Self { runtime, consumer }
    }

    pub fn receive(&self, timeout: Duration) -> Result<Vec<Message>> {
        self.runtime.block_on(self.consumer.receive(timeout))
    }

    pub fn receive_until(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        self.runtime
            .block_on(self.consumer.receive_until(timeout, cancel))
    }

    pub fn acknowledge(&self, message: &Message) -> Result<()> {
        self.runtime.block_on(self.consumer.acknowledge(message))
    }

    pub fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        self.runtime.block_on(self.consumer.reject(message, requeue))
    }

    pub fn requeue(&self, message: &Message, delay: Duration) -> Result<bool> {
        self.runtime.block_on(self.consumer.requeue(message, delay))
    }

    pub fn purge(&self) -> Result<()> {
        self.runtime.block_on(self.consumer.purge())
    }

    pub fn get_ref(&self) -> &C {
        &self.consumer
    }
}

/// One message at a time over a [`Channel`].
pub struct BlockingChannel {
    runtime: Arc<Runtime>,
    channel: Channel,
}

impl BlockingChannel {
    pub fn new(runtime: Arc<Runtime>, channel: Channel) -> Self {
        Self { runtime, channel }
    }

    pub fn receive(&self, timeout: Duration) -> Result<Message> {
        self.runtime.block_on(self.channel.receive(timeout))
    }

    pub fn receive_until(&self, timeout: Duration, cancel: &CancellationToken) -> Result<Message> {
        self.runtime
            .block_on(self.channel.receive_until(timeout, cancel))
    }

    pub fn acknowledge(&self, message: &Message) -> Result<()> {
        self.runtime.block_on(self.channel.acknowledge(message))
    }

    pub fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        self.runtime.block_on(self.channel.reject(message, requeue))
    }

    pub fn requeue(&self, message: &Message, delay: Duration) -> Result<bool> {
        self.runtime.block_on(self.channel.requeue(message, delay))
    }

    pub fn purge(&self) -> Result<()> {
        self.runtime.block_on(self.channel.purge())
    }
}
