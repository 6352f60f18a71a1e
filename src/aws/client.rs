//! The slice of SNS, SQS and STS the gateway calls.
//!
//! [`super::sdk`] implements these over the AWS SDK and [`super::memory`]
//! over an in-process cloud. Lookups that may miss return
//! [`Existence`] instead of an error.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;

use crate::{
    codec::sqs::{SqsEnvelope, SqsReceived},
    error::Result,
    pool::Connection,
    topology::Existence,
};

/// One SNS publish.
#[derive(Debug, Clone, PartialEq)]
pub struct SnsPublish {
    pub topic_arn: String,
    pub envelope: SqsEnvelope,
    pub subject: Option<String>,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

/// One SQS send.
#[derive(Debug, Clone, PartialEq)]
pub struct SqsSend {
    pub queue_url: String,
    pub envelope: SqsEnvelope,
    pub delay: Duration,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

pub trait SnsApi: Send + Sync {
    /// Idempotent; returns the topic ARN.
    fn create_topic<'a>(
        &'a self,
        name: &'a str,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String>>;

    /// Exact lookup by ARN.
    fn topic_exists<'a>(&'a self, arn: &'a str) -> BoxFuture<'a, Result<Existence<String>>>;

    /// Pages through every topic looking for `name`.
    fn find_topic<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<String>>>;

    /// Returns the SNS message id.
    fn publish(&self, request: SnsPublish) -> BoxFuture<'_, Result<String>>;

    fn subscribe<'a>(
        &'a self,
        topic_arn: &'a str,
        queue_arn: &'a str,
        raw_delivery: bool,
    ) -> BoxFuture<'a, Result<String>>;

    fn subscription_exists<'a>(
        &'a self,
        topic_arn: &'a str,
        queue_arn: &'a str,
    ) -> BoxFuture<'a, Result<Existence<()>>>;
}

pub trait SqsApi: Send + Sync {
    /// Idempotent; returns the queue URL.
    fn create_queue<'a>(
        &'a self,
        name: &'a str,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String>>;

    fn queue_url<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<String>>>;

    fn queue_arn<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Existence<String>>>;

    fn set_queue_attributes<'a>(
        &'a self,
        url: &'a str,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Returns the SQS message id.
    fn send(&self, request: SqsSend) -> BoxFuture<'_, Result<String>>;

    /// Long-polls for up to `wait`. `NotFound` means the queue is gone.
    fn receive<'a>(
        &'a self,
        url: &'a str,
        max_messages: i32,
        wait: Duration,
    ) -> BoxFuture<'a, Result<Existence<Vec<SqsReceived>>>>;

    fn delete<'a>(&'a self, url: &'a str, receipt_handle: &'a str) -> BoxFuture<'a, Result<()>>;

    fn change_visibility<'a>(
        &'a self,
        url: &'a str,
        receipt_handle: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>>;

    fn purge<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Existence<()>>>;
}

pub trait StsApi: Send + Sync {
    /// Account id of the caller's credentials.
    fn account_id(&self) -> BoxFuture<'_, Result<String>>;
}

/// One set of clients for one [`super::AwsEndpoint`]. Pooled like a broker
/// connection so credentials are resolved once and shared.
pub struct AwsClients {
    pub sns: Arc<dyn SnsApi>,
    pub sqs: Arc<dyn SqsApi>,
    pub sts: Arc<dyn StsApi>,
    region: String,
    open: AtomicBool,
}

impl AwsClients {
    pub fn new(
        region: impl Into<String>,
        sns: Arc<dyn SnsApi>,
        sqs: Arc<dyn SqsApi>,
        sts: Arc<dyn StsApi>,
    ) -> Self {
        Self {
            sns,
            sqs,
            sts,
            region: region.into(),
            open: AtomicBool::new(true),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

impl Connection for AwsClients {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.open.store(false, Ordering::Release);
        Box::pin(async { Ok(()) })
    }
}

impl std::fmt::Debug for AwsClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsClients")
            .field("region", &self.region)
            .field("open", &self.is_open())
            .finish()
    }
}
