//! An in-process SNS/SQS/STS.
//!
//! Enough of the real services to run the gateway hermetically: topics with
//! raw and JSON-wrapped fan-out to queues, per-message delay, visibility
//! timeouts, receive counts with native redrive, FIFO groups and
//! deduplication, and purge. Every call is counted so tests can assert that
//! validation created nothing.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use base64::Engine as _;
use futures_util::future::BoxFuture;
use tokio::time::Instant;

use super::{
    client::{SnsPublish, SqsSend},
    partition_for, AwsClients, AwsEndpoint, SnsApi, SqsApi, StsApi,
};
use crate::{
    codec::sqs::{topic_from_arn, AttributeValue, SqsReceived, APPROXIMATE_RECEIVE_COUNT},
    error::{Error, Result},
    pool::{CloseSignal, Connector},
    topology::Existence,
};

/// Account every in-process resource belongs to.
pub const ACCOUNT_ID: &str = "000000000000";

const POLL: Duration = Duration::from_millis(50);

/// Snapshot of how often each service call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    pub connects: usize,
    pub identity_lookups: usize,
    pub topic_creates: usize,
    pub topic_lookups: usize,
    pub topic_scans: usize,
    pub subscribes: usize,
    pub subscription_lookups: usize,
    pub queue_creates: usize,
    pub queue_lookups: usize,
    pub attribute_updates: usize,
    pub publishes: usize,
    pub sends: usize,
    pub receives: usize,
    pub deletes: usize,
    pub visibility_changes: usize,
}

impl CallCounts {
    /// Calls that could have changed the cloud's topology.
    pub fn creates(&self) -> usize {
        self.topic_creates + self.queue_creates + self.subscribes + self.attribute_updates
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    queue_arn: String,
    raw: bool,
}

#[derive(Debug)]
struct Topic {
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    body: String,
    attributes: HashMap<String, AttributeValue>,
    group_id: Option<String>,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<String>,
}

#[derive(Debug)]
struct Queue {
    url: String,
    arn: String,
    attributes: HashMap<String, String>,
    messages: Vec<Stored>,
    deduplication: HashSet<String>,
}

impl Queue {
    fn attribute<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.attributes.get(name).and_then(|raw| raw.parse().ok())
    }

    fn is_fifo(&self) -> bool {
        self.attribute::<bool>("FifoQueue").unwrap_or(false)
    }

    fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.attribute("VisibilityTimeout").unwrap_or(30))
    }

    fn default_delay(&self) -> Duration {
        Duration::from_secs(self.attribute("DelaySeconds").unwrap_or(0))
    }

    /// `(dead-letter queue ARN, max receives)` from the native redrive policy.
    fn redrive(&self) -> Option<(String, u32)> {
        let raw = self.attributes.get("RedrivePolicy")?;
        let policy: serde_json::Value = serde_json::from_str(raw).ok()?;
        let arn = policy.get("deadLetterTargetArn")?.as_str()?.to_owned();
        let max = match policy.get("maxReceiveCount")? {
            serde_json::Value::String(s) => s.parse().ok()?,
            other => u32::try_from(other.as_u64()?).ok()?,
        };
        Some((arn, max))
    }
}

#[derive(Default)]
struct CloudState {
    topics: BTreeMap<String, Topic>,
    /// Keyed by queue name.
    queues: BTreeMap<String, Queue>,
}

impl CloudState {
    fn queue_by_arn_mut(&mut self, arn: &str) -> Option<&mut Queue> {
        self.queues.values_mut().find(|queue| queue.arn == arn)
    }

    fn queue_by_url_mut(&mut self, url: &str) -> Option<&mut Queue> {
        self.queues.values_mut().find(|queue| queue.url == url)
    }

    /// Returns `false` when a FIFO queue dropped the message as a duplicate.
    fn enqueue(
        &mut self,
        queue_arn: &str,
        mut stored: Stored,
        delay: Duration,
        dedup: Option<String>,
    ) -> bool {
        let Some(queue) = self.queue_by_arn_mut(queue_arn) else {
            tracing::debug!(queue = queue_arn, "Subscribed queue no longer exists");
            return false;
        };

        if queue.is_fifo() {
            let content_based = queue
                .attribute::<bool>("ContentBasedDeduplication")
                .unwrap_or(false);
            let key = dedup.or_else(|| {
                content_based.then(|| hex::encode(md5::compute(stored.body.as_bytes()).as_ref()))
            });
            if let Some(key) = key {
                if !queue.deduplication.insert(key) {
                    return false;
                }
            }
        }

        stored.visible_at = Instant::now() + delay.max(queue.default_delay());
        queue.messages.push(stored);
        true
    }
}

/// Handle to an in-process cloud. Clones share it.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<CloudState>>,
    calls: Arc<Mutex<CallCounts>>,
    refuse: Arc<AtomicBool>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, bump: impl FnOnce(&mut CallCounts)) {
        bump(&mut self.calls.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn calls(&self) -> CallCounts {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every new connection attempt fail until called with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.state()
            .topics
            .keys()
            .any(|arn| topic_from_arn(arn) == Some(name))
    }

    /// Queue ARNs subscribed to the topic called `name`.
    pub fn subscriptions(&self, name: &str) -> Vec<String> {
        self.state()
            .topics
            .iter()
            .filter(|(arn, _)| topic_from_arn(arn) == Some(name))
            .flat_map(|(_, topic)| topic.subscriptions.iter().map(|s| s.queue_arn.clone()))
            .collect()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn queue_attributes(&self, name: &str) -> Option<HashMap<String, String>> {
        self.state()
            .queues
            .get(name)
            .map(|queue| queue.attributes.clone())
    }

    /// Messages held by `name`, visible or not.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state().queues.get(name).map(|queue| queue.messages.len())
    }

    /// Bodies of the messages held by `name`, in queue order.
    pub fn queue_bodies(&self, name: &str) -> Vec<String> {
        self.state()
            .queues
            .get(name)
            .map(|queue| queue.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// FIFO group of each message held by `name`, in queue order.
    pub fn message_groups(&self, name: &str) -> Vec<Option<String>> {
        self.state()
            .queues
            .get(name)
            .map(|queue| queue.messages.iter().map(|m| m.group_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Every message in `name` as a receive would return it, without
    /// touching visibility or receive counts.
    pub fn peek(&self, name: &str) -> Vec<SqsReceived> {
        self.state()
            .queues
            .get(name)
            .map(|queue| {
                queue
                    .messages
                    .iter()
                    .map(|message| SqsReceived {
                        message_id: message.message_id.clone(),
                        body: message.body.clone(),
                        attributes: message.attributes.clone(),
                        ..SqsReceived::default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes a queue out from under its consumers.
    pub fn delete_queue(&self, name: &str) {
        if self.state().queues.remove(name).is_some() {
            tracing::info!(queue = name, "Queue deleted");
        }
    }
}

impl Connector<AwsEndpoint, AwsClients> for MemoryCloud {
    fn connect<'a>(
        &'a self,
        endpoint: &'a AwsEndpoint,
        _on_close: CloseSignal,
    ) -> BoxFuture<'a, Result<Arc<AwsClients>>> {
        Box::pin(async move {
            self.count(|calls| calls.connects += 1);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::unreachable(endpoint.region(), "connection refused"));
            }

            let api = Arc::new(MemoryApi {
                cloud: self.clone(),
                region: endpoint.region().to_owned(),
            });
            Ok(Arc::new(AwsClients::new(
                endpoint.region(),
                api.clone(),
                api.clone(),
                api,
            )))
        })
    }
}

/// The three service clients, all backed by one [`MemoryCloud`].
pub struct MemoryApi {
    cloud: MemoryCloud,
    region: String,
}

impl MemoryApi {
    fn arn(&self, service: &str, name: &str) -> String {
        format!(
            "arn:{}:{service}:{}:{ACCOUNT_ID}:{name}",
            partition_for(&self.region),
            self.region
        )
    }

    fn url(&self, name: &str) -> String {
        format!("https://sqs.{}.amazonaws.com/{ACCOUNT_ID}/{name}", self.region)
    }
}

fn notification(topic_arn: &str, message_id: &str, request: &SnsPublish) -> String {
    let attributes: serde_json::Map<String, serde_json::Value> = request
        .envelope
        .attributes
        .iter()
        .map(|(name, value)| {
            let text = match value {
                AttributeValue::Binary { binary_value } => {
                    base64::engine::general_purpose::STANDARD.encode(binary_value)
                }
                other => other.as_text(),
            };
            (
                name.clone(),
                serde_json::json!({ "Type": value.data_type(), "Value": text }),
            )
        })
        .collect();

    serde_json::json!({
        "Type": "Notification",
        "MessageId": message_id,
        "TopicArn": topic_arn,
        "Subject": request.subject,
        "Message": request.envelope.body,
        "Timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "MessageAttributes": attributes,
    })
    .to_string()
}

impl SnsApi for MemoryApi {
    fn create_topic<'a>(
        &'a self,
        name: &'a str,
        _attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.topic_creates += 1);
            let arn = self.arn("sns", name);
            self.cloud
                .state()
                .topics
                .entry(arn.clone())
                .or_insert_with(|| Topic {
                    subscriptions: Vec::new(),
                });
            Ok(arn)
        })
    }

    fn topic_exists<'a>(&'a self, arn: &'a str) -> BoxFuture<'a, Result<Existence<String>>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.topic_lookups += 1);
            let found = self.cloud.state().topics.contains_key(arn);
            Ok(found.then(|| arn.to_owned()).into())
        })
    }

    fn find_topic<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<String>>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.topic_scans += 1);
            Ok(self
                .cloud
                .state()
                .topics
                .keys()
                .find(|arn| topic_from_arn(arn) == Some(name))
                .cloned()
                .into())
        })
    }

    fn publish(&self, request: SnsPublish) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.publishes += 1);
            let mut state = self.cloud.state();
            let Some(topic) = state.topics.get(&request.topic_arn) else {
                return Err(Error::unreachable(&request.topic_arn, "topic does not exist"));
            };
            let subscriptions = topic.subscriptions.clone();

            let message_id = uuid::Uuid::new_v4().to_string();
            for subscription in subscriptions {
                let (body, attributes) = if subscription.raw {
                    (
                        request.envelope.body.clone(),
                        request.envelope.attributes.clone().into_iter().collect(),
                    )
                } else {
                    (
                        notification(&request.topic_arn, &message_id, &request),
                        HashMap::new(),
                    )
                };
                state.enqueue(
                    &subscription.queue_arn,
                    Stored {
                        message_id: uuid::Uuid::new_v4().to_string(),
                        body,
                        attributes,
                        group_id: request.group_id.clone(),
                        visible_at: Instant::now(),
                        receive_count: 0,
                        receipt: None,
                    },
                    Duration::ZERO,
                    request.deduplication_id.clone(),
                );
            }
            Ok(message_id)
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic_arn: &'a str,
        queue_arn: &'a str,
        raw_delivery: bool,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.subscribes += 1);
            let mut state = self.cloud.state();
            let Some(topic) = state.topics.get_mut(topic_arn) else {
                return Err(Error::unreachable(topic_arn, "topic does not exist"));
            };
            // SNS returns the existing subscription for a repeated endpoint.
            if !topic.subscriptions.iter().any(|s| s.queue_arn == queue_arn) {
                topic.subscriptions.push(Subscription {
                    queue_arn: queue_arn.to_owned(),
                    raw: raw_delivery,
                });
            }
            Ok(format!("{topic_arn}:{}", uuid::Uuid::new_v4()))
        })
    }

    fn subscription_exists<'a>(
        &'a self,
        topic_arn: &'a str,
        queue_arn: &'a str,
    ) -> BoxFuture<'a, Result<Existence<()>>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.subscription_lookups += 1);
            let found = self
                .cloud
                .state()
                .topics
                .get(topic_arn)
                .is_some_and(|topic| topic.subscriptions.iter().any(|s| s.queue_arn == queue_arn));
            Ok(found.then_some(()).into())
        })
    }
}

impl SqsApi for MemoryApi {
    fn create_queue<'a>(
        &'a self,
        name: &'a str,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.queue_creates += 1);
            let mut state = self.cloud.state();
            if let Some(existing) = state.queues.get(name) {
                let conflicting = attributes
                    .iter()
                    .find(|(key, value)| existing.attributes.get(*key).is_some_and(|v| v != *value));
                if let Some((key, _)) = conflicting {
                    return Err(Error::channel_failure(
                        name,
                        format!("QueueAlreadyExists: {key} differs"),
                    ));
                }
                return Ok(existing.url.clone());
            }

            let url = self.url(name);
            state.queues.insert(
                name.to_owned(),
                Queue {
                    url: url.clone(),
                    arn: self.arn("sqs", name),
                    attributes,
                    messages: Vec::new(),
                    deduplication: HashSet::new(),
                },
            );
            Ok(url)
        })
    }

    fn queue_url<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Existence<String>>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.queue_lookups += 1);
            Ok(self
                .cloud
                .state()
                .queues
                .get(name)
                .map(|queue| queue.url.clone())
                .into())
        })
    }

    fn queue_arn<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Existence<String>>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.queue_lookups += 1);
            Ok(self
                .cloud
                .state()
                .queue_by_url_mut(url)
                .map(|queue| queue.arn.clone())
                .into())
        })
    }

    fn set_queue_attributes<'a>(
        &'a self,
        url: &'a str,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.attribute_updates += 1);
            let mut state = self.cloud.state();
            let queue = state
                .queue_by_url_mut(url)
                .ok_or_else(|| Error::unreachable(url, "queue does not exist"))?;
            queue.attributes.extend(attributes);
            Ok(())
        })
    }

    fn send(&self, request: SqsSend) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.sends += 1);
            let mut state = self.cloud.state();
            let arn = state
                .queue_by_url_mut(&request.queue_url)
                .map(|queue| queue.arn.clone())
                .ok_or_else(|| Error::unreachable(&request.queue_url, "queue does not exist"))?;

            let message_id = uuid::Uuid::new_v4().to_string();
            state.enqueue(
                &arn,
                Stored {
                    message_id: message_id.clone(),
                    body: request.envelope.body,
                    attributes: request.envelope.attributes.into_iter().collect(),
                    group_id: request.group_id,
                    visible_at: Instant::now(),
                    receive_count: 0,
                    receipt: None,
                },
                request.delay,
                request.deduplication_id,
            );
            Ok(message_id)
        })
    }

    fn receive<'a>(
        &'a self,
        url: &'a str,
        max_messages: i32,
        wait: Duration,
    ) -> BoxFuture<'a, Result<Existence<Vec<SqsReceived>>>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.receives += 1);
            let limit = usize::try_from(max_messages.max(1)).unwrap_or(1);
            let deadline = Instant::now() + wait;

            loop {
                {
                    let mut state = self.cloud.state();
                    let Some(queue) = state.queue_by_url_mut(url) else {
                        return Ok(Existence::NotFound);
                    };

                    let now = Instant::now();
                    let visibility = queue.visibility_timeout();
                    let redrive = queue.redrive();
                    let fifo = queue.is_fifo();
                    let mut blocked_groups = HashSet::new();
                    let mut taken = Vec::new();
                    let mut dead = Vec::new();

                    let mut index = 0;
                    while index < queue.messages.len() && taken.len() < limit {
                        let message = &mut queue.messages[index];
                        if message.visible_at > now {
                            if fifo && message.receive_count > 0 {
                                blocked_groups.extend(message.group_id.clone());
                            }
                            index += 1;
                            continue;
                        }
                        if fifo
                            && message
                                .group_id
                                .as_ref()
                                .is_some_and(|group| blocked_groups.contains(group))
                        {
                            index += 1;
                            continue;
                        }
                        if let Some((_, max)) = &redrive {
                            if message.receive_count >= *max {
                                dead.push(queue.messages.remove(index));
                                continue;
                            }
                        }

                        message.receive_count += 1;
                        message.visible_at = now + visibility;
                        let receipt = uuid::Uuid::new_v4().to_string();
                        message.receipt = Some(receipt.clone());
                        if fifo {
                            blocked_groups.extend(message.group_id.clone());
                        }

                        taken.push(SqsReceived {
                            message_id: message.message_id.clone(),
                            receipt_handle: receipt,
                            md5_of_body: Some(hex::encode(
                                md5::compute(message.body.as_bytes()).as_ref(),
                            )),
                            body: message.body.clone(),
                            attributes: message.attributes.clone(),
                            system_attributes: HashMap::from([(
                                APPROXIMATE_RECEIVE_COUNT.to_owned(),
                                message.receive_count.to_string(),
                            )]),
                        });
                        index += 1;
                    }

                    if let Some((dead_letter_arn, _)) = redrive {
                        for mut message in dead {
                            tracing::debug!(
                                message_id = %message.message_id,
                                "Receive budget spent, moving to dead-letter queue"
                            );
                            message.receive_count = 0;
                            message.receipt = None;
                            state.enqueue(&dead_letter_arn, message, Duration::ZERO, None);
                        }
                    }

                    if !taken.is_empty() {
                        return Ok(Existence::Found(taken));
                    }
                }

                let now = Instant::now();
                if now >= deadline {
                    return Ok(Existence::Found(Vec::new()));
                }
                tokio::time::sleep((deadline - now).min(POLL)).await;
            }
        })
    }

    fn delete<'a>(&'a self, url: &'a str, receipt_handle: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.deletes += 1);
            let mut state = self.cloud.state();
            let queue = state
                .queue_by_url_mut(url)
                .ok_or_else(|| Error::unreachable(url, "queue does not exist"))?;
            queue
                .messages
                .retain(|message| message.receipt.as_deref() != Some(receipt_handle));
            Ok(())
        })
    }

    fn change_visibility<'a>(
        &'a self,
        url: &'a str,
        receipt_handle: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.visibility_changes += 1);
            let mut state = self.cloud.state();
            let queue = state
                .queue_by_url_mut(url)
                .ok_or_else(|| Error::unreachable(url, "queue does not exist"))?;
            let message = queue
                .messages
                .iter_mut()
                .find(|message| message.receipt.as_deref() == Some(receipt_handle))
                .ok_or_else(|| Error::channel_failure(url, "receipt handle is invalid"))?;
            message.visible_at = Instant::now() + timeout;
            Ok(())
        })
    }

    fn purge<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Existence<()>>> {
        Box::pin(async move {
            let mut state = self.cloud.state();
            match state.queue_by_url_mut(url) {
                Some(queue) => {
                    queue.messages.clear();
                    Ok(Existence::Found(()))
                }
                None => Ok(Existence::NotFound),
            }
        })
    }
}

impl StsApi for MemoryApi {
    fn account_id(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.cloud.count(|calls| calls.identity_lookups += 1);
            Ok(ACCOUNT_ID.to_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::sqs::SqsEnvelope, pool::Connector};

    async fn clients(cloud: &MemoryCloud) -> Arc<AwsClients> {
        let endpoint = AwsEndpoint::new("eu-west-1").unwrap();
        cloud.connect(&endpoint, CloseSignal::detached()).await.unwrap()
    }

    fn envelope(body: &str) -> SqsEnvelope {
        SqsEnvelope {
            body: body.to_owned(),
            attributes: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_hides_received_message() {
        let cloud = MemoryCloud::new();
        let clients = clients(&cloud).await;
        let url = clients
            .sqs
            .create_queue(
                "orders",
                HashMap::from([("VisibilityTimeout".to_owned(), "10".to_owned())]),
            )
            .await
            .unwrap();
        clients
            .sqs
            .send(SqsSend {
                queue_url: url.clone(),
                envelope: envelope("a"),
                delay: Duration::ZERO,
                group_id: None,
                deduplication_id: None,
            })
            .await
            .unwrap();

        let first = clients.sqs.receive(&url, 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.found().unwrap().len(), 1);

        let hidden = clients.sqs.receive(&url, 10, Duration::from_secs(5)).await.unwrap();
        assert!(hidden.found().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = clients.sqs.receive(&url, 10, Duration::ZERO).await.unwrap();
        let again = again.found().unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(
            again[0].system_attributes.get(APPROXIMATE_RECEIVE_COUNT).map(String::as_str),
            Some("2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_redrive_moves_message() {
        let cloud = MemoryCloud::new();
        let clients = clients(&cloud).await;
        let dlq = clients.sqs.create_queue("orders-dlq", HashMap::new()).await.unwrap();
        let dlq_arn = clients.sqs.queue_arn(&dlq).await.unwrap().found().unwrap();
        let url = clients
            .sqs
            .create_queue(
                "orders",
                HashMap::from([
                    ("VisibilityTimeout".to_owned(), "1".to_owned()),
                    (
                        "RedrivePolicy".to_owned(),
                        serde_json::json!({"deadLetterTargetArn": dlq_arn, "maxReceiveCount": "2"})
                            .to_string(),
                    ),
                ]),
            )
            .await
            .unwrap();
        clients
            .sqs
            .send(SqsSend {
                queue_url: url.clone(),
                envelope: envelope("a"),
                delay: Duration::ZERO,
                group_id: None,
                deduplication_id: None,
            })
            .await
            .unwrap();

        for _ in 0..2 {
            let received = clients.sqs.receive(&url, 1, Duration::ZERO).await.unwrap();
            assert_eq!(received.found().unwrap().len(), 1);
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        let third = clients.sqs.receive(&url, 1, Duration::ZERO).await.unwrap();
        assert!(third.found().unwrap().is_empty());
        assert_eq!(cloud.queue_bodies("orders-dlq"), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_fan_out_wraps_notification() {
        let cloud = MemoryCloud::new();
        let clients = clients(&cloud).await;
        let topic = clients.sns.create_topic("orders", HashMap::new()).await.unwrap();
        let url = clients.sqs.create_queue("billing", HashMap::new()).await.unwrap();
        let queue_arn = clients.sqs.queue_arn(&url).await.unwrap().found().unwrap();
        clients.sns.subscribe(&topic, &queue_arn, false).await.unwrap();

        clients
            .sns
            .publish(SnsPublish {
                topic_arn: topic.clone(),
                envelope: envelope("hello"),
                subject: None,
                group_id: None,
                deduplication_id: None,
            })
            .await
            .unwrap();

        let bodies = cloud.queue_bodies("billing");
        let wrapped: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(wrapped["Message"], "hello");
        assert_eq!(wrapped["TopicArn"], topic.as_str());
    }
}
