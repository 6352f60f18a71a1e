use std::{sync::Arc, time::Duration};

use switchyard::{
    aws::{
        client::SqsSend, memory::MemoryCloud, AwsEndpoint, AwsPool, SnsProducer, SqsAttributes,
        SqsChannelFactory, SqsConsumer, SqsProducer, SqsSubscription,
    },
    codec::{self, sqs::SqsEnvelope},
    message::DEDUPLICATION_ID,
    pool::ConnectionPool,
    ChannelFactory, Config, Message, MessageBody, MessageHeader, MessageType, RedrivePolicy,
    TopologyPolicy,
};
use tokio::time::Instant;

struct Harness {
    cloud: MemoryCloud,
    pool: Arc<AwsPool>,
    endpoint: AwsEndpoint,
}

fn setup() -> Harness {
    let cloud = MemoryCloud::new();
    let pool = Arc::new(ConnectionPool::new(
        cloud.clone(),
        Config::default().resilience(),
        Duration::from_millis(10),
    ));

    Harness {
        cloud,
        pool,
        endpoint: AwsEndpoint::new("eu-west-1").unwrap(),
    }
}

impl Harness {
    fn factory(&self) -> SqsChannelFactory {
        SqsChannelFactory::new(self.pool.clone(), self.endpoint.clone())
    }

    fn sns(&self) -> SnsProducer {
        SnsProducer::builder()
            .pool(self.pool.clone())
            .endpoint(self.endpoint.clone())
            .build()
    }

    fn sqs(&self, queue: SqsAttributes) -> SqsProducer {
        SqsProducer::builder()
            .pool(self.pool.clone())
            .endpoint(self.endpoint.clone())
            .queue(queue)
            .build()
    }

    fn consumer(&self, subscription: SqsSubscription) -> SqsConsumer {
        SqsConsumer::builder()
            .pool(self.pool.clone())
            .endpoint(self.endpoint.clone())
            .subscription(subscription)
            .build()
    }
}

fn subscription(policy: TopologyPolicy) -> SqsSubscription {
    SqsSubscription::builder()
        .name("billing")
        .channel_name("billing")
        .routing_key("orders")
        .policy(policy)
        .build()
}

fn queue_only(name: &str, queue: SqsAttributes) -> SqsSubscription {
    SqsSubscription::builder()
        .name(name)
        .channel_name(name)
        .routing_key(name)
        .point_to_point(true)
        .queue(queue)
        .build()
}

fn order(topic: &str) -> Message {
    Message::new(
        MessageHeader::builder()
            .topic(topic)
            .message_type(MessageType::Command)
            .correlation_id("c-1")
            .build(),
        MessageBody::text(r#"{"order":42}"#),
    )
}

#[tokio::test(start_paused = true)]
async fn test_publish_through_topic_and_consume() {
    let harness = setup();
    let channel = harness
        .factory()
        .create_channel(&subscription(TopologyPolicy::Create))
        .await
        .unwrap();

    let sent = order("orders");
    harness.sns().publish(sent.clone()).await.unwrap();

    let received = channel.receive(Duration::from_secs(1)).await.unwrap();
    assert_eq!(received.id(), sent.id());
    assert_eq!(received.header.topic().as_str(), "orders");
    assert_eq!(received.header.message_type(), MessageType::Command);
    assert_eq!(received.header.correlation_id(), Some("c-1"));
    assert_eq!(received.body.as_text(), r#"{"order":42}"#);

    channel.acknowledge(&received).await.unwrap();
    assert_eq!(harness.cloud.queue_depth("billing"), Some(0));
    assert!(channel.receive(Duration::ZERO).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_topic_publish_arrives_after_delay() {
    let harness = setup();
    let channel = harness
        .factory()
        .create_channel(&subscription(TopologyPolicy::Create))
        .await
        .unwrap();

    let start = Instant::now();
    let sent = order("orders");
    harness
        .sns()
        .publish_delayed(sent.clone(), Duration::from_secs(2))
        .await
        .unwrap();

    let early = channel.receive(Duration::ZERO).await.unwrap();
    assert!(early.is_none());

    let received = channel.receive(Duration::from_secs(5)).await.unwrap();
    assert_eq!(received.id(), sent.id());
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(received.header.delayed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_validate_against_empty_cloud_creates_nothing() {
    let harness = setup();

    let err = harness
        .factory()
        .create_channel(&subscription(TopologyPolicy::Validate))
        .await
        .unwrap_err();
    assert!(err.is_unreachable(), "{err}");

    let producer = SnsProducer::builder()
        .pool(harness.pool.clone())
        .endpoint(harness.endpoint.clone())
        .policy(TopologyPolicy::Validate)
        .build();
    let err = producer.publish(order("orders")).await.unwrap_err();
    assert!(err.is_unreachable(), "{err}");

    assert_eq!(harness.cloud.calls().creates(), 0);
    assert!(!harness.cloud.topic_exists("orders"));
    assert!(!harness.cloud.queue_exists("billing"));
}

#[tokio::test(start_paused = true)]
async fn test_create_is_idempotent() {
    let harness = setup();
    let factory = harness.factory();

    factory
        .create_channel(&subscription(TopologyPolicy::Create))
        .await
        .unwrap();
    factory
        .create_channel(&subscription(TopologyPolicy::Create))
        .await
        .unwrap();

    assert_eq!(harness.cloud.subscriptions("orders").len(), 1);
    assert_eq!(harness.cloud.calls().subscribes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_long_delay_is_clamped_to_fifteen_minutes() {
    let harness = setup();
    let consumer = harness.consumer(queue_only("orders", SqsAttributes::default()));
    consumer.start().await.unwrap();

    let sent = order("orders");
    harness
        .sqs(SqsAttributes::default())
        .publish_delayed(sent.clone(), Duration::from_secs(3600))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(899)).await;
    let early = consumer.receive(Duration::ZERO).await.unwrap();
    assert!(early[0].is_none());

    tokio::time::advance(Duration::from_secs(2)).await;
    let received = consumer.receive(Duration::ZERO).await.unwrap();
    assert_eq!(received[0].id(), sent.id());
    assert_eq!(received[0].header.delayed(), Duration::from_secs(3600));
}

#[tokio::test(start_paused = true)]
async fn test_requeue_budget_dead_letters_at_limit() {
    let harness = setup();
    let queue = SqsAttributes::builder()
        .redrive(
            RedrivePolicy::builder()
                .dead_letter_channel("orders-dlq")
                .max_receive_count(3)
                .build(),
        )
        .build();
    let consumer = harness.consumer(queue_only("orders", queue.clone()));
    consumer.start().await.unwrap();

    let sent = order("orders");
    harness.sqs(queue).publish(sent.clone()).await.unwrap();

    for expected in 0..3 {
        let received = consumer.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received[0].id(), sent.id());
        assert_eq!(received[0].header.handled_count(), expected);
        assert!(consumer.requeue(&received[0], Duration::ZERO).await.unwrap());
    }

    let last = consumer.receive(Duration::from_secs(1)).await.unwrap();
    assert_eq!(last[0].header.handled_count(), 3);
    assert!(!consumer.requeue(&last[0], Duration::ZERO).await.unwrap());

    assert_eq!(harness.cloud.queue_depth("orders"), Some(0));
    let dead = harness.cloud.peek("orders-dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(codec::sqs::decode(&dead[0]).id(), sent.id());
}

#[tokio::test(start_paused = true)]
async fn test_acknowledge_twice_deletes_once() {
    let harness = setup();
    let consumer = harness.consumer(queue_only("orders", SqsAttributes::default()));
    consumer.start().await.unwrap();
    harness
        .sqs(SqsAttributes::default())
        .publish(order("orders"))
        .await
        .unwrap();

    let received = consumer.receive(Duration::from_secs(1)).await.unwrap();
    assert_eq!(consumer.outstanding(), 1);

    consumer.acknowledge(&received[0]).await.unwrap();
    consumer.acknowledge(&received[0]).await.unwrap();

    assert_eq!(harness.cloud.calls().deletes, 1);
    assert_eq!(consumer.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_message_without_type_is_unacceptable() {
    let harness = setup();
    let consumer = harness.consumer(queue_only("orders", SqsAttributes::default()));
    consumer.start().await.unwrap();

    let clients = harness.pool.acquire(&harness.endpoint).await.unwrap();
    let url = clients.sqs.queue_url("orders").await.unwrap().found().unwrap();
    clients
        .sqs
        .send(SqsSend {
            queue_url: url,
            envelope: SqsEnvelope {
                body: "plain text".to_owned(),
                attributes: Default::default(),
            },
            delay: Duration::ZERO,
            group_id: None,
            deduplication_id: None,
        })
        .await
        .unwrap();

    let received = consumer.receive(Duration::from_secs(1)).await.unwrap();
    assert!(received[0].is_unacceptable());
}

#[tokio::test(start_paused = true)]
async fn test_deleted_queue_surfaces_as_unreachable() {
    let harness = setup();
    let consumer = harness.consumer(queue_only("orders", SqsAttributes::default()));
    consumer.start().await.unwrap();

    harness.cloud.delete_queue("orders");

    let err = consumer.receive(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.is_unreachable(), "{err}");

    // The next receive provisions again.
    let received = consumer.receive(Duration::from_secs(1)).await.unwrap();
    assert!(received[0].is_none());
    assert!(harness.cloud.queue_exists("orders"));
}

fn with_dead_letters() -> SqsAttributes {
    SqsAttributes::builder()
        .redrive(
            RedrivePolicy::builder()
                .dead_letter_channel("orders-dlq")
                .max_receive_count(3)
                .build(),
        )
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_reject_routes_to_dead_letter_queue() {
    let harness = setup();
    let consumer = harness.consumer(queue_only("orders", with_dead_letters()));
    consumer.start().await.unwrap();

    let sent = order("orders");
    harness
        .sqs(with_dead_letters())
        .publish(sent.clone())
        .await
        .unwrap();

    let received = consumer.receive(Duration::from_secs(1)).await.unwrap();
    consumer.reject(&received[0], false).await.unwrap();

    assert_eq!(harness.cloud.queue_depth("orders"), Some(0));
    assert_eq!(consumer.outstanding(), 0);
    let dead = harness.cloud.peek("orders-dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(codec::sqs::decode(&dead[0]).id(), sent.id());
}

#[tokio::test(start_paused = true)]
async fn test_reject_without_dead_letter_queue_drops() {
    let harness = setup();
    let consumer = harness.consumer(queue_only("orders", SqsAttributes::default()));
    consumer.start().await.unwrap();
    harness
        .sqs(SqsAttributes::default())
        .publish(order("orders"))
        .await
        .unwrap();

    let received = consumer.receive(Duration::from_secs(1)).await.unwrap();
    consumer.reject(&received[0], false).await.unwrap();

    assert_eq!(harness.cloud.queue_depth("orders"), Some(0));
    assert_eq!(harness.cloud.calls().sends, 1);
    let next = consumer.receive(Duration::from_secs(1)).await.unwrap();
    assert!(next[0].is_none());
}

#[tokio::test(start_paused = true)]
async fn test_purge_of_missing_queue_is_a_no_op() {
    let harness = setup();
    let consumer = harness.consumer(
        SqsSubscription::builder()
            .name("ghost")
            .channel_name("ghost")
            .routing_key("ghost")
            .point_to_point(true)
            .policy(TopologyPolicy::Validate)
            .build(),
    );

    consumer.purge().await.unwrap();

    assert_eq!(harness.cloud.calls().creates(), 0);
    assert!(!harness.cloud.queue_exists("ghost"));
}

#[tokio::test(start_paused = true)]
async fn test_fifo_groups_and_deduplication_reach_the_queue() {
    let harness = setup();
    let fifo = SqsAttributes::builder().fifo(true).build();
    let consumer = harness.consumer(queue_only("orders", fifo.clone()));
    consumer.start().await.unwrap();
    let producer = harness.sqs(fifo);

    let keyed = |dedup: &str| {
        let mut message = Message::new(
            MessageHeader::builder()
                .topic("orders")
                .message_type(MessageType::Event)
                .partition_key("customer-7")
                .build(),
            MessageBody::text(r#"{"order":42}"#),
        );
        message
            .header
            .bag_mut()
            .insert(DEDUPLICATION_ID.to_owned(), serde_json::json!(dedup));
        message
    };

    producer.publish(keyed("d-1")).await.unwrap();
    // Same deduplication id: accepted by the service, never enqueued.
    producer.publish(keyed("d-1")).await.unwrap();
    let mut unkeyed = order("orders");
    unkeyed
        .header
        .bag_mut()
        .insert(DEDUPLICATION_ID.to_owned(), serde_json::json!("d-2"));
    producer.publish(unkeyed).await.unwrap();

    assert_eq!(
        harness.cloud.message_groups("orders.fifo"),
        vec![Some("customer-7".to_owned()), Some("orders".to_owned())]
    );
    assert_eq!(harness.cloud.queue_depth("orders.fifo"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_assumed_queue_is_used_without_lookups() {
    let harness = setup();
    let owner = harness.consumer(queue_only("orders", SqsAttributes::default()));
    owner.start().await.unwrap();
    let clients = harness.pool.acquire(&harness.endpoint).await.unwrap();
    let url = clients.sqs.queue_url("orders").await.unwrap().found().unwrap();
    harness
        .sqs(SqsAttributes::default())
        .publish(order("orders"))
        .await
        .unwrap();

    let before = harness.cloud.calls();
    let assumed = harness.consumer(
        SqsSubscription::builder()
            .name("orders")
            .channel_name(url.as_str())
            .routing_key("orders")
            .point_to_point(true)
            .policy(TopologyPolicy::Assume)
            .build(),
    );
    assumed.start().await.unwrap();

    let after = harness.cloud.calls();
    assert_eq!(after.creates(), before.creates());
    assert_eq!(after.queue_lookups, before.queue_lookups);
    assert_eq!(after.topic_lookups, before.topic_lookups);

    let received = assumed.receive(Duration::from_secs(1)).await.unwrap();
    assert!(!received[0].is_none());
}
