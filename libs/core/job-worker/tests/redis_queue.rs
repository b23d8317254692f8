//! Redis Streams queue against a real Redis (requires Docker)

use job_worker::{JobProducer, JobQueue, RedisQueue, WorkerConfig, connect_redis};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_utils::{TestRedis, unique_name};

async fn queue(redis: &TestRedis, visibility_timeout: Duration) -> (RedisQueue, JobProducer) {
    let manager = Arc::new(redis.connection_manager().await);
    let config = WorkerConfig::new(unique_name("jobs"), "test_workers")
        .with_min_poll_interval(Duration::from_millis(20))
        .with_visibility_timeout(visibility_timeout);

    let producer = JobProducer::new(manager.clone(), config.stream_name.clone());
    let queue = RedisQueue::new(manager, config);
    queue.init_consumer_group().await.unwrap();
    // Creating the group twice is fine
    queue.init_consumer_group().await.unwrap();

    (queue, producer)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_enqueue_dequeue_ack() {
    let redis = TestRedis::new().await;
    let (queue, producer) = queue(&redis, Duration::from_secs(30)).await;

    let id = producer.enqueue(br#"{"data":1}"#).await.unwrap();
    let message = queue
        .dequeue(Duration::from_millis(500))
        .await
        .unwrap()
        .expect("message");

    assert_eq!(message.handle.id(), id);
    assert_eq!(message.payload, br#"{"data":1}"#);
    assert_eq!(message.receive_count, 1);

    queue.ack(&message.handle).await.unwrap();
    queue.ack(&message.handle).await.unwrap();

    let info = queue.info().await.unwrap();
    assert_eq!(info.length, 0);
    assert_eq!(info.pending, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_empty_dequeue_waits_min_poll_interval() {
    let redis = TestRedis::new().await;
    let (queue, _producer) = queue(&redis, Duration::from_secs(30)).await;

    for _ in 0..3 {
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(1)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_nack_delays_redelivery() {
    let redis = TestRedis::new().await;
    let (queue, producer) = queue(&redis, Duration::from_secs(30)).await;

    producer.enqueue(b"retry me").await.unwrap();
    let first = queue.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();

    queue.nack(&first.handle, Duration::from_millis(300)).await.unwrap();
    // Nacking the same delivery again is a no-op
    queue.nack(&first.handle, Duration::ZERO).await.unwrap();
    assert_eq!(queue.info().await.unwrap().delayed, 1);

    assert!(queue.dequeue(Duration::from_millis(50)).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(350)).await;
    let second = queue.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();

    assert_eq!(second.payload, b"retry me");
    assert_eq!(second.receive_count, 2);
    assert_eq!(second.enqueued_at, first.enqueued_at);
    assert_ne!(second.handle.id(), first.handle.id());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unacked_message_is_reclaimed_after_visibility_timeout() {
    let redis = TestRedis::new().await;
    let (queue, producer) = queue(&redis, Duration::from_millis(200)).await;

    producer.enqueue(b"slow").await.unwrap();
    let first = queue.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = queue.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();

    assert_eq!(second.handle.id(), first.handle.id());
    assert_eq!(second.receive_count, 2);

    queue.ack(&second.handle).await.unwrap();
    assert_eq!(queue.info().await.unwrap().pending, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_idle_dequeue_with_default_config_returns_empty() {
    let redis = TestRedis::new().await;
    let config = WorkerConfig::new(unique_name("jobs"), "test_workers");
    let queue = RedisQueue::connect(redis.connection_string(), config.clone())
        .await
        .unwrap();

    // Blocks server-side for the full dequeue timeout
    for _ in 0..2 {
        let started = Instant::now();
        let message = queue.dequeue(config.dequeue_timeout).await.unwrap();
        assert!(message.is_none());
        assert!(started.elapsed() >= config.dequeue_timeout);
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_connect_redis_allows_long_blocking_reads() {
    let redis = TestRedis::new().await;
    let manager = connect_redis(redis.connection_string(), Duration::from_secs(2))
        .await
        .unwrap();
    let config = WorkerConfig::new(unique_name("jobs"), "test_workers");
    let queue = RedisQueue::new(Arc::new(manager), config);
    queue.init_consumer_group().await.unwrap();

    assert!(queue.dequeue(Duration::from_secs(2)).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_missing_group_is_recreated() {
    let redis = TestRedis::new().await;
    let (queue, producer) = queue(&redis, Duration::from_secs(30)).await;

    let mut conn = redis.connection_manager().await;
    let _: () = conn.del(queue.stream_name()).await.unwrap();
    producer.enqueue(b"after restart").await.unwrap();

    // The first poll sees NOGROUP and recreates the group from the start
    assert!(queue.dequeue(Duration::from_millis(100)).await.unwrap().is_none());
    let message = queue
        .dequeue(Duration::from_millis(500))
        .await
        .unwrap()
        .expect("message");
    assert_eq!(message.payload, b"after restart");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_handle_is_stale_after_another_consumer_reclaims() {
    let redis = TestRedis::new().await;
    let manager = Arc::new(redis.connection_manager().await);
    let config = WorkerConfig::new(unique_name("jobs"), "test_workers")
        .with_min_poll_interval(Duration::from_millis(20))
        .with_visibility_timeout(Duration::from_millis(200));

    let producer = JobProducer::new(manager.clone(), config.stream_name.clone());
    let first = RedisQueue::new(manager.clone(), config.clone().with_consumer_id("worker-a"));
    let second = RedisQueue::new(manager, config.with_consumer_id("worker-b"));
    first.init_consumer_group().await.unwrap();

    producer.enqueue(b"contended").await.unwrap();
    let original = first.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let reclaimed = second.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();
    assert_eq!(reclaimed.handle.id(), original.handle.id());
    assert_eq!(reclaimed.receive_count, 2);

    // Late nack and ack from the first consumer leave the reclaimed delivery alone
    first.nack(&original.handle, Duration::ZERO).await.unwrap();
    first.ack(&original.handle).await.unwrap();

    let info = second.info().await.unwrap();
    assert_eq!(info.length, 1);
    assert_eq!(info.pending, 1);
    assert_eq!(info.delayed, 0);

    second.ack(&reclaimed.handle).await.unwrap();
    let info = second.info().await.unwrap();
    assert_eq!(info.length, 0);
    assert_eq!(info.pending, 0);
}
