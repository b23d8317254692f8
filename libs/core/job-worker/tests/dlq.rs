//! Redis dead-letter store (requires Docker)

use chrono::Utc;
use job_worker::{
    DeadLetterReason, DeadLetterSink, JobQueue, RedisDeadLetters, RedisQueue, WorkerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestRedis, unique_name};

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_dead_letter_list_stats_replay_purge() {
    let redis = TestRedis::new().await;
    let manager = Arc::new(redis.connection_manager().await);
    let config = WorkerConfig::new(unique_name("jobs"), "test_workers")
        .with_min_poll_interval(Duration::from_millis(10));
    let dead_letters = RedisDeadLetters::new(manager.clone(), config.dlq_stream.clone());

    let message = job_worker::RawMessage {
        payload: b"{not json".to_vec(),
        handle: queue_handle(&manager, &config).await,
        receive_count: 1,
        enqueued_at: Utc::now(),
    };

    dead_letters
        .dead_letter(&message, &DeadLetterReason::Invalid("malformed json".into()))
        .await
        .unwrap();
    dead_letters
        .dead_letter(&message, &DeadLetterReason::Exhausted { receive_count: 7 })
        .await
        .unwrap();

    let stats = dead_letters.stats().await.unwrap();
    assert_eq!(stats.length, 2);
    assert!(stats.oldest_entry_id.is_some());

    let entries = dead_letters.list(10, None).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, "invalid");
    assert_eq!(entries[0].payload_preview, "{not json");
    assert_eq!(entries[1].kind, "exhausted");
    assert_eq!(entries[1].message_id, message.handle.id());

    // Replay puts the exact bytes back on the live stream
    let queue = RedisQueue::new(manager.clone(), config.clone());
    assert!(dead_letters.replay(&entries[0].dlq_id, &config.stream_name).await.unwrap());
    let replayed = queue.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();
    assert_eq!(replayed.payload, b"{not json");
    assert_eq!(replayed.receive_count, 1);

    assert_eq!(dead_letters.purge().await.unwrap(), 1);
    assert_eq!(dead_letters.stats().await.unwrap().length, 0);
}

async fn queue_handle(
    manager: &Arc<redis::aio::ConnectionManager>,
    config: &WorkerConfig,
) -> job_worker::DeliveryHandle {
    let queue = RedisQueue::new(manager.clone(), config.clone());
    queue.init_consumer_group().await.unwrap();

    job_worker::JobProducer::new(manager.clone(), config.stream_name.clone())
        .enqueue(b"{not json")
        .await
        .unwrap();

    queue
        .dequeue(Duration::from_millis(500))
        .await
        .unwrap()
        .expect("message")
        .handle
}
