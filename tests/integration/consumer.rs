use std::time::Duration;

use deadpool_redis::redis::AsyncCommands;
use priq::{Broker, Message};
use testresult::TestResult;

use crate::shared::*;

#[tokio::test]
async fn test_consumer_delivers_in_priority_order() -> TestResult {
    let broker = Broker::new(setup(), test_config())?;

    broker
        .enqueue_message(&Message::with_id("a", "q", b"A".to_vec(), 5))
        .await?;
    broker
        .enqueue_message(&Message::with_id("b", "q", b"B".to_vec(), 0))
        .await?;
    broker
        .enqueue_message(&Message::with_id("c", "q", b"C".to_vec(), 5))
        .await?;

    let mut consumer = broker.consume("q", 10);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let delivery = consumer.next_message().await.unwrap();
        broker.ack("q", &delivery.id).await?;
        ids.push(delivery.id);
    }
    assert_eq!(ids, vec!["b", "a", "c"]);

    consumer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_prefetch_one_delivers_monotone_priorities() -> TestResult {
    let broker = Broker::new(setup(), test_config())?;

    for (id, priority) in [("w", 3), ("x", 1), ("y", 2), ("z", 0)] {
        broker
            .enqueue_message(&Message::with_id(id, "q", b"m".to_vec(), priority))
            .await?;
    }

    // With a prefetch of 1 every refill pops the then-lowest message, so
    // the delivered priorities never decrease.
    let mut consumer = broker.consume("q", 1);
    let mut priorities = Vec::new();
    for _ in 0..4 {
        let delivery = consumer.next_message().await.unwrap();
        broker.ack("q", &delivery.id).await?;
        priorities.push(delivery.priority);
    }
    assert_eq!(priorities, vec![0, 1, 2, 3]);

    consumer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_delivered_message_is_in_ack_group() -> TestResult {
    let pool = setup();
    let namespace = random_string();
    let broker = Broker::new(pool.clone(), test_config().namespace(namespace.clone()))?;

    broker
        .enqueue_message(&Message::with_id("m", "q", b"M".to_vec(), 3))
        .await?;

    let mut consumer = broker.consume("q", 2);
    let delivery = consumer.next_message().await.unwrap();
    assert_eq!(delivery.id, "m");

    let mut conn = pool.get().await?;
    let score: Option<f64> = conn
        .zscore(
            format!("{namespace}:__acks__.{}.q", broker.worker_id()),
            "m",
        )
        .await?;
    assert_eq!(score, Some(3.0));

    broker.ack("q", &delivery.id).await?;
    consumer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_requeues_undispatched_messages() -> TestResult {
    let pool = setup();
    let namespace = random_string();
    let broker = Broker::new(pool.clone(), test_config().namespace(namespace.clone()))?;

    for (id, priority) in [("m1", 1), ("m2", 2), ("m3", 3)] {
        broker
            .enqueue_message(&Message::with_id(id, "q", b"M".to_vec(), priority))
            .await?;
    }

    let consumer = broker.consume("q", 10);
    // Let the fetch loop pull everything into the local buffer.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut conn = pool.get().await?;
    let queued: i64 = conn.zcard(format!("{namespace}:q")).await?;
    assert_eq!(queued, 0);

    consumer.close().await?;

    for (id, priority) in [("m1", 1.0), ("m2", 2.0), ("m3", 3.0)] {
        let score: Option<f64> = conn.zscore(format!("{namespace}:q"), id).await?;
        assert_eq!(score, Some(priority), "message {id} not restored");
    }
    let in_flight: i64 = conn
        .zcard(format!("{namespace}:__acks__.{}.q", broker.worker_id()))
        .await?;
    assert_eq!(in_flight, 0);

    Ok(())
}

#[tokio::test]
async fn test_close_keeps_dispatched_messages_in_flight() -> TestResult {
    let pool = setup();
    let namespace = random_string();
    let broker = Broker::new(pool.clone(), test_config().namespace(namespace.clone()))?;

    broker
        .enqueue_message(&Message::with_id("taken", "q", b"T".to_vec(), 0))
        .await?;
    broker
        .enqueue_message(&Message::with_id("buffered", "q", b"B".to_vec(), 1))
        .await?;

    let mut consumer = broker.consume("q", 10);
    let delivery = consumer.next_message().await.unwrap();
    assert_eq!(delivery.id, "taken");

    consumer.close().await?;

    // The handed-out message stays owned by this worker; only the buffered
    // one returns to the queue.
    let mut conn = pool.get().await?;
    let queued: Vec<String> = conn.zrange(format!("{namespace}:q"), 0, -1).await?;
    assert_eq!(queued, vec!["buffered"]);
    let in_flight: Vec<String> = conn
        .zrange(
            format!("{namespace}:__acks__.{}.q", broker.worker_id()),
            0,
            -1,
        )
        .await?;
    assert_eq!(in_flight, vec!["taken"]);

    Ok(())
}
