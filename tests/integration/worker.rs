use deadpool_redis::redis::AsyncCommands;
use priq::{Broker, Message, PriqError, RESTART_EXIT_CODE, Worker};
use testresult::TestResult;

use crate::shared::*;

#[tokio::test]
async fn test_worker_processes_in_priority_order() -> TestResult {
    let config = test_config().executors(1).prefetch(10);
    let broker = Broker::new(setup(), config)?;

    broker
        .enqueue_message(&Message::with_id("a", "q", b"A".to_vec(), 5))
        .await?;
    broker
        .enqueue_message(&Message::with_id("b", "q", b"B".to_vec(), 0))
        .await?;
    broker
        .enqueue_message(&Message::with_id("c", "q", b"C".to_vec(), 5))
        .await?;

    let recorder = Recorder::default();
    let handler = ScriptedHandler {
        recorder: recorder.clone(),
    };
    let code = Worker::new(broker.clone(), handler)
        .subscribe("q")
        .exit_when_processed(3)
        .run()
        .await?;

    assert_eq!(code, 0);
    assert_eq!(recorder.payloads(), vec!["B", "A", "C"]);
    assert_eq!(broker.qsize("q").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_worker_requires_a_queue() -> TestResult {
    let broker = Broker::new(setup(), test_config())?;
    let handler = ScriptedHandler {
        recorder: Recorder::default(),
    };

    let result = Worker::new(broker, handler).run().await;
    assert!(matches!(result, Err(PriqError::Config(_))));

    Ok(())
}

#[tokio::test]
async fn test_terminal_failure_is_dead_lettered() -> TestResult {
    let config = test_config().executors(1);
    let broker = Broker::new(setup(), config)?;

    let id = broker.enqueue("q", b"terminal-task".to_vec()).await?;

    let recorder = Recorder::default();
    let handler = ScriptedHandler {
        recorder: recorder.clone(),
    };
    let code = Worker::new(broker.clone(), handler)
        .subscribe("q")
        .exit_when_processed(1)
        .run()
        .await?;

    assert_eq!(code, 0);
    assert_eq!(recorder.payloads(), vec!["terminal-task"]);
    assert_eq!(
        broker.dead_letters("q").await?,
        vec![(id, b"terminal-task".to_vec())]
    );
    assert_eq!(broker.qsize("q").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_panicking_handler_is_dead_lettered() -> TestResult {
    struct PanickingHandler;

    #[async_trait::async_trait]
    impl priq::Handler for PanickingHandler {
        async fn process(&self, _delivery: &priq::Delivery) -> priq::Outcome {
            panic!("handler exploded");
        }
    }

    let config = test_config().executors(1);
    let broker = Broker::new(setup(), config)?;
    let id = broker.enqueue("q", b"boom".to_vec()).await?;

    let code = Worker::new(broker.clone(), PanickingHandler)
        .subscribe("q")
        .exit_when_processed(1)
        .run()
        .await?;

    assert_eq!(code, 0);
    assert_eq!(broker.dead_letters("q").await?, vec![(id, b"boom".to_vec())]);

    Ok(())
}

#[tokio::test]
async fn test_retryable_failure_stays_in_flight() -> TestResult {
    let pool = setup();
    let namespace = random_string();
    let config = test_config().namespace(namespace.clone()).executors(1);
    let broker = Broker::new(pool.clone(), config)?;

    let id = broker.enqueue("q", b"retry-task".to_vec()).await?;

    let handler = ScriptedHandler {
        recorder: Recorder::default(),
    };
    let code = Worker::new(broker.clone(), handler)
        .subscribe("q")
        .exit_when_processed(1)
        .run()
        .await?;
    assert_eq!(code, 0);

    // Not acked, not dead-lettered: the message waits in this worker's ack
    // group for a retry policy or crash recovery.
    let mut conn = pool.get().await?;
    let score: Option<f64> = conn
        .zscore(
            format!("{namespace}:__acks__.{}.q", broker.worker_id()),
            &id,
        )
        .await?;
    assert!(score.is_some());
    let stored: bool = conn.hexists(format!("{namespace}:q.msgs"), &id).await?;
    assert!(stored);
    assert!(broker.dead_letters("q").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_max_tasks_per_child_restarts_after_limit() -> TestResult {
    let pool = setup();
    let namespace = random_string();

    let first_config = test_config()
        .namespace(namespace.clone())
        .executors(1)
        .prefetch(4)
        .max_tasks_per_child(3);
    let first_broker = Broker::new(pool.clone(), first_config)?;

    for i in 0..10 {
        first_broker
            .enqueue_with_priority("q", format!("task-{i}").into_bytes(), 0)
            .await?;
    }

    let first_recorder = Recorder::default();
    let code = Worker::new(
        first_broker.clone(),
        ScriptedHandler {
            recorder: first_recorder.clone(),
        },
    )
    .subscribe("q")
    .run()
    .await?;

    assert_eq!(code, RESTART_EXIT_CODE);
    assert_eq!(first_recorder.payloads().len(), 3);

    // The supervisor relaunches: a fresh process gets a fresh counter and a
    // fresh worker id.
    let second_config = test_config()
        .namespace(namespace.clone())
        .executors(1)
        .prefetch(4);
    let second_broker = Broker::new(pool, second_config)?;

    let second_recorder = Recorder::default();
    let code = Worker::new(
        second_broker.clone(),
        ScriptedHandler {
            recorder: second_recorder.clone(),
        },
    )
    .subscribe("q")
    .exit_when_processed(7)
    .run()
    .await?;

    assert_eq!(code, 0);
    assert_eq!(second_recorder.payloads().len(), 7);

    let mut seen = first_recorder.payloads();
    seen.extend(second_recorder.payloads());
    seen.sort();
    let expected: Vec<String> = (0..10).map(|i| format!("task-{i}")).collect();
    assert_eq!(seen, expected);
    assert_eq!(second_broker.qsize("q").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_task_requested_restart_drains_and_exits() -> TestResult {
    let pool = setup();
    let namespace = random_string();

    let first_config = test_config()
        .namespace(namespace.clone())
        .executors(1)
        .prefetch(4);
    let first_broker = Broker::new(pool.clone(), first_config)?;

    first_broker
        .enqueue_message(&Message::with_id("r", "q", b"restart-please".to_vec(), 0))
        .await?;
    first_broker
        .enqueue_message(&Message::with_id("p", "q", b"plain".to_vec(), 1))
        .await?;

    let first_recorder = Recorder::default();
    let code = Worker::new(
        first_broker.clone(),
        ScriptedHandler {
            recorder: first_recorder.clone(),
        },
    )
    .subscribe("q")
    .run()
    .await?;

    assert_eq!(code, RESTART_EXIT_CODE);
    assert_eq!(first_recorder.payloads(), vec!["restart-please"]);
    // The restarting task's message completed and was acked.
    assert!(first_broker.dead_letters("q").await?.is_empty());

    let second_config = test_config().namespace(namespace.clone()).executors(1);
    let second_broker = Broker::new(pool, second_config)?;

    let second_recorder = Recorder::default();
    let code = Worker::new(
        second_broker,
        ScriptedHandler {
            recorder: second_recorder.clone(),
        },
    )
    .subscribe("q")
    .exit_when_processed(1)
    .run()
    .await?;

    assert_eq!(code, 0);
    assert_eq!(second_recorder.payloads(), vec!["plain"]);

    Ok(())
}

#[tokio::test]
async fn test_restart_can_be_configured_to_nack() -> TestResult {
    let config = test_config().executors(1).restart_nacks(true);
    let broker = Broker::new(setup(), config)?;

    broker
        .enqueue_message(&Message::with_id("r", "q", b"restart-please".to_vec(), 0))
        .await?;

    let code = Worker::new(
        broker.clone(),
        ScriptedHandler {
            recorder: Recorder::default(),
        },
    )
    .subscribe("q")
    .run()
    .await?;

    assert_eq!(code, RESTART_EXIT_CODE);
    assert_eq!(
        broker.dead_letters("q").await?,
        vec![("r".to_string(), b"restart-please".to_vec())]
    );

    Ok(())
}

#[tokio::test]
async fn test_worker_round_robins_multiple_queues() -> TestResult {
    let config = test_config().executors(1).prefetch(4);
    let broker = Broker::new(setup(), config)?;

    for i in 0..3 {
        broker
            .enqueue_with_priority("alpha", format!("alpha-{i}").into_bytes(), 0)
            .await?;
        broker
            .enqueue_with_priority("beta", format!("beta-{i}").into_bytes(), 0)
            .await?;
    }

    let recorder = Recorder::default();
    let code = Worker::new(
        broker.clone(),
        ScriptedHandler {
            recorder: recorder.clone(),
        },
    )
    .subscribe("alpha")
    .subscribe("beta")
    .exit_when_processed(6)
    .run()
    .await?;

    assert_eq!(code, 0);
    let mut seen = recorder.payloads();
    seen.sort();
    assert_eq!(
        seen,
        vec!["alpha-0", "alpha-1", "alpha-2", "beta-0", "beta-1", "beta-2"]
    );
    assert_eq!(broker.qsize("alpha").await?, 0);
    assert_eq!(broker.qsize("beta").await?, 0);

    Ok(())
}
