//! Shutdown integration tests
//!
//! Covers the TERMINATE broadcast, bounded joins, tasks that ignore
//! TERMINATE and coordinators running on a task thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agw_common::ShutdownConfig;
use agw_itti::{task_fn, Bus, BusError, LoopControl, MessageKind, TaskContext, TaskState};
use integration_tests::{
    init_test_logging, next_received, test_config, wait_for_condition, CollectingTask, IdleTask,
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT,
};

/// Five idle tasks all end within the default shutdown budget.
#[tokio::test]
async fn test_all_tasks_end_after_signal() {
    init_test_logging();

    let names = ["T1", "T2", "T3", "T4", "T5"];
    let mut config = test_config(&names);
    config.shutdown = ShutdownConfig::default();
    let bus = Bus::new(config).unwrap();

    for name in names {
        let id = bus.registry().lookup(name).unwrap();
        bus.create_task(id, IdleTask).await.unwrap();
    }

    let started = Instant::now();
    bus.shutdown_signal().trigger();
    let report = tokio::time::timeout(
        Duration::from_secs(11),
        bus.coordinator().wait_tasks_end(),
    )
    .await
    .expect("shutdown exceeded its budget")
    .unwrap();

    assert!(report.is_clean(), "{report}");
    assert_eq!(report.ended, names.map(String::from).to_vec());
    assert!(started.elapsed() < Duration::from_secs(11));
    for name in names {
        let id = bus.registry().lookup(name).unwrap();
        assert_eq!(bus.task_state(id), TaskState::Ended);
    }
}

/// Every task sees exactly one TERMINATE, sent from no task.
#[tokio::test]
async fn test_terminate_reaches_every_task() {
    init_test_logging();

    let bus = Bus::new(test_config(&["A", "B"])).unwrap();
    let a = bus.registry().lookup("A").unwrap();
    let b = bus.registry().lookup("B").unwrap();

    let (first, mut first_rx) = CollectingTask::new();
    let (second, mut second_rx) = CollectingTask::new();
    bus.create_task(a, first).await.unwrap();
    bus.create_task(b, second).await.unwrap();

    bus.shutdown_signal().trigger();
    let report = bus.coordinator().wait_tasks_end().await.unwrap();
    assert!(report.is_clean());

    for (rx, task) in [(&mut first_rx, a), (&mut second_rx, b)] {
        let received = next_received(rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.kind, MessageKind::TERMINATE);
        assert_eq!(received.destination, task);
        assert!(received.origin.is_unknown());
        assert!(next_received(rx, Duration::from_millis(50)).await.is_none());
    }
    assert_eq!(bus.pool().in_use(), 0);
}

/// A task that ignores TERMINATE is reported as forced once the bounded
/// join deadline passes.
#[tokio::test]
async fn test_stubborn_task_is_forced() {
    init_test_logging();

    let mut config = test_config(&["POLITE", "STUBBORN"]);
    config.shutdown = ShutdownConfig {
        grace_ms: 50,
        retries: 3,
        retry_interval_ms: 50,
    };
    let bus = Bus::new(config).unwrap();
    let polite = bus.registry().lookup("POLITE").unwrap();
    let stubborn = bus.registry().lookup("STUBBORN").unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let released = Arc::clone(&release);
    bus.create_task(polite, IdleTask).await.unwrap();
    bus.create_task(stubborn, task_fn(move |mut ctx: TaskContext| async move {
        ctx.init(&[], true);
        ctx.mark_ready();
        while !released.load(Ordering::SeqCst) {
            while ctx.try_receive().is_some() {}
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctx.destroy();
    }))
    .await
    .unwrap();

    let started = Instant::now();
    bus.shutdown_signal().trigger();
    let report = bus.coordinator().wait_tasks_end().await.unwrap();

    assert_eq!(report.ended, vec!["POLITE".to_string()]);
    assert_eq!(report.forced, vec!["STUBBORN".to_string()]);
    assert!(!report.is_clean());
    // Grace plus three retry intervals.
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(bus.task_state(stubborn), TaskState::Ready);

    release.store(true, Ordering::SeqCst);
    wait_for_condition(
        || {
            let bus = bus.clone();
            async move { bus.task_state(stubborn) == TaskState::Ended }
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .unwrap();
}

/// A coordinator running on a task thread terminates every other task and
/// skips its own thread.
#[tokio::test]
async fn test_coordinator_on_task_thread() {
    init_test_logging();

    let bus = Bus::new(test_config(&["MAIN", "A", "B"])).unwrap();
    let main = bus.registry().lookup("MAIN").unwrap();
    let a = bus.registry().lookup("A").unwrap();
    let b = bus.registry().lookup("B").unwrap();

    bus.create_task(a, IdleTask).await.unwrap();
    bus.create_task(b, IdleTask).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.create_task(main, task_fn(move |mut ctx: TaskContext| async move {
        ctx.init(&[], true);
        ctx.mark_ready();
        let report = ctx.bus().coordinator().wait_tasks_end().await;
        let _ = tx.send(report);
        ctx.destroy();
    }))
    .await
    .unwrap();

    bus.shutdown_signal().trigger();
    let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.ended, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(bus.task_state(a), TaskState::Ended);
    assert_eq!(bus.task_state(b), TaskState::Ended);

    wait_for_condition(
        || {
            let bus = bus.clone();
            async move { bus.task_state(main) == TaskState::Ended }
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .unwrap();
}

/// Only one coordinator may wait at a time; the slot frees up afterwards.
#[tokio::test]
async fn test_coordinator_is_exclusive() {
    let bus = Bus::new(test_config(&["A"])).unwrap();
    let a = bus.registry().lookup("A").unwrap();
    bus.create_task(a, IdleTask).await.unwrap();

    let waiting = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.coordinator().wait_tasks_end().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        bus.coordinator().wait_tasks_end().await,
        Err(BusError::CoordinatorBusy)
    ));

    bus.shutdown_signal().trigger();
    let report = waiting.await.unwrap().unwrap();
    assert_eq!(report.ended, vec!["A".to_string()]);

    let again = bus.coordinator().wait_tasks_end().await.unwrap();
    assert!(again.ended.is_empty() && again.forced.is_empty());
}

/// Sends after shutdown are dropped rather than queued.
#[tokio::test]
async fn test_send_after_shutdown_is_dropped() {
    let bus = Bus::new(test_config(&["A"])).unwrap();
    let a = bus.registry().lookup("A").unwrap();
    bus.create_task(a, LoopingTask).await.unwrap();

    bus.shutdown_signal().trigger();
    bus.coordinator().wait_tasks_end().await.unwrap();

    let kind = bus.message_kind(integration_tests::TEST_MESSAGE).unwrap();
    assert!(!bus.send_to(a, bus.allocate(a, kind)).is_queued());
    assert_eq!(bus.pool().in_use(), 0);
}

/// Task written against the trait directly, leaving on TERMINATE itself.
struct LoopingTask;

#[async_trait::async_trait(?Send)]
impl agw_itti::Task for LoopingTask {
    async fn run(&mut self, mut ctx: TaskContext) {
        ctx.init(&[], true);
        ctx.mark_ready();
        ctx.run_event_loop(|_, envelope| {
            if envelope.is_terminate() {
                LoopControl::Exit
            } else {
                LoopControl::Continue
            }
        })
        .await;
        ctx.destroy();
    }
}
