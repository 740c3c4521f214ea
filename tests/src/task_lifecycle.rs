//! Task lifecycle integration tests
//!
//! Covers the creation rendezvous, sends racing task start-up, sub-tasks
//! serviced by their parent's thread and thread naming.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agw_common::{BusConfig, MessageConfig, TaskConfig};
use agw_itti::{
    task_fn, Bus, BusError, Delivery, DropReason, LoopControl, TaskContext, TaskState,
};
use integration_tests::{
    init_test_logging, next_received, test_config, wait_for_condition, CollectingTask, IdleTask,
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT, TEST_MESSAGE,
};

/// `create_task` does not return before the task has marked itself ready.
#[tokio::test]
async fn test_create_task_waits_for_mark_ready() {
    init_test_logging();

    let bus = Bus::new(test_config(&["SLOW"])).unwrap();
    let slow = bus.registry().lookup("SLOW").unwrap();
    let wired = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&wired);
    bus.create_task(slow, task_fn(move |mut ctx: TaskContext| async move {
        ctx.init(&[], true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        flag.store(true, Ordering::SeqCst);
        ctx.mark_ready();
        ctx.run_event_loop(|_, _| LoopControl::Continue).await;
        ctx.destroy();
    }))
    .await
    .unwrap();

    assert!(wired.load(Ordering::SeqCst));
    assert_eq!(bus.task_state(slow), TaskState::Ready);

    let kind = bus.message_kind(TEST_MESSAGE).unwrap();
    assert!(bus.send_to(slow, bus.allocate(slow, kind)).is_queued());

    bus.shutdown_signal().trigger();
    assert!(bus.coordinator().wait_tasks_end().await.unwrap().is_clean());
}

/// A send to a task still in Starting is dropped, not queued; once the task
/// is Ready the next send is delivered.
#[tokio::test]
async fn test_send_to_starting_task_is_dropped() {
    init_test_logging();

    let bus = Bus::new(test_config(&["A", "B"])).unwrap();
    let a = bus.registry().lookup("A").unwrap();
    let b = bus.registry().lookup("B").unwrap();
    let kind = bus.message_kind(TEST_MESSAGE).unwrap();

    let (collector, mut rx, open) = CollectingTask::gated();
    let creating = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.create_task(b, collector).await })
    };

    wait_for_condition(
        || {
            let bus = bus.clone();
            async move { bus.task_state(b) == TaskState::Starting }
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .unwrap();

    let mut early = bus.allocate(a, kind);
    early.payload_mut()[0] = 1;
    assert_eq!(
        bus.send_to(b, early),
        Delivery::Dropped(DropReason::NotReady(TaskState::Starting))
    );
    assert_eq!(bus.pool().in_use(), 0);

    open.send(()).unwrap();
    creating.await.unwrap().unwrap();
    assert_eq!(bus.task_state(b), TaskState::Ready);

    let mut late = bus.allocate(a, kind);
    late.payload_mut()[0] = 2;
    assert_eq!(bus.send_to(b, late), Delivery::Queued);

    let received = next_received(&mut rx, Duration::from_secs(2)).await.unwrap();
    assert_eq!(received.payload[0], 2);
    assert_eq!(bus.mailbox_stats()[b.index()].depth, 0);

    bus.shutdown_signal().trigger();
    assert!(bus.coordinator().wait_tasks_end().await.unwrap().is_clean());
}

/// Sends to a task that was never created are dropped as well.
#[tokio::test]
async fn test_send_to_unconfigured_task_is_dropped() {
    let bus = Bus::new(test_config(&["A", "B"])).unwrap();
    let b = bus.registry().lookup("B").unwrap();
    let kind = bus.message_kind(TEST_MESSAGE).unwrap();

    assert_eq!(
        bus.send_to(b, bus.allocate(b, kind)),
        Delivery::Dropped(DropReason::NotReady(TaskState::NotConfigured))
    );
}

/// Sub-tasks are Ready with their parent and are serviced by the parent's
/// context.
#[tokio::test]
async fn test_sub_task_serviced_by_parent_thread() {
    init_test_logging();

    let config = BusConfig::new(
        vec![
            TaskConfig::new("MAIN"),
            TaskConfig::new("S1AP"),
            TaskConfig::sub_task("S1AP_SCTP", "S1AP"),
        ],
        vec![MessageConfig::new(TEST_MESSAGE, 16)],
    );
    let bus = Bus::new(config).unwrap();
    let main = bus.registry().lookup("MAIN").unwrap();
    let s1ap = bus.registry().lookup("S1AP").unwrap();
    let sctp = bus.registry().lookup("S1AP_SCTP").unwrap();
    assert_eq!(bus.registry().thread_of(s1ap), bus.registry().thread_of(sctp));

    let (collector, mut rx) = CollectingTask::new();
    bus.create_task(s1ap, collector).await.unwrap();
    assert_eq!(bus.task_state(sctp), TaskState::Ready);

    let kind = bus.message_kind(TEST_MESSAGE).unwrap();
    assert!(bus.send_to(sctp, bus.allocate(main, kind)).is_queued());
    assert!(bus.send_to(s1ap, bus.allocate(main, kind)).is_queued());

    let mut destinations = vec![
        next_received(&mut rx, Duration::from_secs(2)).await.unwrap().destination,
        next_received(&mut rx, Duration::from_secs(2)).await.unwrap().destination,
    ];
    destinations.sort();
    assert_eq!(destinations, vec![s1ap, sctp]);

    bus.shutdown_signal().trigger();
    assert!(bus.coordinator().wait_tasks_end().await.unwrap().is_clean());
}

/// Task threads are named after their task.
#[tokio::test]
async fn test_task_thread_is_named_after_task() {
    let bus = Bus::new(test_config(&["MME_APP"])).unwrap();
    let mme = bus.registry().lookup("MME_APP").unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    bus.create_task(mme, task_fn(move |mut ctx: TaskContext| async move {
        let _ = tx.send(std::thread::current().name().map(str::to_string));
        ctx.init(&[], true);
        ctx.mark_ready();
        ctx.run_event_loop(|_, _| LoopControl::Continue).await;
        ctx.destroy();
    }))
    .await
    .unwrap();

    assert_eq!(rx.recv().await.unwrap().as_deref(), Some("itti-MME_APP"));

    bus.shutdown_signal().trigger();
    bus.coordinator().wait_tasks_end().await.unwrap();
}

/// A task that returns without marking itself ready is reported, and ends.
#[tokio::test]
async fn test_task_exiting_before_ready() {
    init_test_logging();

    let bus = Bus::new(test_config(&["BROKEN", "OK"])).unwrap();
    let broken = bus.registry().lookup("BROKEN").unwrap();
    let ok = bus.registry().lookup("OK").unwrap();

    let result = bus
        .create_task(broken, task_fn(|ctx: TaskContext| async move { ctx.destroy() }))
        .await;
    assert!(matches!(result, Err(BusError::ExitedBeforeReady { ref task }) if task == "BROKEN"));
    assert_eq!(bus.task_state(broken), TaskState::Ended);

    bus.create_task(ok, IdleTask).await.unwrap();
    bus.shutdown_signal().trigger();
    let report = bus.coordinator().wait_tasks_end().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.ended.len(), 2);
}

/// Creating the same task twice is a programmer error.
#[tokio::test]
#[should_panic(expected = "cannot be created")]
async fn test_create_task_twice_panics() {
    let bus = Bus::new(test_config(&["ONCE"])).unwrap();
    let once = bus.registry().lookup("ONCE").unwrap();
    bus.create_task(once, IdleTask).await.unwrap();
    let _ = bus.create_task(once, IdleTask).await;
}
