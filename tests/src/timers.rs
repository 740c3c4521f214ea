//! Timer integration tests
//!
//! Timers are armed against real task threads; expiries arrive as
//! TIMER_HAS_EXPIRED envelopes in the owner's mailbox.

use std::time::Duration;

use agw_itti::{
    task_fn, Bus, LoopControl, TaskContext, TaskId, TimerError, TimerExpired, TimerId, TimerKind,
};
use bytes::Bytes;
use integration_tests::{init_test_logging, test_config};
use tokio::sync::mpsc;

/// Task forwarding every decoded expiry, acknowledging it first when
/// `acknowledge` is set. The flag reports what the acknowledgement returned.
fn timer_watcher(
    acknowledge: bool,
) -> (impl agw_itti::Task, mpsc::UnboundedReceiver<(TimerExpired, bool)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = task_fn(move |mut ctx: TaskContext| async move {
        ctx.init(&[], true);
        ctx.mark_ready();
        ctx.run_event_loop(|ctx, envelope| {
            if let Some(expired) = TimerExpired::decode(&envelope) {
                let acknowledged =
                    acknowledge && ctx.bus().timer_handle_expired(expired.timer_id);
                let _ = tx.send((expired, acknowledged));
            }
            LoopControl::Continue
        })
        .await;
        ctx.destroy();
    });
    (task, rx)
}

async fn start_watcher(
    acknowledge: bool,
) -> (Bus, TaskId, mpsc::UnboundedReceiver<(TimerExpired, bool)>) {
    let bus = Bus::new(test_config(&["MAIN", "WATCHER"])).unwrap();
    let watcher = bus.registry().lookup("WATCHER").unwrap();
    let (task, rx) = timer_watcher(acknowledge);
    bus.create_task(watcher, task).await.unwrap();
    (bus, watcher, rx)
}

async fn shutdown(bus: &Bus) {
    bus.shutdown_signal().trigger();
    assert!(bus.coordinator().wait_tasks_end().await.unwrap().is_clean());
}

fn drain(rx: &mut mpsc::UnboundedReceiver<(TimerExpired, bool)>) -> Vec<TimerExpired> {
    std::iter::from_fn(|| rx.try_recv().ok().map(|(expired, _)| expired)).collect()
}

/// A one-second periodic timer fires about three times in 3.5 s and stops
/// once removed.
#[tokio::test]
async fn test_periodic_timer_fires_until_removed() {
    init_test_logging();
    let (bus, watcher, mut rx) = start_watcher(false).await;

    let id = bus
        .timer_setup(1, 0, watcher, TimerKind::Periodic, Bytes::from_static(b"tick"))
        .unwrap();
    assert_eq!(bus.timers().interval_of(id), Some(Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let expiries = drain(&mut rx);
    assert!(
        (2..=4).contains(&expiries.len()),
        "unexpected expiry count {}",
        expiries.len()
    );
    assert!(expiries
        .iter()
        .all(|expired| expired.timer_id == id && expired.arg == Bytes::from_static(b"tick")));

    assert_eq!(bus.timer_remove(id), Ok(Bytes::from_static(b"tick")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    drain(&mut rx);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(bus.timers().armed(), 0);

    shutdown(&bus).await;
}

/// Removing a timer before it fires hands the argument back and nothing is
/// delivered.
#[tokio::test]
async fn test_remove_before_expiry() {
    init_test_logging();
    let (bus, watcher, mut rx) = start_watcher(false).await;

    let id = bus
        .timer_setup(0, 300_000, watcher, TimerKind::OneShot, Bytes::from_static(b"late"))
        .unwrap();
    assert_eq!(bus.timer_remove(id), Ok(Bytes::from_static(b"late")));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(bus.timer_remove(id), Err(TimerError::NotFound(id)));

    shutdown(&bus).await;
}

/// An acknowledged one-shot timer is unregistered.
#[tokio::test]
async fn test_one_shot_acknowledged_by_owner() {
    init_test_logging();
    let (bus, watcher, mut rx) = start_watcher(true).await;

    let id = bus
        .timer_setup(0, 20_000, watcher, TimerKind::OneShot, Bytes::from_static(b"once"))
        .unwrap();
    let (expired, acknowledged) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(expired.timer_id, id);
    assert_eq!(expired.arg, Bytes::from_static(b"once"));
    assert!(acknowledged);
    assert_eq!(bus.timer_remove(id), Err(TimerError::NotFound(id)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut rx).is_empty());

    shutdown(&bus).await;
}

/// A fired one-shot timer that was never acknowledged can still be removed.
#[tokio::test]
async fn test_unacknowledged_one_shot_stays_registered() {
    init_test_logging();
    let (bus, watcher, mut rx) = start_watcher(false).await;

    let id = bus
        .timer_setup(0, 20_000, watcher, TimerKind::OneShot, Bytes::from_static(b"kept"))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bus.timers().armed(), 1);
    assert_eq!(bus.timer_remove(id), Ok(Bytes::from_static(b"kept")));

    shutdown(&bus).await;
}

/// Timers of distinct owners are routed to their own owner.
#[tokio::test]
async fn test_expiry_routed_to_owner() {
    init_test_logging();

    let bus = Bus::new(test_config(&["LEFT", "RIGHT"])).unwrap();
    let left = bus.registry().lookup("LEFT").unwrap();
    let right = bus.registry().lookup("RIGHT").unwrap();
    let (left_task, mut left_rx) = timer_watcher(true);
    let (right_task, mut right_rx) = timer_watcher(true);
    bus.create_task(left, left_task).await.unwrap();
    bus.create_task(right, right_task).await.unwrap();

    let left_id = bus
        .timer_setup(0, 10_000, left, TimerKind::OneShot, Bytes::from_static(b"L"))
        .unwrap();
    let right_id = bus
        .timer_setup(0, 10_000, right, TimerKind::OneShot, Bytes::from_static(b"R"))
        .unwrap();
    assert_ne!(left_id, right_id);

    let wait = Duration::from_secs(2);
    let (left_expired, _) = tokio::time::timeout(wait, left_rx.recv()).await.unwrap().unwrap();
    let (right_expired, _) = tokio::time::timeout(wait, right_rx.recv()).await.unwrap().unwrap();
    assert_eq!(left_expired.timer_id, left_id);
    assert_eq!(right_expired.timer_id, right_id);
    assert_eq!(bus.timers().armed(), 0);

    shutdown(&bus).await;
}

/// Expiries for an owner that is not running are released.
#[tokio::test]
async fn test_expiry_for_idle_owner_is_released() {
    let bus = Bus::new(test_config(&["ABSENT"])).unwrap();
    let absent = bus.registry().lookup("ABSENT").unwrap();

    bus.timer_setup(0, 10_000, absent, TimerKind::OneShot, Bytes::new())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(bus.router_stats().dropped, 1);
    assert_eq!(bus.pool().in_use(), 0);
}

#[test]
fn test_zero_interval_rejected() {
    let bus = Bus::new(test_config(&["MAIN"])).unwrap();
    let main = bus.registry().lookup("MAIN").unwrap();
    assert_eq!(
        bus.timer_setup(0, 0, main, TimerKind::Periodic, Bytes::new()),
        Err(TimerError::InvalidInterval)
    );
}

#[test]
fn test_remove_unknown_timer() {
    let bus = Bus::new(test_config(&["MAIN"])).unwrap();
    let id = TimerId::new(4242);
    assert_eq!(bus.timer_remove(id), Err(TimerError::NotFound(id)));
}
