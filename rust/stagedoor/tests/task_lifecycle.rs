//! End-to-end test for the complete task lifecycle.
//!
//! This test validates:
//! - Scheduled firing on the synced clock, including skewed offsets
//! - Stop semantics: timer disarm, idempotence, late-event merging
//! - Executor id binding and event routing
//! - Bulk rescheduling of pending and scheduled tasks
//! - Terminal notifications reaching subscribers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::sleep;

use stagedoor::clock::ClockOffset;
use stagedoor::domain::{Buyer, ExecuteOptions, Selection, TaskDraft, TaskStatus};
use stagedoor::error::TaskError;
use stagedoor::executor::{
    event_channel, ExecutorEvent, ExecutorEventSender, PurchaseExecutor,
};
use stagedoor::payload::PurchasePayload;
use stagedoor::scheduler::{SchedulerSettings, TaskScheduler};

/// Scripted executor: records invocations and cancellations, hands out
/// sequential ids, and lets tests emit events for them.
struct MockExecutor {
    invocations: Mutex<Vec<PurchasePayload>>,
    cancelled: Mutex<Vec<String>>,
    next_id: AtomicU64,
    reject: bool,
}

impl MockExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            reject: false,
        })
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            invocations: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            reject: true,
        })
    }

    fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl PurchaseExecutor for MockExecutor {
    async fn invoke(
        &self,
        payload: PurchasePayload,
        _options: ExecuteOptions,
    ) -> Result<String, TaskError> {
        if self.reject {
            return Err(TaskError::executor("no session"));
        }
        self.invocations.lock().push(payload);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("exec-{id}"))
    }

    async fn cancel(&self, executor_id: &str) {
        self.cancelled.lock().push(executor_id.to_string());
    }
}

fn buyer(id: &str, name: &str) -> Buyer {
    Buyer {
        id: id.to_string(),
        name: name.to_string(),
        id_number: None,
        phone_candidates: vec!["13800001234".to_string()],
    }
}

fn draft(buyers: Vec<Buyer>) -> TaskDraft {
    TaskDraft {
        selection: Selection {
            project_id: "912".to_string(),
            project_name: "Summer Live".to_string(),
            screen_id: "1001".to_string(),
            screen_name: "Night 1".to_string(),
            sku_id: "5001".to_string(),
            sku_name: "VIP".to_string(),
            pay_money: Some(48_000),
        },
        buyers,
        ..TaskDraft::default()
    }
}

fn fast_settings() -> SchedulerSettings {
    SchedulerSettings {
        tolerance_window: Duration::from_millis(50),
        // Long enough that no resync attempt happens inside a test.
        resync_interval: Duration::from_secs(300),
        resync_guard: Duration::from_millis(200),
        ..SchedulerSettings::default()
    }
}

fn setup(
    executor: Arc<MockExecutor>,
) -> (TaskScheduler, ExecutorEventSender) {
    let (tx, rx) = event_channel();
    let scheduler = TaskScheduler::new(executor, rx, fast_settings());
    (scheduler, tx)
}

/// Poll until the predicate holds or the budget runs out.
async fn wait_for(mut predicate: impl FnMut() -> bool, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

#[tokio::test]
async fn test_immediate_start_binds_executor_id() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let task = scheduler
        .create_task(draft(vec![buyer("b1", "Alice"), buyer("b2", "Bob")]), &[])
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    scheduler.start(&task.id).await.unwrap();

    // Entry is re-keyed under the executor id; the placeholder is gone.
    assert!(scheduler.get(&task.id).is_none());
    let bound = scheduler.get("exec-1").expect("task bound to executor id");
    assert_eq!(bound.status, TaskStatus::Running);
    assert!(!bound.has_placeholder_id());

    assert_eq!(executor.invocation_count(), 1);
    let payload = &executor.invocations.lock()[0];
    assert_eq!(payload.count, 2);
    assert_eq!(payload.contact_name, "Alice");
}

#[tokio::test]
async fn test_scheduled_task_fires_at_fire_time() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let mut d = draft(vec![buyer("b1", "Alice")]);
    d.fire_time = Some(Utc::now() + chrono::Duration::milliseconds(300));

    let task = scheduler.create_task(d, &[]).unwrap();
    assert_eq!(task.status, TaskStatus::Scheduled);
    assert_eq!(executor.invocation_count(), 0);

    let fired = wait_for(|| executor.invocation_count() == 1, Duration::from_secs(3)).await;
    assert!(fired, "scheduled task did not fire");

    let bound = scheduler.get("exec-1").unwrap();
    assert_eq!(bound.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_firing_follows_the_synced_clock() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    // Server runs one hour ahead of the local clock.
    scheduler.clock().apply(ClockOffset {
        offset_millis: 3_600_000,
        measured_at_local: Utc::now(),
    });

    // On the local clock this is an hour away; on server time it is due in
    // well under a second.
    let mut d = draft(vec![buyer("b1", "Alice")]);
    d.fire_time = Some(Utc::now() + chrono::Duration::milliseconds(3_600_000 + 200));
    scheduler.create_task(d, &[]).unwrap();

    let fired = wait_for(|| executor.invocation_count() == 1, Duration::from_secs(3)).await;
    assert!(fired, "task did not fire on server time");
}

#[tokio::test]
async fn test_stop_disarms_timer() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let mut d = draft(vec![buyer("b1", "Alice")]);
    d.fire_time = Some(Utc::now() + chrono::Duration::milliseconds(300));
    let task = scheduler.create_task(d, &[]).unwrap();

    scheduler.stop(&task.id).await;
    assert_eq!(scheduler.get(&task.id).unwrap().status, TaskStatus::Stopped);

    // Let the fire instant pass; the executor must never be invoked.
    sleep(Duration::from_millis(800)).await;
    assert_eq!(executor.invocation_count(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let mut d = draft(vec![buyer("b1", "Alice")]);
    d.fire_time = Some(Utc::now() + chrono::Duration::seconds(60));
    let task = scheduler.create_task(d, &[]).unwrap();

    scheduler.stop(&task.id).await;
    let first = scheduler.get(&task.id).unwrap();

    scheduler.stop(&task.id).await;
    let second = scheduler.get(&task.id).unwrap();

    assert_eq!(first.status, TaskStatus::Stopped);
    assert_eq!(second.status, TaskStatus::Stopped);
    assert_eq!(first.logs, second.logs);

    // Unknown ids are a no-op as well.
    scheduler.stop("never-existed").await;
}

#[tokio::test]
async fn test_stop_on_pending_is_a_noop_and_start_still_works() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let task = scheduler
        .create_task(draft(vec![buyer("b1", "Alice")]), &[])
        .unwrap();

    // A task that was never started has nothing to stop.
    scheduler.stop(&task.id).await;
    assert_eq!(scheduler.get(&task.id).unwrap().status, TaskStatus::Pending);

    // It must still be startable afterwards.
    scheduler.start(&task.id).await.unwrap();
    assert_eq!(scheduler.get("exec-1").unwrap().status, TaskStatus::Running);
    assert_eq!(executor.invocation_count(), 1);
}

#[tokio::test]
async fn test_stop_running_task_cancels_executor() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let task = scheduler
        .create_task(draft(vec![buyer("b1", "Alice")]), &[])
        .unwrap();
    scheduler.start(&task.id).await.unwrap();

    scheduler.stop("exec-1").await;

    assert_eq!(scheduler.get("exec-1").unwrap().status, TaskStatus::Stopped);
    assert_eq!(executor.cancelled_ids(), vec!["exec-1".to_string()]);
}

#[tokio::test]
async fn test_success_event_reaches_terminal_subscribers() {
    let executor = MockExecutor::new();
    let (scheduler, tx) = setup(Arc::clone(&executor));
    let mut terminal = scheduler.subscribe_terminal();

    let task = scheduler
        .create_task(draft(vec![buyer("b1", "Alice")]), &[])
        .unwrap();
    scheduler.start(&task.id).await.unwrap();

    tx.send(ExecutorEvent::PaymentLink {
        executor_id: "exec-1".to_string(),
        url: "https://pay.example/qr/1".to_string(),
    })
    .unwrap();
    tx.send(ExecutorEvent::Finished {
        executor_id: "exec-1".to_string(),
        success: true,
        message: "order created".to_string(),
    })
    .unwrap();

    let done = tokio::time::timeout(Duration::from_secs(2), terminal.recv())
        .await
        .expect("no terminal notification")
        .unwrap();

    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.payment_url.as_deref(), Some("https://pay.example/qr/1"));
    assert!(done.logs.iter().any(|l| l == "order created"));
}

#[tokio::test]
async fn test_late_event_after_stop_is_merged_not_reopened() {
    let executor = MockExecutor::new();
    let (scheduler, tx) = setup(Arc::clone(&executor));

    let task = scheduler
        .create_task(draft(vec![buyer("b1", "Alice")]), &[])
        .unwrap();
    scheduler.start(&task.id).await.unwrap();
    scheduler.stop("exec-1").await;

    // Cancellation is best-effort; the executor reports once more.
    tx.send(ExecutorEvent::Finished {
        executor_id: "exec-1".to_string(),
        success: true,
        message: "raced to an order anyway".to_string(),
    })
    .unwrap();

    let merged = wait_for(
        || {
            scheduler
                .get("exec-1")
                .is_some_and(|t| t.logs.iter().any(|l| l == "raced to an order anyway"))
        },
        Duration::from_secs(2),
    )
    .await;

    assert!(merged, "late event was not merged into the log");
    assert_eq!(scheduler.get("exec-1").unwrap().status, TaskStatus::Stopped);
}

#[tokio::test]
async fn test_executor_rejection_stops_the_task() {
    let executor = MockExecutor::rejecting();
    let (scheduler, _tx) = setup(Arc::clone(&executor));
    let mut terminal = scheduler.subscribe_terminal();

    let task = scheduler
        .create_task(draft(vec![buyer("b1", "Alice")]), &[])
        .unwrap();
    scheduler.start(&task.id).await.unwrap();

    let stopped = scheduler.get(&task.id).unwrap();
    assert_eq!(stopped.status, TaskStatus::Stopped);
    assert!(stopped.logs.iter().any(|l| l.contains("no session")));

    let notified = tokio::time::timeout(Duration::from_secs(2), terminal.recv())
        .await
        .expect("rejection should notify")
        .unwrap();
    assert_eq!(notified.status, TaskStatus::Stopped);
}

#[tokio::test]
async fn test_reschedule_all_updates_pending_and_restarts_scheduled() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let pending = scheduler
        .create_task(draft(vec![buyer("b1", "Alice")]), &[])
        .unwrap();

    let mut d = draft(vec![buyer("b2", "Bob")]);
    d.fire_time = Some(Utc::now() + chrono::Duration::seconds(120));
    let scheduled = scheduler.create_task(d, &[]).unwrap();

    let new_fire = Utc::now() + chrono::Duration::seconds(240);
    let affected = scheduler.reschedule_all(new_fire);
    assert_eq!(affected.len(), 2);

    // Pending task keeps its identity, only the fire time moves.
    let pending_after = scheduler.get(&pending.id).unwrap();
    assert_eq!(pending_after.status, TaskStatus::Pending);
    assert_eq!(pending_after.fire_time, Some(new_fire));

    // Scheduled task was restarted under a fresh id.
    assert!(scheduler.get(&scheduled.id).is_none());
    let restarted = affected
        .iter()
        .find(|t| t.buyers[0].id == "b2")
        .expect("restarted snapshot");
    assert_ne!(restarted.id, scheduled.id);
    assert_eq!(restarted.status, TaskStatus::Scheduled);
    assert_eq!(restarted.fire_time, Some(new_fire));
    assert!(restarted.logs.iter().any(|l| l.contains("restarted")));

    // Neither ever reached the executor.
    assert_eq!(executor.invocation_count(), 0);
}

#[tokio::test]
async fn test_task_isolation_one_stop_never_touches_siblings() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let mut d1 = draft(vec![buyer("b1", "Alice")]);
    d1.fire_time = Some(Utc::now() + chrono::Duration::milliseconds(400));
    let first = scheduler.create_task(d1, &[]).unwrap();

    let mut d2 = draft(vec![buyer("b2", "Bob")]);
    d2.fire_time = Some(Utc::now() + chrono::Duration::milliseconds(400));
    let second = scheduler.create_task(d2, &[]).unwrap();

    scheduler.stop(&first.id).await;

    let fired = wait_for(|| executor.invocation_count() == 1, Duration::from_secs(3)).await;
    assert!(fired, "sibling task should still fire");

    assert_eq!(scheduler.get(&first.id).unwrap().status, TaskStatus::Stopped);
    assert_eq!(executor.invocations.lock()[0].contact_name, "Bob");
    let _ = second;
}

#[tokio::test]
async fn test_unsynced_fallback_is_surfaced_on_the_task() {
    let executor = MockExecutor::new();
    let (scheduler, _tx) = setup(Arc::clone(&executor));

    let mut d = draft(vec![buyer("b1", "Alice")]);
    d.fire_time = Some(Utc::now() + chrono::Duration::milliseconds(250));
    scheduler.create_task(d, &[]).unwrap();

    let fired = wait_for(|| executor.invocation_count() == 1, Duration::from_secs(3)).await;
    assert!(fired);

    let task = scheduler.get("exec-1").unwrap();
    assert!(
        task.logs.iter().any(|l| l.contains("unsynced")),
        "local-clock fallback must be visible in the task log"
    );
}

#[tokio::test]
async fn test_remove_is_the_only_way_out_of_the_set() {
    let executor = MockExecutor::new();
    let (scheduler, tx) = setup(Arc::clone(&executor));

    let task = scheduler
        .create_task(draft(vec![buyer("b1", "Alice")]), &[])
        .unwrap();
    scheduler.start(&task.id).await.unwrap();

    tx.send(ExecutorEvent::Finished {
        executor_id: "exec-1".to_string(),
        success: false,
        message: "attempts exhausted".to_string(),
    })
    .unwrap();

    let stopped = wait_for(
        || {
            scheduler
                .get("exec-1")
                .is_some_and(|t| t.status == TaskStatus::Stopped)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(stopped);

    // Terminal tasks persist until explicitly removed.
    assert_eq!(scheduler.list().len(), 1);
    let removed = scheduler.remove("exec-1").await.unwrap();
    assert_eq!(removed.status, TaskStatus::Stopped);
    assert!(scheduler.list().is_empty());
}
