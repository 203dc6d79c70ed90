//! Task scheduling: lifecycle ownership, precise firing and event routing.
//!
//! The scheduler owns the task collection. Every mutation — creation,
//! start, stop, reschedule, executor events — goes through its API and is
//! serialized on one lock, so asynchronous executor events and user
//! actions can interleave in any order without corrupting a task. Each
//! task's timer and executor invocation are independent; a failure or
//! cancellation on one task never touches another.
//!
//! Firing works on the synced clock: while a task waits, the remaining
//! time is recomputed from the current offset estimate, the clock is
//! periodically resynced, and after the timer expires the target is
//! validated once more before the executor is invoked, so a mid-wait
//! resync that pushes the target later re-arms instead of firing early.

pub mod events;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::clock::{ClockOffset, SyncedClock, TimeSource, TimeSyncClient};
use crate::domain::{Address, ResolvedContact, Task, TaskDraft, TaskStatus};
use crate::error::{ClockSyncError, TaskError};
use crate::executor::{ExecutorEvent, ExecutorEventReceiver, PurchaseExecutor};
use crate::payload;

pub use events::{TaskEvent, TaskEventBus};

/// Capacity of the terminal-task broadcast channel.
const TERMINAL_CHANNEL_CAPACITY: usize = 64;

/// Most executor events buffered for a not-yet-bound executor id.
const ORPHAN_EVENT_LIMIT: usize = 64;

/// Scheduler tuning knobs, injected once at construction.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Authoritative time source for offset measurement.
    pub time_source: TimeSource,
    /// Budget for one sync round trip.
    pub sync_timeout: Duration,
    /// A recomputed remaining below this fires; above it re-arms.
    pub tolerance_window: Duration,
    /// How often to resync the clock while a task waits.
    pub resync_interval: Duration,
    /// Skip resyncing once the fire instant is closer than this.
    pub resync_guard: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            time_source: TimeSource::Http(
                "https://api.bilibili.com/x/report/click/now".to_string(),
            ),
            sync_timeout: Duration::from_secs(5),
            tolerance_window: Duration::from_millis(100),
            resync_interval: Duration::from_secs(10),
            resync_guard: Duration::from_secs(2),
        }
    }
}

/// Map entry: the task plus its cancellation token. Cancelling the token
/// disarms a pending timer; it does not by itself touch the executor.
struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

struct Inner {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    executor: Arc<dyn PurchaseExecutor>,
    clock: SyncedClock,
    sync_client: TimeSyncClient,
    bus: TaskEventBus,
    terminal_tx: broadcast::Sender<Task>,
    /// Executor events that arrived before their id was bound to a task.
    orphans: Mutex<HashMap<String, Vec<ExecutorEvent>>>,
    settings: SchedulerSettings,
}

/// The task scheduler. Cheap to clone; all clones share one task set.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = self.inner.tasks.read();
        f.debug_struct("TaskScheduler")
            .field("tasks", &tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskScheduler {
    /// Create a scheduler around an executor and its event stream.
    ///
    /// Spawns the event pump that routes executor events back to tasks for
    /// as long as the executor keeps its sender half alive.
    #[must_use]
    pub fn new(
        executor: Arc<dyn PurchaseExecutor>,
        executor_events: ExecutorEventReceiver,
        settings: SchedulerSettings,
    ) -> Self {
        let (terminal_tx, _) = broadcast::channel(TERMINAL_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            tasks: RwLock::new(HashMap::new()),
            executor,
            clock: SyncedClock::new(),
            sync_client: TimeSyncClient::new(),
            bus: TaskEventBus::new(),
            terminal_tx,
            orphans: Mutex::new(HashMap::new()),
            settings,
        });

        let pump = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut rx = executor_events;
            while let Some(event) = rx.recv().await {
                pump.apply_event(event);
            }
            tracing::debug!("executor event channel closed");
        });

        Self { inner }
    }

    /// Shared synced-clock handle.
    #[must_use]
    pub fn clock(&self) -> SyncedClock {
        self.inner.clock.clone()
    }

    /// Measure the offset against the configured source and install it.
    pub async fn sync_clock(&self) -> Result<ClockOffset, ClockSyncError> {
        let settings = &self.inner.settings;
        let offset = self
            .inner
            .sync_client
            .sync(&settings.time_source, settings.sync_timeout)
            .await?;
        self.inner.clock.apply(offset);
        tracing::info!(
            offset_ms = offset.offset_millis,
            source = %settings.time_source,
            "clock synced"
        );
        Ok(offset)
    }

    /// Create a task from a draft.
    ///
    /// Validates the catalog selection and buyer set, builds the payload,
    /// and — when a fire time is present — arms the timer immediately.
    /// Validation failures never produce a task.
    pub fn create_task(
        &self,
        draft: TaskDraft,
        address_book: &[Address],
    ) -> Result<Task, TaskError> {
        if draft.selection.project_id.is_empty()
            || draft.selection.screen_id.is_empty()
            || draft.selection.sku_id.is_empty()
        {
            return Err(TaskError::invalid_spec(
                "project, screen and sku must all be selected",
            ));
        }
        if draft.buyers.is_empty() {
            return Err(TaskError::invalid_spec("at least one buyer is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for buyer in &draft.buyers {
            if !seen.insert(buyer.id.as_str()) {
                return Err(TaskError::invalid_spec(format!(
                    "duplicate buyer id: {}",
                    buyer.id
                )));
            }
        }

        let mut task = Task::from_draft(draft);
        task.payload = Some(payload::build(&task, address_book)?);

        if let Some(at) = task.fire_time {
            task.push_log(format!(
                "scheduled for {}",
                crate::domain::format_start_time(at)
            ));
        }

        let snapshot = task.clone();
        let task_id = task.id.clone();
        let cancel = CancellationToken::new();

        {
            let mut tasks = self.inner.tasks.write();
            tasks.insert(
                task_id.clone(),
                TaskEntry {
                    task,
                    cancel: cancel.clone(),
                },
            );
        }

        if let Some(at) = snapshot.fire_time {
            self.spawn_fire_loop(task_id, at, cancel);
        }

        Ok(snapshot)
    }

    /// Start a pending task: immediately when it has no fire time,
    /// otherwise by arming its timer.
    pub async fn start(&self, task_id: &str) -> Result<(), TaskError> {
        let invoke_args = {
            let mut tasks = self.inner.tasks.write();
            let entry = tasks.get_mut(task_id).ok_or_else(|| TaskError::NotFound {
                id: task_id.to_string(),
            })?;

            if entry.task.status != TaskStatus::Pending {
                return Err(TaskError::invalid_spec(format!(
                    "task {task_id} is {} and cannot be started",
                    entry.task.status
                )));
            }

            if let Some(at) = entry.task.fire_time {
                self.inner.set_status(&mut entry.task, TaskStatus::Scheduled);
                self.inner.append_log(
                    &mut entry.task,
                    format!("scheduled for {}", crate::domain::format_start_time(at)),
                );
                let cancel = entry.cancel.clone();
                drop(tasks);
                self.spawn_fire_loop(task_id.to_string(), at, cancel);
                return Ok(());
            }

            self.inner.set_status(&mut entry.task, TaskStatus::Running);
            self.inner
                .append_log(&mut entry.task, "starting immediately");

            let Some(payload) = entry.task.payload.clone() else {
                self.inner
                    .append_log(&mut entry.task, "no payload built, aborting");
                self.inner.set_status(&mut entry.task, TaskStatus::Stopped);
                return Err(TaskError::invalid_spec("task has no payload"));
            };
            (payload, entry.task.options.clone())
        };

        self.inner
            .invoke_and_bind(task_id, invoke_args.0, invoke_args.1)
            .await;
        Ok(())
    }

    /// Stop a task: disarm its timer, request executor cancellation if it
    /// is running, and mark it stopped.
    ///
    /// Idempotent: stopping a task that is already terminal — or was never
    /// started — is a no-op, as is stopping an unknown id.
    pub async fn stop(&self, task_id: &str) {
        let executor_id = {
            let mut tasks = self.inner.tasks.write();
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };

            if !matches!(
                entry.task.status,
                TaskStatus::Scheduled | TaskStatus::Running
            ) {
                // Pending or already terminal: nothing armed, nothing to do.
                return;
            }

            entry.cancel.cancel();

            let was_running = entry.task.status == TaskStatus::Running;
            self.inner.set_status(&mut entry.task, TaskStatus::Stopped);
            self.inner.append_log(&mut entry.task, "stopped by user");

            (was_running && !entry.task.has_placeholder_id()).then(|| entry.task.id.clone())
        };

        if let Some(id) = executor_id {
            self.inner.executor.cancel(&id).await;
        }
    }

    /// Bulk-update the fire time.
    ///
    /// Pending tasks are updated in place. Scheduled tasks cannot have
    /// their in-flight timer mutated, so each is stopped and replaced by a
    /// fresh scheduled instance under a new id — a restart, not a true
    /// reschedule. Returns snapshots of every affected task.
    pub fn reschedule_all(&self, new_fire_time: DateTime<Utc>) -> Vec<Task> {
        let formatted = crate::domain::format_start_time(new_fire_time);
        let mut affected = Vec::new();
        let mut to_arm = Vec::new();

        {
            let mut tasks = self.inner.tasks.write();

            for entry in tasks.values_mut() {
                if entry.task.status == TaskStatus::Pending {
                    entry.task.fire_time = Some(new_fire_time);
                    self.inner
                        .append_log(&mut entry.task, format!("fire time set to {formatted}"));
                    affected.push(entry.task.clone());
                }
            }

            let scheduled_ids: Vec<String> = tasks
                .iter()
                .filter(|(_, e)| e.task.status == TaskStatus::Scheduled)
                .map(|(id, _)| id.clone())
                .collect();

            for old_id in scheduled_ids {
                let Some(mut old) = tasks.remove(&old_id) else {
                    continue;
                };
                old.cancel.cancel();
                self.inner.set_status(&mut old.task, TaskStatus::Stopped);
                self.inner.bus.cleanup(&old_id);

                let mut task = old.task.clone();
                task.id = Task::placeholder_id();
                task.status = TaskStatus::Scheduled;
                task.fire_time = Some(new_fire_time);
                task.payment_url = None;
                task.push_log(format!("restarted with fire time {formatted}"));

                let new_id = task.id.clone();
                let cancel = CancellationToken::new();
                affected.push(task.clone());
                tasks.insert(
                    new_id.clone(),
                    TaskEntry {
                        task,
                        cancel: cancel.clone(),
                    },
                );
                to_arm.push((new_id, cancel));
            }
        }

        for (task_id, cancel) in to_arm {
            self.spawn_fire_loop(task_id, new_fire_time, cancel);
        }

        affected
    }

    /// Replace or clear a per-buyer contact override and rebuild the
    /// payload. Allowed while the task has not started running.
    pub fn set_contact_override(
        &self,
        task_id: &str,
        buyer_id: &str,
        contact: Option<ResolvedContact>,
        address_book: &[Address],
    ) -> Result<Task, TaskError> {
        self.edit_task(task_id, address_book, |task| {
            match contact {
                Some(c) => task.contact_overrides.insert(buyer_id.to_string(), c),
                None => task.contact_overrides.remove(buyer_id),
            };
        })
    }

    /// Replace or clear a per-buyer address override and rebuild the
    /// payload. Allowed while the task has not started running.
    pub fn set_address_override(
        &self,
        task_id: &str,
        buyer_id: &str,
        address: Option<Address>,
        address_book: &[Address],
    ) -> Result<Task, TaskError> {
        self.edit_task(task_id, address_book, |task| {
            match address {
                Some(a) => task.address_overrides.insert(buyer_id.to_string(), a),
                None => task.address_overrides.remove(buyer_id),
            };
        })
    }

    fn edit_task(
        &self,
        task_id: &str,
        address_book: &[Address],
        apply: impl FnOnce(&mut Task),
    ) -> Result<Task, TaskError> {
        let mut tasks = self.inner.tasks.write();
        let entry = tasks.get_mut(task_id).ok_or_else(|| TaskError::NotFound {
            id: task_id.to_string(),
        })?;

        if !matches!(
            entry.task.status,
            TaskStatus::Pending | TaskStatus::Scheduled
        ) {
            return Err(TaskError::invalid_spec(format!(
                "task {task_id} is {} and can no longer be edited",
                entry.task.status
            )));
        }

        apply(&mut entry.task);
        entry.task.payload = Some(payload::build(&entry.task, address_book)?);
        Ok(entry.task.clone())
    }

    /// Remove a task from the collection. The only way entries leave the
    /// set; completed tasks persist until the user clears them.
    pub async fn remove(&self, task_id: &str) -> Option<Task> {
        let (entry, executor_id) = {
            let mut tasks = self.inner.tasks.write();
            let entry = tasks.remove(task_id)?;
            entry.cancel.cancel();
            self.inner.bus.cleanup(task_id);
            self.inner.orphans.lock().remove(task_id);

            let id = (entry.task.status == TaskStatus::Running
                && !entry.task.has_placeholder_id())
            .then(|| entry.task.id.clone());
            (entry, id)
        };

        if let Some(id) = executor_id {
            self.inner.executor.cancel(&id).await;
        }
        Some(entry.task)
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.tasks.read().get(task_id).map(|e| e.task.clone())
    }

    /// Snapshot of every task, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<Task> {
        let tasks = self.inner.tasks.read();
        let mut all: Vec<Task> = tasks.values().map(|e| e.task.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Subscribe to one task's event stream.
    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<TaskEvent> {
        self.inner.bus.subscribe(task_id)
    }

    /// Subscribe to executor-driven terminal task snapshots; this is the
    /// feed the notification dispatcher listens on.
    #[must_use]
    pub fn subscribe_terminal(&self) -> broadcast::Receiver<Task> {
        self.inner.terminal_tx.subscribe()
    }

    /// Arm the waiting loop for a scheduled task.
    fn spawn_fire_loop(&self, task_id: String, fire_time: DateTime<Utc>, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.fire_loop(task_id, fire_time, cancel).await;
        });
    }
}

impl Inner {
    /// Current best estimate of server time, with a synced flag.
    fn now_with_fallback(&self) -> (DateTime<Utc>, bool) {
        match self.clock.now() {
            Some(now) => (now, true),
            None => (Utc::now(), false),
        }
    }

    /// Apply a transition and broadcast it. Illegal transitions are
    /// dropped and reported as such.
    fn set_status(&self, task: &mut Task, to: TaskStatus) -> bool {
        let from = task.status;
        if !task.try_transition(to) {
            return false;
        }
        self.bus.broadcast(TaskEvent::StatusChanged {
            task_id: task.id.clone(),
            from,
            to,
            timestamp: Utc::now(),
        });
        true
    }

    /// Append a task log line and broadcast it.
    fn append_log(&self, task: &mut Task, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(task_id = %task.id, "{message}");
        task.push_log(message.clone());
        self.bus.broadcast(TaskEvent::Log {
            task_id: task.id.clone(),
            message,
        });
    }

    /// Waiting loop for one scheduled task.
    ///
    /// Sleeps toward the fire instant in resync-sized chunks, refreshing
    /// the offset while the target is still comfortably away. After every
    /// wake the remaining time is recomputed from the current offset, so
    /// the loop fires only when the recomputed remaining falls inside the
    /// tolerance window.
    async fn fire_loop(
        self: Arc<Self>,
        task_id: String,
        fire_time: DateTime<Utc>,
        cancel: CancellationToken,
    ) {
        let settings = self.settings.clone();
        let tolerance_ms = settings.tolerance_window.as_millis() as i64;
        let resync_guard_ms = settings.resync_guard.as_millis() as i64;
        let mut last_sync = tokio::time::Instant::now();
        let mut warned_unsynced = false;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let (now, synced) = self.now_with_fallback();
            if !synced && !warned_unsynced {
                warned_unsynced = true;
                self.log_task(&task_id, "clock unsynced, firing on local clock (best effort)");
            }

            let remaining_ms = fire_time.signed_duration_since(now).num_milliseconds();
            if remaining_ms <= tolerance_ms {
                break;
            }

            // Refresh the offset while there is still room to absorb it.
            if remaining_ms > resync_guard_ms
                && last_sync.elapsed() >= settings.resync_interval
            {
                match self
                    .sync_client
                    .sync(&settings.time_source, settings.sync_timeout)
                    .await
                {
                    Ok(offset) => {
                        self.clock.apply(offset);
                        self.log_task(
                            &task_id,
                            format!("clock resynced, offset {}ms", offset.offset_millis),
                        );
                    }
                    Err(e) => {
                        self.log_task(&task_id, format!("clock resync failed: {e}"));
                    }
                }
                last_sync = tokio::time::Instant::now();
                continue;
            }

            let chunk_ms = (remaining_ms as u64).min(settings.resync_interval.as_millis() as u64);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(chunk_ms)) => {}
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        self.fire(&task_id).await;
    }

    /// Fire-time reached: hand the task to the executor.
    async fn fire(&self, task_id: &str) {
        let invoke_args = {
            let mut tasks = self.tasks.write();
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            if entry.task.status != TaskStatus::Scheduled {
                return;
            }

            self.set_status(&mut entry.task, TaskStatus::Running);
            self.append_log(&mut entry.task, "fire time reached, invoking executor");

            let Some(payload) = entry.task.payload.clone() else {
                self.append_log(&mut entry.task, "no payload built, aborting");
                self.set_status(&mut entry.task, TaskStatus::Stopped);
                let _ = self.terminal_tx.send(entry.task.clone());
                return;
            };
            (payload, entry.task.options.clone())
        };

        self.invoke_and_bind(task_id, invoke_args.0, invoke_args.1)
            .await;
    }

    /// Invoke the executor and bind the returned id to the task entry.
    ///
    /// On acceptance the entry is re-keyed from its placeholder to the
    /// executor id; a user stop that raced the invocation wins, and the
    /// fresh executor work is cancelled again.
    async fn invoke_and_bind(
        &self,
        placeholder_id: &str,
        payload: crate::payload::PurchasePayload,
        options: crate::domain::ExecuteOptions,
    ) {
        match self.executor.invoke(payload, options).await {
            Ok(executor_id) => {
                let cancel_fresh = {
                    let mut tasks = self.tasks.write();
                    match tasks.remove(placeholder_id) {
                        None => true, // removed mid-invoke
                        Some(mut entry) => {
                            if entry.task.status.is_terminal() {
                                // Stopped while invoking; keep the stopped
                                // entry under its old key.
                                tasks.insert(placeholder_id.to_string(), entry);
                                true
                            } else {
                                entry.task.id = executor_id.clone();
                                self.bus.rekey(placeholder_id, &executor_id);
                                self.append_log(
                                    &mut entry.task,
                                    format!("executor accepted task as {executor_id}"),
                                );
                                tasks.insert(executor_id.clone(), entry);
                                false
                            }
                        }
                    }
                };

                if cancel_fresh {
                    self.executor.cancel(&executor_id).await;
                } else {
                    self.drain_orphans(&executor_id);
                }
            }
            Err(e) => {
                let mut tasks = self.tasks.write();
                if let Some(entry) = tasks.get_mut(placeholder_id) {
                    self.append_log(&mut entry.task, format!("executor rejected task: {e}"));
                    if self.set_status(&mut entry.task, TaskStatus::Stopped) {
                        let _ = self.terminal_tx.send(entry.task.clone());
                    }
                }
            }
        }
    }

    /// Route one executor event to its task.
    ///
    /// Events for terminal tasks are merged into the log without reopening
    /// the state machine; events for ids not bound yet are buffered until
    /// [`Self::drain_orphans`] runs after binding.
    fn apply_event(&self, event: ExecutorEvent) {
        let executor_id = event.executor_id().to_string();
        let mut tasks = self.tasks.write();

        let Some(entry) = tasks.get_mut(&executor_id) else {
            drop(tasks);
            let mut orphans = self.orphans.lock();
            let queue = orphans.entry(executor_id).or_default();
            if queue.len() < ORPHAN_EVENT_LIMIT {
                queue.push(event);
            }
            return;
        };

        match event {
            ExecutorEvent::Progress { message, .. } => {
                self.append_log(&mut entry.task, message);
            }
            ExecutorEvent::PaymentLink { url, .. } => {
                if matches!(entry.task.status, TaskStatus::Running | TaskStatus::Success) {
                    entry.task.payment_url = Some(url.clone());
                    self.append_log(&mut entry.task, "payment link ready");
                    self.bus.broadcast(TaskEvent::PaymentLink {
                        task_id: entry.task.id.clone(),
                        url,
                    });
                } else {
                    self.append_log(
                        &mut entry.task,
                        format!("payment link after stop, kept in log only: {url}"),
                    );
                }
            }
            ExecutorEvent::Finished {
                success, message, ..
            } => {
                self.append_log(&mut entry.task, message);
                let to = if success {
                    TaskStatus::Success
                } else {
                    TaskStatus::Stopped
                };
                if self.set_status(&mut entry.task, to) {
                    let _ = self.terminal_tx.send(entry.task.clone());
                }
                // Otherwise a late report for an already-stopped task:
                // merged above, transition dropped.
            }
        }
    }

    /// Apply events that raced ahead of the id binding, in arrival order.
    fn drain_orphans(&self, executor_id: &str) {
        let queued = self.orphans.lock().remove(executor_id);
        if let Some(events) = queued {
            for event in events {
                self.apply_event(event);
            }
        }
    }

    fn log_task(&self, task_id: &str, message: impl Into<String>) {
        let mut tasks = self.tasks.write();
        if let Some(entry) = tasks.get_mut(task_id) {
            self.append_log(&mut entry.task, message);
        }
    }
}
