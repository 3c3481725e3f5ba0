//! Durable, priority-ordered task queue with a cooperative processing loop.
//!
//! Design:
//! - The task list behind `state` mirrors the sink. Every mutation builds the
//!   next list, writes it to the sink, and only then commits it in memory.
//! - Bookkeeping after a dispatch (removal, reschedule) is applied in memory
//!   even when the sink write fails. The list is then marked dirty and
//!   rewritten on the next successful commit, so a task is never left due
//!   with stale retry fields.
//! - `processing` is in-memory only. It starts empty after a reload and is
//!   rebuilt purely from dispatch activity.
//! - One loop per queue. It is started by `enqueue` / `restart` and exits on
//!   its own when there is nothing left to do.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::{ProcessFailure, QueueStats, RetryPolicy, TaskProcessor};
use crate::bus::EventBus;
use crate::domain::{
    AbandonReason, Decision, ErrorCode, ErrorInfo, Event, PersistenceTask, QueueError, TaskId,
};
use crate::ports::{Clock, KeyValueSink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Dispatches issued together per batch.
    pub max_concurrent: usize,

    pub max_queue_size: usize,

    /// Longest sleep while every task waits on a future `retry_at`.
    pub max_idle_wait_ms: u64,

    /// Re-check interval while only in-flight work remains.
    pub in_flight_poll_ms: u64,

    /// Sink key the task list is stored under.
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queue_size: 1_000,
            max_idle_wait_ms: 60_000,
            in_flight_poll_ms: 100,
            storage_key: "persistence-queue".to_string(),
        }
    }
}

struct QueueState<T> {
    /// Priority-ordered. Identical to what the sink holds unless `dirty`.
    tasks: Vec<PersistenceTask<T>>,
    /// The last sink write failed and `tasks` is ahead of the sink.
    dirty: bool,
    /// Task ids currently handed to the processor.
    processing: HashSet<TaskId>,
    running: bool,
}

struct QueueInner<T: Send + Sync> {
    state: Mutex<QueueState<T>>,
    sink: Arc<dyn KeyValueSink>,
    config: QueueConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    bus: EventBus<T>,
    processor: RwLock<Option<Arc<dyn TaskProcessor<T>>>>,
    wake: Notify,
    stopped: AtomicBool,
}

enum Step<T> {
    Drained,
    Batch(Vec<PersistenceTask<T>>),
    Wait(Duration),
}

/// Cheap to clone; clones share the same queue.
pub struct PersistentQueue<T: Send + Sync> {
    inner: Arc<QueueInner<T>>,
}

impl<T: Send + Sync> Clone for PersistentQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync> PersistentQueue<T> {
    /// Cooperative stop: the current batch finishes, then the loop exits.
    /// Stays stopped until `restart`.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }
}

impl<T> PersistentQueue<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open the queue, reading every pending task from the sink.
    ///
    /// Loaded tasks are not dispatched until a processor is set and the loop
    /// is started (`restart`, or the next `enqueue`).
    pub async fn load(
        sink: Arc<dyn KeyValueSink>,
        config: QueueConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        bus: EventBus<T>,
    ) -> Result<Self, QueueError> {
        let tasks: Vec<PersistenceTask<T>> = match sink.read(&config.storage_key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(crate::domain::SinkError::from)?,
            None => Vec::new(),
        };
        if !tasks.is_empty() {
            info!(count = tasks.len(), key = %config.storage_key, "restored pending tasks");
        }

        Ok(Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    tasks,
                    dirty: false,
                    processing: HashSet::new(),
                    running: false,
                }),
                sink,
                config,
                retry,
                clock,
                bus,
                processor: RwLock::new(None),
                wake: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Register the task handler. Does not start processing.
    pub fn set_processor(&self, processor: Arc<dyn TaskProcessor<T>>) {
        *self
            .inner
            .processor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(processor);
    }

    fn processor(&self) -> Option<Arc<dyn TaskProcessor<T>>> {
        self.inner
            .processor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Insert in priority order (stable for equal priority) and persist.
    pub async fn enqueue(&self, task: PersistenceTask<T>) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().await;

        let size = state.tasks.len();
        if size >= self.inner.config.max_queue_size {
            return Err(QueueError::Capacity {
                size,
                max: self.inner.config.max_queue_size,
            });
        }
        if state.tasks.iter().any(|t| t.id == task.id) {
            return Err(QueueError::Duplicate(task.id));
        }

        let position = state
            .tasks
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(state.tasks.len());
        let task_id = task.id.clone();
        let mut next = state.tasks.clone();
        next.insert(position, task);
        self.commit(&mut state, next).await?;
        debug!(task_id = %task_id, position, "task enqueued");

        self.ensure_running(&mut state);
        drop(state);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Remove a task by id. Returns whether it was present.
    pub async fn dequeue(&self, id: &TaskId) -> Result<bool, QueueError> {
        let mut state = self.inner.state.lock().await;
        self.remove_locked(&mut state, id).await
    }

    /// Replace a queued task in place. Never resurrects a removed task.
    pub async fn update(&self, task: PersistenceTask<T>) -> Result<bool, QueueError> {
        let mut state = self.inner.state.lock().await;
        let Some(index) = state.tasks.iter().position(|t| t.id == task.id) else {
            return Ok(false);
        };
        let mut next = state.tasks.clone();
        next[index] = task;
        self.commit(&mut state, next).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().await;
        self.commit(&mut state, Vec::new()).await
    }

    pub async fn size(&self) -> usize {
        self.inner.state.lock().await.tasks.len()
    }

    /// Empty durable queue and nothing mid-dispatch.
    pub async fn is_empty(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.tasks.is_empty() && state.processing.is_empty()
    }

    /// Snapshot in dispatch order.
    pub async fn pending_tasks(&self) -> Vec<PersistenceTask<T>> {
        self.inner.state.lock().await.tasks.clone()
    }

    pub async fn stats(&self) -> QueueStats {
        let now = self.inner.clock.now_millis();
        let state = self.inner.state.lock().await;
        let mut stats = QueueStats {
            pending: state.tasks.len(),
            in_flight: state.processing.len(),
            ..QueueStats::default()
        };
        for task in state.tasks.iter().filter(|t| !state.processing.contains(&t.id)) {
            if task.is_due(now) {
                stats.ready += 1;
            } else {
                stats.scheduled += 1;
            }
        }
        stats
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// Resume the loop if it is idle and work remains.
    pub async fn restart(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        if !state.tasks.is_empty() {
            self.ensure_running(&mut state);
        }
    }

    // ----------------------------------------------------------------
    // internals
    // ----------------------------------------------------------------

    /// Persist `next`, then make it the in-memory state.
    async fn commit(
        &self,
        state: &mut QueueState<T>,
        next: Vec<PersistenceTask<T>>,
    ) -> Result<(), QueueError> {
        let raw = serde_json::to_string(&next).map_err(crate::domain::SinkError::from)?;
        self.inner
            .sink
            .write(&self.inner.config.storage_key, raw)
            .await?;
        state.tasks = next;
        state.dirty = false;
        Ok(())
    }

    /// Like `commit`, but the in-memory state moves forward even if the
    /// sink write fails.
    async fn apply(&self, state: &mut QueueState<T>, next: Vec<PersistenceTask<T>>) {
        let staged = next.clone();
        if let Err(e) = self.commit(state, next).await {
            error!(error = %e, "sink write failed, queue kept in memory until the next commit");
            state.tasks = staged;
            state.dirty = true;
        }
    }

    /// Rewrite the current list if an earlier write failed.
    async fn flush(&self, state: &mut QueueState<T>) -> bool {
        if !state.dirty {
            return true;
        }
        let current = state.tasks.clone();
        match self.commit(state, current).await {
            Ok(()) => {
                info!("durable queue resynced with the sink");
                true
            }
            Err(e) => {
                warn!(error = %e, "durable queue still out of sync with the sink");
                false
            }
        }
    }

    async fn remove_locked(
        &self,
        state: &mut QueueState<T>,
        id: &TaskId,
    ) -> Result<bool, QueueError> {
        let Some(index) = state.tasks.iter().position(|t| &t.id == id) else {
            return Ok(false);
        };
        let mut next = state.tasks.clone();
        next.remove(index);
        self.commit(state, next).await?;
        Ok(true)
    }

    /// Terminal removal after a dispatch.
    async fn remove(&self, id: &TaskId) {
        let mut state = self.inner.state.lock().await;
        let Some(index) = state.tasks.iter().position(|t| &t.id == id) else {
            return;
        };
        let mut next = state.tasks.clone();
        next.remove(index);
        self.apply(&mut state, next).await;
    }

    /// In-place replacement during a dispatch. `false` if the task is gone.
    async fn persist_update(&self, task: PersistenceTask<T>) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(index) = state.tasks.iter().position(|t| t.id == task.id) else {
            return false;
        };
        let mut next = state.tasks.clone();
        next[index] = task;
        self.apply(&mut state, next).await;
        true
    }

    fn ensure_running(&self, state: &mut QueueState<T>) {
        if state.running || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.processor().is_none() {
            debug!("no processor set, processing deferred");
            return;
        }
        state.running = true;
        let queue = self.clone();
        tokio::spawn(async move { queue.run().await });
    }

    async fn run(self) {
        debug!("processing loop started");
        loop {
            if self.inner.stopped.load(Ordering::SeqCst) {
                let mut state = self.inner.state.lock().await;
                // re-check under the lock: `restart` may have raced us
                if self.inner.stopped.load(Ordering::SeqCst) {
                    state.running = false;
                    debug!("processing loop stopped");
                    return;
                }
                continue;
            }
            match self.next_step().await {
                Step::Drained => {
                    debug!("queue drained, processing loop exiting");
                    return;
                }
                Step::Batch(batch) => {
                    // settle-all: every dispatch runs to completion
                    join_all(batch.into_iter().map(|task| self.dispatch(task))).await;
                }
                Step::Wait(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.inner.wake.notified() => {}
                    }
                }
            }
        }
    }

    /// Pick the next batch, or decide how long to idle.
    async fn next_step(&self) -> Step<T> {
        let now = self.inner.clock.now_millis();
        let mut state = self.inner.state.lock().await;
        let synced = self.flush(&mut state).await;

        if state.tasks.is_empty() && state.processing.is_empty() {
            if !synced {
                // the sink still holds removed tasks; keep retrying the write
                return Step::Wait(Duration::from_millis(self.inner.config.max_idle_wait_ms));
            }
            state.running = false;
            return Step::Drained;
        }

        let capacity = self
            .inner
            .config
            .max_concurrent
            .max(1)
            .saturating_sub(state.processing.len());
        let ready: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|t| !state.processing.contains(&t.id) && t.is_due(now))
            .take(capacity)
            .map(|t| t.id.clone())
            .collect();

        if ready.is_empty() {
            let earliest = state
                .tasks
                .iter()
                .filter(|t| !state.processing.contains(&t.id))
                .filter_map(|t| t.retry_at)
                .min();
            let wait = match earliest {
                Some(retry_at) if capacity > 0 => {
                    let until = u64::try_from(retry_at.saturating_sub(now)).unwrap_or(0);
                    Duration::from_millis(until.min(self.inner.config.max_idle_wait_ms))
                }
                // only in-flight work remains, or every slot is taken
                _ => Duration::from_millis(self.inner.config.in_flight_poll_ms),
            };
            return Step::Wait(wait);
        }

        // now eligible: clear retry_at
        let mut next = state.tasks.clone();
        let mut changed = false;
        for task in next.iter_mut().filter(|t| ready.contains(&t.id)) {
            if task.retry_at.take().is_some() {
                changed = true;
            }
        }
        if changed {
            self.apply(&mut state, next).await;
        }

        let batch: Vec<PersistenceTask<T>> = state
            .tasks
            .iter()
            .filter(|t| ready.contains(&t.id))
            .cloned()
            .collect();
        for task in &batch {
            state.processing.insert(task.id.clone());
        }
        Step::Batch(batch)
    }

    /// Dispatch one task. The mid-dispatch marker is cleared on every path.
    async fn dispatch(&self, task: PersistenceTask<T>) {
        let id = task.id.clone();
        self.dispatch_inner(task).await;
        self.inner.state.lock().await.processing.remove(&id);
    }

    async fn dispatch_inner(&self, mut task: PersistenceTask<T>) {
        let now = self.inner.clock.now_millis();

        if task.is_expired(now) {
            warn!(task_id = %task.id, entity_type = %task.entity_type, "task expired, abandoning");
            self.remove(&task.id).await;
            self.publish_abandoned(&task, AbandonReason::Expired, ErrorInfo::expired());
            return;
        }

        if task.expires_at.is_none() && task.max_age.is_some() {
            task.expires_at = task.effective_expires_at();
            if !self.persist_update(task.clone()).await {
                debug!(task_id = %task.id, "task dequeued before dispatch");
                return;
            }
        }

        let Some(processor) = self.processor() else {
            warn!(task_id = %task.id, "no processor set, task left in queue");
            return;
        };

        let result = AssertUnwindSafe(processor.process(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ProcessFailure::retryable(ErrorInfo::new(
                    ErrorCode::Unknown,
                    "task processor panicked",
                )))
            });

        match result {
            Ok(()) => {
                debug!(task_id = %task.id, "task completed");
                self.remove(&task.id).await;
            }
            Err(failure) => {
                let now = self.inner.clock.now_millis();
                match self.inner.retry.decide(&task, &failure, now) {
                    Decision::Abandon { reason } => {
                        error!(
                            task_id = %task.id,
                            entity_type = %task.entity_type,
                            reason = %reason,
                            error = %failure.error,
                            "task abandoned"
                        );
                        self.remove(&task.id).await;
                        self.publish_abandoned(&task, reason, failure.error);
                    }
                    Decision::Retry {
                        retry_count,
                        delay,
                        retry_at,
                    } => {
                        warn!(
                            task_id = %task.id,
                            retry_count,
                            max_retries = task.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.error,
                            "task failed, retry scheduled"
                        );
                        task.retry_count = retry_count;
                        task.retry_at = Some(retry_at);
                        task.payload.metadata =
                            task.payload.metadata.errored(failure.error.message.clone());
                        let event = Event::TaskRetryScheduled {
                            task_id: task.id.clone(),
                            entity_type: task.entity_type.clone(),
                            retry_count,
                            retry_at,
                        };
                        if self.persist_update(task).await {
                            self.inner.bus.publish(event);
                        }
                    }
                }
            }
        }
    }

    fn publish_abandoned(&self, task: &PersistenceTask<T>, reason: AbandonReason, error: ErrorInfo) {
        self.inner.bus.publish(Event::TaskAbandoned {
            task_id: task.id.clone(),
            entity_type: task.entity_type.clone(),
            operation: task.operation,
            reason,
            payload: task.payload.clone(),
            error,
        });
    }
}
