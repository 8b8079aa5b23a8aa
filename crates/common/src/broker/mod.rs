//! Task broker
//!
//! A process-wide broker abstraction with named queues, retries with
//! exponential backoff, soft/hard time limits, cooperative cancellation,
//! result retention with TTL, and the composition primitives `group`,
//! `chain`, and `chord`.
//!
//! The runtime here is in-process (tokio tasks bounded by per-queue
//! semaphores). Distribution across worker processes is a deployment
//! concern behind the same submit/cancel/record surface; this crate does
//! not ship a message-broker runtime.
//!
//! Task record FSM:
//!
//! ```text
//! queued → running → succeeded
//!                  → failed  → retrying → running (until max_retries)
//!                  → canceling → canceled
//! queued → canceled
//! ```
//!
//! Tasks are acknowledged late: a record only reaches `succeeded` after the
//! task body has returned and its result is stored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::errors::{AppError, Result};
use crate::metrics::{record_task, set_queue_depth};

/// Well-known queue names.
pub mod queues {
    pub const DEFAULT: &str = "default";
    pub const DOCUMENT_PROCESSING: &str = "document.processing";
    pub const DOCUMENT_SPLITTING: &str = "document.splitting";
    pub const DOCUMENT_SEGMENT: &str = "document.segment";
    pub const DOCUMENT_MERGING: &str = "document.merging";
    pub const INDEX: &str = "index";
    pub const PRIORITY: &str = "priority";
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Canceling,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::Canceling => "canceling",
            TaskState::Canceled => "canceled",
        }
    }
}

/// Broker-owned record of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub name: String,
    pub queue: String,
    pub state: TaskState,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Cooperative progress reported by the running task
    pub progress: Option<Value>,
    /// Result payload, retained until the TTL expires
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Handle passed into task bodies for cooperative cancellation, soft time
/// limits, and progress reporting.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    cancel: Arc<AtomicBool>,
    soft_deadline: Instant,
    soft_limit_secs: u64,
    inner: Arc<BrokerInner>,
}

impl TaskContext {
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Raise `Canceled` or `SoftTimeout` when due. Task bodies call this
    /// before each I/O step and between chunks.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(AppError::Canceled);
        }
        if Instant::now() >= self.soft_deadline {
            return Err(AppError::SoftTimeout {
                limit_secs: self.soft_limit_secs,
            });
        }
        Ok(())
    }

    /// Attach free-form progress to the task record.
    pub async fn report_progress(&self, progress: Value) {
        let mut records = self.inner.records.write().await;
        if let Some(record) = records.get_mut(&self.task_id) {
            record.progress = Some(progress);
        }
    }
}

type TaskFn = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A named unit of work bound for a queue.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub queue: String,
    run: TaskFn,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, queue: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            queue: queue.into(),
            run: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

/// Per-task overrides of the broker defaults.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub max_retries: Option<u32>,
    pub soft_time_limit: Option<Duration>,
    pub time_limit: Option<Duration>,
}

struct BrokerInner {
    config: BrokerConfig,
    records: RwLock<HashMap<Uuid, TaskRecord>>,
    cancels: RwLock<HashMap<Uuid, Arc<AtomicBool>>>,
    notifiers: RwLock<HashMap<Uuid, Arc<Notify>>>,
    semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl BrokerInner {
    async fn set_state(&self, task_id: Uuid, state: TaskState) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&task_id) {
            // Terminal states are final
            if record.state.is_terminal() {
                return;
            }
            record.state = state;
            match state {
                TaskState::Running if record.started_at.is_none() => {
                    record.started_at = Some(Utc::now());
                }
                _ if state.is_terminal() => {
                    record.finished_at = Some(Utc::now());
                    record_task(&record.queue, state.as_str());
                }
                _ => {}
            }
        }
        drop(records);
        self.notify(task_id).await;
    }

    async fn notify(&self, task_id: Uuid) {
        if let Some(notify) = self.notifiers.read().await.get(&task_id) {
            notify.notify_waiters();
        }
    }

    async fn queue_semaphore(&self, queue: &str) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.write().await;
        semaphores
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.workers_per_queue.max(1))))
            .clone()
    }

    async fn update_queue_depth(&self, queue: &str) {
        let records = self.records.read().await;
        let depth = records
            .values()
            .filter(|r| r.queue == queue && !r.state.is_terminal())
            .count();
        set_queue_depth(queue, depth);
    }

    /// Drop terminal records older than the result TTL.
    async fn purge_expired(&self) {
        let ttl = chrono::Duration::seconds(self.config.result_ttl_secs as i64);
        let cutoff = Utc::now() - ttl;
        let mut records = self.records.write().await;
        let expired: Vec<Uuid> = records
            .values()
            .filter(|r| {
                r.state.is_terminal() && r.finished_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|r| r.task_id)
            .collect();
        for id in &expired {
            records.remove(id);
        }
        drop(records);
        if !expired.is_empty() {
            let mut cancels = self.cancels.write().await;
            let mut notifiers = self.notifiers.write().await;
            for id in &expired {
                cancels.remove(id);
                notifiers.remove(id);
            }
        }
    }
}

/// In-process task broker.
#[derive(Clone)]
pub struct TaskBroker {
    inner: Arc<BrokerInner>,
}

impl TaskBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                records: RwLock::new(HashMap::new()),
                cancels: RwLock::new(HashMap::new()),
                notifiers: RwLock::new(HashMap::new()),
                semaphores: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Submit a task for execution. Returns immediately with the task id.
    pub async fn submit(&self, spec: TaskSpec, opts: SubmitOptions) -> Result<Uuid> {
        self.inner.purge_expired().await;

        let task_id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let record = TaskRecord {
            task_id,
            name: spec.name.clone(),
            queue: spec.queue.clone(),
            state: TaskState::Queued,
            attempts: 0,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: None,
            result: None,
            error: None,
        };

        self.inner.records.write().await.insert(task_id, record);
        self.inner.cancels.write().await.insert(task_id, cancel.clone());
        self.inner.notifiers.write().await.insert(task_id, notify);
        self.inner.update_queue_depth(&spec.queue).await;

        let inner = self.inner.clone();
        tokio::spawn(run_task(inner, task_id, spec, opts, cancel));

        Ok(task_id)
    }

    /// Fetch the current record for a task.
    pub async fn record(&self, task_id: Uuid) -> Result<TaskRecord> {
        self.inner
            .records
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or_else(|| AppError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Request cancellation.
    ///
    /// Queued tasks cancel immediately; running tasks move to `canceling`
    /// and the body observes it at its next checkpoint. Terminal tasks are
    /// left alone.
    pub async fn cancel(&self, task_id: Uuid) -> Result<()> {
        let flag = self
            .inner
            .cancels
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or_else(|| AppError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        flag.store(true, Ordering::Relaxed);

        let state = {
            let records = self.inner.records.read().await;
            records.get(&task_id).map(|r| r.state)
        };
        match state {
            Some(TaskState::Queued) => {
                self.inner.set_state(task_id, TaskState::Canceled).await;
            }
            Some(TaskState::Running) | Some(TaskState::Retrying) => {
                self.inner.set_state(task_id, TaskState::Canceling).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Wait for a task to reach a terminal state and return its record.
    pub async fn wait(&self, task_id: Uuid) -> Result<TaskRecord> {
        loop {
            let notify = self
                .inner
                .notifiers
                .read()
                .await
                .get(&task_id)
                .cloned()
                .ok_or_else(|| AppError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let record = self.record(task_id).await?;
            if record.state.is_terminal() {
                return Ok(record);
            }

            notified.await;
        }
    }

    /// Wait for a task and unwrap its result, converting terminal failure
    /// states into errors.
    pub async fn wait_result(&self, task_id: Uuid) -> Result<Value> {
        let record = self.wait(task_id).await?;
        match record.state {
            TaskState::Succeeded => Ok(record.result.unwrap_or(Value::Null)),
            TaskState::Canceled => Err(AppError::Canceled),
            _ => Err(AppError::Internal {
                message: record
                    .error
                    .unwrap_or_else(|| format!("task {task_id} failed")),
            }),
        }
    }

    /// Fan out a set of tasks.
    pub async fn group(&self, specs: Vec<(TaskSpec, SubmitOptions)>) -> Result<GroupHandle> {
        let mut task_ids = Vec::with_capacity(specs.len());
        for (spec, opts) in specs {
            task_ids.push(self.submit(spec, opts).await?);
        }
        Ok(GroupHandle { task_ids })
    }

    /// Run tasks sequentially, stopping at the first failure. Returns the
    /// last task's result.
    pub async fn chain(&self, specs: Vec<(TaskSpec, SubmitOptions)>) -> Result<Value> {
        let mut last = Value::Null;
        for (spec, opts) in specs {
            let id = self.submit(spec, opts).await?;
            last = self.wait_result(id).await?;
        }
        Ok(last)
    }

    /// Fan out `specs`, and if every task succeeds, run `body` with the
    /// collected results. On any failure the remaining group tasks are
    /// canceled and the body never runs.
    pub async fn chord<B>(
        &self,
        specs: Vec<(TaskSpec, SubmitOptions)>,
        body: B,
    ) -> Result<ChordOutcome>
    where
        B: FnOnce(Vec<Value>) -> (TaskSpec, SubmitOptions),
    {
        let group = self.group(specs).await?;
        let outcome = group.join_fail_fast(self).await?;

        if !outcome.all_succeeded() {
            return Ok(ChordOutcome {
                group: outcome,
                body: None,
            });
        }

        let results = outcome.results();
        let (spec, opts) = body(results);
        let body_id = self.submit(spec, opts).await?;
        let body_record = self.wait(body_id).await?;

        Ok(ChordOutcome {
            group: outcome,
            body: Some(body_record),
        })
    }

    /// Number of queued or running tasks on a queue.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let records = self.inner.records.read().await;
        records
            .values()
            .filter(|r| r.queue == queue && !r.state.is_terminal())
            .count()
    }

    /// Wait until every known task is terminal (shutdown drain).
    pub async fn drain(&self) {
        loop {
            let pending: Vec<Uuid> = {
                let records = self.inner.records.read().await;
                records
                    .values()
                    .filter(|r| !r.state.is_terminal())
                    .map(|r| r.task_id)
                    .collect()
            };
            if pending.is_empty() {
                return;
            }
            for id in pending {
                let _ = self.wait(id).await;
            }
        }
    }
}

/// Handle to a fanned-out set of tasks.
#[derive(Debug, Clone)]
pub struct GroupHandle {
    pub task_ids: Vec<Uuid>,
}

impl GroupHandle {
    /// Wait for every task to reach a terminal state.
    pub async fn join(&self, broker: &TaskBroker) -> Result<GroupOutcome> {
        let mut records = Vec::with_capacity(self.task_ids.len());
        for &id in &self.task_ids {
            records.push(broker.wait(id).await?);
        }
        Ok(GroupOutcome { records })
    }

    /// Wait for all tasks, canceling the stragglers as soon as one fails.
    /// Queued tasks cancel immediately; running ones stop at their next
    /// checkpoint.
    pub async fn join_fail_fast(&self, broker: &TaskBroker) -> Result<GroupOutcome> {
        let mut waiting: FuturesUnordered<_> = self
            .task_ids
            .iter()
            .map(|&id| async move { broker.wait(id).await })
            .collect();

        let mut by_id: HashMap<Uuid, TaskRecord> = HashMap::new();
        let mut canceled_rest = false;

        while let Some(record) = waiting.next().await {
            let record = record?;
            let failed = record.state == TaskState::Failed;
            by_id.insert(record.task_id, record);

            if failed && !canceled_rest {
                canceled_rest = true;
                for &id in &self.task_ids {
                    if !by_id.contains_key(&id) {
                        let _ = broker.cancel(id).await;
                    }
                }
            }
        }

        let records = self
            .task_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        Ok(GroupOutcome { records })
    }

    /// Cancel every task in the group.
    pub async fn cancel_all(&self, broker: &TaskBroker) {
        for &id in &self.task_ids {
            let _ = broker.cancel(id).await;
        }
    }
}

/// Terminal records of a group, in submission order.
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub records: Vec<TaskRecord>,
}

impl GroupOutcome {
    pub fn count(&self, state: TaskState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.records.iter().all(|r| r.state == TaskState::Succeeded)
    }

    /// Results of the succeeded tasks, in submission order.
    pub fn results(&self) -> Vec<Value> {
        self.records
            .iter()
            .filter(|r| r.state == TaskState::Succeeded)
            .filter_map(|r| r.result.clone())
            .collect()
    }
}

/// Outcome of a chord: the group records plus the body record when it ran.
#[derive(Debug, Clone)]
pub struct ChordOutcome {
    pub group: GroupOutcome,
    pub body: Option<TaskRecord>,
}

async fn run_task(
    inner: Arc<BrokerInner>,
    task_id: Uuid,
    spec: TaskSpec,
    opts: SubmitOptions,
    cancel: Arc<AtomicBool>,
) {
    let semaphore = inner.queue_semaphore(&spec.queue).await;
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    // Canceled while queued
    if cancel.load(Ordering::Relaxed) {
        inner.set_state(task_id, TaskState::Canceled).await;
        inner.update_queue_depth(&spec.queue).await;
        return;
    }

    let max_retries = opts.max_retries.unwrap_or(inner.config.max_retries);
    let soft_limit = opts
        .soft_time_limit
        .unwrap_or(Duration::from_secs(inner.config.task_soft_time_limit_secs));
    let hard_limit = opts
        .time_limit
        .unwrap_or(Duration::from_secs(inner.config.task_time_limit_secs));

    let mut backoff_policy = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_multiplier(2.0)
        .with_randomization_factor(0.5)
        .with_max_interval(Duration::from_secs(30))
        .with_max_elapsed_time(None)
        .build();

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        {
            let mut records = inner.records.write().await;
            if let Some(record) = records.get_mut(&task_id) {
                record.attempts = attempts;
            }
        }
        inner.set_state(task_id, TaskState::Running).await;

        let ctx = TaskContext {
            task_id,
            cancel: cancel.clone(),
            soft_deadline: Instant::now() + soft_limit,
            soft_limit_secs: soft_limit.as_secs(),
            inner: inner.clone(),
        };

        let outcome = tokio::time::timeout(hard_limit, (spec.run)(ctx)).await;

        let error = match outcome {
            Ok(Ok(result)) => {
                // Acked late: result stored before the terminal transition.
                {
                    let mut records = inner.records.write().await;
                    if let Some(record) = records.get_mut(&task_id) {
                        record.result = Some(result);
                    }
                }
                inner.set_state(task_id, TaskState::Succeeded).await;
                break;
            }
            Ok(Err(AppError::Canceled)) => {
                inner.set_state(task_id, TaskState::Canceled).await;
                break;
            }
            Ok(Err(e)) => e,
            Err(_) => AppError::HardTimeout {
                limit_secs: hard_limit.as_secs(),
            },
        };

        if cancel.load(Ordering::Relaxed) {
            inner.set_state(task_id, TaskState::Canceled).await;
            break;
        }

        let retryable = error.is_transient() || matches!(error, AppError::HardTimeout { .. });
        if retryable && attempts <= max_retries {
            tracing::warn!(
                task = %spec.name,
                task_id = %task_id,
                attempt = attempts,
                max_retries = max_retries,
                error = %error,
                "Task failed, retrying"
            );
            inner.set_state(task_id, TaskState::Retrying).await;
            let delay = backoff_policy
                .next_backoff()
                .unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
            if cancel.load(Ordering::Relaxed) {
                inner.set_state(task_id, TaskState::Canceled).await;
                break;
            }
            continue;
        }

        tracing::error!(
            task = %spec.name,
            task_id = %task_id,
            attempts = attempts,
            error = %error,
            "Task failed"
        );
        {
            let mut records = inner.records.write().await;
            if let Some(record) = records.get_mut(&task_id) {
                record.error = Some(error.to_string());
            }
        }
        inner.set_state(task_id, TaskState::Failed).await;
        break;
    }

    inner.update_queue_depth(&spec.queue).await;
}
