//! Cancellable, progress-reporting asynchronous tasks.
//!
//! Every procedure in this crate runs as a [`ProgressiveTask`]: a tokio task
//! plus a shared control block that holds
//!
//! - a lifecycle state ([`TaskState`]) guarded by a mutex,
//! - the current `(start, end)` progress estimate, published on a
//!   `tokio::sync::watch` channel,
//! - the sub-tasks currently registered by the work, cancelled transitively.
//!
//! The issuer side holds a `ProgressiveTask<T>` handle (cheap to clone), the
//! running work receives a [`TaskContext`]. Cancellation is cooperative: the
//! work polls [`TaskContext::check_cancelled`] at its safe points, performs
//! its cleanup and returns. State transitions are serialized under the
//! lifecycle lock, so whichever of a cancellation request or the natural
//! completion takes the lock first decides the terminal outcome. A task that
//! was asked to cancel always ends with [`AutofocusError::Cancelled`].
//!
//! ```no_run
//! use rust_autofocus::task::ProgressiveTask;
//! use std::time::Duration;
//!
//! # async fn demo() -> rust_autofocus::error::AfResult<()> {
//! let task = ProgressiveTask::spawn("count", Duration::from_secs(1), |ctx| async move {
//!     let mut n = 0;
//!     for _ in 0..10 {
//!         ctx.check_cancelled()?;
//!         tokio::time::sleep(Duration::from_millis(100)).await;
//!         n += 1;
//!     }
//!     Ok(n)
//! });
//! let n = task.result(Some(Duration::from_secs(5))).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AfResult, AutofocusError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

/// Lifecycle of a task. Once `Finished`, the state never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// The work is executing
    Running,
    /// Cancellation was requested; the work is cleaning up
    CancelRequested,
    /// A terminal outcome is available
    Finished,
}

/// Wall-clock progress estimate of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    /// When the task started
    pub start: DateTime<Utc>,
    /// When the task is expected to end (actual end once finished)
    pub end: DateTime<Utc>,
}

impl TaskProgress {
    /// Time left until the estimated end, zero if already past.
    pub fn remaining(&self) -> Duration {
        (self.end - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Estimated total duration.
    pub fn total(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Anything that can be asked to stop.
///
/// Implemented by every task control block so that a parent can cancel the
/// sub-task it is currently waiting on without knowing its result type.
pub trait Cancellable: Send + Sync {
    /// Request cancellation. Returns `false` if it is too late.
    fn cancel(&self) -> bool;

    /// Identity used to deregister the sub-task.
    fn id(&self) -> Uuid;
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

struct Lifecycle {
    state: TaskState,
    subtasks: Vec<Arc<dyn Cancellable>>,
}

struct ControlBlock {
    id: Uuid,
    name: String,
    lifecycle: Mutex<Lifecycle>,
    progress: watch::Sender<TaskProgress>,
    cancelled: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl ControlBlock {
    fn new(name: String, estimated: Duration) -> Self {
        let start = Utc::now();
        let (progress, _) = watch::channel(TaskProgress {
            start,
            end: start + to_chrono(estimated),
        });
        let (cancelled, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            name,
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Running,
                subtasks: Vec::new(),
            }),
            progress,
            cancelled,
            done,
        }
    }

    fn state(&self) -> TaskState {
        self.lifecycle.lock().state
    }

    fn request_cancel(&self) -> bool {
        let children = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                TaskState::Finished => {
                    debug!(task = %self.name, "cancel requested too late, task already finished");
                    return false;
                }
                TaskState::CancelRequested => return true,
                TaskState::Running => {
                    lifecycle.state = TaskState::CancelRequested;
                    lifecycle.subtasks.clone()
                }
            }
        };

        debug!(task = %self.name, subtasks = children.len(), "cancellation requested");
        self.cancelled.send_replace(true);
        for child in children {
            child.cancel();
        }
        true
    }

    fn set_end(&self, end: DateTime<Utc>) {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.state == TaskState::Finished {
            return;
        }
        let end = end.max(Utc::now());
        self.progress.send_modify(|p| p.end = end);
    }
}

impl Cancellable for ControlBlock {
    fn cancel(&self) -> bool {
        self.request_cancel()
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

type OutcomeSlot<T> = Arc<Mutex<Option<AfResult<T>>>>;

/// Issuer-side handle of a running procedure.
pub struct ProgressiveTask<T> {
    control: Arc<ControlBlock>,
    outcome: OutcomeSlot<T>,
}

impl<T> Clone for ProgressiveTask<T> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            outcome: Arc::clone(&self.outcome),
        }
    }
}

impl<T> std::fmt::Debug for ProgressiveTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveTask")
            .field("id", &self.control.id)
            .field("name", &self.control.name)
            .field("state", &self.control.state())
            .finish()
    }
}

impl<T: Send + 'static> ProgressiveTask<T> {
    /// Start `work` on the tokio runtime with an initial duration estimate.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: impl Into<String>, estimated: Duration, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = AfResult<T>> + Send + 'static,
    {
        let control = Arc::new(ControlBlock::new(name.into(), estimated));
        let outcome: OutcomeSlot<T> = Arc::new(Mutex::new(None));
        let ctx = TaskContext {
            control: Arc::clone(&control),
        };
        let span = info_span!("task", name = %control.name, id = %control.id);

        let finisher_control = Arc::clone(&control);
        let finisher_outcome = Arc::clone(&outcome);
        tokio::spawn(async move {
            let work_handle = tokio::spawn(async move { work(ctx).await }.instrument(span));
            let result = match work_handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    let msg = panic_message(join_err.into_panic());
                    error!(task = %finisher_control.name, "task panicked: {}", msg);
                    Err(AutofocusError::HardwareFailure(format!("task panicked: {msg}")))
                }
                Err(join_err) => Err(AutofocusError::HardwareFailure(format!(
                    "task aborted: {join_err}"
                ))),
            };
            finish(&finisher_control, &finisher_outcome, result);
        });

        Self { control, outcome }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn finish<T>(control: &ControlBlock, slot: &Mutex<Option<AfResult<T>>>, result: AfResult<T>) {
    {
        let mut lifecycle = control.lifecycle.lock();
        let result = match lifecycle.state {
            TaskState::CancelRequested => Err(AutofocusError::Cancelled),
            _ => result,
        };
        match &result {
            Ok(_) => debug!(task = %control.name, "task finished"),
            Err(err) => debug!(task = %control.name, error = %err, "task ended with error"),
        }
        *slot.lock() = Some(result);
        lifecycle.state = TaskState::Finished;
        lifecycle.subtasks.clear();
        let now = Utc::now();
        control.progress.send_modify(|p| p.end = now);
    }
    control.done.send_replace(true);
}

impl<T> ProgressiveTask<T> {
    /// Request cancellation.
    ///
    /// Returns `false` if the task already finished, `true` otherwise. The
    /// request is forwarded to the registered sub-tasks.
    pub fn cancel(&self) -> bool {
        self.control.request_cancel()
    }

    /// Current progress estimate.
    pub fn progress(&self) -> TaskProgress {
        *self.control.progress.borrow()
    }

    /// Receiver notified at every progress update.
    pub fn subscribe_progress(&self) -> watch::Receiver<TaskProgress> {
        self.control.progress.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// Whether a terminal outcome is available.
    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Whether cancellation was requested (and not refused).
    pub fn is_cancel_requested(&self) -> bool {
        *self.control.cancelled.borrow()
    }

    /// Unique identifier of this task.
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &str {
        &self.control.name
    }

    /// Wait for the task to end, without reading its outcome.
    pub async fn wait(&self) {
        let mut done = self.control.done.subscribe();
        // The sender lives in `self.control`, so this cannot fail.
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn as_cancellable(&self) -> Arc<dyn Cancellable> {
        Arc::clone(&self.control) as Arc<dyn Cancellable>
    }
}

impl<T: Clone> ProgressiveTask<T> {
    /// Wait for the outcome, at most `timeout` if given.
    ///
    /// Returns [`AutofocusError::Timeout`] if the task is still running when
    /// the timeout elapses (the task is *not* cancelled), and
    /// [`AutofocusError::Cancelled`] if it ended cancelled. The outcome is
    /// cached and can be read any number of times.
    pub async fn result(&self, timeout: Option<Duration>) -> AfResult<T> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait())
                .await
                .map_err(|_| {
                    AutofocusError::Timeout(format!(
                        "task '{}' still running after {:?}",
                        self.control.name, limit
                    ))
                })?,
            None => self.wait().await,
        }

        self.outcome.lock().clone().unwrap_or_else(|| {
            Err(AutofocusError::HardwareFailure(format!(
                "task '{}' finished without an outcome",
                self.control.name
            )))
        })
    }
}

/// Worker-side view of a task: cancellation polling, progress updates and
/// sub-task registration.
#[derive(Clone)]
pub struct TaskContext {
    control: Arc<ControlBlock>,
}

impl TaskContext {
    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.control.state() == TaskState::CancelRequested
    }

    /// `Err(Cancelled)` if cancellation has been requested.
    pub fn check_cancelled(&self) -> AfResult<()> {
        if self.is_cancelled() {
            Err(AutofocusError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.control.cancelled.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Revise the estimated end. Clamped to now while running.
    pub fn set_progress_end(&self, end: DateTime<Utc>) {
        self.control.set_end(end);
    }

    /// Revise the estimate as "`remaining` from now".
    pub fn set_remaining(&self, remaining: Duration) {
        self.control.set_end(Utc::now() + to_chrono(remaining));
    }

    /// Current progress estimate.
    pub fn progress(&self) -> TaskProgress {
        *self.control.progress.borrow()
    }

    /// Task identifier, for log fields.
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    /// Register a sub-task to be cancelled along with this task.
    ///
    /// If cancellation was already requested, the sub-task is cancelled
    /// immediately.
    pub fn attach_subtask(&self, child: Arc<dyn Cancellable>) {
        let cancel_now = {
            let mut lifecycle = self.control.lifecycle.lock();
            match lifecycle.state {
                TaskState::Running => {
                    lifecycle.subtasks.push(Arc::clone(&child));
                    false
                }
                TaskState::CancelRequested => true,
                TaskState::Finished => false,
            }
        };
        if cancel_now {
            child.cancel();
        }
    }

    /// Deregister a sub-task.
    pub fn detach_subtask(&self, id: Uuid) {
        self.control
            .lifecycle
            .lock()
            .subtasks
            .retain(|child| child.id() != id);
    }

    /// Register `task` as sub-task and wait for its outcome.
    ///
    /// On timeout, the sub-task is cancelled and waited for before
    /// [`AutofocusError::Timeout`] is returned, so its cleanup has run.
    pub async fn run_subtask<T: Clone>(
        &self,
        task: &ProgressiveTask<T>,
        timeout: Option<Duration>,
    ) -> AfResult<T> {
        self.attach_subtask(task.as_cancellable());
        let result = task.result(timeout).await;
        if matches!(result, Err(AutofocusError::Timeout(_))) && !task.is_done() {
            task.cancel();
            task.wait().await;
        }
        self.detach_subtask(task.id());
        result
    }

    /// Mirror the end estimate of `task` (plus `trailing` for the work left
    /// after it) into this task's progress, until the guard is dropped.
    pub fn follow_subtask<T>(&self, task: &ProgressiveTask<T>, trailing: Duration) -> ProgressFollower {
        let mut rx = task.subscribe_progress();
        let parent = self.clone();
        let trailing = to_chrono(trailing);
        let handle = tokio::spawn(async move {
            loop {
                let child = *rx.borrow_and_update();
                parent.set_progress_end(child.end + trailing);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        ProgressFollower { handle }
    }
}

/// Guard of [`TaskContext::follow_subtask`]; stops forwarding when dropped.
#[must_use = "progress forwarding stops when the follower is dropped"]
pub struct ProgressFollower {
    handle: JoinHandle<()>,
}

impl Drop for ProgressFollower {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
