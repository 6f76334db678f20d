//! Synthetic workload — a fixed resource demand with a timed countdown.
//!
//! A `Task` is built unstarted, admitted by exactly one node (which
//! assigns its id) and then counts down on a background tokio task:
//!
//! ```text
//! Task::new ──► start(tick) ──► [tick … tick] ──► remaining == 0
//!                    │                               │
//!                    │ dispose()                     ├─ completion hook (once)
//!                    ▼                               ▼
//!          Err(StoppedPrematurely)             Ok(TaskOutcome)
//! ```
//!
//! The completion hook is stored take-once, so it fires at most once and
//! never after `dispose`. Hook failures (errors or panics) are captured in
//! the returned [`TaskOutcome`] and never reach the caller as a panic.
//! A node that admits a task takes the hook over and fires it itself,
//! after the task's cores have been released.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::class::WorkloadClass;
use crate::error::{CoreError, CoreResult};

/// Caller-supplied notification fired when a task finishes its countdown.
pub type CompletionHook =
    Box<dyn FnOnce(&TaskSnapshot) -> anyhow::Result<()> + Send + 'static>;

/// Why a started task did not run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task '{0}' stopped prematurely")]
    StoppedPrematurely(String),
}

/// Result of a countdown that reached zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Set when the completion hook returned an error or panicked.
    pub hook_error: Option<String>,
}

/// Point-in-time view of a task, for logs and front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    /// Node-assigned id, 0 until admitted.
    pub id: u64,
    pub name: String,
    pub cpu_cores: u32,
    pub class: WorkloadClass,
    pub duration_ms: u64,
    pub remaining_ms: u64,
    pub running: bool,
}

impl fmt::Display for TaskSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = |ms: u64| ms as f64 / 1000.0;
        if self.running {
            write!(
                f,
                "#{} {} ({} cores, {}, {:.1}s remaining)",
                self.id,
                self.name,
                self.cpu_cores,
                self.class,
                secs(self.remaining_ms)
            )
        } else {
            write!(
                f,
                "#{} {} ({} cores, {}, {:.1}s)",
                self.id,
                self.name,
                self.cpu_cores,
                self.class,
                secs(self.duration_ms)
            )
        }
    }
}

/// State shared between a task and its countdown loop.
struct Shared {
    remaining_ms: AtomicU64,
    running: AtomicBool,
    finished: AtomicBool,
    hook: Mutex<Option<CompletionHook>>,
}

impl Shared {
    fn take_hook(&self) -> Option<CompletionHook> {
        self.hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Run the hook if it has not been consumed yet.
    fn fire_hook(&self, snapshot: &TaskSnapshot) -> Option<String> {
        let hook = self.take_hook()?;
        invoke_hook(hook, snapshot)
    }
}

/// Call a completion hook, converting errors and panics into a message.
pub(crate) fn invoke_hook(hook: CompletionHook, snapshot: &TaskSnapshot) -> Option<String> {
    match panic::catch_unwind(AssertUnwindSafe(|| hook(snapshot))) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            warn!(task_id = snapshot.id, task = %snapshot.name, error = %e, "completion hook failed");
            Some(format!("{e:#}"))
        }
        Err(payload) => {
            let msg = panic_message(&*payload);
            error!(task_id = snapshot.id, task = %snapshot.name, panic = %msg, "completion hook panicked");
            Some(format!("hook panicked: {msg}"))
        }
    }
}

/// Handle to a running countdown.
struct Countdown {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// A unit of synthetic work.
pub struct Task {
    name: String,
    cpu_cores: u32,
    duration: Duration,
    duration_ms: u64,
    class: WorkloadClass,
    id: u64,
    shared: Arc<Shared>,
    countdown: Option<Countdown>,
}

impl Task {
    /// Create an unstarted task.
    ///
    /// Fails with `InvalidArgument` when `cpu_cores` is zero or the
    /// duration does not fit in `u64` milliseconds.
    pub fn new(
        name: impl Into<String>,
        duration: Duration,
        cpu_cores: u32,
        class: WorkloadClass,
    ) -> CoreResult<Self> {
        let name = name.into();
        if cpu_cores == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "task '{name}': cpu_cores must be positive"
            )));
        }
        let duration_ms = u64::try_from(duration.as_millis()).map_err(|_| {
            CoreError::InvalidArgument(format!(
                "task '{name}': duration {duration:?} is too long"
            ))
        })?;

        Ok(Self {
            name,
            cpu_cores,
            duration,
            duration_ms,
            class,
            id: 0,
            shared: Arc::new(Shared {
                remaining_ms: AtomicU64::new(duration_ms),
                running: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                hook: Mutex::new(None),
            }),
            countdown: None,
        })
    }

    /// Create a task from untrusted numeric input (shell, config).
    ///
    /// Rejects non-positive core counts and negative or non-finite durations.
    pub fn with_seconds(
        name: impl Into<String>,
        duration_secs: f64,
        cpu_cores: i64,
        class: WorkloadClass,
    ) -> CoreResult<Self> {
        let name = name.into();
        if !duration_secs.is_finite() || duration_secs < 0.0 {
            return Err(CoreError::InvalidArgument(format!(
                "task '{name}': duration must be a non-negative number of seconds, got {duration_secs}"
            )));
        }
        let cores = u32::try_from(cpu_cores)
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| {
                CoreError::InvalidArgument(format!(
                    "task '{name}': cpu_cores must be positive, got {cpu_cores}"
                ))
            })?;

        let duration = Duration::try_from_secs_f64(duration_secs).map_err(|e| {
            CoreError::InvalidArgument(format!(
                "task '{name}': duration {duration_secs}s is out of range: {e}"
            ))
        })?;

        Self::new(name, duration, cores, class)
    }

    /// Attach a completion hook, replacing any previous one.
    pub fn with_on_complete<F>(self, hook: F) -> Self
    where
        F: FnOnce(&TaskSnapshot) -> anyhow::Result<()> + Send + 'static,
    {
        *self
            .shared
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
        self
    }

    /// Check the constructor constraints and that the task is still unassigned.
    pub fn validate(&self) -> CoreResult<()> {
        if self.cpu_cores == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "task '{}': cpu_cores must be positive",
                self.name
            )));
        }
        if self.countdown.is_some() || self.id != 0 {
            return Err(CoreError::InvalidArgument(format!(
                "task '{}' has already been admitted",
                self.name
            )));
        }
        Ok(())
    }

    /// Begin the countdown, decrementing `remaining` once per `tick`.
    ///
    /// Must be called inside a tokio runtime. A task can be started once;
    /// a second call fails with `AlreadyRunning`, even after disposal.
    pub fn start(&mut self, tick: Duration) -> CoreResult<TaskCompletion> {
        if self.countdown.is_some() {
            return Err(CoreError::AlreadyRunning(self.name.clone()));
        }
        if tick.is_zero() {
            return Err(CoreError::InvalidArgument(
                "countdown tick must be non-zero".to_string(),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let snapshot = self.snapshot();
        let handle = tokio::spawn(run_countdown(shared, snapshot, tick, stop_rx, done_tx));

        self.countdown = Some(Countdown { handle, stop_tx });
        debug!(task_id = self.id, task = %self.name, duration_ms = self.duration_ms, "task started");

        Ok(TaskCompletion {
            name: self.name.clone(),
            rx: done_rx,
        })
    }

    /// Stop the countdown early without firing the completion hook.
    ///
    /// Idempotent. The completion handle resolves with
    /// [`TaskError::StoppedPrematurely`] unless the countdown already finished.
    pub fn dispose(&self) {
        drop(self.shared.take_hook());
        if let Some(countdown) = &self.countdown {
            let _ = countdown.stop_tx.send(true);
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu_cores(&self) -> u32 {
        self.cpu_cores
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn class(&self) -> WorkloadClass {
        self.class
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Detach the completion hook so the caller can fire it later.
    pub(crate) fn take_on_complete(&mut self) -> Option<CompletionHook> {
        self.shared.take_hook()
    }

    pub(crate) fn restore_on_complete(&mut self, hook: Option<CompletionHook>) {
        *self
            .shared
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Live countdown value.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.shared.remaining_ms.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.countdown.is_some()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            cpu_cores: self.cpu_cores,
            class: self.class,
            duration_ms: self.duration_ms,
            remaining_ms: self.shared.remaining_ms.load(Ordering::SeqCst),
            running: self.is_running(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cpu_cores", &self.cpu_cores)
            .field("class", &self.class)
            .field("duration", &self.duration)
            .field("remaining", &self.remaining())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(countdown) = &self.countdown {
            if !countdown.handle.is_finished() {
                let _ = countdown.stop_tx.send(true);
            }
        }
    }
}

/// Resolves when the countdown reaches zero or is stopped.
pub struct TaskCompletion {
    name: String,
    rx: oneshot::Receiver<Result<TaskOutcome, TaskError>>,
}

impl Future for TaskCompletion {
    type Output = Result<TaskOutcome, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        polled.map(|res| match res {
            Ok(outcome) => outcome,
            // Countdown task went away without reporting.
            Err(_) => Err(TaskError::StoppedPrematurely(self.name.clone())),
        })
    }
}

/// The countdown loop for a single task.
async fn run_countdown(
    shared: Arc<Shared>,
    mut snapshot: TaskSnapshot,
    tick: Duration,
    mut stop: watch::Receiver<bool>,
    done: oneshot::Sender<Result<TaskOutcome, TaskError>>,
) {
    loop {
        let remaining = shared.remaining_ms.load(Ordering::SeqCst);
        if remaining == 0 {
            break;
        }
        let step = tick.min(Duration::from_millis(remaining));

        tokio::select! {
            _ = tokio::time::sleep(step) => {
                let step_ms = step.as_millis() as u64;
                shared
                    .remaining_ms
                    .store(remaining.saturating_sub(step_ms), Ordering::SeqCst);
            }
            _ = stop.changed() => {
                shared.running.store(false, Ordering::SeqCst);
                debug!(task_id = snapshot.id, task = %snapshot.name, remaining_ms = remaining, "countdown stopped");
                let _ = done.send(Err(TaskError::StoppedPrematurely(snapshot.name.clone())));
                return;
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    shared.finished.store(true, Ordering::SeqCst);
    snapshot.remaining_ms = 0;
    snapshot.running = false;

    let hook_error = shared.fire_hook(&snapshot);
    debug!(task_id = snapshot.id, task = %snapshot.name, "task finished");
    let _ = done.send(Ok(TaskOutcome { hook_error }));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
