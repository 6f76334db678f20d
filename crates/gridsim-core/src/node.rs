//! Node — a capacity-bounded execution unit with a lifecycle state.
//!
//! A node admits tasks while `active`, tracks their combined core demand
//! in `busy_cores`, and reclaims that capacity when each task settles.
//! State transitions that leave `active`/`inactive` first drain the tasks
//! in flight when the transition began.
//!
//! # Lifecycle
//!
//! ```text
//!            ┌──────────── set ────────────┐
//!            ▼                             │
//!        active ──drain──► inactive ───────┘
//!          │  \                 │
//!          │   drain            drain
//!          │     ▼              ▼
//!          │   maintenance ◄────┘
//!          │        │
//!          └─drain──┴──drain──► decommissioned (terminal)
//! ```
//!
//! Every in-flight task has a settle continuation that removes it from
//! the task set, releases its cores, fires the completion hook (natural
//! completion only) and then flips a `watch` flag. Drains wait on those
//! flags, so a transition never takes effect while any of its snapshotted
//! tasks still hold capacity.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, LogEntry};
use crate::class::WorkloadClass;
use crate::error::{CoreError, CoreResult};
use crate::task::{invoke_hook, CompletionHook, Task, TaskCompletion, TaskSnapshot};

/// Unique identifier for a node, generated by the scheduler.
pub type NodeId = String;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Active,
    Inactive,
    Maintenance,
    Decommissioned,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Active => "active",
            NodeState::Inactive => "inactive",
            NodeState::Maintenance => "maintenance",
            NodeState::Decommissioned => "decommissioned",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(NodeState::Active),
            "inactive" => Ok(NodeState::Inactive),
            "maintenance" => Ok(NodeState::Maintenance),
            "decommissioned" => Ok(NodeState::Decommissioned),
            other => Err(CoreError::InvalidArgument(format!(
                "unknown node state '{other}' (expected active, inactive, maintenance or decommissioned)"
            ))),
        }
    }
}

/// What a requested state change requires.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    NoOp,
    Set,
    DrainThenSet,
    Rejected(String),
}

fn plan_transition(from: NodeState, to: NodeState) -> Transition {
    use NodeState::*;

    match (from, to) {
        (a, b) if a == b => Transition::NoOp,
        (Decommissioned, _) => {
            Transition::Rejected(format!("cannot move decommissioned node to {to}"))
        }
        (Maintenance, Active) => {
            Transition::Rejected("cannot activate from maintenance".to_string())
        }
        (Maintenance, Inactive) => {
            Transition::Rejected("cannot move from maintenance to inactive".to_string())
        }
        (Inactive, Active) => Transition::Set,
        _ => Transition::DrainThenSet,
    }
}

/// An admission was refused; the task is handed back untouched.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct AdmissionError {
    pub reason: CoreError,
    pub task: Task,
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub cpu_cores: u32,
    pub busy_cores: u32,
    pub available_cores: u32,
    pub state: NodeState,
    pub class: WorkloadClass,
    pub tasks: Vec<TaskSnapshot>,
    pub children: Vec<NodeId>,
    pub draining: bool,
}

/// A task admitted to this node.
struct InFlight {
    task: Task,
    /// Flips to `true` once the settle continuation has released the task.
    settled: watch::Receiver<bool>,
}

struct NodeInner {
    state: NodeState,
    class: WorkloadClass,
    busy_cores: u32,
    tasks: BTreeMap<u64, InFlight>,
    /// Highest task id ever issued; never reused.
    last_task_id: u64,
    draining: bool,
    children: Vec<Node>,
    logs: AuditLog,
}

impl NodeInner {
    /// Record into the node trail and the caller's line buffer.
    fn note(&mut self, lines: &mut Vec<String>, message: String) {
        self.logs.record(message.clone());
        lines.push(message);
    }
}

/// Shared handle to a simulated compute node.
///
/// Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    cpu_cores: u32,
    /// Countdown granularity for admitted tasks.
    tick: Duration,
    inner: Arc<Mutex<NodeInner>>,
}

impl Node {
    /// Create an `active` node.
    pub fn new(
        id: impl Into<NodeId>,
        name: impl Into<String>,
        cpu_cores: u32,
        class: WorkloadClass,
        tick: Duration,
    ) -> CoreResult<Self> {
        let name = name.into();
        if cpu_cores == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "node '{name}': cpu_cores must be positive"
            )));
        }
        if tick.is_zero() {
            return Err(CoreError::InvalidArgument(
                "countdown tick must be non-zero".to_string(),
            ));
        }

        let mut logs = AuditLog::new();
        logs.record(format!("node created with {cpu_cores} cores, class {class}"));

        Ok(Self {
            id: id.into(),
            name,
            cpu_cores,
            tick,
            inner: Arc::new(Mutex::new(NodeInner {
                state: NodeState::Active,
                class,
                busy_cores: 0,
                tasks: BTreeMap::new(),
                last_task_id: 0,
                draining: false,
                children: Vec::new(),
                logs,
            })),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu_cores(&self) -> u32 {
        self.cpu_cores
    }

    pub async fn state(&self) -> NodeState {
        self.inner.lock().await.state
    }

    pub async fn class(&self) -> WorkloadClass {
        self.inner.lock().await.class
    }

    pub async fn busy_cores(&self) -> u32 {
        self.inner.lock().await.busy_cores
    }

    pub async fn available_cores(&self) -> u32 {
        self.cpu_cores - self.inner.lock().await.busy_cores
    }

    pub async fn task_count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    pub async fn logs(&self) -> Vec<LogEntry> {
        self.inner.lock().await.logs.entries().to_vec()
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        let inner = self.inner.lock().await;
        NodeSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            cpu_cores: self.cpu_cores,
            busy_cores: inner.busy_cores,
            available_cores: self.cpu_cores - inner.busy_cores,
            state: inner.state,
            class: inner.class,
            tasks: inner.tasks.values().map(|f| f.task.snapshot()).collect(),
            children: inner.children.iter().map(|c| c.id.clone()).collect(),
            draining: inner.draining,
        }
    }

    /// Whether this node could admit `task` right now. No side effects.
    pub async fn can_accept(&self, task: &Task) -> bool {
        let inner = self.inner.lock().await;
        inner.state == NodeState::Active
            && inner.class.is_compatible(task.class())
            && self.cpu_cores - inner.busy_cores >= task.cpu_cores()
    }

    /// Admit and start a task. Returns the node-local task id.
    ///
    /// On rejection the task is returned inside the error so the caller
    /// can keep it queued.
    pub async fn add_task(&self, mut task: Task) -> Result<u64, AdmissionError> {
        let mut inner = self.inner.lock().await;

        if inner.state != NodeState::Active {
            let reason = CoreError::NodeNotActive {
                node: self.name.clone(),
                state: inner.state.to_string(),
            };
            inner.logs.record(format!("rejected task '{}': {reason}", task.name()));
            return Err(AdmissionError { reason, task });
        }

        let available = self.cpu_cores - inner.busy_cores;
        if task.cpu_cores() > available {
            let reason = CoreError::InsufficientCapacity {
                node: self.name.clone(),
                requested: task.cpu_cores(),
                available,
            };
            inner.logs.record(format!("rejected task '{}': {reason}", task.name()));
            return Err(AdmissionError { reason, task });
        }

        if task.is_started() {
            let reason = CoreError::AlreadyRunning(task.name().to_string());
            return Err(AdmissionError { reason, task });
        }

        let task_id = inner.last_task_id + 1;
        task.set_id(task_id);
        // Fired by the settle continuation once the cores are released.
        let hook = task.take_on_complete();
        let completion = match task.start(self.tick) {
            Ok(completion) => completion,
            Err(reason) => {
                task.set_id(0);
                task.restore_on_complete(hook);
                return Err(AdmissionError { reason, task });
            }
        };

        inner.last_task_id = task_id;
        inner.busy_cores += task.cpu_cores();
        let message = format!(
            "task #{task_id} '{}' admitted ({} cores, {}/{} busy)",
            task.name(),
            task.cpu_cores(),
            inner.busy_cores,
            self.cpu_cores
        );
        inner.logs.record(message);
        info!(
            node_id = %self.id,
            task_id,
            task = %task.name(),
            cores = task.cpu_cores(),
            busy = inner.busy_cores,
            "task admitted"
        );

        let (settled_tx, settled_rx) = watch::channel(false);
        inner.tasks.insert(
            task_id,
            InFlight {
                task,
                settled: settled_rx,
            },
        );

        tokio::spawn(settle_task(
            Arc::clone(&self.inner),
            self.id.clone(),
            task_id,
            completion,
            hook,
            settled_tx,
        ));

        Ok(task_id)
    }

    /// Register a sub-node for hierarchical repurposing.
    pub async fn add_child(&self, child: Node) -> CoreResult<()> {
        if child.id == self.id {
            return Err(CoreError::InvalidArgument(format!(
                "node '{}' cannot be its own child",
                self.name
            )));
        }

        let mut inner = self.inner.lock().await;
        if inner.children.iter().any(|c| c.id == child.id) {
            return Ok(());
        }
        inner
            .logs
            .record(format!("attached child '{}' ({})", child.name, child.id));
        inner.children.push(child);
        Ok(())
    }

    /// Forget a sub-node. Returns whether it was attached.
    pub async fn remove_child(&self, child_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.children.len();
        inner.children.retain(|c| c.id != child_id);
        let removed = inner.children.len() != before;
        if removed {
            inner.logs.record(format!("detached child {child_id}"));
        }
        removed
    }

    /// Change the node's workload class, optionally down the child tree.
    ///
    /// Decommissioned nodes refuse and their subtree is left alone. Each
    /// node is visited at most once, so cyclic child links are harmless.
    pub async fn repurpose(&self, class: WorkloadClass, hierarchical: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([self.clone()]);

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node.id.clone()) {
                continue;
            }

            let prefix = if node.id == self.id {
                String::new()
            } else {
                format!("child '{}': ", node.name)
            };

            let mut inner = node.inner.lock().await;
            let mut produced = Vec::new();
            if inner.state == NodeState::Decommissioned {
                inner.note(
                    &mut produced,
                    "repurpose rejected: node is decommissioned".to_string(),
                );
                warn!(node_id = %node.id, "repurpose rejected on decommissioned node");
            } else {
                let previous = inner.class;
                inner.class = class;
                inner.note(&mut produced, format!("class changed {previous} -> {class}"));
                info!(node_id = %node.id, from = %previous, to = %class, "node repurposed");
                if hierarchical {
                    queue.extend(inner.children.iter().cloned());
                }
            }
            drop(inner);

            lines.extend(produced.into_iter().map(|l| format!("{prefix}{l}")));
        }

        lines
    }

    /// Request a state change. Never fails; every outcome is a log line.
    ///
    /// Transitions that require draining suspend until each task in flight
    /// when the drain began has settled. Tasks admitted during the drain
    /// abort a move to `inactive`/`maintenance`; a move to `decommissioned`
    /// force-clears them instead.
    pub async fn set_state(&self, target: NodeState) -> Vec<String> {
        let mut lines = Vec::new();

        let (from, waiters) = {
            let mut inner = self.inner.lock().await;
            let from = inner.state;

            match plan_transition(from, target) {
                Transition::NoOp => {
                    inner.note(&mut lines, format!("already {target}, nothing to do"));
                    return lines;
                }
                Transition::Rejected(reason) => {
                    inner.note(&mut lines, format!("transition {from} -> {target} rejected: {reason}"));
                    warn!(node_id = %self.id, %from, to = %target, %reason, "transition rejected");
                    return lines;
                }
                Transition::Set => {
                    inner.state = target;
                    inner.note(&mut lines, format!("state changed {from} -> {target}"));
                    info!(node_id = %self.id, %from, to = %target, "node state changed");
                    return lines;
                }
                Transition::DrainThenSet => {}
            }

            if inner.draining {
                inner.note(
                    &mut lines,
                    format!("transition {from} -> {target} rejected: another transition is already in progress"),
                );
                return lines;
            }

            inner.draining = true;
            let waiters: Vec<_> = inner.tasks.values().map(|f| f.settled.clone()).collect();
            inner.note(
                &mut lines,
                format!("draining {} in-flight task(s) before {from} -> {target}", waiters.len()),
            );
            debug!(node_id = %self.id, in_flight = waiters.len(), "drain started");
            (from, waiters)
        };

        for mut settled in waiters {
            // A dropped sender means the continuation is gone; treat as settled.
            let _ = settled.wait_for(|done| *done).await;
        }

        let mut inner = self.inner.lock().await;
        inner.draining = false;

        if inner.state == NodeState::Decommissioned {
            let message = if target == NodeState::Decommissioned {
                format!("transition {from} -> {target} already completed by a forced decommission")
            } else {
                format!("transition {from} -> {target} abandoned: node was decommissioned during the drain")
            };
            inner.note(&mut lines, message);
            return lines;
        }

        let leftover = inner.tasks.len();
        if target == NodeState::Decommissioned {
            if leftover > 0 {
                for flight in inner.tasks.values() {
                    flight.task.dispose();
                }
                inner.tasks.clear();
                inner.note(
                    &mut lines,
                    format!("force-cleared {leftover} task(s) still present after drain"),
                );
                warn!(node_id = %self.id, leftover, "force-cleared tasks on decommission");
            }
            inner.busy_cores = 0;
        } else if leftover > 0 {
            inner.note(
                &mut lines,
                format!(
                    "transition {from} -> {target} aborted: {leftover} task(s) still running after drain"
                ),
            );
            warn!(node_id = %self.id, leftover, to = %target, "drain incomplete, transition aborted");
            return lines;
        }

        let previous = inner.state;
        inner.state = target;
        inner.note(&mut lines, format!("state changed {previous} -> {target}"));
        info!(node_id = %self.id, from = %previous, to = %target, "node state changed");
        lines
    }

    /// Dispose every in-flight task without waiting and decommission.
    ///
    /// Completion hooks of the disposed tasks never fire.
    pub async fn force_decommission(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut inner = self.inner.lock().await;

        let disposed = inner.tasks.len();
        for flight in inner.tasks.values() {
            flight.task.dispose();
        }
        inner.tasks.clear();
        inner.busy_cores = 0;

        let previous = inner.state;
        inner.state = NodeState::Decommissioned;
        inner.note(
            &mut lines,
            format!("force-decommissioned from {previous}: disposed {disposed} in-flight task(s)"),
        );
        warn!(node_id = %self.id, disposed, "node force-decommissioned");
        lines
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cpu_cores", &self.cpu_cores)
            .finish_non_exhaustive()
    }
}

/// Release a task once its countdown resolves, then fire its hook.
///
/// The hook runs without the node lock held and only for a natural
/// completion of a task that was still in flight; a forced clear or a
/// disposal drops it unfired.
async fn settle_task(
    inner: Arc<Mutex<NodeInner>>,
    node_id: NodeId,
    task_id: u64,
    completion: TaskCompletion,
    hook: Option<CompletionHook>,
    settled: watch::Sender<bool>,
) {
    let outcome = completion.await;

    let finished = {
        let mut inner = inner.lock().await;
        // Absent when a forced clear already released it.
        match inner.tasks.remove(&task_id) {
            Some(flight) => {
                let cores = flight.task.cpu_cores();
                inner.busy_cores = inner.busy_cores.saturating_sub(cores);

                match &outcome {
                    Ok(_) => {
                        let message = format!(
                            "task #{task_id} '{}' completed, released {cores} cores",
                            flight.task.name()
                        );
                        inner.logs.record(message);
                        info!(%node_id, task_id, cores, "task completed");
                        Some(flight.task.snapshot())
                    }
                    Err(e) => {
                        inner.logs.record(format!("task #{task_id} ended early: {e}"));
                        debug!(%node_id, task_id, error = %e, "task ended early");
                        None
                    }
                }
            }
            None => None,
        }
    };

    if let (Some(snapshot), Some(hook)) = (finished, hook) {
        if let Some(err) = invoke_hook(hook, &snapshot) {
            let message = format!(
                "completion hook of task #{task_id} '{}' failed: {err}",
                snapshot.name
            );
            inner.lock().await.logs.record(message);
        }
    }

    let _ = settled.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TICK: Duration = Duration::from_secs(1);

    fn node(cores: u32, class: WorkloadClass) -> Node {
        Node::new("n-1", "alpha", cores, class, TICK).unwrap()
    }

    fn task(name: &str, secs: u64, cores: u32) -> Task {
        Task::new(name, Duration::from_secs(secs), cores, WorkloadClass::Generic).unwrap()
    }

    fn counted(name: &str, secs: u64, cores: u32, fired: &Arc<AtomicUsize>) -> Task {
        let fired = Arc::clone(fired);
        task(name, secs, cores).with_on_complete(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    async fn assert_accounting(node: &Node) {
        let snap = node.snapshot().await;
        let sum: u32 = snap.tasks.iter().map(|t| t.cpu_cores).sum();
        assert_eq!(snap.busy_cores, sum);
        assert!(snap.busy_cores <= snap.cpu_cores);
    }

    #[test]
    fn transition_table() {
        use NodeState::*;

        assert_eq!(plan_transition(Active, Active), Transition::NoOp);
        assert_eq!(plan_transition(Active, Inactive), Transition::DrainThenSet);
        assert_eq!(plan_transition(Active, Maintenance), Transition::DrainThenSet);
        assert_eq!(plan_transition(Active, Decommissioned), Transition::DrainThenSet);

        assert_eq!(plan_transition(Inactive, Active), Transition::Set);
        assert_eq!(plan_transition(Inactive, Inactive), Transition::NoOp);
        assert_eq!(plan_transition(Inactive, Maintenance), Transition::DrainThenSet);
        assert_eq!(plan_transition(Inactive, Decommissioned), Transition::DrainThenSet);

        assert_eq!(
            plan_transition(Maintenance, Active),
            Transition::Rejected("cannot activate from maintenance".to_string())
        );
        assert!(matches!(plan_transition(Maintenance, Inactive), Transition::Rejected(_)));
        assert_eq!(plan_transition(Maintenance, Maintenance), Transition::NoOp);
        assert_eq!(plan_transition(Maintenance, Decommissioned), Transition::DrainThenSet);

        for to in [Active, Inactive, Maintenance] {
            assert!(matches!(plan_transition(Decommissioned, to), Transition::Rejected(_)));
        }
        assert_eq!(plan_transition(Decommissioned, Decommissioned), Transition::NoOp);
    }

    #[test]
    fn node_state_parses() {
        assert_eq!("Maintenance".parse::<NodeState>().unwrap(), NodeState::Maintenance);
        assert!("sleeping".parse::<NodeState>().is_err());
    }

    #[test]
    fn new_rejects_zero_cores() {
        let result = Node::new("n", "bad", 0, WorkloadClass::Generic, TICK);
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn admission_assigns_ids_and_tracks_capacity() {
        let node = node(4, WorkloadClass::Compute);

        let first = node.add_task(task("a", 5, 2)).await.unwrap();
        let second = node.add_task(task("b", 5, 1)).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(node.busy_cores().await, 3);
        assert_eq!(node.available_cores().await, 1);
        assert_accounting(&node).await;
    }

    #[tokio::test(start_paused = true)]
    async fn over_capacity_is_rejected_without_side_effects() {
        let node = node(2, WorkloadClass::Generic);
        node.add_task(task("a", 5, 1)).await.unwrap();

        let err = node.add_task(task("big", 5, 2)).await.unwrap_err();
        assert!(matches!(err.reason, CoreError::InsufficientCapacity { requested: 2, available: 1, .. }));
        assert_eq!(err.task.name(), "big");
        assert_eq!(err.task.id(), 0);
        assert!(!err.task.is_started());
        assert_eq!(node.busy_cores().await, 1);
        assert_eq!(node.task_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ids_never_repeat_after_completion() {
        let node = node(1, WorkloadClass::Generic);
        node.add_task(task("a", 1, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(node.task_count().await, 0);

        let next = node.add_task(task("b", 1, 1)).await.unwrap();
        assert_eq!(next, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_releases_capacity_and_fires_hook_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let node = node(4, WorkloadClass::Compute);
        node.add_task(counted("t", 5, 2, &fired)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(node.busy_cores().await, 2);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(node.busy_cores().await, 0);
        assert_eq!(node.task_count().await, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let logs = node.logs().await;
        assert!(logs.iter().any(|e| e.message.contains("completed, released 2 cores")));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_hook_does_not_corrupt_bookkeeping() {
        let node = node(2, WorkloadClass::Generic);
        let bad = task("bad", 1, 2).with_on_complete(|_| anyhow::bail!("hook exploded"));
        node.add_task(bad).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(node.busy_cores().await, 0);
        let logs = node.logs().await;
        assert!(logs.iter().any(|e| e.message.contains("hook exploded")));

        // Node keeps working.
        node.add_task(task("next", 1, 2)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn can_accept_checks_state_class_and_capacity() {
        let node = node(4, WorkloadClass::Compute);
        let compute = Task::new("c", Duration::from_secs(1), 2, WorkloadClass::Compute).unwrap();
        let storage = Task::new("s", Duration::from_secs(1), 2, WorkloadClass::Storage).unwrap();
        let generic = task("g", 1, 2);
        let huge = Task::new("h", Duration::from_secs(1), 8, WorkloadClass::Compute).unwrap();

        assert!(node.can_accept(&compute).await);
        assert!(!node.can_accept(&storage).await);
        assert!(node.can_accept(&generic).await);
        assert!(!node.can_accept(&huge).await);

        node.set_state(NodeState::Inactive).await;
        assert!(!node.can_accept(&compute).await);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_node_rejects_admission() {
        let node = node(4, WorkloadClass::Generic);
        node.set_state(NodeState::Inactive).await;

        let err = node.add_task(task("t", 1, 1)).await.unwrap_err();
        assert!(matches!(err.reason, CoreError::NodeNotActive { .. }));
        assert_eq!(node.busy_cores().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_in_flight_tasks() {
        let node = node(4, WorkloadClass::Generic);
        node.add_task(task("short", 2, 1)).await.unwrap();
        node.add_task(task("long", 4, 1)).await.unwrap();

        let draining = node.clone();
        let handle = tokio::spawn(async move { draining.set_state(NodeState::Maintenance).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(node.state().await, NodeState::Active);
        assert!(node.snapshot().await.draining);

        let lines = handle.await.unwrap();
        assert_eq!(node.state().await, NodeState::Maintenance);
        assert_eq!(node.busy_cores().await, 0);
        assert!(lines[0].contains("draining 2 in-flight task(s)"));
        assert_eq!(lines.last().unwrap(), "state changed active -> maintenance");
    }

    #[tokio::test(start_paused = true)]
    async fn decommission_returns_after_task_finishes() {
        let node = node(2, WorkloadClass::Generic);
        node.add_task(task("t", 1, 1)).await.unwrap();

        let lines = node.set_state(NodeState::Decommissioned).await;
        assert_eq!(node.state().await, NodeState::Decommissioned);
        assert_eq!(node.task_count().await, 0);
        assert_eq!(node.busy_cores().await, 0);
        assert!(lines.iter().any(|l| l.contains("active -> decommissioned")));
    }

    #[tokio::test(start_paused = true)]
    async fn task_admitted_during_drain_aborts_transition() {
        let node = node(4, WorkloadClass::Generic);
        node.add_task(task("first", 2, 1)).await.unwrap();

        let draining = node.clone();
        let handle = tokio::spawn(async move { draining.set_state(NodeState::Inactive).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        node.add_task(task("late", 10, 1)).await.unwrap();

        let lines = handle.await.unwrap();
        assert_eq!(node.state().await, NodeState::Active);
        assert!(lines.last().unwrap().contains("aborted: 1 task(s) still running"));
        assert_accounting(&node).await;
    }

    #[tokio::test(start_paused = true)]
    async fn decommission_force_clears_late_tasks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let node = node(4, WorkloadClass::Generic);
        node.add_task(task("first", 2, 1)).await.unwrap();

        let draining = node.clone();
        let handle = tokio::spawn(async move { draining.set_state(NodeState::Decommissioned).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        node.add_task(counted("late", 10, 2, &fired)).await.unwrap();

        let lines = handle.await.unwrap();
        assert_eq!(node.state().await, NodeState::Decommissioned);
        assert_eq!(node.busy_cores().await, 0);
        assert!(lines.iter().any(|l| l.contains("force-cleared 1 task(s)")));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(node.busy_cores().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_drain_is_rejected_while_first_runs() {
        let node = node(2, WorkloadClass::Generic);
        node.add_task(task("t", 3, 1)).await.unwrap();

        let draining = node.clone();
        let handle = tokio::spawn(async move { draining.set_state(NodeState::Inactive).await });
        tokio::time::sleep(Duration::from_millis(500)).await;

        let lines = node.set_state(NodeState::Maintenance).await;
        assert!(lines[0].contains("already in progress"));

        handle.await.unwrap();
        assert_eq!(node.state().await, NodeState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_decommission_overtakes_running_drain() {
        let fired = Arc::new(AtomicUsize::new(0));
        let node = node(2, WorkloadClass::Generic);
        node.add_task(counted("t", 5, 1, &fired)).await.unwrap();

        let draining = node.clone();
        let handle =
            tokio::spawn(async move { draining.set_state(NodeState::Decommissioned).await });
        tokio::time::sleep(Duration::from_millis(500)).await;

        node.force_decommission().await;
        let lines = handle.await.unwrap();

        assert_eq!(
            lines.last().unwrap(),
            "transition active -> decommissioned already completed by a forced decommission"
        );
        assert!(!lines.iter().any(|l| l.contains("decommissioned -> decommissioned")));
        assert_eq!(node.state().await, NodeState::Decommissioned);
        assert_eq!(node.busy_cores().await, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hook_fires_after_capacity_is_released() {
        let node = node(4, WorkloadClass::Generic);
        let seen = Arc::new(std::sync::Mutex::new(None));

        let watcher = node.clone();
        let seen_in_hook = Arc::clone(&seen);
        let observed = task("t", 2, 3).with_on_complete(move |snap| {
            let inner = watcher
                .inner
                .try_lock()
                .map_err(|_| anyhow::anyhow!("node lock held while hook runs"))?;
            *seen_in_hook.lock().unwrap() =
                Some((snap.id, inner.busy_cores, inner.tasks.contains_key(&snap.id)));
            Ok(())
        });
        node.add_task(observed).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*seen.lock().unwrap(), Some((1, 0, false)));
        let logs = node.logs().await;
        assert!(!logs.iter().any(|e| e.message.contains("hook")));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_completion_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let node = node(2, WorkloadClass::Generic);
        node.add_task(counted("t", 1, 1, &fired)).await.unwrap();

        node.set_state(NodeState::Inactive).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(node.state().await, NodeState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_transitions_leave_state_alone() {
        let node = node(2, WorkloadClass::Generic);
        node.set_state(NodeState::Maintenance).await;

        let lines = node.set_state(NodeState::Active).await;
        assert!(lines[0].contains("cannot activate from maintenance"));
        assert_eq!(node.state().await, NodeState::Maintenance);

        node.set_state(NodeState::Decommissioned).await;
        let lines = node.set_state(NodeState::Inactive).await;
        assert!(lines[0].contains("rejected"));
        assert_eq!(node.state().await, NodeState::Decommissioned);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_to_active_is_immediate() {
        let node = node(2, WorkloadClass::Generic);
        node.set_state(NodeState::Inactive).await;
        let lines = node.set_state(NodeState::Active).await;
        assert_eq!(lines, vec!["state changed inactive -> active".to_string()]);
        assert_eq!(node.state().await, NodeState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn force_decommission_skips_hooks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let node = node(4, WorkloadClass::Generic);
        node.add_task(counted("a", 5, 2, &fired)).await.unwrap();
        node.add_task(counted("b", 5, 1, &fired)).await.unwrap();

        let lines = node.force_decommission().await;
        assert!(lines[0].contains("disposed 2 in-flight task(s)"));
        assert_eq!(node.busy_cores().await, 0);
        assert_eq!(node.task_count().await, 0);
        assert_eq!(node.state().await, NodeState::Decommissioned);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(node.busy_cores().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hierarchical_repurpose_reaches_children() {
        let parent = node(4, WorkloadClass::Generic);
        let child = Node::new("n-2", "beta", 2, WorkloadClass::Generic, TICK).unwrap();
        let grandchild = Node::new("n-3", "gamma", 2, WorkloadClass::Generic, TICK).unwrap();
        child.add_child(grandchild.clone()).await.unwrap();
        parent.add_child(child.clone()).await.unwrap();
        // Cycle back to the root must not loop.
        grandchild.add_child(parent.clone()).await.unwrap();

        let lines = parent.repurpose(WorkloadClass::Storage, true).await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "child 'beta': class changed generic -> storage");
        for n in [&parent, &child, &grandchild] {
            assert_eq!(n.class().await, WorkloadClass::Storage);
        }

        parent.repurpose(WorkloadClass::Gpu, false).await;
        assert_eq!(parent.class().await, WorkloadClass::Gpu);
        assert_eq!(child.class().await, WorkloadClass::Storage);
    }

    #[tokio::test(start_paused = true)]
    async fn decommissioned_node_refuses_repurpose() {
        let node = node(2, WorkloadClass::Compute);
        node.set_state(NodeState::Decommissioned).await;

        let lines = node.repurpose(WorkloadClass::Storage, true).await;
        assert!(lines[0].contains("repurpose rejected"));
        assert_eq!(node.class().await, WorkloadClass::Compute);
    }

    #[tokio::test]
    async fn node_cannot_parent_itself() {
        let node = node(2, WorkloadClass::Generic);
        assert!(node.add_child(node.clone()).await.is_err());
    }
}
