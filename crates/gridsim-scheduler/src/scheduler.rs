//! Scheduler — node registry, pending queue, and first-fit matching.
//!
//! The `Scheduler` is the single entry point front ends drive:
//! - Creates and removes nodes (`create_node`, `remove_node`)
//! - Queues tasks and matches them to nodes (`enqueue_task`, `process_queue`)
//! - Delegates lifecycle changes to nodes (`set_node_state`, `repurpose_node`)
//! - Keeps a global, timestamped audit log of every mutation

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use gridsim_core::{
    AdmissionError, AuditLog, GridConfig, LogEntry, Node, NodeId, NodeSnapshot, NodeState, Task,
    TaskSnapshot, WorkloadClass,
};

use crate::error::{SchedulerError, SchedulerResult};
use crate::id::IdGenerator;

/// A task placed on a node during a queue pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub task: String,
    pub task_id: u64,
    pub node_id: NodeId,
    pub node_name: String,
}

/// Outcome of one `process_queue` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub assigned: Vec<Assignment>,
    /// Tasks no node could accept; still queued.
    pub unmatched: Vec<String>,
    /// Tasks whose admission failed after matching; still queued.
    pub failed: Vec<String>,
}

impl ProcessReport {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.unmatched.is_empty() && self.failed.is_empty()
    }
}

/// The scheduler owns the node registry and the pending task queue.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    /// Live nodes in registry order.
    nodes: Arc<RwLock<Vec<Node>>>,
    /// Tasks waiting for a node, FIFO.
    pending: Arc<Mutex<VecDeque<Task>>>,
    log: Arc<Mutex<AuditLog>>,
    ids: Arc<Mutex<IdGenerator>>,
    /// Countdown granularity handed to new nodes.
    tick: Duration,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new(tick: Duration) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(Vec::new())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            log: Arc::new(Mutex::new(AuditLog::new())),
            ids: Arc::new(Mutex::new(IdGenerator::default())),
            tick,
        }
    }

    /// Use a specific id generator (e.g., a seeded one).
    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = Arc::new(Mutex::new(ids));
        self
    }

    /// Build a scheduler from configuration and create its seed nodes.
    pub async fn from_config(config: &GridConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let scheduler = Self::new(config.scheduler.tick()?)
            .with_id_generator(IdGenerator::new(config.scheduler.id_length));

        for seed in &config.nodes {
            scheduler
                .create_node(&seed.name, seed.cpu_cores, seed.class)
                .await?;
        }
        Ok(scheduler)
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    // ── Nodes ───────────────────────────────────────────────────────

    /// Register a new `active` node. Returns its generated id.
    pub async fn create_node(
        &self,
        name: &str,
        cpu_cores: u32,
        class: WorkloadClass,
    ) -> SchedulerResult<NodeId> {
        let name = name.trim();
        if name.is_empty() {
            self.record("create_node rejected: node name must not be empty").await;
            return Err(SchedulerError::InvalidArgument(
                "node name must not be empty".to_string(),
            ));
        }
        if cpu_cores == 0 {
            self.record(format!("create_node '{name}' rejected: cpu_cores must be positive"))
                .await;
            return Err(SchedulerError::InvalidArgument(format!(
                "node '{name}': cpu_cores must be positive"
            )));
        }

        let node = {
            let mut nodes = self.nodes.write().await;
            if nodes.iter().any(|n| n.name() == name) {
                drop(nodes);
                self.record(format!("create_node rejected: a node named '{name}' already exists"))
                    .await;
                return Err(SchedulerError::DuplicateName(name.to_string()));
            }

            let live: HashSet<&str> = nodes.iter().map(|n| n.id()).collect();
            let id = self.ids.lock().await.generate(|candidate| live.contains(candidate));
            let node = Node::new(id, name, cpu_cores, class, self.tick)?;
            nodes.push(node.clone());
            node
        };

        info!(node_id = %node.id(), node_name = name, cpu_cores, %class, "node created");
        self.record(format!(
            "created node '{name}' ({}) with {cpu_cores} cores, class {class}",
            node.id()
        ))
        .await;
        Ok(node.id().to_string())
    }

    /// Remove a node from the registry.
    ///
    /// Without `force` the node is first driven to `decommissioned`, which
    /// drains its tasks. With `force` in-flight tasks are disposed without
    /// waiting and their completion hooks never fire.
    pub async fn remove_node(&self, id: &str, force: bool) -> SchedulerResult<()> {
        let node = self.require_node(id, "remove_node").await?;

        if force {
            let lines = node.force_decommission().await;
            self.fold(&node, lines).await;
        } else if node.state().await != NodeState::Decommissioned {
            let lines = node.set_state(NodeState::Decommissioned).await;
            self.fold(&node, lines).await;

            let state = node.state().await;
            if state != NodeState::Decommissioned {
                self.record(format!(
                    "remove_node '{}' ({}) aborted: node is still {state}",
                    node.name(),
                    node.id()
                ))
                .await;
                return Err(SchedulerError::TransitionRejected(format!(
                    "node {} could not be decommissioned (state: {state})",
                    node.id()
                )));
            }
        }

        let others: Vec<Node> = {
            let mut nodes = self.nodes.write().await;
            nodes.retain(|n| n.id() != node.id());
            nodes.clone()
        };
        for other in &others {
            other.remove_child(node.id()).await;
        }

        info!(node_id = %node.id(), force, "node removed");
        self.record(format!(
            "removed node '{}' ({}){}",
            node.name(),
            node.id(),
            if force { " (forced)" } else { "" }
        ))
        .await;
        Ok(())
    }

    /// Request a state change on a node, folding its log lines into the audit log.
    pub async fn set_node_state(
        &self,
        id: &str,
        target: NodeState,
    ) -> SchedulerResult<Vec<String>> {
        let node = self.require_node(id, "set_node_state").await?;
        let lines = node.set_state(target).await;
        self.fold(&node, lines.clone()).await;
        Ok(lines)
    }

    /// Change a node's class, optionally propagating to its children.
    pub async fn repurpose_node(
        &self,
        id: &str,
        class: WorkloadClass,
        hierarchical: bool,
    ) -> SchedulerResult<Vec<String>> {
        let node = self.require_node(id, "repurpose_node").await?;
        let lines = node.repurpose(class, hierarchical).await;
        self.fold(&node, lines.clone()).await;
        Ok(lines)
    }

    /// Make `child_id` a sub-node of `parent_id` for hierarchical repurposing.
    pub async fn attach_child(&self, parent_id: &str, child_id: &str) -> SchedulerResult<()> {
        let parent = self.require_node(parent_id, "attach_child").await?;
        let child = self.require_node(child_id, "attach_child").await?;

        if let Err(e) = parent.add_child(child.clone()).await {
            self.record(format!("attach_child rejected: {e}")).await;
            return Err(e.into());
        }
        self.record(format!(
            "attached '{}' ({}) under '{}' ({})",
            child.name(),
            child.id(),
            parent.name(),
            parent.id()
        ))
        .await;
        Ok(())
    }

    // ── Queue ───────────────────────────────────────────────────────

    /// Append a task to the pending queue.
    pub async fn enqueue_task(&self, task: Task) -> SchedulerResult<()> {
        if let Err(e) = task.validate() {
            self.record(format!("enqueue rejected: {e}")).await;
            return Err(SchedulerError::InvalidArgument(e.to_string()));
        }

        let message = format!(
            "queued task '{}' ({} cores, {}, {:.1}s)",
            task.name(),
            task.cpu_cores(),
            task.class(),
            task.duration().as_secs_f64()
        );
        let depth = {
            let mut pending = self.pending.lock().await;
            pending.push_back(task);
            pending.len()
        };
        debug!(depth, "task enqueued");
        self.record(message).await;
        Ok(())
    }

    /// Match queued tasks to nodes, first fit in registry order.
    ///
    /// Unmatched tasks and tasks whose admission fails stay queued in
    /// their original order. An empty queue is a no-op.
    pub async fn process_queue(&self) -> ProcessReport {
        let mut report = ProcessReport::default();
        let mut lines = Vec::new();

        {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return report;
            }

            let nodes: Vec<Node> = self.nodes.read().await.clone();
            let mut kept = VecDeque::with_capacity(pending.len());

            while let Some(task) = pending.pop_front() {
                let mut target = None;
                for node in &nodes {
                    if node.can_accept(&task).await {
                        target = Some(node);
                        break;
                    }
                }

                let name = task.name().to_string();
                let Some(node) = target else {
                    lines.push(format!(
                        "no suitable node for task '{name}' ({} cores, {}), left queued",
                        task.cpu_cores(),
                        task.class()
                    ));
                    report.unmatched.push(name);
                    kept.push_back(task);
                    continue;
                };

                if let Some(task) = admit(node, task, &mut lines, &mut report).await {
                    kept.push_back(task);
                }
            }

            *pending = kept;
        }

        info!(
            assigned = report.assigned.len(),
            unmatched = report.unmatched.len(),
            failed = report.failed.len(),
            "queue processed"
        );
        let mut log = self.log.lock().await;
        for line in lines {
            log.record(line);
        }
        report
    }

    /// Process the queue every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "queue loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.process_queue().await;
                    if !report.is_empty() {
                        debug!(assigned = report.assigned.len(), "periodic queue pass");
                    }
                }
                _ = shutdown.changed() => {
                    info!("queue loop shutting down");
                    break;
                }
            }
        }
    }

    // ── Read accessors ──────────────────────────────────────────────

    /// Snapshots of every live node, in registry order.
    pub async fn nodes(&self) -> Vec<NodeSnapshot> {
        let nodes: Vec<Node> = self.nodes.read().await.clone();
        let mut snapshots = Vec::with_capacity(nodes.len());
        for node in &nodes {
            snapshots.push(node.snapshot().await);
        }
        snapshots
    }

    pub async fn node(&self, id: &str) -> Option<NodeSnapshot> {
        let node = self.find(id).await?;
        Some(node.snapshot().await)
    }

    /// A handle to a live node, for observers that need its event trail.
    pub async fn node_handle(&self, id: &str) -> Option<Node> {
        self.find(id).await
    }

    /// Map a node name or id to its id.
    pub async fn resolve(&self, name_or_id: &str) -> Option<NodeId> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .find(|n| n.id() == name_or_id)
            .or_else(|| nodes.iter().find(|n| n.name() == name_or_id))
            .map(|n| n.id().to_string())
    }

    /// Snapshots of queued tasks, in FIFO order.
    pub async fn pending(&self) -> Vec<TaskSnapshot> {
        self.pending.lock().await.iter().map(Task::snapshot).collect()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn log(&self) -> Vec<LogEntry> {
        self.log.lock().await.entries().to_vec()
    }

    /// Empty the audit log, leaving a single entry noting the clear.
    pub async fn clear_log(&self) {
        let mut log = self.log.lock().await;
        let dropped = log.len();
        log.clear();
        log.record(format!("log cleared ({dropped} entries dropped)"));
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn find(&self, id: &str) -> Option<Node> {
        self.nodes.read().await.iter().find(|n| n.id() == id).cloned()
    }

    /// Look up a node, logging the miss.
    async fn require_node(&self, id: &str, op: &str) -> SchedulerResult<Node> {
        match self.find(id).await {
            Some(node) => Ok(node),
            None => {
                warn!(node_id = id, op, "node not found");
                self.record(format!("{op} failed: node '{id}' not found")).await;
                Err(SchedulerError::NodeNotFound(id.to_string()))
            }
        }
    }

    async fn record(&self, message: impl Into<String>) {
        self.log.lock().await.record(message);
    }

    /// Copy a node's log lines into the audit log, tagged with its identity.
    async fn fold(&self, node: &Node, lines: Vec<String>) {
        let mut log = self.log.lock().await;
        for line in lines {
            log.record(format!("node '{}' ({}): {line}", node.name(), node.id()));
        }
    }
}

/// Hand a matched task to its node. The task comes back when the node
/// refuses it, e.g. because its state changed after matching.
async fn admit(
    node: &Node,
    task: Task,
    lines: &mut Vec<String>,
    report: &mut ProcessReport,
) -> Option<Task> {
    let name = task.name().to_string();
    match node.add_task(task).await {
        Ok(task_id) => {
            lines.push(format!(
                "assigned task '{name}' to node '{}' ({}) as #{task_id}",
                node.name(),
                node.id()
            ));
            report.assigned.push(Assignment {
                task: name,
                task_id,
                node_id: node.id().to_string(),
                node_name: node.name().to_string(),
            });
            None
        }
        Err(AdmissionError { reason, task }) => {
            warn!(node_id = %node.id(), task = %name, error = %reason, "admission failed");
            lines.push(format!(
                "admission of task '{name}' to node '{}' failed: {reason}; left queued",
                node.name()
            ));
            report.failed.push(name);
            Some(task)
        }
    }
}
