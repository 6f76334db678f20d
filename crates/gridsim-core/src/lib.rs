//! gridsim-core — the node task-lifecycle engine.
//!
//! Provides the building blocks the scheduler composes:
//!
//! - **`class`** — closed set of workload capability tags (`generic` is a wildcard)
//! - **`task`** — a unit of synthetic work with a timed countdown
//! - **`node`** — capacity-bounded execution unit with a 4-state lifecycle
//! - **`audit`** — append-only, timestamped event trails
//! - **`config`** — `gridsim.toml` parsing

pub mod audit;
pub mod class;
pub mod config;
pub mod error;
pub mod node;
pub mod task;

pub use audit::{AuditLog, LogEntry};
pub use class::WorkloadClass;
pub use config::GridConfig;
pub use error::{CoreError, CoreResult};
pub use node::{AdmissionError, Node, NodeId, NodeSnapshot, NodeState};
pub use task::{CompletionHook, Task, TaskCompletion, TaskError, TaskOutcome, TaskSnapshot};
