//! gridsim-scheduler — node registry and first-fit task matching.
//!
//! The `Scheduler` owns the node directory, a FIFO queue of pending
//! tasks and a global audit log. It:
//!
//! - Creates nodes with collision-checked short ids
//! - Matches queued tasks to the first eligible node in registry order
//! - Delegates state transitions and repurposing to nodes, folding their
//!   log lines into the audit log
//! - Optionally processes the queue on a fixed interval
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── nodes: Vec<Node> (registry order = first-fit scan order)
//!   ├── pending: VecDeque<Task> (FIFO)
//!   ├── IdGenerator (random tokens, rejects live ids)
//!   └── AuditLog (timestamped, append-only)
//! ```

pub mod error;
pub mod id;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use id::IdGenerator;
pub use scheduler::{Assignment, ProcessReport, Scheduler};
