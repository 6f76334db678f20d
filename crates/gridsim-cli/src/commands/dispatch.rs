//! Execute parsed commands against the scheduler's public surface.

use std::fmt::Write as _;

use gridsim_core::{NodeSnapshot, Task};
use gridsim_scheduler::Scheduler;

use super::parse::{Command, HELP};

/// What the shell should do after a command.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Print this text and keep reading.
    Continue(String),
    Exit,
}

/// Run one command. Errors are reported to the user, never fatal.
pub async fn execute(scheduler: &Scheduler, command: Command) -> anyhow::Result<Outcome> {
    let output = match command {
        Command::AddNode {
            name,
            cpu_cores,
            class,
        } => {
            let id = scheduler.create_node(&name, cpu_cores, class).await?;
            format!("node '{name}' created with id {id}")
        }
        Command::AddTask {
            name,
            duration_secs,
            cpu_cores,
            class,
        } => {
            let task = Task::with_seconds(&name, duration_secs, cpu_cores, class)?;
            scheduler.enqueue_task(task).await?;
            format!(
                "task '{name}' queued ({} pending)",
                scheduler.pending_len().await
            )
        }
        Command::SetState { node, state } => {
            let id = resolve(scheduler, &node).await;
            scheduler.set_node_state(&id, state).await?.join("\n")
        }
        Command::Repurpose {
            node,
            class,
            hierarchical,
        } => {
            let id = resolve(scheduler, &node).await;
            scheduler
                .repurpose_node(&id, class, hierarchical)
                .await?
                .join("\n")
        }
        Command::Attach { parent, child } => {
            let parent_id = resolve(scheduler, &parent).await;
            let child_id = resolve(scheduler, &child).await;
            scheduler.attach_child(&parent_id, &child_id).await?;
            format!("'{child}' attached under '{parent}'")
        }
        Command::RemoveNode { node, force } => {
            let id = resolve(scheduler, &node).await;
            scheduler.remove_node(&id, force).await?;
            format!("node '{node}' removed")
        }
        Command::ProcessQueue => {
            let report = scheduler.process_queue().await;
            if report.is_empty() {
                "queue is empty".to_string()
            } else {
                let mut out = String::new();
                for a in &report.assigned {
                    let _ = writeln!(out, "assigned '{}' -> {} as #{}", a.task, a.node_name, a.task_id);
                }
                for name in &report.unmatched {
                    let _ = writeln!(out, "no suitable node for '{name}'");
                }
                for name in &report.failed {
                    let _ = writeln!(out, "admission failed for '{name}', left queued");
                }
                out.trim_end().to_string()
            }
        }
        Command::Status { node, json } => {
            let nodes = match node {
                Some(node) => {
                    let id = resolve(scheduler, &node).await;
                    match scheduler.node(&id).await {
                        Some(snapshot) => vec![snapshot],
                        None => anyhow::bail!("node '{node}' not found"),
                    }
                }
                None => scheduler.nodes().await,
            };
            if json {
                serde_json::to_string_pretty(&nodes)?
            } else {
                render_status(&nodes, scheduler.pending_len().await)
            }
        }
        Command::Queue => {
            let pending = scheduler.pending().await;
            if pending.is_empty() {
                "queue is empty".to_string()
            } else {
                pending
                    .iter()
                    .enumerate()
                    .map(|(i, t)| format!("{:>3}. {t}", i + 1))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::Log { node } => {
            let entries = match node {
                Some(node) => {
                    let id = resolve(scheduler, &node).await;
                    match scheduler.node_handle(&id).await {
                        Some(handle) => handle.logs().await,
                        None => anyhow::bail!("node '{node}' not found"),
                    }
                }
                None => scheduler.log().await,
            };
            entries
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        }
        Command::ClearLog => {
            scheduler.clear_log().await;
            "log cleared".to_string()
        }
        Command::Sleep { duration } => {
            tokio::time::sleep(duration).await;
            String::new()
        }
        Command::Help => HELP.to_string(),
        Command::Exit => return Ok(Outcome::Exit),
    };

    Ok(Outcome::Continue(output))
}

/// Map a name to an id; unknown references pass through so the
/// scheduler records the miss.
async fn resolve(scheduler: &Scheduler, node: &str) -> String {
    scheduler
        .resolve(node)
        .await
        .unwrap_or_else(|| node.to_string())
}

fn render_status(nodes: &[NodeSnapshot], pending: usize) -> String {
    let mut out = String::new();
    if nodes.is_empty() {
        out.push_str("no nodes\n");
    }
    for node in nodes {
        let _ = writeln!(
            out,
            "{:<12} {:<8} {:<15} {:<8} {}/{} cores busy, {} task(s){}",
            node.name,
            node.id,
            node.state.to_string(),
            node.class.to_string(),
            node.busy_cores,
            node.cpu_cores,
            node.tasks.len(),
            if node.draining { ", draining" } else { "" }
        );
        for task in &node.tasks {
            let _ = writeln!(out, "    {task}");
        }
    }
    let _ = write!(out, "{pending} task(s) pending");
    out
}
