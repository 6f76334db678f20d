//! Line parser for shell commands.
//!
//! One command per line, whitespace separated. Node arguments accept a
//! node name or id.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use gridsim_core::{NodeState, WorkloadClass};

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddNode {
        name: String,
        cpu_cores: u32,
        class: WorkloadClass,
    },
    AddTask {
        name: String,
        duration_secs: f64,
        cpu_cores: i64,
        class: WorkloadClass,
    },
    SetState {
        node: String,
        state: NodeState,
    },
    Repurpose {
        node: String,
        class: WorkloadClass,
        hierarchical: bool,
    },
    Attach {
        parent: String,
        child: String,
    },
    RemoveNode {
        node: String,
        force: bool,
    },
    ProcessQueue,
    Status {
        node: Option<String>,
        json: bool,
    },
    Queue,
    Log {
        node: Option<String>,
    },
    ClearLog,
    Sleep {
        duration: Duration,
    },
    Help,
    Exit,
}

pub const HELP: &str = "\
commands:
  add_node <name> <cpu_cores> [class]
  add_task <name> <duration_secs> <cpu_cores> [class]
  set_state <node> <active|inactive|maintenance|decommissioned>
  repurpose <node> <class> [--hierarchical]
  attach <parent> <child>
  remove_node <node> [--force]
  process_queue
  status [node] [--json]
  queue
  log [node]
  clear_log
  sleep <secs>
  help
  exit
classes: generic, compute, storage, memory, network, gpu";

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| anyhow!("empty command"))?
            .to_ascii_lowercase();

        let (flags, args): (Vec<&str>, Vec<&str>) = words.partition(|w| w.starts_with("--"));
        let has_flag = |name: &str| flags.iter().any(|f| f.trim_start_matches("--") == name);
        for flag in &flags {
            let flag = flag.trim_start_matches("--");
            if !matches!(flag, "force" | "hierarchical" | "json") {
                bail!("unknown flag --{flag}");
            }
        }

        let command = match verb.as_str() {
            "add_node" => {
                expect_args(&verb, &args, 2, 3)?;
                Command::AddNode {
                    name: args[0].to_string(),
                    cpu_cores: args[1]
                        .parse()
                        .with_context(|| format!("cpu_cores must be a positive integer, got '{}'", args[1]))?,
                    class: optional_class(args.get(2))?,
                }
            }
            "add_task" => {
                expect_args(&verb, &args, 3, 4)?;
                Command::AddTask {
                    name: args[0].to_string(),
                    duration_secs: args[1]
                        .parse()
                        .with_context(|| format!("duration must be a number of seconds, got '{}'", args[1]))?,
                    cpu_cores: args[2]
                        .parse()
                        .with_context(|| format!("cpu_cores must be an integer, got '{}'", args[2]))?,
                    class: optional_class(args.get(3))?,
                }
            }
            "set_state" => {
                expect_args(&verb, &args, 2, 2)?;
                Command::SetState {
                    node: args[0].to_string(),
                    state: args[1].parse()?,
                }
            }
            "repurpose" => {
                expect_args(&verb, &args, 2, 2)?;
                Command::Repurpose {
                    node: args[0].to_string(),
                    class: args[1].parse()?,
                    hierarchical: has_flag("hierarchical"),
                }
            }
            "attach" => {
                expect_args(&verb, &args, 2, 2)?;
                Command::Attach {
                    parent: args[0].to_string(),
                    child: args[1].to_string(),
                }
            }
            "remove_node" => {
                expect_args(&verb, &args, 1, 1)?;
                Command::RemoveNode {
                    node: args[0].to_string(),
                    force: has_flag("force"),
                }
            }
            "process_queue" => {
                expect_args(&verb, &args, 0, 0)?;
                Command::ProcessQueue
            }
            "status" => {
                expect_args(&verb, &args, 0, 1)?;
                Command::Status {
                    node: args.first().map(|s| s.to_string()),
                    json: has_flag("json"),
                }
            }
            "queue" => Command::Queue,
            "log" => {
                expect_args(&verb, &args, 0, 1)?;
                Command::Log {
                    node: args.first().map(|s| s.to_string()),
                }
            }
            "clear_log" => Command::ClearLog,
            "sleep" => {
                expect_args(&verb, &args, 1, 1)?;
                let secs: f64 = args[0]
                    .parse()
                    .with_context(|| format!("sleep takes seconds, got '{}'", args[0]))?;
                if !secs.is_finite() || secs < 0.0 {
                    bail!("sleep takes a non-negative number of seconds");
                }
                let duration = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("sleep duration {secs}s is out of range"))?;
                Command::Sleep { duration }
            }
            "help" | "?" => Command::Help,
            "exit" | "quit" => Command::Exit,
            other => bail!("unknown command '{other}' (try 'help')"),
        };

        Ok(command)
    }
}

fn expect_args(verb: &str, args: &[&str], min: usize, max: usize) -> anyhow::Result<()> {
    if args.len() < min || args.len() > max {
        if min == max {
            bail!("{verb} takes {min} argument(s), got {}", args.len());
        }
        bail!("{verb} takes {min} to {max} arguments, got {}", args.len());
    }
    Ok(())
}

fn optional_class(arg: Option<&&str>) -> anyhow::Result<WorkloadClass> {
    match arg {
        Some(s) => Ok(s.parse()?),
        None => Ok(WorkloadClass::Generic),
    }
}
