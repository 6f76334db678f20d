//! Line-oriented session loop shared by `gridsim shell` and `gridsim run`.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use gridsim_scheduler::Scheduler;

use super::dispatch::{execute, Outcome};
use super::parse::Command;

const PROMPT: &str = "gridsim> ";

/// Read commands line by line until EOF or `exit`.
///
/// Blank lines and `#` comments are skipped. A failing command prints
/// `error: …` and the session continues. With `interactive` a prompt is
/// shown; otherwise each command is echoed before its output. Returns
/// the number of commands that failed.
pub async fn run_session<R, W>(
    scheduler: &Scheduler,
    reader: R,
    writer: &mut W,
    interactive: bool,
) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut failures = 0;

    loop {
        if interactive {
            writer.write_all(PROMPT.as_bytes()).await?;
            writer.flush().await?;
        }

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !interactive {
            writer.write_all(format!("> {line}\n").as_bytes()).await?;
        }

        let result = match line.parse::<Command>() {
            Ok(command) => execute(scheduler, command).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Outcome::Exit) => break,
            Ok(Outcome::Continue(text)) => {
                if !text.is_empty() {
                    writer.write_all(text.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
            }
            Err(e) => {
                failures += 1;
                debug!(command = line, error = %e, "command failed");
                writer.write_all(format!("error: {e:#}\n").as_bytes()).await?;
            }
        }
    }

    writer.flush().await?;
    Ok(failures)
}
