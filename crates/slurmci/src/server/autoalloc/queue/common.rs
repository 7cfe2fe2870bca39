use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::server::autoalloc::AutoAllocResult;
use crate::server::autoalloc::queue::CommandOutput;

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: output.stdout.to_str_lossy().into_owned(),
            stderr: output.stderr.to_str_lossy().into_owned(),
        }
    }
}

/// The spawned process is killed if the returned command (or its future) is dropped.
pub fn create_command(program: &Path, arguments: &[String]) -> Command {
    let mut command = Command::new(program);
    command.args(arguments);
    command.stdin(Stdio::null());
    command.kill_on_drop(true);
    command
}

/// Runs the command to completion and captures its output.
/// Fails if the command cannot be started or if it does not finish within `timeout`.
pub async fn run_command(
    mut command: Command,
    program: &str,
    timeout: Duration,
) -> AutoAllocResult<CommandOutput> {
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "{program} did not finish in {}",
                humantime::format_duration(timeout)
            )
        })?
        .with_context(|| format!("{program} start failed"))?;
    Ok(output.into())
}

pub fn check_command_output(output: &CommandOutput) -> AutoAllocResult<()> {
    if !output.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            output.exit_code.unwrap_or(-1),
            output.stderr.trim(),
            output.stdout.trim()
        ));
    }
    Ok(())
}
