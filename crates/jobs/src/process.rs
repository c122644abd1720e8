//! External command execution.

use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};

/// Outcome of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was killed by a signal or timed out.
    pub code: Option<i32>,
    /// Stdout followed by stderr.
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool { self.code == Some(0) && !self.timed_out }

    /// Code to report as this process's own exit status.
    pub fn exit_code(&self) -> i32 {
        match self.code {
            Some(code) if !self.timed_out => code,
            _ => 1,
        }
    }
}

/// Run `argv` in `cwd` with extra environment variables.
///
/// Failing to spawn is an error. A nonzero exit or a timeout is not: it is reported in the
/// returned [`CommandOutput`]. On timeout the child is killed.
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    envs: &[(&str, String)],
    timeout: Duration,
) -> Result<CommandOutput> {
    let Some((program, args)) = argv.split_first() else {
        bail!("Empty command line");
    };
    tracing::debug!(program = %program, cwd = %cwd.display(), "Running command");
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("Failed to wait for {program}"))?,
        Err(_) => {
            tracing::warn!("{program} timed out after {}s", timeout.as_secs());
            return Ok(CommandOutput {
                code: None,
                output: format!("{program} timed out after {}s", timeout.as_secs()),
                timed_out: true,
            });
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    Ok(CommandOutput { code: output.status.code(), output: text, timed_out: false })
}

/// Short display name of a command line: the file name of its program.
pub fn command_name(argv: &[String]) -> String {
    argv.first()
        .map(|program| {
            Path::new(program)
                .file_name()
                .map_or_else(|| program.clone(), |name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_default()
}
