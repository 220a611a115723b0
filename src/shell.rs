//! Host shell command execution.
//!
//! Module tests, preparer steps and device feature queries all run as shell
//! scripts on the host. [`ShellCommand`] describes one script, [`run`]
//! executes it through the configured shell and captures its output.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tracing::debug;

/// Errors that prevent a command from producing an exit status.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Failed to spawn '{script}': {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{script}' timed out after {secs}s")]
    Timeout { script: String, secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A script to run with `<shell> -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    pub script: String,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code; `-1` if the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, trimmed.
    pub fn combined_output(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// Runs `cmd` with `shell -c` and waits for it, honoring its timeout.
///
/// A timed-out child is killed.
pub async fn run(shell: &str, cmd: &ShellCommand) -> Result<ExecResult, ShellError> {
    let mut process = tokio::process::Command::new(shell);
    process.arg("-c").arg(&cmd.script);
    for (key, value) in &cmd.env {
        process.env(key, value);
    }
    if let Some(dir) = &cmd.working_dir {
        process.current_dir(dir);
    }
    process.stdin(Stdio::null());
    process.stdout(Stdio::piped());
    process.stderr(Stdio::piped());
    process.kill_on_drop(true);

    debug!("Running: {} -c {:?}", shell, cmd.script);
    let start = Instant::now();
    let child = process.spawn().map_err(|source| ShellError::Spawn {
        script: cmd.script.clone(),
        source,
    })?;

    let output = match cmd.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ShellError::Timeout {
                script: cmd.script.clone(),
                secs: limit.as_secs(),
            })??,
        None => child.wait_with_output().await?,
    };

    Ok(ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: start.elapsed(),
    })
}
