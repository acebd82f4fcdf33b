//! Child process execution shared by the CLI-backed adapters.
//!
//! Every command runs with `kill_on_drop`, so dropping the future on
//! cancellation also stops the child.

use provision::error::{AdapterError, AdapterErrorKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// stderr fragments that mean "try again later".
const TRANSIENT_MARKERS: [&str; 9] = [
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake timeout",
    "temporary failure in name resolution",
    "too many requests",
    "rate limit",
    "503 service unavailable",
    "the server is currently unable to handle the request",
];

pub fn is_transient_stderr(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// A command line to run.
#[derive(Debug, Clone)]
pub struct Exec {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    stdin: Option<String>,
}

impl Exec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Short description for logs and errors. Arguments are left out since
    /// they may carry tokens.
    pub fn describe(&self) -> String {
        let program = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());
        match self.args.first() {
            Some(sub) if !sub.starts_with('-') => format!("{} {}", program, sub),
            _ => program,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run to completion and return stdout. Non-zero exits become
    /// `command-failed` (or `transient` for known network noise).
    pub async fn output(&self, cancel: &CancellationToken) -> Result<String, AdapterError> {
        let what = self.describe();
        tracing::debug!("[Exec] Running {}", what);

        let mut child = self.command().spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AdapterError::new(
                AdapterErrorKind::NotFound,
                format!("{} is not installed or not on PATH", self.program.display()),
            ),
            _ => AdapterError::new(
                AdapterErrorKind::CommandFailed,
                format!("failed to start {}: {}", what, e),
            ),
        })?;

        if let (Some(input), Some(mut pipe)) = (&self.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(|e| {
                AdapterError::new(
                    AdapterErrorKind::CommandFailed,
                    format!("failed to write stdin of {}: {}", what, e),
                )
            })?;
        }

        let output = tokio::select! {
            result = child.wait_with_output() => result.map_err(|e| {
                AdapterError::new(AdapterErrorKind::CommandFailed, format!("{}: {}", what, e))
            })?,
            _ = cancel.cancelled() => {
                tracing::info!("[Exec] Cancelled {}", what);
                return Err(AdapterError::cancelled(&what));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!("[Exec] {} exited with {}", what, output.status);
        if is_transient_stderr(&stderr) {
            return Err(AdapterError::transient(format!("{} failed", what)).with_stderr(&stderr));
        }
        Err(AdapterError::command_failed(&what, &stderr))
    }

    /// Spawn without waiting; the caller owns the child.
    pub fn spawn(&self) -> Result<tokio::process::Child, AdapterError> {
        self.command().spawn().map_err(|e| {
            AdapterError::new(
                AdapterErrorKind::CommandFailed,
                format!("failed to start {}: {}", self.describe(), e),
            )
        })
    }
}
