//! Error types for provisioning operations.
//!
//! Adapters only classify failures ([`AdapterErrorKind`]); the runner reads
//! the [`ErrorCategory`] to decide between retry and abort, and the CLI maps
//! the final [`ProvisionError`] to a process exit code.

use crate::checkpoint::CheckpointError;
use crate::stage::StageId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process exit codes surfaced by the CLI.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// The install request was rejected before any effect ran.
    pub const VALIDATION: u8 = 1;
    /// A transient failure kept recurring until the retry budget ran out.
    pub const TRANSIENT_EXHAUSTED: u8 = 2;
    /// Permanent provisioning error (auth, precondition, terraform, timeout).
    pub const PROVISIONING: u8 = 3;
    /// Broken invariant such as a corrupted checkpoint file.
    pub const INTERNAL: u8 = 4;
    /// Interrupted by a signal.
    pub const CANCELLED: u8 = 130;
}

/// Error category: classifies a failure for the runner and the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Install request rejected before any effect. User fault.
    Validation,
    /// Credential or scope failure reported by an adapter. User fault.
    Auth,
    /// Required external resource missing or conflicting. User fault.
    Precondition,
    /// Network, rate limit, not-yet-ready. Retried by the runner.
    Transient,
    /// Terraform error, remote provisioning failure, expired timeout.
    Permanent,
    /// Broken invariant. Aborts with a distinct exit code.
    Internal,
    /// External cancellation.
    Cancelled,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Precondition => "precondition",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure kinds a capability adapter may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterErrorKind {
    /// The request failed a check only possible once the run started.
    InvalidRequest,
    CredentialsMissing,
    QuotaExceeded,
    ZoneNotFound,
    AuthInvalid,
    ScopeInsufficient,
    ResourceExists,
    NotFound,
    CloneFailed,
    TemplateInvalid,
    /// An external tool (terraform, kubectl, git) exited non-zero.
    CommandFailed,
    /// Remote state contradicts what the run recorded and needs manual repair.
    InconsistentState,
    Timeout,
    Transient,
    Cancelled,
}

impl AdapterErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            AdapterErrorKind::InvalidRequest => ErrorCategory::Validation,
            AdapterErrorKind::CredentialsMissing
            | AdapterErrorKind::AuthInvalid
            | AdapterErrorKind::ScopeInsufficient => ErrorCategory::Auth,
            AdapterErrorKind::QuotaExceeded
            | AdapterErrorKind::ZoneNotFound
            | AdapterErrorKind::ResourceExists
            | AdapterErrorKind::NotFound => ErrorCategory::Precondition,
            AdapterErrorKind::CloneFailed
            | AdapterErrorKind::TemplateInvalid
            | AdapterErrorKind::CommandFailed
            | AdapterErrorKind::InconsistentState
            | AdapterErrorKind::Timeout => ErrorCategory::Permanent,
            AdapterErrorKind::Transient => ErrorCategory::Transient,
            AdapterErrorKind::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdapterErrorKind::InvalidRequest => "invalid-request",
            AdapterErrorKind::CredentialsMissing => "credentials-missing",
            AdapterErrorKind::QuotaExceeded => "quota-exceeded",
            AdapterErrorKind::ZoneNotFound => "zone-not-found",
            AdapterErrorKind::AuthInvalid => "auth-invalid",
            AdapterErrorKind::ScopeInsufficient => "scope-insufficient",
            AdapterErrorKind::ResourceExists => "resource-exists",
            AdapterErrorKind::NotFound => "not-found",
            AdapterErrorKind::CloneFailed => "clone-failed",
            AdapterErrorKind::TemplateInvalid => "template-invalid",
            AdapterErrorKind::CommandFailed => "command-failed",
            AdapterErrorKind::InconsistentState => "inconsistent-state",
            AdapterErrorKind::Timeout => "timeout",
            AdapterErrorKind::Transient => "transient",
            AdapterErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure returned by every capability adapter method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
    /// Last lines of stderr for failures of external tools.
    pub stderr_tail: Option<String>,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr_tail: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Transient, message)
    }

    pub fn timeout(what: &str, after: Duration) -> Self {
        Self::new(
            AdapterErrorKind::Timeout,
            format!("{} not ready after {}s", what, after.as_secs()),
        )
    }

    pub fn cancelled(what: &str) -> Self {
        Self::new(AdapterErrorKind::Cancelled, format!("{} cancelled", what))
    }

    pub fn command_failed(command: &str, stderr: &str) -> Self {
        Self {
            kind: AdapterErrorKind::CommandFailed,
            message: format!("`{}` failed", command),
            stderr_tail: Some(stderr_tail(stderr, 20)),
        }
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr_tail = Some(stderr_tail(stderr, 20));
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn is_transient(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Keep the last `lines` lines of a tool's stderr.
pub fn stderr_tail(stderr: &str, lines: usize) -> String {
    let all: Vec<&str> = stderr.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// One rejected field of an install request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub problem: String,
}

/// Every missing or invalid field of an install request, reported at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid install request: {}", summarize(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    pub fn single(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            issues: vec![FieldIssue {
                field: field.into(),
                problem: problem.into(),
            }],
        }
    }

    pub fn mentions(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }
}

fn describe_stage(stage: &Option<StageId>) -> String {
    match stage {
        Some(stage) => format!("stage '{}'", stage),
        None => "reconcile".to_string(),
    }
}

fn summarize(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{}: {}", i.field, i.problem))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error type for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: StageId,
        #[source]
        source: AdapterError,
    },

    #[error("stage '{stage}' gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        stage: StageId,
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    #[error("stage '{stage}' timed out after {}s", .after.as_secs())]
    StageTimeout { stage: StageId, after: Duration },

    #[error("cancelled during {}", describe_stage(.stage))]
    Cancelled { stage: Option<StageId> },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("checkpoint store: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("cluster '{0}' is already installed; run reset before creating it again")]
    AlreadyComplete(String),

    #[error("cluster '{0}' has no completed installation")]
    NotInstalled(String),

    #[error("another run holds the lock at {0}")]
    Locked(PathBuf),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("cluster control plane unreachable for {0} consecutive polls")]
    Unreachable(u32),

    #[error("stage registry: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProvisionError::Validation(_) => ErrorCategory::Validation,
            ProvisionError::Stage { source, .. } | ProvisionError::Adapter(source) => {
                source.category()
            }
            ProvisionError::RetriesExhausted { .. } | ProvisionError::Unreachable(_) => {
                ErrorCategory::Transient
            }
            ProvisionError::StageTimeout { .. } | ProvisionError::ProvisioningFailed(_) => {
                ErrorCategory::Permanent
            }
            ProvisionError::Cancelled { .. } => ErrorCategory::Cancelled,
            ProvisionError::AlreadyComplete(_)
            | ProvisionError::NotInstalled(_)
            | ProvisionError::Locked(_) => ErrorCategory::Precondition,
            ProvisionError::Checkpoint(_) | ProvisionError::Registry(_) | ProvisionError::Io(_) => {
                ErrorCategory::Internal
            }
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.category() {
            ErrorCategory::Validation => exit_codes::VALIDATION,
            ErrorCategory::Transient => exit_codes::TRANSIENT_EXHAUSTED,
            ErrorCategory::Auth | ErrorCategory::Precondition | ErrorCategory::Permanent => {
                exit_codes::PROVISIONING
            }
            ErrorCategory::Internal => exit_codes::INTERNAL,
            ErrorCategory::Cancelled => exit_codes::CANCELLED,
        }
    }

    /// The stage the failure is attributed to, if any.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            ProvisionError::Stage { stage, .. }
            | ProvisionError::RetriesExhausted { stage, .. }
            | ProvisionError::StageTimeout { stage, .. } => Some(*stage),
            ProvisionError::Cancelled { stage } => *stage,
            _ => None,
        }
    }
}
