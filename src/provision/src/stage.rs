//! Stage: one unit of the provisioning pipeline.
//!
//! A stage pairs a stable identifier and its dependency edges with an
//! effect. Effects talk to the outside world only through the capability
//! bundle and report what they produced as checkpoint metadata.

use crate::adapters::Capabilities;
use crate::checkpoint::Checkpoint;
use crate::config::K1Config;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::request::InstallRequest;
use crate::workdir::WorkDir;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default wall-clock budget of a stage, retries included.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Stable stage identifier, unique within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(&'static str);

impl StageId {
    pub const VALIDATE_FLAGS: StageId = StageId("validate-flags");
    pub const CLOUD_CREDENTIALS: StageId = StageId("cloud-credentials");
    pub const DOMAIN_LIVENESS: StageId = StageId("domain-liveness");
    pub const STATE_STORE_CREATE: StageId = StageId("state-store-create");
    pub const GIT_CREDENTIALS: StageId = StageId("git-credentials");
    pub const KBOT_SETUP: StageId = StageId("kbot-setup");
    pub const TOOLS_DOWNLOAD: StageId = StageId("tools-download");
    pub const GITOPS_READY: StageId = StageId("gitops-ready");
    pub const GIT_TERRAFORM_APPLY: StageId = StageId("git-terraform-apply");
    pub const GITOPS_REPO_PUSH: StageId = StageId("gitops-repo-push");
    pub const CLOUD_TERRAFORM_APPLY: StageId = StageId("cloud-terraform-apply");
    pub const CLUSTER_SECRETS_CREATE: StageId = StageId("cluster-secrets-create");
    pub const ARGOCD_INSTALL: StageId = StageId("argocd-install");
    pub const ARGOCD_INITIALIZE: StageId = StageId("argocd-initialize");
    pub const ARGOCD_CREATE_REGISTRY: StageId = StageId("argocd-create-registry");
    pub const VAULT_READY: StageId = StageId("vault-ready");
    pub const VAULT_UNSEAL: StageId = StageId("vault-unseal");
    pub const VAULT_TERRAFORM_APPLY: StageId = StageId("vault-terraform-apply");
    pub const USERS_TERRAFORM_APPLY: StageId = StageId("users-terraform-apply");
    pub const POST_INSTALL: StageId = StageId("post-install");

    pub const fn new(id: &'static str) -> Self {
        StageId(id)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Derived view of a run: what is done, what is running, what failed.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub completed: BTreeSet<StageId>,
    pub current: Option<StageId>,
    pub error: Option<String>,
    /// Sequence number of the last event emitted for this run.
    pub seq: u64,
}

impl RunState {
    pub fn is_completed(&self, id: StageId) -> bool {
        self.completed.contains(&id)
    }
}

/// Predicate deciding whether a stage executes in the current run.
pub type ShouldRun = fn(&Stage, &RunState) -> bool;

/// Default predicate: run unless already checkpointed.
pub fn not_checkpointed(stage: &Stage, state: &RunState) -> bool {
    !state.is_completed(stage.id)
}

/// Metadata a successful effect wants recorded with its checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub metadata: BTreeMap<String, String>,
}

impl StageOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Everything an effect may read while it runs.
pub struct StageContext<'a> {
    pub request: &'a InstallRequest,
    pub workdir: &'a WorkDir,
    pub config: &'a K1Config,
    /// Cancelled when the run is interrupted or the stage deadline passes.
    pub cancel: CancellationToken,
    /// 1-based attempt counter.
    pub attempt: u32,
    checkpoints: &'a BTreeMap<String, Checkpoint>,
}

impl<'a> StageContext<'a> {
    pub fn new(
        request: &'a InstallRequest,
        workdir: &'a WorkDir,
        config: &'a K1Config,
        checkpoints: &'a BTreeMap<String, Checkpoint>,
        cancel: CancellationToken,
        attempt: u32,
    ) -> Self {
        Self {
            request,
            workdir,
            config,
            cancel,
            attempt,
            checkpoints,
        }
    }

    /// Metadata recorded by an earlier stage.
    pub fn metadata(&self, stage: StageId, key: &str) -> Option<&str> {
        self.checkpoints
            .get(stage.as_str())
            .and_then(|c| c.metadata.get(key))
            .map(String::as_str)
    }

    /// Like [`metadata`](Self::metadata) but a missing value is an error.
    pub fn require_metadata(&self, stage: StageId, key: &str) -> Result<&str, AdapterError> {
        self.metadata(stage, key).ok_or_else(|| {
            AdapterError::new(
                AdapterErrorKind::NotFound,
                format!("checkpoint of '{}' has no '{}' entry", stage, key),
            )
        })
    }
}

/// The work a stage performs.
///
/// `run` must converge: re-running it without a checkpoint reaches the same
/// observable state as the first successful run.
#[async_trait]
pub trait StageEffect: Send + Sync {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError>;

    /// Post-check executed after a successful `run`.
    async fn verify(
        &self,
        _ctx: &StageContext<'_>,
        _caps: &Capabilities,
    ) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Whether [`revert`](Self::revert) undoes anything during destroy.
    fn reversible(&self) -> bool {
        false
    }

    /// Inverse effect used by destroy.
    async fn revert(
        &self,
        _ctx: &StageContext<'_>,
        _caps: &Capabilities,
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// A declared pipeline stage.
#[derive(Clone)]
pub struct Stage {
    pub id: StageId,
    pub label: &'static str,
    pub depends_on: Vec<StageId>,
    pub timeout: Duration,
    pub should_run: ShouldRun,
    pub effect: Arc<dyn StageEffect>,
}

impl Stage {
    pub fn new(id: StageId, label: &'static str, effect: Arc<dyn StageEffect>) -> Self {
        Self {
            id,
            label,
            depends_on: Vec::new(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            should_run: not_checkpointed,
            effect,
        }
    }

    pub fn after(mut self, deps: &[StageId]) -> Self {
        self.depends_on.extend_from_slice(deps);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_predicate(mut self, should_run: ShouldRun) -> Self {
        self.should_run = should_run;
        self
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("depends_on", &self.depends_on)
            .field("timeout", &self.timeout)
            .finish()
    }
}
