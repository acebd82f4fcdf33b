//! Post-install watcher.
//!
//! After the runner returns, the control plane keeps configuring the cluster.
//! The reconciler polls its snapshot, walks a cursor over the fixed check list
//! one step per tick and stops on the first terminal status.

use crate::error::{AdapterError, AdapterErrorKind, ProvisionError};
use crate::progress::{EventEmitter, EventKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Remote completion flags, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Check {
    InstallTools,
    DomainLiveness,
    KbotSetup,
    GitInit,
    GitopsReady,
    GitTerraformApply,
    GitopsPushed,
    CloudTerraformApply,
    ClusterSecretsCreated,
    ArgocdInstall,
    ArgocdInitialize,
    VaultInitialized,
    VaultTerraformApply,
    UsersTerraformApply,
}

impl Check {
    pub const ALL: [Check; 14] = [
        Check::InstallTools,
        Check::DomainLiveness,
        Check::KbotSetup,
        Check::GitInit,
        Check::GitopsReady,
        Check::GitTerraformApply,
        Check::GitopsPushed,
        Check::CloudTerraformApply,
        Check::ClusterSecretsCreated,
        Check::ArgocdInstall,
        Check::ArgocdInitialize,
        Check::VaultInitialized,
        Check::VaultTerraformApply,
        Check::UsersTerraformApply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Check::InstallTools => "install-tools",
            Check::DomainLiveness => "domain-liveness",
            Check::KbotSetup => "kbot-setup",
            Check::GitInit => "git-init",
            Check::GitopsReady => "gitops-ready",
            Check::GitTerraformApply => "git-terraform-apply",
            Check::GitopsPushed => "gitops-pushed",
            Check::CloudTerraformApply => "cloud-terraform-apply",
            Check::ClusterSecretsCreated => "cluster-secrets-created",
            Check::ArgocdInstall => "argocd-install",
            Check::ArgocdInitialize => "argocd-initialize",
            Check::VaultInitialized => "vault-initialized",
            Check::VaultTerraformApply => "vault-terraform-apply",
            Check::UsersTerraformApply => "users-terraform-apply",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterStatus {
    InProgress,
    Provisioned,
    Error,
}

/// The control plane's view of install progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub status: ClusterStatus,
    pub last_condition: String,
    completed: BTreeSet<Check>,
}

impl ClusterSnapshot {
    pub fn new(status: ClusterStatus) -> Self {
        Self {
            status,
            last_condition: String::new(),
            completed: BTreeSet::new(),
        }
    }

    pub fn in_progress() -> Self {
        Self::new(ClusterStatus::InProgress)
    }

    pub fn provisioned() -> Self {
        let mut snapshot = Self::new(ClusterStatus::Provisioned);
        snapshot.completed.extend(Check::ALL);
        snapshot
    }

    pub fn error(condition: impl Into<String>) -> Self {
        let mut snapshot = Self::new(ClusterStatus::Error);
        snapshot.last_condition = condition.into();
        snapshot
    }

    /// Snapshot with the first `n` checks set.
    pub fn first_checks(n: usize) -> Self {
        let mut snapshot = Self::in_progress();
        snapshot.completed.extend(Check::ALL.iter().take(n).copied());
        snapshot
    }

    pub fn set(&mut self, check: Check, done: bool) {
        if done {
            self.completed.insert(check);
        } else {
            self.completed.remove(&check);
        }
    }

    pub fn is_set(&self, check: Check) -> bool {
        self.completed.contains(&check)
    }

    pub fn completed(&self) -> &BTreeSet<Check> {
        &self.completed
    }
}

/// Source of cluster snapshots.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `not-found` means the cluster is not registered yet.
    async fn cluster_snapshot(
        &self,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ClusterSnapshot, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Polling,
    Provisioned,
    Failed(String),
    Unreachable,
    Cancelled,
}

impl ReconcilerState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReconcilerState::Idle | ReconcilerState::Polling)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    /// Consecutive failed polls tolerated; one more is fatal.
    pub unreachable_ticks: u32,
}

impl ReconcilerSettings {
    pub fn from_config(config: &crate::config::K1Config) -> Self {
        Self {
            interval: config.reconcile_interval(),
            unreachable_ticks: config.unreachable_ticks,
        }
    }
}

pub struct Reconciler {
    cluster_name: String,
    control_plane: Arc<dyn ControlPlane>,
    events: EventEmitter,
    settings: ReconcilerSettings,
    state: ReconcilerState,
    cursor: Option<usize>,
    failures: u32,
    seen: BTreeSet<Check>,
}

impl Reconciler {
    pub fn new(
        cluster_name: impl Into<String>,
        control_plane: Arc<dyn ControlPlane>,
        events: EventEmitter,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            control_plane,
            events,
            settings,
            state: ReconcilerState::Idle,
            cursor: None,
            failures: 0,
            seen: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> &ReconcilerState {
        &self.state
    }

    /// Step the cursor currently points at.
    pub fn cursor(&self) -> Option<Check> {
        self.cursor.map(|i| Check::ALL[i])
    }

    /// One poll. Emits at most one `step-advanced` event.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> &ReconcilerState {
        if self.state.is_terminal() {
            return &self.state;
        }
        self.state = ReconcilerState::Polling;

        let snapshot = match self
            .control_plane
            .cluster_snapshot(&self.cluster_name, cancel)
            .await
        {
            Ok(snapshot) => {
                self.failures = 0;
                snapshot
            }
            Err(e) if e.kind == AdapterErrorKind::NotFound => {
                tracing::debug!("[Reconciler] Cluster '{}' not registered yet", self.cluster_name);
                self.failures = 0;
                return &self.state;
            }
            Err(e) if e.kind == AdapterErrorKind::Cancelled => {
                self.events.cancelled(None).await;
                self.state = ReconcilerState::Cancelled;
                return &self.state;
            }
            Err(e) => {
                self.failures += 1;
                tracing::warn!(
                    "[Reconciler] Snapshot failed ({}/{}): {}",
                    self.failures,
                    self.settings.unreachable_ticks,
                    e
                );
                if self.failures > self.settings.unreachable_ticks {
                    self.events
                        .emit(EventKind::ClusterUnreachable, None, None, Some(e.to_string()))
                        .await;
                    self.state = ReconcilerState::Unreachable;
                }
                return &self.state;
            }
        };

        match snapshot.status {
            ClusterStatus::Error => {
                let condition = if snapshot.last_condition.trim().is_empty() {
                    "cluster reported error without a condition".to_string()
                } else {
                    snapshot.last_condition.clone()
                };
                tracing::error!("[Reconciler] Provisioning failed: {}", condition);
                self.events
                    .emit(EventKind::ProvisioningFailed, None, None, Some(condition.clone()))
                    .await;
                self.state = ReconcilerState::Failed(condition);
            }
            ClusterStatus::Provisioned => {
                tracing::info!("[Reconciler] Cluster '{}' provisioned", self.cluster_name);
                self.events
                    .emit(EventKind::ProvisioningComplete, None, None, None)
                    .await;
                self.state = ReconcilerState::Provisioned;
            }
            ClusterStatus::InProgress => self.advance(&snapshot).await,
        }
        &self.state
    }

    async fn advance(&mut self, snapshot: &ClusterSnapshot) {
        for check in self.seen.iter() {
            if !snapshot.is_set(*check) {
                tracing::warn!("[Reconciler] Check '{}' went back to false; ignoring", check.as_str());
            }
        }
        self.seen.extend(snapshot.completed().iter().copied());

        // all flags set: the cursor may still walk up to the last step
        let target = Check::ALL
            .iter()
            .position(|c| !self.seen.contains(c))
            .unwrap_or(Check::ALL.len());
        let next = match self.cursor {
            None => 0,
            Some(current) if target > current && current + 1 < Check::ALL.len() => current + 1,
            Some(_) => return,
        };
        self.cursor = Some(next);
        let step = Check::ALL[next];
        tracing::info!("[Reconciler] Step {}/14: {}", next + 1, step.as_str());
        self.events.step_advanced(step.as_str()).await;
    }

    /// Poll until a terminal state. The first poll happens immediately.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), ProvisionError> {
        loop {
            let state = self.tick(cancel).await.clone();
            match state {
                ReconcilerState::Provisioned => return Ok(()),
                ReconcilerState::Failed(condition) => {
                    return Err(ProvisionError::ProvisioningFailed(condition))
                }
                ReconcilerState::Unreachable => {
                    return Err(ProvisionError::Unreachable(self.failures))
                }
                ReconcilerState::Cancelled => return Err(ProvisionError::Cancelled { stage: None }),
                ReconcilerState::Idle | ReconcilerState::Polling => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.events.cancelled(None).await;
                    self.state = ReconcilerState::Cancelled;
                    return Err(ProvisionError::Cancelled { stage: None });
                }
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted(Mutex<VecDeque<Result<ClusterSnapshot, AdapterError>>>);

    #[async_trait]
    impl ControlPlane for Scripted {
        async fn cluster_snapshot(
            &self,
            _cluster_name: &str,
            _cancel: &CancellationToken,
        ) -> Result<ClusterSnapshot, AdapterError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ClusterSnapshot::in_progress()))
        }
    }

    fn reconciler(script: Vec<Result<ClusterSnapshot, AdapterError>>) -> (Reconciler, tokio::sync::mpsc::Receiver<crate::progress::ProgressEvent>) {
        let (events, rx) = EventEmitter::channel(64);
        let settings = ReconcilerSettings {
            interval: Duration::from_millis(1),
            unreachable_ticks: 2,
        };
        let cp = Arc::new(Scripted(Mutex::new(script.into())));
        (Reconciler::new("kfirst", cp, events, settings), rx)
    }

    #[tokio::test]
    async fn test_cursor_moves_one_step_per_tick() {
        // every flag flips at once; the cursor still walks one step per tick
        let (mut r, mut rx) = reconciler(vec![Ok(ClusterSnapshot::first_checks(13)); 3]);
        let cancel = CancellationToken::new();
        r.tick(&cancel).await;
        r.tick(&cancel).await;
        r.tick(&cancel).await;
        assert_eq!(r.cursor(), Some(Check::KbotSetup));

        drop(r);
        let mut steps = Vec::new();
        while let Some(e) = rx.recv().await {
            steps.push(e.step.unwrap());
        }
        assert_eq!(steps, vec!["install-tools", "domain-liveness", "kbot-setup"]);
    }

    #[tokio::test]
    async fn test_regressed_flag_is_ignored() {
        let mut regressed = ClusterSnapshot::first_checks(2);
        regressed.set(Check::InstallTools, false);
        let (mut r, _rx) = reconciler(vec![
            Ok(ClusterSnapshot::first_checks(2)),
            Ok(ClusterSnapshot::first_checks(2)),
            Ok(regressed),
        ]);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            r.tick(&cancel).await;
        }
        assert_eq!(r.cursor(), Some(Check::KbotSetup));
    }

    #[tokio::test]
    async fn test_error_without_condition() {
        let (r, mut rx) = reconciler(vec![Ok(ClusterSnapshot::error(""))]);
        let err = r.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ProvisioningFailed(ref c) if c == "cluster reported error without a condition"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ProvisioningFailed);
    }

    #[tokio::test]
    async fn test_unreachable_after_consecutive_failures() {
        let down = || Err(AdapterError::transient("connection refused"));
        let (r, mut rx) = reconciler(vec![down(), down(), down()]);
        let err = r.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Unreachable(3)));
        assert_eq!(err.exit_code(), crate::error::exit_codes::TRANSIENT_EXHAUSTED);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ClusterUnreachable);
    }

    #[tokio::test]
    async fn test_not_found_counts_as_reachable() {
        let not_found = || Err(AdapterError::new(AdapterErrorKind::NotFound, "no cluster"));
        let down = || Err(AdapterError::transient("timeout"));
        let (r, _rx) = reconciler(vec![
            down(),
            down(),
            not_found(),
            down(),
            down(),
            Ok(ClusterSnapshot::provisioned()),
        ]);
        assert!(r.run(&CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let (r, mut rx) = reconciler(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = r.run(&cancel).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled { stage: None }));
        let kinds: Vec<EventKind> = {
            let mut v = Vec::new();
            while let Ok(e) = rx.try_recv() {
                v.push(e.kind);
            }
            v
        };
        assert_eq!(kinds.last(), Some(&EventKind::Cancelled));
    }
}
