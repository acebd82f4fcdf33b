//! Runner: executes the ordered stages of one installation.
//!
//! Stages run strictly one after another. Each stage gets a child
//! cancellation token, a wall-clock deadline and a retry budget for
//! transient failures. A stage is checkpointed only after its effect and
//! post-check both succeeded, so an interrupted stage is re-run on resume.

use crate::adapters::Capabilities;
use crate::checkpoint::{Checkpoint, CheckpointStore, INSTALL_COMPLETE_MARKER};
use crate::config::K1Config;
use crate::error::{AdapterError, AdapterErrorKind, FieldIssue, ProvisionError, ValidationError};
use crate::progress::{EventEmitter, EventKind};
use crate::registry::StageRegistry;
use crate::request::InstallRequest;
use crate::retry::BackoffPolicy;
use crate::stage::{RunState, Stage, StageContext, StageId, StageOutput};
use crate::stages::validate_request;
use crate::telemetry::{TelemetryEvent, TelemetryMetric};
use crate::workdir::WorkDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Apply,
    Revert,
}

pub struct Runner {
    stages: Vec<Stage>,
    caps: Capabilities,
    store: CheckpointStore,
    workdir: WorkDir,
    config: K1Config,
    events: EventEmitter,
    backoff: BackoffPolicy,
}

impl Runner {
    pub fn new(
        registry: StageRegistry,
        caps: Capabilities,
        store: CheckpointStore,
        workdir: WorkDir,
        config: K1Config,
        events: EventEmitter,
    ) -> Self {
        Self {
            stages: registry.into_stages(),
            caps,
            store,
            workdir,
            backoff: BackoffPolicy::from_config(&config),
            config,
            events,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn into_store(self) -> CheckpointStore {
        self.store
    }

    /// Execute every stage not yet checkpointed.
    ///
    /// Refuses to run when the install-complete marker is set. Returns the
    /// final run state on success.
    pub async fn run(
        &mut self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<RunState, ProvisionError> {
        let _lock = self.workdir.lock()?;
        if self.store.has_marker(INSTALL_COMPLETE_MARKER) {
            return Err(ProvisionError::AlreadyComplete(request.cluster_name.clone()));
        }
        self.reject_drift(request)?;
        validate_request(request, &self.caps, cancel).await?;
        self.workdir.ensure()?;
        self.store.save_flags(request)?;
        self.telemetry(request, TelemetryEvent::new(TelemetryMetric::InstallStarted, request));

        let mut state = RunState {
            completed: self
                .stages
                .iter()
                .map(|s| s.id)
                .filter(|id| self.store.is_checkpointed(*id))
                .collect(),
            ..RunState::default()
        };
        tracing::info!(
            "[Runner] Starting {} ({} of {} stages checkpointed)",
            request.cluster_name,
            state.completed.len(),
            self.stages.len()
        );

        let stages = self.stages.clone();
        for stage in &stages {
            if cancel.is_cancelled() {
                self.events.cancelled(None).await;
                return Err(ProvisionError::Cancelled { stage: None });
            }
            if self.store.is_checkpointed(stage.id) || !(stage.should_run)(stage, &state) {
                tracing::debug!("[Runner] Skipping {}", stage.id);
                self.events.stage(EventKind::StageSkipped, stage.id).await;
                continue;
            }

            state.current = Some(stage.id);
            self.events.stage(EventKind::StageStarting, stage.id).await;
            let result = self.execute(stage, request, Phase::Apply, cancel).await;
            let output = match result {
                Ok(output) => output,
                Err(err) => return Err(self.fail(request, stage.id, &mut state, err).await),
            };

            if let Err(e) = self.store.set(stage.id, Checkpoint::now(output.metadata)) {
                // the effect happened but could not be recorded
                let err = ProvisionError::Checkpoint(e);
                return Err(self.fail(request, stage.id, &mut state, err).await);
            }
            state.completed.insert(stage.id);
            state.current = None;
            self.events.stage(EventKind::StageCompleted, stage.id).await;
            tracing::info!("[Runner] Stage {} completed", stage.id);
        }

        self.store.set_marker(INSTALL_COMPLETE_MARKER)?;
        self.telemetry(request, TelemetryEvent::new(TelemetryMetric::InstallCompleted, request));
        state.seq = self.events.last_seq().await;
        tracing::info!("[Runner] {} installed", request.cluster_name);
        Ok(state)
    }

    /// Resuming with a request that names or places resources differently
    /// would orphan what the checkpointed stages already created.
    fn reject_drift(&self, request: &InstallRequest) -> Result<(), ProvisionError> {
        let Some(recorded) = self.store.flags() else {
            return Ok(());
        };
        if self.store.checks().is_empty() {
            return Ok(());
        }
        let issues: Vec<FieldIssue> = recorded
            .identity_changes(request)
            .into_iter()
            .map(|(field, was)| FieldIssue {
                field: field.to_string(),
                problem: format!(
                    "was '{}' when the checkpointed stages ran; \
                     run reset to start over with a new value",
                    was
                ),
            })
            .collect();
        if issues.is_empty() {
            return Ok(());
        }
        tracing::warn!(
            "[Runner] Refusing to resume {} with {} changed field(s)",
            recorded.cluster_name,
            issues.len()
        );
        Err(ValidationError { issues }.into())
    }

    /// Undo a (partial) installation in strict reverse stage order.
    ///
    /// Only checkpointed, reversible stages do work. Each reverted stage loses
    /// its checkpoint, so a destroy that stops part way resumes where it
    /// stopped. Local state is cleared only when every revert succeeded.
    pub async fn destroy(
        &mut self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let _lock = self.workdir.lock()?;
        let mut state = RunState::default();
        let stages: Vec<Stage> = self.stages.iter().rev().cloned().collect();
        tracing::info!("[Runner] Destroying {}", request.cluster_name);

        for stage in &stages {
            if cancel.is_cancelled() {
                self.events.cancelled(None).await;
                return Err(ProvisionError::Cancelled { stage: None });
            }
            if !self.store.is_checkpointed(stage.id) || !stage.effect.reversible() {
                self.events.stage(EventKind::StageSkipped, stage.id).await;
                continue;
            }
            state.current = Some(stage.id);
            self.events.stage(EventKind::StageStarting, stage.id).await;
            if let Err(err) = self.execute(stage, request, Phase::Revert, cancel).await {
                return Err(self.fail(request, stage.id, &mut state, err).await);
            }
            if let Err(e) = self.store.remove(stage.id) {
                let err = ProvisionError::Checkpoint(e);
                return Err(self.fail(request, stage.id, &mut state, err).await);
            }
            state.completed.insert(stage.id);
            self.events.stage(EventKind::StageCompleted, stage.id).await;
            tracing::info!("[Runner] Reverted {}", stage.id);
        }

        self.store.clear_all()?;
        self.workdir.remove_local_state()?;
        self.telemetry(request, TelemetryEvent::new(TelemetryMetric::DestroyCompleted, request));
        tracing::info!("[Runner] {} destroyed", request.cluster_name);
        Ok(())
    }

    /// Run one stage to completion: retries, deadline and cancellation.
    async fn execute(
        &self,
        stage: &Stage,
        request: &InstallRequest,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, ProvisionError> {
        let deadline = Instant::now() + stage.timeout;
        let grace = self.config.cancel_grace();
        let mut attempt = 1u32;

        loop {
            let child = cancel.child_token();
            let ctx = StageContext::new(
                request,
                &self.workdir,
                &self.config,
                self.store.checks(),
                child.clone(),
                attempt,
            );
            let caps = &self.caps;
            let effect = stage.effect.as_ref();
            let work = async {
                match phase {
                    Phase::Apply => {
                        let output = effect.run(&ctx, caps).await?;
                        effect.verify(&ctx, caps).await?;
                        Ok::<_, AdapterError>(output)
                    }
                    Phase::Revert => effect.revert(&ctx, caps).await.map(|_| StageOutput::empty()),
                }
            };
            tokio::pin!(work);

            let outcome = tokio::select! {
                result = &mut work => result,
                _ = cancel.cancelled() => {
                    child.cancel();
                    if tokio::time::timeout(grace, &mut work).await.is_err() {
                        tracing::warn!("[Runner] {} did not stop within {:?}", stage.id, grace);
                    }
                    return Err(ProvisionError::Cancelled { stage: Some(stage.id) });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    child.cancel();
                    let _ = tokio::time::timeout(grace, &mut work).await;
                    return Err(ProvisionError::StageTimeout {
                        stage: stage.id,
                        after: stage.timeout,
                    });
                }
            };

            let err = match outcome {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if err.kind == AdapterErrorKind::Cancelled && cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled { stage: Some(stage.id) });
            }
            if !err.is_transient() {
                return Err(ProvisionError::Stage { stage: stage.id, source: err });
            }

            let delay = self.backoff.delay_for(attempt);
            if !self.backoff.allows_retry(attempt) || Instant::now() + delay >= deadline {
                return Err(ProvisionError::RetriesExhausted {
                    stage: stage.id,
                    attempts: attempt,
                    source: err,
                });
            }
            tracing::warn!(
                "[Runner] {} attempt {}/{} failed: {}; retrying in {:?}",
                stage.id,
                attempt,
                self.backoff.max_attempts,
                err,
                delay
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ProvisionError::Cancelled { stage: Some(stage.id) });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Report a failed stage and hand the error back.
    async fn fail(
        &self,
        request: &InstallRequest,
        stage: StageId,
        state: &mut RunState,
        err: ProvisionError,
    ) -> ProvisionError {
        match &err {
            ProvisionError::Cancelled { .. } => {
                tracing::warn!("[Runner] Cancelled during {}", stage);
                self.events.cancelled(Some(stage)).await;
            }
            _ => {
                tracing::error!("[Runner] Stage {} failed: {}", stage, err);
                self.events
                    .stage_failed(stage, format!("{}: {}", err.category(), err))
                    .await;
                self.telemetry(
                    request,
                    TelemetryEvent::new(TelemetryMetric::StageFailed, request)
                        .failed_at(Some(stage), err.category()),
                );
            }
        }
        state.error = Some(err.to_string());
        err
    }

    fn telemetry(&self, request: &InstallRequest, event: TelemetryEvent) {
        if request.use_telemetry {
            let team = self.caps.env.var("KUBEFIRST_TEAM");
            self.caps.telemetry.send(event.with_team(team));
        }
    }
}

/// Forget every checkpoint and local working directory of a cluster.
/// Remote resources are left alone.
pub fn reset(store: &mut CheckpointStore, workdir: &WorkDir) -> Result<(), ProvisionError> {
    let _lock = workdir.lock()?;
    store.clear_all()?;
    workdir.remove_local_state()?;
    tracing::info!("[Runner] Reset {}", store.cluster_name());
    Ok(())
}
