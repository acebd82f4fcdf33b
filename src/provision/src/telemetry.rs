//! Usage telemetry. Fire-and-forget: a sink must never block or fail a run.

use crate::error::ErrorCategory;
use crate::request::InstallRequest;
use crate::stage::StageId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelemetryMetric {
    InstallStarted,
    StageFailed,
    InstallCompleted,
    DestroyCompleted,
}

/// One telemetry datum. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    pub metric: TelemetryMetric,
    pub cloud_provider: String,
    pub git_provider: String,
    pub cluster_type: String,
    pub domain_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorCategory>,
    /// `KUBEFIRST_TEAM` tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

impl TelemetryEvent {
    pub fn new(metric: TelemetryMetric, request: &InstallRequest) -> Self {
        Self {
            metric,
            cloud_provider: request.cloud_provider.as_str().to_string(),
            git_provider: request.git_provider.as_str().to_string(),
            cluster_type: request.cluster_type.as_str().to_string(),
            domain_name: request.domain_name.clone(),
            stage: None,
            error_kind: None,
            team: None,
        }
    }

    pub fn failed_at(mut self, stage: Option<StageId>, kind: ErrorCategory) -> Self {
        self.stage = stage.map(|s| s.to_string());
        self.error_kind = Some(kind);
        self
    }

    pub fn with_team(mut self, team: Option<String>) -> Self {
        self.team = team;
        self
    }
}

pub trait TelemetrySink: Send + Sync {
    /// Queue an event for delivery and return immediately.
    fn send(&self, event: TelemetryEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn send(&self, event: TelemetryEvent) {
        tracing::trace!("[Telemetry] Dropped {:?}", event.metric);
    }
}
