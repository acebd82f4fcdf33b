//! Progress events shared by the runner and the reconciler.

use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StageStarting,
    StageCompleted,
    StageSkipped,
    StageFailed,
    StepAdvanced,
    ProvisioningComplete,
    ProvisioningFailed,
    ClusterUnreachable,
    Cancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StageStarting => "stage-starting",
            EventKind::StageCompleted => "stage-completed",
            EventKind::StageSkipped => "stage-skipped",
            EventKind::StageFailed => "stage-failed",
            EventKind::StepAdvanced => "step-advanced",
            EventKind::ProvisioningComplete => "provisioning-complete",
            EventKind::ProvisioningFailed => "provisioning-failed",
            EventKind::ClusterUnreachable => "cluster-unreachable",
            EventKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the event stream.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub seq: u64,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_stage(&self, kind: EventKind, stage: StageId) -> bool {
        self.kind == kind && self.stage.as_deref() == Some(stage.as_str())
    }
}

/// Sending half of the event stream.
///
/// Cloned into the runner and the reconciler; a shared counter keeps sequence
/// numbers strictly increasing across both. Sends wait for channel capacity.
#[derive(Clone)]
pub struct EventEmitter {
    sender: mpsc::Sender<ProgressEvent>,
    seq: Arc<Mutex<u64>>,
}

impl EventEmitter {
    /// Bounded channel of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                seq: Arc::new(Mutex::new(0)),
            },
            receiver,
        )
    }

    /// Emit an event and return its sequence number.
    pub async fn emit(
        &self,
        kind: EventKind,
        stage: Option<StageId>,
        step: Option<String>,
        error: Option<String>,
    ) -> u64 {
        // Hold the counter across the send so channel order matches seq order.
        let mut seq = self.seq.lock().await;
        *seq += 1;
        let event = ProgressEvent {
            seq: *seq,
            kind,
            stage: stage.map(|s| s.to_string()),
            step,
            error,
            timestamp: Utc::now(),
        };
        if self.sender.send(event).await.is_err() {
            tracing::debug!("[EventEmitter] Reporter gone, dropped {} #{}", kind, *seq);
        }
        *seq
    }

    pub async fn stage(&self, kind: EventKind, stage: StageId) -> u64 {
        self.emit(kind, Some(stage), None, None).await
    }

    pub async fn stage_failed(&self, stage: StageId, error: String) -> u64 {
        self.emit(EventKind::StageFailed, Some(stage), None, Some(error))
            .await
    }

    pub async fn cancelled(&self, stage: Option<StageId>) -> u64 {
        self.emit(EventKind::Cancelled, stage, None, None).await
    }

    pub async fn step_advanced(&self, step: &str) -> u64 {
        self.emit(EventKind::StepAdvanced, None, Some(step.to_string()), None)
            .await
    }

    /// Last sequence number handed out.
    pub async fn last_seq(&self) -> u64 {
        *self.seq.lock().await
    }
}
