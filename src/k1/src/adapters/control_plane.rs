use super::http;
use async_trait::async_trait;
use provision::error::AdapterError;
use provision::reconciler::{Check, ClusterSnapshot, ClusterStatus, ControlPlane};
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Snapshot of `GET <base>/api/v1/cluster/<name>`.
pub fn snapshot_from_json(body: &Value) -> ClusterSnapshot {
    let status = match body.get("status").and_then(Value::as_str) {
        Some("provisioned") => ClusterStatus::Provisioned,
        Some("error") => ClusterStatus::Error,
        _ => ClusterStatus::InProgress,
    };
    let mut snapshot = ClusterSnapshot::new(status);
    snapshot.last_condition = body
        .get("last_condition")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    for check in Check::ALL {
        let field = format!("{}_check", check.as_str().replace('-', "_"));
        let done = body.get(&field).and_then(Value::as_bool).unwrap_or(false);
        snapshot.set(check, done);
    }
    snapshot
}

pub struct HttpControlPlane {
    base_url: String,
    client: Client,
}

impl HttpControlPlane {
    pub fn new(base_url: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http::client()?,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn cluster_snapshot(
        &self,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ClusterSnapshot, AdapterError> {
        let url = format!("{}/api/v1/cluster/{}", self.base_url, cluster_name);
        let body: Value = http::json(self.client.get(url), "cluster snapshot", cancel).await?;
        Ok(snapshot_from_json(&body))
    }
}
