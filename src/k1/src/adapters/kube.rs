//! kubectl-backed cluster operations.

use super::exec::Exec;
use async_trait::async_trait;
use base64::Engine;
use provision::adapters::{KubeAdapter, Manifest, PortForward, Secret, SecretSpec, Workload};
use provision::error::{AdapterError, AdapterErrorKind};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(20);

pub struct KubectlCli {
    binary: PathBuf,
}

fn stderr_contains(e: &AdapterError, needle: &str) -> bool {
    e.kind == AdapterErrorKind::CommandFailed
        && e.stderr_tail.as_deref().map(|s| s.contains(needle)).unwrap_or(false)
}

fn is_not_found(e: &AdapterError) -> bool {
    stderr_contains(e, "NotFound") || stderr_contains(e, "not found")
}

/// Manifest for `kubectl apply`; values go in `stringData`.
fn secret_manifest(secret: &SecretSpec) -> Value {
    let data: serde_json::Map<String, Value> = secret
        .data
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.expose().to_string())))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": secret.secret_type,
        "metadata": {
            "name": secret.name,
            "namespace": secret.namespace,
            "labels": secret.labels,
        },
        "stringData": data,
    })
}

fn decode_secret_value(secret: &Value, key: &str) -> Result<Option<Secret>, AdapterError> {
    let Some(encoded) = secret.get("data").and_then(|d| d.get(key)).and_then(Value::as_str) else {
        return Ok(None);
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| AdapterError::new(AdapterErrorKind::CommandFailed, format!("secret key {}: {}", key, e)))?;
    Ok(Some(Secret::new(String::from_utf8_lossy(&bytes).into_owned())))
}

impl KubectlCli {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn kubectl(&self, kubeconfig: &Path) -> Exec {
        Exec::new(&self.binary).arg("--kubeconfig").arg(kubeconfig.display().to_string())
    }

    async fn exists(&self, kubeconfig: &Path, workload: &Workload, cancel: &CancellationToken) -> Result<bool, AdapterError> {
        let result = self
            .kubectl(kubeconfig)
            .args([
                "get",
                "-n",
                workload.namespace.as_str(),
                workload.kind.as_str(),
                workload.name.as_str(),
                "-o",
                "name",
            ])
            .output(cancel)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) if e.is_transient() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl KubeAdapter for KubectlCli {
    /// Poll until the workload exists, then wait for its rollout.
    async fn wait_ready(
        &self,
        kubeconfig: &Path,
        workload: &Workload,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let deadline = Instant::now() + timeout;
        while !self.exists(kubeconfig, workload, cancel).await? {
            if Instant::now() + POLL_INTERVAL >= deadline {
                return Err(AdapterError::timeout(&workload.to_string(), timeout));
            }
            tracing::debug!("[Kubectl] Waiting for {} to appear", workload);
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(AdapterError::cancelled(&workload.to_string())),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now()).as_secs().max(1);
        let target = format!("{}/{}", workload.kind.as_str(), workload.name);
        self.kubectl(kubeconfig)
            .args(["rollout", "status", "-n", workload.namespace.as_str(), target.as_str()])
            .arg(format!("--timeout={}s", remaining))
            .output(cancel)
            .await
            .map_err(|e| {
                if stderr_contains(&e, "timed out") {
                    AdapterError::timeout(&workload.to_string(), timeout)
                } else {
                    e
                }
            })?;
        tracing::info!("[Kubectl] {} is ready", workload);
        Ok(())
    }

    async fn create_secret(
        &self,
        kubeconfig: &Path,
        secret: &SecretSpec,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        self.kubectl(kubeconfig)
            .args(["create", "namespace", secret.namespace.as_str()])
            .output(cancel)
            .await
            .or_else(|e| {
                if stderr_contains(&e, "AlreadyExists") {
                    Ok(String::new())
                } else {
                    Err(e)
                }
            })?;
        self.kubectl(kubeconfig)
            .args(["apply", "-f", "-"])
            .stdin(secret_manifest(secret).to_string())
            .output(cancel)
            .await?;
        tracing::info!("[Kubectl] Applied secret {}/{}", secret.namespace, secret.name);
        Ok(())
    }

    async fn read_secret(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        name: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Secret>, AdapterError> {
        let raw = match self
            .kubectl(kubeconfig)
            .args(["get", "secret", "-n", namespace, name, "-o", "json"])
            .output(cancel)
            .await
        {
            Ok(raw) => raw,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let secret: Value = serde_json::from_str(&raw).map_err(|e| {
            AdapterError::new(AdapterErrorKind::CommandFailed, format!("secret {}/{}: {}", namespace, name, e))
        })?;
        decode_secret_value(&secret, key)
    }

    async fn apply(&self, kubeconfig: &Path, manifest: &Manifest, cancel: &CancellationToken) -> Result<(), AdapterError> {
        let kubectl = self.kubectl(kubeconfig);
        let command = match manifest {
            Manifest::Inline(yaml) => kubectl.args(["apply", "-f", "-"]).stdin(yaml.clone()),
            Manifest::Kustomize(target) => kubectl.args(["apply", "-k", target.as_str()]),
        };
        command.output(cancel).await?;
        Ok(())
    }

    async fn port_forward(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        target: &str,
        remote_port: u16,
        cancel: &CancellationToken,
    ) -> Result<PortForward, AdapterError> {
        let local_port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .map_err(|e| AdapterError::transient(format!("no free local port: {}", e)))?;

        let mut child = self
            .kubectl(kubeconfig)
            .args(["port-forward", "-n", namespace, target])
            .arg(format!("{}:{}", local_port, remote_port))
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::CommandFailed, "port-forward has no stdout")
        })?;

        // drain stdout for the whole session so kubectl never blocks on it
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.starts_with("Forwarding from") {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
        });
        tokio::select! {
            ready = ready_rx => {
                if ready.is_err() {
                    return Err(AdapterError::transient(format!("port-forward to {}/{} exited", namespace, target)));
                }
            }
            _ = tokio::time::sleep(FORWARD_READY_TIMEOUT) => {
                return Err(AdapterError::transient(format!("port-forward to {}/{} not ready", namespace, target)));
            }
            _ = cancel.cancelled() => return Err(AdapterError::cancelled("port-forward")),
        }
        tracing::info!("[Kubectl] Forwarding 127.0.0.1:{} -> {}/{}:{}", local_port, namespace, target, remote_port);
        // kill_on_drop stops kubectl once the session is released
        Ok(PortForward::new(local_port, move || drop(child)))
    }
}
