use super::http;
use async_trait::async_trait;
use provision::adapters::{Secret, VaultAdapter, VaultEnvelope};
use provision::error::{AdapterError, AdapterErrorKind};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const SECRET_SHARES: usize = 3;
const SECRET_THRESHOLD: usize = 2;

#[derive(Debug, Deserialize)]
struct InitStatus {
    initialized: bool,
}

#[derive(Deserialize)]
struct InitResponse {
    keys: Vec<String>,
    root_token: String,
}

#[derive(Debug, Deserialize)]
struct SealStatus {
    sealed: bool,
}

/// Vault's HTTP API, reached through a port-forward.
pub struct VaultHttp {
    client: Client,
}

impl VaultHttp {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            client: http::client()?,
        })
    }
}

#[async_trait]
impl VaultAdapter for VaultHttp {
    async fn initialize_and_unseal(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<VaultEnvelope, AdapterError> {
        let status: InitStatus = http::json(
            self.client.get(format!("{}/v1/sys/init", endpoint)),
            "vault init status",
            cancel,
        )
        .await?;
        if status.initialized {
            return Err(AdapterError::new(
                AdapterErrorKind::ResourceExists,
                "vault is already initialized but its root token is not stored in the cluster",
            ));
        }

        let init: InitResponse = http::json(
            self.client
                .put(format!("{}/v1/sys/init", endpoint))
                .json(&json!({"secret_shares": SECRET_SHARES, "secret_threshold": SECRET_THRESHOLD})),
            "vault init",
            cancel,
        )
        .await?;
        tracing::info!("[Vault] Initialized with {} unseal keys", init.keys.len());

        let mut sealed = true;
        for key in &init.keys {
            let status: SealStatus = http::json(
                self.client
                    .put(format!("{}/v1/sys/unseal", endpoint))
                    .json(&json!({ "key": key })),
                "vault unseal",
                cancel,
            )
            .await?;
            sealed = status.sealed;
            if !sealed {
                break;
            }
        }
        if sealed {
            return Err(AdapterError::new(
                AdapterErrorKind::CommandFailed,
                "vault is still sealed after submitting every key",
            ));
        }
        tracing::info!("[Vault] Unsealed");

        Ok(VaultEnvelope {
            root_token: Secret::new(init.root_token),
            unseal_keys: init.keys.into_iter().map(Secret::new).collect(),
        })
    }
}
