/// Root credentials of a completed installation
///
/// Read straight from the cluster; nothing here is ever checkpointed.
use crate::adapters::{KubeAdapter, Secret};
use crate::checkpoint::{CheckpointStore, INSTALL_COMPLETE_MARKER};
use crate::error::ProvisionError;
use crate::stages::{
    ARGOCD_ADMIN_SECRET, ARGOCD_NAMESPACE, ROOT_TOKEN_KEY, VAULT_NAMESPACE, VAULT_UNSEAL_SECRET,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// One credential and where it came from. `value` is `None` when the secret
/// or key does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCredential {
    pub label: &'static str,
    pub namespace: &'static str,
    pub secret: &'static str,
    pub key: &'static str,
    pub value: Option<Secret>,
}

impl RootCredential {
    pub fn location(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.secret, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCredentials {
    pub vault_root_token: RootCredential,
    pub argocd_admin_password: RootCredential,
}

impl RootCredentials {
    pub fn all(&self) -> [&RootCredential; 2] {
        [&self.argocd_admin_password, &self.vault_root_token]
    }
}

async fn read(
    kube: &dyn KubeAdapter,
    kubeconfig: &Path,
    label: &'static str,
    namespace: &'static str,
    secret: &'static str,
    key: &'static str,
    cancel: &CancellationToken,
) -> Result<RootCredential, ProvisionError> {
    let value = kube
        .read_secret(kubeconfig, namespace, secret, key, cancel)
        .await?;
    if value.is_none() {
        tracing::warn!("[RootCredentials] {}/{}:{} not found", namespace, secret, key);
    }
    Ok(RootCredential {
        label,
        namespace,
        secret,
        key,
        value,
    })
}

/// Collect the Vault root token and Argo CD admin password.
///
/// Fails with `NotInstalled` unless the install-complete marker is set.
pub async fn collect_root_credentials(
    store: &CheckpointStore,
    kube: &dyn KubeAdapter,
    kubeconfig: &Path,
    cancel: &CancellationToken,
) -> Result<RootCredentials, ProvisionError> {
    if !store.has_marker(INSTALL_COMPLETE_MARKER) {
        return Err(ProvisionError::NotInstalled(store.cluster_name().to_string()));
    }
    let argocd_admin_password = read(
        kube,
        kubeconfig,
        "Argo CD admin password",
        ARGOCD_NAMESPACE,
        ARGOCD_ADMIN_SECRET,
        "password",
        cancel,
    )
    .await?;
    let vault_root_token = read(
        kube,
        kubeconfig,
        "Vault root token",
        VAULT_NAMESPACE,
        VAULT_UNSEAL_SECRET,
        ROOT_TOKEN_KEY,
        cancel,
    )
    .await?;
    Ok(RootCredentials {
        vault_root_token,
        argocd_admin_password,
    })
}
