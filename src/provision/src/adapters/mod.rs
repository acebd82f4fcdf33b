/// Capability adapters
///
/// Typed façades over the external systems a run touches. Stages only reach
/// the outside world through these traits; implementations own no state and
/// never retry on their own, they classify failures and return.
use crate::error::AdapterError;
use crate::request::{DnsProvider, GitProtocol, InstallRequest};
use crate::resolver::EnvSource;
use crate::telemetry::TelemetrySink;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Secret value. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Object store bucket holding terraform state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    pub bucket_name: String,
    /// Provider endpoint for S3-compatible stores, if any.
    pub endpoint: Option<String>,
}

/// Cloud provider operations.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    /// Probe that the provider accepts the credentials in the environment.
    async fn probe_credentials(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Create the per-cluster state store bucket. Existing buckets owned by
    /// this cluster are returned as-is.
    async fn create_state_store(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<StateStore, AdapterError>;

    async fn delete_state_store(
        &self,
        request: &InstallRequest,
        bucket_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Confirm the zone for `domain`: authoritative when the cloud's own DNS
    /// hosts it, present in the account when Cloudflare does.
    async fn verify_zone(
        &self,
        dns: DnsProvider,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Write credentials for the named cluster to `dest`.
    async fn fetch_kubeconfig(
        &self,
        request: &InstallRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;
}

/// Authenticated user of the git provider token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub login: String,
    pub scopes: Vec<String>,
}

/// Git hosting provider operations.
#[async_trait]
pub trait GitAdapter: Send + Sync {
    async fn verify_token(&self, cancel: &CancellationToken) -> Result<GitIdentity, AdapterError>;

    /// Check the token user belongs to the organisation or group.
    async fn verify_owner_access(
        &self,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    async fn list_repositories(
        &self,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AdapterError>;

    async fn list_teams(
        &self,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AdapterError>;

    /// Create empty repositories and teams that do not exist yet.
    async fn initialize(
        &self,
        owner: &str,
        repositories: &[String],
        teams: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Push the default branch of `local` to `remote_url`.
    async fn push(
        &self,
        local: &Path,
        remote_url: &str,
        protocol: GitProtocol,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Delete the token user's SSH key with this title. Missing keys are fine.
    async fn delete_ssh_key(
        &self,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Check the git host's SSH host key is known locally.
    async fn verify_host_key(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;
}

/// Placeholder -> value map used when detokenizing templates.
pub type TokenDictionary = BTreeMap<String, String>;

/// Repository preparation from the gitops template.
#[async_trait]
pub trait TemplateAdapter: Send + Sync {
    async fn clone_template(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Produce the detokenized gitops and metaphor trees from a clone.
    async fn prepare(
        &self,
        template: &Path,
        request: &InstallRequest,
        gitops_dest: &Path,
        metaphor_dest: &Path,
        tokens: &TokenDictionary,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;
}

/// Terraform module execution.
#[async_trait]
pub trait TerraformAdapter: Send + Sync {
    /// `init` + `apply` the module at `module`.
    async fn apply(
        &self,
        module: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    async fn destroy(
        &self,
        module: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
        }
    }
}

/// A named deployment or statefulset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl Workload {
    pub fn deployment(namespace: &str, name: &str) -> Self {
        Self {
            kind: WorkloadKind::Deployment,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn statefulset(namespace: &str, name: &str) -> Self {
        Self {
            kind: WorkloadKind::StatefulSet,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind.as_str(), self.name)
    }
}

/// Typed secret to create in the cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub namespace: String,
    pub name: String,
    /// Kubernetes secret type, e.g. `Opaque`.
    pub secret_type: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, Secret>,
}

impl SecretSpec {
    pub fn opaque(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            secret_type: "Opaque".to_string(),
            labels: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_type(mut self, secret_type: &str) -> Self {
        self.secret_type = secret_type.to_string();
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn entry(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), Secret::new(value));
        self
    }
}

impl std::fmt::Debug for SecretSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSpec")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("secret_type", &self.secret_type)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What to `kubectl apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Inline(String),
    /// A kustomization directory or remote URL.
    Kustomize(String),
}

/// Open port-forward session. Torn down when dropped.
pub struct PortForward {
    local_port: u16,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PortForward {
    pub fn new(local_port: u16, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            local_port,
            release: Some(Box::new(release)),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for PortForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForward")
            .field("local_port", &self.local_port)
            .finish()
    }
}

/// Kubernetes operations against the cluster behind a kubeconfig.
#[async_trait]
pub trait KubeAdapter: Send + Sync {
    async fn wait_ready(
        &self,
        kubeconfig: &Path,
        workload: &Workload,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Create or update a secret.
    async fn create_secret(
        &self,
        kubeconfig: &Path,
        secret: &SecretSpec,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Value of `key` in a secret; `None` when the secret or key is absent.
    async fn read_secret(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        name: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Secret>, AdapterError>;

    async fn apply(
        &self,
        kubeconfig: &Path,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Forward a local port to `target` (e.g. `svc/vault`) in `namespace`.
    async fn port_forward(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        target: &str,
        remote_port: u16,
        cancel: &CancellationToken,
    ) -> Result<PortForward, AdapterError>;
}

/// Root token and unseal keys of a freshly initialized Vault.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultEnvelope {
    pub root_token: Secret,
    pub unseal_keys: Vec<Secret>,
}

impl std::fmt::Debug for VaultEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultEnvelope")
            .field("unseal_keys", &self.unseal_keys.len())
            .finish()
    }
}

#[async_trait]
pub trait VaultAdapter: Send + Sync {
    /// Initialize and unseal the Vault served at `endpoint`. A Vault that
    /// reports itself initialized already yields `ResourceExists`.
    async fn initialize_and_unseal(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<VaultEnvelope, AdapterError>;
}

/// A catalog application resolved against the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogApp {
    pub name: String,
    pub secret_keys: Vec<String>,
    pub config_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSelection {
    pub apps: Vec<CatalogApp>,
    /// Requested ids the index does not list.
    pub unknown: Vec<String>,
    /// `(app, variable)` pairs whose environment variable is unset.
    pub missing: Vec<(String, String)>,
}

#[async_trait]
pub trait CatalogAdapter: Send + Sync {
    /// Resolve `apps` against the catalog index. Unknown ids are listed in
    /// `unknown`, unset secret/config variables in `missing`.
    async fn validate(
        &self,
        apps: &[String],
        env: &dyn EnvSource,
        cancel: &CancellationToken,
    ) -> Result<CatalogSelection, AdapterError>;
}

/// An SSH key pair written to disk.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: Secret,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Generate an ed25519 pair at `private_path` / `private_path.pub` (0600).
    async fn generate(
        &self,
        private_path: &Path,
        comment: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyPair, AdapterError>;

    /// Random hex token of `bytes` bytes, e.g. a webhook secret.
    fn random_token(&self, bytes: usize) -> Result<Secret, AdapterError>;
}

/// A client binary a run needs locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub version: String,
}

impl ToolSpec {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

#[async_trait]
pub trait ToolsAdapter: Send + Sync {
    /// Ensure every tool exists under `dir` (mode 0755); returns their paths.
    async fn ensure(
        &self,
        dir: &Path,
        tools: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, AdapterError>;
}

/// Everything a stage may call.
#[derive(Clone)]
pub struct Capabilities {
    pub cloud: Arc<dyn CloudAdapter>,
    pub git: Arc<dyn GitAdapter>,
    pub template: Arc<dyn TemplateAdapter>,
    pub terraform: Arc<dyn TerraformAdapter>,
    pub kube: Arc<dyn KubeAdapter>,
    pub vault: Arc<dyn VaultAdapter>,
    pub catalog: Arc<dyn CatalogAdapter>,
    pub keys: Arc<dyn KeyGenerator>,
    pub tools: Arc<dyn ToolsAdapter>,
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Credentials are read from here at stage time, never checkpointed.
    pub env: Arc<dyn EnvSource>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_port_forward_released_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let forward = PortForward::new(18200, move || flag.store(true, Ordering::SeqCst));
        assert_eq!(forward.local_url(), "http://127.0.0.1:18200");
        drop(forward);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_secrets_are_redacted() {
        let spec = SecretSpec::opaque("vault", "vault-unseal-secret").entry("root-token", "hvs.x");
        let printed = format!("{:?}", spec);
        assert!(printed.contains("root-token"));
        assert!(!printed.contains("hvs.x"));
    }
}
