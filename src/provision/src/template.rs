/// Template support for repository preparation and in-cluster manifests
///
/// Two mechanisms: literal `<TOKEN>` replacement over the gitops/metaphor
/// working trees, and Tera rendering of the manifests the orchestrator
/// applies itself.
use crate::adapters::TokenDictionary;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::request::{GitProvider, InstallRequest};
use std::path::{Path, PathBuf};
use tera::{Context, Tera};

/// Kustomization installing Argo CD on a fresh cluster.
pub const ARGOCD_MANIFESTS: &str = "github.com:kubefirst/manifests/argocd/cloud?ref=0.1.0";

/// Root Argo CD application pointing at the cluster's registry directory.
pub static REGISTRY_APPLICATION: &str = r#"apiVersion: argoproj.io/v1alpha1
kind: Application
metadata:
  name: registry
  namespace: argocd
  annotations:
    argocd.argoproj.io/sync-wave: "1"
  labels:
    kubefirst.io/cluster: {{ cluster_name }}
spec:
  project: default
  source:
    repoURL: {{ repo_url }}
    path: registry/{{ cluster_name }}
    targetRevision: HEAD
  destination:
    server: https://kubernetes.default.svc
    namespace: argocd
  syncPolicy:
    automated:
      prune: true
      selfHeal: true
    syncOptions:
      - CreateNamespace=true
    retry:
      limit: 5
      backoff:
        duration: 5s
        factor: 2
        maxDuration: 5m0s
"#;

pub static ALL_TEMPLATES: &[(&str, &str)] = &[("registry-application.yaml", REGISTRY_APPLICATION)];

/// Simple recursive directory walker; `.git` directories are skipped.
fn walkdir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut results = Vec::new();
    if dir.is_dir() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                    continue;
                }
                results.extend(walkdir(&path)?);
            } else {
                results.push(path);
            }
        }
    }
    Ok(results)
}

/// Replace every `<TOKEN>` of `tokens` in the text files under `root`.
/// Binary files are left alone. Returns the number of files rewritten.
pub fn detokenize_tree(root: &Path, tokens: &TokenDictionary) -> std::io::Result<usize> {
    let mut changed = 0;
    for path in walkdir(root)? {
        let bytes = std::fs::read(&path)?;
        let Ok(content) = String::from_utf8(bytes) else {
            continue;
        };
        let mut replaced = content.clone();
        for (token, value) in tokens {
            if replaced.contains(token.as_str()) {
                replaced = replaced.replace(token.as_str(), value);
            }
        }
        if replaced != content {
            std::fs::write(&path, replaced)?;
            changed += 1;
        }
    }
    tracing::debug!("[Detokenize] Rewrote {} files under {:?}", changed, root);
    Ok(changed)
}

/// Placeholders of the gitops and metaphor templates for one request.
pub fn token_dictionary(
    request: &InstallRequest,
    state_store_bucket: Option<&str>,
    kubeconfig: &Path,
    version: &str,
    team: Option<&str>,
) -> TokenDictionary {
    let fqdn = request.fqdn();
    let https = |service: &str| format!("https://{}", request.service_host(service));
    let gitops_https = format!(
        "https://{}/{}/{}",
        request.git_provider.host(),
        request.git_owner,
        request.gitops_repo_name
    );
    let mut tokens = TokenDictionary::new();
    let mut put = |k: &str, v: String| {
        tokens.insert(k.to_string(), v);
    };

    put("<ALERTS_EMAIL>", request.alerts_email.clone());
    put("<CLOUD_PROVIDER>", request.cloud_provider.as_str().to_string());
    put("<CLOUD_REGION>", request.cloud_region.clone());
    put("<CLUSTER_NAME>", request.cluster_name.clone());
    put("<CLUSTER_ID>", cluster_id(request));
    put("<CLUSTER_TYPE>", request.cluster_type.as_str().to_string());
    put("<DOMAIN_NAME>", fqdn.clone());
    put("<DNS_PROVIDER>", request.dns_provider.as_str().to_string());
    put("<NODE_TYPE>", request.node_type.clone());
    put("<NODE_COUNT>", request.node_count.to_string());
    put("<GIT_PROVIDER>", request.git_provider.as_str().to_string());
    put("<GITOPS_REPO_GIT_URL>", request.gitops_repo_url());
    put("<GITOPS_REPO_NO_HTTPS_URL>", gitops_https.trim_start_matches("https://").to_string());
    put("<GITOPS_REPO_ATLANTIS_WEBHOOK_URL>", format!("{}/events", https("atlantis")));
    put("<METAPHOR_REPO_GIT_URL>", request.metaphor_repo_url());
    put("<ARGOCD_INGRESS_URL>", https("argocd"));
    put("<ARGOCD_INGRESS_NO_HTTP_URL>", request.service_host("argocd"));
    put("<ARGO_WORKFLOWS_INGRESS_URL>", https("argo"));
    put("<ATLANTIS_INGRESS_URL>", https("atlantis"));
    put("<ATLANTIS_INGRESS_NO_HTTPS_URL>", request.service_host("atlantis"));
    put("<VAULT_INGRESS_URL>", https("vault"));
    put("<VAULT_INGRESS_NO_HTTPS_URL>", request.service_host("vault"));
    put("<KUBEFIRST_CONSOLE_INGRESS_URL>", https("kubefirst"));
    put("<METAPHOR_DEVELOPMENT_INGRESS_URL>", https("metaphor-development"));
    put("<METAPHOR_STAGING_INGRESS_URL>", https("metaphor-staging"));
    put("<METAPHOR_PRODUCTION_INGRESS_URL>", https("metaphor-production"));
    put(
        "<CONTAINER_REGISTRY_URL>",
        format!("{}/{}", request.git_provider.container_registry(), request.git_owner),
    );
    put("<KUBEFIRST_STATE_STORE_BUCKET>", state_store_bucket.unwrap_or_default().to_string());
    put("<KUBEFIRST_TEAM>", team.unwrap_or("false").to_string());
    put("<KUBEFIRST_VERSION>", version.to_string());
    put("<KUBE_CONFIG_PATH>", kubeconfig.display().to_string());
    put("<USE_TELEMETRY>", request.use_telemetry.to_string());

    match request.git_provider {
        GitProvider::Github => {
            put("<GITHUB_HOST>", GitProvider::Github.host().to_string());
            put("<GITHUB_OWNER>", request.git_owner.clone());
        }
        GitProvider::Gitlab => {
            put("<GITLAB_HOST>", GitProvider::Gitlab.host().to_string());
            put("<GITLAB_OWNER>", request.git_owner.clone());
        }
    }
    tokens
}

/// Short stable identifier of an installation (6 base36 chars).
pub fn cluster_id(request: &InstallRequest) -> String {
    // FNV-1a, stable across builds so resumed runs derive the same id
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in [&request.cluster_name, &request.domain_name, &request.git_owner] {
        for byte in part.bytes().chain(std::iter::once(0u8)) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    (0..6)
        .map(|i| ALPHABET[((hash >> (i * 6)) % 36) as usize] as char)
        .collect()
}

/// Renderer for the manifests applied by the orchestrator itself.
pub struct ManifestRenderer {
    tera: Tera,
}

impl ManifestRenderer {
    pub fn from_embedded() -> Result<Self, AdapterError> {
        let mut tera = Tera::default();
        for (name, content) in ALL_TEMPLATES {
            tera.add_raw_template(name, content).map_err(|e| {
                AdapterError::new(
                    AdapterErrorKind::TemplateInvalid,
                    format!("embedded template {}: {}", name, e),
                )
            })?;
        }
        tracing::debug!("[ManifestRenderer] Loaded {} embedded templates", ALL_TEMPLATES.len());
        Ok(Self { tera })
    }

    pub fn render(&self, template_name: &str, context: &Context) -> Result<String, AdapterError> {
        self.tera.render(template_name, context).map_err(|e| {
            AdapterError::new(
                AdapterErrorKind::TemplateInvalid,
                format!("failed to render template {}: {}", template_name, e),
            )
        })
    }

    /// The root `registry` application for `request`.
    pub fn registry_application(&self, request: &InstallRequest) -> Result<String, AdapterError> {
        let mut context = Context::new();
        context.insert("cluster_name", &request.cluster_name);
        context.insert("repo_url", &request.gitops_repo_url());
        self.render("registry-application.yaml", &context)
    }
}
