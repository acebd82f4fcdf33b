//! Per-provider cloud operations.
//!
//! AWS, Azure and Google go through their CLIs so the user's configured
//! profiles apply. DigitalOcean, Vultr and Akamai are driven over REST with
//! the token from the environment. k3s has no cloud API: servers are reached
//! over SSH and terraform state stays local.

use super::exec::Exec;
use super::http;
use async_trait::async_trait;
use base64::Engine;
use provision::adapters::{CloudAdapter, StateStore};
use provision::error::{AdapterError, AdapterErrorKind};
use provision::request::{CloudProvider, DnsProvider, InstallRequest, K3sServers};
use provision::resolver::EnvSource;
use provision::template::cluster_id;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DIGITALOCEAN_API: &str = "https://api.digitalocean.com/v2";
const VULTR_API: &str = "https://api.vultr.com/v2";
const LINODE_API: &str = "https://api.linode.com/v4";
const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";
const DOH_URL: &str = "https://cloudflare-dns.com/dns-query";
const K3S_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";

/// Bucket name of a cluster's terraform state.
pub fn bucket_name(request: &InstallRequest) -> String {
    format!("k1-state-store-{}-{}", request.cluster_name, cluster_id(request))
}

/// Azure storage account names: 3-24 lowercase alphanumerics.
pub fn azure_storage_account(request: &InstallRequest) -> String {
    let mut name: String = format!("k1state{}{}", cluster_id(request), request.cluster_name)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    name.truncate(24);
    name
}

pub fn azure_resource_group(request: &InstallRequest) -> String {
    format!("k1-{}", request.cluster_name)
}

/// Point a k3s kubeconfig at the server's public address.
pub fn rewrite_k3s_kubeconfig(raw: &str, public_ip: &str) -> String {
    raw.replace("127.0.0.1", public_ip)
}

/// How the zone of a domain is checked before anything is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneCheck {
    /// The Cloudflare account behind `CF_API_TOKEN` holds the zone.
    CloudflareAccount,
    /// Public resolvers return NS records for the cloud's own zone.
    Authoritative,
}

pub fn zone_check(dns: DnsProvider) -> ZoneCheck {
    match dns {
        DnsProvider::Cloudflare => ZoneCheck::CloudflareAccount,
        DnsProvider::Native => ZoneCheck::Authoritative,
    }
}

/// Zones that could hold `domain`, most specific first; stops at two labels.
pub fn candidate_zones(domain: &str) -> Vec<String> {
    let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    (0..labels.len().saturating_sub(1))
        .map(|i| labels[i..].join("."))
        .collect()
}

fn invalid_response(what: &str) -> AdapterError {
    AdapterError::new(AdapterErrorKind::CommandFailed, format!("{}: unexpected response", what))
}

fn io_error(path: &Path, e: std::io::Error) -> AdapterError {
    AdapterError::new(AdapterErrorKind::CommandFailed, format!("{:?}: {}", path, e))
}

/// A failed probe command means the credentials were refused.
fn as_auth(e: AdapterError) -> AdapterError {
    match e.kind {
        AdapterErrorKind::CommandFailed => AdapterError {
            kind: AdapterErrorKind::AuthInvalid,
            message: e.message,
            stderr_tail: e.stderr_tail,
        },
        _ => e,
    }
}

fn already_exists(e: &AdapterError, markers: &[&str]) -> bool {
    e.kind == AdapterErrorKind::ResourceExists
        || e.stderr_tail
            .as_deref()
            .map(|s| markers.iter().any(|m| s.contains(m)))
            .unwrap_or(false)
}

fn gone(e: &AdapterError, markers: &[&str]) -> bool {
    e.kind == AdapterErrorKind::NotFound
        || e.stderr_tail
            .as_deref()
            .map(|s| markers.iter().any(|m| s.contains(m)))
            .unwrap_or(false)
}

async fn write_kubeconfig(dest: &Path, content: &[u8]) -> Result<(), AdapterError> {
    if let Some(dir) = dest.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| io_error(dir, e))?;
    }
    tokio::fs::write(dest, content).await.map_err(|e| io_error(dest, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| io_error(dest, e))?;
    }
    Ok(())
}

pub struct ProviderCloud {
    provider: CloudProvider,
    client: Client,
    env: Arc<dyn EnvSource>,
}

impl ProviderCloud {
    pub fn new(provider: CloudProvider, env: Arc<dyn EnvSource>) -> Result<Self, AdapterError> {
        Ok(Self {
            provider,
            client: http::client()?,
            env,
        })
    }

    fn token(&self, key: &str) -> Result<String, AdapterError> {
        self.env.var(key).ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::CredentialsMissing, format!("{} is not set", key))
        })
    }

    fn rest_token(&self) -> Result<(&'static str, String), AdapterError> {
        match self.provider {
            CloudProvider::DigitalOcean => Ok((DIGITALOCEAN_API, self.token("DO_TOKEN")?)),
            CloudProvider::Vultr => Ok((VULTR_API, self.token("VULTR_API_KEY")?)),
            CloudProvider::Akamai => Ok((LINODE_API, self.token("LINODE_TOKEN")?)),
            other => Err(AdapterError::new(
                AdapterErrorKind::CommandFailed,
                format!("{} has no REST client", other),
            )),
        }
    }

    fn rest(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder, AdapterError> {
        let (base, token) = self.rest_token()?;
        Ok(self
            .client
            .request(method, format!("{}{}", base, path))
            .bearer_auth(token))
    }

    /// `aws` invocation against DigitalOcean Spaces, which speak S3.
    fn spaces(&self, region: &str) -> Result<Exec, AdapterError> {
        Ok(Exec::new("aws")
            .env("AWS_ACCESS_KEY_ID", self.token("DO_SPACES_KEY")?)
            .env("AWS_SECRET_ACCESS_KEY", self.token("DO_SPACES_SECRET")?)
            .arg("--endpoint-url")
            .arg(spaces_endpoint(region)))
    }

    fn k3s_servers(request: &InstallRequest) -> Result<&K3sServers, AdapterError> {
        request.provider.k3s.as_ref().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::CredentialsMissing, "k3s server settings are missing")
        })
    }

    fn ssh(servers: &K3sServers, host: &str) -> Exec {
        Exec::new("ssh").args([
            "-i",
            servers.ssh_private_key.as_str(),
            "-o",
            "BatchMode=yes",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "StrictHostKeyChecking=accept-new",
        ])
        .arg(format!("{}@{}", servers.ssh_user, host))
    }

    /// Address the workstation uses to reach the first server.
    fn k3s_host(servers: &K3sServers) -> Result<String, AdapterError> {
        servers
            .public_ips
            .first()
            .or_else(|| servers.private_ips.first())
            .map(|ip| ip.to_string())
            .ok_or_else(|| AdapterError::new(AdapterErrorKind::CredentialsMissing, "no k3s server address"))
    }

    /// Id of the managed cluster labelled `name` in a REST listing.
    async fn find_cluster_id(
        &self,
        path: &str,
        list_key: &str,
        name_key: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AdapterError> {
        let body: Value = http::json(self.rest(reqwest::Method::GET, path)?, "list clusters", cancel).await?;
        let clusters = body.get(list_key).and_then(Value::as_array).ok_or_else(|| invalid_response("list clusters"))?;
        clusters
            .iter()
            .find(|c| c.get(name_key).and_then(Value::as_str) == Some(name))
            .and_then(|c| c.get("id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| AdapterError::new(AdapterErrorKind::NotFound, format!("cluster '{}' not found", name)))
    }

    async fn zone_is_live(&self, domain: &str, cancel: &CancellationToken) -> Result<(), AdapterError> {
        let request = self
            .client
            .get(DOH_URL)
            .header("accept", "application/dns-json")
            .query(&[("name", domain), ("type", "NS")]);
        let body: Value = http::json(request, "dns lookup", cancel).await?;
        // NOERROR with answers, or an authority section when the name sits below the zone apex
        let status = body.get("Status").and_then(Value::as_u64).unwrap_or(u64::MAX);
        let answered = ["Answer", "Authority"].iter().any(|section| {
            body.get(*section)
                .and_then(Value::as_array)
                .map(|records| !records.is_empty())
                .unwrap_or(false)
        });
        if status == 0 && answered {
            Ok(())
        } else {
            Err(AdapterError::new(
                AdapterErrorKind::ZoneNotFound,
                format!("{} does not resolve to a live zone", domain),
            ))
        }
    }

    async fn cloudflare_zone(&self, domain: &str, cancel: &CancellationToken) -> Result<(), AdapterError> {
        let token = self.token("CF_API_TOKEN")?;
        for zone in candidate_zones(domain) {
            let request = self
                .client
                .get(format!("{}/zones", CLOUDFLARE_API))
                .bearer_auth(&token)
                .query(&[("name", zone.as_str())]);
            let body: Value = http::json(request, "cloudflare zones", cancel).await?;
            let found = body
                .get("result")
                .and_then(Value::as_array)
                .map(|zones| !zones.is_empty())
                .unwrap_or(false);
            if found {
                tracing::info!("[Cloud] Cloudflare zone {} serves {}", zone, domain);
                return Ok(());
            }
        }
        Err(AdapterError::new(
            AdapterErrorKind::ZoneNotFound,
            format!("no Cloudflare zone visible to the token serves {}", domain),
        ))
    }
}

fn spaces_endpoint(region: &str) -> String {
    format!("https://{}.digitaloceanspaces.com", region)
}

#[async_trait]
impl CloudAdapter for ProviderCloud {
    async fn probe_credentials(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        match self.provider {
            CloudProvider::Aws => {
                Exec::new("aws")
                    .args(["sts", "get-caller-identity", "--output", "json"])
                    .output(cancel)
                    .await
                    .map_err(as_auth)?;
            }
            CloudProvider::Azure => {
                Exec::new("az")
                    .args(["account", "show", "--output", "json"])
                    .output(cancel)
                    .await
                    .map_err(as_auth)?;
            }
            CloudProvider::Gcp => {
                let project = request.provider.google_project.clone().unwrap_or_default();
                Exec::new("gcloud")
                    .args(["projects", "describe", project.as_str(), "--format", "value(projectId)"])
                    .output(cancel)
                    .await
                    .map_err(as_auth)?;
            }
            CloudProvider::DigitalOcean => {
                http::send(self.rest(reqwest::Method::GET, "/account")?, "digitalocean account", cancel).await?;
            }
            CloudProvider::Vultr => {
                http::send(self.rest(reqwest::Method::GET, "/account")?, "vultr account", cancel).await?;
            }
            CloudProvider::Akamai => {
                http::send(self.rest(reqwest::Method::GET, "/profile")?, "linode profile", cancel).await?;
            }
            CloudProvider::K3s => {
                let servers = Self::k3s_servers(request)?;
                if !Path::new(&servers.ssh_private_key).is_file() {
                    return Err(AdapterError::new(
                        AdapterErrorKind::CredentialsMissing,
                        format!("ssh private key {} does not exist", servers.ssh_private_key),
                    ));
                }
                let host = Self::k3s_host(servers)?;
                Self::ssh(servers, &host)
                    .arg("true")
                    .output(cancel)
                    .await
                    .map_err(as_auth)?;
            }
        }
        tracing::info!("[Cloud] {} accepted the credentials", self.provider);
        Ok(())
    }

    async fn create_state_store(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<StateStore, AdapterError> {
        let bucket = bucket_name(request);
        let region = request.cloud_region.as_str();
        let endpoint = match self.provider {
            CloudProvider::Aws => {
                let mut create = Exec::new("aws").args(["s3api", "create-bucket", "--bucket", bucket.as_str(), "--region", region]);
                if region != "us-east-1" {
                    create = create
                        .arg("--create-bucket-configuration")
                        .arg(format!("LocationConstraint={}", region));
                }
                match create.output(cancel).await {
                    Err(e) if !already_exists(&e, &["BucketAlreadyOwnedByYou"]) => return Err(e),
                    _ => {}
                }
                Exec::new("aws")
                    .args([
                        "s3api",
                        "put-bucket-versioning",
                        "--bucket",
                        bucket.as_str(),
                        "--versioning-configuration",
                        "Status=Enabled",
                    ])
                    .output(cancel)
                    .await?;
                None
            }
            CloudProvider::Gcp => {
                let project = request.provider.google_project.clone().unwrap_or_default();
                let result = Exec::new("gcloud")
                    .args(["storage", "buckets", "create"])
                    .arg(format!("gs://{}", bucket))
                    .args(["--project", project.as_str(), "--location", region])
                    .output(cancel)
                    .await;
                match result {
                    Err(e) if !already_exists(&e, &["already own it", "409"]) => return Err(e),
                    _ => {}
                }
                None
            }
            CloudProvider::Azure => {
                let group = azure_resource_group(request);
                let account = azure_storage_account(request);
                Exec::new("az")
                    .args(["group", "create", "--name", group.as_str(), "--location", region, "--output", "none"])
                    .output(cancel)
                    .await?;
                Exec::new("az")
                    .args([
                        "storage",
                        "account",
                        "create",
                        "--name",
                        account.as_str(),
                        "--resource-group",
                        group.as_str(),
                        "--location",
                        region,
                        "--sku",
                        "Standard_LRS",
                        "--output",
                        "none",
                    ])
                    .output(cancel)
                    .await?;
                let result = Exec::new("az")
                    .args([
                        "storage",
                        "container",
                        "create",
                        "--name",
                        bucket.as_str(),
                        "--account-name",
                        account.as_str(),
                        "--auth-mode",
                        "login",
                        "--output",
                        "none",
                    ])
                    .output(cancel)
                    .await;
                match result {
                    Err(e) if !already_exists(&e, &["ContainerAlreadyExists"]) => return Err(e),
                    _ => {}
                }
                Some(account)
            }
            CloudProvider::DigitalOcean => {
                let result = self
                    .spaces(region)?
                    .args(["s3api", "create-bucket", "--bucket", bucket.as_str()])
                    .output(cancel)
                    .await;
                match result {
                    Err(e) if !already_exists(&e, &["BucketAlreadyOwnedByYou", "BucketAlreadyExists"]) => {
                        return Err(e)
                    }
                    _ => {}
                }
                Some(spaces_endpoint(region))
            }
            CloudProvider::Vultr => {
                let clusters: Value = http::json(
                    self.rest(reqwest::Method::GET, "/object-storage/clusters")?,
                    "object storage clusters",
                    cancel,
                )
                .await?;
                let cluster = clusters
                    .get("clusters")
                    .and_then(Value::as_array)
                    .and_then(|all| all.iter().find(|c| c.get("region").and_then(Value::as_str) == Some(region)))
                    .ok_or_else(|| {
                        AdapterError::new(
                            AdapterErrorKind::NotFound,
                            format!("vultr has no object storage in {}", region),
                        )
                    })?;
                let cluster_id = cluster.get("id").cloned().unwrap_or(Value::Null);
                let hostname = cluster.get("hostname").and_then(Value::as_str).unwrap_or_default().to_string();
                let result = http::send(
                    self.rest(reqwest::Method::POST, "/object-storage")?
                        .json(&json!({"cluster_id": cluster_id, "label": bucket})),
                    "create object storage",
                    cancel,
                )
                .await;
                match result {
                    Err(e) if !already_exists(&e, &[]) => return Err(e),
                    _ => {}
                }
                Some(format!("https://{}", hostname))
            }
            CloudProvider::Akamai => {
                let cluster = format!("{}-1", region);
                let result = http::send(
                    self.rest(reqwest::Method::POST, "/object-storage/buckets")?
                        .json(&json!({"label": bucket, "cluster": cluster})),
                    "create bucket",
                    cancel,
                )
                .await;
                match result {
                    Err(e) if !already_exists(&e, &["already exists"]) => return Err(e),
                    _ => {}
                }
                Some(format!("https://{}.linodeobjects.com", cluster))
            }
            CloudProvider::K3s => {
                tracing::info!("[Cloud] k3s keeps terraform state on the workstation");
                None
            }
        };
        tracing::info!("[Cloud] State store {} ready", bucket);
        Ok(StateStore {
            bucket_name: bucket,
            endpoint,
        })
    }

    async fn delete_state_store(
        &self,
        request: &InstallRequest,
        bucket_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let region = request.cloud_region.as_str();
        let result = match self.provider {
            CloudProvider::Aws => Exec::new("aws")
                .args(["s3", "rb"])
                .arg(format!("s3://{}", bucket_name))
                .arg("--force")
                .output(cancel)
                .await
                .map(drop),
            CloudProvider::Gcp => Exec::new("gcloud")
                .args(["storage", "rm", "--recursive"])
                .arg(format!("gs://{}", bucket_name))
                .output(cancel)
                .await
                .map(drop),
            CloudProvider::Azure => {
                let group = azure_resource_group(request);
                let account = azure_storage_account(request);
                Exec::new("az")
                    .args([
                        "storage",
                        "account",
                        "delete",
                        "--name",
                        account.as_str(),
                        "--resource-group",
                        group.as_str(),
                        "--yes",
                    ])
                    .output(cancel)
                    .await
                    .map(drop)
            }
            CloudProvider::DigitalOcean => self
                .spaces(region)?
                .args(["s3", "rb"])
                .arg(format!("s3://{}", bucket_name))
                .arg("--force")
                .output(cancel)
                .await
                .map(drop),
            CloudProvider::Vultr => {
                let body: Value = http::json(
                    self.rest(reqwest::Method::GET, "/object-storage")?,
                    "list object storage",
                    cancel,
                )
                .await?;
                let id = body
                    .get("object_storages")
                    .and_then(Value::as_array)
                    .and_then(|all| all.iter().find(|s| s.get("label").and_then(Value::as_str) == Some(bucket_name)))
                    .and_then(|s| s.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match id {
                    Some(id) => http::send(
                        self.rest(reqwest::Method::DELETE, &format!("/object-storage/{}", id))?,
                        "delete object storage",
                        cancel,
                    )
                    .await
                    .map(drop),
                    None => Ok(()),
                }
            }
            CloudProvider::Akamai => http::send(
                self.rest(
                    reqwest::Method::DELETE,
                    &format!("/object-storage/buckets/{}-1/{}", region, bucket_name),
                )?,
                "delete bucket",
                cancel,
            )
            .await
            .map(drop),
            CloudProvider::K3s => Ok(()),
        };
        match result {
            Err(e) if gone(&e, &["NoSuchBucket", "not found", "NotFound"]) => {
                tracing::info!("[Cloud] State store {} already gone", bucket_name);
                Ok(())
            }
            Err(e) => Err(e),
            Ok(()) => {
                tracing::info!("[Cloud] Deleted state store {}", bucket_name);
                Ok(())
            }
        }
    }

    async fn verify_zone(
        &self,
        dns: DnsProvider,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        match zone_check(dns) {
            ZoneCheck::CloudflareAccount => self.cloudflare_zone(domain, cancel).await?,
            ZoneCheck::Authoritative => self.zone_is_live(domain, cancel).await?,
        }
        tracing::info!("[Cloud] Zone for {} verified ({:?})", domain, zone_check(dns));
        Ok(())
    }

    async fn fetch_kubeconfig(
        &self,
        request: &InstallRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let name = request.cluster_name.as_str();
        let region = request.cloud_region.as_str();
        let dest_str = dest.display().to_string();
        match self.provider {
            CloudProvider::Aws => {
                Exec::new("aws")
                    .args(["eks", "update-kubeconfig", "--name", name, "--region", region, "--kubeconfig"])
                    .arg(dest_str)
                    .output(cancel)
                    .await?;
            }
            CloudProvider::Gcp => {
                let project = request.provider.google_project.clone().unwrap_or_default();
                Exec::new("gcloud")
                    .args(["container", "clusters", "get-credentials", name, "--region", region, "--project"])
                    .arg(project)
                    .env("KUBECONFIG", dest_str)
                    .output(cancel)
                    .await?;
            }
            CloudProvider::Azure => {
                let group = azure_resource_group(request);
                Exec::new("az")
                    .args(["aks", "get-credentials", "--name", name, "--resource-group", group.as_str()])
                    .args(["--overwrite-existing", "--file"])
                    .arg(dest_str)
                    .output(cancel)
                    .await?;
            }
            CloudProvider::DigitalOcean => {
                let id = self.find_cluster_id("/kubernetes/clusters", "kubernetes_clusters", "name", name, cancel).await?;
                let response = http::send(
                    self.rest(reqwest::Method::GET, &format!("/kubernetes/clusters/{}/kubeconfig", id))?,
                    "kubeconfig",
                    cancel,
                )
                .await?;
                let raw = response
                    .bytes()
                    .await
                    .map_err(|e| AdapterError::transient(format!("kubeconfig: {}", e)))?;
                write_kubeconfig(dest, &raw).await?;
            }
            CloudProvider::Vultr | CloudProvider::Akamai => {
                let (list, list_key, name_key, config_path, config_key) = if self.provider == CloudProvider::Vultr {
                    ("/kubernetes/clusters", "vke_clusters", "label", "config", "kube_config")
                } else {
                    ("/lke/clusters", "data", "label", "kubeconfig", "kubeconfig")
                };
                let id = self.find_cluster_id(list, list_key, name_key, name, cancel).await?;
                let body: Value = http::json(
                    self.rest(reqwest::Method::GET, &format!("{}/{}/{}", list, id, config_path))?,
                    "kubeconfig",
                    cancel,
                )
                .await?;
                let encoded = body
                    .get(config_key)
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid_response("kubeconfig"))?;
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| AdapterError::new(AdapterErrorKind::CommandFailed, format!("kubeconfig: {}", e)))?;
                write_kubeconfig(dest, &raw).await?;
            }
            CloudProvider::K3s => {
                let servers = Self::k3s_servers(request)?;
                let host = Self::k3s_host(servers)?;
                let raw = Self::ssh(servers, &host)
                    .args(["sudo", "cat", K3S_KUBECONFIG])
                    .output(cancel)
                    .await?;
                write_kubeconfig(dest, rewrite_k3s_kubeconfig(&raw, &host).as_bytes()).await?;
            }
        }
        tracing::info!("[Cloud] Wrote kubeconfig for {} to {:?}", name, dest);
        Ok(())
    }
}
