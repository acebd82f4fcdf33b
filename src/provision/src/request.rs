//! Install request: the fully resolved, validated input of a run.
//!
//! Built once by the [`resolver`](crate::resolver), checkpointed with the
//! run state and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

/// Supported cloud providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    DigitalOcean,
    Vultr,
    Akamai,
    K3s,
}

impl CloudProvider {
    pub const ALL: [CloudProvider; 7] = [
        CloudProvider::Aws,
        CloudProvider::Azure,
        CloudProvider::Gcp,
        CloudProvider::DigitalOcean,
        CloudProvider::Vultr,
        CloudProvider::Akamai,
        CloudProvider::K3s,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Gcp => "gcp",
            CloudProvider::DigitalOcean => "digitalocean",
            CloudProvider::Vultr => "vultr",
            CloudProvider::Akamai => "akamai",
            CloudProvider::K3s => "k3s",
        }
    }

    /// Whether the provider can host the DNS zone itself.
    pub fn has_native_dns(&self) -> bool {
        !matches!(self, CloudProvider::K3s)
    }

    /// Default worker node type when none is given.
    pub fn default_node_type(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "t3.large",
            CloudProvider::Azure => "Standard_D2_v2",
            CloudProvider::Gcp => "e2-medium",
            CloudProvider::DigitalOcean => "s-4vcpu-8gb",
            CloudProvider::Vultr => "vc2-4c-8gb",
            CloudProvider::Akamai => "g6-standard-4",
            CloudProvider::K3s => "on-premise",
        }
    }

    pub fn default_node_count(&self) -> u32 {
        match self {
            CloudProvider::Aws => 6,
            CloudProvider::K3s => 1,
            _ => 3,
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudProvider::Aws),
            "azure" => Ok(CloudProvider::Azure),
            "gcp" | "google" => Ok(CloudProvider::Gcp),
            "digitalocean" => Ok(CloudProvider::DigitalOcean),
            "vultr" => Ok(CloudProvider::Vultr),
            "akamai" => Ok(CloudProvider::Akamai),
            "k3s" => Ok(CloudProvider::K3s),
            other => Err(format!("unknown cloud provider '{}'", other)),
        }
    }
}

/// Supported git hosting providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
    Gitlab,
}

impl GitProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitProvider::Github => "github",
            GitProvider::Gitlab => "gitlab",
        }
    }

    pub fn host(&self) -> &'static str {
        match self {
            GitProvider::Github => "github.com",
            GitProvider::Gitlab => "gitlab.com",
        }
    }

    /// Environment variable carrying the provider token.
    pub fn token_env(&self) -> &'static str {
        match self {
            GitProvider::Github => "GITHUB_TOKEN",
            GitProvider::Gitlab => "GITLAB_TOKEN",
        }
    }

    /// Name of the owner flag for this provider.
    pub fn owner_flag(&self) -> &'static str {
        match self {
            GitProvider::Github => "github-org",
            GitProvider::Gitlab => "gitlab-group",
        }
    }

    pub fn container_registry(&self) -> &'static str {
        match self {
            GitProvider::Github => "ghcr.io",
            GitProvider::Gitlab => "registry.gitlab.com",
        }
    }
}

impl std::fmt::Display for GitProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GitProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(GitProvider::Github),
            "gitlab" => Ok(GitProvider::Gitlab),
            other => Err(format!("unknown git provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GitProtocol {
    Https,
    #[default]
    Ssh,
}

impl GitProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitProtocol::Https => "https",
            GitProtocol::Ssh => "ssh",
        }
    }
}

impl FromStr for GitProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "https" => Ok(GitProtocol::Https),
            "ssh" => Ok(GitProtocol::Ssh),
            other => Err(format!("unknown git protocol '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    #[default]
    Mgmt,
    Workload,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Mgmt => "mgmt",
            ClusterType::Workload => "workload",
        }
    }
}

impl FromStr for ClusterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mgmt" | "management" => Ok(ClusterType::Mgmt),
            "workload" => Ok(ClusterType::Workload),
            other => Err(format!("unknown cluster type '{}'", other)),
        }
    }
}

/// Who hosts the DNS zone of the platform domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProvider {
    /// The cloud provider's own DNS service.
    Native,
    Cloudflare,
}

impl DnsProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsProvider::Native => "native",
            DnsProvider::Cloudflare => "cloudflare",
        }
    }

    /// Parse a dns-provider flag; the cloud's own name selects native DNS.
    pub fn parse_for(value: &str, cloud: CloudProvider) -> Result<Self, String> {
        let value = value.to_ascii_lowercase();
        if value == "cloudflare" {
            return Ok(DnsProvider::Cloudflare);
        }
        let names_cloud = value == "native"
            || CloudProvider::from_str(&value).map(|c| c == cloud).unwrap_or(false);
        if names_cloud && cloud.has_native_dns() {
            Ok(DnsProvider::Native)
        } else {
            Err(format!(
                "dns provider '{}' is not available for {}",
                value, cloud
            ))
        }
    }
}

impl std::fmt::Display for DnsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Servers of a bring-your-own k3s cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct K3sServers {
    pub private_ips: Vec<IpAddr>,
    #[serde(default)]
    pub public_ips: Vec<IpAddr>,
    pub ssh_user: String,
    pub ssh_private_key: String,
    pub server_args: Vec<String>,
}

/// Fields that only some providers use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_dns_resource_group: Option<String>,
    #[serde(default)]
    pub aws_ecr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s: Option<K3sServers>,
}

/// Immutable, validated install request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub cloud_provider: CloudProvider,
    pub cloud_region: String,
    pub cluster_name: String,
    pub cluster_type: ClusterType,
    pub dns_provider: DnsProvider,
    pub domain_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    pub git_provider: GitProvider,
    pub git_protocol: GitProtocol,
    /// GitHub organisation or GitLab group, lowercased.
    pub git_owner: String,
    pub gitops_repo_name: String,
    pub metaphor_repo_name: String,
    pub admin_team_name: String,
    pub developer_team_name: String,
    pub alerts_email: String,
    pub node_type: String,
    pub node_count: u32,
    pub template_url: String,
    pub template_branch: String,
    #[serde(default)]
    pub catalog_apps: Vec<String>,
    pub use_telemetry: bool,
    #[serde(default)]
    pub provider: ProviderFields,
}

impl InstallRequest {
    /// Domain the platform is served under: `<subdomain>.<domain>` or the domain.
    pub fn fqdn(&self) -> String {
        match &self.subdomain {
            Some(sub) => format!("{}.{}", sub, self.domain_name),
            None => self.domain_name.clone(),
        }
    }

    /// Remote URL of a repository under the configured owner.
    pub fn repo_url(&self, repo: &str) -> String {
        let host = self.git_provider.host();
        match self.git_protocol {
            GitProtocol::Ssh => format!("git@{}:{}/{}.git", host, self.git_owner, repo),
            GitProtocol::Https => format!("https://{}/{}/{}.git", host, self.git_owner, repo),
        }
    }

    pub fn gitops_repo_url(&self) -> String {
        self.repo_url(&self.gitops_repo_name)
    }

    pub fn metaphor_repo_url(&self) -> String {
        self.repo_url(&self.metaphor_repo_name)
    }

    pub fn repositories(&self) -> Vec<String> {
        vec![self.gitops_repo_name.clone(), self.metaphor_repo_name.clone()]
    }

    pub fn teams(&self) -> Vec<String> {
        vec![self.admin_team_name.clone(), self.developer_team_name.clone()]
    }

    /// Ingress host of a platform service, e.g. `argocd.<fqdn>`.
    pub fn service_host(&self, service: &str) -> String {
        format!("{}.{}", service, self.fqdn())
    }

    /// Fields that name or place remote resources and differ in `next`,
    /// with the value recorded here.
    pub fn identity_changes(&self, next: &InstallRequest) -> Vec<(&'static str, String)> {
        let fields: [(&'static str, fn(&InstallRequest) -> String); 11] = [
            ("cloud-provider", |r| r.cloud_provider.as_str().to_string()),
            ("cloud-region", |r| r.cloud_region.clone()),
            ("cluster-name", |r| r.cluster_name.clone()),
            ("cluster-type", |r| r.cluster_type.as_str().to_string()),
            ("dns-provider", |r| r.dns_provider.as_str().to_string()),
            ("domain-name", |r| r.domain_name.clone()),
            ("subdomain", |r| r.subdomain.clone().unwrap_or_default()),
            ("git-provider", |r| r.git_provider.as_str().to_string()),
            ("git-owner", |r| r.git_owner.clone()),
            ("gitops-repo-name", |r| r.gitops_repo_name.clone()),
            ("metaphor-repo-name", |r| r.metaphor_repo_name.clone()),
        ];
        fields
            .into_iter()
            .filter_map(|(field, value)| {
                let recorded = value(self);
                (recorded != value(next)).then_some((field, recorded))
            })
            .collect()
    }
}

/// Domain names: dot-separated labels of `[a-z0-9-]`, at least two labels,
/// no label starting or ending with a hyphen.
pub fn is_valid_domain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

/// Cluster names become resource names and directory names.
pub fn is_valid_cluster_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 25
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase())
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_validation() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("k1.dev.example.io"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("Example.com"));
        assert!(!is_valid_domain("a..b"));
    }

    #[test]
    fn test_cluster_name_validation() {
        assert!(is_valid_cluster_name("kubefirst"));
        assert!(is_valid_cluster_name("k1-dev-2"));
        assert!(!is_valid_cluster_name("2fast"));
        assert!(!is_valid_cluster_name("trailing-"));
        assert!(!is_valid_cluster_name("UPPER"));
    }

    #[test]
    fn test_dns_provider_parsing() {
        assert_eq!(
            DnsProvider::parse_for("aws", CloudProvider::Aws),
            Ok(DnsProvider::Native)
        );
        assert_eq!(
            DnsProvider::parse_for("cloudflare", CloudProvider::K3s),
            Ok(DnsProvider::Cloudflare)
        );
        assert!(DnsProvider::parse_for("k3s", CloudProvider::K3s).is_err());
        assert!(DnsProvider::parse_for("azure", CloudProvider::Aws).is_err());
    }

    #[test]
    fn test_google_alias() {
        assert_eq!("google".parse::<CloudProvider>(), Ok(CloudProvider::Gcp));
    }
}
