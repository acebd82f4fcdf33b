//! Flag/config resolver: user input + environment -> [`InstallRequest`].
//!
//! Sources in priority order: explicit command-line values, `K1_<FLAG>`
//! environment variables, and the request checkpointed by a previous run.
//! Every problem is collected so the user sees them all at once.

use crate::error::{FieldIssue, ValidationError};
use crate::request::{
    is_valid_cluster_name, is_valid_domain, CloudProvider, ClusterType, DnsProvider,
    GitProtocol, GitProvider, InstallRequest, K3sServers, ProviderFields,
};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

pub const DEFAULT_CLUSTER_NAME: &str = "kubefirst";
pub const DEFAULT_TEMPLATE_URL: &str = "https://github.com/kubefirst/gitops-template.git";
pub const DEFAULT_TEMPLATE_BRANCH: &str = "main";
/// Version string of builds that do not pin the template branch.
pub const DEVELOPMENT_VERSION: &str = "development";
pub const DEFAULT_K3S_SSH_USER: &str = "root";
pub const DEFAULT_K3S_SERVER_ARGS: [&str; 2] = ["--disable traefik", "--write-kubeconfig-mode 644"];

/// Read access to environment variables.
pub trait EnvSource: Send + Sync {
    /// Value of `key`; empty values count as unset.
    fn var(&self, key: &str) -> Option<String>;

    fn is_set(&self, key: &str) -> bool {
        self.var(key).is_some()
    }
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

/// Raw flag values of a `create` invocation. Unset flags are `None`/empty.
#[derive(Debug, Clone, Default)]
pub struct FlagValues {
    pub cloud_region: Option<String>,
    pub cluster_name: Option<String>,
    pub cluster_type: Option<String>,
    pub dns_provider: Option<String>,
    pub domain_name: Option<String>,
    pub subdomain: Option<String>,
    pub git_provider: Option<String>,
    pub git_protocol: Option<String>,
    pub github_org: Option<String>,
    pub gitlab_group: Option<String>,
    pub gitops_repo_name: Option<String>,
    pub metaphor_repo_name: Option<String>,
    pub admin_team_name: Option<String>,
    pub developer_team_name: Option<String>,
    pub alerts_email: Option<String>,
    pub node_type: Option<String>,
    pub node_count: Option<String>,
    pub gitops_template_url: Option<String>,
    pub gitops_template_branch: Option<String>,
    pub install_catalog_apps: Option<String>,
    pub use_telemetry: Option<bool>,
    pub google_project: Option<String>,
    pub azure_dns_resource_group: Option<String>,
    pub ecr: Option<bool>,
    pub servers_private_ips: Vec<String>,
    pub servers_public_ips: Vec<String>,
    pub ssh_user: Option<String>,
    pub ssh_privatekey: Option<String>,
    pub servers_args: Vec<String>,
}

/// Environment variable that can stand in for a flag: `K1_<FLAG>`.
pub fn flag_env_name(flag: &str) -> String {
    format!("K1_{}", flag.replace('-', "_").to_ascii_uppercase())
}

/// Credential variables a cloud provider's adapters and terraform modules read.
pub fn cloud_credential_vars(cloud: CloudProvider) -> &'static [&'static str] {
    match cloud {
        CloudProvider::Aws => &[
            "AWS_PROFILE",
            "AWS_ACCESS_KEY_ID",
            "AWS_SECRET_ACCESS_KEY",
            "AWS_SESSION_TOKEN",
        ],
        CloudProvider::Azure => &[
            "ARM_CLIENT_ID",
            "ARM_CLIENT_SECRET",
            "ARM_TENANT_ID",
            "ARM_SUBSCRIPTION_ID",
        ],
        CloudProvider::Gcp => &["GOOGLE_APPLICATION_CREDENTIALS"],
        CloudProvider::DigitalOcean => &["DO_TOKEN", "DO_SPACES_KEY", "DO_SPACES_SECRET"],
        CloudProvider::Vultr => &["VULTR_API_KEY"],
        CloudProvider::Akamai => &["LINODE_TOKEN"],
        CloudProvider::K3s => &[],
    }
}

/// Required credential variables that are not set.
///
/// The Cloudflare token is only required when Cloudflare hosts the zone.
pub fn missing_credentials(
    cloud: CloudProvider,
    git: GitProvider,
    dns: DnsProvider,
    env: &dyn EnvSource,
) -> Vec<String> {
    let mut missing = Vec::new();
    match cloud {
        CloudProvider::Aws => {
            let keys = env.is_set("AWS_ACCESS_KEY_ID") && env.is_set("AWS_SECRET_ACCESS_KEY");
            if !keys && !env.is_set("AWS_PROFILE") {
                missing.push("AWS_PROFILE or AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY".to_string());
            }
        }
        other => {
            for var in cloud_credential_vars(other) {
                if !env.is_set(var) {
                    missing.push(var.to_string());
                }
            }
        }
    }
    if !env.is_set(git.token_env()) {
        missing.push(git.token_env().to_string());
    }
    if dns == DnsProvider::Cloudflare && !env.is_set("CF_API_TOKEN") {
        missing.push("CF_API_TOKEN".to_string());
    }
    missing
}

fn is_email(value: &str) -> bool {
    value.contains('@') && !value.starts_with('@') && !value.ends_with('@')
}

/// Resolves [`FlagValues`] into an [`InstallRequest`] for one cloud provider.
pub struct FlagResolver<'a> {
    cloud: CloudProvider,
    env: &'a dyn EnvSource,
    previous: Option<&'a InstallRequest>,
    version: String,
}

struct Issues(Vec<FieldIssue>);

impl Issues {
    fn push(&mut self, field: &str, problem: impl Into<String>) {
        self.0.push(FieldIssue {
            field: field.to_string(),
            problem: problem.into(),
        });
    }
}

impl<'a> FlagResolver<'a> {
    pub fn new(cloud: CloudProvider, env: &'a dyn EnvSource) -> Self {
        Self {
            cloud,
            env,
            previous: None,
            version: DEVELOPMENT_VERSION.to_string(),
        }
    }

    /// Fall back to the request checkpointed by an earlier run.
    pub fn with_previous(mut self, previous: Option<&'a InstallRequest>) -> Self {
        self.previous = previous.filter(|p| p.cloud_provider == self.cloud);
        self
    }

    /// Version of the running binary; selects the template branch default.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn pick(&self, flag: &str, cli: &Option<String>, previous: Option<String>) -> Option<String> {
        cli.as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| self.env.var(&flag_env_name(flag)))
            .or(previous)
    }

    fn pick_list(&self, flag: &str, cli: &[String], previous: Option<Vec<String>>) -> Vec<String> {
        let split = |raw: &str| -> Vec<String> {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let from_cli: Vec<String> = cli.iter().flat_map(|v| split(v)).collect();
        if !from_cli.is_empty() {
            return from_cli;
        }
        if let Some(raw) = self.env.var(&flag_env_name(flag)) {
            return split(&raw);
        }
        previous.unwrap_or_default()
    }

    fn pick_bool(
        &self,
        flag: &str,
        cli: Option<bool>,
        previous: Option<bool>,
        issues: &mut Issues,
    ) -> Option<bool> {
        if cli.is_some() {
            return cli;
        }
        if let Some(raw) = self.env.var(&flag_env_name(flag)) {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => return Some(true),
                "0" | "false" | "no" => return Some(false),
                _ => issues.push(flag, format!("'{}' is not a boolean", raw)),
            }
        }
        previous
    }

    pub fn resolve(&self, flags: &FlagValues) -> Result<InstallRequest, ValidationError> {
        let prev = self.previous;
        let mut issues = Issues(Vec::new());

        let cluster_name = self
            .pick("cluster-name", &flags.cluster_name, prev.map(|p| p.cluster_name.clone()))
            .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string());
        if !is_valid_cluster_name(&cluster_name) {
            issues.push(
                "cluster-name",
                "must start with a lowercase letter and contain only [a-z0-9-], \
                 at most 25 characters",
            );
        }

        let cluster_type = self
            .pick(
                "cluster-type",
                &flags.cluster_type,
                prev.map(|p| p.cluster_type.as_str().to_string()),
            )
            .map(|v| ClusterType::from_str(&v))
            .transpose()
            .unwrap_or_else(|e| {
                issues.push("cluster-type", e);
                None
            })
            .unwrap_or_default();

        let git_provider = self
            .pick(
                "git-provider",
                &flags.git_provider,
                prev.map(|p| p.git_provider.as_str().to_string()),
            )
            .map(|v| GitProvider::from_str(&v))
            .transpose()
            .unwrap_or_else(|e| {
                issues.push("git-provider", e);
                None
            })
            .unwrap_or(GitProvider::Github);

        let git_protocol = self
            .pick(
                "git-protocol",
                &flags.git_protocol,
                prev.map(|p| p.git_protocol.as_str().to_string()),
            )
            .map(|v| GitProtocol::from_str(&v))
            .transpose()
            .unwrap_or_else(|e| {
                issues.push("git-protocol", e);
                None
            })
            .unwrap_or_else(|| default_protocol(git_provider));

        let prev_owner = prev
            .filter(|p| p.git_provider == git_provider)
            .map(|p| p.git_owner.clone());
        let owner_flag = match git_provider {
            GitProvider::Github => &flags.github_org,
            GitProvider::Gitlab => &flags.gitlab_group,
        };
        let git_owner = match self.pick(git_provider.owner_flag(), owner_flag, prev_owner) {
            Some(owner) => owner.to_ascii_lowercase(),
            None => {
                issues.push(
                    git_provider.owner_flag(),
                    format!("required when git-provider is {}", git_provider),
                );
                String::new()
            }
        };

        let domain_name = self
            .pick("domain-name", &flags.domain_name, prev.map(|p| p.domain_name.clone()))
            .map(|d| d.trim_end_matches('.').to_ascii_lowercase());
        let domain_name = match domain_name {
            Some(domain) if is_valid_domain(&domain) => domain,
            Some(domain) => {
                issues.push("domain-name", format!("'{}' is not a valid DNS name", domain));
                domain
            }
            None => {
                issues.push("domain-name", "required");
                String::new()
            }
        };

        let subdomain = self
            .pick("subdomain", &flags.subdomain, prev.and_then(|p| p.subdomain.clone()))
            .map(|s| s.to_ascii_lowercase());
        if let Some(sub) = &subdomain {
            if !is_valid_domain(&format!("{}.example.com", sub)) {
                issues.push("subdomain", format!("'{}' is not a valid DNS label", sub));
            }
        }

        let default_dns = if self.cloud.has_native_dns() {
            DnsProvider::Native
        } else {
            DnsProvider::Cloudflare
        };
        let dns_provider = match self.pick(
            "dns-provider",
            &flags.dns_provider,
            prev.map(|p| p.dns_provider.as_str().to_string()),
        ) {
            Some(raw) => DnsProvider::parse_for(&raw, self.cloud).unwrap_or_else(|e| {
                issues.push("dns-provider", e);
                default_dns
            }),
            None => default_dns,
        };

        let region = self.pick(
            "cloud-region",
            &flags.cloud_region,
            prev.map(|p| p.cloud_region.clone()),
        );
        let cloud_region = match region {
            Some(region) => region,
            None if self.cloud == CloudProvider::K3s => "on-premise".to_string(),
            None => {
                issues.push("cloud-region", format!("required for {}", self.cloud));
                String::new()
            }
        };

        let email = self.pick(
            "alerts-email",
            &flags.alerts_email,
            prev.map(|p| p.alerts_email.clone()),
        );
        let alerts_email = match email {
            Some(email) if is_email(&email) => email,
            Some(email) => {
                issues.push("alerts-email", format!("'{}' is not an email address", email));
                email
            }
            None => {
                issues.push("alerts-email", "required");
                String::new()
            }
        };

        let node_type = self
            .pick("node-type", &flags.node_type, prev.map(|p| p.node_type.clone()))
            .unwrap_or_else(|| self.cloud.default_node_type().to_string());
        let count = self.pick(
            "node-count",
            &flags.node_count,
            prev.map(|p| p.node_count.to_string()),
        );
        let node_count = match count {
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    issues.push("node-count", format!("'{}' is not a positive integer", raw));
                    self.cloud.default_node_count()
                }
            },
            None => self.cloud.default_node_count(),
        };

        let template_url = self
            .pick(
                "gitops-template-url",
                &flags.gitops_template_url,
                prev.map(|p| p.template_url.clone()),
            )
            .unwrap_or_else(|| DEFAULT_TEMPLATE_URL.to_string());
        let template_branch = self
            .pick(
                "gitops-template-branch",
                &flags.gitops_template_branch,
                prev.map(|p| p.template_branch.clone()),
            )
            .unwrap_or_else(|| {
                if self.version == DEVELOPMENT_VERSION {
                    DEFAULT_TEMPLATE_BRANCH.to_string()
                } else {
                    self.version.clone()
                }
            });

        let catalog_apps = self.pick_list(
            "install-catalog-apps",
            flags.install_catalog_apps.as_slice(),
            prev.map(|p| p.catalog_apps.clone()),
        );

        let use_telemetry = self
            .pick_bool(
                "use-telemetry",
                flags.use_telemetry,
                prev.map(|p| p.use_telemetry),
                &mut issues,
            )
            .unwrap_or(true);

        let provider = self.resolve_provider_fields(flags, dns_provider, &mut issues);

        for var in missing_credentials(self.cloud, git_provider, dns_provider, self.env) {
            issues.push(&var, "required environment variable is not set");
        }

        if !issues.0.is_empty() {
            return Err(ValidationError { issues: issues.0 });
        }

        Ok(InstallRequest {
            cloud_provider: self.cloud,
            cloud_region,
            cluster_name,
            cluster_type,
            dns_provider,
            domain_name,
            subdomain,
            git_provider,
            git_protocol,
            git_owner,
            gitops_repo_name: self
                .pick(
                    "gitops-repo-name",
                    &flags.gitops_repo_name,
                    prev.map(|p| p.gitops_repo_name.clone()),
                )
                .unwrap_or_else(|| "gitops".to_string()),
            metaphor_repo_name: self
                .pick(
                    "metaphor-repo-name",
                    &flags.metaphor_repo_name,
                    prev.map(|p| p.metaphor_repo_name.clone()),
                )
                .unwrap_or_else(|| "metaphor".to_string()),
            admin_team_name: self
                .pick(
                    "admin-team-name",
                    &flags.admin_team_name,
                    prev.map(|p| p.admin_team_name.clone()),
                )
                .unwrap_or_else(|| "admins".to_string()),
            developer_team_name: self
                .pick(
                    "developer-team-name",
                    &flags.developer_team_name,
                    prev.map(|p| p.developer_team_name.clone()),
                )
                .unwrap_or_else(|| "developers".to_string()),
            alerts_email,
            node_type,
            node_count,
            template_url,
            template_branch,
            catalog_apps,
            use_telemetry,
            provider,
        })
    }

    fn resolve_provider_fields(
        &self,
        flags: &FlagValues,
        dns: DnsProvider,
        issues: &mut Issues,
    ) -> ProviderFields {
        let prev = self.previous.map(|p| &p.provider);
        let mut fields = ProviderFields::default();

        match self.cloud {
            CloudProvider::Gcp => {
                fields.google_project = self.pick(
                    "google-project",
                    &flags.google_project,
                    prev.and_then(|p| p.google_project.clone()),
                );
                if fields.google_project.is_none() {
                    issues.push("google-project", "required for gcp");
                }
            }
            CloudProvider::Azure => {
                fields.azure_dns_resource_group = self.pick(
                    "dns-azure-resource-group",
                    &flags.azure_dns_resource_group,
                    prev.and_then(|p| p.azure_dns_resource_group.clone()),
                );
                if dns == DnsProvider::Native && fields.azure_dns_resource_group.is_none() {
                    issues.push("dns-azure-resource-group", "required when azure hosts the zone");
                }
            }
            CloudProvider::Aws => {
                fields.aws_ecr = self
                    .pick_bool("ecr", flags.ecr, prev.map(|p| p.aws_ecr), issues)
                    .unwrap_or(false);
            }
            CloudProvider::K3s => {
                fields.k3s = self.resolve_k3s(flags, prev.and_then(|p| p.k3s.as_ref()), issues);
            }
            CloudProvider::DigitalOcean | CloudProvider::Vultr | CloudProvider::Akamai => {}
        }
        fields
    }

    fn resolve_k3s(
        &self,
        flags: &FlagValues,
        prev: Option<&K3sServers>,
        issues: &mut Issues,
    ) -> Option<K3sServers> {
        let to_strings = |ips: &[IpAddr]| ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>();
        let parse_ips = |flag: &str, raw: Vec<String>, issues: &mut Issues| -> Vec<IpAddr> {
            raw.iter()
                .filter_map(|ip| match ip.parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        issues.push(flag, format!("'{}' is not an IP address", ip));
                        None
                    }
                })
                .collect()
        };

        let private_raw = self.pick_list(
            "servers-private-ips",
            &flags.servers_private_ips,
            prev.map(|p| to_strings(&p.private_ips)),
        );
        let public_raw = self.pick_list(
            "servers-public-ips",
            &flags.servers_public_ips,
            prev.map(|p| to_strings(&p.public_ips)),
        );
        let private_ips = parse_ips("servers-private-ips", private_raw, issues);
        let public_ips = parse_ips("servers-public-ips", public_raw, issues);
        if private_ips.is_empty() {
            issues.push("servers-private-ips", "at least one server address is required for k3s");
        }

        let ssh_private_key = self.pick(
            "ssh-privatekey",
            &flags.ssh_privatekey,
            prev.map(|p| p.ssh_private_key.clone()),
        );
        if ssh_private_key.is_none() {
            issues.push("ssh-privatekey", "required for k3s");
        }
        let ssh_user = self
            .pick("ssh-user", &flags.ssh_user, prev.map(|p| p.ssh_user.clone()))
            .unwrap_or_else(|| DEFAULT_K3S_SSH_USER.to_string());

        // Previous args already carry the --tls-san entries.
        let mut server_args = self.pick_list("servers-args", &flags.servers_args, None);
        if server_args.is_empty() {
            if let Some(prev) = prev {
                server_args = prev.server_args.clone();
            } else {
                server_args = DEFAULT_K3S_SERVER_ARGS.iter().map(|a| a.to_string()).collect();
                server_args.extend(public_ips.iter().map(|ip| format!("--tls-san {}", ip)));
            }
        }

        Some(K3sServers {
            private_ips,
            public_ips,
            ssh_user,
            ssh_private_key: ssh_private_key.unwrap_or_default(),
            server_args,
        })
    }
}

/// Default clone/push protocol of a git provider.
pub fn default_protocol(git: GitProvider) -> GitProtocol {
    match git {
        GitProvider::Github | GitProvider::Gitlab => GitProtocol::Ssh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn k3s_flags() -> FlagValues {
        FlagValues {
            cluster_name: Some("kfirst".into()),
            domain_name: Some("example.com".into()),
            github_org: Some("Acme".into()),
            alerts_email: Some("ops@example.com".into()),
            servers_private_ips: vec!["10.0.0.10,10.0.0.11".into()],
            servers_public_ips: vec!["203.0.113.7".into()],
            ssh_privatekey: Some("/home/me/.ssh/id_ed25519".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_k3s_defaults() {
        let env = env(&[("GITHUB_TOKEN", "ghp_x"), ("CF_API_TOKEN", "cf")]);
        let request = FlagResolver::new(CloudProvider::K3s, &env)
            .with_version("v2.5.0")
            .resolve(&k3s_flags())
            .unwrap();

        assert_eq!(request.git_owner, "acme");
        assert_eq!(request.git_protocol, GitProtocol::Ssh);
        assert_eq!(request.dns_provider, DnsProvider::Cloudflare);
        assert_eq!(request.template_branch, "v2.5.0");
        assert_eq!(request.cloud_region, "on-premise");
        let k3s = request.provider.k3s.unwrap();
        assert_eq!(k3s.private_ips.len(), 2);
        assert_eq!(k3s.ssh_user, "root");
        assert!(k3s.server_args.contains(&"--tls-san 203.0.113.7".to_string()));
    }

    #[test]
    fn test_every_issue_is_reported() {
        let env = env(&[]);
        let flags = FlagValues {
            domain_name: Some("not a domain".into()),
            node_count: Some("zero".into()),
            ..Default::default()
        };
        let err = FlagResolver::new(CloudProvider::Aws, &env)
            .resolve(&flags)
            .unwrap_err();

        assert!(err.mentions("github-org"));
        assert!(err.mentions("domain-name"));
        assert!(err.mentions("cloud-region"));
        assert!(err.mentions("alerts-email"));
        assert!(err.mentions("node-count"));
        assert!(err.mentions("GITHUB_TOKEN"));
        assert!(!err.mentions("CF_API_TOKEN"));
    }

    #[test]
    fn test_cloudflare_token_probed_only_for_cloudflare() {
        let env = env(&[("GITHUB_TOKEN", "t"), ("AWS_PROFILE", "default")]);
        let missing = |dns| missing_credentials(CloudProvider::Aws, GitProvider::Github, dns, &env);
        assert!(missing(DnsProvider::Native).is_empty());
        assert_eq!(
            missing(DnsProvider::Cloudflare),
            vec!["CF_API_TOKEN".to_string()]
        );
    }

    #[test]
    fn test_priority_cli_over_env_over_previous() {
        let with_overrides = env(&[
            ("GITHUB_TOKEN", "t"),
            ("CF_API_TOKEN", "cf"),
            ("K1_ALERTS_EMAIL", "env@example.com"),
            ("K1_NODE_COUNT", "4"),
        ]);
        let first = FlagResolver::new(CloudProvider::K3s, &with_overrides)
            .resolve(&k3s_flags())
            .unwrap();
        assert_eq!(first.alerts_email, "ops@example.com");
        assert_eq!(first.node_count, 4);

        // destroy: nothing on the command line, the checkpointed request fills in
        let bare = env(&[("GITHUB_TOKEN", "t"), ("CF_API_TOKEN", "cf")]);
        let again = FlagResolver::new(CloudProvider::K3s, &bare)
            .with_previous(Some(&first))
            .resolve(&FlagValues::default())
            .unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_gitlab_requires_group() {
        let env = env(&[("GITLAB_TOKEN", "t"), ("CF_API_TOKEN", "cf")]);
        let flags = FlagValues {
            git_provider: Some("gitlab".into()),
            ..k3s_flags()
        };
        let err = FlagResolver::new(CloudProvider::K3s, &env)
            .resolve(&flags)
            .unwrap_err();
        assert!(err.mentions("gitlab-group"));
    }
}
