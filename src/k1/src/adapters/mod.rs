//! Production implementations of the provisioning capabilities.

pub mod catalog;
pub mod cloud;
pub mod control_plane;
pub mod exec;
pub mod git;
pub mod http;
pub mod keys;
pub mod kube;
pub mod telemetry;
pub mod template;
pub mod terraform;
pub mod tools;
pub mod vault;

use provision::adapters::Secret;
use provision::error::{AdapterError, AdapterErrorKind};
use provision::request::{GitProvider, InstallRequest};
use provision::telemetry::{NoopTelemetry, TelemetrySink};
use provision::{Capabilities, EnvSource, WorkDir};
use std::sync::Arc;

/// Environment variable holding the token of a git provider.
pub fn git_token_var(provider: GitProvider) -> &'static str {
    match provider {
        GitProvider::Github => "GITHUB_TOKEN",
        GitProvider::Gitlab => "GITLAB_TOKEN",
    }
}

/// Wire every capability for one run of `request`.
pub fn build_capabilities(
    request: &InstallRequest,
    workdir: &WorkDir,
    env: Arc<dyn EnvSource>,
) -> Result<Capabilities, AdapterError> {
    let token_var = git_token_var(request.git_provider);
    let token = env.var(token_var).ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::CredentialsMissing, format!("{} is not set", token_var))
    })?;
    let tools_dir = workdir.tools_dir();

    let telemetry: Arc<dyn TelemetrySink> = if request.use_telemetry {
        let url = env
            .var("K1_TELEMETRY_URL")
            .unwrap_or_else(|| telemetry::DEFAULT_TELEMETRY_URL.to_string());
        Arc::new(telemetry::HttpTelemetry::new(url, http::client()?))
    } else {
        Arc::new(NoopTelemetry)
    };
    let catalog_url = env
        .var("K1_CATALOG_INDEX_URL")
        .unwrap_or_else(|| catalog::DEFAULT_INDEX_URL.to_string());

    Ok(Capabilities {
        cloud: Arc::new(cloud::ProviderCloud::new(request.cloud_provider, env.clone())?),
        git: Arc::new(git::RestGit::new(
            request.git_provider,
            request.git_protocol,
            Secret::new(token),
            workdir.kbot_private_key(),
        )?),
        template: Arc::new(template::GitTemplate),
        terraform: Arc::new(terraform::TerraformCli::new(tools_dir.join("terraform"))),
        kube: Arc::new(kube::KubectlCli::new(tools_dir.join("kubectl"))),
        vault: Arc::new(vault::VaultHttp::new()?),
        catalog: Arc::new(catalog::HttpCatalog::new(catalog_url)?),
        keys: Arc::new(keys::SshKeygen),
        tools: Arc::new(tools::HttpTools::new()?),
        telemetry,
        env,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use provision::request::{
        ClusterType, CloudProvider, DnsProvider, GitProtocol, K3sServers, ProviderFields,
    };
    use std::collections::BTreeMap;

    pub fn k3s_request() -> InstallRequest {
        InstallRequest {
            cloud_provider: CloudProvider::K3s,
            cloud_region: "on-premise".into(),
            cluster_name: "kfirst".into(),
            cluster_type: ClusterType::Mgmt,
            dns_provider: DnsProvider::Cloudflare,
            domain_name: "example.com".into(),
            subdomain: None,
            git_provider: GitProvider::Github,
            git_protocol: GitProtocol::Ssh,
            git_owner: "acme".into(),
            gitops_repo_name: "gitops".into(),
            metaphor_repo_name: "metaphor".into(),
            admin_team_name: "admins".into(),
            developer_team_name: "developers".into(),
            alerts_email: "ops@example.com".into(),
            node_type: "on-premise".into(),
            node_count: 1,
            template_url: "https://github.com/kubefirst/gitops-template.git".into(),
            template_branch: "main".into(),
            catalog_apps: vec![],
            use_telemetry: false,
            provider: ProviderFields {
                k3s: Some(K3sServers {
                    private_ips: vec!["10.0.0.10".parse().unwrap()],
                    public_ips: vec!["203.0.113.10".parse().unwrap()],
                    ssh_user: "root".into(),
                    ssh_private_key: "/nonexistent/k1/id_ed25519".into(),
                    server_args: vec![],
                }),
                ..ProviderFields::default()
            },
        }
    }

    fn env(pairs: &[(&str, &str)]) -> Arc<dyn EnvSource> {
        Arc::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<String, String>>(),
        )
    }

    #[test]
    fn test_capabilities_need_git_token() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path(), "kfirst");
        let err = build_capabilities(&k3s_request(), &workdir, env(&[])).err().unwrap();
        assert_eq!(err.kind, AdapterErrorKind::CredentialsMissing);
        assert!(err.message.contains("GITHUB_TOKEN"));

        let caps = build_capabilities(&k3s_request(), &workdir, env(&[("GITHUB_TOKEN", "ghp_x")]));
        assert!(caps.is_ok());
    }
}
