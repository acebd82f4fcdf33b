//! Command tree: `k1 <provider> create|destroy|root-credentials|reset`.

use clap::{Args, Parser, Subcommand};
use provision::request::CloudProvider;
use provision::resolver::{FlagValues, DEFAULT_CLUSTER_NAME};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "k1", version, about = "Install and manage the k1 GitOps platform")]
pub struct Cli {
    /// State directory (default: ~/.k1)
    #[arg(long, global = true, env = "K1_HOME")]
    pub home: Option<PathBuf>,

    /// Orchestrator config file (default: <home>/k1.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub provider: ProviderCommand,
}

#[derive(Subcommand, Debug)]
pub enum ProviderCommand {
    /// Amazon Web Services (EKS)
    Aws {
        #[command(subcommand)]
        action: Action,
    },
    /// Microsoft Azure (AKS)
    Azure {
        #[command(subcommand)]
        action: Action,
    },
    /// Google Cloud (GKE)
    #[command(alias = "google")]
    Gcp {
        #[command(subcommand)]
        action: Action,
    },
    /// DigitalOcean (DOKS)
    Digitalocean {
        #[command(subcommand)]
        action: Action,
    },
    /// Vultr (VKE)
    Vultr {
        #[command(subcommand)]
        action: Action,
    },
    /// Akamai Connected Cloud (LKE)
    Akamai {
        #[command(subcommand)]
        action: Action,
    },
    /// Bring-your-own servers running k3s
    K3s {
        #[command(subcommand)]
        action: Action,
    },
}

impl ProviderCommand {
    pub fn into_parts(self) -> (CloudProvider, Action) {
        match self {
            ProviderCommand::Aws { action } => (CloudProvider::Aws, action),
            ProviderCommand::Azure { action } => (CloudProvider::Azure, action),
            ProviderCommand::Gcp { action } => (CloudProvider::Gcp, action),
            ProviderCommand::Digitalocean { action } => (CloudProvider::DigitalOcean, action),
            ProviderCommand::Vultr { action } => (CloudProvider::Vultr, action),
            ProviderCommand::Akamai { action } => (CloudProvider::Akamai, action),
            ProviderCommand::K3s { action } => (CloudProvider::K3s, action),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Provision a cluster, resuming a previous run when one exists
    Create(CreateArgs),
    /// Tear down everything a previous create provisioned
    Destroy(ClusterArgs),
    /// Print the Argo CD admin password and Vault root token
    RootCredentials(RootCredentialsArgs),
    /// Forget local state so create starts over; remote resources are kept
    Reset(ClusterArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[arg(long, env = "K1_CLUSTER_NAME", default_value = DEFAULT_CLUSTER_NAME)]
    pub cluster_name: String,

    /// Plain line output, no terminal redraws
    #[arg(long)]
    pub ci: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RootCredentialsArgs {
    #[arg(long, env = "K1_CLUSTER_NAME", default_value = DEFAULT_CLUSTER_NAME)]
    pub cluster_name: String,

    /// Copy the Argo CD admin password to the clipboard
    #[arg(long, conflicts_with = "vault")]
    pub argocd: bool,

    /// Copy the Vault root token to the clipboard
    #[arg(long)]
    pub vault: bool,
}

/// Flags of `create`. Unset flags fall back to `K1_<FLAG>` variables and then
/// to the request of a previous run.
#[derive(Args, Debug, Clone, Default)]
pub struct CreateArgs {
    #[arg(long)]
    pub cloud_region: Option<String>,
    #[arg(long)]
    pub cluster_name: Option<String>,
    /// mgmt or workload
    #[arg(long)]
    pub cluster_type: Option<String>,
    /// cloudflare, or the cloud's own DNS
    #[arg(long)]
    pub dns_provider: Option<String>,
    #[arg(long)]
    pub domain_name: Option<String>,
    #[arg(long)]
    pub subdomain: Option<String>,
    /// github or gitlab
    #[arg(long)]
    pub git_provider: Option<String>,
    /// ssh or https
    #[arg(long)]
    pub git_protocol: Option<String>,
    #[arg(long)]
    pub github_org: Option<String>,
    #[arg(long)]
    pub gitlab_group: Option<String>,
    #[arg(long)]
    pub gitops_repo_name: Option<String>,
    #[arg(long)]
    pub metaphor_repo_name: Option<String>,
    #[arg(long)]
    pub admin_team_name: Option<String>,
    #[arg(long)]
    pub developer_team_name: Option<String>,
    #[arg(long)]
    pub alerts_email: Option<String>,
    #[arg(long)]
    pub node_type: Option<String>,
    #[arg(long)]
    pub node_count: Option<String>,
    #[arg(long)]
    pub gitops_template_url: Option<String>,
    #[arg(long)]
    pub gitops_template_branch: Option<String>,
    /// Comma separated catalog app ids
    #[arg(long)]
    pub install_catalog_apps: Option<String>,
    #[arg(long)]
    pub use_telemetry: Option<bool>,
    #[arg(long)]
    pub google_project: Option<String>,
    #[arg(long)]
    pub azure_dns_resource_group: Option<String>,
    /// Use ECR instead of the git provider's registry (aws only)
    #[arg(long)]
    pub ecr: Option<bool>,
    #[arg(long)]
    pub servers_private_ips: Vec<String>,
    #[arg(long)]
    pub servers_public_ips: Vec<String>,
    #[arg(long)]
    pub ssh_user: Option<String>,
    /// Path of the private key used to reach k3s servers
    #[arg(long)]
    pub ssh_privatekey: Option<String>,
    /// Extra k3s server arguments, e.g. "--disable traefik"
    #[arg(long, allow_hyphen_values = true)]
    pub servers_args: Vec<String>,

    /// Plain line output, no terminal redraws
    #[arg(long)]
    pub ci: bool,
}

impl CreateArgs {
    pub fn flag_values(&self) -> FlagValues {
        FlagValues {
            cloud_region: self.cloud_region.clone(),
            cluster_name: self.cluster_name.clone(),
            cluster_type: self.cluster_type.clone(),
            dns_provider: self.dns_provider.clone(),
            domain_name: self.domain_name.clone(),
            subdomain: self.subdomain.clone(),
            git_provider: self.git_provider.clone(),
            git_protocol: self.git_protocol.clone(),
            github_org: self.github_org.clone(),
            gitlab_group: self.gitlab_group.clone(),
            gitops_repo_name: self.gitops_repo_name.clone(),
            metaphor_repo_name: self.metaphor_repo_name.clone(),
            admin_team_name: self.admin_team_name.clone(),
            developer_team_name: self.developer_team_name.clone(),
            alerts_email: self.alerts_email.clone(),
            node_type: self.node_type.clone(),
            node_count: self.node_count.clone(),
            gitops_template_url: self.gitops_template_url.clone(),
            gitops_template_branch: self.gitops_template_branch.clone(),
            install_catalog_apps: self.install_catalog_apps.clone(),
            use_telemetry: self.use_telemetry,
            google_project: self.google_project.clone(),
            azure_dns_resource_group: self.azure_dns_resource_group.clone(),
            ecr: self.ecr,
            servers_private_ips: self.servers_private_ips.clone(),
            servers_public_ips: self.servers_public_ips.clone(),
            ssh_user: self.ssh_user.clone(),
            ssh_privatekey: self.ssh_privatekey.clone(),
            servers_args: self.servers_args.clone(),
        }
    }
}
