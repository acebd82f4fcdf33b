//! Effects of the canonical pipeline and the stage list built from them.
//!
//! Identifiers are the same for every provider; the provider-specific part
//! lives in the adapters and in which terraform module a stage applies.

mod gitops;
mod platform;
mod preflight;
mod vault;

use crate::adapters::Capabilities;
use crate::config::K1Config;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::request::{CloudProvider, GitProvider};
use crate::resolver::cloud_credential_vars;
use crate::stage::{Stage, StageContext, StageId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use gitops::{CloudTerraformApply, GitTerraformApply, GitopsReady, GitopsRepoPush};
pub use platform::{
    ArgocdCreateRegistry, ArgocdInitialize, ArgocdInstall, ClusterSecretsCreate, PostInstall,
    ARGOCD_ADMIN_SECRET, ARGOCD_NAMESPACE,
};
pub use preflight::{
    validate_request, CloudCredentials, DomainLiveness, GitCredentials, KbotSetup,
    StateStoreCreate, ToolsDownload, ValidateFlags,
};
pub use vault::{
    UsersTerraformApply, VaultReady, VaultTerraformApply, VaultUnseal, ROOT_TOKEN_KEY,
    VAULT_NAMESPACE, VAULT_UNSEAL_SECRET,
};

pub const KUBECTL_VERSION: &str = "v1.25.7";
pub const TERRAFORM_VERSION: &str = "1.3.8";
/// Title of the kbot SSH key registered with the git provider.
pub const KBOT_KEY_TITLE: &str = "kbot-ssh-key";

/// Checkpoint metadata keys shared between stages.
pub mod keys {
    pub const CATALOG_APPS: &str = "catalog-apps";
    pub const BUCKET: &str = "bucket";
    pub const BUCKET_ENDPOINT: &str = "endpoint";
    pub const CLUSTER_ID: &str = "cluster-id";
    pub const GIT_USER: &str = "git-user";
    pub const KBOT_PUBLIC_KEY: &str = "kbot-public-key";
    pub const KBOT_PRIVATE_KEY: &str = "kbot-private-key";
    pub const WEBHOOK_SECRET: &str = "atlantis-webhook-secret";
}

/// The canonical 20 stages in declaration order.
pub fn canonical_stages(config: &K1Config) -> Vec<Stage> {
    let timeout = config.stage_timeout();
    // the readiness wait alone may take vault_timeout
    let vault_timeout = timeout.max(config.vault_timeout() + Duration::from_secs(300));

    vec![
        Stage::new(StageId::VALIDATE_FLAGS, "Validate flags", Arc::new(ValidateFlags)),
        Stage::new(StageId::CLOUD_CREDENTIALS, "Cloud credentials", Arc::new(CloudCredentials))
            .after(&[StageId::VALIDATE_FLAGS]),
        Stage::new(StageId::DOMAIN_LIVENESS, "Domain liveness", Arc::new(DomainLiveness))
            .after(&[StageId::CLOUD_CREDENTIALS]),
        Stage::new(StageId::STATE_STORE_CREATE, "State store", Arc::new(StateStoreCreate))
            .after(&[StageId::CLOUD_CREDENTIALS]),
        Stage::new(StageId::GIT_CREDENTIALS, "Git credentials", Arc::new(GitCredentials))
            .after(&[StageId::VALIDATE_FLAGS]),
        Stage::new(StageId::KBOT_SETUP, "Kbot setup", Arc::new(KbotSetup))
            .after(&[StageId::GIT_CREDENTIALS]),
        Stage::new(StageId::TOOLS_DOWNLOAD, "Download tools", Arc::new(ToolsDownload))
            .after(&[StageId::VALIDATE_FLAGS]),
        Stage::new(StageId::GITOPS_READY, "Prepare gitops repositories", Arc::new(GitopsReady))
            .after(&[
                StageId::DOMAIN_LIVENESS,
                StageId::STATE_STORE_CREATE,
                StageId::KBOT_SETUP,
            ]),
        Stage::new(StageId::GIT_TERRAFORM_APPLY, "Git terraform apply", Arc::new(GitTerraformApply))
            .after(&[StageId::GITOPS_READY, StageId::TOOLS_DOWNLOAD]),
        Stage::new(StageId::GITOPS_REPO_PUSH, "Push gitops repositories", Arc::new(GitopsRepoPush))
            .after(&[StageId::GIT_TERRAFORM_APPLY]),
        Stage::new(
            StageId::CLOUD_TERRAFORM_APPLY,
            "Cloud terraform apply",
            Arc::new(CloudTerraformApply),
        )
        .after(&[StageId::GITOPS_REPO_PUSH]),
        Stage::new(
            StageId::CLUSTER_SECRETS_CREATE,
            "Cluster secrets",
            Arc::new(ClusterSecretsCreate),
        )
        .after(&[StageId::CLOUD_TERRAFORM_APPLY]),
        Stage::new(StageId::ARGOCD_INSTALL, "Install Argo CD", Arc::new(ArgocdInstall))
            .after(&[StageId::CLUSTER_SECRETS_CREATE]),
        Stage::new(StageId::ARGOCD_INITIALIZE, "Initialize Argo CD", Arc::new(ArgocdInitialize))
            .after(&[StageId::ARGOCD_INSTALL]),
        Stage::new(
            StageId::ARGOCD_CREATE_REGISTRY,
            "Create Argo CD registry",
            Arc::new(ArgocdCreateRegistry),
        )
        .after(&[StageId::ARGOCD_INITIALIZE, StageId::GITOPS_REPO_PUSH]),
        Stage::new(StageId::VAULT_READY, "Wait for Vault", Arc::new(VaultReady))
            .after(&[StageId::ARGOCD_CREATE_REGISTRY])
            .with_timeout(vault_timeout),
        Stage::new(StageId::VAULT_UNSEAL, "Initialize Vault", Arc::new(VaultUnseal))
            .after(&[StageId::VAULT_READY]),
        Stage::new(
            StageId::VAULT_TERRAFORM_APPLY,
            "Vault terraform apply",
            Arc::new(VaultTerraformApply),
        )
        .after(&[StageId::VAULT_UNSEAL]),
        Stage::new(
            StageId::USERS_TERRAFORM_APPLY,
            "Users terraform apply",
            Arc::new(UsersTerraformApply),
        )
        .after(&[StageId::VAULT_TERRAFORM_APPLY]),
        Stage::new(StageId::POST_INSTALL, "Wait for console", Arc::new(PostInstall))
            .after(&[StageId::USERS_TERRAFORM_APPLY]),
    ]
    .into_iter()
    .map(|stage| {
        if stage.id == StageId::VAULT_READY {
            stage
        } else {
            stage.with_timeout(timeout)
        }
    })
    .collect()
}

/// Local filesystem failure inside an effect.
pub(crate) fn local_io(what: &str, e: std::io::Error) -> AdapterError {
    AdapterError::new(AdapterErrorKind::CommandFailed, format!("{}: {}", what, e))
}

/// Path of a terraform module inside the prepared gitops tree.
pub(crate) fn terraform_module(
    ctx: &StageContext<'_>,
    name: &str,
) -> Result<PathBuf, AdapterError> {
    let module = ctx.workdir.gitops_dir().join("terraform").join(name);
    if !module.is_dir() {
        return Err(AdapterError::new(
            AdapterErrorKind::TemplateInvalid,
            format!("terraform module {:?} is missing from the gitops tree", module),
        ));
    }
    Ok(module)
}

/// Git token and owner variables for terraform.
pub(crate) fn git_env(
    ctx: &StageContext<'_>,
    caps: &Capabilities,
) -> Result<BTreeMap<String, String>, AdapterError> {
    let git = ctx.request.git_provider;
    let token = caps.env.var(git.token_env()).ok_or_else(|| {
        AdapterError::new(
            AdapterErrorKind::CredentialsMissing,
            format!("{} is not set", git.token_env()),
        )
    })?;
    let mut env = BTreeMap::new();
    env.insert(git.token_env().to_string(), token.clone());
    match git {
        GitProvider::Github => {
            env.insert("GITHUB_OWNER".to_string(), ctx.request.git_owner.clone());
            env.insert("TF_VAR_github_token".to_string(), token);
        }
        GitProvider::Gitlab => {
            env.insert("GITLAB_OWNER".to_string(), ctx.request.git_owner.clone());
            env.insert("TF_VAR_gitlab_owner".to_string(), ctx.request.git_owner.clone());
            env.insert("TF_VAR_gitlab_token".to_string(), token);
        }
    }
    Ok(env)
}

/// Cloud credentials plus the S3 credentials the terraform state backend needs.
pub(crate) fn cloud_env(ctx: &StageContext<'_>, caps: &Capabilities) -> BTreeMap<String, String> {
    let request = ctx.request;
    let mut env = BTreeMap::new();
    for var in cloud_credential_vars(request.cloud_provider) {
        if let Some(value) = caps.env.var(var) {
            env.insert(var.to_string(), value);
        }
    }
    match request.cloud_provider {
        CloudProvider::Aws => {
            env.insert("AWS_REGION".to_string(), request.cloud_region.clone());
            env.insert("TF_VAR_aws_region".to_string(), request.cloud_region.clone());
        }
        CloudProvider::DigitalOcean => {
            if let Some(key) = caps.env.var("DO_SPACES_KEY") {
                env.insert("AWS_ACCESS_KEY_ID".to_string(), key);
            }
            if let Some(secret) = caps.env.var("DO_SPACES_SECRET") {
                env.insert("AWS_SECRET_ACCESS_KEY".to_string(), secret);
            }
        }
        CloudProvider::Gcp => {
            if let Some(project) = &request.provider.google_project {
                env.insert("TF_VAR_project".to_string(), project.clone());
            }
        }
        _ => {}
    }
    env.insert("TF_VAR_email_address".to_string(), request.alerts_email.clone());
    env
}

/// Variable names for logs. Values never appear.
pub(crate) fn describe_env(env: &BTreeMap<String, String>) -> String {
    env.keys().cloned().collect::<Vec<_>>().join(",")
}
