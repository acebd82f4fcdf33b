//! Checks and local preparation before anything is created remotely.

use super::{keys, KBOT_KEY_TITLE, KUBECTL_VERSION, TERRAFORM_VERSION};
use crate::adapters::{Capabilities, ToolSpec};
use crate::error::{AdapterError, AdapterErrorKind, FieldIssue, ProvisionError, ValidationError};
use crate::request::{is_valid_cluster_name, is_valid_domain, GitProvider, InstallRequest};
use crate::resolver::missing_credentials;
use crate::stage::{StageContext, StageEffect, StageId, StageOutput};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Scopes the git token needs for the git terraform module.
fn required_scopes(git: GitProvider) -> &'static [&'static str] {
    match git {
        GitProvider::Github => &[
            "admin:org",
            "admin:public_key",
            "admin:repo_hook",
            "delete_repo",
            "repo",
            "workflow",
            "write:packages",
        ],
        GitProvider::Gitlab => &["api", "write_repository"],
    }
}

/// Check everything about the request that needs no remote mutation:
/// names, credential variables, and catalog apps with their settings.
/// Runs before any stage starts so a bad request leaves no trace.
pub async fn validate_request(
    request: &InstallRequest,
    caps: &Capabilities,
    cancel: &CancellationToken,
) -> Result<(), ProvisionError> {
    let mut issues = Vec::new();
    let mut issue = |field: &str, problem: String| {
        issues.push(FieldIssue {
            field: field.to_string(),
            problem,
        })
    };
    if !is_valid_cluster_name(&request.cluster_name) {
        issue(
            "cluster-name",
            format!("'{}' is not a valid cluster name", request.cluster_name),
        );
    }
    if !is_valid_domain(&request.fqdn()) {
        issue("domain-name", format!("'{}' is not a valid domain", request.fqdn()));
    }
    for var in missing_credentials(
        request.cloud_provider,
        request.git_provider,
        request.dns_provider,
        caps.env.as_ref(),
    ) {
        issue(&var, "required environment variable is not set".to_string());
    }

    if !request.catalog_apps.is_empty() {
        let selection = caps
            .catalog
            .validate(&request.catalog_apps, caps.env.as_ref(), cancel)
            .await?;
        for id in &selection.unknown {
            issue("install-catalog-apps", format!("'{}' is not in the catalog", id));
        }
        for (app, var) in &selection.missing {
            issue(var, format!("required by catalog app '{}'", app));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues }.into())
    }
}

pub struct ValidateFlags;

#[async_trait]
impl StageEffect for ValidateFlags {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let request = ctx.request;
        caps.git
            .verify_host_key(request.git_provider.host(), &ctx.cancel)
            .await?;

        let mut output = StageOutput::empty();
        if !request.catalog_apps.is_empty() {
            output = output.with(keys::CATALOG_APPS, request.catalog_apps.join(","));
        }
        tracing::info!(
            "[validate-flags] {} on {} for {} validated",
            request.cluster_name,
            request.cloud_provider,
            request.git_owner
        );
        Ok(output)
    }
}

pub struct CloudCredentials;

#[async_trait]
impl StageEffect for CloudCredentials {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        caps.cloud.probe_credentials(ctx.request, &ctx.cancel).await?;
        Ok(StageOutput::empty().with("provider", ctx.request.cloud_provider.as_str()))
    }
}

pub struct DomainLiveness;

#[async_trait]
impl StageEffect for DomainLiveness {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let request = ctx.request;
        caps.cloud
            .verify_zone(request.dns_provider, &request.domain_name, &ctx.cancel)
            .await?;
        Ok(StageOutput::empty()
            .with("zone", request.domain_name.as_str())
            .with("dns-provider", request.dns_provider.as_str()))
    }
}

pub struct StateStoreCreate;

#[async_trait]
impl StageEffect for StateStoreCreate {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let store = caps
            .cloud
            .create_state_store(ctx.request, &ctx.cancel)
            .await?;
        tracing::info!("[state-store-create] Using bucket {}", store.bucket_name);
        let mut output = StageOutput::empty()
            .with(keys::BUCKET, store.bucket_name)
            .with(keys::CLUSTER_ID, crate::template::cluster_id(ctx.request));
        if let Some(endpoint) = store.endpoint {
            output = output.with(keys::BUCKET_ENDPOINT, endpoint);
        }
        Ok(output)
    }

    fn reversible(&self) -> bool {
        true
    }

    async fn revert(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<(), AdapterError> {
        let bucket = ctx.require_metadata(StageId::STATE_STORE_CREATE, keys::BUCKET)?;
        caps.cloud
            .delete_state_store(ctx.request, bucket, &ctx.cancel)
            .await
    }
}

pub struct GitCredentials;

#[async_trait]
impl StageEffect for GitCredentials {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let request = ctx.request;
        let owner = &request.git_owner;

        let identity = caps.git.verify_token(&ctx.cancel).await?;
        let missing: Vec<&str> = required_scopes(request.git_provider)
            .iter()
            .filter(|scope| !identity.scopes.iter().any(|s| s == *scope))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(AdapterError::new(
                AdapterErrorKind::ScopeInsufficient,
                format!(
                    "{} token for {} lacks scopes: {}",
                    request.git_provider,
                    identity.login,
                    missing.join(", ")
                ),
            ));
        }

        caps.git.verify_owner_access(owner, &ctx.cancel).await?;

        let existing_repos = caps.git.list_repositories(owner, &ctx.cancel).await?;
        let existing_teams = caps.git.list_teams(owner, &ctx.cancel).await?;
        let repo_conflicts: Vec<String> = request
            .repositories()
            .into_iter()
            .filter(|r| existing_repos.iter().any(|e| e.eq_ignore_ascii_case(r)))
            .map(|r| format!("{}/{}", owner, r))
            .collect();
        let team_conflicts: Vec<String> = request
            .teams()
            .into_iter()
            .filter(|t| existing_teams.iter().any(|e| e.eq_ignore_ascii_case(t)))
            .collect();

        if !repo_conflicts.is_empty() || !team_conflicts.is_empty() {
            let mut problems = Vec::new();
            if !repo_conflicts.is_empty() {
                problems.push(format!(
                    "repositories already exist: {}",
                    repo_conflicts.join(", ")
                ));
            }
            if !team_conflicts.is_empty() {
                problems.push(format!(
                    "teams already exist in {}: {}",
                    owner,
                    team_conflicts.join(", ")
                ));
            }
            return Err(AdapterError::new(
                AdapterErrorKind::ResourceExists,
                problems.join("; "),
            ));
        }

        Ok(StageOutput::empty().with(keys::GIT_USER, identity.login))
    }
}

pub struct KbotSetup;

#[async_trait]
impl StageEffect for KbotSetup {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let comment = format!("kbot@{}", ctx.request.cluster_name);
        let pair = caps
            .keys
            .generate(&ctx.workdir.kbot_private_key(), &comment, &ctx.cancel)
            .await?;
        let webhook_secret = caps.keys.random_token(20)?;
        tracing::info!("[kbot-setup] Generated kbot key pair ({})", pair.public_key.trim());

        Ok(StageOutput::empty()
            .with(keys::KBOT_PUBLIC_KEY, pair.public_key.trim())
            .with(keys::KBOT_PRIVATE_KEY, pair.private_key.expose())
            .with(keys::WEBHOOK_SECRET, webhook_secret.expose()))
    }

    fn reversible(&self) -> bool {
        true
    }

    async fn revert(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<(), AdapterError> {
        caps.git.delete_ssh_key(KBOT_KEY_TITLE, &ctx.cancel).await
    }
}

pub struct ToolsDownload;

#[async_trait]
impl StageEffect for ToolsDownload {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let tools = [
            ToolSpec::new("kubectl", KUBECTL_VERSION),
            ToolSpec::new("terraform", TERRAFORM_VERSION),
        ];
        let paths = caps
            .tools
            .ensure(&ctx.workdir.tools_dir(), &tools, &ctx.cancel)
            .await?;
        if paths.len() != tools.len() {
            return Err(AdapterError::new(
                AdapterErrorKind::NotFound,
                format!("expected {} tools, got {}", tools.len(), paths.len()),
            ));
        }
        let mut output = StageOutput::empty();
        for (tool, path) in tools.iter().zip(paths) {
            output = output.with(tool.name.clone(), path.display().to_string());
        }
        Ok(output)
    }
}
