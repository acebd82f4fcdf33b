use super::{cloud_env, describe_env, git_env, keys, local_io, terraform_module};
use crate::adapters::Capabilities;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::request::CloudProvider;
use crate::stage::{StageContext, StageEffect, StageId, StageOutput};
use crate::template::token_dictionary;
use crate::workdir::remove_dir_if_exists;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Renders the gitops and metaphor trees from a fresh template clone.
pub struct GitopsReady;

#[async_trait]
impl StageEffect for GitopsReady {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let request = ctx.request;
        let workdir = ctx.workdir;

        // leftovers of an interrupted attempt would mix with the new render
        for dir in [workdir.template_dir(), workdir.gitops_dir(), workdir.metaphor_dir()] {
            remove_dir_if_exists(&dir).map_err(|e| local_io("clearing working tree", e))?;
        }

        caps.template
            .clone_template(
                &request.template_url,
                &request.template_branch,
                &workdir.template_dir(),
                &ctx.cancel,
            )
            .await?;

        let team = caps.env.var("KUBEFIRST_TEAM");
        let tokens = token_dictionary(
            request,
            ctx.metadata(StageId::STATE_STORE_CREATE, keys::BUCKET),
            &workdir.kubeconfig(),
            crate::VERSION,
            team.as_deref(),
        );
        caps.template
            .prepare(
                &workdir.template_dir(),
                request,
                &workdir.gitops_dir(),
                &workdir.metaphor_dir(),
                &tokens,
                &ctx.cancel,
            )
            .await?;

        tracing::info!(
            "[gitops-ready] Rendered {} from {}@{} ({} tokens)",
            request.gitops_repo_name,
            request.template_url,
            request.template_branch,
            tokens.len()
        );
        Ok(StageOutput::empty()
            .with("template-url", request.template_url.as_str())
            .with("template-branch", request.template_branch.as_str()))
    }

    async fn verify(&self, ctx: &StageContext<'_>, _caps: &Capabilities) -> Result<(), AdapterError> {
        terraform_module(ctx, ctx.request.git_provider.as_str())?;
        if !ctx.workdir.metaphor_dir().is_dir() {
            return Err(AdapterError::new(
                AdapterErrorKind::TemplateInvalid,
                "metaphor tree was not produced",
            ));
        }
        Ok(())
    }
}

fn git_terraform_env(
    ctx: &StageContext<'_>,
    caps: &Capabilities,
) -> Result<BTreeMap<String, String>, AdapterError> {
    let mut env = git_env(ctx, caps)?;
    env.extend(cloud_env(ctx, caps));
    env.insert(
        "TF_VAR_kbot_ssh_public_key".to_string(),
        ctx.require_metadata(StageId::KBOT_SETUP, keys::KBOT_PUBLIC_KEY)?.to_string(),
    );
    env.insert(
        "TF_VAR_atlantis_repo_webhook_secret".to_string(),
        ctx.require_metadata(StageId::KBOT_SETUP, keys::WEBHOOK_SECRET)?.to_string(),
    );
    env.insert(
        "TF_VAR_atlantis_repo_webhook_url".to_string(),
        format!("https://{}/events", ctx.request.service_host("atlantis")),
    );
    Ok(env)
}

/// Repositories, teams, webhooks and deploy keys on the git provider.
pub struct GitTerraformApply;

#[async_trait]
impl StageEffect for GitTerraformApply {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let request = ctx.request;
        caps.git
            .initialize(
                &request.git_owner,
                &request.repositories(),
                &request.teams(),
                &ctx.cancel,
            )
            .await?;

        let module = terraform_module(ctx, request.git_provider.as_str())?;
        let env = git_terraform_env(ctx, caps)?;
        tracing::info!("[git-terraform-apply] Applying {:?} with {}", module, describe_env(&env));
        caps.terraform.apply(&module, &env, &ctx.cancel).await?;
        Ok(StageOutput::empty().with("module", module.display().to_string()))
    }

    async fn verify(&self, ctx: &StageContext<'_>, caps: &Capabilities) -> Result<(), AdapterError> {
        let request = ctx.request;
        let existing = caps
            .git
            .list_repositories(&request.git_owner, &ctx.cancel)
            .await?;
        let absent: Vec<String> = request
            .repositories()
            .into_iter()
            .filter(|r| !existing.iter().any(|e| e.eq_ignore_ascii_case(r)))
            .collect();
        if !absent.is_empty() {
            return Err(AdapterError::transient(format!(
                "repositories not visible yet in {}: {}",
                request.git_owner,
                absent.join(", ")
            )));
        }
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }

    async fn revert(&self, ctx: &StageContext<'_>, caps: &Capabilities) -> Result<(), AdapterError> {
        let module = terraform_module(ctx, ctx.request.git_provider.as_str())?;
        let env = git_terraform_env(ctx, caps)?;
        caps.terraform.destroy(&module, &env, &ctx.cancel).await
    }
}

pub struct GitopsRepoPush;

#[async_trait]
impl StageEffect for GitopsRepoPush {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let request = ctx.request;
        let trees = [
            (ctx.workdir.gitops_dir(), request.gitops_repo_url()),
            (ctx.workdir.metaphor_dir(), request.metaphor_repo_url()),
        ];
        for (local, remote) in &trees {
            caps.git
                .push(local, remote, request.git_protocol, &ctx.cancel)
                .await?;
            tracing::info!("[gitops-repo-push] Pushed {:?} to {}", local, remote);
        }
        Ok(StageOutput::empty()
            .with("gitops", request.gitops_repo_url())
            .with("metaphor", request.metaphor_repo_url()))
    }
}

fn cloud_terraform_env(
    ctx: &StageContext<'_>,
    caps: &Capabilities,
) -> Result<BTreeMap<String, String>, AdapterError> {
    let request = ctx.request;
    let mut env = cloud_env(ctx, caps);
    env.insert("TF_VAR_cluster_name".to_string(), request.cluster_name.clone());
    env.insert("TF_VAR_cloud_region".to_string(), request.cloud_region.clone());
    env.insert("TF_VAR_node_type".to_string(), request.node_type.clone());
    env.insert("TF_VAR_node_count".to_string(), request.node_count.to_string());
    env.insert("TF_VAR_domain_name".to_string(), request.fqdn());
    if let Some(bucket) = ctx.metadata(StageId::STATE_STORE_CREATE, keys::BUCKET) {
        env.insert("TF_VAR_state_store_bucket".to_string(), bucket.to_string());
    }
    if let Some(group) = &request.provider.azure_dns_resource_group {
        env.insert("TF_VAR_dns_zone_resource_group".to_string(), group.clone());
    }
    if request.provider.aws_ecr {
        env.insert("TF_VAR_use_ecr".to_string(), "true".to_string());
    }

    if request.cloud_provider == CloudProvider::K3s {
        let servers = request.provider.k3s.as_ref().ok_or_else(|| {
            AdapterError::new(
                AdapterErrorKind::InvalidRequest,
                "k3s install without server addresses",
            )
        })?;
        let private: Vec<String> = servers.private_ips.iter().map(|ip| ip.to_string()).collect();
        let public: Vec<String> = servers.public_ips.iter().map(|ip| ip.to_string()).collect();
        env.insert("TF_VAR_private_ips".to_string(), json_list(&private)?);
        env.insert("TF_VAR_public_ips".to_string(), json_list(&public)?);
        env.insert("TF_VAR_servers_args".to_string(), json_list(&servers.server_args)?);
        env.insert("TF_VAR_ssh_user".to_string(), servers.ssh_user.clone());
        env.insert("TF_VAR_ssh_private_key".to_string(), servers.ssh_private_key.clone());
    }
    Ok(env)
}

/// Terraform list variables are passed as JSON.
fn json_list(values: &[String]) -> Result<String, AdapterError> {
    serde_json::to_string(values).map_err(|e| {
        AdapterError::new(AdapterErrorKind::InvalidRequest, format!("encoding list: {}", e))
    })
}

/// Cluster, network and DNS for the selected cloud.
pub struct CloudTerraformApply;

#[async_trait]
impl StageEffect for CloudTerraformApply {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let request = ctx.request;
        let module = terraform_module(ctx, request.cloud_provider.as_str())?;
        let env = cloud_terraform_env(ctx, caps)?;
        tracing::info!("[cloud-terraform-apply] Applying {:?} with {}", module, describe_env(&env));
        caps.terraform.apply(&module, &env, &ctx.cancel).await?;

        let kubeconfig = ctx.workdir.kubeconfig();
        caps.cloud
            .fetch_kubeconfig(request, &kubeconfig, &ctx.cancel)
            .await?;
        Ok(StageOutput::empty()
            .with("module", module.display().to_string())
            .with("kubeconfig", kubeconfig.display().to_string()))
    }

    async fn verify(&self, ctx: &StageContext<'_>, _caps: &Capabilities) -> Result<(), AdapterError> {
        if !ctx.workdir.kubeconfig().is_file() {
            return Err(AdapterError::new(
                AdapterErrorKind::NotFound,
                format!("no kubeconfig at {:?}", ctx.workdir.kubeconfig()),
            ));
        }
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }

    async fn revert(&self, ctx: &StageContext<'_>, caps: &Capabilities) -> Result<(), AdapterError> {
        let module = terraform_module(ctx, ctx.request.cloud_provider.as_str())?;
        let env = cloud_terraform_env(ctx, caps)?;
        caps.terraform.destroy(&module, &env, &ctx.cancel).await
    }
}
