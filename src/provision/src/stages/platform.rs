use super::keys;
use crate::adapters::{Capabilities, Manifest, SecretSpec, Workload};
use crate::error::{AdapterError, AdapterErrorKind};
use crate::resolver::cloud_credential_vars;
use crate::stage::{StageContext, StageEffect, StageId, StageOutput};
use crate::template::{ManifestRenderer, ARGOCD_MANIFESTS};
use async_trait::async_trait;

pub const ARGOCD_NAMESPACE: &str = "argocd";
pub const ARGOCD_ADMIN_SECRET: &str = "argocd-initial-admin-secret";

/// Git token, cloud auth and registry auth the platform expects to find.
pub struct ClusterSecretsCreate;

impl ClusterSecretsCreate {
    fn secrets(ctx: &StageContext<'_>, caps: &Capabilities) -> Result<Vec<SecretSpec>, AdapterError> {
        let request = ctx.request;
        let git = request.git_provider;
        let token = caps.env.var(git.token_env()).ok_or_else(|| {
            AdapterError::new(
                AdapterErrorKind::CredentialsMissing,
                format!("{} is not set", git.token_env()),
            )
        })?;
        let private_key = ctx.require_metadata(StageId::KBOT_SETUP, keys::KBOT_PRIVATE_KEY)?;
        let username = ctx
            .metadata(StageId::GIT_CREDENTIALS, keys::GIT_USER)
            .unwrap_or("kbot")
            .to_string();

        let repo_prefix = format!("git@{}:{}", git.host(), request.git_owner);

        let mut secrets = vec![
            SecretSpec::opaque(ARGOCD_NAMESPACE, "repo-credentials-template")
                .label("argocd.argoproj.io/secret-type", "repo-creds")
                .entry("type", "git")
                .entry("name", "repo-credentials-template")
                .entry("url", repo_prefix)
                .entry("sshPrivateKey", private_key),
            SecretSpec::opaque("kubefirst", "git-credentials")
                .entry("git-provider", git.as_str())
                .entry("owner", request.git_owner.as_str())
                .entry("username", username.as_str())
                .entry("token", token.as_str()),
        ];

        let mut cloud = SecretSpec::opaque("kubefirst", "cloud-credentials");
        for var in cloud_credential_vars(request.cloud_provider) {
            if let Some(value) = caps.env.var(var) {
                cloud = cloud.entry(var, value);
            }
        }
        if !cloud.data.is_empty() {
            secrets.push(cloud);
        }

        let auth = serde_json::json!({
            "auths": {
                git.container_registry(): { "username": username, "password": token }
            }
        })
        .to_string();
        secrets.push(
            SecretSpec::opaque("argo", "container-registry-auth")
                .with_type("kubernetes.io/dockerconfigjson")
                .entry(".dockerconfigjson", auth),
        );
        Ok(secrets)
    }
}

#[async_trait]
impl StageEffect for ClusterSecretsCreate {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let kubeconfig = ctx.workdir.kubeconfig();
        let secrets = Self::secrets(ctx, caps)?;
        let mut created = Vec::with_capacity(secrets.len());
        for secret in &secrets {
            caps.kube.create_secret(&kubeconfig, secret, &ctx.cancel).await?;
            created.push(format!("{}/{}", secret.namespace, secret.name));
        }
        tracing::info!("[cluster-secrets-create] Created {}", created.join(", "));
        Ok(StageOutput::empty().with("secrets", created.join(",")))
    }
}

pub struct ArgocdInstall;

#[async_trait]
impl StageEffect for ArgocdInstall {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let kubeconfig = ctx.workdir.kubeconfig();
        caps.kube
            .apply(&kubeconfig, &Manifest::Kustomize(ARGOCD_MANIFESTS.to_string()), &ctx.cancel)
            .await?;
        caps.kube
            .wait_ready(
                &kubeconfig,
                &Workload::deployment(ARGOCD_NAMESPACE, "argocd-server"),
                ctx.config.deployment_timeout(),
                &ctx.cancel,
            )
            .await?;
        Ok(StageOutput::empty().with("manifests", ARGOCD_MANIFESTS))
    }

    async fn verify(&self, ctx: &StageContext<'_>, caps: &Capabilities) -> Result<(), AdapterError> {
        caps.kube
            .wait_ready(
                &ctx.workdir.kubeconfig(),
                &Workload::statefulset(ARGOCD_NAMESPACE, "argocd-application-controller"),
                ctx.config.deployment_timeout(),
                &ctx.cancel,
            )
            .await
    }
}

/// Confirms the initial admin password exists. Only its location is recorded.
pub struct ArgocdInitialize;

#[async_trait]
impl StageEffect for ArgocdInitialize {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let password = caps
            .kube
            .read_secret(
                &ctx.workdir.kubeconfig(),
                ARGOCD_NAMESPACE,
                ARGOCD_ADMIN_SECRET,
                "password",
                &ctx.cancel,
            )
            .await?;
        if password.is_none() {
            // argocd writes it shortly after the server starts
            return Err(AdapterError::transient(format!(
                "{}/{} not created yet",
                ARGOCD_NAMESPACE, ARGOCD_ADMIN_SECRET
            )));
        }
        Ok(StageOutput::empty()
            .with("admin-secret", format!("{}/{}", ARGOCD_NAMESPACE, ARGOCD_ADMIN_SECRET))
            .with("url", format!("https://{}", ctx.request.service_host("argocd"))))
    }
}

pub struct ArgocdCreateRegistry;

#[async_trait]
impl StageEffect for ArgocdCreateRegistry {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let renderer = ManifestRenderer::from_embedded()?;
        let manifest = renderer.registry_application(ctx.request)?;
        caps.kube
            .apply(&ctx.workdir.kubeconfig(), &Manifest::Inline(manifest), &ctx.cancel)
            .await?;
        tracing::info!(
            "[argocd-create-registry] Registry application points at {}",
            ctx.request.gitops_repo_url()
        );
        Ok(StageOutput::empty().with("application", "argocd/registry"))
    }
}

pub struct PostInstall;

#[async_trait]
impl StageEffect for PostInstall {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        caps.kube
            .wait_ready(
                &ctx.workdir.kubeconfig(),
                &Workload::deployment("kubefirst", "kubefirst-console"),
                ctx.config.deployment_timeout(),
                &ctx.cancel,
            )
            .await?;
        Ok(StageOutput::empty().with(
            "console",
            format!("https://{}", ctx.request.service_host("kubefirst")),
        ))
    }
}
