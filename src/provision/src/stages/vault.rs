//! Vault readiness, initialization and the terraform modules that need a
//! root token.

use super::{describe_env, git_env, keys, terraform_module};
use crate::adapters::{Capabilities, PortForward, Secret, SecretSpec, Workload};
use crate::error::{AdapterError, AdapterErrorKind};
use crate::stage::{StageContext, StageEffect, StageId, StageOutput};
use async_trait::async_trait;
use std::collections::BTreeMap;

pub const VAULT_NAMESPACE: &str = "vault";
pub const VAULT_UNSEAL_SECRET: &str = "vault-unseal-secret";
pub const ROOT_TOKEN_KEY: &str = "root-token";
const VAULT_PORT: u16 = 8200;

async fn root_token(
    ctx: &StageContext<'_>,
    caps: &Capabilities,
) -> Result<Option<Secret>, AdapterError> {
    caps.kube
        .read_secret(
            &ctx.workdir.kubeconfig(),
            VAULT_NAMESPACE,
            VAULT_UNSEAL_SECRET,
            ROOT_TOKEN_KEY,
            &ctx.cancel,
        )
        .await
}

async fn forward_vault(
    ctx: &StageContext<'_>,
    caps: &Capabilities,
) -> Result<PortForward, AdapterError> {
    caps.kube
        .port_forward(
            &ctx.workdir.kubeconfig(),
            VAULT_NAMESPACE,
            "svc/vault",
            VAULT_PORT,
            &ctx.cancel,
        )
        .await
}

pub struct VaultReady;

#[async_trait]
impl StageEffect for VaultReady {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        caps.kube
            .wait_ready(
                &ctx.workdir.kubeconfig(),
                &Workload::statefulset(VAULT_NAMESPACE, "vault"),
                ctx.config.vault_timeout(),
                &ctx.cancel,
            )
            .await?;
        Ok(StageOutput::empty())
    }
}

/// Vault reports itself initialized but the cluster holds no root token:
/// the keys of the first init are gone and no retry can recover them.
fn lost_envelope(secret_ref: &str) -> AdapterError {
    AdapterError::new(
        AdapterErrorKind::InconsistentState,
        format!(
            "vault is already initialized but {} has no root token; the unseal keys \
             from the first init were not stored. Delete the vault namespace and its \
             persistent volume claims, then run create again",
            secret_ref
        ),
    )
}

/// Initializes and unseals Vault once; the envelope lives only in the
/// cluster secret.
pub struct VaultUnseal;

#[async_trait]
impl StageEffect for VaultUnseal {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let secret_ref = format!("{}/{}", VAULT_NAMESPACE, VAULT_UNSEAL_SECRET);
        if root_token(ctx, caps).await?.is_some() {
            tracing::info!("[vault-unseal] {} already present, vault was initialized", secret_ref);
            return Ok(StageOutput::empty().with("secret", secret_ref));
        }

        let forward = forward_vault(ctx, caps).await?;
        let envelope = caps
            .vault
            .initialize_and_unseal(&forward.local_url(), &ctx.cancel)
            .await
            .map_err(|e| match e.kind {
                AdapterErrorKind::ResourceExists => lost_envelope(&secret_ref),
                _ => e,
            })?;
        drop(forward);

        let mut secret = SecretSpec::opaque(VAULT_NAMESPACE, VAULT_UNSEAL_SECRET)
            .entry(ROOT_TOKEN_KEY, envelope.root_token.expose());
        for (i, key) in envelope.unseal_keys.iter().enumerate() {
            secret = secret.entry(&format!("unseal-key-{}", i), key.expose());
        }
        caps.kube
            .create_secret(&ctx.workdir.kubeconfig(), &secret, &ctx.cancel)
            .await?;
        tracing::info!(
            "[vault-unseal] Vault initialized, {} unseal keys stored in {}",
            envelope.unseal_keys.len(),
            secret_ref
        );
        Ok(StageOutput::empty().with("secret", secret_ref))
    }
}

/// Terraform environment for modules that talk to Vault. The port-forward
/// must stay alive for the duration of the terraform run.
async fn vault_session(
    ctx: &StageContext<'_>,
    caps: &Capabilities,
) -> Result<(PortForward, BTreeMap<String, String>), AdapterError> {
    let token = root_token(ctx, caps).await?.ok_or_else(|| {
        AdapterError::new(
            AdapterErrorKind::NotFound,
            format!("{}/{} has no root token", VAULT_NAMESPACE, VAULT_UNSEAL_SECRET),
        )
    })?;
    let forward = forward_vault(ctx, caps).await?;

    let mut env = git_env(ctx, caps)?;
    let addr = forward.local_url();
    env.insert("VAULT_ADDR".to_string(), addr.clone());
    env.insert("TF_VAR_vault_addr".to_string(), addr);
    env.insert("VAULT_TOKEN".to_string(), token.expose().to_string());
    env.insert("TF_VAR_vault_token".to_string(), token.expose().to_string());
    env.insert(
        "TF_VAR_kbot_ssh_public_key".to_string(),
        ctx.require_metadata(StageId::KBOT_SETUP, keys::KBOT_PUBLIC_KEY)?.to_string(),
    );
    env.insert(
        "TF_VAR_kbot_ssh_private_key".to_string(),
        ctx.require_metadata(StageId::KBOT_SETUP, keys::KBOT_PRIVATE_KEY)?.to_string(),
    );
    env.insert(
        "TF_VAR_atlantis_repo_webhook_secret".to_string(),
        ctx.require_metadata(StageId::KBOT_SETUP, keys::WEBHOOK_SECRET)?.to_string(),
    );
    Ok((forward, env))
}

pub struct VaultTerraformApply;

#[async_trait]
impl StageEffect for VaultTerraformApply {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let module = terraform_module(ctx, "vault")?;
        let (_forward, env) = vault_session(ctx, caps).await?;
        tracing::info!("[vault-terraform-apply] Applying {:?} with {}", module, describe_env(&env));
        caps.terraform.apply(&module, &env, &ctx.cancel).await?;
        Ok(StageOutput::empty().with("module", module.display().to_string()))
    }

    fn reversible(&self) -> bool {
        true
    }

    async fn revert(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<(), AdapterError> {
        let module = terraform_module(ctx, "vault")?;
        let (_forward, env) = vault_session(ctx, caps).await?;
        caps.terraform.destroy(&module, &env, &ctx.cancel).await
    }
}

/// Vault session plus the team variables of the users module. Apply and
/// destroy must see the same variables.
async fn users_session(
    ctx: &StageContext<'_>,
    caps: &Capabilities,
) -> Result<(PortForward, BTreeMap<String, String>), AdapterError> {
    let (forward, mut env) = vault_session(ctx, caps).await?;
    env.insert("TF_VAR_admin_team".to_string(), ctx.request.admin_team_name.clone());
    env.insert("TF_VAR_developer_team".to_string(), ctx.request.developer_team_name.clone());
    Ok((forward, env))
}

pub struct UsersTerraformApply;

#[async_trait]
impl StageEffect for UsersTerraformApply {
    async fn run(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<StageOutput, AdapterError> {
        let module = terraform_module(ctx, "users")?;
        let (_forward, env) = users_session(ctx, caps).await?;
        tracing::info!("[users-terraform-apply] Applying {:?} with {}", module, describe_env(&env));
        caps.terraform.apply(&module, &env, &ctx.cancel).await?;
        Ok(StageOutput::empty().with("module", module.display().to_string()))
    }

    fn reversible(&self) -> bool {
        true
    }

    async fn revert(
        &self,
        ctx: &StageContext<'_>,
        caps: &Capabilities,
    ) -> Result<(), AdapterError> {
        let module = terraform_module(ctx, "users")?;
        let (_forward, env) = users_session(ctx, caps).await?;
        caps.terraform.destroy(&module, &env, &ctx.cancel).await
    }
}
