use super::exec::Exec;
use async_trait::async_trait;
use provision::adapters::TerraformAdapter;
use provision::error::{AdapterError, AdapterErrorKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Runs the downloaded terraform binary inside a module directory.
pub struct TerraformCli {
    binary: PathBuf,
}

impl TerraformCli {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn run(
        &self,
        module: &Path,
        env: &BTreeMap<String, String>,
        action: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        if !module.is_dir() {
            return Err(AdapterError::new(
                AdapterErrorKind::TemplateInvalid,
                format!("terraform module {:?} does not exist", module),
            ));
        }
        let terraform = || {
            Exec::new(&self.binary)
                .current_dir(module)
                .envs(env)
                .env("TF_IN_AUTOMATION", "1")
        };
        terraform()
            .args(["init", "-input=false", "-no-color"])
            .output(cancel)
            .await?;
        tracing::info!("[Terraform] {} {:?}", action, module);
        terraform()
            .args([action, "-auto-approve", "-input=false", "-no-color"])
            .output(cancel)
            .await
            .map_err(lock_contention)?;
        Ok(())
    }
}

/// A held state lock clears once the other writer finishes.
fn lock_contention(e: AdapterError) -> AdapterError {
    let locked = e
        .stderr_tail
        .as_deref()
        .map(|s| s.contains("Error acquiring the state lock"))
        .unwrap_or(false);
    if locked {
        let tail = e.stderr_tail.unwrap_or_default();
        AdapterError::transient("terraform state is locked").with_stderr(&tail)
    } else {
        e
    }
}

#[async_trait]
impl TerraformAdapter for TerraformCli {
    async fn apply(
        &self,
        module: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        self.run(module, env, "apply", cancel).await
    }

    async fn destroy(
        &self,
        module: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        self.run(module, env, "destroy", cancel).await
    }
}
