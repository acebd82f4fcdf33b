use super::exec::Exec;
use async_trait::async_trait;
use provision::adapters::{KeyGenerator, KeyPair, Secret};
use provision::error::{AdapterError, AdapterErrorKind};
use rand::RngCore;
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn io_error(path: &Path, e: std::io::Error) -> AdapterError {
    AdapterError::new(AdapterErrorKind::CommandFailed, format!("{:?}: {}", path, e))
}

pub fn hex_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// ed25519 keys via `ssh-keygen`, random tokens via the thread RNG.
pub struct SshKeygen;

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(
        &self,
        private_path: &Path,
        comment: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyPair, AdapterError> {
        let public_path = private_path.with_extension("pub");
        for path in [private_path, public_path.as_path()] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!("[Keys] Replacing {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(path, e)),
            }
        }
        if let Some(dir) = private_path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| io_error(dir, e))?;
        }

        Exec::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
            .arg(private_path.display().to_string())
            .output(cancel)
            .await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for path in [private_path, public_path.as_path()] {
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                    .await
                    .map_err(|e| io_error(path, e))?;
            }
        }

        let public_key = tokio::fs::read_to_string(&public_path)
            .await
            .map_err(|e| io_error(&public_path, e))?;
        let private_key = tokio::fs::read_to_string(private_path)
            .await
            .map_err(|e| io_error(private_path, e))?;
        tracing::info!("[Keys] Generated {:?}", public_path);
        Ok(KeyPair {
            public_key: public_key.trim().to_string(),
            private_key: Secret::new(private_key),
        })
    }

    fn random_token(&self, bytes: usize) -> Result<Secret, AdapterError> {
        Ok(Secret::new(hex_token(bytes)))
    }
}
