//! Client binaries under `<cluster-dir>/tools`.

use super::exec::Exec;
use super::http;
use async_trait::async_trait;
use provision::adapters::{ToolSpec, ToolsAdapter};
use provision::error::{AdapterError, AdapterErrorKind};
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

fn platform() -> (&'static str, &'static str) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    (os, arch)
}

/// Where to fetch a tool and whether the download is a zip archive.
pub fn download_url(tool: &ToolSpec) -> Result<(String, bool), AdapterError> {
    let (os, arch) = platform();
    match tool.name.as_str() {
        "kubectl" => Ok((
            format!("https://dl.k8s.io/release/{}/bin/{}/{}/kubectl", tool.version, os, arch),
            false,
        )),
        "terraform" => Ok((
            format!(
                "https://releases.hashicorp.com/terraform/{v}/terraform_{v}_{os}_{arch}.zip",
                v = tool.version
            ),
            true,
        )),
        other => Err(AdapterError::new(
            AdapterErrorKind::NotFound,
            format!("no download source for tool '{}'", other),
        )),
    }
}

fn io_error(path: &Path, e: std::io::Error) -> AdapterError {
    AdapterError::new(AdapterErrorKind::CommandFailed, format!("{:?}: {}", path, e))
}

pub struct HttpTools {
    client: Client,
}

impl HttpTools {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            client: http::client()?,
        })
    }

    async fn download(&self, dir: &Path, tool: &ToolSpec, cancel: &CancellationToken) -> Result<(), AdapterError> {
        let (url, zipped) = download_url(tool)?;
        tracing::info!("[Tools] Downloading {} {}", tool.name, tool.version);
        let response = http::send(self.client.get(&url), &format!("download {}", tool.name), cancel).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AdapterError::transient(format!("download {}: {}", tool.name, e)))?;

        let target = dir.join(&tool.name);
        if zipped {
            let archive = dir.join(format!("{}.zip", tool.name));
            tokio::fs::write(&archive, &bytes).await.map_err(|e| io_error(&archive, e))?;
            Exec::new("unzip")
                .args(["-o", "-q"])
                .arg(archive.display().to_string())
                .arg(tool.name.clone())
                .arg("-d")
                .arg(dir.display().to_string())
                .output(cancel)
                .await?;
            tokio::fs::remove_file(&archive).await.map_err(|e| io_error(&archive, e))?;
        } else {
            tokio::fs::write(&target, &bytes).await.map_err(|e| io_error(&target, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ToolsAdapter for HttpTools {
    async fn ensure(
        &self,
        dir: &Path,
        tools: &[ToolSpec],
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, AdapterError> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| io_error(dir, e))?;
        let mut paths = Vec::with_capacity(tools.len());
        for tool in tools {
            let path = dir.join(&tool.name);
            if path.is_file() {
                tracing::debug!("[Tools] {} already present", tool.name);
            } else {
                self.download(dir, tool, cancel).await?;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .await
                    .map_err(|e| io_error(&path, e))?;
            }
            paths.push(path);
        }
        Ok(paths)
    }
}
