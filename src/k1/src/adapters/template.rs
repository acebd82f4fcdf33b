//! gitops-template clone and preparation.
//!
//! The template repository holds one directory per `<cloud>-<git>` pair plus
//! a shared `metaphor/` application.

use super::exec::Exec;
use async_trait::async_trait;
use provision::adapters::{TemplateAdapter, TokenDictionary};
use provision::error::{AdapterError, AdapterErrorKind};
use provision::request::InstallRequest;
use provision::template::detokenize_tree;
use provision::workdir::remove_dir_if_exists;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

fn invalid(e: impl std::fmt::Display) -> AdapterError {
    AdapterError::new(AdapterErrorKind::TemplateInvalid, e.to_string())
}

/// Copy `src` into `dest`, skipping `.git`.
pub fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let target = dest.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Build the gitops and metaphor trees from a template clone.
pub fn prepare_trees(
    template: &Path,
    request: &InstallRequest,
    gitops_dest: &Path,
    metaphor_dest: &Path,
    tokens: &TokenDictionary,
) -> Result<(), AdapterError> {
    let flavor = format!("{}-{}", request.cloud_provider, request.git_provider);
    let gitops_src = template.join(&flavor);
    let metaphor_src = template.join("metaphor");
    for (dir, what) in [(&gitops_src, flavor.as_str()), (&metaphor_src, "metaphor")] {
        if !dir.is_dir() {
            return Err(invalid(format!("template has no '{}' directory", what)));
        }
    }

    for dest in [gitops_dest, metaphor_dest] {
        remove_dir_if_exists(dest).map_err(invalid)?;
    }
    copy_tree(&gitops_src, gitops_dest).map_err(invalid)?;
    copy_tree(&metaphor_src, metaphor_dest).map_err(invalid)?;

    let gitops = detokenize_tree(gitops_dest, tokens).map_err(invalid)?;
    let metaphor = detokenize_tree(metaphor_dest, tokens).map_err(invalid)?;
    tracing::info!(
        "[Template] Prepared {} ({} files detokenized) and metaphor ({} files)",
        flavor,
        gitops,
        metaphor
    );
    Ok(())
}

pub struct GitTemplate;

#[async_trait]
impl TemplateAdapter for GitTemplate {
    async fn clone_template(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        remove_dir_if_exists(dest).map_err(invalid)?;
        Exec::new("git")
            .args(["clone", "--depth", "1", "--branch", branch, url])
            .arg(dest.display().to_string())
            .output(cancel)
            .await
            .map_err(|e| match e.kind {
                AdapterErrorKind::CommandFailed => AdapterError {
                    kind: AdapterErrorKind::CloneFailed,
                    message: format!("cannot clone {} at {}", url, branch),
                    stderr_tail: e.stderr_tail,
                },
                _ => e,
            })?;
        tracing::info!("[Template] Cloned {}@{}", url, branch);
        Ok(())
    }

    async fn prepare(
        &self,
        template: &Path,
        request: &InstallRequest,
        gitops_dest: &Path,
        metaphor_dest: &Path,
        tokens: &TokenDictionary,
        _cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let template = template.to_path_buf();
        let request = request.clone();
        let gitops: PathBuf = gitops_dest.to_path_buf();
        let metaphor: PathBuf = metaphor_dest.to_path_buf();
        let tokens = tokens.clone();
        tokio::task::spawn_blocking(move || prepare_trees(&template, &request, &gitops, &metaphor, &tokens))
            .await
            .map_err(|e| AdapterError::new(AdapterErrorKind::TemplateInvalid, format!("prepare task: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_prepare_trees_copies_flavor_and_metaphor() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        write(&template.join("k3s-github/terraform/github/main.tf"), "owner = \"<GITHUB_OWNER>\"");
        write(&template.join("k3s-github/.git/HEAD"), "ref");
        write(&template.join("aws-github/README.md"), "other flavor");
        write(&template.join("metaphor/app.yaml"), "host: <METAPHOR_HOST>");

        let mut request = crate::adapters::tests::k3s_request();
        request.git_owner = "acme".into();
        let mut tokens = TokenDictionary::new();
        tokens.insert("<GITHUB_OWNER>".into(), "acme".into());
        tokens.insert("<METAPHOR_HOST>".into(), "metaphor.example.com".into());

        let gitops = dir.path().join("gitops");
        let metaphor = dir.path().join("metaphor");
        prepare_trees(&template, &request, &gitops, &metaphor, &tokens).unwrap();

        let main_tf = std::fs::read_to_string(gitops.join("terraform/github/main.tf")).unwrap();
        assert_eq!(main_tf, "owner = \"acme\"");
        assert!(!gitops.join(".git").exists());
        assert!(!gitops.join("README.md").exists());
        let app = std::fs::read_to_string(metaphor.join("app.yaml")).unwrap();
        assert_eq!(app, "host: metaphor.example.com");
    }

    #[test]
    fn test_missing_flavor_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("metaphor")).unwrap();
        let err = prepare_trees(
            dir.path(),
            &crate::adapters::tests::k3s_request(),
            &dir.path().join("gitops"),
            &dir.path().join("metaphor-out"),
            &TokenDictionary::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::TemplateInvalid);
        assert!(err.message.contains("k3s-github"));
    }
}
