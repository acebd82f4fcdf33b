//! GitHub / GitLab adapter: REST for accounts, repositories and keys, the
//! `git` CLI for pushes.

use super::exec::Exec;
use super::http;
use async_trait::async_trait;
use base64::Engine;
use provision::adapters::{GitAdapter, GitIdentity, Secret};
use provision::error::{AdapterError, AdapterErrorKind};
use provision::request::{GitProtocol, GitProvider};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

const GITHUB_API: &str = "https://api.github.com";
const GITLAB_API: &str = "https://gitlab.com/api/v4";
const PER_PAGE: usize = 100;
const COMMIT_AUTHOR: &str = "kbot";
const COMMIT_EMAIL: &str = "kbot@kubefirst.io";

#[derive(Debug, Deserialize)]
struct Named {
    #[serde(alias = "path")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Key {
    id: u64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubMembership {
    state: String,
}

#[derive(Debug, Deserialize)]
struct GitlabUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GitlabToken {
    scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GitlabGroup {
    id: u64,
}

pub struct RestGit {
    provider: GitProvider,
    protocol: GitProtocol,
    token: Secret,
    /// Private key used for ssh pushes.
    ssh_key: PathBuf,
    client: Client,
}

impl RestGit {
    pub fn new(
        provider: GitProvider,
        protocol: GitProtocol,
        token: Secret,
        ssh_key: PathBuf,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            provider,
            protocol,
            token,
            ssh_key,
            client: http::client()?,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str, body: serde_json::Value) -> RequestBuilder {
        self.authorized(self.client.post(self.url(path)).json(&body))
    }

    fn url(&self, path: &str) -> String {
        match self.provider {
            GitProvider::Github => format!("{}{}", GITHUB_API, path),
            GitProvider::Gitlab => format!("{}{}", GITLAB_API, path),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.provider {
            GitProvider::Github => request
                .header("Authorization", format!("token {}", self.token.expose()))
                .header("Accept", "application/vnd.github+json"),
            GitProvider::Gitlab => request.header("PRIVATE-TOKEN", self.token.expose()),
        }
    }

    /// Follow `page=` pagination until a short page.
    async fn paged(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AdapterError> {
        let sep = if path.contains('?') { '&' } else { '?' };
        let mut names = Vec::new();
        for page in 1.. {
            let url = format!("{}{}per_page={}&page={}", path, sep, PER_PAGE, page);
            let batch: Vec<Named> = http::json(self.get(&url), path, cancel).await?;
            let done = batch.len() < PER_PAGE;
            names.extend(batch.into_iter().map(|n| n.name));
            if done {
                break;
            }
        }
        Ok(names)
    }

    async fn gitlab_group_id(
        &self,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, AdapterError> {
        let lookup = self.get(&format!("/groups/{}", group));
        let group: GitlabGroup = http::json(lookup, "gitlab group lookup", cancel).await?;
        Ok(group.id)
    }

    fn key_path(&self) -> &'static str {
        "/user/keys"
    }

    fn push_env(&self) -> Exec {
        let git = Exec::new("git");
        match self.protocol {
            GitProtocol::Ssh => git.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=yes",
                    self.ssh_key.display()
                ),
            ),
            GitProtocol::Https => {
                let user = match self.provider {
                    GitProvider::Github => "x-access-token",
                    GitProvider::Gitlab => "oauth2",
                };
                let basic = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, self.token.expose()));
                git.arg("-c")
                    .arg(format!("http.extraHeader=Authorization: Basic {}", basic))
            }
        }
    }
}

#[async_trait]
impl GitAdapter for RestGit {
    async fn verify_token(&self, cancel: &CancellationToken) -> Result<GitIdentity, AdapterError> {
        match self.provider {
            GitProvider::Github => {
                let response = http::send(self.get("/user"), "github token check", cancel).await?;
                let scopes: Vec<String> = response
                    .headers()
                    .get("x-oauth-scopes")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| {
                        v.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                let user: GithubUser = response.json().await.map_err(|e| {
                    let message = format!("github user: {}", e);
                    AdapterError::new(AdapterErrorKind::CommandFailed, message)
                })?;
                tracing::info!("[GitAdapter] GitHub token belongs to {}", user.login);
                Ok(GitIdentity {
                    login: user.login,
                    scopes,
                })
            }
            GitProvider::Gitlab => {
                let user: GitlabUser =
                    http::json(self.get("/user"), "gitlab token check", cancel).await?;
                let scopes = self.get("/personal_access_tokens/self");
                let token: GitlabToken = http::json(scopes, "gitlab token scopes", cancel).await?;
                tracing::info!("[GitAdapter] GitLab token belongs to {}", user.username);
                Ok(GitIdentity {
                    login: user.username,
                    scopes: token.scopes,
                })
            }
        }
    }

    async fn verify_owner_access(
        &self,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let missing = |e: AdapterError| {
            if e.kind == AdapterErrorKind::NotFound {
                AdapterError::new(
                    AdapterErrorKind::NotFound,
                    format!(
                        "token user has no access to {} '{}'",
                        self.provider.owner_flag(),
                        owner
                    ),
                )
            } else {
                e
            }
        };
        match self.provider {
            GitProvider::Github => {
                let membership: GithubMembership = http::json(
                    self.get(&format!("/user/memberships/orgs/{}", owner)),
                    "github org membership",
                    cancel,
                )
                .await
                .map_err(missing)?;
                if membership.state != "active" {
                    return Err(AdapterError::new(
                        AdapterErrorKind::NotFound,
                        format!("membership in '{}' is {}", owner, membership.state),
                    ));
                }
                Ok(())
            }
            GitProvider::Gitlab => {
                self.gitlab_group_id(owner, cancel).await.map_err(missing)?;
                Ok(())
            }
        }
    }

    async fn list_repositories(
        &self,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AdapterError> {
        match self.provider {
            GitProvider::Github => self.paged(&format!("/orgs/{}/repos", owner), cancel).await,
            GitProvider::Gitlab => {
                let id = self.gitlab_group_id(owner, cancel).await?;
                self.paged(&format!("/groups/{}/projects", id), cancel).await
            }
        }
    }

    async fn list_teams(
        &self,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AdapterError> {
        match self.provider {
            GitProvider::Github => self.paged(&format!("/orgs/{}/teams", owner), cancel).await,
            GitProvider::Gitlab => {
                let id = self.gitlab_group_id(owner, cancel).await?;
                self.paged(&format!("/groups/{}/subgroups", id), cancel).await
            }
        }
    }

    async fn initialize(
        &self,
        owner: &str,
        repositories: &[String],
        teams: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let existing_repos = self.list_repositories(owner, cancel).await?;
        let existing_teams = self.list_teams(owner, cancel).await?;
        let group_id = match self.provider {
            GitProvider::Gitlab => Some(self.gitlab_group_id(owner, cancel).await?),
            GitProvider::Github => None,
        };

        for repo in repositories.iter().filter(|r| !existing_repos.contains(r)) {
            let request = match group_id {
                None => self.post(
                    &format!("/orgs/{}/repos", owner),
                    json!({"name": repo, "private": true, "auto_init": false}),
                ),
                Some(id) => self.post(
                    "/projects",
                    json!({
                        "name": repo,
                        "path": repo,
                        "namespace_id": id,
                        "visibility": "private",
                    }),
                ),
            };
            http::send(request, "create repository", cancel).await?;
            tracing::info!("[GitAdapter] Created repository {}/{}", owner, repo);
        }
        for team in teams.iter().filter(|t| !existing_teams.contains(t)) {
            let request = match group_id {
                None => self.post(
                    &format!("/orgs/{}/teams", owner),
                    json!({"name": team, "privacy": "closed"}),
                ),
                Some(id) => self.post(
                    "/groups",
                    json!({"name": team, "path": team, "parent_id": id}),
                ),
            };
            http::send(request, "create team", cancel).await?;
            tracing::info!("[GitAdapter] Created team {}/{}", owner, team);
        }
        Ok(())
    }

    async fn push(
        &self,
        local: &Path,
        remote_url: &str,
        _protocol: GitProtocol,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        if !local.is_dir() {
            return Err(AdapterError::new(
                AdapterErrorKind::NotFound,
                format!("nothing to push: {:?} does not exist", local),
            ));
        }
        let git = || Exec::new("git").current_dir(local);
        if !local.join(".git").exists() {
            git().args(["init", "-b", "main"]).output(cancel).await?;
        }
        git().args(["add", "-A"]).output(cancel).await?;
        let name = format!("user.name={}", COMMIT_AUTHOR);
        let email = format!("user.email={}", COMMIT_EMAIL);
        git()
            .args([
                "-c",
                name.as_str(),
                "-c",
                email.as_str(),
                "commit",
                "--allow-empty",
                "-m",
                "initial commit by k1",
            ])
            .output(cancel)
            .await?;
        self.push_env()
            .current_dir(local)
            .args(["push", "--force", remote_url, "main"])
            .output(cancel)
            .await?;
        tracing::info!("[GitAdapter] Pushed {:?} to {}", local, remote_url);
        Ok(())
    }

    async fn delete_ssh_key(
        &self,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let keys: Vec<Key> = http::json(self.get(self.key_path()), "list ssh keys", cancel).await?;
        for key in keys.iter().filter(|k| k.title == title) {
            let url = self.url(&format!("{}/{}", self.key_path(), key.id));
            let request = self.authorized(self.client.delete(url));
            match http::send(request, "delete ssh key", cancel).await {
                Ok(_) => tracing::info!("[GitAdapter] Deleted ssh key '{}' ({})", title, key.id),
                Err(e) if e.kind == AdapterErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn verify_host_key(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        if self.protocol != GitProtocol::Ssh {
            return Ok(());
        }
        let unknown = || {
            AdapterError::new(
                AdapterErrorKind::CredentialsMissing,
                format!(
                    "no known_hosts entry for {host}; \
                     run `ssh-keyscan {host} >> ~/.ssh/known_hosts`"
                ),
            )
        };
        match Exec::new("ssh-keygen").args(["-F", host]).output(cancel).await {
            Ok(found) if !found.trim().is_empty() => Ok(()),
            Ok(_) => Err(unknown()),
            Err(e) if e.kind == AdapterErrorKind::CommandFailed => Err(unknown()),
            Err(e) => Err(e),
        }
    }
}
