//! Command handlers. Each returns a `ProvisionError` so the binary can map
//! it to an exit code.

pub mod create;
pub mod destroy;
pub mod reset;
pub mod root_credentials;

use crate::cli::{Action, Cli};
use provision::error::ValidationError;
use provision::progress::ProgressEvent;
use provision::reporter::{spawn_reporter, InteractiveSink, LineSink, ProgressSink};
use provision::request::{CloudProvider, InstallRequest};
use provision::{CheckpointStore, EnvSource, K1Config, ProvisionError, WorkDir};
use std::io::{IsTerminal, Stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `~/.k1`, or `./.k1` when there is no home directory.
pub fn default_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".k1")
}

/// Everything a command needs from the process.
pub struct Context {
    pub home: PathBuf,
    pub config: K1Config,
    pub env: Arc<dyn EnvSource>,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn load(
        home: PathBuf,
        config_path: Option<&Path>,
        env: Arc<dyn EnvSource>,
        cancel: CancellationToken,
    ) -> Result<Self, ProvisionError> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| home.join("k1.toml"));
        let config = K1Config::load(&path)
            .and_then(|c| c.apply_env(env.as_ref()))
            .map_err(|e| ValidationError::single("config", e))?;
        Ok(Self {
            home,
            config,
            env,
            cancel,
        })
    }

    pub fn workdir(&self, cluster_name: &str) -> WorkDir {
        WorkDir::new(&self.home, cluster_name)
    }

    pub fn open_store(&self, workdir: &WorkDir, cluster_name: &str) -> Result<CheckpointStore, ProvisionError> {
        Ok(CheckpointStore::open(workdir.state_file(), cluster_name)?)
    }
}

/// Run the selected command.
pub async fn dispatch(ctx: &Context, cli: Cli) -> Result<(), ProvisionError> {
    let (cloud, action) = cli.provider.into_parts();
    tracing::info!("[k1] {} {:?}", cloud, action);
    match action {
        Action::Create(args) => create::run(ctx, cloud, &args).await,
        Action::Destroy(args) => destroy::run(ctx, cloud, &args).await,
        Action::RootCredentials(args) => root_credentials::run(ctx, cloud, &args).await,
        Action::Reset(args) => reset::run(ctx, cloud, &args),
    }
}

/// The checkpointed request of a cluster, which must belong to `cloud`.
pub fn checkpointed_request(store: &CheckpointStore, cloud: CloudProvider) -> Result<InstallRequest, ProvisionError> {
    let request = store
        .flags()
        .cloned()
        .ok_or_else(|| ProvisionError::NotInstalled(store.cluster_name().to_string()))?;
    if request.cloud_provider != cloud {
        return Err(ValidationError::single(
            "provider",
            format!(
                "cluster '{}' was created on {}, not {}",
                request.cluster_name, request.cloud_provider, cloud
            ),
        )
        .into());
    }
    Ok(request)
}

/// Terminal rendering chosen per invocation.
pub enum Reporter {
    Interactive(InteractiveSink<Stdout>),
    Lines(LineSink<Stdout>),
}

impl Reporter {
    /// Redraw in place on a terminal unless `--ci` asked for plain lines.
    pub fn choose(config: &K1Config, ci: bool) -> Self {
        let out = std::io::stdout();
        if !ci && out.is_terminal() {
            Reporter::Interactive(InteractiveSink::new(out, config.interactive_history))
        } else {
            Reporter::Lines(LineSink::new(out))
        }
    }

    pub fn spawn(self, events: mpsc::Receiver<ProgressEvent>) -> JoinHandle<Self> {
        spawn_reporter(events, self)
    }
}

impl ProgressSink for Reporter {
    fn render(&mut self, event: &ProgressEvent) {
        match self {
            Reporter::Interactive(sink) => sink.render(event),
            Reporter::Lines(sink) => sink.render(event),
        }
    }

    fn finish(&mut self) {
        match self {
            Reporter::Interactive(sink) => sink.finish(),
            Reporter::Lines(sink) => sink.finish(),
        }
    }
}

/// What the user sees when a command fails.
pub fn failure_summary(err: &ProvisionError, log_file: Option<&Path>) -> String {
    let stage = err
        .stage()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let message = err.to_string();
    let summary = message.lines().next().unwrap_or_default();
    let mut out = format!(
        "Error\n  stage: {}\n  kind:  {}\n  error: {}\n",
        stage,
        err.category(),
        summary
    );
    if let Some(path) = log_file {
        out.push_str(&format!("  log:   {}\n", path.display()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use provision::error::{AdapterError, AdapterErrorKind};
    use provision::StageId;

    #[test]
    fn test_failure_summary_names_stage_and_log() {
        let err = ProvisionError::Stage {
            stage: StageId::VAULT_UNSEAL,
            source: AdapterError::new(AdapterErrorKind::CommandFailed, "vault is still sealed\nmore"),
        };
        let summary = failure_summary(&err, Some(Path::new("/home/ops/.k1/logs/k1-1.log")));
        assert!(summary.contains(&format!("stage: {}", StageId::VAULT_UNSEAL)));
        assert!(summary.contains("kind:  permanent"));
        assert!(summary.contains("vault is still sealed"));
        assert!(!summary.contains("more"));
        assert!(summary.contains("log:   /home/ops/.k1/logs/k1-1.log"));
    }

    #[test]
    fn test_failure_summary_without_stage() {
        let err = ProvisionError::Unreachable(7);
        let summary = failure_summary(&err, None);
        assert!(summary.contains("stage: -"));
        assert!(summary.contains("kind:  transient"));
        assert!(!summary.contains("log:"));
    }

    #[test]
    fn test_context_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let env: Arc<dyn EnvSource> = Arc::new(
            [("K1_MAX_ATTEMPTS".to_string(), "zero".to_string())]
                .into_iter()
                .collect::<std::collections::BTreeMap<_, _>>(),
        );
        let err = Context::load(dir.path().to_path_buf(), None, env, CancellationToken::new())
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), provision::exit_codes::VALIDATION);
    }
}
