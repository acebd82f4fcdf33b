/// Orchestrator configuration
/// Loaded from ~/.k1/k1.toml, overridden by K1_* environment variables
use crate::resolver::EnvSource;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct K1Config {
    /// Attempts per stage for transient failures
    pub max_attempts: u32,
    /// Wall-clock budget per stage, retries included
    pub stage_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// How long a cancelled effect may take to return
    pub cancel_grace_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Consecutive failed polls tolerated before the cluster is unreachable
    pub unreachable_ticks: u32,
    pub event_capacity: usize,
    pub deployment_timeout_secs: u64,
    pub vault_timeout_secs: u64,
    pub control_plane_url: String,
    /// Completed steps kept on screen by the interactive reporter
    pub interactive_history: usize,
}

impl Default for K1Config {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stage_timeout_secs: 600,
            backoff_base_ms: 2000,
            backoff_cap_ms: 30_000,
            cancel_grace_secs: 5,
            reconcile_interval_secs: 10,
            unreachable_ticks: 6,
            event_capacity: 128,
            deployment_timeout_secs: 240,
            vault_timeout_secs: 600,
            control_plane_url: "http://localhost:8081".to_string(),
            interactive_history: 5,
        }
    }
}

impl K1Config {
    /// Load configuration from file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            tracing::debug!("[K1Config] No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {:?}: {}", path, e))?;
        let config: K1Config = toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {:?}: {}", path, e))?;
        tracing::info!("[K1Config] Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply `K1_<FIELD>` overrides.
    pub fn apply_env(mut self, env: &dyn EnvSource) -> Result<Self, String> {
        fn num<T: std::str::FromStr>(env: &dyn EnvSource, key: &str, slot: &mut T) -> Result<(), String> {
            if let Some(raw) = env.var(key) {
                *slot = raw
                    .parse()
                    .map_err(|_| format!("{}={} is not a valid number", key, raw))?;
            }
            Ok(())
        }
        num(env, "K1_MAX_ATTEMPTS", &mut self.max_attempts)?;
        num(env, "K1_STAGE_TIMEOUT_SECS", &mut self.stage_timeout_secs)?;
        num(env, "K1_BACKOFF_BASE_MS", &mut self.backoff_base_ms)?;
        num(env, "K1_BACKOFF_CAP_MS", &mut self.backoff_cap_ms)?;
        num(env, "K1_CANCEL_GRACE_SECS", &mut self.cancel_grace_secs)?;
        num(env, "K1_RECONCILE_INTERVAL_SECS", &mut self.reconcile_interval_secs)?;
        num(env, "K1_UNREACHABLE_TICKS", &mut self.unreachable_ticks)?;
        num(env, "K1_EVENT_CAPACITY", &mut self.event_capacity)?;
        num(env, "K1_DEPLOYMENT_TIMEOUT_SECS", &mut self.deployment_timeout_secs)?;
        num(env, "K1_VAULT_TIMEOUT_SECS", &mut self.vault_timeout_secs)?;
        num(env, "K1_INTERACTIVE_HISTORY", &mut self.interactive_history)?;
        if let Some(url) = env.var("K1_CONTROL_PLANE_URL") {
            self.control_plane_url = url;
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be at least 1".to_string());
        }
        Ok(self)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }

    pub fn vault_timeout(&self) -> Duration {
        Duration::from_secs(self.vault_timeout_secs)
    }
}
