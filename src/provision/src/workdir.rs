//! Per-cluster working directory under `~/.k1/<cluster-name>/` and the run lock.

use crate::error::ProvisionError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "k1-state.toml";
pub const LOCK_FILE: &str = ".k1.lock";
pub const KBOT_KEY: &str = "kbot_ed25519";

/// Paths owned by a run for one cluster.
#[derive(Debug, Clone)]
pub struct WorkDir {
    base: PathBuf,
    cluster_dir: PathBuf,
}

impl WorkDir {
    /// `base` is the k1 home (normally `~/.k1`).
    pub fn new(base: impl Into<PathBuf>, cluster_name: &str) -> Self {
        let base = base.into();
        let cluster_dir = base.join(cluster_name);
        Self { base, cluster_dir }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn cluster_dir(&self) -> &Path {
        &self.cluster_dir
    }

    pub fn state_file(&self) -> PathBuf {
        self.cluster_dir.join(STATE_FILE)
    }

    pub fn template_dir(&self) -> PathBuf {
        self.cluster_dir.join("gitops-template")
    }

    pub fn gitops_dir(&self) -> PathBuf {
        self.cluster_dir.join("gitops")
    }

    pub fn metaphor_dir(&self) -> PathBuf {
        self.cluster_dir.join("metaphor")
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.cluster_dir.join("ssh")
    }

    pub fn kbot_private_key(&self) -> PathBuf {
        self.ssh_dir().join(KBOT_KEY)
    }

    pub fn kbot_public_key(&self) -> PathBuf {
        self.ssh_dir().join(format!("{}.pub", KBOT_KEY))
    }

    pub fn kubeconfig(&self) -> PathBuf {
        self.cluster_dir.join("kubeconfig")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.cluster_dir.join("tools")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.cluster_dir.join(LOCK_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Create the cluster directory skeleton.
    pub fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.cluster_dir)?;
        fs::create_dir_all(self.tools_dir())?;
        fs::create_dir_all(self.ssh_dir())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(self.ssh_dir(), fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// Remove local working state: template clones, working trees, keys,
    /// kubeconfig, tools and the checkpoint file. Logs are kept.
    pub fn remove_local_state(&self) -> std::io::Result<()> {
        for dir in [
            self.template_dir(),
            self.gitops_dir(),
            self.metaphor_dir(),
            self.ssh_dir(),
            self.tools_dir(),
        ] {
            remove_dir_if_exists(&dir)?;
        }
        for file in [self.kubeconfig(), self.state_file()] {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!("[WorkDir] Removed local state under {:?}", self.cluster_dir);
        Ok(())
    }

    /// Take the run lock for this cluster.
    pub fn lock(&self) -> Result<RunLock, ProvisionError> {
        fs::create_dir_all(&self.cluster_dir)?;
        RunLock::acquire(self.lock_file())
    }
}

pub fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Exclusive lock on a cluster directory, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: PathBuf) -> Result<Self, ProvisionError> {
        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                match holder {
                    Some(pid) if pid_alive(pid) => Err(ProvisionError::Locked(path)),
                    _ => {
                        tracing::warn!(
                            "[RunLock] Taking over stale lock {:?} (holder {:?})",
                            path,
                            holder
                        );
                        fs::remove_file(&path)?;
                        Self::create(&path).map_err(|e| match e.kind() {
                            std::io::ErrorKind::AlreadyExists => ProvisionError::Locked(path.clone()),
                            _ => ProvisionError::Io(e),
                        })
                    }
                }
            }
            Err(e) => Err(ProvisionError::Io(e)),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("[RunLock] Failed to release {:?}: {}", self.path, e);
        }
    }
}

fn pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    if cfg!(target_os = "linux") {
        Path::new("/proc").join(pid.to_string()).exists()
    } else {
        // Without procfs the holder cannot be checked; assume it is alive.
        true
    }
}
