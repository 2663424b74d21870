use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

mod config;
mod install;
mod ports;
mod process;
mod release;
mod supervisor;

pub use config::{
    materialize, remembered_subscription, runtime_settings, ConfigError, Materialized,
    PortReassignment, RuntimeSettings, DEFAULT_CONTROLLER, DEFAULT_MIXED_PORT,
};
pub use install::{install, InstallError, InstallOutcome};
pub use ports::{find_free, is_in_use, PortsExhausted, PROBE_TIMEOUT};
pub use process::{ProcessControl, UnixProcessControl};
pub use release::{download_artifact, latest_release_tag, platform_tag, FetchError};
pub use supervisor::{
    KernelStatus, RecordState, SpawnError, StopOutcome, Supervisor, STOP_GRACE,
};

pub const KERNEL_NAME: &str = "mihomo";
pub const REPO_OWNER: &str = "MetaCubeX";
pub const REPO_NAME: &str = "mihomo";

pub const ENV_ROOT: &str = "MIHOUP_ROOT";

/// Filesystem layout of one installation root.
///
/// Constructed once at process entry and passed to every component; all
/// supervisor state (kernel binary, configs, pid file, kernel log) lives
/// under this root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn kernel_bin(&self) -> PathBuf {
        self.bin_dir().join(KERNEL_NAME)
    }

    pub fn raw_config(&self) -> PathBuf {
        self.conf_dir().join("config.yaml")
    }

    pub fn runtime_config(&self) -> PathBuf {
        self.conf_dir().join("runtime.yaml")
    }

    pub fn subscription_url_file(&self) -> PathBuf {
        self.conf_dir().join(".url")
    }

    pub fn kernel_log(&self) -> PathBuf {
        self.logs_dir().join(format!("{KERNEL_NAME}.log"))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("run.pid")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.bin_dir(), self.conf_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn rename_overwrite_file(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() && dst.is_dir() {
        anyhow::bail!("refusing to overwrite directory: {}", dst.display());
    }
    #[cfg(windows)]
    {
        if dst.exists() {
            std::fs::remove_file(dst).with_context(|| format!("remove {}", dst.display()))?;
        }
    }
    std::fs::rename(src, dst)
        .with_context(|| format!("rename {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

/// Write `bytes` to `path` via a sibling tmp file so a failure partway
/// through never replaces an existing file with a truncated one.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    if let Err(err) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("write {}", tmp.display()));
    }
    rename_overwrite_file(&tmp, path)
}
