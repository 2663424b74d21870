use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

use crate::{release, Layout};

#[derive(Debug)]
pub struct InstallError {
    pub reason: String,
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kernel install failed: {}", self.reason)
    }
}

impl std::error::Error for InstallError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Target binary already present and `force` not set.
    AlreadyInstalled,
    Installed {
        tag: String,
    },
}

/// Fetch the latest kernel release and install it as `bin/mihomo`,
/// replacing any previous installation when `force` is set.
pub fn install(layout: &Layout, force: bool) -> Result<InstallOutcome> {
    let target = layout.kernel_bin();
    if target.is_file() && !force {
        return Ok(InstallOutcome::AlreadyInstalled);
    }

    let tag = release::latest_release_tag()?;
    let artifact = release::download_artifact(layout, &tag)?;

    unpack_artifact(&artifact, &target).map_err(|e| {
        anyhow::Error::new(InstallError {
            reason: format!("{e:#}"),
        })
    })?;
    std::fs::remove_file(&artifact)
        .with_context(|| format!("remove {}", artifact.display()))?;
    Ok(InstallOutcome::Installed { tag })
}

/// Decompress the gzipped artifact over `target` via a tmp file, so a
/// failed unpack never leaves a truncated binary behind.
fn unpack_artifact(artifact: &Path, target: &Path) -> Result<()> {
    let tmp = target.with_extension("tmp");
    if let Err(err) = unpack_to(artifact, &tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    crate::rename_overwrite_file(&tmp, target)
}

fn unpack_to(artifact: &Path, tmp: &Path) -> Result<()> {
    let f = std::fs::File::open(artifact)
        .with_context(|| format!("open {}", artifact.display()))?;
    let mut gz = GzDecoder::new(f);
    let mut out =
        std::fs::File::create(tmp).with_context(|| format!("create {}", tmp.display()))?;
    std::io::copy(&mut gz, &mut out)
        .with_context(|| format!("decompress {}", artifact.display()))?;
    drop(out);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let perm = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(tmp, perm).with_context(|| format!("chmod {}", tmp.display()))?;
    }
    Ok(())
}
