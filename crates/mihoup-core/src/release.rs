use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ureq::ResponseExt as _;

use crate::{Layout, KERNEL_NAME, REPO_NAME, REPO_OWNER};

#[derive(Debug)]
pub enum FetchError {
    /// Latest-release resolution failed or the resolved URL carried no tag.
    Network(String),
    /// Artifact transfer failed.
    Download(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Network(msg) => write!(f, "release lookup failed: {msg}"),
            FetchError::Download(msg) => write!(f, "kernel download failed: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Asset platform component of the release file name, e.g.
/// "linux-amd64-compatible".
pub fn platform_tag() -> Result<&'static str> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let tag = match (os, arch) {
        ("linux", "x86_64") => "linux-amd64-compatible",
        ("linux", "aarch64") => "linux-arm64",
        ("macos", "x86_64") => "darwin-amd64",
        ("macos", "aarch64") => "darwin-arm64",
        _ => anyhow::bail!("unsupported host for {KERNEL_NAME}: os={os} arch={arch}"),
    };
    Ok(tag)
}

fn looks_like_version_tag(s: &str) -> bool {
    match s.strip_prefix('v') {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit() || b == b'.'),
        None => false,
    }
}

/// Resolve the tag of the latest published kernel release.
///
/// GitHub redirects `releases/latest` to `releases/tag/<tag>`; the tag is
/// read from the URL the redirect lands on.
pub fn latest_release_tag() -> Result<String> {
    let url = format!("https://github.com/{REPO_OWNER}/{REPO_NAME}/releases/latest");
    let resp = ureq::head(&url)
        .call()
        .map_err(|e| anyhow::Error::new(FetchError::Network(format!("HEAD {url}: {e}"))))?;

    let resolved = resp.get_uri().to_string();
    let tag = match resolved.split_once("/tag/") {
        Some((_, tag)) => tag.trim_end_matches('/'),
        None => {
            return Err(anyhow::Error::new(FetchError::Network(format!(
                "no release tag in resolved URL {resolved}"
            ))))
        }
    };
    if !looks_like_version_tag(tag) {
        return Err(anyhow::Error::new(FetchError::Network(format!(
            "unexpected release tag {tag:?} in resolved URL {resolved}"
        ))));
    }
    Ok(tag.to_string())
}

/// Download the compressed kernel artifact for `tag` into `bin/`, returning
/// its path. The transfer goes through a tmp file that is renamed into place
/// only on full success, so a partial download never looks like a valid
/// artifact.
pub fn download_artifact(layout: &Layout, tag: &str) -> Result<PathBuf> {
    let filename = format!("{KERNEL_NAME}-{}-{tag}.gz", platform_tag()?);
    let url = format!(
        "https://github.com/{REPO_OWNER}/{REPO_NAME}/releases/download/{tag}/{filename}"
    );
    let dest = layout.bin_dir().join(&filename);
    std::fs::create_dir_all(layout.bin_dir())
        .with_context(|| format!("create {}", layout.bin_dir().display()))?;

    let resp = ureq::get(&url)
        .call()
        .map_err(|e| anyhow::Error::new(FetchError::Download(format!("GET {url}: {e}"))))?;
    let mut reader = resp.into_body().into_reader();

    let tmp = dest.with_extension("download.tmp");
    if let Err(err) = stream_to_file(&mut reader, &tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(anyhow::Error::new(FetchError::Download(format!(
            "GET {url}: {err:#}"
        ))));
    }
    crate::rename_overwrite_file(&tmp, &dest)?;
    Ok(dest)
}

fn stream_to_file(reader: &mut dyn Read, dest: &Path) -> Result<()> {
    let mut f =
        std::fs::File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).context("read download stream")?;
        if n == 0 {
            break;
        }
        f.write_all(&buf[..n])
            .with_context(|| format!("write {}", dest.display()))?;
    }
    f.flush().ok();
    Ok(())
}
