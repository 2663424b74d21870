use std::io::Read;

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};

use crate::{ports, Layout};

pub const DEFAULT_MIXED_PORT: u16 = 7890;
pub const DEFAULT_CONTROLLER: &str = "127.0.0.1:9090";

const DEFAULT_CONTROLLER_HOST: &str = "127.0.0.1";
const DEFAULT_CONTROLLER_PORT: u16 = 9090;

const MIXED_PORT_KEY: &str = "mixed-port";
const CONTROLLER_KEY: &str = "external-controller";

#[derive(Debug)]
pub enum ConfigError {
    /// No raw configuration on disk and no URL to fetch one from.
    Missing,
    /// Subscription transfer failed; nothing on disk was touched.
    Fetch { url: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing => {
                write!(f, "no configuration file found; provide a subscription URL")
            }
            ConfigError::Fetch { url, reason } => {
                write!(f, "config download failed: GET {url}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// One port rewritten during materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortReassignment {
    pub field: &'static str,
    pub from: u16,
    pub to: u16,
}

/// Effective runtime settings after conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub mixed_port: u16,
    pub controller: String,
    pub reassigned: Vec<PortReassignment>,
}

/// Ports as read back out of an existing `conf/runtime.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub mixed_port: u16,
    pub controller: String,
}

/// Derive `conf/runtime.yaml` from the raw configuration, rewriting the
/// inbound mixed port and the external controller port when something on
/// the host already listens on them.
///
/// With a `subscription_url`, the raw configuration is re-downloaded first
/// and the URL remembered in `conf/.url`; both writes go through tmp files
/// so a failed transfer never leaves a partial update.
pub fn materialize(layout: &Layout, subscription_url: Option<&str>) -> Result<Materialized> {
    if let Some(url) = subscription_url {
        fetch_subscription(layout, url)?;
    }

    let raw_path = layout.raw_config();
    if !raw_path.is_file() {
        return Err(anyhow::Error::new(ConfigError::Missing));
    }

    let text = std::fs::read_to_string(&raw_path)
        .with_context(|| format!("read {}", raw_path.display()))?;
    let doc: Value = serde_yaml::from_str(&text)
        .with_context(|| format!("parse {}", raw_path.display()))?;
    let Value::Mapping(mut doc) = doc else {
        anyhow::bail!("{} is not a YAML mapping", raw_path.display());
    };

    let mut reassigned = Vec::new();

    let mut mixed_port = mixed_port_of(&doc)?;
    if ports::is_in_use(mixed_port) {
        let free = next_free(mixed_port)?;
        reassigned.push(PortReassignment {
            field: MIXED_PORT_KEY,
            from: mixed_port,
            to: free,
        });
        doc.insert(Value::from(MIXED_PORT_KEY), Value::from(free));
        mixed_port = free;
    }

    let (ctrl_host, ctrl_port) = controller_of(&doc)?;
    let mut controller = format!("{ctrl_host}:{ctrl_port}");
    if ports::is_in_use(ctrl_port) {
        let mut free = next_free(ctrl_port)?;
        if free == mixed_port {
            // Nothing is bound on the mixed port yet; the scan must not
            // hand it out twice in one run.
            free = next_free(free)?;
        }
        reassigned.push(PortReassignment {
            field: CONTROLLER_KEY,
            from: ctrl_port,
            to: free,
        });
        controller = format!("{ctrl_host}:{free}");
        doc.insert(Value::from(CONTROLLER_KEY), Value::from(controller.as_str()));
    }

    let rendered =
        serde_yaml::to_string(&Value::Mapping(doc)).context("serialize runtime config")?;
    crate::write_atomic(&layout.runtime_config(), rendered.as_bytes())?;

    Ok(Materialized {
        mixed_port,
        controller,
        reassigned,
    })
}

/// Read the effective ports back out of `conf/runtime.yaml`, if present.
pub fn runtime_settings(layout: &Layout) -> Result<Option<RuntimeSettings>> {
    let path = layout.runtime_config();
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let doc: Value =
        serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    let Value::Mapping(doc) = doc else {
        anyhow::bail!("{} is not a YAML mapping", path.display());
    };
    let mixed_port = mixed_port_of(&doc)?;
    let (host, port) = controller_of(&doc)?;
    Ok(Some(RuntimeSettings {
        mixed_port,
        controller: format!("{host}:{port}"),
    }))
}

/// The subscription URL remembered from the last successful download.
pub fn remembered_subscription(layout: &Layout) -> Result<Option<String>> {
    let path = layout.subscription_url_file();
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let url = text.trim().to_string();
    Ok((!url.is_empty()).then_some(url))
}

fn fetch_subscription(layout: &Layout, url: &str) -> Result<()> {
    let fetch_err = |reason: String| {
        anyhow::Error::new(ConfigError::Fetch {
            url: url.to_string(),
            reason,
        })
    };

    let resp = ureq::get(url)
        .header("User-Agent", concat!("mihoup/", env!("CARGO_PKG_VERSION")))
        .call()
        .map_err(|e| fetch_err(e.to_string()))?;
    let mut reader = resp.into_body().into_reader();
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|e| fetch_err(e.to_string()))?;

    crate::write_atomic(&layout.raw_config(), &body)?;
    crate::write_atomic(&layout.subscription_url_file(), url.trim().as_bytes())?;
    Ok(())
}

fn mixed_port_of(doc: &Mapping) -> Result<u16> {
    match doc.get(MIXED_PORT_KEY) {
        Some(value) => {
            port_value(value).with_context(|| format!("invalid {MIXED_PORT_KEY} in configuration"))
        }
        None => Ok(DEFAULT_MIXED_PORT),
    }
}

/// Controller host and port. The port is whatever follows the last `:`;
/// a value without one, or a non-string value, falls back to the defaults
/// the kernel itself would apply.
fn controller_of(doc: &Mapping) -> Result<(String, u16)> {
    let default = || (DEFAULT_CONTROLLER_HOST.to_string(), DEFAULT_CONTROLLER_PORT);
    let Some(text) = doc.get(CONTROLLER_KEY).and_then(Value::as_str) else {
        return Ok(default());
    };
    match text.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {CONTROLLER_KEY} port in {text:?}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok(default()),
    }
}

fn port_value(value: &Value) -> Result<u16> {
    let n = value.as_u64().context("expected an integer port")?;
    let port = u16::try_from(n).ok().filter(|p| *p > 0);
    port.with_context(|| format!("port {n} out of range 1..=65535"))
}

fn next_free(busy: u16) -> Result<u16> {
    let start = match busy.checked_add(1) {
        Some(start) => start,
        None => {
            return Err(anyhow::Error::new(ports::PortsExhausted {
                starting_at: busy,
            }))
        }
    };
    ports::find_free(start).map_err(anyhow::Error::new)
}
