use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use mihoup_core::{
    materialize, remembered_subscription, runtime_settings, InstallOutcome, KernelStatus, Layout,
    Materialized, RecordState, StopOutcome, Supervisor, UnixProcessControl, ENV_ROOT, KERNEL_NAME,
};

const STATUS_SCHEMA_VERSION: &str = "mihoup.status@0.1.0";

#[derive(Debug, Parser)]
#[command(name = "mihoup")]
#[command(about = "Rootless supervisor for the mihomo proxy kernel.", long_about = None)]
struct Cli {
    /// Installation root (default: $MIHOUP_ROOT, else ~/.mihoup).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy kernel.
    Start,
    /// Stop the proxy kernel.
    Stop,
    /// Restart the proxy kernel.
    Restart,
    /// Report supervisor state.
    Status,
    /// Download and install the kernel binary.
    Install,
    /// Print proxy environment exports for the current shell.
    Env,
    /// Update the kernel binary and/or the subscription config.
    Update(UpdateArgs),
}

#[derive(Debug, Args)]
struct UpdateArgs {
    /// New subscription URL (replaces the remembered one).
    #[arg(long)]
    url: Option<String>,

    /// Force a kernel binary update.
    #[arg(long)]
    kernel: bool,
}

#[derive(Debug)]
struct Reporter {
    json: bool,
    quiet: bool,
}

impl Reporter {
    fn progress(&self, msg: &str) {
        if self.json || self.quiet {
            return;
        }
        eprintln!("{msg}");
    }
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    let layout = Layout::new(effective_root(cli.root)?);
    layout.ensure_dirs()?;
    let reporter = Reporter {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.cmd {
        Command::Start => cmd_start(&layout, &reporter),
        Command::Stop => cmd_stop(&layout, &reporter),
        Command::Restart => {
            cmd_stop(&layout, &reporter)?;
            cmd_start(&layout, &reporter)
        }
        Command::Status => cmd_status(&layout, &reporter),
        Command::Install => {
            run_install(&layout, true, &reporter)?;
            Ok(std::process::ExitCode::SUCCESS)
        }
        Command::Env => cmd_env(&layout, &reporter),
        Command::Update(args) => cmd_update(&layout, args, &reporter),
    }
}

fn effective_root(root: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(root) = root {
        return Ok(root);
    }
    if let Some(v) = std::env::var_os(ENV_ROOT) {
        if !v.is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    if let Some(root) = root_from_installed_exe() {
        return Ok(root);
    }
    let home = std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .context("could not determine home directory (set MIHOUP_ROOT or pass --root)")?;
    Ok(PathBuf::from(home).join(".mihoup"))
}

fn root_from_installed_exe() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let bin = exe.parent()?;
    if bin.file_name()? != "bin" {
        return None;
    }
    Some(bin.parent()?.to_path_buf())
}

fn cmd_start(layout: &Layout, reporter: &Reporter) -> Result<std::process::ExitCode> {
    let sup = Supervisor::new(layout, UnixProcessControl);
    match sup.current()? {
        RecordState::Alive(pid) => {
            reporter.progress(&format!("kernel already running (pid {pid})"));
            return Ok(std::process::ExitCode::SUCCESS);
        }
        RecordState::Stale(pid) => {
            reporter.progress(&format!("stale pid file for dead pid {pid}, removing"));
            sup.clear_stale()?;
        }
        RecordState::Absent => {}
    }

    if !layout.kernel_bin().is_file() {
        reporter.progress("kernel binary missing, installing latest release");
        run_install(layout, false, reporter)?;
    }

    let materialized = materialize(layout, None)?;
    report_reassignments(&materialized, reporter);

    reporter.progress(&format!("starting {KERNEL_NAME} kernel"));
    let pid = sup.spawn()?;
    reporter.progress(&format!("started (pid {pid})"));

    let port = materialized.mixed_port;
    reporter.progress(&format!("proxy listening on 127.0.0.1:{port}"));
    reporter.progress(&format!(
        "verify with: https_proxy=http://127.0.0.1:{port} curl -I https://example.com"
    ));
    Ok(std::process::ExitCode::SUCCESS)
}

fn cmd_stop(layout: &Layout, reporter: &Reporter) -> Result<std::process::ExitCode> {
    let sup = Supervisor::new(layout, UnixProcessControl);
    match sup.stop()? {
        StopOutcome::NotRunning => reporter.progress("no running kernel"),
        StopOutcome::Stopped { pid, forced: false } => {
            reporter.progress(&format!("stopped (pid {pid})"))
        }
        StopOutcome::Stopped { pid, forced: true } => {
            reporter.progress(&format!("kernel ignored the term signal, killed (pid {pid})"))
        }
    }
    Ok(std::process::ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct StatusReport {
    schema_version: &'static str,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mixed_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_controller: Option<String>,
}

fn cmd_status(layout: &Layout, reporter: &Reporter) -> Result<std::process::ExitCode> {
    let sup = Supervisor::new(layout, UnixProcessControl);
    let status = sup.status()?;

    if reporter.json {
        let report = match &status {
            KernelStatus::Stopped => StatusReport {
                schema_version: STATUS_SCHEMA_VERSION,
                state: "stopped",
                pid: None,
                mixed_port: None,
                external_controller: None,
            },
            KernelStatus::Stale { pid } => StatusReport {
                schema_version: STATUS_SCHEMA_VERSION,
                state: "stale",
                pid: Some(*pid),
                mixed_port: None,
                external_controller: None,
            },
            KernelStatus::Running { pid, settings } => StatusReport {
                schema_version: STATUS_SCHEMA_VERSION,
                state: "running",
                pid: Some(*pid),
                mixed_port: settings.as_ref().map(|s| s.mixed_port),
                external_controller: settings.as_ref().map(|s| s.controller.clone()),
            },
        };
        write_json_stdout(&report)?;
        return Ok(std::process::ExitCode::SUCCESS);
    }

    match status {
        KernelStatus::Stopped => println!("status: stopped"),
        KernelStatus::Stale { pid } => println!("status: stale pid file (pid {pid} is dead)"),
        KernelStatus::Running { pid, settings } => {
            println!("status: running (pid {pid})");
            if let Some(settings) = settings {
                println!("mixed port: {}", settings.mixed_port);
                println!("controller: {}", settings.controller);
            }
        }
    }
    Ok(std::process::ExitCode::SUCCESS)
}

fn cmd_env(layout: &Layout, reporter: &Reporter) -> Result<std::process::ExitCode> {
    let sup = Supervisor::new(layout, UnixProcessControl);
    if !matches!(sup.current()?, RecordState::Alive(_)) {
        // Progress goes to stderr, so `eval "$(mihoup env)"` stays a no-op.
        reporter.progress("kernel is not running, nothing to export");
        return Ok(std::process::ExitCode::SUCCESS);
    }
    let Some(settings) = runtime_settings(layout)? else {
        reporter.progress("no runtime configuration found");
        return Ok(std::process::ExitCode::SUCCESS);
    };

    let port = settings.mixed_port;
    println!("export http_proxy=http://127.0.0.1:{port}");
    println!("export https_proxy=http://127.0.0.1:{port}");
    println!("export all_proxy=socks5://127.0.0.1:{port}");
    Ok(std::process::ExitCode::SUCCESS)
}

fn cmd_update(
    layout: &Layout,
    args: UpdateArgs,
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    if args.kernel {
        run_install(layout, true, reporter)?;
    }

    let url = match args.url {
        Some(url) => Some(url),
        None => remembered_subscription(layout)?,
    };
    let Some(url) = url else {
        if !args.kernel {
            reporter.progress("no subscription url given or remembered, nothing to update");
        }
        return Ok(std::process::ExitCode::SUCCESS);
    };

    reporter.progress(&format!("downloading configuration from {url}"));
    let materialized = materialize(layout, Some(&url))?;
    report_reassignments(&materialized, reporter);
    reporter.progress(&format!(
        "runtime configuration written to {}",
        layout.runtime_config().display()
    ));

    if !args.kernel {
        let sup = Supervisor::new(layout, UnixProcessControl);
        if !matches!(sup.current()?, RecordState::Absent) {
            reporter.progress("restarting kernel to apply the new configuration");
            cmd_stop(layout, reporter)?;
            return cmd_start(layout, reporter);
        }
    }
    Ok(std::process::ExitCode::SUCCESS)
}

fn run_install(layout: &Layout, force: bool, reporter: &Reporter) -> Result<()> {
    if force || !layout.kernel_bin().is_file() {
        reporter.progress("checking for the latest kernel release");
    }
    match mihoup_core::install(layout, force)? {
        InstallOutcome::AlreadyInstalled => {
            reporter.progress("kernel already installed (use `update --kernel` to force)")
        }
        InstallOutcome::Installed { tag } => {
            reporter.progress(&format!("installed {KERNEL_NAME} {tag}"))
        }
    }
    Ok(())
}

fn report_reassignments(materialized: &Materialized, reporter: &Reporter) {
    for r in &materialized.reassigned {
        reporter.progress(&format!(
            "port {} is busy, using {} for {}",
            r.from, r.to, r.field
        ));
    }
}

fn write_json_stdout<T: Serialize>(v: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec(v)?;
    bytes.push(b'\n');
    std::io::stdout()
        .write_all(&bytes)
        .context("write stdout")?;
    Ok(())
}
