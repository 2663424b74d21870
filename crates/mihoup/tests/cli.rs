#![cfg(unix)]

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root(prefix: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = base.join(format!("{prefix}_{pid}_{n}"));
    std::fs::create_dir_all(&root).expect("create temp root");
    root
}

fn run_mihoup(root: &Path, args: &[&str]) -> Output {
    let exe = env!("CARGO_BIN_EXE_mihoup");
    Command::new(exe)
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("run mihoup")
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

fn stdout_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

fn assert_success(out: &Output) {
    assert!(
        out.status.success(),
        "status={}\nstdout:\n{}\nstderr:\n{}",
        out.status,
        stdout_of(out),
        stderr_of(out)
    );
}

fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let port = listener.local_addr().expect("local_addr").port();
    drop(listener);
    port
}

/// Pre-install a stand-in kernel so `start` never goes to the network, and
/// a raw config with ports nothing on this host should be holding.
fn seed_root(root: &Path) -> u16 {
    use std::os::unix::fs::PermissionsExt as _;

    let bin_dir = root.join("bin");
    std::fs::create_dir_all(&bin_dir).expect("create bin dir");
    let kernel = bin_dir.join("mihomo");
    std::fs::write(&kernel, "#!/bin/sh\nsleep 30\n").expect("write fake kernel");
    std::fs::set_permissions(&kernel, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let conf_dir = root.join("conf");
    std::fs::create_dir_all(&conf_dir).expect("create conf dir");
    let mixed = free_port();
    let ctrl = free_port();
    std::fs::write(
        conf_dir.join("config.yaml"),
        format!("mixed-port: {mixed}\nexternal-controller: \"127.0.0.1:{ctrl}\"\n"),
    )
    .expect("write raw config");
    mixed
}

fn recorded_pid(root: &Path) -> u32 {
    std::fs::read_to_string(root.join("run.pid"))
        .expect("read run.pid")
        .trim()
        .parse()
        .expect("run.pid holds an integer")
}

fn dead_pid() -> u32 {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg("exit 0")
        .spawn()
        .expect("spawn sh");
    let pid = child.id();
    child.wait().expect("wait sh");
    pid
}

#[test]
fn stop_without_a_record_reports_and_creates_nothing() {
    let root = temp_root("mihoup_cli_stop_empty");

    let out = run_mihoup(&root, &["stop"]);
    assert_success(&out);
    assert!(stderr_of(&out).contains("no running kernel"));
    assert!(!root.join("run.pid").exists());
}

#[test]
fn status_on_a_fresh_root_is_stopped() {
    let root = temp_root("mihoup_cli_status_fresh");

    let out = run_mihoup(&root, &["status"]);
    assert_success(&out);
    assert!(stdout_of(&out).contains("status: stopped"));
}

#[test]
fn start_status_env_stop_lifecycle() {
    let root = temp_root("mihoup_cli_lifecycle");
    let mixed = seed_root(&root);

    let out = run_mihoup(&root, &["start"]);
    assert_success(&out);
    let pid = recorded_pid(&root);
    assert!(stderr_of(&out).contains(&format!("started (pid {pid})")));
    assert!(root.join("conf/runtime.yaml").is_file());
    assert!(root.join("logs/mihomo.log").is_file());

    let out = run_mihoup(&root, &["status"]);
    assert_success(&out);
    let text = stdout_of(&out);
    assert!(text.contains(&format!("status: running (pid {pid})")));
    assert!(text.contains(&format!("mixed port: {mixed}")));

    let out = run_mihoup(&root, &["env"]);
    assert_success(&out);
    let text = stdout_of(&out);
    assert!(text.contains(&format!("export http_proxy=http://127.0.0.1:{mixed}")));
    assert!(text.contains(&format!("export https_proxy=http://127.0.0.1:{mixed}")));
    assert!(text.contains(&format!("export all_proxy=socks5://127.0.0.1:{mixed}")));

    let out = run_mihoup(&root, &["stop"]);
    assert_success(&out);
    assert!(stderr_of(&out).contains(&format!("stopped (pid {pid})")));
    assert!(!root.join("run.pid").exists());
}

#[test]
fn second_start_is_a_noop_while_the_first_is_alive() {
    let root = temp_root("mihoup_cli_double_start");
    seed_root(&root);

    assert_success(&run_mihoup(&root, &["start"]));
    let first_pid = recorded_pid(&root);

    let out = run_mihoup(&root, &["start"]);
    assert_success(&out);
    assert!(stderr_of(&out).contains("already running"));
    assert_eq!(recorded_pid(&root), first_pid, "record overwritten by second start");

    assert_success(&run_mihoup(&root, &["stop"]));
}

#[test]
fn stale_record_reported_by_status_and_cleared_by_start() {
    let root = temp_root("mihoup_cli_stale");
    seed_root(&root);
    let stale = dead_pid();
    std::fs::write(root.join("run.pid"), format!("{stale}\n")).expect("write stale record");

    // status reports STALE and leaves the file alone.
    let out = run_mihoup(&root, &["status"]);
    assert_success(&out);
    assert!(stdout_of(&out).contains(&format!("status: stale pid file (pid {stale} is dead)")));
    assert_eq!(recorded_pid(&root), stale);

    // start clears it and spawns a fresh kernel.
    let out = run_mihoup(&root, &["start"]);
    assert_success(&out);
    assert!(stderr_of(&out).contains("stale pid file"));
    let fresh = recorded_pid(&root);
    assert_ne!(fresh, stale);

    assert_success(&run_mihoup(&root, &["stop"]));
}

#[test]
fn env_without_a_running_kernel_prints_no_exports() {
    let root = temp_root("mihoup_cli_env_stopped");

    let out = run_mihoup(&root, &["env"]);
    assert_success(&out);
    assert_eq!(stdout_of(&out), "", "env must print nothing to stdout when stopped");
    assert!(stderr_of(&out).contains("not running"));
}

#[test]
fn status_json_report() {
    let root = temp_root("mihoup_cli_status_json");
    seed_root(&root);

    let out = run_mihoup(&root, &["--json", "status"]);
    assert_success(&out);
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse status json");
    assert_eq!(
        v.get("schema_version").and_then(|s| s.as_str()),
        Some("mihoup.status@0.1.0")
    );
    assert_eq!(v.get("state").and_then(|s| s.as_str()), Some("stopped"));

    assert_success(&run_mihoup(&root, &["start"]));
    let pid = recorded_pid(&root);

    let out = run_mihoup(&root, &["--json", "status"]);
    assert_success(&out);
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse status json");
    assert_eq!(v.get("state").and_then(|s| s.as_str()), Some("running"));
    assert_eq!(v.get("pid").and_then(|p| p.as_u64()), Some(u64::from(pid)));
    assert!(v.get("mixed_port").and_then(|p| p.as_u64()).is_some());

    assert_success(&run_mihoup(&root, &["stop"]));
}

#[test]
fn restart_spawns_a_new_pid() {
    let root = temp_root("mihoup_cli_restart");
    seed_root(&root);

    assert_success(&run_mihoup(&root, &["start"]));
    let first_pid = recorded_pid(&root);

    let out = run_mihoup(&root, &["restart"]);
    assert_success(&out);
    let second_pid = recorded_pid(&root);
    assert_ne!(first_pid, second_pid);

    assert_success(&run_mihoup(&root, &["stop"]));
}

#[test]
fn update_without_url_or_remembered_source_is_a_noop() {
    let root = temp_root("mihoup_cli_update_noop");

    let out = run_mihoup(&root, &["update"]);
    assert_success(&out);
    assert!(stderr_of(&out).contains("nothing to update"));
}

#[test]
fn start_without_config_fails_with_a_config_error() {
    let root = temp_root("mihoup_cli_start_noconf");
    // Kernel present, but no raw config and no subscription.
    use std::os::unix::fs::PermissionsExt as _;
    let bin_dir = root.join("bin");
    std::fs::create_dir_all(&bin_dir).expect("create bin dir");
    let kernel = bin_dir.join("mihomo");
    std::fs::write(&kernel, "#!/bin/sh\nsleep 30\n").expect("write fake kernel");
    std::fs::set_permissions(&kernel, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let out = run_mihoup(&root, &["start"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr_of(&out).contains("no configuration file found"));
    assert!(!root.join("run.pid").exists());
}

#[test]
fn quiet_suppresses_progress_lines() {
    let root = temp_root("mihoup_cli_quiet");

    let out = run_mihoup(&root, &["--quiet", "stop"]);
    assert_success(&out);
    assert_eq!(stderr_of(&out), "");
}

fn kernel_gone(pid: u32) -> bool {
    if unsafe { libc::kill(pid as i32, 0) } != 0 {
        return true;
    }
    // An unreaped zombie still answers signal 0; check its state.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| Some(stat.rsplit_once(") ")?.1.starts_with('Z')))
        .unwrap_or(false)
}

/// The kernel must be in its own session: it survives the supervisor
/// process that spawned it, and a later invocation can still stop it.
#[test]
fn spawned_kernel_outlives_the_start_invocation() {
    let root = temp_root("mihoup_cli_detached");
    seed_root(&root);

    assert_success(&run_mihoup(&root, &["start"]));
    let pid = recorded_pid(&root);

    // The `start` process is long gone; the kernel is not.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!kernel_gone(pid), "kernel died with its spawning process");

    assert_success(&run_mihoup(&root, &["stop"]));
    let mut gone = false;
    for _ in 0..20 {
        if kernel_gone(pid) {
            gone = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(gone, "kernel survived stop");
}
