use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{self, RuntimeSettings};
use crate::process::ProcessControl;
use crate::Layout;

/// Wait between the graceful signal and the forced kill during `stop`.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SpawnError {
    pub reason: String,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to start kernel: {}", self.reason)
    }
}

impl std::error::Error for SpawnError {}

/// Classification of the pid file against live processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Absent,
    Alive(u32),
    /// Record present, process dead.
    Stale(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32, forced: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelStatus {
    Stopped,
    Running {
        pid: u32,
        settings: Option<RuntimeSettings>,
    },
    Stale {
        pid: u32,
    },
}

/// PID-file based supervision of the kernel process.
///
/// The supervisor is the sole writer of the pid file. Liveness and
/// termination go through [`ProcessControl`] so the state machine can be
/// unit-tested against a fake.
pub struct Supervisor<'a, C: ProcessControl> {
    layout: &'a Layout,
    control: C,
    grace: Duration,
}

impl<'a, C: ProcessControl> Supervisor<'a, C> {
    pub fn new(layout: &'a Layout, control: C) -> Self {
        Self {
            layout,
            control,
            grace: STOP_GRACE,
        }
    }

    /// Override the stop grace period (tests).
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Classify the pid file: absent, pointing at a live process, or stale.
    pub fn current(&self) -> Result<RecordState> {
        let Some(pid) = self.read_record()? else {
            return Ok(RecordState::Absent);
        };
        if self.control.is_alive(pid) {
            Ok(RecordState::Alive(pid))
        } else {
            Ok(RecordState::Stale(pid))
        }
    }

    /// Remove a stale record. `status` never does this; only the start path
    /// clears stale state.
    pub fn clear_stale(&self) -> Result<()> {
        let path = self.layout.pid_file();
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
    }

    /// Spawn the kernel detached in its own session, with stdout and stderr
    /// redirected to a freshly truncated `logs/mihomo.log`, and record the
    /// child pid. The record is written only after a successful spawn.
    pub fn spawn(&self) -> Result<u32> {
        let kernel = self.layout.kernel_bin();
        let log_path = self.layout.kernel_log();
        let log = std::fs::File::create(&log_path)
            .with_context(|| format!("create {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("clone handle for {}", log_path.display()))?;

        let mut cmd = Command::new(&kernel);
        cmd.arg("-d").arg(self.layout.root());
        cmd.arg("-f").arg(self.layout.runtime_config());
        cmd.current_dir(self.layout.root());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));

        // Own session: the kernel must survive this process exiting.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|e| {
            anyhow::Error::new(SpawnError {
                reason: format!("spawn {}: {e}", kernel.display()),
            })
        })?;
        let pid = child.id();
        self.write_record(pid)?;
        Ok(pid)
    }

    /// Graceful-then-forced termination. Whatever the signals achieve, the
    /// pid file is removed before returning: `stop` always lands in
    /// STOPPED, never STALE. A process that is already gone is the expected
    /// success case, not an error.
    pub fn stop(&self) -> Result<StopOutcome> {
        if !self.layout.pid_file().is_file() {
            return Ok(StopOutcome::NotRunning);
        }
        // A record we cannot parse is still cleared; there is no pid left
        // to signal.
        let pid = match self.read_record() {
            Ok(Some(pid)) => Some(pid),
            Ok(None) | Err(_) => None,
        };

        let outcome = match pid {
            Some(pid) => {
                self.control.terminate(pid);
                std::thread::sleep(self.grace);
                let forced = self.control.is_alive(pid);
                if forced {
                    self.control.kill(pid);
                }
                StopOutcome::Stopped { pid, forced }
            }
            None => StopOutcome::NotRunning,
        };

        self.remove_record();
        Ok(outcome)
    }

    /// Read-only report. A stale record is reported as such but left in
    /// place for the next start to clean up.
    pub fn status(&self) -> Result<KernelStatus> {
        match self.current()? {
            RecordState::Absent => Ok(KernelStatus::Stopped),
            RecordState::Stale(pid) => Ok(KernelStatus::Stale { pid }),
            RecordState::Alive(pid) => {
                let settings = config::runtime_settings(self.layout)?;
                Ok(KernelStatus::Running { pid, settings })
            }
        }
    }

    fn read_record(&self) -> Result<Option<u32>> {
        let path = self.layout.pid_file();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let pid = text
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid pid record in {}", path.display()))?;
        Ok(Some(pid))
    }

    fn write_record(&self, pid: u32) -> Result<()> {
        let path = self.layout.pid_file();
        std::fs::write(&path, format!("{pid}\n"))
            .with_context(|| format!("write {}", path.display()))
    }

    fn remove_record(&self) {
        let _ = std::fs::remove_file(self.layout.pid_file());
    }
}
