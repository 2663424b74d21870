/// Minimal capability surface over an OS process, so the supervisor state
/// machine can be exercised with a fake in tests.
pub trait ProcessControl {
    /// Zero-signal liveness probe.
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to exit (SIGTERM). A process that is already gone
    /// counts as success.
    fn terminate(&self, pid: u32);

    /// Force-kill (SIGKILL). A process that is already gone counts as
    /// success.
    fn kill(&self, pid: u32);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessControl;

impl ProcessControl for UnixProcessControl {
    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            let Ok(pid) = i32::try_from(pid) else {
                return false;
            };
            unsafe {
                match libc::kill(pid, 0) {
                    0 => true,
                    // EPERM means the pid exists but belongs to someone
                    // else; only ESRCH means gone.
                    _ => std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH),
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }

    fn terminate(&self, pid: u32) {
        #[cfg(unix)]
        send_signal(pid, libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = pid;
    }

    fn kill(&self, pid: u32) {
        #[cfg(unix)]
        send_signal(pid, libc::SIGKILL);
        #[cfg(not(unix))]
        let _ = pid;
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        let _ = libc::kill(pid, signal);
    }
}
