//! Signal flags and the PID-file handshake.
//!
//! Handlers only flip atomic flags; the reactor loop observes them between
//! wait iterations. SIGPIPE is ignored process-wide so a write to a closed
//! peer surfaces as an error instead of killing the process.

use std::fs;
use std::io;
use std::path::Path;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use tracing::warn;

#[derive(Clone)]
pub struct SignalFlags {
    /// SIGHUP: reload the configuration file.
    pub reload: Arc<AtomicBool>,
    /// SIGTERM / SIGINT / SIGUSR2: drain and exit.
    pub drain: Arc<AtomicBool>,
    /// SIGUSR1: log a statistics snapshot.
    pub stats: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Flags that never fire, for tests driving the server directly.
    pub fn disconnected() -> Self {
        Self {
            reload: Arc::new(AtomicBool::new(false)),
            drain: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Install all handlers and return the observable flags.
pub fn install() -> io::Result<SignalFlags> {
    ignore_sigpipe();

    let flags = SignalFlags::disconnected();
    signal_hook::flag::register(SIGHUP, Arc::clone(&flags.reload))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&flags.drain))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&flags.drain))?;
    signal_hook::flag::register(SIGUSR2, Arc::clone(&flags.drain))?;
    signal_hook::flag::register(SIGUSR1, Arc::clone(&flags.stats))?;
    Ok(flags)
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Write our PID to the file, returning the PID of a previous live instance
/// if one had advertised itself there.
pub fn advertise_pid(path: &Path) -> io::Result<Option<i32>> {
    let previous = fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .filter(|&pid| pid > 0 && pid != process::id() as i32)
        .filter(|&pid| unsafe { libc::kill(pid, 0) } == 0);

    fs::write(path, format!("{}\n", process::id()))?;
    Ok(previous)
}

/// Ask a previous instance to drain and exit.
pub fn signal_drain(pid: i32) {
    if unsafe { libc::kill(pid, SIGUSR2) } != 0 {
        warn!(
            pid,
            error = %io::Error::last_os_error(),
            "failed to signal previous instance"
        );
    }
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertise_writes_our_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fulcrum.pid");

        let previous = advertise_pid(&path).expect("advertise");
        assert!(previous.is_none());

        let written: i32 = fs::read_to_string(&path)
            .expect("read")
            .trim()
            .parse()
            .expect("pid");
        assert_eq!(written, process::id() as i32);
    }

    #[test]
    fn stale_pid_is_not_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fulcrum.pid");
        // No process can have this PID.
        fs::write(&path, "999999999\n").expect("write");

        let previous = advertise_pid(&path).expect("advertise");
        assert!(previous.is_none());
    }

    #[test]
    fn our_own_pid_is_not_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fulcrum.pid");
        fs::write(&path, format!("{}\n", process::id())).expect("write");

        let previous = advertise_pid(&path).expect("advertise");
        assert!(previous.is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fulcrum.pid");
        fs::write(&path, "1\n").expect("write");
        remove_pid_file(&path);
        remove_pid_file(&path);
        assert!(!path.exists());
    }
}
