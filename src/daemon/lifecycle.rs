// Daemon lifecycle management
//
// Owns the pidfile and the start/stop/restart state machine. State is
// never cached across invocations: each operation derives Stopped/Running
// fresh from the pidfile plus a live process-table check, because the
// pidfile is a belief, not a guarantee.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{info, warn};

use crate::errors::SupervisorError;
use crate::proctree::{kill_process_tree, pid_alive};

use super::detach;

/// Unit of work run inside the detached process.
pub type WorkFn = Box<dyn FnOnce()>;

/// Discard destination used when no output path is configured.
pub const DEFAULT_OUTPUT: &str = "/dev/null";

/// Supervises one background daemon tracked through a pidfile.
///
/// `start` detaches the configured work closure into its own session,
/// `stop` terminates the recorded process tree, and both are idempotent
/// enough that `restart` works from any state.
pub struct DaemonSupervisor {
    pidfile: PathBuf,
    output: PathBuf,
    work: Option<WorkFn>,
}

impl DaemonSupervisor {
    pub fn new(pidfile: impl Into<PathBuf>) -> Self {
        Self {
            pidfile: pidfile.into(),
            output: PathBuf::from(DEFAULT_OUTPUT),
            work: None,
        }
    }

    /// Redirect the daemon's stdout and stderr to `path` (append mode,
    /// parent directories created at start time).
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = path.into();
        self
    }

    /// Supply the unit of work to run once detachment succeeds. Without
    /// one, `start` performs a bare detachment (pidfile written, nothing
    /// run), which exercises the lifecycle machinery alone.
    pub fn work(mut self, work: impl FnOnce() + 'static) -> Self {
        self.work = Some(Box::new(work));
        self
    }

    pub fn pidfile(&self) -> &Path {
        &self.pidfile
    }

    /// Start the daemon.
    ///
    /// On Unix the controlling process exits with status 0 inside this
    /// call; execution resumes only in the detached daemon process, which
    /// writes its own pid to the pidfile, runs the work closure, and
    /// removes the pidfile when the closure returns. Fails with
    /// `AlreadyRunning` if the pidfile points at a live process; a stale
    /// pidfile is deleted and start proceeds.
    pub fn start(mut self) -> Result<(), SupervisorError> {
        // Held across both forks via the inherited file description, so
        // the check-then-write below cannot interleave with a concurrent
        // start.
        let lock = self.acquire_start_lock()?;
        self.ensure_stopped()?;

        detach::detach(&self.output)?;

        // From here on we are the daemon process (or, off Unix, the
        // foreground process running in degraded mode).
        self.write_pid(std::process::id())?;
        drop(lock);

        let _guard = PidfileGuard {
            path: self.pidfile.clone(),
        };
        info!(pid = std::process::id(), pidfile = %self.pidfile.display(), "daemon detached");
        if let Some(work) = self.work.take() {
            work();
        }
        Ok(())
    }

    /// Stop the daemon and its whole process tree.
    ///
    /// Missing or unreadable pidfile means nothing to stop: that is an
    /// informational success, not an error, so `restart` never fails just
    /// because no daemon was running. On termination failure the pidfile
    /// is left in place so the operation can be retried.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        let pid = match self.read_pid() {
            Ok(pid) => pid,
            Err(_) => {
                info!(
                    pidfile = %self.pidfile.display(),
                    "pidfile does not exist, daemon not running"
                );
                return Ok(());
            }
        };

        kill_process_tree(pid)?;

        // The daemon's own exit guard may have beaten us to it
        if self.pidfile.exists() {
            fs::remove_file(&self.pidfile).map_err(|source| SupervisorError::Pidfile {
                path: self.pidfile.clone(),
                source,
            })?;
        }
        info!(pid, "daemon stopped");
        Ok(())
    }

    /// `stop` then `start`. Works whether or not a daemon was running.
    pub fn restart(self) -> Result<(), SupervisorError> {
        self.stop()?;
        self.start()
    }

    /// Whether the pidfile points at a live process.
    pub fn is_running(&self) -> bool {
        self.read_pid().map(pid_alive).unwrap_or(false)
    }

    /// Read the pid recorded in the pidfile.
    pub fn read_pid(&self) -> io::Result<u32> {
        let content = fs::read_to_string(&self.pidfile)?;
        content.trim().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid pid in {}: {:?}", self.pidfile.display(), content),
            )
        })
    }

    /// Fail with `AlreadyRunning` if the recorded pid is alive; delete
    /// the pidfile and proceed if it is stale.
    fn ensure_stopped(&self) -> Result<(), SupervisorError> {
        let Ok(pid) = self.read_pid() else {
            // Absent or unreadable both mean Stopped
            return Ok(());
        };
        if pid_alive(pid) {
            return Err(SupervisorError::AlreadyRunning {
                pidfile: self.pidfile.clone(),
                pid: Some(pid),
            });
        }
        warn!(pid, pidfile = %self.pidfile.display(), "removing stale pidfile");
        fs::remove_file(&self.pidfile).map_err(|source| SupervisorError::Pidfile {
            path: self.pidfile.clone(),
            source,
        })
    }

    fn write_pid(&self, pid: u32) -> Result<(), SupervisorError> {
        fs::write(&self.pidfile, format!("{}\n", pid)).map_err(|source| {
            SupervisorError::Pidfile {
                path: self.pidfile.clone(),
                source,
            }
        })
    }

    /// Take the exclusive advisory lock covering start's check-then-write
    /// window. Contention means another start is mid-flight; by the time
    /// it releases the lock a daemon will exist, so report AlreadyRunning.
    fn acquire_start_lock(&self) -> Result<StartLock, SupervisorError> {
        let lock_path = start_lock_path(&self.pidfile);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| SupervisorError::Pidfile {
                path: lock_path.clone(),
                source,
            })?;
        if file.try_lock_exclusive().is_err() {
            return Err(SupervisorError::AlreadyRunning {
                pidfile: self.pidfile.clone(),
                pid: self.read_pid().ok(),
            });
        }
        Ok(StartLock { _file: file })
    }
}

/// Advisory lock on `<pidfile>.lock`; released when every process holding
/// the inherited file description has dropped or exited.
struct StartLock {
    _file: File,
}

/// Removes the pidfile when the daemon process exits normally (the
/// equivalent of an atexit hook; a process killed by signal skips this,
/// which is why `stop` also deletes the file).
struct PidfileGuard {
    path: PathBuf,
}

impl Drop for PidfileGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not remove pidfile");
            }
        }
    }
}

fn start_lock_path(pidfile: &Path) -> PathBuf {
    let mut path = pidfile.as_os_str().to_os_string();
    path.push(".lock");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supervisor_in(dir: &TempDir) -> DaemonSupervisor {
        DaemonSupervisor::new(dir.path().join("daemon.pid"))
    }

    #[test]
    fn test_pidfile_round_trip() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);

        supervisor.write_pid(std::process::id()).unwrap();
        assert_eq!(supervisor.read_pid().unwrap(), std::process::id());
        assert!(supervisor.is_running());

        let raw = fs::read_to_string(supervisor.pidfile()).unwrap();
        assert!(raw.ends_with('\n'));
        assert_eq!(raw.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_is_running_false_without_pidfile() {
        let dir = TempDir::new().unwrap();
        assert!(!supervisor_in(&dir).is_running());
    }

    #[test]
    fn test_read_pid_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);
        fs::write(supervisor.pidfile(), "not-a-pid\n").unwrap();

        let err = supervisor.read_pid().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_ensure_stopped_removes_stale_pidfile() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);
        fs::write(supervisor.pidfile(), "999999999\n").unwrap();

        supervisor.ensure_stopped().unwrap();
        assert!(!supervisor.pidfile().exists());
    }

    #[test]
    fn test_ensure_stopped_rejects_live_pid() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_in(&dir);
        supervisor.write_pid(std::process::id()).unwrap();

        match supervisor.ensure_stopped() {
            Err(SupervisorError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
        }
        // Nothing was mutated
        assert!(supervisor.pidfile().exists());
    }

    #[test]
    fn test_stop_without_pidfile_is_idempotent() {
        let dir = TempDir::new().unwrap();
        supervisor_in(&dir).stop().expect("stop of nothing failed");
    }

    #[test]
    fn test_start_lock_excludes_concurrent_start() {
        let dir = TempDir::new().unwrap();
        let first = supervisor_in(&dir);
        let _held = first.acquire_start_lock().unwrap();

        let second = supervisor_in(&dir);
        match second.acquire_start_lock() {
            Err(SupervisorError::AlreadyRunning { .. }) => {}
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_pidfile_guard_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "1234\n").unwrap();

        drop(PidfileGuard { path: path.clone() });
        assert!(!path.exists());
    }
}
