// Supervisor error taxonomy
//
// Low-level OS failures (fork, signal delivery, file I/O) are recovered
// into these variants at the supervisor boundary. Callers only need the
// variant to decide an exit status; the Display text is the one-line
// diagnostic shown to the operator.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use crate::proctree::TerminationError;

/// Errors surfaced by the daemon lifecycle operations.
///
/// Two conditions are deliberately absent: a stale pidfile is recovered
/// automatically (deleted, then `start` proceeds), and `stop` with no
/// pidfile is an informational success so `restart` works from any state.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The pidfile points at a live process, or a concurrent `start`
    /// holds the start lock right now.
    #[error("pidfile {} already exists. Daemon already running?", .pidfile.display())]
    AlreadyRunning {
        pidfile: PathBuf,
        pid: Option<u32>,
    },

    /// Detachment failed partway (fork, setsid). Nothing has been
    /// written and the work closure has not run.
    #[error("{stage} failed: {source}")]
    Detach {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    /// The daemon's output target could not be prepared. Fatal before
    /// any pidfile is written.
    #[error("cannot redirect daemon output to {}: {source}", .path.display())]
    Redirection {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading, writing, or removing the pidfile (or its start lock)
    /// failed.
    #[error("pidfile {}: {source}", .path.display())]
    Pidfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Part of the daemon's process tree survived termination. The
    /// pidfile is left in place so `stop` can be retried.
    #[error(transparent)]
    Termination(#[from] TerminationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_names_the_pidfile() {
        let err = SupervisorError::AlreadyRunning {
            pidfile: PathBuf::from("/run/app.pid"),
            pid: Some(42),
        };
        let msg = err.to_string();
        assert!(msg.contains("/run/app.pid"));
        assert!(msg.contains("already"));
    }

    #[test]
    fn test_detach_reports_stage() {
        let err = SupervisorError::Detach {
            stage: "fork #1",
            source: io::Error::from(io::ErrorKind::Other),
        };
        assert!(err.to_string().starts_with("fork #1 failed"));
    }
}
