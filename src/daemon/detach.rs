// OS-level process detachment
//
// The classic double fork: the first fork lets the shell reap its child
// immediately, setsid drops the controlling terminal, and the second fork
// guarantees the surviving process is not a session leader and therefore
// can never reacquire one. Signal dispositions and standard streams are
// fixed here, once, before the caller's work runs.

use std::path::Path;

use crate::errors::SupervisorError;

/// Turn the current process into a daemon, redirecting stdout and stderr
/// to `output` (append mode, parent directories created).
///
/// On Unix this returns only in the final detached process; the two
/// intermediate parents exit with status 0. Contract, in order: fork,
/// new session, umask 0, terminal/job-control signals ignored (SIGCHLD
/// kept at default so the daemon can still reap subprocesses it spawns),
/// fork again, streams redirected. Any failure aborts before the caller
/// gets control back, so the work closure can never run twice or in a
/// half-detached state.
#[cfg(target_family = "unix")]
pub(super) fn detach(output: &Path) -> Result<(), SupervisorError> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    use nix::sys::stat::{umask, Mode};
    use nix::unistd::{fork, setsid, ForkResult};
    use tracing::warn;

    // First fork: the shell sees its child exit right away.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => {
            return Err(SupervisorError::Detach {
                stage: "fork #1",
                source: e.into(),
            })
        }
    }

    // Decouple from the parent environment.
    setsid().map_err(|e| SupervisorError::Detach {
        stage: "setsid",
        source: e.into(),
    })?;
    let _ = umask(Mode::empty());

    // SIGCHLD must keep its default disposition: ignoring it breaks
    // wait() for subprocesses the daemon spawns later.
    for sig in [
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGQUIT,
        Signal::SIGPIPE,
        Signal::SIGTTOU,
        Signal::SIGTTIN,
    ] {
        if let Err(e) = unsafe { signal(sig, SigHandler::SigIgn) } {
            warn!(signal = %sig, error = %e, "could not ignore signal");
        }
    }

    // Second fork: the survivor is not a session leader.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => {
            return Err(SupervisorError::Detach {
                stage: "fork #2",
                source: e.into(),
            })
        }
    }

    redirect_stdio(output)
}

/// Degraded mode for platforms without fork/session semantics: the caller
/// keeps running in the foreground with a tracked pid. Reduced
/// guarantees; the embedding environment must keep the process alive.
#[cfg(not(target_family = "unix"))]
pub(super) fn detach(_output: &Path) -> Result<(), SupervisorError> {
    Ok(())
}

#[cfg(target_family = "unix")]
fn redirect_stdio(output: &Path) -> Result<(), SupervisorError> {
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
    use nix::unistd::dup2;

    if let Some(dir) = output.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|e| redirect_err(output, e))?;
        }
    }

    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    let null = File::open("/dev/null").map_err(|e| redirect_err(output, e))?;
    let sink = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .map_err(|e| redirect_err(output, e))?;

    dup2(null.as_raw_fd(), STDIN_FILENO).map_err(|e| redirect_err(output, e.into()))?;
    dup2(sink.as_raw_fd(), STDOUT_FILENO).map_err(|e| redirect_err(output, e.into()))?;
    dup2(sink.as_raw_fd(), STDERR_FILENO).map_err(|e| redirect_err(output, e.into()))?;

    Ok(())
}

#[cfg(target_family = "unix")]
fn redirect_err(path: &Path, source: std::io::Error) -> SupervisorError {
    SupervisorError::Redirection {
        path: path.to_path_buf(),
        source,
    }
}
