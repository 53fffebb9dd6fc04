// Process-table introspection
//
// The termination algorithm only talks to the ProcessTable trait so it can
// run against a fake table in tests. The system implementation couples a
// sysinfo snapshot (descendant discovery) with null-signal liveness probes
// and SIGTERM/SIGKILL delivery.

use std::io;

use sysinfo::System;

/// Outcome of a signal delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was queued for a live process.
    Signaled,
    /// The target was gone before the signal could be sent. Skipped, not
    /// an error.
    AlreadyGone,
}

/// Capability interface over the OS process table.
pub trait ProcessTable {
    /// Direct children of `pid` at the moment of the call.
    fn children_of(&mut self, pid: u32) -> Vec<u32>;

    /// Whether `pid` is present in the live process table.
    fn is_alive(&mut self, pid: u32) -> bool;

    /// Request graceful termination (SIGTERM on Unix).
    fn terminate(&mut self, pid: u32) -> io::Result<Delivery>;

    /// Forcefully remove the process (SIGKILL on Unix).
    fn force_kill(&mut self, pid: u32) -> io::Result<Delivery>;
}

/// `ProcessTable` backed by the real OS.
///
/// Child enumeration reads a process snapshot taken lazily on first use,
/// so one `kill_process_tree` call sees one consistent tree. Liveness and
/// signal delivery always hit the live kernel state.
#[derive(Default)]
pub struct SystemProcessTable {
    snapshot: Option<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessTable for SystemProcessTable {
    fn children_of(&mut self, pid: u32) -> Vec<u32> {
        let system = self.snapshot.get_or_insert_with(System::new_all);
        let parent = sysinfo::Pid::from_u32(pid);
        system
            .processes()
            .iter()
            .filter(|(_, process)| process.parent() == Some(parent))
            .map(|(child, _)| child.as_u32())
            .collect()
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        pid_alive(pid)
    }

    fn terminate(&mut self, pid: u32) -> io::Result<Delivery> {
        send_signal(pid, SignalKind::Graceful)
    }

    fn force_kill(&mut self, pid: u32) -> io::Result<Delivery> {
        send_signal(pid, SignalKind::Forceful)
    }
}

enum SignalKind {
    Graceful,
    Forceful,
}

/// Check whether a process with the given pid exists
///
/// - Unix: kill(pid, 0) checks existence without sending a signal
/// - Windows: sysinfo enumerates processes
#[cfg(target_family = "unix")]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // Process exists but we lack permission to signal it
        Err(_) => true,
    }
}

#[cfg(target_family = "windows")]
pub fn pid_alive(pid: u32) -> bool {
    let system = System::new_all();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

#[cfg(target_family = "unix")]
fn send_signal(pid: u32, kind: SignalKind) -> io::Result<Delivery> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match kind {
        SignalKind::Graceful => Signal::SIGTERM,
        SignalKind::Forceful => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(Delivery::Signaled),
        Err(nix::errno::Errno::ESRCH) => Ok(Delivery::AlreadyGone),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(target_family = "unix"))]
fn send_signal(_pid: u32, _kind: SignalKind) -> io::Result<Delivery> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process termination is only implemented on Unix",
    ))
}
