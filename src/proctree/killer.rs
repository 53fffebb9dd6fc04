// Process-tree termination algorithm
//
// Termination is requested for children before their parents so a parent
// cannot respawn a child that was already killed. A graceful pass is
// followed by a bounded wait, then SIGKILL escalation for survivors.
// Targets that exit on their own at any point are simply skipped.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::table::{Delivery, ProcessTable, SystemProcessTable};

/// Bounded wait after a termination request before escalating (and again
/// after escalation before giving up).
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// One or more processes could not be removed even after the forceful
/// step.
#[derive(Debug, Error)]
#[error("failed to terminate process(es) {survivors:?}")]
pub struct TerminationError {
    /// Pids still alive after SIGKILL and a second grace period.
    pub survivors: Vec<u32>,
}

/// Terminate `root` and every process transitively spawned by it.
///
/// The descendant set is snapshotted at the moment of the call; children
/// are signaled before their parents, the root last. Targets that have
/// already exited are not an error. Fails only if at least one target is
/// still alive after the grace period and a forceful kill.
pub fn kill_process_tree(root: u32) -> Result<(), TerminationError> {
    kill_tree_with(&mut SystemProcessTable::new(), root, GRACE_PERIOD)
}

fn kill_tree_with(
    table: &mut dyn ProcessTable,
    root: u32,
    grace: Duration,
) -> Result<(), TerminationError> {
    let targets = collect_targets(table, root);
    debug!(root, targets = targets.len(), "terminating process tree");

    let mut pending = Vec::new();
    for &pid in &targets {
        match table.terminate(pid) {
            Ok(Delivery::Signaled) => pending.push(pid),
            Ok(Delivery::AlreadyGone) => debug!(pid, "process already gone"),
            Err(e) => {
                // Keep it on the list: the forceful pass gets a second try
                warn!(pid, error = %e, "graceful termination failed");
                pending.push(pid);
            }
        }
    }

    let mut survivors = Vec::new();
    for pid in pending {
        if wait_for_exit(table, pid, grace) {
            continue;
        }
        debug!(pid, "grace period elapsed, escalating");
        match table.force_kill(pid) {
            Ok(Delivery::AlreadyGone) => continue,
            Ok(Delivery::Signaled) => {}
            Err(e) => warn!(pid, error = %e, "forceful kill failed"),
        }
        if !wait_for_exit(table, pid, grace) {
            survivors.push(pid);
        }
    }

    if survivors.is_empty() {
        Ok(())
    } else {
        Err(TerminationError { survivors })
    }
}

/// Snapshot of the tree rooted at `root`, ordered children before
/// parents with the root last.
fn collect_targets(table: &mut dyn ProcessTable, root: u32) -> Vec<u32> {
    let mut ordered = vec![root];
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        for child in table.children_of(pid) {
            // Pid-reuse loops are pathological but cheap to guard against
            if !ordered.contains(&child) {
                ordered.push(child);
                frontier.push(child);
            }
        }
    }
    // Depth-first preorder puts every parent before its descendants;
    // reversing yields the kill order.
    ordered.reverse();
    ordered
}

/// Poll until `pid` leaves the process table or `grace` elapses.
fn wait_for_exit(table: &mut dyn ProcessTable, pid: u32, grace: Duration) -> bool {
    let poll = (grace / 20).max(Duration::from_millis(1));
    let deadline = Instant::now() + grace;
    loop {
        if !table.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    const FAST_GRACE: Duration = Duration::from_millis(20);

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum Sig {
        Term,
        Kill,
    }

    struct FakeProc {
        parent: Option<u32>,
        alive: bool,
        ignores_term: bool,
        ignores_kill: bool,
    }

    /// In-memory process table recording every delivered signal.
    #[derive(Default)]
    struct FakeTable {
        procs: HashMap<u32, FakeProc>,
        delivered: Vec<(u32, Sig)>,
    }

    impl FakeTable {
        fn add(&mut self, pid: u32, parent: Option<u32>) {
            self.procs.insert(
                pid,
                FakeProc {
                    parent,
                    alive: true,
                    ignores_term: false,
                    ignores_kill: false,
                },
            );
        }

        fn add_stubborn(&mut self, pid: u32, parent: Option<u32>) {
            self.add(pid, parent);
            self.procs.get_mut(&pid).unwrap().ignores_term = true;
        }

        fn add_unkillable(&mut self, pid: u32, parent: Option<u32>) {
            self.add_stubborn(pid, parent);
            self.procs.get_mut(&pid).unwrap().ignores_kill = true;
        }

        fn mark_exited(&mut self, pid: u32) {
            self.procs.get_mut(&pid).unwrap().alive = false;
        }

        fn delivery_position(&self, pid: u32, sig: Sig) -> Option<usize> {
            self.delivered.iter().position(|&d| d == (pid, sig))
        }
    }

    impl ProcessTable for FakeTable {
        fn children_of(&mut self, pid: u32) -> Vec<u32> {
            self.procs
                .iter()
                .filter(|(_, p)| p.parent == Some(pid))
                .map(|(&child, _)| child)
                .collect()
        }

        fn is_alive(&mut self, pid: u32) -> bool {
            self.procs.get(&pid).map(|p| p.alive).unwrap_or(false)
        }

        fn terminate(&mut self, pid: u32) -> io::Result<Delivery> {
            match self.procs.get_mut(&pid) {
                Some(p) if p.alive => {
                    if !p.ignores_term {
                        p.alive = false;
                    }
                    self.delivered.push((pid, Sig::Term));
                    Ok(Delivery::Signaled)
                }
                _ => Ok(Delivery::AlreadyGone),
            }
        }

        fn force_kill(&mut self, pid: u32) -> io::Result<Delivery> {
            match self.procs.get_mut(&pid) {
                Some(p) if p.alive => {
                    if !p.ignores_kill {
                        p.alive = false;
                    }
                    self.delivered.push((pid, Sig::Kill));
                    Ok(Delivery::Signaled)
                }
                _ => Ok(Delivery::AlreadyGone),
            }
        }
    }

    #[test]
    fn test_children_signaled_before_parents() {
        let mut table = FakeTable::default();
        table.add(100, None);
        table.add(101, Some(100));
        table.add(102, Some(100));
        table.add(103, Some(101));

        kill_tree_with(&mut table, 100, FAST_GRACE).expect("kill failed");

        for pid in [100, 101, 102, 103] {
            assert!(!table.is_alive(pid), "pid {} still alive", pid);
        }
        let root = table.delivery_position(100, Sig::Term).unwrap();
        let mid = table.delivery_position(101, Sig::Term).unwrap();
        let leaf = table.delivery_position(103, Sig::Term).unwrap();
        assert!(leaf < mid, "grandchild must be signaled before its parent");
        assert!(mid < root, "child must be signaled before the root");
        assert!(table.delivery_position(102, Sig::Term).unwrap() < root);
    }

    #[test]
    fn test_already_exited_descendant_is_skipped() {
        let mut table = FakeTable::default();
        table.add(200, None);
        table.add(201, Some(200));
        table.add(202, Some(200));
        table.mark_exited(201);

        kill_tree_with(&mut table, 200, FAST_GRACE).expect("kill failed");

        assert!(!table.is_alive(200));
        assert!(!table.is_alive(202));
        assert_eq!(table.delivery_position(201, Sig::Term), None);
    }

    #[test]
    fn test_stubborn_process_is_force_killed() {
        let mut table = FakeTable::default();
        table.add(300, None);
        table.add_stubborn(301, Some(300));

        kill_tree_with(&mut table, 300, FAST_GRACE).expect("kill failed");

        assert!(!table.is_alive(301));
        assert!(table.delivery_position(301, Sig::Kill).is_some());
        // The compliant root must not be escalated
        assert_eq!(table.delivery_position(300, Sig::Kill), None);
    }

    #[test]
    fn test_unkillable_process_is_reported() {
        let mut table = FakeTable::default();
        table.add(400, None);
        table.add_unkillable(401, Some(400));

        let err = kill_tree_with(&mut table, 400, FAST_GRACE).unwrap_err();
        assert_eq!(err.survivors, vec![401]);
        // The rest of the tree still went down
        assert!(!table.is_alive(400));
    }

    #[test]
    fn test_missing_root_is_ok() {
        let mut table = FakeTable::default();
        kill_tree_with(&mut table, 42, FAST_GRACE).expect("kill of absent root failed");
        assert!(table.delivered.is_empty());
    }
}
