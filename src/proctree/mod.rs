// Process-tree termination
//
// killer implements the grace-then-force algorithm over the ProcessTable
// capability trait; table provides the real OS-backed implementation.

pub mod killer;
pub mod table;

pub use killer::{kill_process_tree, TerminationError, GRACE_PERIOD};
pub use table::{pid_alive, Delivery, ProcessTable, SystemProcessTable};
