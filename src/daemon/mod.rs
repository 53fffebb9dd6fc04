// Daemon supervision
//
// lifecycle owns the pidfile and the start/stop/restart state machine;
// detach implements the OS-level detachment protocol it runs on.

mod detach;
pub mod lifecycle;

pub use lifecycle::{DaemonSupervisor, DEFAULT_OUTPUT};
