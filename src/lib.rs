// Warden - daemon lifecycle supervisor
// Library exports

pub mod daemon; // Detachment protocol, pidfile, start/stop/restart
pub mod errors;
pub mod proctree; // Process-tree discovery and termination
