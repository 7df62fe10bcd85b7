// belt_probe/src/extras/mod.rs
// Optional printer objects loaded from their config sections.

pub mod belt_probe;
pub mod probe_helper;
pub mod session_guard;
