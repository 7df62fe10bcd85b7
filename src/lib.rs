// belt_probe/src/lib.rs

// Host side of an interactive belt printer probe: config, command table,
// simulated motion stack and the probe helper objects.

pub mod configfile;
pub mod gcode;
pub mod klippy;
pub mod stepper;
pub mod toolhead;

pub mod kinematics;

pub mod extras;

pub use klippy::Printer;
