// belt_probe/src/toolhead.rs
// Commanded toolhead position and the moves that change it.

use log::debug;
use thiserror::Error;

use crate::configfile::{ConfigError, Configfile};
use crate::kinematics::{lookup_kinematics, Kinematics};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    #[error("Must home axis first: {0}")]
    NotHomed(char),
    #[error("Move out of range: {axis}={pos:.3} (limits {min:.3} to {max:.3})")]
    OutOfRange { axis: char, pos: f64, min: f64, max: f64 },
    #[error("Invalid move speed {0}")]
    InvalidSpeed(f64),
}

/// What the probe helpers need from the motion system.
pub trait MotionStack {
    /// Commanded position `[x, y, z, e]`.
    fn get_position(&self) -> [f64; 4];

    /// Moves the coordinates that are `Some`, leaving the rest untouched.
    fn manual_move(&mut self, coord: [Option<f64>; 4], speed: f64) -> Result<(), MotionError>;

    /// Pushes queued moves down to the steppers.
    fn flush_step_generation(&mut self);

    fn get_kinematics(&self) -> &dyn Kinematics;
}

pub struct ToolHead {
    commanded_pos: [f64; 4],
    kin: Box<dyn Kinematics>,
    max_velocity: f64,
    print_time: f64,
    // Moves accepted since the last flush_step_generation()
    step_gen_pending: bool,
}

impl ToolHead {
    pub fn new(kin: Box<dyn Kinematics>, max_velocity: f64) -> Self {
        ToolHead {
            commanded_pos: [0.0; 4],
            kin,
            max_velocity,
            print_time: 0.0,
            step_gen_pending: false,
        }
    }

    pub fn from_config(config: &Configfile) -> Result<Self, ConfigError> {
        let max_velocity = config.getfloat_above("printer", "max_velocity", Some(300.0), 0.0)?;
        let kin = lookup_kinematics(config)?;
        debug!("toolhead using {} kinematics, max_velocity {}", kin.name(), max_velocity);
        Ok(ToolHead::new(kin, max_velocity))
    }

    pub fn get_print_time(&self) -> f64 {
        self.print_time
    }

    pub fn move_to(&mut self, newpos: [f64; 4], speed: f64) -> Result<(), MotionError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(MotionError::InvalidSpeed(speed));
        }
        if newpos == self.commanded_pos {
            return Ok(());
        }
        self.kin.check_move(&self.commanded_pos, &newpos)?;

        let axes_d: Vec<f64> = newpos.iter().zip(self.commanded_pos).map(|(n, c)| n - c).collect();
        let mut move_d = (axes_d[0].powi(2) + axes_d[1].powi(2) + axes_d[2].powi(2)).sqrt();
        if move_d < 0.000000001 {
            // Extrude only move
            move_d = axes_d[3].abs();
        }
        self.print_time += move_d / speed.min(self.max_velocity);
        self.commanded_pos = newpos;
        self.step_gen_pending = true;
        debug!("move to {:?} at {:.3}mm/s", newpos, speed);
        Ok(())
    }

    /// Redefines the current position; `homing_axes` (0=X, 1=Y, 2=Z) become homed.
    pub fn set_position(&mut self, newpos: [f64; 4], homing_axes: &[usize]) {
        self.flush_step_generation();
        self.commanded_pos = newpos;
        self.kin.set_position([newpos[0], newpos[1], newpos[2]], homing_axes);
    }

    pub fn get_status(&self) -> serde_json::Value {
        serde_json::json!({
            "position": self.commanded_pos,
            "print_time": self.print_time,
            "kinematics": self.kin.name(),
        })
    }
}

impl MotionStack for ToolHead {
    fn get_position(&self) -> [f64; 4] {
        self.commanded_pos
    }

    fn manual_move(&mut self, coord: [Option<f64>; 4], speed: f64) -> Result<(), MotionError> {
        let mut newpos = self.commanded_pos;
        for (slot, value) in newpos.iter_mut().zip(coord) {
            if let Some(v) = value {
                *slot = v;
            }
        }
        self.move_to(newpos, speed)
    }

    fn flush_step_generation(&mut self) {
        if !self.step_gen_pending {
            return;
        }
        let [x, y, z, _] = self.commanded_pos;
        self.kin.set_stepper_positions([x, y, z]);
        self.step_gen_pending = false;
    }

    fn get_kinematics(&self) -> &dyn Kinematics {
        self.kin.as_ref()
    }
}
