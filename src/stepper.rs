// belt_probe/src/stepper.rs
// Host-side stepper and rail state used by the kinematics.

use crate::configfile::{ConfigError, Configfile};

// Positions are tracked in whole steps, so anything finer than
// `step_dist` is lost when a commanded position is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Stepper {
    name: String,
    step_dist: f64,
    mcu_position: i64,
}

impl Stepper {
    pub fn new(name: &str, step_dist: f64) -> Self {
        Stepper {
            name: name.to_string(),
            step_dist,
            mcu_position: 0,
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_mcu_position(&self) -> i64 {
        self.mcu_position
    }

    pub fn get_commanded_position(&self) -> f64 {
        self.mcu_position as f64 * self.step_dist
    }

    pub fn set_commanded_position(&mut self, pos: f64) {
        self.mcu_position = (pos / self.step_dist).round() as i64;
    }
}

/// One axis worth of configuration plus the stepper driving it.
#[derive(Debug, Clone)]
pub struct PrinterRail {
    stepper: Stepper,
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: Option<f64>,
}

impl PrinterRail {
    pub fn new(stepper: Stepper, position_min: f64, position_max: f64, position_endstop: Option<f64>) -> Self {
        PrinterRail {
            stepper,
            position_min,
            position_max,
            position_endstop,
        }
    }

    /// Loads `[stepper_<axis>]`.
    pub fn from_config(config: &Configfile, section: &str) -> Result<Self, ConfigError> {
        let step_dist = config.getfloat_above(section, "step_distance", Some(0.0125), 0.0)?;
        let position_endstop = config.getfloat_opt(section, "position_endstop")?;
        let position_min = config.getfloat(section, "position_min", Some(0.0), None, None)?;
        let position_max = config.getfloat(section, "position_max", Some(200.0), Some(position_min), None)?;
        if let Some(endstop) = position_endstop {
            if endstop < position_min || endstop > position_max {
                return Err(ConfigError::ValidationError(format!(
                    "position_endstop in section '[{}]' must be between position_min and position_max",
                    section
                )));
            }
        }
        Ok(PrinterRail::new(
            Stepper::new(section, step_dist),
            position_min,
            position_max,
            position_endstop,
        ))
    }

    pub fn get_range(&self) -> (f64, f64) {
        (self.position_min, self.position_max)
    }

    pub fn get_stepper(&self) -> &Stepper {
        &self.stepper
    }

    pub fn get_stepper_mut(&mut self) -> &mut Stepper {
        &mut self.stepper
    }
}
