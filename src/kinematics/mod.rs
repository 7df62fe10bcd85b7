// belt_probe/src/kinematics/mod.rs
// Kinematics: map stepper positions to machine coordinates and back.

pub mod belt;
pub mod cartesian;

use std::collections::HashMap;

use crate::configfile::{ConfigError, Configfile};
use crate::stepper::{PrinterRail, Stepper};
use crate::toolhead::MotionError;

const AXIS_NAMES: [char; 3] = ['X', 'Y', 'Z'];

/// Position resolver used by the toolhead and the probe helpers.
pub trait Kinematics {
    fn name(&self) -> &'static str;

    fn get_steppers(&self) -> Vec<&Stepper>;

    /// Machine coordinates for a snapshot of stepper positions keyed by stepper name.
    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> [f64; 3];

    /// Commands the steppers to the given machine coordinates.
    fn set_stepper_positions(&mut self, newpos: [f64; 3]);

    /// Sets the position and marks `homing_axes` (0=X, 1=Y, 2=Z) as homed.
    fn set_position(&mut self, newpos: [f64; 3], homing_axes: &[usize]);

    fn check_move(&self, start_pos: &[f64; 4], end_pos: &[f64; 4]) -> Result<(), MotionError>;
}

/// Snapshot of every stepper's commanded position.
pub fn stepper_positions(kin: &dyn Kinematics) -> HashMap<String, f64> {
    kin.get_steppers()
        .into_iter()
        .map(|s| (s.get_name().to_string(), s.get_commanded_position()))
        .collect()
}

/// Per axis travel limits; `(1., -1.)` means the axis is not homed.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisLimits {
    limits: [(f64, f64); 3],
}

impl Default for AxisLimits {
    fn default() -> Self {
        AxisLimits {
            limits: [(1.0, -1.0); 3],
        }
    }
}

impl AxisLimits {
    pub fn set_homed(&mut self, axis: usize, range: (f64, f64)) {
        self.limits[axis] = range;
    }

    pub fn is_homed(&self, axis: usize) -> bool {
        self.limits[axis].0 <= self.limits[axis].1
    }

    // Only axes that actually move are checked
    pub fn check_move(&self, start_pos: &[f64; 4], end_pos: &[f64; 4]) -> Result<(), MotionError> {
        for axis in 0..3 {
            if start_pos[axis] == end_pos[axis] {
                continue;
            }
            if !self.is_homed(axis) {
                return Err(MotionError::NotHomed(AXIS_NAMES[axis]));
            }
            let (min, max) = self.limits[axis];
            let target = end_pos[axis];
            if target < min || target > max {
                return Err(MotionError::OutOfRange {
                    axis: AXIS_NAMES[axis],
                    pos: target,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

fn load_rails(config: &Configfile) -> Result<[PrinterRail; 3], ConfigError> {
    Ok([
        PrinterRail::from_config(config, "stepper_x")?,
        PrinterRail::from_config(config, "stepper_y")?,
        PrinterRail::from_config(config, "stepper_z")?,
    ])
}

/// Builds the kinematics named by `[printer] kinematics`.
pub fn lookup_kinematics(config: &Configfile) -> Result<Box<dyn Kinematics>, ConfigError> {
    let kin_name = config.getchoice("printer", "kinematics", &["cartesian", "belt"], None)?;
    let rails = load_rails(config)?;
    match kin_name.as_str() {
        "belt" => {
            let angle = config.getfloat_above("printer", "belt_angle", Some(45.0), 0.0)?;
            if angle > 90.0 {
                return Err(ConfigError::ValidationError(format!(
                    "belt_angle ({}) must be <= 90",
                    angle
                )));
            }
            Ok(Box::new(belt::BeltKinematics::new(rails, angle)))
        }
        _ => Ok(Box::new(cartesian::CartesianKinematics::new(rails))),
    }
}
