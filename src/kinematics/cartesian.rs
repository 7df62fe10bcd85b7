// belt_probe/src/kinematics/cartesian.rs

use std::collections::HashMap;

use crate::kinematics::{AxisLimits, Kinematics};
use crate::stepper::{PrinterRail, Stepper};
use crate::toolhead::MotionError;

pub struct CartesianKinematics {
    rails: [PrinterRail; 3], // Index 0 for X, 1 for Y, 2 for Z
    limits: AxisLimits,
}

impl CartesianKinematics {
    pub fn new(rails: [PrinterRail; 3]) -> Self {
        CartesianKinematics {
            rails,
            limits: AxisLimits::default(),
        }
    }
}

impl Kinematics for CartesianKinematics {
    fn name(&self) -> &'static str {
        "cartesian"
    }

    fn get_steppers(&self) -> Vec<&Stepper> {
        self.rails.iter().map(|r| r.get_stepper()).collect()
    }

    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> [f64; 3] {
        let mut pos = [0.0; 3];
        for (axis, rail) in self.rails.iter().enumerate() {
            pos[axis] = stepper_positions
                .get(rail.get_stepper().get_name())
                .copied()
                .unwrap_or_default();
        }
        pos
    }

    fn set_stepper_positions(&mut self, newpos: [f64; 3]) {
        for (rail, pos) in self.rails.iter_mut().zip(newpos) {
            rail.get_stepper_mut().set_commanded_position(pos);
        }
    }

    fn set_position(&mut self, newpos: [f64; 3], homing_axes: &[usize]) {
        self.set_stepper_positions(newpos);
        for &axis in homing_axes {
            let range = self.rails[axis].get_range();
            self.limits.set_homed(axis, range);
        }
    }

    fn check_move(&self, start_pos: &[f64; 4], end_pos: &[f64; 4]) -> Result<(), MotionError> {
        self.limits.check_move(start_pos, end_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::stepper_positions;

    fn rails() -> [PrinterRail; 3] {
        [
            PrinterRail::new(Stepper::new("stepper_x", 0.01), 0.0, 200.0, Some(0.0)),
            PrinterRail::new(Stepper::new("stepper_y", 0.01), 0.0, 200.0, Some(0.0)),
            PrinterRail::new(Stepper::new("stepper_z", 0.0025), 0.0, 180.0, Some(0.0)),
        ]
    }

    #[test]
    fn test_calc_position_round_trips_whole_steps() {
        let mut kin = CartesianKinematics::new(rails());
        kin.set_position([10.0, 20.0, 5.0], &[0, 1, 2]);
        let pos = kin.calc_position(&stepper_positions(&kin));
        assert!((pos[0] - 10.0).abs() < 1e-9);
        assert!((pos[1] - 20.0).abs() < 1e-9);
        assert!((pos[2] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_sub_step_moves_are_lost() {
        let mut kin = CartesianKinematics::new(rails());
        kin.set_position([0.0, 20.0, 0.0], &[1]);
        let before = kin.calc_position(&stepper_positions(&kin));
        kin.set_stepper_positions([0.0, 20.004, 0.0]);
        let after = kin.calc_position(&stepper_positions(&kin));
        assert_eq!(before, after);
    }

    #[test]
    fn test_homing_enables_range_checks() {
        let mut kin = CartesianKinematics::new(rails());
        let start = [0.0, 0.0, 0.0, 0.0];
        assert_eq!(
            kin.check_move(&start, &[0.0, 0.0, 10.0, 0.0]),
            Err(MotionError::NotHomed('Z'))
        );
        kin.set_position([0.0, 0.0, 0.0], &[2]);
        assert!(kin.check_move(&start, &[0.0, 0.0, 10.0, 0.0]).is_ok());
        assert!(kin.check_move(&start, &[0.0, 0.0, 190.0, 0.0]).is_err());
    }
}
