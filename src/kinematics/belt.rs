// belt_probe/src/kinematics/belt.rs
// Belt printer: the gantry (stepper_z) travels along an axis tilted by
// `belt_angle` over the belt (stepper_y). Machine Z is the height above the
// belt, so moving Z also drags the nozzle along the belt direction and the
// belt has to compensate.

use std::collections::HashMap;

use crate::kinematics::{AxisLimits, Kinematics};
use crate::stepper::{PrinterRail, Stepper};
use crate::toolhead::MotionError;

pub struct BeltKinematics {
    rails: [PrinterRail; 3],
    limits: AxisLimits,
    sin_angle: f64,
    cos_angle: f64,
}

impl BeltKinematics {
    pub fn new(rails: [PrinterRail; 3], belt_angle_deg: f64) -> Self {
        let angle = belt_angle_deg.to_radians();
        BeltKinematics {
            rails,
            limits: AxisLimits::default(),
            sin_angle: angle.sin(),
            cos_angle: angle.cos(),
        }
    }

    fn stepper_pos(&self, stepper_positions: &HashMap<String, f64>, axis: usize) -> f64 {
        stepper_positions
            .get(self.rails[axis].get_stepper().get_name())
            .copied()
            .unwrap_or_default()
    }
}

impl Kinematics for BeltKinematics {
    fn name(&self) -> &'static str {
        "belt"
    }

    fn get_steppers(&self) -> Vec<&Stepper> {
        self.rails.iter().map(|r| r.get_stepper()).collect()
    }

    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> [f64; 3] {
        let sx = self.stepper_pos(stepper_positions, 0);
        let sy = self.stepper_pos(stepper_positions, 1);
        let sz = self.stepper_pos(stepper_positions, 2);
        [sx, sy - sz * self.cos_angle, sz * self.sin_angle]
    }

    fn set_stepper_positions(&mut self, newpos: [f64; 3]) {
        let [x, y, z] = newpos;
        let gantry = z / self.sin_angle;
        self.rails[0].get_stepper_mut().set_commanded_position(x);
        self.rails[1].get_stepper_mut().set_commanded_position(y + gantry * self.cos_angle);
        self.rails[2].get_stepper_mut().set_commanded_position(gantry);
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
            PrinterRail::new(Stepper::new("stepper_x", 0.0125), 0.0, 200.0, None),
            PrinterRail::new(Stepper::new("stepper_y", 0.0125), -1000.0, 1000.0, Some(0.0)),
            PrinterRail::new(Stepper::new("stepper_z", 0.0025), 0.0, 180.0, Some(0.0)),
        ]
    }

    #[test]
    fn test_z_move_is_compensated_on_the_belt() {
        let mut kin = BeltKinematics::new(rails(), 45.0);
        kin.set_position([10.0, 0.0, 0.0], &[0, 1, 2]);
        let y_before = kin.get_steppers()[1].get_commanded_position();
        kin.set_stepper_positions([10.0, 0.0, 10.0]);
        let y_after = kin.get_steppers()[1].get_commanded_position();
        // Gantry travel of 10/sin(45) shifts the belt by 10
        assert!((y_after - y_before - 10.0).abs() < 0.0125);
    }

    #[test]
    fn test_calc_position_inverts_stepper_positions() {
        let mut kin = BeltKinematics::new(rails(), 45.0);
        kin.set_position([50.0, 25.0, 7.5], &[0, 1, 2]);
        let pos = kin.calc_position(&stepper_positions(&kin));
        assert!((pos[0] - 50.0).abs() < 0.0125);
        assert!((pos[1] - 25.0).abs() < 0.0125);
        assert!((pos[2] - 7.5).abs() < 0.0025);
    }

    #[test]
    fn test_vertical_gantry_behaves_cartesian() {
        let mut kin = BeltKinematics::new(rails(), 90.0);
        kin.set_position([1.0, 2.0, 3.0], &[]);
        let pos = kin.calc_position(&stepper_positions(&kin));
        assert!((pos[1] - 2.0).abs() < 1e-9);
        assert!((pos[2] - 3.0).abs() < 1e-9);
    }
}
