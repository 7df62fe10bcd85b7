// belt_probe/src/extras/belt_probe.rs
// The `[belt_probe]` printer object: manual Y height probing on belt
// printers and calibration of the Y endstop from it.

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::configfile::{ConfigStore, Configfile};
use crate::extras::probe_helper::{
    Axis, FinalizeCallback, ProbeContext, ProbeError, ProbeSession, ProbeSettings, ProbeStatus, SessionCommand,
    BISECT_MAX, BOB_MINIMUM, DEFAULT_SPEED,
};
use crate::extras::session_guard::SessionGuard;
use crate::gcode::{CommandError, GCodeCommand, GCodeDispatcher, GCodeMove, GCodeOutput};
use crate::toolhead::MotionStack;

const SECTION: &str = "belt_probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeltProbeCommand {
    Probe,
    EndstopCalibrate,
    OffsetApplyEndstop,
}

pub struct BeltProbe {
    settings: ProbeSettings,
    y_position_endstop: Option<f64>,
    configfile: Arc<Mutex<Configfile>>,
    guard: SessionGuard,
    status: ProbeStatus,
}

impl BeltProbe {
    pub fn new<H: From<BeltProbeCommand> + Copy>(
        configfile: Arc<Mutex<Configfile>>,
        gcode: &mut GCodeDispatcher<H>,
    ) -> Result<Self, ProbeError> {
        let (settings, kinematics, y_position_endstop) = {
            let config = configfile.lock();
            let settings = ProbeSettings {
                axis: Axis::Y,
                speed: config.getfloat_above(SECTION, "speed", Some(DEFAULT_SPEED), 0.0)?,
                bisect_max: config.getfloat_above(SECTION, "bisect_max", Some(BISECT_MAX), 0.0)?,
                bob_minimum: config.getfloat(SECTION, "bob_minimum", Some(BOB_MINIMUM), Some(0.0), None)?,
            };
            let kinematics = config.get("printer", "kinematics", None)?.to_lowercase();
            let y_position_endstop = config.getfloat_opt("stepper_y", "position_endstop")?;
            (settings, kinematics, y_position_endstop)
        };

        gcode.register_command(
            "BELT_PROBE",
            H::from(BeltProbeCommand::Probe),
            Some("Start manual probe helper script"),
        )?;
        if kinematics != "belt" {
            info!("belt_probe: {} kinematics, endstop calibration disabled", kinematics);
            gcode.respond_info("Use MANUAL_PROBE for other kinematics");
        } else {
            gcode.register_command(
                "Y_ENDSTOP_CALIBRATE",
                H::from(BeltProbeCommand::EndstopCalibrate),
                Some("Calibrate a Y endstop"),
            )?;
            gcode.register_command(
                "Y_OFFSET_APPLY_ENDSTOP",
                H::from(BeltProbeCommand::OffsetApplyEndstop),
                Some("Adjust the Y endstop_position"),
            )?;
        }

        Ok(BeltProbe {
            settings,
            y_position_endstop,
            configfile,
            guard: SessionGuard::new(),
            status: ProbeStatus::new(Axis::Y),
        })
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }

    pub fn status_mut(&mut self) -> &mut ProbeStatus {
        &mut self.status
    }

    pub fn get_status(&self) -> serde_json::Value {
        self.status.get_status()
    }

    fn session_settings(&self, gcmd: &GCodeCommand) -> Result<ProbeSettings, CommandError> {
        let mut settings = self.settings;
        settings.speed = gcmd.get_float("SPEED", Some(self.settings.speed), None, Some(0.0))?;
        Ok(settings)
    }

    fn start_session<H: From<SessionCommand> + Copy + 'static>(
        &mut self,
        gcmd: &GCodeCommand,
        gcode: &mut GCodeDispatcher<H>,
        toolhead: &mut dyn MotionStack,
        finalize_callback: FinalizeCallback,
    ) -> Result<ProbeSession, ProbeError> {
        let settings = self.session_settings(gcmd)?;
        let mut ctx = ProbeContext {
            gcode,
            toolhead,
            status: &mut self.status,
        };
        ProbeSession::start(&self.guard, settings, &mut ctx, finalize_callback)
    }

    /// BELT_PROBE [SPEED=<speed>]
    pub fn cmd_belt_probe<H: From<SessionCommand> + Copy + 'static>(
        &mut self,
        gcmd: &GCodeCommand,
        gcode: &mut GCodeDispatcher<H>,
        toolhead: &mut dyn MotionStack,
    ) -> Result<ProbeSession, ProbeError> {
        let axis = self.settings.axis;
        let callback: FinalizeCallback = Box::new(move |kin_pos: Option<[f64; 3]>, out: &mut dyn GCodeOutput| {
            if let Some(kin_pos) = kin_pos {
                out.respond_info(&format!("{} position is {:.3}", axis.letter(), kin_pos[axis.index()]));
            }
        });
        self.start_session(gcmd, gcode, toolhead, callback)
    }

    /// Y_ENDSTOP_CALIBRATE [SPEED=<speed>]
    pub fn cmd_y_endstop_calibrate<H: From<SessionCommand> + Copy + 'static>(
        &mut self,
        gcmd: &GCodeCommand,
        gcode: &mut GCodeDispatcher<H>,
        toolhead: &mut dyn MotionStack,
    ) -> Result<ProbeSession, ProbeError> {
        let endstop = self.require_endstop()?;
        let configfile = self.configfile.clone();
        let callback: FinalizeCallback = Box::new(move |kin_pos: Option<[f64; 3]>, out: &mut dyn GCodeOutput| {
            if let Some(kin_pos) = kin_pos {
                save_position_endstop(&configfile, out, endstop - kin_pos[1]);
            }
        });
        self.start_session(gcmd, gcode, toolhead, callback)
    }

    /// Y_OFFSET_APPLY_ENDSTOP: folds the gcode Y offset into position_endstop.
    pub fn cmd_y_offset_apply_endstop(
        &mut self,
        gcode_move: &GCodeMove,
        out: &mut dyn GCodeOutput,
    ) -> Result<(), ProbeError> {
        let offset = gcode_move.homing_origin().y;
        if offset == 0.0 {
            out.respond_info("Nothing to do: Y Offset is 0");
            return Ok(());
        }
        let endstop = self.require_endstop()?;
        save_position_endstop(&self.configfile, out, endstop - offset);
        Ok(())
    }

    fn require_endstop(&self) -> Result<f64, CommandError> {
        self.y_position_endstop
            .ok_or_else(|| CommandError::from("Option 'position_endstop' in section 'stepper_y' must be specified"))
    }
}

fn save_position_endstop(configfile: &Mutex<Configfile>, out: &mut dyn GCodeOutput, position_endstop: f64) {
    out.respond_info(&format!(
        "stepper_y: position_endstop: {:.3}\n\
         The SAVE_CONFIG command will update the printer config file\n\
         with the above and restart the printer.",
        position_endstop
    ));
    configfile
        .lock()
        .set("stepper_y", "position_endstop", &format!("{:.3}", position_endstop));
}
