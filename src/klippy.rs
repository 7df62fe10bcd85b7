// belt_probe/src/klippy.rs
// The printer: owns every object, routes command lines to their handlers.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::configfile::Configfile;
use crate::extras::belt_probe::{BeltProbe, BeltProbeCommand};
use crate::extras::probe_helper::{ProbeContext, ProbeError, ProbeSession, SessionCommand};
use crate::gcode::{parse_line, CommandError, GCodeCommand, GCodeDispatcher, GCodeMove, GCodeOutput};
use crate::kinematics::stepper_positions;
use crate::toolhead::{MotionStack, ToolHead};

const AXES: [char; 3] = ['X', 'Y', 'Z'];

/// Handler tags for every command the printer knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterCommand {
    Help,
    GetPosition,
    SetKinematicPosition,
    SetGcodeOffset,
    BeltProbe(BeltProbeCommand),
    Session(SessionCommand),
}

impl From<BeltProbeCommand> for PrinterCommand {
    fn from(cmd: BeltProbeCommand) -> Self {
        PrinterCommand::BeltProbe(cmd)
    }
}

impl From<SessionCommand> for PrinterCommand {
    fn from(cmd: SessionCommand) -> Self {
        PrinterCommand::Session(cmd)
    }
}

pub struct Printer {
    configfile: Arc<Mutex<Configfile>>,
    gcode: GCodeDispatcher<PrinterCommand>,
    gcode_move: GCodeMove,
    toolhead: ToolHead,
    belt_probe: Option<BeltProbe>,
    // The running probe session, if any
    session: Option<ProbeSession>,
}

impl Printer {
    pub fn new(config: Configfile) -> Result<Self, ProbeError> {
        info!("Loading printer config {}", config.filename().unwrap_or("<memory>"));
        let toolhead = ToolHead::from_config(&config)?;
        let has_belt_probe = config.has_section("belt_probe");
        let configfile = Arc::new(Mutex::new(config));

        let mut gcode = GCodeDispatcher::new();
        gcode.register_command(
            "HELP",
            PrinterCommand::Help,
            Some("Report the list of available extended G-Code commands"),
        )?;
        gcode.register_command(
            "GET_POSITION",
            PrinterCommand::GetPosition,
            Some("Return information on the current location of the toolhead"),
        )?;
        gcode.register_command(
            "SET_KINEMATIC_POSITION",
            PrinterCommand::SetKinematicPosition,
            Some("Force a low-level kinematic position"),
        )?;
        gcode.register_command(
            "SET_GCODE_OFFSET",
            PrinterCommand::SetGcodeOffset,
            Some("Set a virtual offset to g-code positions"),
        )?;

        let belt_probe = if has_belt_probe {
            Some(BeltProbe::new(configfile.clone(), &mut gcode)?)
        } else {
            info!("No [belt_probe] section, probe commands not loaded");
            None
        };

        Ok(Printer {
            configfile,
            gcode,
            gcode_move: GCodeMove::new(),
            toolhead,
            belt_probe,
            session: None,
        })
    }

    pub fn from_config_str(filename: Option<String>, text: &str) -> Result<Self, ProbeError> {
        let mut config = Configfile::new(filename);
        config.parse(text)?;
        Printer::new(config)
    }

    pub fn configfile(&self) -> Arc<Mutex<Configfile>> {
        self.configfile.clone()
    }

    pub fn toolhead(&self) -> &ToolHead {
        &self.toolhead
    }

    pub fn gcode(&self) -> &GCodeDispatcher<PrinterCommand> {
        &self.gcode
    }

    pub fn in_session(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_active())
    }

    pub fn take_output(&mut self) -> Vec<String> {
        self.gcode.take_output()
    }

    /// Runs one command line, reporting any failure as `!! <message>`.
    /// Returns false if the command failed.
    pub fn run_script_line(&mut self, line: &str) -> bool {
        let clean = line.split(';').next().unwrap_or("").trim();
        if clean.is_empty() {
            return true;
        }
        let result = parse_line(clean).and_then(|gcmd| self.dispatch(&gcmd));
        match result {
            Ok(()) => true,
            Err(e) => {
                self.gcode.respond_error(&e.to_string());
                false
            }
        }
    }

    /// Runs every line of `script`. Failures do not stop the script.
    pub fn run_script(&mut self, script: &str) {
        for line in script.lines() {
            self.run_script_line(line);
        }
    }

    pub fn dispatch(&mut self, gcmd: &GCodeCommand) -> Result<(), CommandError> {
        let handler = self
            .gcode
            .lookup(gcmd.get_command())
            .ok_or_else(|| CommandError::UnknownCommand(gcmd.get_command().to_string()))?;
        debug!("dispatch {} -> {:?}", gcmd.raw_line, handler);
        match handler {
            PrinterCommand::Help => {
                self.cmd_help();
                Ok(())
            }
            PrinterCommand::GetPosition => {
                self.cmd_get_position();
                Ok(())
            }
            PrinterCommand::SetKinematicPosition => self.cmd_set_kinematic_position(gcmd),
            PrinterCommand::SetGcodeOffset => self.gcode_move.cmd_set_gcode_offset(gcmd),
            PrinterCommand::BeltProbe(cmd) => self.cmd_belt_probe(cmd, gcmd).map_err(CommandError::from),
            PrinterCommand::Session(cmd) => self.cmd_session(cmd, gcmd).map_err(CommandError::from),
        }
    }

    fn cmd_help(&mut self) {
        let mut msg = vec!["Available extended commands:".to_string()];
        for (name, desc) in self.gcode.get_help() {
            msg.push(format!("{:<22}: {}", name, desc));
        }
        self.gcode.respond_info(&msg.join("\n"));
    }

    fn cmd_get_position(&mut self) {
        self.toolhead.flush_step_generation();
        let kin = self.toolhead.get_kinematics();
        let steppers = kin.get_steppers();
        let mcu_pos = steppers
            .iter()
            .map(|s| format!("{}:{}", s.get_name(), s.get_mcu_position()))
            .collect::<Vec<_>>()
            .join(" ");
        let stepper_pos = steppers
            .iter()
            .map(|s| format!("{}:{:.6}", s.get_name(), s.get_commanded_position()))
            .collect::<Vec<_>>()
            .join(" ");
        let kin_pos = kin.calc_position(&stepper_positions(kin));
        let kin_str = AXES
            .iter()
            .zip(kin_pos)
            .map(|(a, v)| format!("{}:{:.6}", a, v))
            .collect::<Vec<_>>()
            .join(" ");
        let fmt4 = |pos: [f64; 4]| {
            format!("X:{:.6} Y:{:.6} Z:{:.6} E:{:.6}", pos[0], pos[1], pos[2], pos[3])
        };
        let toolhead_str = fmt4(self.toolhead.get_position());
        let origin = self.gcode_move.homing_origin();
        let base_str = fmt4([origin.x, origin.y, origin.z, origin.e]);
        self.gcode.respond_info(&format!(
            "mcu: {}\nstepper: {}\nkinematic: {}\ntoolhead: {}\ngcode base: {}",
            mcu_pos, stepper_pos, kin_str, toolhead_str, base_str
        ));
    }

    fn cmd_set_kinematic_position(&mut self, gcmd: &GCodeCommand) -> Result<(), CommandError> {
        let mut pos = self.toolhead.get_position();
        let mut homing_axes = Vec::new();
        for (i, axis) in AXES.iter().enumerate() {
            if let Some(value) = gcmd.get_float_opt(&axis.to_string())? {
                pos[i] = value;
                homing_axes.push(i);
            }
        }
        if homing_axes.is_empty() {
            homing_axes = vec![0, 1, 2];
        }
        info!("SET_KINEMATIC_POSITION pos={:?} homing_axes={:?}", pos, homing_axes);
        self.toolhead.set_position(pos, &homing_axes);
        Ok(())
    }

    fn cmd_belt_probe(&mut self, cmd: BeltProbeCommand, gcmd: &GCodeCommand) -> Result<(), ProbeError> {
        let belt_probe = self
            .belt_probe
            .as_mut()
            .ok_or_else(|| CommandError::from("Printer object [belt_probe] is not configured"))?;
        match cmd {
            BeltProbeCommand::Probe => {
                let session = belt_probe.cmd_belt_probe(gcmd, &mut self.gcode, &mut self.toolhead)?;
                self.session = Some(session);
            }
            BeltProbeCommand::EndstopCalibrate => {
                let session = belt_probe.cmd_y_endstop_calibrate(gcmd, &mut self.gcode, &mut self.toolhead)?;
                self.session = Some(session);
            }
            BeltProbeCommand::OffsetApplyEndstop => {
                belt_probe.cmd_y_offset_apply_endstop(&self.gcode_move, &mut self.gcode)?;
            }
        }
        Ok(())
    }

    fn cmd_session(&mut self, cmd: SessionCommand, gcmd: &GCodeCommand) -> Result<(), ProbeError> {
        let (Some(session), Some(belt_probe)) = (self.session.as_mut(), self.belt_probe.as_mut()) else {
            return Err(ProbeError::Inactive);
        };
        let mut ctx = ProbeContext {
            gcode: &mut self.gcode,
            toolhead: &mut self.toolhead,
            status: belt_probe.status_mut(),
        };
        let result = session.handle_command(cmd, gcmd, &mut ctx);
        if !session.is_active() {
            self.session = None;
        }
        result
    }

    pub fn get_status(&self) -> serde_json::Value {
        let mut status = serde_json::json!({
            "toolhead": self.toolhead.get_status(),
            "gcode_move": self.gcode_move.get_status(),
        });
        if let Some(belt_probe) = &self.belt_probe {
            status["belt_probe"] = belt_probe.get_status();
        }
        status
    }

    /// Config text SAVE_CONFIG would write.
    pub fn pending_config(&self) -> String {
        self.configfile.lock().render_autosave()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "
[printer]
kinematics: cartesian
max_velocity: 200
[stepper_x]
[stepper_y]
step_distance: 0.01
position_endstop: 0
[stepper_z]
[belt_probe]
";

    fn printer() -> Printer {
        let mut printer = Printer::from_config_str(None, CONFIG).unwrap();
        printer.take_output();
        printer
    }

    #[test]
    fn test_unknown_command_reports_error() {
        let mut printer = printer();
        assert!(!printer.run_script_line("FOO X=1"));
        assert_eq!(printer.take_output(), vec!["!! Unknown command:\"FOO\""]);
        assert!(printer.run_script_line("   ; comment only"));
        assert!(printer.take_output().is_empty());
    }

    #[test]
    fn test_help_lists_commands() {
        let mut printer = printer();
        printer.run_script_line("HELP");
        let output = printer.take_output();
        assert_eq!(output[0], "// Available extended commands:");
        assert!(output.iter().any(|l| l.starts_with("// BELT_PROBE")));
        assert!(!output.iter().any(|l| l.contains("Y_ENDSTOP_CALIBRATE")));
    }

    #[test]
    fn test_set_kinematic_position_homes_axes() {
        let mut printer = printer();
        assert!(printer.run_script_line("SET_KINEMATIC_POSITION X=1 Y=2 Z=3"));
        assert_eq!(printer.toolhead().get_position(), [1.0, 2.0, 3.0, 0.0]);
        printer.run_script_line("GET_POSITION");
        let output = printer.take_output();
        assert!(output.contains(&"// kinematic: X:1.000000 Y:2.000000 Z:3.000000".to_string()));
        assert!(output.contains(&"// mcu: stepper_x:80 stepper_y:200 stepper_z:240".to_string()));
    }

    #[test]
    fn test_belt_probe_command_without_object() {
        let config = CONFIG.replace("[belt_probe]\n", "");
        let mut printer = Printer::from_config_str(None, &config).unwrap();
        let err = printer
            .cmd_belt_probe(BeltProbeCommand::Probe, &GCodeCommand::new("BELT_PROBE", &[]))
            .unwrap_err();
        assert_eq!(err.to_string(), "Printer object [belt_probe] is not configured");
        assert!(!printer.in_session());
    }

    #[test]
    fn test_session_commands_exist_only_during_session() {
        let mut printer = printer();
        printer.run_script("SET_KINEMATIC_POSITION X=0 Y=5 Z=0\nBELT_PROBE");
        assert!(printer.in_session());
        assert_eq!(printer.gcode().lookup("NEXT"), Some(PrinterCommand::Session(SessionCommand::Accept)));
        assert_eq!(printer.get_status()["belt_probe"]["is_active"], true);
        printer.run_script_line("ABORT");
        assert!(!printer.in_session());
        assert!(!printer.gcode().is_registered("TESTY"));
        printer.take_output();
        assert!(!printer.run_script_line("ABORT"));
        assert_eq!(printer.take_output(), vec!["!! Unknown command:\"ABORT\""]);
    }
}
