// belt_probe/src/gcode.rs
// Command line parsing, the command table and gcode offset state.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Unknown command:\"{0}\"")]
    UnknownCommand(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Parameter(String),
    #[error("gcode command {0} already registered")]
    AlreadyRegistered(String),
    #[error("{0}")]
    GCodeError(String),
}

impl From<&str> for CommandError {
    fn from(s: &str) -> Self {
        CommandError::GCodeError(s.to_string())
    }
}

impl From<String> for CommandError {
    fn from(s: String) -> Self {
        CommandError::GCodeError(s)
    }
}

/// A parsed command line such as `TESTY Y=++` or `SET_GCODE_OFFSET Y=0.2`.
#[derive(Debug, Clone, PartialEq)]
pub struct GCodeCommand {
    pub command: String,
    pub raw_line: String,
    pub params: HashMap<String, String>,
}

impl GCodeCommand {
    pub fn new(command: &str, params: &[(&str, &str)]) -> Self {
        let params = params
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v.to_string()))
            .collect();
        GCodeCommand {
            command: command.to_uppercase(),
            raw_line: command.to_string(),
            params,
        }
    }

    pub fn get_command(&self) -> &str {
        &self.command
    }

    pub fn has(&self, name: &str) -> bool {
        self.params.contains_key(&name.to_uppercase())
    }

    pub fn get(&self, name: &str, default: Option<&str>) -> Result<String, CommandError> {
        match self.params.get(&name.to_uppercase()) {
            Some(v) => Ok(v.clone()),
            None => default.map(str::to_string).ok_or_else(|| {
                CommandError::Parameter(format!("Error on '{}': missing {}", self.raw_line, name))
            }),
        }
    }

    /// Float parameter with optional default, inclusive minimum and exclusive lower bound.
    pub fn get_float(
        &self,
        name: &str,
        default: Option<f64>,
        minval: Option<f64>,
        above: Option<f64>,
    ) -> Result<f64, CommandError> {
        let value = match self.params.get(&name.to_uppercase()) {
            Some(raw) => raw.trim().parse::<f64>().map_err(|_| {
                CommandError::Parameter(format!("Unable to parse '{}' as a float", raw))
            })?,
            None => default.ok_or_else(|| {
                CommandError::Parameter(format!("Error on '{}': missing {}", self.raw_line, name))
            })?,
        };
        if !value.is_finite() {
            return Err(CommandError::Parameter(format!(
                "Error on '{}': {} must be a finite number",
                self.raw_line, name
            )));
        }
        if let Some(min) = minval {
            if value < min {
                return Err(CommandError::Parameter(format!(
                    "Error on '{}': {} must have minimum of {}",
                    self.raw_line, name, min
                )));
            }
        }
        if let Some(above) = above {
            if value <= above {
                return Err(CommandError::Parameter(format!(
                    "Error on '{}': {} must be above {}",
                    self.raw_line, name, above
                )));
            }
        }
        Ok(value)
    }

    pub fn get_float_opt(&self, name: &str) -> Result<Option<f64>, CommandError> {
        if !self.has(name) {
            return Ok(None);
        }
        self.get_float(name, None, None, None).map(Some)
    }
}

/// Parses a single command line.
///
/// Extended commands use `KEY=VALUE` parameters; classic commands such as
/// `G1 X10` use a letter followed by a value.
pub fn parse_line(line: &str) -> Result<GCodeCommand, CommandError> {
    let clean_line = line.split(';').next().unwrap_or("").trim();
    if clean_line.is_empty() {
        return Err(CommandError::Parse("Empty G-code line".to_string()));
    }

    let mut parts = clean_line.split_whitespace();
    let command = parts
        .next()
        .ok_or_else(|| CommandError::Parse(format!("Missing command in line: {}", line)))?
        .to_uppercase();
    if !command.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(CommandError::Parse(format!("Command must start with a letter: {}", command)));
    }

    let mut params = HashMap::new();
    for part in parts {
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k.to_uppercase(), v.to_string()),
            None => {
                let mut chars = part.chars();
                let letter = chars.next().unwrap_or_default();
                (letter.to_ascii_uppercase().to_string(), chars.as_str().to_string())
            }
        };
        if key.is_empty() || !key.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(CommandError::Parse(format!("Malformed parameter '{}' in: {}", part, line)));
        }
        params.insert(key, value);
    }

    Ok(GCodeCommand {
        command,
        raw_line: clean_line.to_string(),
        params,
    })
}

/// Sink for operator-visible responses.
pub trait GCodeOutput {
    fn respond_info(&mut self, msg: &str);
}

#[derive(Debug, Clone)]
struct RegisteredCommand<H> {
    handler: H,
    desc: Option<String>,
}

/// Command table mapping names to handler tags.
///
/// Handlers are plain values, usually an enum. The owner of the table runs
/// them.
#[derive(Debug, Clone)]
pub struct GCodeDispatcher<H> {
    commands: BTreeMap<String, RegisteredCommand<H>>,
    output: Vec<String>,
}

impl<H> Default for GCodeDispatcher<H> {
    fn default() -> Self {
        GCodeDispatcher {
            commands: BTreeMap::new(),
            output: Vec::new(),
        }
    }
}

impl<H: Copy> GCodeDispatcher<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command(&mut self, cmd: &str, handler: H, desc: Option<&str>) -> Result<(), CommandError> {
        let cmd = cmd.to_uppercase();
        if self.commands.contains_key(&cmd) {
            return Err(CommandError::AlreadyRegistered(cmd));
        }
        debug!("Registering command {}", cmd);
        self.commands.insert(
            cmd,
            RegisteredCommand {
                handler,
                desc: desc.map(str::to_string),
            },
        );
        Ok(())
    }

    /// Removes a command. Unknown names are ignored.
    pub fn unregister_command(&mut self, cmd: &str) -> Option<H> {
        let removed = self.commands.remove(&cmd.to_uppercase()).map(|c| c.handler);
        if removed.is_some() {
            debug!("Unregistered command {}", cmd);
        }
        removed
    }

    pub fn is_registered(&self, cmd: &str) -> bool {
        self.commands.contains_key(&cmd.to_uppercase())
    }

    pub fn lookup(&self, cmd: &str) -> Option<H> {
        self.commands.get(&cmd.to_uppercase()).map(|c| c.handler)
    }

    /// Registered commands that carry a help text, sorted by name.
    pub fn get_help(&self) -> Vec<(String, String)> {
        self.commands
            .iter()
            .filter_map(|(name, c)| c.desc.as_ref().map(|d| (name.clone(), d.clone())))
            .collect()
    }

    pub fn respond_error(&mut self, msg: &str) {
        warn!("{}", msg);
        let mut lines = msg.trim().lines();
        if let Some(first) = lines.next() {
            self.output.push(format!("!! {}", first));
        }
        for line in lines {
            self.output.push(format!("// {}", line));
        }
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }
}

impl<H> GCodeOutput for GCodeDispatcher<H> {
    fn respond_info(&mut self, msg: &str) {
        info!("{}", msg);
        for line in msg.trim().lines() {
            self.output.push(format!("// {}", line));
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

/// Gcode coordinate state: the offset applied by SET_GCODE_OFFSET.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GCodeMove {
    homing_origin: Coord,
}

impl GCodeMove {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn homing_origin(&self) -> Coord {
        self.homing_origin
    }

    pub fn cmd_set_gcode_offset(&mut self, gcmd: &GCodeCommand) -> Result<(), CommandError> {
        let origin = &mut self.homing_origin;
        for (name, slot) in [("X", &mut origin.x), ("Y", &mut origin.y), ("Z", &mut origin.z), ("E", &mut origin.e)] {
            if let Some(offset) = gcmd.get_float_opt(name)? {
                *slot = offset;
            } else if let Some(adjust) = gcmd.get_float_opt(&format!("{}_ADJUST", name))? {
                *slot += adjust;
            }
        }
        debug!("gcode homing origin now {:?}", self.homing_origin);
        Ok(())
    }

    pub fn get_status(&self) -> serde_json::Value {
        serde_json::json!({ "homing_origin": self.homing_origin })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum TestHandler {
        Probe,
        Accept,
    }

    #[test]
    fn gcode_command_get_float_ok() {
        let gcmd = GCodeCommand::new("SET_GCODE_OFFSET", &[("Y", "10.5")]);
        assert_eq!(gcmd.get_float("Y", None, None, None), Ok(10.5));
    }

    #[test]
    fn gcode_command_get_float_default() {
        let gcmd = GCodeCommand::new("BELT_PROBE", &[]);
        assert_eq!(gcmd.get_float("SPEED", Some(5.0), None, Some(0.0)), Ok(5.0));
    }

    #[test]
    fn gcode_command_get_float_missing() {
        let gcmd = GCodeCommand::new("BELT_PROBE", &[]);
        assert!(gcmd.get_float("SPEED", None, None, None).is_err());
    }

    #[test]
    fn gcode_command_get_float_parse_error() {
        let gcmd = GCodeCommand::new("BELT_PROBE", &[("SPEED", "abc")]);
        assert!(gcmd.get_float("SPEED", None, None, None).is_err());
    }

    #[test]
    fn gcode_command_get_float_bounds() {
        let gcmd = GCodeCommand::new("BELT_PROBE", &[("SPEED", "0")]);
        assert!(gcmd.get_float("SPEED", None, None, Some(0.0)).is_err());
        assert!(gcmd.get_float("SPEED", None, Some(1.0), None).is_err());
        assert_eq!(gcmd.get_float("SPEED", None, Some(0.0), None), Ok(0.0));
        let nan = GCodeCommand::new("BELT_PROBE", &[("SPEED", "nan")]);
        assert!(nan.get_float("SPEED", None, None, None).is_err());
    }

    #[test]
    fn test_parse_extended_command() {
        let cmd = parse_line("testy y=++").unwrap();
        assert_eq!(cmd.command, "TESTY");
        assert_eq!(cmd.get("Y", None).unwrap(), "++");
    }

    #[test]
    fn test_parse_negative_value_and_comment() {
        let cmd = parse_line("TESTY Y=-0.1 ; step down").unwrap();
        assert_eq!(cmd.get_float("Y", None, None, None), Ok(-0.1));
        assert_eq!(cmd.raw_line, "TESTY Y=-0.1");
    }

    #[test]
    fn test_parse_classic_params() {
        let cmd = parse_line("G1 X10 Y20.5").unwrap();
        assert_eq!(cmd.command, "G1");
        assert_eq!(cmd.get_float("X", None, None, None), Ok(10.0));
        assert_eq!(cmd.get_float("Y", None, None, None), Ok(20.5));
    }

    #[test]
    fn test_parse_line_errors() {
        assert_eq!(
            parse_line("; just a comment"),
            Err(CommandError::Parse("Empty G-code line".to_string()))
        );
        assert!(parse_line("").is_err());
        assert!(parse_line("1G X10").is_err());
        assert!(parse_line("TESTY =5").is_err());
    }

    #[test]
    fn test_register_and_unregister() {
        let mut gcode = GCodeDispatcher::new();
        gcode.register_command("ACCEPT", TestHandler::Accept, Some("Accept")).unwrap();
        gcode.register_command("next", TestHandler::Accept, None).unwrap();
        assert_eq!(gcode.lookup("accept"), Some(TestHandler::Accept));
        assert_eq!(gcode.lookup("NEXT"), Some(TestHandler::Accept));
        assert_eq!(
            gcode.register_command("ACCEPT", TestHandler::Probe, None),
            Err(CommandError::AlreadyRegistered("ACCEPT".to_string()))
        );
        assert_eq!(gcode.unregister_command("ACCEPT"), Some(TestHandler::Accept));
        assert_eq!(gcode.unregister_command("ACCEPT"), None);
        assert!(!gcode.is_registered("ACCEPT"));
        assert!(gcode.is_registered("NEXT"));
    }

    #[test]
    fn test_help_lists_described_commands() {
        let mut gcode = GCodeDispatcher::new();
        gcode.register_command("BELT_PROBE", TestHandler::Probe, Some("Start belt probe")).unwrap();
        gcode.register_command("NEXT", TestHandler::Accept, None).unwrap();
        assert_eq!(gcode.get_help(), vec![("BELT_PROBE".to_string(), "Start belt probe".to_string())]);
    }

    #[test]
    fn test_responses_are_prefixed() {
        let mut gcode: GCodeDispatcher<TestHandler> = GCodeDispatcher::new();
        gcode.respond_info("line one\nline two");
        gcode.respond_error("bad thing\nmore detail");
        assert_eq!(
            gcode.take_output(),
            vec!["// line one", "// line two", "!! bad thing", "// more detail"]
        );
        assert!(gcode.output().is_empty());
    }

    #[test]
    fn test_set_gcode_offset() {
        let mut gcode_move = GCodeMove::new();
        gcode_move.cmd_set_gcode_offset(&GCodeCommand::new("SET_GCODE_OFFSET", &[("Y", "0.3")])).unwrap();
        gcode_move
            .cmd_set_gcode_offset(&GCodeCommand::new("SET_GCODE_OFFSET", &[("Y_ADJUST", "-0.1"), ("Z", "1")]))
            .unwrap();
        let origin = gcode_move.homing_origin();
        assert!((origin.y - 0.2).abs() < 1e-12);
        assert_eq!(origin.z, 1.0);
        assert_eq!(gcode_move.get_status()["homing_origin"]["z"], 1.0);
    }
}
