// belt_probe/src/extras/probe_helper.rs
// Interactive probe session: the operator jogs one axis with TEST<axis>
// commands, narrowing the reference position by bisection, then ACCEPTs.

use std::str::FromStr;

use log::{debug, info, warn};
use serde_json::json;
use thiserror::Error;

use crate::configfile::ConfigError;
use crate::extras::session_guard::{SessionGuard, SessionLease};
use crate::gcode::{CommandError, GCodeCommand, GCodeDispatcher, GCodeOutput};
use crate::kinematics::stepper_positions;
use crate::toolhead::{MotionError, MotionStack};

pub const BISECT_MAX: f64 = 0.200;
pub const BOB_MINIMUM: f64 = 0.500;
pub const DEFAULT_SPEED: f64 = 5.0;
const POSITION_SENTINEL: f64 = 9999999999999.9;
const UNKNOWN_POSITION: &str = "??????";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    #[error("Already in a belt probe. Use ABORT to abort it.")]
    SessionConflict,
    #[error("No probe session is active")]
    Inactive,
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ProbeError> for CommandError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Command(e) => e,
            other => CommandError::GCodeError(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }

    fn key(self) -> char {
        self.letter().to_ascii_lowercase()
    }
}

/// Commands a session installs while it runs. `NEXT` maps to `Accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Accept,
    Abort,
    Test,
}

/// Operator request for the next test position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdvanceRequest {
    /// `+`: half way up to the next tested position
    Up,
    /// `++`: a full bisect step up
    UpCoarse,
    /// `-`
    Down,
    /// `--`
    DownCoarse,
    /// A signed distance, applied as is
    Offset(f64),
}

impl FromStr for AdvanceRequest {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "+" => Ok(AdvanceRequest::Up),
            "++" => Ok(AdvanceRequest::UpCoarse),
            "-" => Ok(AdvanceRequest::Down),
            "--" => Ok(AdvanceRequest::DownCoarse),
            other => match other.parse::<f64>() {
                Ok(d) if d.is_finite() => Ok(AdvanceRequest::Offset(d)),
                _ => Err(CommandError::Parameter(format!(
                    "Unable to parse '{}' as a float or one of +, ++, -, --",
                    other
                ))),
            },
        }
    }
}

impl AdvanceRequest {
    /// Next candidate from the current value `pos` and its tested neighbors.
    /// Relative steps never pass a neighbor; offsets are not clamped.
    pub fn next_position(self, pos: f64, lower: Option<f64>, upper: Option<f64>, bisect_max: f64) -> f64 {
        match self {
            AdvanceRequest::Up | AdvanceRequest::UpCoarse => {
                let mut check = upper.unwrap_or(POSITION_SENTINEL);
                if self == AdvanceRequest::Up {
                    check = (check + pos) / 2.0;
                }
                check.min(pos + bisect_max)
            }
            AdvanceRequest::Down | AdvanceRequest::DownCoarse => {
                let mut check = lower.unwrap_or(-POSITION_SENTINEL);
                if self == AdvanceRequest::Down {
                    check = (check + pos) / 2.0;
                }
                check.max(pos - bisect_max)
            }
            AdvanceRequest::Offset(d) => pos + d,
        }
    }
}

/// Cached pair of the last raw toolhead position and what it resolved to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionCache {
    last_toolhead_pos: Option<[f64; 4]>,
    last_kin_pos: Option<[f64; 3]>,
}

impl PositionCache {
    pub fn get_kinematics_pos(&mut self, toolhead: &mut dyn MotionStack) -> [f64; 3] {
        let toolhead_pos = toolhead.get_position();
        if let (Some(last), Some(kin_pos)) = (self.last_toolhead_pos, self.last_kin_pos) {
            if last.map(f64::to_bits) == toolhead_pos.map(f64::to_bits) {
                return kin_pos;
            }
        }
        toolhead.flush_step_generation();
        let kin = toolhead.get_kinematics();
        let kin_pos = kin.calc_position(&stepper_positions(kin));
        self.last_toolhead_pos = Some(toolhead_pos);
        self.last_kin_pos = Some(kin_pos);
        kin_pos
    }

    pub fn invalidate(&mut self) {
        self.last_toolhead_pos = None;
        self.last_kin_pos = None;
    }
}

/// Queryable session state for status panels.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeStatus {
    axis: Axis,
    is_active: bool,
    position: Option<f64>,
    lower: Option<f64>,
    upper: Option<f64>,
}

impl ProbeStatus {
    pub fn new(axis: Axis) -> Self {
        ProbeStatus {
            axis,
            is_active: false,
            position: None,
            lower: None,
            upper: None,
        }
    }

    pub fn reset(&mut self) {
        *self = ProbeStatus::new(self.axis);
    }

    pub fn update(&mut self, position: f64, lower: Option<f64>, upper: Option<f64>) {
        self.is_active = true;
        self.position = Some(position);
        self.lower = lower;
        self.upper = upper;
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn neighbors(&self) -> (Option<f64>, Option<f64>) {
        (self.lower, self.upper)
    }

    pub fn get_status(&self) -> serde_json::Value {
        let key = self.axis.key();
        let mut status = serde_json::Map::new();
        status.insert("is_active".to_string(), json!(self.is_active));
        status.insert(format!("{}_position", key), json!(self.position));
        status.insert(format!("{}_position_lower", key), json!(self.lower));
        status.insert(format!("{}_position_upper", key), json!(self.upper));
        serde_json::Value::Object(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSettings {
    pub axis: Axis,
    pub speed: f64,
    pub bisect_max: f64,
    pub bob_minimum: f64,
}

impl ProbeSettings {
    pub fn new(axis: Axis) -> Self {
        ProbeSettings {
            axis,
            speed: DEFAULT_SPEED,
            bisect_max: BISECT_MAX,
            bob_minimum: BOB_MINIMUM,
        }
    }
}

/// Called once per session with the resolved position, or `None` on abort.
pub type FinalizeCallback = Box<dyn FnOnce(Option<[f64; 3]>, &mut dyn GCodeOutput)>;

/// Everything a session touches but does not own.
pub struct ProbeContext<'a, H> {
    pub gcode: &'a mut GCodeDispatcher<H>,
    pub toolhead: &'a mut dyn MotionStack,
    pub status: &'a mut ProbeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Finalized,
}

pub struct ProbeSession {
    settings: ProbeSettings,
    // Tested positions, sorted ascending without duplicates
    past_positions: Vec<f64>,
    start_position: [f64; 4],
    cache: PositionCache,
    state: SessionState,
    lease: SessionLease,
    finalize_callback: Option<FinalizeCallback>,
}

impl ProbeSession {
    /// Admits a new session, installs its commands and reports the start position.
    pub fn start<H: From<SessionCommand> + Copy + 'static>(
        guard: &SessionGuard,
        settings: ProbeSettings,
        ctx: &mut ProbeContext<'_, H>,
        finalize_callback: FinalizeCallback,
    ) -> Result<Self, ProbeError> {
        let lease = guard.try_acquire()?;
        let mut session = ProbeSession {
            settings,
            past_positions: Vec::new(),
            start_position: [0.0; 4],
            cache: PositionCache::default(),
            state: SessionState::Active,
            lease,
            finalize_callback: Some(finalize_callback),
        };
        session.register_commands(ctx.gcode)?;
        let letter = settings.axis.letter();
        ctx.gcode.respond_info(&format!(
            "Starting belt probe. Use TEST{} to adjust position.\nFinish with ACCEPT or ABORT command.",
            letter
        ));
        session.start_position = ctx.toolhead.get_position();
        info!(
            "probe session started on {} at {:?}, speed {:.3}",
            letter, session.start_position, settings.speed
        );
        session.report_status(ctx, None);
        Ok(session)
    }

    fn command_names(&self) -> [(String, SessionCommand, Option<&'static str>); 4] {
        [
            ("ACCEPT".to_string(), SessionCommand::Accept, Some("Accept the current position")),
            ("NEXT".to_string(), SessionCommand::Accept, None),
            ("ABORT".to_string(), SessionCommand::Abort, Some("Abort belt probing tool")),
            (self.test_command(), SessionCommand::Test, Some("Move to a new test position")),
        ]
    }

    fn register_commands<H: From<SessionCommand> + Copy>(
        &self,
        gcode: &mut GCodeDispatcher<H>,
    ) -> Result<(), ProbeError> {
        let commands = self.command_names();
        for (i, (name, cmd, desc)) in commands.iter().enumerate() {
            if let Err(e) = gcode.register_command(name, H::from(*cmd), *desc) {
                for (installed, _, _) in &commands[..i] {
                    gcode.unregister_command(installed);
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn test_command(&self) -> String {
        format!("TEST{}", self.settings.axis.letter())
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn past_positions(&self) -> &[f64] {
        &self.past_positions
    }

    pub fn start_position(&self) -> [f64; 4] {
        self.start_position
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    pub fn handle_command<H: From<SessionCommand> + Copy + 'static>(
        &mut self,
        cmd: SessionCommand,
        gcmd: &GCodeCommand,
        ctx: &mut ProbeContext<'_, H>,
    ) -> Result<(), ProbeError> {
        if !self.is_active() {
            return Err(ProbeError::Inactive);
        }
        match cmd {
            SessionCommand::Accept => {
                self.cmd_accept(ctx);
                Ok(())
            }
            SessionCommand::Abort => {
                self.cmd_abort(ctx);
                Ok(())
            }
            SessionCommand::Test => self.cmd_test(gcmd, ctx),
        }
    }

    fn cmd_test<H: From<SessionCommand> + Copy + 'static>(
        &mut self,
        gcmd: &GCodeCommand,
        ctx: &mut ProbeContext<'_, H>,
    ) -> Result<(), ProbeError> {
        let token = gcmd.get(&self.settings.axis.letter().to_string(), None)?;
        let request: AdvanceRequest = token.parse()?;
        self.advance(request, ctx).map(|_| ())
    }

    /// Records the current position, moves to the next candidate and reports.
    /// Returns the commanded target.
    pub fn advance<H: From<SessionCommand> + Copy + 'static>(
        &mut self,
        request: AdvanceRequest,
        ctx: &mut ProbeContext<'_, H>,
    ) -> Result<f64, ProbeError> {
        if !self.is_active() {
            return Err(ProbeError::Inactive);
        }
        let pos = self.cache.get_kinematics_pos(ctx.toolhead)[self.settings.axis.index()];
        let insert_pos = self.insert_position(pos);
        let lower = insert_pos.checked_sub(1).map(|i| self.past_positions[i]);
        let upper = self.past_positions.get(insert_pos + 1).copied();
        let target = request.next_position(pos, lower, upper, self.settings.bisect_max);
        debug!("advance {:?} from {:.6} to {:.6}", request, pos, target);

        if let Err(e) = self.move_axis(target, ctx.toolhead) {
            warn!("probe move to {:.3} failed: {}", target, e);
            self.finalize(false, ctx);
            return Err(e.into());
        }
        let prev = if target != pos { Some(pos) } else { None };
        self.report_status(ctx, prev);
        Ok(target)
    }

    // Inserts `pos` keeping the history sorted and returns its index
    fn insert_position(&mut self, pos: f64) -> usize {
        let pp = &mut self.past_positions;
        let insert_pos = pp.partition_point(|&p| p < pos);
        if insert_pos >= pp.len() || pp[insert_pos] != pos {
            pp.insert(insert_pos, pos);
        }
        insert_pos
    }

    // The clearance move is on the probed axis itself: below
    // `target + bob_minimum` it lifts there first, then comes down to target
    fn move_axis(&self, target: f64, toolhead: &mut dyn MotionStack) -> Result<(), MotionError> {
        let axis = self.settings.axis.index();
        let curpos = toolhead.get_position();
        let bob_pos = target + self.settings.bob_minimum;
        let mut coord = [None; 4];
        if curpos[axis] < bob_pos {
            coord[axis] = Some(bob_pos);
            toolhead.manual_move(coord, self.settings.speed)?;
        }
        coord[axis] = Some(target);
        toolhead.manual_move(coord, self.settings.speed)
    }

    fn report_status<H>(&mut self, ctx: &mut ProbeContext<'_, H>, prev: Option<f64>) {
        let pos = self.cache.get_kinematics_pos(ctx.toolhead)[self.settings.axis.index()];
        if prev == Some(pos) {
            warn!("probe position unchanged at {:.6}", pos);
            ctx.gcode
                .respond_info("WARNING: No change in position (reached stepper resolution)");
        }
        let pp = &self.past_positions;
        let mut next_pos = pp.partition_point(|&p| p < pos);
        let prev_pos = next_pos.checked_sub(1);
        if next_pos < pp.len() && pp[next_pos] == pos {
            next_pos += 1;
        }
        let lower = prev_pos.map(|i| pp[i]);
        let upper = pp.get(next_pos).copied();
        ctx.status.update(pos, lower, upper);

        let fmt = |v: Option<f64>| v.map_or_else(|| UNKNOWN_POSITION.to_string(), |v| format!("{:.3}", v));
        ctx.gcode.respond_info(&format!(
            "{} position: {} --> {:.3} <-- {}",
            self.settings.axis.letter(),
            fmt(lower),
            pos,
            fmt(upper)
        ));
    }

    fn cmd_accept<H: Copy + 'static>(&mut self, ctx: &mut ProbeContext<'_, H>) {
        let axis = self.settings.axis.index();
        let pos = ctx.toolhead.get_position();
        let start = self.start_position;
        let others_match = (0..pos.len()).filter(|&i| i != axis).all(|i| pos[i] == start[i]);
        if !others_match || pos[axis] >= start[axis] {
            ctx.gcode.respond_info(&format!(
                "Belt probe failed! Use TEST{} commands to position the\nnozzle prior to running ACCEPT.",
                self.settings.axis.letter()
            ));
            self.finalize(false, ctx);
            return;
        }
        self.finalize(true, ctx);
    }

    fn cmd_abort<H: Copy + 'static>(&mut self, ctx: &mut ProbeContext<'_, H>) {
        self.finalize(false, ctx);
    }

    /// Ends the session. Only the first call has an effect.
    pub fn finalize<H: Copy + 'static>(&mut self, success: bool, ctx: &mut ProbeContext<'_, H>) {
        if self.state == SessionState::Finalized {
            debug!("probe session already finalized");
            return;
        }
        self.state = SessionState::Finalized;
        ctx.status.reset();
        for (name, _, _) in self.command_names() {
            ctx.gcode.unregister_command(&name);
        }
        let kin_pos = if success {
            Some(self.cache.get_kinematics_pos(ctx.toolhead))
        } else {
            None
        };
        info!("probe session finished, result {:?}", kin_pos);
        if let Some(callback) = self.finalize_callback.take() {
            callback(kin_pos, &mut *ctx.gcode);
        }
        self.lease.release();
    }
}
