//! Shot planning.
//!
//! In interactive mode the planner keeps a short buffer of smoothed player
//! positions and, once per launch interval, aims at their mean. In manual
//! mode the operator names each target. Either way commands go out through a
//! [`CommandSink`] and the planner keeps the resulting completion to report
//! the outcome.

use std::collections::VecDeque;

use thiserror::Error;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info, warn};

use launcher_link::{CommandError, CommandSink, Completion, SendError};
use launcher_protocol::{AimAngles, MachineCommand, ShotParameters, SpinMode};

use crate::{
    mean_point, CommandOutcome, CourtConfig, CourtPoint, FloatType, PlannerConfig, PlannerMode,
    PlannerSnapshot,
};

/// Oldest sample the buffer ever holds, relative to the newest.
pub const BUFFER_HORIZON_SECS: FloatType = 3.0;
/// Hard cap on buffered samples regardless of their timestamps.
const MAX_BUFFERED_SAMPLES: usize = 1024;

/// Averaging window as a fraction of the launch interval.
pub const AVERAGING_WINDOW_FRACTION: FloatType = 0.5;
/// Upper limit of the averaging window.
pub const AVERAGING_WINDOW_CAP_SECS: FloatType = BUFFER_HORIZON_SECS;

pub const MIN_LAUNCH_INTERVAL_SECS: FloatType = 2.0;
pub const MAX_LAUNCH_INTERVAL_SECS: FloatType = 9.0;

pub const MIN_SPEED_MPH: u8 = 20;
pub const MAX_SPEED_MPH: u8 = 80;
pub const SPEED_STEP_MPH: u8 = 10;

/// Zones per court side.
pub const ZONE_GRID: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("ball speed {0} mph is not one of 20, 30, .. 80")]
    InvalidSpeed(u8),
    #[error("launch interval {0} s outside 2..=9 s")]
    InvalidLaunchInterval(FloatType),
    #[error("not available in {0:?} mode")]
    WrongMode(PlannerMode),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// A ball speed the launcher supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BallSpeed(u8);

impl BallSpeed {
    pub fn new(mph: u8) -> Result<Self, PlannerError> {
        if (MIN_SPEED_MPH..=MAX_SPEED_MPH).contains(&mph) && mph % SPEED_STEP_MPH == 0 {
            Ok(Self(mph))
        } else {
            Err(PlannerError::InvalidSpeed(mph))
        }
    }

    pub fn mph(&self) -> u8 {
        self.0
    }
}

pub fn check_launch_interval(secs: FloatType) -> Result<FloatType, PlannerError> {
    if (MIN_LAUNCH_INTERVAL_SECS..=MAX_LAUNCH_INTERVAL_SECS).contains(&secs) {
        Ok(secs)
    } else {
        Err(PlannerError::InvalidLaunchInterval(secs))
    }
}

/// `min(interval × AVERAGING_WINDOW_FRACTION, AVERAGING_WINDOW_CAP_SECS)`
pub fn averaging_window(launch_interval_secs: FloatType) -> FloatType {
    (launch_interval_secs * AVERAGING_WINDOW_FRACTION).min(AVERAGING_WINDOW_CAP_SECS)
}

/// Coarse 4×4 cell of the court, `row * 4 + col`, rows counted from the
/// net. `None` outside the court.
pub fn zone_of(p: &CourtPoint, court: &CourtConfig) -> Option<u8> {
    if !(0.0..=court.width).contains(&p.x) || !(0.0..=court.length).contains(&p.y) {
        return None;
    }
    let cell = |v: FloatType, extent: FloatType| {
        ((v / extent * ZONE_GRID as FloatType) as usize).min(ZONE_GRID - 1)
    };
    let col = cell(p.x, court.width);
    let row = cell(p.y, court.length);
    Some((row * ZONE_GRID + col) as u8)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub point: CourtPoint,
    /// Seconds, on the clock of the vision source.
    pub timestamp: FloatType,
}

pub struct CommandPlanner {
    court: CourtConfig,
    mode: PlannerMode,
    speed: BallSpeed,
    spin: SpinMode,
    launch_interval: FloatType,
    averaging_window: FloatType,
    feed_percent: u8,
    active: bool,
    buffer: VecDeque<PositionSample>,
    last_send: Option<FloatType>,
    last_zone: Option<u8>,
    in_flight: Option<Completion>,
    last_outcome: Option<CommandOutcome>,
    commands_sent: u64,
}

impl CommandPlanner {
    pub fn new(court: CourtConfig, cfg: &PlannerConfig) -> Result<Self, PlannerError> {
        let speed = BallSpeed::new(cfg.default_speed_mph)?;
        let launch_interval = check_launch_interval(cfg.default_launch_interval_secs)?;
        Ok(Self {
            court,
            mode: cfg.default_mode,
            speed,
            spin: cfg.default_spin,
            launch_interval,
            averaging_window: averaging_window(launch_interval),
            feed_percent: cfg.feed_percent,
            active: cfg.start_active,
            buffer: VecDeque::new(),
            last_send: None,
            last_zone: None,
            in_flight: None,
            last_outcome: None,
            commands_sent: 0,
        })
    }

    pub fn mode(&self) -> PlannerMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn averaging_window(&self) -> FloatType {
        self.averaging_window
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn set_mode(&mut self, mode: PlannerMode) {
        if mode != self.mode {
            info!("planner mode {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
        self.buffer.clear();
    }

    pub fn set_speed(&mut self, mph: u8) -> Result<(), PlannerError> {
        self.speed = BallSpeed::new(mph)?;
        Ok(())
    }

    pub fn set_spin(&mut self, spin: SpinMode) {
        self.spin = spin;
    }

    pub fn set_launch_interval(&mut self, secs: FloatType) -> Result<(), PlannerError> {
        self.launch_interval = check_launch_interval(secs)?;
        self.averaging_window = averaging_window(self.launch_interval);
        debug!(
            "launch interval {} s, averaging window {} s",
            self.launch_interval, self.averaging_window
        );
        Ok(())
    }

    pub fn set_active(&mut self, active: bool) {
        if active != self.active {
            info!("planner {}", if active { "activated" } else { "deactivated" });
        }
        self.active = active;
    }

    fn prune(&mut self, now: FloatType) {
        let horizon = self.averaging_window.min(BUFFER_HORIZON_SECS);
        while let Some(front) = self.buffer.front() {
            if now - front.timestamp > horizon || self.buffer.len() > MAX_BUFFERED_SAMPLES {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }

    /// A timestamp older than anything seen means the vision source
    /// restarted. Samples and pacing from the old clock are meaningless then.
    fn restart_if_clock_reset(&mut self, timestamp: FloatType) {
        let newest = self
            .buffer
            .back()
            .map(|s| s.timestamp)
            .into_iter()
            .chain(self.last_send)
            .fold(FloatType::NEG_INFINITY, FloatType::max);
        if timestamp < newest {
            info!("vision clock went back from {newest} s to {timestamp} s, restarting pacing");
            self.buffer.clear();
            self.last_send = None;
        }
    }

    /// Mean of the buffered positions.
    pub fn estimate(&self) -> Option<CourtPoint> {
        mean_point(self.buffer.iter().map(|s| &s.point))
    }

    fn shot_at(&self, target: &CourtPoint) -> MachineCommand {
        let aim = AimAngles::from_court_position(
            target.x,
            target.y,
            self.court.width,
            self.court.length,
        );
        MachineCommand::for_shot(&ShotParameters {
            speed_mph: self.speed.mph() as FloatType,
            spin: self.spin,
            aim,
            feed_percent: self.feed_percent,
        })
    }

    fn submit<S: CommandSink>(
        &mut self,
        sink: &mut S,
        cmd: MachineCommand,
    ) -> Result<MachineCommand, SendError> {
        match sink.submit(cmd) {
            Ok(completion) => {
                self.in_flight = Some(completion);
                self.last_outcome = Some(CommandOutcome::Pending);
                self.commands_sent += 1;
                Ok(cmd)
            }
            Err(e) => {
                match e {
                    SendError::Busy | SendError::NotConnected => debug!("command not sent: {e}"),
                    SendError::Transport(_) => warn!("command not sent: {e}"),
                }
                self.last_outcome = Some(CommandOutcome::NotSent {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Take a smoothed position. In interactive mode this may send a
    /// command, in which case the attempt's result is returned.
    pub fn on_position<S: CommandSink>(
        &mut self,
        sample: PositionSample,
        sink: &mut S,
    ) -> Option<Result<MachineCommand, SendError>> {
        let zone = zone_of(&sample.point, &self.court);
        if zone != self.last_zone {
            debug!("player zone {:?} -> {:?}", self.last_zone, zone);
            self.last_zone = zone;
        }
        if self.mode != PlannerMode::Interactive {
            return None;
        }

        self.restart_if_clock_reset(sample.timestamp);
        self.buffer.push_back(sample);
        self.prune(sample.timestamp);

        let due = match self.last_send {
            None => true,
            Some(last) => sample.timestamp - last >= self.launch_interval,
        };
        if !self.active || !due {
            return None;
        }
        let target = self.estimate()?;
        // Stamped before sending so a refused attempt waits a full interval.
        self.last_send = Some(sample.timestamp);
        let cmd = self.shot_at(&target);
        debug!(
            "interactive shot at ({:.2}, {:.2}) from {} samples",
            target.x,
            target.y,
            self.buffer.len()
        );
        Some(self.submit(sink, cmd))
    }

    /// Fire once at an operator-chosen target.
    pub fn manual_shot<S: CommandSink>(
        &mut self,
        target: CourtPoint,
        sink: &mut S,
    ) -> Result<MachineCommand, PlannerError> {
        if self.mode != PlannerMode::Manual {
            return Err(PlannerError::WrongMode(self.mode));
        }
        let cmd = self.shot_at(&target);
        Ok(self.submit(sink, cmd)?)
    }

    /// Deactivate and send the stop frame.
    pub fn stop<S: CommandSink>(&mut self, sink: &mut S) -> Result<MachineCommand, SendError> {
        self.set_active(false);
        self.submit(sink, MachineCommand::stop())
    }

    /// Collect the outcome of the command in flight, if it has resolved.
    pub fn poll_outcome(&mut self) -> Option<CommandOutcome> {
        let completion = self.in_flight.as_mut()?;
        let outcome = match completion.try_recv() {
            Ok(Ok(code)) => CommandOutcome::Acknowledged(code),
            Ok(Err(e)) => CommandOutcome::Failed(e),
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => CommandOutcome::Failed(CommandError::Cancelled),
        };
        self.in_flight = None;
        self.last_outcome = Some(outcome.clone());
        Some(outcome)
    }

    pub fn snapshot(&self) -> PlannerSnapshot {
        PlannerSnapshot {
            mode: self.mode,
            speed_mph: self.speed.mph(),
            spin: self.spin,
            launch_interval_secs: self.launch_interval,
            averaging_window_secs: self.averaging_window,
            active: self.active,
            last_zone: self.last_zone,
            last_outcome: self.last_outcome.clone(),
            commands_sent: self.commands_sent,
        }
    }
}
