use serde::{Deserialize, Serialize};

use launcher_link::{CommandError, LinkState};
use launcher_protocol::{ResponseCode, SpinMode};

use crate::{CourtPoint, FloatType};

/// How the planner chooses targets.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlannerMode {
    /// The operator names each target.
    Manual,
    /// Targets follow the tracked player.
    #[default]
    Interactive,
}

/// A message sent to the controller to change its settings or fire a ball.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub enum OperatorCommand {
    SetMode(PlannerMode),
    SetSpeed(u8),
    SetSpin(SpinMode),
    SetLaunchInterval(FloatType),
    SetActive(bool),
    /// Fire once at a court position. Manual mode only.
    ManualShot { x: FloatType, y: FloatType },
    /// Deactivate and send the stop frame.
    Stop,
}

/// What became of the most recent command.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub enum CommandOutcome {
    /// Written, waiting for the device.
    Pending,
    Acknowledged(ResponseCode),
    Failed(CommandError),
    /// Refused before reaching the wire.
    NotSent { reason: String },
}

/// Read-only view of the planner settings.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct PlannerSnapshot {
    pub mode: PlannerMode,
    pub speed_mph: u8,
    pub spin: SpinMode,
    pub launch_interval_secs: FloatType,
    pub averaging_window_secs: FloatType,
    pub active: bool,
    pub last_zone: Option<u8>,
    pub last_outcome: Option<CommandOutcome>,
    pub commands_sent: u64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub enum CalibrationStatus {
    Uncalibrated,
    /// Mean reprojection residual of the fit, in meters.
    Calibrated { residual_m: FloatType },
    Failed { reason: String },
}

/// Snapshot published to observers after every controller event.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct LauncherStatus {
    pub link_state: LinkState,
    pub planner: PlannerSnapshot,
    pub calibration: CalibrationStatus,
    /// Latest smoothed player position.
    pub position: Option<CourtPoint>,
}
