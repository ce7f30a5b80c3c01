use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use launcher_protocol::SpinMode;

pub mod math;
pub use math::*;

pub mod events;
pub use events::*;

pub mod homography;
pub mod planner;
pub mod position_filter;

pub mod utils;
pub use utils::{now, ChangeDetector, MyTimestamp};

pub type FloatType = f64;

/// The default unicast UDP receive port for vision and operator datagrams.
pub const UNICAST_UDP_DEFAULT_PORT: u16 = 8090;
pub const UNICAST_UDP_DEFAULT: &str = const_format::concatcp!("0.0.0.0:", UNICAST_UDP_DEFAULT_PORT);

/// Directory name prefix of a recorded session.
pub const SESSION_DIR_PREFIX: &str = "rallie";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("config value `{field}` must be positive and finite, got {value}")]
    NotPositive { field: &'static str, value: FloatType },
    #[error("config value `{field}` out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

fn check_positive(field: &'static str, value: FloatType) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

/// Everything injected into the controller at construction.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RallieConfig {
    #[serde(default)]
    pub court: CourtConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

impl RallieConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("court.width", self.court.width)?;
        check_positive("court.length", self.court.length)?;
        check_positive("court.service_line_from_net", self.court.service_line_from_net)?;
        if self.court.service_line_from_net >= self.court.length {
            return Err(ConfigError::OutOfRange {
                field: "court.service_line_from_net",
                reason: "service line must lie between net and baseline".into(),
            });
        }
        check_positive("filter.measurement_noise", self.filter.measurement_noise)?;
        check_positive("filter.process_noise", self.filter.process_noise)?;
        check_positive("filter.initial_uncertainty", self.filter.initial_uncertainty)?;
        planner::BallSpeed::new(self.planner.default_speed_mph).map_err(|e| {
            ConfigError::OutOfRange {
                field: "planner.default_speed_mph",
                reason: e.to_string(),
            }
        })?;
        planner::check_launch_interval(self.planner.default_launch_interval_secs).map_err(|e| {
            ConfigError::OutOfRange {
                field: "planner.default_launch_interval_secs",
                reason: e.to_string(),
            }
        })?;
        if self.planner.feed_percent > 100 {
            return Err(ConfigError::OutOfRange {
                field: "planner.feed_percent",
                reason: format!("{} exceeds 100", self.planner.feed_percent),
            });
        }
        check_positive("link.ack_timeout_secs", self.link.ack_timeout_secs)?;
        check_positive("link.reconnect_interval_secs", self.link.reconnect_interval_secs)?;
        Ok(())
    }
}

/// Court dimensions in meters.
///
/// Court `y` runs from the net (0) to the player's baseline (`length`), `x`
/// runs across the court from the left sideline (0) to the right (`width`).
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct CourtConfig {
    #[serde(default = "default_court_width")]
    pub width: FloatType,
    #[serde(default = "default_court_length")]
    pub length: FloatType,
    #[serde(default = "default_service_line_from_net")]
    pub service_line_from_net: FloatType,
}

fn default_court_width() -> FloatType {
    8.23 // singles
}

fn default_court_length() -> FloatType {
    11.885 // net to baseline
}

fn default_service_line_from_net() -> FloatType {
    6.40
}

impl Default for CourtConfig {
    fn default() -> Self {
        Self {
            width: default_court_width(),
            length: default_court_length(),
            service_line_from_net: default_service_line_from_net(),
        }
    }
}

impl CourtConfig {
    /// The four corners the operator taps, in tap order: net-left,
    /// net-right, baseline-right, baseline-left.
    pub fn tap_corners(&self) -> [CourtPoint; 4] {
        let (w, l) = (self.width, self.length);
        [
            CourtPoint::new(0.0, 0.0),
            CourtPoint::new(w, 0.0),
            CourtPoint::new(w, l),
            CourtPoint::new(0.0, l),
        ]
    }

    /// Reference points derived from the tapped corners: service-line left,
    /// service-line right, T-point and net-center.
    pub fn derived_references(&self) -> [CourtPoint; 4] {
        let (w, s) = (self.width, self.service_line_from_net);
        [
            CourtPoint::new(0.0, s),
            CourtPoint::new(w, s),
            CourtPoint::new(w / 2.0, s),
            CourtPoint::new(w / 2.0, 0.0),
        ]
    }

    pub fn center(&self) -> CourtPoint {
        CourtPoint::new(self.width / 2.0, self.length / 2.0)
    }
}

/// Position filter tuning.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Variance of a single position measurement [m²].
    #[serde(default = "default_measurement_noise")]
    pub measurement_noise: FloatType,
    /// Process noise spectral density of the constant-velocity model.
    #[serde(default = "default_process_noise")]
    pub process_noise: FloatType,
    /// Position and velocity variance assigned on the first measurement.
    #[serde(default = "default_initial_uncertainty")]
    pub initial_uncertainty: FloatType,
}

fn default_measurement_noise() -> FloatType {
    0.04
}

fn default_process_noise() -> FloatType {
    0.5
}

fn default_initial_uncertainty() -> FloatType {
    1.0
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            measurement_noise: default_measurement_noise(),
            process_noise: default_process_noise(),
            initial_uncertainty: default_initial_uncertainty(),
        }
    }
}

/// Planner defaults applied at startup. The operator may change all of these
/// at runtime.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PlannerConfig {
    #[serde(default)]
    pub default_mode: PlannerMode,
    #[serde(default = "default_speed_mph")]
    pub default_speed_mph: u8,
    #[serde(default)]
    pub default_spin: SpinMode,
    #[serde(default = "default_launch_interval_secs")]
    pub default_launch_interval_secs: FloatType,
    #[serde(default = "default_feed_percent")]
    pub feed_percent: u8,
    #[serde(default)]
    pub start_active: bool,
}

fn default_speed_mph() -> u8 {
    50
}

fn default_launch_interval_secs() -> FloatType {
    5.0
}

fn default_feed_percent() -> u8 {
    launcher_protocol::DEFAULT_FEED_PERCENT
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_mode: PlannerMode::default(),
            default_speed_mph: default_speed_mph(),
            default_spin: SpinMode::default(),
            default_launch_interval_secs: default_launch_interval_secs(),
            feed_percent: default_feed_percent(),
            start_active: false,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Serial device of the radio bridge, e.g. `/dev/ttyUSB0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_path: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: FloatType,
    /// Delay between scans while disconnected.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: FloatType,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_ack_timeout_secs() -> FloatType {
    launcher_link::DEFAULT_ACK_TIMEOUT.as_secs_f64()
}

fn default_reconnect_interval_secs() -> FloatType {
    2.0
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_path: None,
            baud_rate: default_baud_rate(),
            ack_timeout_secs: default_ack_timeout_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
        }
    }
}

impl LinkConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.ack_timeout_secs).unwrap_or(launcher_link::DEFAULT_ACK_TIMEOUT)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.reconnect_interval_secs)
            .unwrap_or(Duration::from_secs(2))
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CalibrationConfig {
    /// Image coordinates of the four tapped court corners, applied at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taps: Option<[[FloatType; 2]; 4]>,
}
