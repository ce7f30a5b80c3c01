use serde::{Deserialize, Serialize};

use crate::{check_frame, checksum_byte, FrameError, COMMAND_LEN, COMMAND_TYPE, FRAME_HEADER};

/// Ball speed at which both wheels run at 100%.
pub const MAX_SPEED_MPH: f64 = 80.0;
/// Feed rate used when the operator does not choose one.
pub const DEFAULT_FEED_PERCENT: u8 = 50;
/// Upper limit of the pitch and yaw fields.
pub const MAX_AIM_DEGREES: u8 = 90;

const MAX_PERCENT: u8 = 100;

/// Wheel gain on the driving wheel per unit of spin.
const SPIN_BOOST_PER_UNIT: f64 = 0.5;
/// Wheel loss on the opposite wheel per unit of spin.
const SPIN_CUT_PER_UNIT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Control {
    Stop = 0,
    Launch = 1,
}

/// Spin applied by running the two wheels at different speeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpinMode {
    #[default]
    Flat,
    Topspin,
    ExtremeTopspin,
    Backspin,
    ExtremeBackspin,
}

impl SpinMode {
    /// Signed spin code. Positive is topspin, negative is backspin.
    pub fn code(&self) -> i8 {
        match self {
            SpinMode::Flat => 0,
            SpinMode::Topspin => 1,
            SpinMode::ExtremeTopspin => 2,
            SpinMode::Backspin => -1,
            SpinMode::ExtremeBackspin => -2,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(SpinMode::Flat),
            1 => Some(SpinMode::Topspin),
            2 => Some(SpinMode::ExtremeTopspin),
            -1 => Some(SpinMode::Backspin),
            -2 => Some(SpinMode::ExtremeBackspin),
            _ => None,
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, MAX_PERCENT as f64)
}

/// Compute `(upper, lower)` wheel percentages for a ball speed and spin.
///
/// The base percentage is `speed / 80 * 100`. Topspin speeds up the upper
/// wheel and slows the lower one; backspin does the reverse.
pub fn wheel_speeds(speed_mph: f64, spin: SpinMode) -> (u8, u8) {
    let base = clamp_percent(speed_mph / MAX_SPEED_MPH * 100.0);
    let code = spin.code() as f64;
    let boost = 1.0 + code.abs() * SPIN_BOOST_PER_UNIT;
    let cut = 1.0 - code.abs() * SPIN_CUT_PER_UNIT;

    let (upper, lower) = if code > 0.0 {
        (base * boost, base * cut)
    } else if code < 0.0 {
        (base * cut, base * boost)
    } else {
        (base, base)
    };
    (
        clamp_percent(upper).round() as u8,
        clamp_percent(lower).round() as u8,
    )
}

/// Launch head orientation in whole degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AimAngles {
    pub pitch: u8,
    pub yaw: u8,
}

impl AimAngles {
    /// Aim at a court position.
    ///
    /// `x` and `y` are normalized against the court extents into `[0, 1]` and
    /// scaled to `[0, 90]` degrees: `x` drives yaw, `y` drives pitch.
    pub fn from_court_position(x: f64, y: f64, court_width: f64, court_length: f64) -> Self {
        fn to_degrees(value: f64, extent: f64) -> u8 {
            let norm = if extent > 0.0 && value.is_finite() {
                (value / extent).clamp(0.0, 1.0)
            } else {
                0.5
            };
            let max = MAX_AIM_DEGREES as f64;
            (norm * max).round().clamp(0.0, max) as u8
        }
        Self {
            pitch: to_degrees(y, court_length),
            yaw: to_degrees(x, court_width),
        }
    }

    pub fn centered() -> Self {
        Self {
            pitch: MAX_AIM_DEGREES / 2,
            yaw: MAX_AIM_DEGREES / 2,
        }
    }
}

/// Everything the operator and the planner decide about one ball.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotParameters {
    pub speed_mph: f64,
    pub spin: SpinMode,
    pub aim: AimAngles,
    pub feed_percent: u8,
}

/// An outbound command. Immutable once built; the checksum is computed on
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MachineCommand {
    upper_wheel: u8,
    lower_wheel: u8,
    pitch: u8,
    yaw: u8,
    feed: u8,
    control: Control,
    crc: u8,
}

impl MachineCommand {
    /// Build a command. Out-of-range fields are clamped to their wire range.
    pub fn new(
        upper_wheel: u8,
        lower_wheel: u8,
        pitch: u8,
        yaw: u8,
        feed: u8,
        control: Control,
    ) -> Self {
        let mut result = Self {
            upper_wheel: upper_wheel.min(MAX_PERCENT),
            lower_wheel: lower_wheel.min(MAX_PERCENT),
            pitch: pitch.min(MAX_AIM_DEGREES),
            yaw: yaw.min(MAX_AIM_DEGREES),
            feed: feed.min(MAX_PERCENT),
            control,
            crc: 0,
        };
        result.crc = checksum_byte(&result.body());
        result
    }

    pub fn for_shot(shot: &ShotParameters) -> Self {
        let (upper, lower) = wheel_speeds(shot.speed_mph, shot.spin);
        Self::new(
            upper,
            lower,
            shot.aim.pitch,
            shot.aim.yaw,
            shot.feed_percent,
            Control::Launch,
        )
    }

    /// Wheels and feed off, head centered.
    pub fn stop() -> Self {
        let aim = AimAngles::centered();
        Self::new(0, 0, aim.pitch, aim.yaw, 0, Control::Stop)
    }

    fn body(&self) -> [u8; COMMAND_LEN - 1] {
        [
            FRAME_HEADER[0],
            FRAME_HEADER[1],
            COMMAND_TYPE,
            self.upper_wheel,
            self.lower_wheel,
            self.pitch,
            self.yaw,
            self.feed,
            self.control as u8,
        ]
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_LEN] {
        let mut buf = [0u8; COMMAND_LEN];
        buf[..COMMAND_LEN - 1].copy_from_slice(&self.body());
        buf[COMMAND_LEN - 1] = self.crc;
        buf
    }

    /// Parse a command frame, as seen by the device.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        check_frame(buf, COMMAND_LEN, COMMAND_TYPE)?;
        let control = match buf[8] {
            0 => Control::Stop,
            1 => Control::Launch,
            other => return Err(FrameError::UnknownControl(other)),
        };
        Ok(Self::new(buf[3], buf[4], buf[5], buf[6], buf[7], control))
    }

    pub fn upper_wheel(&self) -> u8 {
        self.upper_wheel
    }
    pub fn lower_wheel(&self) -> u8 {
        self.lower_wheel
    }
    pub fn pitch(&self) -> u8 {
        self.pitch
    }
    pub fn yaw(&self) -> u8 {
        self.yaw
    }
    pub fn feed(&self) -> u8 {
        self.feed
    }
    pub fn control(&self) -> Control {
        self.control
    }
    pub fn crc(&self) -> u8 {
        self.crc
    }
}

impl std::fmt::Display for MachineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "launcher command:")?;
        for b in self.to_bytes().iter() {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_frame_layout() {
        let cmd = MachineCommand::new(50, 50, 45, 45, 50, Control::Launch);
        assert_eq!(
            cmd.to_bytes(),
            [0x5A, 0xA5, 0x83, 50, 50, 45, 45, 50, 1, 0x80]
        );
    }

    #[test]
    fn stop_frame() {
        let cmd = MachineCommand::stop();
        assert_eq!(cmd.control(), Control::Stop);
        assert_eq!(cmd.to_bytes(), [0x5A, 0xA5, 0x83, 0, 0, 45, 45, 0, 0, 0x69]);
    }

    #[test]
    fn fields_are_clamped() {
        let cmd = MachineCommand::new(200, 101, 91, 255, 150, Control::Launch);
        assert_eq!(cmd.upper_wheel(), 100);
        assert_eq!(cmd.lower_wheel(), 100);
        assert_eq!(cmd.pitch(), 90);
        assert_eq!(cmd.yaw(), 90);
        assert_eq!(cmd.feed(), 100);
    }

    #[test]
    fn device_side_parse() -> eyre::Result<()> {
        let cmd = MachineCommand::new(63, 63, 10, 80, 50, Control::Launch);
        let parsed = MachineCommand::from_bytes(&cmd.to_bytes())?;
        assert_eq!(parsed, cmd);

        let mut corrupted = cmd.to_bytes();
        corrupted[4] ^= 0x10;
        assert!(matches!(
            MachineCommand::from_bytes(&corrupted),
            Err(FrameError::ChecksumMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn flat_wheel_speeds() {
        assert_eq!(wheel_speeds(80.0, SpinMode::Flat), (100, 100));
        assert_eq!(wheel_speeds(40.0, SpinMode::Flat), (50, 50));
        assert_eq!(wheel_speeds(50.0, SpinMode::Flat), (63, 63));
        assert_eq!(wheel_speeds(120.0, SpinMode::Flat), (100, 100));
        assert_eq!(wheel_speeds(-5.0, SpinMode::Flat), (0, 0));
    }

    #[test]
    fn spin_wheel_differential() {
        // base 62.5%
        assert_eq!(wheel_speeds(50.0, SpinMode::Topspin), (94, 44));
        assert_eq!(wheel_speeds(50.0, SpinMode::Backspin), (44, 94));
        assert_eq!(wheel_speeds(50.0, SpinMode::ExtremeTopspin), (100, 25));
        assert_eq!(wheel_speeds(50.0, SpinMode::ExtremeBackspin), (25, 100));
        // base 25%
        assert_eq!(wheel_speeds(20.0, SpinMode::ExtremeTopspin), (50, 10));
    }

    #[test]
    fn spin_codes_round_trip() {
        for spin in [
            SpinMode::Flat,
            SpinMode::Topspin,
            SpinMode::ExtremeTopspin,
            SpinMode::Backspin,
            SpinMode::ExtremeBackspin,
        ] {
            assert_eq!(SpinMode::from_code(spin.code()), Some(spin));
        }
        assert_eq!(SpinMode::from_code(3), None);
    }

    #[test]
    fn aim_angles_from_position() {
        let (w, l) = (8.23, 11.885);
        assert_eq!(
            AimAngles::from_court_position(w / 2.0, l / 2.0, w, l),
            AimAngles { pitch: 45, yaw: 45 }
        );
        assert_eq!(
            AimAngles::from_court_position(0.0, l, w, l),
            AimAngles { pitch: 90, yaw: 0 }
        );
        // Outside the court is clamped to the edge.
        assert_eq!(
            AimAngles::from_court_position(-1.0, l + 3.0, w, l),
            AimAngles { pitch: 90, yaw: 0 }
        );
        assert_eq!(
            AimAngles::from_court_position(w * 0.2, l * 0.1, w, l),
            AimAngles { pitch: 9, yaw: 18 }
        );
    }
}
