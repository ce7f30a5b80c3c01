//! Wire format of the ball launcher link.
//!
//! Outbound commands are 10-byte frames, inbound acknowledgements are 5-byte
//! frames. Both start with the `0x5A 0xA5` header, carry a type byte and end
//! with the low byte of a CRC16/MODBUS over everything before it.

use thiserror::Error;

pub mod checksum;
pub use checksum::{checksum_byte, crc16_modbus};

mod ack;
pub use ack::{AckFrame, ResponseCode};

mod command;
pub use command::{
    wheel_speeds, AimAngles, Control, MachineCommand, ShotParameters, SpinMode, DEFAULT_FEED_PERCENT,
    MAX_AIM_DEGREES, MAX_SPEED_MPH,
};

mod codec;
pub use codec::LauncherCodec;

/// First two bytes of every frame in both directions.
pub const FRAME_HEADER: [u8; 2] = [0x5A, 0xA5];
/// Type byte of an outbound command.
pub const COMMAND_TYPE: u8 = 0x83;
/// Type byte of an inbound acknowledgement.
pub const ACK_TYPE: u8 = 0x82;
/// Total length of an outbound command frame, checksum included.
pub const COMMAND_LEN: usize = 10;
/// Total length of an inbound acknowledgement frame, checksum included.
pub const ACK_LEN: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("wrong frame length, expected {expected}, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("bad frame header {actual:02X?}")]
    BadHeader { actual: [u8; 3] },
    #[error("unknown response code {0}")]
    UnknownResponseCode(u8),
    #[error("unknown control value {0}")]
    UnknownControl(u8),
    #[error("checksum mismatch, expected {expected:#04X}, got {actual:#04X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

impl FrameError {
    /// True for structural problems (length, header, code), false for a
    /// checksum failure on an otherwise well-formed frame.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, FrameError::ChecksumMismatch { .. })
    }
}

/// Check length, header and checksum of a raw frame.
fn check_frame(buf: &[u8], expected_len: usize, frame_type: u8) -> Result<(), FrameError> {
    if buf.len() != expected_len {
        return Err(FrameError::WrongLength {
            expected: expected_len,
            actual: buf.len(),
        });
    }
    if buf[..2] != FRAME_HEADER || buf[2] != frame_type {
        return Err(FrameError::BadHeader {
            actual: [buf[0], buf[1], buf[2]],
        });
    }
    checksum::verify_trailing_checksum(buf)
        .map_err(|(expected, actual)| FrameError::ChecksumMismatch { expected, actual })
}
