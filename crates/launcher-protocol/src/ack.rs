use serde::{Deserialize, Serialize};

use crate::{check_frame, checksum_byte, FrameError, ACK_LEN, ACK_TYPE, FRAME_HEADER};

/// Device verdict on the last command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseCode {
    Rejected = 0,
    /// Accepted, execution started.
    Accepted = 1,
    Completed = 2,
}

impl ResponseCode {
    /// Accepted and Completed both count as success.
    pub fn is_success(&self) -> bool {
        !matches!(self, ResponseCode::Rejected)
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = FrameError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseCode::Rejected),
            1 => Ok(ResponseCode::Accepted),
            2 => Ok(ResponseCode::Completed),
            other => Err(FrameError::UnknownResponseCode(other)),
        }
    }
}

/// An inbound acknowledgement: `[0x5A, 0xA5, 0x82, code, crc]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    response_code: ResponseCode,
    crc: u8,
}

impl AckFrame {
    pub fn new(response_code: ResponseCode) -> Self {
        let body = [FRAME_HEADER[0], FRAME_HEADER[1], ACK_TYPE, response_code as u8];
        Self {
            response_code,
            crc: checksum_byte(&body),
        }
    }

    /// Validate length, header and checksum, then decode the response code.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        check_frame(buf, ACK_LEN, ACK_TYPE)?;
        let response_code = ResponseCode::try_from(buf[3])?;
        Ok(Self {
            response_code,
            crc: buf[4],
        })
    }

    pub fn to_bytes(&self) -> [u8; ACK_LEN] {
        [
            FRAME_HEADER[0],
            FRAME_HEADER[1],
            ACK_TYPE,
            self.response_code as u8,
            self.crc,
        ]
    }

    pub fn response_code(&self) -> ResponseCode {
        self.response_code
    }

    pub fn crc(&self) -> u8 {
        self.crc
    }
}
