use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{MachineCommand, ACK_LEN, FRAME_HEADER};

/// Framing for a byte-stream link to the launcher.
///
/// Encodes [MachineCommand]s. Decoding only finds frame boundaries: it yields
/// raw [ACK_LEN]-byte candidates starting at a frame header and leaves
/// validation to [crate::AckFrame::from_bytes], so that corrupt frames can be
/// reported by the caller instead of ending the stream.
#[derive(Default)]
pub struct LauncherCodec {
    in_sync: bool,
}

impl LauncherCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_HEADER.len())
        .position(|w| w == FRAME_HEADER)
}

impl Decoder for LauncherCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match find_header(&src[..]) {
            Some(0) => {}
            Some(idx) => {
                if self.in_sync {
                    tracing::warn!("lost sync, skipping {idx} bytes");
                    self.in_sync = false;
                }
                src.advance(idx);
            }
            None => {
                // Keep a trailing first header byte, it may be the start of
                // the next frame.
                let keep = usize::from(src[src.len() - 1] == FRAME_HEADER[0]);
                let skip = src.len() - keep;
                if skip > 0 {
                    tracing::debug!("no frame header, skipping {skip} bytes");
                    self.in_sync = false;
                    src.advance(skip);
                }
                return Ok(None);
            }
        }
        if src.remaining() < ACK_LEN {
            return Ok(None);
        }
        self.in_sync = true;
        Ok(Some(src.split_to(ACK_LEN).freeze()))
    }
}

impl Encoder<MachineCommand> for LauncherCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: MachineCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&item.to_bytes()[..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AckFrame, Control, ResponseCode};

    #[test]
    fn encode_command() -> eyre::Result<()> {
        let mut codec = LauncherCodec::new();
        let mut buf = BytesMut::new();
        let cmd = MachineCommand::new(50, 50, 45, 45, 50, Control::Launch);
        codec.encode(cmd, &mut buf)?;
        assert_eq!(&buf[..], &cmd.to_bytes()[..]);
        Ok(())
    }

    #[test]
    fn decode_split_frames() -> eyre::Result<()> {
        let mut codec = LauncherCodec::new();
        let accepted = AckFrame::new(ResponseCode::Accepted).to_bytes();
        let completed = AckFrame::new(ResponseCode::Completed).to_bytes();

        let mut buf = BytesMut::new();
        buf.put_slice(&accepted[..3]);
        assert_eq!(codec.decode(&mut buf)?, None);
        buf.put_slice(&accepted[3..]);
        buf.put_slice(&completed);

        let first = codec.decode(&mut buf)?.unwrap();
        assert_eq!(AckFrame::from_bytes(&first)?.response_code(), ResponseCode::Accepted);
        let second = codec.decode(&mut buf)?.unwrap();
        assert_eq!(
            AckFrame::from_bytes(&second)?.response_code(),
            ResponseCode::Completed
        );
        assert_eq!(codec.decode(&mut buf)?, None);
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn resync_after_garbage() -> eyre::Result<()> {
        let mut codec = LauncherCodec::new();
        let accepted = AckFrame::new(ResponseCode::Accepted).to_bytes();

        let mut buf = BytesMut::new();
        buf.put_slice(&[0x00, 0x13, 0x5A]);
        assert_eq!(codec.decode(&mut buf)?, None);
        // the dangling header byte is retained
        assert_eq!(&buf[..], &[0x5A]);

        buf.put_slice(&accepted[1..]);
        let frame = codec.decode(&mut buf)?.unwrap();
        assert_eq!(&frame[..], &accepted[..]);
        Ok(())
    }

    #[test]
    fn corrupt_frame_is_still_delimited() -> eyre::Result<()> {
        let mut codec = LauncherCodec::new();
        let mut corrupt = AckFrame::new(ResponseCode::Accepted).to_bytes();
        corrupt[4] ^= 0xFF;

        let mut buf = BytesMut::from(&corrupt[..]);
        let frame = codec.decode(&mut buf)?.unwrap();
        assert!(AckFrame::from_bytes(&frame).is_err());
        Ok(())
    }
}
