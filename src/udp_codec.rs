use thiserror::Error;

use bytes::{buf::Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::UdpMsg;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("cbor error {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
}

/// One CBOR-encoded [UdpMsg] per datagram.
///
/// Decodes messages from the vision source and the operator UI. Encoding is
/// used by senders, including the tests.
#[derive(Default)]
pub(crate) struct RallieUdpCodec {}

impl Decoder for RallieUdpCodec {
    type Item = UdpMsg;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let result = serde_cbor::from_slice(&buf[..]);
        // A datagram is decoded whole, good or bad, so never look at it again.
        buf.advance(buf.remaining());
        Ok(Some(result?))
    }
}

// We encode `T` and not `&T` because we do not want to deal with
// the lifetime issues (this is used in async contexts.)
impl Encoder<UdpMsg> for RallieUdpCodec {
    type Error = Error;
    fn encode(&mut self, msg: UdpMsg, final_buf: &mut BytesMut) -> Result<(), Self::Error> {
        let v = serde_cbor::to_vec(&msg)?;
        final_buf.extend_from_slice(v.as_slice());
        Ok(())
    }
}
