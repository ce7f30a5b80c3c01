use color_eyre::eyre::{self, Result};
use tokio_util::udp::UdpFramed;
use tracing as log;

use crate::udp_codec::RallieUdpCodec;

/// Open UDP socket for [RallieUdpCodec] messages from the network.
///
/// The opened socket receives unicast messages from the vision source and
/// from the operator UI.
pub(crate) async fn setup_udp<A>(udp_addr: A) -> Result<UdpFramed<RallieUdpCodec>>
where
    A: tokio::net::ToSocketAddrs + std::fmt::Display + Clone,
{
    use eyre::WrapErr;

    let udp_socket = tokio::net::UdpSocket::bind(udp_addr.clone())
        .await
        .with_context(|| format!("When binding UDP address \"{}\"", udp_addr))?;

    let udp_src_addr = udp_socket.local_addr()?;
    if udp_src_addr.ip().is_unspecified() {
        log::info!("Using unspecified unicast UDP for listening {udp_src_addr}");
    } else {
        log::info!("Using unicast UDP for listening {udp_src_addr}");
    }

    Ok(UdpFramed::new(udp_socket, RallieUdpCodec::default()))
}
