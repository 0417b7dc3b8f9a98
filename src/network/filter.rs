//! Inbound frame filtering.
//!
//! The capture sees everything on the link, including our own broadcasts.
//! Only a complete Ethernet/IPv4/UDP/DHCP stack sent from the server port to
//! the client port is passed on; anything else is rejected with a reason the
//! listener logs before moving to the next frame.

use bytes::Bytes;
use pnet::packet::{
    ethernet::{EtherTypes, EthernetPacket},
    ip::IpNextHeaderProtocols,
    ipv4::Ipv4Packet,
    udp::UdpPacket,
    Packet,
};
use thiserror::Error;

use super::frame::{ETHERNET_HEADER_LEN, IPV4_HEADER_LEN, UDP_HEADER_LEN};
use crate::config::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT};

/// Why a frame is not a DHCP reply. A reply must decode into exactly four
/// layers: link, network, transport and DHCP.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterError {
    #[error("Frame decoded {found} of 4 layers")]
    Incomplete { found: usize },

    #[error("Malformed {0} header")]
    Malformed(&'static str),

    #[error("UDP ports {src}->{dst} are not server->client")]
    PortMismatch { src: u16, dst: u16 },
}

/// Returns the DHCP payload of `frame` if it is a server-to-client reply.
///
/// The returned bytes share `frame`'s buffer.
pub fn parse(frame: &Bytes) -> Result<Bytes, FilterError> {
    let ethernet = EthernetPacket::new(frame).ok_or(FilterError::Incomplete { found: 0 })?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return Err(FilterError::Incomplete { found: 1 });
    }

    let ip = Ipv4Packet::new(ethernet.payload()).ok_or(FilterError::Incomplete { found: 1 })?;
    let ip_header_len = usize::from(ip.get_header_length()) * 4;
    if ip.get_version() != 4
        || ip_header_len < IPV4_HEADER_LEN
        || ip_header_len > ethernet.payload().len()
    {
        return Err(FilterError::Malformed("ipv4"));
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return Err(FilterError::Incomplete { found: 2 });
    }

    let udp_start = ETHERNET_HEADER_LEN + ip_header_len;
    let datagram =
        UdpPacket::new(&frame[udp_start..]).ok_or(FilterError::Incomplete { found: 2 })?;
    let udp_len = usize::from(datagram.get_length());
    if udp_len < UDP_HEADER_LEN {
        return Err(FilterError::Malformed("udp"));
    }

    let payload_start = udp_start + UDP_HEADER_LEN;
    let payload_end = (udp_start + udp_len).min(frame.len());
    if payload_end <= payload_start {
        return Err(FilterError::Incomplete { found: 3 });
    }

    let (src, dst) = (datagram.get_source(), datagram.get_destination());
    if src != DHCP_SERVER_PORT || dst != DHCP_CLIENT_PORT {
        return Err(FilterError::PortMismatch { src, dst });
    }

    Ok(frame.slice(payload_start..payload_end))
}
