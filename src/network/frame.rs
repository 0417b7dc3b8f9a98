//! Broadcast frame construction.
//!
//! Until the handshake completes the interface has no address, so every
//! outgoing DHCP message is wrapped in a fully-addressed Ethernet/IPv4/UDP
//! frame aimed at the link and network broadcast addresses.

use pnet::packet::{
    ethernet::{EtherTypes, MutableEthernetPacket},
    ip::IpNextHeaderProtocols,
    ipv4::{self, Ipv4Flags, MutableIpv4Packet},
    udp::{self, MutableUdpPacket},
    MutablePacket,
};
use pnet::util::MacAddr;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::{
    capture::CaptureHandle,
    config::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT},
    error::ClientError,
};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Payload of {0} bytes does not fit in a single UDP datagram")]
    PayloadTooLarge(usize),

    #[error("Frame buffer too small for the {0} header")]
    BufferTooSmall(&'static str),
}

/// Addressing for one Ethernet/IPv4/UDP frame.
#[derive(Debug, Clone, Copy)]
pub struct UdpFrame {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ttl: u8,
}

impl UdpFrame {
    /// Client-to-server broadcast from a host that has no address yet.
    pub fn broadcast(src_mac: MacAddr, ttl: u8) -> Self {
        Self {
            src_mac,
            dst_mac: MacAddr::broadcast(),
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::BROADCAST,
            src_port: DHCP_CLIENT_PORT,
            dst_port: DHCP_SERVER_PORT,
            ttl,
        }
    }

    /// Serializes the headers around `payload`, filling in lengths and both
    /// checksums. The IPv4 header has no options and carries don't-fragment.
    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let udp_len = UDP_HEADER_LEN + payload.len();
        let ip_len = IPV4_HEADER_LEN + udp_len;
        let ip_total_length =
            u16::try_from(ip_len).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

        let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + ip_len];
        let mut ethernet = MutableEthernetPacket::new(&mut buffer)
            .ok_or(FrameError::BufferTooSmall("ethernet"))?;
        ethernet.set_source(self.src_mac);
        ethernet.set_destination(self.dst_mac);
        ethernet.set_ethertype(EtherTypes::Ipv4);

        let mut ip = MutableIpv4Packet::new(ethernet.payload_mut())
            .ok_or(FrameError::BufferTooSmall("ipv4"))?;
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_total_length(ip_total_length);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_ttl(self.ttl);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(self.src_ip);
        ip.set_destination(self.dst_ip);

        {
            let mut datagram = MutableUdpPacket::new(ip.payload_mut())
                .ok_or(FrameError::BufferTooSmall("udp"))?;
            datagram.set_source(self.src_port);
            datagram.set_destination(self.dst_port);
            // ip_total_length fits in u16, so does udp_len.
            datagram.set_length(udp_len as u16);
            datagram.set_payload(payload);
            let checksum =
                udp::ipv4_checksum(&datagram.to_immutable(), &self.src_ip, &self.dst_ip);
            datagram.set_checksum(checksum);
        }

        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);

        Ok(buffer)
    }
}

/// Wraps an encoded DHCP message in a broadcast frame and injects it.
pub fn send_broadcast(
    capture: &CaptureHandle,
    src_mac: MacAddr,
    ttl: u8,
    payload: &[u8],
) -> Result<(), ClientError> {
    let frame = UdpFrame::broadcast(src_mac, ttl).build(payload)?;
    capture.write_frame(&frame)?;
    tracing::debug!("Broadcast {} byte frame", frame.len());
    Ok(())
}
