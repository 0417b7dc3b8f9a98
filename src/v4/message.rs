use dhcproto::{
    v4::{self, OptionCode},
    Encodable as _, Encoder,
};
use pnet::util::MacAddr;
use std::net::Ipv4Addr;

use crate::error::ClientError;

/// Options requested from the server in both Discover and Request.
const PARAMETER_REQUEST_LIST: [OptionCode; 4] = [
    OptionCode::SubnetMask,       // 1
    OptionCode::Router,           // 3
    OptionCode::DomainNameServer, // 6
    OptionCode::DomainName,       // 15
];

/// Client Identifier (Option 61): htype 1 (Ethernet) followed by the MAC.
fn client_identifier(mac_addr: MacAddr) -> Vec<u8> {
    let mut client_id = Vec::with_capacity(7);
    client_id.push(1);
    client_id.extend_from_slice(&mac_addr.octets());
    client_id
}

fn encode(msg: &v4::Message) -> Result<Vec<u8>, ClientError> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer);
    msg.encode(&mut encoder)?;
    Ok(buffer)
}

/// Starts a broadcast BootRequest carrying the common client fields.
fn client_message(mac_addr: MacAddr, xid: u32, msg_type: v4::MessageType) -> v4::Message {
    let mut msg = v4::Message::default();
    msg.set_opcode(v4::Opcode::BootRequest)
        .set_chaddr(&mac_addr.octets())
        .set_htype(v4::HType::Eth)
        .set_hops(0)
        .set_xid(xid)
        .set_secs(0)
        // No address yet, replies must be broadcast.
        .set_flags(v4::Flags::default().set_broadcast());

    msg.opts_mut().insert(v4::DhcpOption::MessageType(msg_type));
    msg.opts_mut()
        .insert(v4::DhcpOption::ClientIdentifier(client_identifier(mac_addr)));
    msg.opts_mut().insert(v4::DhcpOption::ParameterRequestList(
        PARAMETER_REQUEST_LIST.to_vec(),
    ));
    msg
}

/// Constructs a DHCP Discover message.
pub fn build_dhcp_discover(mac_addr: MacAddr, xid: u32) -> Result<Vec<u8>, ClientError> {
    encode(&client_message(mac_addr, xid, v4::MessageType::Discover))
}

/// Constructs the DHCP Request answering `offer`.
///
/// The request keeps the session's `xid`, asks for the offered address and
/// names the offering server, which therefore must have identified itself.
pub fn build_dhcp_request(
    mac_addr: MacAddr,
    xid: u32,
    offer: &v4::Message,
) -> Result<Vec<u8>, ClientError> {
    let server_id = server_identifier(offer).ok_or(ClientError::MissingServerIdentifier)?;

    let mut msg = client_message(mac_addr, xid, v4::MessageType::Request);
    // Client IP stays 0.0.0.0 until the lease is bound.
    msg.set_ciaddr(Ipv4Addr::UNSPECIFIED);
    msg.opts_mut()
        .insert(v4::DhcpOption::RequestedIpAddress(offer.yiaddr()));
    msg.opts_mut()
        .insert(v4::DhcpOption::ServerIdentifier(server_id));
    encode(&msg)
}

/// DHCP Message Type (Option 53), if present.
pub fn message_type(msg: &v4::Message) -> Option<v4::MessageType> {
    match msg.opts().get(OptionCode::MessageType) {
        Some(v4::DhcpOption::MessageType(msg_type)) => Some(*msg_type),
        _ => None,
    }
}

pub fn server_identifier(msg: &v4::Message) -> Option<Ipv4Addr> {
    match msg.opts().get(OptionCode::ServerIdentifier) {
        Some(v4::DhcpOption::ServerIdentifier(ip)) => Some(*ip),
        _ => None,
    }
}

pub fn subnet_mask(msg: &v4::Message) -> Option<Ipv4Addr> {
    match msg.opts().get(OptionCode::SubnetMask) {
        Some(v4::DhcpOption::SubnetMask(mask)) => Some(*mask),
        _ => None,
    }
}
