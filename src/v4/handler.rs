//! DHCPv4 state machine implementation
//!
//! This module implements the client side of the DORA (Discover, Offer,
//! Request, Acknowledge) exchange. The handler is pure: it consumes events
//! and returns actions, leaving I/O and timing to [`crate::client::DhcpClient`].
//!
//! Exactly one Discover and one Request are produced per session and the
//! state only ever moves forward:
//!
//! ```text
//! Init -> Selecting -> Requesting -> Bound
//!            \             \
//!             +-------------+-----> Failed
//! ```

use super::message::{build_dhcp_discover, build_dhcp_request, message_type, subnet_mask};
use crate::{
    capture::CaptureError,
    client::{prefix_len, Action, DhcpStateMachine, Event, Lease},
    error::ClientError,
};
use dhcproto::v4;
use pnet::util::MacAddr;
use std::time::Duration;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DhcpV4State {
    Init,
    Selecting,
    Requesting,
    Bound,
    Failed,
}

impl DhcpV4State {
    pub fn name(self) -> &'static str {
        match self {
            DhcpV4State::Init => "Init",
            DhcpV4State::Selecting => "Selecting",
            DhcpV4State::Requesting => "Requesting",
            DhcpV4State::Bound => "Bound",
            DhcpV4State::Failed => "Failed",
        }
    }

    /// The only reply a waiting state accepts. Any other type received in
    /// that state ends the session.
    pub fn expected_reply(self) -> Option<v4::MessageType> {
        match self {
            DhcpV4State::Selecting => Some(v4::MessageType::Offer),
            DhcpV4State::Requesting => Some(v4::MessageType::Ack),
            DhcpV4State::Init | DhcpV4State::Bound | DhcpV4State::Failed => None,
        }
    }
}

pub struct DhcpV4Handler {
    state: DhcpV4State,
    mac_address: MacAddr,
    xid: u32,
    lease: Option<Lease>,
}

impl DhcpV4Handler {
    /// Creates a handler with a fresh random transaction id.
    pub fn new(mac_address: MacAddr) -> Self {
        Self::with_xid(mac_address, rand::random())
    }

    pub fn with_xid(mac_address: MacAddr, xid: u32) -> Self {
        Self {
            state: DhcpV4State::Init,
            mac_address,
            xid,
            lease: None,
        }
    }

    pub fn state(&self) -> DhcpV4State {
        self.state
    }

    fn fail(&mut self, err: ClientError) -> Result<Action, ClientError> {
        tracing::debug!("{} -> Failed: {}", self.state.name(), err);
        self.state = DhcpV4State::Failed;
        Err(err)
    }

    fn handle_init(&mut self) -> Result<Action, ClientError> {
        let discover_packet = build_dhcp_discover(self.mac_address, self.xid)?;
        self.state = DhcpV4State::Selecting;
        Ok(Action::Broadcast(discover_packet))
    }

    /// Checks a forwarded reply against the current state's expectation.
    /// `Ok(false)` means the message belongs to another transaction.
    fn expect_reply(&mut self, msg: &v4::Message) -> Result<bool, ClientError> {
        if msg.xid() != self.xid {
            tracing::debug!(
                "XID mismatch ({:#010x}, ours {:#010x}), ignoring message",
                msg.xid(),
                self.xid
            );
            return Ok(false);
        }

        let got = message_type(msg);
        if got.is_some() && got == self.state.expected_reply() {
            tracing::info!("Received message type: {:?}", got);
            return Ok(true);
        }

        let err = ClientError::UnexpectedMessageType {
            state: self.state.name(),
            got,
        };
        self.fail(err).map(|_| false)
    }

    fn handle_selecting(&mut self, offer: v4::Message) -> Result<Action, ClientError> {
        if !self.expect_reply(&offer)? {
            return Ok(Action::Wait);
        }

        tracing::info!("Received DHCP OFFER, offered IP: {}", offer.yiaddr());
        let request_packet = match build_dhcp_request(self.mac_address, self.xid, &offer) {
            Ok(packet) => packet,
            Err(e) => return self.fail(e),
        };

        self.state = DhcpV4State::Requesting;
        Ok(Action::Broadcast(request_packet))
    }

    fn handle_requesting(&mut self, ack: v4::Message) -> Result<Action, ClientError> {
        if self.lease.is_some() {
            return Err(ClientError::Critical(
                "Lease already pending assignment".to_string(),
            ));
        }
        if !self.expect_reply(&ack)? {
            return Ok(Action::Wait);
        }

        let lease = match self.extract_lease_info(&ack) {
            Ok(lease) => lease,
            Err(e) => return self.fail(e),
        };
        self.lease = Some(lease.clone());
        Ok(Action::Assign(lease))
    }

    fn handle_assigned(&mut self) -> Result<Action, ClientError> {
        match self.lease.take() {
            Some(lease) => {
                self.state = DhcpV4State::Bound;
                Ok(Action::Done(lease))
            }
            None => Err(ClientError::Critical(
                "No lease available to bind".to_string(),
            )),
        }
    }

    fn timeout(&mut self) -> Result<Action, ClientError> {
        let expected = match self.state.expected_reply() {
            Some(v4::MessageType::Offer) => "Offer",
            _ => "Ack",
        };
        let err = ClientError::Timeout {
            state: self.state.name(),
            expected,
        };
        self.fail(err)
    }

    fn extract_lease_info(&self, msg: &v4::Message) -> Result<Lease, ClientError> {
        let address = msg.yiaddr();

        let subnet_mask = subnet_mask(msg);
        let prefix_len = match subnet_mask {
            Some(mask) => prefix_len(mask).ok_or(ClientError::InvalidSubnetMask(mask))?,
            None => {
                tracing::warn!("Ack carries no subnet mask, assigning {}/32", address);
                32
            }
        };

        let routers = msg.opts().get(v4::OptionCode::Router).and_then(|opt| {
            if let v4::DhcpOption::Router(routers) = opt {
                Some(routers.clone())
            } else {
                None
            }
        });

        let dns_servers = msg
            .opts()
            .get(v4::OptionCode::DomainNameServer)
            .and_then(|opt| {
                if let v4::DhcpOption::DomainNameServer(dns) = opt {
                    Some(dns.clone())
                } else {
                    None
                }
            });

        let lease_duration = msg
            .opts()
            .get(v4::OptionCode::AddressLeaseTime)
            .and_then(|opt| {
                if let v4::DhcpOption::AddressLeaseTime(secs) = opt {
                    Some(Duration::from_secs(u64::from(*secs)))
                } else {
                    None
                }
            });

        Ok(Lease {
            address,
            subnet_mask,
            prefix_len,
            routers,
            dns_servers,
            lease_duration,
            server_identifier: super::message::server_identifier(msg),
        })
    }
}

impl DhcpStateMachine for DhcpV4Handler {
    fn state_name(&self) -> &'static str {
        self.state.name()
    }

    fn transaction_id(&self) -> u32 {
        self.xid
    }

    fn handle_event(&mut self, event: Event) -> Result<Action, ClientError> {
        tracing::debug!("Handling event {:?} in state {:?}", event, self.state);
        match (self.state, event) {
            (DhcpV4State::Init, Event::Start) => self.handle_init(),
            (DhcpV4State::Selecting, Event::Received(msg)) => self.handle_selecting(msg),
            (DhcpV4State::Requesting, Event::Received(msg)) => self.handle_requesting(msg),
            (DhcpV4State::Selecting | DhcpV4State::Requesting, Event::DeadlineElapsed) => {
                self.timeout()
            }
            (DhcpV4State::Selecting | DhcpV4State::Requesting, Event::CaptureEnded) => {
                self.fail(CaptureError::StreamEnded.into())
            }
            (DhcpV4State::Selecting | DhcpV4State::Requesting, Event::BroadcastFailed(e)) => {
                self.fail(e)
            }
            (DhcpV4State::Requesting, Event::Assigned) => self.handle_assigned(),
            (DhcpV4State::Requesting, Event::AssignFailed(e)) => {
                self.lease = None;
                self.fail(e.into())
            }
            (state, event) => Err(ClientError::Critical(format!(
                "Event {event:?} is not valid in state {}",
                state.name()
            ))),
        }
    }
}
