use crate::{
    capture::CaptureError,
    network::{configurator::AssignError, frame::FrameError, LinkError},
};
use dhcproto::{error::EncodeError, v4::MessageType};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Capture operation failed")]
    Capture(#[from] CaptureError),

    #[error("Link address lookup failed")]
    Link(#[from] LinkError),

    #[error("Failed to build broadcast frame")]
    Frame(#[from] FrameError),

    #[error("Failed to encode DHCP message")]
    Encode(#[from] EncodeError),

    #[error("Timed out in {state} state waiting for DHCP {expected}")]
    Timeout {
        state: &'static str,
        expected: &'static str,
    },

    #[error("Unhandled message type {got:?} in {state} state")]
    UnexpectedMessageType {
        state: &'static str,
        got: Option<MessageType>,
    },

    #[error("Offer carries no server identifier")]
    MissingServerIdentifier,

    #[error("Subnet mask {0} is not contiguous")]
    InvalidSubnetMask(Ipv4Addr),

    #[error("Failed to assign leased address")]
    Assign(#[from] AssignError),

    #[error("State machine reached a critical failure: {0}")]
    Critical(String),
}

impl ClientError {
    /// True for the two terminal handshake failures (as opposed to resource
    /// or codec errors).
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout { .. } | ClientError::UnexpectedMessageType { .. }
        )
    }
}
