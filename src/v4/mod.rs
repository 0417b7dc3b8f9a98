//! DHCPv4 protocol implementation
//!
//! This module contains the DHCPv4-specific implementation including:
//! - Message construction
//! - State machine handling
//! - The listener that feeds replies to the state machine

pub mod handler;
pub mod listener;
pub mod message;

#[cfg(test)]
mod tests;

pub use handler::{DhcpV4Handler, DhcpV4State};
pub use listener::{accept, Listener, Rejection};
pub use message::{build_dhcp_discover, build_dhcp_request};
