//! Link-level plumbing around the handshake: hardware address lookup,
//! broadcast frame construction, inbound frame filtering and applying the
//! leased address to the interface.

pub mod configurator;
pub mod filter;
pub mod frame;

use pnet::util::MacAddr;
use std::{
    io,
    num::ParseIntError,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::fs;

const SYSFS_NET: &str = "/sys/class/net";

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to read hardware address from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse MAC address: {0}")]
    MacParse(String),
}

/// Looks up the hardware (MAC) address of `interface` from sysfs.
pub async fn link_address(interface: &str) -> Result<MacAddr, LinkError> {
    link_address_in(Path::new(SYSFS_NET), interface).await
}

/// Same as [`link_address`] with an explicit sysfs network root.
pub async fn link_address_in(root: &Path, interface: &str) -> Result<MacAddr, LinkError> {
    let path = root.join(interface).join("address");
    let mac_str = fs::read_to_string(&path)
        .await
        .map_err(|source| LinkError::Read { path, source })?;
    parse_mac_address(mac_str.trim())
}

/// Parses a MAC address string (e.g., "0a:1b:2c:3d:4e:5f").
pub fn parse_mac_address(mac_str: &str) -> Result<MacAddr, LinkError> {
    let octets = mac_str
        .split(':')
        .map(|byte_str| u8::from_str_radix(byte_str, 16))
        .collect::<Result<Vec<u8>, ParseIntError>>()
        .map_err(|e| LinkError::MacParse(format!("{mac_str}: {e}")))?;

    match octets[..] {
        [a, b, c, d, e, f] => Ok(MacAddr::new(a, b, c, d, e, f)),
        _ => Err(LinkError::MacParse(format!(
            "{mac_str}: expected 6 octets, found {}",
            octets.len()
        ))),
    }
}
