//! # Linklease - A Raw-Frame DHCPv4 Client
//!
//! Linklease acquires an IPv4 address for a single network interface by running
//! the DORA (Discover, Offer, Request, Acknowledge) handshake directly over
//! raw Ethernet frames. The interface has no address yet, so the host's IP
//! stack is bypassed: broadcasts are built by hand and replies are picked out
//! of everything the link carries.
//!
//! ## Features
//!
//! - One Discover, one Request, one overall deadline
//! - Asynchronous operation using Tokio
//! - Raw capture and injection through pnet
//! - Applies the bound lease to the interface
//! - Linux only; other platforms get a no-op
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     linklease::start_with_timeout("eth0", Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod v4;

pub use client::{start, start_with_timeout, DhcpClient, Lease};
pub use config::{Args, ClientConfig};
pub use error::ClientError;
