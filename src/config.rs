use clap::Parser;
use pnet::util::MacAddr;
use std::time::Duration;

/// Well-known DHCP client port.
pub const DHCP_CLIENT_PORT: u16 = 68;
/// Well-known DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;
/// Overall handshake deadline used by [`crate::start`]; long enough to be
/// effectively unbounded.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);
/// IP time-to-live for outgoing broadcast frames.
pub const DEFAULT_TTL: u8 = 128;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The network interface to lease an address for (e.g., 'eth0')
    #[arg(short, long)]
    pub interface: String,

    /// Give up if no lease is bound within this many seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn timeout(&self) -> Duration {
        self.timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub interface: String,
    pub mac_address: MacAddr,
    pub timeout: Duration,
    pub ttl: u8,
}

impl ClientConfig {
    pub fn new(interface: String, mac_address: MacAddr) -> Self {
        Self {
            interface,
            mac_address,
            timeout: DEFAULT_TIMEOUT,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
