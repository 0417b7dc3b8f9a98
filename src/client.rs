//! DHCP client implementation
//!
//! This module contains the session driver around the state machine:
//! - Capture lifecycle (opened before the listener starts, closed exactly once)
//! - The single overall deadline shared with the listener
//! - Broadcasting handler output and applying the bound lease

use crate::{
    capture::{CaptureHandle, FrameReceiver, LinkCapture},
    config::{ClientConfig, DEFAULT_TIMEOUT},
    error::ClientError,
    network::{
        configurator::{AddressAssigner, AssignError},
        frame::send_broadcast,
    },
    v4::{handler::DhcpV4Handler, listener::Listener},
};
use dhcproto::v4;
use std::{fmt, net::Ipv4Addr, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

/// Actions the state machine asks the client driver to perform.
#[derive(Debug)]
pub enum Action {
    /// Broadcast an encoded DHCP message, then wait for the next reply.
    Broadcast(Vec<u8>),
    /// Nothing to send; keep waiting for a reply.
    Wait,
    /// Apply the lease to the interface and report the outcome.
    Assign(Lease),
    /// Handshake complete.
    Done(Lease),
}

/// External events the state machine responds to.
#[derive(Debug)]
pub enum Event {
    Start,
    Received(v4::Message),
    DeadlineElapsed,
    CaptureEnded,
    Assigned,
    AssignFailed(AssignError),
    BroadcastFailed(ClientError),
}

/// Lease information taken from the server's Ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub prefix_len: u8,
    pub routers: Option<Vec<Ipv4Addr>>,
    pub dns_servers: Option<Vec<Ipv4Addr>>,
    pub lease_duration: Option<Duration>,
    pub server_identifier: Option<Ipv4Addr>,
}

impl Lease {
    /// The assigned address in `a.b.c.d/len` form.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cidr())?;
        if let Some(server) = self.server_identifier {
            write!(f, " from {server}")?;
        }
        if let Some(duration) = self.lease_duration {
            write!(f, " for {}s", duration.as_secs())?;
        }
        Ok(())
    }
}

/// Prefix length of a contiguous subnet mask, `None` if the mask has holes.
pub fn prefix_len(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    (bits.checked_shl(ones).unwrap_or(0) == 0).then_some(ones as u8)
}

/// Common interface of a DHCP client state machine.
pub trait DhcpStateMachine {
    /// Handles one event and returns the next action to perform.
    fn handle_event(&mut self, event: Event) -> Result<Action, ClientError>;
    /// Current state name (for logging).
    fn state_name(&self) -> &'static str;
    /// Transaction id shared by every message of the session.
    fn transaction_id(&self) -> u32;
}

/// One handshake attempt on one interface.
pub struct DhcpClient {
    config: ClientConfig,
    capture: Arc<CaptureHandle>,
    frames: FrameReceiver,
    assigner: Arc<dyn AddressAssigner>,
    state_machine: Box<dyn DhcpStateMachine + Send>,
}

/// The instant `timeout` from now. Durations too large to represent fall
/// back to [`DEFAULT_TIMEOUT`].
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| {
        tracing::debug!("Timeout {:?} out of range, using {:?}", timeout, DEFAULT_TIMEOUT);
        now + DEFAULT_TIMEOUT
    })
}

impl DhcpClient {
    /// Builds a session over an already opened capture.
    pub fn new(
        config: ClientConfig,
        capture: Box<dyn LinkCapture>,
        frames: FrameReceiver,
        assigner: Box<dyn AddressAssigner>,
    ) -> Self {
        let state_machine = Box::new(DhcpV4Handler::new(config.mac_address));
        Self::with_state_machine(config, capture, frames, assigner, state_machine)
    }

    pub fn with_state_machine(
        config: ClientConfig,
        capture: Box<dyn LinkCapture>,
        frames: FrameReceiver,
        assigner: Box<dyn AddressAssigner>,
        state_machine: Box<dyn DhcpStateMachine + Send>,
    ) -> Self {
        Self {
            config,
            capture: Arc::new(CaptureHandle::new(capture)),
            frames,
            assigner: Arc::from(assigner),
            state_machine,
        }
    }

    /// Opens a raw Ethernet capture on the configured interface and
    /// configures the lease through iproute2.
    #[cfg(target_os = "linux")]
    pub fn open(config: ClientConfig) -> Result<Self, ClientError> {
        use crate::{capture::PnetCapture, network::configurator::NetworkConfigurator};

        let (capture, frames) = PnetCapture::open(&config.interface)?;
        Ok(Self::new(
            config,
            Box::new(capture),
            frames,
            Box::new(NetworkConfigurator::new()),
        ))
    }

    pub fn transaction_id(&self) -> u32 {
        self.state_machine.transaction_id()
    }

    /// Runs the handshake to completion. The capture is closed before this
    /// returns, whatever the outcome.
    pub async fn run(self) -> Result<Lease, ClientError> {
        let DhcpClient {
            config,
            capture,
            frames,
            assigner,
            mut state_machine,
        } = self;

        let deadline = deadline_after(config.timeout);
        let xid = state_machine.transaction_id();
        tracing::info!(
            "Starting DHCP on {} (xid {:#010x}, timeout {:?})",
            config.interface,
            xid,
            config.timeout
        );

        // One buffered slot: the listener runs at most one accepted message
        // ahead of the state machine.
        let (tx, mut rx) = mpsc::channel(1);
        let listener = tokio::spawn(
            Listener {
                capture: capture.clone(),
                frames,
                xid,
                deadline,
                messages: tx,
            }
            .run(),
        );

        let mut session = Session {
            config: &config,
            capture: &capture,
            assigner: &assigner,
            state_machine: state_machine.as_mut(),
            deadline,
        };
        let result = session.drive(&mut rx).await;

        // Dropping the receiver releases a listener blocked on forwarding.
        drop(rx);
        if let Err(e) = listener.await {
            tracing::warn!("Listener task failed: {}", e);
        }
        capture.close();

        match &result {
            Ok(lease) => tracing::info!("DHCP bind successful on {}: {}", config.interface, lease),
            Err(e) => tracing::error!(
                "DHCP on {} failed in {} state: {}",
                config.interface,
                state_machine.state_name(),
                e
            ),
        }
        result
    }
}

/// Borrowed view of a running client, consumed by the drive loop.
struct Session<'a> {
    config: &'a ClientConfig,
    capture: &'a CaptureHandle,
    assigner: &'a Arc<dyn AddressAssigner>,
    state_machine: &'a mut (dyn DhcpStateMachine + Send + 'static),
    deadline: Instant,
}

impl Session<'_> {
    async fn drive(&mut self, rx: &mut mpsc::Receiver<v4::Message>) -> Result<Lease, ClientError> {
        let mut next_action = self.state_machine.handle_event(Event::Start)?;

        loop {
            tracing::debug!("State: {}", self.state_machine.state_name());

            match next_action {
                Action::Broadcast(payload) => {
                    if let Err(e) = send_broadcast(
                        self.capture,
                        self.config.mac_address,
                        self.config.ttl,
                        &payload,
                    ) {
                        next_action = self.state_machine.handle_event(Event::BroadcastFailed(e))?;
                        continue;
                    }
                    tracing::info!(
                        "Broadcast {} byte DHCP message, now {}",
                        payload.len(),
                        self.state_machine.state_name()
                    );
                    next_action = self.wait_for_reply(rx).await?;
                }
                Action::Wait => {
                    next_action = self.wait_for_reply(rx).await?;
                }
                Action::Assign(lease) => {
                    let event = match assign(self.assigner, &self.config.interface, &lease).await {
                        Ok(()) => Event::Assigned,
                        Err(e) => Event::AssignFailed(e),
                    };
                    next_action = self.state_machine.handle_event(event)?;
                }
                Action::Done(lease) => return Ok(lease),
            }
        }
    }

    /// Waits for the listener's next message or the overall deadline.
    async fn wait_for_reply(
        &mut self,
        rx: &mut mpsc::Receiver<v4::Message>,
    ) -> Result<Action, ClientError> {
        let event = tokio::select! {
            biased;
            _ = time::sleep_until(self.deadline) => Event::DeadlineElapsed,
            msg = rx.recv() => match msg {
                Some(msg) => Event::Received(msg),
                // The listener also exits on the deadline.
                None if Instant::now() >= self.deadline => Event::DeadlineElapsed,
                None => Event::CaptureEnded,
            },
        };
        self.state_machine.handle_event(event)
    }
}

/// Applies the lease on the blocking pool; assigners may shell out.
async fn assign(
    assigner: &Arc<dyn AddressAssigner>,
    interface: &str,
    lease: &Lease,
) -> Result<(), AssignError> {
    let assigner = Arc::clone(assigner);
    let interface = interface.to_string();
    let cidr = lease.cidr();
    tokio::task::spawn_blocking(move || assigner.apply(&interface, &cidr))
        .await
        .map_err(AssignError::Aborted)?
}

/// Acquires a lease for `interface` with the effectively unbounded default
/// deadline.
pub async fn start(interface: &str) -> Result<(), ClientError> {
    start_with_timeout(interface, DEFAULT_TIMEOUT).await
}

/// Acquires a lease for `interface`, giving up once `timeout` has elapsed.
#[cfg(target_os = "linux")]
pub async fn start_with_timeout(interface: &str, timeout: Duration) -> Result<(), ClientError> {
    let mac_address = crate::network::link_address(interface).await?;
    let config = ClientConfig::new(interface.to_string(), mac_address).with_timeout(timeout);
    DhcpClient::open(config)?.run().await.map(|_| ())
}

/// Raw frame capture is not supported here; returns immediately without
/// touching the network.
#[cfg(not(target_os = "linux"))]
pub async fn start_with_timeout(interface: &str, _timeout: Duration) -> Result<(), ClientError> {
    tracing::debug!("DHCP is a no-op on this platform, skipping {}", interface);
    Ok(())
}
