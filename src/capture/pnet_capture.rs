//! pnet-based capture implementation.

use bytes::Bytes;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tokio::sync::mpsc;

use super::{CaptureError, FrameReceiver, LinkCapture};

/// How long a blocking read may wait before the reader re-checks whether
/// the capture was closed.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Frames buffered between the reader thread and the listener.
const FRAME_BUFFER: usize = 64;

/// Ethernet capture using the pnet datalink layer.
pub struct PnetCapture {
    interface: NetworkInterface,
    tx: Mutex<Box<dyn DataLinkSender>>,
    running: Arc<AtomicBool>,
}

impl PnetCapture {
    /// Opens a non-promiscuous Ethernet channel on `interface_name` and
    /// starts the reader thread.
    pub fn open(interface_name: &str) -> Result<(Self, FrameReceiver), CaptureError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == interface_name)
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface_name.to_string()))?;

        let config = Config {
            read_timeout: Some(READ_TIMEOUT),
            promiscuous: false,
            ..Config::default()
        };

        let (tx, rx) = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => return Err(CaptureError::UnsupportedChannel(interface.name.clone())),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("permission") || msg.contains("Operation not permitted") {
                    return Err(CaptureError::InsufficientPermissions);
                }
                return Err(CaptureError::ChannelCreation(msg));
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let reader_running = running.clone();
        thread::Builder::new()
            .name(format!("capture-{}", interface.name))
            .spawn(move || read_frames(rx, frames_tx, reader_running))
            .map_err(|e| CaptureError::ChannelCreation(e.to_string()))?;

        tracing::debug!("Opened capture on {}", interface.name);
        Ok((
            Self {
                interface,
                tx: Mutex::new(tx),
                running,
            },
            frames_rx,
        ))
    }

    /// Get the name of the interface being captured.
    pub fn interface_name(&self) -> &str {
        &self.interface.name
    }
}

impl LinkCapture for PnetCapture {
    fn write_frame(&self, frame: &[u8]) -> Result<(), CaptureError> {
        let mut tx = self
            .tx
            .lock()
            .map_err(|_| CaptureError::Write(io::Error::other("sender lock poisoned")))?;
        match tx.send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(CaptureError::Write(e)),
            None => Err(CaptureError::Write(io::Error::other(
                "datalink sender accepted no frame",
            ))),
        }
    }

    fn close(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Blocking receive loop. Dropping `frames` on return ends the stream.
///
/// Read timeouts only give the loop a chance to notice `running` going
/// false. Any other read error means the device is gone (interface down,
/// socket torn down) and ends the stream.
fn read_frames(
    mut rx: Box<dyn DataLinkReceiver>,
    frames: mpsc::Sender<Bytes>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        match rx.next() {
            Ok(frame) => {
                if frames.blocking_send(Bytes::copy_from_slice(frame)).is_err() {
                    // Listener is gone.
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                tracing::warn!("Capture read failed, ending frame stream: {}", e);
                break;
            }
        }
    }
    tracing::debug!("Capture reader stopped");
}
