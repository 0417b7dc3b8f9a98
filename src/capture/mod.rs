//! Raw link-layer capture and injection.
//!
//! The client has no address yet, so it cannot use the host's IP stack.
//! Instead it owns one capture per session: the frame builder writes
//! through it and the listener reads from it.

mod pnet_capture;

pub use pnet_capture::PnetCapture;

use bytes::Bytes;
use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tokio::sync::mpsc;

/// Frames read off the wire, in arrival order. The stream ends once the
/// capture has been closed.
pub type FrameReceiver = mpsc::Receiver<Bytes>;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Insufficient permissions to open a raw channel (try running as root)")]
    InsufficientPermissions,

    #[error("Failed to create datalink channel: {0}")]
    ChannelCreation(String),

    #[error("Interface '{0}' does not provide an Ethernet channel")]
    UnsupportedChannel(String),

    #[error("Failed to write frame")]
    Write(#[source] io::Error),

    #[error("Capture is already closed")]
    Closed,

    #[error("Frame stream ended before the handshake completed")]
    StreamEnded,
}

/// A raw-frame capture opened on one interface.
///
/// Implementations must tolerate `write_frame` and `close` being called from
/// different tasks; the session guarantees `close` is invoked only once.
pub trait LinkCapture: Send + Sync {
    /// Injects one complete link-layer frame.
    fn write_frame(&self, frame: &[u8]) -> Result<(), CaptureError>;

    /// Releases the device. The associated [`FrameReceiver`] ends afterwards.
    fn close(&self);
}

/// Session-owned capture.
///
/// Closing is idempotent: whichever path decides the session is over (the
/// listener on its way out, or the client after the handshake) closes the
/// backend, and every later request is a no-op.
pub struct CaptureHandle {
    inner: Box<dyn LinkCapture>,
    closed: AtomicBool,
}

impl CaptureHandle {
    pub fn new(inner: Box<dyn LinkCapture>) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
        }
    }

    pub fn write_frame(&self, frame: &[u8]) -> Result<(), CaptureError> {
        if self.is_closed() {
            return Err(CaptureError::Closed);
        }
        self.inner.write_frame(frame)
    }

    /// Closes the backend. Returns `true` only for the call that actually
    /// closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!("Closing capture");
        self.inner.close();
        tracing::debug!("Capture closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}
