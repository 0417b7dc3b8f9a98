//! Background reader feeding accepted replies to the state machine.

use bytes::Bytes;
use dhcproto::{error::DecodeError, v4, Decodable, Decoder};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

use super::message::message_type;
use crate::{
    capture::{CaptureHandle, FrameReceiver},
    network::filter::{self, FilterError},
};

/// Why a captured frame was dropped. Never fatal to the session.
#[derive(Error, Debug)]
pub enum Rejection {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("Not a DHCP message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Unhandled transaction id: {got:#010x}, ours is {expected:#010x}")]
    TransactionMismatch { got: u32, expected: u32 },

    #[error("Unhandled message type: {0:?}")]
    MessageType(Option<v4::MessageType>),
}

/// Turns a raw frame into a DHCP reply for transaction `xid`.
///
/// Offer, Ack and Nak are server replies and are handed to the state
/// machine, which decides whether they fit its current state.
pub fn accept(frame: &Bytes, xid: u32) -> Result<v4::Message, Rejection> {
    let payload = filter::parse(frame)?;
    let msg = v4::Message::decode(&mut Decoder::new(&payload))?;

    if msg.xid() != xid {
        return Err(Rejection::TransactionMismatch {
            got: msg.xid(),
            expected: xid,
        });
    }

    match message_type(&msg) {
        Some(v4::MessageType::Offer | v4::MessageType::Ack | v4::MessageType::Nak) => Ok(msg),
        other => Err(Rejection::MessageType(other)),
    }
}

/// Producer half of a session.
///
/// Reads frames until the deadline passes, the state machine stops
/// listening, or the capture's frame stream ends, then closes the capture.
pub struct Listener {
    pub capture: Arc<CaptureHandle>,
    pub frames: FrameReceiver,
    pub xid: u32,
    pub deadline: Instant,
    pub messages: mpsc::Sender<v4::Message>,
}

impl Listener {
    pub async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                _ = time::sleep_until(self.deadline) => {
                    tracing::debug!("Listener reached the deadline");
                    break;
                }
                _ = self.messages.closed() => break,
                frame = self.frames.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        tracing::debug!("Frame stream ended");
                        break;
                    }
                },
            };

            let msg = match accept(&frame, self.xid) {
                Ok(msg) => msg,
                Err(rejection) => {
                    tracing::debug!("Dropping frame: {}", rejection);
                    continue;
                }
            };

            tracing::debug!("Forwarding {:?}", message_type(&msg));
            tokio::select! {
                _ = time::sleep_until(self.deadline) => break,
                sent = self.messages.send(msg) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        self.capture.close();
    }
}
