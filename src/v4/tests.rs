use super::*;
use crate::{
    capture::{CaptureError, CaptureHandle, LinkCapture},
    client::{Action, DhcpStateMachine, Event},
    error::ClientError,
    network::{configurator::AssignError, frame::UdpFrame},
};
use bytes::Bytes;
use dhcproto::{v4, Decodable, Decoder, Encodable, Encoder};
use pnet::util::MacAddr;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

const MAC: MacAddr = MacAddr(0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4);
const XID: u32 = 0x1234_5678;
const OFFERED_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

fn server_reply(xid: u32, msg_type: v4::MessageType) -> v4::Message {
    let mut msg = v4::Message::default();
    msg.set_opcode(v4::Opcode::BootReply)
        .set_htype(v4::HType::Eth)
        .set_xid(xid)
        .set_yiaddr(OFFERED_IP)
        .set_chaddr(&MAC.octets());
    msg.opts_mut().insert(v4::DhcpOption::MessageType(msg_type));
    msg.opts_mut()
        .insert(v4::DhcpOption::ServerIdentifier(SERVER_IP));
    msg.opts_mut()
        .insert(v4::DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)));
    msg
}

fn encode(msg: &v4::Message) -> Vec<u8> {
    let mut buffer = Vec::new();
    msg.encode(&mut Encoder::new(&mut buffer)).unwrap();
    buffer
}

fn decode(packet: &[u8]) -> v4::Message {
    v4::Message::decode(&mut Decoder::new(packet)).unwrap()
}

fn reply_frame(msg: &v4::Message) -> Bytes {
    let frame = UdpFrame {
        src_mac: MacAddr::new(0x52, 0x54, 0x00, 0x12, 0x34, 0x56),
        dst_mac: MacAddr::broadcast(),
        src_ip: SERVER_IP,
        dst_ip: Ipv4Addr::BROADCAST,
        src_port: 67,
        dst_port: 68,
        ttl: 64,
    };
    Bytes::from(frame.build(&encode(msg)).unwrap())
}

fn broadcast_payload(action: Action) -> Vec<u8> {
    match action {
        Action::Broadcast(packet) => packet,
        other => panic!("Expected Broadcast action, got {other:?}"),
    }
}

/// Handler that has sent its Discover and waits for an Offer.
fn selecting_handler() -> DhcpV4Handler {
    let mut handler = DhcpV4Handler::with_xid(MAC, XID);
    handler.handle_event(Event::Start).unwrap();
    handler
}

/// Handler that has sent its Request and waits for an Ack.
fn requesting_handler() -> DhcpV4Handler {
    let mut handler = selecting_handler();
    handler
        .handle_event(Event::Received(server_reply(XID, v4::MessageType::Offer)))
        .unwrap();
    handler
}

#[test]
fn test_build_dhcp_discover() {
    let packet = build_dhcp_discover(MAC, XID).unwrap();
    let msg = decode(&packet);

    assert_eq!(msg.xid(), XID);
    assert_eq!(&msg.chaddr()[..6], &MAC.octets()[..]);
    assert_eq!(msg.opcode(), v4::Opcode::BootRequest);
    assert!(msg.flags().broadcast());

    let msg_type = msg.opts().get(v4::OptionCode::MessageType);
    assert!(matches!(
        msg_type,
        Some(v4::DhcpOption::MessageType(v4::MessageType::Discover))
    ));

    let client_id = msg.opts().get(v4::OptionCode::ClientIdentifier);
    assert!(matches!(
        client_id,
        Some(v4::DhcpOption::ClientIdentifier(id)) if id[0] == 1 && id[1..] == MAC.octets()
    ));
}

#[test]
fn test_build_dhcp_request() {
    let offer = server_reply(XID, v4::MessageType::Offer);
    let packet = build_dhcp_request(MAC, XID, &offer).unwrap();
    let msg = decode(&packet);

    assert_eq!(msg.xid(), XID);
    assert_eq!(msg.opcode(), v4::Opcode::BootRequest);
    assert_eq!(msg.ciaddr(), Ipv4Addr::UNSPECIFIED);

    let msg_type = msg.opts().get(v4::OptionCode::MessageType);
    assert!(matches!(
        msg_type,
        Some(v4::DhcpOption::MessageType(v4::MessageType::Request))
    ));

    let requested_ip = msg.opts().get(v4::OptionCode::RequestedIpAddress);
    assert!(
        matches!(requested_ip, Some(v4::DhcpOption::RequestedIpAddress(ip)) if *ip == OFFERED_IP)
    );

    let server_id = msg.opts().get(v4::OptionCode::ServerIdentifier);
    assert!(matches!(server_id, Some(v4::DhcpOption::ServerIdentifier(ip)) if *ip == SERVER_IP));

    assert!(msg.flags().broadcast());
}

#[test]
fn test_request_needs_server_identifier() {
    let mut offer = server_reply(XID, v4::MessageType::Offer);
    offer.opts_mut().remove(v4::OptionCode::ServerIdentifier);

    let err = build_dhcp_request(MAC, XID, &offer).unwrap_err();
    assert!(matches!(err, ClientError::MissingServerIdentifier));
}

#[test]
fn test_dhcp_v4_handler_creation() {
    let handler = DhcpV4Handler::with_xid(MAC, XID);

    assert_eq!(handler.state_name(), "Init");
    assert_eq!(handler.transaction_id(), XID);
}

#[test]
fn test_dhcp_v4_handler_init_transition() {
    let mut handler = DhcpV4Handler::with_xid(MAC, XID);

    let packet = broadcast_payload(handler.handle_event(Event::Start).unwrap());
    let msg = decode(&packet);

    assert_eq!(msg.xid(), XID);
    assert_eq!(handler.state(), DhcpV4State::Selecting);
}

#[test]
fn test_transition_table() {
    assert_eq!(
        DhcpV4State::Selecting.expected_reply(),
        Some(v4::MessageType::Offer)
    );
    assert_eq!(
        DhcpV4State::Requesting.expected_reply(),
        Some(v4::MessageType::Ack)
    );
    assert_eq!(DhcpV4State::Init.expected_reply(), None);
    assert_eq!(DhcpV4State::Bound.expected_reply(), None);
    assert_eq!(DhcpV4State::Failed.expected_reply(), None);
}

#[test]
fn test_offer_produces_request_with_session_xid() {
    let mut handler = selecting_handler();

    let action = handler
        .handle_event(Event::Received(server_reply(XID, v4::MessageType::Offer)))
        .unwrap();
    let request = decode(&broadcast_payload(action));

    assert_eq!(request.xid(), XID);
    assert_eq!(handler.state(), DhcpV4State::Requesting);
}

#[test]
fn test_foreign_transaction_is_ignored() {
    let mut handler = selecting_handler();

    let action = handler
        .handle_event(Event::Received(server_reply(
            XID ^ 1,
            v4::MessageType::Offer,
        )))
        .unwrap();

    assert!(matches!(action, Action::Wait));
    assert_eq!(handler.state(), DhcpV4State::Selecting);
}

#[test]
fn test_ack_while_selecting_fails() {
    let mut handler = selecting_handler();

    let err = handler
        .handle_event(Event::Received(server_reply(XID, v4::MessageType::Ack)))
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::UnexpectedMessageType {
            state: "Selecting",
            got: Some(v4::MessageType::Ack)
        }
    ));
    assert_eq!(handler.state(), DhcpV4State::Failed);
}

#[test]
fn test_nak_while_requesting_fails() {
    let mut handler = requesting_handler();

    let err = handler
        .handle_event(Event::Received(server_reply(XID, v4::MessageType::Nak)))
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::UnexpectedMessageType {
            state: "Requesting",
            got: Some(v4::MessageType::Nak)
        }
    ));
    assert!(err.is_handshake_failure());
    assert_eq!(handler.state(), DhcpV4State::Failed);
}

#[test]
fn test_ack_binds_after_assignment() {
    let mut handler = requesting_handler();

    let mut ack = server_reply(XID, v4::MessageType::Ack);
    ack.opts_mut()
        .insert(v4::DhcpOption::Router(vec![SERVER_IP]));
    ack.opts_mut()
        .insert(v4::DhcpOption::AddressLeaseTime(3600));

    let lease = match handler.handle_event(Event::Received(ack)).unwrap() {
        Action::Assign(lease) => lease,
        other => panic!("Expected Assign action, got {other:?}"),
    };
    assert_eq!(lease.cidr(), "192.168.1.100/24");
    assert_eq!(lease.routers, Some(vec![SERVER_IP]));
    assert_eq!(lease.lease_duration, Some(Duration::from_secs(3600)));
    assert_eq!(lease.server_identifier, Some(SERVER_IP));
    assert_eq!(handler.state(), DhcpV4State::Requesting);

    match handler.handle_event(Event::Assigned).unwrap() {
        Action::Done(bound) => assert_eq!(bound, lease),
        other => panic!("Expected Done action, got {other:?}"),
    }
    assert_eq!(handler.state(), DhcpV4State::Bound);
}

#[test]
fn test_ack_without_mask_binds_host_address() {
    let mut handler = requesting_handler();
    let mut ack = server_reply(XID, v4::MessageType::Ack);
    ack.opts_mut().remove(v4::OptionCode::SubnetMask);

    match handler.handle_event(Event::Received(ack)).unwrap() {
        Action::Assign(lease) => assert_eq!(lease.cidr(), "192.168.1.100/32"),
        other => panic!("Expected Assign action, got {other:?}"),
    }
}

#[test]
fn test_ack_with_holey_mask_fails() {
    let mut handler = requesting_handler();
    let mut ack = server_reply(XID, v4::MessageType::Ack);
    ack.opts_mut()
        .insert(v4::DhcpOption::SubnetMask(Ipv4Addr::new(255, 0, 255, 0)));

    let err = handler.handle_event(Event::Received(ack)).unwrap_err();
    assert!(matches!(err, ClientError::InvalidSubnetMask(_)));
    assert_eq!(handler.state(), DhcpV4State::Failed);
}

#[test]
fn test_failed_assignment_fails_session() {
    let mut handler = requesting_handler();
    handler
        .handle_event(Event::Received(server_reply(XID, v4::MessageType::Ack)))
        .unwrap();

    let err = handler
        .handle_event(Event::AssignFailed(AssignError::Spawn {
            program: "ip",
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }))
        .unwrap_err();

    assert!(matches!(err, ClientError::Assign(_)));
    assert_eq!(handler.state(), DhcpV4State::Failed);
}

#[test]
fn test_deadline_fails_waiting_states() {
    let mut handler = selecting_handler();
    let err = handler.handle_event(Event::DeadlineElapsed).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Timeout {
            state: "Selecting",
            expected: "Offer"
        }
    ));

    let mut handler = requesting_handler();
    let err = handler.handle_event(Event::DeadlineElapsed).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Timeout {
            state: "Requesting",
            expected: "Ack"
        }
    ));
    assert_eq!(handler.state(), DhcpV4State::Failed);
}

#[test]
fn test_capture_end_fails_session() {
    let mut handler = selecting_handler();
    let err = handler.handle_event(Event::CaptureEnded).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Capture(CaptureError::StreamEnded)
    ));
}

#[test]
fn test_broadcast_failure_fails_session() {
    for mut handler in [selecting_handler(), requesting_handler()] {
        let err = handler
            .handle_event(Event::BroadcastFailed(CaptureError::Closed.into()))
            .unwrap_err();
        assert!(matches!(err, ClientError::Capture(CaptureError::Closed)));
        assert_eq!(handler.state(), DhcpV4State::Failed);
        assert_eq!(handler.state_name(), "Failed");
    }
}

#[test]
fn test_terminal_states_reject_events() {
    let mut handler = selecting_handler();
    let _ = handler.handle_event(Event::DeadlineElapsed);

    let err = handler
        .handle_event(Event::Received(server_reply(XID, v4::MessageType::Offer)))
        .unwrap_err();
    assert!(matches!(err, ClientError::Critical(_)));
    assert_eq!(handler.state(), DhcpV4State::Failed);
}

#[test]
fn test_accept_passes_server_replies() {
    for msg_type in [
        v4::MessageType::Offer,
        v4::MessageType::Ack,
        v4::MessageType::Nak,
    ] {
        let frame = reply_frame(&server_reply(XID, msg_type));
        let msg = accept(&frame, XID).unwrap();
        assert_eq!(msg.xid(), XID);
    }
}

#[test]
fn test_accept_rejects_foreign_transaction() {
    let frame = reply_frame(&server_reply(XID ^ 0xff, v4::MessageType::Offer));
    assert!(matches!(
        accept(&frame, XID),
        Err(Rejection::TransactionMismatch { expected: XID, .. })
    ));
}

#[test]
fn test_accept_rejects_other_message_types() {
    let frame = reply_frame(&server_reply(XID, v4::MessageType::Inform));
    assert!(matches!(
        accept(&frame, XID),
        Err(Rejection::MessageType(Some(v4::MessageType::Inform)))
    ));
}

#[test]
fn test_accept_rejects_undecodable_payload() {
    let frame = UdpFrame {
        src_mac: MAC,
        dst_mac: MacAddr::broadcast(),
        src_ip: SERVER_IP,
        dst_ip: Ipv4Addr::BROADCAST,
        src_port: 67,
        dst_port: 68,
        ttl: 64,
    }
    .build(b"definitely not dhcp")
    .unwrap();

    assert!(matches!(
        accept(&Bytes::from(frame), XID),
        Err(Rejection::Decode(_))
    ));
}

#[derive(Default)]
struct CountingCapture {
    closes: Arc<AtomicUsize>,
}

impl LinkCapture for CountingCapture {
    fn write_frame(&self, _frame: &[u8]) -> Result<(), CaptureError> {
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn listener(
    deadline: Instant,
) -> (
    Listener,
    mpsc::Sender<Bytes>,
    mpsc::Receiver<v4::Message>,
    Arc<AtomicUsize>,
) {
    let closes = Arc::new(AtomicUsize::new(0));
    let capture = Arc::new(CaptureHandle::new(Box::new(CountingCapture {
        closes: closes.clone(),
    })));
    let (frames_tx, frames) = mpsc::channel(8);
    let (messages, messages_rx) = mpsc::channel(1);
    (
        Listener {
            capture,
            frames,
            xid: XID,
            deadline,
            messages,
        },
        frames_tx,
        messages_rx,
        closes,
    )
}

#[tokio::test]
async fn test_listener_forwards_only_matching_replies() {
    let (listener, frames, mut messages, closes) =
        listener(Instant::now() + Duration::from_secs(5));
    let task = tokio::spawn(listener.run());

    frames
        .send(reply_frame(&server_reply(XID ^ 1, v4::MessageType::Offer)))
        .await
        .unwrap();
    frames
        .send(Bytes::from_static(&[0u8; 20]))
        .await
        .unwrap();
    frames
        .send(reply_frame(&server_reply(XID, v4::MessageType::Offer)))
        .await
        .unwrap();

    let msg = messages.recv().await.unwrap();
    assert_eq!(msg.xid(), XID);

    drop(messages);
    task.await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listener_exits_at_deadline() {
    let (listener, _frames, _messages, closes) =
        listener(Instant::now() + Duration::from_millis(50));

    tokio::time::timeout(Duration::from_secs(5), listener.run())
        .await
        .expect("listener must stop at its deadline");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listener_exits_when_stream_ends() {
    let (listener, frames, _messages, closes) =
        listener(Instant::now() + Duration::from_secs(60));
    drop(frames);

    tokio::time::timeout(Duration::from_secs(5), listener.run())
        .await
        .expect("listener must stop when the stream ends");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listener_never_blocks_on_abandoned_consumer() {
    let (listener, frames, messages, closes) =
        listener(Instant::now() + Duration::from_secs(60));
    // Consumer is gone before anything is forwarded.
    drop(messages);
    frames
        .send(reply_frame(&server_reply(XID, v4::MessageType::Offer)))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), listener.run())
        .await
        .expect("listener must not wait on a closed channel");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
