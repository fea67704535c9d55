//! Connection lifecycle and error-path coverage: noReply requests, close
//! during flight, protocol errors, automatic and error responses,
//! backpressure, and request-number assignment.

use blip_mux::error::BlipError;
use blip_mux::protocol::frame::{Compressor, Decompressor, FrameCodec};
use blip_mux::protocol::{
    close_code, Connection, ConnectionDelegate, ConnectionOptions, FrameFlags, MessageBuilder,
    MessageIn,
};
use blip_mux::transport::{LoopbackTransport, MockTransport, Transport};
use blip_mux::{MessageType, Scheduler};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Delegate that forwards lifecycle events to the test thread.
#[derive(Clone)]
struct Recorder {
    events: Arc<Mutex<mpsc::Sender<Event>>>,
}

#[derive(Debug)]
enum Event {
    Connected,
    Closed { status: u16 },
    Request { number: u64, no_reply: bool, respond_rejected: bool },
}

impl Recorder {
    fn new() -> (Recorder, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (
            Recorder {
                events: Arc::new(Mutex::new(tx)),
            },
            rx,
        )
    }

    fn send(&self, event: Event) {
        let _ = self.events.lock().send(event);
    }
}

impl ConnectionDelegate for Recorder {
    fn on_connect(&self) {
        self.send(Event::Connected);
    }

    fn on_close(&self, status: u16, _reason: &str) {
        self.send(Event::Closed { status });
    }

    fn on_request_received(&self, msg: &Arc<MessageIn>) {
        // A noReply request must reject respond(); anything else echoes.
        let respond_rejected = if msg.no_reply() {
            msg.respond(MessageBuilder::new()).is_err()
        } else {
            let mut reply = MessageBuilder::new();
            reply.append_body(msg.body());
            msg.respond(reply).is_err()
        };
        self.send(Event::Request {
            number: msg.number(),
            no_reply: msg.no_reply(),
            respond_rejected,
        });
    }
}

struct SilentDelegate;

impl ConnectionDelegate for SilentDelegate {
    fn on_request_received(&self, _msg: &Arc<MessageIn>) {}
}

fn wait_for_request(rx: &mpsc::Receiver<Event>) -> (u64, bool, bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining).expect("no request arrived") {
            Event::Request {
                number,
                no_reply,
                respond_rejected,
            } => return (number, no_reply, respond_rejected),
            _ => continue,
        }
    }
}

fn wait_for_close(rx: &mpsc::Receiver<Event>) -> u16 {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining).expect("no close arrived") {
            Event::Closed { status } => return status,
            _ => continue,
        }
    }
}

#[test]
fn no_reply_requests_elicit_no_response() {
    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let (peer_delegate, peer_rx) = Recorder::new();
    let responses_seen = Arc::new(AtomicUsize::new(0));

    struct CountingDelegate {
        responses_seen: Arc<AtomicUsize>,
    }
    impl ConnectionDelegate for CountingDelegate {
        fn on_request_received(&self, _msg: &Arc<MessageIn>) {}
        fn on_response_received(&self, _msg: &Arc<MessageIn>) {
            self.responses_seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(CountingDelegate {
            responses_seen: Arc::clone(&responses_seen),
        }),
        &scheduler,
        ConnectionOptions::default(),
    );
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(peer_delegate),
        &scheduler,
        ConnectionOptions::default(),
    );

    let mut builder = MessageBuilder::with_profile("fire-and-forget");
    builder.no_reply = true;
    builder.append_body(b"no answer expected");
    driver.send_request(builder).unwrap();

    let (_, no_reply, respond_rejected) = wait_for_request(&peer_rx);
    assert!(no_reply);
    assert!(respond_rejected, "respond() on a noReply request must fail");

    // The pending-response map must not grow, and no response may arrive.
    assert_eq!(driver.pending_response_count(), 0);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(responses_seen.load(Ordering::SeqCst), 0);
    scheduler.stop();
}

#[test]
fn handler_cannot_be_registered_for_a_no_reply_request() {
    let scheduler = Scheduler::new(0);
    let (driver_end, _peer_end) = LoopbackTransport::pair(None);
    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    let mut builder = MessageBuilder::new();
    builder.no_reply = true;
    let result = driver.send_request_with(builder, |_| {});
    assert!(matches!(result, Err(BlipError::NoResponsePossible)));
    scheduler.stop();
}

#[test]
fn close_during_flight_cancels_the_pending_handler_exactly_once() {
    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let (driver_delegate, driver_rx) = Recorder::new();
    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(driver_delegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    let (peer_delegate, _peer_rx) = Recorder::new();
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(peer_delegate),
        &scheduler,
        ConnectionOptions::default(),
    );

    let (tx, rx) = mpsc::channel();
    let mut builder = MessageBuilder::new();
    builder.append_body(&vec![0u8; 1024 * 1024]);
    driver
        .send_request_with(builder, move |result| {
            tx.send(result.map(|_| ())).unwrap();
        })
        .unwrap();
    driver.close();

    let result = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(result, Err(BlipError::CancelledByClose));
    // Exactly once, and no further callbacks.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(wait_for_close(&driver_rx), close_code::NORMAL);
    assert_eq!(driver.pending_response_count(), 0);
    scheduler.stop();
}

#[test]
fn both_delegates_observe_a_normal_close() {
    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let (driver_delegate, driver_rx) = Recorder::new();
    let (peer_delegate, peer_rx) = Recorder::new();
    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(driver_delegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(peer_delegate),
        &scheduler,
        ConnectionOptions::default(),
    );

    // Both sides connect, then the driver closes while idle.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match driver_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Event::Connected) => break,
            Ok(_) => continue,
            Err(e) => panic!("driver never connected: {e}"),
        }
    }
    driver.close();
    assert_eq!(wait_for_close(&driver_rx), close_code::NORMAL);
    assert_eq!(wait_for_close(&peer_rx), close_code::NORMAL);
    scheduler.stop();
}

#[test]
fn mismatched_continuation_type_fails_the_connection_with_1002() {
    let scheduler = Scheduler::new(0);
    let mock = MockTransport::new();
    let (delegate, rx) = Recorder::new();
    let _connection = Connection::new(
        Arc::clone(&mock) as Arc<dyn Transport>,
        Arc::new(delegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    mock.open();

    // First frame of message 7 claims Response; its continuation claims
    // Error. The receiver must fail the connection.
    mock.inject_frame(
        7,
        FrameFlags::new(MessageType::Response).with(FrameFlags::MORE_COMING, true),
        b"first half",
    )
    .unwrap();
    mock.inject_frame(7, FrameFlags::new(MessageType::Error), b"second half")
        .unwrap();

    assert_eq!(wait_for_close(&rx), close_code::PROTOCOL_ERROR);
    let (status, _) = mock.close_status().expect("connection never closed the transport");
    assert_eq!(status, close_code::PROTOCOL_ERROR);
    scheduler.stop();
}

#[test]
fn unresponsive_delegate_triggers_an_automatic_empty_response() {
    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    // The peer's delegate never calls respond().
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
    );

    let (tx, rx) = mpsc::channel();
    let mut builder = MessageBuilder::with_profile("ping");
    builder.append_body(b"anyone there?");
    driver
        .send_request_with(builder, move |result| {
            tx.send(result).unwrap();
        })
        .unwrap();

    let response = rx
        .recv_timeout(Duration::from_secs(30))
        .unwrap()
        .expect("expected an automatic empty response");
    assert_eq!(response.message_type(), MessageType::Response);
    assert!(response.body().is_empty());
    assert!(response.properties().is_empty());
    scheduler.stop();
}

#[test]
fn error_responses_surface_as_application_errors() {
    struct RejectingPeer;
    impl ConnectionDelegate for RejectingPeer {
        fn on_request_received(&self, msg: &Arc<MessageIn>) {
            msg.respond_with_error("EchoTest", 404, "no such profile")
                .unwrap();
        }
    }

    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(RejectingPeer),
        &scheduler,
        ConnectionOptions::default(),
    );

    let (tx, rx) = mpsc::channel();
    driver
        .send_request_with(MessageBuilder::with_profile("bogus"), move |result| {
            tx.send(result).unwrap();
        })
        .unwrap();

    let error = rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap_err();
    assert_eq!(
        error,
        BlipError::Application {
            domain: "EchoTest".into(),
            code: 404,
            message: "no such profile".into(),
        }
    );
    scheduler.stop();
}

#[test]
fn responding_twice_is_rejected() {
    struct DoubleResponder {
        outcomes: Arc<Mutex<mpsc::Sender<(bool, Option<BlipError>)>>>,
    }
    impl ConnectionDelegate for DoubleResponder {
        fn on_request_received(&self, msg: &Arc<MessageIn>) {
            let first = msg.respond(MessageBuilder::new()).is_ok();
            let second = msg.respond(MessageBuilder::new()).err();
            let _ = self.outcomes.lock().send((first, second));
        }
    }

    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let (tx, rx) = mpsc::channel();
    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(DoubleResponder {
            outcomes: Arc::new(Mutex::new(tx)),
        }),
        &scheduler,
        ConnectionOptions::default(),
    );

    driver.send_request(MessageBuilder::with_profile("once")).unwrap();
    let (first, second) = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert!(first);
    assert_eq!(second, Some(BlipError::AlreadyResponded));
    scheduler.stop();
}

#[test]
fn writer_suspends_until_the_transport_becomes_writeable() {
    let scheduler = Scheduler::new(0);
    let mock = MockTransport::new();
    mock.set_writeable(false);
    let _connection = {
        let connection = Connection::new(
            Arc::clone(&mock) as Arc<dyn Transport>,
            Arc::new(SilentDelegate),
            &scheduler,
            ConnectionOptions::default(),
        );
        mock.open();
        let mut builder = MessageBuilder::new();
        builder.append_body(b"held back");
        connection.send_request(builder).unwrap();
        connection
    };

    thread::sleep(Duration::from_millis(200));
    assert!(mock.sent_frames().is_empty(), "frames sent while unwriteable");

    mock.set_writeable(true);
    let deadline = Instant::now() + Duration::from_secs(10);
    while mock.sent_frames().is_empty() {
        assert!(Instant::now() < deadline, "writer never resumed");
        thread::sleep(Duration::from_millis(5));
    }
    scheduler.stop();
}

#[test]
fn request_numbers_are_strictly_increasing_from_one() {
    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let (peer_delegate, peer_rx) = Recorder::new();
    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(peer_delegate),
        &scheduler,
        ConnectionOptions::default(),
    );

    for _ in 0..50 {
        let mut builder = MessageBuilder::new();
        builder.no_reply = true;
        builder.append_body(b"numbered");
        driver.send_request(builder).unwrap();
    }
    let mut numbers = Vec::new();
    while numbers.len() < 50 {
        let (number, _, _) = wait_for_request(&peer_rx);
        numbers.push(number);
    }
    assert_eq!(numbers, (1..=50).collect::<Vec<u64>>());
    scheduler.stop();
}

#[test]
fn acknowledging_connections_emit_ack_frames_on_dispatch() {
    let scheduler = Scheduler::new(0);
    let mock = MockTransport::new();
    let _connection = Connection::new(
        Arc::clone(&mock) as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions {
            acknowledge: true,
            ..ConnectionOptions::default()
        },
    );
    mock.open();

    // A complete one-frame request from the peer; the connection should
    // emit an empty AckRequest for it alongside the automatic response.
    mock.inject_frame(3, FrameFlags::new(MessageType::Request), &[0])
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let ack = loop {
        let frames = mock.sent_frames();
        let ack = frames.iter().find_map(|frame| {
            let mut codec = FrameCodec::new();
            let decoded = codec.decode(frame).unwrap();
            (decoded.flags.message_type() == Ok(MessageType::AckRequest))
                .then_some((decoded.number, decoded.payload))
        });
        if let Some(ack) = ack {
            break ack;
        }
        assert!(Instant::now() < deadline, "no ack frame was emitted");
        thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(ack.0, 3);
    assert!(ack.1.is_empty(), "ack frames must carry no payload");
    scheduler.stop();
}

struct XorTransform;

impl Compressor for XorTransform {
    fn compress(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.iter().map(|b| b ^ 0xa5).collect())
    }
}

impl Decompressor for XorTransform {
    fn decompress(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.iter().map(|b| b ^ 0xa5).collect())
    }
}

#[test]
fn compressed_requests_round_trip_through_the_codec_seam() {
    struct EchoPeer;
    impl ConnectionDelegate for EchoPeer {
        fn on_request_received(&self, msg: &Arc<MessageIn>) {
            let mut reply = MessageBuilder::new();
            reply.append_body(msg.body());
            msg.respond(reply).unwrap();
        }
    }

    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let driver = Connection::new_with_codec(
        driver_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
        FrameCodec::with_compression(Box::new(XorTransform), Box::new(XorTransform)),
    );
    let _peer = Connection::new_with_codec(
        peer_end as Arc<dyn Transport>,
        Arc::new(EchoPeer),
        &scheduler,
        ConnectionOptions::default(),
        FrameCodec::with_compression(Box::new(XorTransform), Box::new(XorTransform)),
    );

    let body: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = body.clone();
    let (tx, rx) = mpsc::channel();
    let mut builder = MessageBuilder::new();
    builder.compressed = true;
    builder.append_body(&body);
    driver
        .send_request_with(builder, move |result| {
            let response = result.expect("compressed request failed");
            tx.send(response.body() == expected.as_slice()).unwrap();
        })
        .unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(30)).unwrap());
    scheduler.stop();
}
