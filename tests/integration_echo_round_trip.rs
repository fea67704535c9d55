//! End-to-end echo exercise over the in-process loopback transport: many
//! concurrent large requests, byte-identical responses, exactly-once
//! delivery.

use blip_mux::actor::{Actor, Scheduler};
use blip_mux::protocol::{
    Connection, ConnectionDelegate, ConnectionOptions, MessageBuilder, MessageIn,
};
use blip_mux::transport::{LoopbackTransport, Transport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

const MESSAGE_SIZE: usize = 300 * 1024;
const NUM_ECHOERS: usize = 100;

/// Peer-side delegate: echoes every request body back and counts how many
/// requests carried the expected profile property.
struct EchoPeer {
    profile_matches: Arc<AtomicUsize>,
}

impl ConnectionDelegate for EchoPeer {
    fn on_request_received(&self, msg: &Arc<MessageIn>) {
        if msg.properties().get("Profile") == Some("echo") {
            self.profile_matches.fetch_add(1, Ordering::SeqCst);
        }
        if !msg.no_reply() {
            let mut reply = MessageBuilder::new();
            reply.append_body(msg.body());
            msg.respond(reply).expect("echo respond failed");
        }
    }
}

/// Driver-side delegate: responses are consumed by per-request handlers.
struct SilentDelegate;

impl ConnectionDelegate for SilentDelegate {
    fn on_request_received(&self, _msg: &Arc<MessageIn>) {}
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i & 0xff) as u8).collect()
}

fn matches_pattern(body: &[u8], len: usize) -> bool {
    body.len() == len
        && body
            .iter()
            .enumerate()
            .all(|(i, &byte)| byte == (i & 0xff) as u8)
}

#[test]
fn one_hundred_echoers_round_trip_large_patterned_bodies() {
    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(None);
    let profile_matches = Arc::new(AtomicUsize::new(0));

    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(EchoPeer {
            profile_matches: Arc::clone(&profile_matches),
        }),
        &scheduler,
        ConnectionOptions::default(),
    );

    let (tx, rx) = mpsc::channel();
    let mut echoers = Vec::new();
    for index in 1..=NUM_ECHOERS {
        let echoer = Actor::new(format!("echoer-{index}"), &scheduler, ());
        let connection = driver.clone();
        let tx = tx.clone();
        echoer.enqueue(move |_| {
            let mut builder = MessageBuilder::with_profile("echo");
            builder.add_property("Sender", "BlipTest");
            builder.append_body(&patterned(MESSAGE_SIZE));
            connection
                .send_request_with(builder, move |result| {
                    let ok = match &result {
                        Ok(response) => matches_pattern(response.body(), MESSAGE_SIZE),
                        Err(_) => false,
                    };
                    tx.send((index, ok)).unwrap();
                })
                .unwrap();
        });
        echoers.push(echoer);
    }
    drop(tx);

    let mut seen = HashSet::new();
    for _ in 0..NUM_ECHOERS {
        let (index, ok) = rx
            .recv_timeout(Duration::from_secs(120))
            .expect("timed out waiting for echo responses");
        assert!(ok, "echoer {index} received a corrupted response");
        assert!(seen.insert(index), "echoer {index} was delivered twice");
    }
    // No handler may fire a second time.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(profile_matches.load(Ordering::SeqCst), NUM_ECHOERS);
    assert_eq!(driver.pending_response_count(), 0);
    scheduler.stop();
}

#[test]
fn echo_round_trip_survives_simulated_latency() {
    let scheduler = Scheduler::new(0);
    let (driver_end, peer_end) = LoopbackTransport::pair(Some(Duration::from_millis(5)));
    let profile_matches = Arc::new(AtomicUsize::new(0));

    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(SilentDelegate),
        &scheduler,
        ConnectionOptions::default(),
    );
    let _peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(EchoPeer {
            profile_matches: Arc::clone(&profile_matches),
        }),
        &scheduler,
        ConnectionOptions::default(),
    );

    let (tx, rx) = mpsc::channel();
    for _ in 0..4 {
        let tx = tx.clone();
        let mut builder = MessageBuilder::with_profile("echo");
        builder.append_body(&patterned(64 * 1024));
        driver
            .send_request_with(builder, move |result| {
                let ok = matches!(&result, Ok(response) if matches_pattern(response.body(), 64 * 1024));
                tx.send(ok).unwrap();
            })
            .unwrap();
    }
    for _ in 0..4 {
        assert!(rx.recv_timeout(Duration::from_secs(60)).unwrap());
    }
    scheduler.stop();
}
