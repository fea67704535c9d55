//! # blip-echo
//!
//! Echo stress harness for the blip-mux protocol engine. Two connections
//! are wired back to back over an in-process loopback transport; a
//! configurable number of echoer actors each send one patterned request
//! through the driver connection, the peer echoes every body back, and the
//! harness verifies the responses and reports round-trip latency and
//! throughput.

use anyhow::{anyhow, Result};
use blip_mux::actor::{Actor, Channel, Scheduler};
use blip_mux::cli::Args;
use blip_mux::metrics::{LatencyRecorder, RunSummary};
use blip_mux::protocol::{
    Connection, ConnectionDelegate, ConnectionOptions, MessageBuilder, MessageIn,
};
use blip_mux::transport::{LoopbackTransport, Transport};
use blip_mux::Address;
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::HarnessFormatter;

/// Delegate shared by both endpoints: echoes every request body back and
/// signals the harness when the transport opens.
struct EchoDelegate {
    label: &'static str,
    connected: Arc<Channel<()>>,
}

impl ConnectionDelegate for EchoDelegate {
    fn on_connect(&self) {
        debug!("{} connected", self.label);
        self.connected.push(());
    }

    fn on_error(&self, code: i32, reason: &str) {
        warn!("{} error {}: {}", self.label, code, reason);
    }

    fn on_close(&self, status: u16, reason: &str) {
        debug!("{} closed with status {} {}", self.label, status, reason);
    }

    fn on_request_received(&self, msg: &Arc<MessageIn>) {
        debug!(
            "{} request #{} received: {} bytes",
            self.label,
            msg.number(),
            msg.body().len()
        );
        if msg.no_reply() {
            return;
        }
        let mut reply = MessageBuilder::new();
        reply.append_body(msg.body());
        if let Err(e) = msg.respond(reply) {
            warn!("{} failed to respond to #{}: {}", self.label, msg.number(), e);
        }
    }
}

/// Result of one echoer's round trip.
struct EchoOutcome {
    index: usize,
    latency: Option<Duration>,
    error: Option<String>,
}

fn patterned_body(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xff) as u8).collect()
}

fn body_matches_pattern(body: &[u8], expected_len: usize) -> bool {
    body.len() == expected_len
        && body
            .iter()
            .enumerate()
            .all(|(i, &byte)| byte == (i & 0xff) as u8)
}

fn main() -> Result<()> {
    let args = Args::parse();
    // The guard must stay alive for the duration of the run, or file
    // logging stops working.
    let _log_guard = init_logging(&args)?;

    let driver_address = Address::new("blip", "driver.local", 0, "/echo");
    let peer_address = Address::new("blip", "peer.local", 0, "/echo");
    info!(
        "echo harness: {} echoers x {} bytes, {} <-> {}",
        args.echoers, args.message_size, driver_address, peer_address
    );

    let scheduler = Scheduler::shared();
    let latency = (args.latency_ms > 0).then(|| Duration::from_millis(args.latency_ms));
    let (driver_end, peer_end) = LoopbackTransport::pair(latency);

    let options = ConnectionOptions {
        frame_size: args.frame_size,
        ..ConnectionOptions::default()
    };
    let connected = Arc::new(Channel::new());
    let driver = Connection::new(
        driver_end as Arc<dyn Transport>,
        Arc::new(EchoDelegate {
            label: "driver",
            connected: Arc::clone(&connected),
        }),
        &scheduler,
        options.clone(),
    );
    let peer = Connection::new(
        peer_end as Arc<dyn Transport>,
        Arc::new(EchoDelegate {
            label: "peer",
            connected: Arc::clone(&connected),
        }),
        &scheduler,
        options,
    );

    // Both delegates report on_connect once the loopback opens.
    for _ in 0..2 {
        connected
            .pop()
            .ok_or_else(|| anyhow!("connection never opened"))?;
    }
    info!("connected; starting echoers");

    let body = Arc::new(patterned_body(args.message_size));
    let results: Arc<Channel<EchoOutcome>> = Arc::new(Channel::new());
    let started = Instant::now();

    let mut echoers = Vec::with_capacity(args.echoers);
    for index in 1..=args.echoers {
        let echoer = Actor::new(format!("echoer-{index}"), &scheduler, ());
        let connection = driver.clone();
        let body = Arc::clone(&body);
        let results = Arc::clone(&results);
        let urgent = args.urgent;
        echoer.enqueue(move |_| {
            let expected_len = body.len();
            let mut builder = MessageBuilder::with_profile("echo");
            builder.add_property("Sender", "blip-echo");
            builder.urgent = urgent;
            builder.append_body(&body);
            let sent_at = Instant::now();
            let handler_results = Arc::clone(&results);
            let send_result = connection.send_request_with(builder, move |result| {
                let outcome = match result {
                    Ok(response) => {
                        if body_matches_pattern(response.body(), expected_len) {
                            EchoOutcome {
                                index,
                                latency: Some(sent_at.elapsed()),
                                error: None,
                            }
                        } else {
                            EchoOutcome {
                                index,
                                latency: None,
                                error: Some("response body does not match".into()),
                            }
                        }
                    }
                    Err(e) => EchoOutcome {
                        index,
                        latency: None,
                        error: Some(e.to_string()),
                    },
                };
                handler_results.push(outcome);
            });
            if let Err(e) = send_result {
                results.push(EchoOutcome {
                    index,
                    latency: None,
                    error: Some(e.to_string()),
                });
            } else {
                debug!("echoer {} sent request", index);
            }
        });
        echoers.push(echoer);
    }

    let mut recorder = LatencyRecorder::new()?;
    let mut failures = 0usize;
    for _ in 0..args.echoers {
        let outcome = results
            .pop()
            .ok_or_else(|| anyhow!("result channel closed early"))?;
        match (outcome.latency, outcome.error) {
            (Some(latency), None) => recorder.record(latency),
            (_, error) => {
                failures += 1;
                warn!(
                    "echoer {} failed: {}",
                    outcome.index,
                    error.unwrap_or_else(|| "unknown".into())
                );
            }
        }
    }
    let elapsed = started.elapsed();

    driver.log_stats();
    peer.log_stats();
    driver.close();

    let summary = RunSummary::new(
        args.echoers,
        args.message_size,
        args.latency_ms,
        elapsed,
        recorder.summary(),
    );
    summary.print();
    if let Some(path) = &args.output_file {
        summary.write_json(path)?;
    }

    if failures > 0 {
        return Err(anyhow!("{failures} of {} echo round trips failed", args.echoers));
    }
    Ok(())
}

/// Configure tracing: a colorized stdout layer (unless quiet) plus an
/// optional plain file layer. Returns the file writer's guard, which the
/// caller must keep alive.
fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let mut guard = None;
    let file_layer = match &args.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let filename = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path has no file name"))?;
            let appender = tracing_appender::rolling::never(directory, filename);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(log_level)
                    .boxed(),
            )
        }
        None => None,
    };

    let stdout_layer = (!args.quiet).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .event_format(HarnessFormatter)
            .with_filter(log_level)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}
