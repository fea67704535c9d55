//! Command-line interface for the `blip-echo` harness.
//!
//! The harness drives a pair of loopback-connected endpoints: a configurable
//! number of echoer actors each send one patterned request and verify the
//! echoed response. Arguments mirror the knobs of the protocol engine that
//! matter for exercising it (message size, frame size, urgency, simulated
//! transport latency).

use clap::Parser;
use std::path::PathBuf;

/// Echo stress harness for the blip-mux protocol engine.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of concurrent echoer actors, each sending one request
    #[arg(short = 'n', long, default_value_t = crate::defaults::ECHOERS)]
    pub echoers: usize,

    /// Request body size in bytes
    #[arg(short = 's', long, default_value_t = crate::defaults::MESSAGE_SIZE)]
    pub message_size: usize,

    /// Simulated one-way transport latency in milliseconds (0 disables)
    #[arg(short = 'l', long, default_value_t = 0)]
    pub latency_ms: u64,

    /// Maximum frame payload size in bytes
    #[arg(long, default_value_t = crate::protocol::DEFAULT_FRAME_SIZE)]
    pub frame_size: usize,

    /// Send the requests with the urgent flag set
    #[arg(long)]
    pub urgent: bool,

    /// Verbosity: -v for debug, -vv for per-frame trace output
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress console output
    #[arg(short, long)]
    pub quiet: bool,

    /// Also write detailed logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Write a JSON run summary to this file
    #[arg(short = 'o', long)]
    pub output_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["blip-echo"]);
        assert_eq!(args.echoers, crate::defaults::ECHOERS);
        assert_eq!(args.message_size, crate::defaults::MESSAGE_SIZE);
        assert!(!args.urgent);
    }

    #[test]
    fn overrides_parse() {
        let args = Args::parse_from([
            "blip-echo",
            "-n",
            "4",
            "-s",
            "1024",
            "--latency-ms",
            "50",
            "--urgent",
        ]);
        assert_eq!(args.echoers, 4);
        assert_eq!(args.message_size, 1024);
        assert_eq!(args.latency_ms, 50);
        assert!(args.urgent);
    }
}
