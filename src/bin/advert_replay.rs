//! Advertisement replay tool
//!
//! Streams a recorded JSONL capture into a running beacon-presence intake,
//! one record per `--delay-ms`. Lines that do not parse as advertisements are
//! skipped with a warning so partially damaged captures still replay.
//!
//! Usage:
//!   cargo run --bin advert-replay -- capture.jsonl
//!   cargo run --bin advert-replay -- capture.jsonl --addr 10.0.0.5:25804 --delay-ms 50 --repeat 3

use anyhow::Context;
use beacon_presence::io::parse_advert_line;
use clap::Parser;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "advert-replay")]
#[command(about = "Replay recorded advertisements into the presence intake")]
struct Args {
    /// JSONL capture, one advertisement per line
    file: String,

    /// Intake address
    #[arg(short, long, default_value = "127.0.0.1:25804")]
    addr: String,

    /// Pause between records
    #[arg(short, long, default_value_t = 100)]
    delay_ms: u64,

    /// Number of passes over the capture
    #[arg(short, long, default_value_t = 1)]
    repeat: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();

    let content = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("Failed to read capture {}", args.file))?;

    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_advert_line(line) {
            Ok(_) => records.push(line.trim().to_string()),
            Err(e) => warn!(line = lineno + 1, error = %e, "capture_line_skipped"),
        }
    }
    info!(file = %args.file, records = records.len(), "capture_loaded");

    let mut stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("Failed to connect to {}", args.addr))?;
    info!(addr = %args.addr, "intake_connected");

    let delay = Duration::from_millis(args.delay_ms);
    let mut sent = 0usize;
    for pass in 0..args.repeat {
        for record in &records {
            stream.write_all(record.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            sent += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        info!(pass = pass + 1, sent, "replay_pass_complete");
    }

    stream.shutdown().await?;
    info!(sent, "replay_complete");
    Ok(())
}
