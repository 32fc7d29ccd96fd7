//! Logstash Shipper - forwards newline-delimited JSON from stdin to a collector
//!
//! Every line read from stdin becomes one log record. JSON objects are
//! forwarded as they are; any other line is wrapped as `{"message": <line>}`.
//!
//! ## Features
//!
//! - Stream (TCP + TLS) or HTTP(S) delivery, chosen from the configured host
//! - Size-based and time-based flushing
//! - Records kept and retried until the collector confirms them
//! - Final flush on EOF or Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `LOGSTASH_SHIPPER_HOST`: Collector host or `http(s)://` URL (default: localhost)
//! - `LOGSTASH_SHIPPER_PORT`: Collector port for stream hosts (default: 5000)
//! - `LOGSTASH_SHIPPER_BATCH_SIZE`: Records per flush (default: 100)
//! - `LOGSTASH_SHIPPER_FLUSH_INTERVAL_SECS`: Seconds between flushes (default: 5)
//! - `LOGSTASH_SHIPPER_TOKEN`: Static API token (default: unset)
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! See [`logstash_shipper::config::Config`] for the full list.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use logstash_shipper::config::Config;
use logstash_shipper::coordinator::{DeliveryCoordinator, Headers};
use logstash_shipper::record::LogRecord;

/// Upper bound on the final flush at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between final flush attempts while a flush is still in progress
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Logstash Shipper...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                host = %config.host,
                port = config.port,
                batch_size = config.batch_size,
                flush_interval_secs = config.flush_interval.as_secs(),
                token = config.auth_token.is_some(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let batch_size = config.batch_size;
    let flush_interval = config.flush_interval;

    let coordinator = match DeliveryCoordinator::configure(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!(error = %e, "Failed to configure delivery");
            std::process::exit(1);
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut since_flush: usize = 0;
    let mut forwarded: u64 = 0;

    info!(destination = %coordinator.destination(), "Forwarding stdin. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(record) = parse_line(&line) else {
                        continue;
                    };
                    coordinator.append(record);
                    forwarded += 1;
                    since_flush += 1;

                    if since_flush >= batch_size {
                        debug!(records = since_flush, "Batch size reached, flushing");
                        request_flush(&coordinator);
                        since_flush = 0;
                    }
                }
                Ok(None) => {
                    info!("Input closed, stopping...");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            },
            _ = ticker.tick() => {
                // Also retries records left over from failed flushes.
                request_flush(&coordinator);
                since_flush = 0;
            }
            result = &mut shutdown => {
                match result {
                    Ok(()) => info!("Shutdown signal received, stopping..."),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                break;
            }
        }
    }

    // Graceful shutdown
    info!(forwarded = forwarded, "Initiating graceful shutdown...");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, drain(&coordinator)).await {
        Ok(Ok(())) => info!("All records delivered"),
        Ok(Err(e)) => warn!(error = %e, "Final flush failed"),
        Err(_) => warn!("Final flush timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    if let Ok(stats) = coordinator.stats().await {
        info!(
            appended = stats.appended,
            delivered = stats.delivered,
            dropped = stats.dropped,
            pending = stats.pending,
            "Logstash Shipper stopped"
        );
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        // Stdout may be piped onward; keep logs on stderr.
        .with_writer(std::io::stderr)
        .init();
}

/// Turn one input line into a record. Blank lines are skipped.
fn parse_line(line: &str) -> Option<LogRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let record = match serde_json::from_str::<Value>(line) {
        Ok(value) => LogRecord::try_from(value)
            .unwrap_or_else(|_| LogRecord::new().with("message", line)),
        Err(_) => LogRecord::new().with("message", line),
    };
    Some(record)
}

/// Start a flush without waiting for it.
fn request_flush(coordinator: &DeliveryCoordinator) {
    coordinator.force_send(Headers::new(), |result| match result {
        Ok(()) => debug!("Flush completed"),
        Err(e) => warn!(error = %e, "Flush failed, records kept for retry"),
    });
}

/// Flush until nothing is pending.
///
/// A flush requested while another is still writing completes at once, so
/// keep asking until the buffer is empty or a flush fails.
async fn drain(coordinator: &DeliveryCoordinator) -> Result<(), logstash_shipper::DeliveryError> {
    loop {
        coordinator.flush(Headers::new()).await?;
        if coordinator.stats().await?.pending == 0 {
            return Ok(());
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}
