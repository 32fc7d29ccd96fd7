//! Logstash Shipper Library
//!
//! This library ships structured log records to a Logstash-compatible
//! collector:
//!
//! - **config**: Destination and delivery settings, from code or environment
//! - **record**: Schema-less log records and their newline-delimited JSON frames
//! - **buffer**: Tag-keyed store of records awaiting confirmed delivery
//! - **dispatch**: Strictly ordered single-worker job queue
//! - **transport**: Connection lifecycle shared by both transports
//! - **stream**: TCP connection upgraded to TLS, with acknowledged writes
//! - **http**: Batch POSTs of staged payload files
//! - **coordinator**: Producer facade reconciling the buffer with delivery
//!
//! # Example
//!
//! ```no_run
//! use logstash_shipper::config::Config;
//! use logstash_shipper::coordinator::{DeliveryCoordinator, Headers};
//! use logstash_shipper::record::LogRecord;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let coordinator = DeliveryCoordinator::configure(config).expect("Failed to configure");
//!
//!     coordinator.append(LogRecord::new().with("message", "service started"));
//!
//!     // Records stay buffered until the collector confirms them
//!     if let Err(e) = coordinator.flush(Headers::new()).await {
//!         eprintln!("flush failed: {}", e);
//!     }
//! }
//! ```

// Module declarations
pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod record;
pub mod stream;
pub mod tls;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use buffer::{BufferStats, RecordBuffer, Tag};
pub use config::{Config, ConfigError, Destination};
pub use coordinator::{Completion, DeliveryCoordinator, Headers};
pub use error::DeliveryError;
pub use record::LogRecord;
