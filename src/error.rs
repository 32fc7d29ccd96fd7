//! Error taxonomy for the delivery subsystem.
//!
//! Connection errors (TCP connect, TLS handshake, socket failures on an
//! established session) reach a pending completion through the disconnect
//! path. Transport errors (HTTP request failures and non-2xx responses) are
//! handed to the completion of the flush that posted the batch. In both cases
//! the buffered records stay pending and the next flush retries them.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by transports and the delivery coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// TCP connection could not be established in time.
    #[error("Could not connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// TLS upgrade of an open connection failed.
    #[error("TLS handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    /// Socket failure on an established session.
    #[error("Connection failed: {0}")]
    Io(String),

    /// A write was attempted while the channel was not secure.
    #[error("Connection was not secure, write skipped")]
    WriteSkipped,

    /// HTTP request failed before a response was received.
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// Collector answered with a non-success status code.
    #[error("Collector responded with status {status}: {body}")]
    Status { status: u16, body: String },

    /// Staged payload could not be written or read back.
    #[error("Failed to stage payload: {0}")]
    Staging(String),

    /// A record could not be encoded.
    #[error("Failed to serialize record: {0}")]
    Serialization(String),

    /// The queued flush was cancelled before it started.
    #[error("Sending was cancelled")]
    Cancelled,

    /// The delivery worker is no longer running.
    #[error("Delivery coordinator has shut down")]
    Shutdown,

    /// The configuration names an unusable destination.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No tokio runtime was entered when the coordinator was configured.
    #[error("No async runtime available: {0}")]
    Runtime(String),
}

impl DeliveryError {
    /// Connect, handshake or socket failure.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DeliveryError::Connect { .. } | DeliveryError::Handshake { .. } | DeliveryError::Io(_)
        )
    }

    /// HTTP-level failure of a batch POST.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            DeliveryError::Request(_) | DeliveryError::Status { .. } | DeliveryError::Staging(_)
        )
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Request("request timed out".to_string())
        } else {
            DeliveryError::Request(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}
