//! Common contract of the streaming and HTTP transports.

use std::sync::Arc;

use crate::buffer::Tag;
use crate::error::DeliveryError;

/// Notifications a transport delivers out of the caller's call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// TCP connection established.
    Connected,
    /// TLS upgrade completed; writes are now accepted.
    Secured,
    /// The write carrying `Tag` was flushed to the peer.
    Wrote(Tag),
    /// The session ended, cleanly (`None`) or with an error.
    Disconnected(Option<DeliveryError>),
}

/// Callback through which a transport reports [`TransportEvent`]s.
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Connection lifecycle shared by every transport.
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    fn is_secure(&self) -> bool;

    /// Start opening the channel.
    ///
    /// Failures that happen once the attempt is under way arrive as
    /// [`TransportEvent::Disconnected`].
    fn connect(&self) -> Result<(), DeliveryError>;

    /// Close immediately, abandoning queued writes.
    fn disconnect(&self);

    /// Close once every queued write has been flushed.
    fn disconnect_after_pending_writes(&self);
}
