//! Transport Port
//!
//! Raw text-message connection to the upstream venue.

use async_trait::async_trait;

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The upstream closed the connection or the transport was closed locally.
    #[error("upstream stream ended")]
    EndOfStream,

    /// Non-terminal read or write failure.
    #[error("upstream I/O error: {0}")]
    Io(String),

    /// Connection could not be established.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Endpoint that was dialled.
        url: String,
        /// Underlying failure.
        message: String,
    },
}

impl TransportError {
    /// Whether the connection is gone for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Connect { .. })
    }
}

/// Upstream connection capability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next inbound text message.
    ///
    /// Returns [`TransportError::EndOfStream`] once the connection is gone,
    /// including after [`Transport::close`].
    async fn recv(&self) -> Result<String, TransportError>;

    /// Queue one outbound text message without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be queued.
    fn send(&self, message: String) -> Result<(), TransportError>;

    /// Tear down the connection, unblocking any pending `recv`.
    fn close(&self);
}
