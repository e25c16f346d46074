//! Error types for sphero-wire.

use thiserror::Error;

/// Main error type for all sphero-wire operations.
#[derive(Debug, Error)]
pub enum SpheroError {
    /// The connector failed on every connection attempt.
    #[error("Transport unavailable after {attempts} connection attempts")]
    TransportUnavailable {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The peer closed the stream or an I/O error occurred on it.
    #[error("Transport closed")]
    TransportClosed,

    /// A decoded frame failed checksum verification.
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum byte carried by the frame.
        actual: u8,
    },

    /// Payload does not fit in a single frame.
    #[error("Invalid payload size: {0} bytes (maximum 254)")]
    InvalidPayloadSize(usize),

    /// Operation requires a connected device.
    #[error("Not connected")]
    NotConnected,

    /// Another `connect()` is already running on this connection.
    #[error("Connection attempt already in progress")]
    ConnectInProgress,

    /// A request with this sequence number is still waiting for its answer.
    #[error("Sequence {0:#04x} already has a pending request")]
    SequenceInUse(u8),

    /// The device did not answer in time.
    #[error("No answer for sequence {sequence:#04x} before timeout")]
    ResponseTimeout {
        /// Sequence number of the unanswered request.
        sequence: u8,
    },

    /// One or more listeners panicked while an event was published.
    #[error("{failed} of {total} listeners panicked")]
    ListenerPanicked {
        /// Listeners that panicked.
        failed: usize,
        /// Listeners invoked.
        total: usize,
    },

    /// I/O error raised by a connector.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid JSON configuration.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl SpheroError {
    /// Whether this error means the transport is gone and the connection
    /// must be torn down.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, SpheroError::TransportClosed | SpheroError::Io(_))
    }
}

/// Result type alias using SpheroError.
pub type Result<T> = std::result::Result<T, SpheroError>;
