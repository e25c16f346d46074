//! Transport module - how a [`Connection`](crate::Connection) obtains its
//! byte stream.
//!
//! Provides:
//! - [`Connector`]: async trait producing a duplex stream for an address
//! - [`TcpConnector`]: `host:port` sockets (serial bridges, simulators)
//! - [`UnixConnector`]: Unix Domain Sockets (Linux/macOS)

mod socket;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

#[cfg(unix)]
pub use socket::UnixConnector;
pub use socket::TcpConnector;

/// Source of byte streams to a device.
///
/// The connection calls [`connect`](Self::connect) once per attempt and
/// [`disconnect`](Self::disconnect) once when it releases the stream.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Duplex byte stream to the device.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a stream to `address`.
    async fn connect(&self, address: &str) -> Result<Self::Stream>;

    /// Release any device-side resources after the stream was dropped.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Informational link state as seen by the connector.
    fn is_connected(&self) -> bool {
        false
    }
}
