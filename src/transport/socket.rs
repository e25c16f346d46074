//! Socket connectors.
//!
//! - TCP: `host:port`, e.g. a serial-to-TCP bridge in front of the device
//! - Unix: Unix Domain Socket path, e.g. a local RFCOMM relay
//!
//! # Example
//!
//! ```ignore
//! use sphero_wire::transport::{Connector, TcpConnector};
//!
//! let connector = TcpConnector::new();
//! let stream = connector.connect("127.0.0.1:4000").await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::Connector;
use crate::error::Result;

// ============================================================================
// TCP
// ============================================================================

/// Connector for `host:port` addresses.
#[derive(Debug, Default)]
pub struct TcpConnector {
    connected: AtomicBool,
    nodelay: bool,
}

impl TcpConnector {
    /// Create a connector with Nagle's algorithm enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable Nagle's algorithm on every stream this connector opens.
    ///
    /// Frames are small, so this trades bandwidth for latency.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(address).await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        self.connected.store(true, Ordering::Release);
        tracing::debug!(address, "TCP stream opened");
        Ok(stream)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::net::UnixStream;

    /// Connector for Unix Domain Socket paths.
    #[derive(Debug, Default)]
    pub struct UnixConnector {
        connected: AtomicBool,
    }

    impl UnixConnector {
        /// Create a connector.
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Connector for UnixConnector {
        type Stream = UnixStream;

        async fn connect(&self, address: &str) -> Result<UnixStream> {
            let stream = UnixStream::connect(address).await?;
            self.connected.store(true, Ordering::Release);
            tracing::debug!(path = address, "Unix stream opened");
            Ok(stream)
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::Release);
            Ok(())
        }

        #[inline]
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }
    }
}

#[cfg(unix)]
pub use unix_impl::UnixConnector;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpheroError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = TcpConnector::new().nodelay(true);
        assert!(!connector.is_connected());

        let mut stream = connector.connect(&addr).await.unwrap();
        assert!(connector.is_connected());
        stream.write_all(&[0xFF, 0xFF, 0x00]).await.unwrap();

        assert_eq!(server.await.unwrap(), [0xFF, 0xFF, 0x00]);

        connector.disconnect().await.unwrap();
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = TcpConnector::new();
        let result = connector.connect(&addr).await;
        assert!(matches!(result, Err(SpheroError::Io(_))));
        assert!(!connector.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_connect() {
        use tokio::net::UnixListener;

        let path = format!(
            "/tmp/sphero-wire-{}-{:x}.sock",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        );
        let listener = UnixListener::bind(&path).unwrap();

        let connector = UnixConnector::new();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let _stream = connector.connect(&path).await.unwrap();
        accept.await.unwrap().unwrap();
        assert!(connector.is_connected());

        let _ = std::fs::remove_file(&path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_connect_missing_path() {
        let connector = UnixConnector::new();
        let result = connector.connect("/tmp/sphero-wire-does-not-exist.sock").await;
        assert!(matches!(result, Err(SpheroError::Io(_))));
    }
}
