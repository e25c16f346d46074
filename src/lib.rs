//! # sphero-wire
//!
//! Async client for the Sphero binary command protocol.
//!
//! This crate talks to a robot over any byte stream (an RFCOMM relay, a
//! serial-to-TCP bridge, a simulator socket) and handles framing, checksums
//! and connection lifecycle.
//!
//! ## Architecture
//!
//! - **Codec** ([`protocol`]): bit-exact frame encode/decode, incremental
//!   [`FrameBuffer`] with resynchronization
//! - **Events** ([`events`]): typed publish/subscribe for connect,
//!   disconnect and collision notifications
//! - **Connection** ([`Connection`]): bounded connect retries, serialized
//!   writes, a background receive loop and exactly-once teardown
//!
//! ## Example
//!
//! ```ignore
//! use sphero_wire::{Collision, ConnectionBuilder, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> sphero_wire::Result<()> {
//!     let connection = ConnectionBuilder::new("127.0.0.1:4000")
//!         .max_connect_attempts(5)
//!         .build(TcpConnector::new());
//!
//!     connection.on_disconnect(|| println!("link lost"));
//!     connection.on_collision(|c: &Collision| println!("bump at ({}, {})", c.x, c.y));
//!
//!     connection.connect().await?;
//!
//!     // Set RGB LED to red
//!     connection
//!         .send_frame(0x02, 0x20, 0x00, &[0xFF, 0x00, 0x00, 0x00], false, true)
//!         .await?;
//!
//!     connection.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transport;

mod connection;
mod receiver;
mod stats;
mod writer;

pub use command::{Command, RawCommand};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionBuilder, ConnectionState, DisconnectOutcome};
pub use error::{Result, SpheroError};
pub use events::{Collision, EventBus, Listener};
pub use protocol::{decode, decode_frame, encode, Frame, FrameBuffer};
pub use stats::ConnectionStats;
#[cfg(unix)]
pub use transport::UnixConnector;
pub use transport::{Connector, TcpConnector};
