//! Connection builder and lifecycle.
//!
//! The [`ConnectionBuilder`] collects a [`ConnectionConfig`] and produces a
//! [`Connection`] bound to one [`Connector`]. The [`Connection`] manages the
//! lifecycle:
//! 1. Open a stream through the connector (bounded retries)
//! 2. Install the write half, spawn the receive loop on the read half
//! 3. Publish connect, collision and disconnect events
//! 4. Tear everything down exactly once, whoever notices the end first
//!
//! # Example
//!
//! ```ignore
//! use sphero_wire::{ConnectionBuilder, RawCommand, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> sphero_wire::Result<()> {
//!     let connection = ConnectionBuilder::new("127.0.0.1:4000")
//!         .max_connect_attempts(3)
//!         .build(TcpConnector::new());
//!
//!     connection.on_collision(|c: &sphero_wire::Collision| {
//!         println!("bump at ({}, {})", c.x, c.y);
//!     });
//!
//!     connection.connect().await?;
//!     connection.send(&RawCommand::new(0x02, 0x20, vec![0xFF, 0x00, 0x00, 0x01])).await?;
//!     connection.disconnect().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::error::{Result, SpheroError};
use crate::events::{Collision, EventBus, Listener};
use crate::protocol::Frame;
use crate::receiver;
use crate::stats::{ConnectionStats, StatsCounters};
use crate::transport::Connector;
use crate::writer::FrameWriter;

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            CONNECTING => Self::Connecting,
            CONNECTED => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Result of [`Connection::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// This call tore the connection down and published the event.
    Disconnected,
    /// The connection was not connected; nothing was done.
    AlreadyDisconnected,
}

/// Builder for configuring and creating a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    address: String,
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Create a builder for the given device address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            config: ConnectionConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of connect attempts.
    ///
    /// Default: 5
    pub fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_connect_attempts = attempts;
        self
    }

    /// Set the delay between connect attempts.
    ///
    /// Default: no delay
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the factor applied to the retry delay after each failure.
    ///
    /// Default: 1.0
    pub fn retry_backoff(mut self, factor: f64) -> Self {
        self.config.retry_backoff = factor;
        self
    }

    /// Set the answer flag used by [`Connection::send`].
    ///
    /// Default: false
    pub fn request_ack(mut self, request_ack: bool) -> Self {
        self.config.request_ack = request_ack;
        self
    }

    /// Set the reset-timer flag used by [`Connection::send`].
    ///
    /// Default: true
    pub fn reset_timer(mut self, reset_timer: bool) -> Self {
        self.config.reset_timer = reset_timer;
        self
    }

    /// Set the receive loop's read buffer capacity.
    ///
    /// Default: 1024
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Build a disconnected connection using `connector` for transport.
    pub fn build<C: Connector>(self, connector: C) -> Connection<C> {
        Connection {
            shared: Arc::new(Shared::new(self.address, self.config, connector)),
        }
    }
}

/// Logical link to one device.
///
/// All methods take `&self`; wrap the connection in an [`Arc`] to drive it
/// from several tasks.
pub struct Connection<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Connection<C> {
    /// Create a connection with default configuration.
    pub fn new(address: impl Into<String>, connector: C) -> Self {
        ConnectionBuilder::new(address).build(connector)
    }

    /// Open the link, retrying up to `max_connect_attempts` times.
    ///
    /// An already connected link is disconnected first. On success the
    /// statistics and device state are reset, the receive loop is running
    /// and the connect event has been published.
    ///
    /// # Errors
    ///
    /// - [`SpheroError::ConnectInProgress`] if another connect is running
    /// - [`SpheroError::TransportUnavailable`] once every attempt failed
    pub async fn connect(&self) -> Result<()> {
        self.shared.connect().await
    }

    /// Tear the link down. Idempotent.
    ///
    /// When this returns the receive loop has terminated, whichever caller
    /// performed the teardown.
    pub async fn disconnect(&self) -> DisconnectOutcome {
        self.shared.disconnect().await
    }

    /// Encode and write one frame.
    ///
    /// # Errors
    ///
    /// - [`SpheroError::InvalidPayloadSize`] before any I/O
    /// - [`SpheroError::NotConnected`] unless connected
    /// - [`SpheroError::TransportClosed`] if the write failed; the link has
    ///   been disconnected by the time this is returned
    pub async fn send_frame(
        &self,
        device_id: u8,
        command_id: u8,
        sequence: u8,
        payload: &[u8],
        request_ack: bool,
        reset_timer: bool,
    ) -> Result<()> {
        let frame = Frame::new(
            device_id,
            command_id,
            sequence,
            payload.to_vec(),
            request_ack,
            reset_timer,
        )?;
        self.shared.send(&frame).await
    }

    /// Send a command with the configured default flags.
    ///
    /// Each call takes the next value of an internal wrapping sequence
    /// counter.
    pub async fn send<M: Command + ?Sized>(&self, command: &M) -> Result<()> {
        let config = &self.shared.config;
        let frame = Frame::new(
            command.device_id(),
            command.command_id(),
            self.shared.next_sequence(),
            command.payload(),
            config.request_ack,
            config.reset_timer,
        )?;
        self.shared.send(&frame).await
    }

    /// Send a frame requesting an answer and wait for it.
    ///
    /// The answer is matched on `sequence`.
    ///
    /// # Errors
    ///
    /// - [`SpheroError::SequenceInUse`] if `sequence` is already awaited
    /// - [`SpheroError::ResponseTimeout`] if no answer arrives in time
    /// - [`SpheroError::TransportClosed`] if the link drops while waiting
    pub async fn request(
        &self,
        device_id: u8,
        command_id: u8,
        sequence: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Frame> {
        let frame = Frame::new(device_id, command_id, sequence, payload.to_vec(), true, true)?;
        self.shared.request(&frame, timeout).await
    }

    /// Check if the link is up.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Device address this connection was built for.
    #[inline]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Configuration in effect.
    #[inline]
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Connector used to open streams.
    #[inline]
    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    /// Snapshot of the counters since the last successful connect.
    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats.snapshot()
    }

    /// Last collision reported since the last successful connect.
    pub fn last_collision(&self) -> Option<Collision> {
        *lock(&self.shared.last_collision)
    }

    /// Call `f` every time the link comes up.
    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.on_connect.subscribe(move |_: &()| f());
    }

    /// Call `f` every time the link goes down.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.on_disconnect.subscribe(move |_: &()| f());
    }

    /// Register a collision listener.
    pub fn on_collision<L>(&self, listener: L)
    where
        L: Listener<Collision>,
    {
        self.shared.on_collision.subscribe(listener);
    }

    /// Remove every registered listener.
    pub fn clear_listeners(&self) {
        self.shared.on_connect.clear();
        self.shared.on_disconnect.clear();
        self.shared.on_collision.clear();
    }
}

impl<C: Connector> Drop for Connection<C> {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.shared.session).as_ref() {
            session.cancel.cancel();
        }
    }
}

impl<C: Connector> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// Running receive loop.
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Waiter registered by [`Connection::request`].
struct PendingRequest {
    ticket: u64,
    tx: oneshot::Sender<Frame>,
}

/// State shared between the connection handle and its receive loop.
pub(crate) struct Shared<C> {
    pub(crate) address: String,
    pub(crate) config: ConnectionConfig,
    pub(crate) connector: C,
    pub(crate) stats: StatsCounters,
    pub(crate) last_collision: Mutex<Option<Collision>>,
    pub(crate) on_collision: EventBus<Collision>,
    on_connect: EventBus<()>,
    on_disconnect: EventBus<()>,
    state: AtomicU8,
    writer: FrameWriter,
    /// Held for a whole connect or teardown sequence.
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    pending: Mutex<HashMap<u8, PendingRequest>>,
    next_ticket: AtomicU64,
    sequence: AtomicU8,
}

impl<C: Connector> Shared<C> {
    pub(crate) fn new(address: String, config: ConnectionConfig, connector: C) -> Self {
        Self {
            address,
            config,
            connector,
            stats: StatsCounters::default(),
            last_collision: Mutex::new(None),
            on_collision: EventBus::new(),
            on_connect: EventBus::new(),
            on_disconnect: EventBus::new(),
            state: AtomicU8::new(DISCONNECTED),
            writer: FrameWriter::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            sequence: AtomicU8::new(0),
        }
    }

    #[inline]
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            self.disconnect().await;
        }

        if self
            .state
            .compare_exchange(DISCONNECTED, CONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SpheroError::ConnectInProgress);
        }

        let _lifecycle = self.lifecycle.lock().await;

        // A loop that tore itself down may still sit in the slot. It no
        // longer needs the lifecycle lock, so joining it here cannot block.
        let stale = lock(&self.session).take();
        if let Some(stale) = stale {
            stale.cancel.cancel();
            let _ = stale.task.await;
        }

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.state.store(DISCONNECTED, Ordering::Release);
                return Err(e);
            }
        };

        self.stats.reset();
        *lock(&self.last_collision) = None;

        let (read_half, write_half) = tokio::io::split(stream);
        self.writer.install(write_half).await;

        let cancel = CancellationToken::new();
        self.state.store(CONNECTED, Ordering::Release);
        let task = tokio::spawn(receiver::run(self.clone(), read_half, cancel.clone()));
        *lock(&self.session) = Some(Session { cancel, task });

        tracing::debug!(address = %self.address, "Connected");
        if let Err(e) = self.on_connect.publish(&()) {
            tracing::error!("Connect listeners failed: {}", e);
        }
        Ok(())
    }

    async fn open_stream(&self) -> Result<C::Stream> {
        let max_attempts = self.config.max_connect_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::debug!(address = %self.address, attempt, "Connecting");

            match self.connector.connect(&self.address).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::warn!(address = %self.address, attempt, "Connect attempt failed: {}", e);
                }
            }

            if attempt >= max_attempts {
                tracing::error!(address = %self.address, attempts = attempt, "Device unreachable");
                return Err(SpheroError::TransportUnavailable { attempts: attempt });
            }

            let delay = self.config.delay_after(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Tear down on behalf of anyone but the receive loop.
    ///
    /// The state guard is only moved under the lifecycle lock, so a connect
    /// or a loop teardown in progress always finishes first. Returns once
    /// the receive loop has terminated, whoever won the teardown.
    pub(crate) async fn disconnect(&self) -> DisconnectOutcome {
        if self.state() == ConnectionState::Connecting {
            return DisconnectOutcome::AlreadyDisconnected;
        }

        let _lifecycle = self.lifecycle.lock().await;
        let won = self
            .state
            .compare_exchange(CONNECTED, DISCONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        // Either the live loop, or one that already tore itself down and is
        // returning. A loop waiting for the lifecycle lock gives up once
        // cancelled, so this join cannot deadlock.
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                tracing::error!("Receive loop failed: {}", e);
            }
        }

        if !won {
            return DisconnectOutcome::AlreadyDisconnected;
        }
        self.teardown().await;
        DisconnectOutcome::Disconnected
    }

    /// Tear down after the receive loop lost its stream.
    ///
    /// Whoever cancels `cancel` owns the teardown and is joining the loop,
    /// so the wait for the lifecycle lock gives up on cancellation.
    pub(crate) async fn close_from_loop(&self, cancel: &CancellationToken) {
        let _lifecycle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            guard = self.lifecycle.lock() => guard,
        };

        if self
            .state
            .compare_exchange(CONNECTED, DISCONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // The loop cannot join itself; its session stays in the slot for the
        // next disconnect or connect to reap.
        self.teardown().await;
    }

    /// Release the write half and the device, then publish Disconnected.
    /// Runs under the lifecycle lock, once per connection.
    async fn teardown(&self) {
        self.writer.shutdown().await;

        if let Err(e) = self.connector.disconnect().await {
            tracing::warn!(address = %self.address, "Connector release failed: {}", e);
        }

        self.fail_pending();

        tracing::debug!(address = %self.address, "Disconnected");
        if let Err(e) = self.on_disconnect.publish(&()) {
            tracing::error!("Disconnect listeners failed: {}", e);
        }
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(SpheroError::NotConnected);
        }

        match self.writer.write_frame(frame).await {
            Ok(_) => {
                self.stats.record_sent();
                Ok(())
            }
            Err(e) if e.is_transport_failure() => {
                self.disconnect().await;
                Err(SpheroError::TransportClosed)
            }
            Err(e) => Err(e),
        }
    }

    async fn request(&self, frame: &Frame, timeout: Duration) -> Result<Frame> {
        if self.state() != ConnectionState::Connected {
            return Err(SpheroError::NotConnected);
        }

        let sequence = frame.sequence();
        let (ticket, rx) = self.register_pending(sequence)?;

        if let Err(e) = self.send(frame).await {
            self.remove_pending(sequence, ticket);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(SpheroError::TransportClosed),
            Err(_) => {
                self.remove_pending(sequence, ticket);
                tracing::warn!(sequence, "Request timed out");
                Err(SpheroError::ResponseTimeout { sequence })
            }
        }
    }

    fn register_pending(&self, sequence: u8) -> Result<(u64, oneshot::Receiver<Frame>)> {
        let mut pending = lock(&self.pending);

        // An entry whose waiter went away is free to reuse.
        if let Some(existing) = pending.get(&sequence) {
            if !existing.tx.is_closed() {
                return Err(SpheroError::SequenceInUse(sequence));
            }
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(sequence, PendingRequest { ticket, tx });
        Ok((ticket, rx))
    }

    fn remove_pending(&self, sequence: u8, ticket: u64) {
        let mut pending = lock(&self.pending);
        if pending.get(&sequence).map(|p| p.ticket) == Some(ticket) {
            pending.remove(&sequence);
        }
    }

    /// Hand an answer frame to its waiter.
    ///
    /// Returns the frame back if nobody is waiting for its sequence.
    pub(crate) fn complete_pending(&self, frame: Frame) -> std::result::Result<(), Frame> {
        let waiter = lock(&self.pending).remove(&frame.sequence());
        match waiter {
            Some(waiter) => waiter.tx.send(frame),
            None => Err(frame),
        }
    }

    /// Drop every waiter; their requests fail with `TransportClosed`.
    fn fail_pending(&self) {
        let failed = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        if failed > 0 {
            tracing::debug!(failed, "Failed pending requests");
        }
    }
}

/// Lock a std mutex, ignoring poisoning.
///
/// Listeners never run under these locks, so a poisoned guard still holds
/// consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use async_trait::async_trait;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    use crate::command::RawCommand;
    use crate::protocol::encode;

    /// Connector handing out in-memory streams; the device ends go to the test.
    struct TestConnector {
        peers: mpsc::UnboundedSender<DuplexStream>,
        attempts: AtomicU32,
        fail_first: u32,
        releases: AtomicU32,
    }

    impl TestConnector {
        fn new(fail_first: u32) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
            let (peers, rx) = mpsc::unbounded_channel();
            let connector = Self {
                peers,
                attempts: AtomicU32::new(0),
                fail_first,
                releases: AtomicU32::new(0),
            };
            (connector, rx)
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _address: &str) -> Result<DuplexStream> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                return Err(SpheroError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "device busy",
                )));
            }
            let (ours, theirs) = duplex(4096);
            let _ = self.peers.send(theirs);
            Ok(ours)
        }

        async fn disconnect(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_builder_configuration() {
        let builder = ConnectionBuilder::new("68:86:E7:00:00:01")
            .max_connect_attempts(7)
            .retry_delay(Duration::from_millis(10))
            .retry_backoff(1.5)
            .request_ack(true)
            .reset_timer(false)
            .read_buffer_size(256);

        assert_eq!(builder.address, "68:86:E7:00:00:01");
        assert_eq!(builder.config.max_connect_attempts, 7);
        assert_eq!(builder.config.retry_delay, Duration::from_millis(10));
        assert_eq!(builder.config.retry_backoff, 1.5);
        assert!(builder.config.request_ack);
        assert!(!builder.config.reset_timer);
        assert_eq!(builder.config.read_buffer_size, 256);
    }

    #[tokio::test]
    async fn test_new_connection_is_disconnected() {
        let (connector, _peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.is_connected());
        assert_eq!(connection.address(), "dev");
        assert_eq!(connection.last_collision(), None);
        assert_eq!(connection.stats(), ConnectionStats::default());
    }

    #[tokio::test]
    async fn test_connect_publishes_once() {
        let (connector, _peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        let (connects, on_connect) = counter();
        connection.on_connect(on_connect);

        connection.connect().await.unwrap();

        assert!(connection.is_connected());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let (connector, _peers) = TestConnector::new(2);
        let connection = Connection::new("dev", connector);

        connection.connect().await.unwrap();

        assert_eq!(connection.connector().attempts.load(Ordering::SeqCst), 3);
        assert!(connection.is_connected());
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_exhausts_attempts() {
        let (connector, _peers) = TestConnector::new(u32::MAX);
        let connection = ConnectionBuilder::new("dev")
            .max_connect_attempts(4)
            .build(connector);
        let (connects, on_connect) = counter();
        connection.on_connect(on_connect);

        let result = connection.connect().await;

        assert!(matches!(
            result,
            Err(SpheroError::TransportUnavailable { attempts: 4 })
        ));
        assert_eq!(connection.connector().attempts.load(Ordering::SeqCst), 4);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_backoff_sleeps() {
        let (connector, _peers) = TestConnector::new(u32::MAX);
        let connection = ConnectionBuilder::new("dev")
            .max_connect_attempts(3)
            .retry_delay(Duration::from_millis(100))
            .retry_backoff(2.0)
            .build(connector);

        let start = tokio::time::Instant::now();
        assert!(connection.connect().await.is_err());

        // 100ms after the first failure, 200ms after the second, none after the last
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let (connector, _peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);

        let result = connection.send_frame(0x00, 0x01, 0x00, &[], false, false).await;
        assert!(matches!(result, Err(SpheroError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_oversized_payload() {
        let (connector, _peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);

        let result = connection
            .send_frame(0x02, 0x20, 0x00, &[0u8; 255], false, false)
            .await;
        assert!(matches!(result, Err(SpheroError::InvalidPayloadSize(255))));
    }

    #[tokio::test]
    async fn test_send_frame_reaches_device() {
        let (connector, mut peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        connection.connect().await.unwrap();
        let mut device = peers.recv().await.unwrap();

        connection
            .send_frame(0x02, 0x20, 0x00, &[0x00, 0xFF, 0x10, 0x01], false, false)
            .await
            .unwrap();

        let mut buf = [0u8; 11];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            [0xFF, 0xFC, 0x02, 0x20, 0x00, 0x05, 0x00, 0xFF, 0x10, 0x01, 0xC8]
        );
        assert_eq!(connection.stats().frames_sent, 1);

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_command_uses_default_flags() {
        let (connector, mut peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        connection.connect().await.unwrap();
        let mut device = peers.recv().await.unwrap();

        connection.send(&RawCommand::empty(0x00, 0x01)).await.unwrap();
        connection.send(&RawCommand::empty(0x00, 0x01)).await.unwrap();

        let mut buf = [0u8; 14];
        device.read_exact(&mut buf).await.unwrap();
        // reset_timer on, answer off
        assert_eq!(buf[1], 0xFE);
        assert_eq!(buf[4], 0);
        assert_eq!(buf[8], 0xFE);
        assert_eq!(buf[11], 1);

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_twice_publishes_once() {
        let (connector, _peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        let (disconnects, on_disconnect) = counter();
        connection.on_disconnect(on_disconnect);

        connection.connect().await.unwrap();
        assert_eq!(connection.disconnect().await, DisconnectOutcome::Disconnected);
        assert_eq!(
            connection.disconnect().await,
            DisconnectOutcome::AlreadyDisconnected
        );

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(connection.connector().releases.load(Ordering::SeqCst), 1);
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_never_connected() {
        let (connector, _peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        let (disconnects, on_disconnect) = counter();
        connection.on_disconnect(on_disconnect);

        assert_eq!(
            connection.disconnect().await,
            DisconnectOutcome::AlreadyDisconnected
        );
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconnect_disconnects_first() {
        let (connector, _peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        let (connects, on_connect) = counter();
        let (disconnects, on_disconnect) = counter();
        connection.on_connect(on_connect);
        connection.on_disconnect(on_disconnect);

        connection.connect().await.unwrap();
        connection.connect().await.unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(connection.is_connected());
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_peer_close_disconnects() {
        let (connector, mut peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_disconnect(move || {
            let _ = tx.send(());
        });

        connection.connect().await.unwrap();
        drop(peers.recv().await.unwrap());

        rx.recv().await.unwrap();
        assert!(!connection.is_connected());
        assert_eq!(
            connection.disconnect().await,
            DisconnectOutcome::AlreadyDisconnected
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_loop_waiting_for_teardown_yields_to_cancel() {
        let (connector, mut peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        connection.connect().await.unwrap();

        let held = connection.shared.lifecycle.lock().await;
        drop(peers.recv().await.unwrap());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // The loop hit EOF and is parked on the lifecycle lock we hold.
        let session = lock(&connection.shared.session).take().unwrap();
        session.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), session.task)
            .await
            .expect("receive loop ignored cancellation")
            .unwrap();

        // Cancelled before it could move the state, so no teardown ran
        assert_eq!(connection.state(), ConnectionState::Connected);
        drop(held);
        assert_eq!(connection.disconnect().await, DisconnectOutcome::Disconnected);
    }

    #[tokio::test]
    async fn test_write_failure_disconnects() {
        let (connector, mut peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        let (disconnects, on_disconnect) = counter();
        connection.on_disconnect(on_disconnect);

        connection.connect().await.unwrap();
        let device = peers.recv().await.unwrap();
        drop(device);

        // Either the loop saw EOF first or the write fails; both end disconnected.
        let result = connection.send_frame(0x00, 0x01, 0x00, &[], false, false).await;
        assert!(matches!(
            result,
            Err(SpheroError::TransportClosed) | Err(SpheroError::NotConnected)
        ));
        connection.disconnect().await;

        assert!(!connection.is_connected());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_answered() {
        let (connector, mut peers) = TestConnector::new(0);
        let connection = Arc::new(Connection::new("dev", connector));
        connection.connect().await.unwrap();
        let mut device = peers.recv().await.unwrap();

        let device_task = tokio::spawn(async move {
            let mut request = [0u8; 7];
            device.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], 0xFF);
            let answer = encode(0x00, 0x00, request[4], &[0x01, 0x02], true, true).unwrap();
            device.write_all(&answer).await.unwrap();
            device
        });

        let answer = connection
            .request(0x00, 0x01, 0x2A, &[], Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(answer.sequence(), 0x2A);
        assert_eq!(answer.payload(), &[0x01, 0x02]);
        let _device = device_task.await.unwrap();
        connection.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (connector, mut peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        connection.connect().await.unwrap();
        let _device = peers.recv().await.unwrap();

        let result = connection
            .request(0x00, 0x01, 0x07, &[], Duration::from_millis(50))
            .await;
        assert!(matches!(
            result,
            Err(SpheroError::ResponseTimeout { sequence: 0x07 })
        ));

        // Sequence is free again after the timeout
        let result = connection
            .request(0x00, 0x01, 0x07, &[], Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SpheroError::ResponseTimeout { .. })));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_request_sequence_in_use() {
        let (connector, mut peers) = TestConnector::new(0);
        let connection = Arc::new(Connection::new("dev", connector));
        connection.connect().await.unwrap();
        let _device = peers.recv().await.unwrap();

        let first = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .request(0x00, 0x01, 0x05, &[], Duration::from_secs(30))
                    .await
            })
        };
        // Let the first request register
        while lock(&connection.shared.pending).is_empty() {
            tokio::task::yield_now().await;
        }

        let second = connection
            .request(0x00, 0x01, 0x05, &[], Duration::from_secs(30))
            .await;
        assert!(matches!(second, Err(SpheroError::SequenceInUse(0x05))));

        connection.disconnect().await;
        assert!(matches!(
            first.await.unwrap(),
            Err(SpheroError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_clear_listeners() {
        let (connector, _peers) = TestConnector::new(0);
        let connection = Connection::new("dev", connector);
        let (connects, on_connect) = counter();
        connection.on_connect(on_connect);
        connection.on_collision(|_: &Collision| {});

        connection.clear_listeners();
        connection.connect().await.unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(connection.shared.on_collision.is_empty());
        connection.disconnect().await;
    }
}
