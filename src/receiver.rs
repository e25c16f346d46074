//! Receive loop.
//!
//! One task per live connection. It owns the read half of the stream, feeds
//! bytes into a [`FrameBuffer`] and dispatches every decoded frame:
//!
//! ```text
//! read half ─► BufReader ─► FrameBuffer ─┬─► pending request (answer)
//!                                        ├─► collision bus
//!                                        └─► dropped (unrecognized)
//! ```
//!
//! The loop only suspends while waiting for bytes, and that wait is raced
//! against the session's cancellation token.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::connection::{lock, Shared};
use crate::error::SpheroError;
use crate::events::{Collision, COLLISION_COMMAND_ID, COLLISION_DEVICE_ID};
use crate::protocol::{Frame, FrameBuffer};
use crate::transport::Connector;

/// What the loop did with a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Answered,
    Collision,
    Dropped,
    Unrecognized,
}

/// Run until cancelled or until the stream ends.
///
/// End of stream and read errors tear the connection down from inside the
/// loop; cancellation exits without touching the write half.
pub(crate) async fn run<C, R>(shared: Arc<Shared<C>>, reader: R, cancel: CancellationToken)
where
    C: Connector,
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::with_capacity(shared.config.read_buffer_size.max(1), reader);
    let mut frames = FrameBuffer::new();
    tracing::debug!(address = %shared.address, "Receive loop started");

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(address = %shared.address, "Receive loop cancelled");
                return;
            }
            read = reader.fill_buf() => match read {
                Ok([]) => {
                    tracing::debug!(address = %shared.address, "Device closed the stream");
                    None
                }
                Ok(buf) => {
                    frames.push(buf);
                    Some(buf.len())
                }
                Err(e) => {
                    tracing::error!(address = %shared.address, "Read failed: {}", e);
                    None
                }
            },
        };

        let Some(consumed) = received else {
            shared.close_from_loop(&cancel).await;
            return;
        };
        reader.consume(consumed);

        drain(&shared, &mut frames);
    }
}

/// Dispatch every complete frame in the buffer.
fn drain<C: Connector>(shared: &Shared<C>, frames: &mut FrameBuffer) {
    let mut discarded = frames.discarded();

    loop {
        let next = frames.next_frame();
        shared.stats.record_discarded(frames.discarded() - discarded);
        discarded = frames.discarded();

        match next {
            Ok(Some(frame)) => {
                shared.stats.record_received();
                match dispatch(shared, frame) {
                    Dispatch::Dropped => shared.stats.record_dropped(),
                    Dispatch::Unrecognized => shared.stats.record_unrecognized(),
                    Dispatch::Answered | Dispatch::Collision => {}
                }
            }
            Ok(None) => break,
            Err(e @ SpheroError::ChecksumMismatch { .. }) => {
                tracing::warn!("Dropping corrupt frame: {}", e);
                shared.stats.record_dropped();
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                shared.stats.record_dropped();
            }
        }
    }
}

fn dispatch<C: Connector>(shared: &Shared<C>, frame: Frame) -> Dispatch {
    // Answers to a pending request win, even for collision-configuration
    // commands sharing the collision IDs.
    let frame = if frame.is_answer() {
        match shared.complete_pending(frame) {
            Ok(()) => return Dispatch::Answered,
            Err(frame) => frame,
        }
    } else {
        frame
    };

    if frame.device_id() == COLLISION_DEVICE_ID && frame.command_id() == COLLISION_COMMAND_ID {
        return publish_collision(shared, &frame);
    }

    tracing::warn!(
        device_id = frame.device_id(),
        command_id = frame.command_id(),
        sequence = frame.sequence(),
        "Unrecognized frame"
    );
    Dispatch::Unrecognized
}

fn publish_collision<C: Connector>(shared: &Shared<C>, frame: &Frame) -> Dispatch {
    let Some(collision) = Collision::from_payload(frame.payload()) else {
        tracing::warn!(
            len = frame.payload().len(),
            "Collision payload too short, dropping"
        );
        return Dispatch::Dropped;
    };

    *lock(&shared.last_collision) = Some(collision);

    if let Err(e) = shared.on_collision.publish(&collision) {
        tracing::error!("Collision listeners failed: {}", e);
    }
    Dispatch::Collision
}
