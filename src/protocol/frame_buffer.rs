//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need a start marker pair and 6 header bytes
//! - `WaitingForBody`: Header parsed, need payload + checksum bytes
//!
//! Bytes that cannot start a frame are discarded until the next
//! `0xFF 0xFC..=0xFF` marker pair, so a desynchronized stream recovers on
//! its own.
//!
//! # Example
//!
//! ```
//! use sphero_wire::protocol::{encode, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = encode(0x02, 0x20, 1, &[1, 2, 3, 4], false, false).unwrap();
//!
//! // Data arrives in chunks from the socket
//! buffer.push(&bytes[..4]);
//! assert!(buffer.next_frame().unwrap().is_none());
//!
//! buffer.push(&bytes[4..]);
//! let frame = buffer.next_frame().unwrap().unwrap();
//! assert_eq!(frame.sequence(), 1);
//! ```

use bytes::BytesMut;

use super::frame::{may_start_frame, Frame};
use super::wire_format::{is_start_of_frame, Header, HEADER_SIZE};
use crate::error::{Result, SpheroError};

/// Default buffer capacity: a few maximum-size frames.
const DEFAULT_CAPACITY: usize = 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a marker pair and a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for payload and checksum bytes.
    WaitingForBody { header: Header, payload_len: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Frames are pulled one at a time with [`next_frame`](Self::next_frame) so
/// a corrupt frame can be reported without losing the frames behind it.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Bytes skipped while looking for a start marker.
    discarded: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new frame buffer with custom capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            discarded: 0,
        }
    }

    /// Append raw bytes from a socket read.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete, valid frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(ChecksumMismatch)` if a complete frame was corrupt; only its
    ///   first marker byte is dropped and the next call rescans the rest, so
    ///   a false marker pair cannot swallow the frame behind it
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    self.resync();
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let Some(header) = Header::decode(&self.buffer[..HEADER_SIZE]) else {
                        // resync() guarantees a marker pair at the front
                        self.skip(1);
                        continue;
                    };

                    let Some(payload_len) = header.payload_len() else {
                        tracing::debug!("Zero data length, skipping start marker");
                        self.skip(1);
                        continue;
                    };

                    self.state = State::WaitingForBody {
                        header,
                        payload_len,
                    };
                }

                State::WaitingForBody {
                    header,
                    payload_len,
                } => {
                    let header = *header;
                    let payload_len = *payload_len;
                    if self.buffer.len() < header.frame_len() {
                        return Ok(None);
                    }

                    let payload = &self.buffer[HEADER_SIZE..HEADER_SIZE + payload_len];
                    let received = self.buffer[HEADER_SIZE + payload_len];
                    self.state = State::WaitingForHeader;

                    let expected = header.checksum(payload);
                    if expected != received {
                        // Header bytes stay buffered until the checksum holds.
                        self.skip(1);
                        return Err(SpheroError::ChecksumMismatch {
                            expected,
                            actual: received,
                        });
                    }

                    let mut raw = self.buffer.split_to(header.frame_len()).freeze();
                    let mut body = raw.split_off(HEADER_SIZE);
                    let payload = body.split_to(payload_len);
                    return Frame::from_wire(header, payload, received).map(Some);
                }
            }
        }
    }

    /// Minimum number of bytes to read before [`next_frame`](Self::next_frame)
    /// can make progress.
    ///
    /// Reading exactly this many bytes never reads past the end of the
    /// frame currently being assembled.
    pub fn bytes_needed(&self) -> usize {
        let needed = match &self.state {
            State::WaitingForHeader => HEADER_SIZE.saturating_sub(self.buffer.len()),
            State::WaitingForBody { header, .. } => {
                header.frame_len().saturating_sub(self.buffer.len())
            }
        };
        needed.max(1)
    }

    /// Total bytes discarded while resynchronizing, including the bytes of
    /// corrupt frames.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Drop leading bytes until the buffer starts with a marker pair, or
    /// with a lone byte that could still become one.
    fn resync(&mut self) {
        let skip = self
            .buffer
            .windows(2)
            .position(|w| is_start_of_frame(w[0], w[1]))
            .unwrap_or_else(|| match self.buffer.last() {
                Some(&last) if may_start_frame(last) => self.buffer.len() - 1,
                _ => self.buffer.len(),
            });

        if skip > 0 {
            tracing::debug!(skipped = skip, "Resynchronizing on start marker");
            self.skip(skip);
        }
    }

    fn skip(&mut self, n: usize) {
        let _ = self.buffer.split_to(n);
        self.discarded += n as u64;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
