//! Frame struct with typed accessors, encoding and async decoding.
//!
//! Represents a complete protocol frame: header, payload and checksum.
//! Uses `bytes::Bytes` so decoded payloads share the receive buffer.
//!
//! # Example
//!
//! ```
//! use sphero_wire::protocol::{decode_frame, Frame};
//!
//! // setRGBLEDOutput: red, no persistence
//! let frame = Frame::new(0x02, 0x20, 0x01, vec![0xFF, 0x00, 0x00, 0x00], false, true).unwrap();
//! let bytes = frame.encode();
//! assert_eq!(bytes.len(), 6 + 4 + 1);
//!
//! let decoded = decode_frame(&bytes).unwrap();
//! assert_eq!(decoded, frame);
//! ```

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame_buffer::FrameBuffer;
use super::wire_format::{flags, Header, CHECKSUM_SIZE, HEADER_SIZE, START_MARKER_1};
use crate::error::{Result, SpheroError};

/// A complete protocol frame.
///
/// Frames are immutable values: build one per outbound command, drop it
/// once an inbound one has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: Header,
    payload: Bytes,
    checksum: u8,
}

impl Frame {
    /// Build an outbound frame, computing its checksum.
    ///
    /// Fails with [`SpheroError::InvalidPayloadSize`] if the payload is
    /// longer than 254 bytes.
    pub fn new(
        device_id: u8,
        command_id: u8,
        sequence: u8,
        payload: impl Into<Bytes>,
        request_ack: bool,
        reset_timer: bool,
    ) -> Result<Self> {
        let payload = payload.into();
        let header = Header::new(
            device_id,
            command_id,
            sequence,
            payload.len(),
            flags::from_bools(request_ack, reset_timer),
        )?;
        let checksum = header.checksum(&payload);
        Ok(Self {
            header,
            payload,
            checksum,
        })
    }

    /// Assemble a received frame, verifying its checksum.
    pub(crate) fn from_wire(header: Header, payload: Bytes, received: u8) -> Result<Self> {
        let expected = header.checksum(&payload);
        if expected != received {
            return Err(SpheroError::ChecksumMismatch {
                expected,
                actual: received,
            });
        }
        Ok(Self {
            header,
            payload,
            checksum: received,
        })
    }

    /// Decoded header.
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Get the device ID.
    #[inline]
    pub fn device_id(&self) -> u8 {
        self.header.device_id
    }

    /// Get the command ID.
    #[inline]
    pub fn command_id(&self) -> u8 {
        self.header.command_id
    }

    /// Get the sequence number.
    #[inline]
    pub fn sequence(&self) -> u8 {
        self.header.sequence
    }

    /// Get the `data_length` field (payload length + 1).
    #[inline]
    pub fn data_length(&self) -> u8 {
        self.header.data_length
    }

    /// Get the checksum byte.
    #[inline]
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Check if the answer flag is set.
    #[inline]
    pub fn request_ack(&self) -> bool {
        self.header.request_ack()
    }

    /// Check if the reset-inactivity-timer flag is set.
    #[inline]
    pub fn reset_timer(&self) -> bool {
        self.header.reset_timer()
    }

    /// Check if this is an answer sent by the device.
    #[inline]
    pub fn is_answer(&self) -> bool {
        self.header.is_answer()
    }

    /// Check if this is an asynchronous device message.
    #[inline]
    pub fn is_async(&self) -> bool {
        self.header.is_async()
    }

    /// Size of the encoded frame in bytes.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.header.frame_len()
    }

    /// Encode the frame to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf.push(self.checksum);
        buf
    }
}

/// Encode a command into a single byte vector.
///
/// # Example
///
/// ```
/// use sphero_wire::protocol::encode;
///
/// let bytes = encode(0x02, 0x20, 0x00, &[0x00, 0xFF, 0x10, 0x01], false, false).unwrap();
/// assert_eq!(bytes, [0xFF, 0xFC, 0x02, 0x20, 0x00, 0x05, 0x00, 0xFF, 0x10, 0x01, 0xC8]);
/// ```
pub fn encode(
    device_id: u8,
    command_id: u8,
    sequence: u8,
    payload: &[u8],
    request_ack: bool,
    reset_timer: bool,
) -> Result<Vec<u8>> {
    let header = Header::new(
        device_id,
        command_id,
        sequence,
        payload.len(),
        flags::from_bools(request_ack, reset_timer),
    )?;

    let mut buf = Vec::with_capacity(header.frame_len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.push(header.checksum(payload));
    Ok(buf)
}

/// Decode one frame from a complete byte slice.
///
/// Leading bytes that do not start a frame are skipped. A slice that ends
/// before the frame is complete reports [`SpheroError::TransportClosed`].
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let mut buffer = FrameBuffer::with_capacity(bytes.len());
    buffer.push(bytes);
    buffer.next_frame()?.ok_or(SpheroError::TransportClosed)
}

/// Read exactly one frame from an async byte source.
///
/// Reads only the bytes the frame needs, so the next frame stays in the
/// source. Bytes that cannot start a frame are skipped until a marker pair
/// is found.
///
/// # Errors
///
/// - [`SpheroError::ChecksumMismatch`] if the frame is corrupt (its bytes
///   are consumed, the source is positioned at the next frame).
/// - [`SpheroError::TransportClosed`] on end of stream or I/O error.
pub async fn decode<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = FrameBuffer::with_capacity(HEADER_SIZE + CHECKSUM_SIZE);
    let mut chunk = [0u8; HEADER_SIZE + u8::MAX as usize];

    loop {
        if let Some(frame) = buffer.next_frame()? {
            return Ok(frame);
        }

        let needed = buffer.bytes_needed();
        let dst = &mut chunk[..needed];
        if let Err(e) = reader.read_exact(dst).await {
            tracing::debug!("Frame read failed: {}", e);
            return Err(SpheroError::TransportClosed);
        }
        buffer.push(dst);
    }
}

/// Check whether `byte` could begin a frame.
#[inline]
pub(crate) fn may_start_frame(byte: u8) -> bool {
    byte == START_MARKER_1
}
