//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary command protocol:
//! - 6-byte header encoding/decoding and checksum
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors, `encode` and async `decode`

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{decode, decode_frame, encode, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    checksum, flags, is_start_of_frame, Header, ANSWER_MARKER_2, ASYNC_MARKER_2, CHECKSUM_SIZE,
    HEADER_SIZE, MARKER_2_MASK, MAX_PAYLOAD_SIZE, START_MARKER_1, START_MARKER_2,
};
