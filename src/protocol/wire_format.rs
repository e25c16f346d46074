//! Wire format encoding and decoding.
//!
//! Implements the 6-byte frame header followed by the payload and a
//! trailing checksum byte:
//! ```text
//! ┌──────┬──────┬──────┬──────┬──────┬──────┬─────────────┬──────┐
//! │ SOP1 │ SOP2 │ DID  │ CID  │ SEQ  │ DLEN │ payload     │ CHK  │
//! │ 0xFF │ 0xFC^│1 byte│1 byte│1 byte│len+1 │ 0..254 bytes│1 byte│
//! │      │ flags│      │      │      │      │             │      │
//! └──────┴──────┴──────┴──────┴──────┴──────┴─────────────┴──────┘
//! ```
//!
//! `CHK = 0xFF ^ (DID + CID + SEQ + DLEN + payload...) mod 256`.

use crate::error::{Result, SpheroError};

/// Header size in bytes (fixed, exactly 6).
pub const HEADER_SIZE: usize = 6;

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 1;

/// Largest payload that still lets `data_length` fit in one byte.
pub const MAX_PAYLOAD_SIZE: usize = 254;

/// First start-of-packet byte.
pub const START_MARKER_1: u8 = 0xFF;

/// Second start-of-packet byte with no flag set ("answer not needed").
pub const START_MARKER_2: u8 = 0xFC;

/// Bits every valid second marker carries. The low two bits are flags.
pub const MARKER_2_MASK: u8 = 0xFC;

/// Second marker of an answer to a command.
pub const ANSWER_MARKER_2: u8 = 0xFF;

/// Second marker of an asynchronous device message.
pub const ASYNC_MARKER_2: u8 = 0xFE;

/// Flag bits XORed into the second start marker.
pub mod flags {
    /// Ask the device to answer the command.
    pub const ANSWER: u8 = 0b0000_0001;
    /// Reset the device inactivity timer.
    pub const RESET_TIMER: u8 = 0b0000_0010;

    /// Flags used when neither bit is requested.
    pub const NONE: u8 = 0;

    /// Build the flag bits from their boolean form.
    #[inline]
    pub fn from_bools(request_ack: bool, reset_timer: bool) -> u8 {
        let mut bits = NONE;
        if request_ack {
            bits ^= ANSWER;
        }
        if reset_timer {
            bits ^= RESET_TIMER;
        }
        bits
    }

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Check whether two bytes form a valid start-of-packet pair.
#[inline]
pub fn is_start_of_frame(marker1: u8, marker2: u8) -> bool {
    marker1 == START_MARKER_1 && marker2 & MARKER_2_MASK == MARKER_2_MASK
}

/// Compute the checksum over the header fields and payload.
///
/// `bytes` must cover DID, CID, SEQ, DLEN and the payload, in any order.
pub fn checksum<'a, I>(bytes: I) -> u8
where
    I: IntoIterator<Item = &'a u8>,
{
    let sum = bytes.into_iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFF ^ sum
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Second start marker, flags included.
    pub marker2: u8,
    /// Device (subsystem) identifier.
    pub device_id: u8,
    /// Command identifier within the subsystem.
    pub command_id: u8,
    /// Caller-chosen correlation tag.
    pub sequence: u8,
    /// Payload length plus one for the checksum byte.
    pub data_length: u8,
}

impl Header {
    /// Create a header for an outbound command.
    ///
    /// Fails with [`SpheroError::InvalidPayloadSize`] if `payload_len` does
    /// not fit in `data_length`.
    pub fn new(
        device_id: u8,
        command_id: u8,
        sequence: u8,
        payload_len: usize,
        flags: u8,
    ) -> Result<Self> {
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(SpheroError::InvalidPayloadSize(payload_len));
        }

        Ok(Self {
            marker2: START_MARKER_2 ^ (flags & (self::flags::ANSWER | self::flags::RESET_TIMER)),
            device_id,
            command_id,
            sequence,
            data_length: payload_len as u8 + 1,
        })
    }

    /// Encode header to bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use sphero_wire::protocol::{flags, Header};
    ///
    /// let header = Header::new(0x02, 0x20, 0x00, 4, flags::NONE).unwrap();
    /// assert_eq!(header.encode(), [0xFF, 0xFC, 0x02, 0x20, 0x00, 0x05]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        [
            START_MARKER_1,
            self.marker2,
            self.device_id,
            self.command_id,
            self.sequence,
            self.data_length,
        ]
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if the buffer is too short or does not start with a
    /// valid marker pair.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE || !is_start_of_frame(buf[0], buf[1]) {
            return None;
        }
        Some(Self {
            marker2: buf[1],
            device_id: buf[2],
            command_id: buf[3],
            sequence: buf[4],
            data_length: buf[5],
        })
    }

    /// Payload length announced by `data_length`.
    ///
    /// Returns `None` for a zero `data_length`, which cannot account for the
    /// checksum byte and marks a malformed header.
    #[inline]
    pub fn payload_len(&self) -> Option<usize> {
        (self.data_length as usize).checked_sub(CHECKSUM_SIZE)
    }

    /// Total encoded size of the frame this header starts.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.data_length as usize
    }

    /// Flag bits carried by the second marker.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.marker2 & !MARKER_2_MASK
    }

    /// Check if the sender asked for an answer.
    #[inline]
    pub fn request_ack(&self) -> bool {
        flags::has_flag(self.flags(), flags::ANSWER)
    }

    /// Check if the sender asked to reset the inactivity timer.
    #[inline]
    pub fn reset_timer(&self) -> bool {
        flags::has_flag(self.flags(), flags::RESET_TIMER)
    }

    /// Check if this is an answer frame sent by the device.
    #[inline]
    pub fn is_answer(&self) -> bool {
        self.marker2 == ANSWER_MARKER_2
    }

    /// Check if this is an asynchronous device message.
    #[inline]
    pub fn is_async(&self) -> bool {
        self.marker2 == ASYNC_MARKER_2
    }

    /// Checksum over this header and the given payload.
    pub fn checksum(&self, payload: &[u8]) -> u8 {
        let fields = [
            self.device_id,
            self.command_id,
            self.sequence,
            self.data_length,
        ];
        checksum(fields.iter().chain(payload))
    }
}
