//! Outbound command producers.
//!
//! Command vocabularies (roll, set color, sleep, ...) live outside this
//! crate; anything implementing [`Command`] can be passed to
//! [`Connection::send`](crate::Connection::send).

use bytes::Bytes;

/// A device command: addressing plus payload.
pub trait Command {
    /// Virtual device the command targets.
    fn device_id(&self) -> u8;

    /// Command within that device.
    fn command_id(&self) -> u8;

    /// Payload bytes, at most 254.
    fn payload(&self) -> Bytes;
}

/// Plain value implementation of [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub device_id: u8,
    pub command_id: u8,
    pub payload: Bytes,
}

impl RawCommand {
    /// Create a command with the given payload.
    pub fn new(device_id: u8, command_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            device_id,
            command_id,
            payload: payload.into(),
        }
    }

    /// Create a command without payload.
    pub fn empty(device_id: u8, command_id: u8) -> Self {
        Self::new(device_id, command_id, Bytes::new())
    }
}

impl Command for RawCommand {
    #[inline]
    fn device_id(&self) -> u8 {
        self.device_id
    }

    #[inline]
    fn command_id(&self) -> u8 {
        self.command_id
    }

    #[inline]
    fn payload(&self) -> Bytes {
        self.payload.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_command() {
        let command = RawCommand::new(0x02, 0x20, vec![0x00, 0xFF, 0x10, 0x01]);
        assert_eq!(command.device_id(), 0x02);
        assert_eq!(command.command_id(), 0x20);
        assert_eq!(&command.payload()[..], &[0x00, 0xFF, 0x10, 0x01]);
    }

    #[test]
    fn test_raw_command_empty() {
        let command = RawCommand::empty(0x00, 0x01);
        assert!(command.payload().is_empty());
    }
}
