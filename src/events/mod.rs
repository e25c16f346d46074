//! Events module - typed publish/subscribe for connection notifications.
//!
//! - [`EventBus`]: listener registry for one event kind
//! - [`Listener`]: callback contract, implemented by every `Fn(&A)` closure
//! - [`Collision`]: argument delivered to collision listeners

mod bus;
mod listener;

pub use bus::EventBus;
pub use listener::{BoxListener, Listener};

/// Virtual device of sensor notifications.
pub const COLLISION_DEVICE_ID: u8 = 0x02;

/// Command carrying collision coordinates.
pub const COLLISION_COMMAND_ID: u8 = 0x12;

/// Collision reported asynchronously by the device.
///
/// Coordinates are the first two big-endian `i16` values of the
/// notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Collision {
    pub x: i16,
    pub y: i16,
}

impl Collision {
    /// Parse the leading `x`, `y` pair of a collision payload.
    ///
    /// Returns `None` if the payload holds fewer than 4 bytes.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            [x0, x1, y0, y1, ..] => Some(Self {
                x: i16::from_be_bytes([*x0, *x1]),
                y: i16::from_be_bytes([*y0, *y1]),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collision_from_payload() {
        let collision = Collision::from_payload(&[0x00, 0x10, 0xFF, 0xF0]).unwrap();
        assert_eq!(collision, Collision { x: 16, y: -16 });
    }

    #[test]
    fn test_collision_ignores_trailing_bytes() {
        let collision = Collision::from_payload(&[0x01, 0x00, 0x00, 0x02, 0xAA, 0xBB]).unwrap();
        assert_eq!(collision, Collision { x: 256, y: 2 });
    }

    #[test]
    fn test_collision_short_payload() {
        assert!(Collision::from_payload(&[]).is_none());
        assert!(Collision::from_payload(&[0x00, 0x01, 0x02]).is_none());
    }
}
