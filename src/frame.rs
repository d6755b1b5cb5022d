//! The CAN frame as it crosses the driver boundary.

use crate::identifier::CanIdentifier;
use embedded_can::{ExtendedId, Frame, Id};

/// Data does not fit in an 8-byte classic CAN frame.
#[derive(Debug)]
pub struct TooMuchData;

/// A classic CAN data frame with a 29-bit identifier.
///
/// Only the 29 significant identifier bits are meaningful; remote and
/// standard-id frames never occur in OpenLCB and are rejected at the
/// driver boundary.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CanFrame {
    /// The 29-bit identifier with its OpenLCB field layout
    pub identifier: u32,
    /// Number of valid payload bytes, 0..=8
    pub payload_count: u8,
    /// Payload bytes; only the first `payload_count` are valid
    pub payload: [u8; 8],
}

impl CanFrame {
    /// Builds a frame from an identifier and payload.
    pub fn new(identifier: CanIdentifier, data: &[u8]) -> Result<Self, TooMuchData> {
        if data.len() > 8 {
            return Err(TooMuchData);
        }
        let mut payload = [0; 8];
        payload[..data.len()].copy_from_slice(data);
        Ok(Self {
            identifier: identifier.raw(),
            payload_count: data.len() as u8,
            payload,
        })
    }

    /// Builds a frame with an empty payload.
    pub fn empty(identifier: CanIdentifier) -> Self {
        Self {
            identifier: identifier.raw(),
            payload_count: 0,
            payload: [0; 8],
        }
    }

    /// The identifier with its field accessors.
    pub fn id(&self) -> CanIdentifier {
        CanIdentifier::from_raw(self.identifier)
    }

    /// The valid payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.payload[..usize::from(self.payload_count.min(8))]
    }

    /// Appends one payload byte.
    pub fn push(&mut self, byte: u8) -> Result<(), TooMuchData> {
        if usize::from(self.payload_count) >= 8 {
            return Err(TooMuchData);
        }
        self.payload[usize::from(self.payload_count)] = byte;
        self.payload_count += 1;
        Ok(())
    }
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        match id.into() {
            Id::Extended(id) => CanFrame::new(CanIdentifier::from_raw(id.as_raw()), data).ok(),
            Id::Standard(_) => None,
        }
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        // OpenLCB never uses remote frames.
        None
    }

    fn is_extended(&self) -> bool {
        true
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        // The mask ensures the value is in range for a 29-bit integer.
        Id::Extended(unsafe { ExtendedId::new_unchecked(self.identifier & ExtendedId::MAX.as_raw()) })
    }

    fn dlc(&self) -> usize {
        self.data().len()
    }

    fn data(&self) -> &[u8] {
        CanFrame::data(self)
    }
}

/// One slot of the CAN frame pool.
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameSlot {
    /// The stored frame
    pub frame: CanFrame,
    /// Whether the slot is currently handed out
    pub allocated: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identifier::FrameType;

    #[test]
    fn frame_carries_payload() {
        let id = CanIdentifier::openlcb_message(FrameType::Standard, 0x5B4, 0xABC);
        let frame = CanFrame::new(id, &[1, 2, 3]).unwrap();
        assert_eq!(frame.identifier, 0x195B4ABC);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert!(CanFrame::new(id, &[0; 9]).is_err());
    }

    #[test]
    fn push_respects_capacity() {
        let mut frame = CanFrame::empty(CanIdentifier::from_raw(0));
        for i in 0..8 {
            frame.push(i).unwrap();
        }
        assert!(frame.push(8).is_err());
        assert_eq!(frame.payload_count, 8);
    }

    #[test]
    fn embedded_can_frame_view() {
        let id = CanIdentifier::openlcb_message(FrameType::Standard, 0x490, 0xAAA);
        let frame = CanFrame::new(id, &[]).unwrap();
        assert!(Frame::is_extended(&frame));
        assert_eq!(Frame::dlc(&frame), 0);
        assert_eq!(
            Frame::id(&frame),
            Id::Extended(ExtendedId::new(0x19490AAA).unwrap())
        );
    }
}
