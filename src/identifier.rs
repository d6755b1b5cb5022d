//! Layout of the 29-bit CAN identifier used by OpenLCB.
//!
//! Bit 27 selects between OpenLCB messages and CAN control frames. For
//! OpenLCB messages, bits 26:24 carry the frame type, bits 23:12 the
//! variable field (the MTI, or the destination alias for datagram and
//! stream frames) and bits 11:0 the source alias. For CAN control frames,
//! bits 27:24 carry the Check ID sequence number and bits 23:12 a subtype
//! discriminator (RID/AMD/AME/AMR/EIR).

use bitfield::bitfield;

/// Bit 28 of the identifier, always set on frames this stack emits.
pub const RESERVED_TOP_BIT: u32 = 0x1000_0000;
/// Bit 27, set when the frame carries an OpenLCB message.
pub const CAN_OPENLCB_MSG: u32 = 0x0800_0000;

/// Variable-field subtype of the Reserve ID control frame.
pub const CONTROL_RID: u16 = 0x0700;
/// Variable-field subtype of the Alias Map Definition control frame.
pub const CONTROL_AMD: u16 = 0x0701;
/// Variable-field subtype of the Alias Mapping Enquiry control frame.
pub const CONTROL_AME: u16 = 0x0702;
/// Variable-field subtype of the Alias Map Reset control frame.
pub const CONTROL_AMR: u16 = 0x0703;
/// Variable-field subtype of the first Error Information Report frame.
pub const CONTROL_EIR0: u16 = 0x0710;
/// Variable-field subtype of the last Error Information Report frame.
pub const CONTROL_EIR3: u16 = 0x0713;

/// Multi-frame marker mask in the first data byte of addressed messages.
pub const MULTIFRAME_MASK: u8 = 0xF0;
/// Complete message in a single frame.
pub const MULTIFRAME_ONLY: u8 = 0x00;
/// First frame of a multi-frame sequence.
pub const MULTIFRAME_FIRST: u8 = 0x40;
/// Interior frame of a multi-frame sequence.
pub const MULTIFRAME_MIDDLE: u8 = 0xC0;
/// Final frame of a multi-frame sequence.
pub const MULTIFRAME_FINAL: u8 = 0x80;

bitfield! {
    /// A 29-bit OpenLCB CAN identifier.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CanIdentifier(u32);

    /// Source alias of the transmitting node
    pub u16, source_alias, set_source_alias: 11, 0;
    /// MTI or destination alias, depending on the frame type
    pub u16, variable_field, set_variable_field: 23, 12;
    /// Frame type selector for OpenLCB messages
    pub u8, frame_type_bits, set_frame_type_bits: 26, 24;
    /// Check ID sequence number for CAN control frames
    pub u8, cid_number, set_cid_number: 27, 24;
    /// OpenLCB message (set) or CAN control frame (clear)
    pub openlcb, set_openlcb: 27;
    /// Reserved top bit
    pub reserved, set_reserved: 28;
}

impl core::fmt::Debug for CanIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CanIdentifier({:#010x})", self.0)
    }
}

impl CanIdentifier {
    /// Wraps a raw identifier word.
    pub const fn from_raw(raw: u32) -> Self {
        CanIdentifier(raw)
    }

    /// Returns the raw identifier word.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Builds the identifier for a global or addressed OpenLCB message.
    pub fn openlcb_message(frame_type: FrameType, variable_field: u16, source_alias: u16) -> Self {
        let mut id = CanIdentifier(RESERVED_TOP_BIT | CAN_OPENLCB_MSG);
        id.set_frame_type_bits(frame_type as u8);
        id.set_variable_field(variable_field);
        id.set_source_alias(source_alias);
        id
    }

    /// Builds the identifier of a Check ID frame. `number` is the CID
    /// sequence number (7..=4 for OpenLCB) and `id_fragment` the matching
    /// 12 bits of the node id.
    pub fn check_id(number: u8, id_fragment: u16, source_alias: u16) -> Self {
        let mut id = CanIdentifier(RESERVED_TOP_BIT);
        id.set_cid_number(number);
        id.set_variable_field(id_fragment);
        id.set_source_alias(source_alias);
        id
    }

    /// Builds the identifier of a non-CID control frame (RID/AMD/AME/AMR).
    pub fn control(subtype: u16, source_alias: u16) -> Self {
        let mut id = CanIdentifier(RESERVED_TOP_BIT);
        id.set_variable_field(subtype);
        id.set_source_alias(source_alias);
        id
    }

    /// Classifies the identifier.
    pub fn class(&self) -> FrameClass {
        if self.openlcb() {
            match self.frame_type_bits() {
                0b001 => FrameClass::Message(FrameType::Standard),
                0b010 => FrameClass::Message(FrameType::DatagramOnly),
                0b011 => FrameClass::Message(FrameType::DatagramFirst),
                0b100 => FrameClass::Message(FrameType::DatagramMiddle),
                0b101 => FrameClass::Message(FrameType::DatagramFinal),
                0b111 => FrameClass::Message(FrameType::Stream),
                _ => FrameClass::Reserved,
            }
        } else {
            match self.cid_number() {
                1..=7 => FrameClass::CheckId(self.cid_number()),
                _ => match self.variable_field() {
                    CONTROL_RID => FrameClass::ReserveId,
                    CONTROL_AMD => FrameClass::AliasMapDefinition,
                    CONTROL_AME => FrameClass::AliasMapEnquiry,
                    CONTROL_AMR => FrameClass::AliasMapReset,
                    CONTROL_EIR0..=CONTROL_EIR3 => FrameClass::ErrorInformationReport,
                    _ => FrameClass::Reserved,
                },
            }
        }
    }
}

/// Frame type of an OpenLCB message, bits 26:24 of the identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Global or addressed message; the variable field is the MTI
    Standard = 0b001,
    /// Datagram complete in a single frame
    DatagramOnly = 0b010,
    /// First frame of a multi-frame datagram
    DatagramFirst = 0b011,
    /// Interior frame of a multi-frame datagram
    DatagramMiddle = 0b100,
    /// Final frame of a multi-frame datagram
    DatagramFinal = 0b101,
    /// Stream data frame
    Stream = 0b111,
}

/// Classification of a received identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameClass {
    /// OpenLCB message frame of the given type
    Message(FrameType),
    /// Check ID control frame carrying its sequence number (1..=7)
    CheckId(u8),
    /// Reserve ID control frame
    ReserveId,
    /// Alias Map Definition control frame
    AliasMapDefinition,
    /// Alias Mapping Enquiry control frame
    AliasMapEnquiry,
    /// Alias Map Reset control frame
    AliasMapReset,
    /// Error Information Report control frame
    ErrorInformationReport,
    /// Reserved or unrecognised encoding; dropped by the receiver
    Reserved,
}
