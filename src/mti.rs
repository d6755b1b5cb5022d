//! Message Type Indicator catalogue and property masks.
//!
//! MTI values are 16 bits; the CAN adaptation carries the low 12 bits in
//! the identifier's variable field. The property masks decode the bits the
//! Message Network Standard assigns inside the MTI itself.

/// Node went initialized.
pub const INITIALIZATION_COMPLETE: u16 = 0x0100;
/// Node went initialized, Simple Node variant.
pub const INITIALIZATION_COMPLETE_SIMPLE: u16 = 0x0101;
/// Ask a specific node to identify itself.
pub const VERIFY_NODE_ID_ADDRESSED: u16 = 0x0488;
/// Ask all nodes to identify themselves.
pub const VERIFY_NODE_ID_GLOBAL: u16 = 0x0490;
/// Identification response.
pub const VERIFIED_NODE_ID: u16 = 0x0170;
/// Identification response, Simple Node variant.
pub const VERIFIED_NODE_ID_SIMPLE: u16 = 0x0171;
/// The addressed node cannot or will not process the message.
pub const OPTIONAL_INTERACTION_REJECTED: u16 = 0x0068;
/// Fatal error, the node is terminating the interaction.
pub const TERMINATE_DUE_TO_ERROR: u16 = 0x00A8;
/// Query the protocols a node supports.
pub const PROTOCOL_SUPPORT_INQUIRY: u16 = 0x0828;
/// Reply carrying the 6-byte protocol support bit field.
pub const PROTOCOL_SUPPORT_REPLY: u16 = 0x0668;

/// Identify all consumers of an event.
pub const CONSUMER_IDENTIFY: u16 = 0x08F4;
/// Consumer identifies a masked range of events.
pub const CONSUMER_RANGE_IDENTIFIED: u16 = 0x04A4;
/// Consumer identified, current state unknown.
pub const CONSUMER_IDENTIFIED_UNKNOWN: u16 = 0x04C7;
/// Consumer identified, currently set.
pub const CONSUMER_IDENTIFIED_SET: u16 = 0x04C4;
/// Consumer identified, currently clear.
pub const CONSUMER_IDENTIFIED_CLEAR: u16 = 0x04C5;
/// Consumer identified, reserved state.
pub const CONSUMER_IDENTIFIED_RESERVED: u16 = 0x04C6;
/// Identify all producers of an event.
pub const PRODUCER_IDENTIFY: u16 = 0x0914;
/// Producer identifies a masked range of events.
pub const PRODUCER_RANGE_IDENTIFIED: u16 = 0x0524;
/// Producer identified, current state unknown.
pub const PRODUCER_IDENTIFIED_UNKNOWN: u16 = 0x0547;
/// Producer identified, currently set.
pub const PRODUCER_IDENTIFIED_SET: u16 = 0x0544;
/// Producer identified, currently clear.
pub const PRODUCER_IDENTIFIED_CLEAR: u16 = 0x0545;
/// Producer identified, reserved state.
pub const PRODUCER_IDENTIFIED_RESERVED: u16 = 0x0546;
/// Ask a specific node to identify every consumed and produced event.
pub const EVENTS_IDENTIFY_DEST: u16 = 0x0968;
/// Ask all nodes to identify every consumed and produced event.
pub const EVENTS_IDENTIFY_GLOBAL: u16 = 0x0970;
/// Teach an event to listening nodes.
pub const EVENT_LEARN: u16 = 0x0594;
/// Producer/Consumer Event Report.
pub const PC_EVENT_REPORT: u16 = 0x05B4;
/// Event report carrying a payload (single frame, and the final frame of a
/// fragmented report).
pub const PC_EVENT_REPORT_WITH_PAYLOAD: u16 = 0x0F14;
/// Event report with payload, interior frame.
pub const PC_EVENT_REPORT_WITH_PAYLOAD_MIDDLE: u16 = 0x0F15;
/// Event report with payload, first frame.
pub const PC_EVENT_REPORT_WITH_PAYLOAD_FIRST: u16 = 0x0F16;

/// Request the Simple Node Information strings.
pub const SIMPLE_NODE_INFO_REQUEST: u16 = 0x0DE8;
/// Simple Node Information reply.
pub const SIMPLE_NODE_INFO_REPLY: u16 = 0x0A08;

/// Traction control command.
pub const TRACTION_PROTOCOL: u16 = 0x05EB;
/// Traction control reply.
pub const TRACTION_REPLY: u16 = 0x01E9;
/// Request the Simple Train information strings.
pub const SIMPLE_TRAIN_INFO_REQUEST: u16 = 0x0DA8;
/// Simple Train information reply.
pub const SIMPLE_TRAIN_INFO_REPLY: u16 = 0x09C8;

/// Request to open a stream.
pub const STREAM_INIT_REQUEST: u16 = 0x0CC8;
/// Accept or reject a stream request.
pub const STREAM_INIT_REPLY: u16 = 0x0868;
/// Stream data.
pub const STREAM_SEND: u16 = 0x1F88;
/// Window acknowledgement; sender may proceed.
pub const STREAM_PROCEED: u16 = 0x0888;
/// Stream finished.
pub const STREAM_COMPLETE: u16 = 0x08A8;

/// Datagram content.
pub const DATAGRAM: u16 = 0x1C48;
/// Datagram accepted.
pub const DATAGRAM_OK_REPLY: u16 = 0x0A28;
/// Datagram rejected, carries an error code.
pub const DATAGRAM_REJECTED_REPLY: u16 = 0x0A48;

/// Stream-or-datagram bit inside the MTI.
pub const MASK_STREAM_OR_DATAGRAM: u16 = 0x1000;
/// Simple-protocol bit inside the MTI.
pub const MASK_SIMPLE_PROTOCOL: u16 = 0x0010;
/// Destination-address-present bit inside the MTI.
pub const MASK_DEST_ADDRESS_PRESENT: u16 = 0x0008;
/// Event-id-present bit inside the MTI.
pub const MASK_EVENT_PRESENT: u16 = 0x0004;
/// Priority bits inside the MTI.
pub const MASK_PRIORITY: u16 = 0x0C00;

/// Whether messages with this MTI carry a destination address.
pub fn is_addressed(mti: u16) -> bool {
    mti & MASK_DEST_ADDRESS_PRESENT != 0 || mti & MASK_STREAM_OR_DATAGRAM != 0
}

/// Whether messages with this MTI start with a 64-bit event id.
pub fn has_event(mti: u16) -> bool {
    mti & MASK_EVENT_PRESENT != 0
}

/// Whether the MTI is a stream or datagram transport type.
pub fn is_stream_or_datagram(mti: u16) -> bool {
    mti & MASK_STREAM_OR_DATAGRAM != 0
}
