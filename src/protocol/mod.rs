//! The OpenLCB protocol engine: per-MTI handlers and the dispatcher that
//! walks the local nodes for every incoming message.

pub mod broadcast_time;
pub mod datagram;
pub mod event_transport;
pub mod main;
pub mod memory;
pub mod message_network;
pub mod snip;
pub mod stream;
pub mod traction;

/// Protocol error codes carried by rejection replies. Permanent codes mean
/// a retry will not help; temporary codes invite one.
pub mod error {
    /// Base of the permanent range.
    pub const PERMANENT: u16 = 0x1000;
    /// Unknown or unsupported address space.
    pub const PERMANENT_ADDRESS_SPACE_UNKNOWN: u16 = 0x1001;
    /// Address out of bounds for the space.
    pub const PERMANENT_ADDRESS_OUT_OF_BOUNDS: u16 = 0x1002;
    /// Write to a read-only space.
    pub const PERMANENT_WRITE_TO_READ_ONLY: u16 = 0x1003;
    /// Source node not permitted.
    pub const PERMANENT_SOURCE_NOT_PERMITTED: u16 = 0x1020;
    /// Command or protocol not implemented.
    pub const PERMANENT_NOT_IMPLEMENTED: u16 = 0x1040;
    /// Subcommand not recognised.
    pub const PERMANENT_SUBCOMMAND_UNKNOWN: u16 = 0x1041;
    /// Command not recognised.
    pub const PERMANENT_COMMAND_UNKNOWN: u16 = 0x1042;
    /// MTI or transport protocol not supported.
    pub const PERMANENT_MTI_UNKNOWN: u16 = 0x1043;
    /// Count parameter out of range.
    pub const PERMANENT_COUNT_OUT_OF_RANGE: u16 = 0x1044;
    /// Invalid arguments.
    pub const PERMANENT_INVALID_ARGUMENTS: u16 = 0x1080;

    /// Base of the temporary range.
    pub const TEMPORARY: u16 = 0x2000;
    /// Timeout waiting for a response.
    pub const TEMPORARY_TIMEOUT: u16 = 0x2011;
    /// No buffer available right now.
    pub const TEMPORARY_BUFFER_UNAVAILABLE: u16 = 0x2020;
    /// Frame out of the expected order.
    pub const TEMPORARY_OUT_OF_ORDER: u16 = 0x2040;
    /// Middle or final frame without a preceding start frame.
    pub const TEMPORARY_MIDDLE_END_WITHOUT_START: u16 = 0x2041;
    /// Start frame before the previous sequence finished.
    pub const TEMPORARY_START_BEFORE_LAST_END: u16 = 0x2042;
    /// Transfer error.
    pub const TEMPORARY_TRANSFER_ERROR: u16 = 0x2080;
}

/// Protocol Support Indicator bits, as carried big-endian in the first
/// three bytes of the Protocol Support Reply.
pub mod psi {
    /// Simple node protocol.
    pub const SIMPLE: u64 = 0x80_0000;
    /// Datagram protocol.
    pub const DATAGRAM: u64 = 0x40_0000;
    /// Stream protocol.
    pub const STREAM: u64 = 0x20_0000;
    /// Memory configuration protocol.
    pub const MEMORY_CONFIGURATION: u64 = 0x10_0000;
    /// Reservation protocol.
    pub const RESERVATION: u64 = 0x08_0000;
    /// Event exchange (producer/consumer) protocol.
    pub const EVENT_EXCHANGE: u64 = 0x04_0000;
    /// Identification protocol.
    pub const IDENTIFICATION: u64 = 0x02_0000;
    /// Teaching/learning protocol.
    pub const TEACHING_LEARNING: u64 = 0x01_0000;
    /// Remote button protocol.
    pub const REMOTE_BUTTON: u64 = 0x00_8000;
    /// Abbreviated default CDI.
    pub const ABBREVIATED_DEFAULT_CDI: u64 = 0x00_4000;
    /// Display protocol.
    pub const DISPLAY: u64 = 0x00_2000;
    /// Simple node information protocol.
    pub const SIMPLE_NODE_INFORMATION: u64 = 0x00_1000;
    /// Configuration description information.
    pub const CONFIGURATION_DESCRIPTION_INFO: u64 = 0x00_0800;
    /// Train control protocol.
    pub const TRAIN_CONTROL: u64 = 0x00_0400;
    /// Function description information.
    pub const FUNCTION_DESCRIPTION: u64 = 0x00_0200;
    /// Function configuration.
    pub const FUNCTION_CONFIGURATION: u64 = 0x00_0040;
    /// Firmware upgrade protocol.
    pub const FIRMWARE_UPGRADE: u64 = 0x00_0020;
    /// Firmware upgrade in progress.
    pub const FIRMWARE_UPGRADE_ACTIVE: u64 = 0x00_0010;
}

/// Well-known configuration memory address spaces.
pub mod space {
    /// Configuration description information (read only).
    pub const CDI: u8 = 0xFF;
    /// All memory.
    pub const ALL: u8 = 0xFE;
    /// Configuration memory.
    pub const CONFIGURATION: u8 = 0xFD;
    /// ACDI manufacturer strings (read only).
    pub const ACDI_MANUFACTURER: u8 = 0xFC;
    /// ACDI user strings.
    pub const ACDI_USER: u8 = 0xFB;
    /// Traction function description information.
    pub const TRACTION_FDI: u8 = 0xFA;
    /// Traction function configuration memory.
    pub const TRACTION_CONFIGURATION: u8 = 0xF9;
    /// Firmware upgrade.
    pub const FIRMWARE: u8 = 0xEF;
}
