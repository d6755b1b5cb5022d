//! Compile-time sizing of every pool and table in the stack.

use crate::alias::AliasMapping;
use crate::can::rx::InflightSlot;
use crate::frame::FrameSlot;
use crate::message::MessageHandle;
use crate::node::{EventEntry, EventRange, Node};
use crate::protocol::broadcast_time::ClockSlot;
use crate::store::{FrameHandle, Slot};
use generic_array::typenum::consts::*;
use generic_array::ArrayLength;

/// Element capacities.
///
/// Every buffer pool and lookup table in the stack is a fixed-size array
/// whose length comes from an associated type here, so a whole stack can be
/// sized for a given board without touching any engine code. The payload
/// sizes of the BASIC (8), DATAGRAM (72) and SNIP (253) message classes are
/// fixed by the OpenLCB standards; only the STREAM payload size is
/// selectable.
pub trait Capacities: Sized {
    /// CAN frame pool depth (also the outgoing frame queue depth)
    type CanFrames: ArrayLength<FrameSlot> + ArrayLength<Option<FrameHandle>>;
    /// BASIC message sub-pool depth (payloads up to 8 bytes)
    type BasicMessages: ArrayLength<Slot<U8>>;
    /// DATAGRAM message sub-pool depth (payloads up to 72 bytes)
    type DatagramMessages: ArrayLength<Slot<U72>>;
    /// SNIP message sub-pool depth (payloads up to 253 bytes)
    type SnipMessages: ArrayLength<Slot<U253>>;
    /// STREAM message payload size in bytes
    type StreamPayload: ArrayLength<u8>;
    /// STREAM message sub-pool depth
    type StreamMessages: ArrayLength<Slot<Self::StreamPayload>>;
    /// Incoming OpenLCB message queue depth
    type MessageFifo: ArrayLength<Option<MessageHandle>>;
    /// Alias⇄node-id mapping table depth
    type AliasMappings: ArrayLength<AliasMapping>;
    /// Number of virtual node slots
    type Nodes: ArrayLength<Node<Self>>;
    /// Consumer event table depth per node
    type ConsumerEvents: ArrayLength<EventEntry>;
    /// Producer event table depth per node
    type ProducerEvents: ArrayLength<EventEntry>;
    /// Consumer event-range table depth per node
    type ConsumerRanges: ArrayLength<EventRange>;
    /// Producer event-range table depth per node
    type ProducerRanges: ArrayLength<EventRange>;
    /// Multi-frame reassembly slots for addressed messages in flight
    type Inflight: ArrayLength<Option<InflightSlot>>;
    /// Broadcast-time clock slots
    type Clocks: ArrayLength<ClockSlot>;
}

/// Capacities matching the reference configuration of the original
/// implementation: a small node with a handful of buffers of each class.
pub struct DefaultCapacities;

impl Capacities for DefaultCapacities {
    type CanFrames = U10;
    type BasicMessages = U10;
    type DatagramMessages = U4;
    type SnipMessages = U2;
    type StreamPayload = U512;
    type StreamMessages = U1;
    type MessageFifo = U17;
    type AliasMappings = U16;
    type Nodes = U4;
    type ConsumerEvents = U16;
    type ProducerEvents = U16;
    type ConsumerRanges = U4;
    type ProducerRanges = U4;
    type Inflight = U4;
    type Clocks = U4;
}
