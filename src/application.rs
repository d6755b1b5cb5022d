//! The application-facing API: event registration and simple sends.
//!
//! Everything here operates on one node and is safe to call from setup
//! code or application callbacks; sends go straight to the driver and
//! report backpressure as `false` so the caller can retry.

use crate::config::Capacities;
use crate::events::EventId;
use crate::interface::{Application, CanDevice};
use crate::message::Message;
use crate::mti;
use crate::node::{EventStatus, Node, EVENT_REGISTER_FAILED};
use crate::utilities;

/// Removes every consumer event and range registration.
pub fn clear_consumer_events<C: Capacities>(node: &mut Node<C>) {
    node.consumers.clear();
}

/// Removes every producer event and range registration.
pub fn clear_producer_events<C: Capacities>(node: &mut Node<C>) {
    node.producers.clear();
}

/// Registers a consumed event. Returns the table index, or
/// [`EVENT_REGISTER_FAILED`] when the table is full.
pub fn register_consumer_event<C: Capacities>(
    node: &mut Node<C>,
    event: EventId,
    status: EventStatus,
) -> u16 {
    node.consumers.register(event, status)
}

/// Registers a produced event. Returns the table index, or
/// [`EVENT_REGISTER_FAILED`] when the table is full.
pub fn register_producer_event<C: Capacities>(
    node: &mut Node<C>,
    event: EventId,
    status: EventStatus,
) -> u16 {
    node.producers.register(event, status)
}

/// Registers a consumed event range. `count` must be a power of two ≥ 2.
pub fn register_consumer_range<C: Capacities>(
    node: &mut Node<C>,
    base: EventId,
    count: u16,
) -> u16 {
    node.consumers.register_range(base, count)
}

/// Registers a produced event range. `count` must be a power of two ≥ 2.
pub fn register_producer_range<C: Capacities>(
    node: &mut Node<C>,
    base: EventId,
    count: u16,
) -> u16 {
    node.producers.register_range(base, count)
}

/// Updates the recorded state of a consumed event.
pub fn set_consumer_event_status<C: Capacities>(
    node: &mut Node<C>,
    event: EventId,
    status: EventStatus,
) -> bool {
    node.consumers.set_status(event, status)
}

/// Updates the recorded state of a produced event.
pub fn set_producer_event_status<C: Capacities>(
    node: &mut Node<C>,
    event: EventId,
    status: EventStatus,
) -> bool {
    node.producers.set_status(event, status)
}

/// Sends an event under the given (global, event-carrying) MTI. Returns
/// false when the node is not ready or the driver is busy; retry later.
pub fn send_event_with_mti<C: Capacities, D: CanDevice + Application>(
    node: &Node<C>,
    event: EventId,
    event_mti: u16,
    deps: &mut D,
) -> bool {
    if !node.is_initialized() {
        return false;
    }
    let mut message = Message::default();
    message.set_header(event_mti, node.alias, node.id, 0, 0);
    message.payload_count = 8;
    let mut payload = [0u8; 8];
    utilities::write_event_id(&mut payload, event);
    let mut offset = 0;
    crate::can::tx::unaddressed_frame(&message, &payload, &mut offset, deps).is_ok()
}

/// Sends a PC Event Report.
pub fn send_event_pc_report<C: Capacities, D: CanDevice + Application>(
    node: &Node<C>,
    event: EventId,
    deps: &mut D,
) -> bool {
    send_event_with_mti(node, event, mti::PC_EVENT_REPORT, deps)
}

/// Sends an Event Learn (teach) message.
pub fn send_teach_event<C: Capacities, D: CanDevice + Application>(
    node: &Node<C>,
    event: EventId,
    deps: &mut D,
) -> bool {
    send_event_with_mti(node, event, mti::EVENT_LEARN, deps)
}

/// Reads from the injected configuration memory store. Returns bytes read
/// or 0xFFFF on failure.
pub fn read_configuration_memory<D: Application>(
    deps: &mut D,
    address: u32,
    count: u16,
    buffer: &mut [u8],
) -> u16 {
    deps.configuration_memory_read(address, count, buffer)
}

/// Writes to the injected configuration memory store. Returns bytes
/// written or 0xFFFF on failure.
pub fn write_configuration_memory<D: Application>(
    deps: &mut D,
    address: u32,
    buffer: &[u8],
) -> u16 {
    deps.configuration_memory_write(address, buffer)
}
