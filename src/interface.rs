//! Traits for the collaborators injected at stack construction.
//!
//! The engine never talks to hardware, storage or the application directly;
//! everything crosses one of these traits. Methods with empty default
//! bodies are optional callbacks; leave them alone to skip them.

use crate::events::EventId;
use crate::frame::CanFrame;
use crate::message::{Alias, Message, NodeId};
use crate::node::EventStatus;
use crate::protocol::broadcast_time::ClockState;
use core::convert::Infallible;
use fugit::MillisDurationU32;

/// Return code for configuration memory accesses that failed outright.
pub const CONFIG_MEM_FAILED: u16 = 0xFFFF;

/// The physical CAN driver.
pub trait CanDevice {
    /// Hands one frame to the driver. [`nb::Error::WouldBlock`] signals a
    /// full transmit buffer; the engine will retry the same frame on its
    /// next iteration.
    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), Infallible>;

    /// Pauses frame reception (typically masks the receive interrupt).
    fn pause_rx(&mut self) {}

    /// Resumes frame reception.
    fn resume_rx(&mut self) {}

    /// Whether the driver's transmit buffer is empty.
    fn is_tx_buffer_clear(&self) -> bool {
        true
    }
}

/// Operating-system or bare-metal platform services.
pub trait Platform {
    /// Cadence at which [`Stack::tick_100ms`] is driven.
    ///
    /// [`Stack::tick_100ms`]: crate::stack::Stack::tick_100ms
    const TICK_PERIOD: MillisDurationU32 = MillisDurationU32::millis(100);

    /// Enters the critical section protecting the pools, queues, alias
    /// table and node registry against the receive interrupt.
    fn lock_shared_resources(&mut self) {}

    /// Leaves the critical section.
    fn unlock_shared_resources(&mut self) {}

    /// Reboot requested through the memory configuration protocol.
    fn reboot(&mut self) {}

    /// Factory reset requested through the memory configuration protocol.
    fn factory_reset(&mut self) {}
}

/// Application-level callbacks and the configuration memory store.
pub trait Application {
    /// Reads `count` bytes at `address` of configuration memory into
    /// `buffer`. Returns the number of bytes read, or
    /// [`CONFIG_MEM_FAILED`].
    fn configuration_memory_read(&mut self, address: u32, count: u16, buffer: &mut [u8]) -> u16 {
        let _ = (address, count, buffer);
        CONFIG_MEM_FAILED
    }

    /// Writes `buffer` to configuration memory at `address`. Returns the
    /// number of bytes written, or [`CONFIG_MEM_FAILED`].
    fn configuration_memory_write(&mut self, address: u32, buffer: &[u8]) -> u16 {
        let _ = (address, buffer);
        CONFIG_MEM_FAILED
    }

    /// A node finished its login sequence and is now in normal operation.
    fn on_login_complete(&mut self, node_id: NodeId) {
        let _ = node_id;
    }

    /// A node's alias changed (chosen during login or regenerated after a
    /// collision).
    fn on_alias_change(&mut self, alias: Alias, node_id: NodeId) {
        let _ = (alias, node_id);
    }

    /// A frame was handed to the driver.
    fn on_transmit(&mut self, frame: &CanFrame) {
        let _ = frame;
    }

    /// A PC Event Report for an event this node consumes.
    fn on_consumed_pc_event_report(&mut self, event: EventId, payload: &[u8]) {
        let _ = (event, payload);
    }

    /// A peer identified itself as consumer of an event.
    fn on_consumer_identified(&mut self, event: EventId, status: EventStatus) {
        let _ = (event, status);
    }

    /// A peer identified a consumed event range.
    fn on_consumer_range_identified(&mut self, range: EventId) {
        let _ = range;
    }

    /// A peer identified itself as producer of an event.
    fn on_producer_identified(&mut self, event: EventId, status: EventStatus) {
        let _ = (event, status);
    }

    /// A peer identified a produced event range.
    fn on_producer_range_identified(&mut self, range: EventId) {
        let _ = range;
    }

    /// An Event Learn message was received.
    fn on_event_learn(&mut self, event: EventId) {
        let _ = event;
    }

    /// A peer rejected one of our interactions.
    fn on_optional_interaction_rejected(&mut self, message: &Message) {
        let _ = message;
    }

    /// A peer terminated an interaction due to an error.
    fn on_terminate_due_to_error(&mut self, message: &Message) {
        let _ = message;
    }

    /// A traction command arrived. Write a reply into `reply` and return
    /// its length to have the engine send it as a Traction Reply; `None`
    /// rejects the command as not implemented.
    fn on_traction_command(&mut self, payload: &[u8], reply: &mut [u8]) -> Option<u16> {
        let _ = (payload, reply);
        None
    }

    /// A traction reply addressed to one of our nodes arrived.
    fn on_traction_reply(&mut self, payload: &[u8]) {
        let _ = payload;
    }

    /// An inbound stream finished; `data` is the accumulated content.
    fn on_stream_data(&mut self, data: &[u8]) {
        let _ = data;
    }
}

/// Broadcast-time observer callbacks.
pub trait ClockObserver {
    /// A running clock advanced by one fast minute.
    fn on_time_changed(&mut self, clock: &ClockState) {
        let _ = clock;
    }

    /// A Report Time event was received or synthesised.
    fn on_time_received(&mut self, clock: &ClockState) {
        let _ = clock;
    }

    /// The date changed (received or by month rollover).
    fn on_date_received(&mut self, clock: &ClockState) {
        let _ = clock;
    }

    /// The year changed (received or by year rollover).
    fn on_year_received(&mut self, clock: &ClockState) {
        let _ = clock;
    }

    /// The clock crossed midnight.
    fn on_date_rollover(&mut self, clock: &ClockState) {
        let _ = clock;
    }
}

/// Everything a [`Stack`] needs from its environment.
///
/// [`Stack`]: crate::stack::Stack
pub trait Dependencies: CanDevice + Platform + Application + ClockObserver {}

impl<T: CanDevice + Platform + Application + ClockObserver> Dependencies for T {}
