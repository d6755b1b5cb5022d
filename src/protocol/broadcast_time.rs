//! The fast-clock service of the Broadcast Time Protocol.
//!
//! A clock is a 48-bit id plus time/date/year/rate state. Consumers follow
//! a clock generator elsewhere on the network and advance their local copy
//! between received Report Time events with a fixed-point accumulator;
//! producers are the generator side and answer Query events with the
//! six-message synchronisation sequence.

use crate::application;
use crate::config::Capacities;
use crate::events::{clock, EventId};
use crate::interface::{Application, CanDevice, ClockObserver};
use crate::mti;
use crate::node::Node;
use generic_array::GenericArray;

/// Accumulator ticks per fast minute: the Q10.2 rate times 100 ms summed
/// over one real minute at 1.0×. Must stay integer for bare-metal builds.
const MS_PER_MINUTE_FIXED_POINT: u32 = 4 * 60 * 1000;

/// Events covered by each of the two range registrations a clock needs.
pub const CLOCK_RANGE_COUNT: u16 = 0x8000;

/// Time of day.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockTime {
    /// Hour, 0..=23
    pub hour: u8,
    /// Minute, 0..=59
    pub minute: u8,
}

/// Calendar date.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockDate {
    /// Month, 1..=12
    pub month: u8,
    /// Day of month, 1..=31
    pub day: u8,
}

impl Default for ClockDate {
    fn default() -> Self {
        Self { month: 1, day: 1 }
    }
}

/// Mutable state of one clock.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockState {
    /// The clock's 48-bit identity (in the upper bits of the event id)
    pub clock_id: EventId,
    /// Time of day
    pub time: ClockTime,
    /// Calendar date
    pub date: ClockDate,
    /// Year, 0..=4095
    pub year: u16,
    /// Signed Q10.2 rate; 4 is 1.0× real time, negative runs backwards
    pub rate: i16,
    /// Whether the clock is running
    pub is_running: bool,
    /// Fixed-point accumulator toward the next fast minute
    pub ms_accumulator: u32,
}

/// One slot of the clock table.
#[derive(Copy, Clone, Debug, Default)]
pub struct ClockSlot {
    /// The clock state
    pub state: ClockState,
    /// Slot is in use
    pub is_allocated: bool,
    /// This stack follows the clock
    pub is_consumer: bool,
    /// This stack generates the clock
    pub is_producer: bool,
}

/// Where a resumable query reply stands.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum QueryReplyStep {
    #[default]
    StartOrStop,
    Rate,
    Year,
    Date,
    CurrentTime,
    NextTime,
}

/// The broadcast-time engine: a fixed array of clock slots.
pub struct BroadcastTimeEngine<C: Capacities> {
    clocks: GenericArray<ClockSlot, C::Clocks>,
    query_reply_step: QueryReplyStep,
}

impl<C: Capacities> Default for BroadcastTimeEngine<C> {
    fn default() -> Self {
        Self {
            clocks: GenericArray::default(),
            query_reply_step: QueryReplyStep::default(),
        }
    }
}

fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0) && (year % 100 != 0 || year % 400 == 0)
}

fn days_in_month(month: u8, year: u16) -> u8 {
    const TABLE: [u8; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    if !(1..=12).contains(&month) {
        return 30;
    }
    if month == 2 && is_leap_year(year) {
        29
    } else {
        TABLE[usize::from(month) - 1]
    }
}

fn advance_minute_forward<D: ClockObserver>(state: &mut ClockState, deps: &mut D) {
    state.time.minute += 1;
    if state.time.minute >= 60 {
        state.time.minute = 0;
        state.time.hour += 1;
        if state.time.hour >= 24 {
            state.time.hour = 0;
            deps.on_date_rollover(state);
            state.date.day += 1;
            if state.date.day > days_in_month(state.date.month, state.year) {
                state.date.day = 1;
                state.date.month += 1;
                if state.date.month > 12 {
                    state.date.month = 1;
                    state.year += 1;
                    deps.on_year_received(state);
                }
                deps.on_date_received(state);
            }
        }
    }
    deps.on_time_received(state);
}

fn advance_minute_backward<D: ClockObserver>(state: &mut ClockState, deps: &mut D) {
    if state.time.minute == 0 {
        state.time.minute = 59;
        if state.time.hour == 0 {
            state.time.hour = 23;
            deps.on_date_rollover(state);
            if state.date.day <= 1 {
                if state.date.month <= 1 {
                    state.date.month = 12;
                    state.year = state.year.wrapping_sub(1);
                    deps.on_year_received(state);
                } else {
                    state.date.month -= 1;
                }
                state.date.day = days_in_month(state.date.month, state.year);
                deps.on_date_received(state);
            } else {
                state.date.day -= 1;
            }
        } else {
            state.time.hour -= 1;
        }
    } else {
        state.time.minute -= 1;
    }
    deps.on_time_received(state);
}

impl<C: Capacities> BroadcastTimeEngine<C> {
    fn find(&self, clock_id: EventId) -> Option<usize> {
        let clock_id = clock_id & clock::MASK_CLOCK_ID;
        self.clocks
            .iter()
            .position(|c| c.is_allocated && c.state.clock_id == clock_id)
    }

    fn find_or_allocate(&mut self, clock_id: EventId) -> Option<usize> {
        if let Some(index) = self.find(clock_id) {
            return Some(index);
        }
        let index = self.clocks.iter().position(|c| !c.is_allocated)?;
        self.clocks[index] = ClockSlot::default();
        self.clocks[index].state.clock_id = clock_id & clock::MASK_CLOCK_ID;
        self.clocks[index].is_allocated = true;
        Some(index)
    }

    fn register_ranges(node: &mut Node<C>, clock_id: EventId) {
        // Both halves of the clock's 65536-event namespace, consumer and
        // producer: a follower must produce the Query event and a
        // generator must consume the Set commands.
        node.consumers.register_range(clock_id, CLOCK_RANGE_COUNT);
        node.consumers
            .register_range(clock_id | EventId::from(clock::SET_OFFSET), CLOCK_RANGE_COUNT);
        node.producers.register_range(clock_id, CLOCK_RANGE_COUNT);
        node.producers
            .register_range(clock_id | EventId::from(clock::SET_OFFSET), CLOCK_RANGE_COUNT);
    }

    /// Allocates (or finds) the clock and marks it as a consumer,
    /// registering the event ranges on `node`.
    pub fn setup_consumer(
        &mut self,
        node: Option<&mut Node<C>>,
        clock_id: EventId,
    ) -> Option<&mut ClockState> {
        let index = self.find_or_allocate(clock_id)?;
        self.clocks[index].is_consumer = true;
        if let Some(node) = node {
            Self::register_ranges(node, clock_id & clock::MASK_CLOCK_ID);
        }
        Some(&mut self.clocks[index].state)
    }

    /// Allocates (or finds) the clock and marks it as a producer,
    /// registering the event ranges on `node`.
    pub fn setup_producer(
        &mut self,
        node: Option<&mut Node<C>>,
        clock_id: EventId,
    ) -> Option<&mut ClockState> {
        let index = self.find_or_allocate(clock_id)?;
        self.clocks[index].is_producer = true;
        if let Some(node) = node {
            Self::register_ranges(node, clock_id & clock::MASK_CLOCK_ID);
        }
        Some(&mut self.clocks[index].state)
    }

    /// The state of a registered clock.
    pub fn clock(&self, clock_id: EventId) -> Option<&ClockState> {
        self.find(clock_id).map(|i| &self.clocks[i].state)
    }

    /// Mutable state of a registered clock.
    pub fn clock_mut(&mut self, clock_id: EventId) -> Option<&mut ClockState> {
        self.find(clock_id).map(move |i| &mut self.clocks[i].state)
    }

    /// Whether the clock is registered as a consumer.
    pub fn is_consumer(&self, clock_id: EventId) -> bool {
        self.find(clock_id)
            .map_or(false, |i| self.clocks[i].is_consumer)
    }

    /// Whether the clock is registered as a producer.
    pub fn is_producer(&self, clock_id: EventId) -> bool {
        self.find(clock_id)
            .map_or(false, |i| self.clocks[i].is_producer)
    }

    /// Marks the clock running.
    pub fn start(&mut self, clock_id: EventId) {
        if let Some(index) = self.find(clock_id) {
            self.clocks[index].state.is_running = true;
        }
    }

    /// Marks the clock stopped.
    pub fn stop(&mut self, clock_id: EventId) {
        if let Some(index) = self.find(clock_id) {
            self.clocks[index].state.is_running = false;
        }
    }

    /// Advances every running consumer clock by one 100 ms step.
    ///
    /// Each tick adds `100 × |rate|` to the accumulator; every
    /// [`MS_PER_MINUTE_FIXED_POINT`] (240 000) in the accumulator is one
    /// fast minute, so rate 4 (1.0×) advances exactly one minute per real
    /// minute. Rates above 40× can cross several minute boundaries in one
    /// tick; the loop handles them all.
    pub fn tick_100ms<D: ClockObserver>(&mut self, deps: &mut D) {
        for slot in self.clocks.iter_mut() {
            if !slot.is_allocated || !slot.is_consumer || !slot.state.is_running {
                continue;
            }
            let rate = slot.state.rate;
            if rate == 0 {
                continue;
            }
            slot.state.ms_accumulator += 100 * u32::from(rate.unsigned_abs());
            while slot.state.ms_accumulator >= MS_PER_MINUTE_FIXED_POINT {
                slot.state.ms_accumulator -= MS_PER_MINUTE_FIXED_POINT;
                if rate > 0 {
                    advance_minute_forward(&mut slot.state, deps);
                } else {
                    advance_minute_backward(&mut slot.state, deps);
                }
                deps.on_time_changed(&slot.state);
            }
        }
    }

    /// Applies a clock event received from the network to the matching
    /// clock slot. Producer clocks obey Set commands and answer Query; the
    /// reply, when one is due, is left for the caller to transmit via
    /// [`send_query_reply`](Self::send_query_reply).
    ///
    /// Returns true when the caller should run the query reply sequence.
    pub fn event_received<D: ClockObserver>(&mut self, event: EventId, deps: &mut D) -> bool {
        let Some(index) = self.find(event) else {
            return false;
        };
        let slot = &mut self.clocks[index];
        match clock::decode(event) {
            clock::ClockEvent::Time { hour, minute, set } => {
                if !set || slot.is_producer {
                    slot.state.time = ClockTime { hour, minute };
                    slot.state.ms_accumulator = 0;
                    deps.on_time_received(&slot.state);
                }
            }
            clock::ClockEvent::Date { month, day, set } => {
                if !set || slot.is_producer {
                    slot.state.date = ClockDate { month, day };
                    deps.on_date_received(&slot.state);
                }
            }
            clock::ClockEvent::Year { year, set } => {
                if !set || slot.is_producer {
                    slot.state.year = year;
                    deps.on_year_received(&slot.state);
                }
            }
            clock::ClockEvent::Rate { rate, set } => {
                if !set || slot.is_producer {
                    slot.state.rate = rate;
                }
            }
            clock::ClockEvent::Query => {
                return slot.is_producer;
            }
            clock::ClockEvent::Stop => slot.state.is_running = false,
            clock::ClockEvent::Start => slot.state.is_running = true,
            clock::ClockEvent::DateRollover => deps.on_date_rollover(&slot.state),
            clock::ClockEvent::Unrecognised => {}
        }
        false
    }

    /// Sends the six-message query reply for a producer clock, one message
    /// per call: Start-or-Stop, Rate, Year, Date and the current Time as
    /// Producer Identified Set, then the coming minute as a PC Event
    /// Report. A full transmit buffer leaves the sequence parked on the
    /// failed step; keep calling until this returns true.
    pub fn send_query_reply<D: CanDevice + Application>(
        &mut self,
        node: &Node<C>,
        clock_id: EventId,
        deps: &mut D,
    ) -> bool {
        let Some(index) = self.find(clock_id) else {
            return true;
        };
        let slot = self.clocks[index];
        if !slot.is_producer {
            return true;
        }
        let state = slot.state;

        loop {
            let (event, report_mti) = match self.query_reply_step {
                QueryReplyStep::StartOrStop => {
                    let command = if state.is_running {
                        clock::START
                    } else {
                        clock::STOP
                    };
                    (
                        clock::command_event(state.clock_id, command),
                        mti::PRODUCER_IDENTIFIED_SET,
                    )
                }
                QueryReplyStep::Rate => (
                    clock::rate_event(state.clock_id, state.rate, false),
                    mti::PRODUCER_IDENTIFIED_SET,
                ),
                QueryReplyStep::Year => (
                    clock::year_event(state.clock_id, state.year, false),
                    mti::PRODUCER_IDENTIFIED_SET,
                ),
                QueryReplyStep::Date => (
                    clock::date_event(state.clock_id, state.date.month, state.date.day, false),
                    mti::PRODUCER_IDENTIFIED_SET,
                ),
                QueryReplyStep::CurrentTime => (
                    clock::time_event(state.clock_id, state.time.hour, state.time.minute, false),
                    mti::PRODUCER_IDENTIFIED_SET,
                ),
                QueryReplyStep::NextTime => {
                    let (hour, minute) = next_minute(&state);
                    (
                        clock::time_event(state.clock_id, hour, minute, false),
                        mti::PC_EVENT_REPORT,
                    )
                }
            };

            if !application::send_event_with_mti(node, event, report_mti, deps) {
                return false; // parked; resume on this step
            }

            self.query_reply_step = match self.query_reply_step {
                QueryReplyStep::StartOrStop => QueryReplyStep::Rate,
                QueryReplyStep::Rate => QueryReplyStep::Year,
                QueryReplyStep::Year => QueryReplyStep::Date,
                QueryReplyStep::Date => QueryReplyStep::CurrentTime,
                QueryReplyStep::CurrentTime => QueryReplyStep::NextTime,
                QueryReplyStep::NextTime => {
                    self.query_reply_step = QueryReplyStep::StartOrStop;
                    return true;
                }
            };
        }
    }

    /// Sends a Query for a consumer clock.
    pub fn send_query<D: CanDevice + Application>(
        &mut self,
        node: &Node<C>,
        clock_id: EventId,
        deps: &mut D,
    ) -> bool {
        if !self.is_consumer(clock_id) {
            return true;
        }
        let event = clock::command_event(clock_id, clock::QUERY);
        application::send_event_pc_report(node, event, deps)
    }
}

fn next_minute(state: &ClockState) -> (u8, u8) {
    if state.rate < 0 {
        if state.time.minute == 0 {
            (state.time.hour.checked_sub(1).unwrap_or(23), 59)
        } else {
            (state.time.hour, state.time.minute - 1)
        }
    } else if state.time.minute >= 59 {
        ((state.time.hour + 1) % 24, 0)
    } else {
        (state.time.hour, state.time.minute + 1)
    }
}

/// Marker kept with a pending query reply so the main state machine can
/// resume the sequence across iterations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingQueryReply {
    /// Node index that answers
    pub node_index: usize,
    /// Clock being synchronised
    pub clock_id: EventId,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DefaultCapacities;
    use crate::events::clock::DEFAULT_FAST_CLOCK;
    use crate::frame::CanFrame;
    use crate::interface::{Application, CanDevice, ClockObserver, Platform};

    type Caps = DefaultCapacities;

    #[derive(Default)]
    struct Observer {
        time_changed: usize,
        time_received: usize,
        date_received: usize,
        year_received: usize,
        date_rollover: usize,
    }

    impl CanDevice for Observer {
        fn transmit(&mut self, _: &CanFrame) -> nb::Result<(), core::convert::Infallible> {
            Ok(())
        }
    }
    impl Platform for Observer {}
    impl Application for Observer {}
    impl ClockObserver for Observer {
        fn on_time_changed(&mut self, _: &ClockState) {
            self.time_changed += 1;
        }
        fn on_time_received(&mut self, _: &ClockState) {
            self.time_received += 1;
        }
        fn on_date_received(&mut self, _: &ClockState) {
            self.date_received += 1;
        }
        fn on_year_received(&mut self, _: &ClockState) {
            self.year_received += 1;
        }
        fn on_date_rollover(&mut self, _: &ClockState) {
            self.date_rollover += 1;
        }
    }

    fn running_consumer(rate: i16) -> BroadcastTimeEngine<Caps> {
        let mut engine: BroadcastTimeEngine<Caps> = BroadcastTimeEngine::default();
        let state = engine.setup_consumer(None, DEFAULT_FAST_CLOCK).unwrap();
        state.rate = rate;
        state.is_running = true;
        engine
    }

    #[test]
    fn rate_4_is_one_minute_per_real_minute() {
        let mut engine = running_consumer(4);
        let mut deps = Observer::default();
        for _ in 0..599 {
            engine.tick_100ms(&mut deps);
        }
        assert_eq!(engine.clock(DEFAULT_FAST_CLOCK).unwrap().time.minute, 0);
        engine.tick_100ms(&mut deps);
        assert_eq!(engine.clock(DEFAULT_FAST_CLOCK).unwrap().time.minute, 1);
        assert_eq!(deps.time_changed, 1);
    }

    #[test]
    fn rate_16_is_four_times_real_time() {
        let mut engine = running_consumer(16);
        let mut deps = Observer::default();
        for _ in 0..150 {
            engine.tick_100ms(&mut deps);
        }
        assert_eq!(engine.clock(DEFAULT_FAST_CLOCK).unwrap().time.minute, 1);
    }

    #[test]
    fn rate_1_is_a_quarter_of_real_time() {
        let mut engine = running_consumer(1);
        let mut deps = Observer::default();
        for _ in 0..2399 {
            engine.tick_100ms(&mut deps);
        }
        assert_eq!(engine.clock(DEFAULT_FAST_CLOCK).unwrap().time.minute, 0);
        engine.tick_100ms(&mut deps);
        assert_eq!(engine.clock(DEFAULT_FAST_CLOCK).unwrap().time.minute, 1);
    }

    #[test]
    fn midnight_of_new_years_eve_rolls_everything_over() {
        let mut engine = running_consumer(4);
        {
            let state = engine.clock_mut(DEFAULT_FAST_CLOCK).unwrap();
            state.time = ClockTime { hour: 23, minute: 59 };
            state.date = ClockDate { month: 12, day: 31 };
            state.year = 2025;
        }
        let mut deps = Observer::default();
        for _ in 0..600 {
            engine.tick_100ms(&mut deps);
        }
        let state = *engine.clock(DEFAULT_FAST_CLOCK).unwrap();
        assert_eq!(state.time, ClockTime { hour: 0, minute: 0 });
        assert_eq!(state.date, ClockDate { month: 1, day: 1 });
        assert_eq!(state.year, 2026);
        assert_eq!(deps.date_rollover, 1);
        assert_eq!(deps.date_received, 1);
        assert_eq!(deps.year_received, 1);
    }

    #[test]
    fn backwards_clock_steps_into_the_previous_day() {
        let mut engine = running_consumer(-4);
        {
            let state = engine.clock_mut(DEFAULT_FAST_CLOCK).unwrap();
            state.time = ClockTime { hour: 0, minute: 0 };
            state.date = ClockDate { month: 3, day: 1 };
            state.year = 2024; // leap year
        }
        let mut deps = Observer::default();
        for _ in 0..600 {
            engine.tick_100ms(&mut deps);
        }
        let state = *engine.clock(DEFAULT_FAST_CLOCK).unwrap();
        assert_eq!(state.time, ClockTime { hour: 23, minute: 59 });
        assert_eq!(state.date, ClockDate { month: 2, day: 29 });
        assert_eq!(deps.date_rollover, 1);
    }

    #[test]
    fn leap_year_rule() {
        assert!(is_leap_year(2024));
        assert!(!is_leap_year(2025));
        assert!(!is_leap_year(1900));
        assert!(is_leap_year(2000));
        assert_eq!(days_in_month(2, 2024), 29);
        assert_eq!(days_in_month(2, 2025), 28);
        assert_eq!(days_in_month(4, 2025), 30);
    }

    #[test]
    fn set_events_are_obeyed_by_producers_only() {
        let mut engine: BroadcastTimeEngine<Caps> = BroadcastTimeEngine::default();
        engine.setup_consumer(None, DEFAULT_FAST_CLOCK).unwrap();
        let mut deps = Observer::default();

        // a consumer ignores Set Time (the generator echoes a report)
        engine.event_received(
            crate::events::clock::time_event(DEFAULT_FAST_CLOCK, 10, 30, true),
            &mut deps,
        );
        assert_eq!(engine.clock(DEFAULT_FAST_CLOCK).unwrap().time.minute, 0);

        // but obeys the Report form
        engine.event_received(
            crate::events::clock::time_event(DEFAULT_FAST_CLOCK, 10, 30, false),
            &mut deps,
        );
        assert_eq!(
            engine.clock(DEFAULT_FAST_CLOCK).unwrap().time,
            ClockTime { hour: 10, minute: 30 }
        );

        // start/stop commands are followed
        engine.event_received(
            crate::events::clock::command_event(DEFAULT_FAST_CLOCK, crate::events::clock::START),
            &mut deps,
        );
        assert!(engine.clock(DEFAULT_FAST_CLOCK).unwrap().is_running);
    }

    #[test]
    fn query_asks_for_a_producer_reply() {
        let mut engine: BroadcastTimeEngine<Caps> = BroadcastTimeEngine::default();
        engine.setup_producer(None, DEFAULT_FAST_CLOCK).unwrap();
        let mut deps = Observer::default();
        let reply_due = engine.event_received(
            crate::events::clock::command_event(DEFAULT_FAST_CLOCK, crate::events::clock::QUERY),
            &mut deps,
        );
        assert!(reply_due);
    }
}
