//! Event Transport protocol: the producer/consumer model.

use crate::config::Capacities;
use crate::interface::Dependencies;
use crate::message::{EventMatch, MessageHandle, SizeClass};
use crate::mti;
use crate::node::EventStatus;
use crate::protocol::broadcast_time::PendingQueryReply;
use crate::protocol::main::HandlerContext;
use crate::utilities;

/// The Consumer Identified MTI matching an event state.
pub fn consumer_identified_mti(status: EventStatus) -> u16 {
    match status {
        EventStatus::Unknown => mti::CONSUMER_IDENTIFIED_UNKNOWN,
        EventStatus::Set => mti::CONSUMER_IDENTIFIED_SET,
        EventStatus::Clear => mti::CONSUMER_IDENTIFIED_CLEAR,
        EventStatus::Reserved => mti::CONSUMER_IDENTIFIED_RESERVED,
    }
}

/// The Producer Identified MTI matching an event state.
pub fn producer_identified_mti(status: EventStatus) -> u16 {
    match status {
        EventStatus::Unknown => mti::PRODUCER_IDENTIFIED_UNKNOWN,
        EventStatus::Set => mti::PRODUCER_IDENTIFIED_SET,
        EventStatus::Clear => mti::PRODUCER_IDENTIFIED_CLEAR,
        EventStatus::Reserved => mti::PRODUCER_IDENTIFIED_RESERVED,
    }
}

fn incoming_event<C: Capacities, D: Dependencies>(
    ctx: &HandlerContext<'_, C, D>,
    incoming: MessageHandle,
) -> Option<u64> {
    let payload = ctx.buffers.messages.payload(incoming);
    (payload.len() >= 8).then(|| utilities::read_event_id(payload))
}

fn load_identified<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    node_index: usize,
    mti: u16,
    event: u64,
) -> Option<MessageHandle> {
    let node = ctx.nodes.node(node_index);
    let (alias, id) = (node.alias, node.id);
    let reply = ctx.buffers.messages.allocate(SizeClass::Basic).ok()?;
    let (message, payload) = ctx.buffers.messages.parts_mut(reply);
    message.set_header(mti, alias, id, 0, 0);
    utilities::write_event_id(payload, event);
    message.payload_count = 8;
    Some(reply)
}

/// Consumer Identify: answer when the event is in the consumer table or
/// covered by a registered range.
pub fn handle_consumer_identify<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let event = incoming_event(ctx, incoming)?;
    let node = ctx.nodes.node(node_index);
    match node.consumers.matches(event) {
        EventMatch::Literal(_) => {
            let status = node.consumers.status_of(event).unwrap_or_default();
            load_identified(ctx, node_index, consumer_identified_mti(status), event)
        }
        EventMatch::Range(_) => load_identified(
            ctx,
            node_index,
            consumer_identified_mti(EventStatus::Unknown),
            event,
        ),
        EventMatch::None => None,
    }
}

/// Producer Identify: answer when the event is in the producer table or
/// covered by a registered range.
pub fn handle_producer_identify<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let event = incoming_event(ctx, incoming)?;
    let node = ctx.nodes.node(node_index);
    match node.producers.matches(event) {
        EventMatch::Literal(_) => {
            let status = node.producers.status_of(event).unwrap_or_default();
            load_identified(ctx, node_index, producer_identified_mti(status), event)
        }
        EventMatch::Range(_) => load_identified(
            ctx,
            node_index,
            producer_identified_mti(EventStatus::Unknown),
            event,
        ),
        EventMatch::None => None,
    }
}

/// Consumer Range Identified from a peer.
pub fn handle_consumer_range_identified<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    if let Some(event) = incoming_event(ctx, incoming) {
        ctx.deps.on_consumer_range_identified(event);
    }
    None
}

/// Producer Range Identified from a peer.
pub fn handle_producer_range_identified<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    if let Some(event) = incoming_event(ctx, incoming) {
        ctx.deps.on_producer_range_identified(event);
    }
    None
}

/// Consumer Identified (any state) from a peer.
pub fn handle_consumer_identified<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
    status: EventStatus,
) -> Option<MessageHandle> {
    if let Some(event) = incoming_event(ctx, incoming) {
        ctx.deps.on_consumer_identified(event, status);
    }
    None
}

/// Producer Identified (any state) from a peer. Clock followers treat the
/// Set form as synchronisation traffic.
pub fn handle_producer_identified<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
    status: EventStatus,
) -> Option<MessageHandle> {
    if let Some(event) = incoming_event(ctx, incoming) {
        ctx.deps.on_producer_identified(event, status);
        if status == EventStatus::Set && ctx.clocks.event_received(event, ctx.deps) {
            *ctx.pending_query_reply = Some(PendingQueryReply {
                node_index,
                clock_id: event,
            });
        }
    }
    None
}

fn start_broadcast<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    node_index: usize,
) {
    let node = ctx.nodes.node_mut(node_index);
    node.consumers.enumerator.running = true;
    node.consumers.enumerator.index = 0;
    node.producers.enumerator.running = true;
    node.producers.enumerator.index = 0;
}

/// Events Identify, global form: broadcast every consumed and produced
/// event incrementally.
pub fn handle_identify<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    start_broadcast(ctx, node_index);
    None
}

/// Events Identify, addressed form.
pub fn handle_identify_dest<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    start_broadcast(ctx, node_index);
    None
}

/// Event Learn.
pub fn handle_event_learn<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    if let Some(event) = incoming_event(ctx, incoming) {
        ctx.deps.on_event_learn(event);
    }
    None
}

/// PC Event Report: notify the application when this node consumes the
/// event, and feed the clock engine (Report Time and friends arrive this
/// way).
pub fn handle_pc_event_report<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let event = incoming_event(ctx, incoming)?;
    if ctx.nodes.node(node_index).consumers.matches(event) != EventMatch::None {
        ctx.deps.on_consumed_pc_event_report(event, &[]);
        if ctx.clocks.event_received(event, ctx.deps) {
            *ctx.pending_query_reply = Some(PendingQueryReply {
                node_index,
                clock_id: event,
            });
        }
    }
    None
}

/// PC Event Report with payload: as above, with the bytes after the event
/// id handed to the application. Reports shorter than an event id plus one
/// payload byte are ignored.
pub fn handle_pc_event_report_with_payload<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let payload = ctx.buffers.messages.payload(incoming);
    if payload.len() <= 8 {
        return None;
    }
    let event = utilities::read_event_id(payload);
    if ctx.nodes.node(node_index).consumers.matches(event) != EventMatch::None {
        let message = *ctx.buffers.messages.message(incoming);
        let count = usize::from(message.payload_count);
        let payload = ctx.buffers.messages.payload(incoming);
        let data_end = count.min(payload.len());
        // the borrow of the store ends before the callback runs
        let mut data = [0u8; 253];
        let data_len = data_end - 8;
        data[..data_len].copy_from_slice(&payload[8..data_end]);
        ctx.deps
            .on_consumed_pc_event_report(event, &data[..data_len]);
    }
    None
}
