//! Stream transport: connection setup, windowed data flow and teardown.
//!
//! Stream data itself travels in stream-type CAN frames that the receive
//! state machine accumulates on the node; the messages handled here carry
//! the negotiation and flow control around that data.

use crate::config::Capacities;
use crate::interface::Dependencies;
use crate::message::{MessageHandle, SizeClass};
use crate::mti;
use crate::protocol::error;
use crate::protocol::main::HandlerContext;
use crate::utilities;
use generic_array::typenum::Unsigned;

/// Accept flag of the Stream Init Reply.
pub const INIT_ACCEPT: u8 = 0x80;

/// Stream Init Request: negotiate the window and open the session.
///
/// Payload: proposed buffer size (2), flags (2) and the sender's stream id.
pub fn handle_stream_init_request<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let incoming_message = *ctx.buffers.messages.message(incoming);
    let payload = ctx.buffers.messages.payload(incoming);
    if payload.len() < 5 {
        return None;
    }
    let proposed = utilities::read_u16(payload);
    let source_stream_id = payload[4];

    let ours = C::StreamPayload::USIZE as u16;
    let node = ctx.nodes.node_mut(node_index);
    let (accepted, flags, dest_stream_id) = if node.stream.active {
        // one stream session per node at a time
        (0, 0u8, 0u8)
    } else {
        let window = proposed.min(ours);
        node.stream.active = true;
        node.stream.peer_alias = incoming_message.source_alias;
        node.stream.source_stream_id = source_stream_id;
        node.stream.dest_stream_id = source_stream_id.wrapping_add(1);
        node.stream.buffer_size = window;
        node.stream.bytes_since_proceed = 0;
        node.stream.inbound = None;
        (window, INIT_ACCEPT, node.stream.dest_stream_id)
    };

    let reply = ctx.buffers.messages.allocate(SizeClass::Basic).ok()?;
    let (message, reply_payload) = ctx.buffers.messages.parts_mut(reply);
    message.reply_header(&incoming_message, mti::STREAM_INIT_REPLY);
    utilities::write_u16(&mut reply_payload[0..2], accepted);
    reply_payload[2] = flags;
    reply_payload[3] = if accepted == 0 {
        (error::TEMPORARY_BUFFER_UNAVAILABLE >> 8) as u8
    } else {
        0
    };
    reply_payload[4] = source_stream_id;
    reply_payload[5] = dest_stream_id;
    message.payload_count = 6;
    Some(reply)
}

/// Stream Init Reply: the peer answered our request.
pub fn handle_stream_init_reply<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let incoming_message = *ctx.buffers.messages.message(incoming);
    let payload = ctx.buffers.messages.payload(incoming);
    if payload.len() < 6 {
        return None;
    }
    let window = utilities::read_u16(payload);
    let accepted = payload[2] & INIT_ACCEPT != 0;
    let node = ctx.nodes.node_mut(node_index);
    if accepted && window > 0 {
        node.stream.active = true;
        node.stream.peer_alias = incoming_message.source_alias;
        node.stream.source_stream_id = payload[4];
        node.stream.dest_stream_id = payload[5];
        node.stream.buffer_size = window;
        node.stream.bytes_since_proceed = 0;
    }
    None
}

/// Stream Proceed: the peer consumed a window of our outbound stream.
pub fn handle_stream_proceed<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let node = ctx.nodes.node_mut(node_index);
    node.stream.bytes_since_proceed = 0;
    None
}

/// Stream Complete: the inbound stream is finished; deliver the
/// accumulated data and close the session.
pub fn handle_stream_complete<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let node = ctx.nodes.node_mut(node_index);
    let inbound = node.stream.inbound.take();
    node.stream.active = false;
    node.stream.buffer_size = 0;
    node.stream.bytes_since_proceed = 0;

    if let Some(handle) = inbound {
        let payload = ctx.buffers.messages.payload(handle);
        ctx.deps.on_stream_data(payload);
        ctx.buffers.messages.free(handle);
    }
    None
}

/// Stream Send arriving as a whole message (a tunnelled transport). The
/// CAN path accumulates frames on the node instead; this accepts the
/// already-assembled form.
pub fn handle_stream_send<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let node = ctx.nodes.node(node_index);
    if !node.stream.active {
        return None;
    }
    let payload = ctx.buffers.messages.payload(incoming);
    ctx.deps.on_stream_data(payload);
    None
}
