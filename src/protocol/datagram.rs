//! Datagram transport: acknowledgement and content dispatch.
//!
//! The acknowledgement (OK or Rejected) always fits one CAN frame and is
//! queued straight onto the outgoing frame queue; a content handler that
//! produces a reply datagram returns it as the node's outgoing message.

use crate::can::tx;
use crate::config::Capacities;
use crate::interface::Dependencies;
use crate::message::{Alias, MessageHandle};
use crate::mti;
use crate::protocol::error;
use crate::protocol::main::HandlerContext;
use crate::protocol::memory;
use crate::utilities;

/// Flag in the Datagram OK reply: a reply datagram will follow.
pub const OK_REPLY_PENDING: u8 = 0x80;

/// Protocol byte selecting the memory configuration protocol.
pub const PROTOCOL_MEMORY_CONFIGURATION: u8 = 0x20;

/// What processing the datagram content decided.
pub enum Outcome {
    /// Accepted; a reply datagram follows
    Reply(MessageHandle),
    /// Accepted; no reply content
    Ack,
    /// Rejected with the given error code
    Reject(u16),
}

fn queue_ok<C: Capacities>(
    ctx: &mut HandlerContext<'_, C, impl Dependencies>,
    source_alias: Alias,
    dest_alias: Alias,
    pending: bool,
) {
    let payload: &[u8] = if pending { &[OK_REPLY_PENDING] } else { &[] };
    let frame = tx::addressed_reply_frame(mti::DATAGRAM_OK_REPLY, source_alias, dest_alias, payload);
    if let Ok(handle) = ctx.buffers.frames.allocate() {
        *ctx.buffers.frames.frame_mut(handle) = frame;
        if ctx.buffers.outgoing_frames.push(handle).is_err() {
            ctx.buffers.frames.free(handle);
        }
    }
}

fn queue_rejected<C: Capacities>(
    ctx: &mut HandlerContext<'_, C, impl Dependencies>,
    source_alias: Alias,
    dest_alias: Alias,
    code: u16,
) {
    let mut payload = [0u8; 2];
    utilities::write_u16(&mut payload, code);
    let frame = tx::addressed_reply_frame(
        mti::DATAGRAM_REJECTED_REPLY,
        source_alias,
        dest_alias,
        &payload,
    );
    if let Ok(handle) = ctx.buffers.frames.allocate() {
        *ctx.buffers.frames.frame_mut(handle) = frame;
        if ctx.buffers.outgoing_frames.push(handle).is_err() {
            ctx.buffers.frames.free(handle);
        }
    }
}

/// An incoming datagram addressed to this node: acknowledge it and
/// dispatch its content. Returns the reply datagram, when one is due.
pub fn handle_datagram<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let message = *ctx.buffers.messages.message(incoming);
    let protocol = ctx.buffers.messages.payload(incoming).first().copied();

    let outcome = match protocol {
        Some(PROTOCOL_MEMORY_CONFIGURATION) => memory::process(ctx, incoming, node_index),
        _ => Outcome::Reject(error::PERMANENT_NOT_IMPLEMENTED),
    };

    // the ack travels as a single frame ahead of any reply content
    let (ours, theirs) = (message.dest_alias, message.source_alias);
    let reply = match outcome {
        Outcome::Reply(reply) => {
            queue_ok(ctx, ours, theirs, true);
            Some(reply)
        }
        Outcome::Ack => {
            queue_ok(ctx, ours, theirs, false);
            None
        }
        Outcome::Reject(code) => {
            queue_rejected(ctx, ours, theirs, code);
            None
        }
    };

    // the node no longer needs its pending-acknowledgement reference
    let node = ctx.nodes.node_mut(node_index);
    node.flags.datagram_ack_sent = true;
    if let Some(handle) = node.last_received_datagram.take() {
        ctx.buffers.messages.free(handle);
    }
    reply
}

/// The peer accepted our datagram.
pub fn handle_datagram_ok_reply<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    ctx.nodes.node_mut(node_index).flags.resend_datagram = false;
    None
}

/// The peer rejected our datagram; a temporary code asks for a resend.
pub fn handle_datagram_rejected_reply<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let payload = ctx.buffers.messages.payload(incoming);
    if payload.len() >= 2 {
        let code = utilities::read_u16(payload);
        if code & 0xF000 == error::TEMPORARY {
            ctx.nodes.node_mut(node_index).flags.resend_datagram = true;
        }
    }
    None
}
