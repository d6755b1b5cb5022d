//! Message Network protocol: node identification and capability
//! discovery.

use crate::config::Capacities;
use crate::interface::Dependencies;
use crate::message::{MessageHandle, SizeClass};
use crate::mti;
use crate::protocol::main::HandlerContext;
use crate::protocol::psi;
use crate::utilities;

fn verified_mti(protocol_support: u64) -> u16 {
    if protocol_support & psi::SIMPLE != 0 {
        mti::VERIFIED_NODE_ID_SIMPLE
    } else {
        mti::VERIFIED_NODE_ID
    }
}

fn load_verified<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    node_index: usize,
) -> Option<MessageHandle> {
    let node = ctx.nodes.node(node_index);
    let mti = verified_mti(node.parameters().protocol_support);
    let (alias, id) = (node.alias, node.id);

    let reply = ctx.buffers.messages.allocate(SizeClass::Basic).ok()?;
    let (message, payload) = ctx.buffers.messages.parts_mut(reply);
    message.set_header(mti, alias, id, 0, 0);
    utilities::write_node_id(payload, id);
    message.payload_count = 6;
    Some(reply)
}

/// Verify Node ID, addressed form: the addressed node always answers.
pub fn handle_verify_node_id_addressed<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    load_verified(ctx, node_index)
}

/// Verify Node ID, global form: answer when the payload is empty or names
/// this node.
pub fn handle_verify_node_id_global<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let payload = ctx.buffers.messages.payload(incoming);
    if payload.len() >= 6 {
        let queried = utilities::read_node_id(payload);
        if queried != ctx.nodes.node(node_index).id {
            return None;
        }
    }
    load_verified(ctx, node_index)
}

/// Verified Node ID from a peer: refresh the alias mapping.
pub fn handle_verified_node_id<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    let message = *ctx.buffers.messages.message(incoming);
    let payload = ctx.buffers.messages.payload(incoming);
    if payload.len() >= 6 {
        let node_id = utilities::read_node_id(payload);
        let _ = ctx.buffers.aliases.register(message.source_alias, node_id);
    }
    None
}

/// Protocol Support Inquiry: answer with the 48-bit capability field.
pub fn handle_protocol_support_inquiry<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let support = ctx.nodes.node(node_index).parameters().protocol_support;
    let incoming_message = *ctx.buffers.messages.message(incoming);

    let reply = ctx.buffers.messages.allocate(SizeClass::Basic).ok()?;
    let (message, payload) = ctx.buffers.messages.parts_mut(reply);
    message.reply_header(&incoming_message, mti::PROTOCOL_SUPPORT_REPLY);
    // the PSI constants name the first three reply bytes
    let field = (support & 0x00FF_FFFF) << 24;
    payload[..6].copy_from_slice(&field.to_be_bytes()[2..8]);
    message.payload_count = 6;
    Some(reply)
}

/// Protocol Support Reply from a peer: nothing to do in the core.
pub fn handle_protocol_support_reply<C: Capacities, D: Dependencies>(
    _ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    None
}

/// A peer rejected one of our interactions.
pub fn handle_optional_interaction_rejected<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    let message = *ctx.buffers.messages.message(incoming);
    ctx.deps.on_optional_interaction_rejected(&message);
    None
}

/// A peer terminated an interaction due to an error.
pub fn handle_terminate_due_to_error<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    let message = *ctx.buffers.messages.message(incoming);
    ctx.deps.on_terminate_due_to_error(&message);
    None
}
