//! Simple Node Information Protocol: the six identification strings.

use crate::config::Capacities;
use crate::interface::{Application, Dependencies, CONFIG_MEM_FAILED};
use crate::message::{MessageHandle, SizeClass};
use crate::mti;
use crate::protocol::main::HandlerContext;

/// Maximum stored length of the manufacturer and model strings, the
/// terminating NUL included.
pub const MANUFACTURER_FIELD_LEN: usize = 41;
/// Maximum stored length of the two version strings, NUL included.
pub const VERSION_FIELD_LEN: usize = 21;
/// Maximum stored length of the user name, NUL included.
pub const USER_NAME_FIELD_LEN: usize = 63;
/// Maximum stored length of the user description, NUL included.
pub const USER_DESCRIPTION_FIELD_LEN: usize = 64;

/// Offset of the user name inside configuration memory.
pub const CONFIG_USER_NAME_ADDRESS: u32 = 0x00;
/// Offset of the user description inside configuration memory.
pub const CONFIG_USER_DESCRIPTION_ADDRESS: u32 = 0x3F;

fn push_str(payload: &mut [u8], cursor: &mut usize, text: &str, field_len: usize) {
    let take = text.len().min(field_len - 1);
    payload[*cursor..*cursor + take].copy_from_slice(&text.as_bytes()[..take]);
    *cursor += take;
    payload[*cursor] = 0;
    *cursor += 1;
}

fn push_config_str<D: Application>(
    payload: &mut [u8],
    cursor: &mut usize,
    deps: &mut D,
    address: u32,
    field_len: usize,
    fallback: &str,
) {
    let mut buffer = [0u8; USER_DESCRIPTION_FIELD_LEN];
    let count = deps.configuration_memory_read(address, (field_len - 1) as u16, &mut buffer);
    if count == CONFIG_MEM_FAILED {
        push_str(payload, cursor, fallback, field_len);
        return;
    }
    let stored = &buffer[..usize::from(count).min(field_len - 1)];
    let text_len = stored.iter().position(|b| *b == 0).unwrap_or(stored.len());
    payload[*cursor..*cursor + text_len].copy_from_slice(&stored[..text_len]);
    *cursor += text_len;
    payload[*cursor] = 0;
    *cursor += 1;
}

/// Builds the SNIP reply: the manufacturer block from the node parameters
/// and the user block from configuration memory (with the parameter
/// defaults as fallback when no store is attached).
pub fn handle_simple_node_info_request<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let params = ctx.nodes.node(node_index).parameters();
    let incoming_message = *ctx.buffers.messages.message(incoming);

    let reply = ctx.buffers.messages.allocate(SizeClass::Snip).ok()?;
    let (message, payload) = ctx.buffers.messages.parts_mut(reply);
    message.reply_header(&incoming_message, mti::SIMPLE_NODE_INFO_REPLY);

    let mut cursor = 0;
    payload[cursor] = params.snip.mfg_version;
    cursor += 1;
    push_str(payload, &mut cursor, params.snip.name, MANUFACTURER_FIELD_LEN);
    push_str(payload, &mut cursor, params.snip.model, MANUFACTURER_FIELD_LEN);
    push_str(
        payload,
        &mut cursor,
        params.snip.hardware_version,
        VERSION_FIELD_LEN,
    );
    push_str(
        payload,
        &mut cursor,
        params.snip.software_version,
        VERSION_FIELD_LEN,
    );
    payload[cursor] = params.snip.user_version;
    cursor += 1;
    push_config_str(
        payload,
        &mut cursor,
        ctx.deps,
        CONFIG_USER_NAME_ADDRESS,
        USER_NAME_FIELD_LEN,
        params.snip.user_name,
    );
    push_config_str(
        payload,
        &mut cursor,
        ctx.deps,
        CONFIG_USER_DESCRIPTION_ADDRESS,
        USER_DESCRIPTION_FIELD_LEN,
        params.snip.user_description,
    );
    message.payload_count = cursor as u16;
    Some(reply)
}

/// SNIP reply from a peer: nothing to do in the core.
pub fn handle_simple_node_info_reply<C: Capacities, D: Dependencies>(
    _ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    None
}
