//! Memory Configuration protocol, carried inside datagrams whose first
//! byte is 0x20.

use crate::config::Capacities;
use crate::interface::{Dependencies, CONFIG_MEM_FAILED};
use crate::message::{MessageHandle, SizeClass};
use crate::mti;
use crate::node::NodeParameters;
use crate::protocol::datagram::Outcome;
use crate::protocol::main::HandlerContext;
use crate::protocol::{error, space};
use crate::utilities;

/// Write commands, address space encoded in the low bits or byte 6.
const CMD_WRITE: u8 = 0x00;
/// Write-under-mask commands.
const CMD_WRITE_UNDER_MASK: u8 = 0x08;
/// Read commands.
const CMD_READ: u8 = 0x40;
/// Offset turning a command into its OK reply.
const REPLY_OK_OFFSET: u8 = 0x10;
/// Offset turning a command into its failure reply.
const REPLY_FAIL_OFFSET: u8 = 0x18;
/// Get Configuration Options.
const CMD_OPTIONS: u8 = 0x80;
/// Get Configuration Options reply.
const CMD_OPTIONS_REPLY: u8 = 0x82;
/// Get Address Space Information.
const CMD_SPACE_INFO: u8 = 0x84;
/// Address space information reply, space not present.
const CMD_SPACE_INFO_REPLY_NOT_PRESENT: u8 = 0x86;
/// Address space information reply, space present.
const CMD_SPACE_INFO_REPLY_PRESENT: u8 = 0x87;
/// Reserve/Lock.
const CMD_RESERVE_LOCK: u8 = 0x88;
/// Reserve/Lock reply.
const CMD_RESERVE_LOCK_REPLY: u8 = 0x8A;
/// Get Unique ID.
const CMD_GET_UNIQUE_ID: u8 = 0x8C;
/// Get Unique ID reply.
const CMD_GET_UNIQUE_ID_REPLY: u8 = 0x8D;
/// Unfreeze (leave firmware upgrade mode).
const CMD_UNFREEZE: u8 = 0xA0;
/// Freeze (enter firmware upgrade mode).
const CMD_FREEZE: u8 = 0xA1;
/// Update complete.
const CMD_UPDATE_COMPLETE: u8 = 0xA8;
/// Reset/reboot.
const CMD_RESET_REBOOT: u8 = 0xA9;
/// Factory reset.
const CMD_FACTORY_RESET: u8 = 0xAA;

/// Largest read served from a single datagram.
const MAX_READ: u16 = 64;

/// Available-commands bits of the Options reply.
fn available_commands(params: &NodeParameters) -> u16 {
    let options = &params.configuration_options;
    let mut bits = 0;
    if options.write_under_mask {
        bits |= 0x8000;
    }
    if options.unaligned_reads {
        bits |= 0x4000;
    }
    if options.unaligned_writes {
        bits |= 0x2000;
    }
    if options.acdi_manufacturer_read {
        bits |= 0x0800;
    }
    if options.acdi_user_read {
        bits |= 0x0400;
    }
    if options.acdi_user_write {
        bits |= 0x0200;
    }
    bits
}

/// Resolves the address space of a read/write command. Returns the space
/// number and the offset of the first byte after the addressing fields.
fn resolve_space(command: u8, payload: &[u8]) -> Option<(u8, usize)> {
    match command & 0x03 {
        0x00 => payload.get(6).map(|space| (*space, 7)),
        0x01 => Some((space::CONFIGURATION, 6)),
        0x02 => Some((space::ALL, 6)),
        _ => Some((space::CDI, 6)),
    }
}

struct Reply {
    handle: MessageHandle,
}

fn begin_reply<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
) -> Option<Reply> {
    let incoming_message = *ctx.buffers.messages.message(incoming);
    let handle = ctx.buffers.messages.allocate(SizeClass::Datagram).ok()?;
    let (message, _) = ctx.buffers.messages.parts_mut(handle);
    message.reply_header(&incoming_message, mti::DATAGRAM);
    Some(Reply { handle })
}

fn read_from_space<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    node_index: usize,
    space_id: u8,
    address: u32,
    count: u16,
    buffer: &mut [u8],
) -> Result<u16, u16> {
    let params = ctx.nodes.node(node_index).parameters();
    match space_id {
        space::CDI => {
            let cdi = params.cdi;
            let start = address as usize;
            if start >= cdi.len() {
                return Err(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS);
            }
            let take = usize::from(count).min(cdi.len() - start);
            buffer[..take].copy_from_slice(&cdi[start..start + take]);
            Ok(take as u16)
        }
        space::ACDI_MANUFACTURER => read_acdi_manufacturer(params, address, count, buffer),
        space::ACDI_USER => read_acdi_user(ctx, params, address, count, buffer),
        space::CONFIGURATION | space::ALL => {
            let highest = params.address_space_configuration_memory.highest_address;
            if highest != 0 && address >= highest {
                return Err(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS);
            }
            let result = ctx.deps.configuration_memory_read(address, count, buffer);
            if result == CONFIG_MEM_FAILED {
                Err(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS)
            } else {
                Ok(result)
            }
        }
        _ => Err(error::PERMANENT_ADDRESS_SPACE_UNKNOWN),
    }
}

/// ACDI manufacturer space: version byte then the four parameter strings
/// at their fixed offsets.
fn read_acdi_manufacturer(
    params: &NodeParameters,
    address: u32,
    count: u16,
    buffer: &mut [u8],
) -> Result<u16, u16> {
    const LAYOUT_LEN: u32 = 125;
    if address >= LAYOUT_LEN {
        return Err(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS);
    }
    let mut image = [0u8; LAYOUT_LEN as usize];
    image[0] = params.snip.mfg_version;
    copy_str(&mut image[1..42], params.snip.name);
    copy_str(&mut image[42..83], params.snip.model);
    copy_str(&mut image[83..104], params.snip.hardware_version);
    copy_str(&mut image[104..125], params.snip.software_version);

    let start = address as usize;
    let take = usize::from(count).min(image.len() - start);
    buffer[..take].copy_from_slice(&image[start..start + take]);
    Ok(take as u16)
}

/// ACDI user space: version byte, then the user name and description
/// backed by the first 128 bytes of configuration memory.
fn read_acdi_user<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    params: &NodeParameters,
    address: u32,
    count: u16,
    buffer: &mut [u8],
) -> Result<u16, u16> {
    const LAYOUT_LEN: u32 = 128;
    if address >= LAYOUT_LEN {
        return Err(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS);
    }
    let mut produced = 0usize;
    let mut address = address;
    let mut remaining = usize::from(count).min((LAYOUT_LEN - address) as usize);
    if address == 0 && remaining > 0 {
        buffer[0] = params.snip.user_version;
        produced += 1;
        remaining -= 1;
        address += 1;
    }
    if remaining > 0 {
        let read = ctx
            .deps
            .configuration_memory_read(address - 1, remaining as u16, &mut buffer[produced..]);
        if read == CONFIG_MEM_FAILED {
            return Err(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS);
        }
        produced += usize::from(read);
    }
    Ok(produced as u16)
}

fn copy_str(field: &mut [u8], text: &str) {
    let take = text.len().min(field.len() - 1);
    field[..take].copy_from_slice(&text.as_bytes()[..take]);
}

fn write_to_space<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    node_index: usize,
    space_id: u8,
    address: u32,
    data: &[u8],
) -> Result<(), u16> {
    let node = ctx.nodes.node(node_index);
    let params = node.parameters();
    match space_id {
        space::CDI | space::ACDI_MANUFACTURER => Err(error::PERMANENT_WRITE_TO_READ_ONLY),
        space::ACDI_USER => {
            if address == 0 {
                return Err(error::PERMANENT_WRITE_TO_READ_ONLY);
            }
            if !params.configuration_options.acdi_user_write {
                return Err(error::PERMANENT_WRITE_TO_READ_ONLY);
            }
            match ctx.deps.configuration_memory_write(address - 1, data) {
                CONFIG_MEM_FAILED => Err(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS),
                _ => Ok(()),
            }
        }
        space::CONFIGURATION | space::ALL => {
            if params.address_space_configuration_memory.read_only {
                return Err(error::PERMANENT_WRITE_TO_READ_ONLY);
            }
            match ctx.deps.configuration_memory_write(address, data) {
                CONFIG_MEM_FAILED => Err(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS),
                _ => Ok(()),
            }
        }
        space::FIRMWARE => {
            if !node.flags.firmware_upgrade_active {
                return Err(error::PERMANENT_SOURCE_NOT_PERMITTED);
            }
            match ctx.deps.configuration_memory_write(address, data) {
                CONFIG_MEM_FAILED => Err(error::TEMPORARY_TRANSFER_ERROR),
                _ => Ok(()),
            }
        }
        _ => Err(error::PERMANENT_ADDRESS_SPACE_UNKNOWN),
    }
}

fn handle_read<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
    command: u8,
    payload: &[u8],
) -> Outcome {
    let Some((space_id, count_offset)) = resolve_space(command, payload) else {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    };
    if payload.len() <= count_offset {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    }
    let address = utilities::read_u32(&payload[2..6]);
    let count = u16::from(payload[count_offset] & 0x7F);
    if count > MAX_READ {
        return Outcome::Reject(error::PERMANENT_COUNT_OUT_OF_RANGE);
    }

    let mut data = [0u8; MAX_READ as usize];
    let result = read_from_space(ctx, node_index, space_id, address, count, &mut data);

    let Some(reply) = begin_reply(ctx, incoming) else {
        return Outcome::Reject(error::TEMPORARY_BUFFER_UNAVAILABLE);
    };
    let (message, reply_payload) = ctx.buffers.messages.parts_mut(reply.handle);
    reply_payload[0] = super::datagram::PROTOCOL_MEMORY_CONFIGURATION;
    utilities::write_u32(&mut reply_payload[2..6], address);
    let mut cursor = 6;
    if command & 0x03 == 0x00 {
        reply_payload[cursor] = space_id;
        cursor += 1;
    }
    match result {
        Ok(read) => {
            reply_payload[1] = command + REPLY_OK_OFFSET;
            reply_payload[cursor..cursor + usize::from(read)]
                .copy_from_slice(&data[..usize::from(read)]);
            cursor += usize::from(read);
        }
        Err(code) => {
            reply_payload[1] = command + REPLY_FAIL_OFFSET;
            utilities::write_u16(&mut reply_payload[cursor..], code);
            cursor += 2;
        }
    }
    message.payload_count = cursor as u16;
    Outcome::Reply(reply.handle)
}

fn handle_write<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
    command: u8,
    payload: &[u8],
) -> Outcome {
    let Some((space_id, data_offset)) = resolve_space(command, payload) else {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    };
    if payload.len() < data_offset {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    }
    let address = utilities::read_u32(&payload[2..6]);
    let mut data = [0u8; 72];
    let data_len = payload.len() - data_offset;
    data[..data_len].copy_from_slice(&payload[data_offset..]);

    let result = write_to_space(ctx, node_index, space_id, address, &data[..data_len]);

    let Some(reply) = begin_reply(ctx, incoming) else {
        return Outcome::Reject(error::TEMPORARY_BUFFER_UNAVAILABLE);
    };
    let (message, reply_payload) = ctx.buffers.messages.parts_mut(reply.handle);
    reply_payload[0] = super::datagram::PROTOCOL_MEMORY_CONFIGURATION;
    utilities::write_u32(&mut reply_payload[2..6], address);
    let mut cursor = 6;
    if command & 0x03 == 0x00 {
        reply_payload[cursor] = space_id;
        cursor += 1;
    }
    match result {
        Ok(()) => reply_payload[1] = command + REPLY_OK_OFFSET,
        Err(code) => {
            reply_payload[1] = command + REPLY_FAIL_OFFSET;
            utilities::write_u16(&mut reply_payload[cursor..], code);
            cursor += 2;
        }
    }
    message.payload_count = cursor as u16;
    Outcome::Reply(reply.handle)
}

/// Write-under-mask: the data field alternates mask and value bytes.
fn handle_write_under_mask<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
    command: u8,
    payload: &[u8],
) -> Outcome {
    if !ctx
        .nodes
        .node(node_index)
        .parameters()
        .configuration_options
        .write_under_mask
    {
        return Outcome::Reject(error::PERMANENT_SUBCOMMAND_UNKNOWN);
    }
    let Some((space_id, data_offset)) = resolve_space(command, payload) else {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    };
    if payload.len() < data_offset || (payload.len() - data_offset) % 2 != 0 {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    }
    let address = utilities::read_u32(&payload[2..6]);
    let pairs = (payload.len() - data_offset) / 2;

    let mut current = [0u8; 36];
    if read_from_space(ctx, node_index, space_id, address, pairs as u16, &mut current).is_err() {
        return Outcome::Reject(error::PERMANENT_ADDRESS_OUT_OF_BOUNDS);
    }
    for i in 0..pairs {
        let mask = payload[data_offset + 2 * i];
        let value = payload[data_offset + 2 * i + 1];
        current[i] = (current[i] & !mask) | (value & mask);
    }

    // re-dispatch as a plain write of the merged bytes
    let write_command = command & !CMD_WRITE_UNDER_MASK;
    let mut merged = [0u8; 72];
    merged[..data_offset].copy_from_slice(&payload[..data_offset]);
    merged[1] = write_command;
    merged[data_offset..data_offset + pairs].copy_from_slice(&current[..pairs]);
    handle_write(
        ctx,
        incoming,
        node_index,
        write_command,
        &merged[..data_offset + pairs],
    )
}

fn handle_options<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Outcome {
    let params = ctx.nodes.node(node_index).parameters();
    let commands = available_commands(params);
    // 1-, 2- and 4-byte writes plus arbitrary lengths, and optionally
    // stream transfers
    let mut write_lengths: u8 = 0x80 | 0x40 | 0x20 | 0x02;
    if params.configuration_options.stream_read_write {
        write_lengths |= 0x01;
    }
    let (high, low) = (
        params.configuration_options.high_address_space,
        params.configuration_options.low_address_space,
    );

    let Some(reply) = begin_reply(ctx, incoming) else {
        return Outcome::Reject(error::TEMPORARY_BUFFER_UNAVAILABLE);
    };
    let (message, payload) = ctx.buffers.messages.parts_mut(reply.handle);
    payload[0] = super::datagram::PROTOCOL_MEMORY_CONFIGURATION;
    payload[1] = CMD_OPTIONS_REPLY;
    utilities::write_u16(&mut payload[2..4], commands);
    payload[4] = write_lengths;
    payload[5] = high;
    payload[6] = low;
    message.payload_count = 7;
    Outcome::Reply(reply.handle)
}

fn handle_space_info<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
    payload: &[u8],
) -> Outcome {
    let Some(&queried) = payload.get(2) else {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    };
    let params = ctx.nodes.node(node_index).parameters();
    let descriptor = params.address_space(queried);

    let Some(reply) = begin_reply(ctx, incoming) else {
        return Outcome::Reject(error::TEMPORARY_BUFFER_UNAVAILABLE);
    };
    let (message, reply_payload) = ctx.buffers.messages.parts_mut(reply.handle);
    reply_payload[0] = super::datagram::PROTOCOL_MEMORY_CONFIGURATION;
    match descriptor {
        Some(descriptor) if descriptor.present => {
            reply_payload[1] = CMD_SPACE_INFO_REPLY_PRESENT;
            reply_payload[2] = queried;
            utilities::write_u32(&mut reply_payload[3..7], descriptor.highest_address);
            let mut flags = 0u8;
            if descriptor.read_only {
                flags |= 0x01;
            }
            if descriptor.low_address_valid {
                flags |= 0x02;
            }
            reply_payload[7] = flags;
            let mut cursor = 8;
            if descriptor.low_address_valid {
                utilities::write_u32(&mut reply_payload[8..12], descriptor.low_address);
                cursor = 12;
            }
            message.payload_count = cursor as u16;
        }
        _ => {
            reply_payload[1] = CMD_SPACE_INFO_REPLY_NOT_PRESENT;
            reply_payload[2] = queried;
            message.payload_count = 3;
        }
    }
    Outcome::Reply(reply.handle)
}

fn handle_reserve_lock<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
    payload: &[u8],
) -> Outcome {
    if payload.len() < 8 {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    }
    let requested = utilities::read_node_id(&payload[2..8]);
    let node = ctx.nodes.node_mut(node_index);
    if node.owner_node == 0 || requested == 0 {
        node.owner_node = requested;
    }
    let owner = node.owner_node;

    let Some(reply) = begin_reply(ctx, incoming) else {
        return Outcome::Reject(error::TEMPORARY_BUFFER_UNAVAILABLE);
    };
    let (message, reply_payload) = ctx.buffers.messages.parts_mut(reply.handle);
    reply_payload[0] = super::datagram::PROTOCOL_MEMORY_CONFIGURATION;
    reply_payload[1] = CMD_RESERVE_LOCK_REPLY;
    utilities::write_node_id(&mut reply_payload[2..8], owner);
    message.payload_count = 8;
    Outcome::Reply(reply.handle)
}

fn handle_get_unique_id<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Outcome {
    let id = ctx.nodes.node(node_index).id;
    let Some(reply) = begin_reply(ctx, incoming) else {
        return Outcome::Reject(error::TEMPORARY_BUFFER_UNAVAILABLE);
    };
    let (message, reply_payload) = ctx.buffers.messages.parts_mut(reply.handle);
    reply_payload[0] = super::datagram::PROTOCOL_MEMORY_CONFIGURATION;
    reply_payload[1] = CMD_GET_UNIQUE_ID_REPLY;
    utilities::write_node_id(&mut reply_payload[2..8], id);
    message.payload_count = 8;
    Outcome::Reply(reply.handle)
}

/// Dispatches one memory configuration datagram. The caller has already
/// verified the protocol byte.
pub fn process<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Outcome {
    let mut payload = [0u8; 72];
    let source = ctx.buffers.messages.payload(incoming);
    let payload_len = source.len().min(payload.len());
    payload[..payload_len].copy_from_slice(&source[..payload_len]);
    let payload = &payload[..payload_len];

    let Some(&command) = payload.get(1) else {
        return Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS);
    };

    match command {
        _ if command & 0xFC == CMD_READ => {
            handle_read(ctx, incoming, node_index, command, payload)
        }
        _ if command & 0xFC == CMD_WRITE => {
            handle_write(ctx, incoming, node_index, command, payload)
        }
        _ if command & 0xFC == CMD_WRITE_UNDER_MASK => {
            handle_write_under_mask(ctx, incoming, node_index, command, payload)
        }
        _ if command & 0xF0 == 0x60 || command & 0xF0 == 0x20 => {
            // stream read/write variants are advertised only when enabled
            Outcome::Reject(error::PERMANENT_SUBCOMMAND_UNKNOWN)
        }
        CMD_OPTIONS => handle_options(ctx, incoming, node_index),
        CMD_SPACE_INFO => handle_space_info(ctx, incoming, node_index, payload),
        CMD_RESERVE_LOCK => handle_reserve_lock(ctx, incoming, node_index, payload),
        CMD_GET_UNIQUE_ID => handle_get_unique_id(ctx, incoming, node_index),
        CMD_FREEZE => {
            if payload.get(2) == Some(&space::FIRMWARE) {
                ctx.nodes.node_mut(node_index).flags.firmware_upgrade_active = true;
            }
            Outcome::Ack
        }
        CMD_UNFREEZE => {
            ctx.nodes.node_mut(node_index).flags.firmware_upgrade_active = false;
            Outcome::Ack
        }
        CMD_UPDATE_COMPLETE => Outcome::Ack,
        CMD_RESET_REBOOT => {
            ctx.deps.reboot();
            Outcome::Ack
        }
        CMD_FACTORY_RESET => {
            let node_id = ctx.nodes.node(node_index).id;
            if payload.len() >= 8 && utilities::read_node_id(&payload[2..8]) == node_id {
                ctx.deps.factory_reset();
                Outcome::Ack
            } else {
                Outcome::Reject(error::PERMANENT_INVALID_ARGUMENTS)
            }
        }
        _ => Outcome::Reject(error::PERMANENT_COMMAND_UNKNOWN),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DefaultCapacities;
    use crate::frame::CanFrame;
    use crate::interface::{Application, CanDevice, ClockObserver, Platform};
    use crate::node::{AddressSpace, NodeRegistry};
    use crate::protocol::broadcast_time::BroadcastTimeEngine;
    use crate::protocol::main::HandlerContext;
    use crate::stack::Buffers;

    type Caps = DefaultCapacities;

    static PARAMS: NodeParameters = {
        let mut p = NodeParameters::const_default();
        p.cdi = b"<cdi></cdi>";
        p.address_space_configuration_memory = AddressSpace {
            present: true,
            read_only: false,
            low_address_valid: false,
            low_address: 0,
            highest_address: 0x200,
            space: 0xFD,
            description: "",
        };
        p
    };

    /// 64 bytes of scripted configuration memory.
    struct Store {
        memory: [u8; 64],
    }

    impl Default for Store {
        fn default() -> Self {
            Self { memory: [0; 64] }
        }
    }

    impl CanDevice for Store {
        fn transmit(&mut self, _: &CanFrame) -> nb::Result<(), core::convert::Infallible> {
            Ok(())
        }
    }
    impl Platform for Store {}
    impl ClockObserver for Store {}
    impl Application for Store {
        fn configuration_memory_read(&mut self, address: u32, count: u16, buffer: &mut [u8]) -> u16 {
            let start = address as usize;
            if start >= self.memory.len() {
                return crate::interface::CONFIG_MEM_FAILED;
            }
            let take = usize::from(count)
                .min(self.memory.len() - start)
                .min(buffer.len());
            buffer[..take].copy_from_slice(&self.memory[start..start + take]);
            take as u16
        }
        fn configuration_memory_write(&mut self, address: u32, buffer: &[u8]) -> u16 {
            let start = address as usize;
            if start >= self.memory.len() {
                return crate::interface::CONFIG_MEM_FAILED;
            }
            let take = buffer.len().min(self.memory.len() - start);
            self.memory[start..start + take].copy_from_slice(&buffer[..take]);
            take as u16
        }
    }

    struct Fixture {
        buffers: Buffers<Caps>,
        nodes: NodeRegistry<Caps>,
        clocks: BroadcastTimeEngine<Caps>,
        pending: Option<crate::protocol::broadcast_time::PendingQueryReply>,
        deps: Store,
    }

    impl Fixture {
        fn new() -> Self {
            let mut nodes: NodeRegistry<Caps> = NodeRegistry::default();
            let index = nodes.allocate(0x0605_0403_0201, &PARAMS).unwrap();
            let node = nodes.node_mut(index);
            node.alias = 0xBBB;
            node.flags.permitted = true;
            node.flags.initialized = true;
            Self {
                buffers: Buffers::default(),
                nodes,
                clocks: BroadcastTimeEngine::default(),
                pending: None,
                deps: Store::default(),
            }
        }

        fn process(&mut self, command: &[u8]) -> Outcome {
            let incoming = self
                .buffers
                .messages
                .allocate(SizeClass::Datagram)
                .unwrap();
            let (message, _) = self.buffers.messages.parts_mut(incoming);
            message.set_header(mti::DATAGRAM, 0x222, 0x0102_0304_0506, 0xBBB, 0x0605_0403_0201);
            self.buffers.messages.append_payload(incoming, command);
            let mut ctx = HandlerContext {
                buffers: &mut self.buffers,
                nodes: &mut self.nodes,
                clocks: &mut self.clocks,
                pending_query_reply: &mut self.pending,
                deps: &mut self.deps,
            };
            let outcome = process(&mut ctx, incoming, 0);
            self.buffers.messages.free(incoming);
            outcome
        }

        fn reply_payload(&mut self, outcome: Outcome) -> ([u8; 72], usize) {
            match outcome {
                Outcome::Reply(handle) => {
                    let mut copy = [0u8; 72];
                    let payload = self.buffers.messages.payload(handle);
                    copy[..payload.len()].copy_from_slice(payload);
                    let len = payload.len();
                    self.buffers.messages.free(handle);
                    (copy, len)
                }
                _ => panic!("expected a reply datagram"),
            }
        }
    }

    #[test]
    fn write_then_read_configuration_memory() {
        let mut fixture = Fixture::new();

        // write 4 bytes at address 0x10 of space 0xFD
        let outcome = fixture.process(&[
            0x20, 0x01, 0x00, 0x00, 0x00, 0x10, 0xDE, 0xAD, 0xBE, 0xEF,
        ]);
        let (reply, len) = fixture.reply_payload(outcome);
        assert_eq!(&reply[..len], &[0x20, 0x11, 0x00, 0x00, 0x00, 0x10]);
        assert_eq!(&fixture.deps.memory[0x10..0x14], &[0xDE, 0xAD, 0xBE, 0xEF]);

        // read them back
        let outcome = fixture.process(&[0x20, 0x41, 0x00, 0x00, 0x00, 0x10, 0x04]);
        let (reply, len) = fixture.reply_payload(outcome);
        assert_eq!(
            &reply[..len],
            &[0x20, 0x51, 0x00, 0x00, 0x00, 0x10, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn cdi_reads_come_from_the_parameters() {
        let mut fixture = Fixture::new();
        let outcome = fixture.process(&[0x20, 0x43, 0x00, 0x00, 0x00, 0x00, 0x0B]);
        let (reply, len) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x53);
        assert_eq!(&reply[6..len], b"<cdi></cdi>");
    }

    #[test]
    fn cdi_writes_are_rejected_as_read_only() {
        let mut fixture = Fixture::new();
        let outcome = fixture.process(&[0x20, 0x03, 0x00, 0x00, 0x00, 0x00, 0xFF]);
        let (reply, len) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x1B);
        // error code after the address
        assert_eq!(&reply[6..len], &[0x10, 0x03]);
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let mut fixture = Fixture::new();
        // CDI is 11 bytes long
        let outcome = fixture.process(&[0x20, 0x43, 0x00, 0x00, 0x01, 0x00, 0x08]);
        let (reply, len) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x5B);
        assert_eq!(&reply[6..len], &[0x10, 0x02]);
    }

    #[test]
    fn acdi_manufacturer_layout() {
        let mut fixture = Fixture::new();
        let outcome = fixture.process(&[0x20, 0x40, 0x00, 0x00, 0x00, 0x00, 0xFC, 0x02]);
        let (reply, len) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x50);
        assert_eq!(reply[6], 0xFC);
        // version byte then the first (empty) manufacturer byte
        assert_eq!(&reply[7..len], &[4, 0]);
    }

    #[test]
    fn options_and_space_info() {
        let mut fixture = Fixture::new();
        let outcome = fixture.process(&[0x20, 0x80]);
        let (reply, _) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x82);
        // ACDI manufacturer and user reads plus user write
        assert_eq!(utilities::read_u16(&reply[2..4]), 0x0E00);
        assert_eq!(reply[5], 0xFF);
        assert_eq!(reply[6], 0xFD);

        let outcome = fixture.process(&[0x20, 0x84, 0xFD]);
        let (reply, _) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x87);
        assert_eq!(reply[2], 0xFD);
        assert_eq!(utilities::read_u32(&reply[3..7]), 0x200);

        let outcome = fixture.process(&[0x20, 0x84, 0xF0]);
        let (reply, _) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x86);
    }

    #[test]
    fn lock_and_unique_id() {
        let mut fixture = Fixture::new();
        let outcome = fixture.process(&[0x20, 0x88, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let (reply, _) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x8A);
        assert_eq!(&reply[2..8], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(fixture.nodes.node(0).owner_node, 0x0102_0304_0506);

        // a second holder cannot take the lock
        let outcome = fixture.process(&[0x20, 0x88, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]);
        let (reply, _) = fixture.reply_payload(outcome);
        assert_eq!(&reply[2..8], &[1, 2, 3, 4, 5, 6]);

        // zero releases it
        let outcome = fixture.process(&[0x20, 0x88, 0, 0, 0, 0, 0, 0]);
        let (reply, _) = fixture.reply_payload(outcome);
        assert_eq!(&reply[2..8], &[0, 0, 0, 0, 0, 0]);

        let outcome = fixture.process(&[0x20, 0x8C]);
        let (reply, _) = fixture.reply_payload(outcome);
        assert_eq!(reply[1], 0x8D);
        assert_eq!(&reply[2..8], &[6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn freeze_controls_the_firmware_flag() {
        let mut fixture = Fixture::new();
        assert!(matches!(
            fixture.process(&[0x20, 0xA1, 0xEF]),
            Outcome::Ack
        ));
        assert!(fixture.nodes.node(0).flags.firmware_upgrade_active);
        assert!(matches!(
            fixture.process(&[0x20, 0xA0, 0xEF]),
            Outcome::Ack
        ));
        assert!(!fixture.nodes.node(0).flags.firmware_upgrade_active);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut fixture = Fixture::new();
        assert!(matches!(
            fixture.process(&[0x20, 0xFE]),
            Outcome::Reject(code) if code == error::PERMANENT_COMMAND_UNKNOWN
        ));
    }
}
