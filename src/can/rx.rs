//! Classification of inbound CAN frames and reassembly into whole OpenLCB
//! messages.
//!
//! This is the interrupt-side entry point: the driver's receive callback
//! hands every frame to [`CanRxStatemachine::incoming_frame`], which either
//! updates login/alias state or pushes a completed message onto the
//! incoming queue for the main state machine to drain later. Error replies
//! (reassembly order violations, datagram collisions) fit a single frame
//! and are queued directly on the outgoing frame queue.

use crate::config::Capacities;
use crate::frame::CanFrame;
use crate::identifier::{
    FrameClass, FrameType, MULTIFRAME_FINAL, MULTIFRAME_FIRST, MULTIFRAME_MASK, MULTIFRAME_MIDDLE,
    MULTIFRAME_ONLY,
};
use crate::message::{Alias, MessageHandle, SizeClass};
use crate::mti;
use crate::node::NodeRegistry;
use crate::protocol::error;
use crate::can::tx;
use crate::stack::Buffers;
use crate::utilities;
use generic_array::GenericArray;

/// One addressed message being reassembled across frames.
#[derive(Copy, Clone, Debug)]
pub struct InflightSlot {
    /// Alias of the sender
    pub source_alias: Alias,
    /// Alias of the addressed node (zero for global reports with payload)
    pub dest_alias: Alias,
    /// MTI of the sequence
    pub mti: u16,
    /// Buffer accumulating the payload
    pub handle: MessageHandle,
}

/// The frame-to-message reassembly state machine.
pub struct CanRxStatemachine<C: Capacities> {
    inflight: GenericArray<Option<InflightSlot>, C::Inflight>,
}

impl<C: Capacities> Default for CanRxStatemachine<C> {
    fn default() -> Self {
        Self {
            inflight: GenericArray::default(),
        }
    }
}

impl<C: Capacities> CanRxStatemachine<C> {
    /// Processes one received frame. Call from the driver's receive path
    /// with the shared resources locked.
    pub fn incoming_frame(
        &mut self,
        frame: &CanFrame,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
    ) {
        let id = frame.id();
        let class = id.class();

        if self.handle_alias_conflict(frame, class, buffers, nodes) {
            return;
        }

        match class {
            FrameClass::Message(FrameType::Standard) => {
                self.handle_standard(frame, buffers, nodes)
            }
            FrameClass::Message(FrameType::DatagramOnly) => {
                self.handle_datagram(frame, FrameType::DatagramOnly, buffers, nodes)
            }
            FrameClass::Message(FrameType::DatagramFirst) => {
                self.handle_datagram(frame, FrameType::DatagramFirst, buffers, nodes)
            }
            FrameClass::Message(FrameType::DatagramMiddle) => {
                self.handle_datagram(frame, FrameType::DatagramMiddle, buffers, nodes)
            }
            FrameClass::Message(FrameType::DatagramFinal) => {
                self.handle_datagram(frame, FrameType::DatagramFinal, buffers, nodes)
            }
            FrameClass::Message(FrameType::Stream) => self.handle_stream(frame, buffers, nodes),
            FrameClass::AliasMapEnquiry => handle_alias_map_enquiry(frame, buffers, nodes),
            FrameClass::AliasMapDefinition => handle_alias_map_definition(frame, buffers, nodes),
            FrameClass::AliasMapReset => {
                buffers.aliases.unregister(id.source_alias());
            }
            FrameClass::CheckId(_)
            | FrameClass::ReserveId
            | FrameClass::ErrorInformationReport
            | FrameClass::Reserved => {}
        }
    }

    /// Detects a remote node using one of our aliases. Returns true when
    /// the frame was fully handled here.
    fn handle_alias_conflict(
        &mut self,
        frame: &CanFrame,
        class: FrameClass,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
    ) -> bool {
        let source_alias = frame.id().source_alias();
        let Some(index) = nodes.find_by_alias(source_alias) else {
            return false;
        };
        let node = nodes.node_mut(index);

        if node.flags.permitted {
            if let FrameClass::CheckId(_) = class {
                // Someone is checking an alias we own; defend it with RID.
                queue_control_frame(
                    buffers,
                    CanFrame::empty(crate::identifier::CanIdentifier::control(
                        crate::identifier::CONTROL_RID,
                        source_alias,
                    )),
                );
                return true;
            }
        }

        // A frame other than CID carrying our alias as source means the
        // alias is genuinely in use elsewhere; give it up and re-login.
        node.flags.duplicate_alias_detected = true;
        if let Some(mapping) = buffers.aliases.find_by_alias_mut(source_alias) {
            mapping.is_duplicate = true;
        }
        buffers.aliases.set_has_duplicate_alias();
        true
    }

    fn handle_standard(
        &mut self,
        frame: &CanFrame,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
    ) {
        let id = frame.id();
        let message_mti = id.variable_field();
        if mti::is_addressed(message_mti) {
            self.handle_addressed(frame, buffers, nodes);
        } else {
            self.handle_global(frame, buffers);
        }
    }

    fn handle_global(&mut self, frame: &CanFrame, buffers: &mut Buffers<C>) {
        let id = frame.id();
        let message_mti = id.variable_field();
        let data = frame.data();

        // Global event reports with payload span frames under their own
        // first/middle/final MTIs and are delivered as one message.
        let sender_id = source_id(buffers, id.source_alias());
        match message_mti {
            mti::PC_EVENT_REPORT_WITH_PAYLOAD_FIRST => {
                let Ok(handle) = buffers.messages.allocate(SizeClass::Snip) else {
                    return;
                };
                let (message, _) = buffers.messages.parts_mut(handle);
                message.set_header(
                    mti::PC_EVENT_REPORT_WITH_PAYLOAD,
                    id.source_alias(),
                    sender_id,
                    0,
                    0,
                );
                buffers.messages.append_payload(handle, data);
                self.store_inflight(
                    buffers,
                    InflightSlot {
                        source_alias: id.source_alias(),
                        dest_alias: 0,
                        mti: mti::PC_EVENT_REPORT_WITH_PAYLOAD,
                        handle,
                    },
                );
                return;
            }
            mti::PC_EVENT_REPORT_WITH_PAYLOAD_MIDDLE | mti::PC_EVENT_REPORT_WITH_PAYLOAD => {
                if let Some(slot) = self.take_inflight(
                    id.source_alias(),
                    0,
                    mti::PC_EVENT_REPORT_WITH_PAYLOAD,
                    message_mti == mti::PC_EVENT_REPORT_WITH_PAYLOAD_MIDDLE,
                ) {
                    buffers.messages.append_payload(slot.handle, data);
                    if message_mti == mti::PC_EVENT_REPORT_WITH_PAYLOAD {
                        deliver(buffers, slot.handle);
                    }
                    return;
                }
                if message_mti == mti::PC_EVENT_REPORT_WITH_PAYLOAD_MIDDLE {
                    // middle without a start; global, so nobody to notify
                    return;
                }
                // fall through: a single-frame report with payload
            }
            _ => {}
        }

        let Ok(handle) = buffers
            .messages
            .allocate(SizeClass::for_payload(data.len() as u16))
        else {
            return;
        };
        let (message, _) = buffers.messages.parts_mut(handle);
        message.set_header(message_mti, id.source_alias(), sender_id, 0, 0);
        buffers.messages.append_payload(handle, data);
        deliver(buffers, handle);
    }

    fn handle_addressed(
        &mut self,
        frame: &CanFrame,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
    ) {
        let id = frame.id();
        let message_mti = id.variable_field();
        let data = frame.data();
        if data.len() < 2 {
            return;
        }
        let marker = data[0] & MULTIFRAME_MASK;
        let dest_alias = (u16::from(data[0] & 0x0F) << 8) | u16::from(data[1]);
        let Some(node_index) = nodes.find_by_alias(dest_alias) else {
            // not for a node we own
            return;
        };
        let dest_id = nodes.node(node_index).id;
        let sender_id = source_id(buffers, id.source_alias());
        let body = &data[2..];

        match marker {
            MULTIFRAME_ONLY => {
                let class = if message_mti == mti::SIMPLE_NODE_INFO_REPLY {
                    SizeClass::Snip
                } else {
                    SizeClass::for_payload(body.len() as u16)
                };
                let Ok(handle) = buffers.messages.allocate(class) else {
                    return;
                };
                let (message, _) = buffers.messages.parts_mut(handle);
                message.set_header(message_mti, id.source_alias(), sender_id, dest_alias, dest_id);
                buffers.messages.append_payload(handle, body);
                deliver(buffers, handle);
            }
            MULTIFRAME_FIRST => {
                if self
                    .find_inflight(id.source_alias(), dest_alias, message_mti)
                    .is_some()
                {
                    queue_rejection(
                        buffers,
                        message_mti,
                        dest_alias,
                        id.source_alias(),
                        error::TEMPORARY_START_BEFORE_LAST_END,
                    );
                    return;
                }
                let Ok(handle) = buffers.messages.allocate(SizeClass::Snip) else {
                    queue_rejection(
                        buffers,
                        message_mti,
                        dest_alias,
                        id.source_alias(),
                        error::TEMPORARY_BUFFER_UNAVAILABLE,
                    );
                    return;
                };
                let (message, _) = buffers.messages.parts_mut(handle);
                message.set_header(message_mti, id.source_alias(), sender_id, dest_alias, dest_id);
                buffers.messages.append_payload(handle, body);
                self.store_inflight(
                    buffers,
                    InflightSlot {
                        source_alias: id.source_alias(),
                        dest_alias,
                        mti: message_mti,
                        handle,
                    },
                );
            }
            MULTIFRAME_MIDDLE | MULTIFRAME_FINAL => {
                let Some(slot) = self.take_inflight(
                    id.source_alias(),
                    dest_alias,
                    message_mti,
                    marker == MULTIFRAME_MIDDLE,
                ) else {
                    queue_rejection(
                        buffers,
                        message_mti,
                        dest_alias,
                        id.source_alias(),
                        error::TEMPORARY_MIDDLE_END_WITHOUT_START,
                    );
                    return;
                };
                buffers.messages.append_payload(slot.handle, body);
                if marker == MULTIFRAME_FINAL {
                    deliver(buffers, slot.handle);
                }
            }
            // bits 5:4 of the first byte are reserved; drop noncompliant
            // frames
            _ => {}
        }
    }

    fn handle_datagram(
        &mut self,
        frame: &CanFrame,
        frame_type: FrameType,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
    ) {
        let id = frame.id();
        let dest_alias = id.variable_field();
        let source_alias = id.source_alias();
        let Some(node_index) = nodes.find_by_alias(dest_alias) else {
            return;
        };
        let dest_id = nodes.node(node_index).id;
        let sender_id = source_id(buffers, source_alias);
        let data = frame.data();

        match frame_type {
            FrameType::DatagramOnly => {
                if nodes.node(node_index).last_received_datagram.is_some() {
                    queue_datagram_rejection(
                        buffers,
                        dest_alias,
                        source_alias,
                        error::TEMPORARY_BUFFER_UNAVAILABLE,
                    );
                    return;
                }
                let Ok(handle) = buffers.messages.allocate(SizeClass::Datagram) else {
                    queue_datagram_rejection(
                        buffers,
                        dest_alias,
                        source_alias,
                        error::TEMPORARY_BUFFER_UNAVAILABLE,
                    );
                    return;
                };
                let (message, _) = buffers.messages.parts_mut(handle);
                message.set_header(mti::DATAGRAM, source_alias, sender_id, dest_alias, dest_id);
                buffers.messages.append_payload(handle, data);
                // held by the node (awaiting its reply) and by the queue
                buffers.messages.inc_reference_count(handle);
                nodes.node_mut(node_index).last_received_datagram = Some(handle);
                deliver(buffers, handle);
            }
            FrameType::DatagramFirst => {
                if nodes.node(node_index).last_received_datagram.is_some() {
                    queue_datagram_rejection(
                        buffers,
                        dest_alias,
                        source_alias,
                        error::TEMPORARY_START_BEFORE_LAST_END,
                    );
                    return;
                }
                let Ok(handle) = buffers.messages.allocate(SizeClass::Datagram) else {
                    queue_datagram_rejection(
                        buffers,
                        dest_alias,
                        source_alias,
                        error::TEMPORARY_BUFFER_UNAVAILABLE,
                    );
                    return;
                };
                let (message, _) = buffers.messages.parts_mut(handle);
                message.set_header(mti::DATAGRAM, source_alias, sender_id, dest_alias, dest_id);
                buffers.messages.append_payload(handle, data);
                nodes.node_mut(node_index).last_received_datagram = Some(handle);
            }
            FrameType::DatagramMiddle | FrameType::DatagramFinal => {
                let Some(handle) = nodes.node(node_index).last_received_datagram else {
                    queue_datagram_rejection(
                        buffers,
                        dest_alias,
                        source_alias,
                        error::TEMPORARY_MIDDLE_END_WITHOUT_START,
                    );
                    return;
                };
                buffers.messages.append_payload(handle, data);
                if frame_type == FrameType::DatagramFinal {
                    // queue holds a second reference while the node keeps
                    // the datagram pending its acknowledgement
                    buffers.messages.inc_reference_count(handle);
                    deliver(buffers, handle);
                }
            }
            FrameType::Standard | FrameType::Stream => unreachable!(),
        }
    }

    fn handle_stream(
        &mut self,
        frame: &CanFrame,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
    ) {
        let id = frame.id();
        let dest_alias = id.variable_field();
        let Some(node_index) = nodes.find_by_alias(dest_alias) else {
            return;
        };
        let node = nodes.node_mut(node_index);
        if !node.stream.active || node.stream.peer_alias != id.source_alias() {
            return;
        }
        let handle = match node.stream.inbound {
            Some(handle) => handle,
            None => {
                let Ok(handle) = buffers.messages.allocate(SizeClass::Stream) else {
                    return;
                };
                let (message, _) = buffers.messages.parts_mut(handle);
                message.set_header(
                    mti::STREAM_SEND,
                    id.source_alias(),
                    0,
                    dest_alias,
                    node.id,
                );
                node.stream.inbound = Some(handle);
                handle
            }
        };
        buffers.messages.append_payload(handle, frame.data());
        let node = nodes.node_mut(node_index);
        node.stream.bytes_since_proceed = node
            .stream
            .bytes_since_proceed
            .saturating_add(frame.data().len() as u16);

        // window consumed: tell the sender to proceed
        if node.stream.buffer_size > 0 && node.stream.bytes_since_proceed >= node.stream.buffer_size
        {
            node.stream.bytes_since_proceed = 0;
            let payload = [node.stream.source_stream_id, 0];
            let proceed = tx::addressed_reply_frame(
                mti::STREAM_PROCEED,
                dest_alias,
                id.source_alias(),
                &payload,
            );
            queue_control_frame(buffers, proceed);
        }
    }

    fn find_inflight(&self, source_alias: Alias, dest_alias: Alias, mti: u16) -> Option<usize> {
        self.inflight.iter().position(|slot| {
            slot.map_or(false, |s| {
                s.source_alias == source_alias && s.dest_alias == dest_alias && s.mti == mti
            })
        })
    }

    fn store_inflight(&mut self, buffers: &mut Buffers<C>, slot: InflightSlot) {
        match self.inflight.iter_mut().find(|s| s.is_none()) {
            Some(free) => *free = Some(slot),
            None => {
                // no reassembly slot; the sequence cannot complete
                buffers.messages.free(slot.handle);
                if slot.dest_alias != 0 {
                    queue_rejection(
                        buffers,
                        slot.mti,
                        slot.dest_alias,
                        slot.source_alias,
                        error::TEMPORARY_BUFFER_UNAVAILABLE,
                    );
                }
            }
        }
    }

    /// Looks an in-flight sequence up; removes it unless `keep` is set.
    fn take_inflight(
        &mut self,
        source_alias: Alias,
        dest_alias: Alias,
        mti: u16,
        keep: bool,
    ) -> Option<InflightSlot> {
        let index = self.find_inflight(source_alias, dest_alias, mti)?;
        let slot = self.inflight[index];
        if !keep {
            self.inflight[index] = None;
        }
        slot
    }
}

fn source_id<C: Capacities>(buffers: &Buffers<C>, alias: Alias) -> u64 {
    buffers
        .aliases
        .find_by_alias(alias)
        .map(|m| m.node_id)
        .unwrap_or(0)
}

fn deliver<C: Capacities>(buffers: &mut Buffers<C>, handle: MessageHandle) {
    if buffers.incoming_messages.push(handle).is_err() {
        // queue full; the message is lost and the peer retries
        buffers.messages.free(handle);
    }
}

fn queue_control_frame<C: Capacities>(buffers: &mut Buffers<C>, frame: CanFrame) {
    if let Ok(handle) = buffers.frames.allocate() {
        *buffers.frames.frame_mut(handle) = frame;
        if buffers.outgoing_frames.push(handle).is_err() {
            buffers.frames.free(handle);
        }
    }
}

/// Queues an Optional Interaction Rejected frame for an addressed-message
/// transfer error.
fn queue_rejection<C: Capacities>(
    buffers: &mut Buffers<C>,
    rejected_mti: u16,
    source_alias: Alias,
    dest_alias: Alias,
    code: u16,
) {
    let mut payload = [0u8; 4];
    utilities::write_u16(&mut payload[0..], code);
    utilities::write_u16(&mut payload[2..], rejected_mti);
    let frame = tx::addressed_reply_frame(
        mti::OPTIONAL_INTERACTION_REJECTED,
        source_alias,
        dest_alias,
        &payload,
    );
    queue_control_frame(buffers, frame);
}

/// Queues a Datagram Rejected frame.
fn queue_datagram_rejection<C: Capacities>(
    buffers: &mut Buffers<C>,
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
    queue_control_frame(buffers, frame);
}

/// AME: answer with AMD for the queried node (or all of ours when the
/// enquiry carries no node id).
fn handle_alias_map_enquiry<C: Capacities>(
    frame: &CanFrame,
    buffers: &mut Buffers<C>,
    nodes: &mut NodeRegistry<C>,
) {
    let queried = (frame.data().len() >= 6).then(|| utilities::read_node_id(frame.data()));
    for index in 0..nodes.capacity() {
        let node = nodes.node(index);
        if !node.flags.allocated || !node.flags.permitted {
            continue;
        }
        if queried.map_or(true, |id| id == node.id) {
            let mut payload = [0u8; 6];
            utilities::write_node_id(&mut payload, node.id);
            let alias = node.alias;
            if let Ok(amd) = CanFrame::new(
                crate::identifier::CanIdentifier::control(crate::identifier::CONTROL_AMD, alias),
                &payload,
            ) {
                queue_control_frame(buffers, amd);
            }
        }
    }
}

/// AMD from a peer: record the mapping; flag a duplicate node id when the
/// peer claims an id we own.
fn handle_alias_map_definition<C: Capacities>(
    frame: &CanFrame,
    buffers: &mut Buffers<C>,
    nodes: &mut NodeRegistry<C>,
) {
    if frame.data().len() < 6 {
        return;
    }
    let node_id = utilities::read_node_id(frame.data());
    let alias = frame.id().source_alias();
    if let Some(mapping) = buffers.aliases.register(alias, node_id) {
        mapping.is_permitted = true;
    }
    if let Some(index) = nodes.find_by_node_id(node_id) {
        nodes.node_mut(index).flags.duplicate_id_detected = true;
    }
}
