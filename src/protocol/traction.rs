//! Traction protocol: command dispatch and Simple Train information.

use crate::config::Capacities;
use crate::interface::Dependencies;
use crate::message::{MessageHandle, SizeClass};
use crate::mti;
use crate::protocol::main::HandlerContext;
use crate::protocol::snip;

/// Traction command: handed to the application; a reply buffer filled by
/// the callback goes back as a Traction Reply, and an unhandled command is
/// rejected by the dispatcher's fallback.
pub fn handle_traction_protocol<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    let incoming_message = *ctx.buffers.messages.message(incoming);
    let mut command = [0u8; 72];
    let source = ctx.buffers.messages.payload(incoming);
    let command_len = source.len().min(command.len());
    command[..command_len].copy_from_slice(&source[..command_len]);

    let mut reply_data = [0u8; 72];
    let reply_len = ctx
        .deps
        .on_traction_command(&command[..command_len], &mut reply_data)?;

    let class = SizeClass::for_payload(reply_len);
    let reply = ctx.buffers.messages.allocate(class).ok()?;
    let (message, payload) = ctx.buffers.messages.parts_mut(reply);
    message.reply_header(&incoming_message, mti::TRACTION_REPLY);
    let reply_len = usize::from(reply_len).min(payload.len());
    payload[..reply_len].copy_from_slice(&reply_data[..reply_len]);
    message.payload_count = reply_len as u16;
    Some(reply)
}

/// Traction reply: forwarded to the application.
pub fn handle_traction_reply<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    let mut reply = [0u8; 72];
    let source = ctx.buffers.messages.payload(incoming);
    let reply_len = source.len().min(reply.len());
    reply[..reply_len].copy_from_slice(&source[..reply_len]);
    ctx.deps.on_traction_reply(&reply[..reply_len]);
    None
}

/// Simple Train info request: answered with the same string layout as
/// SNIP under the train-specific MTI.
pub fn handle_simple_train_info_request<C: Capacities, D: Dependencies>(
    ctx: &mut HandlerContext<'_, C, D>,
    incoming: MessageHandle,
    node_index: usize,
) -> Option<MessageHandle> {
    let reply = snip::handle_simple_node_info_request(ctx, incoming, node_index)?;
    ctx.buffers.messages.message_mut(reply).mti = mti::SIMPLE_TRAIN_INFO_REPLY;
    Some(reply)
}

/// Simple Train info reply: nothing to do in the core.
pub fn handle_simple_train_info_reply<C: Capacities, D: Dependencies>(
    _ctx: &mut HandlerContext<'_, C, D>,
    _incoming: MessageHandle,
    _node_index: usize,
) -> Option<MessageHandle> {
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DefaultCapacities;
    use crate::frame::CanFrame;
    use crate::interface::{Application, CanDevice, ClockObserver, Platform};
    use crate::node::{NodeParameters, NodeRegistry, SnipParameters};
    use crate::protocol::broadcast_time::BroadcastTimeEngine;
    use crate::stack::Buffers;

    type Caps = DefaultCapacities;

    const SOURCE_ALIAS: u16 = 0x222;
    const SOURCE_ID: u64 = 0x0102_0304_0506;
    const DEST_ALIAS: u16 = 0xBBB;
    const DEST_ID: u64 = 0x0605_0403_0201;

    static PARAMS: NodeParameters = {
        let mut p = NodeParameters::const_default();
        p.snip = SnipParameters {
            mfg_version: 4,
            name: "Test",
            model: "Engine",
            hardware_version: "1.0",
            software_version: "2.0",
            user_version: 2,
            user_name: "",
            user_description: "",
        };
        p
    };

    /// Echoes every command back with a leading marker byte, or declines
    /// when told to.
    #[derive(Default)]
    struct Cab {
        accept: bool,
        reply_len: u16,
        last_command: [u8; 8],
        last_command_len: usize,
        replies_seen: usize,
        last_reply: [u8; 8],
    }
    impl CanDevice for Cab {
        fn transmit(&mut self, _: &CanFrame) -> nb::Result<(), core::convert::Infallible> {
            Ok(())
        }
    }
    impl Platform for Cab {}
    impl Application for Cab {
        fn on_traction_command(&mut self, payload: &[u8], reply: &mut [u8]) -> Option<u16> {
            let take = payload.len().min(self.last_command.len());
            self.last_command[..take].copy_from_slice(&payload[..take]);
            self.last_command_len = take;
            if !self.accept {
                return None;
            }
            reply[0] = 0x80 | payload[0];
            for byte in reply[1..usize::from(self.reply_len)].iter_mut() {
                *byte = 0x55;
            }
            Some(self.reply_len)
        }
        fn on_traction_reply(&mut self, payload: &[u8]) {
            self.replies_seen += 1;
            let take = payload.len().min(self.last_reply.len());
            self.last_reply[..take].copy_from_slice(&payload[..take]);
        }
    }
    impl ClockObserver for Cab {}

    struct Fixture {
        buffers: Buffers<Caps>,
        nodes: NodeRegistry<Caps>,
        clocks: BroadcastTimeEngine<Caps>,
        pending: Option<crate::protocol::broadcast_time::PendingQueryReply>,
        deps: Cab,
    }

    impl Fixture {
        fn new() -> Self {
            let mut nodes: NodeRegistry<Caps> = NodeRegistry::default();
            let index = nodes.allocate(DEST_ID, &PARAMS).unwrap();
            let node = nodes.node_mut(index);
            node.alias = DEST_ALIAS;
            node.flags.permitted = true;
            node.flags.initialized = true;
            Self {
                buffers: Buffers::default(),
                nodes,
                clocks: BroadcastTimeEngine::default(),
                pending: None,
                deps: Cab::default(),
            }
        }

        fn incoming(&mut self, mti: u16, payload: &[u8]) -> MessageHandle {
            let handle = self
                .buffers
                .messages
                .allocate(SizeClass::for_payload(payload.len() as u16))
                .unwrap();
            let (message, _) = self.buffers.messages.parts_mut(handle);
            message.set_header(mti, SOURCE_ALIAS, SOURCE_ID, DEST_ALIAS, DEST_ID);
            self.buffers.messages.append_payload(handle, payload);
            handle
        }

        fn ctx(&mut self) -> HandlerContext<'_, Caps, Cab> {
            HandlerContext {
                buffers: &mut self.buffers,
                nodes: &mut self.nodes,
                clocks: &mut self.clocks,
                pending_query_reply: &mut self.pending,
                deps: &mut self.deps,
            }
        }
    }

    #[test]
    fn accepted_command_becomes_a_traction_reply() {
        let mut fixture = Fixture::new();
        fixture.deps.accept = true;
        fixture.deps.reply_len = 3;

        let incoming = fixture.incoming(mti::TRACTION_PROTOCOL, &[0x00, 0x50]);
        let mut ctx = fixture.ctx();
        let reply = handle_traction_protocol(&mut ctx, incoming, 0).unwrap();

        assert_eq!(&fixture.deps.last_command[..2], &[0x00, 0x50]);
        let (message, _) = fixture.buffers.messages.parts(reply);
        assert_eq!(message.mti, mti::TRACTION_REPLY);
        assert_eq!(message.source_alias, DEST_ALIAS);
        assert_eq!(message.dest_alias, SOURCE_ALIAS);
        // a short reply lands in the basic class
        assert_eq!(reply.class(), SizeClass::Basic);
        assert_eq!(fixture.buffers.messages.payload(reply), &[0x80, 0x55, 0x55]);
        fixture.buffers.messages.free(incoming);
        fixture.buffers.messages.free(reply);
    }

    #[test]
    fn long_replies_use_the_datagram_class() {
        let mut fixture = Fixture::new();
        fixture.deps.accept = true;
        fixture.deps.reply_len = 20;

        let incoming = fixture.incoming(mti::TRACTION_PROTOCOL, &[0x30]);
        let mut ctx = fixture.ctx();
        let reply = handle_traction_protocol(&mut ctx, incoming, 0).unwrap();
        assert_eq!(reply.class(), SizeClass::Datagram);
        assert_eq!(fixture.buffers.messages.message(reply).payload_count, 20);
        fixture.buffers.messages.free(incoming);
        fixture.buffers.messages.free(reply);
    }

    #[test]
    fn declined_command_returns_none() {
        let mut fixture = Fixture::new();
        let incoming = fixture.incoming(mti::TRACTION_PROTOCOL, &[0x00, 0x50]);
        let mut ctx = fixture.ctx();
        // the dispatcher turns this None into an interaction-rejected reply
        assert!(handle_traction_protocol(&mut ctx, incoming, 0).is_none());
        assert_eq!(fixture.deps.last_command_len, 2);
        fixture.buffers.messages.free(incoming);
    }

    #[test]
    fn replies_are_forwarded_to_the_application() {
        let mut fixture = Fixture::new();
        let incoming = fixture.incoming(mti::TRACTION_REPLY, &[0x81, 0x01]);
        let mut ctx = fixture.ctx();
        assert!(handle_traction_reply(&mut ctx, incoming, 0).is_none());
        assert_eq!(fixture.deps.replies_seen, 1);
        assert_eq!(&fixture.deps.last_reply[..2], &[0x81, 0x01]);
        fixture.buffers.messages.free(incoming);
    }

    #[test]
    fn train_info_request_reuses_the_snip_layout() {
        let mut fixture = Fixture::new();
        let incoming = fixture.incoming(mti::SIMPLE_TRAIN_INFO_REQUEST, &[]);
        let mut ctx = fixture.ctx();
        let reply = handle_simple_train_info_request(&mut ctx, incoming, 0).unwrap();

        let (message, _) = fixture.buffers.messages.parts(reply);
        assert_eq!(message.mti, mti::SIMPLE_TRAIN_INFO_REPLY);
        let payload = fixture.buffers.messages.payload(reply);
        assert_eq!(payload[0], 4);
        assert_eq!(&payload[1..6], b"Test\0");
        assert_eq!(&payload[6..13], b"Engine\0");
        fixture.buffers.messages.free(incoming);
        fixture.buffers.messages.free(reply);
    }
}
