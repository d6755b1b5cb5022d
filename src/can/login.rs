//! The node-login state machine: alias allocation per the CAN Frame
//! Transfer Standard, followed by the initialization broadcast.
//!
//! The action bodies are free functions so each state is reachable on its
//! own; [`run`] is the switch that picks the action for the node's current
//! state. One call performs one state's worth of work and loads at most
//! one outgoing frame or message into the [`LoginContext`]; the CAN main
//! state machine owns actually transmitting it (and retrying on driver
//! backpressure).

use crate::alias::AliasMappings;
use crate::config::Capacities;
use crate::frame::CanFrame;
use crate::identifier::{CanIdentifier, CONTROL_AMD, CONTROL_RID};
use crate::interface::Application;
use crate::message::Message;
use crate::mti;
use crate::node::{LoginState, Node};
use crate::protocol::event_transport::{consumer_identified_mti, producer_identified_mti};
use crate::protocol::psi;
use crate::utilities;
use fugit::MillisDurationU32;

/// Minimum time to listen for objections after the Check ID frames.
pub const LOGIN_WAIT: MillisDurationU32 = MillisDurationU32::millis(200);

/// Ticks of the 100 ms timer that satisfy [`LOGIN_WAIT`]. The extra tick
/// covers the phase error between the CID4 frame and the first tick.
const LOGIN_WAIT_TICKS: u16 = (LOGIN_WAIT.to_millis() / 100) as u16 + 1;

/// An outgoing login message small enough to never need fragmentation.
#[derive(Copy, Clone, Debug, Default)]
pub struct LoginMessage {
    /// Routing header
    pub message: Message,
    /// Payload bytes, `message.payload_count` of them
    pub payload: [u8; 8],
}

/// Outgoing work loaded by the login actions, drained by the CAN main
/// state machine.
#[derive(Default)]
pub struct LoginContext {
    /// A pending CAN control frame (CID/RID/AMD)
    pub frame: Option<CanFrame>,
    /// A pending OpenLCB message (initialization complete, identified
    /// events)
    pub message: Option<LoginMessage>,
}

impl LoginContext {
    /// Whether a frame or message is waiting to be transmitted.
    pub fn is_pending(&self) -> bool {
        self.frame.is_some() || self.message.is_some()
    }
}

/// INIT: the node id seeds the alias generator.
pub fn state_init<C: Capacities>(node: &mut Node<C>) {
    node.seed = node.id;
    node.login_state = LoginState::GenerateAlias;
}

/// GENERATE_SEED: step the generator after a collision.
pub fn state_generate_seed<C: Capacities>(node: &mut Node<C>) {
    node.seed = utilities::next_seed(node.seed);
    node.login_state = LoginState::GenerateAlias;
}

/// GENERATE_ALIAS: fold the seed to a 12-bit alias, skipping zero and
/// aliases already observed on the bus, then register the tentative
/// mapping.
pub fn state_generate_alias<C: Capacities, D: Application>(
    node: &mut Node<C>,
    aliases: &mut AliasMappings<C>,
    deps: &mut D,
) {
    let mut alias = utilities::alias_from_seed(node.seed);
    while alias == 0 || aliases.find_by_alias(alias).is_some() {
        node.seed = utilities::next_seed(node.seed);
        alias = utilities::alias_from_seed(node.seed);
    }
    node.alias = alias;
    deps.on_alias_change(alias, node.id);
    let _ = aliases.register(alias, node.id);
    node.login_state = LoginState::LoadCheckId7;
}

fn id_fragment<C: Capacities>(node: &Node<C>, cid: u8) -> u16 {
    // CID7 carries bits 47:36 of the node id, CID4 bits 11:0.
    let shift = 12 * (u32::from(cid) - 4);
    ((node.id >> shift) & 0xFFF) as u16
}

/// LOAD_CHECK_ID_07: emit the first Check ID frame.
pub fn state_load_cid07<C: Capacities>(node: &mut Node<C>, context: &mut LoginContext) {
    context.frame = Some(CanFrame::empty(CanIdentifier::check_id(
        7,
        id_fragment(node, 7),
        node.alias,
    )));
    node.login_state = LoginState::LoadCheckId6;
}

/// LOAD_CHECK_ID_06: emit the second Check ID frame.
pub fn state_load_cid06<C: Capacities>(node: &mut Node<C>, context: &mut LoginContext) {
    context.frame = Some(CanFrame::empty(CanIdentifier::check_id(
        6,
        id_fragment(node, 6),
        node.alias,
    )));
    node.login_state = LoginState::LoadCheckId5;
}

/// LOAD_CHECK_ID_05: emit the third Check ID frame.
pub fn state_load_cid05<C: Capacities>(node: &mut Node<C>, context: &mut LoginContext) {
    context.frame = Some(CanFrame::empty(CanIdentifier::check_id(
        5,
        id_fragment(node, 5),
        node.alias,
    )));
    node.login_state = LoginState::LoadCheckId4;
}

/// LOAD_CHECK_ID_04: emit the last Check ID frame and arm the wait timer.
pub fn state_load_cid04<C: Capacities>(node: &mut Node<C>, context: &mut LoginContext) {
    context.frame = Some(CanFrame::empty(CanIdentifier::check_id(
        4,
        id_fragment(node, 4),
        node.alias,
    )));
    node.timer_ticks = 0;
    node.login_state = LoginState::Wait200ms;
}

/// WAIT_200ms: hold until the objection window has passed.
pub fn state_wait_200ms<C: Capacities>(node: &mut Node<C>) {
    if node.timer_ticks > LOGIN_WAIT_TICKS {
        node.login_state = LoginState::LoadReserveId;
    }
}

/// LOAD_RESERVE_ID: claim the alias.
pub fn state_load_rid<C: Capacities>(node: &mut Node<C>, context: &mut LoginContext) {
    context.frame = Some(CanFrame::empty(CanIdentifier::control(
        CONTROL_RID,
        node.alias,
    )));
    node.flags.permitted = false;
    node.flags.initialized = false;
    node.login_state = LoginState::LoadAliasMapDefinition;
}

/// LOAD_ALIAS_MAP_DEFINITION: publish the alias→id mapping; the node is
/// now Permitted.
pub fn state_load_amd<C: Capacities>(
    node: &mut Node<C>,
    context: &mut LoginContext,
    aliases: &mut AliasMappings<C>,
) {
    let mut payload = [0u8; 6];
    utilities::write_node_id(&mut payload, node.id);
    // The identifier builder cannot fail for a 6-byte payload.
    let frame = CanFrame::new(CanIdentifier::control(CONTROL_AMD, node.alias), &payload);
    context.frame = frame.ok();
    node.flags.permitted = true;
    if let Some(mapping) = aliases.find_by_alias_mut(node.alias) {
        mapping.is_permitted = true;
    }
    node.login_state = LoginState::LoadInitializationComplete;
}

/// LOAD_INITIALIZATION_COMPLETE: announce the node; it is now Initialized
/// and the producer broadcast begins.
pub fn state_load_initialization_complete<C: Capacities>(
    node: &mut Node<C>,
    context: &mut LoginContext,
) {
    let mti = if node.parameters().protocol_support & psi::SIMPLE != 0 {
        mti::INITIALIZATION_COMPLETE_SIMPLE
    } else {
        mti::INITIALIZATION_COMPLETE
    };
    let mut outgoing = LoginMessage::default();
    outgoing.message.set_header(mti, node.alias, node.id, 0, 0);
    utilities::write_node_id(&mut outgoing.payload, node.id);
    outgoing.message.payload_count = 6;
    context.message = Some(outgoing);

    node.flags.initialized = true;
    node.producers.enumerator.running = true;
    node.producers.enumerator.index = 0;
    node.login_state = LoginState::LoadProducerEvents;
}

fn load_identified<C: Capacities>(node: &Node<C>, mti: u16, event: u64) -> LoginMessage {
    let mut outgoing = LoginMessage::default();
    outgoing.message.set_header(mti, node.alias, node.id, 0, 0);
    utilities::write_event_id(&mut outgoing.payload, event);
    outgoing.message.payload_count = 8;
    outgoing
}

/// LOAD_PRODUCER_EVENTS: emit one Producer Identified per call; advance
/// when the table is exhausted.
pub fn state_load_producer_events<C: Capacities>(node: &mut Node<C>, context: &mut LoginContext) {
    let index = node.producers.enumerator.index;
    if let Some(entry) = node.producers.entry(index) {
        context.message = Some(load_identified(
            node,
            producer_identified_mti(entry.status),
            entry.event,
        ));
        node.producers.enumerator.index += 1;
    }
    if node.producers.enumerator.index >= node.producers.count() {
        node.producers.enumerator.running = false;
        node.consumers.enumerator.running = true;
        node.consumers.enumerator.index = 0;
        node.login_state = LoginState::LoadConsumerEvents;
    }
}

/// LOAD_CONSUMER_EVENTS: emit one Consumer Identified per call; the node
/// enters normal operation when the table is exhausted.
pub fn state_load_consumer_events<C: Capacities, D: Application>(
    node: &mut Node<C>,
    context: &mut LoginContext,
    deps: &mut D,
) {
    let index = node.consumers.enumerator.index;
    if let Some(entry) = node.consumers.entry(index) {
        context.message = Some(load_identified(
            node,
            consumer_identified_mti(entry.status),
            entry.event,
        ));
        node.consumers.enumerator.index += 1;
    }
    if node.consumers.enumerator.index >= node.consumers.count() {
        node.consumers.enumerator.running = false;
        node.login_state = LoginState::Run;
        deps.on_login_complete(node.id);
    }
}

/// Advances one node one login step. No-op once the node reached RUN.
pub fn run<C: Capacities, D: Application>(
    node: &mut Node<C>,
    context: &mut LoginContext,
    aliases: &mut AliasMappings<C>,
    deps: &mut D,
) {
    match node.login_state {
        LoginState::Init => state_init(node),
        LoginState::GenerateSeed => state_generate_seed(node),
        LoginState::GenerateAlias => state_generate_alias(node, aliases, deps),
        LoginState::LoadCheckId7 => state_load_cid07(node, context),
        LoginState::LoadCheckId6 => state_load_cid06(node, context),
        LoginState::LoadCheckId5 => state_load_cid05(node, context),
        LoginState::LoadCheckId4 => state_load_cid04(node, context),
        LoginState::Wait200ms => state_wait_200ms(node),
        LoginState::LoadReserveId => state_load_rid(node, context),
        LoginState::LoadAliasMapDefinition => state_load_amd(node, context, aliases),
        LoginState::LoadInitializationComplete => state_load_initialization_complete(node, context),
        LoginState::LoadProducerEvents => state_load_producer_events(node, context),
        LoginState::LoadConsumerEvents => state_load_consumer_events(node, context, deps),
        LoginState::Run => {}
    }
}
