//! The top-level cooperative dispatcher of the CAN adaptation layer.
//!
//! One call to [`CanMainStatemachine::run`] performs at most one unit of
//! work, taken from a fixed priority ladder: duplicate-alias
//! reconciliation, then a pending outgoing frame, then a pending login
//! frame or message, then one step of node enumeration (which advances the
//! login state machine for nodes still logging in).

use crate::can::login::{self, LoginContext};
use crate::config::Capacities;
use crate::interface::Dependencies;
use crate::node::{EnumeratorKey, LoginState, Node, NodeRegistry};
use crate::stack::{Buffers, StepOutcome};
use crate::store::FrameHandle;

/// The CAN main state machine.
pub struct CanMainStatemachine {
    login: LoginContext,
    login_offset: u16,
    outgoing: Option<FrameHandle>,
    current_node: Option<usize>,
}

impl Default for CanMainStatemachine {
    fn default() -> Self {
        Self {
            login: LoginContext::default(),
            login_offset: 0,
            outgoing: None,
            current_node: None,
        }
    }
}

/// Strips a node back to the state right after allocation so it re-logs in
/// with a freshly generated alias.
fn reset_node<C: Capacities>(node: &mut Node<C>, buffers: &mut Buffers<C>) {
    node.alias = 0;
    node.flags.permitted = false;
    node.flags.initialized = false;
    node.flags.duplicate_id_detected = false;
    node.flags.duplicate_alias_detected = false;
    node.flags.firmware_upgrade_active = false;
    node.flags.resend_datagram = false;
    node.flags.datagram_ack_sent = false;
    if let Some(handle) = node.last_received_datagram.take() {
        buffers.messages.free(handle);
    }
    if let Some(handle) = node.stream.inbound.take() {
        buffers.messages.free(handle);
    }
    node.stream = crate::node::StreamState::default();
    node.login_state = LoginState::GenerateSeed;
}

impl CanMainStatemachine {
    /// Scans the alias table for entries marked duplicate, unregisters
    /// them and resets their owning nodes. Returns true when any were
    /// found.
    pub fn handle_duplicate_aliases<C: Capacities, D: Dependencies>(
        &mut self,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
        deps: &mut D,
    ) -> bool {
        deps.lock_shared_resources();
        let pending = buffers.aliases.has_duplicate_alias();
        if pending {
            for index in 0..buffers.aliases.entries().len() {
                let entry = buffers.aliases.entries()[index];
                if entry.alias != 0 && entry.is_duplicate {
                    buffers.aliases.unregister(entry.alias);
                    if let Some(node_index) = nodes.find_by_alias(entry.alias) {
                        reset_node(nodes.node_mut(node_index), buffers);
                    }
                }
            }
            buffers.aliases.clear_has_duplicate_alias();
        }
        deps.unlock_shared_resources();
        pending
    }

    /// Pops and transmits one frame from the outgoing queue. The frame is
    /// freed only after the driver accepted it; a busy driver leaves it in
    /// place for the next iteration. Returns `None` when the queue was
    /// empty.
    pub fn handle_outgoing_frame<C: Capacities, D: Dependencies>(
        &mut self,
        buffers: &mut Buffers<C>,
        deps: &mut D,
    ) -> Option<StepOutcome> {
        if self.outgoing.is_none() {
            deps.lock_shared_resources();
            self.outgoing = buffers.outgoing_frames.pop().ok();
            deps.unlock_shared_resources();
        }
        let handle = self.outgoing?;
        match deps.transmit(buffers.frames.frame(handle)) {
            Ok(()) => {
                deps.lock_shared_resources();
                buffers.frames.free(handle);
                deps.unlock_shared_resources();
                self.outgoing = None;
                Some(StepOutcome::TransmittedFrame)
            }
            Err(nb::Error::WouldBlock) => Some(StepOutcome::TransmitRetryPending),
        }
    }

    /// Transmits a pending login frame or message. Returns `None` when the
    /// login context has nothing queued.
    pub fn handle_login_outgoing<D: Dependencies>(&mut self, deps: &mut D) -> Option<StepOutcome> {
        if let Some(frame) = self.login.frame {
            return Some(match deps.transmit(&frame) {
                Ok(()) => {
                    self.login.frame = None;
                    StepOutcome::TransmittedFrame
                }
                Err(nb::Error::WouldBlock) => StepOutcome::TransmitRetryPending,
            });
        }
        if let Some(outgoing) = self.login.message {
            let payload_count = usize::from(outgoing.message.payload_count);
            return Some(
                match crate::can::tx::send_message(
                    &outgoing.message,
                    &outgoing.payload[..payload_count],
                    &mut self.login_offset,
                    deps,
                ) {
                    Ok(()) => {
                        self.login.message = None;
                        self.login_offset = 0;
                        StepOutcome::TransmittedFrame
                    }
                    Err(nb::Error::WouldBlock) => StepOutcome::TransmitRetryPending,
                },
            );
        }
        None
    }

    fn run_login_if_pending<C: Capacities, D: Dependencies>(
        &mut self,
        node_index: usize,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
        deps: &mut D,
    ) -> StepOutcome {
        let node = nodes.node_mut(node_index);
        if node.login_state < LoginState::Run {
            login::run(node, &mut self.login, &mut buffers.aliases, deps);
            StepOutcome::AdvancedLogin
        } else {
            StepOutcome::Idle
        }
    }

    /// Executes one cooperative iteration.
    pub fn run<C: Capacities, D: Dependencies>(
        &mut self,
        buffers: &mut Buffers<C>,
        nodes: &mut NodeRegistry<C>,
        deps: &mut D,
    ) -> StepOutcome {
        if self.handle_duplicate_aliases(buffers, nodes, deps) {
            return StepOutcome::ResolvedDuplicateAlias;
        }
        if let Some(outcome) = self.handle_outgoing_frame(buffers, deps) {
            return outcome;
        }
        if let Some(outcome) = self.handle_login_outgoing(deps) {
            return outcome;
        }
        match self.current_node {
            None => {
                self.current_node = nodes.get_first(EnumeratorKey::CanMain);
                match self.current_node {
                    Some(index) => self.run_login_if_pending(index, buffers, nodes, deps),
                    None => StepOutcome::Idle,
                }
            }
            Some(_) => {
                self.current_node = nodes.get_next(EnumeratorKey::CanMain);
                match self.current_node {
                    Some(index) => self.run_login_if_pending(index, buffers, nodes, deps),
                    None => StepOutcome::Idle,
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DefaultCapacities;
    use crate::frame::CanFrame;
    use crate::interface::{Application, CanDevice, ClockObserver, Platform};
    use crate::message::SizeClass;
    use crate::node::NodeParameters;

    type Caps = DefaultCapacities;

    static PARAMS: NodeParameters = NodeParameters::const_default();

    #[derive(Default)]
    struct Harness {
        transmitted: usize,
        refuse: bool,
        locks: usize,
        unlocks: usize,
    }

    impl CanDevice for Harness {
        fn transmit(&mut self, _: &CanFrame) -> nb::Result<(), core::convert::Infallible> {
            if self.refuse {
                return Err(nb::Error::WouldBlock);
            }
            self.transmitted += 1;
            Ok(())
        }
    }
    impl Platform for Harness {
        fn lock_shared_resources(&mut self) {
            self.locks += 1;
        }
        fn unlock_shared_resources(&mut self) {
            self.unlocks += 1;
        }
    }
    impl Application for Harness {}
    impl ClockObserver for Harness {}

    #[test]
    fn duplicate_alias_resets_the_node() {
        let mut sm = CanMainStatemachine::default();
        let mut buffers: Buffers<Caps> = Buffers::default();
        let mut nodes: NodeRegistry<Caps> = NodeRegistry::default();
        let mut deps = Harness::default();

        let index = nodes.allocate(0x0102_0304_0506, &PARAMS).unwrap();
        {
            let node = nodes.node_mut(index);
            node.alias = 0xAAA;
            node.flags.permitted = true;
            node.flags.initialized = true;
            node.login_state = LoginState::Run;
            node.last_received_datagram =
                Some(buffers.messages.allocate(SizeClass::Datagram).unwrap());
        }
        let mapping = buffers.aliases.register(0xAAA, 0x0102_0304_0506).unwrap();
        mapping.is_duplicate = true;
        buffers.aliases.set_has_duplicate_alias();

        let outcome = sm.run(&mut buffers, &mut nodes, &mut deps);
        assert_eq!(outcome, StepOutcome::ResolvedDuplicateAlias);

        let node = nodes.node(index);
        assert_eq!(node.alias, 0);
        assert!(!node.flags.permitted);
        assert!(!node.flags.initialized);
        assert!(node.last_received_datagram.is_none());
        assert_eq!(node.login_state, LoginState::GenerateSeed);
        assert!(!buffers.aliases.has_duplicate_alias());
        assert!(buffers.aliases.find_by_alias(0xAAA).is_none());
        assert_eq!(buffers.messages.allocated(SizeClass::Datagram), 0);
    }

    #[test]
    fn outgoing_frame_is_retried_until_the_driver_accepts() {
        let mut sm = CanMainStatemachine::default();
        let mut buffers: Buffers<Caps> = Buffers::default();
        let mut nodes: NodeRegistry<Caps> = NodeRegistry::default();
        let mut deps = Harness::default();

        let handle = buffers.frames.allocate().unwrap();
        buffers.outgoing_frames.push(handle).unwrap();

        deps.refuse = true;
        assert_eq!(
            sm.run(&mut buffers, &mut nodes, &mut deps),
            StepOutcome::TransmitRetryPending
        );
        assert_eq!(buffers.frames.allocated(), 1);

        deps.refuse = false;
        assert_eq!(
            sm.run(&mut buffers, &mut nodes, &mut deps),
            StepOutcome::TransmittedFrame
        );
        assert_eq!(deps.transmitted, 1);
        assert_eq!(buffers.frames.allocated(), 0);
    }

    #[test]
    fn enumeration_drives_a_node_through_login() {
        let mut sm = CanMainStatemachine::default();
        let mut buffers: Buffers<Caps> = Buffers::default();
        let mut nodes: NodeRegistry<Caps> = NodeRegistry::default();
        let mut deps = Harness::default();

        let index = nodes.allocate(0x0102_0304_0506, &PARAMS).unwrap();

        let mut guard = 0;
        while nodes.node(index).login_state != LoginState::Run {
            nodes.tick_100ms();
            sm.run(&mut buffers, &mut nodes, &mut deps);
            guard += 1;
            assert!(guard < 200, "login did not converge");
        }
        let node = nodes.node(index);
        assert!(node.flags.permitted);
        assert!(node.flags.initialized);
        assert_ne!(node.alias, 0);
        // CID x4, RID, AMD, initialization complete
        assert!(deps.transmitted >= 7);
    }

    #[test]
    fn idle_when_nothing_to_do() {
        let mut sm = CanMainStatemachine::default();
        let mut buffers: Buffers<Caps> = Buffers::default();
        let mut nodes: NodeRegistry<Caps> = NodeRegistry::default();
        let mut deps = Harness::default();
        assert_eq!(
            sm.run(&mut buffers, &mut nodes, &mut deps),
            StepOutcome::Idle
        );
    }
}
