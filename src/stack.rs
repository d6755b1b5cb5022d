//! The assembled node stack: buffers, registry, state machines and the
//! injected environment in one owned value.

use crate::alias::AliasMappings;
use crate::can::main::CanMainStatemachine;
use crate::can::rx::CanRxStatemachine;
use crate::config::Capacities;
use crate::events::EventId;
use crate::fifo::Fifo;
use crate::frame::CanFrame;
use crate::interface::Dependencies;
use crate::message::{MessageHandle, NodeId};
use crate::node::{AllocateError, Node, NodeParameters, NodeRegistry};
use crate::protocol::broadcast_time::{BroadcastTimeEngine, ClockState};
use crate::protocol::main::MainStatemachine;
use crate::store::{FrameHandle, FrameStore, MessageStore};

/// What one [`Stack::step`] call accomplished.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do
    Idle,
    /// A frame was handed to the driver
    TransmittedFrame,
    /// An incoming message advanced through the dispatcher
    ProcessedMessage,
    /// A node moved one login step
    AdvancedLogin,
    /// The driver is busy; the same work is retried next step
    TransmitRetryPending,
    /// Duplicate aliases were reconciled
    ResolvedDuplicateAlias,
}

/// The shared buffer substrate: every pool, queue and table the interrupt
/// side and the run-loop side both touch.
pub struct Buffers<C: Capacities> {
    /// CAN frame pool
    pub frames: FrameStore<C>,
    /// OpenLCB message pools
    pub messages: MessageStore<C>,
    /// Outgoing CAN frames awaiting the driver
    pub outgoing_frames: Fifo<FrameHandle, C::CanFrames>,
    /// Incoming whole messages awaiting dispatch
    pub incoming_messages: Fifo<MessageHandle, C::MessageFifo>,
    /// The alias⇄node-id table
    pub aliases: AliasMappings<C>,
}

impl<C: Capacities> Default for Buffers<C> {
    fn default() -> Self {
        Self {
            frames: FrameStore::default(),
            messages: MessageStore::default(),
            outgoing_frames: Fifo::default(),
            incoming_messages: Fifo::default(),
            aliases: AliasMappings::default(),
        }
    }
}

/// A complete OpenLCB stack over a CAN driver.
///
/// Construction wires the capacities `C` and the environment `D` together;
/// [`step`](Self::step) is then driven from the main loop,
/// [`tick_100ms`](Self::tick_100ms) from a timer and
/// [`incoming_frame`](Self::incoming_frame) from the driver's receive
/// path.
pub struct Stack<C: Capacities, D: Dependencies> {
    buffers: Buffers<C>,
    nodes: NodeRegistry<C>,
    rx: CanRxStatemachine<C>,
    can_main: CanMainStatemachine,
    main: MainStatemachine,
    clocks: BroadcastTimeEngine<C>,
    deps: D,
}

impl<C: Capacities, D: Dependencies> Stack<C, D> {
    /// Creates an empty stack around the injected environment.
    pub fn new(deps: D) -> Self {
        Self {
            buffers: Buffers::default(),
            nodes: NodeRegistry::default(),
            rx: CanRxStatemachine::default(),
            can_main: CanMainStatemachine::default(),
            main: MainStatemachine::default(),
            clocks: BroadcastTimeEngine::default(),
            deps,
        }
    }

    /// Adds a virtual node; it will log itself in as the stack is stepped.
    pub fn add_node(
        &mut self,
        node_id: NodeId,
        parameters: &'static NodeParameters,
    ) -> Result<usize, AllocateError> {
        self.nodes.allocate(node_id, parameters)
    }

    /// Performs one unit of work: the CAN side (duplicate reconciliation,
    /// pending frames, login) first, the message dispatcher when the CAN
    /// side is idle.
    pub fn step(&mut self) -> StepOutcome {
        let outcome = self
            .can_main
            .run(&mut self.buffers, &mut self.nodes, &mut self.deps);
        if outcome != StepOutcome::Idle {
            return outcome;
        }
        self.main.run(
            &mut self.buffers,
            &mut self.nodes,
            &mut self.clocks,
            &mut self.deps,
        )
    }

    /// Feeds one received frame into the stack. Call from the driver's
    /// receive path; reassembled messages are queued for
    /// [`step`](Self::step) to dispatch later.
    pub fn incoming_frame(&mut self, frame: &CanFrame) {
        self.rx
            .incoming_frame(frame, &mut self.buffers, &mut self.nodes);
    }

    /// Advances every node timer and running clock; call at a 100 ms
    /// cadence (see [`Platform::TICK_PERIOD`]).
    ///
    /// [`Platform::TICK_PERIOD`]: crate::interface::Platform::TICK_PERIOD
    pub fn tick_100ms(&mut self) {
        self.nodes.tick_100ms();
        self.clocks.tick_100ms(&mut self.deps);
    }

    /// Pauses the receive path so the caller can walk the node list and
    /// pools atomically. Pair with [`unlock_node_list`](Self::unlock_node_list).
    pub fn lock_node_list(&mut self) {
        self.deps.lock_shared_resources();
    }

    /// Releases the lock taken by [`lock_node_list`](Self::lock_node_list).
    pub fn unlock_node_list(&mut self) {
        self.deps.unlock_shared_resources();
    }

    /// Sends a PC Event Report from a node. False when the node is not
    /// ready or the driver is busy.
    pub fn send_event_pc_report(&mut self, node_index: usize, event: EventId) -> bool {
        crate::application::send_event_pc_report(self.nodes.node(node_index), event, &mut self.deps)
    }

    /// Registers a clock this stack follows, with its event ranges on the
    /// given node.
    pub fn setup_clock_consumer(
        &mut self,
        node_index: usize,
        clock_id: EventId,
    ) -> Option<&mut ClockState> {
        let node = self.nodes.node_mut(node_index);
        self.clocks.setup_consumer(Some(node), clock_id)
    }

    /// Registers a clock this stack generates, with its event ranges on
    /// the given node.
    pub fn setup_clock_producer(
        &mut self,
        node_index: usize,
        clock_id: EventId,
    ) -> Option<&mut ClockState> {
        let node = self.nodes.node_mut(node_index);
        self.clocks.setup_producer(Some(node), clock_id)
    }

    /// The buffer substrate.
    pub fn buffers(&self) -> &Buffers<C> {
        &self.buffers
    }

    /// Mutable access to the buffer substrate.
    pub fn buffers_mut(&mut self) -> &mut Buffers<C> {
        &mut self.buffers
    }

    /// The node registry.
    pub fn nodes(&self) -> &NodeRegistry<C> {
        &self.nodes
    }

    /// Mutable access to the node registry.
    pub fn nodes_mut(&mut self) -> &mut NodeRegistry<C> {
        &mut self.nodes
    }

    /// One node record.
    pub fn node(&self, index: usize) -> &Node<C> {
        self.nodes.node(index)
    }

    /// The broadcast-time engine.
    pub fn clocks(&self) -> &BroadcastTimeEngine<C> {
        &self.clocks
    }

    /// Mutable access to the broadcast-time engine.
    pub fn clocks_mut(&mut self) -> &mut BroadcastTimeEngine<C> {
        &mut self.clocks
    }

    /// The injected environment.
    pub fn deps(&self) -> &D {
        &self.deps
    }

    /// Mutable access to the injected environment.
    pub fn deps_mut(&mut self) -> &mut D {
        &mut self.deps
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DefaultCapacities;
    use crate::identifier::{CanIdentifier, FrameType};
    use crate::interface::{Application, CanDevice, ClockObserver, Platform};
    use crate::mti;
    use crate::node::LoginState;

    type Caps = DefaultCapacities;

    static PARAMS: crate::node::NodeParameters = {
        let mut p = crate::node::NodeParameters::const_default();
        p.consumer_count_autocreate = 1;
        p.producer_count_autocreate = 1;
        p
    };

    #[derive(Default)]
    struct Board {
        sent: [CanFrame; 32],
        count: usize,
    }
    impl Board {
        fn frames(&self) -> &[CanFrame] {
            &self.sent[..self.count]
        }
    }
    impl CanDevice for Board {
        fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), core::convert::Infallible> {
            if self.count == self.sent.len() {
                return Err(nb::Error::WouldBlock);
            }
            self.sent[self.count] = *frame;
            self.count += 1;
            Ok(())
        }
    }
    impl Platform for Board {}
    impl Application for Board {}
    impl ClockObserver for Board {}

    fn run_until_idle(stack: &mut Stack<Caps, Board>) {
        let mut guard = 0;
        loop {
            stack.tick_100ms();
            if stack.step() == StepOutcome::Idle {
                break;
            }
            guard += 1;
            assert!(guard < 300, "stack did not go idle");
        }
    }

    fn logged_in_stack() -> Stack<Caps, Board> {
        let mut stack: Stack<Caps, Board> = Stack::new(Board::default());
        stack.add_node(0x0102_0304_0506, &PARAMS).unwrap();
        let mut guard = 0;
        while stack.node(0).login_state != LoginState::Run {
            stack.tick_100ms();
            stack.step();
            guard += 1;
            assert!(guard < 300, "login did not converge");
        }
        run_until_idle(&mut stack);
        stack.deps_mut().count = 0;
        stack
    }

    #[test]
    fn a_fresh_node_logs_in_and_announces_itself() {
        let mut stack: Stack<Caps, Board> = Stack::new(Board::default());
        stack.add_node(0x0102_0304_0506, &PARAMS).unwrap();

        let mut guard = 0;
        while stack.node(0).login_state != LoginState::Run {
            stack.tick_100ms();
            stack.step();
            guard += 1;
            assert!(guard < 300, "login did not converge");
        }
        run_until_idle(&mut stack);

        let frames = stack.deps().frames();
        // CID 7..4 in exactly that order
        assert_eq!(frames[0].id().cid_number(), 7);
        assert_eq!(frames[1].id().cid_number(), 6);
        assert_eq!(frames[2].id().cid_number(), 5);
        assert_eq!(frames[3].id().cid_number(), 4);
        // then RID and AMD
        assert_eq!(frames[4].id().variable_field(), 0x0700);
        assert_eq!(frames[5].id().variable_field(), 0x0701);
        // initialization complete carries the node id
        assert_eq!(
            frames[6].id().variable_field(),
            mti::INITIALIZATION_COMPLETE & 0x0FFF
        );
        assert_eq!(frames[6].data(), &[1, 2, 3, 4, 5, 6]);
        // one producer and one consumer identified event
        assert_eq!(
            frames[7].id().variable_field(),
            mti::PRODUCER_IDENTIFIED_UNKNOWN & 0x0FFF
        );
        assert_eq!(
            frames[8].id().variable_field(),
            mti::CONSUMER_IDENTIFIED_UNKNOWN & 0x0FFF
        );

        let node = stack.node(0);
        assert!(node.flags.permitted);
        assert!(node.flags.initialized);
        // the stack's own alias is in the mapping table and permitted
        let mapping = stack.buffers().aliases.find_by_alias(node.alias).unwrap();
        assert!(mapping.is_permitted);
    }

    #[test]
    fn verify_global_round_trip_through_the_stack() {
        let mut stack = logged_in_stack();

        let frame = CanFrame::empty(CanIdentifier::openlcb_message(
            FrameType::Standard,
            mti::VERIFY_NODE_ID_GLOBAL,
            0x222,
        ));
        stack.incoming_frame(&frame);

        let mut guard = 0;
        while stack.deps().count == 0 {
            stack.step();
            guard += 1;
            assert!(guard < 50, "no reply produced");
        }
        let reply = stack.deps().frames()[0];
        assert_eq!(reply.id().variable_field(), mti::VERIFIED_NODE_ID & 0x0FFF);
        assert_eq!(reply.data(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn duplicate_alias_forces_a_new_login() {
        let mut stack = logged_in_stack();
        let alias = stack.node(0).alias;
        let first_alias = alias;

        // a foreign RID with our alias as its source
        let frame = CanFrame::empty(CanIdentifier::control(
            crate::identifier::CONTROL_RID,
            alias,
        ));
        stack.incoming_frame(&frame);
        assert!(stack.buffers().aliases.has_duplicate_alias());

        assert_eq!(stack.step(), StepOutcome::ResolvedDuplicateAlias);
        assert_eq!(stack.node(0).login_state, LoginState::GenerateSeed);
        assert!(!stack.node(0).flags.permitted);
        assert!(!stack.node(0).flags.initialized);

        // it converges again, with a different alias
        let mut guard = 0;
        while stack.node(0).login_state != LoginState::Run {
            stack.tick_100ms();
            stack.step();
            guard += 1;
            assert!(guard < 300, "relogin did not converge");
        }
        assert_ne!(stack.node(0).alias, first_alias);
    }

    #[test]
    fn step_reports_idle_when_quiescent() {
        let mut stack = logged_in_stack();
        assert_eq!(stack.step(), StepOutcome::Idle);
    }
}
