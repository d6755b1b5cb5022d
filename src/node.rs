//! Per-node records and the node registry.

use crate::config::Capacities;
use crate::events::EventId;
use crate::message::{Alias, EventMatch, MessageHandle, NodeId};
use generic_array::GenericArray;

/// Phases of the CAN login sequence, in the order a node passes through
/// them. A duplicate-alias event sends the node back to `GenerateSeed`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoginState {
    /// Freshly allocated; the node id becomes the first seed
    #[default]
    Init,
    /// Step the seed after an alias collision
    GenerateSeed,
    /// Fold the seed into a 12-bit alias candidate
    GenerateAlias,
    /// Emit Check ID 7 (node id bits 47:36)
    LoadCheckId7,
    /// Emit Check ID 6 (node id bits 35:24)
    LoadCheckId6,
    /// Emit Check ID 5 (node id bits 23:12)
    LoadCheckId5,
    /// Emit Check ID 4 (node id bits 11:0)
    LoadCheckId4,
    /// Hold for at least 200 ms listening for objections
    Wait200ms,
    /// Emit Reserve ID
    LoadReserveId,
    /// Emit Alias Map Definition; the node becomes Permitted
    LoadAliasMapDefinition,
    /// Emit Initialization Complete; the node becomes Initialized
    LoadInitializationComplete,
    /// Broadcast one Producer Identified per iteration
    LoadProducerEvents,
    /// Broadcast one Consumer Identified per iteration
    LoadConsumerEvents,
    /// Normal operation
    Run,
}

/// Per-node state flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// Slot is in use
    pub allocated: bool,
    /// Alias reservation finished (AMD sent)
    pub permitted: bool,
    /// Initialization Complete sent
    pub initialized: bool,
    /// Another node with our full id was seen on the bus
    pub duplicate_id_detected: bool,
    /// Another node with our alias was seen on the bus
    pub duplicate_alias_detected: bool,
    /// The ACK for the in-flight datagram has been sent
    pub datagram_ack_sent: bool,
    /// The outgoing datagram must be retransmitted
    pub resend_datagram: bool,
    /// Firmware upgrade mode is active (space 0xEF frozen)
    pub firmware_upgrade_active: bool,
}

/// Known state of an event with respect to this node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EventStatus {
    /// State not known
    #[default]
    Unknown,
    /// Event is set/valid
    Set,
    /// Event is clear/invalid
    Clear,
    /// Reserved encoding
    Reserved,
}

/// One entry of a consumer or producer event table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventEntry {
    /// The event id
    pub event: EventId,
    /// Its last known state
    pub status: EventStatus,
}

/// A registered event range. `count` is a power of two, at least two; the
/// range covers `base .. base + count`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventRange {
    /// First event of the range
    pub base: EventId,
    /// Number of events covered
    pub count: u16,
}

impl EventRange {
    /// The event id transmitted by the range-identified MTIs: the base with
    /// the count encoded as a low-bit mask.
    pub fn encoded(&self) -> EventId {
        self.base | EventId::from(self.count - 1)
    }

    /// Whether the range covers `event`.
    pub fn contains(&self, event: EventId) -> bool {
        event >= self.base && event - self.base < EventId::from(self.count)
    }
}

/// Cursor used to broadcast a table one event per iteration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TableEnumerator {
    /// A broadcast is in progress
    pub running: bool,
    /// Next entry to emit
    pub index: u16,
}

/// The registration code returned when a table is full.
pub const EVENT_REGISTER_FAILED: u16 = 0xFFFF;

/// A node's consumer or producer event table plus its range registrations
/// and broadcast cursor.
pub struct EventTable<NE: generic_array::ArrayLength<EventEntry>, NR: generic_array::ArrayLength<EventRange>> {
    list: GenericArray<EventEntry, NE>,
    count: u16,
    ranges: GenericArray<EventRange, NR>,
    range_count: u16,
    /// Incremental broadcast cursor
    pub enumerator: TableEnumerator,
}

impl<NE: generic_array::ArrayLength<EventEntry>, NR: generic_array::ArrayLength<EventRange>> Default
    for EventTable<NE, NR>
{
    fn default() -> Self {
        Self {
            list: GenericArray::default(),
            count: 0,
            ranges: GenericArray::default(),
            range_count: 0,
            enumerator: TableEnumerator::default(),
        }
    }
}

impl<NE: generic_array::ArrayLength<EventEntry>, NR: generic_array::ArrayLength<EventRange>>
    EventTable<NE, NR>
{
    /// Registers an event. Returns its index, or [`EVENT_REGISTER_FAILED`]
    /// when the table is full.
    pub fn register(&mut self, event: EventId, status: EventStatus) -> u16 {
        if usize::from(self.count) >= self.list.len() {
            return EVENT_REGISTER_FAILED;
        }
        self.list[usize::from(self.count)] = EventEntry { event, status };
        self.count += 1;
        self.count - 1
    }

    /// Registers a range. `count` must be a power of two and at least two;
    /// returns the range index or [`EVENT_REGISTER_FAILED`].
    pub fn register_range(&mut self, base: EventId, count: u16) -> u16 {
        if count < 2 || !count.is_power_of_two() {
            return EVENT_REGISTER_FAILED;
        }
        if usize::from(self.range_count) >= self.ranges.len() {
            return EVENT_REGISTER_FAILED;
        }
        self.ranges[usize::from(self.range_count)] = EventRange { base, count };
        self.range_count += 1;
        self.range_count - 1
    }

    /// Clears every event and range registration.
    pub fn clear(&mut self) {
        self.count = 0;
        self.range_count = 0;
        self.enumerator = TableEnumerator::default();
    }

    /// Number of registered events.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// The registered events.
    pub fn entries(&self) -> &[EventEntry] {
        &self.list[..usize::from(self.count)]
    }

    /// The registered ranges.
    pub fn ranges(&self) -> &[EventRange] {
        &self.ranges[..usize::from(self.range_count)]
    }

    /// Entry by table index.
    pub fn entry(&self, index: u16) -> Option<&EventEntry> {
        self.entries().get(usize::from(index))
    }

    /// Looks an event up against the literal entries, then the ranges.
    pub fn matches(&self, event: EventId) -> EventMatch {
        if self.entries().iter().any(|e| e.event == event) {
            return EventMatch::Literal(event);
        }
        if self.ranges().iter().any(|r| r.contains(event)) {
            return EventMatch::Range(event);
        }
        EventMatch::None
    }

    /// Status of a literal entry, if registered.
    pub fn status_of(&self, event: EventId) -> Option<EventStatus> {
        self.entries().iter().find(|e| e.event == event).map(|e| e.status)
    }

    /// Updates the status of a literal entry. Returns false when the event
    /// is not registered.
    pub fn set_status(&mut self, event: EventId, status: EventStatus) -> bool {
        let count = usize::from(self.count);
        match self.list[..count].iter_mut().find(|e| e.event == event) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }
}

/// Identification and capability constants for a node, fixed at build time.
#[derive(Debug)]
pub struct NodeParameters {
    /// Consumer events auto-created at allocation
    pub consumer_count_autocreate: u16,
    /// Producer events auto-created at allocation
    pub producer_count_autocreate: u16,
    /// SNIP identification strings
    pub snip: SnipParameters,
    /// Protocol support bit set (see [`crate::protocol::psi`])
    pub protocol_support: u64,
    /// Memory configuration options
    pub configuration_options: ConfigurationOptions,
    /// Address space 0xFF: configuration description information
    pub address_space_configuration_definition: AddressSpace,
    /// Address space 0xFE: all memory
    pub address_space_all: AddressSpace,
    /// Address space 0xFD: configuration memory
    pub address_space_configuration_memory: AddressSpace,
    /// Address space 0xFC: ACDI manufacturer strings (read only)
    pub address_space_acdi_manufacturer: AddressSpace,
    /// Address space 0xFB: ACDI user strings
    pub address_space_acdi_user: AddressSpace,
    /// Address space 0xEF: firmware upgrade
    pub address_space_firmware: AddressSpace,
    /// The CDI document served from space 0xFF
    pub cdi: &'static [u8],
}

impl NodeParameters {
    /// All-empty parameters, usable as a `static` starting point.
    pub const fn const_default() -> Self {
        Self {
            consumer_count_autocreate: 0,
            producer_count_autocreate: 0,
            snip: SnipParameters::const_default(),
            protocol_support: 0,
            configuration_options: ConfigurationOptions::const_default(),
            address_space_configuration_definition: AddressSpace::const_default(0xFF),
            address_space_all: AddressSpace::const_default(0xFE),
            address_space_configuration_memory: AddressSpace::const_default(0xFD),
            address_space_acdi_manufacturer: AddressSpace::const_default(0xFC),
            address_space_acdi_user: AddressSpace::const_default(0xFB),
            address_space_firmware: AddressSpace::const_default(0xEF),
            cdi: &[],
        }
    }

    /// The address space descriptor for a space number, when the node
    /// defines one.
    pub fn address_space(&self, space: u8) -> Option<&AddressSpace> {
        match space {
            0xFF => Some(&self.address_space_configuration_definition),
            0xFE => Some(&self.address_space_all),
            0xFD => Some(&self.address_space_configuration_memory),
            0xFC => Some(&self.address_space_acdi_manufacturer),
            0xFB => Some(&self.address_space_acdi_user),
            0xEF => Some(&self.address_space_firmware),
            _ => None,
        }
    }
}

/// The Simple Node Information strings.
#[derive(Debug)]
pub struct SnipParameters {
    /// Version byte of the manufacturer block
    pub mfg_version: u8,
    /// Manufacturer name
    pub name: &'static str,
    /// Model name
    pub model: &'static str,
    /// Hardware version
    pub hardware_version: &'static str,
    /// Software version
    pub software_version: &'static str,
    /// Version byte of the user block
    pub user_version: u8,
    /// Default user-assigned name (space 0xFB may override)
    pub user_name: &'static str,
    /// Default user description (space 0xFB may override)
    pub user_description: &'static str,
}

impl SnipParameters {
    /// All-empty strings.
    pub const fn const_default() -> Self {
        Self {
            mfg_version: 4,
            name: "",
            model: "",
            hardware_version: "",
            software_version: "",
            user_version: 2,
            user_name: "",
            user_description: "",
        }
    }
}

/// Capabilities reported by Get Configuration Options.
#[derive(Debug)]
pub struct ConfigurationOptions {
    /// Write-under-mask commands accepted
    pub write_under_mask: bool,
    /// Unaligned reads accepted
    pub unaligned_reads: bool,
    /// Unaligned writes accepted
    pub unaligned_writes: bool,
    /// Space 0xFC readable
    pub acdi_manufacturer_read: bool,
    /// Space 0xFB readable
    pub acdi_user_read: bool,
    /// Space 0xFB writable
    pub acdi_user_write: bool,
    /// Stream read/write commands accepted
    pub stream_read_write: bool,
    /// Highest implemented address space
    pub high_address_space: u8,
    /// Lowest implemented address space
    pub low_address_space: u8,
    /// Free-form description string
    pub description: &'static str,
}

impl ConfigurationOptions {
    /// Conservative defaults: plain aligned reads and writes only.
    pub const fn const_default() -> Self {
        Self {
            write_under_mask: false,
            unaligned_reads: false,
            unaligned_writes: false,
            acdi_manufacturer_read: true,
            acdi_user_read: true,
            acdi_user_write: true,
            stream_read_write: false,
            high_address_space: 0xFF,
            low_address_space: 0xFD,
            description: "",
        }
    }
}

/// Descriptor of one configuration memory address space.
#[derive(Debug)]
pub struct AddressSpace {
    /// Space is implemented on this node
    pub present: bool,
    /// Writes are rejected with a permanent error
    pub read_only: bool,
    /// `low_address` is meaningful
    pub low_address_valid: bool,
    /// First valid address when `low_address_valid`
    pub low_address: u32,
    /// Last valid address
    pub highest_address: u32,
    /// The space number (0xFF..0xEF)
    pub space: u8,
    /// Free-form description string
    pub description: &'static str,
}

impl AddressSpace {
    /// A not-present descriptor for the given space number.
    pub const fn const_default(space: u8) -> Self {
        Self {
            present: false,
            read_only: false,
            low_address_valid: false,
            low_address: 0,
            highest_address: 0,
            space,
            description: "",
        }
    }
}

/// Stream session state hung off a node.
#[derive(Copy, Clone, Debug, Default)]
pub struct StreamState {
    /// A stream session is open
    pub active: bool,
    /// Our stream id
    pub source_stream_id: u8,
    /// The peer's stream id
    pub dest_stream_id: u8,
    /// Alias of the peer
    pub peer_alias: Alias,
    /// Negotiated window size in bytes
    pub buffer_size: u16,
    /// Bytes received since the last Proceed
    pub bytes_since_proceed: u16,
    /// Buffer accumulating inbound stream data
    pub inbound: Option<MessageHandle>,
}

/// One virtual node.
pub struct Node<C: Capacities> {
    /// 48-bit node id
    pub id: NodeId,
    /// 12-bit alias, zero until login reaches the reservation phase
    pub alias: Alias,
    /// Current alias-generation seed
    pub seed: NodeId,
    /// State flags
    pub flags: NodeFlags,
    /// Login phase
    pub login_state: LoginState,
    /// Identification and capability constants
    pub parameters: Option<&'static NodeParameters>,
    /// Consumed events
    pub consumers: EventTable<C::ConsumerEvents, C::ConsumerRanges>,
    /// Produced events
    pub producers: EventTable<C::ProducerEvents, C::ProducerRanges>,
    /// 100 ms ticks since the counter was last cleared
    pub timer_ticks: u16,
    /// Node id holding the configuration lock, zero when unlocked
    pub owner_node: NodeId,
    /// Datagram being reassembled or awaiting its acknowledgement
    pub last_received_datagram: Option<MessageHandle>,
    /// Stream session state
    pub stream: StreamState,
}

impl<C: Capacities> Default for Node<C> {
    fn default() -> Self {
        Self {
            id: 0,
            alias: 0,
            seed: 0,
            flags: NodeFlags::default(),
            login_state: LoginState::Init,
            parameters: None,
            consumers: EventTable::default(),
            producers: EventTable::default(),
            timer_ticks: 0,
            owner_node: 0,
            last_received_datagram: None,
            stream: StreamState::default(),
        }
    }
}

impl<C: Capacities> Node<C> {
    /// The node's parameters. Only valid on allocated nodes.
    pub fn parameters(&self) -> &'static NodeParameters {
        self.parameters.expect("allocated node without parameters")
    }

    /// Whether this node accepts normal traffic (it finished login).
    pub fn is_initialized(&self) -> bool {
        self.flags.allocated && self.flags.initialized
    }
}

/// Named cursors over the node registry. Each key owns an independent
/// position so concurrent walks do not disturb each other.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnumeratorKey {
    /// First application cursor
    Application0,
    /// Second application cursor
    Application1,
    /// Third application cursor
    Application2,
    /// Fourth application cursor
    Application3,
    /// Reserved for the OpenLCB main state machine
    OpenLcbMain,
    /// Reserved for the login state machine
    Login,
    /// Reserved for the CAN main state machine
    CanMain,
}

impl EnumeratorKey {
    fn index(self) -> usize {
        match self {
            EnumeratorKey::Application0 => 0,
            EnumeratorKey::Application1 => 1,
            EnumeratorKey::Application2 => 2,
            EnumeratorKey::Application3 => 3,
            EnumeratorKey::OpenLcbMain => 4,
            EnumeratorKey::Login => 5,
            EnumeratorKey::CanMain => 6,
        }
    }
}

const ENUM_KEY_COUNT: usize = 8;

/// Node allocation failures.
#[derive(Debug, PartialEq, Eq)]
pub enum AllocateError {
    /// Every node slot is in use
    RegistryFull,
    /// The auto-created events did not fit the event table
    EventTableFull,
}

/// Fixed array of node records plus the enumeration cursors.
pub struct NodeRegistry<C: Capacities> {
    nodes: GenericArray<Node<C>, C::Nodes>,
    cursors: [u16; ENUM_KEY_COUNT],
}

impl<C: Capacities> Default for NodeRegistry<C> {
    fn default() -> Self {
        Self {
            nodes: GenericArray::default(),
            cursors: [0; ENUM_KEY_COUNT],
        }
    }
}

impl<C: Capacities> NodeRegistry<C> {
    /// Claims a node slot, auto-creating the configured number of consumer
    /// and producer events with ids `(node_id << 16) | index`.
    pub fn allocate(
        &mut self,
        node_id: NodeId,
        parameters: &'static NodeParameters,
    ) -> Result<usize, AllocateError> {
        let index = self
            .nodes
            .iter()
            .position(|n| !n.flags.allocated)
            .ok_or(AllocateError::RegistryFull)?;

        let node = &mut self.nodes[index];
        *node = Node::default();
        node.id = node_id;
        node.parameters = Some(parameters);
        node.flags.allocated = true;
        node.login_state = LoginState::Init;

        for i in 0..parameters.consumer_count_autocreate {
            let event = (node_id << 16) | EventId::from(i);
            if node.consumers.register(event, EventStatus::Unknown) == EVENT_REGISTER_FAILED {
                node.flags.allocated = false;
                return Err(AllocateError::EventTableFull);
            }
        }
        for i in 0..parameters.producer_count_autocreate {
            let event = (node_id << 16) | EventId::from(i);
            if node.producers.register(event, EventStatus::Unknown) == EVENT_REGISTER_FAILED {
                node.flags.allocated = false;
                return Err(AllocateError::EventTableFull);
            }
        }
        Ok(index)
    }

    /// The node at `index`.
    pub fn node(&self, index: usize) -> &Node<C> {
        &self.nodes[index]
    }

    /// Mutable access to the node at `index`.
    pub fn node_mut(&mut self, index: usize) -> &mut Node<C> {
        &mut self.nodes[index]
    }

    /// Number of node slots.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Restarts the cursor for `key` and returns the first allocated node.
    pub fn get_first(&mut self, key: EnumeratorKey) -> Option<usize> {
        self.cursors[key.index()] = 0;
        self.get_next(key)
    }

    /// Advances the cursor for `key`; `None` past the end of the table.
    pub fn get_next(&mut self, key: EnumeratorKey) -> Option<usize> {
        let cursor = &mut self.cursors[key.index()];
        while usize::from(*cursor) < self.nodes.len() {
            let index = usize::from(*cursor);
            *cursor += 1;
            if self.nodes[index].flags.allocated {
                return Some(index);
            }
        }
        None
    }

    /// Index of the allocated node holding `alias`.
    pub fn find_by_alias(&self, alias: Alias) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.flags.allocated && n.alias == alias && alias != 0)
    }

    /// Index of the allocated node with the given full id.
    pub fn find_by_node_id(&self, node_id: NodeId) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.flags.allocated && n.id == node_id)
    }

    /// Bumps every allocated node's tick counter. Call at a 100 ms cadence
    /// from the platform timer.
    pub fn tick_100ms(&mut self) {
        for node in self.nodes.iter_mut() {
            if node.flags.allocated {
                node.timer_ticks = node.timer_ticks.saturating_add(1);
            }
        }
    }

    /// Iterates the indices of all allocated nodes.
    pub fn allocated_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.flags.allocated)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DefaultCapacities;

    static PARAMS: NodeParameters = {
        let mut p = NodeParameters::const_default();
        p.consumer_count_autocreate = 3;
        p.producer_count_autocreate = 4;
        p
    };

    const NODE_ID: NodeId = 0x0102_0304_0506;

    #[test]
    fn allocate_autocreates_events() {
        let mut registry: NodeRegistry<DefaultCapacities> = NodeRegistry::default();
        let index = registry.allocate(NODE_ID, &PARAMS).unwrap();
        let node = registry.node(index);
        assert_eq!(node.id, NODE_ID);
        assert_eq!(node.login_state, LoginState::Init);
        assert_eq!(node.consumers.count(), 3);
        assert_eq!(node.producers.count(), 4);
        assert_eq!(node.consumers.entries()[0].event, NODE_ID << 16);
        assert_eq!(node.consumers.entries()[2].event, (NODE_ID << 16) | 2);
        assert_eq!(node.consumers.entries()[0].status, EventStatus::Unknown);
    }

    #[test]
    fn registry_full_is_reported() {
        let mut registry: NodeRegistry<DefaultCapacities> = NodeRegistry::default();
        let capacity = registry.capacity();
        for i in 0..capacity {
            registry.allocate(NODE_ID + i as NodeId, &PARAMS).unwrap();
        }
        assert_eq!(
            registry.allocate(NODE_ID + 100, &PARAMS),
            Err(AllocateError::RegistryFull)
        );
    }

    #[test]
    fn cursors_are_independent_per_key(){
        let mut registry: NodeRegistry<DefaultCapacities> = NodeRegistry::default();
        registry.allocate(NODE_ID, &PARAMS).unwrap();
        registry.allocate(NODE_ID + 1, &PARAMS).unwrap();

        let first = registry.get_first(EnumeratorKey::CanMain).unwrap();
        // a second key walking the list does not move the first cursor
        assert_eq!(registry.get_first(EnumeratorKey::OpenLcbMain), Some(first));
        assert!(registry.get_next(EnumeratorKey::OpenLcbMain).is_some());
        assert_eq!(registry.get_next(EnumeratorKey::OpenLcbMain), None);

        assert!(registry.get_next(EnumeratorKey::CanMain).is_some());
        assert_eq!(registry.get_next(EnumeratorKey::CanMain), None);
    }

    #[test]
    fn find_by_alias_ignores_unassigned() {
        let mut registry: NodeRegistry<DefaultCapacities> = NodeRegistry::default();
        let index = registry.allocate(NODE_ID, &PARAMS).unwrap();
        assert_eq!(registry.find_by_alias(0), None);
        registry.node_mut(index).alias = 0xAAA;
        assert_eq!(registry.find_by_alias(0xAAA), Some(index));
        assert_eq!(registry.find_by_node_id(NODE_ID), Some(index));
    }

    #[test]
    fn tick_increments_allocated_nodes() {
        let mut registry: NodeRegistry<DefaultCapacities> = NodeRegistry::default();
        let index = registry.allocate(NODE_ID, &PARAMS).unwrap();
        registry.tick_100ms();
        registry.tick_100ms();
        assert_eq!(registry.node(index).timer_ticks, 2);
    }

    #[test]
    fn event_table_ranges() {
        let mut table: EventTable<
            <DefaultCapacities as Capacities>::ConsumerEvents,
            <DefaultCapacities as Capacities>::ConsumerRanges,
        > = EventTable::default();
        assert_eq!(table.register_range(0x0100, 3), EVENT_REGISTER_FAILED);
        assert_eq!(table.register_range(0x0100, 1), EVENT_REGISTER_FAILED);
        assert_ne!(table.register_range(0x0100, 0x100), EVENT_REGISTER_FAILED);
        assert_eq!(table.matches(0x01FF), EventMatch::Range(0x01FF));
        assert_eq!(table.matches(0x0200), EventMatch::None);
        assert_eq!(table.ranges()[0].encoded(), 0x01FF);
    }

    #[test]
    fn event_status_updates() {
        let mut table: EventTable<
            <DefaultCapacities as Capacities>::ConsumerEvents,
            <DefaultCapacities as Capacities>::ConsumerRanges,
        > = EventTable::default();
        table.register(0xABCD, EventStatus::Unknown);
        assert!(table.set_status(0xABCD, EventStatus::Set));
        assert_eq!(table.status_of(0xABCD), Some(EventStatus::Set));
        assert!(!table.set_status(0xDCBA, EventStatus::Set));
    }
}
