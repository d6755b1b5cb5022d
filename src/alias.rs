//! The alias⇄node-id mapping table.
//!
//! Every node heard on the bus, local or remote, gets an entry here so
//! the receive path can translate aliases into full node ids. The table is
//! small; lookups are linear scans.

use crate::config::Capacities;
use crate::message::{Alias, NodeId};
use generic_array::GenericArray;

/// One alias table entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AliasMapping {
    /// The 12-bit alias; zero marks a free slot
    pub alias: Alias,
    /// The full node id behind the alias
    pub node_id: NodeId,
    /// Another node was observed using the same alias
    pub is_duplicate: bool,
    /// The owning node finished alias reservation
    pub is_permitted: bool,
}

/// Capacity-bounded set of alias mappings with a container-level
/// duplicate-alias flag for the main state machine to reconcile.
pub struct AliasMappings<C: Capacities> {
    list: GenericArray<AliasMapping, C::AliasMappings>,
    has_duplicate_alias: bool,
}

impl<C: Capacities> Default for AliasMappings<C> {
    fn default() -> Self {
        Self {
            list: GenericArray::default(),
            has_duplicate_alias: false,
        }
    }
}

impl<C: Capacities> AliasMappings<C> {
    /// Adds or updates a mapping. A node id already in the table keeps its
    /// slot and gets the new alias; there is never more than one alias per
    /// node id. Returns `None` when the table is full.
    pub fn register(&mut self, alias: Alias, node_id: NodeId) -> Option<&mut AliasMapping> {
        if let Some(index) = self.list.iter().position(|m| m.alias != 0 && m.node_id == node_id) {
            let mapping = &mut self.list[index];
            mapping.alias = alias;
            return Some(mapping);
        }
        if let Some(index) = self.list.iter().position(|m| m.alias == 0) {
            let mapping = &mut self.list[index];
            *mapping = AliasMapping {
                alias,
                node_id,
                is_duplicate: false,
                is_permitted: false,
            };
            return Some(mapping);
        }
        None
    }

    /// Clears the entry holding `alias`, if present.
    pub fn unregister(&mut self, alias: Alias) {
        if let Some(mapping) = self.list.iter_mut().find(|m| m.alias == alias) {
            *mapping = AliasMapping::default();
        }
    }

    /// Entry for an alias.
    pub fn find_by_alias(&self, alias: Alias) -> Option<&AliasMapping> {
        self.list.iter().find(|m| m.alias != 0 && m.alias == alias)
    }

    /// Mutable entry for an alias.
    pub fn find_by_alias_mut(&mut self, alias: Alias) -> Option<&mut AliasMapping> {
        self.list.iter_mut().find(|m| m.alias != 0 && m.alias == alias)
    }

    /// Entry for a node id.
    pub fn find_by_node_id(&self, node_id: NodeId) -> Option<&AliasMapping> {
        self.list.iter().find(|m| m.alias != 0 && m.node_id == node_id)
    }

    /// Raises the container-level duplicate flag; the main state machine
    /// clears it after reconciling the marked entries.
    pub fn set_has_duplicate_alias(&mut self) {
        self.has_duplicate_alias = true;
    }

    /// Clears the container-level duplicate flag.
    pub fn clear_has_duplicate_alias(&mut self) {
        self.has_duplicate_alias = false;
    }

    /// Whether any entry is marked duplicate and awaiting reconciliation.
    pub fn has_duplicate_alias(&self) -> bool {
        self.has_duplicate_alias
    }

    /// All entries, free slots included.
    pub fn entries(&self) -> &[AliasMapping] {
        &self.list
    }

    /// Mutable view of all entries.
    pub fn entries_mut(&mut self) -> &mut [AliasMapping] {
        &mut self.list
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DefaultCapacities;
    use generic_array::typenum::Unsigned;

    const NODE_ID: NodeId = 0x0102_0304_0506;
    const ALIAS: Alias = 0x666;

    #[test]
    fn register_until_full_then_lookup() {
        let mut mappings: AliasMappings<DefaultCapacities> = AliasMappings::default();
        let depth = <DefaultCapacities as Capacities>::AliasMappings::USIZE as u16;
        for i in 0..depth {
            assert!(mappings.register(ALIAS + i, NODE_ID + NodeId::from(i)).is_some());
        }
        assert!(mappings.register(ALIAS - 1, NODE_ID - 1).is_none());
        for i in 0..depth {
            assert!(mappings.find_by_alias(ALIAS + i).is_some());
            assert!(mappings.find_by_node_id(NODE_ID + NodeId::from(i)).is_some());
        }
        for i in 0..depth {
            mappings.unregister(ALIAS + i);
        }
        for i in 0..depth {
            assert!(mappings.find_by_alias(ALIAS + i).is_none());
        }
    }

    #[test]
    fn reregistering_a_node_id_updates_in_place() {
        let mut mappings: AliasMappings<DefaultCapacities> = AliasMappings::default();
        mappings.register(ALIAS, NODE_ID).unwrap();
        mappings.register(ALIAS + 1, NODE_ID).unwrap();
        assert!(mappings.find_by_alias(ALIAS).is_none());
        let mapping = mappings.find_by_alias(ALIAS + 1).unwrap();
        assert_eq!(mapping.node_id, NODE_ID);
        // still exactly one entry
        assert_eq!(
            mappings.entries().iter().filter(|m| m.alias != 0).count(),
            1
        );
    }

    #[test]
    fn duplicate_flag_is_latched() {
        let mut mappings: AliasMappings<DefaultCapacities> = AliasMappings::default();
        assert!(!mappings.has_duplicate_alias());
        mappings.set_has_duplicate_alias();
        assert!(mappings.has_duplicate_alias());
        mappings.clear_has_duplicate_alias();
        assert!(!mappings.has_duplicate_alias());
    }
}
