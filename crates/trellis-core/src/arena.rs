//! Generation-checked arena backing the scope tree.
//!
//! Scopes reference each other through `ScopeId` handles instead of owned
//! pointers. Freeing a slot bumps its generation, so every handle into a
//! destroyed subtree goes inert instead of dangling; structural edits stay
//! O(1).

use std::fmt;

use crate::scope::ScopeNode;

/// Handle to a scope slot. Stale generations resolve to nothing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

impl ScopeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// A handle that never resolves. Returned by lifecycle operations on
    /// already-destroyed scopes so callers get an inert scope back.
    pub(crate) fn dead() -> Self {
        Self {
            index: u32::MAX,
            generation: u32::MAX,
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope({}v{})", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    node: Option<ScopeNode>,
}

pub(crate) struct ScopeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ScopeArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self, node: ScopeNode) -> ScopeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                ScopeId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                ScopeId::new(index, 0)
            }
        }
    }

    pub(crate) fn get(&self, id: ScopeId) -> Option<&ScopeNode> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ScopeId) -> Option<&mut ScopeNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    pub(crate) fn contains(&self, id: ScopeId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn free(&mut self, id: ScopeId) -> Option<ScopeNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(node)
    }
}
