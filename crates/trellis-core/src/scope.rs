//! Scope tree nodes, the public `Scope` handle, and lifecycle operations.
//!
//! A node owns its local state record, its watcher list, and its event
//! listener table. Tree edges are arena handles in both directions; the
//! parent-to-first-child edge is the owning one in the sense that destroying
//! a scope frees its whole subtree.
//!
//! Non-isolated children do not inherit state through any language
//! mechanism. Reads walk an explicit fallback chain: the local record first,
//! then `state_parent`, until a hit, the root, or an isolated boundary.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::arena::{ScopeArena, ScopeId};
use crate::collections::map::HashMap;
use crate::engine::EngineInner;
use crate::event::ListenerSlot;
use crate::value::Value;
use crate::watch::Watcher;

pub(crate) struct ScopeNode {
    pub(crate) serial: u64,
    pub(crate) parent: Option<ScopeId>,
    pub(crate) first_child: Option<ScopeId>,
    pub(crate) last_child: Option<ScopeId>,
    pub(crate) next_sibling: Option<ScopeId>,
    pub(crate) prev_sibling: Option<ScopeId>,
    pub(crate) state: HashMap<String, Value>,
    /// Read-miss fallback for state lookups; `None` on isolated scopes and
    /// the root.
    pub(crate) state_parent: Option<ScopeId>,
    /// Logical front of the watcher list is the Vec tail: registration
    /// pushes, the digest iterates tail-to-head.
    pub(crate) watchers: Vec<Watcher>,
    /// Watchers on this scope plus all descendants.
    pub(crate) watcher_count: usize,
    /// Slots are tombstoned (`None`) rather than spliced so deregistration
    /// during an event cycle cannot shift live entries.
    pub(crate) listeners: HashMap<String, Vec<Option<ListenerSlot>>>,
    /// Listeners per event name on this scope plus all descendants.
    pub(crate) listener_count: HashMap<String, usize>,
    pub(crate) destroyed: bool,
}

impl ScopeNode {
    pub(crate) fn new(serial: u64, parent: Option<ScopeId>, state_parent: Option<ScopeId>) -> Self {
        Self {
            serial,
            parent,
            first_child: None,
            last_child: None,
            next_sibling: None,
            prev_sibling: None,
            state: HashMap::default(),
            state_parent,
            watchers: Vec::new(),
            watcher_count: 0,
            listeners: HashMap::default(),
            listener_count: HashMap::default(),
            destroyed: false,
        }
    }

    pub(crate) fn listener_count_for(&self, name: &str) -> usize {
        self.listener_count.get(name).copied().unwrap_or(0)
    }
}

/// Structural snapshot of a node, taken before user callbacks run so the
/// traversal can still advance if the node was destroyed under it.
#[derive(Clone, Copy)]
pub(crate) struct Links {
    pub(crate) parent: Option<ScopeId>,
    pub(crate) first_child: Option<ScopeId>,
    pub(crate) next_sibling: Option<ScopeId>,
}

impl Links {
    pub(crate) fn of(node: &ScopeNode) -> Self {
        Self {
            parent: node.parent,
            first_child: node.first_child,
            next_sibling: node.next_sibling,
        }
    }
}

/// Depth-first pre-order step shared by the digest and `broadcast`.
///
/// Descends into children only when `descend` is set (the caller gates on an
/// aggregate counter), otherwise moves to the next sibling, climbing parents
/// when a branch is exhausted and stopping at `target`.
pub(crate) fn next_in_traversal(
    scopes: &ScopeArena,
    current: ScopeId,
    target: ScopeId,
    links: Links,
    descend: bool,
) -> Option<ScopeId> {
    if descend {
        if let Some(child) = links.first_child {
            if scopes.contains(child) {
                return Some(child);
            }
        }
    }
    if current != target {
        if let Some(sibling) = links.next_sibling {
            if scopes.contains(sibling) {
                return Some(sibling);
            }
        }
    }
    let mut cursor = current;
    let mut parent = links.parent;
    loop {
        if cursor == target {
            return None;
        }
        let parent_id = parent?;
        let parent_node = scopes.get(parent_id)?;
        if parent_id != target {
            if let Some(sibling) = parent_node.next_sibling {
                if scopes.contains(sibling) {
                    return Some(sibling);
                }
            }
        }
        cursor = parent_id;
        parent = parent_node.parent;
    }
}

impl EngineInner {
    /// Adds `delta` to the aggregate watcher count of `from` and every
    /// ancestor up to the root.
    pub(crate) fn adjust_watcher_counts(&self, from: ScopeId, delta: i64) {
        let mut scopes = self.scopes.borrow_mut();
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let Some(node) = scopes.get_mut(id) else { break };
            node.watcher_count = (node.watcher_count as i64 + delta).max(0) as usize;
            cursor = node.parent;
        }
    }

    /// Same walk for per-event-name listener counts; entries that reach zero
    /// are dropped from the table.
    pub(crate) fn adjust_listener_counts(&self, from: ScopeId, name: &str, delta: i64) {
        let mut scopes = self.scopes.borrow_mut();
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let Some(node) = scopes.get_mut(id) else { break };
            let next = node.parent;
            let drained = {
                let count = node.listener_count.entry(name.to_string()).or_insert(0);
                *count = (*count as i64 + delta).max(0) as usize;
                *count == 0
            };
            if drained {
                node.listener_count.remove(name);
            }
            cursor = next;
        }
    }
}

/// Handle to one node of the scope tree.
///
/// Handles are cheap to clone and stay valid to hold after the scope is
/// destroyed; every mutating operation through a stale handle is a silent
/// no-op, so straggler callbacks referencing a torn-down subtree are
/// harmless.
pub struct Scope {
    pub(crate) engine: Rc<EngineInner>,
    pub(crate) id: ScopeId,
}

impl Clone for Scope {
    fn clone(&self) -> Self {
        Self {
            engine: Rc::clone(&self.engine),
            id: self.id,
        }
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.engine, &other.engine)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scope({})", self.id)
    }
}

impl Scope {
    pub(crate) fn from_parts(engine: Rc<EngineInner>, id: ScopeId) -> Self {
        Self { engine, id }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Monotonic creation index, for diagnostics only.
    pub fn serial(&self) -> Option<u64> {
        self.engine.scopes.borrow().get(self.id).map(|n| n.serial)
    }

    pub fn is_destroyed(&self) -> bool {
        !self.alive()
    }

    /// Allocated and not flagged destroyed.
    pub(crate) fn alive(&self) -> bool {
        self.engine
            .scopes
            .borrow()
            .get(self.id)
            .map(|n| !n.destroyed)
            .unwrap_or(false)
    }

    pub fn parent(&self) -> Option<Scope> {
        let parent = self.engine.scopes.borrow().get(self.id)?.parent?;
        Some(Scope::from_parts(Rc::clone(&self.engine), parent))
    }

    /// The tree's root scope, reachable from any depth in O(1).
    pub fn root(&self) -> Scope {
        self.engine.root_scope()
    }

    /// Aggregate watcher count of this scope and its descendants.
    pub fn watcher_count(&self) -> usize {
        self.engine
            .scopes
            .borrow()
            .get(self.id)
            .map(|n| n.watcher_count)
            .unwrap_or(0)
    }

    /// Aggregate listener count for `name` over this scope's subtree.
    pub fn listener_count(&self, name: &str) -> usize {
        self.engine
            .scopes
            .borrow()
            .get(self.id)
            .map(|n| n.listener_count_for(name))
            .unwrap_or(0)
    }

    /// Reads `key` through the explicit lookup chain: this scope's record,
    /// then non-isolated ancestors.
    pub fn get(&self, key: &str) -> Option<Value> {
        let scopes = self.engine.scopes.borrow();
        let mut cursor = self.id;
        loop {
            let node = scopes.get(cursor)?;
            if let Some(value) = node.state.get(key) {
                return Some(value.clone());
            }
            cursor = node.state_parent?;
        }
    }

    /// Writes into this scope's local record, shadowing any ancestor entry.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut scopes = self.engine.scopes.borrow_mut();
        if let Some(node) = scopes.get_mut(self.id) {
            node.state.insert(key.into(), value);
        }
    }

    /// Creates a child scope attached under this scope.
    ///
    /// Non-isolated children resolve state reads through this scope;
    /// isolated children get a fresh, disconnected record.
    pub fn new_child(&self, isolated: bool) -> Scope {
        self.new_child_attached(isolated, None)
    }

    /// Creates a child whose tree position is under `attach_to` while state
    /// lookups (when not isolated) still fall back to this scope.
    pub fn new_child_with_parent(&self, isolated: bool, attach_to: &Scope) -> Scope {
        self.new_child_attached(isolated, Some(attach_to.id))
    }

    fn new_child_attached(&self, isolated: bool, attach: Option<ScopeId>) -> Scope {
        let attach_id = attach.unwrap_or(self.id);
        if !self.alive() || !self.engine.scopes.borrow().contains(attach_id) {
            return Scope::from_parts(Rc::clone(&self.engine), ScopeId::dead());
        }
        let serial = self.engine.take_serial();
        let state_parent = if isolated { None } else { Some(self.id) };
        let child_id = {
            let mut scopes = self.engine.scopes.borrow_mut();
            let id = scopes.alloc(ScopeNode::new(serial, Some(attach_id), state_parent));
            let previous_last = {
                let parent = scopes.get_mut(attach_id).expect("attach scope checked above");
                let previous = parent.last_child;
                parent.last_child = Some(id);
                if parent.first_child.is_none() {
                    parent.first_child = Some(id);
                }
                previous
            };
            if let Some(prev_id) = previous_last {
                if let Some(prev) = scopes.get_mut(prev_id) {
                    prev.next_sibling = Some(id);
                }
                if let Some(child) = scopes.get_mut(id) {
                    child.prev_sibling = Some(prev_id);
                }
            }
            id
        };
        log::debug!("created scope {child_id} under {attach_id} (isolated: {isolated})");
        let child = Scope::from_parts(Rc::clone(&self.engine), child_id);
        // An isolated or reparented child is not covered by its state
        // parent's teardown, so cascade the destroyed flag through the
        // regular event path.
        if isolated || attach_id != self.id {
            child.on("$destroy", |event, _args| {
                if let Some(current) = event.current_scope() {
                    current.mark_destroyed();
                }
                Ok(())
            });
        }
        child
    }

    pub(crate) fn mark_destroyed(&self) {
        let mut scopes = self.engine.scopes.borrow_mut();
        if let Some(node) = scopes.get_mut(self.id) {
            node.destroyed = true;
        }
    }

    /// Tears this scope and its subtree down. Idempotent.
    ///
    /// A `$destroy` broadcast runs first so descendants can release
    /// resources; after that the subtree's aggregate counters are removed
    /// from every ancestor, the node is unlinked, and the arena slots are
    /// freed, which turns every outstanding handle into the subtree inert.
    pub fn destroy(&self) {
        if !self.alive() {
            return;
        }
        self.broadcast("$destroy", &[]);

        let (parent, prev, next, watcher_total, listener_totals) = {
            let mut scopes = self.engine.scopes.borrow_mut();
            let Some(node) = scopes.get_mut(self.id) else { return };
            node.destroyed = true;
            let totals: Vec<(String, usize)> = node
                .listener_count
                .iter()
                .map(|(name, count)| (name.clone(), *count))
                .collect();
            (
                node.parent,
                node.prev_sibling,
                node.next_sibling,
                node.watcher_count,
                totals,
            )
        };

        if watcher_total > 0 {
            if let Some(parent_id) = parent {
                self.engine
                    .adjust_watcher_counts(parent_id, -(watcher_total as i64));
            }
        }
        if let Some(parent_id) = parent {
            for (name, count) in &listener_totals {
                self.engine
                    .adjust_listener_counts(parent_id, name, -(*count as i64));
            }
        }

        let mut scopes = self.engine.scopes.borrow_mut();
        if let Some(parent_id) = parent {
            if let Some(parent_node) = scopes.get_mut(parent_id) {
                if parent_node.first_child == Some(self.id) {
                    parent_node.first_child = next;
                }
                if parent_node.last_child == Some(self.id) {
                    parent_node.last_child = prev;
                }
            }
        }
        if let Some(prev_id) = prev {
            if let Some(prev_node) = scopes.get_mut(prev_id) {
                prev_node.next_sibling = next;
            }
        }
        if let Some(next_id) = next {
            if let Some(next_node) = scopes.get_mut(next_id) {
                next_node.prev_sibling = prev;
            }
        }

        // Free the whole subtree; stale handles die with the generation bump.
        let mut stack: SmallVec<[ScopeId; 8]> = SmallVec::new();
        let mut doomed: SmallVec<[ScopeId; 8]> = SmallVec::new();
        stack.push(self.id);
        while let Some(id) = stack.pop() {
            doomed.push(id);
            let mut child = scopes.get(id).and_then(|n| n.first_child);
            while let Some(child_id) = child {
                stack.push(child_id);
                child = scopes.get(child_id).and_then(|n| n.next_sibling);
            }
        }
        log::debug!("destroying {} scope(s) rooted at {}", doomed.len(), self.id);
        for id in doomed {
            scopes.free(id);
        }
    }
}
