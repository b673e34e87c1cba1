//! Watch registration: single watches, coalesced groups, and collection
//! observation.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::arena::ScopeId;
use crate::collections::map::HashMap;
use crate::engine::EngineInner;
use crate::scope::Scope;
use crate::value::{reference_equals, shallow_copy, EqualityMode, Value};
use crate::{CallbackResult, WatchGetter, WatchListener};

/// Last value a watcher observed. `Unset` makes the very first evaluation
/// register as dirty, and the listener's first firing passes the new value
/// as the old one.
#[derive(Clone)]
pub(crate) enum LastValue {
    Unset,
    Seen(Value),
}

pub(crate) type SharedWatchListener = Rc<RefCell<WatchListener>>;

pub(crate) struct Watcher {
    pub(crate) id: u64,
    pub(crate) get: WatchGetter,
    pub(crate) listener: SharedWatchListener,
    pub(crate) last: LastValue,
    pub(crate) eq: EqualityMode,
    pub(crate) label: Rc<str>,
}

/// Deregistration handle for a single watch.
///
/// Removal is by watcher identity, never by index: the list may have mutated
/// since registration. Deregistering twice is a no-op.
#[derive(Clone)]
pub struct WatchHandle {
    engine: Weak<EngineInner>,
    scope: ScopeId,
    id: u64,
}

impl WatchHandle {
    pub(crate) fn inert() -> Self {
        Self {
            engine: Weak::new(),
            scope: ScopeId::dead(),
            id: 0,
        }
    }

    pub fn deregister(&self) {
        let Some(engine) = self.engine.upgrade() else { return };
        let removed = {
            let mut scopes = engine.scopes.borrow_mut();
            match scopes.get_mut(self.scope) {
                Some(node) => match node.watchers.iter().position(|w| w.id == self.id) {
                    Some(pos) => {
                        node.watchers.remove(pos);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if removed {
            engine.adjust_watcher_counts(self.scope, -1);
            // Membership changed; the short-circuit marker is no longer
            // meaningful for the digest in flight.
            engine.last_dirty_watch.set(None);
        }
    }
}

struct GroupState {
    new_values: RefCell<Vec<Value>>,
    old_values: RefCell<Vec<Value>>,
    scheduled: Cell<bool>,
    first: Cell<bool>,
}

/// Deregistration handle for a watch group.
pub struct WatchGroupHandle {
    members: Vec<WatchHandle>,
    alive: Rc<Cell<bool>>,
}

impl WatchGroupHandle {
    fn inert() -> Self {
        Self {
            members: Vec::new(),
            alive: Rc::new(Cell::new(false)),
        }
    }

    pub fn deregister(&self) {
        self.alive.set(false);
        for member in &self.members {
            member.deregister();
        }
    }
}

enum CollectionShadow {
    Empty,
    Prim(Value),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

struct CollectionState {
    changes: Cell<u64>,
    shadow: RefCell<CollectionShadow>,
    current: RefCell<Value>,
    previous: RefCell<Option<Value>>,
}

impl CollectionState {
    /// Compares `value` against the shadow copy item-by-item, bumping the
    /// change counter and refreshing the shadow on any structural
    /// difference. Elements compare by identity, with NaN stable.
    fn observe(&self, value: &Value) {
        let mut shadow = self.shadow.borrow_mut();
        let changed = match value {
            Value::List(items) => {
                let items = items.borrow();
                match &mut *shadow {
                    CollectionShadow::List(prev) => {
                        let mut diff = items.len() != prev.len();
                        if !diff {
                            for (a, b) in items.iter().zip(prev.iter()) {
                                if !reference_equals(a, b) {
                                    diff = true;
                                    break;
                                }
                            }
                        }
                        if diff {
                            *prev = items.clone();
                        }
                        diff
                    }
                    other => {
                        *other = CollectionShadow::List(items.clone());
                        true
                    }
                }
            }
            Value::Map(entries) => {
                let entries = entries.borrow();
                match &mut *shadow {
                    CollectionShadow::Map(prev) => {
                        let mut diff = entries.len() != prev.len();
                        if !diff {
                            for (key, a) in entries.iter() {
                                match prev.get(key) {
                                    Some(b) if reference_equals(a, b) => {}
                                    _ => {
                                        diff = true;
                                        break;
                                    }
                                }
                            }
                        }
                        if diff {
                            *prev = entries.clone();
                        }
                        diff
                    }
                    other => {
                        *other = CollectionShadow::Map(entries.clone());
                        true
                    }
                }
            }
            primitive => match &mut *shadow {
                CollectionShadow::Prim(prev) => {
                    let diff = !reference_equals(primitive, prev);
                    if diff {
                        *prev = primitive.clone();
                    }
                    diff
                }
                other => {
                    *other = CollectionShadow::Prim(primitive.clone());
                    true
                }
            },
        };
        if changed {
            self.changes.set(self.changes.get() + 1);
        }
    }
}

impl Scope {
    /// Watches an expression compiled by the engine's evaluator.
    ///
    /// Expressions whose compilation carries a watch delegate hand the whole
    /// registration over to it (constant folding, one-shot watches and the
    /// like live behind that seam).
    pub fn watch(
        &self,
        expr: &str,
        listener: impl FnMut(&Value, &Value, &Scope) -> CallbackResult + 'static,
        eq: EqualityMode,
    ) -> WatchHandle {
        if !self.alive() {
            return WatchHandle::inert();
        }
        let compiled = self.engine.evaluator.compile(expr);
        if let Some(delegate) = compiled.watch_delegate.clone() {
            return (*delegate)(self, Box::new(listener), eq, &compiled);
        }
        self.watch_inner(
            Rc::clone(&compiled.eval),
            Box::new(listener),
            eq,
            Rc::clone(&compiled.label),
        )
    }

    /// Watches a getter closure directly, bypassing the evaluator.
    pub fn watch_fn(
        &self,
        get: impl Fn(&Scope) -> Value + 'static,
        listener: impl FnMut(&Value, &Value, &Scope) -> CallbackResult + 'static,
        eq: EqualityMode,
    ) -> WatchHandle {
        if !self.alive() {
            return WatchHandle::inert();
        }
        self.watch_inner(Rc::new(get), Box::new(listener), eq, Rc::from("fn"))
    }

    pub(crate) fn watch_inner(
        &self,
        get: WatchGetter,
        listener: WatchListener,
        eq: EqualityMode,
        label: Rc<str>,
    ) -> WatchHandle {
        let id = self.engine.take_watch_id();
        {
            let mut scopes = self.engine.scopes.borrow_mut();
            let Some(node) = scopes.get_mut(self.id) else {
                return WatchHandle::inert();
            };
            node.watchers.push(Watcher {
                id,
                get,
                listener: Rc::new(RefCell::new(listener)),
                last: LastValue::Unset,
                eq,
                label,
            });
        }
        self.engine.adjust_watcher_counts(self.id, 1);
        self.engine.last_dirty_watch.set(None);
        WatchHandle {
            engine: Rc::downgrade(&self.engine),
            scope: self.id,
            id,
        }
    }

    /// Watches several getters, coalescing all changes of one dirty pass
    /// into a single listener call with positional arrays of new and old
    /// values. With no getters the listener runs once, asynchronously, with
    /// empty arrays.
    pub fn watch_group(
        &self,
        getters: Vec<WatchGetter>,
        listener: impl FnMut(&[Value], &[Value], &Scope) -> CallbackResult + 'static,
    ) -> WatchGroupHandle {
        if !self.alive() {
            return WatchGroupHandle::inert();
        }
        let listener = Rc::new(RefCell::new(listener));

        if getters.is_empty() {
            let alive = Rc::new(Cell::new(true));
            let alive_for_task = Rc::clone(&alive);
            let listener_for_task = Rc::clone(&listener);
            self.eval_async(move |scope| {
                if alive_for_task.get() {
                    (&mut *listener_for_task.borrow_mut())(&[], &[], scope)
                } else {
                    Ok(())
                }
            });
            return WatchGroupHandle {
                members: Vec::new(),
                alive,
            };
        }

        let len = getters.len();
        let state = Rc::new(GroupState {
            new_values: RefCell::new(vec![Value::Null; len]),
            old_values: RefCell::new(vec![Value::Null; len]),
            scheduled: Cell::new(false),
            first: Cell::new(true),
        });
        let mut members = Vec::with_capacity(len);
        for (index, get) in getters.into_iter().enumerate() {
            let state_for_member = Rc::clone(&state);
            let listener_for_member = Rc::clone(&listener);
            let member = self.watch_inner(
                get,
                Box::new(move |new_value, _old_value, scope| {
                    state_for_member.new_values.borrow_mut()[index] = new_value.clone();
                    if !state_for_member.scheduled.replace(true) {
                        let state_for_task = Rc::clone(&state_for_member);
                        let listener_for_task = Rc::clone(&listener_for_member);
                        scope.eval_async(move |scope| {
                            state_for_task.scheduled.set(false);
                            let new_snapshot: Vec<Value> =
                                state_for_task.new_values.borrow().clone();
                            let old_snapshot: Vec<Value> = if state_for_task.first.replace(false) {
                                new_snapshot.clone()
                            } else {
                                state_for_task.old_values.borrow().clone()
                            };
                            let result = (&mut *listener_for_task.borrow_mut())(
                                &new_snapshot,
                                &old_snapshot,
                                scope,
                            );
                            // Old values roll forward even when the listener
                            // failed, so the next reaction reports the right
                            // deltas.
                            *state_for_task.old_values.borrow_mut() = new_snapshot;
                            result
                        });
                    }
                    Ok(())
                }),
                EqualityMode::Reference,
                Rc::from("watch-group"),
            );
            members.push(member);
        }
        WatchGroupHandle {
            members,
            alive: Rc::new(Cell::new(true)),
        }
    }

    /// `watch_group` over evaluator-compiled expressions.
    pub fn watch_group_exprs(
        &self,
        exprs: &[&str],
        listener: impl FnMut(&[Value], &[Value], &Scope) -> CallbackResult + 'static,
    ) -> WatchGroupHandle {
        if !self.alive() {
            return WatchGroupHandle::inert();
        }
        let getters: Vec<WatchGetter> = exprs
            .iter()
            .map(|expr| Rc::clone(&self.engine.evaluator.compile(expr).eval))
            .collect();
        self.watch_group(getters, listener)
    }

    /// Watches a collection for structural change: index-by-index for
    /// lists, key-by-key (including added and removed keys) for maps, plain
    /// identity otherwise.
    ///
    /// The listener receives the live collection as the new value and a
    /// shallow snapshot taken after the previous firing as the old one; on
    /// the first firing both are the live value.
    pub fn watch_collection(
        &self,
        get: impl Fn(&Scope) -> Value + 'static,
        mut listener: impl FnMut(&Value, &Value, &Scope) -> CallbackResult + 'static,
    ) -> WatchHandle {
        if !self.alive() {
            return WatchHandle::inert();
        }
        let state = Rc::new(CollectionState {
            changes: Cell::new(0),
            shadow: RefCell::new(CollectionShadow::Empty),
            current: RefCell::new(Value::Null),
            previous: RefCell::new(None),
        });

        let state_for_get = Rc::clone(&state);
        let inner_get = move |scope: &Scope| -> Value {
            let value = get(scope);
            state_for_get.observe(&value);
            *state_for_get.current.borrow_mut() = value;
            Value::Num(state_for_get.changes.get() as f64)
        };

        let state_for_listener = Rc::clone(&state);
        let inner_listener = move |_new: &Value, _old: &Value, scope: &Scope| -> CallbackResult {
            let new_value = state_for_listener.current.borrow().clone();
            let old_value = state_for_listener
                .previous
                .borrow_mut()
                .take()
                .unwrap_or_else(|| new_value.clone());
            let result = listener(&new_value, &old_value, scope);
            *state_for_listener.previous.borrow_mut() = Some(shallow_copy(&new_value));
            result
        };

        self.watch_inner(
            Rc::new(inner_get),
            Box::new(inner_listener),
            EqualityMode::Reference,
            Rc::from("watch-collection"),
        )
    }
}
