//! Hierarchical event bus: targeted upward emission and subtree broadcast.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::arena::ScopeId;
use crate::engine::EngineInner;
use crate::scope::{next_in_traversal, Links, Scope};
use crate::value::Value;
use crate::CallbackResult;

/// Propagating notification. `emit` events can be stopped; both kinds carry
/// a default-prevented flag for the caller to inspect.
pub struct Event {
    name: String,
    target: Scope,
    current: Option<Scope>,
    stop: bool,
    prevented: bool,
}

impl Event {
    fn new(name: &str, target: Scope) -> Self {
        Self {
            name: name.to_string(),
            target,
            current: None,
            stop: false,
            prevented: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope the event was emitted or broadcast from.
    pub fn target_scope(&self) -> &Scope {
        &self.target
    }

    /// Scope whose listeners are currently firing; `None` once propagation
    /// has finished.
    pub fn current_scope(&self) -> Option<&Scope> {
        self.current.as_ref()
    }

    /// Halts upward propagation after the current scope's listeners finish.
    /// Only meaningful during `emit`; `broadcast` ignores it.
    pub fn stop_propagation(&mut self) {
        self.stop = true;
    }

    pub fn prevent_default(&mut self) {
        self.prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.prevented
    }
}

pub(crate) type EventCallback =
    Rc<RefCell<Box<dyn FnMut(&mut Event, &[Value]) -> CallbackResult>>>;

pub(crate) struct ListenerSlot {
    pub(crate) id: u64,
    pub(crate) callback: EventCallback,
}

/// Deregistration handle returned by [`Scope::on`]. Deregistering twice is
/// a no-op.
pub struct ListenerHandle {
    engine: Weak<EngineInner>,
    scope: ScopeId,
    name: String,
    id: u64,
}

impl ListenerHandle {
    fn inert() -> Self {
        Self {
            engine: Weak::new(),
            scope: ScopeId::dead(),
            name: String::new(),
            id: 0,
        }
    }

    pub fn deregister(&self) {
        let Some(engine) = self.engine.upgrade() else { return };
        let removed = {
            let mut scopes = engine.scopes.borrow_mut();
            match scopes.get_mut(self.scope) {
                Some(node) => match node.listeners.get_mut(&self.name) {
                    Some(slots) => {
                        // Tombstone, never splice: an event cycle may be
                        // iterating this list right now.
                        match slots
                            .iter_mut()
                            .find(|slot| slot.as_ref().map(|s| s.id) == Some(self.id))
                        {
                            Some(slot) => {
                                *slot = None;
                                true
                            }
                            None => false,
                        }
                    }
                    None => false,
                },
                None => false,
            }
        };
        if removed {
            engine.adjust_listener_counts(self.scope, &self.name, -1);
        }
    }
}

impl EngineInner {
    /// Invokes every live listener for `name` on one scope. Each call is
    /// exception-isolated; tombstones laid down mid-cycle are honored.
    fn dispatch_listeners(
        &self,
        scope: ScopeId,
        name: &str,
        event: &mut Event,
        args: &[Value],
    ) {
        let entries: Vec<(u64, EventCallback)> = {
            let scopes = self.scopes.borrow();
            match scopes.get(scope).and_then(|node| node.listeners.get(name)) {
                Some(slots) => slots
                    .iter()
                    .flatten()
                    .map(|slot| (slot.id, Rc::clone(&slot.callback)))
                    .collect(),
                None => return,
            }
        };
        for (id, callback) in entries {
            let still_registered = {
                let scopes = self.scopes.borrow();
                scopes
                    .get(scope)
                    .and_then(|node| node.listeners.get(name))
                    .map(|slots| slots.iter().flatten().any(|slot| slot.id == id))
                    .unwrap_or(false)
            };
            if !still_registered {
                continue;
            }
            match callback.try_borrow_mut() {
                Ok(mut listener) => {
                    if let Err(error) = (*listener)(event, args) {
                        self.sink.report(error);
                    }
                }
                Err(_) => self
                    .sink
                    .report(Box::from(format!("listener for {name:?} re-entered"))),
            }
        }
    }
}

impl Scope {
    /// Registers a listener for `name`, bumping the aggregate listener
    /// count on this scope and every ancestor.
    pub fn on(
        &self,
        name: &str,
        listener: impl FnMut(&mut Event, &[Value]) -> CallbackResult + 'static,
    ) -> ListenerHandle {
        if !self.alive() {
            return ListenerHandle::inert();
        }
        let id = self.engine.take_listener_id();
        {
            let mut scopes = self.engine.scopes.borrow_mut();
            let Some(node) = scopes.get_mut(self.id) else {
                return ListenerHandle::inert();
            };
            node.listeners
                .entry(name.to_string())
                .or_default()
                .push(Some(ListenerSlot {
                    id,
                    callback: Rc::new(RefCell::new(Box::new(listener))),
                }));
        }
        self.engine.adjust_listener_counts(self.id, name, 1);
        ListenerHandle {
            engine: Rc::downgrade(&self.engine),
            scope: self.id,
            name: name.to_string(),
            id,
        }
    }

    /// Dispatches `name` upward: this scope first, then each ancestor in
    /// leaf-to-root order, stopping early when a listener calls
    /// [`Event::stop_propagation`].
    pub fn emit(&self, name: &str, args: &[Value]) -> Event {
        let mut event = Event::new(name, self.clone());
        if !self.alive() {
            return event;
        }
        let mut current = self.id;
        loop {
            event.current = Some(Scope::from_parts(Rc::clone(&self.engine), current));
            self.engine.dispatch_listeners(current, name, &mut event, args);
            if event.stop {
                event.current = None;
                return event;
            }
            let parent = {
                let scopes = self.engine.scopes.borrow();
                scopes.get(current).and_then(|node| node.parent)
            };
            match parent {
                Some(parent_id) if self.engine.scopes.borrow().contains(parent_id) => {
                    current = parent_id;
                }
                _ => break,
            }
        }
        event.current = None;
        event
    }

    /// Dispatches `name` downward through the subtree in pre-order.
    /// Branches whose aggregate listener count for `name` is zero are
    /// skipped entirely; a zero count on this scope short-circuits the
    /// whole call.
    pub fn broadcast(&self, name: &str, args: &[Value]) -> Event {
        let mut event = Event::new(name, self.clone());
        if !self.alive() {
            return event;
        }
        let any_listeners = {
            let scopes = self.engine.scopes.borrow();
            scopes
                .get(self.id)
                .map(|node| node.listener_count_for(name) > 0)
                .unwrap_or(false)
        };
        if !any_listeners {
            return event;
        }
        let mut current = self.id;
        loop {
            let snapshot = {
                let scopes = self.engine.scopes.borrow();
                scopes.get(current).map(Links::of)
            };
            event.current = Some(Scope::from_parts(Rc::clone(&self.engine), current));
            self.engine.dispatch_listeners(current, name, &mut event, args);
            let next = {
                let scopes = self.engine.scopes.borrow();
                match scopes.get(current) {
                    Some(node) => next_in_traversal(
                        &scopes,
                        current,
                        self.id,
                        Links::of(node),
                        node.listener_count_for(name) > 0,
                    ),
                    None => snapshot.and_then(|links| {
                        next_in_traversal(&scopes, current, self.id, links, false)
                    }),
                }
            };
            match next {
                Some(next_id) => current = next_id,
                None => break,
            }
        }
        event.current = None;
        event
    }
}
