//! The fixed-point dirty-checking loop and the cooperative scheduling
//! entry points built on it.
//!
//! A digest walks the target scope and its watcher-bearing descendants in
//! depth-first pre-order, re-evaluating every watcher, firing listeners on
//! change, and repeating until a full pass observes no change, with three
//! escape hatches: an O(1) short-circuit on the last dirty watcher, a TTL
//! bounding runaway cascades, and exception isolation so one failing
//! listener never starves the rest.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::arena::ScopeId;
use crate::engine::{AsyncTask, DigestError, EngineInner, Phase, WATCH_LOG_WINDOW};
use crate::scope::{next_in_traversal, Links, Scope};
use crate::value::{values_equal, EqualityMode};
use crate::watch::LastValue;
use crate::CallbackResult;

/// Per-watcher data cloned out of the arena so no borrow is held across the
/// user's getter or listener.
struct WatcherSnapshot {
    id: u64,
    get: crate::WatchGetter,
    listener: crate::watch::SharedWatchListener,
    last: LastValue,
    eq: EqualityMode,
    label: Rc<str>,
}

impl EngineInner {
    pub(crate) fn digest_from(&self, target: ScopeId) -> Result<(), DigestError> {
        self.begin_phase(Phase::Digest)?;

        // A direct root digest supersedes a pending apply_async macrotask:
        // cancel it and drain its queue synchronously so no work is dropped
        // or reordered.
        if target == self.root {
            if let Some(handle) = self.apply_async_handle.take() {
                self.scheduler.cancel(handle);
                self.flush_apply_async();
            }
        }

        self.last_dirty_watch.set(None);
        let ttl = self.ttl.get();
        let mut iterations = 0u32;
        let mut watch_log: VecDeque<Vec<String>> = VecDeque::new();

        loop {
            if iterations == ttl {
                self.clear_phase();
                return Err(DigestError::NonConverging {
                    ttl,
                    watch_log: watch_log.into_iter().collect(),
                });
            }
            iterations += 1;
            log::trace!("digest iteration {iterations} from {target}");

            // Tasks queued before or between passes run strictly before any
            // watcher is re-evaluated; tasks queued during the pass wait for
            // the next one.
            loop {
                let task = self.async_queue.borrow_mut().pop_front();
                let Some(AsyncTask { scope, op }) = task else { break };
                if let Some(scope) = self.scope_for(scope) {
                    if let Err(error) = op(&scope) {
                        self.sink.report(error);
                    }
                }
                // The task may have dirtied anything; the short-circuit
                // marker no longer proves cleanliness.
                self.last_dirty_watch.set(None);
            }

            let record_log = ttl - iterations < WATCH_LOG_WINDOW;
            let mut iteration_log: Vec<String> = Vec::new();
            let mut dirty = false;

            let mut current = target;
            'traverse: loop {
                let snapshot = {
                    let scopes = self.scopes.borrow();
                    scopes.get(current).map(Links::of)
                };

                let mut index = {
                    let scopes = self.scopes.borrow();
                    scopes.get(current).map(|n| n.watchers.len()).unwrap_or(0)
                };
                // Tail-to-head: most-recently-added watchers run first, and
                // a listener deregistering itself or an already-visited
                // watcher cannot shift the entries still to come.
                while index > 0 {
                    index -= 1;
                    let watcher = {
                        let scopes = self.scopes.borrow();
                        let Some(node) = scopes.get(current) else { break };
                        if index >= node.watchers.len() {
                            index = node.watchers.len();
                            continue;
                        }
                        let w = &node.watchers[index];
                        WatcherSnapshot {
                            id: w.id,
                            get: Rc::clone(&w.get),
                            listener: Rc::clone(&w.listener),
                            last: w.last.clone(),
                            eq: w.eq,
                            label: Rc::clone(&w.label),
                        }
                    };

                    let scope = Scope::from_parts(self.strong(), current);
                    let value = (*watcher.get)(&scope);
                    let clean = match &watcher.last {
                        LastValue::Seen(previous) => values_equal(&value, previous, watcher.eq),
                        LastValue::Unset => false,
                    };

                    if !clean {
                        dirty = true;
                        self.last_dirty_watch.set(Some((current, watcher.id)));
                        let stored = if watcher.eq == EqualityMode::Deep {
                            value.deep_copy()
                        } else {
                            value.clone()
                        };
                        {
                            let mut scopes = self.scopes.borrow_mut();
                            if let Some(node) = scopes.get_mut(current) {
                                if let Some(w) =
                                    node.watchers.iter_mut().find(|w| w.id == watcher.id)
                                {
                                    w.last = LastValue::Seen(stored);
                                }
                            }
                        }
                        let old = match watcher.last {
                            LastValue::Seen(previous) => previous,
                            // Sentinel semantics: the first firing reports
                            // the new value as the old one.
                            LastValue::Unset => value.clone(),
                        };
                        if record_log {
                            iteration_log.push(format!("{}: {} != {}", watcher.label, value, old));
                        }
                        match watcher.listener.try_borrow_mut() {
                            Ok(mut listener) => {
                                if let Err(error) = (*listener)(&value, &old, &scope) {
                                    self.sink.report(error);
                                }
                            }
                            Err(_) => self.sink.report(Box::from(format!(
                                "watch listener {} re-entered",
                                watcher.label
                            ))),
                        }
                    } else if self.last_dirty_watch.get() == Some((current, watcher.id)) {
                        // A full loop came back around to the last dirty
                        // watcher without it changing: everything between is
                        // already known clean this round, so the rest of the
                        // pass is redundant.
                        dirty = false;
                        break 'traverse;
                    }
                }

                let next = {
                    let scopes = self.scopes.borrow();
                    match scopes.get(current) {
                        Some(node) => next_in_traversal(
                            &scopes,
                            current,
                            target,
                            Links::of(node),
                            node.watcher_count > 0,
                        ),
                        // Destroyed under us; advance from the pre-pass
                        // snapshot, never descending into the freed subtree.
                        None => snapshot
                            .and_then(|links| next_in_traversal(&scopes, current, target, links, false)),
                    }
                };
                match next {
                    Some(next_id) => current = next_id,
                    None => break,
                }
            }

            if record_log && !iteration_log.is_empty() {
                if watch_log.len() as u32 == WATCH_LOG_WINDOW {
                    watch_log.pop_front();
                }
                watch_log.push_back(iteration_log);
            }

            let pending_async = !self.async_queue.borrow().is_empty();
            if !dirty && !pending_async {
                break;
            }
        }

        self.clear_phase();

        // Post-stabilization callbacks run exactly once, outside the phase
        // guard, so they may safely start a fresh digest.
        loop {
            let callback = self.post_digest_queue.borrow_mut().pop_front();
            let Some(callback) = callback else { break };
            if let Err(error) = callback() {
                self.sink.report(error);
            }
        }
        Ok(())
    }

    pub(crate) fn flush_apply_async(&self) {
        loop {
            let task = self.apply_async_queue.borrow_mut().pop_front();
            let Some(AsyncTask { scope, op }) = task else { break };
            if let Some(scope) = self.scope_for(scope) {
                if let Err(error) = op(&scope) {
                    self.sink.report(error);
                }
            }
        }
        self.apply_async_handle.set(None);
    }

    fn schedule_apply_async(&self) {
        if self.apply_async_handle.get().is_some() {
            return;
        }
        let handle = self.handle();
        let defer = self.scheduler.defer(Box::new(move || {
            let Some(inner) = handle.inner.upgrade() else { return };
            let flusher = Rc::clone(&inner);
            let result = inner.root_scope().apply(move |_| {
                flusher.flush_apply_async();
                Ok(())
            });
            if let Err(error) = result {
                inner.sink.report(Box::new(error));
            }
        }));
        self.apply_async_handle.set(Some(defer));
    }
}

impl Scope {
    /// Runs the dirty-checking loop from this scope downward until the
    /// fixed point, or fails with [`DigestError::NonConverging`] after the
    /// engine's TTL. Inert on a destroyed scope.
    pub fn digest(&self) -> Result<(), DigestError> {
        if !self.alive() {
            return Ok(());
        }
        self.engine.digest_from(self.id)
    }

    /// Evaluates `f` against this scope immediately.
    pub fn eval<R>(&self, f: impl FnOnce(&Scope) -> R) -> R {
        f(self)
    }

    /// Evaluates `f` under the `apply` phase guard, then unconditionally
    /// digests from the root. Errors from `f` go to the exception sink;
    /// digest errors propagate to the caller.
    pub fn apply(&self, f: impl FnOnce(&Scope) -> CallbackResult) -> Result<(), DigestError> {
        if !self.alive() {
            return Ok(());
        }
        self.engine.begin_phase(Phase::Apply)?;
        if let Err(error) = f(self) {
            self.engine.sink.report(error);
        }
        self.engine.clear_phase();
        self.engine.digest_from(self.engine.root)
    }

    /// Queues `f` for evaluation at the start of the next digest pass.
    ///
    /// When queued outside any digest with an empty queue, a macrotask is
    /// armed that digests the root, so a chain of `eval_async` calls runs
    /// even if nobody calls `digest` explicitly.
    pub fn eval_async(&self, f: impl FnOnce(&Scope) -> CallbackResult + 'static) {
        if !self.alive() {
            return;
        }
        let arm_digest =
            self.engine.phase.get().is_none() && self.engine.async_queue.borrow().is_empty();
        if arm_digest {
            let handle = self.engine.handle();
            self.engine.scheduler.defer(Box::new(move || {
                let Some(inner) = handle.inner.upgrade() else { return };
                if inner.async_queue.borrow().is_empty() {
                    return;
                }
                if let Err(error) = inner.digest_from(inner.root) {
                    inner.sink.report(Box::new(error));
                }
            }));
        }
        self.engine.async_queue.borrow_mut().push_back(AsyncTask {
            scope: self.id,
            op: Box::new(f),
        });
    }

    /// Queues `f` to run inside a future root `apply`. Calls within the
    /// same macrotask tick coalesce into a single flush; a direct root
    /// digest cancels the pending flush and drains the queue synchronously.
    pub fn apply_async(&self, f: impl FnOnce(&Scope) -> CallbackResult + 'static) {
        if !self.alive() {
            return;
        }
        self.engine
            .apply_async_queue
            .borrow_mut()
            .push_back(AsyncTask {
                scope: self.id,
                op: Box::new(f),
            });
        self.engine.schedule_apply_async();
    }

    /// Runs `f` once, after the next digest reaches its fixed point. The
    /// callback executes outside the phase guard and may itself digest.
    pub fn post_digest(&self, f: impl FnOnce() -> CallbackResult + 'static) {
        self.engine.post_digest_queue.borrow_mut().push_back(Box::new(f));
    }
}
