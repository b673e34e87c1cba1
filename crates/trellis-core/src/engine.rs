//! Engine: owner of the scope arena, the scheduling queues, and the
//! single-flight phase guard.
//!
//! Everything is single-threaded. The inner state lives behind one `Rc`;
//! [`Scope`] handles clone that `Rc`, deferred macrotasks hold a [`Weak`]
//! through [`EngineHandle`] so a dropped engine leaves them inert.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::arena::{ScopeArena, ScopeId};
use crate::expr::{ExpressionEvaluator, PathEvaluator};
use crate::platform::{DeferHandle, ExceptionSink, LogSink, MacrotaskScheduler, ManualScheduler};
use crate::scope::{Scope, ScopeNode};
use crate::CallbackResult;

/// Maximum dirty-checking iterations before a digest is declared
/// non-convergent.
pub const DEFAULT_TTL: u32 = 10;

/// Iterations of dirty-watcher labels retained for the non-convergence error.
pub(crate) const WATCH_LOG_WINDOW: u32 = 5;

/// Which re-entrancy-guarded operation is on the call stack.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Digest,
    Apply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Digest => write!(f, "digest"),
            Phase::Apply => write!(f, "apply"),
        }
    }
}

/// Fatal digest failures. Listener errors never surface here; they go to the
/// exception sink and the digest keeps running.
#[derive(Debug)]
pub enum DigestError {
    /// `digest`/`apply` invoked while one was already executing.
    Reentrancy { phase: Phase },
    /// The dirty-check loop failed to reach a fixed point within `ttl`
    /// iterations. `watch_log` holds the dirty watchers of the final
    /// iterations, newest last.
    NonConverging {
        ttl: u32,
        watch_log: Vec<Vec<String>>,
    },
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestError::Reentrancy { phase } => {
                write!(f, "{phase} already in progress")
            }
            DigestError::NonConverging { ttl, watch_log } => {
                write!(
                    f,
                    "{ttl} digest iterations reached; watchers fired in the last {} iterations: ",
                    watch_log.len()
                )?;
                for (i, iteration) in watch_log.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "[{}]", iteration.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for DigestError {}

/// A deferred evaluation bound to the scope that queued it.
pub(crate) struct AsyncTask {
    pub(crate) scope: ScopeId,
    pub(crate) op: Box<dyn FnOnce(&Scope) -> CallbackResult>,
}

pub(crate) type PostDigestTask = Box<dyn FnOnce() -> CallbackResult>;

pub(crate) struct EngineInner {
    /// Self-reference established at construction; lets `&self` methods mint
    /// `Scope` handles and weak `EngineHandle`s.
    weak_self: Weak<EngineInner>,
    pub(crate) scopes: RefCell<ScopeArena>,
    pub(crate) root: ScopeId,
    next_serial: Cell<u64>,
    next_watch_id: Cell<u64>,
    next_listener_id: Cell<u64>,
    pub(crate) phase: Cell<Option<Phase>>,
    pub(crate) ttl: Cell<u32>,
    /// Last watcher seen dirty in the current digest, `(scope, watcher id)`.
    /// Reset whenever watcher list membership changes.
    pub(crate) last_dirty_watch: Cell<Option<(ScopeId, u64)>>,
    pub(crate) async_queue: RefCell<VecDeque<AsyncTask>>,
    pub(crate) apply_async_queue: RefCell<VecDeque<AsyncTask>>,
    pub(crate) apply_async_handle: Cell<Option<DeferHandle>>,
    pub(crate) post_digest_queue: RefCell<VecDeque<PostDigestTask>>,
    pub(crate) scheduler: Rc<dyn MacrotaskScheduler>,
    pub(crate) sink: Rc<dyn ExceptionSink>,
    pub(crate) evaluator: Rc<dyn ExpressionEvaluator>,
}

impl EngineInner {
    pub(crate) fn begin_phase(&self, phase: Phase) -> Result<(), DigestError> {
        if let Some(active) = self.phase.get() {
            return Err(DigestError::Reentrancy { phase: active });
        }
        self.phase.set(Some(phase));
        Ok(())
    }

    pub(crate) fn clear_phase(&self) {
        self.phase.set(None);
    }

    pub(crate) fn take_serial(&self) -> u64 {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        serial
    }

    pub(crate) fn take_watch_id(&self) -> u64 {
        let id = self.next_watch_id.get();
        self.next_watch_id.set(id + 1);
        id
    }

    pub(crate) fn take_listener_id(&self) -> u64 {
        let id = self.next_listener_id.get();
        self.next_listener_id.set(id + 1);
        id
    }

    pub(crate) fn handle(&self) -> EngineHandle {
        EngineHandle {
            inner: self.weak_self.clone(),
        }
    }

    /// Strong self-reference. Every caller reaches this through an `Rc`, so
    /// the upgrade cannot fail.
    pub(crate) fn strong(&self) -> Rc<EngineInner> {
        self.weak_self.upgrade().expect("engine inner is alive")
    }

    pub(crate) fn root_scope(&self) -> Scope {
        Scope::from_parts(self.strong(), self.root)
    }

    /// Scope handle for `id` if the slot is still allocated. Destroyed-but-
    /// not-yet-freed scopes are returned too; callers that must reject those
    /// check the flag themselves.
    pub(crate) fn scope_for(&self, id: ScopeId) -> Option<Scope> {
        if self.scopes.borrow().contains(id) {
            Some(Scope::from_parts(self.strong(), id))
        } else {
            None
        }
    }
}

/// The reactive runtime: one scope tree, one set of queues, one thread.
pub struct Engine {
    inner: Rc<EngineInner>,
}

impl Engine {
    pub fn new(
        scheduler: Rc<dyn MacrotaskScheduler>,
        sink: Rc<dyn ExceptionSink>,
        evaluator: Rc<dyn ExpressionEvaluator>,
    ) -> Self {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(ScopeNode::new(1, None, None));
        Self {
            inner: Rc::new_cyclic(|weak| EngineInner {
                weak_self: weak.clone(),
                scopes: RefCell::new(arena),
                root,
                next_serial: Cell::new(2),
                next_watch_id: Cell::new(1),
                next_listener_id: Cell::new(1),
                phase: Cell::new(None),
                ttl: Cell::new(DEFAULT_TTL),
                last_dirty_watch: Cell::new(None),
                async_queue: RefCell::new(VecDeque::new()),
                apply_async_queue: RefCell::new(VecDeque::new()),
                apply_async_handle: Cell::new(None),
                post_digest_queue: RefCell::new(VecDeque::new()),
                scheduler,
                sink,
                evaluator,
            }),
        }
    }

    /// Engine wired to a [`ManualScheduler`], a [`LogSink`], and the dotted-
    /// path evaluator. Suitable when the host drives digests directly.
    pub fn with_defaults() -> Self {
        Self::new(
            Rc::new(ManualScheduler::new()),
            Rc::new(LogSink),
            Rc::new(PathEvaluator::new()),
        )
    }

    pub fn root(&self) -> Scope {
        self.inner.root_scope()
    }

    pub fn handle(&self) -> EngineHandle {
        self.inner.handle()
    }

    pub fn scheduler(&self) -> Rc<dyn MacrotaskScheduler> {
        Rc::clone(&self.inner.scheduler)
    }

    /// Overrides the digest iteration limit. Panics on zero.
    pub fn set_ttl(&self, ttl: u32) {
        assert!(ttl > 0, "digest TTL must be at least 1");
        self.inner.ttl.set(ttl);
    }
}

/// Weak engine reference for deferred macrotasks.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) inner: Weak<EngineInner>,
}

impl EngineHandle {
    /// Root scope of the engine, if it is still alive.
    pub fn root(&self) -> Option<Scope> {
        self.inner.upgrade().map(|inner| inner.root_scope())
    }
}
