//! Collaborator traits the engine consumes from its host.
//!
//! The digest engine never owns a clock or a task loop; it asks the host to
//! defer work past the current call stack and to absorb exceptions raised by
//! user callbacks. Both seams are traits so embedders can plug their own
//! event loop in. Reference implementations live here as well: a manually
//! flushed scheduler (the test/demo workhorse) and a `log`-backed sink.

use std::cell::RefCell;

use crate::CallbackError;

/// Identifies a deferred macrotask so it can be canceled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeferHandle(u64);

impl DeferHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Defers work off the current call stack.
///
/// The engine uses this for the `eval_async` fallback digest and for the
/// `apply_async` coalescing window. Everything runs on the one engine
/// thread; implementations are not expected to be `Send`.
pub trait MacrotaskScheduler {
    fn defer(&self, task: Box<dyn FnOnce()>) -> DeferHandle;

    /// Cancels a previously deferred task. Returns false when the task
    /// already ran or was never known.
    fn cancel(&self, handle: DeferHandle) -> bool;
}

/// Receives every exception caught inside watcher listeners, async tasks,
/// post-digest callbacks, and event listeners.
pub trait ExceptionSink {
    fn report(&self, error: CallbackError);
}

/// Scheduler whose queue is flushed explicitly by the host loop.
///
/// Tests and the demo app drive the macrotask boundary by calling
/// [`ManualScheduler::run_due`] wherever a real host would yield.
pub struct ManualScheduler {
    tasks: RefCell<Vec<(u64, Box<dyn FnOnce()>)>>,
    next_id: std::cell::Cell<u64>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(Vec::new()),
            next_id: std::cell::Cell::new(1),
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Runs every task that was queued before this call. Tasks deferred
    /// while running stay queued for the next flush.
    pub fn run_due(&self) -> usize {
        let due: Vec<u64> = self.tasks.borrow().iter().map(|(id, _)| *id).collect();
        let mut ran = 0;
        for id in due {
            let task = {
                let mut tasks = self.tasks.borrow_mut();
                tasks
                    .iter()
                    .position(|(tid, _)| *tid == id)
                    .map(|pos| tasks.remove(pos).1)
            };
            if let Some(task) = task {
                task();
                ran += 1;
            }
        }
        ran
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MacrotaskScheduler for ManualScheduler {
    fn defer(&self, task: Box<dyn FnOnce()>) -> DeferHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.tasks.borrow_mut().push((id, task));
        DeferHandle::new(id)
    }

    fn cancel(&self, handle: DeferHandle) -> bool {
        let mut tasks = self.tasks.borrow_mut();
        match tasks.iter().position(|(id, _)| *id == handle.value()) {
            Some(pos) => {
                tasks.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Forwards caught exceptions to the `log` facade.
pub struct LogSink;

impl ExceptionSink for LogSink {
    fn report(&self, error: CallbackError) {
        log::error!("uncaught exception in scope callback: {error}");
    }
}

/// Stores reported exceptions for later inspection.
pub struct CollectingSink {
    messages: RefCell<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            messages: RefCell::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.borrow().is_empty()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionSink for CollectingSink {
    fn report(&self, error: CallbackError) {
        self.messages.borrow_mut().push(error.to_string());
    }
}
