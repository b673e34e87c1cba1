use std::rc::Rc;

use crate::{CollectingSink, Engine, ManualScheduler, PathEvaluator};

mod digest_tests;

/// Engine wired to a manually flushed scheduler and a collecting sink, so
/// tests control the macrotask boundary and inspect reported exceptions.
fn test_engine() -> (Engine, Rc<ManualScheduler>, Rc<CollectingSink>) {
    let scheduler = Rc::new(ManualScheduler::new());
    let sink = Rc::new(CollectingSink::new());
    let engine = Engine::new(
        Rc::clone(&scheduler) as Rc<dyn crate::MacrotaskScheduler>,
        Rc::clone(&sink) as Rc<dyn crate::ExceptionSink>,
        Rc::new(PathEvaluator::new()),
    );
    (engine, scheduler, sink)
}
