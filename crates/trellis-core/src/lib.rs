#![doc = r"Hierarchical reactive scope tree with a dirty-checking digest runtime.

Scopes form a tree under a single [`Engine`]. Watchers observe values on a
scope, a digest re-evaluates them to a fixed point, and events propagate up
(`emit`) or down (`broadcast`) the tree. Everything runs on one thread;
deferred work goes through a pluggable [`MacrotaskScheduler`]."]

mod arena;
pub mod collections;
mod digest;
mod engine;
mod event;
mod expr;
mod platform;
mod scope;
mod value;
mod watch;

#[cfg(test)]
mod tests;

pub use arena::ScopeId;
pub use engine::{DigestError, Engine, EngineHandle, Phase, DEFAULT_TTL};
pub use event::{Event, ListenerHandle};
pub use expr::{CompiledExpr, ExpressionEvaluator, PathEvaluator, WatchDelegate};
pub use platform::{
    CollectingSink, DeferHandle, ExceptionSink, LogSink, MacrotaskScheduler, ManualScheduler,
};
pub use scope::Scope;
pub use value::{
    deep_equals, reference_equals, shallow_copy, values_equal, EqualityMode, Value,
};
pub use watch::{WatchGroupHandle, WatchHandle};

/// Error type carried by fallible user callbacks. Reported to the engine's
/// [`ExceptionSink`]; never aborts a digest or an event cycle.
pub type CallbackError = Box<dyn std::error::Error>;

pub type CallbackResult = Result<(), CallbackError>;

/// Watch getter: evaluates the observed value against a scope. Infallible;
/// watch expressions that can fail should resolve to [`Value::Null`].
pub type WatchGetter = std::rc::Rc<dyn Fn(&Scope) -> Value>;

/// Watch listener: `(new, old, scope)`. On the first firing `old` is the
/// new value.
pub type WatchListener = Box<dyn FnMut(&Value, &Value, &Scope) -> CallbackResult>;
