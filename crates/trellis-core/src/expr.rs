//! The expression seam: the engine compiles watch expressions through an
//! [`ExpressionEvaluator`], so hosts can plug in a full expression language.
//! [`PathEvaluator`] is the built-in implementation covering dotted property
//! paths and scalar literals.

use std::cell::RefCell;
use std::rc::Rc;

use crate::scope::Scope;
use crate::value::{EqualityMode, Value};
use crate::watch::WatchHandle;
use crate::{WatchGetter, WatchListener};

/// Custom registration strategy attached to a compiled expression. When
/// present, [`Scope::watch`] hands the whole registration to the delegate
/// instead of installing a plain watcher.
pub type WatchDelegate =
    Rc<dyn Fn(&Scope, WatchListener, EqualityMode, &CompiledExpr) -> WatchHandle>;

/// Result of compiling a watch expression.
#[derive(Clone)]
pub struct CompiledExpr {
    pub label: Rc<str>,
    pub eval: WatchGetter,
    pub watch_delegate: Option<WatchDelegate>,
}

impl CompiledExpr {
    pub fn new(label: &str, eval: impl Fn(&Scope) -> Value + 'static) -> Self {
        Self {
            label: Rc::from(label),
            eval: Rc::new(eval),
            watch_delegate: None,
        }
    }

    pub fn with_delegate(mut self, delegate: WatchDelegate) -> Self {
        self.watch_delegate = Some(delegate);
        self
    }
}

pub trait ExpressionEvaluator {
    fn compile(&self, expr: &str) -> CompiledExpr;
}

/// Evaluator for dotted property paths (`user.address.city`) and scalar
/// literals (`null`, booleans, numbers, quoted strings).
///
/// Path lookup starts at the scope's state chain and steps through nested
/// maps; any missing link yields [`Value::Null`]. Literals compile to
/// constants carrying a one-shot watch delegate: the watcher fires once on
/// the next digest and deregisters itself.
pub struct PathEvaluator;

impl PathEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PathEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_literal(expr: &str) -> Option<Value> {
    match expr {
        "null" => return Some(Value::Null),
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    let mut chars = expr.chars();
    match chars.next() {
        Some(first) if first.is_ascii_digit() || first == '-' || first == '.' => {
            if let Ok(n) = expr.parse::<f64>() {
                return Some(Value::Num(n));
            }
        }
        Some(quote @ ('\'' | '"')) if expr.len() >= 2 && expr.ends_with(quote) => {
            return Some(Value::str(&expr[1..expr.len() - 1]));
        }
        _ => {}
    }
    None
}

fn eval_path(scope: &Scope, segments: &[String]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return Value::Null;
    };
    let mut value = match scope.get(first) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        value = match value.get_item(segment) {
            Some(next) => next,
            None => return Value::Null,
        };
    }
    value
}

/// One-shot registration for constant expressions: the watcher fires its
/// listener on the first digest pass and then removes itself.
fn constant_watch_delegate() -> WatchDelegate {
    Rc::new(|scope, mut listener, eq, compiled| {
        let slot: Rc<RefCell<Option<WatchHandle>>> = Rc::new(RefCell::new(None));
        let slot_for_listener = Rc::clone(&slot);
        let handle = scope.watch_inner(
            Rc::clone(&compiled.eval),
            Box::new(move |new_value, old_value, scope| {
                let result = listener(new_value, old_value, scope);
                if let Some(handle) = slot_for_listener.borrow_mut().take() {
                    handle.deregister();
                }
                result
            }),
            eq,
            Rc::clone(&compiled.label),
        );
        *slot.borrow_mut() = Some(handle.clone());
        handle
    })
}

impl ExpressionEvaluator for PathEvaluator {
    fn compile(&self, expr: &str) -> CompiledExpr {
        let trimmed = expr.trim();
        if let Some(constant) = parse_literal(trimmed) {
            return CompiledExpr::new(trimmed, move |_| constant.clone())
                .with_delegate(constant_watch_delegate());
        }
        let segments: Vec<String> = trimmed.split('.').map(str::to_string).collect();
        CompiledExpr::new(trimmed, move |scope| eval_path(scope, &segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    fn compile(expr: &str) -> CompiledExpr {
        PathEvaluator::new().compile(expr)
    }

    #[test]
    fn literals_compile_to_constants() {
        let engine = Engine::with_defaults();
        let root = engine.root();
        assert_eq!(compile("null").eval.as_ref()(&root), Value::Null);
        assert_eq!(compile("true").eval.as_ref()(&root), Value::Bool(true));
        assert_eq!(compile("42.5").eval.as_ref()(&root), Value::Num(42.5));
        assert_eq!(compile("-3").eval.as_ref()(&root), Value::Num(-3.0));
        assert_eq!(compile("'hi'").eval.as_ref()(&root), Value::str("hi"));
        assert!(compile("42.5").watch_delegate.is_some());
        assert!(compile("name").watch_delegate.is_none());
    }

    #[test]
    fn paths_walk_nested_maps() {
        let engine = Engine::with_defaults();
        let root = engine.root();
        let address = Value::map();
        address.insert("city", Value::str("Riga"));
        let user = Value::map();
        user.insert("address", address);
        root.set("user", user);

        let compiled = compile("user.address.city");
        assert_eq!(compiled.eval.as_ref()(&root), Value::str("Riga"));
        assert_eq!(compile("user.missing.city").eval.as_ref()(&root), Value::Null);
        assert_eq!(compile("nobody").eval.as_ref()(&root), Value::Null);
    }

    #[test]
    fn paths_read_through_the_state_chain() {
        let engine = Engine::with_defaults();
        let root = engine.root();
        root.set("greeting", Value::str("hello"));
        let child = root.new_child(false);
        assert_eq!(compile("greeting").eval.as_ref()(&child), Value::str("hello"));

        let isolated = root.new_child(true);
        assert_eq!(compile("greeting").eval.as_ref()(&isolated), Value::Null);
    }
}
