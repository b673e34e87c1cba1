use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::test_engine;
use crate::{DigestError, EqualityMode, Value, WatchHandle};

#[test]
fn first_firing_reports_new_value_as_old() {
    let (engine, _, sink) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));

    let calls: Rc<RefCell<Vec<(Value, Value)>>> = Rc::new(RefCell::new(Vec::new()));
    let calls_for_listener = Rc::clone(&calls);
    root.watch(
        "a",
        move |new, old, _| {
            calls_for_listener.borrow_mut().push((new.clone(), old.clone()));
            Ok(())
        },
        EqualityMode::Reference,
    );

    root.digest().unwrap();
    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(calls.borrow()[0], (Value::num(1.0), Value::num(1.0)));

    // stable value: no refire
    root.digest().unwrap();
    assert_eq!(calls.borrow().len(), 1);

    root.set("a", Value::num(2.0));
    root.digest().unwrap();
    assert_eq!(calls.borrow().len(), 2);
    assert_eq!(calls.borrow()[1], (Value::num(2.0), Value::num(1.0)));
    assert!(sink.is_empty());
}

#[test]
fn listener_writes_are_picked_up_by_the_next_pass() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));
    root.set("b", Value::num(0.0));

    root.watch(
        "a",
        |new, _, scope| {
            scope.set("b", new.clone());
            Ok(())
        },
        EqualityMode::Reference,
    );
    let b_fires = Rc::new(Cell::new(0));
    let b_fires_for_listener = Rc::clone(&b_fires);
    root.watch(
        "b",
        move |_, _, _| {
            b_fires_for_listener.set(b_fires_for_listener.get() + 1);
            Ok(())
        },
        EqualityMode::Reference,
    );

    root.digest().unwrap();
    assert_eq!(root.get("b"), Some(Value::num(1.0)));
    // b fired for its initial value and again for the propagated write
    assert_eq!(b_fires.get(), 2);
}

#[test]
fn non_convergence_fails_after_exactly_ttl_iterations() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    root.set("counter", Value::num(0.0));

    let fires = Rc::new(Cell::new(0u32));
    let fires_for_listener = Rc::clone(&fires);
    let handle = root.watch(
        "counter",
        move |new, _, scope| {
            fires_for_listener.set(fires_for_listener.get() + 1);
            let n = new.as_num().unwrap_or(0.0);
            scope.set("counter", Value::num(n + 1.0));
            Ok(())
        },
        EqualityMode::Reference,
    );

    let err = root.digest().unwrap_err();
    assert_eq!(fires.get(), 10);
    match &err {
        DigestError::NonConverging { ttl, watch_log } => {
            assert_eq!(*ttl, 10);
            assert_eq!(watch_log.len(), 5);
            assert!(watch_log.iter().all(|iteration| iteration.len() == 1));
        }
        other => panic!("expected NonConverging, got {other}"),
    }

    // the phase guard was released: the engine digests again once stable
    handle.deregister();
    root.digest().unwrap();
}

#[test]
fn custom_ttl_bounds_the_loop() {
    let (engine, _, _) = test_engine();
    engine.set_ttl(3);
    let root = engine.root();
    root.set("counter", Value::num(0.0));

    let fires = Rc::new(Cell::new(0u32));
    let fires_for_listener = Rc::clone(&fires);
    root.watch(
        "counter",
        move |new, _, scope| {
            fires_for_listener.set(fires_for_listener.get() + 1);
            let n = new.as_num().unwrap_or(0.0);
            scope.set("counter", Value::num(n + 1.0));
            Ok(())
        },
        EqualityMode::Reference,
    );

    let err = root.digest().unwrap_err();
    assert_eq!(fires.get(), 3);
    match err {
        DigestError::NonConverging { ttl, watch_log } => {
            assert_eq!(ttl, 3);
            assert_eq!(watch_log.len(), 3);
        }
        other => panic!("expected NonConverging, got {other}"),
    }
}

#[test]
fn failing_listener_does_not_starve_the_others() {
    let (engine, _, sink) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));
    root.set("b", Value::num(1.0));
    root.set("c", Value::num(1.0));

    let fired = Rc::new(RefCell::new(Vec::new()));
    for key in ["a", "b", "c"] {
        let fired_for_listener = Rc::clone(&fired);
        root.watch(
            key,
            move |_, _, _| {
                fired_for_listener.borrow_mut().push(key);
                if key == "b" {
                    return Err(Box::from("b exploded"));
                }
                Ok(())
            },
            EqualityMode::Reference,
        );
    }

    root.digest().unwrap();
    // registration order a, b, c; most recent runs first
    assert_eq!(*fired.borrow(), vec!["c", "b", "a"]);
    assert_eq!(sink.messages(), vec!["b exploded".to_string()]);
}

#[test]
fn clean_pass_short_circuits_at_the_last_dirty_watcher() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));
    root.set("b", Value::num(1.0));
    root.set("c", Value::num(1.0));

    let mut evals = Vec::new();
    for key in ["a", "b", "c"] {
        let count = Rc::new(Cell::new(0u32));
        let count_for_get = Rc::clone(&count);
        root.watch_fn(
            move |scope| {
                count_for_get.set(count_for_get.get() + 1);
                scope.get(key).unwrap_or(Value::Null)
            },
            |_, _, _| Ok(()),
            EqualityMode::Reference,
        );
        evals.push(count);
    }

    root.digest().unwrap();
    for count in &evals {
        count.set(0);
    }

    // run order is c, b, a; only b changes, so the second pass stops at b
    // without re-evaluating a
    root.set("b", Value::num(2.0));
    root.digest().unwrap();
    assert_eq!(evals[0].get(), 1); // a
    assert_eq!(evals[1].get(), 2); // b
    assert_eq!(evals[2].get(), 2); // c
}

#[test]
fn digest_and_apply_reject_reentry() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));

    let saw_reentrancy = Rc::new(Cell::new(false));
    let saw_for_listener = Rc::clone(&saw_reentrancy);
    root.watch(
        "a",
        move |_, _, scope| {
            match scope.digest() {
                Err(DigestError::Reentrancy { .. }) => saw_for_listener.set(true),
                other => panic!("expected reentrancy error, got {other:?}"),
            }
            assert!(matches!(
                scope.apply(|_| Ok(())),
                Err(DigestError::Reentrancy { .. })
            ));
            Ok(())
        },
        EqualityMode::Reference,
    );

    root.digest().unwrap();
    assert!(saw_reentrancy.get());
}

#[test]
fn listener_may_deregister_itself_mid_digest() {
    let (engine, _, sink) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));

    let fires = Rc::new(Cell::new(0u32));
    let slot: Rc<RefCell<Option<WatchHandle>>> = Rc::new(RefCell::new(None));
    let fires_for_listener = Rc::clone(&fires);
    let slot_for_listener = Rc::clone(&slot);
    let handle = root.watch(
        "a",
        move |_, _, _| {
            fires_for_listener.set(fires_for_listener.get() + 1);
            if let Some(handle) = slot_for_listener.borrow_mut().take() {
                handle.deregister();
            }
            Ok(())
        },
        EqualityMode::Reference,
    );
    *slot.borrow_mut() = Some(handle);

    root.digest().unwrap();
    root.set("a", Value::num(2.0));
    root.digest().unwrap();
    assert_eq!(fires.get(), 1);
    assert_eq!(root.watcher_count(), 0);
    assert!(sink.is_empty());
}

#[test]
fn listener_may_deregister_an_earlier_watcher_mid_digest() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));

    let victim_fires = Rc::new(Cell::new(0u32));
    let victim_fires_for_listener = Rc::clone(&victim_fires);
    let victim = root.watch(
        "a",
        move |_, _, _| {
            victim_fires_for_listener.set(victim_fires_for_listener.get() + 1);
            Ok(())
        },
        EqualityMode::Reference,
    );

    // registered later, runs first, removes the victim before its turn
    let victim_for_listener = victim.clone();
    root.watch(
        "a",
        move |_, _, _| {
            victim_for_listener.deregister();
            Ok(())
        },
        EqualityMode::Reference,
    );

    root.digest().unwrap();
    assert_eq!(victim_fires.get(), 0);
    assert_eq!(root.watcher_count(), 1);
}

#[test]
fn watcher_added_mid_digest_runs_before_convergence() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));
    root.set("b", Value::num(1.0));

    let late_fires = Rc::new(Cell::new(0u32));
    let late_fires_outer = Rc::clone(&late_fires);
    let installed = Cell::new(false);
    root.watch(
        "a",
        move |_, _, scope| {
            if !installed.replace(true) {
                let late_fires_for_listener = Rc::clone(&late_fires_outer);
                scope.watch(
                    "b",
                    move |_, _, _| {
                        late_fires_for_listener.set(late_fires_for_listener.get() + 1);
                        Ok(())
                    },
                    EqualityMode::Reference,
                );
            }
            Ok(())
        },
        EqualityMode::Reference,
    );

    root.digest().unwrap();
    assert_eq!(late_fires.get(), 1);
}

#[test]
fn reference_mode_misses_in_place_mutation_deep_mode_sees_it() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    let list = Value::list(vec![Value::num(1.0)]);
    root.set("items", list.clone());

    let ref_fires = Rc::new(Cell::new(0u32));
    let ref_fires_for_listener = Rc::clone(&ref_fires);
    root.watch(
        "items",
        move |_, _, _| {
            ref_fires_for_listener.set(ref_fires_for_listener.get() + 1);
            Ok(())
        },
        EqualityMode::Reference,
    );

    let deep_calls: Rc<RefCell<Vec<(Value, Value)>>> = Rc::new(RefCell::new(Vec::new()));
    let deep_calls_for_listener = Rc::clone(&deep_calls);
    root.watch(
        "items",
        move |new, old, _| {
            deep_calls_for_listener
                .borrow_mut()
                .push((new.clone(), old.clone()));
            Ok(())
        },
        EqualityMode::Deep,
    );

    root.digest().unwrap();
    assert_eq!(ref_fires.get(), 1);
    assert_eq!(deep_calls.borrow().len(), 1);

    // same Rc, mutated in place
    list.push(Value::num(2.0));
    root.digest().unwrap();
    assert_eq!(ref_fires.get(), 1);
    assert_eq!(deep_calls.borrow().len(), 2);
    let (new, old) = deep_calls.borrow()[1].clone();
    assert_eq!(new, Value::list(vec![Value::num(1.0), Value::num(2.0)]));
    // the old value is the snapshot taken before the mutation
    assert_eq!(old, Value::list(vec![Value::num(1.0)]));
}

#[test]
fn constant_expression_fires_once_and_removes_itself() {
    let (engine, _, _) = test_engine();
    let root = engine.root();

    let calls: Rc<RefCell<Vec<(Value, Value)>>> = Rc::new(RefCell::new(Vec::new()));
    let calls_for_listener = Rc::clone(&calls);
    root.watch(
        "42",
        move |new, old, _| {
            calls_for_listener.borrow_mut().push((new.clone(), old.clone()));
            Ok(())
        },
        EqualityMode::Reference,
    );
    assert_eq!(root.watcher_count(), 1);

    root.digest().unwrap();
    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(calls.borrow()[0], (Value::num(42.0), Value::num(42.0)));
    assert_eq!(root.watcher_count(), 0);

    root.digest().unwrap();
    assert_eq!(calls.borrow().len(), 1);
}

#[test]
fn digest_covers_watcher_bearing_descendants_only_from_the_target() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    let child = root.new_child(false);
    let sibling = root.new_child(false);
    root.set("a", Value::num(1.0));

    let child_fires = Rc::new(Cell::new(0u32));
    let child_fires_for_listener = Rc::clone(&child_fires);
    child.watch(
        "a",
        move |_, _, _| {
            child_fires_for_listener.set(child_fires_for_listener.get() + 1);
            Ok(())
        },
        EqualityMode::Reference,
    );
    let sibling_fires = Rc::new(Cell::new(0u32));
    let sibling_fires_for_listener = Rc::clone(&sibling_fires);
    sibling.watch(
        "a",
        move |_, _, _| {
            sibling_fires_for_listener.set(sibling_fires_for_listener.get() + 1);
            Ok(())
        },
        EqualityMode::Reference,
    );

    // digesting one child leaves the sibling untouched
    child.digest().unwrap();
    assert_eq!(child_fires.get(), 1);
    assert_eq!(sibling_fires.get(), 0);

    // digesting the root covers both
    root.digest().unwrap();
    assert_eq!(child_fires.get(), 1);
    assert_eq!(sibling_fires.get(), 1);
}

#[test]
fn destroying_a_scope_mid_digest_skips_its_subtree() {
    let (engine, _, _) = test_engine();
    let root = engine.root();
    root.set("a", Value::num(1.0));
    let doomed = root.new_child(false);
    doomed.set("x", Value::num(1.0));

    let doomed_fires = Rc::new(Cell::new(0u32));
    let doomed_fires_for_listener = Rc::clone(&doomed_fires);
    doomed.watch(
        "x",
        move |_, _, _| {
            doomed_fires_for_listener.set(doomed_fires_for_listener.get() + 1);
            Ok(())
        },
        EqualityMode::Reference,
    );

    // root watcher runs before the traversal descends and tears the child down
    let doomed_for_listener = doomed.clone();
    root.watch(
        "a",
        move |_, _, _| {
            doomed_for_listener.destroy();
            Ok(())
        },
        EqualityMode::Reference,
    );

    root.digest().unwrap();
    assert_eq!(doomed_fires.get(), 0);
    assert!(doomed.is_destroyed());
}
