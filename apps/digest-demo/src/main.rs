use std::rc::Rc;

use trellis_core::{Engine, EqualityMode, LogSink, ManualScheduler, PathEvaluator, Value};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    println!("=== Trellis digest demo ===");
    println!();

    let scheduler = Rc::new(ManualScheduler::new());
    let engine = Engine::new(
        Rc::clone(&scheduler) as Rc<dyn trellis_core::MacrotaskScheduler>,
        Rc::new(LogSink),
        Rc::new(PathEvaluator::new()),
    );
    let root = engine.root();

    root.set("user", {
        let user = Value::map();
        user.insert("first", Value::str("Ada"));
        user.insert("last", Value::str("Lovelace"));
        user
    });

    // recompute the greeting whenever either name part changes
    root.watch_group_exprs(&["user.first", "user.last"], |new, _, scope| {
        let first = new[0].as_str().unwrap_or_else(|| Rc::from("?"));
        let last = new[1].as_str().unwrap_or_else(|| Rc::from("?"));
        scope.set("greeting", Value::str(format!("Hello, {first} {last}!")));
        Ok(())
    });
    root.watch(
        "greeting",
        |new, _, _| {
            println!("greeting is now {new}");
            Ok(())
        },
        EqualityMode::Reference,
    );

    let session = root.new_child(false);
    session.on("logout", |event, _| {
        println!(
            "logout requested from {:?}",
            event.target_scope().serial()
        );
        Ok(())
    });

    root.digest().expect("initial digest");

    println!("--- renaming the user ---");
    root.apply(|scope| {
        if let Some(user) = scope.get("user") {
            user.insert("first", Value::str("Grace"));
            user.insert("last", Value::str("Hopper"));
        }
        Ok(())
    })
    .expect("apply");

    println!("--- emitting logout from a grandchild ---");
    let widget = session.new_child(false);
    widget.emit("logout", &[]);

    println!("--- tearing the session down ---");
    session.destroy();
    widget.emit("logout", &[]); // stale handle, silently ignored

    // run the macrotask queue the way a host loop would
    root.eval_async(|scope| {
        println!("deferred task sees greeting {:?}", scope.get("greeting"));
        Ok(())
    });
    log::info!("flushing deferred work");
    scheduler.run_due();
}
