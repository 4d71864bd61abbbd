//! Integration tests for embedded connections.

use dbxlink_core::{
    Arg, Connection, ConnectionConfig, CoreError, ErrorKind, ErrorMode, Key, MemoryEngine, Reply,
    ResultMode, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn open(engine: &MemoryEngine) -> Connection {
    Connection::open(ConnectionConfig::embedded(Arc::new(engine.session()))).unwrap()
}

fn engine_with_thread_functions() -> MemoryEngine {
    let engine = MemoryEngine::new();
    engine.register_function("ThreadName", |_| {
        Ok(Reply::text(thread::current().name().unwrap_or("unnamed")))
    });
    engine.register_function("ThreadId", |_| {
        Ok(Reply::text(format!("{:?}", thread::current().id())))
    });
    engine
}

#[test]
fn transaction_calls_run_on_pinned_thread() {
    let engine = engine_with_thread_functions();
    let conn = open(&engine);
    let name = || conn.function("ThreadName", &[]).unwrap().text();
    let id = || conn.function("ThreadId", &[]).unwrap().text();

    assert!(!name().starts_with("dbxlink-txn"));

    assert_eq!(conn.begin_transaction().unwrap(), 1);
    assert_eq!(name(), "dbxlink-txn-1");
    let outer = id();
    assert_eq!(id(), outer);
    assert_eq!(outer, format!("{:?}", conn.pinned_thread(1).unwrap()));

    assert_eq!(conn.begin_transaction().unwrap(), 2);
    assert_eq!(name(), "dbxlink-txn-2");
    let inner = id();
    assert_ne!(inner, outer);
    assert_eq!(conn.nesting_level().unwrap(), 2);

    assert_eq!(conn.commit().unwrap(), 1);
    assert!(conn.pinned_thread(2).is_none());
    assert_eq!(id(), outer);

    assert_eq!(conn.rollback().unwrap(), 0);
    assert!(conn.pinned_thread(1).is_none());
    assert_eq!(conn.nesting_level().unwrap(), 0);
}

#[test]
fn calls_from_other_threads_are_relayed() {
    let engine = engine_with_thread_functions();
    let conn = open(&engine);
    conn.begin_transaction().unwrap();

    let pinned = format!("{:?}", conn.pinned_thread(1).unwrap());
    let seen: Vec<String> = (0..4)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || conn.function("ThreadId", &[]).unwrap().text())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();
    assert!(seen.iter().all(|s| *s == pinned));

    conn.rollback().unwrap();
}

#[test]
fn nested_rollback_keeps_outer_changes() {
    let engine = MemoryEngine::new();
    let conn = open(&engine);
    let a = Key::new("^Nest").sub("a");
    let b = Key::new("^Nest").sub("b");

    conn.begin_transaction().unwrap();
    conn.set(&a, "outer").unwrap();
    conn.begin_transaction().unwrap();
    conn.set(&b, "inner").unwrap();
    conn.set(&a, "overwritten").unwrap();
    conn.rollback().unwrap();
    assert_eq!(conn.get(&a).unwrap().text(), "outer");
    assert_eq!(conn.get(&b).unwrap().text(), "");
    conn.commit().unwrap();

    assert_eq!(conn.get(&a).unwrap().text(), "outer");
}

#[test]
fn inner_commit_is_undone_by_outer_rollback() {
    let engine = MemoryEngine::new();
    let conn = open(&engine);
    let key = Key::new("^Outer").sub(1);

    conn.begin_transaction().unwrap();
    conn.begin_transaction().unwrap();
    conn.set(&key, "x").unwrap();
    conn.commit().unwrap();
    conn.rollback().unwrap();

    assert_eq!(conn.get(&key).unwrap().text(), "");
}

#[test]
fn commit_without_transaction() {
    let engine = MemoryEngine::new();
    let conn = open(&engine);
    assert!(matches!(conn.commit(), Err(CoreError::NoTransaction)));
    assert!(matches!(conn.rollback(), Err(CoreError::NoTransaction)));
    assert!(conn.is_open());
}

#[test]
fn close_rolls_back_open_transactions() {
    let engine = MemoryEngine::new();
    let key = Key::new("^Abandoned");
    {
        let conn = open(&engine);
        conn.begin_transaction().unwrap();
        conn.begin_transaction().unwrap();
        conn.set(&key, "pending").unwrap();
        conn.close();
        assert!(!conn.is_open());
        assert!(matches!(conn.get(&key), Err(CoreError::Closed)));
        assert!(conn.pinned_thread(1).is_none());
    }
    let other = open(&engine);
    assert_eq!(other.get(&key).unwrap().text(), "");
}

#[test]
fn error_modes() {
    let engine = MemoryEngine::new();
    let raise = open(&engine);
    let err = raise.function("Missing", &[]).unwrap_err();
    assert_eq!(err.engine_error().unwrap().kind, ErrorKind::UnknownFunction);
    assert_eq!(raise.last_error().unwrap(), "<NOROUTINE>Missing");
    assert!(raise.is_open());

    let quiet = Connection::open(
        ConnectionConfig::embedded(Arc::new(engine.session())).with_error_mode(ErrorMode::Return),
    )
    .unwrap();
    let outcome = quiet.function("Missing", &[]).unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::UnknownFunction);
}

#[test]
fn get_of_undefined_is_empty_success() {
    let engine = MemoryEngine::new();
    let conn = open(&engine);
    let outcome = conn.get(&Key::new("^Nothing").sub(1)).unwrap();
    assert!(outcome.ok);
    assert!(outcome.payload.is_empty());
    assert!(conn.last_error().is_none());
}

#[test]
fn deferred_dispatch_uses_pool() {
    let engine = engine_with_thread_functions();
    let conn = Connection::open(
        ConnectionConfig::embedded(Arc::new(engine.session()))
            .with_workers(2)
            .with_deferred(true),
    )
    .unwrap();

    let name = conn.function("ThreadName", &[]).unwrap().text();
    assert!(name.starts_with("dbxlink-worker-"), "ran on {name}");

    let handles: Vec<_> = (0..10)
        .map(|i| {
            conn.spawn_deferred(
                dbxlink_core::Request::new(dbxlink_core::Command::Set)
                    .key(&Key::new("^Deferred").sub(i))
                    .data(i),
            )
            .unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.wait().unwrap().ok);
    }
    assert_eq!(conn.get(&Key::new("^Deferred").sub(9)).unwrap().text(), "9");
}

#[test]
fn deferred_without_workers_is_rejected() {
    let engine = MemoryEngine::new();
    let err = Connection::open(
        ConnectionConfig::embedded(Arc::new(engine.session())).with_deferred(true),
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument { .. }));
}

#[test]
fn unknown_namespace_fails_open() {
    let engine = MemoryEngine::new();
    let err = Connection::open(
        ConnectionConfig::embedded(Arc::new(engine.session())).with_namespace("NOWHERE"),
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::Connection { .. }));
}

#[test]
fn wide_strings_round_trip() {
    let engine = MemoryEngine::new();
    let conn = Connection::open(
        ConnectionConfig::embedded(Arc::new(engine.session())).with_wide_chars(true),
    )
    .unwrap();
    let key = Key::new("^Wide").sub("ключ");
    conn.set(&key, "значение").unwrap();
    assert_eq!(conn.get(&key).unwrap().text(), "значение");
    assert_eq!(conn.next(&Key::new("^Wide").sub("")).unwrap().text(), "ключ");
}

#[test]
fn binary_result_mode() {
    let engine = MemoryEngine::new();
    let conn = Connection::open(
        ConnectionConfig::embedded(Arc::new(engine.session())).with_result_mode(ResultMode::Binary),
    )
    .unwrap();
    let key = Key::new("^Bin");
    conn.set(&key, Arg::Str(vec![0, 159, 146, 150])).unwrap();
    assert_eq!(
        conn.get(&key).unwrap().value(),
        Value::Binary(vec![0, 159, 146, 150])
    );
}

#[test]
fn objects_through_connection() {
    let engine = MemoryEngine::new();
    engine.register_method("Person", "Greet", |object, _| {
        let name = String::from_utf8_lossy(object.property("Name").unwrap_or_default()).into_owned();
        Ok(Reply::text(format!("hello {name}")))
    });
    let conn = open(&engine);

    let person = conn
        .class_method("Person", "%New", &[])
        .unwrap()
        .object_ref()
        .unwrap();
    conn.set_property(person, "Name", "Ada").unwrap();
    assert_eq!(conn.get_property(person, "Name").unwrap().text(), "Ada");
    assert_eq!(conn.invoke_method(person, "Greet", &[]).unwrap().text(), "hello Ada");
    conn.close_object(person).unwrap();

    let err = conn.get_property(person, "Name").unwrap_err();
    assert_eq!(err.engine_error().unwrap().kind, ErrorKind::InvalidObject);
}

#[test]
fn traversal_operations() {
    let engine = MemoryEngine::new();
    let conn = open(&engine);
    for (sub, value) in [(1, "one"), (2, "two"), (3, "three")] {
        conn.set(&Key::new("^Walk").sub(sub), value).unwrap();
    }

    let next = conn.next_data(&Key::new("^Walk").sub(1)).unwrap();
    let parts: Vec<String> = next.blocks().unwrap().iter().map(|v| v.text().into_owned()).collect();
    assert_eq!(parts, ["2", "two"]);

    assert_eq!(conn.previous(&Key::new("^Walk").sub("")).unwrap().text(), "3");
    assert_eq!(conn.defined(&Key::new("^Walk")).unwrap().text(), "10");
    assert_eq!(conn.increment(&Key::new("^Walk").sub(1), 1).unwrap().text(), "1");

    conn.merge(&Key::new("^Copy"), &Key::new("^Walk")).unwrap();
    assert_eq!(conn.get(&Key::new("^Copy").sub(3)).unwrap().text(), "three");
    assert_eq!(conn.directory_next("^Copy").unwrap().text(), "^Walk");

    conn.delete(&Key::new("^Walk")).unwrap();
    assert_eq!(conn.defined(&Key::new("^Walk")).unwrap().text(), "0");
}

#[test]
fn locks_across_connections() {
    let engine = MemoryEngine::new();
    let first = open(&engine);
    let second = open(&engine);
    let key = Key::new("^Lock").sub(1);

    assert_eq!(first.lock(&key, Some(Duration::ZERO)).unwrap().text(), "1");
    assert_eq!(
        second.lock(&key, Some(Duration::from_millis(20))).unwrap().text(),
        "0"
    );
    first.unlock(&key).unwrap();
    assert_eq!(second.lock(&key, Some(Duration::ZERO)).unwrap().text(), "1");
}

#[test]
fn unbounded_lock_timeouts() {
    let engine = MemoryEngine::new();
    let conn = open(&engine);

    let outside = Key::new("^Forever").sub(1);
    assert_eq!(conn.lock(&outside, Some(Duration::MAX)).unwrap().text(), "1");

    conn.begin_transaction().unwrap();
    let inside = Key::new("^Forever").sub(2);
    assert_eq!(conn.lock(&inside, Some(Duration::MAX)).unwrap().text(), "1");
    conn.set(&inside, "v").unwrap();
    assert_eq!(conn.rollback().unwrap(), 0);

    conn.set(&outside, "after").unwrap();
    assert_eq!(conn.get(&outside).unwrap().text(), "after");
    assert!(conn.is_open());
}

#[test]
fn engine_panics_are_contained() {
    let engine = MemoryEngine::new();
    engine.register_function("Explode", |_| -> dbxlink_core::EngineResult<Reply> {
        panic!("engine bug")
    });
    let conn = open(&engine);
    let key = Key::new("^Contained");

    let err = conn.function("Explode", &[]).unwrap_err();
    assert!(matches!(err, CoreError::Panicked { .. }), "got {err:?}");
    assert!(conn.is_open());

    conn.begin_transaction().unwrap();
    conn.set(&key, "pending").unwrap();
    let err = conn.function("Explode", &[]).unwrap_err();
    assert!(matches!(err, CoreError::Panicked { .. }), "got {err:?}");
    assert_eq!(conn.nesting_level().unwrap(), 1);
    assert_eq!(conn.rollback().unwrap(), 0);

    assert_eq!(conn.get(&key).unwrap().text(), "");
    conn.set(&key, "after").unwrap();
    assert_eq!(conn.nesting_level().unwrap(), 0);
}

#[test]
fn transaction_start_waits_for_direct_calls() {
    let engine = MemoryEngine::new();
    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    {
        let entered = Arc::clone(&entered);
        let finished = Arc::clone(&finished);
        engine.register_function("Slow", move |_| {
            entered.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            finished.store(true, Ordering::SeqCst);
            Ok(Reply::empty())
        });
    }
    engine.register_function("Fast", |_| Ok(Reply::text("fast")));
    let conn = open(&engine);

    let slow = {
        let conn = conn.clone();
        thread::spawn(move || conn.function("Slow", &[]))
    };
    while !entered.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    // Both queue behind the slow call; whichever runs after the
    // transaction opens must be relayed rather than called directly.
    let fast = {
        let conn = conn.clone();
        thread::spawn(move || conn.function("Fast", &[]))
    };
    let setter = {
        let conn = conn.clone();
        thread::spawn(move || conn.set(&Key::new("^Race"), "v"))
    };
    thread::sleep(Duration::from_millis(50));

    assert_eq!(conn.begin_transaction().unwrap(), 1);
    assert!(finished.load(Ordering::SeqCst));

    slow.join().unwrap().unwrap();
    assert_eq!(fast.join().unwrap().unwrap().text(), "fast");
    setter.join().unwrap().unwrap();
    assert_eq!(conn.rollback().unwrap(), 0);
    assert!(conn.is_open());
}

#[test]
fn relay_timeout_leaves_transaction_open() {
    let engine = MemoryEngine::new();
    engine.register_function("Slow", |_| {
        thread::sleep(Duration::from_millis(200));
        Ok(Reply::empty())
    });
    let conn = Connection::open(
        ConnectionConfig::embedded(Arc::new(engine.session()))
            .with_relay_timeout(Some(Duration::from_millis(20))),
    )
    .unwrap();

    conn.begin_transaction().unwrap();
    let err = conn.function("Slow", &[]).unwrap_err();
    assert!(matches!(err, CoreError::Timeout { .. }));
    assert!(conn.is_open());

    // Once the slow call drains, the transaction is still usable.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(conn.nesting_level().unwrap(), 1);
    assert_eq!(conn.rollback().unwrap(), 0);
}

#[test]
fn arena_singleton_is_reused() {
    let engine = MemoryEngine::new();
    let conn = open(&engine);
    for i in 0..5 {
        conn.set(&Key::new("^Arena").sub(i), "v").unwrap();
    }
    let stats = conn.arena_stats();
    assert!(stats.reused >= 5);
    assert_eq!(stats.allocated, 1);
}

#[test]
fn server_version_from_engine() {
    let engine = MemoryEngine::with_version("Memory 2.3 (Build 45)");
    let conn = open(&engine);
    let version = conn.server_version().unwrap();
    assert_eq!((version.major, version.minor, version.build), (2, 3, 45));
}
