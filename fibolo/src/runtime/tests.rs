use super::*;
use crate as fibolo;
use crate::task::{self, STACK_SIZE_MIN};
use crate::test_utils::Tracker;
use crate::time::{sleep, yield_now};
use std::time::{Duration, Instant};

#[fibolo::test]
fn test_ready_fibers_run_in_creation_order() {
    let tracker = Tracker::new();

    for event in ["a", "b", "c"] {
        let t = tracker.clone();
        fibolo::spawn(move || t.record(event));
    }
    assert!(tracker.events().is_empty());

    sleep(Duration::from_millis(1)).unwrap();
    assert_eq!(tracker.events(), vec!["a", "b", "c"]);
}

#[fibolo::test]
fn test_spawner_keeps_running_until_it_parks() {
    let tracker = Tracker::new();

    let t = tracker.clone();
    fibolo::spawn(move || t.record("child"));
    tracker.record("parent");

    sleep(Duration::from_millis(1)).unwrap();
    tracker.record("parent again");

    assert_eq!(tracker.events(), vec!["parent", "child", "parent again"]);
}

#[fibolo::test]
fn test_sleeper_resumes_after_busy_fibers() {
    let tracker = Tracker::new();

    let t = tracker.clone();
    fibolo::spawn(move || {
        let started = Instant::now();
        sleep(Duration::from_millis(10)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(10));
        t.record("sleeper");
    });

    for event in ["first", "second"] {
        let t = tracker.clone();
        fibolo::spawn(move || {
            yield_now().unwrap();
            t.record(event);
        });
    }

    sleep(Duration::from_millis(30)).unwrap();
    assert_eq!(tracker.events(), vec!["first", "second", "sleeper"]);
}

#[fibolo::test]
fn test_fiber_ids_are_distinct() {
    let root = task::id();
    assert_eq!(task::try_id(), Some(root));

    let child = fibolo::spawn(move || {
        assert_ne!(task::id(), root);
    });
    assert!(child > root);
    sleep(Duration::from_millis(1)).unwrap();
}

#[fibolo::test]
fn test_tiny_stack_is_rounded_up() {
    let tracker = Tracker::new();

    let t = tracker.clone();
    fibolo::spawn_with_stack(
        move || {
            // Would overflow a stack of the requested size.
            let buf = std::hint::black_box([1u8; STACK_SIZE_MIN / 8]);
            assert_eq!(buf.iter().map(|b| *b as usize).sum::<usize>(), STACK_SIZE_MIN / 8);
            t.record("done");
        },
        1,
    );

    sleep(Duration::from_millis(1)).unwrap();
    assert_eq!(tracker.events(), vec!["done"]);
}

#[test]
fn test_block_on_returns_output() -> anyhow::Result<()> {
    let rt = Builder::new_local().try_build()?;
    assert_eq!(rt.block_on(|| 6 * 7), 42);
    assert_eq!(rt.block_on(|| "again"), "again");
    Ok(())
}

#[test]
fn test_runtime_spawn_before_block_on() -> anyhow::Result<()> {
    let rt = Builder::new_local().try_build()?;
    let tracker = Tracker::new();

    let t = tracker.clone();
    rt.spawn(move || t.record("early"));

    let t = tracker.clone();
    rt.block_on(move || t.record("root"));

    assert_eq!(tracker.events(), vec!["early", "root"]);
    Ok(())
}

#[test]
#[should_panic(expected = "boom")]
fn test_block_on_propagates_panic() {
    let rt = Builder::new_local().try_build().unwrap();
    rt.block_on(|| panic!("boom"));
}

#[test]
#[should_panic(expected = "child failed")]
fn test_panic_in_spawned_fiber_propagates() {
    let rt = Builder::new_local().try_build().unwrap();
    rt.block_on(|| {
        fibolo::spawn(|| panic!("child failed"));
        sleep(Duration::from_millis(10)).unwrap();
    });
}

#[fibolo::test]
#[should_panic(expected = "block_on can't be called from inside a fiber")]
fn test_nested_block_on_panics() {
    fibolo::block_on(|| ());
}

#[test]
fn test_init_is_idempotent() -> anyhow::Result<()> {
    assert!(!is_inited());
    assert!(task::try_id().is_none());

    init()?;
    assert!(is_inited());
    init()?;
    must_init();

    assert!(Builder::new_local().try_build().is_err());
    Ok(())
}

#[test]
#[should_panic]
fn test_spawn_without_runtime_panics() {
    fibolo::spawn(|| ());
}
