//! End-to-end request scenarios through the public API.

use std::sync::Arc;

use miniprof_core::{
    ManualClock, MemoryStorage, MiniProfiler, Profiler, ProfilerOptions, RequestInfo, Storage,
};
use miniprof_schemas::CustomTiming;
use uuid::Uuid;

fn manual_profiler() -> (MiniProfiler, Arc<MemoryStorage>, ManualClock) {
    let clock = ManualClock::new();
    let storage = Arc::new(MemoryStorage::new());
    let mp = MiniProfiler::with_shared_storage(storage.clone())
        .with_machine_name(|| "test-host".to_string())
        .with_options(ProfilerOptions {
            clock: Arc::new(clock.clone()),
            ..ProfilerOptions::default()
        });
    (mp, storage, clock)
}

fn request() -> RequestInfo {
    RequestInfo::new("GET", "http://localhost/page")
}

#[test]
fn one_step_after_one_millisecond() {
    let (mp, storage, clock) = manual_profiler();
    let id = mp.wrap(&request(), |p| {
        let p = p.expect("enabled");
        clock.advance(1.0);
        p.step("something", |_| clock.advance(5.2));
        p.id()
    });

    let profile = storage.load(&request(), id).unwrap().unwrap();
    assert!(profile.duration_milliseconds >= 6.2);
    let root = &profile.root;
    assert!(
        (root.duration_without_children_milliseconds - (root.duration_milliseconds - 5.2)).abs()
            < 1e-9
    );
    assert_eq!(profile.machine_name, "test-host");
    assert_eq!(profile.name, "GET http://localhost/page");
}

#[test]
fn two_sibling_steps() {
    let (mp, storage, clock) = manual_profiler();
    let id = mp.wrap(&request(), |p| {
        let p = p.expect("enabled");
        p.step("a", |_| clock.advance(2.0));
        p.step("b", |_| clock.advance(5.0));
        p.id()
    });

    let profile = storage.load(&request(), id).unwrap().unwrap();
    let root = &profile.root;
    assert!(
        (root.duration_without_children_milliseconds - (root.duration_milliseconds - 7.0)).abs()
            < 1e-9
    );
    let [a, b] = root.children.as_slice() else {
        panic!("expected two children, got {}", root.children.len());
    };
    assert!((a.start_milliseconds - 0.0).abs() < 1e-9);
    assert!((b.start_milliseconds - 2.0).abs() < 1e-9);
    for leaf in [a, b] {
        assert!(
            (leaf.duration_without_children_milliseconds - leaf.duration_milliseconds).abs()
                < f64::EPSILON
        );
    }
}

#[test]
fn one_custom_timing_inside_a_step() {
    let (mp, storage, _clock) = manual_profiler();
    let id = mp.wrap(&request(), |p| {
        let p = p.expect("enabled");
        p.step("call backend", |p| {
            p.add_custom_timing("RPC", CustomTiming::new(1.0, 5.2));
        });
        p.id()
    });

    let profile = storage.load(&request(), id).unwrap().unwrap();
    let stat = profile.custom_timing_stats["RPC"];
    assert_eq!(stat.count, 1);
    assert!((stat.duration - 5.2).abs() < f64::EPSILON);
    assert_eq!(
        profile.custom_timing_names.iter().filter(|n| *n == "RPC").count(),
        1
    );
}

#[test]
fn unknown_id_is_not_found() {
    let (mp, _storage, _clock) = manual_profiler();
    mp.wrap(&request(), |_| ());
    assert!(mp.load(&request(), Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn out_of_order_close_is_rejected_without_damage() {
    let mut p = Profiler::new("scenario");
    let outer = p.begin_step("outer");
    let inner = p.begin_step("inner");

    let err = p.end_step(&outer).unwrap_err();
    assert!(err.is_step_out_of_order());

    p.end_step(&inner).unwrap();
    p.end_step(&outer).unwrap();
    let profile = p.finalize(None);
    let outer = &profile.root.children[0];
    assert_eq!(outer.name, "outer");
    assert_eq!(outer.children[0].name, "inner");
    assert!(outer.duration_milliseconds >= outer.children[0].duration_milliseconds);
}
