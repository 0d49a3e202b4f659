// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;

use carom::error::Error;
use carom::resource::{PoolResource, ResourceFactory};
use carom::resource_pool::types::{PoolHooks, PoolOptions, PoolState};
use carom::resource_pool::Pool;

#[derive(Debug)]
pub struct TestError(String);

impl fmt::Display for TestError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl std::error::Error for TestError {}

#[derive(Default)]
struct FactoryState {
    created: usize,
    pings: usize,
    disposed: Vec<String>,
    destroyed: Vec<String>,
}

// A scripted factory. Resources are strings named from `names` (or
// "r<n>" once the list runs out); the other knobs steer individual calls.
struct TestFactory {
    state: Arc<Mutex<FactoryState>>,
    names: Vec<&'static str>,
    create_delays: Vec<u64>,
    fail_first_creates: usize,
    block_creates_after: Option<usize>,
    ping_fail_on: Vec<usize>,
    dispose_delay: u64,
}

impl TestFactory {
    fn new(state: &Arc<Mutex<FactoryState>>) -> Self {
        TestFactory {
            state: Arc::clone(state),
            names: Vec::new(),
            create_delays: Vec::new(),
            fail_first_creates: 0,
            block_creates_after: None,
            ping_fail_on: Vec::new(),
            dispose_delay: 0,
        }
    }
}

impl ResourceFactory for TestFactory {
    type Resource = String;
    type Error = TestError;

    fn create(&self) -> Result<String, TestError> {
        let call = {
            let mut state = self.state.lock().unwrap();
            state.created += 1;
            state.created
        };
        if call <= self.fail_first_creates {
            return Err(TestError(format!("create {} failed", call)));
        }
        if let Some(after) = self.block_creates_after {
            if call > after {
                loop {
                    thread::park();
                }
            }
        }
        if let Some(&delay) = self
            .create_delays
            .get(call - 1)
            .or_else(|| self.create_delays.last())
        {
            thread::sleep(Duration::from_millis(delay));
        }
        Ok(self
            .names
            .get(call - 1)
            .map(|name| String::from(*name))
            .unwrap_or_else(|| format!("r{}", call)))
    }

    fn dispose(&self, resource: &mut String) -> Result<(), TestError> {
        if self.dispose_delay > 0 {
            thread::sleep(Duration::from_millis(self.dispose_delay));
        }
        self.state.lock().unwrap().disposed.push(resource.clone());
        Ok(())
    }

    fn ping(&self, _resource: &mut String) -> Result<(), TestError> {
        let call = {
            let mut state = self.state.lock().unwrap();
            state.pings += 1;
            state.pings
        };
        if self.ping_fail_on.contains(&call) {
            Err(TestError(format!("ping {} failed", call)))
        } else {
            Ok(())
        }
    }

    fn destroy(&self, resource: &mut String) {
        self.state.lock().unwrap().destroyed.push(resource.clone());
    }
}

fn acquire_wait(
    pool: &Pool<TestFactory>,
    timeout_ms: u64,
) -> Result<PoolResource<String>, Error> {
    let (tx, rx) = channel();
    pool.acquire(move |result| {
        let _ = tx.send(result);
    });
    rx.recv_timeout(Duration::from_millis(timeout_ms))
        .expect("acquire did not complete in time")
}

fn wait_for<P>(timeout_ms: u64, mut predicate: P) -> bool
where
    P: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn max_bound_is_honored() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        max: Some(1),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    let first_name = first.clone();

    let (tx, rx) = channel();
    let started = Instant::now();
    pool.acquire(move |result| {
        let _ = tx.send((Instant::now(), result));
    });

    let releaser = pool.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        releaser.release(first);
    });

    let (fulfilled_at, result) =
        rx.recv_timeout(Duration::from_millis(2000)).unwrap();
    let second = result.unwrap();
    assert_eq!(*second, first_name);
    assert!(fulfilled_at.duration_since(started) >= Duration::from_millis(90));
    assert_eq!(state.lock().unwrap().created, 1);
}

#[test]
fn failed_ping_replaces_the_resource() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let mut factory = TestFactory::new(&state);
    factory.ping_fail_on = vec![3];
    let options = PoolOptions {
        min: Some(1),
        max: Some(1),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    let first_name = first.clone();
    pool.release(first);

    let second = acquire_wait(&pool, 2000).unwrap();
    assert_eq!(*second, first_name);
    pool.release(second);

    let third = acquire_wait(&pool, 2000).unwrap();
    assert_ne!(*third, first_name);
    assert!(state.lock().unwrap().disposed.contains(&first_name));
}

#[test]
fn late_factory_resource_is_disposed() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let mut factory = TestFactory::new(&state);
    factory.names = vec!["bar", "foo"];
    factory.create_delays = vec![0, 400];
    factory.block_creates_after = Some(2);
    let options = PoolOptions {
        max: Some(2),
        acquire_timeout: Some(100),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let (tx1, rx1) = channel();
    pool.acquire(move |result| {
        let _ = tx1.send(result);
    });
    pool.acquire(|_result| {});

    let first = rx1
        .recv_timeout(Duration::from_millis(2000))
        .unwrap()
        .unwrap();
    assert_eq!(*first, String::from("bar"));

    assert!(wait_for(2000, || {
        state.lock().unwrap().disposed.contains(&String::from("foo"))
    }));
    let state = state.lock().unwrap();
    assert!(!state.disposed.contains(&String::from("bar")));
    assert!(state.destroyed.is_empty());
}

#[test]
fn end_waits_for_outstanding_resources() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        min: Some(1),
        max: Some(2),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    let second = acquire_wait(&pool, 2000).unwrap();

    let (tx, rx) = channel();
    pool.end(move |result| {
        assert!(result.is_ok());
        let _ = tx.send(Instant::now());
    });

    // Nothing has been released yet, so the end callback must not fire.
    assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());

    let started = Instant::now();
    let releaser = pool.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        releaser.release(first);
    });
    let releaser = pool.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        releaser.release(second);
    });

    let ended_at = rx.recv_timeout(Duration::from_millis(2000)).unwrap();
    assert!(ended_at.duration_since(started) >= Duration::from_millis(90));
    assert_eq!(state.lock().unwrap().disposed.len(), 2);
    assert_eq!(pool.state(), PoolState::Destroyed);
}

#[test]
fn destroy_pool_rejects_pending_requests() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let mut factory = TestFactory::new(&state);
    factory.block_creates_after = Some(0);
    let options = PoolOptions {
        max: Some(1),
        acquire_timeout: Some(0),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let (tx, rx) = channel();
    pool.acquire(move |result| {
        let _ = tx.send(result);
    });

    thread::sleep(Duration::from_millis(50));
    pool.destroy_pool();

    let result = rx.recv_timeout(Duration::from_millis(1000)).unwrap();
    match result {
        Err(error) => {
            assert_eq!(format!("{}", error), "Pool was destroyed")
        }
        Ok(_) => panic!("acquire unexpectedly succeeded"),
    }
    assert_eq!(pool.state(), PoolState::Destroyed);
}

#[test]
fn idle_resources_are_reaped_to_min() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        min: Some(1),
        max: Some(3),
        idle_timeout: Some(10),
        sync_interval: Some(10),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    let second = acquire_wait(&pool, 2000).unwrap();
    pool.release(first);
    pool.release(second);

    assert!(wait_for(1000, || {
        u32::from(pool.stats().allocated) == 1
    }));
    assert_eq!(state.lock().unwrap().disposed.len(), 1);
}

#[test]
fn requests_are_served_in_admission_order() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        max: Some(1),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = channel();
    for i in 1..=3 {
        let releaser = pool.clone();
        let order = Arc::clone(&order);
        let tx = tx.clone();
        pool.acquire(move |result| {
            let resource = result.unwrap();
            order.lock().unwrap().push(i);
            releaser.release(resource);
            let _ = tx.send(i);
        });
    }

    pool.release(first);
    for _ in 0..3 {
        rx.recv_timeout(Duration::from_millis(2000)).unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn full_queue_rejects_new_requests() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let mut factory = TestFactory::new(&state);
    factory.block_creates_after = Some(0);
    let options = PoolOptions {
        max: Some(1),
        max_requests: Some(1),
        acquire_timeout: Some(0),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    pool.acquire(|_result| {});
    thread::sleep(Duration::from_millis(20));

    let result = acquire_wait(&pool, 1000);
    match result {
        Err(error) => assert_eq!(format!("{}", error), "Pool is full"),
        Ok(_) => panic!("acquire unexpectedly succeeded"),
    }
}

#[test]
fn acquire_is_rejected_while_ending() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        max: Some(1),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();

    let (tx, rx) = channel();
    pool.end(move |result| {
        let _ = tx.send(result);
    });

    let rejected = acquire_wait(&pool, 1000);
    match rejected {
        Err(error) => assert_eq!(format!("{}", error), "Pool is ending"),
        Ok(_) => panic!("acquire unexpectedly succeeded"),
    }

    pool.release(first);
    rx.recv_timeout(Duration::from_millis(2000)).unwrap().unwrap();

    let rejected = acquire_wait(&pool, 1000);
    match rejected {
        Err(error) => assert_eq!(format!("{}", error), "Pool is destroyed"),
        Ok(_) => panic!("acquire unexpectedly succeeded"),
    }
}

#[test]
fn aborted_request_is_skipped_and_resource_reused() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        max: Some(1),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    let first_name = first.clone();

    let (tx_b, rx_b) = channel();
    let waiting = pool.acquire(move |result| {
        let _ = tx_b.send(result);
    });
    let (tx_c, rx_c) = channel();
    pool.acquire(move |result| {
        let _ = tx_c.send(result);
    });

    waiting.abort(None);
    let aborted = rx_b.recv_timeout(Duration::from_millis(1000)).unwrap();
    match aborted {
        Err(error) => {
            assert_eq!(format!("{}", error), "aborted: No reason given")
        }
        Ok(_) => panic!("aborted request was fulfilled"),
    }

    pool.release(first);
    let third = rx_c
        .recv_timeout(Duration::from_millis(2000))
        .unwrap()
        .unwrap();
    assert_eq!(*third, first_name);
}

#[test]
fn queued_request_times_out() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        max: Some(1),
        request_timeout: Some(50),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let _held = acquire_wait(&pool, 2000).unwrap();

    let (tx, rx) = channel();
    let started = Instant::now();
    pool.acquire(move |result| {
        let _ = tx.send((Instant::now(), result));
    });
    let (rejected_at, result) =
        rx.recv_timeout(Duration::from_millis(2000)).unwrap();
    match result {
        Err(error) => assert_eq!(format!("{}", error), "timed out"),
        Ok(_) => panic!("request should have timed out"),
    }
    assert!(rejected_at.duration_since(started) >= Duration::from_millis(40));
}

#[test]
fn invalid_options_are_rejected() {
    fn config_error(options: PoolOptions<String>) -> String {
        let state = Arc::new(Mutex::new(FactoryState::default()));
        match Pool::new(options, TestFactory::new(&state)) {
            Err(Error::Config(message)) => message,
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("construction unexpectedly succeeded"),
        }
    }

    let message = config_error(PoolOptions {
        max: Some(0),
        ..PoolOptions::default()
    });
    assert!(message.contains("must be"));

    let message = config_error(PoolOptions {
        min: Some(5),
        max: Some(2),
        ..PoolOptions::default()
    });
    assert!(message.contains("cannot be"));

    let message = config_error(PoolOptions {
        max_requests: Some(0),
        ..PoolOptions::default()
    });
    assert!(message.contains("must be"));

    let message = config_error(PoolOptions {
        sync_interval: Some(0),
        idle_timeout: Some(5),
        ..PoolOptions::default()
    });
    assert!(message.contains("cannot be"));

    let message = config_error(PoolOptions {
        request_timeout: Some(0),
        ..PoolOptions::default()
    });
    assert!(message.contains("must be"));

    let message = config_error(PoolOptions {
        ping_timeout: Some(0),
        ..PoolOptions::default()
    });
    assert!(message.contains("must be"));
}

#[test]
fn stats_track_allocation() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        max: Some(2),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let stats = pool.stats();
    assert_eq!(u32::from(stats.allocated), 0);
    assert_eq!(u32::from(stats.available), 2);
    assert_eq!(u32::from(stats.queued), 0);

    let first = acquire_wait(&pool, 2000).unwrap();
    let stats = pool.stats();
    assert_eq!(u32::from(stats.allocated), 1);
    assert_eq!(u32::from(stats.available), 1);

    pool.release(first);
    let stats = pool.stats();
    assert_eq!(u32::from(stats.allocated), 1);
    assert_eq!(u32::from(stats.available), 2);
}

#[test]
fn remove_disposes_gracefully() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        max: Some(1),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    let first_name = first.clone();

    let (tx, rx) = channel();
    pool.remove_with_callback(first, move |result| {
        let _ = tx.send(result);
    });
    rx.recv_timeout(Duration::from_millis(2000)).unwrap().unwrap();
    assert!(state.lock().unwrap().disposed.contains(&first_name));
    assert_eq!(u32::from(pool.stats().allocated), 0);
}

#[test]
fn destroy_forces_teardown() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);
    let options = PoolOptions {
        max: Some(1),
        sync_interval: Some(0),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    let first_name = first.clone();
    pool.destroy(first);

    assert!(wait_for(1000, || {
        state.lock().unwrap().destroyed.contains(&first_name)
    }));
    let state = state.lock().unwrap();
    assert!(state.disposed.is_empty());
}

#[test]
fn dispose_timeout_falls_back_to_destroy() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let mut factory = TestFactory::new(&state);
    factory.dispose_delay = 200;
    let options = PoolOptions {
        max: Some(1),
        dispose_timeout: Some(50),
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    let first_name = first.clone();

    let (tx, rx) = channel();
    pool.remove_with_callback(first, move |result| {
        let _ = tx.send(result);
    });
    let result = rx.recv_timeout(Duration::from_millis(2000)).unwrap();
    match result {
        Err(Error::Timeout(_)) => {}
        other => panic!("expected a timeout, got {:?}", other),
    }

    // The dispose keeps running; once it returns, the destroy fallback
    // fires on the same value.
    assert!(wait_for(2000, || {
        state.lock().unwrap().destroyed.contains(&first_name)
    }));
    assert!(state.lock().unwrap().disposed.contains(&first_name));
}

#[test]
fn initial_failures_destroy_the_pool_after_bail() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let mut factory = TestFactory::new(&state);
    factory.fail_first_creates = usize::max_value();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = Arc::clone(&errors);
    let mut hooks = PoolHooks::default();
    hooks.on_error = Some(Box::new(move |error| {
        errors_clone.lock().unwrap().push(format!("{}", error));
    }));

    let options = PoolOptions {
        min: Some(1),
        max: Some(1),
        bail_after: Some(50),
        backoff: Some(ExponentialBackoff {
            initial_interval: Duration::from_millis(10),
            ..ExponentialBackoff::default()
        }),
        hooks,
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    assert!(wait_for(5000, || pool.state() == PoolState::Destroyed));
    let errors = errors.lock().unwrap();
    assert!(!errors.is_empty());
    assert!(errors
        .iter()
        .any(|message| message.contains("initial allocation failed")));
}

#[test]
fn foreign_release_without_a_hook_leaves_the_pool_live() {
    let state_one = Arc::new(Mutex::new(FactoryState::default()));
    let state_two = Arc::new(Mutex::new(FactoryState::default()));
    let pool_one = Pool::new(
        PoolOptions {
            max: Some(1),
            ..PoolOptions::default()
        },
        TestFactory::new(&state_one),
    )
    .unwrap();
    let pool_two = Pool::new(
        PoolOptions {
            max: Some(1),
            ..PoolOptions::default()
        },
        TestFactory::new(&state_two),
    )
    .unwrap();

    let keeper = acquire_wait(&pool_two, 2000).unwrap();
    pool_two.release(keeper);

    let foreign = acquire_wait(&pool_one, 2000).unwrap();
    let foreign_name = foreign.clone();
    // No on_error hook is installed; the usage error must not change
    // pool state.
    pool_two.release(foreign);

    assert_eq!(pool_two.state(), PoolState::Live);
    // The stray value is routed through pool_two's destroy operation
    // rather than silently dropped.
    assert!(wait_for(2000, || {
        state_two.lock().unwrap().destroyed.contains(&foreign_name)
    }));
    assert_eq!(pool_one.state(), PoolState::Live);

    // The pool keeps serving after the misuse.
    let again = acquire_wait(&pool_two, 2000).unwrap();
    assert_eq!(u32::from(pool_two.stats().allocated), 1);
    pool_two.release(again);
}

#[test]
fn foreign_handles_emit_usage_errors_on_every_path() {
    let state_one = Arc::new(Mutex::new(FactoryState::default()));
    let state_two = Arc::new(Mutex::new(FactoryState::default()));
    let pool_one = Pool::new(
        PoolOptions {
            max: Some(3),
            ..PoolOptions::default()
        },
        TestFactory::new(&state_one),
    )
    .unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = Arc::clone(&errors);
    let mut hooks = PoolHooks::default();
    hooks.on_error = Some(Box::new(move |error| {
        errors_clone.lock().unwrap().push(format!("{}", error));
    }));
    let pool_two = Pool::new(
        PoolOptions {
            max: Some(1),
            hooks,
            ..PoolOptions::default()
        },
        TestFactory::new(&state_two),
    )
    .unwrap();

    let released = acquire_wait(&pool_one, 2000).unwrap();
    let released_name = released.clone();
    let removed = acquire_wait(&pool_one, 2000).unwrap();
    let removed_name = removed.clone();
    let destroyed = acquire_wait(&pool_one, 2000).unwrap();
    let destroyed_name = destroyed.clone();

    pool_two.release(released);
    pool_two.remove(removed);
    pool_two.destroy(destroyed);

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 3);
    assert!(errors
        .iter()
        .all(|message| message.contains("is not a member of this pool")));
    // Usage errors leave the pool exactly where it was.
    assert_eq!(pool_two.state(), PoolState::Initial);

    // Each stray value still goes through a teardown operation: release
    // and destroy force it, remove disposes it gracefully.
    assert!(wait_for(2000, || {
        let state = state_two.lock().unwrap();
        state.destroyed.contains(&released_name)
            && state.destroyed.contains(&destroyed_name)
            && state.disposed.contains(&removed_name)
    }));
    assert_eq!(pool_one.state(), PoolState::Live);
}

#[test]
fn request_and_drain_hooks_fire() {
    let state = Arc::new(Mutex::new(FactoryState::default()));
    let factory = TestFactory::new(&state);

    let admitted = Arc::new(Mutex::new(0usize));
    let drained = Arc::new(Mutex::new(0usize));
    let admitted_clone = Arc::clone(&admitted);
    let drained_clone = Arc::clone(&drained);
    let mut hooks = PoolHooks::default();
    hooks.on_request = Some(Box::new(move |_request| {
        *admitted_clone.lock().unwrap() += 1;
    }));
    hooks.on_drain = Some(Box::new(move || {
        *drained_clone.lock().unwrap() += 1;
    }));

    let options = PoolOptions {
        max: Some(1),
        hooks,
        ..PoolOptions::default()
    };
    let pool = Pool::new(options, factory).unwrap();

    let first = acquire_wait(&pool, 2000).unwrap();
    assert_eq!(*admitted.lock().unwrap(), 1);

    pool.release(first);
    assert!(wait_for(1000, || *drained.lock().unwrap() >= 1));
}
