// Copyright 2020 Joyent, Inc.

pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::error::Error;
use crate::request::{chrono_ms, shared_timer, ResourceRequest, SharedTimer};
use crate::resource::{PoolResource, ResourceFactory, ResourceId, ResourceKey};
use crate::resource_pool::types::{
    AttemptKind, PendingAttempt, PoolConfig, PoolData, PoolHooks,
    PoolOptions, PoolState, PoolStats, RemoveCallback, ResourceSlot,
};

// Default size bounds
const DEFAULT_MAX_RESOURCES: u32 = 10;
// Default operation deadlines in milliseconds
const DEFAULT_ACQUIRE_TIMEOUT: u64 = 30_000;
const DEFAULT_DISPOSE_TIMEOUT: u64 = 30_000;
const DEFAULT_PING_TIMEOUT: u64 = 10_000;
// Default idle reap threshold in milliseconds
const DEFAULT_IDLE_TIMEOUT: u64 = 60_000;
// Default maintenance interval in milliseconds
const DEFAULT_SYNC_INTERVAL: u64 = 10_000;
// Delay in milliseconds before allocation is retried after a factory
// failure or timeout in a live pool, so a storm of failing factories does
// not busy-loop.
const ALLOCATION_RETRY_DELAY: u64 = 1_000;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

// Events collected under the pool lock and emitted after it is released,
// so hooks may re-enter the pool.
enum Event<R: Send + 'static> {
    Error(Error),
    Warn(Error),
    Drain,
    Request(ResourceRequest<R>),
    Requeue(ResourceRequest<R>),
}

/// A pool of opaque, expensive-to-create resources
///
/// The pool multiplexes resources produced by a [`ResourceFactory`] across
/// concurrent consumers: `acquire` queues a request and fulfils it FIFO from
/// health-checked resources, `release` returns a loan, a periodic
/// maintenance task enforces the `min` bound and reaps idle resources above
/// it, and `end`/`destroy_pool` drain the pool gracefully or tear it down
/// abruptly. The handle is cheap to clone and may be shared freely across
/// threads.
///
/// [`ResourceFactory`]: ../resource/trait.ResourceFactory.html
pub struct Pool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for Pool<F> {
    fn clone(&self) -> Pool<F> {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> Debug for Pool<F> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let state = self.inner.data.lock().unwrap().state;
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("state", &state)
            .finish()
    }
}

struct PoolInner<F: ResourceFactory> {
    id: u64,
    factory: F,
    config: PoolConfig,
    hooks: PoolHooks<F::Resource>,
    timer: SharedTimer,
    data: Mutex<PoolData<F::Resource>>,
    log: Logger,
    next_resource_id: AtomicU64,
    next_attempt_id: AtomicU64,
}

impl<F: ResourceFactory> Pool<F> {
    /// Create a new pool from validated options and a factory. The pool
    /// starts in the initial state; if `min` is greater than zero the first
    /// allocations begin immediately.
    pub fn new(
        mut options: PoolOptions<F::Resource>,
        factory: F,
    ) -> Result<Pool<F>, Error> {
        let config = validate_options(&options)?;

        let id = NEXT_POOL_ID.fetch_add(1, AtomicOrdering::SeqCst);
        let log = options
            .log
            .take()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("pool" => id));

        let mut initial_backoff = options.backoff.take().unwrap_or_default();
        initial_backoff.max_elapsed_time =
            options.bail_after.map(Duration::from_millis);

        let hooks =
            std::mem::replace(&mut options.hooks, PoolHooks::default());

        let inner = Arc::new(PoolInner {
            id,
            factory,
            config,
            hooks,
            timer: shared_timer(),
            data: Mutex::new(PoolData::new(initial_backoff)),
            log,
            next_resource_id: AtomicU64::new(0),
            next_attempt_id: AtomicU64::new(0),
        });

        info!(
            inner.log,
            "pool created; min {} max {}", inner.config.min, inner.config.max
        );

        if let Some(interval) = inner.config.sync_interval {
            let weak = Arc::downgrade(&inner);
            let guard = inner.timer.lock().unwrap().schedule_repeating(
                chrono_ms(interval),
                move || {
                    if let Some(inner) = weak.upgrade() {
                        sync(&inner);
                    }
                },
            );
            inner.data.lock().unwrap().sync_guard = Some(guard);
        }

        {
            let mut data = inner.data.lock().unwrap();
            ensure_minimum(&inner, &mut data);
        }

        Ok(Pool { inner })
    }

    /// Submit a request for a resource. The returned handle may be used to
    /// abort the request or adjust its deadline; the callback fires exactly
    /// once with the outcome.
    pub fn acquire<C>(&self, callback: C) -> ResourceRequest<F::Resource>
    where
        C: FnOnce(Result<PoolResource<F::Resource>, Error>) + Send + 'static,
    {
        let inner = &self.inner;
        let weak = Arc::downgrade(inner);
        let settled: Box<dyn Fn() + Send + Sync + 'static> =
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    request_settled(&inner);
                }
            });
        let request = ResourceRequest::with_parts(
            Arc::clone(&inner.timer),
            inner.config.request_timeout,
            inner.log.clone(),
            Box::new(callback),
            Some(settled),
        );

        let mut events = Vec::new();
        {
            let mut data = inner.data.lock().unwrap();
            match data.state {
                PoolState::Ending => {
                    request
                        .reject(Error::Shutdown(String::from("Pool is ending")));
                }
                PoolState::Destroyed => {
                    request.reject(Error::Shutdown(String::from(
                        "Pool is destroyed",
                    )));
                }
                PoolState::Initial | PoolState::Live => {
                    data.requests.retain(|r| !r.is_fulfilled());
                    let full = match inner.config.max_requests {
                        Some(cap) => data.requests.len() as u32 >= cap,
                        None => false,
                    };
                    if full {
                        request.reject(Error::Usage(String::from(
                            "Pool is full",
                        )));
                    } else {
                        debug!(
                            inner.log,
                            "request {} admitted; queue depth {}",
                            request.id(),
                            data.requests.len() + 1
                        );
                        events.push(Event::Request(request.clone()));
                        data.requests.push_back(request.clone());
                        dispatch(inner, &mut data, &mut events);
                    }
                }
            }
        }
        emit_events(inner, events);
        request
    }

    /// Return a loaned resource to the pool. The head of the request queue,
    /// if any, is served next.
    pub fn release(&self, resource: PoolResource<F::Resource>) {
        let inner = &self.inner;
        let (key, value) = resource.into_parts();
        let value = match value {
            Some(value) => value,
            None => return,
        };
        if key.pool != inner.id {
            emit_events(
                inner,
                vec![Event::Error(Error::Usage(format!(
                    "resource {} is not a member of this pool",
                    key
                )))],
            );
            spawn_destroy(inner, value);
            return;
        }

        let mut events = Vec::new();
        {
            let mut data = inner.data.lock().unwrap();
            // A second release of the same resource is unrepresentable:
            // the handle is consumed by value, so an outstanding handle
            // always pairs with a vacant slot.
            let accepted = match data.resources.get_mut(&key.id) {
                None => {
                    events.push(Event::Error(Error::Usage(format!(
                        "resource {} is not a member of this pool",
                        key
                    ))));
                    spawn_destroy(inner, value);
                    false
                }
                Some(slot) => {
                    slot.value = Some(value);
                    slot.idle_since = Instant::now();
                    true
                }
            };
            if accepted {
                data.available.push_front(key.id);
                debug!(inner.log, "resource {} released", key.id);
                data.requests.retain(|r| !r.is_fulfilled());
                if data.requests.is_empty() {
                    events.push(Event::Drain);
                    if data.state == PoolState::Ending {
                        begin_teardown(inner, &mut data);
                    }
                } else {
                    dispatch(inner, &mut data, &mut events);
                }
            }
        }
        emit_events(inner, events);
    }

    /// Gracefully take a resource out of the pool through the user dispose
    /// operation.
    pub fn remove(&self, resource: PoolResource<F::Resource>) {
        self.remove_inner(resource, None);
    }

    /// Like [`remove`](#method.remove), reporting the outcome of the
    /// dispose operation to `callback`.
    pub fn remove_with_callback<C>(
        &self,
        resource: PoolResource<F::Resource>,
        callback: C,
    ) where
        C: FnOnce(Result<(), Error>) + Send + 'static,
    {
        self.remove_inner(resource, Some(Box::new(callback)));
    }

    fn remove_inner(
        &self,
        resource: PoolResource<F::Resource>,
        callback: Option<RemoveCallback>,
    ) {
        let inner = &self.inner;
        let (key, value) = resource.into_parts();
        let value = match value {
            Some(value) => value,
            None => return,
        };
        if key.pool != inner.id {
            emit_events(
                inner,
                vec![Event::Error(Error::Usage(format!(
                    "resource {} is not a member of this pool",
                    key
                )))],
            );
            let mut data = inner.data.lock().unwrap();
            start_dispose(inner, &mut data, value, callback);
            return;
        }
        let mut events = Vec::new();
        {
            let mut data = inner.data.lock().unwrap();
            if data.resources.remove(&key.id).is_none() {
                events.push(Event::Error(Error::Usage(format!(
                    "resource {} is not a member of this pool",
                    key
                ))));
            }
            data.available.retain(|&id| id != key.id);
            debug!(inner.log, "removing resource {}", key.id);
            start_dispose(inner, &mut data, value, callback);
        }
        emit_events(inner, events);
    }

    /// Forcefully take a resource out of the pool through the user destroy
    /// operation. Fire-and-forget.
    pub fn destroy(&self, resource: PoolResource<F::Resource>) {
        let inner = &self.inner;
        let (key, value) = resource.into_parts();
        let value = match value {
            Some(value) => value,
            None => return,
        };
        if key.pool != inner.id {
            emit_events(
                inner,
                vec![Event::Error(Error::Usage(format!(
                    "resource {} is not a member of this pool",
                    key
                )))],
            );
            spawn_destroy(inner, value);
            return;
        }
        let mut events = Vec::new();
        {
            let mut data = inner.data.lock().unwrap();
            data.resources.remove(&key.id);
            data.available.retain(|&id| id != key.id);
            debug!(inner.log, "destroying resource {}", key.id);
            spawn_destroy(inner, value);
            ensure_minimum(inner, &mut data);
            dispatch(inner, &mut data, &mut events);
        }
        emit_events(inner, events);
    }

    /// Drain the pool gracefully. Admission stops immediately; queued
    /// requests are allowed to complete, every resource is routed through
    /// the dispose operation as it becomes idle, and `callback` fires once
    /// the pool is empty, with any teardown errors collected on the way.
    pub fn end<C>(&self, callback: C)
    where
        C: FnOnce(Result<(), Vec<Error>>) + Send + 'static,
    {
        let inner = &self.inner;
        let mut data = inner.data.lock().unwrap();
        match data.state {
            PoolState::Destroyed => {
                thread::spawn(move || callback(Ok(())));
            }
            PoolState::Ending => {
                data.end_listeners.push(Box::new(callback));
            }
            PoolState::Initial | PoolState::Live => {
                info!(inner.log, "ending pool");
                data.state = PoolState::Ending;
                data.end_listeners.push(Box::new(callback));
                data.requests.retain(|r| !r.is_fulfilled());
                if data.requests.is_empty() && data.acquiring == 0 {
                    begin_teardown(inner, &mut data);
                }
            }
        }
    }

    /// Terminate the pool abruptly. Queued requests are rejected, idle
    /// resources are routed through the destroy operation, and resources
    /// produced by still-running factory invocations will be disposed on
    /// arrival.
    pub fn destroy_pool(&self) {
        destroy_pool_inner(&self.inner);
    }

    /// A point-in-time summary of the pool's accounting.
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let mut data = inner.data.lock().unwrap();
        data.requests.retain(|r| !r.is_fulfilled());
        let allocated = data.resources.len() as u32;
        let idle = data.available.len() as u32;
        PoolStats {
            min: inner.config.min.into(),
            max: inner.config.max.into(),
            allocated: allocated.into(),
            available: (inner.config.max - (allocated - idle)).into(),
            queued: (data.requests.len() as u32).into(),
            max_requests: inner.config.max_requests.map(Into::into),
        }
    }

    /// The current state of the pool.
    pub fn state(&self) -> PoolState {
        self.inner.data.lock().unwrap().state
    }

    /// The capability tags declared by this pool.
    pub fn capabilities(&self) -> &[String] {
        &self.inner.config.capabilities
    }
}

fn validate_options<R: Send + 'static>(
    options: &PoolOptions<R>,
) -> Result<PoolConfig, Error> {
    let max = options.max.unwrap_or(DEFAULT_MAX_RESOURCES);
    if max < 1 {
        return Err(Error::Config(String::from(
            "max must be a positive integer",
        )));
    }
    let min = options.min.unwrap_or(0);
    if min > max {
        return Err(Error::Config(String::from(
            "min cannot be greater than max",
        )));
    }
    if let Some(0) = options.max_requests {
        return Err(Error::Config(String::from(
            "max_requests must be a positive integer",
        )));
    }
    let ping_timeout = match options.ping_timeout {
        Some(0) => {
            return Err(Error::Config(String::from(
                "ping_timeout must be a positive number of milliseconds",
            )))
        }
        Some(ms) => Duration::from_millis(ms),
        None => Duration::from_millis(DEFAULT_PING_TIMEOUT),
    };
    let sync_interval =
        ms_or_disabled(options.sync_interval, DEFAULT_SYNC_INTERVAL);
    if sync_interval.is_none() && options.idle_timeout.is_some() {
        return Err(Error::Config(String::from(
            "idle_timeout cannot be enforced when sync_interval is 0",
        )));
    }
    let idle_timeout = match options.idle_timeout {
        Some(0) => {
            return Err(Error::Config(String::from(
                "idle_timeout must be a positive number of milliseconds",
            )))
        }
        Some(ms) => Duration::from_millis(ms),
        None => Duration::from_millis(DEFAULT_IDLE_TIMEOUT),
    };
    let request_timeout = match options.request_timeout {
        Some(0) => {
            return Err(Error::Config(String::from(
                "request_timeout must be a positive number of milliseconds",
            )))
        }
        Some(ms) => Some(Duration::from_millis(ms)),
        None => None,
    };
    Ok(PoolConfig {
        min,
        max,
        max_requests: options.max_requests,
        acquire_timeout: ms_or_disabled(
            options.acquire_timeout,
            DEFAULT_ACQUIRE_TIMEOUT,
        ),
        dispose_timeout: ms_or_disabled(
            options.dispose_timeout,
            DEFAULT_DISPOSE_TIMEOUT,
        ),
        ping_timeout,
        idle_timeout,
        sync_interval,
        request_timeout,
        capabilities: options.capabilities.clone(),
    })
}

fn ms_or_disabled(value: Option<u64>, default_ms: u64) -> Option<Duration> {
    match value {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => Some(Duration::from_millis(default_ms)),
    }
}

// Periodic maintenance: enforce the minimum, reap idle resources above it,
// then give dispatch a chance to serve anything still queued.
fn sync<F: ResourceFactory>(inner: &Arc<PoolInner<F>>) {
    let mut events = Vec::new();
    {
        let mut data = inner.data.lock().unwrap();
        match data.state {
            PoolState::Ending | PoolState::Destroyed => return,
            PoolState::Initial | PoolState::Live => {}
        }
        ensure_minimum(inner, &mut data);
        reap(inner, &mut data);
        dispatch(inner, &mut data, &mut events);
    }
    emit_events(inner, events);
}

fn ensure_minimum<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
) {
    loop {
        match data.state {
            PoolState::Initial | PoolState::Live => {}
            PoolState::Ending | PoolState::Destroyed => return,
        }
        if data.resources.len() as u32 + data.acquiring >= inner.config.min {
            return;
        }
        start_create(inner, data);
    }
}

// Walk the available list from the tail, which holds the longest-idle
// resources, and dispose of those past the idle threshold while the pool
// remains above its minimum.
fn reap<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
) {
    let now = Instant::now();
    while data.resources.len() as u32 > inner.config.min {
        let id = match data.available.back() {
            Some(&id) => id,
            None => return,
        };
        let expired = match data.resources.get(&id) {
            Some(slot) => {
                now.duration_since(slot.idle_since) > inner.config.idle_timeout
            }
            None => true,
        };
        if !expired {
            return;
        }
        data.available.pop_back();
        if let Some(slot) = data.resources.remove(&id) {
            if let Some(value) = slot.value {
                debug!(inner.log, "reaping idle resource {}", id);
                start_dispose(inner, data, value, None);
            }
        }
    }
}

// Drop fulfilled requests from the queue. Emits `drain` (and continues an
// in-progress `end`) when the purge empties a previously nonempty queue.
fn purge_requests<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
    events: &mut Vec<Event<F::Resource>>,
) {
    if data.requests.is_empty() {
        return;
    }
    data.requests.retain(|request| !request.is_fulfilled());
    if data.requests.is_empty() {
        events.push(Event::Drain);
        if data.state == PoolState::Ending {
            begin_teardown(inner, data);
        }
    }
}

// The dispatch routine: match queued requests with resources. Serving goes
// through a ping first; at most one ping runs at a time so requests are
// fulfilled strictly in admission order.
fn dispatch<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
    events: &mut Vec<Event<F::Resource>>,
) {
    loop {
        purge_requests(inner, data, events);
        if data.requests.is_empty() || data.pinging {
            return;
        }
        match data.state {
            PoolState::Destroyed => return,
            PoolState::Initial | PoolState::Live | PoolState::Ending => {}
        }
        if let Some(id) = data.available.pop_front() {
            if start_ping(inner, data, id) {
                return;
            }
            continue;
        }
        if data.state == PoolState::Ending {
            return;
        }
        let queued = data.requests.len() as u32;
        let total = data.resources.len() as u32 + data.acquiring;
        if queued > data.acquiring && total < inner.config.max {
            start_create(inner, data);
            continue;
        }
        return;
    }
}

fn next_attempt_id<F: ResourceFactory>(inner: &Arc<PoolInner<F>>) -> u64 {
    inner.next_attempt_id.fetch_add(1, AtomicOrdering::SeqCst)
}

// Begin one factory invocation on its own thread, racing it against
// `acquire_timeout` when that deadline is enabled.
fn start_create<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
) {
    data.acquiring += 1;
    let attempt = next_attempt_id(inner);
    let guard = inner.config.acquire_timeout.map(|timeout| {
        let weak = Arc::downgrade(inner);
        inner.timer.lock().unwrap().schedule_with_delay(
            chrono_ms(timeout),
            move || {
                if let Some(inner) = weak.upgrade() {
                    handle_create_timeout(&inner, attempt);
                }
            },
        )
    });
    data.attempts.insert(
        attempt,
        PendingAttempt {
            kind: AttemptKind::Create,
            callback: None,
            _guard: guard,
        },
    );
    debug!(inner.log, "allocating resource; attempt {}", attempt);
    let worker = Arc::clone(inner);
    thread::spawn(move || {
        let result = worker
            .factory
            .create()
            .map_err(|e| Error::Factory(e.to_string()));
        handle_create_result(&worker, attempt, result);
    });
}

fn handle_create_result<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    attempt: u64,
    result: Result<F::Resource, Error>,
) {
    let mut events = Vec::new();
    {
        let mut data = inner.data.lock().unwrap();
        match data.attempts.remove(&attempt) {
            None => match result {
                // The deadline won the race and the attempt is already
                // accounted for; the resource arrived late and is torn
                // down gracefully rather than dropped.
                Ok(value) => {
                    info!(
                        inner.log,
                        "allocation attempt {} completed after its deadline; \
                         disposing the resource",
                        attempt
                    );
                    start_dispose(inner, &mut data, value, None);
                }
                Err(error) => {
                    debug!(
                        inner.log,
                        "allocation attempt {} failed after its deadline: {}",
                        attempt,
                        error
                    );
                }
            },
            Some(_) => {
                data.acquiring -= 1;
                match result {
                    Ok(value) => match data.state {
                        PoolState::Ending | PoolState::Destroyed => {
                            start_dispose(inner, &mut data, value, None);
                            if data.state == PoolState::Ending
                                && data.requests.is_empty()
                                && data.acquiring == 0
                            {
                                events.push(Event::Drain);
                                begin_teardown(inner, &mut data);
                            }
                        }
                        PoolState::Initial | PoolState::Live => {
                            // The Initial -> Live transition is the latch
                            // separating fatal startup failures from
                            // recoverable runtime ones; it never reverts.
                            if data.state == PoolState::Initial {
                                data.state = PoolState::Live;
                                info!(inner.log, "pool is live");
                            }
                            let id = ResourceId::from(
                                inner
                                    .next_resource_id
                                    .fetch_add(1, AtomicOrdering::SeqCst),
                            );
                            debug!(inner.log, "resource {} allocated", id);
                            data.resources.insert(
                                id,
                                ResourceSlot {
                                    value: Some(value),
                                    idle_since: Instant::now(),
                                },
                            );
                            data.available.push_front(id);
                            dispatch(inner, &mut data, &mut events);
                        }
                    },
                    Err(error) => {
                        note_factory_failure(inner, &mut data, &mut events, error);
                    }
                }
            }
        }
    }
    emit_events(inner, events);
}

fn handle_create_timeout<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    attempt: u64,
) {
    let mut events = Vec::new();
    {
        let mut data = inner.data.lock().unwrap();
        if data.attempts.remove(&attempt).is_none() {
            return;
        }
        data.acquiring -= 1;
        note_factory_failure(
            inner,
            &mut data,
            &mut events,
            Error::Timeout(format!(
                "allocation attempt {} timed out",
                attempt
            )),
        );
    }
    emit_events(inner, events);
}

// A factory invocation failed or timed out. In the initial state the retry
// budget decides between backing off and destroying the pool; in a live
// pool the failure is a warning and allocation is retried after a delay.
fn note_factory_failure<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
    events: &mut Vec<Event<F::Resource>>,
    error: Error,
) {
    match data.state {
        PoolState::Initial => {
            if !data.initial_retrying {
                data.initial_retrying = true;
                data.initial_backoff.reset();
            }
            match data.initial_backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        inner.log,
                        "initial allocation failed; retrying in {:?}: {}",
                        delay,
                        error
                    );
                    events.push(Event::Warn(error));
                    schedule_wakeup(inner, data, delay);
                }
                None => {
                    events.push(Event::Error(Error::Factory(format!(
                        "initial allocation failed beyond the retry budget: {}",
                        error
                    ))));
                    destroy_pool_locked(inner, data);
                }
            }
        }
        PoolState::Live => {
            events.push(Event::Warn(error));
            schedule_wakeup(
                inner,
                data,
                Duration::from_millis(ALLOCATION_RETRY_DELAY),
            );
        }
        PoolState::Ending => {
            events.push(Event::Warn(error));
            if data.requests.is_empty() && data.acquiring == 0 {
                events.push(Event::Drain);
                begin_teardown(inner, data);
            }
        }
        PoolState::Destroyed => {}
    }
}

// Arm a one-shot wakeup that re-runs minimum enforcement and dispatch.
fn schedule_wakeup<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
    delay: Duration,
) {
    let attempt = next_attempt_id(inner);
    let weak = Arc::downgrade(inner);
    let guard = inner
        .timer
        .lock()
        .unwrap()
        .schedule_with_delay(chrono_ms(delay), move || {
            if let Some(inner) = weak.upgrade() {
                wake(&inner, attempt);
            }
        });
    data.attempts.insert(
        attempt,
        PendingAttempt {
            kind: AttemptKind::Wakeup,
            callback: None,
            _guard: Some(guard),
        },
    );
}

fn wake<F: ResourceFactory>(inner: &Arc<PoolInner<F>>, attempt: u64) {
    let mut events = Vec::new();
    {
        let mut data = inner.data.lock().unwrap();
        if data.attempts.remove(&attempt).is_none() {
            return;
        }
        match data.state {
            PoolState::Initial | PoolState::Live => {
                ensure_minimum(inner, &mut data);
                dispatch(inner, &mut data, &mut events);
            }
            PoolState::Ending | PoolState::Destroyed => {}
        }
    }
    emit_events(inner, events);
}

// Health-check an idle resource on its own thread before it is handed to
// the request at the head of the queue. Returns false when the id had no
// value to ping, so dispatch can move on to the next candidate.
fn start_ping<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
    id: ResourceId,
) -> bool {
    let value = match data.resources.get_mut(&id) {
        Some(slot) => slot.value.take(),
        None => None,
    };
    let value = match value {
        Some(value) => value,
        None => return false,
    };
    data.pinging = true;
    let attempt = next_attempt_id(inner);
    let weak = Arc::downgrade(inner);
    let guard = inner.timer.lock().unwrap().schedule_with_delay(
        chrono_ms(inner.config.ping_timeout),
        move || {
            if let Some(inner) = weak.upgrade() {
                handle_ping_timeout(&inner, attempt);
            }
        },
    );
    data.attempts.insert(
        attempt,
        PendingAttempt {
            kind: AttemptKind::Ping(id),
            callback: None,
            _guard: Some(guard),
        },
    );
    debug!(inner.log, "pinging resource {}", id);
    let worker = Arc::clone(inner);
    thread::spawn(move || {
        let mut value = value;
        let result = worker
            .factory
            .ping(&mut value)
            .map_err(|e| Error::Factory(e.to_string()));
        handle_ping_result(&worker, attempt, value, result);
    });
    true
}

fn handle_ping_result<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    attempt: u64,
    value: F::Resource,
    result: Result<(), Error>,
) {
    let mut events = Vec::new();
    {
        let mut data = inner.data.lock().unwrap();
        match data.attempts.remove(&attempt) {
            Some(PendingAttempt {
                kind: AttemptKind::Ping(id),
                ..
            }) => {
                data.pinging = false;
                match result {
                    Ok(()) => {
                        serve_resource(inner, &mut data, &mut events, id, value);
                    }
                    Err(error) => {
                        events.push(Event::Warn(error));
                        data.resources.remove(&id);
                        if let Some(request) = data.requests.front() {
                            events.push(Event::Requeue(request.clone()));
                        }
                        start_dispose(inner, &mut data, value, None);
                        dispatch(inner, &mut data, &mut events);
                    }
                }
            }
            // The ping lost the race with its deadline; the resource is
            // already out of the accounting and goes straight to teardown.
            _ => {
                start_dispose(inner, &mut data, value, None);
            }
        }
    }
    emit_events(inner, events);
}

fn handle_ping_timeout<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    attempt: u64,
) {
    let mut events = Vec::new();
    {
        let mut data = inner.data.lock().unwrap();
        let id = match data.attempts.remove(&attempt) {
            Some(PendingAttempt {
                kind: AttemptKind::Ping(id),
                ..
            }) => id,
            _ => return,
        };
        data.pinging = false;
        data.resources.remove(&id);
        events.push(Event::Warn(Error::Timeout(format!(
            "ping of resource {} timed out",
            id
        ))));
        if let Some(request) = data.requests.front() {
            events.push(Event::Requeue(request.clone()));
        }
        dispatch(inner, &mut data, &mut events);
    }
    emit_events(inner, events);
}

// Hand a health-checked resource to the first request that is still live.
// A request that settled while the ping ran is skipped; if none remains the
// resource goes back to the available list.
fn serve_resource<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
    events: &mut Vec<Event<F::Resource>>,
    id: ResourceId,
    value: F::Resource,
) {
    let mut value = Some(value);
    loop {
        purge_requests(inner, data, events);
        let request = match data.requests.front() {
            Some(request) => request.clone(),
            None => break,
        };
        let resource = PoolResource::new(
            ResourceKey::new(inner.id, id),
            value.take().unwrap(),
        );
        match request.try_resolve(resource) {
            Ok(()) => {
                data.requests.pop_front();
                debug!(
                    inner.log,
                    "resource {} assigned to request {}",
                    id,
                    request.id()
                );
                if data.requests.is_empty() {
                    events.push(Event::Drain);
                    if data.state == PoolState::Ending {
                        begin_teardown(inner, data);
                    }
                }
                dispatch(inner, data, events);
                return;
            }
            Err(stale) => {
                data.requests.pop_front();
                let (_, returned) = stale.into_parts();
                value = returned;
                if value.is_none() {
                    return;
                }
            }
        }
    }
    if let Some(value) = value.take() {
        match data.resources.get_mut(&id) {
            Some(slot) => {
                slot.value = Some(value);
                data.available.push_front(id);
                // An end may have begun while the ping ran; the restored
                // resource has to join the teardown rather than idle.
                if data.state == PoolState::Ending {
                    begin_teardown(inner, data);
                }
            }
            None => start_dispose(inner, data, value, None),
        }
    }
}

// Begin one dispose invocation on its own thread, racing it against
// `dispose_timeout` when enabled. If the deadline fires first the attempt
// is charged then, and the thread runs the destroy fallback as soon as the
// user's dispose returns the value.
fn start_dispose<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
    value: F::Resource,
    callback: Option<RemoveCallback>,
) {
    data.disposals += 1;
    let attempt = next_attempt_id(inner);
    let guard = inner.config.dispose_timeout.map(|timeout| {
        let weak = Arc::downgrade(inner);
        inner.timer.lock().unwrap().schedule_with_delay(
            chrono_ms(timeout),
            move || {
                if let Some(inner) = weak.upgrade() {
                    handle_dispose_timeout(&inner, attempt);
                }
            },
        )
    });
    data.attempts.insert(
        attempt,
        PendingAttempt {
            kind: AttemptKind::Dispose,
            callback,
            _guard: guard,
        },
    );
    let worker = Arc::clone(inner);
    thread::spawn(move || {
        let mut value = value;
        let result = worker
            .factory
            .dispose(&mut value)
            .map_err(|e| Error::Factory(e.to_string()));
        if handle_dispose_result(&worker, attempt, result) {
            worker.factory.destroy(&mut value);
        }
    });
}

// Returns true when the dispose deadline already fired, in which case the
// caller still owns the value and must run the destroy fallback.
fn handle_dispose_result<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    attempt: u64,
    result: Result<(), Error>,
) -> bool {
    let mut events = Vec::new();
    let fallback;
    {
        let mut data = inner.data.lock().unwrap();
        match data.attempts.remove(&attempt) {
            None => fallback = true,
            Some(entry) => {
                fallback = false;
                data.disposals -= 1;
                if let Err(error) = &result {
                    if data.state == PoolState::Ending {
                        data.end_errors.push(error.clone());
                    } else {
                        events.push(Event::Warn(error.clone()));
                    }
                }
                if let Some(callback) = entry.callback {
                    let result = result.clone();
                    thread::spawn(move || callback(result));
                }
                if data.state == PoolState::Live {
                    ensure_minimum(inner, &mut data);
                }
                check_end_complete(inner, &mut data);
            }
        }
    }
    emit_events(inner, events);
    fallback
}

fn handle_dispose_timeout<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    attempt: u64,
) {
    let mut events = Vec::new();
    {
        let mut data = inner.data.lock().unwrap();
        let entry = match data.attempts.remove(&attempt) {
            Some(entry) => entry,
            None => return,
        };
        data.disposals -= 1;
        let error = Error::Timeout(String::from(
            "dispose timed out; forcing destroy",
        ));
        if data.state == PoolState::Ending {
            data.end_errors.push(error.clone());
        }
        events.push(Event::Warn(error.clone()));
        if let Some(callback) = entry.callback {
            thread::spawn(move || callback(Err(error)));
        }
        check_end_complete(inner, &mut data);
    }
    emit_events(inner, events);
}

// Run the user destroy operation on its own thread. Fire-and-forget; a
// panic in user code is reported as a warning.
fn spawn_destroy<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    value: F::Resource,
) {
    let worker = Arc::clone(inner);
    thread::spawn(move || {
        let mut value = value;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            worker.factory.destroy(&mut value);
        }));
        if outcome.is_err() {
            warn!(worker.log, "user destroy operation panicked");
        }
    });
}

// The end-routine proper: stop maintenance and dispose of everything idle.
// Resources on loan are torn down as they are released; completion is
// checked after every teardown.
fn begin_teardown<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
) {
    data.sync_guard.take();
    while let Some(id) = data.available.pop_front() {
        if let Some(slot) = data.resources.remove(&id) {
            if let Some(value) = slot.value {
                debug!(inner.log, "disposing resource {} for shutdown", id);
                start_dispose(inner, data, value, None);
            }
        }
    }
    check_end_complete(inner, data);
}

fn check_end_complete<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
) {
    if data.state != PoolState::Ending {
        return;
    }
    if !data.resources.is_empty()
        || data.disposals > 0
        || data.acquiring > 0
    {
        return;
    }
    data.state = PoolState::Destroyed;
    data.sync_guard.take();
    info!(inner.log, "pool drained; all resources torn down");
    let errors = std::mem::replace(&mut data.end_errors, Vec::new());
    for callback in data.end_listeners.drain(..) {
        let errors = errors.clone();
        thread::spawn(move || {
            if errors.is_empty() {
                callback(Ok(()))
            } else {
                callback(Err(errors))
            }
        });
    }
}

fn destroy_pool_inner<F: ResourceFactory>(inner: &Arc<PoolInner<F>>) {
    let mut data = inner.data.lock().unwrap();
    destroy_pool_locked(inner, &mut data);
}

fn destroy_pool_locked<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    data: &mut PoolData<F::Resource>,
) {
    if data.state == PoolState::Destroyed {
        return;
    }
    info!(inner.log, "destroying pool");
    data.state = PoolState::Destroyed;
    data.sync_guard.take();
    data.pinging = false;
    data.acquiring = 0;
    // In-flight creates and pings become stragglers and their completions
    // are routed to teardown; in-flight disposes are left to finish.
    data.attempts
        .retain(|_, attempt| matches!(attempt.kind, AttemptKind::Dispose));
    for request in data.requests.drain(..) {
        request.reject(Error::Shutdown(String::from("Pool was destroyed")));
    }
    let ids: Vec<ResourceId> = data.available.drain(..).collect();
    for id in ids {
        if let Some(slot) = data.resources.remove(&id) {
            if let Some(value) = slot.value {
                spawn_destroy(inner, value);
            }
        }
    }
    data.resources.clear();
    if !data.end_listeners.is_empty() {
        data.end_errors
            .push(Error::Shutdown(String::from("Pool was destroyed")));
        let errors = std::mem::replace(&mut data.end_errors, Vec::new());
        for callback in data.end_listeners.drain(..) {
            let errors = errors.clone();
            thread::spawn(move || callback(Err(errors)));
        }
    }
}

// A queued request settled outside the dispatch path (timeout or abort);
// purge it and let dispatch move on to the next one.
fn request_settled<F: ResourceFactory>(inner: &Arc<PoolInner<F>>) {
    let mut events = Vec::new();
    {
        let mut data = inner.data.lock().unwrap();
        if data.state == PoolState::Destroyed {
            return;
        }
        dispatch(inner, &mut data, &mut events);
    }
    emit_events(inner, events);
}

fn emit_events<F: ResourceFactory>(
    inner: &Arc<PoolInner<F>>,
    events: Vec<Event<F::Resource>>,
) {
    for event in events {
        match event {
            Event::Error(error) => {
                // Usage errors leave pool state unchanged; the one fatal
                // condition (initial allocation beyond the retry budget)
                // destroys the pool on its own path before emission.
                error!(inner.log, "pool error: {}", error);
                if let Some(hook) = &inner.hooks.on_error {
                    hook(&error);
                }
            }
            Event::Warn(error) => {
                warn!(inner.log, "{}", error);
                if let Some(hook) = &inner.hooks.on_warn {
                    hook(&error);
                }
            }
            Event::Drain => {
                debug!(inner.log, "request queue drained");
                if let Some(hook) = &inner.hooks.on_drain {
                    hook();
                }
            }
            Event::Request(request) => {
                if let Some(hook) = &inner.hooks.on_request {
                    hook(&request);
                }
            }
            Event::Requeue(request) => {
                if let Some(hook) = &inner.hooks.on_requeue {
                    hook(&request);
                }
            }
        }
    }
}
