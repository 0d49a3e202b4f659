// Copyright 2020 Joyent, Inc.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use derive_more::{
    Add, AddAssign, Display, From, Into, Sub, SubAssign,
};
use slog::Logger;
use timer::Guard;

use crate::error::Error;
use crate::request::ResourceRequest;
use crate::resource::ResourceId;

/// A newtype wrapper around u32 used for counts of resources maintained by
/// the pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ResourceCount(u32);

/// A point-in-time summary of the pool's accounting.
#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
    /// The configured minimum number of resources.
    pub min: ResourceCount,
    /// The configured maximum number of resources.
    pub max: ResourceCount,
    /// The number of resources currently owned by the pool, idle or loaned.
    pub allocated: ResourceCount,
    /// Remaining headroom including idle resources available for loan:
    /// `max - (allocated - idle)`.
    pub available: ResourceCount,
    /// The number of unfulfilled requests in the queue.
    pub queued: ResourceCount,
    /// The configured request queue cap, if any.
    pub max_requests: Option<ResourceCount>,
}

/// Sum type representing the current state of the pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolState {
    /// The pool has not yet produced a resource. Factory failures here are
    /// fatal once the retry budget is exhausted.
    Initial,
    /// The pool has produced at least one resource and is serving requests.
    Live,
    /// The pool is draining gracefully and no longer admits requests.
    Ending,
    /// The pool is terminated and no longer admits requests.
    Destroyed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolState::Initial => String::from("initial").fmt(fmt),
            PoolState::Live => String::from("live").fmt(fmt),
            PoolState::Ending => String::from("ending").fmt(fmt),
            PoolState::Destroyed => String::from("destroyed").fmt(fmt),
        }
    }
}

/// Callback invoked when a graceful `remove` completes, with the outcome of
/// the user dispose operation.
pub type RemoveCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// Callback invoked when `end` completes. Receives the teardown errors
/// collected while draining, if any.
pub type EndCallback =
    Box<dyn FnOnce(Result<(), Vec<Error>>) + Send + 'static>;

/// Typed hooks for the events a pool emits. Every hook is optional; events
/// are additionally logged through the pool's logger, so an uninstalled
/// hook only means the event is observed in the log alone. Error events
/// never alter pool state by themselves; the fatal startup condition tears
/// the pool down on its own path and is then reported like any other.
pub struct PoolHooks<R: Send + 'static> {
    /// Usage and fatal errors.
    pub on_error: Option<Box<dyn Fn(&Error) + Send + Sync + 'static>>,
    /// Recoverable failures: live factory errors, ping failures, teardown
    /// failures and timeouts.
    pub on_warn: Option<Box<dyn Fn(&Error) + Send + Sync + 'static>>,
    /// The request queue became (or was found) empty.
    pub on_drain: Option<Box<dyn Fn() + Send + Sync + 'static>>,
    /// A request was admitted to the queue.
    pub on_request:
        Option<Box<dyn Fn(&ResourceRequest<R>) + Send + Sync + 'static>>,
    /// The head request was put back to wait after a failed ping.
    pub on_requeue:
        Option<Box<dyn Fn(&ResourceRequest<R>) + Send + Sync + 'static>>,
}

impl<R: Send + 'static> Default for PoolHooks<R> {
    fn default() -> Self {
        PoolHooks {
            on_error: None,
            on_warn: None,
            on_drain: None,
            on_request: None,
            on_requeue: None,
        }
    }
}

/// The configuration options for a carom resource pool. This is required to
/// instantiate a new pool.
///
/// Millisecond knobs follow one convention: `None` selects the default and,
/// where the option supports it, `Some(0)` disables the mechanism.
pub struct PoolOptions<R: Send + 'static> {
    /// Minimum number of resources the pool keeps allocated. Default 0.
    pub min: Option<u32>,
    /// Maximum number of resources, counting allocations in flight.
    /// Default 10; must be at least 1.
    pub max: Option<u32>,
    /// Cap on the request queue. `None` leaves the queue unbounded.
    pub max_requests: Option<u32>,
    /// Deadline in milliseconds for one factory invocation. Default 30000;
    /// 0 disables the deadline.
    pub acquire_timeout: Option<u64>,
    /// Deadline in milliseconds for one dispose invocation, after which the
    /// destroy operation is used as a fallback. Default 30000; 0 disables
    /// the fallback.
    pub dispose_timeout: Option<u64>,
    /// Deadline in milliseconds for one ping invocation. Default 10000.
    pub ping_timeout: Option<u64>,
    /// Idle time in milliseconds beyond which resources above `min` are
    /// reaped. Default 60000. May not be set when `sync_interval` is 0.
    pub idle_timeout: Option<u64>,
    /// Period in milliseconds of the maintenance task that enforces `min`
    /// and reaps idle resources. Default 10000; 0 disables it.
    pub sync_interval: Option<u64>,
    /// Per-request deadline in milliseconds. `None` leaves requests without
    /// a deadline.
    pub request_timeout: Option<u64>,
    /// Budget in milliseconds for retrying the initial allocation before
    /// the pool gives up and destroys itself. `None` retries forever.
    pub bail_after: Option<u64>,
    /// Template for the initial-allocation retry schedule. Its
    /// `max_elapsed_time` is overwritten from `bail_after`.
    pub backoff: Option<ExponentialBackoff>,
    /// Capability tags declared by this pool, matched by a cluster against
    /// the tags a caller requires.
    pub capabilities: Vec<String>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
    /// Event hooks.
    pub hooks: PoolHooks<R>,
}

impl<R: Send + 'static> Default for PoolOptions<R> {
    fn default() -> Self {
        PoolOptions {
            min: None,
            max: None,
            max_requests: None,
            acquire_timeout: None,
            dispose_timeout: None,
            ping_timeout: None,
            idle_timeout: None,
            sync_interval: None,
            request_timeout: None,
            bail_after: None,
            backoff: None,
            capabilities: Vec::new(),
            log: None,
            hooks: PoolHooks::default(),
        }
    }
}

impl<R: Send + 'static> fmt::Debug for PoolOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("max_requests", &self.max_requests)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("dispose_timeout", &self.dispose_timeout)
            .field("ping_timeout", &self.ping_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("sync_interval", &self.sync_interval)
            .field("request_timeout", &self.request_timeout)
            .field("bail_after", &self.bail_after)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

// Validated configuration, immutable for the lifetime of the pool.
#[doc(hidden)]
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min: u32,
    pub max: u32,
    pub max_requests: Option<u32>,
    pub acquire_timeout: Option<Duration>,
    pub dispose_timeout: Option<Duration>,
    pub ping_timeout: Duration,
    pub idle_timeout: Duration,
    pub sync_interval: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub capabilities: Vec<String>,
}

// One resource owned by the pool. `value` is present while the resource is
// idle and absent while it is loaned out or inside a user operation.
#[doc(hidden)]
pub(crate) struct ResourceSlot<R> {
    pub value: Option<R>,
    pub idle_since: Instant,
}

// Which timed operation a pending attempt belongs to.
#[doc(hidden)]
pub(crate) enum AttemptKind {
    Create,
    Ping(ResourceId),
    Dispose,
    Wakeup,
}

// One in-flight timed operation. The entry in the attempt table is the
// one-shot latch for the race between the operation's completion and its
// deadline: whichever side removes the entry first wins, the other takes
// the late path. Dropping the guard cancels the deadline.
#[doc(hidden)]
pub(crate) struct PendingAttempt {
    pub kind: AttemptKind,
    pub callback: Option<RemoveCallback>,
    pub _guard: Option<Guard>,
}

// The internal data structures used to manage the pool. All of it is
// guarded by one mutex; user operations never run under that mutex.
#[doc(hidden)]
pub(crate) struct PoolData<R: Send + 'static> {
    pub state: PoolState,
    pub resources: HashMap<ResourceId, ResourceSlot<R>>,
    pub available: VecDeque<ResourceId>,
    pub requests: VecDeque<ResourceRequest<R>>,
    pub acquiring: u32,
    pub pinging: bool,
    pub disposals: u32,
    pub attempts: HashMap<u64, PendingAttempt>,
    pub sync_guard: Option<Guard>,
    pub end_listeners: Vec<EndCallback>,
    pub end_errors: Vec<Error>,
    pub initial_backoff: ExponentialBackoff,
    pub initial_retrying: bool,
}

impl<R: Send + 'static> PoolData<R> {
    pub fn new(initial_backoff: ExponentialBackoff) -> Self {
        PoolData {
            state: PoolState::Initial,
            resources: HashMap::new(),
            available: VecDeque::new(),
            requests: VecDeque::new(),
            acquiring: 0,
            pinging: false,
            disposals: 0,
            attempts: HashMap::new(),
            sync_guard: None,
            end_listeners: Vec::new(),
            end_errors: Vec::new(),
            initial_backoff,
            initial_retrying: false,
        }
    }
}
