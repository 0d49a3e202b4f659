// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use slog::{error, o, Drain, Logger};
use timer::Guard;

use crate::error::Error;
use crate::resource::PoolResource;

// One `timer::Timer` runs one scheduler thread. A pool arms every deadline
// it owns, including those of the requests it issues, on a single shared
// scheduler.
pub(crate) type SharedTimer = Arc<Mutex<timer::Timer>>;

pub(crate) fn shared_timer() -> SharedTimer {
    Arc::new(Mutex::new(timer::Timer::new()))
}

pub(crate) fn chrono_ms(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

/// The callback a consumer passes to `acquire`. It is invoked exactly once
/// with the outcome of the request, always from a scheduled context and
/// never synchronously from within a pool or request operation.
pub type AcquireCallback<R> =
    Box<dyn FnOnce(Result<PoolResource<R>, Error>) + Send + 'static>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// The terminal state of a fulfilled request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestOutcome {
    Resolved,
    Rejected,
    Aborted,
}

struct RequestState<R: Send + 'static> {
    callback: Option<AcquireCallback<R>>,
    timer_guard: Option<Guard>,
    outcome: Option<RequestOutcome>,
    on_error: Option<Arc<dyn Fn(&Error) + Send + Sync + 'static>>,
}

struct RequestShared<R: Send + 'static> {
    id: u64,
    created_at: Instant,
    timer: SharedTimer,
    log: Logger,
    on_settled: Option<Box<dyn Fn() + Send + Sync + 'static>>,
    state: Mutex<RequestState<R>>,
}

/// A one-shot, timeout-aware carrier for the outcome of an `acquire` call.
///
/// The request is handed back to the caller of `acquire` so the caller may
/// `abort` it or adjust its deadline while it is queued. Fulfillment is
/// one-shot: the first of resolve, reject, abort, or deadline expiry wins,
/// the callback fires exactly once, and any later fulfillment attempt is
/// reported through the request's `error` hook instead of a second callback
/// invocation.
pub struct ResourceRequest<R: Send + 'static> {
    shared: Arc<RequestShared<R>>,
}

impl<R: Send + 'static> Clone for ResourceRequest<R> {
    fn clone(&self) -> ResourceRequest<R> {
        ResourceRequest {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Send + 'static> ResourceRequest<R> {
    /// Create a standalone request. `timeout` arms a deadline measured from
    /// now; `None` means no deadline. A zero timeout is rejected.
    pub fn new<C>(timeout: Option<Duration>, callback: C) -> Result<Self, Error>
    where
        C: FnOnce(Result<PoolResource<R>, Error>) + Send + 'static,
    {
        if let Some(t) = timeout {
            if t.as_millis() == 0 {
                return Err(Error::Config(String::from(
                    "request timeout must be a positive duration",
                )));
            }
        }
        let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
        Ok(Self::with_parts(
            shared_timer(),
            timeout,
            log,
            Box::new(callback),
            None,
        ))
    }

    pub(crate) fn with_parts(
        timer: SharedTimer,
        timeout: Option<Duration>,
        log: Logger,
        callback: AcquireCallback<R>,
        on_settled: Option<Box<dyn Fn() + Send + Sync + 'static>>,
    ) -> Self {
        let shared = Arc::new(RequestShared {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst),
            created_at: Instant::now(),
            timer,
            log,
            on_settled,
            state: Mutex::new(RequestState {
                callback: Some(callback),
                timer_guard: None,
                outcome: None,
                on_error: None,
            }),
        });
        let request = ResourceRequest { shared };
        if let Some(t) = timeout {
            request.arm_timer(t);
        }
        request
    }

    /// The monotonic id of this request.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The instant the request was created; deadlines set through
    /// [`set_timeout`](#method.set_timeout) are measured from it.
    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    /// True once the request has reached a terminal state.
    pub fn is_fulfilled(&self) -> bool {
        self.shared.state.lock().unwrap().outcome.is_some()
    }

    /// The terminal state, if the request has reached one.
    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.shared.state.lock().unwrap().outcome
    }

    /// Install a hook for `error` events on this request. Without a hook,
    /// redundant fulfillment is logged at error level.
    pub fn on_error<H>(&self, hook: H)
    where
        H: Fn(&Error) + Send + Sync + 'static,
    {
        self.shared.state.lock().unwrap().on_error = Some(Arc::new(hook));
    }

    /// Fulfil the request with a resource. Returns the resource when the
    /// request already reached a terminal state, in which case an `error`
    /// event is emitted and the callback is not invoked again.
    pub fn resolve(&self, resource: PoolResource<R>) -> Option<PoolResource<R>> {
        match self.try_resolve(resource) {
            Ok(()) => None,
            Err(resource) => {
                self.emit_error(Error::Fulfillment(format!(
                    "redundant resolution of request {}",
                    self.shared.id
                )));
                Some(resource)
            }
        }
    }

    // Fulfillment attempt that stays quiet when it loses the race against a
    // timeout or abort; the caller decides what to do with the resource.
    pub(crate) fn try_resolve(
        &self,
        resource: PoolResource<R>,
    ) -> Result<(), PoolResource<R>> {
        let callback;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.outcome.is_some() || state.callback.is_none() {
                return Err(resource);
            }
            callback = state.callback.take().unwrap();
            state.outcome = Some(RequestOutcome::Resolved);
            state.timer_guard.take();
        }
        thread::spawn(move || callback(Ok(resource)));
        self.notify_settled();
        Ok(())
    }

    /// Fulfil the request with an error.
    pub fn reject(&self, error: Error) {
        self.finish_err(RequestOutcome::Rejected, error);
    }

    /// Abort the request. Synthesizes a rejection carrying
    /// `aborted: <reason>`; after an abort, later resolve or reject calls
    /// only emit an `error` event.
    pub fn abort(&self, reason: Option<&str>) {
        let message =
            format!("aborted: {}", reason.unwrap_or("No reason given"));
        self.finish_err(RequestOutcome::Aborted, Error::Aborted(message));
    }

    /// Replace the deadline with `created_at + timeout`. `None` cancels the
    /// deadline. A deadline already in the past schedules rejection on the
    /// next scheduler tick rather than rejecting synchronously.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        match timeout {
            None => self.clear_timeout(),
            Some(t) => {
                if self.is_fulfilled() {
                    return;
                }
                self.arm_timer(t);
            }
        }
    }

    /// Cancel the deadline without fulfilling the request.
    pub fn clear_timeout(&self) {
        self.shared.state.lock().unwrap().timer_guard.take();
    }

    fn arm_timer(&self, timeout: Duration) {
        let deadline = self.shared.created_at + timeout;
        let delay = deadline.saturating_duration_since(Instant::now());
        let weak = Arc::downgrade(&self.shared);
        let mut state = self.shared.state.lock().unwrap();
        let guard = self
            .shared
            .timer
            .lock()
            .unwrap()
            .schedule_with_delay(chrono_ms(delay), move || {
                expire(&weak);
            });
        state.timer_guard = Some(guard);
    }

    fn finish_err(&self, outcome: RequestOutcome, error: Error) -> bool {
        let callback;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.outcome.is_some() || state.callback.is_none() {
                drop(state);
                self.emit_error(Error::Fulfillment(format!(
                    "redundant rejection of request {}",
                    self.shared.id
                )));
                return false;
            }
            callback = state.callback.take().unwrap();
            state.outcome = Some(outcome);
            state.timer_guard.take();
        }
        thread::spawn(move || callback(Err(error)));
        self.notify_settled();
        true
    }

    fn emit_error(&self, error: Error) {
        let hook = self.shared.state.lock().unwrap().on_error.clone();
        match hook {
            Some(hook) => hook(&error),
            None => error!(
                self.shared.log,
                "unhandled error on resource request {}: {}",
                self.shared.id,
                error
            ),
        }
    }

    fn notify_settled(&self) {
        if self.shared.on_settled.is_some() {
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || {
                if let Some(hook) = &shared.on_settled {
                    hook();
                }
            });
        }
    }
}

// Deadline expiry: reject with "timed out" unless a fulfillment won the
// race. Runs on the scheduler thread via a weak reference so an armed timer
// does not keep a dropped request alive.
fn expire<R: Send + 'static>(weak: &Weak<RequestShared<R>>) {
    if let Some(shared) = weak.upgrade() {
        let request = ResourceRequest { shared };
        let callback;
        {
            let mut state = request.shared.state.lock().unwrap();
            if state.outcome.is_some() || state.callback.is_none() {
                return;
            }
            callback = state.callback.take().unwrap();
            state.outcome = Some(RequestOutcome::Rejected);
            state.timer_guard.take();
        }
        thread::spawn(move || {
            callback(Err(Error::Timeout(String::from("timed out"))))
        });
        request.notify_settled();
    }
}
