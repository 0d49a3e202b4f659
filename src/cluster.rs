// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use slog::{debug, error, info, o, Drain, Logger};

use crate::error::Error;
use crate::request::{shared_timer, AcquireCallback, ResourceRequest, SharedTimer};
use crate::resource::{PoolResource, ResourceFactory, ResourceKey};
use crate::resource_pool::types::EndCallback;
use crate::resource_pool::Pool;

/// Typed hooks for the events a cluster emits.
pub struct ClusterHooks {
    /// Usage errors, currently only release of a resource the cluster does
    /// not manage.
    pub on_error: Option<Box<dyn Fn(&Error) + Send + Sync + 'static>>,
}

impl Default for ClusterHooks {
    fn default() -> Self {
        ClusterHooks { on_error: None }
    }
}

/// The configuration options for a cluster.
#[derive(Default)]
pub struct ClusterOptions {
    /// An optional `slog` logger instance, with the same fallback behavior
    /// as the pool's.
    pub log: Option<Logger>,
    /// Event hooks.
    pub hooks: ClusterHooks,
}

struct ClusterData {
    ended: bool,
    owners: HashMap<ResourceKey, usize>,
}

struct ClusterInner<F: ResourceFactory> {
    pools: Vec<Pool<F>>,
    hooks: ClusterHooks,
    timer: SharedTimer,
    log: Logger,
    data: Mutex<ClusterData>,
}

/// A load-balanced front-end over several pools
///
/// The cluster owns no resources itself. Each `acquire` is delegated to the
/// pool with the most remaining headroom among those whose declared
/// capability tags cover the requested set, and the cluster remembers which
/// pool produced each outstanding resource so that `release` routes back
/// correctly.
pub struct Cluster<F: ResourceFactory> {
    inner: Arc<ClusterInner<F>>,
}

impl<F: ResourceFactory> Clone for Cluster<F> {
    fn clone(&self) -> Cluster<F> {
        Cluster {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> From<Pool<F>> for Cluster<F> {
    fn from(pool: Pool<F>) -> Cluster<F> {
        Cluster::new(vec![pool])
    }
}

impl<F: ResourceFactory> Cluster<F> {
    /// Create a cluster over the given pools. Pools are tried in
    /// registration order when load scores tie.
    pub fn new(pools: Vec<Pool<F>>) -> Cluster<F> {
        Cluster::with_options(pools, ClusterOptions::default())
    }

    /// Create a cluster with an explicit logger and hooks.
    pub fn with_options(
        pools: Vec<Pool<F>>,
        mut options: ClusterOptions,
    ) -> Cluster<F> {
        let log = options
            .log
            .take()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("cluster_pools" => pools.len()));
        Cluster {
            inner: Arc::new(ClusterInner {
                pools,
                hooks: options.hooks,
                timer: shared_timer(),
                log,
                data: Mutex::new(ClusterData {
                    ended: false,
                    owners: HashMap::new(),
                }),
            }),
        }
    }

    /// Submit a request with no capability requirement; every pool matches.
    pub fn acquire<C>(&self, callback: C) -> ResourceRequest<F::Resource>
    where
        C: FnOnce(Result<PoolResource<F::Resource>, Error>) + Send + 'static,
    {
        self.acquire_capabilities(&[], callback)
    }

    /// Submit a request that only a pool declaring every tag in
    /// `capabilities` may serve. Among the matching pools the one with the
    /// greatest headroom score (`available - queued`) wins; ties go to the
    /// earliest registered.
    pub fn acquire_capabilities<C>(
        &self,
        capabilities: &[&str],
        callback: C,
    ) -> ResourceRequest<F::Resource>
    where
        C: FnOnce(Result<PoolResource<F::Resource>, Error>) + Send + 'static,
    {
        let inner = &self.inner;
        let callback: AcquireCallback<F::Resource> = Box::new(callback);

        if inner.data.lock().unwrap().ended {
            return rejected_request(
                inner,
                callback,
                Error::Shutdown(String::from("Cluster is ended")),
            );
        }

        let candidates: Vec<usize> = inner
            .pools
            .iter()
            .enumerate()
            .filter(|(_, pool)| {
                capabilities.iter().all(|required| {
                    pool.capabilities().iter().any(|have| have == required)
                })
            })
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return rejected_request(
                inner,
                callback,
                Error::Usage(String::from("No pools can fulfil capability")),
            );
        }

        let mut best: Option<(usize, i64)> = None;
        for index in candidates {
            let stats = inner.pools[index].stats();
            let queued = u32::from(stats.queued);
            if let Some(cap) = stats.max_requests {
                if queued >= u32::from(cap) {
                    continue;
                }
            }
            let score =
                i64::from(u32::from(stats.available)) - i64::from(queued);
            match best {
                None => best = Some((index, score)),
                Some((_, top)) if score > top => best = Some((index, score)),
                Some(_) => {}
            }
        }
        let (choice, score) = match best {
            Some(best) => best,
            None => {
                return rejected_request(
                    inner,
                    callback,
                    Error::Usage(String::from("No pools available")),
                )
            }
        };

        debug!(
            inner.log,
            "dispatching acquire to pool {} with score {}", choice, score
        );
        let owner = Arc::clone(inner);
        inner.pools[choice].acquire(move |result| {
            if let Ok(resource) = &result {
                owner
                    .data
                    .lock()
                    .unwrap()
                    .owners
                    .insert(resource.key(), choice);
            }
            callback(result)
        })
    }

    /// Return a resource to the pool that produced it.
    pub fn release(&self, resource: PoolResource<F::Resource>) {
        let key = resource.key();
        let owner = self.inner.data.lock().unwrap().owners.remove(&key);
        match owner {
            Some(index) => self.inner.pools[index].release(resource),
            None => self.emit_error(Error::Usage(format!(
                "resource {} is not managed by this cluster",
                key
            ))),
        }
    }

    /// End every pool in the cluster. `callback` fires once all pools have
    /// drained, with the teardown errors aggregated across pools.
    pub fn end<C>(&self, callback: C)
    where
        C: FnOnce(Result<(), Vec<Error>>) + Send + 'static,
    {
        let inner = &self.inner;
        {
            let mut data = inner.data.lock().unwrap();
            if data.ended {
                thread::spawn(move || callback(Ok(())));
                return;
            }
            data.ended = true;
        }
        info!(inner.log, "ending cluster; {} pools", inner.pools.len());
        if inner.pools.is_empty() {
            thread::spawn(move || callback(Ok(())));
            return;
        }
        let pending: Arc<Mutex<(usize, Vec<Error>, Option<EndCallback>)>> =
            Arc::new(Mutex::new((
                inner.pools.len(),
                Vec::new(),
                Some(Box::new(callback)),
            )));
        for pool in &inner.pools {
            let pending = Arc::clone(&pending);
            pool.end(move |result| {
                let mut state = pending.lock().unwrap();
                if let Err(errors) = result {
                    state.1.extend(errors);
                }
                state.0 -= 1;
                if state.0 == 0 {
                    if let Some(callback) = state.2.take() {
                        let errors =
                            std::mem::replace(&mut state.1, Vec::new());
                        if errors.is_empty() {
                            callback(Ok(()))
                        } else {
                            callback(Err(errors))
                        }
                    }
                }
            });
        }
    }

    /// True once `end` has been called.
    pub fn ended(&self) -> bool {
        self.inner.data.lock().unwrap().ended
    }

    fn emit_error(&self, error: Error) {
        error!(self.inner.log, "cluster error: {}", error);
        if let Some(hook) = &self.inner.hooks.on_error {
            hook(&error);
        }
    }
}

fn rejected_request<F: ResourceFactory>(
    inner: &Arc<ClusterInner<F>>,
    callback: AcquireCallback<F::Resource>,
    error: Error,
) -> ResourceRequest<F::Resource> {
    let request = ResourceRequest::with_parts(
        Arc::clone(&inner.timer),
        None,
        inner.log.clone(),
        callback,
        None,
    );
    request.reject(error);
    request
}
