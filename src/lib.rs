// Copyright 2020 Joyent, Inc.

//! A generic resource pool with a load-balanced cluster front-end
//!
//! Carom is a library for managing opaque, expensive-to-create resources --
//! database connections, worker handles, sessions -- and multiplexing them
//! across concurrent consumers. The name comes from billiards: a carom is a
//! shot played off several cushions, and a carom
//! [`Cluster`](cluster/struct.Cluster.html) plays each request off the
//! least-loaded of several [`Pool`](resource_pool/struct.Pool.html)s.
//!
//! ## Factories
//!
//! A pool does not know how to build the resources it manages. Users supply
//! an implementation of the
//! [`ResourceFactory`](resource/trait.ResourceFactory.html) trait with four
//! operations: `create` produces a resource, `dispose` tears one down
//! gracefully, `ping` health-checks one before it is handed out, and
//! `destroy` tears one down forcefully. Only `create` and `dispose` need to
//! be written; `ping` defaults to success and `destroy` to a no-op. Each
//! invocation runs on a thread of its own, so implementations may block,
//! and each is raced against the matching deadline from the pool's options
//! (`acquire_timeout`, `ping_timeout`, `dispose_timeout`). Whichever side
//! of a race loses takes a late path that still routes the resource through
//! teardown -- a resource produced by the factory is never silently
//! dropped.
//!
//! ## Requests
//!
//! `acquire` never blocks. It queues a
//! [`ResourceRequest`](request/struct.ResourceRequest.html) and returns it;
//! the callback supplied to `acquire` fires exactly once, from a scheduled
//! context, with either a resource or an error. Requests are served in
//! admission order, each resource passes a ping before it is handed out,
//! and the returned request handle can be aborted or given a new deadline
//! while it waits.
//!
//! ## Maintenance
//!
//! A periodic task keeps the pool between its `min` and `max` bounds:
//! resources are allocated up to `min`, and resources idle beyond
//! `idle_timeout` are reaped down to `min`. Allocation failures before the
//! pool has ever produced a resource are retried on an exponential backoff
//! schedule until `bail_after` is exhausted, at which point the pool
//! destroys itself; failures after that are warnings and allocation is
//! simply retried.
//!
//! ## Shutdown
//!
//! `end` drains the pool gracefully: no new requests are admitted, queued
//! requests complete, and every resource is disposed as it comes back.
//! `destroy_pool` is the abrupt version: queued requests are rejected and
//! idle resources are destroyed. Both leave the pool in the `destroyed`
//! state.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::mpsc::channel;
//!
//! use carom::resource::ResourceFactory;
//! use carom::resource_pool::types::PoolOptions;
//! use carom::resource_pool::Pool;
//!
//! struct WorkerFactory;
//!
//! impl ResourceFactory for WorkerFactory {
//!     type Resource = Worker;
//!     type Error = WorkerError;
//!
//!     fn create(&self) -> Result<Worker, WorkerError> {
//!         Worker::spawn()
//!     }
//!
//!     fn dispose(&self, worker: &mut Worker) -> Result<(), WorkerError> {
//!         worker.shut_down()
//!     }
//! }
//!
//! let pool = Pool::new(
//!     PoolOptions {
//!         min: Some(1),
//!         max: Some(10),
//!         ..PoolOptions::default()
//!     },
//!     WorkerFactory,
//! )?;
//!
//! let (tx, rx) = channel();
//! pool.acquire(move |result| {
//!     tx.send(result).unwrap();
//! });
//! let worker = rx.recv().unwrap()?;
//! // Do stuff here, then give the worker back.
//! pool.release(worker);
//! ```

#![allow(missing_docs)]

pub mod cluster;
pub mod error;
pub mod request;
pub mod resource;
pub mod resource_pool;
