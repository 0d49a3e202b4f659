// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::ops::{Deref, DerefMut};

use derive_more::{Display, From, Into};

/// Carom resource factory
///
/// The `ResourceFactory` trait defines the four user operations the pool
/// invokes over the lifetime of a resource. A resource need not be a network
/// connection; it can be any expensive-to-create value (a worker handle, a
/// session, a file) as long as the operations below can manage it.
///
/// Every operation is executed on a thread dedicated to that invocation, so
/// implementations may block. The pool races each invocation against the
/// corresponding timeout from its options and accounts for the attempt
/// exactly once no matter which side of the race finishes first.
pub trait ResourceFactory: Send + Sync + 'static {
    /// The opaque resource type managed by the pool. The pool never inspects
    /// its contents; identity is tracked by a pool-issued key.
    type Resource: Send + 'static;
    /// The error type returned by the fallible operations. This is an
    /// associated type for the trait meaning each specific implementation of
    /// the `ResourceFactory` trait may choose the appropriate concrete error
    /// type to return. The only constraint applied is that the selected error
    /// type must implement the
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait
    /// from the standard library.
    type Error: std::error::Error + Send + 'static;

    /// Produce a new resource. Called to satisfy queued requests within the
    /// pool's `max` bound and to maintain the `min` bound.
    fn create(&self) -> Result<Self::Resource, Self::Error>;

    /// Gracefully tear a resource down. Called when a resource is reaped,
    /// removed, replaced after a failed ping, arrives after its allocation
    /// attempt timed out, or during pool shutdown.
    fn dispose(&self, resource: &mut Self::Resource) -> Result<(), Self::Error>;

    /// Health-check a resource before it is handed to a consumer. A resource
    /// whose ping fails or times out is disposed and never handed out.
    fn ping(&self, _resource: &mut Self::Resource) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Forcefully tear a resource down. Fire-and-forget; used as the
    /// fallback when `dispose` exceeds its deadline and for resources swept
    /// up by a forced pool shutdown.
    fn destroy(&self, _resource: &mut Self::Resource) {}
}

/// A pool-issued identifier for a resource. Identifiers are monotonic within
/// a pool and are never reused.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ResourceId(pub u64);

/// The identity of a loaned resource: the issuing pool plus the resource id.
/// A cluster uses the key to route a released resource back to the pool that
/// produced it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ResourceKey {
    pub(crate) pool: u64,
    pub(crate) id: ResourceId,
}

impl ResourceKey {
    pub(crate) fn new(pool: u64, id: ResourceId) -> Self {
        ResourceKey { pool, id }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}/{}", self.pool, self.id)
    }
}

/// A resource on loan from a pool.
///
/// The handle owns the resource value for the duration of the loan and
/// dereferences to it. Give it back with [`Pool::release`], or take it out of
/// circulation with [`Pool::remove`] (graceful) or [`Pool::destroy`]
/// (forced); all three consume the handle, so a resource cannot be returned
/// twice.
///
/// [`Pool::release`]: ../resource_pool/struct.Pool.html#method.release
/// [`Pool::remove`]: ../resource_pool/struct.Pool.html#method.remove
/// [`Pool::destroy`]: ../resource_pool/struct.Pool.html#method.destroy
#[derive(Debug)]
pub struct PoolResource<R: Send + 'static> {
    key: ResourceKey,
    value: Option<R>,
}

impl<R: Send + 'static> PoolResource<R> {
    pub(crate) fn new(key: ResourceKey, value: R) -> Self {
        PoolResource {
            key,
            value: Some(value),
        }
    }

    /// The identity key of this resource.
    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub(crate) fn into_parts(mut self) -> (ResourceKey, Option<R>) {
        (self.key, self.value.take())
    }
}

impl<R: Send + 'static> Deref for PoolResource<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.value.as_ref().unwrap()
    }
}

impl<R: Send + 'static> DerefMut for PoolResource<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.value.as_mut().unwrap()
    }
}
