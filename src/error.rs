// Copyright 2020 Joyent, Inc.

use std::fmt;

/// The error type for pool, request, and cluster operations.
///
/// Variants group the failures by contract: `Usage` for caller mistakes,
/// `Timeout` for expired deadlines, `Factory` for user-operation failures,
/// `Fulfillment` for redundant request completion, `Shutdown` for operations
/// against an ending or destroyed pool, `Aborted` for caller-cancelled
/// requests, and `Config` for invalid construction options.
#[derive(Clone, Debug)]
pub enum Error {
    Usage(String),
    Timeout(String),
    Factory(String),
    Fulfillment(String),
    Shutdown(String),
    Aborted(String),
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Usage(msg) => msg.fmt(fmt),
            Error::Timeout(msg) => msg.fmt(fmt),
            Error::Factory(msg) => msg.fmt(fmt),
            Error::Fulfillment(msg) => msg.fmt(fmt),
            Error::Shutdown(msg) => msg.fmt(fmt),
            Error::Aborted(msg) => msg.fmt(fmt),
            Error::Config(msg) => msg.fmt(fmt),
        }
    }
}

impl std::error::Error for Error {}
