// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::channel;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use slog::{info, o, Drain, Logger};

use carom::cluster::Cluster;
use carom::resource::ResourceFactory;
use carom::resource_pool::types::PoolOptions;
use carom::resource_pool::Pool;

#[derive(Debug)]
pub struct SessionError(String);

impl fmt::Display for SessionError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl std::error::Error for SessionError {}

// A stand-in for an expensive handle: a worker session identified by the
// shard it talks to.
#[derive(Debug)]
pub struct Session {
    pub shard: &'static str,
    pub serial: u64,
}

struct SessionFactory {
    shard: &'static str,
    serial: AtomicU64,
}

impl SessionFactory {
    fn new(shard: &'static str) -> Self {
        SessionFactory {
            shard,
            serial: AtomicU64::new(0),
        }
    }
}

impl ResourceFactory for SessionFactory {
    type Resource = Session;
    type Error = SessionError;

    fn create(&self) -> Result<Session, SessionError> {
        // Pretend session setup takes a moment
        thread::sleep(Duration::from_millis(10));
        Ok(Session {
            shard: self.shard,
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn dispose(&self, _session: &mut Session) -> Result<(), SessionError> {
        Ok(())
    }
}

fn shard_pool(shard: &'static str, log: &Logger) -> Pool<SessionFactory> {
    let options = PoolOptions {
        min: Some(1),
        max: Some(4),
        capabilities: vec![String::from(shard)],
        log: Some(log.clone()),
        ..PoolOptions::default()
    };
    Pool::new(options, SessionFactory::new(shard)).unwrap()
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic carom example");

    let east = shard_pool("shard-east", &log);
    let west = shard_pool("shard-west", &log);
    let cluster = Cluster::new(vec![east.clone(), west.clone()]);

    // Check sessions out of the cluster from a few worker threads and
    // return them when done.
    let mut workers = Vec::new();
    for worker in 0..6 {
        let cluster = cluster.clone();
        let log = log.clone();
        workers.push(thread::spawn(move || {
            let (tx, rx) = channel();
            cluster.acquire(move |result| {
                let _ = tx.send(result);
            });
            let session = rx.recv().unwrap().unwrap();
            info!(
                log,
                "worker {} using session {} on {}",
                worker,
                session.serial,
                session.shard
            );
            thread::sleep(Duration::from_millis(50));
            cluster.release(session);
        }));
    }
    for worker in workers {
        let _ = worker.join();
    }

    let stats = east.stats();
    info!(
        log,
        "east pool after work: allocated {} available {}",
        stats.allocated,
        stats.available
    );

    let (tx, rx) = channel();
    cluster.end(move |result| {
        let _ = tx.send(result);
    });
    rx.recv().unwrap().unwrap();
    info!(log, "cluster drained");
}
