//! One benchmark client
//!
//! A worker repeats a single request/response cycle against the connect
//! endpoint until the shared deadline fires:
//!
//! 1. connect
//! 2. send the whole request
//! 3. half-close the write side (HTTP/0.9 only)
//! 4. read until the server closes (unless told not to wait)
//! 5. close
//!
//! Any failing step ends the attempt, is counted under its own kind and the
//! next attempt starts straight away. There is no backoff: the failure rate
//! under load is what is being measured.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::yield_now;

use crate::config::{ BenchConfig, HttpVersion };
use crate::connector::{ self, Connection };
use crate::deadline::Deadline;
use crate::request::Request;

const READ_BUF_LEN: usize = 1500;

/// The step an attempt failed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connect,
    Send,
    HalfClose,
    Read,
    Close,
}

/// Per-worker tally, summed across workers once the run is over.
///
/// `failed` always equals the sum of the five per-kind counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeCounters {
    pub succeeded: u64,
    pub failed: u64,
    pub bytes_read: u64,

    pub connect_failed: u64,
    pub send_failed: u64,
    pub half_close_failed: u64,
    pub read_failed: u64,
    pub close_failed: u64,
}

impl OutcomeCounters {
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        self.failed += 1;
        *self.counter_mut(kind) += 1;
    }

    /// Takes back one failure of `kind`, if there is one to take back
    pub fn rollback(&mut self, kind: FailureKind) {
        let counter = self.counter_mut(kind);
        if *counter > 0 {
            *counter -= 1;
            self.failed -= 1;
        }
    }

    /// Add another worker's tally into this one
    pub fn merge(&mut self, other: &OutcomeCounters) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.bytes_read += other.bytes_read;
        self.connect_failed += other.connect_failed;
        self.send_failed += other.send_failed;
        self.half_close_failed += other.half_close_failed;
        self.read_failed += other.read_failed;
        self.close_failed += other.close_failed;
    }

    pub fn attempts(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Whether `failed` matches the per-kind breakdown
    pub fn is_consistent(&self) -> bool {
        self.failed ==
            self.connect_failed +
                self.send_failed +
                self.half_close_failed +
                self.read_failed +
                self.close_failed
    }

    fn counter_mut(&mut self, kind: FailureKind) -> &mut u64 {
        match kind {
            FailureKind::Connect => &mut self.connect_failed,
            FailureKind::Send => &mut self.send_failed,
            FailureKind::HalfClose => &mut self.half_close_failed,
            FailureKind::Read => &mut self.read_failed,
            FailureKind::Close => &mut self.close_failed,
        }
    }
}

/// A single client. Owns its counters until [`Worker::run`] hands them back.
///
/// After every finished attempt the running tally is also published on a
/// watch channel, so a worker that gets aborted mid-step still leaves its
/// completed cycles behind.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    config: Arc<BenchConfig>,
    request: Arc<Request>,
    deadline: Deadline,
    snapshot: watch::Sender<OutcomeCounters>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<BenchConfig>,
        request: Arc<Request>,
        deadline: Deadline
    ) -> Self {
        let (snapshot, _) = watch::channel(OutcomeCounters::default());
        Self { id, config, request, deadline, snapshot }
    }

    /// Tally as of the last finished attempt
    pub fn subscribe(&self) -> watch::Receiver<OutcomeCounters> {
        self.snapshot.subscribe()
    }

    /// Run attempts until the deadline fires and return the final tally
    pub async fn run(self) -> OutcomeCounters {
        let mut counters = OutcomeCounters::default();
        let mut buf = vec![0u8; READ_BUF_LEN];
        let mut last_failure = None;

        loop {
            if self.deadline.is_expired() {
                // the attempt that just ended may have failed only because
                // the run was stopping; don't count it
                if let Some(kind) = last_failure {
                    counters.rollback(kind);
                }
                break;
            }

            last_failure = match self.attempt(&mut counters, &mut buf).await {
                Ok(()) => {
                    counters.record_success();
                    None
                }
                Err(kind) => {
                    counters.record_failure(kind);
                    Some(kind)
                }
            };
            self.snapshot.send_replace(counters);

            if last_failure.is_some() {
                // failures can complete without ever waiting on the socket
                yield_now().await;
            }
        }

        tracing::debug!(
            worker_id = self.id,
            succeeded = counters.succeeded,
            failed = counters.failed,
            bytes_read = counters.bytes_read,
            "Worker stopped"
        );
        counters
    }

    /// One connect, send, drain, close cycle
    async fn attempt(
        &self,
        counters: &mut OutcomeCounters,
        buf: &mut [u8]
    ) -> Result<(), FailureKind> {
        let endpoint = self.request.connect_to();
        let conn = connector
            ::connect(&endpoint.host, endpoint.port, self.config.connect_timeout).await
            .map_err(|err| {
                tracing::trace!(worker_id = self.id, error = %err, "Connect failed");
                FailureKind::Connect
            })?;

        self.exchange(conn, counters, buf).await
    }

    /// Everything after connect. Dropping the connection on an early return
    /// closes it.
    async fn exchange(
        &self,
        mut conn: Connection,
        counters: &mut OutcomeCounters,
        buf: &mut [u8]
    ) -> Result<(), FailureKind> {
        conn.send(self.request.as_bytes()).await.map_err(|err| {
            tracing::trace!(worker_id = self.id, error = %err, "Send failed");
            FailureKind::Send
        })?;

        // HTTP/0.9 servers reply and close; nothing more is written after the request
        if self.request.version() == HttpVersion::Http09 {
            conn.half_close().await.map_err(|err| {
                tracing::trace!(worker_id = self.id, error = %err, "Half-close failed");
                FailureKind::HalfClose
            })?;
        }

        if self.config.wait_for_response {
            while !self.deadline.is_expired() {
                match conn.read(buf).await {
                    Ok(0) => {
                        break;
                    }
                    Ok(n) => {
                        counters.bytes_read += n as u64;
                    }
                    Err(err) => {
                        tracing::trace!(worker_id = self.id, error = %err, "Read failed");
                        return Err(FailureKind::Read);
                    }
                }
            }
        }

        conn.close().map_err(|err| {
            tracing::trace!(worker_id = self.id, error = %err, "Close failed");
            FailureKind::Close
        })
    }
}
