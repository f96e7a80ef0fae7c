use crate::config::BenchConfig;
use crate::connector;
use crate::deadline::Deadline;
use crate::error::RunError;
use crate::report::Report;
use crate::request::Request;
use crate::worker::{ OutcomeCounters, Worker };

use std::io::{ self, Write };
use std::sync::{ Arc, atomic::{ AtomicBool, AtomicUsize, Ordering } };
use tokio::{
    runtime::{ Builder, Runtime },
    sync::{ mpsc, watch },
    task::JoinHandle,
    time::{ interval, timeout_at, Duration, Instant },
};

/// Runs a benchmark: preflight, spawn the clients, stop them all at the
/// deadline and sum what they report.
#[derive(Debug, Clone)]
pub struct Runner {
    config: Arc<BenchConfig>,
    request: Arc<Request>,
    deadline: Deadline, // shared by every client of this run
    interrupted: Arc<AtomicBool>,
    spawned: Arc<AtomicUsize>, // client tasks started so far
}

impl Runner {
    /*------------------==| Public Functions |==-------------------------*/
    /// Create a new Runner instance
    pub fn new(config: BenchConfig, request: Request) -> Self {
        Self {
            config: Arc::new(config),
            request: Arc::new(request),
            deadline: Deadline::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            spawned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stop the run early; clients finish their current step and report as usual
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
        self.deadline.expire();
    }

    /// Number of client tasks this runner has started
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Main entry point, builds its own runtime and blocks until the report is ready
    pub fn run(&self) -> Result<Report, RunError> {
        let runtime = Self::get_runtime(self.config.threads).map_err(RunError::Runtime)?;
        let result = runtime.block_on(self.run_async());

        // clients that never reported are still parked on their sockets
        runtime.shutdown_background();
        result
    }

    /// Same as [`Runner::run`], on the caller's runtime
    pub async fn run_async(&self) -> Result<Report, RunError> {
        self.preflight().await?;

        let clients = self.config.clients;
        tracing::info!(
            clients,
            duration_secs = self.config.duration.as_secs_f64(),
            endpoint = %self.request.connect_to(),
            method = %self.request.method(),
            version = %self.request.version(),
            request_bytes = self.request.len(),
            "Starting benchmark"
        );

        let start = Instant::now();
        let timer = self.deadline.arm(self.config.duration);
        let progress = self.config.show_progress.then(|| {
            Self::spawn_progress(self.deadline.clone(), self.config.duration)
        });

        // every client sends its counters exactly once
        let (results_tx, mut results_rx) = mpsc::channel(clients.max(1));
        let mut handles = Vec::with_capacity(clients);
        let mut snapshots = Vec::with_capacity(clients);
        for id in 0..clients {
            let worker = Worker::new(
                id,
                Arc::clone(&self.config),
                Arc::clone(&self.request),
                self.deadline.clone()
            );
            snapshots.push(worker.subscribe());
            let results_tx = results_tx.clone();
            handles.push(
                tokio::spawn(async move {
                    let counters = worker.run().await;
                    let _ = results_tx.send((id, counters)).await;
                })
            );
            self.spawned.fetch_add(1, Ordering::Relaxed);
        }
        drop(results_tx); // the channel closes once every client is gone

        let mut counters = OutcomeCounters::default();
        let mut reported = vec![false; clients];
        let mut workers_reported = 0;

        // Clients only report once the deadline fires, unless they died
        while workers_reported < clients {
            tokio::select! {
                received = results_rx.recv() => {
                    match received {
                        Some((id, worker_counters)) => {
                            Self::record(&mut counters, id, &worker_counters);
                            reported[id] = true;
                            workers_reported += 1;
                        }
                        None => { break; }
                    }
                }
                _ = self.deadline.expired() => { break; }
            }
        }

        // then give stragglers a bounded grace period
        let grace_end = Instant::now() + self.config.report_grace;
        while workers_reported < clients {
            match timeout_at(grace_end, results_rx.recv()).await {
                Ok(Some((id, worker_counters))) => {
                    Self::record(&mut counters, id, &worker_counters);
                    reported[id] = true;
                    workers_reported += 1;
                }
                Ok(None) | Err(_) => { break; }
            }
        }
        let elapsed = start.elapsed();

        timer.abort();
        if let Some(progress) = progress {
            let _ = progress.await;
        }
        Self::reap(handles).await;

        // a client may have finished between the grace timeout and the abort
        while let Ok((id, worker_counters)) = results_rx.try_recv() {
            Self::record(&mut counters, id, &worker_counters);
            reported[id] = true;
            workers_reported += 1;
        }

        if workers_reported < clients {
            let salvaged = Self::salvage(&mut counters, &reported, &snapshots);
            tracing::warn!(
                missing = clients - workers_reported,
                clients,
                salvaged_attempts = salvaged.attempts(),
                "Some clients did not report, counting them up to their last finished attempt"
            );
        }
        debug_assert!(counters.is_consistent());

        let report = Report {
            counters,
            duration: self.config.duration,
            elapsed,
            interrupted: self.interrupted.load(Ordering::Relaxed),
            clients,
            workers_reported,
            method: self.request.method(),
            version: self.request.version(),
            endpoint: self.request.connect_to().clone(),
        };
        tracing::info!(
            elapsed_secs = elapsed.as_secs_f64(),
            succeeded = report.counters.succeeded,
            failed = report.counters.failed,
            bytes_read = report.counters.bytes_read,
            "Benchmark completed"
        );
        Ok(report)
    }

    /*-------------------==| Private/Helpers |==----------------------- */

    /// Check that the target (or proxy) accepts connections before starting any client
    async fn preflight(&self) -> Result<(), RunError> {
        let endpoint = self.request.connect_to();
        let conn = connector
            ::connect(&endpoint.host, endpoint.port, self.config.connect_timeout).await
            .map_err(|source| {
                tracing::debug!(
                    endpoint = %endpoint,
                    error = %source,
                    "Target unreachable, not starting any client"
                );
                RunError::TargetUnreachable { endpoint: endpoint.clone(), source }
            })?;
        let _ = conn.close();
        Ok(())
    }

    fn record(total: &mut OutcomeCounters, id: usize, counters: &OutcomeCounters) {
        tracing::debug!(
            worker_id = id,
            succeeded = counters.succeeded,
            failed = counters.failed,
            "Client reported"
        );
        total.merge(counters);
    }

    /// Adds the last published tally of every client that never reported.
    /// The attempt each one was stuck in is not counted.
    fn salvage(
        total: &mut OutcomeCounters,
        reported: &[bool],
        snapshots: &[watch::Receiver<OutcomeCounters>]
    ) -> OutcomeCounters {
        let mut salvaged = OutcomeCounters::default();
        for (id, snapshot) in snapshots.iter().enumerate() {
            if reported[id] {
                continue;
            }
            let last = *snapshot.borrow();
            tracing::debug!(
                worker_id = id,
                succeeded = last.succeeded,
                failed = last.failed,
                "Counting aborted client up to its last finished attempt"
            );
            salvaged.merge(&last);
        }
        total.merge(&salvaged);
        salvaged
    }

    /// Abort clients that are still running and log how each one ended
    async fn reap(handles: Vec<JoinHandle<()>>) {
        for handle in &handles {
            handle.abort();
        }
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(()) => {}
                Err(err) if err.is_panic() => {
                    tracing::error!(worker_id = id, error = %err, "Client task panicked");
                }
                Err(_) => {
                    tracing::warn!(worker_id = id, "Client did not stop in time, aborted");
                }
            }
        }
    }

    /// Prints the elapsed seconds on one line until the deadline fires
    fn spawn_progress(deadline: Deadline, duration: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = Instant::now();
            let mut ticker = interval(Duration::from_secs(1));
            ticker.tick().await; // the first tick completes immediately

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = deadline.expired() => { break; }
                }
                let elapsed = start.elapsed().as_secs();
                if elapsed < duration.as_secs() {
                    print!("\rElapsed time: {}s", elapsed); // move to the start of line and print
                    let _ = io::stdout().flush(); // ensure the output is displayed immediately
                }
            }
            println!();
        })
    }

    /// Helper function to create the tokio runtime
    fn get_runtime(threads: usize) -> io::Result<Runtime> {
        Builder::new_multi_thread().worker_threads(threads.max(1)).enable_all().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::error::ConnectError;
    use tokio::io::{ AsyncReadExt, AsyncWriteExt };
    use tokio::net::TcpListener;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn runner(port: u16, config: BenchConfig) -> Runner {
        let request = Request::build(&format!("http://127.0.0.1:{port}/bench"), &config).unwrap();
        Runner::new(config, request)
    }

    /// Answers every request with a short page and closes
    async fn spawn_page_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !received.ends_with(b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => received.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = stream.write_all(b"HTTP/1.0 200 OK\r\n\r\n<html>ok</html>").await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        port
    }

    /// Accepts connections and holds them open without ever answering
    async fn spawn_silent_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    /// Answers quickly for `fast_for`, then holds every reply for `stall`
    async fn spawn_stalling_server(fast_for: Duration, stall: Duration) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let start = Instant::now();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !received.ends_with(b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => received.extend_from_slice(&buf[..n]),
                        }
                    }
                    if start.elapsed() > fast_for {
                        tokio::time::sleep(stall).await;
                    }
                    let _ = stream.write_all(b"HTTP/1.0 200 OK\r\n\r\n<html>ok</html>").await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        port
    }

    #[test]
    fn test_unreachable_target_is_fatal() {
        let port = unused_port();
        let config = BenchConfig {
            clients: 5,
            duration: Duration::from_secs(1),
            threads: 2,
            ..BenchConfig::default()
        };

        let runner = runner(port, config);
        let err = runner.run().unwrap_err();
        match err {
            RunError::TargetUnreachable { endpoint, source } => {
                assert_eq!(endpoint, Endpoint::new("127.0.0.1", port));
                assert!(matches!(source, ConnectError::Io(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.spawned(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_sums_all_clients() {
        let port = spawn_page_server().await;
        let config = BenchConfig {
            clients: 3,
            duration: Duration::from_millis(500),
            ..BenchConfig::default()
        };

        let runner = runner(port, config);
        let report = runner.run_async().await.unwrap();
        assert_eq!(runner.spawned(), 3);
        assert_eq!(report.clients, 3);
        assert_eq!(report.workers_reported, 3);
        assert_eq!(report.missing_workers(), 0);
        assert!(!report.interrupted);
        assert!(report.counters.succeeded > 0);
        assert!(report.counters.bytes_read > 0);
        assert!(report.counters.is_consistent());
        assert_eq!(report.endpoint, Endpoint::new("127.0.0.1", port));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_without_waiting_reads_nothing() {
        let port = spawn_page_server().await;
        let config = BenchConfig {
            clients: 2,
            duration: Duration::from_millis(300),
            wait_for_response: false,
            ..BenchConfig::default()
        };

        let report = runner(port, config).run_async().await.unwrap();
        assert_eq!(report.workers_reported, 2);
        assert!(report.counters.succeeded > 0);
        assert_eq!(report.counters.bytes_read, 0);
        assert!(report.counters.is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_stops_run_early() {
        let port = spawn_page_server().await;
        let config = BenchConfig {
            clients: 2,
            duration: Duration::from_secs(30),
            ..BenchConfig::default()
        };
        let runner = runner(port, config);

        let stopper = runner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.interrupt();
        });

        let report = runner.run_async().await.unwrap();
        assert!(report.interrupted);
        assert!(report.elapsed < Duration::from_secs(10));
        assert_eq!(report.rate_duration(), report.elapsed);
        assert_eq!(report.workers_reported, 2);
        assert!(report.counters.is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hung_clients_give_partial_report() {
        let port = spawn_silent_server().await;
        let config = BenchConfig {
            clients: 2,
            duration: Duration::from_millis(200),
            report_grace: Duration::from_millis(200),
            ..BenchConfig::default()
        };

        let report = runner(port, config).run_async().await.unwrap();
        // both clients are stuck reading a response that never comes
        assert_eq!(report.workers_reported, 0);
        assert_eq!(report.missing_workers(), 2);
        assert_eq!(report.counters, OutcomeCounters::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_aborted_client_keeps_finished_requests() {
        let port = spawn_stalling_server(
            Duration::from_millis(250),
            Duration::from_millis(800)
        ).await;
        let config = BenchConfig {
            clients: 1,
            duration: Duration::from_millis(300),
            report_grace: Duration::from_millis(200),
            ..BenchConfig::default()
        };

        let report = runner(port, config).run_async().await.unwrap();
        // the client was stuck on a stalled reply and got aborted...
        assert_eq!(report.workers_reported, 0);
        assert_eq!(report.missing_workers(), 1);
        // ...but everything it finished before that still counts
        assert!(report.counters.succeeded > 0);
        assert!(report.counters.bytes_read > 0);
        assert!(report.counters.is_consistent());
    }

    #[test]
    fn test_run_builds_own_runtime() {
        let runtime = Runtime::new().unwrap();
        let port = runtime.block_on(spawn_page_server());
        let config = BenchConfig {
            clients: 2,
            duration: Duration::from_millis(300),
            threads: 2,
            ..BenchConfig::default()
        };

        let report = runner(port, config).run().unwrap();
        assert_eq!(report.workers_reported, 2);
        assert!(report.counters.succeeded > 0);
        assert!(report.counters.is_consistent());
    }
}
