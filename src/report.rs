use std::time::Duration;

use crate::config::{ Endpoint, HttpVersion, Method };
use crate::worker::OutcomeCounters;

const FIELD_WIDTH: usize = 30; // width of each label for formatting print

/// Final result of a run: every client's counters summed. Clients that had
/// to be aborted are counted up to their last finished attempt.
#[derive(Debug, Clone)]
pub struct Report {
    pub counters: OutcomeCounters,

    pub duration: Duration, // configured run time
    pub elapsed: Duration, // measured from start until the last client reported
    pub interrupted: bool, // stopped early by the user

    pub clients: usize, // clients spawned
    pub workers_reported: usize, // clients that stopped on their own and sent final counters

    pub method: Method,
    pub version: HttpVersion, // effective version sent
    pub endpoint: Endpoint, // where the requests went (target or proxy)
}

impl Report {
    /// Duration the rates are computed over: the configured one, or the
    /// measured one when the run was cut short
    pub fn rate_duration(&self) -> Duration {
        if self.interrupted { self.elapsed } else { self.duration }
    }

    pub fn pages_per_minute(&self) -> f64 {
        let minutes = self.rate_duration().as_secs_f64() / 60.0;
        if minutes > 0.0 { (self.counters.attempts() as f64) / minutes } else { 0.0 }
    }

    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.rate_duration().as_secs_f64();
        if secs > 0.0 { (self.counters.bytes_read as f64) / secs } else { 0.0 }
    }

    /// Clients that never sent final counters (aborted or died)
    pub fn missing_workers(&self) -> usize {
        self.clients.saturating_sub(self.workers_reported)
    }

    /// Print the benchmarking report
    pub fn print_report(&self) {
        println!();
        self.print_details();
        println!();
        self.print_failure_reasons();
    }

    fn print_details(&self) {
        println!(
            "{:<FIELD_WIDTH$}{} {} via {}",
            "Request:",
            self.method,
            self.version,
            self.endpoint
        );
        println!(
            "{:<FIELD_WIDTH$}{:.2}s{}",
            "Duration:",
            self.rate_duration().as_secs_f64(),
            if self.interrupted { " (interrupted)" } else { "" }
        );
        println!(
            "{:<FIELD_WIDTH$}{} pages/min, {} bytes/sec",
            "Speed:",
            self.pages_per_minute() as u64,
            self.bytes_per_second() as u64
        );
        println!(
            "{:<FIELD_WIDTH$}{} succeeded, {} failed",
            "Requests:",
            self.counters.succeeded,
            self.counters.failed
        );
        if self.missing_workers() > 0 {
            println!(
                "{:<FIELD_WIDTH$}{} of {} clients aborted, counted up to their last finished request",
                "Warning:",
                self.missing_workers(),
                self.clients
            );
        }
    }

    fn print_failure_reasons(&self) {
        let c = &self.counters;
        println!("Reasons for failure:");
        println!("  {:<width$}{}", "connect failed:", c.connect_failed, width = FIELD_WIDTH - 2);
        println!("  {:<width$}{}", "send failed:", c.send_failed, width = FIELD_WIDTH - 2);
        println!(
            "  {:<width$}{}",
            "write-side shutdown failed:",
            c.half_close_failed,
            width = FIELD_WIDTH - 2
        );
        println!("  {:<width$}{}", "read failed:", c.read_failed, width = FIELD_WIDTH - 2);
        println!("  {:<width$}{}", "close failed:", c.close_failed, width = FIELD_WIDTH - 2);
    }
}
