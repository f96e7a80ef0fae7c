use std::fmt;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

const DEFAULT_CLIENTS: usize = 1;
const DEFAULT_BENCH_TIME: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Request method. None of them carry a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Ordered so that upgrades can be written as `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HttpVersion {
    Http09,
    Http10,
    Http11,
}

impl HttpVersion {
    /// Suffix for the request line, `None` for HTTP/0.9
    pub fn request_line_suffix(&self) -> Option<&'static str> {
        match self {
            HttpVersion::Http09 => None,
            HttpVersion::Http10 => Some("HTTP/1.0"),
            HttpVersion::Http11 => Some("HTTP/1.1"),
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpVersion::Http09 => f.write_str("HTTP/0.9"),
            HttpVersion::Http10 => f.write_str("HTTP/1.0"),
            HttpVersion::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}

/// A host (name or literal address) and port pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Finalized benchmark settings, shared read-only by every worker
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub proxy: Option<Endpoint>,
    pub method: Method,
    pub http_version: HttpVersion, // as requested; the request carries the effective one
    pub wait_for_response: bool,
    pub force_reload: bool,
    pub clients: usize,
    pub duration: Duration,

    pub connect_timeout: Duration, // per connect attempt, including name resolution
    pub threads: usize,
    pub report_grace: Duration, // how long to wait for workers once the deadline fired, at least connect_timeout
    pub show_progress: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            proxy: None,
            method: Method::Get,
            http_version: HttpVersion::Http10,
            wait_for_response: true,
            force_reload: false,
            clients: DEFAULT_CLIENTS,
            duration: DEFAULT_BENCH_TIME,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            threads: 1,
            report_grace: DEFAULT_CONNECT_TIMEOUT,
            show_progress: false,
        }
    }
}

/// Command line front end
#[derive(Parser, Debug)]
#[command(
    name = "pagebench",
    version,
    about = "Hammer an HTTP server from many concurrent clients for a fixed time",
    after_help = "Durations can be specified like: 10, 10s, 1m, 1h"
)]
pub struct Cli {
    /// Don't wait for the server response
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Send reload request (Pragma: no-cache)
    #[arg(short = 'r', long)]
    pub reload: bool,

    /// Run benchmark for <TIME>
    #[arg(short = 't', long, value_parser = parse_duration, default_value = "30")]
    pub time: Duration,

    /// Use proxy server for request
    #[arg(short = 'p', long, value_name = "SERVER:PORT", value_parser = parse_proxy)]
    pub proxy: Option<Endpoint>,

    /// Run <N> HTTP clients at once
    #[arg(short = 'c', long, value_name = "N", default_value_t = DEFAULT_CLIENTS)]
    pub clients: usize,

    /// Use HTTP/0.9 style requests
    #[arg(short = '9', long, group = "protocol")]
    pub http09: bool,

    /// Use HTTP/1.0 protocol (default)
    #[arg(short = '1', long, group = "protocol")]
    pub http10: bool,

    /// Use HTTP/1.1 protocol
    #[arg(short = '2', long, group = "protocol")]
    pub http11: bool,

    /// Use GET request method (default)
    #[arg(short = 'G', long, group = "request_method")]
    pub get: bool,

    /// Use HEAD request method
    #[arg(short = 'H', long, group = "request_method")]
    pub head: bool,

    /// Use OPTIONS request method
    #[arg(short = 'O', long, group = "request_method")]
    pub options: bool,

    /// Use TRACE request method
    #[arg(long, group = "request_method")]
    pub trace: bool,

    /// Number of runtime worker threads (Default: available cores)
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Timeout for establishing each connection
    #[arg(short = 'C', long, value_parser = parse_duration, default_value = "20s")]
    pub connect_timeout: Duration,

    /// How long to wait for clients to report after the run ends (Default: the connect timeout)
    #[arg(long, value_parser = parse_duration)]
    pub grace: Option<Duration>,

    /// Don't print the elapsed time while running
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// URL to test
    pub url: String,
}

impl Cli {
    /// Turn parsed arguments into the engine's config and the target URL
    pub fn into_config(self) -> (BenchConfig, String) {
        let method = if self.trace {
            Method::Trace
        } else if self.options {
            Method::Options
        } else if self.head {
            Method::Head
        } else {
            Method::Get
        };

        let http_version = if self.http09 {
            HttpVersion::Http09
        } else if self.http11 {
            HttpVersion::Http11
        } else {
            HttpVersion::Http10
        };

        let clients = if self.clients == 0 {
            tracing::warn!("client count of 0 given, using {}", DEFAULT_CLIENTS);
            DEFAULT_CLIENTS
        } else {
            self.clients
        };

        let duration = if self.time.is_zero() {
            tracing::warn!("run time of 0 given, using {}s", DEFAULT_BENCH_TIME.as_secs());
            DEFAULT_BENCH_TIME
        } else {
            self.time
        };

        let connect_timeout = if self.connect_timeout.is_zero() {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            self.connect_timeout
        };

        // a client that just started connecting must be able to finish
        let report_grace = match self.grace {
            Some(grace) if grace < connect_timeout => {
                tracing::warn!(
                    "grace of {:?} is shorter than the connect timeout, using {:?}",
                    grace,
                    connect_timeout
                );
                connect_timeout
            }
            Some(grace) => grace,
            None => connect_timeout,
        };

        let threads = self
            .threads
            .filter(|n| *n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1);

        let config = BenchConfig {
            proxy: self.proxy,
            method,
            http_version,
            wait_for_response: !self.force,
            force_reload: self.reload,
            clients,
            duration,
            connect_timeout,
            threads,
            report_grace,
            show_progress: !self.quiet,
        };

        (config, self.url)
    }
}

/// Parse `server:port` for `--proxy`. Without a `:` the port defaults to 80.
pub fn parse_proxy(arg: &str) -> Result<Endpoint, ConfigError> {
    let Some(colon) = arg.rfind(':') else {
        return Ok(Endpoint::new(arg, DEFAULT_HTTP_PORT));
    };
    if colon == 0 {
        return Err(ConfigError::MissingProxyHost(arg.to_string()));
    }
    if colon == arg.len() - 1 {
        return Err(ConfigError::MissingProxyPort(arg.to_string()));
    }
    let port =
        leading_port(&arg[colon + 1..]).ok_or_else(|| ConfigError::InvalidProxyPort(arg.to_string()))?;
    Ok(Endpoint::new(&arg[..colon], port))
}

/// Leading decimal digits of `s` as a port; `None` when there are none, or
/// the value is zero or out of range
pub(crate) fn leading_port(s: &str) -> Option<u16> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    s[..digits].parse::<u16>().ok().filter(|port| *port != 0)
}

/// Parses a duration string like `10`, `10s`, `1m` or `1h`; a bare number is seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(duration_str.to_string());

    // nothing specified after the flag
    if duration_str.is_empty() {
        return Err(invalid());
    }

    // split into value and unit for (s, m, h)
    let (value_str, unit) = match duration_str.char_indices().last() {
        Some((idx, 's' | 'm' | 'h')) => duration_str.split_at(idx),
        _ => (duration_str, "s"),
    };
    let value: u64 = value_str.parse().map_err(|_| invalid())?;

    let secs = match unit {
        "m" => value.checked_mul(60),
        "h" => value.checked_mul(60 * 60),
        _ => Some(value),
    };
    secs.map(Duration::from_secs).ok_or_else(invalid)
}
