//! Error types for pagebench

use std::io;

use thiserror::Error;

use crate::config::Endpoint;

/// Why a URL could not be turned into a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("{0}: is an illegal URL")]
    MalformedUrl(String),

    #[error("URL too long ({0} bytes, at most {max})", max = crate::request::MAX_URL_LEN)]
    TooLong(usize),

    #[error("{0}: only http:// URLs are supported without a proxy server")]
    UnsupportedScheme(String),

    #[error("{0}: hostname does not end with '/'")]
    MissingPath(String),
}

/// Failure to open a connection. Workers count these without looking inside.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("invalid host {host:?}: {source}")]
    InvalidHost {
        host: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} did not resolve to any address")]
    NoAddress(String),

    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connect failed: {0}")]
    Io(#[from] io::Error),
}

/// Invalid values handed to the command line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("proxy server {0}: missing host name")]
    MissingProxyHost(String),

    #[error("proxy server {0}: missing port number")]
    MissingProxyPort(String),

    #[error("proxy server {0}: invalid port number")]
    InvalidProxyPort(String),

    #[error("invalid duration {0:?} (use e.g. 10, 10s, 1m, 1h)")]
    InvalidDuration(String),
}

/// Errors that abort a whole run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("connection to {endpoint} failed, test interrupted: {source}")]
    TargetUnreachable {
        endpoint: Endpoint,
        #[source]
        source: ConnectError,
    },

    #[error("failed to create runtime: {0}")]
    Runtime(#[source] io::Error),
}

impl RunError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> i32 {
        3
    }
}
