//! Building the request every client sends
//!
//! The request is assembled once, byte for byte, from the URL and the
//! benchmark settings. A typical HTTP/1.1 request looks like:
//!
//! ```text
//! GET /index.html HTTP/1.1
//! User-Agent: pagebench/1.0.0
//! Host: example.com
//! Connection: close
//! ```

use std::sync::Arc;

use crate::config::{ BenchConfig, Endpoint, HttpVersion, Method, DEFAULT_HTTP_PORT, leading_port };
use crate::error::BuildError;

pub const MAX_URL_LEN: usize = 1500;
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const SCHEME_SEPARATOR: &str = "://";

/// The wire bytes plus where to send them
#[derive(Debug, Clone)]
pub struct Request {
    bytes: Arc<[u8]>,
    method: Method,
    version: HttpVersion, // effective version after upgrades
    target: Endpoint, // host and port named by the URL
    connect_to: Endpoint, // the proxy when one is configured, the target otherwise
}

impl Request {
    /// Validates `url` and builds the request described by `config`
    pub fn build(url: &str, config: &BenchConfig) -> Result<Self, BuildError> {
        let via_proxy = config.proxy.is_some();

        let Some(scheme_end) = url.find(SCHEME_SEPARATOR) else {
            return Err(BuildError::MalformedUrl(url.to_string()));
        };
        if url.len() > MAX_URL_LEN {
            return Err(BuildError::TooLong(url.len()));
        }
        if !via_proxy && !url[..scheme_end].eq_ignore_ascii_case("http") {
            return Err(BuildError::UnsupportedScheme(url.to_string()));
        }

        let rest = &url[scheme_end + SCHEME_SEPARATOR.len()..];
        let Some(path_start) = rest.find('/') else {
            return Err(BuildError::MissingPath(url.to_string()));
        };
        let authority = &rest[..path_start];

        // A port only counts when its ':' comes before the path
        let target = match authority.find(':') {
            Some(colon) => {
                let port = leading_port(&authority[colon + 1..]).unwrap_or(DEFAULT_HTTP_PORT);
                Endpoint::new(&authority[..colon], port)
            }
            None => Endpoint::new(authority, DEFAULT_HTTP_PORT),
        };

        let version = effective_version(config);
        if version != config.http_version {
            tracing::debug!(
                requested = %config.http_version,
                effective = %version,
                method = %config.method,
                "Upgraded protocol version"
            );
        }

        let request_target = if via_proxy { url } else { &rest[path_start..] };

        let mut request = String::with_capacity(url.len() + 128);
        request.push_str(config.method.as_str());
        request.push(' ');
        request.push_str(request_target);
        if let Some(suffix) = version.request_line_suffix() {
            request.push(' ');
            request.push_str(suffix);
        }
        request.push_str("\r\n");

        if version >= HttpVersion::Http10 {
            request.push_str("User-Agent: ");
            request.push_str(USER_AGENT);
            request.push_str("\r\n");
        }
        if !via_proxy && version >= HttpVersion::Http10 {
            request.push_str("Host: ");
            request.push_str(&target.host);
            request.push_str("\r\n");
        }
        if config.force_reload && via_proxy {
            request.push_str("Pragma: no-cache\r\n");
        }
        // one request per connection, connection setup is part of the workload
        if version >= HttpVersion::Http11 {
            request.push_str("Connection: close\r\n");
        }
        if version >= HttpVersion::Http10 {
            request.push_str("\r\n");
        }

        let connect_to = config.proxy.clone().unwrap_or_else(|| target.clone());

        Ok(Self {
            bytes: Arc::from(request.into_bytes()),
            method: config.method,
            version,
            target,
            connect_to,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    pub fn connect_to(&self) -> &Endpoint {
        &self.connect_to
    }
}

/// Raises the configured version to what the method and reload mode need
fn effective_version(config: &BenchConfig) -> HttpVersion {
    let mut version = config.http_version;
    if config.force_reload && config.proxy.is_some() {
        version = version.max(HttpVersion::Http10);
    }
    match config.method {
        Method::Head => version.max(HttpVersion::Http10),
        Method::Options | Method::Trace => version.max(HttpVersion::Http11),
        Method::Get => version,
    }
}
