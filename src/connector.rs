//! Opening TCP connections and the per-connection steps a client performs

use std::io;
use std::net::{ IpAddr, SocketAddr };
use std::time::Duration;

use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::net::{ lookup_host, TcpStream };
use tokio::time::timeout;
use url::Host;

use crate::error::ConnectError;

/// Connects to `host` (a name or literal address) on `port`.
///
/// Names are resolved to a single address, preferring IPv4. Only that
/// address is tried.
pub async fn connect(
    host: &str,
    port: u16,
    connect_timeout: Duration
) -> Result<Connection, ConnectError> {
    let attempt = async {
        let addr = resolve(host, port).await?;
        let stream = TcpStream::connect(addr).await?;
        Ok::<_, ConnectError>(Connection { stream })
    };

    match timeout(connect_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(connect_timeout)),
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectError> {
    // bare IPv6 literals have no brackets, which Host::parse requires
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let parsed = Host::parse(host).map_err(|source| ConnectError::InvalidHost {
        host: host.to_string(),
        source,
    })?;

    let domain = match parsed {
        Host::Ipv4(ip) => {
            return Ok(SocketAddr::new(IpAddr::V4(ip), port));
        }
        Host::Ipv6(ip) => {
            return Ok(SocketAddr::new(IpAddr::V6(ip), port));
        }
        Host::Domain(domain) => domain,
    };

    let mut addrs = lookup_host((domain.as_str(), port)).await.map_err(|source| {
        ConnectError::Resolve { host: host.to_string(), source }
    })?;

    let first = addrs.next().ok_or_else(|| ConnectError::NoAddress(host.to_string()))?;
    if first.is_ipv4() {
        return Ok(first);
    }
    Ok(addrs.find(SocketAddr::is_ipv4).unwrap_or(first))
}

/// An open connection. Closing consumes it, so it is closed exactly once.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Writes the whole of `bytes`; a short write is an error
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Shuts down the write direction, leaving the read side open
    pub async fn half_close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Reads one chunk; `Ok(0)` means the peer closed the connection
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    /// Releases the socket, reporting any error still pending on it
    pub fn close(self) -> io::Result<()> {
        match self.stream.take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_connect_literal_ipv4() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        conn.close().unwrap();
    }

    #[tokio::test]
    async fn test_connect_by_name() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = connect("localhost", port, TIMEOUT).await.unwrap();
        conn.close().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ConnectError::Io(_)));
    }

    #[tokio::test]
    async fn test_connect_invalid_host() {
        let err = connect("", 80, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidHost { .. }));
    }

    #[tokio::test]
    async fn test_send_half_close_and_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap(); // ends on the client's half-close
            stream.write_all(b"pong").await.unwrap();
            received
        });

        let mut conn = connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        conn.send(b"ping").await.unwrap();
        conn.half_close().await.unwrap();

        let mut buf = [0u8; 16];
        let mut reply = Vec::new();
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..n]);
        }
        conn.close().unwrap();

        assert_eq!(reply, b"pong");
        assert_eq!(server.await.unwrap(), b"ping");
    }
}
