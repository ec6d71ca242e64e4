use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};

use crate::protocol::error::{Result, WarprpcError};

/// Default timeout for establishing TCP connections (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Async TCP connector shared by the RPC client and the registry backend.
///
/// # Example
///
/// ```no_run
/// use warprpc_common::transport::TcpTransport;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new();
/// let stream = transport.connect("127.0.0.1:9000").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connects to a remote endpoint.
    ///
    /// The address may resolve to several socket addresses; each is tried in
    /// turn until one accepts. Name resolution runs on tokio's resolver and
    /// counts against the connect timeout. Nagle is disabled on the returned
    /// stream since envelopes are written whole.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The address cannot be parsed or resolved
    /// - Connection fails (or times out) for every resolved address
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let socket_addrs = match tokio::time::timeout(self.connect_timeout, lookup_host(addr)).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(e)) => {
                return Err(WarprpcError::Connection(format!(
                    "Invalid address '{}': {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(WarprpcError::Connection(format!(
                    "Resolving '{}' timed out after {}ms",
                    addr,
                    self.connect_timeout.as_millis()
                )))
            }
        };

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    last_err = Some(format!(
                        "timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ));
                }
            }
        }

        Err(WarprpcError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }

    /// Map IO errors to appropriate WarprpcError variants
    ///
    /// - Connection resets/aborts/EOF -> `ConnectionLost`
    /// - Other IO errors -> `Io`
    pub fn map_io_error(err: std::io::Error, context: &str) -> WarprpcError {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => {
                WarprpcError::ConnectionLost(format!("{}: {}", context, err))
            }
            _ => WarprpcError::Io(err),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorKind;

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let transport = TcpTransport::new();
        let stream = transport.connect(&addr).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_by_hostname() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = TcpTransport::new().with_connect_timeout(Duration::from_secs(2));
        let stream = transport.connect(&format!("localhost:{}", port)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_connect_invalid_address() {
        let transport = TcpTransport::new();
        let err = transport.connect("not an address").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port that is very likely closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new().with_connect_timeout(Duration::from_millis(500));
        assert!(transport.connect(&addr).await.is_err());
    }

    #[test]
    fn test_map_io_error() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            TcpTransport::map_io_error(reset, "reading"),
            WarprpcError::ConnectionLost(_)
        ));
        let other = std::io::Error::new(std::io::ErrorKind::Other, "other");
        assert!(matches!(TcpTransport::map_io_error(other, "reading"), WarprpcError::Io(_)));
    }
}
