//! TCP connection establishment with bounded retries.

use revrpc_core::{RpcError, RpcResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Default pause between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Connect to `host:port`, making at least one and at most
/// `policy.attempts` attempts.
pub async fn connect(host: &str, port: u16, policy: RetryPolicy) -> RpcResult<TcpStream> {
    let addr = format!("{host}:{port}");
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!(addr = %addr, attempt, "connected");
                return Ok(stream);
            }
            Err(e) if attempt < attempts => {
                debug!(addr = %addr, attempt, error = %e, "connect failed, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                warn!(addr = %addr, attempts, error = %e, "giving up on connect");
                return Err(RpcError::Connect {
                    addr,
                    attempts,
                    source: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect("127.0.0.1", port, RetryPolicy::new(1)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn exhausts_retries() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let policy = RetryPolicy::new(3).with_delay(Duration::from_millis(10));
        match connect("127.0.0.1", port, policy).await {
            Err(RpcError::Connect { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_retries_still_tries_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(connect("127.0.0.1", port, RetryPolicy::new(0)).await.is_ok());
    }
}
