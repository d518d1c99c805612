// Bounded connection acquisition with guaranteed release
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::debug;

use crate::probe::dialer::{BoxedStream, Dialer, Network, ProbeStream};
use crate::probe::error::DialError;

/// Dial deadline and decode timeout applied to every probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Format `host:port`, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// A stream owned by exactly one probe.
///
/// The stream is closed once: by `close()` on the normal path, otherwise by
/// `Drop` (early return, cancelled future, or unwinding panic).
pub struct ScopedConnection {
    stream: BoxedStream,
    address: String,
    shut_down: bool,
}

impl ScopedConnection {
    fn new(stream: BoxedStream, address: String) -> Self {
        Self {
            stream,
            address,
            shut_down: false,
        }
    }

    /// Mutable access to the underlying stream for the decoder.
    pub fn stream(&mut self) -> &mut dyn ProbeStream {
        &mut *self.stream
    }

    /// Shut down the write half, then release the socket.
    pub async fn close(mut self) {
        let _ = timeout(Duration::from_secs(1), self.stream.shutdown()).await;
        self.shut_down = true;
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        // The stream field is dropped right after this, which closes the socket.
        if self.shut_down {
            debug!("closed connection to {}", self.address);
        } else {
            debug!("released connection to {} without shutdown", self.address);
        }
    }
}

/// Open exactly one TCP connection to `host:port` through `dialer`, bounded
/// by `deadline`. Connections are never pooled or reused.
pub async fn acquire(
    dialer: &dyn Dialer,
    host: &str,
    port: u16,
    deadline: Duration,
) -> Result<ScopedConnection, DialError> {
    let address = join_host_port(host, port);

    match timeout(deadline, dialer.dial(Network::Tcp, &address, deadline)).await {
        Ok(Ok(stream)) => {
            debug!("connected to {}", address);
            Ok(ScopedConnection::new(stream, address))
        }
        Ok(Err(e)) => {
            debug!("dial {} failed: {}", address, e);
            Err(e)
        }
        Err(_) => {
            debug!("dial {} timed out after {:?}", address, deadline);
            Err(DialError::Timeout(deadline))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct SlowDialer;

    #[async_trait]
    impl Dialer for SlowDialer {
        async fn dial(
            &self,
            _network: Network,
            _address: &str,
            _deadline: Duration,
        ) -> Result<BoxedStream, DialError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(DialError::Io("unreachable".to_string()))
        }
    }

    struct CountingStream {
        inner: tokio::io::DuplexStream,
        closes: Arc<AtomicUsize>,
    }

    impl Drop for CountingStream {
        fn drop(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl tokio::io::AsyncRead for CountingStream {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for CountingStream {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    struct DuplexDialer {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for DuplexDialer {
        async fn dial(
            &self,
            _network: Network,
            _address: &str,
            _deadline: Duration,
        ) -> Result<BoxedStream, DialError> {
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(CountingStream {
                inner: client,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("acme.test", 3389), "acme.test:3389");
        assert_eq!(join_host_port("10.0.0.1", 3389), "10.0.0.1:3389");
        assert_eq!(join_host_port("::1", 3389), "[::1]:3389");
        assert_eq!(join_host_port("[::1]", 3389), "[::1]:3389");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let result = acquire(&SlowDialer, "acme.test", 3389, DEFAULT_PROBE_TIMEOUT).await;
        assert!(matches!(result, Err(DialError::Timeout(d)) if d == DEFAULT_PROBE_TIMEOUT));
    }

    #[tokio::test]
    async fn test_close_releases_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let dialer = DuplexDialer { closes: Arc::clone(&closes) };

        let conn = acquire(&dialer, "acme.test", 3389, DEFAULT_PROBE_TIMEOUT).await.unwrap();
        conn.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let conn = acquire(&dialer, "acme.test", 3389, DEFAULT_PROBE_TIMEOUT).await.unwrap();
        drop(conn);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
