//! Upstream Connector: the byte-stream connection to the remote MUD.
//!
//! This layer interprets nothing. No line assembly, no ANSI stripping —
//! that is the Session's job on the bytes this module hands back raw.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::BrokerError;

/// Size of the read buffer used for each `recv` call.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Outcome of a single upstream write.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The bytes were written.
    Written,
    /// The outgoing buffer could not accept the write within
    /// `WRITE_TIMEOUT`; the caller should queue the command rather than
    /// treat the connector as dead.
    Backpressure,
    /// The connection is closed; any further write will also fail.
    Closed,
}

/// Read half of an open upstream connection.
#[derive(Debug)]
pub struct UpstreamReader {
    half: OwnedReadHalf,
}

impl UpstreamReader {
    /// Read the next chunk of raw bytes. Returns `None` on EOF or error
    /// (both terminal; the Session treats either as `CLOSED`).
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let mut buf = vec![0_u8; READ_CHUNK_SIZE];
        match self.half.read(&mut buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
        }
    }
}

/// Write half of an open upstream connection.
#[derive(Debug)]
pub struct UpstreamWriter {
    half: OwnedWriteHalf,
    write_timeout: Duration,
    closed: bool,
}

impl UpstreamWriter {
    /// Write `bytes` to upstream, bounded by the configured write
    /// timeout.
    pub async fn write(&mut self, bytes: &[u8]) -> WriteOutcome {
        if self.closed {
            return WriteOutcome::Closed;
        }
        match tokio::time::timeout(self.write_timeout, self.half.write_all(bytes)).await {
            Ok(Ok(())) => WriteOutcome::Written,
            Ok(Err(_)) => {
                self.closed = true;
                WriteOutcome::Closed
            }
            Err(_elapsed) => WriteOutcome::Backpressure,
        }
    }

    /// Idempotently close the connection.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.half.shutdown().await;
    }
}

/// Opens a TCP connection to `(host, port)`, bounded by `deadline`.
///
/// # Errors
///
/// Returns `BrokerError::UpstreamUnreachable` if the connect attempt
/// fails, or `BrokerError::UpstreamTimeout` if it does not complete
/// within `deadline`.
pub async fn open(
    host: &str,
    port: u16,
    deadline: Duration,
    write_timeout: Duration,
) -> Result<(UpstreamReader, UpstreamWriter), BrokerError> {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(deadline, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();
            Ok((
                UpstreamReader { half: read_half },
                UpstreamWriter {
                    half: write_half,
                    write_timeout,
                    closed: false,
                },
            ))
        }
        Ok(Err(e)) => Err(BrokerError::UpstreamUnreachable(e.to_string())),
        Err(_elapsed) => Err(BrokerError::UpstreamTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_connects_to_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accept = tokio::spawn(async move { listener.accept().await });

        let (reader, _writer) = open(
            "127.0.0.1",
            addr.port(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .expect("connects");
        drop(reader);

        accept.await.expect("join").expect("accepted");
    }

    #[tokio::test]
    async fn test_open_unreachable_port_fails() {
        // Port 0 connect attempts fail immediately on most platforms.
        let result = open(
            "127.0.0.1",
            1,
            Duration::from_millis(200),
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reader_yields_bytes_then_none_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            sock.write_all(b"hello\n").await.expect("write");
            drop(sock);
        });

        let (mut reader, _writer) = open(
            "127.0.0.1",
            addr.port(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .expect("connects");

        let chunk = reader.recv().await.expect("data");
        assert_eq!(chunk, b"hello\n");
        assert!(reader.recv().await.is_none());
        server.await.expect("join");
    }

    #[tokio::test]
    async fn test_write_after_close_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let _ = listener.accept().await.expect("accept");
        });

        let (_reader, mut writer) = open(
            "127.0.0.1",
            addr.port(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .expect("connects");

        writer.close().await;
        assert_eq!(writer.write(b"x").await, WriteOutcome::Closed);
        server.await.expect("join");
    }
}
