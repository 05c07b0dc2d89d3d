//! Transport layer for delivering commands between hosts.
//!
//! Provides the `Connection` trait, length-prefixed framing, and two
//! strategies: `DefaultConnection` (one socket per call to a fixed host)
//! and `LoadBalancer` (round-robin over a pool of connections).

pub mod balancer;
pub mod direct;

pub use balancer::LoadBalancer;
pub use direct::DefaultConnection;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Command;
use crate::error::{Result, ScriptingError};

/// Maximum message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Strategy for physically delivering commands.
///
/// Each call opens, uses and closes its own socket; implementations keep no
/// partial state between calls.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Transmit a command's request.
    ///
    /// Returns once the remote side has acknowledged the frame, or, for
    /// response-bearing commands without a response descriptor, once the
    /// inline reply has been consumed into `command`.
    async fn send_request(&self, command: &mut dyn Command) -> Result<()>;

    /// Transmit a command's attached response.
    async fn send_response(&self, command: &dyn Command) -> Result<()>;
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        ScriptingError::Protocol(format!("Message too large: {} bytes", payload.len()))
    })?;
    if len > MAX_MESSAGE_SIZE {
        return Err(ScriptingError::Protocol(format!(
            "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
        )));
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(ScriptingError::Protocol(format!(
            "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Run a socket operation under a timeout, mapping expiry and I/O failures
/// to transport errors.
pub async fn with_timeout<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(ScriptingError::Io(e))) => Err(ScriptingError::Transport(format!("{operation}: {e}"))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ScriptingError::timeout(operation, timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_framing() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        send_message(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn empty_payload() {
        let mut buf = Vec::new();
        send_message(&mut buf, b"").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut buf = (MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(b"junk");

        let mut cursor = std::io::Cursor::new(buf);
        let err = recv_message(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ScriptingError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_message_is_io_error() {
        let mut buf = 10_u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"short");

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            recv_message(&mut cursor).await,
            Err(ScriptingError::Io(_))
        ));
    }

    #[tokio::test]
    async fn with_timeout_reports_operation() {
        let err = with_timeout("read", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), ScriptingError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ScriptingError::Timeout { operation: "read", .. }));
    }
}
