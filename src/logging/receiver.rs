//! Log receiver on the controlling host.
//!
//! Accepts connections from a remote forwarding sink and re-emits each
//! received record into the local `tracing` stream under the
//! `flowlink::remote` target. Stops once `idle_timeout` passes without a
//! frame (records and heartbeats both count).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{LogFrame, LogRecord};
use crate::error::{Result, ScriptingError};
use crate::transport::recv_message;

/// Target used when re-emitting remote records.
pub const REMOTE_TARGET: &str = "flowlink::remote";

/// Listener for a remote host's log stream.
#[derive(Debug)]
pub struct LogReceiver {
    listener: TcpListener,
    observer: Option<mpsc::UnboundedSender<LogRecord>>,
}

impl LogReceiver {
    /// Bind the listening socket. Fails if the port is unavailable.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            ScriptingError::Config(format!("cannot bind log receiver on {host}:{port}: {e}"))
        })?;
        Ok(Self {
            listener,
            observer: None,
        })
    }

    /// Also deliver every received record to `tx`.
    #[must_use]
    pub fn with_observer(mut self, tx: mpsc::UnboundedSender<LogRecord>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the receiver on its own task.
    pub fn spawn(self, idle_timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(self.run(idle_timeout))
    }

    async fn run(self, idle_timeout: Duration) {
        let port = self.listener.local_addr().map(|a| a.port()).unwrap_or_default();
        info!(port, "Log receiver listening");

        loop {
            let (stream, peer) = match timeout(idle_timeout, self.listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    warn!(port, error = %e, "Log receiver accept failed");
                    continue;
                }
                Err(_) => break,
            };
            debug!(port, %peer, "Log forwarder connected");
            if !self.drain(stream, peer, idle_timeout).await {
                break;
            }
        }

        info!(port, "Log receiver idle, shutting down");
    }

    /// Read frames until the peer disconnects (returns `true`) or the idle
    /// timeout fires (returns `false`).
    async fn drain(&self, mut stream: TcpStream, peer: SocketAddr, idle_timeout: Duration) -> bool {
        loop {
            let bytes = match timeout(idle_timeout, recv_message(&mut stream)).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "Log forwarder disconnected");
                    return true;
                }
                Err(_) => return false,
            };
            match serde_json::from_slice::<LogFrame>(&bytes) {
                Ok(LogFrame::Record { record }) => self.emit(record, peer),
                Ok(LogFrame::Heartbeat) => trace!(%peer, "Heartbeat"),
                Err(e) => warn!(%peer, error = %e, "Malformed log frame"),
            }
        }
    }

    fn emit(&self, record: LogRecord, peer: SocketAddr) {
        let origin = record.target.as_str();
        let message = record.message.as_str();
        match record.level.as_str() {
            "ERROR" => tracing::error!(target: REMOTE_TARGET, remote = %peer, origin, "{message}"),
            "WARN" => tracing::warn!(target: REMOTE_TARGET, remote = %peer, origin, "{message}"),
            "DEBUG" => tracing::debug!(target: REMOTE_TARGET, remote = %peer, origin, "{message}"),
            "TRACE" => tracing::trace!(target: REMOTE_TARGET, remote = %peer, origin, "{message}"),
            _ => tracing::info!(target: REMOTE_TARGET, remote = %peer, origin, "{message}"),
        }
        if let Some(tx) = &self.observer {
            let _ = tx.send(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::send_message;

    #[tokio::test]
    async fn occupied_port_fails_to_bind() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = LogReceiver::bind("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ScriptingError::Config(_)));
    }

    #[tokio::test]
    async fn received_records_reach_observer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = LogReceiver::bind("127.0.0.1", 0).await.unwrap().with_observer(tx);
        let addr = receiver.local_addr().unwrap();
        let task = receiver.spawn(Duration::from_millis(200));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let heartbeat = serde_json::to_vec(&LogFrame::Heartbeat).unwrap();
        send_message(&mut stream, &heartbeat).await.unwrap();
        let record = LogRecord::now("WARN", "remote::host", "disk almost full");
        let frame = serde_json::to_vec(&LogFrame::Record {
            record: record.clone(),
        })
        .unwrap();
        send_message(&mut stream, &frame).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), record);

        // Idle timeout ends the task.
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("receiver should stop when idle")
            .unwrap();
    }
}
