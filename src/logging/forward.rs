//! Forwarding sink: pushes the local log stream to a remote receiver.
//!
//! The sink hands records to a background task over a bounded queue. The
//! task keeps one connection open (reconnecting on failure), sends a
//! heartbeat when the stream is quiet, and deregisters the sink once
//! `idle_timeout` passes without a successful delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{LogFrame, LogRecord, LogSink, LogSinkRegistry, SinkId};
use crate::command::ResponseDescriptor;
use crate::error::{Result, ScriptingError};
use crate::transport::{send_message, with_timeout};

/// Records queued beyond this are dropped.
const QUEUE_CAPACITY: usize = 1024;

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Sink side of a forwarder.
#[derive(Debug)]
pub struct ForwardingSink {
    tx: mpsc::Sender<LogRecord>,
}

impl LogSink for ForwardingSink {
    fn accept(&self, record: &LogRecord) {
        // Full or closed queue: the record is dropped.
        let _ = self.tx.try_send(record.clone());
    }
}

/// Register a forwarding sink for `destination` and start its task.
///
/// Must be called from within a tokio runtime.
pub fn start_forwarding(
    registry: &Arc<LogSinkRegistry>,
    destination: ResponseDescriptor,
    idle_timeout: Duration,
    connect_timeout: Duration,
) -> SinkId {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let id = registry.add_sink(Arc::new(ForwardingSink { tx }));
    info!(sink = id, %destination, timeout = ?idle_timeout, "Started log forwarding");

    let forwarder = Forwarder {
        destination,
        idle_timeout,
        connect_timeout,
        stream: None,
    };
    tokio::spawn(forwarder.run(rx, id, Arc::clone(registry)));
    id
}

struct Forwarder {
    destination: ResponseDescriptor,
    idle_timeout: Duration,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl Forwarder {
    async fn run(mut self, mut rx: mpsc::Receiver<LogRecord>, id: SinkId, registry: Arc<LogSinkRegistry>) {
        let mut ticker = tokio::time::interval((self.idle_timeout / 3).max(MIN_HEARTBEAT));
        ticker.tick().await;
        let mut last_contact = Instant::now();

        loop {
            let frame = tokio::select! {
                record = rx.recv() => match record {
                    Some(record) => LogFrame::Record { record },
                    None => break,
                },
                _ = ticker.tick() => LogFrame::Heartbeat,
            };

            match self.deliver(&frame).await {
                Ok(()) => last_contact = Instant::now(),
                Err(e) => debug!(destination = %self.destination, error = %e, "Log delivery failed"),
            }

            if last_contact.elapsed() > self.idle_timeout {
                info!(
                    sink = id,
                    destination = %self.destination,
                    "No contact with log receiver, stopping forwarding"
                );
                break;
            }
        }

        registry.remove_sink(id);
    }

    async fn deliver(&mut self, frame: &LogFrame) -> Result<()> {
        let bytes = serde_json::to_vec(frame)?;
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let target = (self.destination.host.as_str(), self.destination.port);
                with_timeout("connect", self.connect_timeout, async {
                    TcpStream::connect(target).await.map_err(ScriptingError::from)
                })
                .await?
            }
        };
        with_timeout("write", self.connect_timeout, send_message(&mut stream, &bytes)).await?;
        self.stream = Some(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::transport::recv_message;

    #[tokio::test]
    async fn records_reach_the_receiver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = Arc::new(LogSinkRegistry::new());

        start_forwarding(
            &registry,
            ResponseDescriptor {
                host: "127.0.0.1".into(),
                port,
            },
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        registry.publish(&LogRecord::now("INFO", "host", "hello"));

        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let bytes = recv_message(&mut stream).await.unwrap();
            match serde_json::from_slice::<LogFrame>(&bytes).unwrap() {
                LogFrame::Record { record } => {
                    assert_eq!(record.message, "hello");
                    break;
                }
                LogFrame::Heartbeat => continue,
            }
        }
    }

    #[tokio::test]
    async fn unreachable_receiver_deregisters_sink() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let registry = Arc::new(LogSinkRegistry::new());
        let id = start_forwarding(
            &registry,
            ResponseDescriptor {
                host: "127.0.0.1".into(),
                port,
            },
            Duration::from_millis(60),
            Duration::from_millis(50),
        );
        assert!(registry.contains(id));

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.contains(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sink should deregister after idle timeout");
    }
}
