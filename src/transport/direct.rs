//! Point-to-point connection.
//!
//! Opens a fresh TCP socket per call, writes one frame, reads one reply
//! frame, and closes. Every step runs under an explicit timeout.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use super::{recv_message, send_message, with_timeout, Connection};
use crate::codec::{CommandProcessor, Decoded};
use crate::command::{Command, ResponseDescriptor, ResponseStatus};
use crate::config::ConnectionSettings;
use crate::error::{Result, ScriptingError};

/// Connection to a single remote engine.
#[derive(Debug, Clone)]
pub struct DefaultConnection {
    host: String,
    port: u16,
    settings: ConnectionSettings,
    processor: Arc<CommandProcessor>,
}

impl DefaultConnection {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        settings: ConnectionSettings,
        processor: Arc<CommandProcessor>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            settings,
            processor,
        }
    }

    /// Connection to the endpoint named by a response descriptor.
    pub fn to_descriptor(
        descriptor: &ResponseDescriptor,
        settings: ConnectionSettings,
        processor: Arc<CommandProcessor>,
    ) -> Self {
        Self::new(descriptor.host.clone(), descriptor.port, settings, processor)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    fn check(&self) -> Result<()> {
        if self.host.is_empty() || self.port == 0 {
            return Err(ScriptingError::Config(format!(
                "invalid connection target '{}:{}'",
                self.host, self.port
            )));
        }
        Ok(())
    }

    async fn connect(&self) -> Result<TcpStream> {
        let target = (self.host.as_str(), self.port);
        with_timeout("connect", self.settings.connect_timeout, async {
            Ok::<_, ScriptingError>(TcpStream::connect(target).await?)
        })
        .await
    }

    /// Write one frame and read the single reply frame.
    async fn exchange(&self, frame: &[u8]) -> Result<Decoded> {
        let mut stream = self.connect().await?;
        with_timeout(
            "write",
            self.settings.read_timeout,
            send_message(&mut stream, frame),
        )
        .await?;
        let reply = with_timeout("read", self.settings.read_timeout, recv_message(&mut stream)).await?;
        self.processor.decode(&reply)
    }
}

fn check_ack(tag: &str, status: ResponseStatus) -> Result<()> {
    match status {
        ResponseStatus::Success => Ok(()),
        ResponseStatus::Failed(message) => Err(ScriptingError::Transport(format!(
            "remote rejected {tag}: {message}"
        ))),
    }
}

#[async_trait]
impl Connection for DefaultConnection {
    #[instrument(skip(self, command), fields(host = %self.host, port = self.port, command = command.type_tag()))]
    async fn send_request(&self, command: &mut dyn Command) -> Result<()> {
        self.check()?;
        let frame = self.processor.encode_request(command);
        debug!(bytes = frame.len(), "Sending request");

        match self.exchange(&frame).await? {
            Decoded::Ack { tag, status } => check_ack(&tag, status),
            Decoded::Response { response, .. } => {
                debug!("Received inline response");
                command.consume_response(response)
            }
            Decoded::Request(other) => Err(ScriptingError::Protocol(format!(
                "expected reply to {}, got {} request",
                command.type_tag(),
                other.type_tag()
            ))),
        }
    }

    #[instrument(skip(self, command), fields(host = %self.host, port = self.port, command = command.type_tag()))]
    async fn send_response(&self, command: &dyn Command) -> Result<()> {
        self.check()?;
        let frame = self.processor.encode_response(command)?;
        debug!(bytes = frame.len(), "Sending response");

        match self.exchange(&frame).await? {
            Decoded::Ack { tag, status } => check_ack(&tag, status),
            _ => Err(ScriptingError::Protocol(format!(
                "expected ack for {} response",
                command.type_tag()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::command::{CommandResponse, Ping, Stop};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(300),
            response_timeout: Duration::from_secs(2),
        }
    }

    async fn fake_remote(reply: Option<Vec<u8>>) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let received = recv_message(&mut stream).await.unwrap();
            match reply {
                Some(bytes) => send_message(&mut stream, &bytes).await.unwrap(),
                None => tokio::time::sleep(Duration::from_secs(2)).await,
            }
            received
        });
        (port, task)
    }

    #[tokio::test]
    async fn request_is_acknowledged() {
        let processor = Arc::new(CommandProcessor::default());
        let ack = processor.encode_ack("stop", &ResponseStatus::Success);
        let (port, remote) = fake_remote(Some(ack)).await;

        let connection = DefaultConnection::new("127.0.0.1", port, settings(), Arc::clone(&processor));
        let mut stop = Stop::default();
        connection.send_request(&mut stop).await.unwrap();

        let received = remote.await.unwrap();
        assert!(matches!(processor.decode(&received).unwrap(), Decoded::Request(c) if c.type_tag() == "stop"));
    }

    #[tokio::test]
    async fn inline_response_is_consumed() {
        let processor = Arc::new(CommandProcessor::default());
        let mut answered = Ping::default();
        answered.base_mut().set_response(CommandResponse::success(Vec::new()));
        let reply = processor.encode_response(&answered).unwrap();
        let (port, _remote) = fake_remote(Some(reply)).await;

        let connection = DefaultConnection::new("127.0.0.1", port, settings(), processor);
        let mut ping = Ping::default();
        connection.send_request(&mut ping).await.unwrap();
        assert!(ping.response().is_some_and(CommandResponse::is_success));
    }

    #[tokio::test]
    async fn rejected_ack_is_an_error() {
        let processor = Arc::new(CommandProcessor::default());
        let nack = processor.encode_ack("stop", &ResponseStatus::Failed("bad frame".into()));
        let (port, _remote) = fake_remote(Some(nack)).await;

        let connection = DefaultConnection::new("127.0.0.1", port, settings(), processor);
        let err = connection.send_request(&mut Stop::default()).await.unwrap_err();
        assert!(err.to_string().contains("bad frame"));
    }

    #[tokio::test]
    async fn silent_remote_times_out() {
        let (port, _remote) = fake_remote(None).await;
        let connection =
            DefaultConnection::new("127.0.0.1", port, settings(), Arc::new(CommandProcessor::default()));
        let err = connection.send_request(&mut Stop::default()).await.unwrap_err();
        assert!(matches!(err, ScriptingError::Timeout { operation: "read", .. }));
    }

    #[tokio::test]
    async fn unreachable_remote_is_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let connection =
            DefaultConnection::new("127.0.0.1", port, settings(), Arc::new(CommandProcessor::default()));
        let err = connection.send_request(&mut Stop::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ScriptingError::Transport(_) | ScriptingError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_target_fails_before_io() {
        let connection =
            DefaultConnection::new("", 0, settings(), Arc::new(CommandProcessor::default()));
        let err = connection.send_request(&mut Stop::default()).await.unwrap_err();
        assert!(matches!(err, ScriptingError::Config(_)));
    }

    #[tokio::test]
    async fn send_response_requires_attached_response() {
        let connection =
            DefaultConnection::new("127.0.0.1", 9, settings(), Arc::new(CommandProcessor::default()));
        let err = connection.send_response(&Ping::default()).await.unwrap_err();
        assert!(matches!(err, ScriptingError::Handler(_)));
    }
}
