//! Scripting engine: listens on a port and dispatches incoming commands.
//!
//! One engine owns one listening socket and one accept task. Connections
//! are served one at a time on that task: read one frame, decode it, run
//! the handler chain and the command, reply. A bad frame or a failing
//! command is logged and the loop moves on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::codec::{CommandProcessor, Decoded};
use crate::command::{Command, CommandKind, CommandResponse, ResponseStatus};
use crate::config::{ConnectionSettings, EngineSettings};
use crate::error::{Result, ScriptingError};
use crate::handler::{
    MultiRequestHandler, MultiResponseHandler, RequestHandler, ResponseHandler,
};
use crate::host::HostContext;
use crate::transport::{recv_message, send_message, with_timeout, Connection, DefaultConnection};

/// Lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Listening,
    Stopping,
    Stopped,
}

/// Listener and dispatcher for remote commands.
pub struct ScriptingEngine {
    settings: EngineSettings,
    connection_settings: ConnectionSettings,
    context: Arc<HostContext>,
    processor: Arc<CommandProcessor>,
    request_handler: MultiRequestHandler,
    response_handler: MultiResponseHandler,
    state: watch::Sender<EngineState>,
    shutdown: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    stop_after_responses: Option<usize>,
    responses_seen: AtomicUsize,
}

impl ScriptingEngine {
    pub fn new(
        settings: EngineSettings,
        context: Arc<HostContext>,
        processor: Arc<CommandProcessor>,
    ) -> Self {
        Self {
            settings,
            connection_settings: ConnectionSettings::default(),
            context,
            processor,
            request_handler: MultiRequestHandler::default(),
            response_handler: MultiResponseHandler::default(),
            state: watch::Sender::new(EngineState::Created),
            shutdown: watch::Sender::new(false),
            local_addr: Mutex::new(None),
            stop_after_responses: None,
            responses_seen: AtomicUsize::new(0),
        }
    }

    /// Settings for connections the engine opens to deliver responses.
    #[must_use]
    pub const fn with_connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection_settings = settings;
        self
    }

    #[must_use]
    pub fn with_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.request_handler.push(handler);
        self
    }

    #[must_use]
    pub fn with_response_handler(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.response_handler.push(handler);
        self
    }

    /// Stop the engine after it has processed `count` responses.
    #[must_use]
    pub const fn stop_after_responses(mut self, count: usize) -> Self {
        self.stop_after_responses = Some(count);
        self
    }

    pub const fn context(&self) -> &Arc<HostContext> {
        &self.context
    }

    pub const fn processor(&self) -> &Arc<CommandProcessor> {
        &self.processor
    }

    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Whether [`ScriptingEngine::stop_execution`] has been called.
    pub fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Address the engine is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the accept loop is running and return its address.
    ///
    /// Fails if the engine stops without ever listening (bind failure).
    pub async fn wait_until_listening(&self) -> Result<SocketAddr> {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                EngineState::Listening => {
                    return self.local_addr().ok_or_else(|| {
                        ScriptingError::Config("engine listening without an address".into())
                    });
                }
                EngineState::Stopping | EngineState::Stopped if self.local_addr().is_none() => {
                    return Err(ScriptingError::Config(format!(
                        "engine on port {} stopped before listening",
                        self.settings.port
                    )));
                }
                EngineState::Stopping | EngineState::Stopped => {
                    return Err(ScriptingError::Config("engine already stopped".into()));
                }
                EngineState::Created => {}
            }
            if state.changed().await.is_err() {
                return Err(ScriptingError::Config("engine dropped".into()));
            }
        }
    }

    /// Signal the accept loop to exit. Wakes a blocked accept immediately.
    pub fn stop_execution(&self) {
        info!(port = self.settings.port, "Stopping scripting engine");
        self.shutdown.send_replace(true);
        self.state.send_if_modified(|state| {
            if matches!(state, EngineState::Created | EngineState::Listening) {
                *state = EngineState::Stopping;
                true
            } else {
                false
            }
        });
    }

    /// Bind the configured port and serve connections until stopped.
    pub async fn execute(&self) -> Result<()> {
        let host = self.settings.bind_host.as_str();
        let port = self.settings.port;
        let listener = match TcpListener::bind((host, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.send_replace(EngineState::Stopped);
                return Err(ScriptingError::Config(format!(
                    "cannot bind scripting engine on {host}:{port}: {e}"
                )));
            }
        };
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);

        let mut shutdown = self.shutdown.subscribe();
        if !*shutdown.borrow_and_update() {
            self.state.send_replace(EngineState::Listening);
            info!(%addr, "Scripting engine listening");
        }

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                _ = shutdown.changed() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.serve(stream, peer).await,
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }

        self.state.send_replace(EngineState::Stopped);
        info!(%addr, "Scripting engine stopped");
        Ok(())
    }

    /// Serve one connection: read a frame, dispatch, reply.
    #[instrument(skip(self, stream), fields(port = self.settings.port))]
    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) {
        let bytes = match with_timeout("read", self.settings.io_timeout, recv_message(&mut stream)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%peer, error = %e, "Failed to read command");
                return;
            }
        };

        match self.processor.decode(&bytes) {
            Ok(Decoded::Request(command)) => self.dispatch_request(command, &mut stream).await,
            Ok(Decoded::Response { command, response }) => {
                self.dispatch_response(command, response, &mut stream).await;
            }
            Ok(Decoded::Ack { tag, .. }) => {
                warn!(%peer, command = %tag, "Unexpected ack, closing connection");
            }
            Err(e) => {
                warn!(%peer, error = %e, "Undecodable command, closing connection");
                let nack = self.processor.encode_ack("unknown", &ResponseStatus::Failed(e.to_string()));
                self.reply(&mut stream, &nack).await;
            }
        }
    }

    async fn reply(&self, stream: &mut TcpStream, frame: &[u8]) {
        if let Err(e) = with_timeout("write", self.settings.io_timeout, send_message(stream, frame)).await {
            warn!(error = %e, "Failed to write reply");
        }
    }

    async fn dispatch_request(&self, mut command: Box<dyn Command>, stream: &mut TcpStream) {
        let tag = command.type_tag();
        let _ = self.request_handler.handle_request(command.as_ref());

        // Without a descriptor the response goes back on this socket instead
        // of an ack.
        let inline = command.expects_response() && command.response_descriptor().is_none();
        if !inline {
            let ack = self.processor.encode_ack(tag, &ResponseStatus::Success);
            self.reply(stream, &ack).await;
        }

        let outcome = command.handle(self).await;

        match command.kind() {
            CommandKind::FireAndForget => {
                if let Err(e) = outcome {
                    let _ = self
                        .request_handler
                        .request_failed(command.as_ref(), &e.to_string());
                }
            }
            CommandKind::WithResponse => {
                let response = match outcome {
                    Ok(()) => CommandResponse::success(command.prepare_response_payload()),
                    Err(e) => {
                        let message = e.to_string();
                        let _ = self.request_handler.request_failed(command.as_ref(), &message);
                        CommandResponse::failed(message)
                    }
                };
                command.base_mut().set_response(response);

                if inline {
                    match self.processor.encode_response(command.as_ref()) {
                        Ok(frame) => self.reply(stream, &frame).await,
                        Err(e) => warn!(command = tag, error = %e, "Failed to encode response"),
                    }
                } else {
                    self.deliver_response(command.as_ref()).await;
                }
            }
        }
    }

    async fn deliver_response(&self, command: &dyn Command) {
        let Some(descriptor) = command.response_descriptor() else {
            return;
        };
        let connection = DefaultConnection::to_descriptor(
            descriptor,
            self.connection_settings,
            Arc::clone(&self.processor),
        );
        match connection.send_response(command).await {
            Ok(()) => debug!(command = command.type_tag(), %descriptor, "Delivered response"),
            Err(e) => warn!(
                command = command.type_tag(),
                %descriptor,
                error = %e,
                "Failed to deliver response"
            ),
        }
    }

    async fn dispatch_response(
        &self,
        mut command: Box<dyn Command>,
        response: CommandResponse,
        stream: &mut TcpStream,
    ) {
        let ack = self.processor.encode_ack(command.type_tag(), &ResponseStatus::Success);
        self.reply(stream, &ack).await;

        let outcome = match command.consume_response(response) {
            Ok(()) => match command.response().map(|r| r.status.clone()) {
                Some(ResponseStatus::Failed(message)) => Err(message),
                _ => command
                    .handle_response(self)
                    .await
                    .map_err(|e| e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        // Multi handlers log child failures themselves.
        let _ = match outcome {
            Ok(()) => self.response_handler.response_successful(command.as_ref()),
            Err(message) => self.response_handler.response_failed(command.as_ref(), &message),
        };

        let seen = self.responses_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stop_after_responses.is_some_and(|limit| seen >= limit) {
            self.stop_execution();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::host::PortPool;
    use crate::logging::LogSinkRegistry;

    fn engine() -> Arc<ScriptingEngine> {
        let context = HostContext::new(
            Arc::new(LogSinkRegistry::new()),
            PortPool::new(20_100..=20_110).unwrap(),
        );
        Arc::new(ScriptingEngine::new(
            EngineSettings::default().on_port(0),
            Arc::new(context),
            Arc::new(CommandProcessor::default()),
        ))
    }

    #[tokio::test]
    async fn stop_execution_wakes_blocked_accept() {
        let engine = engine();
        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.execute().await }
        });

        engine.wait_until_listening().await.unwrap();
        assert_eq!(engine.state(), EngineState::Listening);

        engine.stop_execution();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("accept loop should exit promptly")
            .unwrap()
            .unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_execute_returns_immediately() {
        let engine = engine();
        engine.stop_execution();
        assert!(engine.stop_requested());

        tokio::time::timeout(Duration::from_secs(1), engine.execute())
            .await
            .expect("execute should not block")
            .unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let context = HostContext::new(
            Arc::new(LogSinkRegistry::new()),
            PortPool::new(20_100..=20_110).unwrap(),
        );
        let engine = ScriptingEngine::new(
            EngineSettings::default().on_port(port),
            Arc::new(context),
            Arc::new(CommandProcessor::default()),
        );
        let err = engine.execute().await.unwrap_err();
        assert!(matches!(err, ScriptingError::Config(_)));
        assert!(engine.wait_until_listening().await.is_err());
    }

    #[tokio::test]
    async fn garbage_does_not_stop_the_loop() {
        let engine = engine();
        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.execute().await }
        });
        let addr = engine.wait_until_listening().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_message(&mut stream, b"not a command").await.unwrap();
        let reply = recv_message(&mut stream).await.unwrap();
        let Decoded::Ack { status, .. } = engine.processor().decode(&reply).unwrap() else {
            panic!("expected ack");
        };
        assert!(matches!(status, ResponseStatus::Failed(_)));

        assert_eq!(engine.state(), EngineState::Listening);
        engine.stop_execution();
        task.await.unwrap().unwrap();
    }
}
