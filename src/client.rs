//! Caller-side helper for sending commands.
//!
//! `send` delivers fire-and-forget commands. `request` runs a throwaway
//! engine on a leased port to receive the response, then tears it down.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::CommandProcessor;
use crate::command::{Command, CommandResponse, ResponseDescriptor};
use crate::config::{ConnectionSettings, EngineSettings};
use crate::engine::ScriptingEngine;
use crate::error::{Result, ScriptingError};
use crate::handler::{ChannelResponseHandler, ResponseEvent, ResponseHandler};
use crate::host::HostContext;
use crate::transport::Connection;

/// Sends commands to remote engines through a [`Connection`].
pub struct RemoteClient {
    connection: Arc<dyn Connection>,
    context: Arc<HostContext>,
    processor: Arc<CommandProcessor>,
    engine_settings: EngineSettings,
    connection_settings: ConnectionSettings,
    response_handlers: Vec<Arc<dyn ResponseHandler>>,
}

impl RemoteClient {
    pub fn new(
        connection: Arc<dyn Connection>,
        context: Arc<HostContext>,
        processor: Arc<CommandProcessor>,
    ) -> Self {
        Self {
            connection,
            context,
            processor,
            engine_settings: EngineSettings::default(),
            connection_settings: ConnectionSettings::default(),
            response_handlers: Vec::new(),
        }
    }

    /// Settings for the throwaway response engine. The port is ignored.
    #[must_use]
    pub fn with_engine_settings(mut self, settings: EngineSettings) -> Self {
        self.engine_settings = settings;
        self
    }

    #[must_use]
    pub const fn with_connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection_settings = settings;
        self
    }

    /// Handler attached to every throwaway response engine.
    #[must_use]
    pub fn with_response_handler(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.response_handlers.push(handler);
        self
    }

    pub const fn context(&self) -> &Arc<HostContext> {
        &self.context
    }

    /// Deliver a command without waiting for a response.
    pub async fn send(&self, command: &mut dyn Command) -> Result<()> {
        command.before_send(&self.context).await?;
        let outcome = self.connection.send_request(command).await;
        if outcome.is_err() {
            command.send_failed(&self.context).await;
        }
        outcome
    }

    /// Deliver a response-bearing command and wait for its response.
    ///
    /// The response is attached to `command` and returned. A remote failure
    /// comes back as a failed [`CommandResponse`], not as an error.
    pub async fn request(&self, command: &mut dyn Command) -> Result<CommandResponse> {
        if !command.expects_response() {
            return Err(ScriptingError::Config(format!(
                "{} does not produce a response",
                command.type_tag()
            )));
        }
        command.before_send(&self.context).await?;

        let outcome = self.await_response(command).await;
        if !outcome.as_ref().is_ok_and(CommandResponse::is_success) {
            command.send_failed(&self.context).await;
        }
        outcome
    }

    async fn await_response(&self, command: &mut dyn Command) -> Result<CommandResponse> {
        let lease = self.context.ports().lease()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = ScriptingEngine::new(
            EngineSettings {
                bind_host: self.context.bind_host().to_string(),
                ..self.engine_settings.on_port(lease.port())
            },
            Arc::clone(&self.context),
            Arc::clone(&self.processor),
        )
        .with_connection_settings(self.connection_settings)
        .with_response_handler(Arc::new(ChannelResponseHandler::new(tx)))
        .stop_after_responses(1);
        for handler in &self.response_handlers {
            engine = engine.with_response_handler(Arc::clone(handler));
        }

        let engine = Arc::new(engine);
        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.execute().await }
        });

        let outcome = self.exchange(&engine, command, &mut rx).await;

        engine.stop_execution();
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Response engine ended with error"),
            Err(e) => warn!(error = %e, "Response engine task failed"),
        }
        drop(lease);

        let response = outcome?;
        command.consume_response(response.clone())?;
        Ok(response)
    }

    async fn exchange(
        &self,
        engine: &ScriptingEngine,
        command: &mut dyn Command,
        rx: &mut mpsc::UnboundedReceiver<ResponseEvent>,
    ) -> Result<CommandResponse> {
        let addr = engine.wait_until_listening().await?;
        command.base_mut().set_response_descriptor(ResponseDescriptor {
            host: self.context.advertise_host().to_string(),
            port: addr.port(),
        });
        debug!(command = command.type_tag(), port = addr.port(), "Awaiting response");

        self.connection.send_request(command).await?;

        let timeout = self.connection_settings.response_timeout;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(event)) => Ok(event.into_response()),
            Ok(None) => Err(ScriptingError::Transport(
                "response engine stopped before a response arrived".into(),
            )),
            Err(_) => Err(ScriptingError::timeout("response", timeout)),
        }
    }
}
