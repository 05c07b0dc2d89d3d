//! Request and response handler chains.
//!
//! Handlers observe traffic through an engine. They run synchronously in
//! registration order; the multi handlers always call every child and only
//! log child failures.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::command::{Command, CommandResponse};
use crate::error::{Result, ScriptingError};

/// Observer for inbound requests.
pub trait RequestHandler: Send + Sync {
    /// Called for every decoded request, before it is handled.
    fn handle_request(&self, command: &dyn Command) -> Result<()>;

    /// Called when handling a request failed.
    fn request_failed(&self, _command: &dyn Command, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Observer for received responses.
pub trait ResponseHandler: Send + Sync {
    fn response_successful(&self, command: &dyn Command) -> Result<()>;

    fn response_failed(&self, command: &dyn Command, message: &str) -> Result<()>;
}

/// Logs every request through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRequestHandler;

impl RequestHandler for LoggingRequestHandler {
    fn handle_request(&self, command: &dyn Command) -> Result<()> {
        info!(command = command.type_tag(), "Received request");
        Ok(())
    }

    fn request_failed(&self, command: &dyn Command, message: &str) -> Result<()> {
        warn!(command = command.type_tag(), error = %message, "Request failed");
        Ok(())
    }
}

/// Logs every response through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingResponseHandler;

impl ResponseHandler for LoggingResponseHandler {
    fn response_successful(&self, command: &dyn Command) -> Result<()> {
        let bytes = command
            .response()
            .and_then(|r| r.payload.as_ref())
            .map_or(0, Vec::len);
        info!(command = command.type_tag(), bytes, "Response successful");
        Ok(())
    }

    fn response_failed(&self, command: &dyn Command, message: &str) -> Result<()> {
        warn!(command = command.type_tag(), error = %message, "Response failed");
        Ok(())
    }
}

/// Fans requests out to every child.
#[derive(Default, Clone)]
pub struct MultiRequestHandler {
    handlers: Vec<Arc<dyn RequestHandler>>,
}

impl MultiRequestHandler {
    pub fn new(handlers: Vec<Arc<dyn RequestHandler>>) -> Self {
        Self { handlers }
    }

    pub fn push(&mut self, handler: Arc<dyn RequestHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every child, returning the failures.
    pub fn notify_request(&self, command: &dyn Command) -> Vec<ScriptingError> {
        fan_out(&self.handlers, |h| h.handle_request(command))
    }

    pub fn notify_request_failed(&self, command: &dyn Command, message: &str) -> Vec<ScriptingError> {
        fan_out(&self.handlers, |h| h.request_failed(command, message))
    }
}

impl RequestHandler for MultiRequestHandler {
    fn handle_request(&self, command: &dyn Command) -> Result<()> {
        log_failures(command, &self.notify_request(command));
        Ok(())
    }

    fn request_failed(&self, command: &dyn Command, message: &str) -> Result<()> {
        log_failures(command, &self.notify_request_failed(command, message));
        Ok(())
    }
}

/// Fans responses out to every child.
#[derive(Default, Clone)]
pub struct MultiResponseHandler {
    handlers: Vec<Arc<dyn ResponseHandler>>,
}

impl MultiResponseHandler {
    pub fn new(handlers: Vec<Arc<dyn ResponseHandler>>) -> Self {
        Self { handlers }
    }

    pub fn push(&mut self, handler: Arc<dyn ResponseHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn notify_success(&self, command: &dyn Command) -> Vec<ScriptingError> {
        fan_out(&self.handlers, |h| h.response_successful(command))
    }

    pub fn notify_failure(&self, command: &dyn Command, message: &str) -> Vec<ScriptingError> {
        fan_out(&self.handlers, |h| h.response_failed(command, message))
    }
}

impl ResponseHandler for MultiResponseHandler {
    fn response_successful(&self, command: &dyn Command) -> Result<()> {
        log_failures(command, &self.notify_success(command));
        Ok(())
    }

    fn response_failed(&self, command: &dyn Command, message: &str) -> Result<()> {
        log_failures(command, &self.notify_failure(command, message));
        Ok(())
    }
}

fn fan_out<H: ?Sized>(
    handlers: &[Arc<H>],
    mut call: impl FnMut(&H) -> Result<()>,
) -> Vec<ScriptingError> {
    handlers
        .iter()
        .filter_map(|handler| call(handler.as_ref()).err())
        .collect()
}

fn log_failures(command: &dyn Command, failures: &[ScriptingError]) {
    for failure in failures {
        warn!(command = command.type_tag(), error = %failure, "Handler failed");
    }
}

/// What a response handler observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Successful {
        tag: &'static str,
        payload: Option<Vec<u8>>,
    },
    Failed {
        tag: &'static str,
        message: String,
    },
}

impl ResponseEvent {
    fn successful(command: &dyn Command) -> Self {
        Self::Successful {
            tag: command.type_tag(),
            payload: command.response().and_then(|r| r.payload.clone()),
        }
    }

    fn failed(command: &dyn Command, message: &str) -> Self {
        Self::Failed {
            tag: command.type_tag(),
            message: message.to_string(),
        }
    }

    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Successful { tag, .. } | Self::Failed { tag, .. } => *tag,
        }
    }

    pub fn into_response(self) -> CommandResponse {
        match self {
            Self::Successful { payload, .. } => CommandResponse::success(payload.unwrap_or_default()),
            Self::Failed { message, .. } => CommandResponse::failed(message),
        }
    }
}

/// Delivers response events to a channel, for UI or CLI consumers.
#[derive(Debug, Clone)]
pub struct ChannelResponseHandler {
    tx: mpsc::UnboundedSender<ResponseEvent>,
}

impl ChannelResponseHandler {
    pub const fn new(tx: mpsc::UnboundedSender<ResponseEvent>) -> Self {
        Self { tx }
    }

    fn deliver(&self, event: ResponseEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| ScriptingError::Handler("response channel closed".into()))
    }
}

impl ResponseHandler for ChannelResponseHandler {
    fn response_successful(&self, command: &dyn Command) -> Result<()> {
        self.deliver(ResponseEvent::successful(command))
    }

    fn response_failed(&self, command: &dyn Command, message: &str) -> Result<()> {
        self.deliver(ResponseEvent::failed(command, message))
    }
}

/// Accumulates response events in memory.
#[derive(Debug, Default)]
pub struct CollectingResponseHandler {
    events: Mutex<Vec<ResponseEvent>>,
}

impl CollectingResponseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ResponseEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, event: ResponseEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl ResponseHandler for CollectingResponseHandler {
    fn response_successful(&self, command: &dyn Command) -> Result<()> {
        self.push(ResponseEvent::successful(command));
        Ok(())
    }

    fn response_failed(&self, command: &dyn Command, message: &str) -> Result<()> {
        self.push(ResponseEvent::failed(command, message));
        Ok(())
    }
}
