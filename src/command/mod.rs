//! Remote commands.
//!
//! A command is a self-describing unit of work. The caller builds one, the
//! codec turns it into a frame, and the remote engine rebuilds a fresh
//! instance from the frame's type tag before running [`Command::handle`].
//! Response-bearing commands travel back the same way, carrying a
//! [`CommandResponse`].

pub mod basic;
pub mod flow;
pub mod logging;

pub use basic::{Ping, Restart, Stop, StopEngine};
pub use flow::{GetFlow, ListFlows, StopFlow};
pub use logging::StartRemoteLogging;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::engine::ScriptingEngine;
use crate::error::{Result, ScriptingError};
use crate::host::HostContext;

/// Option key carrying the host the response should be delivered to.
pub const OPT_RESPONSE_HOST: &str = "response-host";
/// Option key carrying the port the response should be delivered to.
pub const OPT_RESPONSE_PORT: &str = "response-port";

/// Whether a command produces a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Handled remotely, errors are logged on the remote side only.
    FireAndForget,
    /// Handled remotely, result (or failure) is always sent back.
    WithResponse,
}

/// Where the remote side should deliver a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ResponseDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome flag carried by every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Failed(String),
}

/// Response state attached to a command after handling.
///
/// `payload: None` on a successful response means the handler never ran,
/// which [`Command::consume_response`] rejects. An empty payload is a valid
/// "nothing to report" answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub payload: Option<Vec<u8>>,
}

impl CommandResponse {
    pub const fn success(payload: Vec<u8>) -> Self {
        Self {
            status: ResponseStatus::Success,
            payload: Some(payload),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed(message.into()),
            payload: None,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, ResponseStatus::Success)
    }

    /// Failure message, if any.
    pub fn failure(&self) -> Option<&str> {
        match &self.status {
            ResponseStatus::Success => None,
            ResponseStatus::Failed(message) => Some(message),
        }
    }
}

/// Flat key/value configuration carried in every frame.
///
/// Keys are kept sorted so encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<String, String>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.0.insert(key.to_string(), value.to_string());
    }

    /// Set `key` only when `value` is present.
    pub fn set_opt<T: ToString>(&mut self, key: &str, value: Option<T>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse an optional value, failing on malformed text.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    ScriptingError::Protocol(format!("invalid value for option '{key}': {e}"))
                })
            })
            .transpose()
    }

    /// Parse a required value.
    pub fn require<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.parse(key)?
            .ok_or_else(|| ScriptingError::Protocol(format!("missing option '{key}'")))
    }

    /// Boolean flag, absent means `false`.
    pub fn flag(&self, key: &str) -> Result<bool> {
        Ok(self.parse::<bool>(key)?.unwrap_or(false))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// State every command carries regardless of its kind.
#[derive(Debug, Clone, Default)]
pub struct CommandBase {
    response_descriptor: Option<ResponseDescriptor>,
    response: Option<CommandResponse>,
}

impl CommandBase {
    pub const fn response_descriptor(&self) -> Option<&ResponseDescriptor> {
        self.response_descriptor.as_ref()
    }

    pub fn set_response_descriptor(&mut self, descriptor: ResponseDescriptor) {
        self.response_descriptor = Some(descriptor);
    }

    pub fn clear_response_descriptor(&mut self) {
        self.response_descriptor = None;
    }

    pub const fn response(&self) -> Option<&CommandResponse> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, response: CommandResponse) {
        self.response = Some(response);
    }

    /// Options shared by all commands.
    pub fn options(&self) -> Options {
        let mut options = Options::new();
        if let Some(descriptor) = &self.response_descriptor {
            options.set(OPT_RESPONSE_HOST, &descriptor.host);
            options.set(OPT_RESPONSE_PORT, descriptor.port);
        }
        options
    }

    /// Rebuild base state from decoded options.
    pub fn from_options(options: &Options) -> Result<Self> {
        let host = options.get(OPT_RESPONSE_HOST);
        let port = options.parse::<u16>(OPT_RESPONSE_PORT)?;
        let response_descriptor = match (host, port) {
            (Some(host), Some(port)) => Some(ResponseDescriptor {
                host: host.to_string(),
                port,
            }),
            (None, None) => None,
            _ => {
                return Err(ScriptingError::Protocol(
                    "response descriptor needs both host and port".into(),
                ))
            }
        };
        Ok(Self {
            response_descriptor,
            response: None,
        })
    }
}

/// A unit of remote work.
///
/// Instances are owned by exactly one task at a time; each transmission
/// decodes into a fresh instance on the receiving side.
#[async_trait]
pub trait Command: Send + Sync + fmt::Debug {
    /// Stable wire identifier used to look up the factory on decode.
    fn type_tag(&self) -> &'static str;

    fn kind(&self) -> CommandKind;

    fn base(&self) -> &CommandBase;

    fn base_mut(&mut self) -> &mut CommandBase;

    /// Command-specific configuration fields.
    fn options(&self) -> Options {
        Options::new()
    }

    /// Raw request payload. Must be deterministic and side-effect free.
    fn prepare_for_transport(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Caller-side hook that runs before the command is transmitted.
    ///
    /// Returning an error aborts the send.
    async fn before_send(&mut self, _context: &HostContext) -> Result<()> {
        Ok(())
    }

    /// Caller-side cleanup after a successful [`Command::before_send`] when
    /// the command did not take effect: delivery failed, no response came
    /// back, or the remote reported a failure.
    async fn send_failed(&mut self, _context: &HostContext) {}

    /// Remote-side execution.
    async fn handle(&mut self, engine: &ScriptingEngine) -> Result<()>;

    /// Response payload, called only after a successful [`Command::handle`].
    fn prepare_response_payload(&mut self) -> Vec<u8> {
        Vec::new()
    }

    /// Caller-side processing of a successful response.
    async fn handle_response(&mut self, _engine: &ScriptingEngine) -> Result<()> {
        Ok(())
    }

    /// Attach a received response.
    fn consume_response(&mut self, response: CommandResponse) -> Result<()> {
        if response.is_success() && response.payload.is_none() {
            return Err(ScriptingError::Handler(format!(
                "{} response carries no payload, remote handler never ran",
                self.type_tag()
            )));
        }
        self.base_mut().set_response(response);
        Ok(())
    }

    fn expects_response(&self) -> bool {
        self.kind() == CommandKind::WithResponse
    }

    fn response(&self) -> Option<&CommandResponse> {
        self.base().response()
    }

    fn response_descriptor(&self) -> Option<&ResponseDescriptor> {
        self.base().response_descriptor()
    }
}

/// Decoding side of a command: the factory registered under [`FromWire::TAG`].
pub trait FromWire: Command + Sized + 'static {
    const TAG: &'static str;

    /// Rebuild a command from its options and request payload.
    fn from_wire(options: &Options, payload: Vec<u8>) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_parse_and_flag() {
        let mut options = Options::new();
        options.set("port", 8080_u16);
        options.set("verbose", true);

        assert_eq!(options.parse::<u16>("port").unwrap(), Some(8080));
        assert!(options.flag("verbose").unwrap());
        assert!(!options.flag("missing").unwrap());
        assert!(options.require::<u32>("missing").is_err());
    }

    #[test]
    fn options_reject_malformed_values() {
        let mut options = Options::new();
        options.set("port", "eighty");
        let err = options.parse::<u16>("port").unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn base_descriptor_round_trips_through_options() {
        let mut base = CommandBase::default();
        base.set_response_descriptor(ResponseDescriptor {
            host: "10.0.0.2".into(),
            port: 12400,
        });

        let rebuilt = CommandBase::from_options(&base.options()).unwrap();
        assert_eq!(rebuilt.response_descriptor(), base.response_descriptor());
    }

    #[test]
    fn base_rejects_half_descriptor() {
        let mut options = Options::new();
        options.set(OPT_RESPONSE_HOST, "localhost");
        assert!(CommandBase::from_options(&options).is_err());
    }

    #[test]
    fn consume_response_distinguishes_empty_from_absent() {
        let mut ping = Ping::default();
        assert!(ping.consume_response(CommandResponse::success(Vec::new())).is_ok());

        let mut ping = Ping::default();
        let absent = CommandResponse {
            status: ResponseStatus::Success,
            payload: None,
        };
        assert!(ping.consume_response(absent).is_err());
        assert!(ping.response().is_none());

        let mut ping = Ping::default();
        assert!(ping.consume_response(CommandResponse::failed("boom")).is_ok());
        assert_eq!(ping.response().and_then(CommandResponse::failure), Some("boom"));
    }
}
