//! Command processor: the textual wire representation of commands.
//!
//! Frame body (carried inside a length-prefixed frame):
//!
//! ```text
//! # flowlink-command
//! # type: get-flow
//! # phase: response
//! # status: ok
//! # payload: 42
//! id=3
//! response-host=127.0.0.1
//! response-port=12400
//!
//! <payload bytes>
//! ```
//!
//! Header lines are comment-prefixed metadata. Options follow as sorted
//! `key=value` lines with backslash, tab, newline and carriage return
//! escaped. A blank
//! line separates the text section from the raw payload. `# payload: none`
//! marks an absent payload, which is distinct from `# payload: 0`.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use crate::command::{
    Command, CommandBase, CommandResponse, FromWire, GetFlow, ListFlows, Options, Ping, Restart,
    ResponseStatus, StartRemoteLogging, Stop, StopEngine, StopFlow,
};
use crate::error::{Result, ScriptingError};

const MAGIC: &str = "flowlink-command";

/// Builds a command from decoded options and request payload.
pub type CommandFactory = fn(&Options, Vec<u8>) -> Result<Box<dyn Command>>;

/// Which leg of an exchange a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
    Ack,
}

impl Phase {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Ack => "ack",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "request" => Ok(Self::Request),
            "response" => Ok(Self::Response),
            "ack" => Ok(Self::Ack),
            other => Err(ScriptingError::Protocol(format!("unknown phase '{other}'"))),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of decoding one frame.
#[derive(Debug)]
pub enum Decoded {
    /// A request to handle.
    Request(Box<dyn Command>),
    /// A fresh command instance plus the response it carried. The response
    /// is not attached yet; the receiver decides how to consume it.
    Response {
        command: Box<dyn Command>,
        response: CommandResponse,
    },
    /// Receipt for a delivered frame.
    Ack { tag: String, status: ResponseStatus },
}

/// Closed set of known commands, keyed by type tag.
#[derive(Clone)]
pub struct CommandRegistry {
    factories: HashMap<&'static str, CommandFactory>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.factories.keys().collect();
        tags.sort();
        f.debug_struct("CommandRegistry").field("tags", &tags).finish()
    }
}

fn build<C: FromWire>(options: &Options, payload: Vec<u8>) -> Result<Box<dyn Command>> {
    Ok(Box::new(C::from_wire(options, payload)?))
}

impl CommandRegistry {
    /// Registry with no commands.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in command.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register::<Ping>();
        registry.register::<Stop>();
        registry.register::<StopEngine>();
        registry.register::<Restart>();
        registry.register::<GetFlow>();
        registry.register::<ListFlows>();
        registry.register::<StopFlow>();
        registry.register::<StartRemoteLogging>();
        registry
    }

    pub fn register<C: FromWire>(&mut self) {
        self.register_factory(C::TAG, build::<C>);
    }

    pub fn register_factory(&mut self, tag: &'static str, factory: CommandFactory) {
        self.factories.insert(tag, factory);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Instantiate the command registered under `tag`.
    pub fn create(&self, tag: &str, options: &Options, payload: Vec<u8>) -> Result<Box<dyn Command>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| ScriptingError::Protocol(format!("unknown command type '{tag}'")))?;
        let mut command = factory(options, payload)?;
        *command.base_mut() = CommandBase::from_options(options)?;
        Ok(command)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Encodes and decodes command frames.
#[derive(Debug, Clone, Default)]
pub struct CommandProcessor {
    registry: CommandRegistry,
}

impl CommandProcessor {
    pub const fn new(registry: CommandRegistry) -> Self {
        Self { registry }
    }

    pub const fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Encode a command's request.
    pub fn encode_request(&self, command: &dyn Command) -> Vec<u8> {
        let payload = command.prepare_for_transport();
        encode(
            command.type_tag(),
            Phase::Request,
            None,
            &all_options(command),
            Some(payload.as_slice()),
        )
    }

    /// Encode a command's attached response.
    pub fn encode_response(&self, command: &dyn Command) -> Result<Vec<u8>> {
        let response = command.response().ok_or_else(|| {
            ScriptingError::Handler(format!("{} has no response to send", command.type_tag()))
        })?;
        Ok(encode(
            command.type_tag(),
            Phase::Response,
            Some(&response.status),
            &all_options(command),
            response.payload.as_deref(),
        ))
    }

    /// Encode a receipt for a frame of type `tag`.
    pub fn encode_ack(&self, tag: &str, status: &ResponseStatus) -> Vec<u8> {
        encode(tag, Phase::Ack, Some(status), &Options::new(), None)
    }

    /// Decode one frame.
    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        let frame = parse(bytes)?;
        match frame.phase {
            Phase::Request => {
                let payload = frame.payload.unwrap_or_default();
                let command = self.registry.create(&frame.tag, &frame.options, payload)?;
                Ok(Decoded::Request(command))
            }
            Phase::Response => {
                let command = self.registry.create(&frame.tag, &frame.options, Vec::new())?;
                let status = frame.status.ok_or_else(|| {
                    ScriptingError::Protocol("response frame without status".into())
                })?;
                Ok(Decoded::Response {
                    command,
                    response: CommandResponse {
                        status,
                        payload: frame.payload,
                    },
                })
            }
            Phase::Ack => Ok(Decoded::Ack {
                tag: frame.tag,
                status: frame
                    .status
                    .ok_or_else(|| ScriptingError::Protocol("ack frame without status".into()))?,
            }),
        }
    }
}

fn all_options(command: &dyn Command) -> Options {
    let mut options = command.base().options();
    options.extend(command.options());
    options
}

struct Frame {
    tag: String,
    phase: Phase,
    status: Option<ResponseStatus>,
    options: Options,
    payload: Option<Vec<u8>>,
}

fn encode(
    tag: &str,
    phase: Phase,
    status: Option<&ResponseStatus>,
    options: &Options,
    payload: Option<&[u8]>,
) -> Vec<u8> {
    let mut text = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(text, "# {MAGIC}");
    let _ = writeln!(text, "# type: {tag}");
    let _ = writeln!(text, "# phase: {phase}");
    match status {
        Some(ResponseStatus::Success) => text.push_str("# status: ok\n"),
        Some(ResponseStatus::Failed(message)) => {
            text.push_str("# status: failed\n");
            let _ = writeln!(text, "# message: {}", escape(message));
        }
        None => {}
    }
    match payload {
        Some(bytes) => {
            let _ = writeln!(text, "# payload: {}", bytes.len());
        }
        None => text.push_str("# payload: none\n"),
    }
    for (key, value) in options.iter() {
        let _ = writeln!(text, "{key}={}", escape(value));
    }
    text.push('\n');

    let mut out = text.into_bytes();
    if let Some(bytes) = payload {
        out.extend_from_slice(bytes);
    }
    out
}

fn parse(bytes: &[u8]) -> Result<Frame> {
    let split = bytes
        .windows(2)
        .position(|w| w == b"\n\n")
        .ok_or_else(|| ScriptingError::Protocol("frame has no header terminator".into()))?;
    let text = std::str::from_utf8(&bytes[..split])
        .map_err(|e| ScriptingError::Protocol(format!("frame header is not utf-8: {e}")))?;
    let rest = &bytes[split + 2..];

    let mut lines = text.lines();
    if lines.next().and_then(|l| l.strip_prefix("# ")) != Some(MAGIC) {
        return Err(ScriptingError::Protocol("missing frame magic".into()));
    }

    let mut tag = None;
    let mut phase = None;
    let mut status_flag = None;
    let mut message = None;
    let mut payload_len: Option<Option<usize>> = None;
    let mut options = Options::new();

    for line in lines {
        if let Some(meta) = line.strip_prefix("# ") {
            let (key, value) = meta
                .split_once(": ")
                .ok_or_else(|| ScriptingError::Protocol(format!("malformed header '{line}'")))?;
            match key {
                "type" => tag = Some(value.to_string()),
                "phase" => phase = Some(Phase::parse(value)?),
                "status" => status_flag = Some(value.to_string()),
                "message" => message = Some(unescape(value)?),
                "payload" => {
                    payload_len = Some(if value == "none" {
                        None
                    } else {
                        Some(value.parse::<usize>().map_err(|e| {
                            ScriptingError::Protocol(format!("invalid payload length '{value}': {e}"))
                        })?)
                    });
                }
                // Unknown metadata is ignored so newer peers can add headers.
                _ => {}
            }
        } else {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ScriptingError::Protocol(format!("malformed option '{line}'")))?;
            if key.is_empty() {
                return Err(ScriptingError::Protocol("empty option key".into()));
            }
            options.set(key, unescape(value)?);
        }
    }

    let tag = tag.ok_or_else(|| ScriptingError::Protocol("frame has no type".into()))?;
    let phase = phase.ok_or_else(|| ScriptingError::Protocol("frame has no phase".into()))?;
    let payload_len =
        payload_len.ok_or_else(|| ScriptingError::Protocol("frame has no payload header".into()))?;

    let status = match status_flag.as_deref() {
        None => None,
        Some("ok") => Some(ResponseStatus::Success),
        Some("failed") => Some(ResponseStatus::Failed(message.unwrap_or_default())),
        Some(other) => {
            return Err(ScriptingError::Protocol(format!("unknown status '{other}'")));
        }
    };

    let payload = match payload_len {
        None if rest.is_empty() => None,
        None => {
            return Err(ScriptingError::Protocol(
                "payload bytes present but header says none".into(),
            ))
        }
        Some(len) if len == rest.len() => Some(rest.to_vec()),
        Some(len) => {
            return Err(ScriptingError::Protocol(format!(
                "payload length mismatch: header says {len}, got {}",
                rest.len()
            )))
        }
    };

    Ok(Frame {
        tag,
        phase,
        status,
        options,
        payload,
    })
}

/// Escape `\`, tab, newline and carriage return for line-based text.
pub(crate) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(ScriptingError::Protocol(format!(
                    "invalid escape sequence '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ResponseDescriptor;

    fn processor() -> CommandProcessor {
        CommandProcessor::default()
    }

    #[test]
    fn request_frame_is_human_readable() {
        let mut restart = Restart::new(true);
        restart.base_mut().set_response_descriptor(ResponseDescriptor {
            host: "127.0.0.1".into(),
            port: 12400,
        });

        let bytes = processor().encode_request(&restart);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("# flowlink-command\n# type: restart\n# phase: request\n"));
        assert!(text.contains("more-memory=true\n"));
        assert!(text.contains("response-port=12400\n"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn encoding_is_deterministic() {
        let command = GetFlow::by_id(3);
        let p = processor();
        assert_eq!(p.encode_request(&command), p.encode_request(&command));
    }

    #[test]
    fn decodes_registered_request() {
        let p = processor();
        let bytes = p.encode_request(&Restart::new(true));
        let Decoded::Request(command) = p.decode(&bytes).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(command.type_tag(), "restart");
        assert_eq!(command.options().get("more-memory"), Some("true"));
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let p = CommandProcessor::new(CommandRegistry::empty());
        let bytes = processor().encode_request(&Ping::default());
        let err = p.decode(&bytes).unwrap_err();
        assert!(matches!(err, ScriptingError::Protocol(_)));
    }

    #[test]
    fn response_keeps_empty_and_absent_payloads_apart() {
        let p = processor();

        let mut ping = Ping::default();
        ping.base_mut().set_response(CommandResponse::success(Vec::new()));
        let Decoded::Response { response, .. } = p.decode(&p.encode_response(&ping).unwrap()).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(response.payload, Some(Vec::new()));

        let mut ping = Ping::default();
        ping.base_mut().set_response(CommandResponse::failed("line one\nline two"));
        let Decoded::Response { response, .. } = p.decode(&p.encode_response(&ping).unwrap()).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(response.payload, None);
        assert_eq!(response.failure(), Some("line one\nline two"));
    }

    #[test]
    fn encode_response_requires_response() {
        assert!(processor().encode_response(&Ping::default()).is_err());
    }

    #[test]
    fn payload_may_contain_blank_lines() {
        let p = processor();
        let mut get = GetFlow::by_id(1);
        get.base_mut()
            .set_response(CommandResponse::success(b"# flow: a\n\n\nbody\n".to_vec()));
        let Decoded::Response { response, .. } = p.decode(&p.encode_response(&get).unwrap()).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(response.payload.as_deref(), Some(&b"# flow: a\n\n\nbody\n"[..]));
    }

    #[test]
    fn ack_round_trip() {
        let p = processor();
        let bytes = p.encode_ack("ping", &ResponseStatus::Failed("rejected".into()));
        let Decoded::Ack { tag, status } = p.decode(&bytes).unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(tag, "ping");
        assert_eq!(status, ResponseStatus::Failed("rejected".into()));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let p = processor();
        assert!(p.decode(b"garbage").is_err());
        assert!(p.decode(b"# flowlink-command\n# type: ping\n\n").is_err());
        assert!(p
            .decode(b"# flowlink-command\n# type: ping\n# phase: request\n# payload: 5\n\nab")
            .is_err());
        assert!(p
            .decode(b"# flowlink-command\n# type: ping\n# phase: request\n# payload: 0\nno-equals\n\n")
            .is_err());
    }

    #[test]
    fn escape_round_trip() {
        let raw = "C:\\flows\\a\nb\rc\td";
        assert_eq!(unescape(&escape(raw)).unwrap(), raw);
        assert!(unescape("bad\\x").is_err());
    }
}
