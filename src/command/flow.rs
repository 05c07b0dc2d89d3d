//! Commands that inspect or control flows on the remote host.

use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::{Command, CommandBase, CommandKind, FromWire, Options};
use crate::codec::{escape, unescape};
use crate::engine::ScriptingEngine;
use crate::error::{Result, ScriptingError};
use crate::flow::Flow;
use crate::host::{FlowReader, FlowSummary};

const OPT_ID: &str = "id";
const OPT_FILE: &str = "file";
const OPT_OUTPUT: &str = "output";

/// Payload bytes of a successful response, if any.
fn response_bytes(command: &dyn Command) -> Option<&[u8]> {
    command
        .response()
        .filter(|r| r.is_success())
        .and_then(|r| r.payload.as_deref())
}

/// Fetch a flow definition from the remote host in compact text form.
///
/// Without an id the remote picks its only running flow. With `file` set the
/// flow is loaded from that path on the remote host instead. An empty
/// payload means nothing matched.
#[derive(Debug, Default)]
pub struct GetFlow {
    base: CommandBase,
    id: Option<u32>,
    file: Option<String>,
    output: Option<PathBuf>,
    text: Option<String>,
}

impl GetFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: u32) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Load the flow from a file on the remote host.
    #[must_use]
    pub fn from_file(mut self, path: impl Into<String>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Write the received text to a local file instead of logging it.
    #[must_use]
    pub fn write_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub const fn id(&self) -> Option<u32> {
        self.id
    }

    /// Received flow text. `None` until a successful response arrives;
    /// empty when the remote had no match.
    pub fn response_text(&self) -> Option<String> {
        response_bytes(self).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Parse the received flow text.
    pub fn response_flow(&self, reader: &dyn FlowReader) -> Result<Option<Flow>> {
        match self.response_text() {
            Some(text) if !text.is_empty() => reader.parse(&text).map(Some),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Command for GetFlow {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn kind(&self) -> CommandKind {
        CommandKind::WithResponse
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    fn options(&self) -> Options {
        let mut options = Options::new();
        options.set_opt(OPT_ID, self.id);
        options.set_opt(OPT_FILE, self.file.as_deref());
        options.set_opt(OPT_OUTPUT, self.output.as_ref().map(|p| p.display().to_string()));
        options
    }

    async fn handle(&mut self, engine: &ScriptingEngine) -> Result<()> {
        let context = engine.context();
        let flow = match &self.file {
            Some(path) => {
                let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ScriptingError::Handler(format!("cannot read flow file {path}: {e}"))
                })?;
                Some(context.flow_reader().parse(&text)?)
            }
            None => context.flows().list_running(self.id),
        };

        if flow.is_none() {
            info!(id = ?self.id, "No matching flow");
        }
        self.text = flow.map(|flow| context.flow_writer().serialize_compact(&flow));
        Ok(())
    }

    fn prepare_response_payload(&mut self) -> Vec<u8> {
        self.text.take().map(String::into_bytes).unwrap_or_default()
    }

    async fn handle_response(&mut self, _engine: &ScriptingEngine) -> Result<()> {
        let Some(text) = self.response_text() else {
            return Ok(());
        };
        if text.is_empty() {
            info!(id = ?self.id, "Remote host has no matching flow");
            return Ok(());
        }

        match &self.output {
            Some(path) => {
                tokio::fs::write(path, text.as_bytes()).await.map_err(|e| {
                    ScriptingError::Handler(format!("cannot write flow to {}: {e}", path.display()))
                })?;
                info!(path = %path.display(), bytes = text.len(), "Saved remote flow");
            }
            None => info!("Remote flow:\n{text}"),
        }
        Ok(())
    }
}

impl FromWire for GetFlow {
    const TAG: &'static str = "get-flow";

    fn from_wire(options: &Options, _payload: Vec<u8>) -> Result<Self> {
        Ok(Self {
            id: options.parse(OPT_ID)?,
            file: options.get(OPT_FILE).map(str::to_string),
            output: options.get(OPT_OUTPUT).map(PathBuf::from),
            ..Self::default()
        })
    }
}

/// List the flows running on the remote host.
///
/// Response payload: one `id<TAB>name` line per flow, sorted by id, with
/// the name escaped like codec option values.
#[derive(Debug, Default)]
pub struct ListFlows {
    base: CommandBase,
    running: Vec<FlowSummary>,
}

impl ListFlows {
    /// Flows reported by the remote host. Malformed lines are skipped.
    pub fn entries(&self) -> Vec<FlowSummary> {
        let Some(bytes) = response_bytes(self) else {
            return Vec::new();
        };
        String::from_utf8_lossy(bytes)
            .lines()
            .filter_map(|line| {
                let (id, name) = line.split_once('\t')?;
                Some(FlowSummary {
                    id: id.parse().ok()?,
                    name: unescape(name).ok()?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Command for ListFlows {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn kind(&self) -> CommandKind {
        CommandKind::WithResponse
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    async fn handle(&mut self, engine: &ScriptingEngine) -> Result<()> {
        self.running = engine.context().flows().running();
        self.running.sort_by_key(|flow| flow.id);
        Ok(())
    }

    fn prepare_response_payload(&mut self) -> Vec<u8> {
        let mut out = String::new();
        for flow in self.running.drain(..) {
            let _ = writeln!(out, "{}\t{}", flow.id, escape(&flow.name));
        }
        out.into_bytes()
    }

    async fn handle_response(&mut self, _engine: &ScriptingEngine) -> Result<()> {
        let entries = self.entries();
        if entries.is_empty() {
            info!("No flows running on remote host");
        }
        for flow in entries {
            info!(id = flow.id, name = %flow.name, "Remote flow running");
        }
        Ok(())
    }
}

impl FromWire for ListFlows {
    const TAG: &'static str = "list-flows";

    fn from_wire(_options: &Options, _payload: Vec<u8>) -> Result<Self> {
        Ok(Self::default())
    }
}

/// Stop one running flow on the remote host.
#[derive(Debug)]
pub struct StopFlow {
    base: CommandBase,
    id: u32,
}

impl StopFlow {
    pub fn new(id: u32) -> Self {
        Self {
            base: CommandBase::default(),
            id,
        }
    }

    pub const fn id(&self) -> u32 {
        self.id
    }
}

#[async_trait]
impl Command for StopFlow {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn kind(&self) -> CommandKind {
        CommandKind::WithResponse
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    fn options(&self) -> Options {
        let mut options = Options::new();
        options.set(OPT_ID, self.id);
        options
    }

    async fn handle(&mut self, engine: &ScriptingEngine) -> Result<()> {
        engine.context().flows().stop(self.id).await?;
        info!(id = self.id, "Stopped flow on request");
        Ok(())
    }

    async fn handle_response(&mut self, _engine: &ScriptingEngine) -> Result<()> {
        info!(id = self.id, "Remote flow stopped");
        Ok(())
    }
}

impl FromWire for StopFlow {
    const TAG: &'static str = "stop-flow";

    fn from_wire(options: &Options, _payload: Vec<u8>) -> Result<Self> {
        Ok(Self::new(options.require(OPT_ID)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandResponse;
    use crate::flow::CompactFlowFormat;

    #[test]
    fn get_flow_options_round_trip() {
        let get = GetFlow::by_id(7).from_file("/srv/flows/a.flow").write_to("/tmp/out.flow");
        let rebuilt = GetFlow::from_wire(&get.options(), Vec::new()).unwrap();
        assert_eq!(rebuilt.id(), Some(7));
        assert_eq!(rebuilt.options(), get.options());
    }

    #[test]
    fn get_flow_without_id_sends_no_id() {
        assert!(GetFlow::new().options().get(OPT_ID).is_none());
    }

    #[test]
    fn get_flow_empty_payload_is_no_flow() {
        let mut get = GetFlow::by_id(1);
        get.consume_response(CommandResponse::success(Vec::new())).unwrap();
        assert_eq!(get.response_text().as_deref(), Some(""));
        assert!(get.response_flow(&CompactFlowFormat).unwrap().is_none());
    }

    #[test]
    fn list_flows_parses_entries() {
        let mut list = ListFlows::default();
        list.consume_response(CommandResponse::success(b"1\tingest\n4\texport\nbogus\n".to_vec()))
            .unwrap();
        let entries = list.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], FlowSummary { id: 4, name: "export".into() });
    }

    #[test]
    fn list_flows_keeps_names_with_separators() {
        let mut remote = ListFlows::default();
        remote.running = vec![
            FlowSummary { id: 2, name: "daily\tload".into() },
            FlowSummary { id: 5, name: "two\nlines".into() },
        ];
        let payload = remote.prepare_response_payload();

        let mut list = ListFlows::default();
        list.consume_response(CommandResponse::success(payload)).unwrap();
        assert_eq!(
            list.entries(),
            vec![
                FlowSummary { id: 2, name: "daily\tload".into() },
                FlowSummary { id: 5, name: "two\nlines".into() },
            ]
        );
    }

    #[test]
    fn stop_flow_requires_id() {
        assert!(StopFlow::from_wire(&Options::new(), Vec::new()).is_err());
        let stop = StopFlow::from_wire(&StopFlow::new(9).options(), Vec::new()).unwrap();
        assert_eq!(stop.id(), 9);
    }
}
