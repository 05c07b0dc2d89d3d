//! Flows as the protocol sees them: opaque named text.
//!
//! The flow execution engine lives elsewhere. This module only provides
//! the compact textual format used by `GetFlow` and an in-memory registry
//! for hosts (and tests) that do not bring their own.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, ScriptingError};
use crate::host::{FlowReader, FlowRegistry, FlowSummary, FlowWriter};

const HEADER_NAME: &str = "# flow: ";
const HEADER_ID: &str = "# id: ";

/// A flow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub id: u32,
    pub name: String,
    pub body: String,
}

impl Flow {
    pub fn new(id: u32, name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            body: body.into(),
        }
    }
}

/// Compact textual flow format.
///
/// Two comment header lines (`# flow:` and `# id:`) followed by the body with
/// blank lines and trailing whitespace removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactFlowFormat;

impl FlowWriter for CompactFlowFormat {
    fn serialize_compact(&self, flow: &Flow) -> String {
        let mut out = format!("{HEADER_NAME}{}\n{HEADER_ID}{}\n", flow.name, flow.id);
        for line in flow.body.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

impl FlowReader for CompactFlowFormat {
    fn parse(&self, text: &str) -> Result<Flow> {
        let mut name = None;
        let mut id = None;
        let mut body = String::new();

        for line in text.lines() {
            if body.is_empty() {
                if let Some(value) = line.strip_prefix(HEADER_NAME) {
                    name = Some(value.trim().to_string());
                    continue;
                }
                if let Some(value) = line.strip_prefix(HEADER_ID) {
                    let parsed = value.trim().parse::<u32>().map_err(|e| {
                        ScriptingError::Protocol(format!("invalid flow id '{value}': {e}"))
                    })?;
                    id = Some(parsed);
                    continue;
                }
            }
            body.push_str(line);
            body.push('\n');
        }

        let name = name.ok_or_else(|| ScriptingError::Protocol("flow text has no name header".into()))?;
        Ok(Flow {
            id: id.unwrap_or(0),
            name,
            body,
        })
    }
}

/// Flow registry backed by a map.
///
/// Stopping a flow removes it.
#[derive(Debug, Default)]
pub struct InMemoryFlowRegistry {
    flows: RwLock<BTreeMap<u32, Flow>>,
}

impl InMemoryFlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, flow: Flow) {
        info!(id = flow.id, name = %flow.name, "Registered flow");
        self.flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(flow.id, flow);
    }

    pub fn len(&self) -> usize {
        self.flows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FlowRegistry for InMemoryFlowRegistry {
    fn list_running(&self, id: Option<u32>) -> Option<Flow> {
        let flows = self.flows.read().unwrap_or_else(PoisonError::into_inner);
        match id {
            Some(id) => flows.get(&id).cloned(),
            None if flows.len() == 1 => flows.values().next().cloned(),
            None => None,
        }
    }

    fn running(&self) -> Vec<FlowSummary> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|flow| FlowSummary {
                id: flow.id,
                name: flow.name.clone(),
            })
            .collect()
    }

    async fn stop(&self, id: u32) -> Result<()> {
        let removed = self
            .flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(flow) => {
                info!(id, name = %flow.name, "Stopped flow");
                Ok(())
            }
            None => Err(ScriptingError::Handler(format!("no running flow with id {id}"))),
        }
    }

    async fn stop_all(&self) -> Result<()> {
        let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
        debug!(count = flows.len(), "Stopping all flows");
        flows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Flow {
        Flow::new(
            7,
            "ingest",
            "Trigger\n  ReadCsv  \n\n  Filter rows>10\nWriteDb\n",
        )
    }

    #[test]
    fn compact_writer_drops_blank_lines_and_trailing_space() {
        let text = CompactFlowFormat.serialize_compact(&sample());
        assert_eq!(
            text,
            "# flow: ingest\n# id: 7\nTrigger\n  ReadCsv\n  Filter rows>10\nWriteDb\n"
        );
    }

    #[test]
    fn parse_of_compact_text_is_textually_stable() {
        let text = CompactFlowFormat.serialize_compact(&sample());
        let parsed = CompactFlowFormat.parse(&text).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.name, "ingest");
        assert_eq!(CompactFlowFormat.serialize_compact(&parsed), text);
    }

    #[test]
    fn parse_requires_name_header() {
        assert!(CompactFlowFormat.parse("Trigger\n").is_err());
    }

    #[test]
    fn registry_returns_sole_flow_without_id() {
        let registry = InMemoryFlowRegistry::new();
        assert!(registry.list_running(None).is_none());

        registry.register(sample());
        assert_eq!(registry.list_running(None).map(|f| f.id), Some(7));

        registry.register(Flow::new(8, "export", "WriteCsv"));
        assert!(registry.list_running(None).is_none());
        assert_eq!(registry.list_running(Some(8)).map(|f| f.name), Some("export".into()));
    }

    #[tokio::test]
    async fn stopping_unknown_flow_fails() {
        let registry = InMemoryFlowRegistry::new();
        registry.register(sample());
        assert!(registry.stop(99).await.is_err());
        registry.stop(7).await.unwrap();
        assert!(registry.is_empty());
    }
}
