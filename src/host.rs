//! Boundary to the surrounding host process.
//!
//! The protocol never reaches for globals: everything a command needs from
//! the host (running flows, the log stream, free ports, process exit) is
//! reached through a [`HostContext`] passed down explicitly.

use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, ScriptingError};
use crate::flow::{CompactFlowFormat, Flow, InMemoryFlowRegistry};
use crate::logging::LogSinkRegistry;

/// Exit code for a plain stop.
pub const EXIT_STOP: i32 = 0;
/// Exit code asking the supervising launcher to restart the host.
pub const EXIT_RESTART: i32 = 144;
/// Exit code asking the launcher to restart with a larger heap.
pub const EXIT_RESTART_MORE_MEMORY: i32 = 145;

/// Summary of a running flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSummary {
    pub id: u32,
    pub name: String,
}

/// Registry of flows currently executing in this host.
#[async_trait]
pub trait FlowRegistry: Send + Sync {
    /// Look up a running flow by id. With `None`, returns the sole running
    /// flow if exactly one is registered.
    fn list_running(&self, id: Option<u32>) -> Option<Flow>;

    /// All running flows, sorted by id.
    fn running(&self) -> Vec<FlowSummary>;

    /// Stop one flow.
    async fn stop(&self, id: u32) -> Result<()>;

    /// Stop every running flow.
    async fn stop_all(&self) -> Result<()>;
}

/// Writes a flow in its compact textual form.
pub trait FlowWriter: Send + Sync {
    fn serialize_compact(&self, flow: &Flow) -> String;
}

/// Parses the textual form back into a flow.
pub trait FlowReader: Send + Sync {
    fn parse(&self, text: &str) -> Result<Flow>;
}

/// Process-level exit primitive.
pub trait ProcessControl: Send + Sync {
    fn exit(&self, code: i32);
}

/// Exits the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl ProcessControl for ProcessExit {
    fn exit(&self, code: i32) {
        info!(code, "Exiting process");
        std::process::exit(code);
    }
}

/// Pool of ports handed out to throwaway engines and log receivers.
///
/// Leases are released when dropped. The pool only prevents collisions
/// inside this process; binding can still fail if another process holds
/// the port.
#[derive(Debug, Clone)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    in_use: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Result<Self> {
        if range.is_empty() {
            return Err(ScriptingError::Config(format!(
                "empty port pool range {}..={}",
                range.start(),
                range.end()
            )));
        }
        Ok(Self {
            range,
            in_use: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    /// Reserve the lowest free port.
    pub fn lease(&self) -> Result<PortLease> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        let port = self
            .range
            .clone()
            .find(|port| !in_use.contains(port))
            .ok_or_else(|| {
                ScriptingError::Config(format!(
                    "no free port in pool {}..={}",
                    self.range.start(),
                    self.range.end()
                ))
            })?;
        in_use.insert(port);
        debug!(port, "Leased port");
        Ok(PortLease {
            port,
            in_use: Arc::clone(&self.in_use),
        })
    }

    pub fn leased(&self) -> usize {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A reserved port, returned to the pool on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    in_use: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortLease {
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

/// Everything commands may touch in the hosting process.
pub struct HostContext {
    flows: Arc<dyn FlowRegistry>,
    flow_writer: Arc<dyn FlowWriter>,
    flow_reader: Arc<dyn FlowReader>,
    log_sinks: Arc<LogSinkRegistry>,
    process: Arc<dyn ProcessControl>,
    ports: PortPool,
    bind_host: String,
    advertise_host: String,
    restart_grace: Duration,
    connect_timeout: Duration,
    log_receivers: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl HostContext {
    /// Context with an empty in-memory flow registry, the compact flow
    /// format, and real process exit.
    pub fn new(log_sinks: Arc<LogSinkRegistry>, ports: PortPool) -> Self {
        Self {
            flows: Arc::new(InMemoryFlowRegistry::new()),
            flow_writer: Arc::new(CompactFlowFormat),
            flow_reader: Arc::new(CompactFlowFormat),
            log_sinks,
            process: Arc::new(ProcessExit),
            ports,
            bind_host: "127.0.0.1".into(),
            advertise_host: "127.0.0.1".into(),
            restart_grace: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            log_receivers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_flows(mut self, flows: Arc<dyn FlowRegistry>) -> Self {
        self.flows = flows;
        self
    }

    #[must_use]
    pub fn with_flow_format(
        mut self,
        writer: Arc<dyn FlowWriter>,
        reader: Arc<dyn FlowReader>,
    ) -> Self {
        self.flow_writer = writer;
        self.flow_reader = reader;
        self
    }

    #[must_use]
    pub fn with_process(mut self, process: Arc<dyn ProcessControl>) -> Self {
        self.process = process;
        self
    }

    /// Host to bind local listeners on, and host to advertise to remotes.
    #[must_use]
    pub fn with_hosts(mut self, bind_host: impl Into<String>, advertise_host: impl Into<String>) -> Self {
        self.bind_host = bind_host.into();
        self.advertise_host = advertise_host.into();
        self
    }

    #[must_use]
    pub const fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn flows(&self) -> &dyn FlowRegistry {
        self.flows.as_ref()
    }

    pub fn flow_writer(&self) -> &dyn FlowWriter {
        self.flow_writer.as_ref()
    }

    pub fn flow_reader(&self) -> &dyn FlowReader {
        self.flow_reader.as_ref()
    }

    pub const fn log_sinks(&self) -> &Arc<LogSinkRegistry> {
        &self.log_sinks
    }

    pub fn process(&self) -> &dyn ProcessControl {
        self.process.as_ref()
    }

    pub const fn ports(&self) -> &PortPool {
        &self.ports
    }

    pub fn bind_host(&self) -> &str {
        &self.bind_host
    }

    pub fn advertise_host(&self) -> &str {
        &self.advertise_host
    }

    pub const fn restart_grace(&self) -> Duration {
        self.restart_grace
    }

    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Stop every running flow, giving up after the restart grace period.
    ///
    /// Failures and overruns are logged, never returned: a flow that refuses
    /// to stop is abandoned.
    pub async fn stop_all_flows(&self) {
        match tokio::time::timeout(self.restart_grace, self.flows.stop_all()).await {
            Ok(Ok(())) => debug!("Stopped all flows"),
            Ok(Err(e)) => warn!(error = %e, "Failed to stop flows, continuing"),
            Err(_) => warn!(
                grace = ?self.restart_grace,
                "Flows did not stop within grace period, abandoning them"
            ),
        }
    }

    /// Keep track of a running log receiver so it lives as long as the host.
    pub fn register_log_receiver(&self, port: u16, handle: JoinHandle<()>) {
        let mut receivers = self
            .log_receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        receivers.retain(|_, task| !task.is_finished());
        if let Some(previous) = receivers.insert(port, handle) {
            previous.abort();
        }
    }

    /// Stop the log receiver on `port` and wait until its socket is closed.
    /// Returns `false` if none was registered there.
    pub async fn deregister_log_receiver(&self, port: u16) -> bool {
        let handle = self
            .log_receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
        let Some(handle) = handle else {
            return false;
        };
        handle.abort();
        let _ = handle.await;
        debug!(port, "Deregistered log receiver");
        true
    }

    /// Wait until every registered log receiver has stopped.
    pub async fn wait_for_log_receivers(&self) {
        let handles: Vec<_> = self
            .log_receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Number of log receivers still running.
    pub fn active_log_receivers(&self) -> usize {
        let mut receivers = self
            .log_receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        receivers.retain(|_, task| !task.is_finished());
        receivers.len()
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        let receivers = self
            .log_receivers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, task) in receivers.drain() {
            task.abort();
        }
    }
}
