//! Process and engine lifecycle commands.

use async_trait::async_trait;
use tracing::info;

use super::{Command, CommandBase, CommandKind, FromWire, Options};
use crate::engine::ScriptingEngine;
use crate::error::Result;
use crate::host::{EXIT_RESTART, EXIT_RESTART_MORE_MEMORY, EXIT_STOP};

const OPT_MORE_MEMORY: &str = "more-memory";
const OPT_STOP_FLOWS: &str = "stop-flows";

/// Optionally stop flows, stop the engine, then exit the process.
///
/// The engine has already acknowledged the command when this runs.
async fn exit_host(engine: &ScriptingEngine, stop_flows: bool, code: i32) -> Result<()> {
    if stop_flows {
        engine.context().stop_all_flows().await;
    }
    engine.stop_execution();
    engine.context().process().exit(code);
    Ok(())
}

/// Liveness check. The remote answers with an empty payload.
#[derive(Debug, Default)]
pub struct Ping {
    base: CommandBase,
}

#[async_trait]
impl Command for Ping {
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

    async fn handle(&mut self, _engine: &ScriptingEngine) -> Result<()> {
        Ok(())
    }
}

impl FromWire for Ping {
    const TAG: &'static str = "ping";

    fn from_wire(_options: &Options, _payload: Vec<u8>) -> Result<Self> {
        Ok(Self::default())
    }
}

/// Stop the remote host process with exit code 0.
#[derive(Debug, Default)]
pub struct Stop {
    base: CommandBase,
    stop_flows: bool,
}

impl Stop {
    #[must_use]
    pub const fn with_stop_flows(mut self, stop_flows: bool) -> Self {
        self.stop_flows = stop_flows;
        self
    }
}

#[async_trait]
impl Command for Stop {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn kind(&self) -> CommandKind {
        CommandKind::FireAndForget
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    fn options(&self) -> Options {
        let mut options = Options::new();
        options.set(OPT_STOP_FLOWS, self.stop_flows);
        options
    }

    async fn handle(&mut self, engine: &ScriptingEngine) -> Result<()> {
        info!(stop_flows = self.stop_flows, "Stop requested");
        exit_host(engine, self.stop_flows, EXIT_STOP).await
    }
}

impl FromWire for Stop {
    const TAG: &'static str = "stop";

    fn from_wire(options: &Options, _payload: Vec<u8>) -> Result<Self> {
        Ok(Self {
            base: CommandBase::default(),
            stop_flows: options.flag(OPT_STOP_FLOWS)?,
        })
    }
}

/// Stop the remote engine's accept loop. The process keeps running.
#[derive(Debug, Default)]
pub struct StopEngine {
    base: CommandBase,
}

#[async_trait]
impl Command for StopEngine {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn kind(&self) -> CommandKind {
        CommandKind::FireAndForget
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    async fn handle(&mut self, engine: &ScriptingEngine) -> Result<()> {
        engine.stop_execution();
        Ok(())
    }
}

impl FromWire for StopEngine {
    const TAG: &'static str = "stop-engine";

    fn from_wire(_options: &Options, _payload: Vec<u8>) -> Result<Self> {
        Ok(Self::default())
    }
}

/// Restart the remote host.
///
/// The host exits with [`EXIT_RESTART`] (or [`EXIT_RESTART_MORE_MEMORY`])
/// and relies on its launcher to start it again.
#[derive(Debug, Default)]
pub struct Restart {
    base: CommandBase,
    more_memory: bool,
    stop_flows: bool,
}

impl Restart {
    pub fn new(more_memory: bool) -> Self {
        Self {
            more_memory,
            ..Self::default()
        }
    }

    /// Stop running flows before exiting.
    #[must_use]
    pub const fn with_stop_flows(mut self, stop_flows: bool) -> Self {
        self.stop_flows = stop_flows;
        self
    }

    pub const fn more_memory(&self) -> bool {
        self.more_memory
    }

    pub const fn exit_code(&self) -> i32 {
        if self.more_memory {
            EXIT_RESTART_MORE_MEMORY
        } else {
            EXIT_RESTART
        }
    }
}

#[async_trait]
impl Command for Restart {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn kind(&self) -> CommandKind {
        CommandKind::FireAndForget
    }

    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    fn options(&self) -> Options {
        let mut options = Options::new();
        options.set(OPT_MORE_MEMORY, self.more_memory);
        options.set(OPT_STOP_FLOWS, self.stop_flows);
        options
    }

    async fn handle(&mut self, engine: &ScriptingEngine) -> Result<()> {
        info!(
            more_memory = self.more_memory,
            stop_flows = self.stop_flows,
            "Restart requested"
        );
        exit_host(engine, self.stop_flows, self.exit_code()).await
    }
}

impl FromWire for Restart {
    const TAG: &'static str = "restart";

    fn from_wire(options: &Options, _payload: Vec<u8>) -> Result<Self> {
        Ok(Self::new(options.flag(OPT_MORE_MEMORY)?).with_stop_flows(options.flag(OPT_STOP_FLOWS)?))
    }
}
