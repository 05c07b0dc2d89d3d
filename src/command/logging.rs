//! Remote logging: stream a remote host's log output back to the caller.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Command, CommandBase, CommandKind, FromWire, Options, ResponseDescriptor};
use crate::engine::ScriptingEngine;
use crate::error::{Result, ScriptingError};
use crate::host::HostContext;
use crate::logging::{start_forwarding, LogReceiver, LogRecord};

const OPT_HOST: &str = "logging-host";
const OPT_PORT: &str = "logging-port";
const OPT_TIMEOUT: &str = "timeout-ms";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Ask the remote host to forward its log stream to a local receiver.
///
/// Before sending, a receiver is bound on `logging-port` locally; if that
/// fails nothing is sent. The remote registers a forwarding sink that
/// deregisters itself after `timeout-ms` without contact.
#[derive(Debug)]
pub struct StartRemoteLogging {
    base: CommandBase,
    logging_host: String,
    logging_port: u16,
    timeout: Duration,
    observer: Option<mpsc::UnboundedSender<LogRecord>>,
}

impl StartRemoteLogging {
    /// Receive logs on `port`. Port 0 picks a free port at bind time.
    pub fn new(port: u16) -> Self {
        Self {
            base: CommandBase::default(),
            logging_host: String::new(),
            logging_port: port,
            timeout: DEFAULT_TIMEOUT,
            observer: None,
        }
    }

    /// Host the remote should connect to. Defaults to the advertised host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.logging_host = host.into();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Also deliver every record the local receiver gets to `tx`.
    #[must_use]
    pub fn with_observer(mut self, tx: mpsc::UnboundedSender<LogRecord>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn logging_host(&self) -> &str {
        &self.logging_host
    }

    pub const fn logging_port(&self) -> u16 {
        self.logging_port
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn destination(&self) -> Result<ResponseDescriptor> {
        if self.logging_host.is_empty() || self.logging_port == 0 {
            return Err(ScriptingError::Config(format!(
                "invalid logging destination '{}:{}'",
                self.logging_host, self.logging_port
            )));
        }
        Ok(ResponseDescriptor {
            host: self.logging_host.clone(),
            port: self.logging_port,
        })
    }
}

#[async_trait]
impl Command for StartRemoteLogging {
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
        if !self.logging_host.is_empty() {
            options.set(OPT_HOST, &self.logging_host);
        }
        options.set(OPT_PORT, self.logging_port);
        options.set(OPT_TIMEOUT, self.timeout.as_millis());
        options
    }

    async fn before_send(&mut self, context: &HostContext) -> Result<()> {
        let mut receiver = LogReceiver::bind(context.bind_host(), self.logging_port).await?;
        if let Some(tx) = self.observer.clone() {
            receiver = receiver.with_observer(tx);
        }
        self.logging_port = receiver.local_addr()?.port();
        if self.logging_host.is_empty() {
            self.logging_host = context.advertise_host().to_string();
        }
        context.register_log_receiver(self.logging_port, receiver.spawn(self.timeout));
        Ok(())
    }

    async fn send_failed(&mut self, context: &HostContext) {
        if context.deregister_log_receiver(self.logging_port).await {
            debug!(port = self.logging_port, "Released log receiver after failed send");
        }
    }

    async fn handle(&mut self, engine: &ScriptingEngine) -> Result<()> {
        let destination = self.destination()?;
        let context = engine.context();
        start_forwarding(
            context.log_sinks(),
            destination,
            self.timeout,
            context.connect_timeout(),
        );
        Ok(())
    }

    async fn handle_response(&mut self, _engine: &ScriptingEngine) -> Result<()> {
        info!(
            port = self.logging_port,
            timeout = ?self.timeout,
            "Remote logging started"
        );
        Ok(())
    }
}

impl FromWire for StartRemoteLogging {
    const TAG: &'static str = "start-remote-logging";

    fn from_wire(options: &Options, _payload: Vec<u8>) -> Result<Self> {
        let timeout = options
            .parse::<u64>(OPT_TIMEOUT)?
            .map_or(DEFAULT_TIMEOUT, Duration::from_millis);
        let mut command = Self::new(options.require(OPT_PORT)?).with_timeout(timeout);
        if let Some(host) = options.get(OPT_HOST) {
            command.logging_host = host.to_string();
        }
        Ok(command)
    }
}
