//! flowlink
//!
//! Runs a scripting engine (`listen`) or sends one command to remote
//! engines (`send`). Configuration comes from `--config` or
//! `FLOWLINK_CONFIG`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use flowlink::client::RemoteClient;
use flowlink::codec::CommandProcessor;
use flowlink::command::{
    Command, FromWire, GetFlow, ListFlows, Ping, Restart, StartRemoteLogging, Stop, StopEngine,
    StopFlow,
};
use flowlink::config::Config;
use flowlink::engine::ScriptingEngine;
use flowlink::handler::{LoggingRequestHandler, LoggingResponseHandler};
use flowlink::host::HostContext;
use flowlink::logging::{LogBroadcastLayer, LogSinkRegistry};
use flowlink::transport::{Connection, DefaultConnection, LoadBalancer};

#[derive(Parser, Debug)]
#[command(name = "flowlink")]
#[command(about = "Remote command protocol for flow hosts")]
struct Args {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run a scripting engine until stopped
    Listen {
        /// Port to listen on (overrides configuration)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one command to remote engines
    Send {
        /// Remote engine as host:port; repeat to balance across several
        #[arg(long = "remote", required = true)]
        remotes: Vec<String>,

        #[command(subcommand)]
        command: RemoteCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RemoteCommand {
    /// Check that the remote engine answers
    Ping,
    /// Stop the remote host process
    Stop {
        #[arg(long)]
        stop_flows: bool,
    },
    /// Stop the remote engine only
    StopEngine,
    /// Restart the remote host process
    Restart {
        #[arg(long)]
        more_memory: bool,
        #[arg(long)]
        stop_flows: bool,
    },
    /// Fetch a flow definition
    GetFlow {
        #[arg(long)]
        id: Option<u32>,
        /// Load from this file on the remote host
        #[arg(long)]
        file: Option<String>,
        /// Write the flow here instead of logging it
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List running flows
    ListFlows,
    /// Stop one running flow
    StopFlow {
        #[arg(long)]
        id: u32,
    },
    /// Stream the remote host's logs to this terminal
    RemoteLogging {
        /// Local port to receive logs on
        #[arg(long)]
        port: u16,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr and to any registered remote sinks
    let sinks = Arc::new(LogSinkRegistry::new());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(LogBroadcastLayer::new(Arc::clone(&sinks)))
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let context = Arc::new(
        HostContext::new(sinks, config.port_pool()?)
            .with_hosts(
                config.engine.bind_host.clone(),
                config.engine.advertise_host.clone(),
            )
            .with_restart_grace(config.restart_grace())
            .with_connect_timeout(config.connection_settings().connect_timeout),
    );
    let processor = Arc::new(CommandProcessor::default());

    match args.mode {
        Mode::Listen { port } => listen(&config, context, processor, port).await,
        Mode::Send { remotes, command } => {
            send(&config, context, processor, &remotes, command).await
        }
    }
}

async fn listen(
    config: &Config,
    context: Arc<HostContext>,
    processor: Arc<CommandProcessor>,
    port: Option<u16>,
) -> Result<()> {
    let mut settings = config.engine_settings();
    if let Some(port) = port {
        settings = settings.on_port(port);
    }
    info!(port = settings.port, "Starting scripting engine");

    let engine = ScriptingEngine::new(settings, context, processor)
        .with_connection_settings(config.connection_settings())
        .with_request_handler(Arc::new(LoggingRequestHandler))
        .with_response_handler(Arc::new(LoggingResponseHandler));
    engine.execute().await?;
    Ok(())
}

fn parse_remote(remote: &str) -> Result<(String, u16)> {
    let (host, port) = remote
        .rsplit_once(':')
        .with_context(|| format!("Remote must be host:port, got '{remote}'"))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in remote '{remote}'"))?;
    Ok((host.to_string(), port))
}

async fn send(
    config: &Config,
    context: Arc<HostContext>,
    processor: Arc<CommandProcessor>,
    remotes: &[String],
    command: RemoteCommand,
) -> Result<()> {
    let settings = config.connection_settings();
    let mut connections: Vec<Arc<dyn Connection>> = Vec::with_capacity(remotes.len());
    for remote in remotes {
        let (host, port) = parse_remote(remote)?;
        connections.push(Arc::new(DefaultConnection::new(
            host,
            port,
            settings,
            Arc::clone(&processor),
        )));
    }
    let connection: Arc<dyn Connection> = if connections.len() == 1 {
        connections.remove(0)
    } else {
        Arc::new(LoadBalancer::with_connections(connections))
    };

    let client = RemoteClient::new(connection, Arc::clone(&context), processor)
        .with_engine_settings(config.engine_settings())
        .with_connection_settings(settings)
        .with_response_handler(Arc::new(LoggingResponseHandler));

    let logging_timeout = config.logging_timeout();
    let mut command: Box<dyn Command> = match command {
        RemoteCommand::Ping => Box::new(Ping::default()),
        RemoteCommand::Stop { stop_flows } => Box::new(Stop::default().with_stop_flows(stop_flows)),
        RemoteCommand::StopEngine => Box::new(StopEngine::default()),
        RemoteCommand::Restart {
            more_memory,
            stop_flows,
        } => Box::new(Restart::new(more_memory).with_stop_flows(stop_flows)),
        RemoteCommand::GetFlow { id, file, output } => {
            let mut get = id.map_or_else(GetFlow::new, GetFlow::by_id);
            if let Some(file) = file {
                get = get.from_file(file);
            }
            if let Some(output) = output {
                get = get.write_to(output);
            }
            Box::new(get)
        }
        RemoteCommand::ListFlows => Box::new(ListFlows::default()),
        RemoteCommand::StopFlow { id } => Box::new(StopFlow::new(id)),
        RemoteCommand::RemoteLogging { port, timeout_ms } => Box::new(
            StartRemoteLogging::new(port)
                .with_timeout(timeout_ms.map_or(logging_timeout, Duration::from_millis)),
        ),
    };

    if !command.expects_response() {
        client.send(command.as_mut()).await?;
        info!(command = command.type_tag(), "Command delivered");
        return Ok(());
    }

    let response = client.request(command.as_mut()).await?;
    if let Some(message) = response.failure() {
        bail!("{} failed on remote host: {message}", command.type_tag());
    }

    // Keep the process alive while remote logs stream in
    if command.type_tag() == StartRemoteLogging::TAG {
        info!("Receiving remote logs, press Ctrl-C to stop");
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal?,
            () = context.wait_for_log_receivers() => info!("Remote host went quiet, log receiver stopped"),
        }
    }
    Ok(())
}
