//! Shared fixtures: real engines on loopback ports.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use flowlink::client::RemoteClient;
use flowlink::codec::CommandProcessor;
use flowlink::command::Command;
use flowlink::config::{ConnectionSettings, EngineSettings};
use flowlink::engine::ScriptingEngine;
use flowlink::flow::InMemoryFlowRegistry;
use flowlink::handler::RequestHandler;
use flowlink::host::{FlowRegistry, HostContext, PortPool, ProcessControl};
use flowlink::logging::LogSinkRegistry;
use flowlink::transport::{Connection, DefaultConnection};
use tokio::task::JoinHandle;

pub fn settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(5),
        response_timeout: Duration::from_secs(5),
    }
}

pub fn context(ports: std::ops::RangeInclusive<u16>) -> HostContext {
    HostContext::new(Arc::new(LogSinkRegistry::new()), PortPool::new(ports).unwrap())
        .with_restart_grace(Duration::from_millis(200))
        .with_connect_timeout(Duration::from_secs(2))
}

/// Records exit calls instead of exiting, along with whether the engine had
/// already been told to stop.
#[derive(Default)]
pub struct ExitProbe {
    engine: OnceLock<Weak<ScriptingEngine>>,
    exits: Mutex<Vec<(i32, bool)>>,
}

impl ExitProbe {
    pub fn watch(&self, engine: &Arc<ScriptingEngine>) {
        let _ = self.engine.set(Arc::downgrade(engine));
    }

    pub fn exits(&self) -> Vec<(i32, bool)> {
        self.exits.lock().unwrap().clone()
    }
}

impl ProcessControl for ExitProbe {
    fn exit(&self, code: i32) {
        let stopped = self
            .engine
            .get()
            .and_then(Weak::upgrade)
            .is_some_and(|engine| engine.stop_requested());
        self.exits.lock().unwrap().push((code, stopped));
    }
}

/// Counts requests seen by an engine.
#[derive(Default)]
pub struct RequestCounter(AtomicUsize);

impl RequestCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl RequestHandler for RequestCounter {
    fn handle_request(&self, _command: &dyn Command) -> flowlink::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A running engine on an ephemeral port.
pub struct RemoteHost {
    pub engine: Arc<ScriptingEngine>,
    pub task: JoinHandle<flowlink::Result<()>>,
    pub addr: SocketAddr,
    pub flows: Arc<InMemoryFlowRegistry>,
    pub requests: Arc<RequestCounter>,
    pub exits: Arc<ExitProbe>,
}

impl RemoteHost {
    pub async fn start(context: HostContext) -> Self {
        let flows = Arc::new(InMemoryFlowRegistry::new());
        let exits = Arc::new(ExitProbe::default());
        let requests = Arc::new(RequestCounter::default());
        let context = context
            .with_flows(Arc::clone(&flows) as Arc<dyn FlowRegistry>)
            .with_process(Arc::clone(&exits) as Arc<dyn ProcessControl>);

        let engine = Arc::new(
            ScriptingEngine::new(
                EngineSettings::default().on_port(0),
                Arc::new(context),
                Arc::new(CommandProcessor::default()),
            )
            .with_connection_settings(settings())
            .with_request_handler(Arc::clone(&requests) as Arc<dyn RequestHandler>),
        );
        exits.watch(&engine);

        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.execute().await }
        });
        let addr = engine.wait_until_listening().await.unwrap();

        Self {
            engine,
            task,
            addr,
            flows,
            requests,
            exits,
        }
    }

    pub fn connection(&self) -> DefaultConnection {
        DefaultConnection::new(
            "127.0.0.1",
            self.addr.port(),
            settings(),
            Arc::new(CommandProcessor::default()),
        )
    }

    pub fn client(&self, ports: std::ops::RangeInclusive<u16>) -> RemoteClient {
        client_for(Arc::new(self.connection()), ports)
    }

    /// Wait for the accept loop to exit.
    pub async fn join(self) {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("engine should stop")
            .unwrap()
            .unwrap();
    }

    pub async fn shutdown(self) {
        self.engine.stop_execution();
        self.join().await;
    }
}

pub fn client_for(connection: Arc<dyn Connection>, ports: std::ops::RangeInclusive<u16>) -> RemoteClient {
    RemoteClient::new(
        connection,
        Arc::new(context(ports)),
        Arc::new(CommandProcessor::default()),
    )
    .with_connection_settings(settings())
}
