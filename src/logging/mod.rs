//! Process log stream plumbing for remote logging.
//!
//! `LogBroadcastLayer` is a `tracing` layer that turns every event into a
//! [`LogRecord`] and hands it to the sinks registered in a
//! [`LogSinkRegistry`]. Remote logging adds a forwarding sink on the
//! controlled host and a receiver on the controlling host.

pub mod forward;
pub mod protocol;
pub mod receiver;

pub use forward::{start_forwarding, ForwardingSink};
pub use protocol::LogFrame;
pub use receiver::{LogReceiver, REMOTE_TARGET};

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Events from this module tree are never broadcast, so forwarding cannot
/// feed on its own diagnostics.
const INTERNAL_TARGET: &str = "flowlink::logging";

/// One entry of the log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    pub fn now(level: impl Into<String>, target: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self {
            timestamp_ms,
            level: level.into(),
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Receiver of log records. Must not block.
pub trait LogSink: Send + Sync {
    fn accept(&self, record: &LogRecord);
}

/// Handle returned by [`LogSinkRegistry::add_sink`].
pub type SinkId = u64;

/// Registered sinks of the process log stream.
#[derive(Default)]
pub struct LogSinkRegistry {
    sinks: RwLock<Vec<(SinkId, Arc<dyn LogSink>)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for LogSinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSinkRegistry")
            .field("sinks", &self.len())
            .finish()
    }
}

impl LogSinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn LogSink>) -> SinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, sink));
        id
    }

    /// Remove a sink. Returns `false` if it was already gone.
    pub fn remove_sink(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        sinks.len() != before
    }

    pub fn contains(&self, id: SinkId) -> bool {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(sink_id, _)| *sink_id == id)
    }

    /// Hand a record to every sink.
    pub fn publish(&self, record: &LogRecord) {
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        for (_, sink) in sinks.iter() {
            sink.accept(record);
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `tracing` layer feeding the sink registry.
#[derive(Debug, Clone)]
pub struct LogBroadcastLayer {
    registry: Arc<LogSinkRegistry>,
}

impl LogBroadcastLayer {
    pub const fn new(registry: Arc<LogSinkRegistry>) -> Self {
        Self { registry }
    }
}

impl<S: Subscriber> Layer<S> for LogBroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Records re-emitted from a remote host stay local, so two hosts
        // streaming to each other cannot bounce them back and forth.
        let target = metadata.target();
        if target.starts_with(INTERNAL_TARGET)
            || target.starts_with(REMOTE_TARGET)
            || self.registry.is_empty()
        {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord::now(
            metadata.level().as_str(),
            metadata.target(),
            visitor.finish(),
        );
        self.registry.publish(&record);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(mut self) -> String {
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(self.fields.trim_start());
        }
        self.message
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}
