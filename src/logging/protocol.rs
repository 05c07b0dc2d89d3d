//! Remote logging frame types.
//!
//! Length-prefixed JSON, same framing as command frames:
//! [4-byte BE length][JSON payload]

use serde::{Deserialize, Serialize};

use super::LogRecord;

/// Frame sent from a forwarding sink to a log receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogFrame {
    /// One log record.
    Record { record: LogRecord },
    /// Keeps the channel alive while the host is quiet.
    Heartbeat,
}
