//! flowlink library
//!
//! Remote command protocol for controlling flow hosts over the network:
//! - Commands with a textual wire codec and a tag-keyed registry
//! - Direct and load-balanced connections over length-prefixed TCP frames
//! - The scripting engine that receives and dispatches commands
//! - Remote log forwarding built on `tracing`

pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod handler;
pub mod host;
pub mod logging;
pub mod transport;

pub use error::{Result, ScriptingError};
