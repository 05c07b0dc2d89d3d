//! Round-robin load balancer over a pool of connections.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::Connection;
use crate::command::Command;
use crate::error::{Result, ScriptingError};

#[derive(Debug, Default)]
struct Cursors {
    request: usize,
    response: usize,
}

/// Distributes requests and responses across connections.
///
/// Requests and responses advance independent cursors. A cursor moves on
/// every send, successful or not. The connection set must not be changed
/// while sends are in flight; `&mut self` on the mutators enforces that for
/// owned balancers.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    connections: Vec<Arc<dyn Connection>>,
    cursors: Mutex<Cursors>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(connections: Vec<Arc<dyn Connection>>) -> Self {
        Self {
            connections,
            cursors: Mutex::new(Cursors::default()),
        }
    }

    pub fn add_connection(&mut self, connection: Arc<dyn Connection>) {
        self.connections.push(connection);
        self.reset_cursors();
    }

    /// Remove the connection at `index`, returning it if present.
    pub fn remove_connection(&mut self, index: usize) -> Option<Arc<dyn Connection>> {
        if index >= self.connections.len() {
            return None;
        }
        let removed = self.connections.remove(index);
        self.reset_cursors();
        Some(removed)
    }

    pub fn connections(&self) -> &[Arc<dyn Connection>] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn reset_cursors(&mut self) {
        *self.cursors.get_mut().unwrap_or_else(PoisonError::into_inner) = Cursors::default();
    }

    /// Precondition for every request.
    pub fn check_request(&self) -> Result<()> {
        if self.connections.is_empty() {
            return Err(ScriptingError::Config(
                "load balancer has no connections to send requests to".into(),
            ));
        }
        Ok(())
    }

    /// Precondition for every response.
    pub fn check_response(&self) -> Result<()> {
        if self.connections.is_empty() {
            return Err(ScriptingError::Config(
                "load balancer has no connections to send responses to".into(),
            ));
        }
        Ok(())
    }

    /// Pick a connection and advance the selected cursor in one step.
    fn next(&self, pick: impl FnOnce(&mut Cursors) -> &mut usize) -> (usize, Arc<dyn Connection>) {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = pick(&mut cursors);
        let index = *cursor % self.connections.len();
        *cursor = (index + 1) % self.connections.len();
        (index, Arc::clone(&self.connections[index]))
    }
}

#[async_trait]
impl Connection for LoadBalancer {
    async fn send_request(&self, command: &mut dyn Command) -> Result<()> {
        self.check_request()?;
        let (index, connection) = self.next(|c| &mut c.request);
        debug!(index, command = command.type_tag(), "Balancing request");
        connection.send_request(command).await
    }

    async fn send_response(&self, command: &dyn Command) -> Result<()> {
        self.check_response()?;
        let (index, connection) = self.next(|c| &mut c.response);
        debug!(index, command = command.type_tag(), "Balancing response");
        connection.send_response(command).await
    }
}
