/// Checked-out connections handed to node callers
use super::Node;
use crate::core::{Document, Endpoint};
use crate::error::{TopologyError, TopologyResult};
use crate::pool::{Connection, ConnectionPool};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the caller intends to do with a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// A pooled connection bound to the node it came from.
///
/// Returned to its pool on drop. A transport failure on it asks the node to
/// re-probe straight away.
pub struct NodeConnection {
    node: Arc<Node>,
    pool: Arc<dyn ConnectionPool>,
    connection: Option<Box<dyn Connection>>,
    access: Access,
}

impl NodeConnection {
    pub(crate) fn new(
        node: Arc<Node>,
        pool: Arc<dyn ConnectionPool>,
        connection: Box<dyn Connection>,
        access: Access,
    ) -> Self {
        Self {
            node,
            pool,
            connection: Some(connection),
            access,
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.connection.as_ref().map(|c| c.id())
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.node.endpoint()
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Run a command that only reads
    pub async fn run_command(
        &mut self,
        database: &str,
        command: &Document,
        timeout: Duration,
    ) -> TopologyResult<Document> {
        self.execute(database, command, timeout).await
    }

    /// Run a command that writes. Needs [`Access::ReadWrite`].
    pub async fn run_write_command(
        &mut self,
        database: &str,
        command: &Document,
        timeout: Duration,
    ) -> TopologyResult<Document> {
        if self.access != Access::ReadWrite {
            return Err(TopologyError::not_writable(self.node.endpoint()));
        }
        self.execute(database, command, timeout).await
    }

    async fn execute(
        &mut self,
        database: &str,
        command: &Document,
        timeout: Duration,
    ) -> TopologyResult<Document> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| TopologyError::internal("connection already released"))?;

        let result = connection.run_command(database, command, timeout).await;
        if let Err(e) = &result {
            if e.is_connection_error() {
                debug!(endpoint = %self.node.endpoint(), error = %e, "connection failed, requesting probe");
                let _ = self.node.request_probe();
            }
        }
        result
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release_connection(connection);
        }
    }
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("endpoint", self.node.endpoint())
            .field("id", &self.id())
            .field("access", &self.access)
            .finish()
    }
}
