/// Connection pool contract
///
/// A node owns two pools: a dedicated one (monitoring and explicitly
/// dedicated callers) and a shared one for general traffic. Pool factories may
/// decline to build a shared pool, in which case the dedicated pool serves
/// both roles.
pub mod bounded;
pub mod mock;
pub mod tcp;

pub use bounded::BoundedPool;
pub use tcp::{TcpConnection, TcpConnectionFactory, WireCodec};

use crate::clock::SlidingTimeout;
use crate::config::PoolSettings;
use crate::core::{document, Document, Endpoint};
use crate::error::{TopologyError, TopologyResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lowest wire protocol version this driver speaks
pub const MIN_WIRE_VERSION: i64 = 0;
/// Highest wire protocol version this driver speaks
pub const MAX_WIRE_VERSION: i64 = 3;

static NEXT_POOLED_ID: AtomicI64 = AtomicI64::new(1);
static NEXT_UNPOOLED_ID: AtomicI64 = AtomicI64::new(-1);

/// Id for a connection that a pool hands out and reclaims
pub fn next_pooled_id() -> i64 {
    NEXT_POOLED_ID.fetch_add(1, Ordering::Relaxed)
}

/// Id for a connection owned solely by its creator
pub fn next_unpooled_id() -> i64 {
    NEXT_UNPOOLED_ID.fetch_sub(1, Ordering::Relaxed)
}

/// An opened (or openable) channel to one endpoint
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> i64;

    fn endpoint(&self) -> &Endpoint;

    fn is_open(&self) -> bool;

    async fn open(&mut self, timeout: Duration) -> TopologyResult<()>;

    /// Execute one command against `database` and return the reply document
    async fn run_command(
        &mut self,
        database: &str,
        command: &Document,
        timeout: Duration,
    ) -> TopologyResult<Document>;

    fn close(&mut self);
}

/// Produces connections that are not yet open
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, endpoint: &Endpoint, id: i64) -> Box<dyn Connection>;
}

#[async_trait]
pub trait ConnectionPool: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &Endpoint;

    /// Block until a connection is available, the budget runs out or `cancel` fires
    async fn acquire_connection(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>>;

    /// Always create a fresh connection, opened and initialised, owned by the caller
    async fn create_unpooled_connection(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>>;

    fn release_connection(&self, connection: Box<dyn Connection>);

    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Called once per node at construction time
pub trait PoolFactory: Send + Sync {
    fn create_dedicated_pool(&self, endpoint: &Endpoint) -> Arc<dyn ConnectionPool>;

    /// `None` means the node reuses its dedicated pool for shared traffic
    fn create_shared_pool(&self, endpoint: &Endpoint) -> Option<Arc<dyn ConnectionPool>>;
}

/// Open `connection` and negotiate the wire protocol range.
///
/// On failure the connection is closed before the error is returned, so a
/// half-initialised connection never reaches a pool.
pub async fn initialize_connection(
    connection: &mut dyn Connection,
    timeout: Duration,
    cancel: &CancellationToken,
) -> TopologyResult<()> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TopologyError::Cancelled),
        result = handshake(&mut *connection, timeout) => result,
    };

    if let Err(e) = &result {
        debug!(
            connection_id = connection.id(),
            endpoint = %connection.endpoint(),
            error = %e,
            "connection initialisation failed"
        );
        connection.close();
    }
    result
}

async fn handshake(connection: &mut dyn Connection, timeout: Duration) -> TopologyResult<()> {
    let budget = SlidingTimeout::new(timeout);
    connection.open(budget.remaining()?).await?;

    let reply = connection
        .run_command("admin", &document::command("ismaster"), budget.remaining()?)
        .await?;
    if !document::is_ok(&reply) {
        return Err(TopologyError::command(format!(
            "isMaster handshake rejected by {}",
            connection.endpoint()
        )));
    }

    check_wire_version(connection.endpoint(), &reply)
}

/// The server's `[minWireVersion, maxWireVersion]` must overlap ours
pub fn check_wire_version(endpoint: &Endpoint, reply: &Document) -> TopologyResult<()> {
    let server_min = document::get_i64(reply, "minWireVersion").unwrap_or(0);
    let server_max = document::get_i64(reply, "maxWireVersion").unwrap_or(0);

    if server_min > MAX_WIRE_VERSION || server_max < MIN_WIRE_VERSION {
        return Err(TopologyError::IncompatibleWireVersion {
            endpoint: endpoint.to_string(),
            server_min,
            server_max,
        });
    }
    Ok(())
}

/// Builds [`BoundedPool`]s over a collaborator-supplied connection factory
pub struct DefaultPoolFactory {
    connection_factory: Arc<dyn ConnectionFactory>,
    settings: PoolSettings,
}

impl DefaultPoolFactory {
    pub fn new(connection_factory: Arc<dyn ConnectionFactory>, settings: PoolSettings) -> Self {
        Self {
            connection_factory,
            settings,
        }
    }
}

impl PoolFactory for DefaultPoolFactory {
    fn create_dedicated_pool(&self, endpoint: &Endpoint) -> Arc<dyn ConnectionPool> {
        Arc::new(BoundedPool::new(
            endpoint.clone(),
            self.settings.clone(),
            Arc::clone(&self.connection_factory),
        ))
    }

    fn create_shared_pool(&self, endpoint: &Endpoint) -> Option<Arc<dyn ConnectionPool>> {
        if !self.settings.shared() {
            return None;
        }
        Some(Arc::new(BoundedPool::new(
            endpoint.clone(),
            self.settings.clone(),
            Arc::clone(&self.connection_factory),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::document;
    use crate::pool::mock::{MockConnectionFactory, MockServer};
    use serde_json::json;

    fn endpoint() -> Endpoint {
        Endpoint::new("localhost", 27017)
    }

    #[test]
    fn test_connection_ids() {
        let pooled = next_pooled_id();
        let unpooled = next_unpooled_id();
        assert!(pooled > 0);
        assert!(unpooled < 0);
        assert!(next_pooled_id() > pooled);
        assert!(next_unpooled_id() < unpooled);
    }

    #[test]
    fn test_wire_version_overlap() {
        let ok = document(json!({ "minWireVersion": 0, "maxWireVersion": 6 }));
        assert!(check_wire_version(&endpoint(), &ok).is_ok());

        let legacy = document(json!({}));
        assert!(check_wire_version(&endpoint(), &legacy).is_ok());

        let too_new = document(json!({ "minWireVersion": 7, "maxWireVersion": 9 }));
        assert!(matches!(
            check_wire_version(&endpoint(), &too_new),
            Err(TopologyError::IncompatibleWireVersion { server_min: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_initialize_opens_and_handshakes() {
        let server = MockServer::new();
        let mut connection = server.connect(&endpoint(), next_unpooled_id());

        initialize_connection(connection.as_mut(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(connection.is_open());
        assert_eq!(server.commands_run(), 1);
    }

    #[tokio::test]
    async fn test_initialize_failure_closes_connection() {
        let server = MockServer::new();
        server.set_is_master(document(json!({ "ok": 1, "minWireVersion": 10, "maxWireVersion": 12 })));
        let mut connection = server.connect(&endpoint(), next_unpooled_id());

        let result = initialize_connection(
            connection.as_mut(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_initialize_rejected_handshake() {
        let server = MockServer::new();
        server.set_is_master(document(json!({ "ok": 0, "errmsg": "not now" })));
        let mut connection = server.connect(&endpoint(), next_unpooled_id());

        let result = initialize_connection(
            connection.as_mut(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(TopologyError::Command { .. })));
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_initialize_cancelled() {
        let server = MockServer::new();
        let mut connection = server.connect(&endpoint(), next_unpooled_id());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = initialize_connection(connection.as_mut(), Duration::from_secs(1), &cancel).await;
        assert!(matches!(result, Err(TopologyError::Cancelled)));
        assert!(!connection.is_open());
    }

    #[test]
    fn test_default_factory_shared_pool_toggle() {
        let connections = Arc::new(MockConnectionFactory::new(MockServer::new()));

        let with_shared = DefaultPoolFactory::new(connections.clone(), PoolSettings::default());
        assert!(with_shared.create_shared_pool(&endpoint()).is_some());

        let dedicated_only =
            DefaultPoolFactory::new(connections, PoolSettings::default().with_shared(false));
        assert!(dedicated_only.create_shared_pool(&endpoint()).is_none());
        assert_eq!(dedicated_only.create_dedicated_pool(&endpoint()).endpoint(), &endpoint());
    }
}
