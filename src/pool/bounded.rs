/// Bounded connection pool
///
/// Capacity is a fair semaphore: waiters are served in arrival order, so a
/// steady stream of acquirers cannot starve an earlier one. Each checked-out
/// connection holds one permit, keyed by connection id, until it is released.
use crate::clock::SlidingTimeout;
use crate::config::PoolSettings;
use crate::core::Endpoint;
use crate::error::{TopologyError, TopologyResult};
use crate::pool::{
    initialize_connection, next_pooled_id, next_unpooled_id, Connection, ConnectionFactory,
    ConnectionPool,
};
use crate::utils::lock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct BoundedPool {
    endpoint: Endpoint,
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    checked_out: Mutex<HashMap<i64, OwnedSemaphorePermit>>,
    disposed: AtomicBool,
}

impl BoundedPool {
    pub fn new(
        endpoint: Endpoint,
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(settings.max_size())),
            endpoint,
            settings,
            factory,
            idle: Mutex::new(Vec::new()),
            checked_out: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Connections not currently checked out and not yet created
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.idle).len()
    }

    pub fn checked_out_count(&self) -> usize {
        lock(&self.checked_out).len()
    }

    fn ensure_not_disposed(&self) -> TopologyResult<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        Ok(())
    }

    fn disposed_error(&self) -> TopologyError {
        TopologyError::disposed(format!("Connection pool for {}", self.endpoint))
    }

    /// Most recently returned open connection, discarding closed ones
    fn take_idle(&self) -> Option<Box<dyn Connection>> {
        let mut idle = lock(&self.idle);
        while let Some(mut connection) = idle.pop() {
            if connection.is_open() {
                return Some(connection);
            }
            connection.close();
        }
        None
    }

    async fn open_new(
        &self,
        id: i64,
        budget: &SlidingTimeout,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>> {
        let mut connection = self.factory.create(&self.endpoint, id);
        let timeout = budget.remaining()?.min(self.settings.connect_timeout());
        initialize_connection(connection.as_mut(), timeout, cancel).await?;
        debug!(endpoint = %self.endpoint, connection_id = id, "opened connection");
        Ok(connection)
    }
}

#[async_trait]
impl ConnectionPool for BoundedPool {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn acquire_connection(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>> {
        self.ensure_not_disposed()?;
        let budget = SlidingTimeout::new(timeout);

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TopologyError::Cancelled),
            permit = budget.apply("acquire connection", Arc::clone(&self.permits).acquire_owned()) => {
                // the semaphore is only closed by dispose
                permit?.map_err(|_| self.disposed_error())?
            }
        };

        let connection = match self.take_idle() {
            Some(connection) => connection,
            None => self.open_new(next_pooled_id(), &budget, cancel).await?,
        };

        if self.is_disposed() {
            let mut connection = connection;
            connection.close();
            return Err(self.disposed_error());
        }

        lock(&self.checked_out).insert(connection.id(), permit);
        Ok(connection)
    }

    async fn create_unpooled_connection(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>> {
        self.ensure_not_disposed()?;
        let budget = SlidingTimeout::new(timeout);
        self.open_new(next_unpooled_id(), &budget, cancel).await
    }

    fn release_connection(&self, mut connection: Box<dyn Connection>) {
        let permit = lock(&self.checked_out).remove(&connection.id());

        let Some(permit) = permit else {
            if connection.id() > 0 {
                warn!(
                    endpoint = %self.endpoint,
                    connection_id = connection.id(),
                    "released a connection this pool did not hand out"
                );
            }
            connection.close();
            return;
        };

        if self.is_disposed() || !connection.is_open() {
            connection.close();
        } else {
            lock(&self.idle).push(connection);
        }
        drop(permit);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let idle: Vec<_> = lock(&self.idle).drain(..).collect();
        for mut connection in idle {
            connection.close();
        }
        debug!(endpoint = %self.endpoint, "connection pool disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BoundedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPool")
            .field("endpoint", &self.endpoint)
            .field("max_size", &self.settings.max_size())
            .field("available", &self.available())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for BoundedPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::mock::{MockConnectionFactory, MockServer};

    fn pool_with(server: &MockServer, max_size: usize) -> BoundedPool {
        BoundedPool::new(
            Endpoint::new("localhost", 27017),
            PoolSettings::default().with_max_size(max_size),
            Arc::new(MockConnectionFactory::new(server.clone())),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_reuse() {
        let server = MockServer::new();
        let pool = pool_with(&server, 2);
        let cancel = CancellationToken::new();

        let connection = pool
            .acquire_connection(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let id = connection.id();
        assert!(id > 0);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.checked_out_count(), 1);

        pool.release_connection(connection);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.idle_count(), 1);

        let again = pool
            .acquire_connection(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(server.open_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let server = MockServer::new();
        let pool = pool_with(&server, 1);
        let cancel = CancellationToken::new();

        let _held = pool
            .acquire_connection(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let result = pool.acquire_connection(Duration::from_secs(2), &cancel).await;
        assert!(matches!(result, Err(TopologyError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancelled_while_waiting() {
        let server = MockServer::new();
        let pool = Arc::new(pool_with(&server, 1));
        let cancel = CancellationToken::new();

        let _held = pool
            .acquire_connection(Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.acquire_connection(crate::clock::INFINITE, &cancel)
                    .await
                    .map(|c| c.id())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(TopologyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_waiter_is_served_on_release() {
        let server = MockServer::new();
        let pool = Arc::new(pool_with(&server, 1));
        let cancel = CancellationToken::new();

        let held = pool
            .acquire_connection(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire_connection(Duration::from_secs(5), &CancellationToken::new())
                    .await
                    .map(|c| c.id())
            })
        };
        tokio::task::yield_now().await;
        pool.release_connection(held);

        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    }

    #[tokio::test]
    async fn test_failed_initialisation_does_not_leak() {
        let server = MockServer::new();
        server.set_reachable(false);
        let pool = pool_with(&server, 1);

        let result = pool
            .acquire_connection(Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TopologyError::Connection { .. })));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.checked_out_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_unpooled_connections() {
        let server = MockServer::new();
        let pool = pool_with(&server, 1);

        let connection = pool
            .create_unpooled_connection(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(connection.id() < 0);
        assert!(connection.is_open());
        // unpooled connections never consume pool capacity
        assert_eq!(pool.available(), 1);

        pool.release_connection(connection);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_foreign_and_double_release() {
        let server = MockServer::new();
        let pool = pool_with(&server, 1);

        let foreign = server.connect(&Endpoint::new("elsewhere", 1), next_pooled_id());
        pool.release_connection(foreign);
        assert_eq!(pool.available(), 1);

        let connection = pool
            .acquire_connection(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        let id = connection.id();
        pool.release_connection(connection);

        let duplicate = server.connect(&Endpoint::new("localhost", 27017), id);
        pool.release_connection(duplicate);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_reused() {
        let server = MockServer::new();
        let pool = pool_with(&server, 1);
        let cancel = CancellationToken::new();

        let mut connection = pool
            .acquire_connection(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let id = connection.id();
        connection.close();
        pool.release_connection(connection);
        assert_eq!(pool.idle_count(), 0);

        let fresh = pool
            .acquire_connection(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_ne!(fresh.id(), id);
    }

    #[tokio::test]
    async fn test_dispose() {
        let server = MockServer::new();
        let pool = pool_with(&server, 2);
        let cancel = CancellationToken::new();

        let connection = pool
            .acquire_connection(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        pool.dispose();
        pool.dispose();
        assert!(pool.is_disposed());

        let result = pool.acquire_connection(Duration::from_secs(1), &cancel).await;
        assert!(matches!(result, Err(TopologyError::Disposed { .. })));
        let result = pool
            .create_unpooled_connection(Duration::from_secs(1), &cancel)
            .await;
        assert!(matches!(result, Err(TopologyError::Disposed { .. })));

        // returning a connection after disposal closes it instead of pooling it
        pool.release_connection(connection);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_wakes_waiters() {
        let server = MockServer::new();
        let pool = Arc::new(pool_with(&server, 1));

        let _held = pool
            .acquire_connection(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire_connection(Duration::from_secs(30), &CancellationToken::new())
                    .await
                    .map(|c| c.id())
            })
        };
        tokio::task::yield_now().await;
        pool.dispose();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(TopologyError::Disposed { .. })
        ));
    }
}
