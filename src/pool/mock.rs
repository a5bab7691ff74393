/// In-memory servers, connections and pools for tests and simulations
///
/// A [`MockServer`] answers commands from a per-command reply table and can be
/// made unreachable or slow. [`MockPool`] hands out a fresh initialised
/// connection on every acquire and ignores releases.
use crate::core::document::{self, document};
use crate::core::{Document, Endpoint};
use crate::error::{TopologyError, TopologyResult};
use crate::pool::{
    initialize_connection, next_pooled_id, next_unpooled_id, Connection, ConnectionFactory,
    ConnectionPool, PoolFactory,
};
use crate::utils::lock;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reply of a standalone `mongod`
pub fn standalone_reply() -> Document {
    document(json!({
        "ismaster": true,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48_000_000,
        "maxWriteBatchSize": 1000,
        "minWireVersion": 0,
        "maxWireVersion": 3,
        "ok": 1
    }))
}

fn replica_set_reply(set_name: &str, hosts: &[&str], me: &str) -> Document {
    let mut reply = standalone_reply();
    reply.insert("setName".to_string(), json!(set_name));
    reply.insert("hosts".to_string(), json!(hosts));
    reply.insert("me".to_string(), json!(me));
    reply.insert("setVersion".to_string(), json!(1));
    reply
}

pub fn primary_reply(set_name: &str, hosts: &[&str], me: &str) -> Document {
    let mut reply = replica_set_reply(set_name, hosts, me);
    reply.insert("primary".to_string(), json!(me));
    reply
}

pub fn secondary_reply(set_name: &str, hosts: &[&str], me: &str, primary: Option<&str>) -> Document {
    let mut reply = replica_set_reply(set_name, hosts, me);
    reply.insert("ismaster".to_string(), json!(false));
    reply.insert("secondary".to_string(), json!(true));
    if let Some(primary) = primary {
        reply.insert("primary".to_string(), json!(primary));
    }
    reply
}

pub fn arbiter_reply(set_name: &str, hosts: &[&str], me: &str) -> Document {
    let mut reply = replica_set_reply(set_name, hosts, me);
    reply.insert("ismaster".to_string(), json!(false));
    reply.insert("arbiterOnly".to_string(), json!(true));
    reply
}

/// Reply of a sharding router
pub fn mongos_reply() -> Document {
    let mut reply = standalone_reply();
    reply.insert("msg".to_string(), json!("isdbgrid"));
    reply
}

#[derive(Debug)]
struct MockServerState {
    replies: HashMap<String, Document>,
    reachable: bool,
    latency: Duration,
    open_attempts: usize,
    commands_run: usize,
}

/// Scriptable server shared by every connection made to it
#[derive(Debug, Clone)]
pub struct MockServer {
    state: Arc<Mutex<MockServerState>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// A reachable standalone server
    pub fn new() -> Self {
        Self::with_is_master(standalone_reply())
    }

    pub fn with_is_master(reply: Document) -> Self {
        let mut replies = HashMap::new();
        replies.insert("ismaster".to_string(), reply);
        replies.insert("ping".to_string(), document(json!({ "ok": 1 })));
        replies.insert(
            "buildinfo".to_string(),
            document(json!({ "version": "3.0.4", "versionArray": [3, 0, 4, 0], "ok": 1 })),
        );

        Self {
            state: Arc::new(Mutex::new(MockServerState {
                replies,
                reachable: true,
                latency: Duration::ZERO,
                open_attempts: 0,
                commands_run: 0,
            })),
        }
    }

    /// Replace the reply for `command` (matched case-insensitively)
    pub fn set_reply(&self, command: &str, reply: Document) {
        lock(&self.state)
            .replies
            .insert(command.to_ascii_lowercase(), reply);
    }

    pub fn set_is_master(&self, reply: Document) {
        self.set_reply("ismaster", reply);
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Delay applied to every open and command
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    pub fn open_attempts(&self) -> usize {
        lock(&self.state).open_attempts
    }

    pub fn commands_run(&self) -> usize {
        lock(&self.state).commands_run
    }

    /// An unopened connection to this server
    pub fn connect(&self, endpoint: &Endpoint, id: i64) -> Box<dyn Connection> {
        Box::new(MockConnection {
            id,
            endpoint: endpoint.clone(),
            server: self.clone(),
            open: false,
        })
    }

    fn begin_open(&self) -> (bool, Duration) {
        let mut state = lock(&self.state);
        state.open_attempts += 1;
        (state.reachable, state.latency)
    }

    fn respond(&self, command: &Document) -> (Option<Document>, Duration) {
        let mut state = lock(&self.state);
        state.commands_run += 1;
        if !state.reachable {
            return (None, state.latency);
        }

        let reply = document::command_name(command)
            .and_then(|name| state.replies.get(&name.to_ascii_lowercase()).cloned())
            .unwrap_or_else(|| document(json!({ "ok": 1 })));
        (Some(reply), state.latency)
    }
}

async fn simulate_latency(latency: Duration, timeout: Duration, operation: &str) -> TopologyResult<()> {
    if latency.is_zero() {
        return Ok(());
    }
    tokio::time::timeout(timeout, tokio::time::sleep(latency))
        .await
        .map_err(|_| TopologyError::timeout(operation))
}

#[derive(Debug)]
pub struct MockConnection {
    id: i64,
    endpoint: Endpoint,
    server: MockServer,
    open: bool,
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> i64 {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self, timeout: Duration) -> TopologyResult<()> {
        let (reachable, latency) = self.server.begin_open();
        simulate_latency(latency, timeout, "open connection").await?;
        if !reachable {
            return Err(TopologyError::connection(&self.endpoint, "connection refused"));
        }
        self.open = true;
        Ok(())
    }

    async fn run_command(
        &mut self,
        _database: &str,
        command: &Document,
        timeout: Duration,
    ) -> TopologyResult<Document> {
        if !self.open {
            return Err(TopologyError::connection(&self.endpoint, "connection is not open"));
        }

        let (reply, latency) = self.server.respond(command);
        simulate_latency(latency, timeout, "run command").await?;
        match reply {
            Some(reply) => Ok(reply),
            None => {
                self.open = false;
                Err(TopologyError::connection(&self.endpoint, "connection reset by peer"))
            }
        }
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Connects every connection to one server, whatever the endpoint
pub struct MockConnectionFactory {
    server: MockServer,
}

impl MockConnectionFactory {
    pub fn new(server: MockServer) -> Self {
        Self { server }
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create(&self, endpoint: &Endpoint, id: i64) -> Box<dyn Connection> {
        self.server.connect(endpoint, id)
    }
}

#[derive(Debug)]
pub struct MockPool {
    endpoint: Endpoint,
    server: MockServer,
    disposed: AtomicBool,
    acquired: AtomicUsize,
    unpooled: AtomicUsize,
    released: AtomicUsize,
}

impl MockPool {
    pub fn new(endpoint: Endpoint, server: MockServer) -> Self {
        Self {
            endpoint,
            server,
            disposed: AtomicBool::new(false),
            acquired: AtomicUsize::new(0),
            unpooled: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn unpooled_count(&self) -> usize {
        self.unpooled.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    async fn open(
        &self,
        id: i64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>> {
        if self.is_disposed() {
            return Err(TopologyError::disposed(format!("Mock pool for {}", self.endpoint)));
        }
        let mut connection = self.server.connect(&self.endpoint, id);
        initialize_connection(connection.as_mut(), timeout, cancel).await?;
        Ok(connection)
    }
}

#[async_trait]
impl ConnectionPool for MockPool {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn acquire_connection(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>> {
        let connection = self.open(next_pooled_id(), timeout, cancel).await?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }

    async fn create_unpooled_connection(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>> {
        let connection = self.open(next_unpooled_id(), timeout, cancel).await?;
        self.unpooled.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }

    fn release_connection(&self, _connection: Box<dyn Connection>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Pools created for one endpoint
#[derive(Debug, Clone)]
pub struct MockPools {
    pub dedicated: Arc<MockPool>,
    pub shared: Option<Arc<MockPool>>,
}

/// Builds [`MockPool`]s backed by per-endpoint [`MockServer`]s.
///
/// Endpoints without a registered server get a reachable standalone one.
#[derive(Default)]
pub struct MockPoolFactory {
    servers: Mutex<HashMap<Endpoint, MockServer>>,
    created: Mutex<HashMap<Endpoint, MockPools>>,
    shared: bool,
}

impl MockPoolFactory {
    /// Dedicated pools only; nodes fall back to them for shared traffic
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a separate shared pool per endpoint too
    pub fn with_shared_pools() -> Self {
        Self {
            shared: true,
            ..Self::default()
        }
    }

    pub fn add_server(&self, endpoint: Endpoint, server: MockServer) {
        lock(&self.servers).insert(endpoint, server);
    }

    pub fn server(&self, endpoint: &Endpoint) -> MockServer {
        lock(&self.servers)
            .entry(endpoint.clone())
            .or_default()
            .clone()
    }

    pub fn pools(&self, endpoint: &Endpoint) -> Option<MockPools> {
        lock(&self.created).get(endpoint).cloned()
    }
}

impl PoolFactory for MockPoolFactory {
    fn create_dedicated_pool(&self, endpoint: &Endpoint) -> Arc<dyn ConnectionPool> {
        let pool = Arc::new(MockPool::new(endpoint.clone(), self.server(endpoint)));
        lock(&self.created).insert(
            endpoint.clone(),
            MockPools {
                dedicated: Arc::clone(&pool),
                shared: None,
            },
        );
        pool
    }

    fn create_shared_pool(&self, endpoint: &Endpoint) -> Option<Arc<dyn ConnectionPool>> {
        if !self.shared {
            return None;
        }
        let pool = Arc::new(MockPool::new(endpoint.clone(), self.server(endpoint)));
        if let Some(pools) = lock(&self.created).get_mut(endpoint) {
            pools.shared = Some(Arc::clone(&pool));
        }
        Some(pool)
    }
}
