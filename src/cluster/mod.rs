/// A set of monitored nodes and the topology they describe together
///
/// The cluster owns one [`Node`] per seed. Every node routes its
/// [`NodeInfoChange`]s into one channel that a background task drains into a
/// [`ClusterDescription`], published through a `watch` channel.
use crate::clock::SlidingTimeout;
use crate::config::ClusterSettings;
use crate::core::Endpoint;
use crate::error::{TopologyError, TopologyResult};
use crate::node::{Node, NodeInfo, NodeInfoChange, NodeListener, NodeType};
use crate::utils::{generate_id, lock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterType {
    Unknown,
    Standalone,
    ReplicaSet,
    Sharded,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::Unknown => write!(f, "Unknown"),
            ClusterType::Standalone => write!(f, "Standalone"),
            ClusterType::ReplicaSet => write!(f, "ReplicaSet"),
            ClusterType::Sharded => write!(f, "Sharded"),
        }
    }
}

/// Latest snapshot of every node, plus what they add up to
#[derive(Debug, Clone)]
pub struct ClusterDescription {
    cluster_type: ClusterType,
    nodes: BTreeMap<Endpoint, Arc<NodeInfo>>,
    revision: u64,
}

impl ClusterDescription {
    fn new(nodes: BTreeMap<Endpoint, Arc<NodeInfo>>) -> Self {
        let mut description = Self {
            cluster_type: ClusterType::Unknown,
            nodes,
            revision: 0,
        };
        description.cluster_type = description.derive_type();
        description
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    /// Bumped once per applied node change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeInfo>> {
        self.nodes.values()
    }

    pub fn node(&self, endpoint: &Endpoint) -> Option<&Arc<NodeInfo>> {
        self.nodes.get(endpoint)
    }

    pub fn connected_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_connected()).count()
    }

    /// Nodes currently reporting `node_type`
    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<&Arc<NodeInfo>> {
        self.nodes
            .values()
            .filter(|n| n.node_type() == node_type)
            .collect()
    }

    /// Keeps the newest revision per node; stale changes are ignored
    fn apply(&mut self, change: &NodeInfoChange) -> bool {
        let endpoint = change.new.endpoint();
        if let Some(current) = self.nodes.get(endpoint) {
            if current.revision() >= change.new.revision() {
                return false;
            }
        }

        self.nodes.insert(endpoint.clone(), Arc::clone(&change.new));
        self.revision += 1;
        self.cluster_type = self.derive_type();
        true
    }

    fn derive_type(&self) -> ClusterType {
        let types: Vec<NodeType> = self
            .nodes
            .values()
            .filter(|n| n.is_connected())
            .map(|n| n.node_type())
            .collect();

        if types.contains(&NodeType::ShardRouter) {
            ClusterType::Sharded
        } else if types.iter().any(NodeType::is_replica_set_member) {
            ClusterType::ReplicaSet
        } else if self.nodes.len() == 1 && types == [NodeType::StandAlone] {
            ClusterType::Standalone
        } else {
            ClusterType::Unknown
        }
    }
}

impl fmt::Display for ClusterDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cluster, {}/{} nodes connected (rev {})",
            self.cluster_type,
            self.connected_count(),
            self.nodes.len(),
            self.revision
        )
    }
}

pub struct Cluster {
    id: String,
    settings: ClusterSettings,
    nodes: BTreeMap<Endpoint, Arc<Node>>,
    description: watch::Receiver<ClusterDescription>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Cluster {
    /// Create and start one node per distinct seed
    pub fn start(
        settings: ClusterSettings,
        listener: Option<Arc<dyn NodeListener>>,
    ) -> TopologyResult<Self> {
        if settings.seeds().is_empty() {
            return Err(TopologyError::internal("cluster needs at least one seed"));
        }

        let id = generate_id("cluster");
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let mut nodes = BTreeMap::new();
        for seed in settings.seeds() {
            if nodes.contains_key(seed) {
                debug!(cluster_id = %id, endpoint = %seed, "duplicate seed ignored");
                continue;
            }
            let node = Node::new(seed.clone(), settings.node_settings().clone(), listener.clone());
            node.add_subscriber(changes_tx.clone());
            nodes.insert(seed.clone(), node);
        }
        drop(changes_tx);

        let initial = nodes
            .iter()
            .map(|(endpoint, node)| Ok((endpoint.clone(), node.current_info()?)))
            .collect::<TopologyResult<BTreeMap<_, _>>>()?;
        let (description_tx, description_rx) = watch::channel(ClusterDescription::new(initial));

        let aggregator = tokio::spawn(aggregate(
            id.clone(),
            settings.replica_set_name().map(str::to_string),
            changes_rx,
            description_tx,
        ));

        for node in nodes.values() {
            node.start()?;
        }
        info!(cluster_id = %id, nodes = nodes.len(), "cluster started");

        Ok(Self {
            id,
            settings,
            nodes,
            description: description_rx,
            aggregator: Mutex::new(Some(aggregator)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn node(&self, endpoint: &Endpoint) -> Option<Arc<Node>> {
        self.nodes.get(endpoint).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.values().cloned().collect()
    }

    pub fn description(&self) -> ClusterDescription {
        self.description.borrow().clone()
    }

    /// Watch every description the cluster publishes
    pub fn subscribe(&self) -> watch::Receiver<ClusterDescription> {
        self.description.clone()
    }

    /// Wait for a description matching `predicate`, checking the current one
    /// first
    pub async fn wait_for_description<P>(
        &self,
        mut predicate: P,
        timeout: Duration,
    ) -> TopologyResult<ClusterDescription>
    where
        P: FnMut(&ClusterDescription) -> bool,
    {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }

        let mut receiver = self.description.clone();
        let budget = SlidingTimeout::new(timeout);
        let found = budget
            .apply("waiting for cluster description", async {
                receiver
                    .wait_for(|d| predicate(d))
                    .await
                    .map(|d| d.clone())
            })
            .await?;
        found.map_err(|_| self.disposed_error())
    }

    /// Ask every node to probe now
    pub fn request_probe_all(&self) -> TopologyResult<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        for node in self.nodes.values() {
            node.request_probe()?;
        }
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn disposed_error(&self) -> TopologyError {
        TopologyError::disposed(format!("Cluster {}", self.id))
    }

    /// Dispose every node, then stop aggregating. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        futures::future::join_all(self.nodes.values().map(|node| node.dispose())).await;

        let aggregator = lock(&self.aggregator).take();
        if let Some(aggregator) = aggregator {
            aggregator.abort();
            let _ = aggregator.await;
        }
        info!(cluster_id = %self.id, "cluster disposed");
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

async fn aggregate(
    cluster_id: String,
    replica_set_name: Option<String>,
    mut changes: mpsc::UnboundedReceiver<NodeInfoChange>,
    description: watch::Sender<ClusterDescription>,
) {
    while let Some(change) = changes.recv().await {
        if let (Some(expected), Some(reported)) = (&replica_set_name, change.new.replica_set()) {
            if reported.name() != expected {
                warn!(
                    cluster_id = %cluster_id,
                    endpoint = %change.new.endpoint(),
                    expected = %expected,
                    reported = %reported.name(),
                    "node belongs to a different replica set"
                );
            }
        }

        let mut cluster_type = None;
        description.send_if_modified(|d| {
            let before = d.cluster_type();
            let applied = d.apply(&change);
            if applied && d.cluster_type() != before {
                cluster_type = Some(d.cluster_type());
            }
            applied
        });
        if let Some(cluster_type) = cluster_type {
            info!(cluster_id = %cluster_id, %cluster_type, "cluster type changed");
        }
    }
    debug!(cluster_id = %cluster_id, "change channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSettings;
    use crate::node::NodeState;
    use crate::pool::mock::{
        arbiter_reply, mongos_reply, primary_reply, secondary_reply, MockPoolFactory, MockServer,
    };

    const HOSTS: [&str; 3] = ["db1:27017", "db2:27017", "db3:27017"];

    fn endpoint(host: &str) -> Endpoint {
        host.parse().unwrap()
    }

    fn settings(factory: &Arc<MockPoolFactory>, seeds: &[&str]) -> ClusterSettings {
        let node_settings = NodeSettings::new(factory.clone()).with_probe_interval(Duration::from_secs(10));
        ClusterSettings::new(seeds.iter().map(|s| endpoint(s)).collect(), node_settings)
    }

    fn replica_set_factory() -> Arc<MockPoolFactory> {
        let factory = Arc::new(MockPoolFactory::new());
        factory.add_server(endpoint(HOSTS[0]), MockServer::with_is_master(primary_reply("rs0", &HOSTS, HOSTS[0])));
        factory.add_server(
            endpoint(HOSTS[1]),
            MockServer::with_is_master(secondary_reply("rs0", &HOSTS, HOSTS[1], Some(HOSTS[0]))),
        );
        factory.add_server(endpoint(HOSTS[2]), MockServer::with_is_master(arbiter_reply("rs0", &HOSTS, HOSTS[2])));
        factory
    }

    fn all_connected(d: &ClusterDescription) -> bool {
        d.connected_count() == d.nodes().count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_replica_set_description() {
        let factory = replica_set_factory();
        let cluster = Cluster::start(settings(&factory, &HOSTS).with_replica_set_name("rs0"), None).unwrap();

        let description = cluster
            .wait_for_description(all_connected, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(description.cluster_type(), ClusterType::ReplicaSet);
        assert_eq!(description.nodes_of_type(NodeType::Primary).len(), 1);
        assert_eq!(description.nodes_of_type(NodeType::Secondary).len(), 1);
        assert_eq!(description.nodes_of_type(NodeType::Arbiter).len(), 1);
        assert_eq!(description.revision(), 3);

        cluster.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_and_sharded_types() {
        let factory = Arc::new(MockPoolFactory::new());
        let standalone = Cluster::start(settings(&factory, &["solo:27017"]), None).unwrap();
        let description = standalone
            .wait_for_description(all_connected, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(description.cluster_type(), ClusterType::Standalone);
        standalone.dispose().await;

        let factory = Arc::new(MockPoolFactory::new());
        for router in ["r1:27017", "r2:27017"] {
            factory.add_server(endpoint(router), MockServer::with_is_master(mongos_reply()));
        }
        let sharded = Cluster::start(settings(&factory, &["r1:27017", "r2:27017"]), None).unwrap();
        let description = sharded
            .wait_for_description(|d| d.cluster_type() == ClusterType::Sharded, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(description.connected_count() >= 1);
        sharded.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_seeds_share_one_node() {
        let factory = Arc::new(MockPoolFactory::new());
        let cluster = Cluster::start(settings(&factory, &["solo:27017", "solo:27017"]), None).unwrap();
        assert_eq!(cluster.nodes().len(), 1);
        assert!(cluster.node(&endpoint("solo:27017")).is_some());
        assert!(cluster.node(&endpoint("other:27017")).is_none());
        cluster.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_is_reflected() {
        let factory = replica_set_factory();
        let cluster = Cluster::start(settings(&factory, &HOSTS), None).unwrap();
        cluster
            .wait_for_description(all_connected, Duration::from_secs(30))
            .await
            .unwrap();

        factory.server(&endpoint(HOSTS[0])).set_reachable(false);
        factory
            .server(&endpoint(HOSTS[1]))
            .set_is_master(primary_reply("rs0", &HOSTS, HOSTS[1]));
        cluster.request_probe_all().unwrap();

        let description = cluster
            .wait_for_description(
                |d| {
                    d.node(&endpoint(HOSTS[1])).map(|n| n.node_type()) == Some(NodeType::Primary)
                        && d.node(&endpoint(HOSTS[0])).map(|n| n.state()) == Some(NodeState::Disconnected)
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(description.cluster_type(), ClusterType::ReplicaSet);
        cluster.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_description_times_out() {
        let factory = Arc::new(MockPoolFactory::new());
        let cluster = Cluster::start(settings(&factory, &["solo:27017"]), None).unwrap();

        let result = cluster
            .wait_for_description(|d| d.cluster_type() == ClusterType::Sharded, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TopologyError::Timeout { .. })));
        cluster.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent_and_final() {
        let factory = Arc::new(MockPoolFactory::new());
        let cluster = Cluster::start(settings(&factory, &["solo:27017"]), None).unwrap();
        let node = cluster.node(&endpoint("solo:27017")).unwrap();

        cluster.dispose().await;
        cluster.dispose().await;
        assert!(node.is_disposed());
        assert!(cluster.request_probe_all().is_err());
        assert!(cluster
            .wait_for_description(|_| true, Duration::from_secs(1))
            .await
            .is_err());
    }

    #[test]
    fn test_empty_seed_list_is_rejected() {
        let factory = Arc::new(MockPoolFactory::new());
        let result = Cluster::start(settings(&factory, &[]), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_description_ignores_stale_changes() {
        let ep = endpoint("db1:27017");
        let old = Arc::new(NodeInfo::disconnected(ep.clone()));
        let mut nodes = BTreeMap::new();
        nodes.insert(ep.clone(), old.clone());
        let mut description = ClusterDescription::new(nodes);

        let newer = Arc::new(
            NodeInfo::from_probe(ep.clone(), crate::pool::mock::standalone_reply(), Default::default())
                .with_revision(2),
        );
        assert!(description.apply(&NodeInfoChange {
            old: old.clone(),
            new: newer.clone()
        }));
        assert_eq!(description.cluster_type(), ClusterType::Standalone);

        let stale = Arc::new(NodeInfo::disconnected(ep).with_revision(1));
        assert!(!description.apply(&NodeInfoChange { old, new: stale }));
        assert_eq!(description.revision(), 1);
        assert_eq!(description.to_string(), "Standalone cluster, 1/1 nodes connected (rev 1)");
    }
}
