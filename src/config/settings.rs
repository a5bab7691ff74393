/// Runtime settings consumed by nodes, pools and clusters
///
/// All settings are immutable values. The `with_*` methods return a modified
/// copy and leave the original untouched.
use crate::core::Endpoint;
use crate::pool::PoolFactory;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POOL_MAX_SIZE: usize = 100;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings a [`crate::node::Node`] is constructed with
#[derive(Clone)]
pub struct NodeSettings {
    probe_interval: Duration,
    probe_timeout: Duration,
    pool_factory: Arc<dyn PoolFactory>,
}

impl NodeSettings {
    pub fn new(pool_factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            pool_factory,
        }
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn pool_factory(&self) -> &Arc<dyn PoolFactory> {
        &self.pool_factory
    }

    pub fn with_probe_interval(&self, probe_interval: Duration) -> Self {
        Self {
            probe_interval,
            ..self.clone()
        }
    }

    pub fn with_probe_timeout(&self, probe_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            ..self.clone()
        }
    }

    pub fn with_pool_factory(&self, pool_factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            pool_factory,
            ..self.clone()
        }
    }
}

impl fmt::Debug for NodeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSettings")
            .field("probe_interval", &self.probe_interval)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

/// Sizing and timeouts of a [`crate::pool::BoundedPool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    max_size: usize,
    connect_timeout: Duration,
    shared: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shared: true,
        }
    }
}

impl PoolSettings {
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Whether the pool factory also builds a shared pool per node
    pub fn shared(&self) -> bool {
        self.shared
    }

    pub fn with_max_size(&self, max_size: usize) -> Self {
        Self {
            max_size,
            ..self.clone()
        }
    }

    pub fn with_connect_timeout(&self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self.clone()
        }
    }

    pub fn with_shared(&self, shared: bool) -> Self {
        Self {
            shared,
            ..self.clone()
        }
    }
}

/// Settings of a [`crate::cluster::Cluster`]
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    seeds: Vec<Endpoint>,
    replica_set_name: Option<String>,
    node_settings: NodeSettings,
}

impl ClusterSettings {
    pub fn new(seeds: Vec<Endpoint>, node_settings: NodeSettings) -> Self {
        Self {
            seeds,
            replica_set_name: None,
            node_settings,
        }
    }

    pub fn seeds(&self) -> &[Endpoint] {
        &self.seeds
    }

    pub fn replica_set_name(&self) -> Option<&str> {
        self.replica_set_name.as_deref()
    }

    pub fn node_settings(&self) -> &NodeSettings {
        &self.node_settings
    }

    pub fn with_replica_set_name<S: Into<String>>(&self, name: S) -> Self {
        Self {
            replica_set_name: Some(name.into()),
            ..self.clone()
        }
    }

    pub fn with_node_settings(&self, node_settings: NodeSettings) -> Self {
        Self {
            node_settings,
            ..self.clone()
        }
    }
}
