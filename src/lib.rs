/// Sondeo - client-side topology engine for MongoDB-style clusters
///
/// Sondeo keeps track of the nodes of a database cluster:
/// 1. Every node is probed in the background with a `ping`/`isMaster`/`buildinfo`
///    handshake and its observed state is published as an immutable, revisioned
///    [`NodeInfo`] snapshot
/// 2. Callers read the latest snapshot or wait for one newer than a revision
///    they already hold
/// 3. Connections are checked out of a dedicated or a shared pool per node
pub mod clock;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod node;
pub mod pool;
pub mod utils;

pub use clock::{InterruptibleDelay, SlidingTimeout};
pub use cluster::{Cluster, ClusterDescription, ClusterType};
pub use config::{ClusterSettings, Config, NodeSettings, PoolSettings};
pub use core::{Document, Endpoint};
pub use error::{TopologyError, TopologyResult};
pub use node::{
    Access, Node, NodeConnection, NodeInfo, NodeListener, NodeState, NodeType, ReadPreference,
    ReadPreferenceMode, ShardRouterNode, WrappedNode,
};
pub use pool::{ConnectionPool, PoolFactory};
