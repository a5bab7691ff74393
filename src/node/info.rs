/// Immutable snapshots of a node's observed state
use crate::core::{Document, Endpoint};
use crate::health::handshake::{self, CapabilityLimits};
use std::collections::BTreeMap;
use std::fmt;

/// Tag set advertised by a replica-set member
pub type Tags = BTreeMap<String, String>;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Disconnected,
    Connected,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Disconnected => write!(f, "Disconnected"),
            NodeState::Connected => write!(f, "Connected"),
        }
    }
}

/// Role a node plays in its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Unknown,
    StandAlone,
    Primary,
    Secondary,
    Passive,
    Arbiter,
    Other,
    ShardRouter,
}

impl NodeType {
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            NodeType::Primary
                | NodeType::Secondary
                | NodeType::Passive
                | NodeType::Arbiter
                | NodeType::Other
        )
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            NodeType::Primary | NodeType::StandAlone | NodeType::ShardRouter
        )
    }

    pub fn is_readable(&self) -> bool {
        self.is_writable() || matches!(self, NodeType::Secondary | NodeType::Passive)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Unknown => "Unknown",
            NodeType::StandAlone => "StandAlone",
            NodeType::Primary => "Primary",
            NodeType::Secondary => "Secondary",
            NodeType::Passive => "Passive",
            NodeType::Arbiter => "Arbiter",
            NodeType::Other => "Other",
            NodeType::ShardRouter => "ShardRouter",
        };
        write!(f, "{}", name)
    }
}

/// Replica-set membership as reported by one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetConfig {
    members: Vec<Endpoint>,
    name: String,
    primary: Option<Endpoint>,
    version: Option<i64>,
}

impl ReplicaSetConfig {
    pub fn new(
        members: Vec<Endpoint>,
        name: String,
        primary: Option<Endpoint>,
        version: Option<i64>,
    ) -> Self {
        Self {
            members,
            name,
            primary,
            version,
        }
    }

    pub fn members(&self) -> &[Endpoint] {
        &self.members
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary(&self) -> Option<&Endpoint> {
        self.primary.as_ref()
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }
}

/// One observation of a node.
///
/// Equality ignores `revision`: two snapshots are equal when they describe
/// the same endpoint in the same state and role with the same handshake
/// results. Derived fields follow from the handshake results.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    endpoint: Endpoint,
    state: NodeState,
    node_type: NodeType,
    limits: CapabilityLimits,
    replica_set: Option<ReplicaSetConfig>,
    tags: Option<Tags>,
    min_wire_version: i64,
    max_wire_version: i64,
    server_version: Option<String>,
    is_master_result: Option<Document>,
    build_info_result: Option<Document>,
    revision: u64,
}

impl NodeInfo {
    /// Nothing known about the node
    pub fn disconnected(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            state: NodeState::Disconnected,
            node_type: NodeType::Unknown,
            limits: CapabilityLimits::default(),
            replica_set: None,
            tags: None,
            min_wire_version: 0,
            max_wire_version: 0,
            server_version: None,
            is_master_result: None,
            build_info_result: None,
            revision: 0,
        }
    }

    /// Snapshot of a successful probe. Volatile handshake fields are dropped.
    pub fn from_probe(endpoint: Endpoint, is_master: Document, build_info: Document) -> Self {
        let is_master = handshake::strip_volatile_fields(is_master);
        let (min_wire_version, max_wire_version) = handshake::wire_version_range(&is_master);

        Self {
            state: NodeState::Connected,
            node_type: handshake::node_type(&is_master),
            limits: CapabilityLimits::from_handshake(&is_master),
            replica_set: handshake::replica_set_config(&is_master),
            tags: handshake::tags(&is_master),
            min_wire_version,
            max_wire_version,
            server_version: handshake::server_version(&build_info),
            is_master_result: Some(is_master),
            build_info_result: Some(build_info),
            revision: 0,
            endpoint,
        }
    }

    pub(crate) fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn max_document_size(&self) -> usize {
        self.limits.max_document_size
    }

    pub fn max_message_size(&self) -> usize {
        self.limits.max_message_size
    }

    pub fn max_wire_document_size(&self) -> usize {
        self.limits.max_wire_document_size
    }

    pub fn limits(&self) -> &CapabilityLimits {
        &self.limits
    }

    pub fn replica_set(&self) -> Option<&ReplicaSetConfig> {
        self.replica_set.as_ref()
    }

    pub fn tags(&self) -> Option<&Tags> {
        self.tags.as_ref()
    }

    pub fn min_wire_version(&self) -> i64 {
        self.min_wire_version
    }

    pub fn max_wire_version(&self) -> i64 {
        self.max_wire_version
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn is_master_result(&self) -> Option<&Document> {
        self.is_master_result.as_ref()
    }

    pub fn build_info_result(&self) -> Option<&Document> {
        self.build_info_result.as_ref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_connected(&self) -> bool {
        self.state == NodeState::Connected
    }

    pub fn is_writable(&self) -> bool {
        self.is_connected() && self.node_type.is_writable()
    }

    pub fn is_readable(&self) -> bool {
        self.is_connected() && self.node_type.is_readable()
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
            && self.node_type == other.node_type
            && self.state == other.state
            && self.is_master_result == other.is_master_result
            && self.build_info_result == other.build_info_result
    }
}

impl Eq for NodeInfo {}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) rev {}",
            self.endpoint, self.node_type, self.state, self.revision
        )?;
        if let Some(replica_set) = &self.replica_set {
            write!(f, " set {}", replica_set.name())?;
        }
        if let Some(version) = &self.server_version {
            write!(f, " v{}", version)?;
        }
        Ok(())
    }
}
