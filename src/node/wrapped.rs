/// Node decorators
///
/// A [`WrappedNode`] forwards to a node it does not own: disposing the
/// wrapper only retires the wrapper. A [`ShardRouterNode`] additionally
/// carries the read preference that queries routed through a shard router
/// must declare.
use super::{Access, Node, NodeConnection, NodeInfo};
use crate::core::{Document, Endpoint};
use crate::error::{TopologyError, TopologyResult};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct WrappedNode {
    endpoint: Endpoint,
    node: Weak<Node>,
    disposed: AtomicBool,
}

impl WrappedNode {
    pub fn new(node: &Arc<Node>) -> Self {
        Self {
            endpoint: node.endpoint().clone(),
            node: Arc::downgrade(node),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The wrapped node, while both it and this wrapper are live
    pub fn wrapped(&self) -> TopologyResult<Arc<Node>> {
        if self.is_disposed() {
            return Err(TopologyError::disposed(format!("Wrapped node {}", self.endpoint)));
        }
        match self.node.upgrade() {
            Some(node) if !node.is_disposed() => Ok(node),
            _ => Err(TopologyError::disposed(format!("Node {}", self.endpoint))),
        }
    }

    pub fn current_info(&self) -> TopologyResult<Arc<NodeInfo>> {
        self.wrapped()?.current_info()
    }

    pub async fn get_info(
        &self,
        minimum_revision: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Arc<NodeInfo>> {
        self.wrapped()?
            .get_info(minimum_revision, timeout, cancel)
            .await
    }

    pub fn request_probe(&self) -> TopologyResult<()> {
        self.wrapped()?.request_probe()
    }

    pub async fn get_connection(
        &self,
        access: Access,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<NodeConnection> {
        self.wrapped()?
            .get_connection(access, timeout, cancel)
            .await
    }

    pub async fn get_dedicated_connection(
        &self,
        access: Access,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<NodeConnection> {
        self.wrapped()?
            .get_dedicated_connection(access, timeout, cancel)
            .await
    }

    /// Retire the wrapper. The wrapped node keeps running.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WrappedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedNode")
            .field("endpoint", &self.endpoint)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::Secondary => "secondary",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
            ReadPreferenceMode::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadPreferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPreference {
    mode: ReadPreferenceMode,
    tag_sets: Vec<TagSet>,
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self::primary()
    }
}

impl ReadPreference {
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadPreferenceMode::Primary)
    }

    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    pub fn mode(&self) -> ReadPreferenceMode {
        self.mode
    }

    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    /// `$readPreference` value to send a shard router. Plain primary reads
    /// need none.
    pub fn to_document(&self) -> Option<Document> {
        if self.mode == ReadPreferenceMode::Primary && self.tag_sets.is_empty() {
            return None;
        }

        let mut doc = Document::new();
        doc.insert("mode".to_string(), Value::from(self.mode.as_str()));
        if !self.tag_sets.is_empty() {
            doc.insert("tags".to_string(), json!(self.tag_sets));
        }
        Some(doc)
    }
}

/// A shard router seen through a fixed read preference
pub struct ShardRouterNode {
    wrapped: WrappedNode,
    read_preference: ReadPreference,
}

impl ShardRouterNode {
    pub fn new(node: &Arc<Node>, read_preference: ReadPreference) -> Self {
        Self {
            wrapped: WrappedNode::new(node),
            read_preference,
        }
    }

    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }

    pub fn read_preference_document(&self) -> Option<Document> {
        self.read_preference.to_document()
    }

    /// Wrap `query` as `{ "$query": .., "$readPreference": .. }` when the
    /// read preference must be declared, otherwise return it unchanged.
    pub fn wrap_query(&self, query: Document) -> Document {
        match self.read_preference_document() {
            None => query,
            Some(read_preference) => {
                let mut wrapped = Document::new();
                wrapped.insert("$query".to_string(), Value::Object(query));
                wrapped.insert("$readPreference".to_string(), Value::Object(read_preference));
                wrapped
            }
        }
    }

    pub fn inner(&self) -> &WrappedNode {
        &self.wrapped
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.wrapped.endpoint()
    }

    pub fn current_info(&self) -> TopologyResult<Arc<NodeInfo>> {
        self.wrapped.current_info()
    }

    pub async fn get_info(
        &self,
        minimum_revision: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Arc<NodeInfo>> {
        self.wrapped.get_info(minimum_revision, timeout, cancel).await
    }

    pub async fn get_connection(
        &self,
        access: Access,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<NodeConnection> {
        self.wrapped.get_connection(access, timeout, cancel).await
    }

    pub async fn get_dedicated_connection(
        &self,
        access: Access,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<NodeConnection> {
        self.wrapped
            .get_dedicated_connection(access, timeout, cancel)
            .await
    }

    pub fn request_probe(&self) -> TopologyResult<()> {
        self.wrapped.request_probe()
    }

    pub fn dispose(&self) {
        self.wrapped.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.wrapped.is_disposed()
    }
}

impl fmt::Debug for ShardRouterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardRouterNode")
            .field("endpoint", self.endpoint())
            .field("read_preference", &self.read_preference)
            .finish()
    }
}
