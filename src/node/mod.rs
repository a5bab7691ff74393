/// One monitored database node
///
/// A [`Node`] owns a dedicated and a shared connection pool and a background
/// task that probes the endpoint on an interval. Every probe that observes
/// something new is published as a fresh [`NodeInfo`] revision; readers
/// either take the latest snapshot or wait for a minimum revision.
pub mod events;
pub mod info;
mod monitor;
pub mod view;
pub mod wrapped;

pub use events::{NodeInfoChange, NodeListener, ProbedNode};
pub use info::{NodeInfo, NodeState, NodeType, ReplicaSetConfig};
pub use view::{Access, NodeConnection};
pub use wrapped::{ReadPreference, ReadPreferenceMode, ShardRouterNode, WrappedNode};

use crate::clock::{InterruptibleDelay, SlidingTimeout};
use crate::config::NodeSettings;
use crate::core::Endpoint;
use crate::error::{TopologyError, TopologyResult};
use crate::pool::ConnectionPool;
use crate::utils::lock;
use events::Subscribers;
use futures::future::{FutureExt, Shared};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One-shot broadcast fired when the current snapshot is replaced
struct ChangeSignal {
    trigger: oneshot::Sender<()>,
    fired: Shared<oneshot::Receiver<()>>,
}

impl ChangeSignal {
    fn new() -> Self {
        let (trigger, fired) = oneshot::channel();
        Self {
            trigger,
            fired: fired.shared(),
        }
    }

    fn fire(self) {
        let _ = self.trigger.send(());
    }
}

struct NodeCell {
    info: Arc<NodeInfo>,
    changed: ChangeSignal,
    disposed: bool,
}

pub struct Node {
    endpoint: Endpoint,
    settings: NodeSettings,
    dedicated_pool: Arc<dyn ConnectionPool>,
    shared_pool: Arc<dyn ConnectionPool>,
    cell: Mutex<NodeCell>,
    listener: Option<Arc<dyn NodeListener>>,
    subscribers: Subscribers,
    shutdown: CancellationToken,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    idle_delay: Mutex<Option<InterruptibleDelay>>,
    probe_requested: AtomicBool,
}

impl Node {
    /// Build a node and its pools. Probing begins with [`Node::start`].
    pub fn new(
        endpoint: Endpoint,
        settings: NodeSettings,
        listener: Option<Arc<dyn NodeListener>>,
    ) -> Arc<Self> {
        let factory = Arc::clone(settings.pool_factory());
        let dedicated_pool = factory.create_dedicated_pool(&endpoint);
        let shared_pool = factory
            .create_shared_pool(&endpoint)
            .unwrap_or_else(|| Arc::clone(&dedicated_pool));

        Arc::new(Self {
            cell: Mutex::new(NodeCell {
                info: Arc::new(NodeInfo::disconnected(endpoint.clone())),
                changed: ChangeSignal::new(),
                disposed: false,
            }),
            endpoint,
            settings,
            dedicated_pool,
            shared_pool,
            listener,
            subscribers: Subscribers::default(),
            shutdown: CancellationToken::new(),
            monitor_task: Mutex::new(None),
            idle_delay: Mutex::new(None),
            probe_requested: AtomicBool::new(false),
        })
    }

    /// Spawn the monitoring task. Starting twice is a no-op.
    pub fn start(self: &Arc<Self>) -> TopologyResult<()> {
        let mut task = lock(&self.monitor_task);
        self.ensure_not_disposed()?;
        if task.is_none() {
            *task = Some(tokio::spawn(Node::run_monitor(
                Arc::downgrade(self),
                self.endpoint.clone(),
                self.shutdown.clone(),
            )));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.cell).disposed
    }

    fn ensure_not_disposed(&self) -> TopologyResult<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        Ok(())
    }

    fn disposed_error(&self) -> TopologyError {
        TopologyError::disposed(format!("Node {}", self.endpoint))
    }

    /// Latest published snapshot
    pub fn current_info(&self) -> TopologyResult<Arc<NodeInfo>> {
        let cell = lock(&self.cell);
        if cell.disposed {
            return Err(self.disposed_error());
        }
        Ok(Arc::clone(&cell.info))
    }

    /// Wait until a snapshot with `revision >= minimum_revision` is published.
    ///
    /// Cancellation and an exhausted budget are checked before the snapshot,
    /// so neither returns a snapshot even when one already qualifies.
    /// Otherwise returns immediately when the current snapshot qualifies.
    /// Fails with `Timeout` when `timeout` runs out, `Cancelled` when
    /// `cancel` fires and `Disposed` when the node is disposed meanwhile.
    pub async fn get_info(
        &self,
        minimum_revision: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<Arc<NodeInfo>> {
        let budget = SlidingTimeout::new(timeout);
        let operation = format!("waiting for revision {} of {}", minimum_revision, self.endpoint);

        loop {
            if cancel.is_cancelled() {
                return Err(TopologyError::Cancelled);
            }
            budget
                .remaining()
                .map_err(|_| TopologyError::timeout(operation.as_str()))?;

            let changed = {
                let cell = lock(&self.cell);
                if cell.disposed {
                    return Err(self.disposed_error());
                }
                if cell.info.revision() >= minimum_revision {
                    return Ok(Arc::clone(&cell.info));
                }
                cell.changed.fired.clone()
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TopologyError::Cancelled),
                waited = budget.apply(&operation, changed) => {
                    // fired or dropped, the snapshot is re-read on the next pass
                    let _ = waited?;
                }
            }
        }
    }

    /// Receive every future [`NodeInfoChange`] on a channel
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeInfoChange> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.add_subscriber(sender);
        receiver
    }

    /// Route future changes into an existing channel
    pub fn add_subscriber(&self, sender: mpsc::UnboundedSender<NodeInfoChange>) {
        self.subscribers.add(sender);
    }

    /// Skip the rest of the current idle interval and probe now. A request
    /// made while a probe is running causes one more probe right after it.
    pub fn request_probe(&self) -> TopologyResult<()> {
        self.ensure_not_disposed()?;
        self.probe_requested.store(true, Ordering::SeqCst);
        if let Some(delay) = lock(&self.idle_delay).as_ref() {
            delay.interrupt();
        }
        debug!(endpoint = %self.endpoint, "probe requested");
        Ok(())
    }

    /// A connection from the shared pool.
    ///
    /// `ReadWrite` access fails fast with `NotWritable` unless the latest
    /// snapshot shows a writable node.
    pub async fn get_connection(
        self: &Arc<Self>,
        access: Access,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<NodeConnection> {
        self.checked_out(&self.shared_pool, access, timeout, cancel)
            .await
    }

    /// A connection from the dedicated pool, for callers that must not
    /// compete with general traffic
    pub async fn get_dedicated_connection(
        self: &Arc<Self>,
        access: Access,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<NodeConnection> {
        self.checked_out(&self.dedicated_pool, access, timeout, cancel)
            .await
    }

    async fn checked_out(
        self: &Arc<Self>,
        pool: &Arc<dyn ConnectionPool>,
        access: Access,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TopologyResult<NodeConnection> {
        let info = self.current_info()?;
        if access == Access::ReadWrite && !info.is_writable() {
            return Err(TopologyError::not_writable(&self.endpoint));
        }

        let connection = match pool.acquire_connection(timeout, cancel).await {
            Ok(connection) => connection,
            Err(e) => {
                if e.is_connection_error() {
                    let _ = self.request_probe();
                }
                return Err(e);
            }
        };
        Ok(NodeConnection::new(
            Arc::clone(self),
            Arc::clone(pool),
            connection,
            access,
        ))
    }

    /// Replace the current snapshot unless `candidate` is equal to it.
    /// Returns whether a new revision was published.
    fn publish(&self, candidate: NodeInfo) -> bool {
        let change = {
            let mut cell = lock(&self.cell);
            if cell.disposed || *cell.info == candidate {
                return false;
            }

            let new = Arc::new(candidate.with_revision(cell.info.revision() + 1));
            let old = mem::replace(&mut cell.info, Arc::clone(&new));
            mem::replace(&mut cell.changed, ChangeSignal::new()).fire();
            NodeInfoChange { old, new }
        };

        info!(
            endpoint = %self.endpoint,
            revision = change.new.revision(),
            node_type = %change.new.node_type(),
            state = %change.new.state(),
            "node info changed"
        );
        events::dispatch(self.listener.as_ref(), "node_info_changed", |l| {
            l.node_info_changed(&change.old, &change.new)
        });
        self.subscribers.publish(&change);
        true
    }

    /// Stop monitoring and release both pools. Waiters on [`Node::get_info`]
    /// fail with `Disposed`. Disposing again does nothing.
    pub async fn dispose(&self) {
        {
            let mut cell = lock(&self.cell);
            if cell.disposed {
                return;
            }
            cell.disposed = true;
            mem::replace(&mut cell.changed, ChangeSignal::new()).fire();
        }

        self.shutdown.cancel();
        let task = lock(&self.monitor_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(endpoint = %self.endpoint, error = %e, "monitor task ended abnormally");
            }
        }

        self.dedicated_pool.dispose();
        if !Arc::ptr_eq(&self.shared_pool, &self.dedicated_pool) {
            self.shared_pool.dispose();
        }
        self.subscribers.clear();
        info!(endpoint = %self.endpoint, "node disposed");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if lock(&self.cell).disposed {
            return;
        }
        self.dedicated_pool.dispose();
        if !Arc::ptr_eq(&self.shared_pool, &self.dedicated_pool) {
            self.shared_pool.dispose();
        }
        debug!(endpoint = %self.endpoint, "node dropped without dispose");
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = lock(&self.cell);
        f.debug_struct("Node")
            .field("endpoint", &self.endpoint)
            .field("revision", &cell.info.revision())
            .field("node_type", &cell.info.node_type())
            .field("disposed", &cell.disposed)
            .finish()
    }
}
