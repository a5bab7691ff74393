/// Node notifications: synchronous listener hooks and change subscriptions
use crate::core::{Document, Endpoint};
use crate::node::info::NodeInfo;
use crate::utils::lock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A published revision replacing its predecessor
#[derive(Debug, Clone)]
pub struct NodeInfoChange {
    pub old: Arc<NodeInfo>,
    pub new: Arc<NodeInfo>,
}

/// Emitted after every probe round, successful or not
#[derive(Debug, Clone)]
pub struct ProbedNode {
    pub endpoint: Endpoint,
    pub connection_id: Option<i64>,
    pub elapsed: Duration,
    pub is_master_result: Option<Document>,
    pub build_info_result: Option<Document>,
}

impl ProbedNode {
    pub fn succeeded(&self) -> bool {
        self.is_master_result.is_some()
    }
}

/// Observer of node activity.
///
/// Hooks run on the node's monitoring task and must not block. Errors and
/// panics they raise are logged and otherwise ignored.
pub trait NodeListener: Send + Sync {
    fn node_info_changed(&self, _old: &NodeInfo, _new: &NodeInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn probing_node(&self, _endpoint: &Endpoint) -> anyhow::Result<()> {
        Ok(())
    }

    fn probed_node(&self, _event: &ProbedNode) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Invoke one hook on `listener`, containing whatever it raises
pub(crate) fn dispatch<F>(listener: Option<&Arc<dyn NodeListener>>, event: &'static str, hook: F)
where
    F: FnOnce(&dyn NodeListener) -> anyhow::Result<()>,
{
    let Some(listener) = listener else {
        return;
    };

    match panic::catch_unwind(AssertUnwindSafe(|| hook(listener.as_ref()))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(event, error = %e, "listener failed"),
        Err(_) => warn!(event, "listener panicked"),
    }
}

/// Fan-out of [`NodeInfoChange`]s to channel subscribers
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<NodeInfoChange>>>,
}

impl Subscribers {
    pub(crate) fn add(&self, sender: mpsc::UnboundedSender<NodeInfoChange>) {
        lock(&self.senders).push(sender);
    }

    /// Subscribers whose receiver is gone are dropped
    pub(crate) fn publish(&self, change: &NodeInfoChange) {
        lock(&self.senders).retain(|sender| sender.send(change.clone()).is_ok());
    }

    pub(crate) fn clear(&self) {
        lock(&self.senders).clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.senders).len()
    }
}
