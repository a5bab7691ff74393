/// The background probe loop
use super::events::{self, ProbedNode};
use super::info::NodeInfo;
use super::Node;
use crate::clock::{DelayOutcome, InterruptibleDelay, SlidingTimeout};
use crate::core::Endpoint;
use crate::error::{TopologyError, TopologyResult};
use crate::health::{self, ProbeOutcome};
use crate::pool::Connection;
use crate::utils::lock;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Weak;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Physical attempts per probe round before the node counts as unreachable
pub(crate) const PROBE_ATTEMPTS: usize = 2;

impl Node {
    /// The loop holds the node only for the length of a round, so dropping
    /// the last outside handle ends it.
    pub(super) async fn run_monitor(node: Weak<Node>, endpoint: Endpoint, cancel: CancellationToken) {
        let mut monitoring: Option<Box<dyn Connection>> = None;
        info!(%endpoint, "node monitor started");

        while !cancel.is_cancelled() {
            let this = match node.upgrade() {
                Some(this) => this,
                None => break,
            };
            lock(&this.idle_delay).take();

            let round = AssertUnwindSafe(this.probe_round(&mut monitoring, &cancel))
                .catch_unwind()
                .await;

            let candidate = match round {
                Ok(Ok(candidate)) => candidate,
                Ok(Err(TopologyError::Cancelled)) => break,
                Ok(Err(e)) => {
                    debug!(%endpoint, error = %e, "probe round failed");
                    NodeInfo::disconnected(endpoint.clone())
                }
                Err(_) => {
                    warn!(%endpoint, "probe round panicked");
                    if let Some(mut connection) = monitoring.take() {
                        connection.close();
                    }
                    NodeInfo::disconnected(endpoint.clone())
                }
            };
            this.publish(candidate);

            let delay = this.arm_idle_delay();
            drop(this);
            if !idle(&endpoint, delay, &cancel).await {
                break;
            }
        }

        if let Some(mut connection) = monitoring.take() {
            connection.close();
        }
        info!(%endpoint, "node monitor stopped");
    }

    /// One probe round: notify, probe with retry, notify, build a candidate
    async fn probe_round(
        &self,
        monitoring: &mut Option<Box<dyn Connection>>,
        cancel: &CancellationToken,
    ) -> TopologyResult<NodeInfo> {
        self.probe_requested.store(false, Ordering::SeqCst);
        events::dispatch(self.listener.as_ref(), "probing_node", |l| {
            l.probing_node(&self.endpoint)
        });

        let started = Instant::now();
        let outcome = self.probe_with_retry(monitoring, cancel).await?;
        let elapsed = started.elapsed();
        trace!(endpoint = %self.endpoint, outcome = %outcome, ?elapsed, "probe round finished");

        let result = outcome.result();
        let event = ProbedNode {
            endpoint: self.endpoint.clone(),
            connection_id: outcome.connection_id(),
            elapsed,
            is_master_result: result.map(|r| r.is_master.clone()),
            build_info_result: result.map(|r| r.build_info.clone()),
        };
        events::dispatch(self.listener.as_ref(), "probed_node", |l| l.probed_node(&event));

        Ok(match outcome {
            ProbeOutcome::Succeeded { result, .. } => {
                NodeInfo::from_probe(self.endpoint.clone(), result.is_master, result.build_info)
            }
            ProbeOutcome::Failed { .. } => NodeInfo::disconnected(self.endpoint.clone()),
        })
    }

    /// At most [`PROBE_ATTEMPTS`] attempts. The monitoring connection is
    /// kept after a success and replaced after a failure. Only cancellation
    /// surfaces as an error.
    async fn probe_with_retry(
        &self,
        monitoring: &mut Option<Box<dyn Connection>>,
        cancel: &CancellationToken,
    ) -> TopologyResult<ProbeOutcome> {
        let mut reason = String::from("no probe attempted");

        for attempt in 1..=PROBE_ATTEMPTS {
            let budget = SlidingTimeout::new(self.settings.probe_timeout());

            let mut connection = match monitoring.take() {
                Some(connection) if connection.is_open() => connection,
                _ => match self.open_monitoring_connection(&budget, cancel).await {
                    Ok(connection) => connection,
                    Err(TopologyError::Cancelled) => return Err(TopologyError::Cancelled),
                    Err(e) => {
                        debug!(endpoint = %self.endpoint, attempt, error = %e, "monitoring connection failed");
                        reason = e.to_string();
                        continue;
                    }
                },
            };

            let probed = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TopologyError::Cancelled),
                probed = health::run_probe(connection.as_mut(), &budget) => probed,
            };

            match probed {
                Ok(result) => {
                    let connection_id = connection.id();
                    *monitoring = Some(connection);
                    return Ok(ProbeOutcome::Succeeded {
                        connection_id,
                        result,
                    });
                }
                Err(TopologyError::Cancelled) => {
                    connection.close();
                    return Err(TopologyError::Cancelled);
                }
                Err(e) => {
                    debug!(
                        endpoint = %self.endpoint,
                        connection_id = connection.id(),
                        attempt,
                        error = %e,
                        "probe attempt failed"
                    );
                    connection.close();
                    reason = e.to_string();
                }
            }
        }

        Ok(ProbeOutcome::Failed { reason })
    }

    async fn open_monitoring_connection(
        &self,
        budget: &SlidingTimeout,
        cancel: &CancellationToken,
    ) -> TopologyResult<Box<dyn Connection>> {
        let remaining = budget.remaining()?;
        self.dedicated_pool
            .create_unpooled_connection(remaining, cancel)
            .await
    }

    /// Register the next idle delay, already interrupted when a probe was
    /// requested during the round
    fn arm_idle_delay(&self) -> InterruptibleDelay {
        let delay = InterruptibleDelay::new(self.settings.probe_interval());
        *lock(&self.idle_delay) = Some(delay.clone());
        if self.probe_requested.load(Ordering::SeqCst) {
            delay.interrupt();
        }
        delay
    }
}

/// Wait out the probe interval. Returns false once the node is shutting down.
async fn idle(endpoint: &Endpoint, delay: InterruptibleDelay, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        outcome = delay.wait() => {
            if outcome == DelayOutcome::Interrupted {
                trace!(%endpoint, "idle interval cut short");
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSettings;
    use crate::core::document::document;
    use crate::core::Endpoint;
    use crate::node::events::NodeListener;
    use crate::node::info::{NodeState, NodeType};
    use crate::pool::mock::{MockPoolFactory, MockServer};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_secs(10);

    #[derive(Debug)]
    enum Event {
        Probing,
        Probed(Option<i64>, bool),
        Changed(u64),
    }

    /// Forwards every hook onto a channel
    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
    }

    impl NodeListener for Recorder {
        fn node_info_changed(&self, _old: &NodeInfo, new: &NodeInfo) -> anyhow::Result<()> {
            self.events.send(Event::Changed(new.revision()))?;
            Ok(())
        }

        fn probing_node(&self, _endpoint: &Endpoint) -> anyhow::Result<()> {
            self.events.send(Event::Probing)?;
            Ok(())
        }

        fn probed_node(&self, event: &ProbedNode) -> anyhow::Result<()> {
            self.events
                .send(Event::Probed(event.connection_id, event.succeeded()))?;
            Ok(())
        }
    }

    struct Setup {
        node: Arc<Node>,
        server: MockServer,
        factory: Arc<MockPoolFactory>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("db1", 27017)
    }

    fn setup(server: MockServer) -> Setup {
        let factory = Arc::new(MockPoolFactory::new());
        factory.add_server(endpoint(), server.clone());
        let (sender, events) = mpsc::unbounded_channel();
        let listener: Arc<dyn NodeListener> = Arc::new(Recorder { events: sender });

        let settings = NodeSettings::new(factory.clone())
            .with_probe_interval(INTERVAL)
            .with_probe_timeout(Duration::from_secs(2));
        let node = Node::new(endpoint(), settings, Some(listener));
        node.start().unwrap();

        Setup {
            node,
            server,
            factory,
            events,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_order_for_first_probe() {
        let mut setup = setup(MockServer::new());

        assert!(matches!(setup.events.recv().await, Some(Event::Probing)));
        match setup.events.recv().await {
            Some(Event::Probed(Some(id), true)) => assert!(id < 0),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(setup.events.recv().await, Some(Event::Changed(1))));

        setup.node.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_probe_makes_two_attempts() {
        let server = MockServer::new();
        server.set_reachable(false);
        let mut setup = setup(server);

        assert!(matches!(setup.events.recv().await, Some(Event::Probing)));
        assert!(matches!(setup.events.recv().await, Some(Event::Probed(None, false))));
        assert_eq!(setup.server.open_attempts(), PROBE_ATTEMPTS);

        // no change is published for a node that was never reachable
        let info = setup.node.current_info().unwrap();
        assert_eq!(info.revision(), 0);

        setup.node.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_connection_is_reused() {
        let mut setup = setup(MockServer::new());

        setup.node
            .get_info(1, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(INTERVAL * 3).await;

        // several rounds over one unpooled connection
        let pools = setup.factory.pools(&endpoint()).unwrap();
        assert_eq!(pools.dedicated.unpooled_count(), 1);
        assert_eq!(setup.server.open_attempts(), 1);
        assert!(setup.server.commands_run() >= 3 * 3);

        let mut ids = Vec::new();
        while let Ok(event) = setup.events.try_recv() {
            if let Event::Probed(Some(id), _) = event {
                ids.push(id);
            }
        }
        assert!(ids.len() >= 3);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        setup.node.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_retries_once_on_fresh_connection() {
        let setup = setup(MockServer::new());
        let cancel = CancellationToken::new();
        setup.node
            .get_info(1, Duration::from_secs(60), &cancel)
            .await
            .unwrap();

        // the kept connection fails the first attempt, a new one the second
        setup.server.set_reply("ping", document(json!({ "ok": 0, "errmsg": "shutting down" })));
        let before = setup.server.open_attempts();
        setup.node.request_probe().unwrap();

        let info = setup.node
            .get_info(2, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(info.state(), NodeState::Disconnected);
        assert_eq!(setup.server.open_attempts(), before + 1);
        setup.node.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_going_down_publishes_disconnected() {
        let setup = setup(MockServer::new());
        let cancel = CancellationToken::new();
        let up = setup.node
            .get_info(1, Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        assert_eq!(up.node_type(), NodeType::StandAlone);

        setup.server.set_reachable(false);
        let down = setup.node
            .get_info(2, Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        assert_eq!(down.state(), NodeState::Disconnected);
        assert_eq!(down.node_type(), NodeType::Unknown);

        setup.server.set_reachable(true);
        let back = setup.node
            .get_info(3, Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        assert_eq!(back.state(), NodeState::Connected);
        setup.node.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_listener_does_not_stop_monitoring() {
        struct Failing(Mutex<usize>);

        impl NodeListener for Failing {
            fn probed_node(&self, _event: &ProbedNode) -> anyhow::Result<()> {
                *self.0.lock().unwrap() += 1;
                anyhow::bail!("listener refuses");
            }
        }

        let failing = Arc::new(Failing(Mutex::new(0)));
        let listener: Arc<dyn NodeListener> = failing.clone();
        let factory = Arc::new(MockPoolFactory::new());
        let settings = NodeSettings::new(factory).with_probe_interval(INTERVAL);
        let node = Node::new(endpoint(), settings, Some(listener));
        node.start().unwrap();

        tokio::time::sleep(INTERVAL * 2 + Duration::from_secs(1)).await;
        assert!(*failing.0.lock().unwrap() >= 3);
        assert_eq!(node.current_info().unwrap().revision(), 1);
        node.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_snapshots_raise_no_change_events() {
        let mut setup = setup(MockServer::new());
        let mut changes = setup.node.subscribe();
        setup
            .node
            .get_info(1, Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        // only localTime moves between rounds
        for date in 1..=3i64 {
            let mut reply = crate::pool::mock::standalone_reply();
            reply.insert("localTime".to_string(), json!({ "$date": date }));
            setup.server.set_is_master(reply);
            tokio::time::sleep(INTERVAL).await;
        }
        assert_eq!(setup.node.current_info().unwrap().revision(), 1);
        setup.node.dispose().await;

        let mut rounds = 0;
        let mut changed = Vec::new();
        while let Ok(event) = setup.events.try_recv() {
            match event {
                Event::Probed(_, succeeded) => {
                    assert!(succeeded);
                    rounds += 1;
                }
                Event::Changed(revision) => changed.push(revision),
                Event::Probing => {}
            }
        }
        assert!(rounds >= 3);
        assert_eq!(changed, vec![1]);

        while let Some(change) = changes.recv().await {
            assert_eq!(change.new.revision(), 1);
        }
    }
}
