/// The three-command probe run against a node's monitoring connection
use crate::clock::SlidingTimeout;
use crate::core::document::{self, Document};
use crate::error::{TopologyError, TopologyResult};
use crate::pool::Connection;
use tracing::trace;

/// Database every probe command runs against
pub const PROBE_DATABASE: &str = "admin";

/// Raw replies of one successful probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub is_master: Document,
    pub build_info: Document,
}

/// `ping`, `isMaster` and `buildinfo`, all sharing one budget.
///
/// A reply whose `ok` field is falsy fails the probe like a transport error
/// would. Cancellation is the caller's business.
pub async fn run_probe(
    connection: &mut dyn Connection,
    budget: &SlidingTimeout,
) -> TopologyResult<ProbeResult> {
    run_checked(connection, "ping", budget).await?;
    let is_master = run_checked(connection, "ismaster", budget).await?;
    let build_info = run_checked(connection, "buildinfo", budget).await?;

    Ok(ProbeResult {
        is_master,
        build_info,
    })
}

async fn run_checked(
    connection: &mut dyn Connection,
    name: &str,
    budget: &SlidingTimeout,
) -> TopologyResult<Document> {
    let remaining = budget
        .remaining()
        .map_err(|_| TopologyError::timeout(format!("{} probe of {}", name, connection.endpoint())))?;

    let reply = connection
        .run_command(PROBE_DATABASE, &document::command(name), remaining)
        .await?;
    trace!(endpoint = %connection.endpoint(), command = name, "probe command answered");

    if !document::is_ok(&reply) {
        let message = document::get_str(&reply, "errmsg").unwrap_or("no error message");
        return Err(TopologyError::command(format!(
            "{} failed on {}: {}",
            name,
            connection.endpoint(),
            message
        )));
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::document;
    use crate::core::Endpoint;
    use crate::pool::mock::{standalone_reply, MockServer};
    use serde_json::json;
    use std::time::Duration;

    async fn open_connection(server: &MockServer) -> Box<dyn Connection> {
        let mut connection = server.connect(&Endpoint::new("db1", 27017), -1);
        connection.open(Duration::from_secs(1)).await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_probe_collects_replies() {
        let server = MockServer::new();
        let mut connection = open_connection(&server).await;

        let budget = SlidingTimeout::new(Duration::from_secs(5));
        let result = run_probe(connection.as_mut(), &budget).await.unwrap();

        assert_eq!(result.is_master, standalone_reply());
        assert_eq!(document::get_str(&result.build_info, "version"), Some("3.0.4"));
        assert_eq!(server.commands_run(), 3);
    }

    #[tokio::test]
    async fn test_falsy_ok_fails_probe() {
        let server = MockServer::new();
        server.set_reply("buildinfo", document(json!({ "ok": 0, "errmsg": "unauthorized" })));
        let mut connection = open_connection(&server).await;

        let budget = SlidingTimeout::new(Duration::from_secs(5));
        let error = run_probe(connection.as_mut(), &budget).await.unwrap_err();

        assert!(matches!(error, TopologyError::Command { .. }));
        assert!(error.to_string().contains("unauthorized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_shares_one_budget() {
        let server = MockServer::new();
        let mut connection = open_connection(&server).await;
        server.set_latency(Duration::from_millis(400));

        // three commands at 400ms each cannot fit in one second
        let budget = SlidingTimeout::new(Duration::from_secs(1));
        let error = run_probe(connection.as_mut(), &budget).await.unwrap_err();
        assert!(matches!(error, TopologyError::Timeout { .. }));
    }
}
