/// Probing nodes and interpreting what they report
pub mod handshake;
pub mod probe;

pub use handshake::CapabilityLimits;
pub use probe::{run_probe, ProbeResult};

use std::fmt;

/// Result of one probe round, retries included
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Succeeded {
        connection_id: i64,
        result: ProbeResult,
    },
    Failed {
        reason: String,
    },
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Succeeded { connection_id, .. } => {
                write!(f, "Succeeded on connection {}", connection_id)
            }
            ProbeOutcome::Failed { reason } => write!(f, "Failed: {}", reason),
        }
    }
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Succeeded { .. })
    }

    pub fn connection_id(&self) -> Option<i64> {
        match self {
            ProbeOutcome::Succeeded { connection_id, .. } => Some(*connection_id),
            ProbeOutcome::Failed { .. } => None,
        }
    }

    pub fn result(&self) -> Option<&ProbeResult> {
        match self {
            ProbeOutcome::Succeeded { result, .. } => Some(result),
            ProbeOutcome::Failed { .. } => None,
        }
    }
}
