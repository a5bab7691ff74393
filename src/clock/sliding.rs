/// A deadline shared by a chain of awaited steps
///
/// Each step is given what is left of the original budget, so the sum of the
/// steps can never overrun it.
use crate::clock::INFINITE;
use crate::error::{TopologyError, TopologyResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct SlidingTimeout {
    started: Instant,
    deadline: Option<Instant>,
}

impl SlidingTimeout {
    /// Start a budget of `duration`. [`INFINITE`] (or any duration too large
    /// to represent as an instant) never expires.
    pub fn new(duration: Duration) -> Self {
        let started = Instant::now();
        let deadline = if duration == INFINITE {
            None
        } else {
            started.checked_add(duration)
        };
        Self { started, deadline }
    }

    pub fn infinite() -> Self {
        Self::new(INFINITE)
    }

    pub fn is_infinite(&self) -> bool {
        self.deadline.is_none()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left in the budget. Fails once the budget is spent.
    pub fn remaining(&self) -> TopologyResult<Duration> {
        match self.deadline {
            None => Ok(INFINITE),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(TopologyError::timeout("sliding timeout expired"))
                } else {
                    Ok(left)
                }
            }
        }
    }

    /// Run `future` bounded by whatever is left of the budget
    pub async fn apply<F>(&self, operation: &str, future: F) -> TopologyResult<F::Output>
    where
        F: Future,
    {
        match self.deadline {
            None => Ok(future.await),
            Some(_) => {
                let left = self
                    .remaining()
                    .map_err(|_| TopologyError::timeout(operation))?;
                tokio::time::timeout(left, future)
                    .await
                    .map_err(|_| TopologyError::timeout(operation))
            }
        }
    }
}
