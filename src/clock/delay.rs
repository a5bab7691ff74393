/// A sleep that an external signal can cut short
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PENDING: u8 = 0;
const INTERRUPTED: u8 = 1;
const ELAPSED: u8 = 2;

/// How a delay finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    Elapsed,
    Interrupted,
}

/// Clones share the same delay: one side can `wait` while another `interrupt`s.
#[derive(Debug, Clone)]
pub struct InterruptibleDelay {
    inner: Arc<DelayInner>,
}

#[derive(Debug)]
struct DelayInner {
    deadline: Instant,
    interrupt: CancellationToken,
    state: AtomicU8,
}

impl InterruptibleDelay {
    pub fn new(duration: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(duration)
            .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30));
        Self {
            inner: Arc::new(DelayInner {
                deadline,
                interrupt: CancellationToken::new(),
                state: AtomicU8::new(PENDING),
            }),
        }
    }

    /// Wake the waiter early. Idempotent, and a no-op once the deadline passed.
    pub fn interrupt(&self) {
        if Instant::now() >= self.inner.deadline {
            self.settle(ELAPSED);
            return;
        }
        if self.settle(INTERRUPTED) == INTERRUPTED {
            self.inner.interrupt.cancel();
        }
    }

    /// Whether the delay has settled, either way
    pub fn is_completed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != PENDING
    }

    pub async fn wait(&self) -> DelayOutcome {
        if self.inner.state.load(Ordering::Acquire) == PENDING {
            tokio::select! {
                biased;
                _ = self.inner.interrupt.cancelled() => {}
                _ = tokio::time::sleep_until(self.inner.deadline) => {
                    self.settle(ELAPSED);
                }
            }
        }
        match self.inner.state.load(Ordering::Acquire) {
            INTERRUPTED => DelayOutcome::Interrupted,
            _ => DelayOutcome::Elapsed,
        }
    }

    /// Move out of `PENDING` exactly once; returns the settled state
    fn settle(&self, to: u8) -> u8 {
        match self
            .inner
            .state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => to,
            Err(settled) => settled,
        }
    }
}
