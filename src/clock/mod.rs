/// Timeout and delay primitives used by probes, pools and `get_info`
pub mod delay;
pub mod sliding;

pub use delay::{DelayOutcome, InterruptibleDelay};
pub use sliding::SlidingTimeout;

use std::time::Duration;

/// A duration that never expires
pub const INFINITE: Duration = Duration::MAX;
