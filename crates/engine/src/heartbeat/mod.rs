mod loop_runner;
mod metrics;

pub use loop_runner::{run_heartbeat, HeartbeatSummary};
pub use metrics::{HeartbeatMetricsSnapshot, MetricsHandle, QueueDepths};
