//! Timeout sweeper — periodic job that forces stalled work to `timeout`.
//!
//! Every pass takes a snapshot of slots older than the configured timeout
//! and resolves each one independently: a failure on one entry is logged
//! and the rest of the sweep continues. The sweep itself never returns an
//! error to its caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Delegator;

/// Spawn the sweeper background loop. The first tick fires immediately.
pub fn spawn_sweeper(
    delegator: Arc<Delegator>,
    interval: Duration,
    task_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = task_timeout.as_secs(),
            "Timeout sweeper started"
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            run_sweep(&delegator, task_timeout).await;
        }
    })
}

/// Single sweep pass over the delegator's slots.
pub async fn run_sweep(delegator: &Arc<Delegator>, task_timeout: Duration) {
    let stalled = delegator.stalled(task_timeout);
    if stalled.is_empty() {
        debug!("Sweep pass found nothing stalled");
        return;
    }

    info!(count = stalled.len(), "Sweeping stalled tasks");

    for (task_id, agent_id, admitted_at) in stalled {
        let age = (chrono::Utc::now() - admitted_at).num_seconds();
        let reason = format!(
            "no result from {agent_id} within {}s (admitted {age}s ago)",
            task_timeout.as_secs()
        );
        if let Err(e) = delegator.force_timeout(task_id, reason).await {
            // Partial-failure isolation: log and keep sweeping.
            warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Failed to time out task");
        }
    }
}
