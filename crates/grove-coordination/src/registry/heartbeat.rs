//! Background heartbeat task.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::ServiceRegistry;

/// Handle to a running heartbeat loop. Dropping it stops the loop.
pub struct HeartbeatHandle {
    instance_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub(super) fn spawn(registry: ServiceRegistry, instance_id: String, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(registry, instance_id.clone(), period, cancel.clone()));
        Self {
            instance_id,
            cancel,
            task: Some(task),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether the loop has exited, either stopped or because the instance vanished.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(instance_id = %self.instance_id, error = %e, "heartbeat task failed");
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(registry: ServiceRegistry, instance_id: String, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(instance_id = %instance_id, "heartbeat stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        match registry.heartbeat(&instance_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(instance_id = %instance_id, "instance no longer registered, stopping heartbeat");
                return;
            }
            // Transient failure; the next tick retries before the TTL lapses.
            Err(e) => warn!(instance_id = %instance_id, error = %e, "heartbeat failed"),
        }
    }
}
