//! Timer dispatcher.
//!
//! Timers ride on the provider's delayed visibility: a `TimerSchedule` is
//! acked by enqueueing its `TimerFired` hidden until the fire time. Nothing
//! is held in memory, so a restart loses no timers.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::Runtime;
use crate::providers::WorkItem;

/// Delay until `fire_at_ms`, zero when already due.
pub(crate) fn delay_until(fire_at_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(fire_at_ms.saturating_sub(now_ms))
}

impl Runtime {
    pub(in crate::runtime) fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while !self.is_shutting_down() {
                match self.history_store.fetch_timer_item().await {
                    Ok(Some((item, token))) => self.schedule_timer_fired(item, &token).await,
                    Ok(None) => self.idle().await,
                    Err(e) => {
                        warn!(target: "sagaflow::runtime", error = %e, "error fetching timer item");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }

    async fn schedule_timer_fired(&self, item: WorkItem, token: &str) {
        let (instance, execution_id, id, fire_at_ms) = match item {
            WorkItem::TimerSchedule {
                instance,
                execution_id,
                id,
                fire_at_ms,
            } => (instance, execution_id, id, fire_at_ms),
            other => {
                error!(target: "sagaflow::runtime", ?other, "unexpected work item in timer queue");
                return;
            }
        };
        let delay = delay_until(fire_at_ms, crate::now_ms());
        debug!(
            target: "sagaflow::runtime",
            instance_id = %instance,
            execution_id,
            timer_id = id,
            delay_ms = delay.as_millis() as u64,
            "timer scheduled"
        );
        let fired = WorkItem::TimerFired {
            instance: instance.clone(),
            execution_id,
            id,
            fire_at_ms,
        };
        let acked = self
            .execute_with_retry("ack_timer_item", || {
                self.history_store.ack_timer_item(token, fired.clone(), Some(delay))
            })
            .await;
        if acked.is_err() {
            warn!(target: "sagaflow::runtime", instance_id = %instance, timer_id = id, "timer ack failed; lock will expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_fire_times_are_due_now() {
        assert_eq!(delay_until(100, 250), Duration::ZERO);
        assert_eq!(delay_until(300, 250), Duration::from_millis(50));
    }
}
