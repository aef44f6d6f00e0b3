//! Worker (activity) dispatcher: N concurrent workers executing activities
//! and acking each with its completion atomically.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::Runtime;
use crate::providers::WorkItem;
use crate::{ActivityContext, AppErrorKind, ConfigErrorKind, ErrorDetails};

impl Runtime {
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.options.worker_concurrency.max(1))
            .map(|worker_idx| {
                let rt = Arc::clone(&self);
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                tokio::spawn(async move {
                    while !rt.is_shutting_down() {
                        match rt.history_store.fetch_work_item().await {
                            Ok(Some((item, token))) => rt.execute_activity(item, &token, &worker_id).await,
                            Ok(None) => rt.idle().await,
                            Err(e) => {
                                warn!(target: "sagaflow::runtime", worker_id = %worker_id, error = %e, "error fetching work item");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    async fn execute_activity(&self, item: WorkItem, token: &str, worker_id: &str) {
        let (instance, execution_id, id, name, input, attempt) = match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                name,
                input,
                attempt,
            } => (instance, execution_id, id, name, input, attempt),
            other => {
                // Left locked; the lock expires and the item is redelivered.
                error!(target: "sagaflow::runtime", worker_id = %worker_id, ?other, "unexpected work item in worker queue");
                return;
            }
        };

        debug!(
            target: "sagaflow::runtime",
            instance_id = %instance,
            execution_id,
            activity_name = %name,
            activity_id = id,
            attempt,
            worker_id = %worker_id,
            "activity started"
        );
        let start_time = Instant::now();

        let outcome = match self.activity_registry.resolve_handler(&name) {
            Some((_, handler)) => {
                let ctx = ActivityContext::new(instance.clone(), execution_id, name.clone(), id, attempt);
                match AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind().await {
                    Ok(result) => result.map_err(ErrorDetails::activity_failed),
                    Err(_) => Err(ErrorDetails::Application {
                        kind: AppErrorKind::Panicked,
                        message: format!("activity '{name}' panicked"),
                        retryable: false,
                    }),
                }
            }
            None => Err(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredActivity,
                resource: name.clone(),
                message: None,
            }),
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let completion = match outcome {
            Ok(result) => {
                debug!(
                    target: "sagaflow::runtime",
                    instance_id = %instance,
                    execution_id,
                    activity_name = %name,
                    activity_id = id,
                    worker_id = %worker_id,
                    outcome = "success",
                    duration_ms,
                    "activity completed"
                );
                WorkItem::ActivityCompleted {
                    instance: instance.clone(),
                    execution_id,
                    id,
                    result,
                }
            }
            Err(details) => {
                let outcome = if details.is_system_error() { "system_error" } else { "app_error" };
                warn!(
                    target: "sagaflow::runtime",
                    instance_id = %instance,
                    execution_id,
                    activity_name = %name,
                    activity_id = id,
                    attempt,
                    worker_id = %worker_id,
                    outcome,
                    duration_ms,
                    error = %details,
                    "activity failed"
                );
                WorkItem::ActivityFailed {
                    instance: instance.clone(),
                    execution_id,
                    id,
                    details,
                    attempt,
                }
            }
        };

        let acked = self
            .execute_with_retry("ack_work_item", || self.history_store.ack_work_item(token, completion.clone()))
            .await;
        if acked.is_err() {
            warn!(target: "sagaflow::runtime", instance_id = %instance, activity_id = id, "abandoning work item after failed ack");
            if let Err(e) = self.history_store.abandon_work_item(token).await {
                warn!(target: "sagaflow::runtime", instance_id = %instance, error = %e, "abandon failed; lock will expire");
            }
        }
    }
}
