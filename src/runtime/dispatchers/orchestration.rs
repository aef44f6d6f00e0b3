//! Orchestration dispatcher: N concurrent workers, each fetching a locked
//! instance batch, running one turn, and committing it atomically.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::super::execution::TurnCommit;
use super::super::{HistoryManager, Runtime, WorkItemReader};
use crate::providers::{OrchestrationItem, TurnWork};

impl Runtime {
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.options.orchestration_concurrency.max(1))
            .map(|worker_idx| {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                tokio::spawn(async move {
                    while !rt.is_shutting_down() {
                        match rt.history_store.fetch_orchestration_item().await {
                            Ok(Some(item)) => rt.process_orchestration_item(item, &worker_id).await,
                            Ok(None) => rt.idle().await,
                            Err(e) => {
                                warn!(target: "sagaflow::runtime", worker_id = %worker_id, error = %e, "error fetching orchestration item");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Process a single orchestration item atomically.
    pub(in crate::runtime) async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem, worker_id: &str) {
        let instance = item.instance.as_str();
        let history_mgr = HistoryManager::from_history(&item.history);
        let reader = WorkItemReader::from_messages(&item.messages, &history_mgr, instance);

        debug!(
            target: "sagaflow::runtime",
            instance_id = %instance,
            execution_id = item.execution_id,
            worker_id = %worker_id,
            messages = item.messages.len(),
            "processing orchestration batch"
        );

        let commit = if reader.is_continue_as_new {
            let start = reader.start.clone();
            self.run_single_execution_atomic(instance, item.execution_id + 1, Vec::new(), start.as_ref(), reader)
        } else if history_mgr.is_terminal() {
            warn!(
                target: "sagaflow::runtime",
                instance_id = %instance,
                status = ?history_mgr.status(),
                dropped = item.messages.len(),
                "instance is terminal; dropping batch"
            );
            TurnCommit {
                execution_id: item.execution_id,
                ..TurnCommit::default()
            }
        } else if history_mgr.is_empty() && reader.start.is_none() {
            warn!(
                target: "sagaflow::runtime",
                instance_id = %instance,
                dropped = item.messages.len(),
                "messages for an instance that was never started; dropping batch"
            );
            TurnCommit {
                execution_id: item.execution_id,
                ..TurnCommit::default()
            }
        } else {
            let start = reader.start.clone();
            self.run_single_execution_atomic(instance, item.execution_id, item.history, start.as_ref(), reader)
        };

        self.ack_orchestration_with_changes(&item.lock_token, instance, commit).await;
    }

    /// Commit a turn, retrying transient provider failures. A batch whose ack
    /// keeps failing is abandoned and redelivered after `abandon_delay`.
    async fn ack_orchestration_with_changes(&self, lock_token: &str, instance: &str, commit: TurnCommit) {
        let TurnCommit {
            execution_id,
            history_delta,
            work,
        } = commit;
        debug!(
            target: "sagaflow::runtime",
            instance_id = %instance,
            execution_id,
            history_delta = history_delta.len(),
            worker = work.worker_items.len(),
            timer = work.timer_items.len(),
            orch = work.orchestrator_items.len(),
            "acking orchestration item"
        );
        let acked = self
            .execute_with_retry("ack_orchestration_item", || {
                let work: TurnWork = work.clone();
                self.history_store
                    .ack_orchestration_item(lock_token, execution_id, history_delta.clone(), work)
            })
            .await;
        if acked.is_err() {
            warn!(target: "sagaflow::runtime", instance_id = %instance, "abandoning orchestration item after failed ack");
            if let Err(e) = self
                .history_store
                .abandon_orchestration_item(lock_token, Some(self.options.abandon_delay))
                .await
            {
                warn!(target: "sagaflow::runtime", instance_id = %instance, error = %e, "abandon failed; lock will expire");
            }
        }
    }
}
