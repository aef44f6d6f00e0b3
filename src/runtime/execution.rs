//! One orchestration turn: replay, decide, and turn the decision into
//! history plus outgoing work.
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::replay_engine::{ReplayEngine, TurnResult};
use super::state_helpers::{HistoryManager, StartInfo, WorkItemReader};
use super::{OrchestrationHandler, Runtime};
use crate::providers::{TurnWork, WorkItem};
use crate::{Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, EventKind, ParentLink};

/// Everything a turn asks the provider to commit.
#[derive(Debug, Default)]
pub struct TurnCommit {
    pub execution_id: u64,
    pub history_delta: Vec<Event>,
    pub work: TurnWork,
}

impl Runtime {
    /// Run one turn of `execution_id` over `baseline` with the batch in `reader`.
    ///
    /// `start` is set when the batch opens a new execution (first start or
    /// continue-as-new); the `OrchestrationStarted` event is appended first.
    pub(crate) fn run_single_execution_atomic(
        &self,
        instance: &str,
        execution_id: u64,
        baseline: Vec<Event>,
        start: Option<&StartInfo>,
        reader: WorkItemReader,
    ) -> TurnCommit {
        let mut engine = ReplayEngine::new(instance.to_string(), execution_id, baseline);
        let mut work = TurnWork::default();

        let resolved = match start {
            Some(start) => {
                let resolved = self.resolve_for_start(start);
                let version = resolved
                    .as_ref()
                    .map(|(v, _)| v.to_string())
                    .or_else(|| start.version.clone())
                    .unwrap_or_else(|| "0.0.0".to_string());
                engine.append_started(&start.orchestration, &version, &start.input, start.parent.clone());
                info!(
                    target: "sagaflow::runtime",
                    instance_id = %instance,
                    execution_id,
                    orchestration_name = %start.orchestration,
                    orchestration_version = %version,
                    "orchestration started"
                );
                resolved.map(|(_, h)| h)
            }
            None => {
                let history = HistoryManager::from_history(&engine.baseline_history);
                match (history.orchestration_name.as_deref(), history.version()) {
                    (Some(name), Some(version)) => self.orchestration_registry.resolve_handler_exact(name, &version),
                    _ => None,
                }
            }
        };

        let history = HistoryManager::from_history(&engine.final_history());
        let name = history.orchestration_name.clone().unwrap_or_default();
        let input = history.orchestration_input.clone().unwrap_or_default();
        let parent = history.parent.clone();

        engine.prep_completions(reader.completion_messages);

        let result = match resolved {
            Some(handler) => engine.execute_orchestration(handler, input),
            // Termination still wins over a missing handler.
            None => match engine.terminate_reason.clone() {
                Some(reason) => TurnResult::Terminated(reason),
                None => TurnResult::Failed(ErrorDetails::Configuration {
                    kind: ConfigErrorKind::UnregisteredOrchestration,
                    resource: name.clone(),
                    message: history.orchestration_version.clone().map(|v| format!("version {v}")),
                }),
            },
        };

        debug!(
            target: "sagaflow::runtime",
            instance_id = %instance,
            execution_id,
            ?result,
            actions = engine.pending_actions().len(),
            "turn evaluated"
        );

        match result {
            TurnResult::Continue => {
                Self::dispatch_actions(instance, execution_id, engine.pending_actions(), &mut work);
            }
            TurnResult::Completed(output) => {
                engine.append(None, EventKind::OrchestrationCompleted { output: output.clone() });
                info!(target: "sagaflow::runtime", instance_id = %instance, execution_id, "orchestration completed");
                if let Some(parent) = parent {
                    work.orchestrator_items.push(WorkItem::SubOrchCompleted {
                        parent_instance: parent.instance,
                        parent_execution_id: parent.execution_id,
                        parent_id: parent.event_id,
                        result: output,
                    });
                }
            }
            TurnResult::Failed(details) => {
                if details.is_nondeterminism() {
                    error!(
                        target: "sagaflow::runtime",
                        instance_id = %instance,
                        execution_id,
                        error = %details,
                        "orchestration failed: nondeterminism"
                    );
                } else {
                    warn!(target: "sagaflow::runtime", instance_id = %instance, execution_id, error = %details, "orchestration failed");
                }
                engine.append(None, EventKind::OrchestrationFailed { details: details.clone() });
                if let Some(parent) = parent {
                    work.orchestrator_items
                        .push(Self::child_failed(parent, details.display_message()));
                }
            }
            TurnResult::Terminated(reason) => {
                engine.append(None, EventKind::OrchestrationTerminated { reason: reason.clone() });
                info!(target: "sagaflow::runtime", instance_id = %instance, execution_id, %reason, "orchestration terminated");
                for child in HistoryManager::from_history(&engine.final_history()).open_children() {
                    work.orchestrator_items.push(WorkItem::TerminateInstance {
                        instance: child,
                        reason: format!("parent {instance} terminated: {reason}"),
                    });
                }
                if let Some(parent) = parent {
                    work.orchestrator_items
                        .push(Self::child_failed(parent, format!("terminated: {reason}")));
                }
            }
            TurnResult::ContinueAsNew { input, version } => {
                engine.append(None, EventKind::OrchestrationContinuedAsNew { input: input.clone() });
                info!(target: "sagaflow::runtime", instance_id = %instance, execution_id, "orchestration continued as new");
                work.orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: instance.to_string(),
                    orchestration: name,
                    input,
                    version,
                });
            }
        }

        TurnCommit {
            execution_id,
            history_delta: engine.into_history_delta(),
            work,
        }
    }

    fn resolve_for_start(&self, start: &StartInfo) -> Option<(semver::Version, Arc<dyn OrchestrationHandler>)> {
        match &start.version {
            Some(v) => {
                let version = semver::Version::parse(v).ok()?;
                let handler = self
                    .orchestration_registry
                    .resolve_handler_exact(&start.orchestration, &version)?;
                Some((version, handler))
            }
            None => self.orchestration_registry.resolve_handler(&start.orchestration),
        }
    }

    fn child_failed(parent: ParentLink, message: String) -> WorkItem {
        WorkItem::SubOrchFailed {
            parent_instance: parent.instance,
            parent_execution_id: parent.execution_id,
            parent_id: parent.event_id,
            details: ErrorDetails::Application {
                kind: AppErrorKind::SubOrchestrationFailed,
                message,
                retryable: false,
            },
        }
    }

    /// Turn this turn's actions into queue messages. Event subscriptions need
    /// no message: they are matched against raised events during replay.
    fn dispatch_actions(instance: &str, execution_id: u64, actions: &[Action], work: &mut TurnWork) {
        for action in actions {
            match action {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                    attempt,
                } => work.worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    execution_id,
                    id: *scheduling_event_id,
                    name: name.clone(),
                    input: input.clone(),
                    attempt: *attempt,
                }),
                Action::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                } => work.timer_items.push(WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    execution_id,
                    id: *scheduling_event_id,
                    fire_at_ms: *fire_at_ms,
                }),
                Action::StartSubOrchestration {
                    scheduling_event_id,
                    name,
                    version,
                    instance: child,
                    input,
                } => work.orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child.clone(),
                    orchestration: name.clone(),
                    input: input.clone(),
                    version: version.clone(),
                    parent: Some(ParentLink {
                        instance: instance.to_string(),
                        execution_id,
                        event_id: *scheduling_event_id,
                    }),
                }),
                Action::WaitExternal { .. } | Action::ContinueAsNew { .. } => {}
            }
        }
    }
}
