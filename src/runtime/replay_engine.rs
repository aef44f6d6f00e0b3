use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::providers::WorkItem;
use crate::runtime::OrchestrationHandler;
use crate::{Action, AppErrorKind, ErrorDetails, Event, EventKind, ParentLink};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Turn completed successfully, orchestration continues
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    ContinueAsNew { input: String, version: Option<String> },
    /// A termination request arrived; user code did not run
    Terminated(String),
}

/// Which scheduling event kind a completion must point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduleKind {
    Activity,
    Timer,
    SubOrchestration,
}

impl ScheduleKind {
    fn of(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::ActivityScheduled { .. } => Some(ScheduleKind::Activity),
            EventKind::TimerCreated { .. } => Some(ScheduleKind::Timer),
            EventKind::SubOrchestrationScheduled { .. } => Some(ScheduleKind::SubOrchestration),
            _ => None,
        }
    }
}

/// Replays history and executes one deterministic orchestration evaluation
pub struct ReplayEngine {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    /// History events generated during this run
    pub(crate) history_delta: Vec<Event>,
    /// Actions to dispatch after persistence
    pub(crate) pending_actions: Vec<Action>,
    /// Persisted history at start of run
    pub(crate) baseline_history: Vec<Event>,
    /// Next event_id for new events added this run
    pub(crate) next_event_id: u64,
    /// System-level error that fails the instance before user code runs
    pub(crate) abort_error: Option<ErrorDetails>,
    pub(crate) terminate_reason: Option<String>,
}

impl ReplayEngine {
    pub fn new(instance: String, execution_id: u64, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history.last().map(|e| e.event_id() + 1).unwrap_or(1);
        Self {
            instance,
            execution_id,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            baseline_history,
            next_event_id,
            abort_error: None,
            terminate_reason: None,
        }
    }

    /// Append an event to this run's delta, returning its id.
    pub fn append(&mut self, source_event_id: Option<u64>, kind: EventKind) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.history_delta.push(Event::with_event_id(
            id,
            self.instance.clone(),
            self.execution_id,
            source_event_id,
            kind,
        ));
        id
    }

    /// Record the start of a new execution. Must precede every other event.
    pub fn append_started(&mut self, name: &str, version: &str, input: &str, parent: Option<ParentLink>) {
        self.append(
            None,
            EventKind::OrchestrationStarted {
                name: name.to_string(),
                version: version.to_string(),
                input: input.to_string(),
                parent,
            },
        );
    }

    fn history(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    fn schedule_kind(&self, id: u64) -> Option<ScheduleKind> {
        self.history()
            .find(|e| e.event_id == id)
            .and_then(|e| ScheduleKind::of(&e.kind))
    }

    fn is_resolved(&self, source_id: u64) -> bool {
        self.history().any(|e| e.source_event_id == Some(source_id))
    }

    /// Stage 1: turn completion messages into history events.
    ///
    /// Drops messages from other executions and duplicates of completions
    /// already recorded. A completion pointing at a missing or differently
    /// typed schedule aborts the turn as nondeterministic. Raised events are
    /// always recorded; matching them to waits happens during replay.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        debug!(
            target: "sagaflow::runtime",
            instance_id = %self.instance,
            execution_id = self.execution_id,
            message_count = messages.len(),
            "converting messages to events"
        );

        for msg in messages {
            let (source_id, expected, message_execution) = match &msg {
                WorkItem::ActivityCompleted { id, execution_id, .. } | WorkItem::ActivityFailed { id, execution_id, .. } => {
                    (*id, ScheduleKind::Activity, *execution_id)
                }
                WorkItem::TimerFired { id, execution_id, .. } => (*id, ScheduleKind::Timer, *execution_id),
                WorkItem::SubOrchCompleted {
                    parent_id,
                    parent_execution_id,
                    ..
                }
                | WorkItem::SubOrchFailed {
                    parent_id,
                    parent_execution_id,
                    ..
                } => (*parent_id, ScheduleKind::SubOrchestration, *parent_execution_id),
                WorkItem::ExternalRaised { name, data, .. } => {
                    self.append(
                        None,
                        EventKind::ExternalEvent {
                            name: name.clone(),
                            data: data.clone(),
                        },
                    );
                    continue;
                }
                WorkItem::TerminateInstance { reason, .. } => {
                    if self.terminate_reason.is_none() {
                        self.terminate_reason = Some(reason.clone());
                    }
                    continue;
                }
                other => {
                    warn!(target: "sagaflow::runtime", instance_id = %self.instance, ?other, "not a completion; ignored");
                    continue;
                }
            };

            if message_execution != self.execution_id {
                warn!(
                    target: "sagaflow::runtime",
                    instance_id = %self.instance,
                    execution_id = self.execution_id,
                    message_execution,
                    source_id,
                    "ignoring completion from another execution"
                );
                continue;
            }
            if self.is_resolved(source_id) {
                debug!(target: "sagaflow::runtime", instance_id = %self.instance, source_id, "dropping duplicate completion");
                continue;
            }
            match self.schedule_kind(source_id) {
                Some(found) if found == expected => {}
                found => {
                    let message = match found {
                        Some(found) => format!("completion for id={source_id} is a {expected:?} result but the schedule is a {found:?}"),
                        None => format!("no matching schedule for completion id={source_id}"),
                    };
                    warn!(target: "sagaflow::runtime", instance_id = %self.instance, %message, "nondeterminism in completion batch");
                    if self.abort_error.is_none() {
                        self.abort_error = Some(ErrorDetails::nondeterminism(message));
                    }
                    continue;
                }
            }

            let (kind, system_error) = match msg {
                WorkItem::ActivityCompleted { result, .. } => (EventKind::ActivityCompleted { result }, None),
                WorkItem::ActivityFailed { details, attempt, .. } => {
                    let system = details.is_system_error().then(|| details.clone());
                    (EventKind::ActivityFailed { details, attempt }, system)
                }
                WorkItem::TimerFired { fire_at_ms, .. } => (EventKind::TimerFired { fire_at_ms }, None),
                WorkItem::SubOrchCompleted { result, .. } => (EventKind::SubOrchestrationCompleted { result }, None),
                WorkItem::SubOrchFailed { details, .. } => {
                    let system = details.is_system_error().then(|| details.clone());
                    (EventKind::SubOrchestrationFailed { details }, system)
                }
                _ => continue,
            };
            // Recorded even when it aborts the turn, so the failure is visible in history.
            self.append(Some(source_id), kind);
            if let Some(details) = system_error {
                warn!(target: "sagaflow::runtime", instance_id = %self.instance, source_id, %details, "system error aborts turn");
                if self.abort_error.is_none() {
                    self.abort_error = Some(details);
                }
            }
        }
    }

    /// Stage 2: run the orchestration once against baseline + delta.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        if let Some(reason) = self.terminate_reason.clone() {
            return TurnResult::Terminated(reason);
        }
        if let Some(err) = self.abort_error.clone() {
            return TurnResult::Failed(err);
        }

        let working_history = self.final_history();
        let known_len = working_history.len();
        let last_persisted = self.baseline_history.last().map(|e| e.event_id).unwrap_or(0);
        let instance = self.instance.clone();
        let execution_id = self.execution_id;

        let run = catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn_with_status(working_history, &instance, execution_id, last_persisted, |ctx| {
                handler.invoke(ctx, input)
            })
        }));
        let turn = match run {
            Ok(turn) => turn,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                return TurnResult::Failed(ErrorDetails::Application {
                    kind: AppErrorKind::Panicked,
                    message,
                    retryable: false,
                });
            }
        };

        if let Some(message) = turn.nondeterminism {
            return TurnResult::Failed(ErrorDetails::nondeterminism(message));
        }

        // Scheduling events created by this poll.
        if turn.history.len() > known_len {
            self.history_delta.extend(turn.history[known_len..].iter().cloned());
            self.next_event_id = self.history().last().map(|e| e.event_id + 1).unwrap_or(1);
        }
        self.pending_actions = turn.actions;

        if let Some((input, version)) = self.pending_actions.iter().find_map(|a| match a {
            Action::ContinueAsNew { input, version } => Some((input.clone(), version.clone())),
            _ => None,
        }) {
            return TurnResult::ContinueAsNew { input, version };
        }

        match turn.output {
            Some(Ok(output)) => TurnResult::Completed(output),
            Some(Err(message)) => TurnResult::Failed(ErrorDetails::Application {
                kind: AppErrorKind::OrchestrationFailed,
                message,
                retryable: false,
            }),
            None => TurnResult::Continue,
        }
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn into_history_delta(self) -> Vec<Event> {
        self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    /// Check if this run made any progress (added history)
    pub fn made_progress(&self) -> bool {
        !self.history_delta.is_empty()
    }

    pub fn final_history(&self) -> Vec<Event> {
        self.history().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FnOrchestration;

    fn engine_with_activity() -> ReplayEngine {
        let mut engine = ReplayEngine::new("inst".into(), 1, vec![]);
        engine.append_started("Orch", "1.0.0", "in", None);
        engine.append(
            None,
            EventKind::ActivityScheduled {
                name: "A".into(),
                input: "in".into(),
                attempt: 1,
            },
        );
        ReplayEngine::new("inst".into(), 1, engine.into_history_delta())
    }

    fn completed(id: u64, execution_id: u64) -> WorkItem {
        WorkItem::ActivityCompleted {
            instance: "inst".into(),
            execution_id,
            id,
            result: "ok".into(),
        }
    }

    #[test]
    fn duplicate_and_stale_completions_are_dropped() {
        let mut engine = engine_with_activity();
        engine.prep_completions(vec![completed(2, 1), completed(2, 1), completed(2, 7)]);
        assert_eq!(engine.history_delta().len(), 1);
        assert_eq!(engine.history_delta()[0].event_id, 3);
        assert_eq!(engine.history_delta()[0].source_event_id, Some(2));
        assert!(engine.abort_error.is_none());
    }

    #[test]
    fn completion_without_schedule_is_nondeterminism() {
        let mut engine = engine_with_activity();
        engine.prep_completions(vec![WorkItem::TimerFired {
            instance: "inst".into(),
            execution_id: 1,
            id: 2,
            fire_at_ms: 0,
        }]);
        assert!(engine.abort_error.as_ref().is_some_and(ErrorDetails::is_nondeterminism));
        assert!(!engine.made_progress());
    }

    #[test]
    fn termination_skips_user_code() {
        let mut engine = engine_with_activity();
        engine.prep_completions(vec![WorkItem::TerminateInstance {
            instance: "inst".into(),
            reason: "stop".into(),
        }]);
        let handler: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(
            |_ctx: crate::OrchestrationContext, _input: String| async move { Err::<String, String>("ran".into()) },
        ));
        assert_eq!(
            engine.execute_orchestration(handler, "in".into()),
            TurnResult::Terminated("stop".into())
        );
    }

    #[test]
    fn panic_becomes_application_failure() {
        let mut engine = engine_with_activity();
        engine.prep_completions(vec![completed(2, 1)]);
        let handler: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(
            |ctx: crate::OrchestrationContext, input: String| async move {
                let a = ctx.schedule_activity("A", input).into_activity().await?;
                if a == "ok" {
                    panic!("boom");
                }
                Ok(a)
            },
        ));
        match engine.execute_orchestration(handler, "in".into()) {
            TurnResult::Failed(ErrorDetails::Application {
                kind: AppErrorKind::Panicked,
                message,
                ..
            }) => assert_eq!(message, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn new_schedules_extend_delta_with_actions() {
        let mut engine = engine_with_activity();
        engine.prep_completions(vec![completed(2, 1)]);
        let handler: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(
            |ctx: crate::OrchestrationContext, input: String| async move {
                let a = ctx.schedule_activity("A", input).into_activity().await?;
                ctx.schedule_activity("B", a).into_activity().await
            },
        ));
        assert_eq!(engine.execute_orchestration(handler, "in".into()), TurnResult::Continue);
        let ids: Vec<u64> = engine.history_delta().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(matches!(
            engine.pending_actions(),
            [Action::CallActivity { scheduling_event_id: 4, name, .. }] if name == "B"
        ));
    }
}
