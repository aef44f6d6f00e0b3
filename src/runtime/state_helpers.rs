use tracing::warn;

use super::OrchestrationStatus;
use crate::providers::WorkItem;
use crate::{ErrorDetails, Event, EventKind, ParentLink};

/// Reader for metadata derived from one execution's history.
///
/// Scans the events once so callers don't have to walk the history
/// repeatedly to find the start record or the terminal event.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    pub orchestration_name: Option<String>,
    pub orchestration_version: Option<String>,
    pub orchestration_input: Option<String>,
    /// Set when this instance is a sub-orchestration.
    pub parent: Option<ParentLink>,

    pub output: Option<String>,
    pub failure: Option<ErrorDetails>,
    pub terminate_reason: Option<String>,
    /// Input carried to the next execution by continue-as-new.
    pub continued_as_new_input: Option<String>,

    history: Vec<Event>,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        let mut mgr = Self {
            history: history.to_vec(),
            ..Self::default()
        };
        for event in history {
            match &event.kind {
                EventKind::OrchestrationStarted {
                    name,
                    version,
                    input,
                    parent,
                } => {
                    mgr.orchestration_name = Some(name.clone());
                    mgr.orchestration_version = Some(version.clone());
                    mgr.orchestration_input = Some(input.clone());
                    mgr.parent = parent.clone();
                }
                EventKind::OrchestrationCompleted { output } => mgr.output = Some(output.clone()),
                EventKind::OrchestrationFailed { details } => mgr.failure = Some(details.clone()),
                EventKind::OrchestrationTerminated { reason } => mgr.terminate_reason = Some(reason.clone()),
                EventKind::OrchestrationContinuedAsNew { input } => mgr.continued_as_new_input = Some(input.clone()),
                _ => {}
            }
        }
        mgr
    }

    pub fn is_completed(&self) -> bool {
        self.output.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate_reason.is_some()
    }

    pub fn is_continued_as_new(&self) -> bool {
        self.continued_as_new_input.is_some()
    }

    /// No further turns run against this execution.
    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_failed() || self.is_terminated() || self.is_continued_as_new()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn status(&self) -> OrchestrationStatus {
        if let Some(output) = &self.output {
            OrchestrationStatus::Completed { output: output.clone() }
        } else if let Some(details) = &self.failure {
            OrchestrationStatus::Failed {
                details: details.clone(),
            }
        } else if let Some(reason) = &self.terminate_reason {
            OrchestrationStatus::Terminated { reason: reason.clone() }
        } else if self.is_continued_as_new() {
            OrchestrationStatus::ContinuedAsNew
        } else if self.history.is_empty() {
            OrchestrationStatus::Pending
        } else {
            OrchestrationStatus::Running
        }
    }

    pub fn version(&self) -> Option<semver::Version> {
        self.orchestration_version
            .as_deref()
            .and_then(|v| semver::Version::parse(v).ok())
    }

    /// Child instances scheduled by this execution that have not reported back.
    pub fn open_children(&self) -> Vec<String> {
        self.history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::SubOrchestrationScheduled { instance, .. } => Some((e.event_id, instance.clone())),
                _ => None,
            })
            .filter(|(id, _)| !self.history.iter().any(|c| c.source_event_id == Some(*id)))
            .map(|(_, instance)| instance)
            .collect()
    }

    pub fn full_history(&self) -> &[Event] {
        &self.history
    }
}

/// What a start or continue-as-new message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInfo {
    pub orchestration: String,
    pub input: String,
    pub version: Option<String>,
    pub parent: Option<ParentLink>,
}

/// Sorts one orchestrator batch into start, continue-as-new, and completion messages.
#[derive(Debug, Clone, Default)]
pub struct WorkItemReader {
    pub start: Option<StartInfo>,
    pub is_continue_as_new: bool,
    /// Completions, raised events and termination requests, in arrival order.
    pub completion_messages: Vec<WorkItem>,
}

impl WorkItemReader {
    pub fn from_messages(messages: &[WorkItem], history_mgr: &HistoryManager, instance: &str) -> Self {
        let mut reader = Self::default();
        for msg in messages {
            match msg {
                WorkItem::StartOrchestration {
                    orchestration,
                    input,
                    version,
                    parent,
                    ..
                } => {
                    if !history_mgr.is_empty() || reader.start.is_some() {
                        warn!(target: "sagaflow::runtime", instance, "duplicate start message ignored");
                        continue;
                    }
                    reader.start = Some(StartInfo {
                        orchestration: orchestration.clone(),
                        input: input.clone(),
                        version: version.clone(),
                        parent: parent.clone(),
                    });
                }
                WorkItem::ContinueAsNew {
                    orchestration,
                    input,
                    version,
                    ..
                } => {
                    if !history_mgr.is_continued_as_new() || reader.start.is_some() {
                        warn!(target: "sagaflow::runtime", instance, "stale continue-as-new message ignored");
                        continue;
                    }
                    reader.start = Some(StartInfo {
                        orchestration: orchestration.clone(),
                        input: input.clone(),
                        version: version.clone(),
                        parent: history_mgr.parent.clone(),
                    });
                    reader.is_continue_as_new = true;
                }
                WorkItem::ActivityExecute { .. } | WorkItem::TimerSchedule { .. } => {
                    warn!(target: "sagaflow::runtime", instance, ?msg, "non-orchestrator message in orchestrator batch");
                }
                other => reader.completion_messages.push(other.clone()),
            }
        }
        reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(id: u64, source: Option<u64>, kind: EventKind) -> Event {
        Event::with_event_id(id, "p", 1, source, kind)
    }

    fn started() -> Event {
        ev(
            1,
            None,
            EventKind::OrchestrationStarted {
                name: "Parent".into(),
                version: "1.0.0".into(),
                input: "in".into(),
                parent: None,
            },
        )
    }

    #[test]
    fn open_children_excludes_reported_ones() {
        let h = vec![
            started(),
            ev(
                2,
                None,
                EventKind::SubOrchestrationScheduled {
                    name: "Child".into(),
                    instance: "p::sub::2".into(),
                    input: "a".into(),
                },
            ),
            ev(
                3,
                None,
                EventKind::SubOrchestrationScheduled {
                    name: "Child".into(),
                    instance: "p::sub::3".into(),
                    input: "b".into(),
                },
            ),
            ev(4, Some(2), EventKind::SubOrchestrationCompleted { result: "ok".into() }),
        ];
        let mgr = HistoryManager::from_history(&h);
        assert_eq!(mgr.open_children(), vec!["p::sub::3".to_string()]);
        assert_eq!(mgr.status(), OrchestrationStatus::Running);
    }

    #[test]
    fn terminal_status_from_history() {
        let h = vec![started(), ev(2, None, EventKind::OrchestrationTerminated { reason: "stop".into() })];
        let mgr = HistoryManager::from_history(&h);
        assert!(mgr.is_terminal());
        assert_eq!(mgr.status(), OrchestrationStatus::Terminated { reason: "stop".into() });
    }

    #[test]
    fn continue_as_new_keeps_parent_link() {
        let parent = ParentLink {
            instance: "root".into(),
            execution_id: 1,
            event_id: 7,
        };
        let h = vec![
            ev(
                1,
                None,
                EventKind::OrchestrationStarted {
                    name: "Loop".into(),
                    version: "1.0.0".into(),
                    input: "0".into(),
                    parent: Some(parent.clone()),
                },
            ),
            ev(2, None, EventKind::OrchestrationContinuedAsNew { input: "1".into() }),
        ];
        let mgr = HistoryManager::from_history(&h);
        let msgs = vec![WorkItem::ContinueAsNew {
            instance: "i".into(),
            orchestration: "Loop".into(),
            input: "1".into(),
            version: None,
        }];
        let reader = WorkItemReader::from_messages(&msgs, &mgr, "i");
        assert!(reader.is_continue_as_new);
        assert_eq!(reader.start.unwrap().parent, Some(parent));
    }

    #[test]
    fn start_on_existing_history_is_ignored() {
        let mgr = HistoryManager::from_history(&[started()]);
        let msgs = vec![
            WorkItem::StartOrchestration {
                instance: "p".into(),
                orchestration: "Parent".into(),
                input: "in".into(),
                version: None,
                parent: None,
            },
            WorkItem::ExternalRaised {
                instance: "p".into(),
                name: "Go".into(),
                data: "1".into(),
            },
        ];
        let reader = WorkItemReader::from_messages(&msgs, &mgr, "p");
        assert!(reader.start.is_none());
        assert_eq!(reader.completion_messages.len(), 1);
    }
}
