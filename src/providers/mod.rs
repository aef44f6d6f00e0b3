//! History store and work queues.
//!
//! A provider keeps, per instance, an append-only history for each execution
//! plus three peek-lock queues:
//!
//! - orchestrator queue: starts, completions, raised events, terminations
//! - worker queue: activity executions
//! - timer queue: timer schedules
//!
//! Fetching an orchestration item locks the instance and hands out every
//! visible message for it as one batch. Acking appends the turn's history and
//! enqueues the turn's outgoing work atomically. Locks that are neither acked
//! nor abandoned expire and their messages become visible again, which is
//! how a crashed runtime's in-flight work is picked up by the next one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ErrorDetails, Event, ParentLink};

pub mod error;
pub mod in_memory;

pub use error::{ProviderError, ProviderErrorKind};

/// Messages flowing through the provider queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
        parent: Option<ParentLink>,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
        attempt: u32,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        details: ErrorDetails,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
    },
}

impl WorkItem {
    /// The instance whose orchestrator queue (or turn) this item belongs to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                parent_instance
            }
        }
    }
}

/// One locked batch of orchestrator messages for a single instance.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    /// Latest execution id, 1 for an instance without history.
    pub execution_id: u64,
    /// History of the latest execution.
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Outgoing work produced by one orchestration turn.
#[derive(Debug, Clone, Default)]
pub struct TurnWork {
    pub worker_items: Vec<WorkItem>,
    pub timer_items: Vec<WorkItem>,
    pub orchestrator_items: Vec<WorkItem>,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Reserve `instance` and enqueue its start message atomically.
    /// Fails with [`ProviderErrorKind::AlreadyExists`] when the id is taken.
    async fn create_instance(&self, instance: &str, start: WorkItem) -> Result<(), ProviderError>;

    async fn instance_exists(&self, instance: &str) -> Result<bool, ProviderError>;

    /// History of the latest execution, empty if none.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError>;

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Remove the instance, its histories and its queued orchestrator messages.
    async fn purge_instance(&self, instance: &str) -> Result<(), ProviderError>;

    async fn enqueue_orchestrator_work(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Append `history_delta` to `execution_id` (creating it when new),
    /// enqueue `work`, and release the lock, all or nothing.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        work: TurnWork,
    ) -> Result<(), ProviderError>;

    /// Release the lock and make the batch visible again after `delay`.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn fetch_work_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove the locked activity item and enqueue its completion atomically.
    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, token: &str) -> Result<(), ProviderError>;

    async fn fetch_timer_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove the locked timer item and enqueue its `TimerFired` atomically,
    /// invisible to the orchestrator dispatcher until `delay` has elapsed.
    async fn ack_timer_item(&self, token: &str, fired: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError>;
}
