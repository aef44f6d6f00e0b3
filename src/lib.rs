//! # sagaflow
//!
//! Deterministic, replay-driven durable orchestrations for Rust.
//!
//! An orchestration is an ordinary `async` function that talks to the outside
//! world only through an [`OrchestrationContext`]. Every scheduling call
//! (activity, timer, external event, sub-orchestration) is recorded as a
//! history event; completions are appended as they arrive. On every turn the
//! function is re-run from the top against the whole history, so a process
//! crash at any point resumes exactly where the persisted history left off.
//!
//! ```ignore
//! use sagaflow::{OrchestrationContext, RetryPolicy};
//! use std::time::Duration;
//!
//! async fn order_flow(ctx: OrchestrationContext, order: String) -> Result<String, String> {
//!     let reserved = ctx.schedule_activity("Reserve", order).into_activity().await?;
//!     let charged = ctx
//!         .schedule_activity_with_retry("Charge", reserved, RetryPolicy::new(3))
//!         .await?;
//!     match ctx.schedule_wait_with_timeout("Shipped", Duration::from_secs(60)).await {
//!         Ok(tracking) => Ok(format!("{charged}:{tracking}")),
//!         Err(_) => ctx.schedule_activity("Refund", charged).into_activity().await,
//!     }
//! }
//! ```
//!
//! The pieces:
//! - [`providers`]: the history store and work queues (`Provider` trait, in-memory provider)
//! - [`runtime`]: dispatchers that drive orchestrations, activities, and timers
//! - [`client`]: control plane (start, raise events, terminate, query)
//! - [`retry`]: retry policies for activities
//! - [`saga`]: the reference payment saga

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod client;
pub(crate) mod correlation;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod saga;

pub use client::{Client, ClientError};
pub use crate::futures::{CompositeFailure, DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry, VersionPolicy};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions};

// Reserved for the typed helpers; not part of the public API.
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted so typed and untyped callers interoperate.
            let json = serde_json::to_string(v).map_err(|e| e.to_string())?;
            if json.starts_with('"') {
                return serde_json::from_str::<String>(&json).map_err(|e| e.to_string());
            }
            Ok(json)
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Milliseconds since the Unix epoch, used to stamp new history events.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Link from a child orchestration back to the parent event that scheduled it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentLink {
    pub instance: String,
    pub execution_id: u64,
    /// `event_id` of the parent's `SubOrchestrationScheduled` event.
    pub event_id: u64,
}

/// Application-level error categories recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppErrorKind {
    ActivityFailed,
    SubOrchestrationFailed,
    OrchestrationFailed,
    Panicked,
}

/// Configuration error categories. These are not the user's business logic
/// failing; they mean code and history disagree or something is not registered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigErrorKind {
    Nondeterminism,
    UnregisteredActivity,
    UnregisteredOrchestration,
}

/// Structured error stored in history and surfaced through status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorDetails {
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    pub fn activity_failed(message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind: AppErrorKind::ActivityFailed,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: String::new(),
            message: Some(message.into()),
        }
    }

    /// Human readable message, as handed to orchestration code.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { message, .. } => message.clone(),
            ErrorDetails::Configuration { kind, resource, message } => {
                let base = match kind {
                    ConfigErrorKind::Nondeterminism => "nondeterministic orchestration".to_string(),
                    ConfigErrorKind::UnregisteredActivity => format!("unregistered activity '{resource}'"),
                    ConfigErrorKind::UnregisteredOrchestration => format!("unregistered orchestration '{resource}'"),
                };
                match message {
                    Some(m) => format!("{base}: {m}"),
                    None => base,
                }
            }
            ErrorDetails::Infrastructure { operation, message, .. } => format!("{operation}: {message}"),
        }
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                ..
            }
        )
    }

    /// Configuration and infrastructure errors abort the turn instead of
    /// flowing back into orchestration code.
    pub fn is_system_error(&self) -> bool {
        !matches!(self, ErrorDetails::Application { .. })
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}

/// What happened, as recorded in an execution's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    OrchestrationStarted {
        name: String,
        version: String,
        input: String,
        parent: Option<ParentLink>,
    },
    ActivityScheduled {
        name: String,
        input: String,
        attempt: u32,
    },
    ActivityCompleted {
        result: String,
    },
    ActivityFailed {
        details: ErrorDetails,
        attempt: u32,
    },
    TimerCreated {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        name: String,
    },
    ExternalEvent {
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        result: String,
    },
    SubOrchestrationFailed {
        details: ErrorDetails,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        details: ErrorDetails,
    },
    OrchestrationTerminated {
        reason: String,
    },
    OrchestrationContinuedAsNew {
        input: String,
    },
}

impl EventKind {
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityScheduled { .. }
                | EventKind::TimerCreated { .. }
                | EventKind::ExternalSubscribed { .. }
                | EventKind::SubOrchestrationScheduled { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestrationCompleted { .. }
                | EventKind::OrchestrationFailed { .. }
                | EventKind::OrchestrationTerminated { .. }
                | EventKind::OrchestrationContinuedAsNew { .. }
        )
    }

    /// Short label used in nondeterminism messages.
    pub fn label(&self) -> String {
        match self {
            EventKind::OrchestrationStarted { name, .. } => format!("OrchestrationStarted('{name}')"),
            EventKind::ActivityScheduled { name, attempt, .. } => format!("ActivityScheduled('{name}', attempt {attempt})"),
            EventKind::ActivityCompleted { .. } => "ActivityCompleted".to_string(),
            EventKind::ActivityFailed { .. } => "ActivityFailed".to_string(),
            EventKind::TimerCreated { .. } => "TimerCreated".to_string(),
            EventKind::TimerFired { .. } => "TimerFired".to_string(),
            EventKind::ExternalSubscribed { name } => format!("ExternalSubscribed('{name}')"),
            EventKind::ExternalEvent { name, .. } => format!("ExternalEvent('{name}')"),
            EventKind::SubOrchestrationScheduled { name, .. } => format!("SubOrchestrationScheduled('{name}')"),
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted".to_string(),
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed".to_string(),
            EventKind::OrchestrationCompleted { .. } => "OrchestrationCompleted".to_string(),
            EventKind::OrchestrationFailed { .. } => "OrchestrationFailed".to_string(),
            EventKind::OrchestrationTerminated { .. } => "OrchestrationTerminated".to_string(),
            EventKind::OrchestrationContinuedAsNew { .. } => "OrchestrationContinuedAsNew".to_string(),
        }
    }
}

/// One entry of an execution's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Position in the execution's history, 1-based and dense.
    pub event_id: u64,
    /// For completions, the `event_id` of the scheduling event they resolve.
    pub source_event_id: Option<u64>,
    pub instance_id: String,
    pub execution_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn with_event_id(
        event_id: u64,
        instance_id: impl Into<String>,
        execution_id: u64,
        source_event_id: Option<u64>,
        kind: EventKind,
    ) -> Self {
        Self {
            event_id,
            source_event_id,
            instance_id: instance_id.into(),
            execution_id,
            timestamp_ms: now_ms(),
            kind,
        }
    }

    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    pub fn set_event_id(&mut self, id: u64) {
        self.event_id = id;
    }
}

/// Work requested by an orchestration turn, dispatched after its history is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance_id: String,
    pub(crate) execution_id: u64,
    pub(crate) history: Vec<Event>,
    /// Events up to this id were persisted before the current turn.
    last_persisted_event_id: u64,
    actions: Vec<Action>,
    next_event_id: u64,

    claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    pub(crate) cancelled_source_ids: HashSet<u64>,
    pub(crate) correlator: correlation::EventCorrelator,

    nondeterminism_error: Option<String>,
    logical_now_ms: u64,
    guid_counter: u64,
    replaying: bool,
}

impl CtxInner {
    fn new(history: Vec<Event>, instance_id: String, execution_id: u64, last_persisted_event_id: u64) -> Self {
        let next_event_id = history.last().map(|e| e.event_id + 1).unwrap_or(1);
        let logical_now_ms = history
            .iter()
            .find(|e| matches!(e.kind, EventKind::OrchestrationStarted { .. }))
            .map(|e| e.timestamp_ms)
            .unwrap_or(0);
        Self {
            instance_id,
            execution_id,
            history,
            last_persisted_event_id,
            actions: Vec::new(),
            next_event_id,
            claimed_scheduling_events: HashSet::new(),
            consumed_completions: HashSet::new(),
            cancelled_source_ids: HashSet::new(),
            correlator: correlation::EventCorrelator::default(),
            nondeterminism_error: None,
            logical_now_ms,
            guid_counter: 0,
            replaying: last_persisted_event_id > 0,
        }
    }

    pub(crate) fn has_nondeterminism(&self) -> bool {
        self.nondeterminism_error.is_some()
    }

    pub(crate) fn logical_now_ms(&self) -> u64 {
        self.logical_now_ms
    }

    pub(crate) fn next_event_id(&self) -> u64 {
        self.next_event_id
    }

    /// Claim the next unclaimed scheduling event in history order.
    ///
    /// `Ok(Some(id))` adopts a recorded event, `Ok(None)` means history is
    /// exhausted and the caller must append a new one, `Err` flags
    /// nondeterminism.
    pub(crate) fn claim_scheduling_event(&mut self, matches: impl Fn(&EventKind) -> bool, wanted: &str) -> Result<Option<u64>, ()> {
        let next = self
            .history
            .iter()
            .find(|e| e.kind.is_scheduling() && !self.claimed_scheduling_events.contains(&e.event_id))
            .map(|e| (e.event_id, e.kind.clone()));
        match next {
            None => Ok(None),
            Some((id, kind)) if matches(&kind) => {
                self.claimed_scheduling_events.insert(id);
                Ok(Some(id))
            }
            Some((id, kind)) => {
                if self.nondeterminism_error.is_none() {
                    self.nondeterminism_error = Some(format!(
                        "orchestration scheduled {wanted} but history event {id} is {}",
                        kind.label()
                    ));
                }
                Err(())
            }
        }
    }

    /// Append a new scheduling event created during this turn.
    pub(crate) fn append_scheduling_event(&mut self, kind: EventKind, action: impl FnOnce(u64) -> Action) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.history
            .push(Event::with_event_id(id, self.instance_id.clone(), self.execution_id, None, kind));
        self.claimed_scheduling_events.insert(id);
        self.actions.push(action(id));
        self.replaying = false;
        id
    }

    /// Find the completion recorded for a scheduling event.
    pub(crate) fn completion_for(&self, source_id: u64) -> Option<&Event> {
        self.history.iter().find(|e| e.source_event_id == Some(source_id))
    }

    /// Mark a completion consumed, advancing the logical clock and the replay flag.
    pub(crate) fn consume_completion(&mut self, completion_id: u64) {
        self.consumed_completions.insert(completion_id);
        if let Some(ts) = self
            .history
            .iter()
            .find(|e| e.event_id == completion_id)
            .map(|e| e.timestamp_ms)
        {
            self.logical_now_ms = self.logical_now_ms.max(ts);
        }
        if completion_id > self.last_persisted_event_id {
            self.replaying = false;
        }
    }

    fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }
}

/// Handle given to orchestration code. Cheap to clone.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context over `history`, treating all of it as already persisted.
    pub fn new(history: Vec<Event>, instance_id: impl Into<String>, execution_id: u64) -> Self {
        let last = history.last().map(|e| e.event_id).unwrap_or(0);
        Self::with_replay_boundary(history, instance_id, execution_id, last)
    }

    pub(crate) fn with_replay_boundary(
        history: Vec<Event>,
        instance_id: impl Into<String>,
        execution_id: u64,
        last_persisted_event_id: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(
                history,
                instance_id.into(),
                execution_id,
                last_persisted_event_id,
            ))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    /// Deterministic "now": the start time advanced by every completion consumed so far.
    pub fn utc_now_ms(&self) -> u64 {
        self.lock().logical_now_ms
    }

    /// Deterministic GUID, unique per instance and call order.
    pub fn new_guid(&self) -> String {
        let mut inner = self.lock();
        inner.guid_counter += 1;
        let hash = inner
            .instance_id
            .bytes()
            .fold(0xcbf29ce484222325u64, |acc, b| (acc ^ b as u64).wrapping_mul(0x100000001b3));
        format!("{:016x}-{:016x}-{:08x}", hash, inner.execution_id, inner.guid_counter)
    }

    /// True while the current poll is re-executing history recorded in earlier turns.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(tracing::Level::INFO, message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(tracing::Level::WARN, message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(tracing::Level::ERROR, message.into());
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace(tracing::Level::DEBUG, message.into());
    }

    fn trace(&self, level: tracing::Level, message: String) {
        let (instance_id, execution_id, replaying) = {
            let inner = self.lock();
            (inner.instance_id.clone(), inner.execution_id, inner.replaying)
        };
        if replaying {
            return;
        }
        match level {
            tracing::Level::ERROR => {
                tracing::error!(target: "sagaflow::orchestration", instance_id = %instance_id, execution_id, "{message}")
            }
            tracing::Level::WARN => {
                tracing::warn!(target: "sagaflow::orchestration", instance_id = %instance_id, execution_id, "{message}")
            }
            tracing::Level::DEBUG => {
                tracing::debug!(target: "sagaflow::orchestration", instance_id = %instance_id, execution_id, "{message}")
            }
            _ => tracing::info!(target: "sagaflow::orchestration", instance_id = %instance_id, execution_id, "{message}"),
        }
    }

    /// End this execution and start a fresh one with `input` and an empty history.
    ///
    /// The returned future never resolves; return it from the orchestration.
    pub fn continue_as_new(&self, input: impl Into<String>) -> impl Future<Output = Result<String, String>> + Send + 'static {
        self.lock().record_action(Action::ContinueAsNew {
            input: input.into(),
            version: None,
        });
        ::futures::future::pending()
    }

    /// Like [`continue_as_new`](Self::continue_as_new), pinning the next execution to `version`.
    pub fn continue_as_new_versioned(
        &self,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> impl Future<Output = Result<String, String>> + Send + 'static {
        self.lock().record_action(Action::ContinueAsNew {
            input: input.into(),
            version: Some(version.into()),
        });
        ::futures::future::pending()
    }
}

/// Context handed to activity implementations.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    activity_name: String,
    activity_id: u64,
    attempt: u32,
}

impl ActivityContext {
    pub(crate) fn new(instance_id: String, execution_id: u64, activity_name: String, activity_id: u64, attempt: u32) -> Self {
        Self {
            instance_id,
            execution_id,
            activity_name,
            activity_id,
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    /// 1 for the first attempt, incremented by retry policies.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "sagaflow::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "sagaflow::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        tracing::error!(
            target: "sagaflow::activity",
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }
}

/// Everything one orchestration turn produced.
#[derive(Debug)]
pub struct TurnOutput<O> {
    /// The input history plus scheduling events appended this turn.
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    /// `Some` when the orchestration future completed.
    pub output: Option<O>,
    pub nondeterminism: Option<String>,
}

/// Poll an orchestration exactly once against `history`.
///
/// `last_persisted_event_id` marks where persisted history ends; events past
/// it are new this turn and clear [`OrchestrationContext::is_replaying`] when consumed.
pub fn run_turn_with_status<O, F>(
    history: Vec<Event>,
    instance_id: &str,
    execution_id: u64,
    last_persisted_event_id: u64,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutput<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::with_replay_boundary(history, instance_id, execution_id, last_persisted_event_id);
    let output = {
        let mut fut = std::pin::pin!(orchestrator(ctx.clone()));
        let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(out) => Some(out),
            Poll::Pending => None,
        }
    };
    let mut inner = ctx.lock();
    TurnOutput {
        history: std::mem::take(&mut inner.history),
        actions: std::mem::take(&mut inner.actions),
        output,
        nondeterminism: inner.nondeterminism_error.take(),
    }
}

/// Convenience wrapper for tests and tools: a single turn where the whole
/// history counts as persisted.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl FnOnce(OrchestrationContext) -> F) -> TurnOutput<O>
where
    F: Future<Output = O>,
{
    let instance_id = history
        .first()
        .map(|e| e.instance_id.clone())
        .unwrap_or_else(|| "inst".to_string());
    let execution_id = history.first().map(|e| e.execution_id).unwrap_or(1);
    let last = history.last().map(|e| e.event_id).unwrap_or(0);
    run_turn_with_status(history, &instance_id, execution_id, last, orchestrator)
}

/// Error returned by [`OrchestrationContext::schedule_wait_with_timeout`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {timeout:?} waiting for event '{name}'")]
    Timeout { name: String, timeout: Duration },
}
