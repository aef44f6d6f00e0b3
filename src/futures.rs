//! Durable futures returned by the scheduling calls on [`OrchestrationContext`].
//!
//! A `DurableFuture` claims its scheduling event on first poll and resolves
//! once the matching completion is present in history. Futures never block:
//! polled against a history without a completion they stay pending and the
//! turn ends.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::_typed_codec::{Codec, Json};
use crate::retry::RetryPolicy;
use crate::{Action, CtxInner, EventKind, OrchestrationContext, WaitError};

/// What a [`DurableFuture`] resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

impl DurableOutput {
    /// Flatten into a result; timers resolve to an empty string.
    pub fn into_result(self) -> Result<String, String> {
        match self {
            DurableOutput::Activity(r) | DurableOutput::SubOrchestration(r) => r,
            DurableOutput::Timer => Ok(String::new()),
            DurableOutput::External(data) => Ok(data),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    Activity { name: String, input: String, attempt: u32 },
    Timer { delay: Duration },
    External { name: String },
    SubOrch { name: String, version: Option<String>, input: String },
}

impl Kind {
    fn describe(&self) -> String {
        match self {
            Kind::Activity { name, attempt, .. } => format!("activity '{name}' (attempt {attempt})"),
            Kind::Timer { delay } => format!("timer ({delay:?})"),
            Kind::External { name } => format!("wait for event '{name}'"),
            Kind::SubOrch { name, .. } => format!("sub-orchestration '{name}'"),
        }
    }

    fn matches(&self, recorded: &EventKind) -> bool {
        match (self, recorded) {
            (
                Kind::Activity { name, input, attempt },
                EventKind::ActivityScheduled {
                    name: n,
                    input: i,
                    attempt: a,
                },
            ) => name == n && input == i && attempt == a,
            (Kind::Timer { .. }, EventKind::TimerCreated { .. }) => true,
            (Kind::External { name }, EventKind::ExternalSubscribed { name: n }) => name == n,
            (Kind::SubOrch { name, input, .. }, EventKind::SubOrchestrationScheduled { name: n, input: i, .. }) => {
                name == n && input == i
            }
            _ => false,
        }
    }
}

/// A schedulable unit of durable work.
///
/// Await it directly, adapt it with one of the `into_*` helpers, or combine
/// several with [`OrchestrationContext::select2`] and [`OrchestrationContext::join`].
pub struct DurableFuture {
    kind: Kind,
    ctx: OrchestrationContext,
    scheduling_id: Option<u64>,
    resolved: Option<(u64, DurableOutput)>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            kind,
            ctx,
            scheduling_id: None,
            resolved: None,
        }
    }

    /// Claim or create this future's scheduling event. `None` means nondeterminism was flagged.
    fn ensure_scheduled(&mut self, inner: &mut CtxInner) -> Option<u64> {
        if let Some(id) = self.scheduling_id {
            return Some(id);
        }
        if inner.has_nondeterminism() {
            return None;
        }
        let kind = self.kind.clone();
        let id = match inner.claim_scheduling_event(|recorded| kind.matches(recorded), &kind.describe()) {
            Err(()) => return None,
            Ok(Some(id)) => id,
            Ok(None) => match kind {
                Kind::Activity { name, input, attempt } => inner.append_scheduling_event(
                    EventKind::ActivityScheduled {
                        name: name.clone(),
                        input: input.clone(),
                        attempt,
                    },
                    |id| Action::CallActivity {
                        scheduling_event_id: id,
                        name,
                        input,
                        attempt,
                    },
                ),
                Kind::Timer { delay } => {
                    let fire_at_ms = inner.logical_now_ms().saturating_add(delay.as_millis() as u64);
                    inner.append_scheduling_event(EventKind::TimerCreated { fire_at_ms }, |id| Action::CreateTimer {
                        scheduling_event_id: id,
                        fire_at_ms,
                    })
                }
                Kind::External { name } => {
                    inner.append_scheduling_event(EventKind::ExternalSubscribed { name: name.clone() }, |id| {
                        Action::WaitExternal {
                            scheduling_event_id: id,
                            name,
                        }
                    })
                }
                Kind::SubOrch { name, version, input } => {
                    // The child id derives from the scheduling event id, so it is stable across replays.
                    let instance = format!("{}::sub::{}", inner.instance_id, inner.next_event_id());
                    inner.append_scheduling_event(
                        EventKind::SubOrchestrationScheduled {
                            name: name.clone(),
                            instance: instance.clone(),
                            input: input.clone(),
                        },
                        |id| Action::StartSubOrchestration {
                            scheduling_event_id: id,
                            name,
                            version,
                            instance,
                            input,
                        },
                    )
                }
            },
        };
        self.scheduling_id = Some(id);
        Some(id)
    }

    /// Look for this future's completion without consuming it.
    fn probe(&self, inner: &CtxInner) -> Option<(u64, DurableOutput)> {
        if let Some(done) = &self.resolved {
            return Some(done.clone());
        }
        let id = self.scheduling_id?;
        if let Kind::External { name } = &self.kind {
            return inner
                .correlator
                .match_for(&inner.history, &inner.cancelled_source_ids, id, name)
                .map(|(event_id, data)| (event_id, DurableOutput::External(data)));
        }
        let completion = inner.completion_for(id)?;
        let output = match (&self.kind, &completion.kind) {
            (Kind::Activity { .. }, EventKind::ActivityCompleted { result }) => DurableOutput::Activity(Ok(result.clone())),
            (Kind::Activity { .. }, EventKind::ActivityFailed { details, .. }) => {
                DurableOutput::Activity(Err(details.display_message()))
            }
            (Kind::Timer { .. }, EventKind::TimerFired { .. }) => DurableOutput::Timer,
            (Kind::SubOrch { .. }, EventKind::SubOrchestrationCompleted { result }) => {
                DurableOutput::SubOrchestration(Ok(result.clone()))
            }
            (Kind::SubOrch { .. }, EventKind::SubOrchestrationFailed { details }) => {
                DurableOutput::SubOrchestration(Err(details.display_message()))
            }
            _ => return None,
        };
        Some((completion.event_id, output))
    }

    fn commit(&mut self, inner: &mut CtxInner, completion_id: u64, output: DurableOutput) {
        if self.resolved.is_some() {
            return;
        }
        if let (Kind::External { .. }, Some(sub_id)) = (&self.kind, self.scheduling_id) {
            inner.correlator.claim(sub_id, completion_id);
        }
        inner.consume_completion(completion_id);
        self.resolved = Some((completion_id, output));
    }

    fn cancel(&self, inner: &mut CtxInner) {
        if self.resolved.is_none()
            && let Some(id) = self.scheduling_id
        {
            inner.cancelled_source_ids.insert(id);
        }
    }

    /// Resolve to the activity's result.
    ///
    /// # Panics
    /// If this future was not created by `schedule_activity`.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => panic!("into_activity on a non-activity future: {other:?}"),
        }
    }

    pub async fn into_activity_typed<Out: DeserializeOwned>(self) -> Result<Out, String> {
        let raw = self.into_activity().await?;
        Json::decode::<Out>(&raw)
    }

    /// # Panics
    /// If this future was not created by `schedule_timer`.
    pub async fn into_timer(self) {
        match self.await {
            DurableOutput::Timer => {}
            other => panic!("into_timer on a non-timer future: {other:?}"),
        }
    }

    /// # Panics
    /// If this future was not created by `schedule_wait`.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(data) => data,
            other => panic!("into_event on a non-event future: {other:?}"),
        }
    }

    pub async fn into_event_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        let raw = self.into_event().await;
        Json::decode::<T>(&raw)
    }

    /// # Panics
    /// If this future was not created by `schedule_sub_orchestration`.
    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => panic!("into_sub_orchestration on a non-sub-orchestration future: {other:?}"),
        }
    }

    pub async fn into_sub_orchestration_typed<Out: DeserializeOwned>(self) -> Result<Out, String> {
        let raw = self.into_sub_orchestration().await?;
        Json::decode::<Out>(&raw)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some((_, out)) = &this.resolved {
            return Poll::Ready(out.clone());
        }
        let ctx = this.ctx.clone();
        let mut inner = ctx.lock();
        if this.ensure_scheduled(&mut inner).is_none() {
            return Poll::Pending;
        }
        match this.probe(&inner) {
            Some((completion_id, out)) => {
                this.commit(&mut inner, completion_id, out.clone());
                Poll::Ready(out)
            }
            None => Poll::Pending,
        }
    }
}

/// Race of two durable futures; see [`OrchestrationContext::select2`].
pub struct SelectFuture {
    ctx: OrchestrationContext,
    futures: Vec<DurableFuture>,
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ctx = this.ctx.clone();
        let mut inner = ctx.lock();
        for f in this.futures.iter_mut() {
            if f.ensure_scheduled(&mut inner).is_none() {
                return Poll::Pending;
            }
        }
        // Whichever completion landed in history first wins.
        let winner = this
            .futures
            .iter()
            .enumerate()
            .filter_map(|(idx, f)| f.probe(&inner).map(|(cid, out)| (idx, cid, out)))
            .min_by_key(|(_, cid, _)| *cid);
        let Some((idx, completion_id, out)) = winner else {
            return Poll::Pending;
        };
        this.futures[idx].commit(&mut inner, completion_id, out.clone());
        for (i, f) in this.futures.iter().enumerate() {
            if i != idx {
                f.cancel(&mut inner);
            }
        }
        Poll::Ready((idx, out))
    }
}

/// Resolves when every future has resolved; see [`OrchestrationContext::join`].
pub struct JoinFuture {
    ctx: OrchestrationContext,
    futures: Vec<DurableFuture>,
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ctx = this.ctx.clone();
        let mut inner = ctx.lock();
        for f in this.futures.iter_mut() {
            if f.ensure_scheduled(&mut inner).is_none() {
                return Poll::Pending;
            }
        }
        for f in this.futures.iter_mut() {
            if f.resolved.is_none()
                && let Some((completion_id, out)) = f.probe(&inner)
            {
                f.commit(&mut inner, completion_id, out);
            }
        }
        if this.futures.iter().all(|f| f.resolved.is_some()) {
            let outputs = this
                .futures
                .iter()
                .filter_map(|f| f.resolved.as_ref().map(|(_, out)| out.clone()))
                .collect();
            Poll::Ready(outputs)
        } else {
            Poll::Pending
        }
    }
}

/// Aggregate failure of [`OrchestrationContext::wait_all`]: at least one
/// position failed. Every position's outcome is kept, in input order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{failed} of {total} tasks failed", failed = .results.iter().filter(|r| r.is_err()).count(), total = .results.len())]
pub struct CompositeFailure {
    pub results: Vec<Result<String, String>>,
}

impl CompositeFailure {
    /// `(position, error)` for each failed task.
    pub fn failures(&self) -> Vec<(usize, String)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e.clone())))
            .collect()
    }

    /// `(position, output)` for each successful task.
    pub fn successes(&self) -> Vec<(usize, String)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().ok().map(|v| (i, v.clone())))
            .collect()
    }
}

impl OrchestrationContext {
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_attempt(name.into(), input.into(), 1)
    }

    /// # Panics
    /// If `input` cannot be serialized.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let name = name.into();
        let payload = Json::encode(input).unwrap_or_else(|e| panic!("failed to encode input for activity '{name}': {e}"));
        self.schedule_activity(name, payload)
    }

    pub(crate) fn schedule_activity_attempt(&self, name: String, input: String, attempt: u32) -> DurableFuture {
        DurableFuture::new(self.clone(), Kind::Activity { name, input, attempt })
    }

    /// Run an activity under `policy`. Failed attempts are retried after the
    /// policy's backoff through durable timers; only the final outcome is returned.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<String, String> {
        let name = name.into();
        let input = input.into();
        let mut attempt = 1u32;
        loop {
            let call = self.schedule_activity_attempt(name.clone(), input.clone(), attempt);
            let outcome = match policy.timeout {
                Some(timeout) => {
                    let timer = self.schedule_timer(timeout);
                    match self.select2(call, timer).await {
                        (0, out) => out.into_result(),
                        _ => Err(format!("activity '{name}' attempt {attempt} timed out after {timeout:?}")),
                    }
                }
                None => call.into_activity().await,
            };
            let error = match outcome {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };
            match policy.next_retry_delay(attempt) {
                None => {
                    self.trace_warn(format!(
                        "activity '{name}' failed on attempt {attempt} of {}, giving up: {error}",
                        policy.max_attempts
                    ));
                    return Err(error);
                }
                Some(delay) => {
                    self.trace_info(format!(
                        "activity '{name}' failed on attempt {attempt}, retrying in {delay:?}: {error}"
                    ));
                    if !delay.is_zero() {
                        self.schedule_timer(delay).into_timer().await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    pub async fn schedule_activity_with_retry_typed<In: Serialize, Out: DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
        policy: RetryPolicy,
    ) -> Result<Out, String> {
        let payload = Json::encode(input)?;
        let raw = self.schedule_activity_with_retry(name, payload, policy).await?;
        Json::decode::<Out>(&raw)
    }

    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::new(self.clone(), Kind::Timer { delay })
    }

    /// Wait for an external event raised by name. Events raised before the
    /// wait are queued and delivered in arrival order.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::new(self.clone(), Kind::External { name: name.into() })
    }

    /// Wait for an external event, giving up after `timeout`. An event that
    /// lands after the timer fired stays queued for the next wait.
    pub async fn schedule_wait_with_timeout(&self, name: impl Into<String>, timeout: Duration) -> Result<String, WaitError> {
        let name = name.into();
        let wait = self.schedule_wait(name.clone());
        let timer = self.schedule_timer(timeout);
        match self.select2(wait, timer).await {
            (0, DurableOutput::External(data)) => Ok(data),
            _ => Err(WaitError::Timeout { name, timeout }),
        }
    }

    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::SubOrch {
                name: name.into(),
                version: None,
                input: input.into(),
            },
        )
    }

    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::SubOrch {
                name: name.into(),
                version: Some(version.into()),
                input: input.into(),
            },
        )
    }

    /// # Panics
    /// If `input` cannot be serialized.
    pub fn schedule_sub_orchestration_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let name = name.into();
        let payload =
            Json::encode(input).unwrap_or_else(|e| panic!("failed to encode input for sub-orchestration '{name}': {e}"));
        self.schedule_sub_orchestration(name, payload)
    }

    /// Race two futures. Resolves with the index and output of the one whose
    /// completion is earliest in history; the loser is cancelled and any
    /// completion it later receives is ignored.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture {
            ctx: self.clone(),
            futures: vec![a, b],
        }
    }

    /// Resolve all futures; outputs are in input order regardless of completion order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture {
            ctx: self.clone(),
            futures,
        }
    }

    /// Join and collect results. Fails with every per-position outcome when any
    /// task failed; siblings always run to completion.
    pub async fn wait_all(&self, futures: Vec<DurableFuture>) -> Result<Vec<String>, CompositeFailure> {
        let results: Vec<Result<String, String>> = self
            .join(futures)
            .await
            .into_iter()
            .map(DurableOutput::into_result)
            .collect();
        if results.iter().any(Result::is_err) {
            Err(CompositeFailure { results })
        } else {
            Ok(results.into_iter().flatten().collect())
        }
    }
}
