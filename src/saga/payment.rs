use std::sync::Arc;
use std::time::Duration;

use crate::_typed_codec::{Codec, Json};
use crate::runtime::OrchestrationRegistryBuilder;
use crate::{OrchestrationContext, RetryPolicy, durable_info, durable_warn};

use super::activities::{
    COMPENSATION_ACTIVITY, FIRST_ACTIVITY, FIRST_CHILD_ACTIVITY, NEXT_ACTIVITY, RETRY_ACTIVITY, SECOND_CHILD_ACTIVITY,
};
use super::model::{PaymentItem, PaymentRequest};
use super::tracker::ActivityTracker;

pub const PAYMENT_SAGA: &str = "PaymentSaga";
pub const CHILD_PAYMENT: &str = "ChildPayment";
pub const START_EVENT: &str = "START-EVENT";
pub const CONTINUE_EVENT: &str = "CONTINUE-EVENT";

/// What the saga does when the start signal does not arrive in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTimeoutPolicy {
    /// Log and run the saga anyway.
    Proceed,
    /// Fail the instance.
    Fail,
}

#[derive(Debug, Clone)]
pub struct PaymentSagaConfig {
    /// `None` waits for the start signal indefinitely.
    pub start_timeout: Option<Duration>,
    pub start_timeout_policy: StartTimeoutPolicy,
    /// Bound on each wait for the continuation signal.
    pub continue_timeout: Duration,
    pub max_continue_iterations: u32,
    /// Policy for `FirstActivity`; `None` runs it once.
    pub first_activity_retry: Option<RetryPolicy>,
    /// Policy for `FirstChildActivity`; `None` runs it once.
    pub child_activity_retry: Option<RetryPolicy>,
}

impl Default for PaymentSagaConfig {
    fn default() -> Self {
        let retry = RetryPolicy::new(3)
            .with_first_retry_interval(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(5));
        Self {
            start_timeout: Some(Duration::from_secs(120)),
            start_timeout_policy: StartTimeoutPolicy::Proceed,
            continue_timeout: Duration::from_secs(2),
            max_continue_iterations: 10,
            first_activity_retry: Some(retry.clone()),
            child_activity_retry: Some(retry),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    AwaitingStart,
    RunningStep1,
    FanningOut,
    AwaitingContinuation,
    Compensating,
    Advancing,
    Completed,
}

/// Register `PaymentSaga` and `ChildPayment`.
pub fn register_orchestrations(
    builder: OrchestrationRegistryBuilder,
    config: PaymentSagaConfig,
    tracker: ActivityTracker,
) -> OrchestrationRegistryBuilder {
    let config = Arc::new(config);
    let child_config = Arc::clone(&config);
    builder
        .register_typed(PAYMENT_SAGA, move |ctx: OrchestrationContext, request: PaymentRequest| {
            let config = Arc::clone(&config);
            let tracker = tracker.clone();
            async move { payment_saga(ctx, request, &config, &tracker).await }
        })
        .register_typed(CHILD_PAYMENT, move |ctx: OrchestrationContext, item: PaymentItem| {
            let config = Arc::clone(&child_config);
            async move { child_payment(ctx, item, &config).await }
        })
}

async fn call_step(
    ctx: &OrchestrationContext,
    name: &str,
    request: &PaymentRequest,
    retry: Option<&RetryPolicy>,
) -> Result<PaymentRequest, String> {
    match retry {
        Some(policy) => {
            ctx.schedule_activity_with_retry_typed(name, request, policy.clone())
                .await
        }
        None => ctx.schedule_activity_typed(name, request).into_activity_typed().await,
    }
}

pub async fn payment_saga(
    ctx: OrchestrationContext,
    mut request: PaymentRequest,
    config: &PaymentSagaConfig,
    tracker: &ActivityTracker,
) -> Result<PaymentRequest, String> {
    request.workflow_instance_id = Some(ctx.instance_id());
    durable_info!(ctx, payment_id = %request.id, "payment saga started");

    let mut state = SagaState::AwaitingStart;
    let mut continuation: Option<String> = None;
    loop {
        state = match state {
            SagaState::AwaitingStart => {
                match config.start_timeout {
                    Some(timeout) => {
                        if let Err(e) = ctx.schedule_wait_with_timeout(START_EVENT, timeout).await {
                            match config.start_timeout_policy {
                                StartTimeoutPolicy::Proceed => {
                                    durable_warn!(ctx, payment_id = %request.id, "{e}; proceeding without start signal")
                                }
                                StartTimeoutPolicy::Fail => return Err(e.to_string()),
                            }
                        }
                    }
                    None => {
                        ctx.schedule_wait(START_EVENT).into_event().await;
                    }
                }
                SagaState::RunningStep1
            }
            SagaState::RunningStep1 => {
                request = call_step(&ctx, FIRST_ACTIVITY, &request, config.first_activity_retry.as_ref()).await?;
                SagaState::FanningOut
            }
            SagaState::FanningOut => {
                fan_out(&ctx, &mut request).await;
                SagaState::AwaitingContinuation
            }
            SagaState::AwaitingContinuation => {
                for iteration in 0..config.max_continue_iterations {
                    match ctx
                        .schedule_wait_with_timeout(CONTINUE_EVENT, config.continue_timeout)
                        .await
                    {
                        Ok(data) => {
                            durable_info!(ctx, iteration, "continuation received");
                            continuation = Some(data);
                            break;
                        }
                        Err(_) => {
                            if !ctx.is_replaying() {
                                tracker.increment_retry_counter();
                            }
                            durable_info!(ctx, iteration, "continuation wait timed out; running retry step");
                            request = call_step(&ctx, RETRY_ACTIVITY, &request, None).await?;
                        }
                    }
                }
                if continuation.is_some() {
                    SagaState::Advancing
                } else {
                    SagaState::Compensating
                }
            }
            SagaState::Compensating => {
                durable_info!(ctx, payment_id = %request.id, "continuation waits exhausted; compensating");
                request = call_step(&ctx, COMPENSATION_ACTIVITY, &request, None).await?;
                SagaState::Completed
            }
            SagaState::Advancing => {
                request = call_step(&ctx, NEXT_ACTIVITY, &request, None).await?;
                SagaState::Completed
            }
            SagaState::Completed => {
                durable_info!(ctx, payment_id = %request.id, "payment saga completed");
                return Ok(request);
            }
        };
    }
}

/// One `ChildPayment` per item. Successful results replace their items;
/// failed positions keep their input item and the error is recorded.
async fn fan_out(ctx: &OrchestrationContext, request: &mut PaymentRequest) {
    let children = request
        .payment_items
        .iter()
        .map(|item| ctx.schedule_sub_orchestration_typed(CHILD_PAYMENT, item))
        .collect();
    let results = match ctx.wait_all(children).await {
        Ok(outputs) => outputs.into_iter().map(Ok).collect::<Vec<_>>(),
        Err(failure) => {
            durable_warn!(ctx, failed = ?failure.failures(), "{failure}; continuing with successful children");
            failure.results
        }
    };
    for (item, result) in request.payment_items.iter_mut().zip(results) {
        match result.and_then(|raw| Json::decode::<PaymentItem>(&raw)) {
            Ok(updated) => *item = updated,
            Err(e) => request.child_failures.push(format!("{}: {e}", item.item_name)),
        }
    }
}

pub async fn child_payment(
    ctx: OrchestrationContext,
    item: PaymentItem,
    config: &PaymentSagaConfig,
) -> Result<PaymentItem, String> {
    let item: PaymentItem = match &config.child_activity_retry {
        Some(policy) => {
            ctx.schedule_activity_with_retry_typed(FIRST_CHILD_ACTIVITY, &item, policy.clone())
                .await?
        }
        None => {
            ctx.schedule_activity_typed(FIRST_CHILD_ACTIVITY, &item)
                .into_activity_typed()
                .await?
        }
    };
    ctx.schedule_activity_typed(SECOND_CHILD_ACTIVITY, &item)
        .into_activity_typed()
        .await
}
