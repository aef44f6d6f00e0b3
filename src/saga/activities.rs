//! Activities of the payment saga. Each records itself in the tracker and
//! passes its payload through, child activities tag the item name.
use crate::ActivityContext;
use crate::runtime::ActivityRegistryBuilder;

use super::model::{PaymentItem, PaymentRequest};
use super::tracker::ActivityTracker;

pub const FIRST_ACTIVITY: &str = "FirstActivity";
pub const RETRY_ACTIVITY: &str = "RetryActivity";
pub const COMPENSATION_ACTIVITY: &str = "CompensationActivity";
pub const NEXT_ACTIVITY: &str = "NextActivity";
pub const FIRST_CHILD_ACTIVITY: &str = "FirstChildActivity";
pub const SECOND_CHILD_ACTIVITY: &str = "SecondChildActivity";

/// Item name that makes `FirstChildActivity` fail on every attempt.
pub const FAILING_ITEM: &str = "test5";

/// Register every saga activity, each sharing `tracker`.
pub fn register_activities(builder: ActivityRegistryBuilder, tracker: &ActivityTracker) -> ActivityRegistryBuilder {
    let builder = [FIRST_ACTIVITY, RETRY_ACTIVITY, COMPENSATION_ACTIVITY, NEXT_ACTIVITY]
        .into_iter()
        .fold(builder, |builder, name| {
            let tracker = tracker.clone();
            builder.register_typed(name, move |ctx: ActivityContext, request: PaymentRequest| {
                let tracker = tracker.clone();
                async move {
                    ctx.trace_info(format!("executing {} for payment {}", ctx.activity_name(), request.id));
                    tracker.record_activity(ctx.activity_name());
                    Ok(request)
                }
            })
        });

    let first_child = tracker.clone();
    let second_child = tracker.clone();
    builder
        .register_typed(FIRST_CHILD_ACTIVITY, move |ctx: ActivityContext, mut item: PaymentItem| {
            let tracker = first_child.clone();
            async move {
                if item.item_name == FAILING_ITEM {
                    return Err(format!("Breaking because {FAILING_ITEM}"));
                }
                tracker.record_activity(ctx.activity_name());
                item.item_name.push_str("-1");
                ctx.trace_info(format!("first child activity: {}", item.item_name));
                Ok(item)
            }
        })
        .register_typed(SECOND_CHILD_ACTIVITY, move |ctx: ActivityContext, mut item: PaymentItem| {
            let tracker = second_child.clone();
            async move {
                tracker.record_activity(ctx.activity_name());
                item.item_name.push_str("-2");
                ctx.trace_info(format!("second child activity: {}", item.item_name));
                Ok(item)
            }
        })
}
