//! Reference payment saga built on the orchestration primitives.
//!
//! `PaymentSaga` waits for a start signal, runs a first step with retries,
//! fans out one `ChildPayment` sub-orchestration per payment item, then waits
//! for a continuation signal, running a retry step on every timeout and a
//! compensation step once the waits are exhausted.

pub mod activities;
pub mod model;
pub mod payment;
pub mod tracker;

pub use activities::register_activities;
pub use model::{PaymentItem, PaymentRequest};
pub use payment::{
    CHILD_PAYMENT, CONTINUE_EVENT, PAYMENT_SAGA, PaymentSagaConfig, SagaState, START_EVENT, StartTimeoutPolicy,
    register_orchestrations,
};
pub use tracker::ActivityTracker;
