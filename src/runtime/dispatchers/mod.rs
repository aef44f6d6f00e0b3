//! Dispatcher loops for Runtime
//!
//! - `orchestration`: fetches instance batches and runs orchestration turns
//! - `worker`: executes activities
//!
//! The timer dispatcher lives in `runtime::timers`.

mod orchestration;
mod worker;
