//! Replay-safe logging macros for orchestration code.
//!
//! Each macro emits only on the poll that first executes the statement, never
//! while the orchestration is replaying recorded history.
//!
//! ```ignore
//! sagaflow::durable_info!(ctx, item = %name, "charging");
//! ```

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(target: "sagaflow::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(target: "sagaflow::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(target: "sagaflow::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}
