//! In-process runtime: dispatchers that drive orchestrations, activities and
//! timers against a [`Provider`].
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::{Provider, ProviderError};
use crate::{ActivityContext, ErrorDetails, OrchestrationContext};

mod dispatchers;
pub mod execution;
pub mod registry;
pub mod replay_engine;
mod state_helpers;
mod timers;

pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy,
};
pub use replay_engine::{ReplayEngine, TurnResult};
pub use state_helpers::{HistoryManager, StartInfo, WorkItemReader};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// How long a dispatcher sleeps when its queue is empty.
    /// Default: 10ms
    pub dispatcher_idle_sleep: Duration,
    /// Orchestration turns processed concurrently (different instances only).
    pub orchestration_concurrency: usize,
    /// Activities executed concurrently.
    pub worker_concurrency: usize,
    /// Retries for a provider operation that failed with a retryable error.
    pub provider_retry_attempts: u32,
    /// Visibility delay for a batch abandoned after its ack kept failing.
    pub abandon_delay: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            orchestration_concurrency: 2,
            worker_concurrency: 2,
            provider_retry_attempts: 5,
            abandon_delay: Duration::from_millis(50),
        }
    }
}

/// Status of an instance, derived from the history of its latest execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Created, first turn not processed yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
    /// The latest execution ended with continue-as-new and its successor has not started yet.
    ContinuedAsNew,
}

impl OrchestrationStatus {
    /// Completed, failed or terminated. `ContinuedAsNew` is not terminal: the instance keeps going.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// In-process runtime that executes orchestrations, activities and timers and
/// persists history via a `Provider`.
///
/// Several runtimes may share one provider; the provider's instance locks keep
/// each instance on a single turn at a time.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    runtime_id: String,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a runtime, spawning the orchestration, worker and timer dispatchers.
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Best-effort: the host may already have installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime_id = format!("{:04x}", NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed));
        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
        });

        let mut handles = Vec::new();
        handles.extend(runtime.clone().start_orchestration_dispatcher());
        handles.extend(runtime.clone().start_work_dispatcher());
        handles.push(runtime.clone().start_timer_dispatcher());
        runtime.joins.lock().await.extend(handles);

        debug!(
            target: "sagaflow::runtime",
            runtime_id = %runtime.runtime_id,
            orchestrations = ?runtime.orchestration_registry.list_names(),
            activities = ?runtime.activity_registry.list_names(),
            "runtime started"
        );
        runtime
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.history_store)
    }

    pub fn orchestration_registry(&self) -> &OrchestrationRegistry {
        &self.orchestration_registry
    }

    /// Stop the dispatchers. Loops get `timeout_ms` (default 1000) to notice the
    /// shutdown flag; anything still running after that is aborted. In-flight
    /// work that was not acked is redelivered once its provider lock expires.
    pub async fn shutdown(self: Arc<Self>, timeout_ms: Option<u64>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms.unwrap_or(1000));
        let mut joins = self.joins.lock().await;
        for mut handle in joins.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        debug!(target: "sagaflow::runtime", runtime_id = %self.runtime_id, "runtime stopped");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    async fn idle(&self) {
        tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
    }

    /// Run a provider operation, retrying retryable failures with exponential backoff.
    async fn execute_with_retry<F, R>(&self, operation_tag: &str, operation: F) -> Result<(), ProviderError>
    where
        F: Fn() -> R,
        R: std::future::Future<Output = Result<(), ProviderError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            match operation().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < self.options.provider_retry_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts.min(10));
                    warn!(
                        target: "sagaflow::runtime",
                        attempts,
                        backoff_ms,
                        error = %e,
                        "{operation_tag} failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(target: "sagaflow::runtime", attempts, error = %e, "{operation_tag} failed");
                    return Err(e);
                }
            }
        }
    }
}
