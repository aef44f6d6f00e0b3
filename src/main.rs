use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use sagaflow::providers::Provider;
use sagaflow::providers::in_memory::InMemoryProvider;
use sagaflow::saga::{
    self, ActivityTracker, CONTINUE_EVENT, PAYMENT_SAGA, PaymentRequest, PaymentSagaConfig, START_EVENT,
};
use sagaflow::{ActivityRegistry, Client, OrchestrationRegistry, OrchestrationStatus, RetryPolicy, Runtime};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Raise the continuation signal and let the saga advance.
    Continue,
    /// Never raise it; the saga compensates.
    Compensate,
}

/// Run the payment saga once against an in-memory store.
#[derive(Debug, Parser)]
#[command(name = "sagaflow-demo", version)]
struct Args {
    #[arg(long, value_enum, default_value = "continue")]
    scenario: Scenario,
    /// Payment item names; `test5` makes its child fail.
    #[arg(long, value_delimiter = ',', default_value = "test1,test2")]
    items: Vec<String>,
    /// Milliseconds to wait before raising the continuation signal.
    #[arg(long, default_value_t = 300)]
    continue_after: u64,
    /// Milliseconds per continuation wait.
    #[arg(long, default_value_t = 200)]
    continue_timeout: u64,
    #[arg(long, default_value_t = 3)]
    max_iterations: u32,
    #[arg(long, default_value = "demo-payment-1")]
    instance: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();

    let args = Args::parse();
    let retry = RetryPolicy::new(3)
        .with_first_retry_interval(Duration::from_millis(100))
        .with_timeout(Duration::from_secs(2));
    let config = PaymentSagaConfig {
        start_timeout: Some(Duration::from_secs(5)),
        continue_timeout: Duration::from_millis(args.continue_timeout),
        max_continue_iterations: args.max_iterations,
        first_activity_retry: Some(retry.clone()),
        child_activity_retry: Some(retry),
        ..PaymentSagaConfig::default()
    };

    let tracker = ActivityTracker::new();
    let activities = saga::register_activities(ActivityRegistry::builder(), &tracker).build();
    let orchestrations = saga::register_orchestrations(OrchestrationRegistry::builder(), config, tracker.clone()).build();

    let store = Arc::new(InMemoryProvider::new()) as Arc<dyn Provider>;
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store);

    let request = PaymentRequest::new("payment-1", "demo-customer", 100)
        .with_items(args.items.iter().cloned());
    client
        .start_orchestration_typed(&args.instance, PAYMENT_SAGA, &request)
        .await
        .context("starting payment saga")?;
    client.raise_event(&args.instance, START_EVENT, "go").await?;

    if let Scenario::Continue = args.scenario {
        tokio::time::sleep(Duration::from_millis(args.continue_after)).await;
        client.raise_event(&args.instance, CONTINUE_EVENT, "continue").await?;
    }

    let status = client
        .wait_for_orchestration(&args.instance, Duration::from_secs(60))
        .await?;
    rt.shutdown(None).await;

    match status {
        OrchestrationStatus::Completed { output } => {
            println!("{output}");
            println!("activities: {:?}", tracker.executed_activities());
            println!("continuation timeouts: {}", tracker.retry_count());
            Ok(())
        }
        other => bail!("payment saga did not complete: {other:?}"),
    }
}
