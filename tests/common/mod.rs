#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use sagaflow::providers::Provider;
use sagaflow::providers::in_memory::InMemoryProvider;
use sagaflow::{ActivityRegistry, Event, EventKind, OrchestrationRegistry, Runtime, RuntimeOptions};

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(2),
        abandon_delay: Duration::from_millis(10),
        ..RuntimeOptions::default()
    }
}

pub fn in_memory_store() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::new()) as Arc<dyn Provider>
}

pub async fn start_runtime(
    store: Arc<dyn Provider>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
) -> Arc<Runtime> {
    Runtime::start_with_options(store, Arc::new(activities), orchestrations, fast_options()).await
}

pub async fn wait_for_history<F>(store: Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until at least `count` subscriptions to `name` are recorded.
pub async fn wait_for_subscriptions(
    store: Arc<dyn Provider>,
    instance: &str,
    name: &str,
    count: usize,
    timeout_ms: u64,
) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .filter(|e| matches!(&e.kind, EventKind::ExternalSubscribed { name: n } if n == name))
                .count()
                >= count
        },
        timeout_ms,
    )
    .await
}

pub fn count_kind(hist: &[Event], pred: impl Fn(&EventKind) -> bool) -> usize {
    hist.iter().filter(|e| pred(&e.kind)).count()
}

pub fn assert_dense_ids(hist: &[Event]) {
    for (i, e) in hist.iter().enumerate() {
        assert_eq!(e.event_id, i as u64 + 1, "history ids not dense: {hist:#?}");
    }
}
