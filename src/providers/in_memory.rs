use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use super::{OrchestrationItem, Provider, ProviderError, TurnWork, WorkItem};
use crate::Event;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Queued {
    item: WorkItem,
    visible_at: Instant,
}

#[derive(Debug)]
struct InstanceLock {
    instance: String,
    messages: Vec<WorkItem>,
    locked_until: Instant,
}

#[derive(Debug)]
struct ItemLock {
    item: WorkItem,
    locked_until: Instant,
}

#[derive(Default)]
struct State {
    // instance -> executions (execution_id starts at 1)
    instances: HashMap<String, Vec<Vec<Event>>>,
    orchestrator_q: VecDeque<Queued>,
    worker_q: VecDeque<Queued>,
    timer_q: VecDeque<Queued>,
    // Peek-lock state per queue: token -> locked messages.
    instance_locks: HashMap<String, InstanceLock>,
    worker_locks: HashMap<String, ItemLock>,
    timer_locks: HashMap<String, ItemLock>,
    next_token: u64,
}

impl State {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}-{}", self.next_token)
    }

    /// Return expired locks' messages to the front of their queues.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .instance_locks
            .iter()
            .filter(|(_, l)| l.locked_until <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(lock) = self.instance_locks.remove(&token) {
                debug!(instance = %lock.instance, token = %token, "orchestration lock expired");
                for item in lock.messages.into_iter().rev() {
                    self.orchestrator_q.push_front(Queued { item, visible_at: now });
                }
            }
        }
        reclaim_items(&mut self.worker_locks, &mut self.worker_q, now);
        reclaim_items(&mut self.timer_locks, &mut self.timer_q, now);
    }

    fn is_locked(&self, instance: &str) -> bool {
        self.instance_locks.values().any(|l| l.instance == instance)
    }
}

fn reclaim_items(locks: &mut HashMap<String, ItemLock>, queue: &mut VecDeque<Queued>, now: Instant) {
    let expired: Vec<String> = locks
        .iter()
        .filter(|(_, l)| l.locked_until <= now)
        .map(|(t, _)| t.clone())
        .collect();
    for token in expired {
        if let Some(lock) = locks.remove(&token) {
            debug!(token = %token, "work item lock expired");
            queue.push_front(Queued {
                item: lock.item,
                visible_at: now,
            });
        }
    }
}

fn pop_visible(queue: &mut VecDeque<Queued>, now: Instant) -> Option<WorkItem> {
    let pos = queue.iter().position(|q| q.visible_at <= now)?;
    queue.remove(pos).map(|q| q.item)
}

/// In-process provider. State lives as long as the value; share it between
/// runtimes through an `Arc` to simulate a restart.
pub struct InMemoryProvider {
    state: Mutex<State>,
    lock_timeout: Duration,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Locks not acked within `lock_timeout` are released and their work redelivered.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            lock_timeout,
        }
    }

    /// Pretty-printed dump of every instance (test utility).
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.state.lock().await;
        let mut out = String::new();
        for (inst, execs) in g.instances.iter() {
            out.push_str(&format!("instance={inst}\n"));
            for (i, events) in execs.iter().enumerate() {
                out.push_str(&format!("  execution={}\n", i + 1));
                for e in events {
                    out.push_str(&format!("    {e:?}\n"));
                }
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn create_instance(&self, instance: &str, start: WorkItem) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.instances.contains_key(instance) {
            return Err(ProviderError::already_exists("create_instance", instance));
        }
        g.instances.insert(instance.to_string(), Vec::new());
        g.orchestrator_q.push_back(Queued {
            item: start,
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn instance_exists(&self, instance: &str) -> Result<bool, ProviderError> {
        Ok(self.state.lock().await.instances.contains_key(instance))
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances
            .get(instance)
            .and_then(|execs| execs.last().cloned())
            .unwrap_or_default())
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        let execs = g
            .instances
            .get(instance)
            .ok_or_else(|| ProviderError::not_found("read_execution", instance))?;
        execution_id
            .checked_sub(1)
            .and_then(|idx| execs.get(idx as usize))
            .cloned()
            .ok_or_else(|| ProviderError::permanent("read_execution", format!("no execution {execution_id} for {instance}")))
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances
            .get(instance)
            .and_then(|execs| if execs.is_empty() { None } else { Some(execs.len() as u64) }))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let g = self.state.lock().await;
        let mut ids: Vec<String> = g.instances.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.instances.remove(instance).is_none() {
            return Err(ProviderError::not_found("purge_instance", instance));
        }
        g.orchestrator_q.retain(|q| q.item.instance() != instance);
        Ok(())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        g.orchestrator_q.push_back(Queued {
            item,
            visible_at: Instant::now() + delay.unwrap_or_default(),
        });
        Ok(())
    }

    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut g = self.state.lock().await;
        let now = Instant::now();
        g.reclaim_expired(now);

        let Some(instance) = g
            .orchestrator_q
            .iter()
            .find(|q| q.visible_at <= now && !g.is_locked(q.item.instance()))
            .map(|q| q.item.instance().to_string())
        else {
            return Ok(None);
        };

        let mut messages = Vec::new();
        let mut rest = VecDeque::with_capacity(g.orchestrator_q.len());
        for q in g.orchestrator_q.drain(..) {
            if q.visible_at <= now && q.item.instance() == instance {
                messages.push(q.item);
            } else {
                rest.push_back(q);
            }
        }
        g.orchestrator_q = rest;

        let (execution_id, history) = match g.instances.get(&instance) {
            Some(execs) if !execs.is_empty() => (execs.len() as u64, execs.last().cloned().unwrap_or_default()),
            _ => (1, Vec::new()),
        };
        let lock_token = g.token("orch");
        g.instance_locks.insert(
            lock_token.clone(),
            InstanceLock {
                instance: instance.clone(),
                messages: messages.clone(),
                locked_until: now + self.lock_timeout,
            },
        );
        Ok(Some(OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        work: TurnWork,
    ) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let instance = match g.instance_locks.get(lock_token) {
            Some(lock) => lock.instance.clone(),
            None => {
                return Err(ProviderError::permanent(
                    "ack_orchestration_item",
                    format!("invalid or expired lock token {lock_token}"),
                ));
            }
        };
        if execution_id == 0 {
            return Err(ProviderError::permanent("ack_orchestration_item", "execution ids start at 1"));
        }

        // Validate before mutating so a rejected ack leaves no trace.
        let execs = g.instances.get(&instance).map(Vec::as_slice).unwrap_or_default();
        let current_len = execs.len() as u64;
        if execution_id > current_len + 1 || (execution_id < current_len && !history_delta.is_empty()) {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                format!("execution {execution_id} is not the latest for {instance}"),
            ));
        }
        let last_id = if execution_id <= current_len {
            execs
                .get(execution_id as usize - 1)
                .and_then(|h| h.last())
                .map(|e| e.event_id)
                .unwrap_or(0)
        } else {
            0
        };
        for (offset, e) in history_delta.iter().enumerate() {
            if e.event_id != last_id + 1 + offset as u64 {
                return Err(ProviderError::permanent(
                    "ack_orchestration_item",
                    format!("non-contiguous event id {} for {instance}", e.event_id),
                ));
            }
        }

        g.instance_locks.remove(lock_token);
        if !history_delta.is_empty() {
            // Children are created by their first turn rather than by a client call.
            let execs = g.instances.entry(instance.clone()).or_default();
            if execution_id as usize > execs.len() {
                execs.push(Vec::new());
            }
            if let Some(history) = execs.get_mut(execution_id as usize - 1) {
                history.extend(history_delta);
            }
        }

        let now = Instant::now();
        g.worker_q
            .extend(work.worker_items.into_iter().map(|item| Queued { item, visible_at: now }));
        g.timer_q
            .extend(work.timer_items.into_iter().map(|item| Queued { item, visible_at: now }));
        g.orchestrator_q
            .extend(work.orchestrator_items.into_iter().map(|item| Queued { item, visible_at: now }));
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let Some(lock) = g.instance_locks.remove(lock_token) else {
            return Err(ProviderError::permanent(
                "abandon_orchestration_item",
                format!("invalid or expired lock token {lock_token}"),
            ));
        };
        let visible_at = Instant::now() + delay.unwrap_or_default();
        for item in lock.messages.into_iter().rev() {
            g.orchestrator_q.push_front(Queued { item, visible_at });
        }
        Ok(())
    }

    async fn fetch_work_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut g = self.state.lock().await;
        let now = Instant::now();
        g.reclaim_expired(now);
        let Some(item) = pop_visible(&mut g.worker_q, now) else {
            return Ok(None);
        };
        let token = g.token("work");
        g.worker_locks.insert(
            token.clone(),
            ItemLock {
                item: item.clone(),
                locked_until: now + self.lock_timeout,
            },
        );
        Ok(Some((item, token)))
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.worker_locks.remove(token).is_none() {
            return Err(ProviderError::permanent(
                "ack_work_item",
                format!("invalid or expired lock token {token}"),
            ));
        }
        g.orchestrator_q.push_back(Queued {
            item: completion,
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn abandon_work_item(&self, token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let Some(lock) = g.worker_locks.remove(token) else {
            return Err(ProviderError::permanent(
                "abandon_work_item",
                format!("invalid or expired lock token {token}"),
            ));
        };
        g.worker_q.push_front(Queued {
            item: lock.item,
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn fetch_timer_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut g = self.state.lock().await;
        let now = Instant::now();
        g.reclaim_expired(now);
        let Some(item) = pop_visible(&mut g.timer_q, now) else {
            return Ok(None);
        };
        let token = g.token("timer");
        g.timer_locks.insert(
            token.clone(),
            ItemLock {
                item: item.clone(),
                locked_until: now + self.lock_timeout,
            },
        );
        Ok(Some((item, token)))
    }

    async fn ack_timer_item(&self, token: &str, fired: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.timer_locks.remove(token).is_none() {
            return Err(ProviderError::permanent(
                "ack_timer_item",
                format!("invalid or expired lock token {token}"),
            ));
        }
        g.orchestrator_q.push_back(Queued {
            item: fired,
            visible_at: Instant::now() + delay.unwrap_or_default(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, providers::ProviderErrorKind};

    fn start(instance: &str) -> WorkItem {
        WorkItem::StartOrchestration {
            instance: instance.into(),
            orchestration: "Orch".into(),
            input: "{}".into(),
            version: None,
            parent: None,
        }
    }

    fn raised(instance: &str, data: &str) -> WorkItem {
        WorkItem::ExternalRaised {
            instance: instance.into(),
            name: "Go".into(),
            data: data.into(),
        }
    }

    fn started_event(instance: &str) -> Event {
        Event::with_event_id(
            1,
            instance,
            1,
            None,
            EventKind::OrchestrationStarted {
                name: "Orch".into(),
                version: "1.0.0".into(),
                input: "{}".into(),
                parent: None,
            },
        )
    }

    #[tokio::test]
    async fn duplicate_instance_rejected() {
        let p = InMemoryProvider::new();
        p.create_instance("a", start("a")).await.unwrap();
        let err = p.create_instance("a", start("a")).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn batch_holds_all_messages_for_instance_in_order() {
        let p = InMemoryProvider::new();
        p.create_instance("a", start("a")).await.unwrap();
        p.enqueue_orchestrator_work(raised("b", "other"), None).await.unwrap();
        p.enqueue_orchestrator_work(raised("a", "x"), None).await.unwrap();

        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(item.instance, "a");
        assert_eq!(item.messages, vec![start("a"), raised("a", "x")]);

        // "a" is locked; only "b" is available now.
        let other = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(other.instance, "b");
        assert!(p.fetch_orchestration_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_appends_history_and_enqueues_work() {
        let p = InMemoryProvider::new();
        p.create_instance("a", start("a")).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        let work = TurnWork {
            worker_items: vec![WorkItem::ActivityExecute {
                instance: "a".into(),
                execution_id: 1,
                id: 2,
                name: "Act".into(),
                input: "i".into(),
                attempt: 1,
            }],
            ..Default::default()
        };
        p.ack_orchestration_item(&item.lock_token, 1, vec![started_event("a")], work)
            .await
            .unwrap();
        assert_eq!(p.read("a").await.unwrap().len(), 1);
        assert_eq!(p.latest_execution_id("a").await.unwrap(), Some(1));
        assert!(p.fetch_work_item().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn non_contiguous_append_rejected() {
        let p = InMemoryProvider::new();
        p.create_instance("a", start("a")).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        let mut e = started_event("a");
        e.set_event_id(5);
        let err = p
            .ack_orchestration_item(&item.lock_token, 1, vec![e], TurnWork::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(p.read("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_locks_are_redelivered() {
        let p = InMemoryProvider::with_lock_timeout(Duration::from_millis(20));
        p.create_instance("a", start("a")).await.unwrap();
        let first = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert!(p.fetch_orchestration_item().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(again.messages, first.messages);
        assert!(p.ack_orchestration_item(&first.lock_token, 1, vec![], TurnWork::default()).await.is_err());
    }

    #[tokio::test]
    async fn delayed_messages_stay_invisible() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(raised("a", "later"), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(p.fetch_orchestration_item().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(p.fetch_orchestration_item().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_removes_instance_and_queued_messages() {
        let p = InMemoryProvider::new();
        p.create_instance("a", start("a")).await.unwrap();
        p.purge_instance("a").await.unwrap();
        assert!(!p.instance_exists("a").await.unwrap());
        assert!(p.fetch_orchestration_item().await.unwrap().is_none());
    }
}
