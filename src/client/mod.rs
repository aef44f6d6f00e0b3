use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::debug;

use crate::_typed_codec::{Codec, Json};
use crate::Event;
use crate::providers::{Provider, ProviderError, ProviderErrorKind, WorkItem};
use crate::runtime::{HistoryManager, OrchestrationStatus};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("timed out after {timeout:?} waiting for instance {instance}")]
    Timeout { instance: String, timeout: Duration },
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Thin client for control-plane operations.
///
/// Talks to the runtime exclusively through the shared provider, so it works
/// whether or not a runtime is running in this process.
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start an orchestration instance with string input. Instance ids are never reused.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start(instance, orchestration, None, input.into()).await
    }

    /// Start an orchestration instance pinned to a specific version.
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start(instance, orchestration, Some(version.into()), input.into())
            .await
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.start(instance, orchestration, None, payload).await
    }

    async fn start(
        &self,
        instance: &str,
        orchestration: &str,
        version: Option<String>,
        input: String,
    ) -> Result<(), ClientError> {
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input,
            version,
            parent: None,
        };
        match self.store.create_instance(instance, item).await {
            Ok(()) => {
                debug!(target: "sagaflow::client", instance_id = %instance, orchestration, "start requested");
                Ok(())
            }
            Err(e) if e.kind == ProviderErrorKind::AlreadyExists => {
                Err(ClientError::InstanceAlreadyExists(instance.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Raise an external event. Events are queued: one raised before anyone
    /// waits is delivered to the next wait for that name.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.ensure_exists(instance).await?;
        let item = WorkItem::ExternalRaised {
            instance: instance.to_string(),
            name: name.into(),
            data: data.into(),
        };
        self.store.enqueue_orchestrator_work(item, None).await?;
        Ok(())
    }

    /// Terminate a running instance without running any more orchestration
    /// code. Running children are terminated too.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.ensure_exists(instance).await?;
        let item = WorkItem::TerminateInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_orchestrator_work(item, None).await?;
        Ok(())
    }

    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        if !self.store.instance_exists(instance).await? {
            return Ok(OrchestrationStatus::NotFound);
        }
        let history = self.store.read(instance).await?;
        Ok(HistoryManager::from_history(&history).status())
    }

    /// Poll until the instance completes, fails or is terminated.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.get_orchestration_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    instance: instance.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Wait for completion and decode the output.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, ClientError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Json::decode(&output).map(Ok).map_err(ClientError::Codec),
            OrchestrationStatus::Failed { details } => Ok(Err(details.display_message())),
            OrchestrationStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            other => Ok(Err(format!("unexpected status {other:?}"))),
        }
    }

    /// History of the latest execution.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        self.ensure_exists(instance).await?;
        Ok(self.store.read(instance).await?)
    }

    pub async fn read_execution_history(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ClientError> {
        self.ensure_exists(instance).await?;
        Ok(self.store.read_execution(instance, execution_id).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    /// Remove an instance and all of its executions.
    pub async fn purge_instance(&self, instance: &str) -> Result<(), ClientError> {
        match self.store.purge_instance(instance).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind == ProviderErrorKind::NotFound => Err(ClientError::InstanceNotFound(instance.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_exists(&self, instance: &str) -> Result<(), ClientError> {
        if self.store.instance_exists(instance).await? {
            Ok(())
        } else {
            Err(ClientError::InstanceNotFound(instance.to_string()))
        }
    }
}
