use thiserror::Error;

/// How the runtime should treat a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Transient (busy, timeout, lost connection). Safe to retry.
    Retryable,
    /// Will not succeed on retry (corrupt data, invalid lock token).
    Permanent,
    /// The instance id is already taken.
    AlreadyExists,
    /// The instance does not exist.
    NotFound,
}

/// Provider error with retry classification.
///
/// The runtime retries operations whose error `is_retryable()`; everything
/// else is logged and the work item is abandoned for redelivery.
///
/// ```rust,no_run
/// use sagaflow::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("ack_orchestration_item", "store is busy"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation}: {message}")]
pub struct ProviderError {
    /// Operation that failed, e.g. `ack_orchestration_item`.
    pub operation: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Retryable)
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Permanent)
    }

    pub fn already_exists(operation: impl Into<String>, instance: &str) -> Self {
        Self::new(
            operation,
            format!("instance already exists: {instance}"),
            ProviderErrorKind::AlreadyExists,
        )
    }

    pub fn not_found(operation: impl Into<String>, instance: &str) -> Self {
        Self::new(operation, format!("instance not found: {instance}"), ProviderErrorKind::NotFound)
    }

    fn new(operation: impl Into<String>, message: impl Into<String>, kind: ProviderErrorKind) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }

    /// History-recordable form of this error.
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ProviderError::retryable("fetch", "busy").is_retryable());
        assert!(!ProviderError::permanent("ack", "bad token").is_retryable());
        let dup = ProviderError::already_exists("create_instance", "order-1");
        assert_eq!(dup.kind, ProviderErrorKind::AlreadyExists);
        assert_eq!(dup.to_string(), "create_instance: instance already exists: order-1");
    }

    #[test]
    fn infrastructure_conversion_keeps_retry_flag() {
        match ProviderError::retryable("read", "timeout").to_infrastructure_error() {
            crate::ErrorDetails::Infrastructure { operation, retryable, .. } => {
                assert_eq!(operation, "read");
                assert!(retryable);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
