use std::time::Duration;

use thiserror::Error;

use crate::resilience::EndpointClass;

/// Failures surfaced by calendar provider calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider credentials expired")]
    AuthExpired,

    #[error("Provider resource not found: {0}")]
    NotFound(String),

    #[error("Sync cursor is no longer valid")]
    CursorInvalidated,

    #[error("Permanent provider error: {0}")]
    Permanent(String),

    #[error("Circuit open for {0:?} endpoints")]
    CircuitOpen(EndpointClass),
}

impl ProviderError {
    /// Worth another attempt after a backoff delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. } | ProviderError::Timeout(_)
        )
    }

    /// Failures that indicate the endpoint itself is unhealthy. Client-side
    /// outcomes like a missing event say nothing about provider health.
    pub fn counts_against_breaker(&self) -> bool {
        self.is_retryable()
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
