use crate::job::TenantId;

/// Admission-time rejection. Nothing was queued and no sandbox was created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("queue is full ({capacity} jobs), retry later")]
    Backpressure { capacity: usize },

    #[error("tenant {tenant} already has {limit} active jobs")]
    QuotaExceeded { tenant: TenantId, limit: usize },

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    /// Whether the same submission may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::QuotaExceeded { .. })
    }
}

pub type SubmitResult<T> = Result<T, SubmitError>;
