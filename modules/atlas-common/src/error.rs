use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtlasError {
    /// Bad input. Rejected before any mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Contention on {key}: gave up after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Upstream collaborator failed: {0}")]
    Collaborator(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AtlasError {
    /// Transient failures the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AtlasError::StoreUnavailable(_) | AtlasError::Contention { .. } | AtlasError::Timeout(_)
        )
    }
}
