//! Disjoint error taxonomy (spec §7).
//!
//! Callers match on variants, never on `.to_string()`. `Internal` is the
//! catch-all for uncategorized I/O failures and invariant breaches that
//! don't fit one of the named client/transient kinds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("product {product_id} not found")]
    ProductNotFound { product_id: i64 },

    #[error("product '{name}' already exists")]
    ProductAlreadyExists { name: String },

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: i64,
        requested: i64,
        available: i64,
    },

    #[error("failed to acquire lock for resource '{resource}' after retries")]
    LockAcquisitionFailure { resource: String },

    #[error("another product creation is already in progress for name '{name}'")]
    ConcurrentCreationInProgress { name: String },

    #[error("internal failure: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        CoreError::Internal(err.into())
    }

    /// True for kinds the client may retry with backoff (spec §7).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::LockAcquisitionFailure { .. } | CoreError::ConcurrentCreationInProgress { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
