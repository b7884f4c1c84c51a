//! Error types shared across the dispatch pipeline.

use thiserror::Error;

use crate::campaign::CampaignStatus;
use crate::db::DbError;

/// Failures of campaign lifecycle operations.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("campaign {0} not found")]
    NotFound(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("cannot move campaign from {from} to {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<rusqlite::Error> for CampaignError {
    fn from(e: rusqlite::Error) -> Self {
        CampaignError::Database(DbError::Sqlite(e))
    }
}

impl CampaignError {
    /// Validation and schedule errors are caller mistakes and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CampaignError::InvalidSchedule(_) | CampaignError::Validation(_)
        )
    }
}

/// The warmup cap does not leave room for the requested sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("daily quota exceeded: limit {limit}, remaining {remaining}")]
pub struct QuotaExceeded {
    pub limit: u32,
    pub remaining: u32,
}

/// Failures of the durable batch queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue job {0} not found")]
    NotFound(String),

    #[error("queue job {id} is {state}, expected {expected}")]
    WrongState {
        id: String,
        state: String,
        expected: &'static str,
    },

    #[error("queue payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Database(DbError::Sqlite(e))
    }
}
