//! Queue job and notification types.
//!
//! Jobs live in the `queue_jobs` table; RabbitMQ only carries a small
//! [`BatchReady`] wake-up so workers need not poll aggressively.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::contacts::Recipient;
use crate::send::MessageTemplate;

/// RabbitMQ queue announcing newly enqueued batches.
pub const BATCH_QUEUE: &str = "campaign_batches";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    /// Waiting for its `run_at` after a failed attempt or a pause.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Everything a worker needs to send one batch, snapshotted at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub campaign_id: String,
    pub owner_id: String,
    pub batch_number: u32,
    pub total_batches: u32,
    pub template: MessageTemplate,
    pub recipients: Vec<Recipient>,
}

/// Live counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub sent: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
}

impl JobProgress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn processed(&self) -> u32 {
        self.sent + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueJob {
    pub id: String,
    pub payload: JobPayload,
    pub state: JobState,
    /// Attempts started so far, including the current one while active.
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: u32,
    pub run_at: DateTime<Utc>,
    pub progress: Option<JobProgress>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    pub fn campaign_id(&self) -> &str {
        &self.payload.campaign_id
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Per-batch status row served by the progress endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatus {
    pub job_id: String,
    pub batch_number: u32,
    pub total_batches: u32,
    pub state: JobState,
    pub attempts: u32,
    pub progress: Option<JobProgress>,
    pub last_error: Option<String>,
}

/// Wake-up message published after a campaign's batches are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReady {
    pub campaign_id: String,
    pub owner_id: String,
    pub job_ids: Vec<String>,
}

/// Attempt ceiling and exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.job_max_attempts,
            backoff_base: Duration::from_millis(config.job_backoff_base_ms),
        }
    }

    /// Delay before the attempt following `attempts_made` failures: 5s, 10s, 20s, ...
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1 << exponent)
    }
}

/// What `fail` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { run_at: DateTime<Utc>, attempt: u32 },
    Exhausted,
}

/// Retention windows applied by `prune`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed_age: Duration,
    pub completed_count: u32,
    pub failed_age: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(3600),
            completed_count: 1000,
            failed_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
    }

    #[test]
    fn test_job_state_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("stalled".parse::<JobState>().is_err());
    }

    #[test]
    fn test_batch_ready_json() {
        let msg = BatchReady {
            campaign_id: "c1".into(),
            owner_id: "o1".into(),
            job_ids: vec!["c1-1-1".into()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(serde_json::from_str::<BatchReady>(&json).unwrap(), msg);
    }
}
