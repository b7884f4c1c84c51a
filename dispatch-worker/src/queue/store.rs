//! Durable batch queue on top of the `queue_jobs` table.
//!
//! Delivery is at-least-once: a job is claimed (`active`), then completed,
//! failed with backoff, or deferred. A worker that dies mid-job leaves the row
//! `active`; [`JobQueue::recover_stale`] returns it to the ready set on the
//! next start.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use super::types::{
    BatchStatus, FailOutcome, JobPayload, JobProgress, JobState, QueueJob, Retention, RetryPolicy,
};
use crate::db::{from_millis, opt_from_millis, to_millis, Database, DbError};
use crate::error::QueueError;

const JOB_COLUMNS: &str = "id, payload, state, attempts, max_attempts, priority, run_at, \
                           progress, last_error, created_at, finished_at";

#[derive(Clone)]
pub struct JobQueue {
    db: Arc<Database>,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(db: Arc<Database>, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Store a campaign's batches atomically: either every batch is queued or
    /// none is. Ids are `{campaign}-{created_millis}-{batch}`.
    pub fn enqueue_batches(
        &self,
        payloads: &[JobPayload],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, QueueError> {
        let created = to_millis(now);
        let encoded = payloads
            .iter()
            .map(|p| Ok((p, serde_json::to_string(p)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        self.db.with_tx(|tx| {
            let mut ids = Vec::with_capacity(encoded.len());
            for (payload, body) in &encoded {
                let id = format!("{}-{created}-{}", payload.campaign_id, payload.batch_number);
                tx.execute(
                    "INSERT INTO queue_jobs (id, campaign_id, owner_id, payload, batch_number,
                        total_batches, priority, state, attempts, max_attempts, run_at,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5, 'waiting', 0, ?7, ?8, ?8, ?8)",
                    params![
                        id,
                        payload.campaign_id,
                        payload.owner_id,
                        body,
                        payload.batch_number,
                        payload.total_batches,
                        self.policy.max_attempts,
                        created
                    ],
                )?;
                ids.push(id);
            }
            Ok::<_, QueueError>(ids)
        })
    }

    /// Claim the next ready job, lowest priority first.
    ///
    /// Owners with a job already active are skipped so one tenant's batches
    /// never run concurrently.
    pub fn claim(&self, now: DateTime<Utc>) -> Result<Option<QueueJob>, QueueError> {
        let now_ms = to_millis(now);
        self.db.with_tx(|tx| {
            let next: Option<String> = tx
                .query_row(
                    "SELECT id FROM queue_jobs
                     WHERE state IN ('waiting', 'delayed')
                       AND run_at <= ?1
                       AND owner_id NOT IN (SELECT owner_id FROM queue_jobs WHERE state = 'active')
                     ORDER BY priority ASC, created_at ASC, id ASC
                     LIMIT 1",
                    [now_ms],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = next else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE queue_jobs SET state = 'active', attempts = attempts + 1, updated_at = ?2
                 WHERE id = ?1",
                params![id, now_ms],
            )?;
            query_job(tx, &id)
        })
    }

    pub fn get(&self, job_id: &str) -> Result<Option<QueueJob>, QueueError> {
        self.db.with_conn(|conn| Ok(query_job(conn, job_id)))?
    }

    pub fn complete(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.finish_active(job_id, "completed", None, now)
    }

    /// Record a failed attempt: reschedule with backoff, or park the job as
    /// `failed` once its attempts are spent.
    pub fn fail(
        &self,
        job_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let job = self
            .get(job_id)?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if job.is_last_attempt() {
            self.finish_active(job_id, "failed", Some(reason), now)?;
            warn!(job_id = %job_id, attempts = job.attempts, reason = %reason, "queue_job_exhausted");
            return Ok(FailOutcome::Exhausted);
        }

        let delay = chrono::Duration::from_std(self.policy.backoff(job.attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let run_at = now + delay;
        self.move_active(job_id, run_at, reason, false, now)?;
        info!(
            job_id = %job_id,
            attempt = job.attempts,
            retry_at = %run_at,
            reason = %reason,
            "queue_job_retry_scheduled"
        );
        Ok(FailOutcome::Retrying {
            run_at,
            attempt: job.attempts,
        })
    }

    /// Put an active job back without spending an attempt.
    pub fn defer(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.move_active(job_id, run_at, "deferred", true, now)
    }

    /// Drop a job whose campaign no longer wants it.
    pub fn discard(&self, job_id: &str) -> Result<(), QueueError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM queue_jobs WHERE id = ?1", [job_id])?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn update_progress(
        &self,
        job_id: &str,
        progress: &JobProgress,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(progress)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_jobs SET progress = ?2, updated_at = ?3 WHERE id = ?1",
                params![job_id, encoded, to_millis(now)],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Jobs of a campaign that may still run: waiting, delayed or active.
    pub fn outstanding(&self, campaign_id: &str) -> Result<u64, QueueError> {
        let n = self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_jobs
                 WHERE campaign_id = ?1 AND state IN ('waiting', 'delayed', 'active')",
                [campaign_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })?;
        Ok(n as u64)
    }

    /// Remove a campaign's jobs that have not been picked up yet. Active jobs
    /// are left to finish.
    pub fn cancel_pending(&self, campaign_id: &str) -> Result<usize, QueueError> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM queue_jobs WHERE campaign_id = ?1 AND state IN ('waiting', 'delayed')",
                [campaign_id],
            )?)
        })?;
        if removed > 0 {
            info!(campaign_id = %campaign_id, removed = removed, "queue_jobs_cancelled");
        }
        Ok(removed)
    }

    pub fn batches_for_campaign(&self, campaign_id: &str) -> Result<Vec<BatchStatus>, QueueError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE campaign_id = ?1
                 ORDER BY batch_number ASC, created_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([campaign_id], JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?
        .into_iter()
        .map(|row| {
            let job = row.into_job()?;
            Ok(BatchStatus {
                job_id: job.id,
                batch_number: job.payload.batch_number,
                total_batches: job.payload.total_batches,
                state: job.state,
                attempts: job.attempts,
                progress: job.progress,
                last_error: job.last_error,
            })
        })
        .collect()
    }

    /// Return jobs stranded in `active` by a dead worker to the ready set.
    /// A job whose attempts are already spent is parked as `failed`.
    pub fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let now_ms = to_millis(now);
        let (requeued, parked) = self.db.with_tx(|tx| {
            let parked = tx.execute(
                "UPDATE queue_jobs SET state = 'failed', last_error = 'stalled', finished_at = ?1,
                    updated_at = ?1
                 WHERE state = 'active' AND attempts >= max_attempts",
                [now_ms],
            )?;
            let requeued = tx.execute(
                "UPDATE queue_jobs SET state = 'waiting', run_at = ?1, updated_at = ?1
                 WHERE state = 'active'",
                [now_ms],
            )?;
            Ok::<_, QueueError>((requeued, parked))
        })?;

        if requeued + parked > 0 {
            warn!(requeued = requeued, parked = parked, "queue_stale_jobs_recovered");
        }
        Ok(requeued)
    }

    /// Delete finished jobs outside their retention windows.
    pub fn prune(&self, now: DateTime<Utc>, retention: &Retention) -> Result<usize, QueueError> {
        let completed_cutoff = to_millis(now) - retention.completed_age.as_millis() as i64;
        let failed_cutoff = to_millis(now) - retention.failed_age.as_millis() as i64;

        let removed = self.db.with_tx(|tx| {
            let mut removed = tx.execute(
                "DELETE FROM queue_jobs WHERE state = 'completed' AND finished_at < ?1",
                [completed_cutoff],
            )?;
            removed += tx.execute(
                "DELETE FROM queue_jobs WHERE state = 'completed' AND id NOT IN (
                    SELECT id FROM queue_jobs WHERE state = 'completed'
                    ORDER BY finished_at DESC LIMIT ?1
                 )",
                [retention.completed_count],
            )?;
            removed += tx.execute(
                "DELETE FROM queue_jobs WHERE state = 'failed' AND finished_at < ?1",
                [failed_cutoff],
            )?;
            Ok::<_, QueueError>(removed)
        })?;

        if removed > 0 {
            info!(removed = removed, "queue_jobs_pruned");
        }
        Ok(removed)
    }

    fn finish_active(
        &self,
        job_id: &str,
        state: &'static str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let now_ms = to_millis(now);
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE queue_jobs SET state = ?2, last_error = COALESCE(?3, last_error),
                    finished_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND state = 'active'",
                params![job_id, state, reason, now_ms],
            )?)
        })?;
        self.expect_changed(job_id, changed)
    }

    fn move_active(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        reason: &str,
        refund_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE queue_jobs SET state = 'delayed', run_at = ?2, last_error = ?3,
                    attempts = attempts - ?4, updated_at = ?5
                 WHERE id = ?1 AND state = 'active'",
                params![job_id, to_millis(run_at), reason, refund_attempt as i64, to_millis(now)],
            )?)
        })?;
        self.expect_changed(job_id, changed)
    }

    fn expect_changed(&self, job_id: &str, changed: usize) -> Result<(), QueueError> {
        if changed == 1 {
            return Ok(());
        }
        match self.get(job_id)? {
            None => Err(QueueError::NotFound(job_id.to_string())),
            Some(job) => Err(QueueError::WrongState {
                id: job_id.to_string(),
                state: job.state.to_string(),
                expected: "active",
            }),
        }
    }
}

fn query_job(conn: &Connection, id: &str) -> Result<Option<QueueJob>, QueueError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = ?1");
    let raw = conn.query_row(&sql, [id], JobRow::from_row).optional()?;
    raw.map(JobRow::into_job).transpose()
}

struct JobRow {
    id: String,
    payload: String,
    state: String,
    attempts: u32,
    max_attempts: u32,
    priority: u32,
    run_at: i64,
    progress: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    finished_at: Option<i64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            state: row.get(2)?,
            attempts: row.get(3)?,
            max_attempts: row.get(4)?,
            priority: row.get(5)?,
            run_at: row.get(6)?,
            progress: row.get(7)?,
            last_error: row.get(8)?,
            created_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    }

    fn into_job(self) -> Result<QueueJob, QueueError> {
        let progress = self
            .progress
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(QueueJob {
            payload: serde_json::from_str(&self.payload)?,
            state: self.state.parse().map_err(DbError::Corrupt)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            priority: self.priority,
            run_at: from_millis(self.run_at)?,
            progress,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
            finished_at: opt_from_millis(self.finished_at)?,
            id: self.id,
        })
    }
}
