//! Dispatch worker: drains the batch queue and sends each batch.
//!
//! Batches are processed one at a time and recipients in list order. Between
//! two sends the worker waits out the [`RateThrottle`] delay; after each batch
//! it applies a fixed inter-batch pause.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::campaign::{CampaignStatus, Counter};
use crate::config::Config;
use crate::db::Database;
use crate::error::CampaignError;
use crate::events::{EmailEvent, EventKind};
use crate::progress::{BatchProgress, ProgressHub};
use crate::queue::{FailOutcome, JobProgress, JobQueue, QueueJob};
use crate::send::{Provider, SendAdapter};
use crate::throttle::{RateThrottle, WarmupError};

/// Progress is written to the job row every this many recipients.
const PROGRESS_PERSIST_EVERY: u32 = 50;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub send_rate_per_second: u32,
    pub inter_batch_pause: Duration,
    pub max_dispatch_attempts: u32,
    /// How long a job of a paused campaign waits before it is looked at again.
    pub paused_recheck: Duration,
    pub poll_interval: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            send_rate_per_second: config.send_rate_per_second,
            inter_batch_pause: config.inter_batch_pause(),
            max_dispatch_attempts: config.max_dispatch_attempts,
            paused_recheck: Duration::from_secs(30),
            poll_interval: config.worker_poll_interval(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            send_rate_per_second: 14,
            inter_batch_pause: Duration::from_secs(1),
            max_dispatch_attempts: 3,
            paused_recheck: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Per-attempt counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Sends accepted by the provider during this attempt.
    pub sent: u32,
    /// Recipients skipped because an earlier attempt already reached them.
    pub already_sent: u32,
    pub failed: u32,
    /// Failures a later attempt could fix (throttling, timeouts, 5xx).
    pub transient_failures: u32,
    pub skipped_quota: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        summary: BatchSummary,
        campaign_finished: bool,
    },
    Retrying {
        summary: BatchSummary,
        run_at: DateTime<Utc>,
    },
    /// Retries spent; the campaign went through `mark_failed`.
    Exhausted { summary: BatchSummary },
    /// The campaign is paused; the job waits without spending an attempt.
    Deferred,
    /// The campaign no longer wants this batch.
    Discarded,
}

pub struct DispatchWorker<P> {
    db: Arc<Database>,
    queue: JobQueue,
    sender: SendAdapter<P>,
    progress: ProgressHub,
    settings: DispatchSettings,
}

impl<P: Provider> DispatchWorker<P> {
    pub fn new(
        db: Arc<Database>,
        queue: JobQueue,
        sender: SendAdapter<P>,
        progress: ProgressHub,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            db,
            queue,
            sender,
            progress,
            settings,
        }
    }

    pub fn sender(&self) -> &SendAdapter<P> {
        &self.sender
    }

    /// Drain the queue until `shutdown` flips to `true`.
    ///
    /// Wakes on `wake` (RabbitMQ notifications) or after the poll interval.
    /// A batch in progress always runs to completion before shutdown.
    pub async fn run(
        &self,
        wake: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let recovered = self
            .queue
            .recover_stale(Utc::now())
            .context("Failed to recover stale jobs")?;
        info!(recovered = recovered, "worker_ready");

        loop {
            while !*shutdown.borrow() {
                match self.run_once().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "worker_iteration_failed");
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = wake.notified() => debug!("worker_woken"),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("worker_shutdown_complete");
        Ok(())
    }

    /// Claim and process one ready job. `None` when nothing is ready.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let Some(job) = self.queue.claim(Utc::now())? else {
            return Ok(None);
        };

        let job_id = job.id.clone();
        let campaign_id = job.campaign_id().to_string();

        match self.process(job).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                // Infrastructure failure mid-batch: hand the job to the retry policy
                error!(job_id = %job_id, campaign_id = %campaign_id, error = %e, "batch_processing_error");
                let outcome = self
                    .fail_job(&job_id, &campaign_id, &format!("{e:#}"), BatchSummary::default())
                    .await?;
                Ok(Some(outcome))
            }
        }
    }

    /// Process every job that is ready right now.
    pub async fn drain(&self) -> Result<Vec<JobOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Send one claimed batch.
    ///
    /// 1. Re-check the campaign: paused defers the job, anything other than
    ///    `sending` discards it
    /// 2. For each recipient: warmup quota, rate throttle, send, `sent` event
    /// 3. Add this attempt's sends to the campaign counter
    /// 4. Complete the job (and the campaign on its last batch) or hand it
    ///    to the retry policy if transient provider failures occurred
    async fn process(&self, job: QueueJob) -> Result<JobOutcome> {
        let payload = &job.payload;
        let campaign_id = payload.campaign_id.as_str();

        let status = self
            .db
            .get_campaign(campaign_id)
            .context("Failed to load campaign")?
            .map(|c| c.status);

        match status {
            Some(CampaignStatus::Sending) => {}
            Some(CampaignStatus::Paused) => {
                let run_at = Utc::now() + to_chrono(self.settings.paused_recheck);
                self.queue.defer(&job.id, run_at, Utc::now())?;
                info!(job_id = %job.id, campaign_id = %campaign_id, "batch_deferred_campaign_paused");
                return Ok(JobOutcome::Deferred);
            }
            other => {
                self.queue.discard(&job.id)?;
                info!(
                    job_id = %job.id,
                    campaign_id = %campaign_id,
                    status = ?other,
                    "batch_discarded_campaign_not_sending"
                );
                return Ok(JobOutcome::Discarded);
            }
        }

        info!(
            job_id = %job.id,
            campaign_id = %campaign_id,
            batch_number = payload.batch_number,
            total_batches = payload.total_batches,
            recipients = payload.recipients.len(),
            attempt = job.attempts,
            "batch_dispatch_start"
        );

        let already_sent = if job.attempts > 1 {
            self.db.sent_contact_ids(campaign_id)?
        } else {
            Default::default()
        };

        let total = payload.recipients.len() as u32;
        let mut summary = BatchSummary::default();
        let mut counts = JobProgress::new(total);
        let mut throttle = RateThrottle::new(self.settings.send_rate_per_second);

        for (index, recipient) in payload.recipients.iter().enumerate() {
            if already_sent.contains(&recipient.contact_id) {
                summary.already_sent += 1;
                counts.sent += 1;
                continue;
            }

            let today = Utc::now().date_naive();
            match self.db.can_send(&payload.owner_id, 1, today) {
                Ok(_) => {}
                Err(WarmupError::QuotaExceeded(quota)) => {
                    let skipped = total - index as u32;
                    summary.skipped_quota = skipped;
                    counts.skipped += skipped;
                    warn!(
                        job_id = %job.id,
                        campaign_id = %campaign_id,
                        owner_id = %payload.owner_id,
                        limit = quota.limit,
                        skipped_quota = skipped,
                        "warmup_quota_exhausted"
                    );
                    break;
                }
                Err(WarmupError::Database(e)) => {
                    return Err(e).context("Failed to check warmup quota");
                }
            }

            throttle.acquire().await;
            let result = self
                .sender
                .send(campaign_id, recipient, &payload.template, Utc::now())
                .await;

            if result.success {
                self.db.append_event(&EmailEvent::new(
                    campaign_id,
                    &recipient.contact_id,
                    EventKind::Sent {
                        provider_message_id: result.provider_message_id,
                    },
                    Utc::now(),
                ))?;
                self.db.record_send(&payload.owner_id, 1, today)?;
                summary.sent += 1;
                counts.sent += 1;
            } else {
                summary.failed += 1;
                counts.failed += 1;
                if result.error_code.is_some_and(|c| c.is_transient()) {
                    summary.transient_failures += 1;
                }
            }

            self.report(&job, counts, false);
            if counts.processed() % PROGRESS_PERSIST_EVERY == 0 {
                self.queue.update_progress(&job.id, &counts, Utc::now())?;
            }
        }

        self.queue.update_progress(&job.id, &counts, Utc::now())?;
        self.report(&job, counts, true);

        if summary.sent > 0 {
            self.db
                .increment_counter(campaign_id, Counter::Sent, u64::from(summary.sent))?;
        }

        let outcome = if summary.transient_failures > 0 {
            let reason = format!(
                "{} of {} sends failed transiently",
                summary.transient_failures, total
            );
            self.fail_job(&job.id, campaign_id, &reason, summary).await?
        } else {
            self.queue.complete(&job.id, Utc::now())?;
            let campaign_finished = self.finish_campaign_if_done(campaign_id)?;
            info!(
                job_id = %job.id,
                campaign_id = %campaign_id,
                batch_number = payload.batch_number,
                sent = summary.sent,
                already_sent = summary.already_sent,
                failed = summary.failed,
                skipped_quota = summary.skipped_quota,
                campaign_finished = campaign_finished,
                "batch_dispatch_complete"
            );
            JobOutcome::Completed {
                summary,
                campaign_finished,
            }
        };

        tokio::time::sleep(self.settings.inter_batch_pause).await;
        Ok(outcome)
    }

    async fn fail_job(
        &self,
        job_id: &str,
        campaign_id: &str,
        reason: &str,
        summary: BatchSummary,
    ) -> Result<JobOutcome> {
        match self.queue.fail(job_id, reason, Utc::now())? {
            FailOutcome::Retrying { run_at, .. } => Ok(JobOutcome::Retrying { summary, run_at }),
            FailOutcome::Exhausted => {
                let cancelled = self.queue.cancel_pending(campaign_id)?;
                match self.db.mark_failed(
                    campaign_id,
                    reason,
                    self.settings.max_dispatch_attempts,
                    Utc::now(),
                ) {
                    Ok(_) => {}
                    Err(CampaignError::InvalidTransition { from, .. }) => {
                        info!(campaign_id = %campaign_id, status = %from, "campaign_fail_skipped");
                    }
                    Err(e) => return Err(e).context("Failed to mark campaign failed"),
                }
                warn!(
                    job_id = %job_id,
                    campaign_id = %campaign_id,
                    cancelled_batches = cancelled,
                    "batch_retries_exhausted"
                );
                Ok(JobOutcome::Exhausted { summary })
            }
        }
    }

    /// Move the campaign to `sent` once no batch is left.
    fn finish_campaign_if_done(&self, campaign_id: &str) -> Result<bool> {
        if self.queue.outstanding(campaign_id)? > 0 {
            return Ok(false);
        }
        match self.db.mark_sent(campaign_id, Utc::now()) {
            Ok(_) => Ok(true),
            Err(CampaignError::InvalidTransition { from, .. }) => {
                info!(campaign_id = %campaign_id, status = %from, "campaign_finish_skipped");
                Ok(false)
            }
            Err(e) => Err(e).context("Failed to mark campaign sent"),
        }
    }

    fn report(&self, job: &QueueJob, counts: JobProgress, finished: bool) {
        self.progress.publish(BatchProgress {
            campaign_id: job.payload.campaign_id.clone(),
            job_id: job.id.clone(),
            batch_number: job.payload.batch_number,
            total_batches: job.payload.total_batches,
            counts,
            finished,
        });
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(30))
}
