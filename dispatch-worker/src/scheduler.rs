//! Scheduler daemon: promotes due campaigns and turns them into queued batches.
//!
//! Polling is deliberate. Every tick re-queries `scheduled` campaigns whose
//! time has passed; a campaign already `sending` is never selected again, so
//! ticks are idempotent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::campaign::Campaign;
use crate::config::Config;
use crate::contacts::Recipient;
use crate::db::Database;
use crate::error::CampaignError;
use crate::queue::{BatchReady, JobPayload, JobQueue, Publisher, Retention};
use crate::send::MessageTemplate;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub max_campaigns_per_tick: usize,
    pub batch_size: usize,
    pub warmup_recompute: Duration,
    pub retention: Retention,
    pub default_from_name: Option<String>,
    pub default_from_email: Option<String>,
    pub default_reply_to: Option<String>,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: config.scheduler_tick(),
            max_campaigns_per_tick: config.scheduler_max_campaigns_per_tick,
            batch_size: config.batch_size,
            warmup_recompute: Duration::from_secs(config.warmup_recompute_secs),
            retention: Retention {
                completed_age: Duration::from_secs(config.completed_job_retention_secs),
                completed_count: config.completed_job_retention_count as u32,
                failed_age: Duration::from_secs(config.failed_job_retention_secs),
            },
            default_from_name: config.from_name.clone(),
            default_from_email: config.from_email.clone(),
            default_reply_to: config.reply_to.clone(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            max_campaigns_per_tick: 100,
            batch_size: 500,
            warmup_recompute: Duration::from_secs(3600),
            retention: Retention::default(),
            default_from_name: None,
            default_from_email: None,
            default_reply_to: None,
        }
    }
}

/// What happened to one campaign handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Enqueued { jobs: usize, recipients: usize },
    /// Every eligible recipient was reached by an earlier dispatch.
    AlreadyComplete,
    /// Fatal validation failure; the campaign is now `failed`.
    Invalid(String),
    /// Enqueueing failed and the campaign went back to `scheduled`.
    RolledBack(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub enqueued: usize,
    pub completed: usize,
    pub invalid: usize,
    pub rolled_back: usize,
    /// Lost the race to another dispatcher or failed to load.
    pub skipped: usize,
}

/// Split recipients into batches of at most `batch_size`, numbered from 1.
pub fn build_batches(
    campaign_id: &str,
    owner_id: &str,
    template: &MessageTemplate,
    recipients: Vec<Recipient>,
    batch_size: usize,
) -> Vec<JobPayload> {
    let batch_size = batch_size.max(1);
    let total = recipients.len().div_ceil(batch_size) as u32;
    let mut batches = Vec::with_capacity(total as usize);
    let mut rest = recipients.into_iter().peekable();
    let mut number = 0;

    while rest.peek().is_some() {
        number += 1;
        batches.push(JobPayload {
            campaign_id: campaign_id.to_string(),
            owner_id: owner_id.to_string(),
            batch_number: number,
            total_batches: total,
            template: template.clone(),
            recipients: rest.by_ref().take(batch_size).collect(),
        });
    }
    batches
}

#[derive(Clone)]
pub struct Dispatcher {
    db: Arc<Database>,
    queue: JobQueue,
    publisher: Option<Publisher>,
    settings: SchedulerSettings,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Database>,
        queue: JobQueue,
        publisher: Option<Publisher>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            db,
            queue,
            publisher,
            settings,
        }
    }

    /// One scheduler pass over due campaigns.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self
            .db
            .due_campaigns(now, self.settings.max_campaigns_per_tick)
            .context("Failed to query due campaigns")?;

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        for campaign in due {
            let id = campaign.id.clone();
            let claimed = match self.db.mark_sending(&id, now) {
                Ok(c) => c,
                Err(CampaignError::InvalidTransition { from, .. }) => {
                    info!(campaign_id = %id, status = %from, "campaign_claim_lost");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(campaign_id = %id, error = %e, "campaign_claim_failed");
                    report.skipped += 1;
                    continue;
                }
            };

            match self.dispatch(claimed, now).await {
                DispatchOutcome::Enqueued { .. } => report.enqueued += 1,
                DispatchOutcome::AlreadyComplete => report.completed += 1,
                DispatchOutcome::Invalid(_) => report.invalid += 1,
                DispatchOutcome::RolledBack(_) => report.rolled_back += 1,
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                enqueued = report.enqueued,
                completed = report.completed,
                invalid = report.invalid,
                rolled_back = report.rolled_back,
                skipped = report.skipped,
                "scheduler_tick_complete"
            );
        }
        Ok(report)
    }

    /// Direct trigger: dispatch a draft or scheduled campaign right away.
    pub async fn send_now(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, CampaignError> {
        let campaign = self.db.mark_sending_now(campaign_id, now)?;
        Ok(self.dispatch(campaign, now).await)
    }

    /// Turn a campaign already moved to `sending` into queued batches.
    ///
    /// Validation failures are terminal. Anything else that goes wrong before
    /// the batches are stored rolls the campaign back to `scheduled`.
    async fn dispatch(&self, campaign: Campaign, now: DateTime<Utc>) -> DispatchOutcome {
        let id = campaign.id.clone();
        match self.prepare(&campaign) {
            Ok(Prepared::Invalid(reason)) => {
                if let Err(e) = self.db.mark_invalid(&id, &reason, now) {
                    error!(campaign_id = %id, error = %e, "campaign_mark_invalid_failed");
                }
                DispatchOutcome::Invalid(reason)
            }
            Ok(Prepared::AlreadyComplete) => {
                if let Err(e) = self.db.mark_sent(&id, now) {
                    error!(campaign_id = %id, error = %e, "campaign_mark_sent_failed");
                }
                DispatchOutcome::AlreadyComplete
            }
            Ok(Prepared::Batches(payloads)) => {
                let recipients = payloads.iter().map(|p| p.recipients.len()).sum();
                match self.queue.enqueue_batches(&payloads, now) {
                    Ok(job_ids) => {
                        let jobs = job_ids.len();
                        info!(
                            campaign_id = %id,
                            jobs = jobs,
                            recipients = recipients,
                            "campaign_batches_enqueued"
                        );
                        self.notify(&campaign, job_ids).await;
                        DispatchOutcome::Enqueued { jobs, recipients }
                    }
                    Err(e) => self.roll_back(&id, &format!("enqueue failed: {e}"), now),
                }
            }
            Err(e) => self.roll_back(&id, &format!("{e:#}"), now),
        }
    }

    fn prepare(&self, campaign: &Campaign) -> Result<Prepared> {
        if !campaign.has_body() {
            return Ok(Prepared::Invalid("campaign has no body".into()));
        }

        let Some(template) = self.template_for(campaign) else {
            return Ok(Prepared::Invalid("campaign has no sender address".into()));
        };

        // Contacts reached by any earlier dispatch are never mailed again,
        // including after a failed campaign is rescheduled.
        let already_sent = self
            .db
            .count_unique(&campaign.id, "sent")
            .context("Failed to count delivered recipients")?;
        let recipients = self
            .db
            .eligible_recipients(&campaign.id, true)
            .context("Failed to load recipients")?;

        if recipients.is_empty() {
            if already_sent > 0 {
                return Ok(Prepared::AlreadyComplete);
            }
            return Ok(Prepared::Invalid("campaign has no eligible recipients".into()));
        }

        self.db
            .set_recipient_count(&campaign.id, already_sent + recipients.len() as u64)?;

        Ok(Prepared::Batches(build_batches(
            &campaign.id,
            &campaign.owner_id,
            &template,
            recipients,
            self.settings.batch_size,
        )))
    }

    fn template_for(&self, campaign: &Campaign) -> Option<MessageTemplate> {
        let from_email = campaign
            .from_email
            .clone()
            .or_else(|| self.settings.default_from_email.clone())?;
        Some(MessageTemplate {
            subject: campaign.subject.clone(),
            html_body: campaign.html_body.clone(),
            text_body: campaign.text_body.clone(),
            from_name: campaign
                .from_name
                .clone()
                .or_else(|| self.settings.default_from_name.clone())
                .unwrap_or_default(),
            from_email,
            reply_to: campaign
                .reply_to
                .clone()
                .or_else(|| self.settings.default_reply_to.clone()),
        })
    }

    fn roll_back(&self, id: &str, reason: &str, now: DateTime<Utc>) -> DispatchOutcome {
        warn!(campaign_id = %id, reason = %reason, "campaign_dispatch_rolling_back");
        if let Err(e) = self.db.revert_to_scheduled(id, now, now) {
            error!(campaign_id = %id, error = %e, "campaign_rollback_failed");
        }
        DispatchOutcome::RolledBack(reason.to_string())
    }

    /// Wake workers. The queue table is authoritative, so a lost notification
    /// only delays pickup until the next worker poll.
    async fn notify(&self, campaign: &Campaign, job_ids: Vec<String>) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let ready = BatchReady {
            campaign_id: campaign.id.clone(),
            owner_id: campaign.owner_id.clone(),
            job_ids,
        };
        if let Err(e) = publisher.publish_batch_ready(&ready).await {
            warn!(campaign_id = %campaign.id, error = %e, "batch_notification_failed");
        }
    }

    /// Run the tick, warmup recomputation and queue pruning until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tick = interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut warmup = interval(self.settings.warmup_recompute);
        warmup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_secs = self.settings.tick.as_secs(),
            batch_size = self.settings.batch_size,
            "scheduler_ready"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "scheduler_tick_failed");
                    }
                }
                _ = warmup.tick() => self.housekeeping(Utc::now()),
            }
        }

        info!("scheduler_shutdown_complete");
        Ok(())
    }

    /// Warmup stage recomputation and queue retention.
    pub fn housekeeping(&self, now: DateTime<Utc>) {
        match self.db.recompute_warmup_stages(now.date_naive()) {
            Ok(advanced) => info!(advanced = advanced, "warmup_stages_recomputed"),
            Err(e) => error!(error = %e, "warmup_recompute_failed"),
        }
        if let Err(e) = self.queue.prune(now, &self.settings.retention) {
            error!(error = %e, "queue_prune_failed");
        }
    }
}

enum Prepared {
    Batches(Vec<JobPayload>),
    AlreadyComplete,
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{CampaignStatus, NewCampaign};
    use crate::contacts::NewContact;
    use crate::progress::ProgressHub;
    use crate::queue::{JobState, RetryPolicy};
    use crate::send::testing::FakeProvider;
    use crate::send::SendAdapter;
    use crate::tracking::{TrackingGateway, TrackingUrls};
    use crate::worker::{DispatchSettings, DispatchWorker};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;

    struct Fixture {
        db: Arc<Database>,
        queue: JobQueue,
        dispatcher: Dispatcher,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = JobQueue::new(db.clone(), RetryPolicy::default());
        let dispatcher = Dispatcher::new(
            db.clone(),
            queue.clone(),
            None,
            SchedulerSettings {
                batch_size,
                default_from_email: Some("news@acme.example".into()),
                ..Default::default()
            },
        );
        Fixture {
            db,
            queue,
            dispatcher,
        }
    }

    /// Campaign targeting one list of `n` subscribed contacts, scheduled so it
    /// is due at `now`.
    fn due_campaign(f: &Fixture, n: usize, now: DateTime<Utc>) -> String {
        let created = now - ChronoDuration::minutes(10);
        let list = f.db.create_list("owner-1", "Everyone", created).unwrap();
        for i in 0..n {
            let contact = f
                .db
                .create_contact(
                    &NewContact {
                        owner_id: "owner-1".into(),
                        email: format!("user{i}@example.com"),
                        ..Default::default()
                    },
                    created,
                )
                .unwrap();
            f.db.add_to_list(&list, &contact.id, created).unwrap();
        }
        let campaign = f
            .db
            .create_campaign(
                &NewCampaign {
                    owner_id: "owner-1".into(),
                    name: "Launch".into(),
                    subject: "Hello {{firstName}}".into(),
                    html_body: "<html><body><p>News</p></body></html>".into(),
                    list_ids: vec![list],
                    ..Default::default()
                },
                created,
            )
            .unwrap();
        f.db.schedule(&campaign.id, now - ChronoDuration::minutes(1), "Europe/Berlin", created)
            .unwrap();
        campaign.id
    }

    fn template() -> MessageTemplate {
        MessageTemplate {
            subject: "s".into(),
            html_body: "b".into(),
            text_body: None,
            from_name: String::new(),
            from_email: "f@example.com".into(),
            reply_to: None,
        }
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient {
                contact_id: format!("ct-{i}"),
                email: format!("r{i}@example.com"),
                first_name: None,
                last_name: None,
                company: None,
                custom_fields: Default::default(),
            })
            .collect()
    }

    #[test]
    fn test_build_batches_covers_every_recipient_once() {
        for (n, size) in [(1200, 500), (1000, 500), (1, 500), (7, 3), (0, 10)] {
            let batches = build_batches("c", "o", &template(), recipients(n), size);
            assert_eq!(batches.len(), n.div_ceil(size));

            let mut seen = HashSet::new();
            for (i, b) in batches.iter().enumerate() {
                assert_eq!(b.batch_number as usize, i + 1);
                assert_eq!(b.total_batches as usize, batches.len());
                assert!(b.recipients.len() <= size);
                for r in &b.recipients {
                    assert!(seen.insert(r.contact_id.clone()));
                }
            }
            assert_eq!(seen.len(), n);
        }
    }

    #[tokio::test]
    async fn test_tick_enqueues_due_campaign_once() {
        let f = fixture(500);
        let now = Utc::now();
        let id = due_campaign(&f, 1200, now);

        let report = f.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.enqueued, 1);

        let batches = f.queue.batches_for_campaign(&id).unwrap();
        let sizes: Vec<_> = batches
            .iter()
            .map(|b| f.queue.get(&b.job_id).unwrap().unwrap().payload.recipients.len())
            .collect();
        assert_eq!(sizes, vec![500, 500, 200]);

        let campaign = f.db.get_campaign(&id).unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sending);
        assert_eq!(campaign.recipient_count, 1200);
        assert!(campaign.scheduled_at.is_none());

        // Already sending: never re-selected
        let again = f.dispatcher.tick(now).await.unwrap();
        assert_eq!(again.due, 0);
        assert_eq!(f.queue.outstanding(&id).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_not_yet_due_campaign_is_left_alone() {
        let f = fixture(500);
        let now = Utc::now();
        due_campaign(&f, 3, now);
        let report = f.dispatcher.tick(now - ChronoDuration::minutes(5)).await.unwrap();
        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn test_campaign_without_recipients_fails_without_enqueue() {
        let f = fixture(500);
        let now = Utc::now();
        let id = due_campaign(&f, 0, now);

        let report = f.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.invalid, 1);

        let campaign = f.db.get_campaign(&id).unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Failed);
        assert_eq!(
            campaign.last_error.as_deref(),
            Some("campaign has no eligible recipients")
        );
        assert_eq!(f.queue.outstanding(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_campaign_without_sender_is_invalid() {
        let mut f = fixture(500);
        f.dispatcher.settings.default_from_email = None;
        let now = Utc::now();
        let id = due_campaign(&f, 2, now);

        assert_eq!(f.dispatcher.tick(now).await.unwrap().invalid, 1);
        assert_eq!(
            f.db.get_campaign(&id).unwrap().unwrap().status,
            CampaignStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_enqueue_failure_rolls_back_to_scheduled() {
        let f = fixture(500);
        let now = Utc::now();
        let id = due_campaign(&f, 2, now);
        f.db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE queue_jobs")?;
            Ok(())
        })
        .unwrap();

        let report = f.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.rolled_back, 1);

        let campaign = f.db.get_campaign(&id).unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Scheduled);
        assert_eq!(campaign.dispatch_attempts, 0);
        assert!(campaign.scheduled_at.is_some());
        assert!(campaign.sent_at.is_none());
    }

    #[tokio::test]
    async fn test_send_now_from_draft_and_rejects_sending() {
        let f = fixture(2);
        let now = Utc::now();
        let id = due_campaign(&f, 3, now);
        f.db.cancel(&id, now).unwrap();

        let outcome = f.dispatcher.send_now(&id, now).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Enqueued {
                jobs: 2,
                recipients: 3
            }
        );
        assert!(matches!(
            f.dispatcher.send_now(&id, now).await,
            Err(CampaignError::InvalidTransition {
                from: CampaignStatus::Sending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_redispatch_skips_recipients_already_sent() {
        let f = fixture(500);
        let now = Utc::now();
        let id = due_campaign(&f, 3, now);
        f.dispatcher.tick(now).await.unwrap();

        // First batch exhausted after reaching one recipient
        let job = f.queue.claim(now).unwrap().unwrap();
        let reached = &job.payload.recipients[0];
        f.db.append_event(&crate::events::EmailEvent::new(
            &id,
            &reached.contact_id,
            crate::events::EventKind::Sent {
                provider_message_id: None,
            },
            now,
        ))
        .unwrap();
        f.queue.discard(&job.id).unwrap();
        f.db.mark_failed(&id, "provider down", 3, now).unwrap();

        f.dispatcher.tick(now).await.unwrap();
        let fresh: Vec<_> = f
            .queue
            .batches_for_campaign(&id)
            .unwrap()
            .into_iter()
            .filter(|b| b.state == JobState::Waiting)
            .collect();
        assert_eq!(fresh.len(), 1);
        let payload = f.queue.get(&fresh[0].job_id).unwrap().unwrap().payload;
        assert_eq!(payload.recipients.len(), 2);
        assert!(payload
            .recipients
            .iter()
            .all(|r| r.contact_id != reached.contact_id));
    }

    #[tokio::test]
    async fn test_redispatch_with_everyone_reached_marks_sent() {
        let f = fixture(500);
        let now = Utc::now();
        let id = due_campaign(&f, 1, now);
        f.dispatcher.tick(now).await.unwrap();
        let job = f.queue.claim(now).unwrap().unwrap();
        f.db.append_event(&crate::events::EmailEvent::new(
            &id,
            &job.payload.recipients[0].contact_id,
            crate::events::EventKind::Sent {
                provider_message_id: None,
            },
            now,
        ))
        .unwrap();
        f.db.mark_failed(&id, "crash", 3, now).unwrap();
        f.queue.discard(&job.id).unwrap();

        let report = f.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(
            f.db.get_campaign(&id).unwrap().unwrap().status,
            CampaignStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_rescheduled_failed_campaign_only_mails_the_rest() {
        let f = fixture(2);
        let t0 = Utc::now() - ChronoDuration::minutes(10);
        let id = due_campaign(&f, 4, t0);
        f.dispatcher.tick(t0).await.unwrap();

        let worker = DispatchWorker::new(
            f.db.clone(),
            f.queue.clone(),
            SendAdapter::new(
                FakeProvider::default(),
                TrackingGateway::new(TrackingUrls::new("https://t.example.com", "secret")),
            ),
            ProgressHub::default(),
            DispatchSettings {
                send_rate_per_second: 1000,
                inter_batch_pause: std::time::Duration::ZERO,
                ..Default::default()
            },
        );
        worker.run_once().await.unwrap().unwrap();
        assert_eq!(worker.sender().provider().sent_to().len(), 2);

        // Second batch never ran and the campaign gave up
        f.queue.cancel_pending(&id).unwrap();
        let failed = f.db.mark_failed(&id, "provider down", 1, t0).unwrap();
        assert_eq!(failed.status, CampaignStatus::Failed);

        f.db.schedule(&id, t0 + ChronoDuration::minutes(1), "UTC", t0)
            .unwrap();
        let report = f.dispatcher.tick(Utc::now()).await.unwrap();
        assert_eq!(report.enqueued, 1);
        worker.drain().await.unwrap();

        let sent_to = worker.sender().provider().sent_to();
        assert_eq!(sent_to.len(), 4);
        assert_eq!(sent_to.iter().collect::<HashSet<_>>().len(), 4);

        let campaign = f.db.get_campaign(&id).unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sent);
        assert_eq!(campaign.counters.sent, 4);
        assert_eq!(campaign.recipient_count, 4);
        assert_eq!(f.db.count_unique(&id, "sent").unwrap(), 4);
    }

    #[tokio::test]
    async fn test_housekeeping_advances_warmup() {
        let f = fixture(500);
        let now = Utc::now();
        f.db.start_warmup("owner-1", now.date_naive() - ChronoDuration::days(9))
            .unwrap();
        f.dispatcher.housekeeping(now);
        assert_eq!(f.db.get_warmup("owner-1").unwrap().unwrap().stage.number(), 3);
    }

    /// 1,200 recipients, batches of 500, 14 sends per second.
    #[tokio::test(start_paused = true)]
    async fn test_full_dispatch_is_throttled_and_completes() {
        let f = fixture(500);
        let now = Utc::now();
        let id = due_campaign(&f, 1200, now);

        let report = f.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(f.queue.outstanding(&id).unwrap(), 3);

        let worker = DispatchWorker::new(
            f.db.clone(),
            f.queue.clone(),
            SendAdapter::new(
                FakeProvider::default(),
                TrackingGateway::new(TrackingUrls::new("https://t.example.com", "secret")),
            ),
            ProgressHub::default(),
            DispatchSettings {
                send_rate_per_second: 14,
                inter_batch_pause: std::time::Duration::from_secs(1),
                ..Default::default()
            },
        );

        let started = tokio::time::Instant::now();
        let outcomes = worker.drain().await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcomes.len(), 3);
        assert!(
            elapsed >= std::time::Duration::from_millis(1199 * 1000 / 14),
            "dispatch took only {elapsed:?}"
        );

        let campaign = f.db.get_campaign(&id).unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sent);
        assert_eq!(campaign.counters.sent, 1200);
        assert_eq!(worker.sender().provider().sent_to().len(), 1200);
        assert_eq!(f.db.count_unique(&id, "sent").unwrap(), 1200);
    }
}
