//! Campaign state machine.
//!
//! Every transition is a single conditional `UPDATE ... WHERE status = ?`, so
//! two dispatchers racing on the same campaign cannot both win. The loser gets
//! [`CampaignError::InvalidTransition`] describing the status it actually found.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{info, warn};

use super::records::{query_campaign, CampaignRow, CAMPAIGN_COLUMNS};
use super::types::{Campaign, CampaignStatus};
use crate::db::{to_millis, Database, DbResult};
use crate::error::CampaignError;

/// Longest accepted IANA timezone name.
const MAX_TIMEZONE_LEN: usize = 64;

impl Database {
    /// Schedule a draft (or previously failed) campaign for `when`.
    pub fn schedule(
        &self,
        id: &str,
        when: DateTime<Utc>,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        validate_schedule(when, timezone, now)?;

        let campaign = self.transition(
            id,
            CampaignStatus::Scheduled,
            |conn| {
                conn.execute(
                    "UPDATE campaigns
                     SET status = 'scheduled', scheduled_at = ?2, timezone = ?3, sent_at = NULL,
                         dispatch_attempts = 0, last_error = NULL, updated_at = ?4
                     WHERE id = ?1 AND status IN ('draft', 'failed') AND deleted_at IS NULL",
                    params![id, to_millis(when), timezone, to_millis(now)],
                )
            },
        )?;

        info!(campaign_id = %id, scheduled_at = %when, timezone = %timezone, "campaign_scheduled");
        Ok(campaign)
    }

    /// Move a scheduled campaign to a new time.
    pub fn reschedule(
        &self,
        id: &str,
        when: DateTime<Utc>,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        validate_schedule(when, timezone, now)?;

        let campaign = self.transition(
            id,
            CampaignStatus::Scheduled,
            |conn| {
                conn.execute(
                    "UPDATE campaigns SET scheduled_at = ?2, timezone = ?3, updated_at = ?4
                     WHERE id = ?1 AND status = 'scheduled' AND deleted_at IS NULL",
                    params![id, to_millis(when), timezone, to_millis(now)],
                )
            },
        )?;

        info!(campaign_id = %id, scheduled_at = %when, "campaign_rescheduled");
        Ok(campaign)
    }

    /// Unschedule a campaign, returning it to draft.
    pub fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<Campaign, CampaignError> {
        let campaign = self.transition(
            id,
            CampaignStatus::Draft,
            |conn| {
                conn.execute(
                    "UPDATE campaigns SET status = 'draft', scheduled_at = NULL, timezone = NULL,
                         updated_at = ?2
                     WHERE id = ?1 AND status = 'scheduled' AND deleted_at IS NULL",
                    params![id, to_millis(now)],
                )
            },
        )?;

        info!(campaign_id = %id, "campaign_schedule_cancelled");
        Ok(campaign)
    }

    /// Scheduler path: claim a due campaign for dispatch.
    pub fn mark_sending(&self, id: &str, now: DateTime<Utc>) -> Result<Campaign, CampaignError> {
        self.begin_sending(id, &[CampaignStatus::Scheduled], now)
    }

    /// Direct "send now" path: claim a draft or scheduled campaign immediately.
    pub fn mark_sending_now(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        self.begin_sending(id, &[CampaignStatus::Draft, CampaignStatus::Scheduled], now)
    }

    fn begin_sending(
        &self,
        id: &str,
        from: &[CampaignStatus],
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let allowed = status_list(from);
        let campaign = self.transition(id, CampaignStatus::Sending, |conn| {
            let sql = format!(
                "UPDATE campaigns
                 SET status = 'sending', scheduled_at = NULL, sent_at = ?2,
                     dispatch_attempts = dispatch_attempts + 1, last_error = NULL, updated_at = ?2
                 WHERE id = ?1 AND status IN ({allowed}) AND deleted_at IS NULL"
            );
            conn.execute(&sql, params![id, to_millis(now)])
        })?;

        info!(
            campaign_id = %id,
            dispatch_attempt = campaign.dispatch_attempts,
            "campaign_sending"
        );
        Ok(campaign)
    }

    /// Undo a `mark_sending` whose batches never reached the queue.
    ///
    /// The attempt is handed back so a transient enqueue failure does not count
    /// towards the dispatch ceiling.
    pub fn revert_to_scheduled(
        &self,
        id: &str,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let campaign = self.transition(
            id,
            CampaignStatus::Scheduled,
            |conn| {
                conn.execute(
                    "UPDATE campaigns
                     SET status = 'scheduled', scheduled_at = ?2, sent_at = NULL,
                         dispatch_attempts = MAX(dispatch_attempts - 1, 0), updated_at = ?3
                     WHERE id = ?1 AND status = 'sending' AND deleted_at IS NULL",
                    params![id, to_millis(scheduled_at), to_millis(now)],
                )
            },
        )?;

        warn!(campaign_id = %id, "campaign_send_rolled_back");
        Ok(campaign)
    }

    /// Worker path: the last batch completed.
    pub fn mark_sent(&self, id: &str, now: DateTime<Utc>) -> Result<Campaign, CampaignError> {
        let campaign = self.transition(
            id,
            CampaignStatus::Sent,
            |conn| {
                conn.execute(
                    "UPDATE campaigns
                     SET status = 'sent', sent_at = COALESCE(sent_at, ?2), updated_at = ?2
                     WHERE id = ?1 AND status IN ('sending', 'paused') AND deleted_at IS NULL",
                    params![id, to_millis(now)],
                )
            },
        )?;

        info!(
            campaign_id = %id,
            emails_sent = campaign.counters.sent,
            "campaign_sent"
        );
        Ok(campaign)
    }

    /// Worker path: a batch exhausted its retries.
    ///
    /// The campaign goes back to `scheduled` (due immediately) so the next tick
    /// re-derives fresh batches. After `max_dispatch_attempts` dispatches it
    /// lands in the terminal `failed` status instead.
    ///
    /// A campaign paused while its last batch was running is failed the same
    /// way; its remaining batches are gone, so resuming it would finish nothing.
    pub fn mark_failed(
        &self,
        id: &str,
        reason: &str,
        max_dispatch_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let campaign = self.transition(
            id,
            CampaignStatus::Scheduled,
            |conn| {
                conn.execute(
                    "UPDATE campaigns
                     SET status = CASE WHEN dispatch_attempts < ?3 THEN 'scheduled' ELSE 'failed' END,
                         scheduled_at = CASE WHEN dispatch_attempts < ?3 THEN ?4 ELSE NULL END,
                         sent_at = NULL, last_error = ?2, updated_at = ?4
                     WHERE id = ?1 AND status IN ('sending', 'paused') AND deleted_at IS NULL",
                    params![id, reason, max_dispatch_attempts as i64, to_millis(now)],
                )
            },
        )?;

        warn!(
            campaign_id = %id,
            status = %campaign.status,
            dispatch_attempts = campaign.dispatch_attempts,
            reason = %reason,
            "campaign_dispatch_failed"
        );
        Ok(campaign)
    }

    /// Fatal validation failure: the campaign cannot be sent as configured.
    pub fn mark_invalid(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        let campaign = self.transition(
            id,
            CampaignStatus::Failed,
            |conn| {
                conn.execute(
                    "UPDATE campaigns
                     SET status = 'failed', sent_at = NULL, scheduled_at = NULL,
                         last_error = ?2, updated_at = ?3
                     WHERE id = ?1 AND status = 'sending' AND deleted_at IS NULL",
                    params![id, reason, to_millis(now)],
                )
            },
        )?;

        warn!(campaign_id = %id, reason = %reason, "campaign_invalid");
        Ok(campaign)
    }

    /// Stop dequeuing further batches. In-flight batches run to completion.
    pub fn pause(&self, id: &str, now: DateTime<Utc>) -> Result<Campaign, CampaignError> {
        let campaign = self.transition(
            id,
            CampaignStatus::Paused,
            |conn| {
                conn.execute(
                    "UPDATE campaigns SET status = 'paused', sent_at = NULL, updated_at = ?2
                     WHERE id = ?1 AND status = 'sending' AND deleted_at IS NULL",
                    params![id, to_millis(now)],
                )
            },
        )?;

        info!(campaign_id = %id, "campaign_paused");
        Ok(campaign)
    }

    pub fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<Campaign, CampaignError> {
        let campaign = self.transition(
            id,
            CampaignStatus::Sending,
            |conn| {
                conn.execute(
                    "UPDATE campaigns SET status = 'sending', sent_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND status = 'paused' AND deleted_at IS NULL",
                    params![id, to_millis(now)],
                )
            },
        )?;

        info!(campaign_id = %id, "campaign_resumed");
        Ok(campaign)
    }

    /// Abandon an active send. Batches not yet dispatched are dropped.
    pub fn stop(&self, id: &str, now: DateTime<Utc>) -> Result<Campaign, CampaignError> {
        let campaign = self.transition(
            id,
            CampaignStatus::Cancelled,
            |conn| {
                conn.execute(
                    "UPDATE campaigns
                     SET status = 'cancelled', sent_at = NULL, scheduled_at = NULL, updated_at = ?2
                     WHERE id = ?1 AND status IN ('sending', 'paused') AND deleted_at IS NULL",
                    params![id, to_millis(now)],
                )
            },
        )?;

        info!(campaign_id = %id, "campaign_stopped");
        Ok(campaign)
    }

    /// Scheduled campaigns whose time has come, oldest first.
    pub fn due_campaigns(&self, now: DateTime<Utc>, limit: usize) -> DbResult<Vec<Campaign>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CAMPAIGN_COLUMNS} FROM campaigns
                 WHERE status = 'scheduled' AND scheduled_at <= ?1 AND deleted_at IS NULL
                 ORDER BY scheduled_at ASC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![to_millis(now), limit as i64], CampaignRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(CampaignRow::into_campaign).collect()
        })
    }

    /// Apply a conditional update and report why it did not match.
    fn transition<F>(
        &self,
        id: &str,
        to: CampaignStatus,
        update: F,
    ) -> Result<Campaign, CampaignError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<usize>,
    {
        self.with_tx(|tx| {
            let changed = update(&**tx)?;
            let current = query_campaign(&**tx, id)?
                .filter(|c| c.deleted_at.is_none())
                .ok_or_else(|| CampaignError::NotFound(id.to_string()))?;

            if changed == 0 {
                return Err(CampaignError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }
            Ok(current)
        })
    }
}

fn validate_schedule(
    when: DateTime<Utc>,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<(), CampaignError> {
    if when <= now {
        return Err(CampaignError::InvalidSchedule(format!(
            "scheduled time {when} is not in the future"
        )));
    }
    let tz = timezone.trim();
    if tz.is_empty() || tz.len() > MAX_TIMEZONE_LEN {
        return Err(CampaignError::InvalidSchedule(format!(
            "invalid timezone {timezone:?}"
        )));
    }
    Ok(())
}

fn status_list(statuses: &[CampaignStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}
