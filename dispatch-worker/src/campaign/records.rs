//! Campaign record storage: creation, lookup, list targeting and counters.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::types::{Campaign, CampaignCounters, CampaignStatus, Counter, NewCampaign};
use crate::db::{from_millis, opt_from_millis, to_millis, Database, DbError, DbResult};

pub(crate) const CAMPAIGN_COLUMNS: &str = "id, owner_id, name, subject, html_body, text_body,
    from_name, from_email, reply_to, status, scheduled_at, timezone, sent_at, recipient_count,
    emails_sent, emails_delivered, emails_bounced, emails_complained, emails_unsubscribed,
    emails_opened, emails_clicked, dispatch_attempts, last_error, deleted_at, created_at, updated_at";

impl Database {
    pub fn create_campaign(&self, new: &NewCampaign, now: DateTime<Utc>) -> DbResult<Campaign> {
        let id = Uuid::new_v4().to_string();
        let ts = to_millis(now);

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO campaigns (id, owner_id, name, subject, html_body, text_body,
                    from_name, from_email, reply_to, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'draft', ?10, ?10)",
                params![
                    id,
                    new.owner_id,
                    new.name,
                    new.subject,
                    new.html_body,
                    new.text_body,
                    new.from_name,
                    new.from_email,
                    new.reply_to,
                    ts
                ],
            )?;
            for list_id in &new.list_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO campaign_lists (campaign_id, list_id) VALUES (?1, ?2)",
                    params![id, list_id],
                )?;
            }
            query_campaign(tx, &id)?
                .ok_or_else(|| DbError::Corrupt(format!("campaign {id} vanished after insert")))
        })
    }

    /// Fetch a campaign that has not been soft-deleted.
    pub fn get_campaign(&self, id: &str) -> DbResult<Option<Campaign>> {
        self.with_conn(|conn| Ok(query_campaign(conn, id)?.filter(|c| c.deleted_at.is_none())))
    }

    pub fn soft_delete_campaign(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE campaigns SET deleted_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, to_millis(now)],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn attach_list(&self, campaign_id: &str, list_id: &str) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO campaign_lists (campaign_id, list_id) VALUES (?1, ?2)",
                params![campaign_id, list_id],
            )?;
            Ok(())
        })
    }

    /// Replace subject and bodies. Active sends keep their enqueued snapshot.
    pub fn update_campaign_content(
        &self,
        id: &str,
        subject: &str,
        html_body: &str,
        text_body: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE campaigns SET subject = ?2, html_body = ?3, text_body = ?4, updated_at = ?5
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, subject, html_body, text_body, to_millis(now)],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn set_recipient_count(&self, id: &str, count: u64) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE campaigns SET recipient_count = ?2 WHERE id = ?1",
                params![id, count as i64],
            )?;
            Ok(())
        })
    }

    /// Add `by` to one counter. Counters only ever grow.
    pub fn increment_counter(&self, id: &str, counter: Counter, by: u64) -> DbResult<()> {
        if by == 0 {
            return Ok(());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "UPDATE campaigns SET {col} = {col} + ?2 WHERE id = ?1",
                col = counter.column()
            );
            conn.execute(&sql, params![id, by as i64])?;
            Ok(())
        })
    }
}

pub(crate) fn query_campaign(conn: &Connection, id: &str) -> DbResult<Option<Campaign>> {
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1");
    let raw = conn.query_row(&sql, [id], CampaignRow::from_row).optional()?;
    raw.map(CampaignRow::into_campaign).transpose()
}

/// Raw column values, converted to a [`Campaign`] outside the rusqlite closure
/// so malformed values surface as [`DbError::Corrupt`].
pub(crate) struct CampaignRow {
    id: String,
    owner_id: String,
    name: String,
    subject: String,
    html_body: String,
    text_body: Option<String>,
    from_name: Option<String>,
    from_email: Option<String>,
    reply_to: Option<String>,
    status: String,
    scheduled_at: Option<i64>,
    timezone: Option<String>,
    sent_at: Option<i64>,
    recipient_count: i64,
    counters: [i64; 7],
    dispatch_attempts: i64,
    last_error: Option<String>,
    deleted_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl CampaignRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            subject: row.get(3)?,
            html_body: row.get(4)?,
            text_body: row.get(5)?,
            from_name: row.get(6)?,
            from_email: row.get(7)?,
            reply_to: row.get(8)?,
            status: row.get(9)?,
            scheduled_at: row.get(10)?,
            timezone: row.get(11)?,
            sent_at: row.get(12)?,
            recipient_count: row.get(13)?,
            counters: [
                row.get(14)?,
                row.get(15)?,
                row.get(16)?,
                row.get(17)?,
                row.get(18)?,
                row.get(19)?,
                row.get(20)?,
            ],
            dispatch_attempts: row.get(21)?,
            last_error: row.get(22)?,
            deleted_at: row.get(23)?,
            created_at: row.get(24)?,
            updated_at: row.get(25)?,
        })
    }

    pub(crate) fn into_campaign(self) -> DbResult<Campaign> {
        let status: CampaignStatus = self.status.parse().map_err(DbError::Corrupt)?;
        let [sent, delivered, bounced, complained, unsubscribed, opened, clicked] =
            self.counters.map(|v| v.max(0) as u64);

        Ok(Campaign {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            subject: self.subject,
            html_body: self.html_body,
            text_body: self.text_body,
            from_name: self.from_name,
            from_email: self.from_email,
            reply_to: self.reply_to,
            status,
            scheduled_at: opt_from_millis(self.scheduled_at)?,
            timezone: self.timezone,
            sent_at: opt_from_millis(self.sent_at)?,
            recipient_count: self.recipient_count.max(0) as u64,
            counters: CampaignCounters {
                sent,
                delivered,
                bounced,
                complained,
                unsubscribed,
                opened,
                clicked,
            },
            dispatch_attempts: self.dispatch_attempts.max(0) as u32,
            last_error: self.last_error,
            deleted_at: opt_from_millis(self.deleted_at)?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}
