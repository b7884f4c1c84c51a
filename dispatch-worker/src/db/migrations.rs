use rusqlite::Connection;
use tracing::info;

use super::DbResult;

pub fn run(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS campaigns (
            id                  TEXT PRIMARY KEY,
            owner_id            TEXT NOT NULL,
            name                TEXT NOT NULL,
            subject             TEXT NOT NULL,
            html_body           TEXT NOT NULL DEFAULT '',
            text_body           TEXT,
            from_name           TEXT,
            from_email          TEXT,
            reply_to            TEXT,
            status              TEXT NOT NULL DEFAULT 'draft',
            scheduled_at        INTEGER,
            timezone            TEXT,
            sent_at             INTEGER,
            recipient_count     INTEGER NOT NULL DEFAULT 0,
            emails_sent         INTEGER NOT NULL DEFAULT 0,
            emails_delivered    INTEGER NOT NULL DEFAULT 0,
            emails_bounced      INTEGER NOT NULL DEFAULT 0,
            emails_complained   INTEGER NOT NULL DEFAULT 0,
            emails_unsubscribed INTEGER NOT NULL DEFAULT 0,
            emails_opened       INTEGER NOT NULL DEFAULT 0,
            emails_clicked      INTEGER NOT NULL DEFAULT 0,
            dispatch_attempts   INTEGER NOT NULL DEFAULT 0,
            last_error          TEXT,
            deleted_at          INTEGER,
            created_at          INTEGER NOT NULL,
            updated_at          INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_campaigns_due
            ON campaigns(status, scheduled_at);

        CREATE TABLE IF NOT EXISTS contacts (
            id              TEXT PRIMARY KEY,
            owner_id        TEXT NOT NULL,
            email           TEXT NOT NULL,
            first_name      TEXT,
            last_name       TEXT,
            company         TEXT,
            custom_fields   TEXT NOT NULL DEFAULT '{}',
            status          TEXT NOT NULL DEFAULT 'subscribed',
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            UNIQUE(owner_id, email)
        );

        CREATE TABLE IF NOT EXISTS contact_lists (
            id          TEXT PRIMARY KEY,
            owner_id    TEXT NOT NULL,
            name        TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS list_members (
            list_id     TEXT NOT NULL REFERENCES contact_lists(id),
            contact_id  TEXT NOT NULL REFERENCES contacts(id),
            added_at    INTEGER NOT NULL,
            PRIMARY KEY (list_id, contact_id)
        );

        CREATE TABLE IF NOT EXISTS campaign_lists (
            campaign_id TEXT NOT NULL REFERENCES campaigns(id),
            list_id     TEXT NOT NULL REFERENCES contact_lists(id),
            PRIMARY KEY (campaign_id, list_id)
        );

        CREATE TABLE IF NOT EXISTS email_events (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id     TEXT NOT NULL,
            contact_id      TEXT NOT NULL,
            event_type      TEXT NOT NULL,
            occurred_at     INTEGER NOT NULL,
            metadata        TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_events_campaign
            ON email_events(campaign_id, event_type, contact_id);

        CREATE TABLE IF NOT EXISTS warmup_state (
            owner_id        TEXT PRIMARY KEY,
            stage           INTEGER NOT NULL DEFAULT 1,
            started_on      TEXT NOT NULL,
            daily_limit     INTEGER,
            sent_today      INTEGER NOT NULL DEFAULT 0,
            last_reset_on   TEXT NOT NULL,
            spf_verified    INTEGER NOT NULL DEFAULT 0,
            dkim_verified   INTEGER NOT NULL DEFAULT 0,
            dmarc_verified  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS queue_jobs (
            id              TEXT PRIMARY KEY,
            campaign_id     TEXT NOT NULL,
            owner_id        TEXT NOT NULL,
            payload         TEXT NOT NULL,
            batch_number    INTEGER NOT NULL,
            total_batches   INTEGER NOT NULL,
            priority        INTEGER NOT NULL,
            state           TEXT NOT NULL DEFAULT 'waiting',
            attempts        INTEGER NOT NULL DEFAULT 0,
            max_attempts    INTEGER NOT NULL,
            run_at          INTEGER NOT NULL,
            progress        TEXT,
            last_error      TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            finished_at     INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_queue_jobs_ready
            ON queue_jobs(state, priority, run_at);

        CREATE INDEX IF NOT EXISTS idx_queue_jobs_campaign
            ON queue_jobs(campaign_id, state);
        ",
    )?;

    info!("database_migrations_complete");
    Ok(())
}
