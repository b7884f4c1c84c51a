//! Sender warmup: a staged daily volume cap for new sending identities.
//!
//! | stage | account age | daily limit |
//! |-------|-------------|-------------|
//! | 1     | 0-3 days    | 50          |
//! | 2     | 4-7 days    | 200         |
//! | 3     | 8-14 days   | 1000        |
//! | 4     | 15+ days    | unlimited   |
//!
//! Owners with no warmup record are not throttled.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{parse_date, Database, DbError};
use crate::error::QuotaExceeded;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct WarmupStage(u8);

impl WarmupStage {
    pub const FIRST: WarmupStage = WarmupStage(1);
    pub const COMPLETE: WarmupStage = WarmupStage(4);

    /// Stage reached after `age_days` days of account age.
    pub fn for_age(age_days: i64) -> Self {
        match age_days {
            i64::MIN..=3 => WarmupStage(1),
            4..=7 => WarmupStage(2),
            8..=14 => WarmupStage(3),
            _ => WarmupStage(4),
        }
    }

    pub fn number(&self) -> u8 {
        self.0
    }

    /// `None` once warmup is complete.
    pub fn daily_limit(&self) -> Option<u32> {
        match self.0 {
            1 => Some(50),
            2 => Some(200),
            3 => Some(1000),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.daily_limit().is_some()
    }

    fn from_stored(raw: i64) -> Self {
        WarmupStage(raw.clamp(1, 4) as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmupState {
    pub owner_id: String,
    pub stage: WarmupStage,
    pub started_on: NaiveDate,
    pub daily_limit: Option<u32>,
    pub sent_today: u32,
    pub last_reset_on: NaiveDate,
    pub spf_verified: bool,
    pub dkim_verified: bool,
    pub dmarc_verified: bool,
}

impl WarmupState {
    pub fn remaining(&self) -> Option<u32> {
        self.daily_limit
            .map(|limit| limit.saturating_sub(self.sent_today))
    }
}

/// Result of a successful quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAllowance {
    /// No cap applies.
    Unlimited,
    /// The requested count fits; this many sends remain today before it.
    Within { remaining: u32 },
}

#[derive(Debug, Error)]
pub enum WarmupError {
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),
    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<rusqlite::Error> for WarmupError {
    fn from(e: rusqlite::Error) -> Self {
        WarmupError::Database(DbError::Sqlite(e))
    }
}

impl Database {
    /// Begin warmup for an owner. Existing records are left untouched.
    pub fn start_warmup(&self, owner_id: &str, started_on: NaiveDate) -> Result<(), DbError> {
        let stage = WarmupStage::FIRST;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO warmup_state
                    (owner_id, stage, started_on, daily_limit, sent_today, last_reset_on)
                 VALUES (?1, ?2, ?3, ?4, 0, ?3)",
                params![
                    owner_id,
                    stage.number(),
                    started_on.to_string(),
                    stage.daily_limit()
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_warmup(&self, owner_id: &str) -> Result<Option<WarmupState>, DbError> {
        self.with_conn(|conn| query_warmup(conn, owner_id))
    }

    pub fn set_dns_verification(
        &self,
        owner_id: &str,
        spf: bool,
        dkim: bool,
        dmarc: bool,
    ) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE warmup_state SET spf_verified = ?2, dkim_verified = ?3, dmarc_verified = ?4
                 WHERE owner_id = ?1",
                params![owner_id, spf, dkim, dmarc],
            )?;
            Ok(changed == 1)
        })
    }

    /// Check whether `count` more sends fit in today's allowance.
    ///
    /// Resets the daily counter first when the stored reset date is not `today`.
    pub fn can_send(
        &self,
        owner_id: &str,
        count: u32,
        today: NaiveDate,
    ) -> Result<SendAllowance, WarmupError> {
        let state = self.with_conn(|conn| {
            reset_if_stale(conn, owner_id, today)?;
            query_warmup(conn, owner_id)
        })?;

        let state = match state {
            Some(state) => state,
            None => return Ok(SendAllowance::Unlimited),
        };

        match (state.daily_limit, state.remaining()) {
            (Some(limit), Some(remaining)) => {
                if count > remaining {
                    debug!(
                        owner_id = %owner_id,
                        requested = count,
                        limit = limit,
                        remaining = remaining,
                        "warmup_quota_denied"
                    );
                    Err(QuotaExceeded { limit, remaining }.into())
                } else {
                    Ok(SendAllowance::Within { remaining })
                }
            }
            _ => Ok(SendAllowance::Unlimited),
        }
    }

    /// Add `count` sends to today's counter.
    pub fn record_send(&self, owner_id: &str, count: u32, today: NaiveDate) -> Result<(), DbError> {
        if count == 0 {
            return Ok(());
        }
        self.with_conn(|conn| {
            reset_if_stale(conn, owner_id, today)?;
            conn.execute(
                "UPDATE warmup_state SET sent_today = sent_today + ?2 WHERE owner_id = ?1",
                params![owner_id, count],
            )?;
            Ok(())
        })
    }

    /// Advance every active warmup to the stage its age implies.
    ///
    /// Idempotent and monotonic: a stage never moves backwards. Returns the
    /// number of owners whose stage changed.
    pub fn recompute_warmup_stages(&self, today: NaiveDate) -> Result<usize, DbError> {
        self.with_tx(|tx| {
            let mut stmt =
                tx.prepare("SELECT owner_id, stage, started_on FROM warmup_state WHERE stage < 4")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut advanced = 0;
            for (owner_id, stored, started_on) in rows {
                let current = WarmupStage::from_stored(stored);
                let age_days = (today - parse_date(&started_on)?).num_days();
                let target = WarmupStage::for_age(age_days).max(current);

                if target != current {
                    tx.execute(
                        "UPDATE warmup_state SET stage = ?2, daily_limit = ?3 WHERE owner_id = ?1",
                        params![owner_id, target.number(), target.daily_limit()],
                    )?;
                    info!(
                        owner_id = %owner_id,
                        from_stage = current.number(),
                        to_stage = target.number(),
                        age_days = age_days,
                        "warmup_stage_advanced"
                    );
                    advanced += 1;
                }
            }
            Ok(advanced)
        })
    }
}

fn reset_if_stale(conn: &Connection, owner_id: &str, today: NaiveDate) -> Result<(), DbError> {
    let reset = conn.execute(
        "UPDATE warmup_state SET sent_today = 0, last_reset_on = ?2
         WHERE owner_id = ?1 AND last_reset_on <> ?2",
        params![owner_id, today.to_string()],
    )?;
    if reset > 0 {
        debug!(owner_id = %owner_id, today = %today, "warmup_daily_counter_reset");
    }
    Ok(())
}

fn query_warmup(conn: &Connection, owner_id: &str) -> Result<Option<WarmupState>, DbError> {
    let raw = conn
        .query_row(
            "SELECT owner_id, stage, started_on, daily_limit, sent_today, last_reset_on,
                    spf_verified, dkim_verified, dmarc_verified
             FROM warmup_state WHERE owner_id = ?1",
            [owner_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, bool>(8)?,
                ))
            },
        )
        .optional()?;

    raw.map(
        |(owner_id, stage, started_on, limit, sent, reset_on, spf, dkim, dmarc)| {
            Ok(WarmupState {
                owner_id,
                stage: WarmupStage::from_stored(stage),
                started_on: parse_date(&started_on)?,
                daily_limit: limit.map(|l| l.max(0) as u32),
                sent_today: sent.max(0) as u32,
                last_reset_on: parse_date(&reset_on)?,
                spf_verified: spf,
                dkim_verified: dkim,
                dmarc_verified: dmarc,
            })
        },
    )
    .transpose()
}
