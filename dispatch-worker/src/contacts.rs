//! Contacts, contact lists and recipient selection.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{to_millis, Database, DbError, DbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
    Bounced,
    Complained,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Subscribed => "subscribed",
            SubscriptionStatus::Unsubscribed => "unsubscribed",
            SubscriptionStatus::Bounced => "bounced",
            SubscriptionStatus::Complained => "complained",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribed" => Ok(SubscriptionStatus::Subscribed),
            "unsubscribed" => Ok(SubscriptionStatus::Unsubscribed),
            "bounced" => Ok(SubscriptionStatus::Bounced),
            "complained" => Ok(SubscriptionStatus::Complained),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Contact {
    pub id: String,
    pub owner_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewContact {
    pub owner_id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
}

/// Per-recipient snapshot carried inside a queue job.
///
/// Custom field values are flattened to strings so merge-tag substitution does
/// not depend on the contact record at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub contact_id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
}

impl From<Contact> for Recipient {
    fn from(contact: Contact) -> Self {
        let custom_fields = contact
            .custom_fields
            .into_iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::Null => String::new(),
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, rendered)
            })
            .collect();

        Recipient {
            contact_id: contact.id,
            email: contact.email,
            first_name: contact.first_name,
            last_name: contact.last_name,
            company: contact.company,
            custom_fields,
        }
    }
}

const CONTACT_COLUMNS: &str =
    "c.id, c.owner_id, c.email, c.first_name, c.last_name, c.company, c.custom_fields, c.status";

impl Database {
    pub fn create_contact(&self, new: &NewContact, now: DateTime<Utc>) -> DbResult<Contact> {
        let id = Uuid::new_v4().to_string();
        let fields = serde_json::to_string(&new.custom_fields)
            .map_err(|e| DbError::Corrupt(format!("custom fields not serializable: {e}")))?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (id, owner_id, email, first_name, last_name, company,
                    custom_fields, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'subscribed', ?8, ?8)",
                params![
                    id,
                    new.owner_id,
                    new.email.trim().to_lowercase(),
                    new.first_name,
                    new.last_name,
                    new.company,
                    fields,
                    to_millis(now)
                ],
            )?;
            Ok(())
        })?;

        self.get_contact(&id)?
            .ok_or_else(|| DbError::Corrupt(format!("contact {id} vanished after insert")))
    }

    pub fn get_contact(&self, id: &str) -> DbResult<Option<Contact>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts c WHERE c.id = ?1");
            let raw = conn.query_row(&sql, [id], ContactRow::from_row).optional()?;
            raw.map(ContactRow::into_contact).transpose()
        })
    }

    pub fn create_list(&self, owner_id: &str, name: &str, now: DateTime<Utc>) -> DbResult<String> {
        let id = Uuid::new_v4().to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contact_lists (id, owner_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, owner_id, name, to_millis(now)],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn add_to_list(&self, list_id: &str, contact_id: &str, now: DateTime<Utc>) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO list_members (list_id, contact_id, added_at)
                 VALUES (?1, ?2, ?3)",
                params![list_id, contact_id, to_millis(now)],
            )?;
            Ok(())
        })
    }

    /// Returns `false` when the contact does not exist.
    pub fn set_subscription_status(
        &self,
        contact_id: &str,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE contacts SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![contact_id, status.as_str(), to_millis(now)],
            )?;
            Ok(changed == 1)
        })
    }

    /// Subscribed contacts across every list targeted by the campaign,
    /// de-duplicated by contact id, in stable insertion order.
    ///
    /// With `skip_already_sent`, contacts holding a `sent` event for this
    /// campaign are left out so a re-dispatch does not mail them twice.
    pub fn eligible_recipients(
        &self,
        campaign_id: &str,
        skip_already_sent: bool,
    ) -> DbResult<Vec<Recipient>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts c
                 WHERE c.status = 'subscribed'
                   AND c.owner_id = (SELECT owner_id FROM campaigns WHERE id = ?1)
                   AND EXISTS (
                       SELECT 1 FROM list_members m
                       JOIN campaign_lists cl ON cl.list_id = m.list_id
                       WHERE cl.campaign_id = ?1 AND m.contact_id = c.id
                   )
                   AND (?2 = 0 OR NOT EXISTS (
                       SELECT 1 FROM email_events e
                       WHERE e.campaign_id = ?1 AND e.contact_id = c.id AND e.event_type = 'sent'
                   ))
                 ORDER BY c.created_at ASC, c.rowid ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![campaign_id, skip_already_sent], ContactRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|raw| raw.into_contact().map(Recipient::from))
                .collect()
        })
    }
}

struct ContactRow {
    id: String,
    owner_id: String,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    company: Option<String>,
    custom_fields: String,
    status: String,
}

impl ContactRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            email: row.get(2)?,
            first_name: row.get(3)?,
            last_name: row.get(4)?,
            company: row.get(5)?,
            custom_fields: row.get(6)?,
            status: row.get(7)?,
        })
    }

    fn into_contact(self) -> DbResult<Contact> {
        let custom_fields = serde_json::from_str(&self.custom_fields)
            .map_err(|e| DbError::Corrupt(format!("contact {} custom fields: {e}", self.id)))?;
        Ok(Contact {
            status: self.status.parse().map_err(DbError::Corrupt)?,
            id: self.id,
            owner_id: self.owner_id,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            company: self.company,
            custom_fields,
        })
    }
}
