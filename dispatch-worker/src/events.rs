//! Append-only email event log.
//!
//! One row per physical occurrence: two opens produce two rows. Unique
//! metrics are derived at read time by counting distinct contact ids.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::campaign::Counter;
use crate::db::{from_millis, to_millis, Database, DbError, DbResult};
use crate::util::user_agent::ClientInfo;

/// What happened, with the metadata that kind of event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventKind {
    Sent {
        #[serde(default)]
        provider_message_id: Option<String>,
    },
    Opened {
        #[serde(default)]
        client: ClientInfo,
    },
    Clicked {
        url: String,
        #[serde(default)]
        client: ClientInfo,
    },
    Bounced {
        #[serde(default)]
        provider_message_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    Complained {
        #[serde(default)]
        provider_message_id: Option<String>,
    },
    Unsubscribed,
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Sent { .. } => "sent",
            EventKind::Opened { .. } => "opened",
            EventKind::Clicked { .. } => "clicked",
            EventKind::Bounced { .. } => "bounced",
            EventKind::Complained { .. } => "complained",
            EventKind::Unsubscribed => "unsubscribed",
        }
    }

    /// Campaign counter bumped when this event is ingested.
    ///
    /// `sent` is counted per batch by the dispatch worker instead.
    pub fn counter(&self) -> Option<Counter> {
        match self {
            EventKind::Sent { .. } => None,
            EventKind::Opened { .. } => Some(Counter::Opened),
            EventKind::Clicked { .. } => Some(Counter::Clicked),
            EventKind::Bounced { .. } => Some(Counter::Bounced),
            EventKind::Complained { .. } => Some(Counter::Complained),
            EventKind::Unsubscribed => Some(Counter::Unsubscribed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailEvent {
    pub campaign_id: String,
    pub contact_id: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
}

impl EmailEvent {
    pub fn new(campaign_id: &str, contact_id: &str, kind: EventKind, at: DateTime<Utc>) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            contact_id: contact_id.to_string(),
            occurred_at: at,
            kind,
        }
    }
}

impl Database {
    /// Append one event row.
    pub fn append_event(&self, event: &EmailEvent) -> DbResult<i64> {
        let metadata = encode_metadata(&event.kind)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO email_events (campaign_id, contact_id, event_type, occurred_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.campaign_id,
                    event.contact_id,
                    event.kind.type_name(),
                    to_millis(event.occurred_at),
                    metadata
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Append an inbound engagement event and bump the matching campaign
    /// counter in one transaction.
    pub fn record_engagement(&self, event: &EmailEvent) -> DbResult<i64> {
        let metadata = encode_metadata(&event.kind)?;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO email_events (campaign_id, contact_id, event_type, occurred_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.campaign_id,
                    event.contact_id,
                    event.kind.type_name(),
                    to_millis(event.occurred_at),
                    metadata
                ],
            )?;
            let id = tx.last_insert_rowid();
            if let Some(counter) = event.kind.counter() {
                let sql = format!(
                    "UPDATE campaigns SET {col} = {col} + 1 WHERE id = ?1",
                    col = counter.column()
                );
                tx.execute(&sql, [&event.campaign_id])?;
            }
            Ok::<_, DbError>(id)
        })
    }

    pub fn events_for_campaign(&self, campaign_id: &str) -> DbResult<Vec<EmailEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT campaign_id, contact_id, occurred_at, metadata FROM email_events
                 WHERE campaign_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([campaign_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(campaign_id, contact_id, at, metadata)| {
                    let kind: EventKind = serde_json::from_str(&metadata)
                        .map_err(|e| DbError::Corrupt(format!("event metadata: {e}")))?;
                    Ok(EmailEvent {
                        campaign_id,
                        contact_id,
                        occurred_at: from_millis(at)?,
                        kind,
                    })
                })
                .collect()
        })
    }

    /// Raw number of events of `event_type` for a campaign.
    pub fn count_events(&self, campaign_id: &str, event_type: &str) -> DbResult<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM email_events WHERE campaign_id = ?1 AND event_type = ?2",
                params![campaign_id, event_type],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Number of distinct contacts with at least one `event_type` event.
    pub fn count_unique(&self, campaign_id: &str, event_type: &str) -> DbResult<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT contact_id) FROM email_events
                 WHERE campaign_id = ?1 AND event_type = ?2",
                params![campaign_id, event_type],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Contacts already holding a `sent` event for the campaign.
    pub fn sent_contact_ids(&self, campaign_id: &str) -> DbResult<HashSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT contact_id FROM email_events
                 WHERE campaign_id = ?1 AND event_type = 'sent'",
            )?;
            let ids = stmt
                .query_map([campaign_id], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn unique_opens(&self, campaign_id: &str) -> DbResult<u64> {
        self.count_unique(campaign_id, "opened")
    }

    pub fn unique_clicks(&self, campaign_id: &str) -> DbResult<u64> {
        self.count_unique(campaign_id, "clicked")
    }
}

fn encode_metadata(kind: &EventKind) -> DbResult<String> {
    serde_json::to_string(kind).map_err(|e| DbError::Corrupt(format!("event metadata: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::NewCampaign;

    fn campaign(db: &Database) -> String {
        db.create_campaign(
            &NewCampaign {
                owner_id: "o".into(),
                name: "n".into(),
                subject: "s".into(),
                html_body: "b".into(),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_event_kind_json_is_tagged() {
        let kind = EventKind::Clicked {
            url: "https://example.com/?a=1&b=2".into(),
            client: ClientInfo::default(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "clicked");
        assert_eq!(json["url"], "https://example.com/?a=1&b=2");
    }

    #[test]
    fn test_repeated_opens_are_all_recorded_but_unique_once() {
        let db = Database::open_in_memory().unwrap();
        let id = campaign(&db);
        let open = EmailEvent::new(
            &id,
            "contact-1",
            EventKind::Opened {
                client: ClientInfo::default(),
            },
            Utc::now(),
        );

        db.record_engagement(&open).unwrap();
        db.record_engagement(&open).unwrap();

        assert_eq!(db.count_events(&id, "opened").unwrap(), 2);
        assert_eq!(db.unique_opens(&id).unwrap(), 1);
        let c = db.get_campaign(&id).unwrap().unwrap();
        assert_eq!(c.counters.opened, 2);
    }

    #[test]
    fn test_sent_event_does_not_touch_counters() {
        let db = Database::open_in_memory().unwrap();
        let id = campaign(&db);
        db.append_event(&EmailEvent::new(
            &id,
            "contact-1",
            EventKind::Sent {
                provider_message_id: Some("msg-1".into()),
            },
            Utc::now(),
        ))
        .unwrap();

        let events = db.events_for_campaign(&id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            EventKind::Sent {
                provider_message_id: Some("msg-1".into())
            }
        );
        assert_eq!(db.get_campaign(&id).unwrap().unwrap().counters.sent, 0);
    }
}
