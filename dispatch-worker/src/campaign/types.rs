//! Campaign record types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a campaign.
///
/// ```text
/// draft ──schedule──▶ scheduled ──tick──▶ sending ──last batch──▶ sent
///   ▲                   │  ▲                │  ▲
///   └──────cancel───────┘  └──mark_failed───┤  └─resume─┐
///                                           └──pause──▶ paused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Paused,
    Cancelled,
    /// Terminal: the campaign could not be dispatched and will not be retried.
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Cancelled => "cancelled",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "paused" => Ok(CampaignStatus::Paused),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// Cumulative delivery and engagement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub sent: u64,
    pub delivered: u64,
    pub bounced: u64,
    pub complained: u64,
    pub unsubscribed: u64,
    pub opened: u64,
    pub clicked: u64,
}

/// Counter column addressed by an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Sent,
    Delivered,
    Bounced,
    Complained,
    Unsubscribed,
    Opened,
    Clicked,
}

impl Counter {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Counter::Sent => "emails_sent",
            Counter::Delivered => "emails_delivered",
            Counter::Bounced => "emails_bounced",
            Counter::Complained => "emails_complained",
            Counter::Unsubscribed => "emails_unsubscribed",
            Counter::Opened => "emails_opened",
            Counter::Clicked => "emails_clicked",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub reply_to: Option<String>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub recipient_count: u64,
    pub counters: CampaignCounters,
    pub dispatch_attempts: u32,
    pub last_error: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn has_body(&self) -> bool {
        !self.html_body.trim().is_empty()
            || self
                .text_body
                .as_deref()
                .map(|t| !t.trim().is_empty())
                .unwrap_or(false)
    }
}

/// Fields supplied when a campaign draft is created.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCampaign {
    pub owner_id: String,
    pub name: String,
    pub subject: String,
    #[serde(default)]
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub list_ids: Vec<String>,
}
