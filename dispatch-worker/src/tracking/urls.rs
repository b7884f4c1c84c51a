//! Tracking URL construction and decoding.
//!
//! - Open pixel: `{base}/track/open?c={campaign}&ct={contact}&t={unix_millis}`
//! - Click redirect: `{base}/track/click?c={campaign}&ct={contact}&url={encoded}`
//! - Unsubscribe: `{base}/unsubscribe?c={campaign}&ct={contact}&s={hmac}`

use chrono::{DateTime, Utc};
use url::{form_urlencoded, Url};

use crate::signature::{constant_time_compare, hmac_hex};

pub const OPEN_PATH: &str = "/track/open";
pub const CLICK_PATH: &str = "/track/click";
pub const UNSUBSCRIBE_PATH: &str = "/unsubscribe";

#[derive(Debug, Clone)]
pub struct TrackingUrls {
    base_url: String,
    secret: String,
}

impl TrackingUrls {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            secret: secret.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn pixel_url(&self, campaign_id: &str, contact_id: &str, at: DateTime<Utc>) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("c", campaign_id)
            .append_pair("ct", contact_id)
            .append_pair("t", &at.timestamp_millis().to_string())
            .finish();
        format!("{}{OPEN_PATH}?{query}", self.base_url)
    }

    pub fn click_url(&self, campaign_id: &str, contact_id: &str, target: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("c", campaign_id)
            .append_pair("ct", contact_id)
            .append_pair("url", target)
            .finish();
        format!("{}{CLICK_PATH}?{query}", self.base_url)
    }

    pub fn unsubscribe_url(&self, campaign_id: &str, contact_id: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("c", campaign_id)
            .append_pair("ct", contact_id)
            .append_pair("s", &self.unsubscribe_token(campaign_id, contact_id))
            .finish();
        format!("{}{UNSUBSCRIBE_PATH}?{query}", self.base_url)
    }

    /// Deterministic per-recipient token: hex HMAC-SHA256 of `campaign:contact`.
    pub fn unsubscribe_token(&self, campaign_id: &str, contact_id: &str) -> String {
        hmac_hex(&self.secret, format!("{campaign_id}:{contact_id}").as_bytes())
    }

    pub fn verify_unsubscribe_token(&self, campaign_id: &str, contact_id: &str, token: &str) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        constant_time_compare(&self.unsubscribe_token(campaign_id, contact_id), token)
    }

    /// True for URLs this gateway generated, so they are never wrapped twice.
    pub fn is_tracking_url(&self, href: &str) -> bool {
        [OPEN_PATH, CLICK_PATH, UNSUBSCRIBE_PATH]
            .iter()
            .any(|path| href.starts_with(&format!("{}{path}", self.base_url)))
    }
}

/// Original destination carried by a click-redirect URL.
pub fn decode_click_target(click_url: &str) -> Option<String> {
    let parsed = Url::parse(click_url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "url")
        .map(|(_, v)| v.into_owned())
}
