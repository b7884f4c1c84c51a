//! Tracking gateway: per-recipient pixel, click wrapping and unsubscribe footer.

pub mod merge;
pub mod rewrite;
pub mod urls;

use chrono::{DateTime, Utc};

pub use urls::{decode_click_target, TrackingUrls};

use rewrite::{insert_before_body_close, rewrite_hrefs};

/// Schemes a redirect cannot hand back to the mail client reliably.
const UNWRAPPED_SCHEMES: [&str; 3] = ["mailto:", "tel:", "sms:"];

#[derive(Debug, Clone)]
pub struct TrackingGateway {
    urls: TrackingUrls,
}

impl TrackingGateway {
    pub fn new(urls: TrackingUrls) -> Self {
        Self { urls }
    }

    pub fn urls(&self) -> &TrackingUrls {
        &self.urls
    }

    /// Wrap a personalised HTML body for one recipient.
    ///
    /// Links are wrapped first so the footer's unsubscribe link and the pixel
    /// are never routed through the click redirect.
    pub fn wrap(&self, html: &str, campaign_id: &str, contact_id: &str, at: DateTime<Utc>) -> String {
        let linked = self.wrap_links(html, campaign_id, contact_id);
        let footer = self.unsubscribe_footer(campaign_id, contact_id);
        let with_footer = insert_before_body_close(&linked, &footer);
        insert_before_body_close(&with_footer, &self.pixel_tag(campaign_id, contact_id, at))
    }

    pub fn wrap_links(&self, html: &str, campaign_id: &str, contact_id: &str) -> String {
        rewrite_hrefs(html, |href| {
            let href = href.trim();
            if !self.should_wrap(href) {
                return None;
            }
            Some(self.urls.click_url(campaign_id, contact_id, href))
        })
    }

    fn should_wrap(&self, href: &str) -> bool {
        if href.is_empty() || href.starts_with('#') || self.urls.is_tracking_url(href) {
            return false;
        }
        let lower = href.to_ascii_lowercase();
        !UNWRAPPED_SCHEMES.iter().any(|s| lower.starts_with(s))
    }

    fn pixel_tag(&self, campaign_id: &str, contact_id: &str, at: DateTime<Utc>) -> String {
        format!(
            r#"<img src="{}" width="1" height="1" alt="" style="display:block;border:0;width:1px;height:1px" />"#,
            self.urls.pixel_url(campaign_id, contact_id, at)
        )
    }

    fn unsubscribe_footer(&self, campaign_id: &str, contact_id: &str) -> String {
        format!(
            r#"<div style="margin-top:32px;font-size:12px;color:#888888;text-align:center"><a href="{}" style="color:#888888">Unsubscribe</a> from these emails.</div>"#,
            self.urls.unsubscribe_url(campaign_id, contact_id)
        )
    }
}
