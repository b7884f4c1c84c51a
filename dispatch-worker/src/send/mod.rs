//! Send adapter: personalise, track and hand one message to the provider.

pub mod provider;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::contacts::Recipient;
use crate::html::parser::html_to_text;
use crate::tracking::merge::{self, Context};
use crate::tracking::TrackingGateway;

pub use provider::{
    ErrorCode, HttpProvider, MessageTag, OutboundEmail, Provider, ProviderError, ProviderReceipt,
};

/// Subject, bodies and sender identity captured when a batch is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
    pub from_name: String,
    pub from_email: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Per-recipient outcome. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error_code: Option<ErrorCode>,
}

impl SendResult {
    fn delivered(receipt: ProviderReceipt) -> Self {
        Self {
            success: true,
            provider_message_id: receipt.message_id,
            error_code: None,
        }
    }

    fn failed(code: ErrorCode) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error_code: Some(code),
        }
    }
}

pub struct SendAdapter<P> {
    provider: P,
    gateway: TrackingGateway,
}

impl<P: Provider> SendAdapter<P> {
    pub fn new(provider: P, gateway: TrackingGateway) -> Self {
        Self { provider, gateway }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Render the message `recipient` would receive for this campaign.
    pub fn render(
        &self,
        campaign_id: &str,
        recipient: &Recipient,
        template: &MessageTemplate,
        at: DateTime<Utc>,
    ) -> OutboundEmail {
        let subject = merge::render(&template.subject, recipient, Context::Plain);
        let personalised = merge::render(&template.html_body, recipient, Context::Html);
        let html = self
            .gateway
            .wrap(&personalised, campaign_id, &recipient.contact_id, at);

        let body_text = match template.text_body.as_deref() {
            Some(text) if !text.trim().is_empty() => merge::render(text, recipient, Context::Plain),
            _ => html_to_text(&personalised),
        };
        let unsubscribe = self
            .gateway
            .urls()
            .unsubscribe_url(campaign_id, &recipient.contact_id);
        let text = format!("{body_text}\n\nUnsubscribe: {unsubscribe}");

        OutboundEmail {
            from: format_mailbox(&template.from_name, &template.from_email),
            to: vec![recipient.email.clone()],
            subject,
            html,
            text: Some(text),
            reply_to: template.reply_to.clone().filter(|r| !r.trim().is_empty()),
            tags: vec![
                MessageTag::new("campaign_id", campaign_id),
                MessageTag::new("contact_id", &recipient.contact_id),
            ],
        }
    }

    /// Send to one recipient. Provider failures are classified and returned,
    /// so one bad recipient never aborts the rest of a batch.
    pub async fn send(
        &self,
        campaign_id: &str,
        recipient: &Recipient,
        template: &MessageTemplate,
        at: DateTime<Utc>,
    ) -> SendResult {
        let email = self.render(campaign_id, recipient, template, at);
        match self.provider.send(&email).await {
            Ok(receipt) => {
                debug!(
                    campaign_id = %campaign_id,
                    contact_id = %recipient.contact_id,
                    message_id = ?receipt.message_id,
                    "provider_send_ok"
                );
                SendResult::delivered(receipt)
            }
            Err(e) => {
                let code = e.code();
                warn!(
                    campaign_id = %campaign_id,
                    contact_id = %recipient.contact_id,
                    error_code = code.as_str(),
                    transient = code.is_transient(),
                    error = %e,
                    "provider_send_failed"
                );
                SendResult::failed(code)
            }
        }
    }
}

fn format_mailbox(name: &str, email: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return email.to_string();
    }
    if name.contains([',', '"', '<', '>', '@', ';', ':']) {
        format!("\"{}\" <{email}>", name.replace('"', "'"))
    } else {
        format!("{name} <{email}>")
    }
}
