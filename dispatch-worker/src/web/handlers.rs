//! Tracking, unsubscribe and provider webhook endpoints.
//!
//! Tracking endpoints face recipients' mail clients: they never surface an
//! error for an unknown or malformed id, and recording failures are logged
//! rather than returned.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::campaign::Counter;
use crate::contacts::SubscriptionStatus;
use crate::events::{EmailEvent, EventKind};
use crate::signature::{is_signature_verification_enabled, verify_webhook_signature};
use crate::util::user_agent::classify;
use crate::web::AppState;

/// 1×1 transparent GIF.
pub static PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Tracking
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TrackParams {
    #[serde(default)]
    pub c: Option<String>,
    #[serde(default)]
    pub ct: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub s: Option<String>,
}

impl TrackParams {
    fn ids(&self) -> Option<(&str, &str)> {
        let c = self.c.as_deref().filter(|s| !s.is_empty())?;
        let ct = self.ct.as_deref().filter(|s| !s.is_empty())?;
        Some((c, ct))
    }
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok())
}

fn record(state: &AppState, event: EmailEvent) {
    let kind = event.kind.type_name();
    match state.db.record_engagement(&event) {
        Ok(_) => info!(
            campaign_id = %event.campaign_id,
            contact_id = %event.contact_id,
            event_type = kind,
            "tracking_event_recorded"
        ),
        Err(e) => error!(
            campaign_id = %event.campaign_id,
            contact_id = %event.contact_id,
            event_type = kind,
            error = %e,
            "tracking_event_record_failed"
        ),
    }
}

/// Open pixel. Always answers with the image.
pub async fn track_open(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TrackParams>,
) -> Response {
    if let Some((campaign_id, contact_id)) = params.ids() {
        let client = classify(user_agent(&headers));
        record(
            &state,
            EmailEvent::new(campaign_id, contact_id, EventKind::Opened { client }, Utc::now()),
        );
    }

    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
            (header::PRAGMA, "no-cache"),
        ],
        &PIXEL_GIF[..],
    )
        .into_response()
}

/// Click redirect to the original destination.
pub async fn track_click(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TrackParams>,
) -> Response {
    let Some(target) = params.url.as_deref().filter(|u| is_redirectable(u)) else {
        warn!(url = ?params.url, "click_target_invalid");
        return (StatusCode::BAD_REQUEST, "invalid link").into_response();
    };

    if let Some((campaign_id, contact_id)) = params.ids() {
        let client = classify(user_agent(&headers));
        record(
            &state,
            EmailEvent::new(
                campaign_id,
                contact_id,
                EventKind::Clicked {
                    url: target.to_string(),
                    client,
                },
                Utc::now(),
            ),
        );
    }

    (StatusCode::FOUND, [(header::LOCATION, target.to_string())]).into_response()
}

/// Only absolute web URLs are followed, so the endpoint is not an open
/// redirect to arbitrary schemes.
fn is_redirectable(target: &str) -> bool {
    url::Url::parse(target)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

const UNSUBSCRIBED_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>Unsubscribed</title></head><body><h1>You have been unsubscribed</h1>\
<p>You will no longer receive these emails.</p></body></html>";

const INVALID_LINK_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>Invalid link</title></head><body><h1>This unsubscribe link is not valid</h1>\
</body></html>";

/// Signed unsubscribe link from the message footer.
pub async fn unsubscribe(
    State(state): State<AppState>,
    Query(params): Query<TrackParams>,
) -> Response {
    let verified = params.ids().filter(|(c, ct)| {
        let token = params.s.as_deref().unwrap_or_default();
        state.tracking.verify_unsubscribe_token(c, ct, token)
    });

    let Some((campaign_id, contact_id)) = verified else {
        warn!(campaign_id = ?params.c, contact_id = ?params.ct, "unsubscribe_token_invalid");
        return (StatusCode::BAD_REQUEST, Html(INVALID_LINK_PAGE)).into_response();
    };

    let now = Utc::now();
    match state
        .db
        .set_subscription_status(contact_id, SubscriptionStatus::Unsubscribed, now)
    {
        Ok(true) => {
            record(
                &state,
                EmailEvent::new(campaign_id, contact_id, EventKind::Unsubscribed, now),
            );
            info!(campaign_id = %campaign_id, contact_id = %contact_id, "contact_unsubscribed");
        }
        Ok(false) => warn!(contact_id = %contact_id, "unsubscribe_contact_unknown"),
        Err(e) => {
            error!(contact_id = %contact_id, error = %e, "unsubscribe_failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "unsubscribe failed").into_response();
        }
    }

    Html(UNSUBSCRIBED_PAGE).into_response()
}

// =============================================================================
// Provider webhook
// =============================================================================

/// Provider notification envelope.
#[derive(Debug, Deserialize)]
pub struct ProviderEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: ProviderEventData,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderEventData {
    #[serde(default, alias = "email_id")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub bounce: Option<BounceDetail>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BounceDetail {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

fn webhook_reply(code: StatusCode, status: &'static str) -> Response {
    (code, Json(WebhookResponse { status })).into_response()
}

/// Bounce, complaint and delivery notifications from the provider.
///
/// Events that cannot be correlated are acknowledged and dropped; answering
/// with an error would only make the provider retry them.
pub async fn provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if is_signature_verification_enabled(&state.config.webhook_signing_key) {
        let key = state.config.webhook_signing_key.as_deref().unwrap_or_default();
        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
        };
        if !verify_webhook_signature(
            key,
            header_str("x-webhook-timestamp"),
            &body,
            header_str("x-webhook-signature"),
            state.config.webhook_max_age_secs,
        ) {
            warn!("provider_webhook_signature_invalid");
            return webhook_reply(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let event: ProviderEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "provider_webhook_malformed");
            return webhook_reply(StatusCode::BAD_REQUEST, "malformed");
        }
    };

    let tags = &event.data.tags;
    let (Some(campaign_id), Some(contact_id)) = (tags.get("campaign_id"), tags.get("contact_id"))
    else {
        warn!(event_type = %event.event_type, "provider_webhook_uncorrelated");
        return webhook_reply(StatusCode::OK, "ignored");
    };

    info!(
        event_type = %event.event_type,
        campaign_id = %campaign_id,
        contact_id = %contact_id,
        "provider_webhook_received"
    );

    let now = Utc::now();
    let message_id = event.data.message_id.clone();
    let result = match event.event_type.as_str() {
        "email.delivered" => state.db.increment_counter(campaign_id, Counter::Delivered, 1),
        "email.bounced" => {
            let reason = event.data.bounce.as_ref().and_then(|b| b.message.clone());
            suppress(
                &state,
                EmailEvent::new(
                    campaign_id,
                    contact_id,
                    EventKind::Bounced {
                        provider_message_id: message_id,
                        reason,
                    },
                    now,
                ),
                SubscriptionStatus::Bounced,
            )
        }
        "email.complained" => suppress(
            &state,
            EmailEvent::new(
                campaign_id,
                contact_id,
                EventKind::Complained {
                    provider_message_id: message_id,
                },
                now,
            ),
            SubscriptionStatus::Complained,
        ),
        other => {
            info!(event_type = %other, "provider_webhook_event_ignored");
            return webhook_reply(StatusCode::OK, "ignored");
        }
    };

    match result {
        Ok(()) => webhook_reply(StatusCode::OK, "recorded"),
        Err(e) => {
            error!(campaign_id = %campaign_id, error = %e, "provider_webhook_record_failed");
            webhook_reply(StatusCode::INTERNAL_SERVER_ERROR, "error")
        }
    }
}

/// Record the event and keep the contact out of future sends.
fn suppress(
    state: &AppState,
    event: EmailEvent,
    status: SubscriptionStatus,
) -> crate::db::DbResult<()> {
    state.db.record_engagement(&event)?;
    state
        .db
        .set_subscription_status(&event.contact_id, status, event.occurred_at)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::NewCampaign;
    use crate::contacts::NewContact;
    use crate::signature::hmac_hex;
    use crate::web::testing::{state, state_with, test_config};
    use crate::web::{router, AppState};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn seed(state: &AppState) -> (String, String) {
        let now = Utc::now();
        let contact = state
            .db
            .create_contact(
                &NewContact {
                    owner_id: "owner-1".into(),
                    email: "ada@example.com".into(),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        let campaign = state
            .db
            .create_campaign(
                &NewCampaign {
                    owner_id: "owner-1".into(),
                    name: "Launch".into(),
                    subject: "Hi".into(),
                    html_body: "<p>x</p>".into(),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        (campaign.id, contact.id)
    }

    async fn get(state: &AppState, uri: &str) -> Response {
        router(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_health() {
        let response = get(&state(), "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_open_pixel_records_every_hit() {
        let state = state();
        let (c, ct) = seed(&state);
        let uri = format!("/track/open?c={c}&ct={ct}&t=1700000000000");

        for _ in 0..2 {
            let response = get(&state, &uri).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");
            assert!(response.headers()[header::CACHE_CONTROL]
                .to_str()
                .unwrap()
                .contains("no-cache"));
            assert_eq!(body_bytes(response).await, PIXEL_GIF.to_vec());
        }

        assert_eq!(state.db.count_events(&c, "opened").unwrap(), 2);
        assert_eq!(state.db.unique_opens(&c).unwrap(), 1);
        let campaign = state.db.get_campaign(&c).unwrap().unwrap();
        assert_eq!(campaign.counters.opened, 2);
    }

    #[tokio::test]
    async fn test_open_pixel_served_for_unknown_ids() {
        let response = get(&state(), "/track/open").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, PIXEL_GIF.to_vec());
    }

    #[tokio::test]
    async fn test_click_redirects_to_decoded_target() {
        let state = state();
        let (c, ct) = seed(&state);
        let click = state
            .tracking
            .click_url(&c, &ct, "https://acme.example/pricing?plan=pro&ref=mail");
        let path = click.trim_start_matches("https://t.example.com");

        let response = get(&state, path).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://acme.example/pricing?plan=pro&ref=mail"
        );

        let events = state.db.events_for_campaign(&c).unwrap();
        assert!(matches!(
            &events[0].kind,
            EventKind::Clicked { url, .. } if url == "https://acme.example/pricing?plan=pro&ref=mail"
        ));
    }

    #[tokio::test]
    async fn test_click_rejects_non_web_target() {
        let response = get(&state(), "/track/click?c=a&ct=b&url=javascript%3Aalert(1)").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsubscribe_with_valid_token() {
        let state = state();
        let (c, ct) = seed(&state);
        let link = state.tracking.unsubscribe_url(&c, &ct);
        let path = link.trim_start_matches("https://t.example.com");

        let response = get(&state, path).await;
        assert_eq!(response.status(), StatusCode::OK);
        let html = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(html.contains("unsubscribed"));

        let contact = state.db.get_contact(&ct).unwrap().unwrap();
        assert_eq!(contact.status, SubscriptionStatus::Unsubscribed);
        assert_eq!(state.db.count_events(&c, "unsubscribed").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_with_forged_token_has_no_effect() {
        let state = state();
        let (c, ct) = seed(&state);

        let response = get(&state, &format!("/unsubscribe?c={c}&ct={ct}&s=deadbeef")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let contact = state.db.get_contact(&ct).unwrap().unwrap();
        assert_eq!(contact.status, SubscriptionStatus::Subscribed);
        assert_eq!(state.db.count_events(&c, "unsubscribed").unwrap(), 0);
    }

    fn webhook_request(body: &str, headers: &[(&str, String)]) -> Request<Body> {
        let mut builder = Request::post("/webhooks/provider").header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn bounce_body(c: &str, ct: &str) -> String {
        serde_json::json!({
            "type": "email.bounced",
            "data": {
                "email_id": "msg-1",
                "tags": {"campaign_id": c, "contact_id": ct},
                "bounce": {"message": "mailbox does not exist"}
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_bounce_webhook_suppresses_contact() {
        let state = state();
        let (c, ct) = seed(&state);

        let response = router(state.clone())
            .oneshot(webhook_request(&bounce_body(&c, &ct), &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let contact = state.db.get_contact(&ct).unwrap().unwrap();
        assert_eq!(contact.status, SubscriptionStatus::Bounced);
        let campaign = state.db.get_campaign(&c).unwrap().unwrap();
        assert_eq!(campaign.counters.bounced, 1);
        assert!(matches!(
            &state.db.events_for_campaign(&c).unwrap()[0].kind,
            EventKind::Bounced { reason: Some(r), .. } if r == "mailbox does not exist"
        ));
    }

    #[tokio::test]
    async fn test_complaint_and_delivery_webhooks() {
        let state = state();
        let (c, ct) = seed(&state);
        let body = |kind: &str| {
            serde_json::json!({
                "type": kind,
                "data": {"tags": {"campaign_id": c, "contact_id": ct}}
            })
            .to_string()
        };

        for kind in ["email.delivered", "email.complained", "email.opened"] {
            let response = router(state.clone())
                .oneshot(webhook_request(&body(kind), &[]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let campaign = state.db.get_campaign(&c).unwrap().unwrap();
        assert_eq!(campaign.counters.delivered, 1);
        assert_eq!(campaign.counters.complained, 1);
        assert_eq!(
            state.db.get_contact(&ct).unwrap().unwrap().status,
            SubscriptionStatus::Complained
        );
    }

    #[tokio::test]
    async fn test_signed_webhook_requires_valid_signature() {
        let mut config = test_config();
        config.webhook_signing_key = Some("whsec".into());
        let state = state_with(config);
        let (c, ct) = seed(&state);
        let body = bounce_body(&c, &ct);
        let timestamp = Utc::now().timestamp().to_string();

        let unsigned = router(state.clone())
            .oneshot(webhook_request(&body, &[]))
            .await
            .unwrap();
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

        let signature = hmac_hex("whsec", format!("{timestamp}.{body}").as_bytes());
        let signed = router(state.clone())
            .oneshot(webhook_request(
                &body,
                &[
                    ("x-webhook-timestamp", timestamp),
                    ("x-webhook-signature", signature),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(signed.status(), StatusCode::OK);
        assert_eq!(
            state.db.get_contact(&ct).unwrap().unwrap().status,
            SubscriptionStatus::Bounced
        );
    }

    #[tokio::test]
    async fn test_malformed_webhook_is_rejected() {
        let response = router(state())
            .oneshot(webhook_request("not json", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
