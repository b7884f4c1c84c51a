//! Transactional email provider client.
//!
//! Speaks a Resend-style single-recipient API: `POST {base}/emails` with a
//! bearer key, answering `{"id": "..."}` on success.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// One fully rendered message for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub tags: Vec<MessageTag>,
}

impl OutboundEmail {
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTag {
    pub name: String,
    pub value: String,
}

impl MessageTag {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReceipt {
    pub message_id: Option<String>,
}

/// Stable classification of a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimited,
    Timeout,
    ServerError,
    InvalidRecipient,
    Rejected,
    Transport,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ServerError => "server_error",
            ErrorCode::InvalidRecipient => "invalid_recipient",
            ErrorCode::Rejected => "rejected",
            ErrorCode::Transport => "transport",
        }
    }

    /// Whether a later attempt of the same send could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::Timeout | ErrorCode::ServerError | ErrorCode::Transport
        )
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rate limited the request")]
    RateLimited,

    #[error("provider request timed out")]
    Timeout,

    #[error("provider server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("provider rejected the message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProviderError::RateLimited => ErrorCode::RateLimited,
            ProviderError::Timeout => ErrorCode::Timeout,
            ProviderError::Server { .. } => ErrorCode::ServerError,
            ProviderError::InvalidRecipient(_) => ErrorCode::InvalidRecipient,
            ProviderError::Rejected { .. } => ErrorCode::Rejected,
            ProviderError::Transport(_) => ErrorCode::Transport,
        }
    }

    /// Map a non-success HTTP status and its body to an error.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message: String = body.chars().take(500).collect();
        match status {
            429 => ProviderError::RateLimited,
            408 | 504 => ProviderError::Timeout,
            500..=599 => ProviderError::Server { status, message },
            400 | 422 if mentions_recipient(body) => ProviderError::InvalidRecipient(message),
            _ => ProviderError::Rejected { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

fn mentions_recipient(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("invalid")
        && (lower.contains("`to`")
            || lower.contains("\"to\"")
            || lower.contains("email address")
            || lower.contains("recipient"))
}

/// Sends one message to one recipient.
pub trait Provider: Send + Sync {
    fn send(
        &self,
        email: &OutboundEmail,
    ) -> impl Future<Output = Result<ProviderReceipt, ProviderError>> + Send;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

/// HTTP client for the provider API.
#[derive(Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sendline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/emails", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }
}

impl Provider for HttpProvider {
    async fn send(&self, email: &OutboundEmail) -> Result<ProviderReceipt, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(email)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            // Accepted is accepted: an unreadable body must not trigger a resend
            let message_id = match response.json::<SendResponse>().await {
                Ok(body) => body.id,
                Err(e) => {
                    warn!(error = %e, "provider_send_response_unreadable");
                    None
                }
            };
            debug!(message_id = ?message_id, "provider_send_accepted");
            return Ok(ProviderReceipt { message_id });
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    fn email(to: &str) -> OutboundEmail {
        OutboundEmail {
            from: "Acme <news@acme.example>".into(),
            to: vec![to.into()],
            subject: "Hello".into(),
            html: "<p>Hi</p>".into(),
            text: Some("Hi".into()),
            reply_to: None,
            tags: vec![MessageTag::new("campaign_id", "c1"), MessageTag::new("contact_id", "ct1")],
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderError::from_status(429, "").code(), ErrorCode::RateLimited);
        assert_eq!(ProviderError::from_status(504, "").code(), ErrorCode::Timeout);
        assert_eq!(ProviderError::from_status(503, "busy").code(), ErrorCode::ServerError);
        assert_eq!(
            ProviderError::from_status(422, r#"{"message":"Invalid `to` field."}"#).code(),
            ErrorCode::InvalidRecipient
        );
        assert_eq!(ProviderError::from_status(403, "domain not verified").code(), ErrorCode::Rejected);
        assert!(ErrorCode::ServerError.is_transient());
        assert!(!ErrorCode::InvalidRecipient.is_transient());
    }

    #[test]
    fn test_outbound_json_shape() {
        let json = serde_json::to_value(email("a@example.com")).unwrap();
        assert_eq!(json["to"][0], "a@example.com");
        assert_eq!(json["tags"][1]["name"], "contact_id");
        assert!(json.get("reply_to").is_none());
    }

    type Seen = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn fake_api(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let to = body["to"][0].as_str().unwrap_or_default().to_string();
        seen.lock().unwrap().push((auth, body));
        if to.starts_with("bad") {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"message": "Invalid `to` field."})),
            )
        } else {
            (StatusCode::OK, Json(serde_json::json!({"id": "msg-123"})))
        }
    }

    async fn spawn_fake_api() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/emails", post(fake_api))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), seen)
    }

    #[tokio::test]
    async fn test_http_provider_success_and_rejection() {
        let (base, seen) = spawn_fake_api().await;
        let provider = HttpProvider::new(&base, "re_test", Duration::from_secs(5)).unwrap();

        let receipt = provider.send(&email("a@example.com")).await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("msg-123"));

        let err = provider.send(&email("bad@example")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRecipient);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.as_deref(), Some("Bearer re_test"));
        assert_eq!(seen[0].1["tags"][0]["value"], "c1");
    }

    #[tokio::test]
    async fn test_http_provider_accepts_unreadable_success_body() {
        let app = Router::new().route("/emails", post(|| async { (StatusCode::OK, "queued") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider =
            HttpProvider::new(&format!("http://{addr}"), "k", Duration::from_secs(5)).unwrap();
        let receipt = provider.send(&email("a@example.com")).await.unwrap();
        assert_eq!(receipt.message_id, None);
    }

    #[tokio::test]
    async fn test_http_provider_connection_refused_is_transport() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider =
            HttpProvider::new(&format!("http://{addr}"), "k", Duration::from_secs(2)).unwrap();
        let err = provider.send(&email("a@example.com")).await.unwrap_err();
        assert!(err.code().is_transient());
    }
}
