//! Scheduling control surface used by the dashboard.
//!
//! Each handler is a thin call into the campaign state machine. Losing a race
//! against the scheduler or another caller yields 409, never a silent no-op.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::campaign::{Campaign, CampaignCounters, CampaignStatus};
use crate::error::{CampaignError, QueueError};
use crate::queue::BatchStatus;
use crate::scheduler::DispatchOutcome;
use crate::signature::constant_time_compare;
use crate::web::AppState;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Campaign(CampaignError),
    Internal(String),
}

impl From<CampaignError> for ApiError {
    fn from(e: CampaignError) -> Self {
        ApiError::Campaign(e)
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid bearer token".to_string(),
            ),
            ApiError::Campaign(e) => {
                let (status, code) = match &e {
                    CampaignError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    CampaignError::InvalidTransition { .. } => {
                        (StatusCode::CONFLICT, "invalid_transition")
                    }
                    CampaignError::InvalidSchedule(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "invalid_schedule")
                    }
                    CampaignError::Validation(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "validation")
                    }
                    CampaignError::Database(_) => {
                        error!(error = %e, "control_database_error");
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                    }
                };
                (status, code, e.to_string())
            }
            ApiError::Internal(message) => {
                error!(error = %message, "control_internal_error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

/// Bearer-token guard; open when no token is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.control_api_token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_compare(token, expected) => Ok(()),
        _ => {
            warn!("control_auth_invalid");
            Err(ApiError::Unauthorized)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub scheduled_at: DateTime<Utc>,
    pub timezone: String,
}

pub async fn schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<Campaign>, ApiError> {
    authorize(&state, &headers)?;
    let campaign = state
        .db
        .schedule(&id, req.scheduled_at, &req.timezone, Utc::now())?;
    Ok(Json(campaign))
}

pub async fn reschedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<Campaign>, ApiError> {
    authorize(&state, &headers)?;
    let campaign = state
        .db
        .reschedule(&id, req.scheduled_at, &req.timezone, Utc::now())?;
    Ok(Json(campaign))
}

pub async fn cancel_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Campaign>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.db.cancel(&id, Utc::now())?))
}

#[derive(Debug, Serialize)]
pub struct SendNowResponse {
    pub status: &'static str,
    pub jobs: usize,
    pub recipients: usize,
}

pub async fn send_now(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SendNowResponse>, ApiError> {
    authorize(&state, &headers)?;
    match state.dispatcher.send_now(&id, Utc::now()).await? {
        DispatchOutcome::Enqueued { jobs, recipients } => Ok(Json(SendNowResponse {
            status: "enqueued",
            jobs,
            recipients,
        })),
        DispatchOutcome::AlreadyComplete => Ok(Json(SendNowResponse {
            status: "sent",
            jobs: 0,
            recipients: 0,
        })),
        DispatchOutcome::Invalid(reason) => Err(CampaignError::Validation(reason).into()),
        DispatchOutcome::RolledBack(reason) => Err(ApiError::Internal(reason)),
    }
}

pub async fn pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Campaign>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.db.pause(&id, Utc::now())?))
}

pub async fn resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Campaign>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.db.resume(&id, Utc::now())?))
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub cancelled_jobs: usize,
}

/// Stop a sending or paused campaign. Batches not yet picked up are
/// dropped; a batch already running finishes.
pub async fn stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    authorize(&state, &headers)?;
    let campaign = state.db.stop(&id, Utc::now())?;
    let cancelled_jobs = state.queue.cancel_pending(&id)?;
    info!(campaign_id = %id, cancelled_jobs = cancelled_jobs, "campaign_stopped");
    Ok(Json(StopResponse {
        campaign,
        cancelled_jobs,
    }))
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub campaign_id: String,
    pub status: CampaignStatus,
    pub recipient_count: u64,
    pub counters: CampaignCounters,
    pub batches: Vec<BatchStatus>,
}

pub async fn progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProgressResponse>, ApiError> {
    authorize(&state, &headers)?;
    let campaign = state
        .db
        .get_campaign(&id)
        .map_err(CampaignError::from)?
        .ok_or_else(|| CampaignError::NotFound(id.clone()))?;
    let batches = state.queue.batches_for_campaign(&id)?;
    Ok(Json(ProgressResponse {
        campaign_id: campaign.id,
        status: campaign.status,
        recipient_count: campaign.recipient_count,
        counters: campaign.counters,
        batches,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::NewCampaign;
    use crate::contacts::NewContact;
    use crate::web::testing::{state, state_with, test_config};
    use crate::web::router;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use serde_json::Value;
    use tower::ServiceExt;

    fn seed(state: &AppState, recipients: usize) -> String {
        let now = Utc::now();
        let list = state.db.create_list("owner-1", "All", now).unwrap();
        for i in 0..recipients {
            let contact = state
                .db
                .create_contact(
                    &NewContact {
                        owner_id: "owner-1".into(),
                        email: format!("c{i}@example.com"),
                        ..Default::default()
                    },
                    now,
                )
                .unwrap();
            state.db.add_to_list(&list, &contact.id, now).unwrap();
        }
        state
            .db
            .create_campaign(
                &NewCampaign {
                    owner_id: "owner-1".into(),
                    name: "Spring".into(),
                    subject: "Spring sale".into(),
                    html_body: "<p>Sale</p>".into(),
                    list_ids: vec![list],
                    ..Default::default()
                },
                now,
            )
            .unwrap()
            .id
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn schedule_body(offset: Duration) -> Value {
        serde_json::json!({
            "scheduled_at": (Utc::now() + offset).to_rfc3339(),
            "timezone": "America/New_York"
        })
    }

    #[tokio::test]
    async fn test_schedule_reschedule_and_cancel() {
        let state = state();
        let id = seed(&state, 1);
        let uri = format!("/campaigns/{id}/schedule");

        let (status, body) = call(&state, "POST", &uri, Some(schedule_body(Duration::hours(1)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "scheduled");

        let (status, _) = call(&state, "PUT", &uri, Some(schedule_body(Duration::hours(2)))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&state, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "draft");
    }

    #[tokio::test]
    async fn test_schedule_in_past_is_unprocessable() {
        let state = state();
        let id = seed(&state, 1);
        let (status, body) = call(
            &state,
            "POST",
            &format!("/campaigns/{id}/schedule"),
            Some(schedule_body(-Duration::minutes(1))),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "invalid_schedule");
    }

    #[tokio::test]
    async fn test_cancel_unscheduled_conflicts() {
        let state = state();
        let id = seed(&state, 1);
        let (status, body) = call(&state, "DELETE", &format!("/campaigns/{id}/schedule"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_transition");
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_not_found() {
        let (status, _) = call(&state(), "GET", "/campaigns/nope/progress", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_send_now_then_pause_resume_and_stop() {
        let state = state();
        let id = seed(&state, 3);

        let (status, body) = call(&state, "POST", &format!("/campaigns/{id}/send"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "enqueued");
        assert_eq!(body["jobs"], 1);
        assert_eq!(body["recipients"], 3);

        let (status, body) = call(&state, "POST", &format!("/campaigns/{id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "paused");

        let (status, _) = call(&state, "POST", &format!("/campaigns/{id}/resume"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&state, "POST", &format!("/campaigns/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["cancelled_jobs"], 1);
        assert_eq!(state.queue.outstanding(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_now_without_recipients_is_unprocessable() {
        let state = state();
        let id = seed(&state, 0);
        let (status, body) = call(&state, "POST", &format!("/campaigns/{id}/send"), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn test_progress_lists_batches() {
        let mut config = test_config();
        config.batch_size = 2;
        let state = state_with(config);
        let id = seed(&state, 5);
        call(&state, "POST", &format!("/campaigns/{id}/send"), None).await;

        let (status, body) = call(&state, "GET", &format!("/campaigns/{id}/progress"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sending");
        assert_eq!(body["recipient_count"], 5);
        let batches = body["batches"].as_array().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0]["state"], "waiting");
    }

    #[tokio::test]
    async fn test_bearer_token_guard() {
        let mut config = test_config();
        config.control_api_token = Some("s3cret".into());
        let state = state_with(config);
        let id = seed(&state, 1);
        let uri = format!("/campaigns/{id}/progress");

        let (status, _) = call(&state, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::get(&uri)
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
