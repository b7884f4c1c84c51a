//! Inbound HTTP surface.
//!
//! - Tracking: open pixel, click redirect and unsubscribe links embedded in
//!   every sent message
//! - Provider webhook: delivery, bounce and complaint notifications
//! - Control surface: schedule, send, pause, resume and cancel campaigns

pub mod control;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::db::Database;
use crate::queue::JobQueue;
use crate::scheduler::Dispatcher;
use crate::tracking::TrackingUrls;
use crate::Config;

pub use control::ApiError;
pub use handlers::{HealthResponse, WebhookResponse};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub queue: JobQueue,
    pub dispatcher: Dispatcher,
    pub tracking: Arc<TrackingUrls>,
}

impl AppState {
    pub fn new(config: Config, db: Arc<Database>, queue: JobQueue, dispatcher: Dispatcher) -> Self {
        let tracking = TrackingUrls::new(
            config.tracking_base_url.clone(),
            config.tracking_secret.clone().unwrap_or_default(),
        );
        Self {
            config: Arc::new(config),
            db,
            queue,
            dispatcher,
            tracking: Arc::new(tracking),
        }
    }
}

/// Every route served by `sendline-web`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/track/open", get(handlers::track_open))
        .route("/track/click", get(handlers::track_click))
        .route("/unsubscribe", get(handlers::unsubscribe))
        .route("/webhooks/provider", post(handlers::provider_webhook))
        .route(
            "/campaigns/:id/schedule",
            post(control::schedule)
                .put(control::reschedule)
                .delete(control::cancel_schedule),
        )
        .route("/campaigns/:id/send", post(control::send_now))
        .route("/campaigns/:id/pause", post(control::pause))
        .route("/campaigns/:id/resume", post(control::resume))
        .route("/campaigns/:id/cancel", post(control::stop))
        .route("/campaigns/:id/progress", get(control::progress))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
