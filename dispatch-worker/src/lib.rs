//! Sendline - campaign dispatch pipeline.
//!
//! This library provides shared modules for the three Sendline binaries:
//! - `sendline-scheduler`: promotes due campaigns and enqueues their batches
//! - `sendline-worker`: throttled batch sender
//! - `sendline-web`: tracking endpoints, provider webhook and control surface
//!
//! ## Architecture
//!
//! ```text
//! Scheduler → queue_jobs ─→ Worker → Provider
//!          ↘ campaign_batches (wake-up) ↗
//! Recipient → Web (open / click / unsubscribe) → email_events
//! ```

pub mod campaign;
pub mod config;
pub mod contacts;
pub mod db;
pub mod error;
pub mod events;
pub mod html;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod send;
pub mod shutdown;
pub mod signature;
pub mod throttle;
pub mod tracking;
pub mod util;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use campaign::{Campaign, CampaignStatus, NewCampaign};
pub use config::Config;
pub use db::Database;
pub use error::{CampaignError, QueueError, QuotaExceeded};
pub use progress::{BatchProgress, ProgressHub};
pub use queue::{JobQueue, Publisher};
pub use scheduler::Dispatcher;
pub use web::AppState;
pub use worker::DispatchWorker;
