//! Configuration module for environment variable parsing.
//!
//! Every process (worker, scheduler, web) reads the same variables so a single
//! environment file can drive a whole deployment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file holding campaign records, contacts, events and the job queue
    pub database_path: String,

    /// Optional RabbitMQ URL used to wake workers when batches are enqueued
    pub amqp_url: Option<String>,

    /// Target provider-facing send rate (emails per second)
    pub send_rate_per_second: u32,

    /// Maximum recipients per queue job
    pub batch_size: usize,

    /// Scheduler tick cadence in seconds
    pub scheduler_tick_secs: u64,

    /// Upper bound on due campaigns handled by a single tick
    pub scheduler_max_campaigns_per_tick: usize,

    /// Pause applied after every completed batch, in milliseconds
    pub inter_batch_pause_ms: u64,

    /// Delivery attempts per queue job before it is parked as failed
    pub job_max_attempts: u32,

    /// First retry delay in milliseconds, doubled on each further attempt
    pub job_backoff_base_ms: u64,

    /// Campaign re-derivations allowed before the campaign is marked failed
    pub max_dispatch_attempts: u32,

    /// How often the worker polls the queue when no notification arrives
    pub worker_poll_interval_ms: u64,

    /// Cadence of the warmup stage recomputation, in seconds
    pub warmup_recompute_secs: u64,

    // =========================================================================
    // Provider
    // =========================================================================
    /// Base URL of the transactional email provider API
    pub provider_api_url: String,

    /// Provider API key
    pub provider_api_key: Option<String>,

    /// HTTP request timeout for provider calls in milliseconds
    pub provider_timeout_ms: u64,

    /// Fallback sender display name
    pub from_name: Option<String>,

    /// Fallback sender address
    pub from_email: Option<String>,

    /// Fallback Reply-To address
    pub reply_to: Option<String>,

    // =========================================================================
    // Tracking and web surface
    // =========================================================================
    /// Public base URL that pixel, click and unsubscribe links point at
    pub tracking_base_url: String,

    /// HMAC key for unsubscribe tokens
    pub tracking_secret: Option<String>,

    /// HMAC key for provider webhook verification
    pub webhook_signing_key: Option<String>,

    /// Maximum age in seconds for provider webhook timestamps
    pub webhook_max_age_secs: u64,

    /// Bearer token guarding the scheduling control surface
    pub control_api_token: Option<String>,

    /// Port for the web server to listen on
    pub port: u16,

    // =========================================================================
    // Queue retention
    // =========================================================================
    /// Age after which completed jobs are pruned
    pub completed_job_retention_secs: u64,

    /// Number of most recent completed jobs kept for audit
    pub completed_job_retention_count: usize,

    /// Age after which failed jobs are pruned
    pub failed_job_retention_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "sendline.db".to_string()),
            amqp_url: non_empty("AMQP_URL"),
            send_rate_per_second: parse_or("SEND_RATE_PER_SECOND", 14).max(1),
            batch_size: parse_or("BATCH_SIZE", 500).max(1),
            scheduler_tick_secs: parse_or("SCHEDULER_TICK_SECS", 60).max(1),
            scheduler_max_campaigns_per_tick: parse_or("SCHEDULER_MAX_CAMPAIGNS_PER_TICK", 100),
            inter_batch_pause_ms: parse_or("INTER_BATCH_PAUSE_MS", 1000),
            job_max_attempts: parse_or("JOB_MAX_ATTEMPTS", 3).max(1),
            job_backoff_base_ms: parse_or("JOB_BACKOFF_BASE_MS", 5000),
            max_dispatch_attempts: parse_or("MAX_DISPATCH_ATTEMPTS", 3).max(1),
            worker_poll_interval_ms: parse_or("WORKER_POLL_INTERVAL_MS", 2000).max(50),
            warmup_recompute_secs: parse_or("WARMUP_RECOMPUTE_SECS", 3600).max(1),

            provider_api_url: env::var("PROVIDER_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            provider_api_key: non_empty("PROVIDER_API_KEY"),
            provider_timeout_ms: parse_or("PROVIDER_TIMEOUT_MS", 10_000),
            from_name: non_empty("FROM_NAME"),
            from_email: non_empty("FROM_EMAIL"),
            reply_to: non_empty("REPLY_TO"),

            tracking_base_url: env::var("TRACKING_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string())
                .trim_end_matches('/')
                .to_string(),
            tracking_secret: non_empty("TRACKING_SECRET"),
            webhook_signing_key: non_empty("WEBHOOK_SIGNING_KEY"),
            webhook_max_age_secs: parse_or("WEBHOOK_MAX_AGE_SECS", 300), // 5 minutes default
            control_api_token: non_empty("CONTROL_API_TOKEN"),
            port: parse_or("PORT", 8080),

            completed_job_retention_secs: parse_or("COMPLETED_JOB_RETENTION_SECS", 3600),
            completed_job_retention_count: parse_or("COMPLETED_JOB_RETENTION_COUNT", 1000),
            failed_job_retention_secs: parse_or("FAILED_JOB_RETENTION_SECS", 7 * 24 * 3600),
        }
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    pub fn inter_batch_pause(&self) -> Duration {
        Duration::from_millis(self.inter_batch_pause_ms)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }
}

/// Parse a variable into `T`, falling back to `default` when unset or invalid.
fn parse_or<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(env_var = name, value = %raw, default = %default, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a variable, treating blank values as unset.
fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
