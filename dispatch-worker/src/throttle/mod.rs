//! Send-volume policies: the fixed inter-send delay and the warmup daily cap.

pub mod rate;
pub mod warmup;

pub use rate::{delay_millis, RateThrottle};
pub use warmup::{SendAllowance, WarmupError, WarmupStage, WarmupState};
