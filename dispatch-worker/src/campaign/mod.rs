//! Campaign records and their lifecycle.

pub mod lifecycle;
pub mod records;
pub mod types;

pub use types::{Campaign, CampaignCounters, CampaignStatus, Counter, NewCampaign};
