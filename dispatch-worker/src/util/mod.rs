//! Small helpers shared by the tracking surface.

pub mod user_agent;
