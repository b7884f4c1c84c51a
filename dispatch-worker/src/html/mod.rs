//! HTML inspection for outgoing message bodies.

pub mod parser;

pub use parser::{extract_links, html_to_text};
