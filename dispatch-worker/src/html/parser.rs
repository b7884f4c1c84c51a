//! HTML inspection utilities: link extraction and plain-text rendering.

use std::sync::OnceLock;

use scraper::{Html, Node, Selector};
use tracing::debug;

/// Elements whose text never reaches the reader.
const HIDDEN_ELEMENTS: [&str; 5] = ["head", "script", "style", "title", "noscript"];

/// Elements that start a new line in the text rendering.
const BLOCK_ELEMENTS: [&str; 16] = [
    "p", "div", "br", "tr", "li", "h1", "h2", "h3", "h4", "h5", "h6", "table", "ul", "ol",
    "blockquote", "hr",
];

fn anchor_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse("a[href]").expect("static selector"))
}

/// Extract all absolute http(s) link URLs from HTML (deduplicated).
pub fn extract_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);

    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();

    for a in document.select(anchor_selector()) {
        if let Some(href) = a.value().attr("href") {
            if (href.starts_with("http://") || href.starts_with("https://")) && seen.insert(href.to_string()) {
                urls.push(href.to_string());
            }
        }
    }

    debug!(count = urls.len(), "extracted_links");
    urls
}

/// Render an HTML body as plain text.
///
/// Hidden elements are dropped, block elements start new lines, runs of
/// whitespace collapse to one space and blank lines collapse to one.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::with_capacity(html.len() / 2);

    for node in document.root_element().descendants() {
        match node.value() {
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => raw.push('\n'),
            Node::Text(text) => {
                let hidden = node.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
                });
                if !hidden {
                    raw.push_str(text);
                }
            }
            _ => {}
        }
    }

    let mut out = String::with_capacity(raw.len());
    let mut blank_pending = false;
    for line in raw.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_pending {
                out.push('\n');
            }
        }
        blank_pending = false;
        out.push_str(&collapsed);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_links_deduplicates() {
        let html = r#"
            <html>
                <a href="https://example.com/page1">Link 1</a>
                <a href="https://example.com/page1">Link 1 again</a>
                <a href="https://example.com/page2">Link 2</a>
                <a href="/relative">Relative</a>
            </html>
        "#;

        let links = extract_links(html);
        assert_eq!(links, vec!["https://example.com/page1", "https://example.com/page2"]);
    }

    #[test]
    fn test_html_to_text_drops_hidden_and_breaks_blocks() {
        let html = r#"
            <html>
              <head><title>Ignored</title><style>p { color: red }</style></head>
              <body>
                <h1>Spring   sale</h1>
                <p>Hello <b>Ada</b>,</p>
                <p>Everything is <a href="https://x.example">50% off</a>.</p>
                <script>track()</script>
              </body>
            </html>
        "#;

        assert_eq!(
            html_to_text(html),
            "Spring sale\n\nHello Ada,\n\nEverything is 50% off."
        );
    }

    #[test]
    fn test_html_to_text_fragment() {
        assert_eq!(html_to_text("plain <i>words</i>"), "plain words");
    }
}
