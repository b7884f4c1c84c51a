//! In-place HTML rewriting: anchor hrefs and closing-body insertion.
//!
//! Operates on the raw markup rather than a parsed DOM so the rest of the
//! message (conditional comments, whitespace, attribute order) survives
//! byte-for-byte.

/// Insert `snippet` just before the last `</body`, or append it when the
/// document has no closing body tag.
pub fn insert_before_body_close(html: &str, snippet: &str) -> String {
    let lower = html.to_ascii_lowercase();
    match lower.rfind("</body") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + snippet.len());
            out.push_str(&html[..idx]);
            out.push_str(snippet);
            out.push_str(&html[idx..]);
            out
        }
        None => format!("{html}{snippet}"),
    }
}

/// Rewrite every `<a ... href=...>` value for which `rewrite` returns a
/// replacement. The callback sees the href with character references decoded.
pub fn rewrite_hrefs<F>(html: &str, mut rewrite: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    // ASCII lowercasing keeps byte offsets identical to `html`.
    let lower = html.to_ascii_lowercase();
    let bytes = lower.as_bytes();

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    let mut search = 0;

    while let Some(rel) = lower[search..].find("<a") {
        let after = search + rel + 2;
        if !bytes.get(after).is_some_and(|b| b.is_ascii_whitespace()) {
            search = after;
            continue;
        }
        let Some(tag_end) = find_tag_end(bytes, after) else {
            break;
        };

        if let Some(href) = find_href(bytes, after, tag_end) {
            let original = unescape_attr(&html[href.start..href.end]);
            if let Some(replacement) = rewrite(&original) {
                out.push_str(&html[cursor..href.start]);
                if href.quoted {
                    out.push_str(&replacement);
                } else {
                    out.push('"');
                    out.push_str(&replacement);
                    out.push('"');
                }
                cursor = href.end;
            }
        }
        search = tag_end;
    }

    out.push_str(&html[cursor..]);
    out
}

/// Decodes the references `merge::escape_html` produces.
fn unescape_attr(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

struct HrefSpan {
    start: usize,
    end: usize,
    quoted: bool,
}

fn find_tag_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate().skip(from) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

/// Walks the attribute list between `from` and `end` (exclusive).
fn find_href(bytes: &[u8], from: usize, end: usize) -> Option<HrefSpan> {
    let mut i = from;
    while i < end {
        while i < end && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
            i += 1;
        }
        let name_start = i;
        while i < end && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' && bytes[i] != b'/' {
            i += 1;
        }
        let name = &bytes[name_start..i];
        while i < end && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= end || bytes[i] != b'=' {
            // Valueless attribute.
            continue;
        }
        i += 1;
        while i < end && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let span = match bytes.get(i) {
            Some(&q) if i < end && (q == b'"' || q == b'\'') => {
                let start = i + 1;
                let close = bytes[start..end]
                    .iter()
                    .position(|&b| b == q)
                    .map(|p| start + p)
                    .unwrap_or(end);
                i = (close + 1).min(end);
                HrefSpan {
                    start,
                    end: close,
                    quoted: true,
                }
            }
            _ => {
                let start = i;
                while i < end && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                HrefSpan {
                    start,
                    end: i,
                    quoted: false,
                }
            }
        };

        if name == b"href" {
            return Some(span);
        }
    }
    None
}
