//! Merge-tag substitution.
//!
//! Tags are `{{name}}` with optional inner whitespace. Built-in names are
//! `email`, `firstName`, `lastName`, `company` and `fullName`; any other name
//! resolves against the recipient's custom fields. A tag that resolves to
//! nothing is left in place so template mistakes stay visible in previews.

use std::borrow::Cow;

use crate::contacts::Recipient;

/// Output context for substituted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Values are HTML-escaped.
    Html,
    /// Subject lines and plain-text bodies.
    Plain,
}

pub fn render(template: &str, recipient: &Recipient, context: Context) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let inner_start = open + 2;
        let Some(close) = rest[inner_start..].find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let tag_end = inner_start + close + 2;
        let key = rest[inner_start..inner_start + close].trim();

        match lookup(recipient, key) {
            Some(value) => match context {
                Context::Html => out.push_str(&escape_html(&value)),
                Context::Plain => out.push_str(&value),
            },
            None => out.push_str(&rest[open..tag_end]),
        }
        rest = &rest[tag_end..];
    }

    out.push_str(rest);
    out
}

fn lookup<'a>(recipient: &'a Recipient, key: &str) -> Option<Cow<'a, str>> {
    let field = |v: &'a Option<String>| Some(Cow::Borrowed(v.as_deref().unwrap_or("")));
    match key {
        "email" => Some(Cow::Borrowed(recipient.email.as_str())),
        "firstName" => field(&recipient.first_name),
        "lastName" => field(&recipient.last_name),
        "company" => field(&recipient.company),
        "fullName" => {
            let parts: Vec<&str> = [&recipient.first_name, &recipient.last_name]
                .into_iter()
                .filter_map(|p| p.as_deref())
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            Some(Cow::Owned(parts.join(" ")))
        }
        other => recipient
            .custom_fields
            .get(other)
            .map(|v| Cow::Borrowed(v.as_str())),
    }
}

pub fn escape_html(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn recipient() -> Recipient {
        let mut custom_fields = BTreeMap::new();
        custom_fields.insert("plan".to_string(), "Pro & Team".to_string());
        Recipient {
            contact_id: "ct-1".into(),
            email: "ada@example.com".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            company: None,
            custom_fields,
        }
    }

    #[test]
    fn test_builtin_tags() {
        let out = render(
            "Hi {{firstName}} {{ lastName }} <{{email}}> ({{fullName}}) at {{company}}.",
            &recipient(),
            Context::Plain,
        );
        assert_eq!(
            out,
            "Hi Ada Lovelace <ada@example.com> (Ada Lovelace) at ."
        );
    }

    #[test]
    fn test_custom_field_escaped_in_html_only() {
        let r = recipient();
        assert_eq!(render("{{plan}}", &r, Context::Html), "Pro &amp; Team");
        assert_eq!(render("{{plan}}", &r, Context::Plain), "Pro & Team");
    }

    #[test]
    fn test_unknown_and_unterminated_tags_left_in_place() {
        let r = recipient();
        assert_eq!(render("{{ unknown }} x", &r, Context::Plain), "{{ unknown }} x");
        assert_eq!(render("a {{firstName", &r, Context::Plain), "a {{firstName");
    }

    #[test]
    fn test_full_name_with_missing_parts() {
        let mut r = recipient();
        r.first_name = None;
        assert_eq!(render("{{fullName}}", &r, Context::Plain), "Lovelace");
        r.last_name = Some("  ".into());
        assert_eq!(render("[{{fullName}}]", &r, Context::Plain), "[]");
    }
}
