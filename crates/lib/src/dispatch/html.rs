//! Render message entities (UTF-16 offset/length spans) as HTML.

use serde_json::Value;

struct Span {
    start: usize,
    end: usize,
    open: String,
    close: &'static str,
}

fn escape(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

fn escaped(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    escape(s, &mut out);
    out
}

fn span_tags(entity: &Value, covered: &str) -> Option<(String, &'static str)> {
    let kind = entity.get("_").and_then(Value::as_str)?;
    let tags = match kind.strip_prefix("messageEntity")? {
        "Bold" => ("<b>".to_string(), "</b>"),
        "Italic" => ("<i>".to_string(), "</i>"),
        "Underline" => ("<u>".to_string(), "</u>"),
        "Strike" => ("<s>".to_string(), "</s>"),
        "Code" => ("<code>".to_string(), "</code>"),
        "Spoiler" => ("<span class=\"tg-spoiler\">".to_string(), "</span>"),
        "Blockquote" => ("<blockquote>".to_string(), "</blockquote>"),
        "Pre" => match entity.get("language").and_then(Value::as_str) {
            Some(lang) if !lang.is_empty() => (
                format!("<pre><code class=\"language-{}\">", escaped(lang)),
                "</code></pre>",
            ),
            _ => ("<pre>".to_string(), "</pre>"),
        },
        "TextUrl" => {
            let url = entity.get("url").and_then(Value::as_str)?;
            (format!("<a href=\"{}\">", escaped(url)), "</a>")
        }
        "Url" => (format!("<a href=\"{}\">", escaped(covered)), "</a>"),
        "Email" => (format!("<a href=\"mailto:{}\">", escaped(covered)), "</a>"),
        "Phone" => (format!("<a href=\"tel:{}\">", escaped(covered)), "</a>"),
        "MentionName" => {
            let id = entity.get("user_id").and_then(Value::as_i64)?;
            (format!("<a href=\"tg://user?id={}\">", id), "</a>")
        }
        _ => return None,
    };
    Some(tags)
}

/// Wrap each entity span of `text` in its HTML tag. Unknown entity kinds and
/// out-of-range spans are skipped; text is HTML-escaped.
pub fn entities_to_html(text: &str, entities: &[Value]) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut spans = Vec::new();
    for entity in entities {
        let offset = entity.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let length = entity.get("length").and_then(Value::as_u64).unwrap_or(0) as usize;
        let start = offset.min(units.len());
        let end = offset.saturating_add(length).min(units.len());
        if start >= end {
            continue;
        }
        let covered = String::from_utf16_lossy(&units[start..end]);
        if let Some((open, close)) = span_tags(entity, &covered) {
            spans.push(Span {
                start,
                end,
                open,
                close,
            });
        }
    }

    // Sort key: position, closes before opens, inner spans closed first and
    // outer spans opened first.
    let mut events: Vec<((usize, u8, i64, i64), usize, bool)> = Vec::with_capacity(spans.len() * 2);
    for (i, s) in spans.iter().enumerate() {
        events.push(((s.end, 0, -(s.start as i64), -(i as i64)), i, false));
        events.push(((s.start, 1, -(s.end as i64), i as i64), i, true));
    }
    events.sort_by_key(|(key, _, _)| *key);

    let mut out = String::with_capacity(text.len() + spans.len() * 8);
    let mut cursor = 0;
    for ((pos, ..), i, is_open) in events {
        if pos > cursor {
            escape(&String::from_utf16_lossy(&units[cursor..pos]), &mut out);
            cursor = pos;
        }
        let span = &spans[i];
        if is_open {
            out.push_str(&span.open);
        } else {
            out.push_str(span.close);
        }
    }
    if cursor < units.len() {
        escape(&String::from_utf16_lossy(&units[cursor..]), &mut out);
    }
    out
}
