//! Plain text <-> provider rich-text formats
//!
//! Conversions are lossy: formatting is dropped on read and never produced
//! on write.

use serde_json::{json, Value};

/// Wrap plain text in a minimal Atlassian Document Format document
///
/// One paragraph per line; blank lines become empty paragraphs.
pub fn text_to_adf(text: &str) -> Value {
    let content: Vec<Value> = text
        .lines()
        .map(|line| {
            if line.is_empty() {
                json!({"type": "paragraph", "content": []})
            } else {
                json!({
                    "type": "paragraph",
                    "content": [{"type": "text", "text": line}]
                })
            }
        })
        .collect();

    json!({"type": "doc", "version": 1, "content": content})
}

/// Flatten an ADF document (or a legacy plain string) to text
pub fn adf_to_text(value: &Value) -> String {
    let mut blocks = Vec::new();
    collect_blocks(value, &mut blocks);
    blocks.join("\n")
}

fn collect_blocks(value: &Value, blocks: &mut Vec<String>) {
    match value {
        Value::String(s) => blocks.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_blocks(item, blocks)),
        Value::Object(map) => match map.get("type").and_then(Value::as_str) {
            Some("paragraph") | Some("heading") | Some("codeBlock") => {
                blocks.push(inline_text(map.get("content").unwrap_or(&Value::Null)));
            }
            _ => {
                if let Some(content) = map.get("content") {
                    collect_blocks(content, blocks);
                } else if let Some(Value::String(text)) = map.get("text") {
                    blocks.push(text.clone());
                }
            }
        },
        _ => {}
    }
}

fn inline_text(value: &Value) -> String {
    match value {
        Value::Array(items) => items.iter().map(inline_text).collect(),
        Value::Object(map) => match map.get("type").and_then(Value::as_str) {
            Some("hardBreak") => "\n".to_string(),
            Some("mention") | Some("emoji") => map
                .get("attrs")
                .and_then(|a| a.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => {
                if let Some(Value::String(text)) = map.get("text") {
                    text.clone()
                } else {
                    map.get("content").map(inline_text).unwrap_or_default()
                }
            }
        },
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

/// Escape text for an HTML field; line breaks become `<br>`
pub fn text_to_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '\n' => out.push_str("<br>"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Strip tags and decode common entities
///
/// `<br>`, `</p>` and `</div>` become line breaks.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('>') else {
            // Unterminated tag: keep the remainder verbatim
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let tag = rest[start + 1..start + end]
            .trim()
            .trim_end_matches('/')
            .trim()
            .to_ascii_lowercase();
        let name = tag.split_whitespace().next().unwrap_or_default();
        if matches!(name, "br" | "/p" | "/div" | "/li") {
            out.push('\n');
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);

    decode_entities(&out).trim_end_matches('\n').to_string()
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        let decoded = candidate.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &candidate[1..semi];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix('#')
                    .and_then(|n| match n.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => n.parse().ok(),
                    })
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, semi))
        });

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &candidate[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
