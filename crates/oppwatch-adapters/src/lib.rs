//! Feed payload parsers: normalize heterogeneous source formats into
//! canonical opportunity records.

use std::str::Utf8Error;
use std::sync::LazyLock;

use oppwatch_core::{RawOpportunity, SourceFormat};
use regex::Regex;
use scraper::Html;
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "oppwatch-adapters";

/// Descriptions are stripped of markup and capped at this many characters.
pub const DESCRIPTION_MAX_CHARS: usize = 240;

/// The bare-markup extractor is a last resort; it never yields more records
/// than this per payload.
pub const MARKUP_RECORD_CAP: usize = 50;

const LIST_KEYS: &[&str] = &["items", "data", "results", "jobs", "opportunities"];
const TITLE_KEYS: &[&str] = &["title", "name", "position", "role"];
const COMPANY_KEYS: &[&str] = &["company", "company_name", "organization", "org"];
const KIND_KEYS: &[&str] = &["type", "category", "job_type", "job_types"];
const REGION_KEYS: &[&str] = &["region", "location", "country"];
const DEADLINE_KEYS: &[&str] = &["deadline", "close_date", "expires_at", "expiry_date"];
const URL_KEYS: &[&str] = &["url", "link", "redirect_url", "apply_url"];
const DESCRIPTION_KEYS: &[&str] = &["description", "summary", "snippet", "details"];
const SALARY_KEYS: &[&str] = &["salary", "compensation", "salary_range"];
const DURATION_KEYS: &[&str] = &["duration", "tenure", "period"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid XML payload: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] Utf8Error),
}

/// Parse a raw payload according to the source's declared format.
///
/// Failure is a typed value for the pipeline to inspect; it is expected to
/// log and carry on with an empty batch rather than abort the refresh.
pub fn parse(
    format: SourceFormat,
    payload: &[u8],
    source_name: &str,
) -> Result<Vec<RawOpportunity>, ParseError> {
    match format {
        SourceFormat::Json => parse_json(payload, source_name),
        SourceFormat::Rss => parse_feed(payload, source_name),
        SourceFormat::Html => Ok(parse_markup(payload, source_name)),
    }
}

/// Ordered-alias lookup: first candidate key holding a non-empty string (or a
/// number) wins. Shared by every field the structured-list parser extracts.
fn pick_first(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match record.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// The opportunity type may arrive as a list; join it with ", ".
fn pick_kind(record: &Map<String, Value>) -> String {
    for key in KIND_KEYS {
        match record.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return s.trim().to_string(),
            Some(Value::Number(n)) => return n.to_string(),
            Some(Value::Array(items)) if !items.is_empty() => {
                let joined = items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                if !joined.is_empty() {
                    return joined;
                }
            }
            _ => {}
        }
    }
    "Opportunity".to_string()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn parse_json(payload: &[u8], source_name: &str) -> Result<Vec<RawOpportunity>, ParseError> {
    let value: Value = serde_json::from_slice(payload)?;
    let records: Vec<Value> = match value {
        Value::Object(ref map) => LIST_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .cloned()
            .unwrap_or_default(),
        Value::Array(items) => items,
        _ => Vec::new(),
    };

    let mut out = Vec::new();
    for record in &records {
        let Some(record) = record.as_object() else {
            continue;
        };
        let Some(title) = pick_first(record, TITLE_KEYS) else {
            continue;
        };
        let description = pick_first(record, DESCRIPTION_KEYS).unwrap_or_default();
        out.push(RawOpportunity {
            title,
            company: pick_first(record, COMPANY_KEYS).unwrap_or_else(|| source_name.to_string()),
            kind: pick_kind(record),
            region: pick_first(record, REGION_KEYS).unwrap_or_else(|| "Unknown".to_string()),
            deadline: pick_first(record, DEADLINE_KEYS).unwrap_or_default(),
            url: pick_first(record, URL_KEYS).unwrap_or_default(),
            description: clean_text(&description, DESCRIPTION_MAX_CHARS),
            salary: pick_first(record, SALARY_KEYS).unwrap_or_default(),
            duration: pick_first(record, DURATION_KEYS).unwrap_or_default(),
            online: record.get("online").map(truthy).unwrap_or(true),
            source_name: source_name.to_string(),
        });
    }
    Ok(out)
}

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";

fn child_text(node: roxmltree::Node<'_, '_>, name: &str) -> String {
    node.children()
        .find(|n| n.has_tag_name(name))
        .and_then(|n| n.text())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn atom_child_text(node: roxmltree::Node<'_, '_>, name: &str) -> String {
    node.children()
        .find(|n| n.has_tag_name((ATOM_NS, name)))
        .and_then(|n| n.text())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn parse_feed(payload: &[u8], source_name: &str) -> Result<Vec<RawOpportunity>, ParseError> {
    let text = std::str::from_utf8(payload)?;
    let doc = roxmltree::Document::parse(text)?;
    let root = doc.root_element();
    let mut out = Vec::new();

    if let Some(channel) = root.children().find(|n| n.has_tag_name("channel")) {
        for item in channel.children().filter(|n| n.has_tag_name("item")) {
            let title = child_text(item, "title");
            if title.is_empty() {
                continue;
            }
            let mut raw = RawOpportunity::titled(title, source_name);
            raw.url = child_text(item, "link");
            raw.description = clean_text(&child_text(item, "description"), DESCRIPTION_MAX_CHARS);
            out.push(raw);
        }
        return Ok(out);
    }

    // No channel element: treat the document as an Atom feed.
    for entry in doc.root().descendants().filter(|n| n.has_tag_name((ATOM_NS, "entry"))) {
        let title = atom_child_text(entry, "title");
        if title.is_empty() {
            continue;
        }
        let link = entry
            .children()
            .filter(|n| n.has_tag_name((ATOM_NS, "link")))
            .find(|n| n.attribute("rel") == Some("alternate"))
            .or_else(|| entry.children().find(|n| n.has_tag_name((ATOM_NS, "link"))))
            .and_then(|n| n.attribute("href"))
            .unwrap_or("")
            .trim()
            .to_string();
        let mut raw = RawOpportunity::titled(title, source_name);
        raw.url = link;
        raw.description = clean_text(&atom_child_text(entry, "summary"), DESCRIPTION_MAX_CHARS);
        out.push(raw);
    }
    Ok(out)
}

static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a>"#)
        .expect("anchor pattern compiles")
});

/// Crude last-resort extractor for sources with no structured feed: scan the
/// payload line by line for anchor tags and lift href/label as url/title.
fn parse_markup(payload: &[u8], source_name: &str) -> Vec<RawOpportunity> {
    let text = String::from_utf8_lossy(payload);
    let mut out = Vec::new();
    'lines: for line in text.lines() {
        for caps in ANCHOR.captures_iter(line) {
            let title = caps[2].trim().to_string();
            if title.is_empty() {
                continue;
            }
            let mut raw = RawOpportunity::titled(title, source_name);
            raw.url = caps[1].trim().to_string();
            out.push(raw);
            if out.len() >= MARKUP_RECORD_CAP {
                break 'lines;
            }
        }
    }
    out
}

/// Strip markup out of a text fragment.
pub fn strip_html(input: &str) -> String {
    Html::parse_fragment(input)
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip markup, collapse whitespace, and cap length.
pub fn clean_text(input: &str, max_chars: usize) -> String {
    let stripped = strip_html(input);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}
