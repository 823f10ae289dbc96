//! Helpers for turning model replies into validated classifications.
//!
//! Chat models wrap JSON in code fences or prose often enough that the
//! payload has to be dug out before it can be parsed.

use serde_json::Value;

use crate::enrich::classifier::Classification;
use crate::enrich::transactions::SubscriptionPeriod;
use crate::error::{Error, Result};

pub const UNCATEGORIZED: &str = "Uncategorized";
const PATH_SEPARATOR: &str = " > ";

fn preview(s: &str) -> String {
    match s.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Extract the first JSON array or object from `text`.
pub fn extract_json(text: &str) -> Result<Value> {
    let cleaned = text.replace("```json", "```").replace("```", "");
    let s = cleaned.trim();
    if s.is_empty() {
        return Err(Error::MalformedResponse("empty classifier output".into()));
    }

    if (s.starts_with('[') && s.ends_with(']')) || (s.starts_with('{') && s.ends_with('}')) {
        if let Ok(value) = serde_json::from_str(s) {
            return Ok(value);
        }
    }

    let start = s
        .find(['[', '{'])
        .ok_or_else(|| Error::MalformedResponse(format!("no JSON found | Raw: {}", preview(s))))?;
    let end = matching_close(s, start).ok_or_else(|| {
        Error::MalformedResponse(format!("unterminated JSON | Raw: {}", preview(s)))
    })?;

    let candidate = &s[start..=end];
    serde_json::from_str(candidate).map_err(|e| {
        Error::MalformedResponse(format!("invalid JSON: {} | Raw: {}", e, preview(candidate)))
    })
}

/// Byte index of the bracket closing the one at `start`, skipping string
/// literals.
fn matching_close(s: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in s[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate a classifier reply. The top level must be an array of objects
/// that each carry a string `key`.
pub fn parse_classifications(value: Value) -> Result<Vec<Classification>> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(Error::MalformedResponse(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| parse_item(idx, item))
        .collect()
}

fn parse_item(idx: usize, item: Value) -> Result<Classification> {
    let obj = item.as_object().ok_or_else(|| {
        Error::MalformedResponse(format!("item {idx} is {}, expected object", json_kind(&item)))
    })?;

    let key = obj
        .get("key")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::MalformedResponse(format!("item {idx} has no string key")))?
        .to_string();

    let merchant = obj
        .get("merchant")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    let category = category_from_path(obj.get("category_path"))
        .map_err(|msg| Error::MalformedResponse(format!("{key}: {msg}")))?;

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| {
            Error::MalformedResponse(format!("{key}: confidence {s:?} is not a number"))
        })?,
        Some(other) => {
            return Err(Error::MalformedResponse(format!(
                "{key}: confidence is {}",
                json_kind(other)
            )))
        }
    };

    let is_subscription = match obj.get("is_subscription") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(Error::MalformedResponse(format!(
                "{key}: is_subscription is {}",
                json_kind(other)
            )))
        }
    };

    let subscription_period = obj
        .get("subscription_period")
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty())
        .map(SubscriptionPeriod::normalize);

    Ok(Classification {
        key,
        merchant,
        category,
        confidence: clamp_confidence(confidence),
        is_subscription,
        subscription_period,
    })
}

/// Accepts a plain string or an array of path segments.
fn category_from_path(path: Option<&Value>) -> std::result::Result<String, String> {
    let joined = match path {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(PATH_SEPARATOR),
        Some(other) => return Err(format!("category_path is {}", json_kind(other))),
    };

    if joined.is_empty() {
        Ok(UNCATEGORIZED.to_string())
    } else {
        Ok(joined)
    }
}

pub fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
