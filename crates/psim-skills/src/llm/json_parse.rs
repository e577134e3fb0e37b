//! Tolerant extraction of a JSON object from free-form model output.

use once_cell::sync::Lazy;
use psim_core::PipelineError;
use regex::Regex;
use serde_json::{json, Map, Value};

/// Shown when the model's `content_plan` is neither a list nor a string.
pub const CONFUSED_SENTENCE: &str = "I'm feeling a bit confused right now";

/// Fenced blocks in priority order: explicitly tagged json, then any other fence.
static FENCES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?is)```json\s*\n(.*?)\n```", r"(?s)```[^j\n]*\n(.*?)\n```"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

/// Last-resort repairs: trailing commas, then `//` line comments.
static CLEANUP: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [(r",\s*\}", "}"), (r",\s*\]", "]"), (r"(?m)//.*?$", "")]
        .iter()
        .filter_map(|(p, rep)| Regex::new(p).ok().map(|re| (re, *rep)))
        .collect()
});

type ParseStrategy = fn(&str) -> Option<Map<String, Value>>;

fn strict(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn lenient(candidate: &str) -> Option<Map<String, Value>> {
    match json5::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

const STRATEGIES: [(&str, ParseStrategy); 2] = [("strict", strict), ("json5", lenient)];

/// JSON candidates in priority order: ```json fences, other fences, then top-level
/// balanced `{...}` substrings.
pub fn extract_json_blocks(text: &str) -> Vec<String> {
    let mut candidates: Vec<String> = FENCES
        .iter()
        .flat_map(|re| re.captures_iter(text).filter_map(|c| c.get(1)).map(|m| m.as_str().to_string()))
        .collect();
    candidates.extend(balanced_braces(text).into_iter().map(str::to_string));
    candidates
}

/// Outermost brace-balanced substrings. An unclosed `{` swallows the rest of the text.
fn balanced_braces(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let start = i;
        let mut depth = 1usize;
        i += 1;
        while i < bytes.len() && depth > 0 {
            match bytes[i] {
                b'{' => depth += 1,
                b'}' => depth -= 1,
                _ => {}
            }
            i += 1;
        }
        if depth == 0 {
            out.push(&text[start..i]);
        }
    }
    out
}

/// Every candidate under strict JSON, then every candidate under JSON5, then the first
/// candidate once more after regex cleanup. Only objects count as a success.
pub fn parse_llm_json(text: &str) -> Result<Map<String, Value>, PipelineError> {
    let candidates = extract_json_blocks(text);
    if candidates.is_empty() {
        return Err(PipelineError::Parse("no JSON candidates found in text".into()));
    }

    for (name, strategy) in STRATEGIES {
        let parsed = candidates
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .find_map(strategy);
        if let Some(map) = parsed {
            tracing::debug!(target: "psim::llm", strategy = name, keys = map.len(), "Parsed model JSON");
            return Ok(map);
        }
    }

    let cleaned = CLEANUP
        .iter()
        .fold(candidates[0].trim().to_string(), |acc, (re, rep)| re.replace_all(&acc, *rep).into_owned());
    strict(&cleaned).ok_or_else(|| {
        PipelineError::Parse(format!("failed to parse JSON from {} candidates", candidates.len()))
    })
}

/// Numeric view of a loosely typed value: numbers, numeric strings, booleans.
pub(crate) fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn object<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    payload.get(key).and_then(Value::as_object)
}

/// Coerces a parsed object into the canonical reasoning shape, dropping unknown keys.
/// Errors on an empty object and on a plan-less payload whose deltas are both zero.
pub fn normalize_reason_payload(payload: &Map<String, Value>) -> Result<Value, PipelineError> {
    if payload.is_empty() {
        return Err(PipelineError::Parse("empty payload".into()));
    }

    let content_plan: Vec<String> = match payload.get("content_plan") {
        None => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(as_text).collect(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(_) => vec![CONFUSED_SENTENCE.to_string()],
    };

    let style = object(payload, "style_directives");
    let style_field = |key: &str, default: &str| {
        style
            .and_then(|s| s.get(key))
            .map(as_text)
            .unwrap_or_else(|| default.to_string())
    };

    let state = object(payload, "state_updates");
    let delta = |key: &str| state.and_then(|s| s.get(key)).and_then(coerce_f64).unwrap_or(0.0);
    let trust_delta = delta("trust_delta");
    let fatigue_delta = delta("fatigue_delta");

    let chosen_ids: Vec<String> = object(payload, "telemetry")
        .and_then(|t| t.get("chosen_ids"))
        .and_then(Value::as_array)
        .map(|ids| ids.iter().map(as_text).collect())
        .unwrap_or_default();

    if content_plan.is_empty() && trust_delta == 0.0 && fatigue_delta == 0.0 {
        return Err(PipelineError::Parse("normalized payload contains no meaningful data".into()));
    }

    Ok(json!({
        "content_plan": content_plan,
        "style_directives": {
            "tempo": style_field("tempo", "medium"),
            "length": style_field("length", "short"),
        },
        "state_updates": {
            "trust_delta": number_or_text(trust_delta),
            "fatigue_delta": number_or_text(fatigue_delta),
        },
        "telemetry": { "chosen_ids": chosen_ids },
    }))
}

/// JSON has no NaN/Infinity; keep them as strings so validation can flag them.
fn number_or_text(v: f64) -> Value {
    if v.is_finite() {
        json!(v)
    } else {
        Value::String(v.to_string())
    }
}
