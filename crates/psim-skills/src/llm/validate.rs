//! Repairs a normalized reasoning payload before it reaches the guard.
//!
//! Never fails: every fix is recorded as a warning, and the warnings are also copied
//! into `telemetry.validation_warnings`.

use super::json_parse::coerce_f64;
use psim_core::{Candidate, StateUpdates};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

const PLAN_LIMIT: usize = 2;
const SNIPPET_CHARS: usize = 200;
const TEMPOS: [&str; 3] = ["slow", "medium", "fast"];
const LENGTHS: [&str; 3] = ["short", "medium", "long"];

pub fn validate_reason_payload(payload: &Value, candidates: &[Candidate]) -> (Value, Vec<String>) {
    let mut result = payload.as_object().cloned().unwrap_or_default();
    let mut warnings = Vec::new();

    let mut telemetry = match result.remove("telemetry") {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            warnings.push("telemetry was not a dict, reset to empty".to_string());
            Map::new()
        }
    };
    // Keep warnings in field order even though telemetry is inspected first.
    let telemetry_warnings = std::mem::take(&mut warnings);

    let plan = content_plan(result.get("content_plan"), candidates, &mut warnings, &mut telemetry);
    result.insert("content_plan".into(), json!(plan));

    let style = style_directives(result.get("style_directives"), &mut warnings);
    result.insert("style_directives".into(), style);

    let state = state_updates(result.get("state_updates"), &mut warnings);
    result.insert("state_updates".into(), state);

    warnings.extend(telemetry_warnings);
    chosen_ids(&mut telemetry, candidates, &mut warnings);

    if !warnings.is_empty() {
        telemetry.insert("validation_warnings".into(), json!(warnings));
    }
    result.insert("telemetry".into(), Value::Object(telemetry));

    (Value::Object(result), warnings)
}

/// Trimmed non-empty strings, at most two. An empty plan is rebuilt from the first
/// candidates' text and flagged with `llm_empty_plan`.
fn content_plan(
    raw: Option<&Value>,
    candidates: &[Candidate],
    warnings: &mut Vec<String>,
    telemetry: &mut Map<String, Value>,
) -> Vec<String> {
    let items: Vec<Value> = match raw {
        None => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(s @ Value::String(_)) => vec![s.clone()],
        Some(_) => {
            warnings.push("content_plan was not a list, converted to empty list".to_string());
            Vec::new()
        }
    };

    let mut plan = Vec::new();
    for item in &items {
        match item {
            Value::String(s) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    plan.push(trimmed.to_string());
                    if plan.len() >= PLAN_LIMIT {
                        break;
                    }
                }
            }
            other => warnings.push(format!("content_plan item was not string: {}", kind_of(other))),
        }
    }

    if plan.is_empty() && !candidates.is_empty() {
        plan = candidates
            .iter()
            .take(PLAN_LIMIT)
            .map(|c| c.text.chars().take(SNIPPET_CHARS).collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !plan.is_empty() {
            warnings.push("content_plan was empty, generated from candidates".to_string());
            telemetry.insert("llm_empty_plan".into(), Value::Bool(true));
        }
    }
    plan
}

fn style_directives(raw: Option<&Value>, warnings: &mut Vec<String>) -> Value {
    let style = match raw {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            warnings.push("style_directives was not a dict, reset to empty".to_string());
            Map::new()
        }
    };

    let mut pick = |key: &str, allowed: &[&str], default: &str| -> String {
        match style.get(key) {
            None => default.to_string(),
            Some(Value::String(s)) if allowed.contains(&s.as_str()) => s.clone(),
            Some(other) => {
                let shown = other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string());
                warnings.push(format!("{} '{}' invalid, set to '{}'", key, shown, default));
                default.to_string()
            }
        }
    };
    let tempo = pick("tempo", &TEMPOS, "medium");
    let length = pick("length", &LENGTHS, "short");
    json!({ "tempo": tempo, "length": length })
}

fn state_updates(raw: Option<&Value>, warnings: &mut Vec<String>) -> Value {
    let state = match raw {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            warnings.push("state_updates was not a dict, reset to empty".to_string());
            Map::new()
        }
    };

    let mut bounded = |key: &str, (lo, hi): (f64, f64)| -> f64 {
        let value = match state.get(key) {
            None => 0.0,
            Some(raw) => match coerce_f64(raw) {
                Some(v) if v.is_finite() => v,
                Some(_) => {
                    warnings.push(format!("{} was NaN/inf, set to 0.0", key));
                    0.0
                }
                None => {
                    warnings.push(format!("{} was not numeric, set to 0.0", key));
                    0.0
                }
            },
        };
        let clamped = value.clamp(lo, hi);
        if clamped != value {
            warnings.push(format!("{} {} clamped to {}", key, value, clamped));
        }
        clamped
    };
    let trust_delta = bounded("trust_delta", StateUpdates::TRUST_DELTA_RANGE);
    let fatigue_delta = bounded("fatigue_delta", StateUpdates::FATIGUE_DELTA_RANGE);
    json!({ "trust_delta": trust_delta, "fatigue_delta": fatigue_delta })
}

/// Keeps ids of the current candidates only, deduplicated in order. Falls back to all
/// candidate ids when nothing valid remains.
fn chosen_ids(telemetry: &mut Map<String, Value>, candidates: &[Candidate], warnings: &mut Vec<String>) {
    let mut valid: Vec<&str> = Vec::new();
    for c in candidates {
        if !valid.contains(&c.id.as_str()) {
            valid.push(&c.id);
        }
    }

    let raw = match telemetry.get("chosen_ids") {
        None => Vec::new(),
        Some(Value::Array(ids)) => ids.clone(),
        Some(_) => {
            warnings.push("chosen_ids was not a list, reset to empty".to_string());
            Vec::new()
        }
    };

    let mut seen = HashSet::new();
    let mut kept: Vec<String> = Vec::new();
    for id in &raw {
        match id.as_str() {
            Some(s) if valid.contains(&s) => {
                if seen.insert(s.to_string()) {
                    kept.push(s.to_string());
                }
            }
            _ => {
                let shown = id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string());
                warnings.push(format!("chosen_id '{}' not in valid candidates, removed", shown));
            }
        }
    }

    if kept.is_empty() && !valid.is_empty() {
        kept = valid.iter().map(|s| s.to_string()).collect();
        warnings.push("chosen_ids was empty, substituted candidate IDs".to_string());
    }
    telemetry.insert("chosen_ids".into(), json!(kept));
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, text: &str) -> Candidate {
        Candidate {
            id: id.into(),
            kind: "fact".into(),
            text: text.into(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn deltas_always_land_in_range() {
        let inputs = [
            json!(5.0),
            json!(-5.0),
            json!("NaN"),
            json!("inf"),
            json!("-Infinity"),
            json!("abc"),
            json!(null),
            json!([1]),
            json!(0.1),
        ];
        for raw in &inputs {
            let payload = json!({"state_updates": {"trust_delta": raw, "fatigue_delta": raw}});
            let (out, _) = validate_reason_payload(&payload, &[]);
            let trust = out["state_updates"]["trust_delta"].as_f64().unwrap();
            let fatigue = out["state_updates"]["fatigue_delta"].as_f64().unwrap();
            assert!((-0.2..=0.2).contains(&trust), "trust {} from {}", trust, raw);
            assert!((0.0..=0.2).contains(&fatigue), "fatigue {} from {}", fatigue, raw);
        }
    }

    #[test]
    fn non_finite_and_out_of_range_are_reported() {
        let payload = json!({"state_updates": {"trust_delta": "nan", "fatigue_delta": 0.9}});
        let (out, warnings) = validate_reason_payload(&payload, &[]);
        assert_eq!(out["state_updates"], json!({"trust_delta": 0.0, "fatigue_delta": 0.2}));
        assert!(warnings.iter().any(|w| w == "trust_delta was NaN/inf, set to 0.0"));
        assert!(warnings.iter().any(|w| w.starts_with("fatigue_delta 0.9 clamped")));
        assert_eq!(out["telemetry"]["validation_warnings"], json!(warnings));
    }

    #[test]
    fn chosen_ids_are_a_deduplicated_subset() {
        let cands = [candidate("a", "x"), candidate("b", "y")];
        let payload = json!({
            "content_plan": ["p"],
            "telemetry": {"chosen_ids": ["b", "zzz", "b", 7, "a"]}
        });
        let (out, warnings) = validate_reason_payload(&payload, &cands);
        assert_eq!(out["telemetry"]["chosen_ids"], json!(["b", "a"]));
        assert_eq!(warnings.iter().filter(|w| w.starts_with("chosen_id ")).count(), 2);

        let none_valid = json!({"content_plan": ["p"], "telemetry": {"chosen_ids": ["zzz"]}});
        let (out, _) = validate_reason_payload(&none_valid, &cands);
        assert_eq!(out["telemetry"]["chosen_ids"], json!(["a", "b"]));

        let (out, _) = validate_reason_payload(&none_valid, &[]);
        assert_eq!(out["telemetry"]["chosen_ids"], json!([]));
    }

    #[test]
    fn plan_is_trimmed_capped_and_synthesized() {
        let payload = json!({"content_plan": ["  one ", "", "two", "three"]});
        let (out, _) = validate_reason_payload(&payload, &[]);
        assert_eq!(out["content_plan"], json!(["one", "two"]));

        let long = "слово ".repeat(100);
        let cands = [candidate("a", &long), candidate("b", "second"), candidate("c", "third")];
        let (out, warnings) = validate_reason_payload(&json!({"content_plan": ["   "]}), &cands);
        let plan = out["content_plan"].as_array().unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan[0].as_str().unwrap().chars().count() <= 200);
        assert_eq!(plan[1], json!("second"));
        assert_eq!(out["telemetry"]["llm_empty_plan"], json!(true));
        assert!(warnings.contains(&"content_plan was empty, generated from candidates".to_string()));
    }

    #[test]
    fn style_outside_vocabulary_is_reset() {
        let payload = json!({"content_plan": ["p"], "style_directives": {"tempo": "calm", "length": "epic", "mood": "x"}});
        let (out, warnings) = validate_reason_payload(&payload, &[]);
        assert_eq!(out["style_directives"], json!({"tempo": "medium", "length": "short"}));
        assert!(warnings.contains(&"tempo 'calm' invalid, set to 'medium'".to_string()));
    }

    #[test]
    fn garbage_input_never_panics() {
        let (out, _) = validate_reason_payload(&json!("not an object"), &[]);
        assert_eq!(out["content_plan"], json!([]));
        assert_eq!(out["style_directives"]["tempo"], json!("medium"));
        let (out, warnings) = validate_reason_payload(&json!({"telemetry": 3, "style_directives": []}), &[]);
        assert!(out["telemetry"].is_object());
        assert!(warnings.contains(&"telemetry was not a dict, reset to empty".to_string()));
    }
}
