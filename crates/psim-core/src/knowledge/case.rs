//! Case definition records: case truth, trajectories, policies, fragments, telemetry.

use crate::shared::{default_length, default_tempo, RiskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

fn default_min_trust() -> f64 {
    0.4
}

/// One clinically meaningful milestone of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Fragment tags that complete the step; empty means trust alone suffices.
    #[serde(default)]
    pub condition_tags: Vec<String>,
    #[serde(default = "default_min_trust")]
    pub min_trust: f64,
}

impl TrajectoryStep {
    pub fn new(id: impl Into<String>, condition_tags: &[&str], min_trust: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            condition_tags: condition_tags.iter().map(|t| t.to_string()).collect(),
            min_trust,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<TrajectoryStep>,
}

/// Ground truth of a synthetic patient case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseTruth {
    #[serde(default)]
    pub dx_target: Vec<String>,
    #[serde(default)]
    pub ddx: BTreeMap<String, f64>,
    #[serde(default)]
    pub hidden_facts: Vec<String>,
    #[serde(default)]
    pub red_flags: Vec<String>,
    #[serde(default)]
    pub trajectories: Vec<Trajectory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisclosureRules {
    pub full_on_valid_question: bool,
    pub partial_if_low_trust: bool,
    pub min_trust_for_gated: f64,
}

impl Default for DisclosureRules {
    fn default() -> Self {
        Self {
            full_on_valid_question: true,
            partial_if_low_trust: true,
            min_trust_for_gated: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionRules {
    pub enabled: bool,
    pub by_defense: BTreeMap<String, f64>,
}

impl Default for DistortionRules {
    fn default() -> Self {
        Self {
            enabled: true,
            by_defense: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskProtocol {
    /// Empty means the normalizer's built-in keyword lists apply.
    pub trigger_keywords: Vec<String>,
    pub response_style: String,
    pub lock_topics: Vec<String>,
}

impl Default for RiskProtocol {
    fn default() -> Self {
        Self {
            trigger_keywords: Vec::new(),
            response_style: "stable".to_string(),
            lock_topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleProfile {
    pub register: String,
    pub tempo: String,
    pub length: String,
}

impl Default for StyleProfile {
    fn default() -> Self {
        Self {
            register: "colloquial".to_string(),
            tempo: default_tempo(),
            length: default_length(),
        }
    }
}

/// Per-case behaviour policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policies {
    #[serde(default)]
    pub disclosure_rules: DisclosureRules,
    #[serde(default)]
    pub distortion_rules: DistortionRules,
    #[serde(default)]
    pub risk_protocol: RiskProtocol,
    #[serde(default)]
    pub style_profile: StyleProfile,
}

impl Policies {
    /// Lenient parse: each section that is missing, malformed or out of range falls back
    /// to its defaults without affecting the others.
    pub fn from_value(raw: &Value) -> Self {
        fn section<T: serde::de::DeserializeOwned + Default>(raw: &Value, key: &str) -> T {
            raw.get(key)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default()
        }

        let mut disclosure_rules: DisclosureRules = section(raw, "disclosure_rules");
        if !(0.0..=1.0).contains(&disclosure_rules.min_trust_for_gated) {
            disclosure_rules = DisclosureRules::default();
        }
        let mut distortion_rules: DistortionRules = section(raw, "distortion_rules");
        if distortion_rules.by_defense.values().any(|w| !(0.0..=1.0).contains(w)) {
            distortion_rules = DistortionRules::default();
        }

        Self {
            disclosure_rules,
            distortion_rules,
            risk_protocol: section(raw, "risk_protocol"),
            style_profile: section(raw, "style_profile"),
        }
    }
}

/// Fragment visibility tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Public,
    Gated,
    Hidden,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Public => "public",
            Availability::Gated => "gated",
            Availability::Hidden => "hidden",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gated-fragment trust threshold as stored in fragment metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrustRequirement {
    /// Absent or null: the gate is open.
    Unset,
    AtLeast(f64),
    /// Present but not a number.
    Unreadable,
}

/// Retrievable piece of patient knowledge belonging to one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFragment {
    pub id: Uuid,
    pub case_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub availability: Availability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl KnowledgeFragment {
    pub fn topic(&self) -> Option<&str> {
        self.metadata.get("topic").and_then(Value::as_str)
    }

    pub fn tags(&self) -> Vec<&str> {
        self.metadata
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// `metadata.disclosure_requirements.trust_ge`. Numeric strings count as numbers.
    pub fn trust_ge(&self) -> TrustRequirement {
        let raw = self
            .metadata
            .get("disclosure_requirements")
            .and_then(|req| req.get("trust_ge"));
        match raw {
            None | Some(Value::Null) => TrustRequirement::Unset,
            Some(Value::Number(n)) => n.as_f64().map_or(TrustRequirement::Unreadable, TrustRequirement::AtLeast),
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => TrustRequirement::AtLeast(v),
                _ => TrustRequirement::Unreadable,
            },
            Some(_) => TrustRequirement::Unreadable,
        }
    }

    /// Availability gate: hidden never, gated only at or above its own `trust_ge`.
    /// A gated fragment whose threshold cannot be read stays closed.
    pub fn visible_at(&self, trust: f64) -> bool {
        match self.availability {
            Availability::Public => true,
            Availability::Gated => match self.trust_ge() {
                TrustRequirement::Unset => true,
                TrustRequirement::AtLeast(min) => min <= trust,
                TrustRequirement::Unreadable => false,
            },
            Availability::Hidden => false,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Fragment payload accepted at case load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFragment {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub availability: Availability,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl NewFragment {
    pub fn new(kind: impl Into<String>, text: impl Into<String>, availability: Availability) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
            metadata: Map::new(),
            availability,
            embedding: None,
        }
    }

    pub fn topic(mut self, topic: &str) -> Self {
        self.metadata.insert("topic".into(), Value::String(topic.to_string()));
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.metadata.insert(
            "tags".into(),
            Value::Array(tags.iter().map(|t| Value::String(t.to_string())).collect()),
        );
        self
    }

    pub fn trust_ge(mut self, trust_ge: f64) -> Self {
        self.metadata.insert(
            "disclosure_requirements".into(),
            serde_json::json!({ "trust_ge": trust_ge }),
        );
        self
    }

    pub(crate) fn into_fragment(self, case_id: Uuid) -> KnowledgeFragment {
        KnowledgeFragment {
            id: Uuid::new_v4(),
            case_id,
            kind: self.kind,
            text: self.text,
            metadata: self.metadata,
            availability: self.availability,
            embedding: self.embedding,
        }
    }
}

/// Declares that a session belongs to a case's session chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLink {
    pub session_id: Uuid,
    pub case_id: Uuid,
    #[serde(default)]
    pub prev_session_id: Option<Uuid>,
}

/// Turn record handed to a telemetry sink; the sink assigns `turn_no`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnTelemetryDraft {
    pub used_fragments: Vec<String>,
    pub risk_status: RiskStatus,
    pub eval_markers: Map<String, Value>,
}

/// Appended turn record, ordered per session by `turn_no` (1-based).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnTelemetry {
    pub session_id: Uuid,
    pub turn_no: u32,
    pub used_fragments: Vec<String>,
    pub risk_status: RiskStatus,
    pub eval_markers: Map<String, Value>,
    pub created_at_ms: i64,
}

impl TurnTelemetry {
    pub(crate) fn from_draft(session_id: Uuid, turn_no: u32, draft: TurnTelemetryDraft) -> Self {
        Self {
            session_id,
            turn_no,
            used_fragments: draft.used_fragments,
            risk_status: draft.risk_status,
            eval_markers: draft.eval_markers,
            created_at_ms: now_ms(),
        }
    }

    pub fn intent(&self) -> Option<&str> {
        self.eval_markers.get("intent").and_then(Value::as_str)
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn policies_fall_back_per_section() {
        let raw = json!({
            "disclosure_rules": {"min_trust_for_gated": 3.0},
            "distortion_rules": "nonsense",
            "risk_protocol": {"trigger_keywords": ["плохо"]},
            "style_profile": {"tempo": "slow"}
        });
        let policies = Policies::from_value(&raw);
        assert_eq!(policies.disclosure_rules, DisclosureRules::default());
        assert_eq!(policies.distortion_rules, DistortionRules::default());
        assert_eq!(policies.risk_protocol.trigger_keywords, vec!["плохо".to_string()]);
        assert_eq!(policies.style_profile.tempo, "slow");
        assert_eq!(policies.style_profile.length, "short");
    }

    #[test]
    fn gated_visibility_follows_own_threshold() {
        let case_id = Uuid::new_v4();
        let gated = NewFragment::new("fact", "secret", Availability::Gated)
            .trust_ge(0.6)
            .into_fragment(case_id);
        assert!(!gated.visible_at(0.5));
        assert!(gated.visible_at(0.6));

        let open_gate = NewFragment::new("fact", "ungated", Availability::Gated).into_fragment(case_id);
        assert!(open_gate.visible_at(0.0));

        let hidden = NewFragment::new("fact", "never", Availability::Hidden).into_fragment(case_id);
        assert!(!hidden.visible_at(1.0));
    }

    #[test]
    fn threshold_strings_are_read_and_garbage_keeps_the_gate_closed() {
        let with_raw = |raw: Value| {
            let mut fragment = NewFragment::new("fact", "secret", Availability::Gated).into_fragment(Uuid::new_v4());
            fragment
                .metadata
                .insert("disclosure_requirements".into(), json!({ "trust_ge": raw }));
            fragment
        };

        let numeric_text = with_raw(json!("0.9"));
        assert_eq!(numeric_text.trust_ge(), TrustRequirement::AtLeast(0.9));
        assert!(!numeric_text.visible_at(0.0));
        assert!(numeric_text.visible_at(0.95));

        let garbage = with_raw(json!("high"));
        assert_eq!(garbage.trust_ge(), TrustRequirement::Unreadable);
        assert!(!garbage.visible_at(1.0));
        assert!(!with_raw(json!([0.1])).visible_at(1.0));

        let null = with_raw(Value::Null);
        assert_eq!(null.trust_ge(), TrustRequirement::Unset);
        assert!(null.visible_at(0.0));
    }

    #[test]
    fn step_min_trust_defaults() {
        let step: TrajectoryStep = serde_json::from_value(json!({"id": "sleep"})).unwrap();
        assert!((step.min_trust - 0.4).abs() < f64::EPSILON);
        assert!(step.condition_tags.is_empty());
    }
}
