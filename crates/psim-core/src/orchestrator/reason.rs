//! Deterministic reasoner: no network, same input → same plan.

use super::{Candidate, ReasonInput, ReasonOutput, Reasoner};
use crate::error::PipelineError;
use crate::knowledge::Policies;
use crate::shared::{StateUpdates, StyleDirectives};
use async_trait::async_trait;
use serde_json::{json, Map};

/// Maximum number of candidate texts that go into a plan.
pub(crate) const PLAN_LIMIT: usize = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct StubReasoner;

impl StubReasoner {
    pub fn new() -> Self {
        Self
    }

    /// Plan = first 1–2 candidate texts; trust +0.02 when anything was retrieved, else −0.01.
    pub fn plan(&self, candidates: &[Candidate], policies: &Policies) -> ReasonOutput {
        let chosen = &candidates[..candidates.len().min(PLAN_LIMIT)];
        let content_plan: Vec<String> = chosen.iter().map(|c| c.text.clone()).collect();
        let chosen_ids: Vec<String> = chosen
            .iter()
            .map(|c| if c.id.is_empty() { "unknown".to_string() } else { c.id.clone() })
            .collect();

        let trust_delta = if candidates.is_empty() { -0.01 } else { 0.02 };

        let mut telemetry = Map::new();
        telemetry.insert("candidates_count".into(), json!(candidates.len()));
        telemetry.insert("chosen_count".into(), json!(chosen_ids.len()));
        telemetry.insert("content_plan_size".into(), json!(content_plan.len()));
        telemetry.insert("chosen_ids".into(), json!(chosen_ids));

        tracing::debug!(
            target: "psim::reason",
            reasoner = "stub",
            candidates = candidates.len(),
            plan = content_plan.len(),
            trust_delta,
            "Plan built"
        );

        ReasonOutput {
            content_plan,
            distortions_plan: Vec::new(),
            style_directives: style_from_policies(policies),
            state_updates: StateUpdates {
                trust_delta,
                fatigue_delta: 0.0,
            },
            telemetry,
        }
    }
}

#[async_trait]
impl Reasoner for StubReasoner {
    fn name(&self) -> &str {
        "stub"
    }

    async fn reason(&self, input: &ReasonInput) -> Result<ReasonOutput, PipelineError> {
        Ok(self.plan(&input.candidates, &input.policies))
    }
}

/// Tempo/length from the case's style profile; blanks fall back to medium/short.
fn style_from_policies(policies: &Policies) -> StyleDirectives {
    let defaults = StyleDirectives::default();
    let profile = &policies.style_profile;
    let pick = |value: &str, fallback: String| {
        if value.trim().is_empty() {
            fallback
        } else {
            value.to_string()
        }
    };
    StyleDirectives::new(pick(&profile.tempo, defaults.tempo), pick(&profile.length, defaults.length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn candidate(id: &str, text: &str) -> Candidate {
        Candidate {
            id: id.into(),
            kind: "fact".into(),
            text: text.into(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn takes_first_two_texts_in_order() {
        let candidates = vec![candidate("a", "T1"), candidate("b", "T2"), candidate("c", "T3")];
        let out = StubReasoner::new().plan(&candidates, &Policies::default());
        assert_eq!(out.content_plan, vec!["T1".to_string(), "T2".to_string()]);
        assert!((out.state_updates.trust_delta - 0.02).abs() < 1e-9);
        assert_eq!(out.state_updates.fatigue_delta, 0.0);
        assert!(out.distortions_plan.is_empty());
        assert_eq!(out.telemetry["candidates_count"], json!(3));
        assert_eq!(out.telemetry["chosen_ids"], json!(["a", "b"]));
    }

    #[test]
    fn no_candidates_lowers_trust() {
        let out = StubReasoner::new().plan(&[], &Policies::default());
        assert!(out.content_plan.is_empty());
        assert!((out.state_updates.trust_delta + 0.01).abs() < 1e-9);
        assert_eq!(out.telemetry["chosen_ids"], Value::Array(vec![]));
    }

    #[test]
    fn missing_id_reports_unknown_and_style_follows_policy() {
        let policies = Policies::from_value(&json!({"style_profile": {"tempo": "slow", "length": ""}}));
        let out = StubReasoner::new().plan(&[candidate("", "T1")], &policies);
        assert_eq!(out.telemetry["chosen_ids"], json!(["unknown"]));
        assert_eq!(out.style_directives.tempo, "slow");
        assert_eq!(out.style_directives.length, "short");
    }
}
