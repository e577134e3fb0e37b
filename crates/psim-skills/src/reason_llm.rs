//! Model-backed reasoner: prompt → chat completion → tolerant parse → normalize → validate.
//!
//! Upstream and parse failures never escape; they produce a fixed "confused" plan with a
//! small trust penalty and a telemetry flag naming the failure point.

use crate::llm::{
    load_prompt, normalize_reason_payload, parse_llm_json, validate_reason_payload, ChatClient, ChatMessage,
    ChatParams, CONFUSED_SENTENCE,
};
use async_trait::async_trait;
use psim_core::{
    Candidate, CoreConfig, PipelineError, ReasonInput, ReasonOutput, Reasoner, StateUpdates, StyleDirectives,
};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

const PROMPT_FILE: &str = "reasoning.prompt.txt";
const FALLBACK_PROMPT: &str = "You are a therapeutic reasoning system. Analyze the input and return JSON \
     with content_plan, style_directives, state_updates, and telemetry.";
const CANDIDATE_TEXT_LIMIT: usize = 500;
const PARAMS: ChatParams = ChatParams {
    temperature: 0.3,
    max_tokens: 1000,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Upstream,
    Parse,
    Validation,
}

pub struct LlmReasoner {
    client: Arc<dyn ChatClient>,
    model: String,
    system_prompt: String,
}

impl LlmReasoner {
    pub fn new(client: Arc<dyn ChatClient>, model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt: system_prompt.into(),
        }
    }

    /// Uses the configured reasoning model and `prompts_dir/reasoning.prompt.txt`.
    pub fn from_config(config: &CoreConfig, client: Arc<dyn ChatClient>) -> Self {
        let prompt = load_prompt(Path::new(&config.prompts_dir), PROMPT_FILE, FALLBACK_PROMPT);
        Self::new(client, config.llm.reasoning_model.clone(), prompt)
    }

    fn user_payload(input: &ReasonInput) -> Result<String, serde_json::Error> {
        let candidates: Vec<Candidate> = input.candidates.iter().map(truncate_candidate).collect();
        let payload = json!({
            "case_truth": serde_json::to_value(&input.case_truth)?,
            "session_state": serde_json::to_value(&input.session_state)?,
            "candidates": candidates,
            "policies": serde_json::to_value(&input.policies)?,
        });
        serde_json::to_string_pretty(&payload)
    }

    async fn try_reason(&self, input: &ReasonInput) -> Result<ReasonOutput, Failure> {
        let user = Self::user_payload(input).map_err(|err| {
            tracing::error!(target: "psim::reason", error = %err, "Could not serialise reasoning input");
            Failure::Upstream
        })?;
        let messages = [ChatMessage::system(self.system_prompt.as_str()), ChatMessage::user(user)];

        let response = self.client.chat(&self.model, &messages, &PARAMS).await.map_err(|err| {
            tracing::error!(target: "psim::reason", model = %self.model, error = %err, "LLM reasoning request failed");
            Failure::Upstream
        })?;
        let answer = response.answer().ok_or_else(|| {
            tracing::error!(target: "psim::reason", model = %self.model, "Empty response from LLM");
            Failure::Upstream
        })?;

        let normalized = parse_llm_json(answer)
            .and_then(|parsed| normalize_reason_payload(&parsed))
            .map_err(|err| {
                let preview: String = answer.chars().take(CANDIDATE_TEXT_LIMIT).collect();
                tracing::error!(target: "psim::reason", error = %err, content = %preview, "Failed to parse LLM reasoning");
                Failure::Parse
            })?;

        let (validated, warnings) = validate_reason_payload(&normalized, &input.candidates);
        let output = to_output(&validated);
        if output.content_plan.is_empty() {
            tracing::warn!(
                target: "psim::reason",
                warnings = ?warnings,
                "content_plan empty after validation; using fallback"
            );
            return Err(Failure::Validation);
        }

        tracing::info!(
            target: "psim::reason",
            model = %self.model,
            plan_items = output.content_plan.len(),
            chosen = output.telemetry.get("chosen_ids").and_then(serde_json::Value::as_array).map_or(0, Vec::len),
            validation_warnings = warnings.len(),
            "LLM reasoning succeeded"
        );
        Ok(output)
    }
}

#[async_trait]
impl Reasoner for LlmReasoner {
    fn name(&self) -> &str {
        "llm"
    }

    async fn reason(&self, input: &ReasonInput) -> Result<ReasonOutput, PipelineError> {
        Ok(match self.try_reason(input).await {
            Ok(output) => output,
            Err(failure) => fallback(failure),
        })
    }
}

fn truncate_candidate(candidate: &Candidate) -> Candidate {
    let mut out = candidate.clone();
    if candidate.text.chars().count() > CANDIDATE_TEXT_LIMIT {
        out.text = candidate.text.chars().take(CANDIDATE_TEXT_LIMIT).collect::<String>() + "...";
    }
    out
}

/// Fixed plan used whenever the model result cannot be used.
fn fallback(failure: Failure) -> ReasonOutput {
    tracing::warn!(target: "psim::reason", failure = ?failure, "Using fallback reasoning response");
    let mut telemetry = Map::new();
    telemetry.insert("chosen_ids".into(), json!([]));
    match failure {
        Failure::Parse => {
            telemetry.insert("llm_parse_error".into(), Value::Bool(true));
        }
        Failure::Validation => {
            telemetry.insert("llm_validation_failed".into(), Value::Bool(true));
        }
        Failure::Upstream => {}
    }
    ReasonOutput {
        content_plan: vec![CONFUSED_SENTENCE.to_string()],
        distortions_plan: Vec::new(),
        style_directives: StyleDirectives::new("calm", "short"),
        state_updates: StateUpdates {
            trust_delta: -0.1,
            fatigue_delta: 0.05,
        },
        telemetry,
    }
}

/// Reads a validated payload; validation guarantees the shapes read here.
fn to_output(validated: &Value) -> ReasonOutput {
    let content_plan = validated["content_plan"]
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let style = &validated["style_directives"];
    let text = |v: &Value, default: &str| v.as_str().unwrap_or(default).to_string();
    let state = &validated["state_updates"];
    ReasonOutput {
        content_plan,
        distortions_plan: Vec::new(),
        style_directives: StyleDirectives::new(text(&style["tempo"], "medium"), text(&style["length"], "short")),
        state_updates: StateUpdates {
            trust_delta: state["trust_delta"].as_f64().unwrap_or(0.0),
            fatigue_delta: state["fatigue_delta"].as_f64().unwrap_or(0.0),
        },
        telemetry: validated["telemetry"].as_object().cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::ChatResponse;
    use psim_core::{CaseTruth, Policies, SessionState};
    use std::sync::Mutex;

    struct OneShot {
        reply: Mutex<Option<Result<ChatResponse, LlmError>>>,
        seen: Mutex<Vec<(String, Vec<ChatMessage>, ChatParams)>>,
    }

    impl OneShot {
        fn new(reply: Result<ChatResponse, LlmError>) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(reply)),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatClient for OneShot {
        async fn chat(&self, model: &str, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatResponse, LlmError> {
            self.seen.lock().unwrap().push((model.to_string(), messages.to_vec(), *params));
            self.reply.lock().unwrap().take().unwrap_or(Err(LlmError::EmptyResponse))
        }
    }

    fn input(candidates: Vec<Candidate>) -> ReasonInput {
        ReasonInput {
            case_truth: CaseTruth::default(),
            session_state: SessionState::default(),
            candidates,
            policies: Policies::default(),
        }
    }

    fn candidate(id: &str, text: &str) -> Candidate {
        Candidate {
            id: id.into(),
            kind: "fact".into(),
            text: text.into(),
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn valid_json_answer_is_validated_into_output() {
        let answer = "```json\n{\"content_plan\": [\"Плохо сплю\", \"Устаю\", \"extra\"], \
                      \"style_directives\": {\"tempo\": \"slow\", \"length\": \"short\"}, \
                      \"state_updates\": {\"trust_delta\": 0.5, \"fatigue_delta\": 0.01}, \
                      \"telemetry\": {\"chosen_ids\": [\"f1\"]}}\n```";
        let client = OneShot::new(Ok(ChatResponse::from_text(answer)));
        let reasoner = LlmReasoner::new(client.clone(), "deepseek-chat", "prompt");

        let out = reasoner.reason(&input(vec![candidate("f1", "text")])).await.unwrap();
        assert_eq!(out.content_plan, vec!["Плохо сплю".to_string(), "Устаю".to_string()]);
        assert_eq!(out.style_directives.tempo, "slow");
        assert!((out.state_updates.trust_delta - 0.2).abs() < 1e-9);
        assert_eq!(out.telemetry["chosen_ids"], json!(["f1"]));
        assert!(out.telemetry.contains_key("validation_warnings"));

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].0, "deepseek-chat");
        assert_eq!(seen[0].2, PARAMS);
        assert_eq!(seen[0].1[0].role, "system");
    }

    #[tokio::test]
    async fn prose_answer_flags_parse_error() {
        let client = OneShot::new(Ok(ChatResponse::from_text("I think the patient is tired.")));
        let out = LlmReasoner::new(client, "m", "p").reason(&input(vec![])).await.unwrap();
        assert_eq!(out.content_plan, vec![CONFUSED_SENTENCE.to_string()]);
        assert_eq!(out.style_directives.tempo, "calm");
        assert_eq!(out.state_updates.trust_delta, -0.1);
        assert_eq!(out.state_updates.fatigue_delta, 0.05);
        assert_eq!(out.telemetry["llm_parse_error"], json!(true));
        assert_eq!(out.telemetry["chosen_ids"], json!([]));
    }

    #[tokio::test]
    async fn upstream_failure_and_empty_choices_fall_back_without_flags() {
        for reply in [Err(LlmError::Timeout), Ok(ChatResponse::default())] {
            let out = LlmReasoner::new(OneShot::new(reply), "m", "p").reason(&input(vec![])).await.unwrap();
            assert_eq!(out.state_updates.trust_delta, -0.1);
            assert!(!out.telemetry.contains_key("llm_parse_error"));
            assert!(!out.telemetry.contains_key("llm_validation_failed"));
        }
    }

    #[tokio::test]
    async fn blank_plan_without_candidates_fails_validation() {
        let answer = "{\"content_plan\": [\"   \"], \"state_updates\": {\"trust_delta\": 0.1}}";
        let client = OneShot::new(Ok(ChatResponse::from_text(answer)));
        let out = LlmReasoner::new(client, "m", "p").reason(&input(vec![])).await.unwrap();
        assert_eq!(out.telemetry["llm_validation_failed"], json!(true));
        assert_eq!(out.content_plan, vec![CONFUSED_SENTENCE.to_string()]);
    }

    #[tokio::test]
    async fn long_candidates_are_truncated_in_the_prompt() {
        let client = OneShot::new(Err(LlmError::Timeout));
        let reasoner = LlmReasoner::new(client.clone(), "m", "p");
        reasoner.reason(&input(vec![candidate("f1", &"я".repeat(600))])).await.unwrap();

        let seen = client.seen.lock().unwrap();
        let payload: Value = serde_json::from_str(&seen[0].1[1].content).unwrap();
        let text = payload["candidates"][0]["text"].as_str().unwrap();
        assert_eq!(text.chars().count(), 503);
        assert!(text.ends_with("..."));
    }
}
