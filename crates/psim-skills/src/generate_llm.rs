//! Model-backed reply synthesis from a guarded content plan.

use crate::llm::{load_prompt, ChatClient, ChatMessage, ChatParams};
use async_trait::async_trait;
use psim_core::{CoreConfig, Generator, PipelineError, StyleDirectives};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

const PROMPT_FILE: &str = "generation.prompt.txt";
const FALLBACK_PROMPT: &str = "You are a digital patient. Generate a natural response based on the \
     content plan and style directives provided.";
const DEFAULT_PATIENT_CONTEXT: &str = "General therapy patient";
const EMPTY_PLAN_REPLY: &str = "I'm not sure how to respond right now.";
const PARAMS: ChatParams = ChatParams {
    temperature: 0.7,
    max_tokens: 200,
};

pub struct LlmGenerator {
    client: Arc<dyn ChatClient>,
    model: String,
    system_prompt: String,
}

impl LlmGenerator {
    pub fn new(client: Arc<dyn ChatClient>, model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt: system_prompt.into(),
        }
    }

    /// Uses the configured base model and `prompts_dir/generation.prompt.txt`.
    pub fn from_config(config: &CoreConfig, client: Arc<dyn ChatClient>) -> Self {
        let prompt = load_prompt(Path::new(&config.prompts_dir), PROMPT_FILE, FALLBACK_PROMPT);
        Self::new(client, config.llm.base_model.clone(), prompt)
    }

    async fn request(
        &self,
        content_plan: &[String],
        style: &StyleDirectives,
        patient_context: Option<&str>,
    ) -> Result<Option<String>, PipelineError> {
        let payload = json!({
            "content_plan": content_plan,
            "style_directives": style,
            "patient_context": patient_context.unwrap_or(DEFAULT_PATIENT_CONTEXT),
        });
        let user = serde_json::to_string_pretty(&payload).map_err(|e| PipelineError::Parse(e.to_string()))?;
        let messages = [ChatMessage::system(self.system_prompt.as_str()), ChatMessage::user(user)];
        let response = self.client.chat(&self.model, &messages, &PARAMS).await?;
        Ok(response
            .content()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    /// Never fails: an unusable model reply degrades to the plan text itself.
    async fn generate(
        &self,
        content_plan: &[String],
        style: &StyleDirectives,
        patient_context: Option<&str>,
    ) -> Result<String, PipelineError> {
        match self.request(content_plan, style, patient_context).await {
            Ok(Some(text)) => {
                let reply = shape_reply(&text, &style.length);
                tracing::info!(
                    target: "psim::generate",
                    model = %self.model,
                    chars = reply.chars().count(),
                    length = %style.length,
                    "LLM generation succeeded"
                );
                Ok(reply)
            }
            Ok(None) => {
                tracing::error!(target: "psim::generate", model = %self.model, "Empty content from LLM generation");
                Ok(fallback_reply(content_plan))
            }
            Err(err) => {
                tracing::error!(target: "psim::generate", model = %self.model, error = %err, "LLM generation failed");
                Ok(fallback_reply(content_plan))
            }
        }
    }
}

/// Strips wrapping double quotes, then trims to the length directive: `short` keeps the
/// first sentence, `long` keeps at most three, anything else is left alone.
fn shape_reply(text: &str, length: &str) -> String {
    let mut content = text.trim();
    if content.len() >= 2 && content.starts_with('"') && content.ends_with('"') {
        content = &content[1..content.len() - 1];
    }

    let sentences: Vec<&str> = content.split('.').collect();
    let sentence_count = sentences.iter().filter(|s| !s.trim().is_empty()).count();

    match length {
        "short" if sentence_count > 1 => {
            let first = sentences[0].trim();
            if first.is_empty() {
                content.to_string()
            } else {
                format!("{}.", first)
            }
        }
        "long" if sentence_count > 3 => {
            let kept: Vec<&str> = sentences
                .iter()
                .take(3)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect();
            let mut joined = kept.join(". ");
            if !joined.ends_with('.') {
                joined.push('.');
            }
            joined
        }
        _ => content.to_string(),
    }
}

fn fallback_reply(content_plan: &[String]) -> String {
    tracing::warn!(target: "psim::generate", "Using fallback generation response");
    if content_plan.is_empty() {
        return EMPTY_PLAN_REPLY.to_string();
    }
    content_plan.iter().take(2).cloned().collect::<Vec<_>>().join(" ")
}
