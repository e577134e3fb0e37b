//! Chat-completion plumbing shared by the LLM reasoner and generator.

mod client;
pub(crate) use client::http_client;
mod json_parse;
mod validate;

pub use client::{ChatChoice, ChatClient, ChatMessage, ChatParams, ChatResponse, ChoiceMessage, ModelRouter, RetryPolicy};
pub use json_parse::{extract_json_blocks, normalize_reason_payload, parse_llm_json, CONFUSED_SENTENCE};
pub use validate::validate_reason_payload;

use std::path::Path;

/// Reads a system prompt from `dir/file_name`, falling back to `fallback` when the file
/// is missing, unreadable or blank.
pub fn load_prompt(dir: &Path, file_name: &str, fallback: &str) -> String {
    let path = dir.join(file_name);
    match std::fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => fallback.to_string(),
        Err(err) => {
            tracing::warn!(
                target: "psim::llm",
                path = %path.display(),
                error = %err,
                "Prompt file unavailable; using built-in prompt"
            );
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_file_overrides_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reasoning.prompt.txt"), "  Be a patient.\n").unwrap();
        assert_eq!(load_prompt(dir.path(), "reasoning.prompt.txt", "fallback"), "Be a patient.");
        assert_eq!(load_prompt(dir.path(), "missing.txt", "fallback"), "fallback");
    }
}
