//! Utterance classifier: intent, topics, risk flags, summary.

use crate::shared::{Intent, SessionState};
use serde::{Deserialize, Serialize};

const DEFAULT_RISK_KEYWORDS: [&str; 4] = ["суицид", "убить себя", "не хочу жить", "покончить с жизнью"];

const DEFAULT_SUICIDE_KEYWORDS: [&str; 6] = [
    "суицид",
    "убить себя",
    "не хочу жить",
    "покончить с жизнью",
    "повеситься",
    "отравиться",
];

const CLARIFY_WORDS: [&str; 6] = ["как", "что", "когда", "где", "почему", "какой"];
const RAPPORT_WORDS: [&str; 3] = ["понимаю", "сочувствую", "поддерживаю"];

const TOPIC_KEYWORDS: [(&str, &[&str]); 5] = [
    ("sleep", &["спать", "спите", "сон", "бессонница", "засыпа"]),
    ("mood", &["настроение", "депрессия", "грусть", "радость", "тревога"]),
    ("alcohol", &["алкоголь", "пить", "выпивка", "водка", "пиво"]),
    ("work", &["работа", "работой", "карьера", "коллеги", "босс"]),
    ("family", &["семья", "семьей", "родители", "дети", "жена", "муж"]),
];

pub const SUICIDE_IDEATION: &str = "suicide_ideation";

const SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalized {
    pub intent: Intent,
    pub topics: Vec<String>,
    pub risk_flags: Vec<String>,
    pub last_turn_summary: String,
}

/// Classifies a therapist utterance.
///
/// `trigger_keywords` come from the case's risk protocol; when empty, built-in lists are used
/// (the suicide list is a superset of the intent list). Session state is accepted but unused.
pub fn normalize(utterance: &str, _state: &SessionState, trigger_keywords: &[String]) -> Normalized {
    let lower = utterance.to_lowercase();

    let policy_keywords: Vec<String> = trigger_keywords.iter().map(|k| k.to_lowercase()).collect();
    let risk_hit = if policy_keywords.is_empty() {
        contains_any(&lower, DEFAULT_RISK_KEYWORDS.iter().copied())
    } else {
        contains_any(&lower, policy_keywords.iter().map(String::as_str))
    };
    let suicide_hit = if policy_keywords.is_empty() {
        contains_any(&lower, DEFAULT_SUICIDE_KEYWORDS.iter().copied())
    } else {
        risk_hit
    };

    let intent = if risk_hit {
        Intent::RiskCheck
    } else if contains_any(&lower, CLARIFY_WORDS.iter().copied()) {
        Intent::Clarify
    } else if contains_any(&lower, RAPPORT_WORDS.iter().copied()) {
        Intent::Rapport
    } else {
        Intent::OpenQuestion
    };

    let topics = TOPIC_KEYWORDS
        .iter()
        .filter(|(_, words)| contains_any(&lower, words.iter().copied()))
        .map(|(topic, _)| topic.to_string())
        .collect();

    let risk_flags = if suicide_hit {
        vec![SUICIDE_IDEATION.to_string()]
    } else {
        Vec::new()
    };

    let normalized = Normalized {
        intent,
        topics,
        risk_flags,
        last_turn_summary: summarize(utterance),
    };
    tracing::debug!(
        target: "psim::normalize",
        intent = %normalized.intent,
        topics = ?normalized.topics,
        risk_flags = normalized.risk_flags.len(),
        "Utterance normalized"
    );
    normalized
}

fn contains_any<'a>(haystack: &str, mut needles: impl Iterator<Item = &'a str>) -> bool {
    needles.any(|n| !n.is_empty() && haystack.contains(n))
}

fn summarize(utterance: &str) -> String {
    if utterance.chars().count() <= SUMMARY_MAX_CHARS {
        return utterance.to_string();
    }
    let mut cut: String = utterance.chars().take(SUMMARY_MAX_CHARS).collect();
    cut.push_str("...");
    cut
}
