//! Session evaluation: key-fragment recall, risk timeliness, question quality, trajectories.

use super::trajectory::{progress_view, CaseTrajectoryReport, TrajectoryProgress, TrajectoryTracker};
use crate::error::PipelineError;
use crate::knowledge::{CaseStore, CaseTruth, FragmentStore, KnowledgeFragment, TelemetrySink, TrajectoryStore, TurnTelemetry};
use crate::shared::{Intent, RiskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

const KEY_TAGS: [&str; 2] = ["hook", "key"];
const UNKNOWN_INTENT: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedKeys {
    pub ids: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionQuality {
    /// (open_question + clarify) / max(known, 1).
    pub score: f64,
    pub counts: BTreeMap<String, u32>,
    pub known: u32,
    pub good: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub recall_keys: f64,
    pub risk_timeliness: f64,
    pub turns_total: usize,
    pub used_fragments_total: usize,
    pub key_fragments_total: usize,
    pub used_key_ids: Vec<String>,
    pub all_key_ids: Vec<String>,
    pub missed_keys: MissedKeys,
    pub question_quality: QuestionQuality,
    pub first_acute_turn: Option<u32>,
    pub trajectory_progress: Vec<TrajectoryProgress>,
}

impl SessionMetrics {
    pub fn compute(
        case_truth: &CaseTruth,
        fragments: &[KnowledgeFragment],
        turns: &[TurnTelemetry],
        progress: &HashMap<String, Vec<String>>,
    ) -> Self {
        let mut turns: Vec<&TurnTelemetry> = turns.iter().collect();
        turns.sort_by_key(|t| t.turn_no);

        let all_key_ids: Vec<String> = fragments
            .iter()
            .filter(|f| f.tags().iter().any(|tag| KEY_TAGS.contains(tag)))
            .map(|f| f.id.to_string())
            .collect();

        let used: HashSet<&str> = turns
            .iter()
            .flat_map(|t| t.used_fragments.iter().map(String::as_str))
            .collect();
        let (used_key_ids, missed_ids): (Vec<String>, Vec<String>) =
            all_key_ids.iter().cloned().partition(|id| used.contains(id.as_str()));

        let recall_keys = if all_key_ids.is_empty() {
            1.0
        } else {
            used_key_ids.len() as f64 / all_key_ids.len() as f64
        };

        let first_acute_turn = turns
            .iter()
            .find(|t| t.risk_status == RiskStatus::Acute)
            .map(|t| t.turn_no);
        let risk_timeliness = risk_timeliness(!case_truth.red_flags.is_empty(), first_acute_turn);

        SessionMetrics {
            recall_keys,
            risk_timeliness,
            turns_total: turns.len(),
            used_fragments_total: used.len(),
            key_fragments_total: all_key_ids.len(),
            missed_keys: MissedKeys {
                count: missed_ids.len(),
                ids: missed_ids,
            },
            used_key_ids,
            all_key_ids,
            question_quality: question_quality(&turns),
            first_acute_turn,
            trajectory_progress: progress_view(&case_truth.trajectories, progress),
        }
    }
}

/// 1.0 without red flags; otherwise by the first acute turn: ≤3 → 1.0, ≤6 → 0.5, later or never → 0.0.
fn risk_timeliness(has_red_flags: bool, first_acute_turn: Option<u32>) -> f64 {
    if !has_red_flags {
        return 1.0;
    }
    match first_acute_turn {
        Some(turn) if turn <= 3 => 1.0,
        Some(turn) if turn <= 6 => 0.5,
        _ => 0.0,
    }
}

fn question_quality(turns: &[&TurnTelemetry]) -> QuestionQuality {
    let mut counts: BTreeMap<String, u32> = [
        Intent::OpenQuestion,
        Intent::Clarify,
        Intent::RiskCheck,
        Intent::Rapport,
    ]
    .iter()
    .map(|i| (i.as_str().to_string(), 0))
    .chain(std::iter::once((UNKNOWN_INTENT.to_string(), 0)))
    .collect();

    for turn in turns {
        let key = turn
            .intent()
            .and_then(Intent::parse)
            .map(|i| i.as_str())
            .unwrap_or(UNKNOWN_INTENT);
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }

    let good = counts[Intent::OpenQuestion.as_str()] + counts[Intent::Clarify.as_str()];
    let known = turns.len() as u32 - counts[UNKNOWN_INTENT];
    QuestionQuality {
        score: f64::from(good) / f64::from(known.max(1)),
        counts,
        known,
        good,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub case_id: String,
    pub metrics: SessionMetrics,
}

/// Read-side evaluation over the stores.
pub struct Evaluator {
    cases: Arc<dyn CaseStore>,
    fragments: Arc<dyn FragmentStore>,
    telemetry: Arc<dyn TelemetrySink>,
    trajectories: Arc<dyn TrajectoryStore>,
    tracker: TrajectoryTracker,
}

impl Evaluator {
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: FragmentStore + CaseStore + TrajectoryStore + TelemetrySink + 'static,
    {
        Self {
            cases: store.clone(),
            fragments: store.clone(),
            telemetry: store.clone(),
            trajectories: store.clone(),
            tracker: TrajectoryTracker::new(store.clone(), store),
        }
    }

    /// Rejects a session that is linked only to other cases. An unlinked session is
    /// scored against `case_id` as given.
    pub async fn session_report(&self, session_id: &str, case_id: &str) -> Result<SessionReport, PipelineError> {
        let session = PipelineError::parse_id("session_id", session_id)?;
        let case = PipelineError::parse_id("case_id", case_id)?;

        let linked = self.trajectories.linked_cases(&session).await?;
        if linked.is_empty() {
            tracing::warn!(
                target: "psim::pipeline",
                session_id = %session,
                case_id = %case,
                "Session has no case link; scoring against the given case"
            );
        } else if !linked.contains(&case) {
            return Err(PipelineError::BadInput(format!(
                "session {} is linked to case {}, not {}",
                session,
                linked.iter().map(Uuid::to_string).collect::<Vec<_>>().join(", "),
                case
            )));
        }

        let case_truth = self.cases.get_case_truth(&case).await?;
        let fragments = self.fragments.get_fragments(&case).await?;
        let turns = self.telemetry.turns(&session).await?;
        let progress = self.trajectories.get_progress(&session).await?;

        let metrics = SessionMetrics::compute(&case_truth, &fragments, &turns, &progress);
        tracing::info!(
            target: "psim::pipeline",
            session_id = %session,
            case_id = %case,
            turns = metrics.turns_total,
            recall_keys = metrics.recall_keys,
            "Session report computed"
        );
        Ok(SessionReport {
            session_id: session.to_string(),
            case_id: case.to_string(),
            metrics,
        })
    }

    /// The case a session is linked to, when there is exactly one.
    pub async fn linked_case(&self, session_id: &str) -> Result<Option<Uuid>, PipelineError> {
        let session = PipelineError::parse_id("session_id", session_id)?;
        let linked = self.trajectories.linked_cases(&session).await?;
        Ok(match linked.as_slice() {
            [only] => Some(*only),
            _ => None,
        })
    }

    pub async fn case_trajectories(&self, case_id: &str) -> Result<CaseTrajectoryReport, PipelineError> {
        let case = PipelineError::parse_id("case_id", case_id)?;
        let case_truth = self.cases.get_case_truth(&case).await?;
        self.tracker.case_report(&case, &case_truth.trajectories).await
    }

    pub async fn session_trajectories(
        &self,
        session_id: &str,
        case_id: &str,
    ) -> Result<Vec<TrajectoryProgress>, PipelineError> {
        let session = PipelineError::parse_id("session_id", session_id)?;
        let case = PipelineError::parse_id("case_id", case_id)?;
        let case_truth = self.cases.get_case_truth(&case).await?;
        self.tracker.session_progress(&session, &case_truth.trajectories).await
    }
}
