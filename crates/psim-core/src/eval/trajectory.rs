//! Cross-turn trajectory tracking and its session/case read views.

use crate::error::PipelineError;
use crate::knowledge::{union_into, FragmentStore, Trajectory, TrajectoryStep, TrajectoryStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Completed steps of one trajectory within one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryProgress {
    pub trajectory_id: String,
    pub completed_steps: Vec<String>,
    pub total: usize,
}

/// Union of completed steps across every session linked to a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryAggregate {
    pub trajectory_id: String,
    pub completed_steps_union: Vec<String>,
    /// |union| / |steps|; 0.0 for a trajectory without steps.
    pub coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseTrajectoryReport {
    pub case_id: String,
    pub sessions: Vec<String>,
    pub trajectories: Vec<TrajectoryAggregate>,
}

pub struct TrajectoryTracker {
    store: Arc<dyn TrajectoryStore>,
    fragments: Arc<dyn FragmentStore>,
}

impl TrajectoryTracker {
    pub fn new(store: Arc<dyn TrajectoryStore>, fragments: Arc<dyn FragmentStore>) -> Self {
        Self { store, fragments }
    }

    /// Marks every not-yet-completed step whose trust threshold is met and whose condition
    /// tags (if any) intersect the tags of this turn's fragments. Returns the newly completed
    /// step ids per trajectory. Completion is additive: nothing is ever removed.
    pub async fn update(
        &self,
        session_id: &Uuid,
        case_id: &Uuid,
        trajectories: &[Trajectory],
        trust: f64,
        used_fragment_ids: &[String],
    ) -> Result<Vec<(String, Vec<String>)>, PipelineError> {
        if trajectories.is_empty() {
            return Ok(Vec::new());
        }

        let progress = self.store.get_progress(session_id).await?;
        let used: HashSet<&str> = used_fragment_ids.iter().map(String::as_str).collect();
        let turn_tags: HashSet<String> = if used.is_empty() {
            HashSet::new()
        } else {
            self.fragments
                .get_fragments(case_id)
                .await?
                .iter()
                .filter(|f| used.contains(f.id.to_string().as_str()))
                .flat_map(|f| f.tags().into_iter().map(str::to_string).collect::<Vec<_>>())
                .collect()
        };

        let mut completed = Vec::new();
        for trajectory in trajectories {
            let done = progress.get(&trajectory.id);
            let newly: Vec<String> = trajectory
                .steps
                .iter()
                .filter(|step| !done.is_some_and(|d| d.contains(&step.id)))
                .filter(|step| step_satisfied(step, trust, &turn_tags))
                .map(|step| step.id.clone())
                .collect();
            if newly.is_empty() {
                continue;
            }
            let merged = self.store.upsert_progress(session_id, &trajectory.id, &newly).await?;
            tracing::info!(
                target: "psim::trajectory",
                session_id = %session_id,
                trajectory_id = %trajectory.id,
                new_steps = ?newly,
                completed = merged.len(),
                total = trajectory.steps.len(),
                "Trajectory steps completed"
            );
            completed.push((trajectory.id.clone(), newly));
        }
        Ok(completed)
    }

    /// Best-effort [`update`](Self::update): failures are logged and never reach the caller.
    pub async fn record(
        &self,
        session_id: &Uuid,
        case_id: &Uuid,
        trajectories: &[Trajectory],
        trust: f64,
        used_fragment_ids: &[String],
    ) {
        if let Err(err) = self
            .update(session_id, case_id, trajectories, trust, used_fragment_ids)
            .await
        {
            tracing::warn!(
                target: "psim::trajectory",
                session_id = %session_id,
                error = %err,
                "Trajectory update failed; ignored"
            );
        }
    }

    /// Progress of one session for each of the case's trajectories, in case order.
    pub async fn session_progress(
        &self,
        session_id: &Uuid,
        trajectories: &[Trajectory],
    ) -> Result<Vec<TrajectoryProgress>, PipelineError> {
        let progress = self.store.get_progress(session_id).await?;
        Ok(progress_view(trajectories, &progress))
    }

    /// Aggregates completed steps over all sessions linked to the case.
    pub async fn case_report(
        &self,
        case_id: &Uuid,
        trajectories: &[Trajectory],
    ) -> Result<CaseTrajectoryReport, PipelineError> {
        let sessions = self.store.linked_sessions(case_id).await?;
        let mut report = CaseTrajectoryReport {
            case_id: case_id.to_string(),
            sessions: sessions.iter().map(Uuid::to_string).collect(),
            trajectories: Vec::new(),
        };
        if sessions.is_empty() {
            return Ok(report);
        }

        let mut per_session = Vec::with_capacity(sessions.len());
        for session_id in &sessions {
            per_session.push(self.store.get_progress(session_id).await?);
        }

        report.trajectories = trajectories
            .iter()
            .map(|trajectory| {
                let mut union = Vec::new();
                for progress in &per_session {
                    if let Some(steps) = progress.get(&trajectory.id) {
                        union_into(&mut union, steps);
                    }
                }
                aggregate(trajectory, union)
            })
            .collect();

        tracing::debug!(
            target: "psim::trajectory",
            case_id = %case_id,
            sessions = sessions.len(),
            trajectories = report.trajectories.len(),
            "Case trajectory report built"
        );
        Ok(report)
    }
}

fn step_satisfied(step: &TrajectoryStep, trust: f64, turn_tags: &HashSet<String>) -> bool {
    trust >= step.min_trust
        && (step.condition_tags.is_empty() || step.condition_tags.iter().any(|t| turn_tags.contains(t)))
}

pub(crate) fn progress_view(
    trajectories: &[Trajectory],
    progress: &HashMap<String, Vec<String>>,
) -> Vec<TrajectoryProgress> {
    trajectories
        .iter()
        .map(|t| TrajectoryProgress {
            trajectory_id: t.id.clone(),
            completed_steps: progress.get(&t.id).cloned().unwrap_or_default(),
            total: t.steps.len(),
        })
        .collect()
}

/// Orders the union by step definition; ids unknown to the trajectory keep their first-seen order
/// at the end.
fn aggregate(trajectory: &Trajectory, union: Vec<String>) -> TrajectoryAggregate {
    let mut ordered: Vec<String> = trajectory
        .steps
        .iter()
        .filter(|s| union.contains(&s.id))
        .map(|s| s.id.clone())
        .collect();
    for id in union {
        if !ordered.contains(&id) {
            ordered.push(id);
        }
    }
    let total = trajectory.steps.len();
    let coverage = if total == 0 {
        0.0
    } else {
        ordered.len() as f64 / total as f64
    };
    TrajectoryAggregate {
        trajectory_id: trajectory.id.clone(),
        completed_steps_union: ordered,
        coverage,
    }
}
