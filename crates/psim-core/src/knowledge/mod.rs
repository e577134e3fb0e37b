//! Case knowledge: records, collaborator traits and the two store backends.
//!
//! | Trait              | Data                                              |
//! |--------------------|---------------------------------------------------|
//! | `FragmentStore`    | Knowledge fragments per case, embedding backfill  |
//! | `CaseStore`        | Case truth and policies                           |
//! | `TrajectoryStore`  | Per-session completed steps, session links        |
//! | `TelemetrySink`    | Append-only turn telemetry                        |
//!
//! [`KnowledgeStore`] keeps everything in sled trees; [`MemoryStore`] keeps it in
//! `DashMap`s for tests and ephemeral runs.

mod case;
mod memory;
mod store;

pub use case::{
    Availability, CaseTruth, DisclosureRules, DistortionRules, KnowledgeFragment, NewFragment,
    Policies, RiskProtocol, SessionLink, StyleProfile, Trajectory, TrajectoryStep, TrustRequirement,
    TurnTelemetry, TurnTelemetryDraft,
};
pub use memory::MemoryStore;
pub use store::KnowledgeStore;

use crate::error::{PipelineError, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

/// Read access to a case's fragments plus the embedding backfill hooks.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    async fn case_exists(&self, case_id: &Uuid) -> Result<bool, StoreError>;

    /// All fragments of the case in insertion order. Unknown case → empty list.
    async fn get_fragments(&self, case_id: &Uuid) -> Result<Vec<KnowledgeFragment>, StoreError>;

    /// Up to `limit` fragments of the case whose embedding is still null.
    async fn fragments_missing_embedding(
        &self,
        case_id: &Uuid,
        limit: usize,
    ) -> Result<Vec<KnowledgeFragment>, StoreError>;

    /// Writes embeddings for the given fragment ids as one commit; returns rows updated.
    async fn set_embeddings(
        &self,
        case_id: &Uuid,
        updates: &[(Uuid, Vec<f32>)],
    ) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// `StoreError::NotFound` when the case does not exist.
    async fn get_case_truth(&self, case_id: &Uuid) -> Result<CaseTruth, StoreError>;

    async fn get_policies(&self, case_id: &Uuid) -> Result<Policies, StoreError>;
}

#[async_trait]
pub trait TrajectoryStore: Send + Sync {
    /// trajectory id → completed step ids for one session.
    async fn get_progress(&self, session_id: &Uuid) -> Result<HashMap<String, Vec<String>>, StoreError>;

    /// Union `step_ids` into the stored list (never removes); returns the merged list.
    async fn upsert_progress(
        &self,
        session_id: &Uuid,
        trajectory_id: &str,
        step_ids: &[String],
    ) -> Result<Vec<String>, StoreError>;

    /// Creates or updates a link; returns the case's session chain in link order.
    async fn link_session(&self, link: SessionLink) -> Result<Vec<Uuid>, StoreError>;

    async fn linked_sessions(&self, case_id: &Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Cases the session is linked to; empty when it was never linked.
    async fn linked_cases(&self, session_id: &Uuid) -> Result<Vec<Uuid>, StoreError>;
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Appends a turn record; the assigned turn number is max existing + 1.
    async fn append(&self, session_id: &Uuid, draft: TurnTelemetryDraft) -> Result<u32, StoreError>;

    async fn turns(&self, session_id: &Uuid) -> Result<Vec<TurnTelemetry>, StoreError>;
}

/// Text → vector. Dimensionality is fixed per provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Failures surface as `PipelineError::Upstream`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Merges `incoming` into `existing` keeping first-seen order and no duplicates.
pub(crate) fn union_into(existing: &mut Vec<String>, incoming: &[String]) {
    for step in incoming {
        if !existing.iter().any(|s| s == step) {
            existing.push(step.clone());
        }
    }
}
