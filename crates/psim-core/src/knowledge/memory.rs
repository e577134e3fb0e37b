//! In-process store on `DashMap`s. Same contracts as the sled store, nothing persisted.

use super::case::{now_ms, CaseTruth, KnowledgeFragment, NewFragment, Policies, SessionLink, TurnTelemetry, TurnTelemetryDraft};
use super::store::CaseRecord;
use super::{union_into, CaseStore, FragmentStore, TelemetrySink, TrajectoryStore};
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    cases: DashMap<Uuid, CaseRecord>,
    fragments: DashMap<Uuid, Vec<KnowledgeFragment>>,
    progress: DashMap<Uuid, HashMap<String, Vec<String>>>,
    links: DashMap<Uuid, Vec<SessionLink>>,
    telemetry: DashMap<Uuid, Vec<TurnTelemetry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_case(&self, case_truth: CaseTruth, policies: serde_json::Value) -> Uuid {
        let id = Uuid::new_v4();
        self.cases.insert(
            id,
            CaseRecord {
                id,
                case_truth,
                policies,
                created_at_ms: now_ms(),
            },
        );
        self.fragments.insert(id, Vec::new());
        id
    }

    pub fn insert_fragment(&self, case_id: &Uuid, fragment: NewFragment) -> Result<Uuid, StoreError> {
        let mut fragments = self
            .fragments
            .get_mut(case_id)
            .ok_or_else(|| StoreError::NotFound(format!("case {}", case_id)))?;
        let fragment = fragment.into_fragment(*case_id);
        let id = fragment.id;
        fragments.push(fragment);
        Ok(id)
    }

    fn require_case(&self, case_id: &Uuid) -> Result<CaseRecord, StoreError> {
        self.cases
            .get(case_id)
            .map(|record| record.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("case {}", case_id)))
    }
}

#[async_trait]
impl FragmentStore for MemoryStore {
    async fn case_exists(&self, case_id: &Uuid) -> Result<bool, StoreError> {
        Ok(self.cases.contains_key(case_id))
    }

    async fn get_fragments(&self, case_id: &Uuid) -> Result<Vec<KnowledgeFragment>, StoreError> {
        Ok(self.fragments.get(case_id).map(|f| f.clone()).unwrap_or_default())
    }

    async fn fragments_missing_embedding(
        &self,
        case_id: &Uuid,
        limit: usize,
    ) -> Result<Vec<KnowledgeFragment>, StoreError> {
        Ok(self
            .fragments
            .get(case_id)
            .map(|all| {
                all.iter()
                    .filter(|f| f.embedding.is_none())
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_embeddings(
        &self,
        case_id: &Uuid,
        updates: &[(Uuid, Vec<f32>)],
    ) -> Result<usize, StoreError> {
        let Some(mut fragments) = self.fragments.get_mut(case_id) else {
            return Ok(0);
        };
        let mut updated = 0;
        for (id, vector) in updates {
            if let Some(fragment) = fragments.iter_mut().find(|f| f.id == *id) {
                fragment.embedding = Some(vector.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn get_case_truth(&self, case_id: &Uuid) -> Result<CaseTruth, StoreError> {
        Ok(self.require_case(case_id)?.case_truth)
    }

    async fn get_policies(&self, case_id: &Uuid) -> Result<Policies, StoreError> {
        Ok(Policies::from_value(&self.require_case(case_id)?.policies))
    }
}

#[async_trait]
impl TrajectoryStore for MemoryStore {
    async fn get_progress(&self, session_id: &Uuid) -> Result<HashMap<String, Vec<String>>, StoreError> {
        Ok(self.progress.get(session_id).map(|p| p.clone()).unwrap_or_default())
    }

    async fn upsert_progress(
        &self,
        session_id: &Uuid,
        trajectory_id: &str,
        step_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let mut session = self.progress.entry(*session_id).or_default();
        let steps = session.entry(trajectory_id.to_string()).or_default();
        union_into(steps, step_ids);
        Ok(steps.clone())
    }

    async fn link_session(&self, link: SessionLink) -> Result<Vec<Uuid>, StoreError> {
        self.require_case(&link.case_id)?;
        let mut chain = self.links.entry(link.case_id).or_default();
        if let Some(prev) = link.prev_session_id {
            if !chain.iter().any(|l| l.session_id == prev) {
                return Err(StoreError::NotFound(format!("previous session {}", prev)));
            }
        }
        match chain.iter_mut().find(|l| l.session_id == link.session_id) {
            Some(existing) => *existing = link,
            None => chain.push(link),
        }
        Ok(chain.iter().map(|l| l.session_id).collect())
    }

    async fn linked_sessions(&self, case_id: &Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .links
            .get(case_id)
            .map(|chain| chain.iter().map(|l| l.session_id).collect())
            .unwrap_or_default())
    }

    async fn linked_cases(&self, session_id: &Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .links
            .iter()
            .filter(|entry| entry.value().iter().any(|l| l.session_id == *session_id))
            .map(|entry| *entry.key())
            .collect())
    }
}

#[async_trait]
impl TelemetrySink for MemoryStore {
    async fn append(&self, session_id: &Uuid, draft: TurnTelemetryDraft) -> Result<u32, StoreError> {
        let mut turns = self.telemetry.entry(*session_id).or_default();
        let turn_no = turns.iter().map(|t| t.turn_no).max().unwrap_or(0) + 1;
        turns.push(TurnTelemetry::from_draft(*session_id, turn_no, draft));
        Ok(turn_no)
    }

    async fn turns(&self, session_id: &Uuid) -> Result<Vec<TurnTelemetry>, StoreError> {
        Ok(self.telemetry.get(session_id).map(|t| t.clone()).unwrap_or_default())
    }
}
