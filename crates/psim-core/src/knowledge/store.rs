//! Sled-backed store with one tree per record family.
//!
//! | Tree                   | Key                          | Value               |
//! |------------------------|------------------------------|---------------------|
//! | `cases`                | `{case_id}`                  | `CaseRecord`        |
//! | `fragments`            | `{case_id}/{seq}`            | `KnowledgeFragment` |
//! | `session_trajectories` | `{session_id}/{trajectory}`  | completed step ids  |
//! | `session_links`        | `{case_id}/{session_id}`     | `LinkRecord`        |
//! | `telemetry_turns`      | `{session_id}/{turn_no}`     | `TurnTelemetry`     |
//!
//! `seq` comes from `Db::generate_id`, so a prefix scan returns fragments in insertion order.

use super::case::{now_ms, CaseTruth, KnowledgeFragment, NewFragment, Policies, SessionLink, TurnTelemetry, TurnTelemetryDraft};
use super::{union_into, CaseStore, FragmentStore, TelemetrySink, TrajectoryStore};
use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

const DEFAULT_PATH: &str = "./data/psim_knowledge";

const TREE_CASES: &str = "cases";
const TREE_FRAGMENTS: &str = "fragments";
const TREE_TRAJECTORIES: &str = "session_trajectories";
const TREE_LINKS: &str = "session_links";
const TREE_TELEMETRY: &str = "telemetry_turns";

const TREE_NAMES: [&str; 5] = [TREE_CASES, TREE_FRAGMENTS, TREE_TRAJECTORIES, TREE_LINKS, TREE_TELEMETRY];

/// Stored case: truth plus the raw policies document (parsed leniently on read).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CaseRecord {
    pub id: Uuid,
    pub case_truth: CaseTruth,
    pub policies: serde_json::Value,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinkRecord {
    link: SessionLink,
    seq: u64,
}

pub struct KnowledgeStore {
    db: Db,
}

impl KnowledgeStore {
    /// Opens or creates the store at `./data/psim_knowledge`.
    pub fn new() -> Result<Self, StoreError> {
        Self::open_path(DEFAULT_PATH)
    }

    /// Opens or creates the store at the given path and makes sure every tree exists.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        for name in TREE_NAMES {
            db.open_tree(name)?;
        }
        tracing::info!(target: "psim::knowledge", trees = TREE_NAMES.len(), "Knowledge store opened");
        Ok(Self { db })
    }

    /// Record counts per tree, for the daemon's `verify` command.
    pub fn tree_counts(&self) -> Result<Vec<(&'static str, usize)>, StoreError> {
        TREE_NAMES
            .iter()
            .map(|name| -> Result<(&'static str, usize), StoreError> {
                Ok((*name, self.db.open_tree(name)?.len()))
            })
            .collect()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Stores a new case and returns its id.
    pub fn create_case(&self, case_truth: CaseTruth, policies: serde_json::Value) -> Result<Uuid, StoreError> {
        let record = CaseRecord {
            id: Uuid::new_v4(),
            case_truth,
            policies,
            created_at_ms: now_ms(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.db.open_tree(TREE_CASES)?.insert(record.id.to_string().as_bytes(), bytes.as_slice())?;
        tracing::info!(
            target: "psim::knowledge",
            case_id = %record.id,
            trajectories = record.case_truth.trajectories.len(),
            bytes = bytes.len(),
            "Case created"
        );
        Ok(record.id)
    }

    /// Appends a fragment to an existing case.
    pub fn insert_fragment(&self, case_id: &Uuid, fragment: NewFragment) -> Result<Uuid, StoreError> {
        if self.case_record(case_id)?.is_none() {
            return Err(StoreError::NotFound(format!("case {}", case_id)));
        }
        let fragment = fragment.into_fragment(*case_id);
        let seq = self.db.generate_id()?;
        let key = format!("{}/{:020}", case_id, seq);
        let bytes = fragment.to_bytes()?;
        self.db.open_tree(TREE_FRAGMENTS)?.insert(key.as_bytes(), bytes.as_slice())?;
        tracing::info!(
            target: "psim::knowledge",
            case_id = %case_id,
            fragment_id = %fragment.id,
            availability = %fragment.availability,
            key = %key,
            bytes = bytes.len(),
            "Fragment inserted"
        );
        Ok(fragment.id)
    }

    fn case_record(&self, case_id: &Uuid) -> Result<Option<CaseRecord>, StoreError> {
        let tree = self.db.open_tree(TREE_CASES)?;
        match tree.get(case_id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_case(&self, case_id: &Uuid) -> Result<CaseRecord, StoreError> {
        self.case_record(case_id)?
            .ok_or_else(|| StoreError::NotFound(format!("case {}", case_id)))
    }

    /// (key, fragment) pairs of one case in insertion order.
    fn scan_fragments(&self, case_id: &Uuid) -> Result<Vec<(sled::IVec, KnowledgeFragment)>, StoreError> {
        let tree = self.db.open_tree(TREE_FRAGMENTS)?;
        let prefix = format!("{}/", case_id);
        let mut out = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            out.push((key, KnowledgeFragment::from_bytes(&value)?));
        }
        Ok(out)
    }

    fn scan_links(&self, case_id: &Uuid) -> Result<Vec<LinkRecord>, StoreError> {
        let tree = self.db.open_tree(TREE_LINKS)?;
        let prefix = format!("{}/", case_id);
        let mut links = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            links.push(serde_json::from_slice::<LinkRecord>(&value)?);
        }
        links.sort_by_key(|l| l.seq);
        Ok(links)
    }
}

#[async_trait]
impl FragmentStore for KnowledgeStore {
    async fn case_exists(&self, case_id: &Uuid) -> Result<bool, StoreError> {
        Ok(self.db.open_tree(TREE_CASES)?.contains_key(case_id.to_string().as_bytes())?)
    }

    async fn get_fragments(&self, case_id: &Uuid) -> Result<Vec<KnowledgeFragment>, StoreError> {
        Ok(self.scan_fragments(case_id)?.into_iter().map(|(_, f)| f).collect())
    }

    async fn fragments_missing_embedding(
        &self,
        case_id: &Uuid,
        limit: usize,
    ) -> Result<Vec<KnowledgeFragment>, StoreError> {
        Ok(self
            .scan_fragments(case_id)?
            .into_iter()
            .map(|(_, f)| f)
            .filter(|f| f.embedding.is_none())
            .take(limit)
            .collect())
    }

    async fn set_embeddings(
        &self,
        case_id: &Uuid,
        updates: &[(Uuid, Vec<f32>)],
    ) -> Result<usize, StoreError> {
        let wanted: HashMap<Uuid, &Vec<f32>> = updates.iter().map(|(id, v)| (*id, v)).collect();
        let mut batch = sled::Batch::default();
        let mut updated = 0;
        for (key, mut fragment) in self.scan_fragments(case_id)? {
            if let Some(vector) = wanted.get(&fragment.id) {
                fragment.embedding = Some((*vector).clone());
                batch.insert(key, fragment.to_bytes()?);
                updated += 1;
            }
        }
        self.db.open_tree(TREE_FRAGMENTS)?.apply_batch(batch)?;
        tracing::info!(
            target: "psim::knowledge",
            case_id = %case_id,
            requested = updates.len(),
            updated,
            "Embeddings committed"
        );
        Ok(updated)
    }
}

#[async_trait]
impl CaseStore for KnowledgeStore {
    async fn get_case_truth(&self, case_id: &Uuid) -> Result<CaseTruth, StoreError> {
        Ok(self.require_case(case_id)?.case_truth)
    }

    async fn get_policies(&self, case_id: &Uuid) -> Result<Policies, StoreError> {
        Ok(Policies::from_value(&self.require_case(case_id)?.policies))
    }
}

#[async_trait]
impl TrajectoryStore for KnowledgeStore {
    async fn get_progress(&self, session_id: &Uuid) -> Result<HashMap<String, Vec<String>>, StoreError> {
        let tree = self.db.open_tree(TREE_TRAJECTORIES)?;
        let prefix = format!("{}/", session_id);
        let mut progress = HashMap::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            let trajectory_id = key.trim_start_matches(prefix.as_str()).to_string();
            progress.insert(trajectory_id, serde_json::from_slice(&value)?);
        }
        Ok(progress)
    }

    async fn upsert_progress(
        &self,
        session_id: &Uuid,
        trajectory_id: &str,
        step_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let tree = self.db.open_tree(TREE_TRAJECTORIES)?;
        let key = format!("{}/{}", session_id, trajectory_id);
        // Compare-and-swap keeps the union intact under concurrent writers.
        loop {
            let current = tree.get(key.as_bytes())?;
            let mut steps: Vec<String> = match &current {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => Vec::new(),
            };
            union_into(&mut steps, step_ids);
            let encoded = serde_json::to_vec(&steps)?;
            if tree.compare_and_swap(key.as_bytes(), current, Some(encoded))?.is_ok() {
                tracing::debug!(
                    target: "psim::knowledge",
                    session_id = %session_id,
                    trajectory_id,
                    completed = steps.len(),
                    "Trajectory progress upserted"
                );
                return Ok(steps);
            }
        }
    }

    async fn link_session(&self, link: SessionLink) -> Result<Vec<Uuid>, StoreError> {
        self.require_case(&link.case_id)?;
        let existing = self.scan_links(&link.case_id)?;
        if let Some(prev) = link.prev_session_id {
            if !existing.iter().any(|l| l.link.session_id == prev) {
                return Err(StoreError::NotFound(format!("previous session {}", prev)));
            }
        }
        let seq = match existing.iter().find(|l| l.link.session_id == link.session_id) {
            Some(found) => found.seq,
            None => self.db.generate_id()?,
        };
        let key = format!("{}/{}", link.case_id, link.session_id);
        let case_id = link.case_id;
        let session_id = link.session_id;
        let bytes = serde_json::to_vec(&LinkRecord { link, seq })?;
        self.db.open_tree(TREE_LINKS)?.insert(key.as_bytes(), bytes)?;
        tracing::info!(target: "psim::knowledge", case_id = %case_id, session_id = %session_id, "Session linked");
        self.linked_sessions(&case_id).await
    }

    async fn linked_sessions(&self, case_id: &Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.scan_links(case_id)?.into_iter().map(|l| l.link.session_id).collect())
    }

    async fn linked_cases(&self, session_id: &Uuid) -> Result<Vec<Uuid>, StoreError> {
        let suffix = format!("/{}", session_id);
        let mut cases = Vec::new();
        for item in self.db.open_tree(TREE_LINKS)?.iter() {
            let (key, value) = item?;
            if key.ends_with(suffix.as_bytes()) {
                cases.push(serde_json::from_slice::<LinkRecord>(&value)?.link.case_id);
            }
        }
        Ok(cases)
    }
}

#[async_trait]
impl TelemetrySink for KnowledgeStore {
    async fn append(&self, session_id: &Uuid, draft: TurnTelemetryDraft) -> Result<u32, StoreError> {
        let tree = self.db.open_tree(TREE_TELEMETRY)?;
        let prefix = format!("{}/", session_id);
        loop {
            let last = match tree.scan_prefix(prefix.as_bytes()).next_back() {
                Some(item) => {
                    let (_, value) = item?;
                    serde_json::from_slice::<TurnTelemetry>(&value)?.turn_no
                }
                None => 0,
            };
            let turn_no = last + 1;
            let key = format!("{}{:010}", prefix, turn_no);
            let record = TurnTelemetry::from_draft(*session_id, turn_no, draft.clone());
            let bytes = serde_json::to_vec(&record)?;
            if tree
                .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(bytes))?
                .is_ok()
            {
                tracing::debug!(
                    target: "psim::knowledge",
                    session_id = %session_id,
                    turn_no,
                    risk_status = %record.risk_status,
                    "Turn telemetry appended"
                );
                return Ok(turn_no);
            }
        }
    }

    async fn turns(&self, session_id: &Uuid) -> Result<Vec<TurnTelemetry>, StoreError> {
        let tree = self.db.open_tree(TREE_TELEMETRY)?;
        let prefix = format!("{}/", session_id);
        let mut turns = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            turns.push(serde_json::from_slice::<TurnTelemetry>(&value)?);
        }
        Ok(turns)
    }
}
