//! Case definition files: `{"case": {case_truth, policies}, "kb": [fragment, ...]}`.

use psim_core::{Availability, CaseTruth, KnowledgeStore, NewFragment};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CaseFile {
    pub case: CaseSection,
    pub kb: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CaseSection {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub case_truth: CaseTruth,
    #[serde(default)]
    pub policies: Value,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub inserted: usize,
    pub skipped: usize,
}

impl CaseFile {
    pub fn read(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        serde_json::from_str(&raw).map_err(|e| format!("invalid case file {}: {}", path.display(), e))
    }

    /// Creates the case and its fragments. Items lacking `type`, `text` or `metadata`
    /// are skipped with a warning; availability comes from `metadata.availability`.
    pub fn load_into(self, store: &KnowledgeStore) -> Result<(Uuid, LoadSummary), String> {
        let case_id = store
            .create_case(self.case.case_truth, self.case.policies)
            .map_err(|e| format!("case insert failed: {}", e))?;

        let mut summary = LoadSummary::default();
        for item in &self.kb {
            match fragment_from_item(item) {
                Some(fragment) => {
                    store
                        .insert_fragment(&case_id, fragment)
                        .map_err(|e| format!("fragment insert failed: {}", e))?;
                    summary.inserted += 1;
                }
                None => {
                    tracing::warn!(
                        target: "psim::knowledge",
                        item = %item.get("id").unwrap_or(&serde_json::Value::Null),
                        "KB item missing type/text/metadata; skipped"
                    );
                    summary.skipped += 1;
                }
            }
        }

        tracing::info!(
            target: "psim::knowledge",
            case_id = %case_id,
            version = self.case.version.as_deref().unwrap_or("unversioned"),
            inserted = summary.inserted,
            skipped = summary.skipped,
            "Case loaded"
        );
        Ok((case_id, summary))
    }
}

fn fragment_from_item(item: &Value) -> Option<NewFragment> {
    let kind = item.get("type")?.as_str()?;
    let text = item.get("text")?.as_str()?;
    let metadata: Map<String, Value> = item.get("metadata")?.as_object()?.clone();
    let availability = metadata
        .get("availability")
        .cloned()
        .and_then(|v| serde_json::from_value::<Availability>(v).ok())
        .unwrap_or(Availability::Public);
    let mut fragment = NewFragment::new(kind, text, availability);
    fragment.metadata = metadata;
    Some(fragment)
}
