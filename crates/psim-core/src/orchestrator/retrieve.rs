//! Fragment retrieval under the availability gate.
//!
//! Two strategies:
//! - metadata: gate, optional topic filter, `top_k` limit, occasional off-topic noise;
//! - vector: cosine ranking of embedded fragments against an embedded query, no noise.
//!   Any failure on this path falls back to the metadata strategy.

use super::Candidate;
use crate::error::PipelineError;
use crate::knowledge::{Availability, EmbeddingProvider, FragmentStore, KnowledgeFragment};
use crate::shared::{Intent, SessionState};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_NOISE_PROBABILITY: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct RetrievalQuery<'a> {
    pub case_id: &'a str,
    pub intent: Intent,
    pub topics: &'a [String],
    pub state: &'a SessionState,
    pub top_k: usize,
}

pub struct Retriever {
    store: Arc<dyn FragmentStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    noise_probability: f64,
}

impl Retriever {
    pub fn new(store: Arc<dyn FragmentStore>) -> Self {
        Self {
            store,
            embedder: None,
            noise_probability: DEFAULT_NOISE_PROBABILITY,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_noise_probability(mut self, probability: f64) -> Self {
        self.noise_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Returns at most `top_k` candidates. A malformed case id is `BadInput`; an unknown
    /// case or a storage failure on the metadata path is an empty list.
    pub async fn retrieve<R: Rng>(
        &self,
        query: &RetrievalQuery<'_>,
        use_vector: bool,
        rng: &mut R,
    ) -> Result<Vec<Candidate>, PipelineError> {
        let case_id = PipelineError::parse_id("case_id", query.case_id)?;

        if use_vector {
            match self.by_vector(&case_id, query).await {
                Ok(candidates) => {
                    tracing::debug!(
                        target: "psim::retrieve",
                        case_id = %case_id,
                        strategy = "vector",
                        count = candidates.len(),
                        "Fragments retrieved"
                    );
                    return Ok(candidates);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "psim::retrieve",
                        case_id = %case_id,
                        error = %err,
                        "Vector retrieval failed; falling back to metadata strategy"
                    );
                }
            }
        }

        let candidates = match self.by_metadata(&case_id, query, rng).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(
                    target: "psim::retrieve",
                    case_id = %case_id,
                    error = %err,
                    "Metadata retrieval failed; returning no fragments"
                );
                Vec::new()
            }
        };
        tracing::debug!(
            target: "psim::retrieve",
            case_id = %case_id,
            strategy = "metadata",
            count = candidates.len(),
            "Fragments retrieved"
        );
        Ok(candidates)
    }

    async fn by_metadata<R: Rng>(
        &self,
        case_id: &Uuid,
        query: &RetrievalQuery<'_>,
        rng: &mut R,
    ) -> Result<Vec<Candidate>, PipelineError> {
        if query.top_k == 0 || !self.store.case_exists(case_id).await? {
            return Ok(Vec::new());
        }
        let fragments = self.store.get_fragments(case_id).await?;
        let trust = query.state.trust;
        let topics = query.topics;

        let selected: Vec<&KnowledgeFragment> = fragments
            .iter()
            .filter(|f| f.visible_at(trust))
            .filter(|f| topics.is_empty() || f.topic().is_some_and(|t| topics.iter().any(|q| q == t)))
            .take(query.top_k)
            .collect();

        let mut candidates: Vec<Candidate> = selected.iter().map(|f| Candidate::from(*f)).collect();

        let roll: f64 = rng.gen();
        if roll < self.noise_probability && !candidates.is_empty() && candidates.len() < query.top_k {
            let pool: Vec<&KnowledgeFragment> = fragments
                .iter()
                .filter(|f| f.availability == Availability::Public)
                .filter(|f| !selected.iter().any(|s| s.id == f.id))
                .filter(|f| topics.is_empty() || f.topic().is_some_and(|t| !topics.iter().any(|q| q == t)))
                .collect();
            if let Some(noise) = pool.choose(rng) {
                tracing::debug!(target: "psim::retrieve", fragment_id = %noise.id, "Noise fragment appended");
                candidates.push(Candidate::from(*noise));
            }
        }

        Ok(candidates)
    }

    async fn by_vector(&self, case_id: &Uuid, query: &RetrievalQuery<'_>) -> Result<Vec<Candidate>, PipelineError> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| PipelineError::Upstream("no embedding provider configured".into()))?;
        if query.top_k == 0 || !self.store.case_exists(case_id).await? {
            return Ok(Vec::new());
        }

        let text = query_text(query);
        let query_vector = embedder.embed(&text).await?;
        let fragments = self.store.get_fragments(case_id).await?;

        let mut scored: Vec<(f64, &KnowledgeFragment)> = fragments
            .iter()
            .filter(|f| f.visible_at(query.state.trust))
            .filter_map(|f| {
                let embedding = f.embedding.as_ref()?;
                (embedding.len() == query_vector.len()).then(|| (cosine_similarity(&query_vector, embedding), f))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(query.top_k)
            .map(|(_, f)| Candidate::from(f))
            .collect())
    }
}

/// `intent + topics + last_turn_summary`, space-joined.
fn query_text(query: &RetrievalQuery<'_>) -> String {
    let mut parts = vec![query.intent.as_str().to_string()];
    parts.extend(query.topics.iter().cloned());
    if !query.state.last_turn_summary.is_empty() {
        parts.push(query.state.last_turn_summary.clone());
    }
    parts.join(" ")
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{CaseTruth, MemoryStore, NewFragment};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn dimensions(&self) -> usize {
            self.0.len()
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, PipelineError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, PipelineError> {
            Err(PipelineError::Upstream("embedding endpoint down".into()))
        }
    }

    fn state(trust: f64) -> SessionState {
        SessionState::default().with_trust(trust)
    }

    fn query<'a>(case_id: &'a str, topics: &'a [String], state: &'a SessionState, top_k: usize) -> RetrievalQuery<'a> {
        RetrievalQuery {
            case_id,
            intent: Intent::Clarify,
            topics,
            state,
            top_k,
        }
    }

    fn seeded() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[tokio::test]
    async fn gated_fragment_requires_its_trust_threshold() {
        let store = Arc::new(MemoryStore::new());
        let case_id = store.create_case(CaseTruth::default(), json!({}));
        let gated = store
            .insert_fragment(&case_id, NewFragment::new("fact", "gated", Availability::Gated).trust_ge(0.6))
            .unwrap();
        let retriever = Retriever::new(store.clone()).with_noise_probability(0.0);
        let id = case_id.to_string();

        let low = state(0.5);
        let found = retriever.retrieve(&query(&id, &[], &low, 3), false, &mut seeded()).await.unwrap();
        assert!(found.iter().all(|c| c.id != gated.to_string()));

        let high = state(0.6);
        let found = retriever.retrieve(&query(&id, &[], &high, 3), false, &mut seeded()).await.unwrap();
        assert!(found.iter().any(|c| c.id == gated.to_string()));
    }

    #[tokio::test]
    async fn textual_threshold_gates_like_a_number() {
        let store = Arc::new(MemoryStore::new());
        let case_id = store.create_case(CaseTruth::default(), json!({}));
        let mut fragment = NewFragment::new("fact", "gated", Availability::Gated);
        fragment
            .metadata
            .insert("disclosure_requirements".into(), json!({"trust_ge": "0.9"}));
        let gated = store.insert_fragment(&case_id, fragment).unwrap();
        let mut garbled = NewFragment::new("fact", "garbled", Availability::Gated);
        garbled
            .metadata
            .insert("disclosure_requirements".into(), json!({"trust_ge": "high"}));
        store.insert_fragment(&case_id, garbled).unwrap();
        let retriever = Retriever::new(store.clone()).with_noise_probability(0.0);
        let id = case_id.to_string();

        let low = state(0.1);
        let found = retriever.retrieve(&query(&id, &[], &low, 3), false, &mut seeded()).await.unwrap();
        assert!(found.is_empty());

        let high = state(0.95);
        let found = retriever.retrieve(&query(&id, &[], &high, 3), false, &mut seeded()).await.unwrap();
        let ids: Vec<String> = found.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![gated.to_string()]);
    }

    #[tokio::test]
    async fn hidden_fragments_never_returned() {
        let store = Arc::new(MemoryStore::new());
        let case_id = store.create_case(CaseTruth::default(), json!({}));
        store
            .insert_fragment(&case_id, NewFragment::new("fact", "hidden", Availability::Hidden).topic("sleep"))
            .unwrap();
        let retriever = Retriever::new(store.clone()).with_noise_probability(1.0);
        let id = case_id.to_string();
        let topics = vec!["sleep".to_string()];
        for trust in [0.0, 0.5, 1.0] {
            let s = state(trust);
            let found = retriever.retrieve(&query(&id, &topics, &s, 3), false, &mut seeded()).await.unwrap();
            assert!(found.is_empty());
        }
    }

    #[tokio::test]
    async fn topic_filter_and_noise_are_deterministic_under_seed() {
        let store = Arc::new(MemoryStore::new());
        let case_id = store.create_case(CaseTruth::default(), json!({}));
        let sleep = store
            .insert_fragment(&case_id, NewFragment::new("fact", "плохо сплю", Availability::Public).topic("sleep"))
            .unwrap();
        let work = store
            .insert_fragment(&case_id, NewFragment::new("fact", "устал на работе", Availability::Public).topic("work"))
            .unwrap();
        let id = case_id.to_string();
        let topics = vec!["sleep".to_string()];
        let s = state(0.3);

        let quiet = Retriever::new(store.clone()).with_noise_probability(0.0);
        let found = quiet.retrieve(&query(&id, &topics, &s, 3), false, &mut seeded()).await.unwrap();
        assert_eq!(found.iter().map(|c| c.id.clone()).collect::<Vec<_>>(), vec![sleep.to_string()]);

        let noisy = Retriever::new(store.clone()).with_noise_probability(1.0);
        let found = noisy.retrieve(&query(&id, &topics, &s, 3), false, &mut seeded()).await.unwrap();
        assert_eq!(
            found.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
            vec![sleep.to_string(), work.to_string()]
        );

        // Already at top_k: no room for noise.
        let found = noisy.retrieve(&query(&id, &topics, &s, 1), false, &mut seeded()).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn unknown_case_is_empty_and_malformed_id_is_bad_input() {
        let store = Arc::new(MemoryStore::new());
        let retriever = Retriever::new(store);
        let s = state(0.5);
        let missing = Uuid::new_v4().to_string();
        let found = retriever.retrieve(&query(&missing, &[], &s, 3), false, &mut seeded()).await.unwrap();
        assert!(found.is_empty());

        let err = retriever
            .retrieve(&query("case-17", &[], &s, 3), false, &mut seeded())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BadInput(_)));
    }

    #[tokio::test]
    async fn vector_mode_ranks_by_similarity_under_the_gate() {
        let store = Arc::new(MemoryStore::new());
        let case_id = store.create_case(CaseTruth::default(), json!({}));
        let near = store
            .insert_fragment(&case_id, NewFragment::new("fact", "near", Availability::Public))
            .unwrap();
        let far = store
            .insert_fragment(&case_id, NewFragment::new("fact", "far", Availability::Public))
            .unwrap();
        let locked = store
            .insert_fragment(&case_id, NewFragment::new("fact", "locked", Availability::Gated).trust_ge(0.9))
            .unwrap();
        store.insert_fragment(&case_id, NewFragment::new("fact", "unembedded", Availability::Public)).unwrap();
        store
            .set_embeddings(&case_id, &[(near, vec![1.0, 0.1]), (far, vec![0.0, 1.0]), (locked, vec![1.0, 0.0])])
            .await
            .unwrap();

        let retriever = Retriever::new(store.clone()).with_embedder(Arc::new(FixedEmbedder(vec![1.0, 0.0])));
        let id = case_id.to_string();
        let s = state(0.3);
        let found = retriever.retrieve(&query(&id, &[], &s, 3), true, &mut seeded()).await.unwrap();
        assert_eq!(
            found.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
            vec![near.to_string(), far.to_string()]
        );
    }

    #[tokio::test]
    async fn vector_failure_falls_back_to_metadata() {
        let store = Arc::new(MemoryStore::new());
        let case_id = store.create_case(CaseTruth::default(), json!({}));
        let only = store
            .insert_fragment(&case_id, NewFragment::new("fact", "text", Availability::Public))
            .unwrap();
        let retriever = Retriever::new(store.clone())
            .with_embedder(Arc::new(BrokenEmbedder))
            .with_noise_probability(0.0);
        let id = case_id.to_string();
        let s = state(0.3);
        let found = retriever.retrieve(&query(&id, &[], &s, 3), true, &mut seeded()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, only.to_string());
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-9);
    }
}
