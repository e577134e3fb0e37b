//! Turn pipeline: normalize → retrieve → reason → guard → reply, then telemetry and
//! trajectory bookkeeping.

mod control;
mod normalizer;
mod reason;
mod retrieve;
mod safety;

pub use control::{ControlMessage, ControlReceiver, RuntimeControl, RuntimeFlags};
pub use normalizer::{normalize, Normalized, SUICIDE_IDEATION};
pub use reason::StubReasoner;
pub use retrieve::{RetrievalQuery, Retriever, DEFAULT_NOISE_PROBABILITY};
pub use safety::{guard, GuardOutcome, RISK_PROTOCOL_MESSAGE};

use crate::error::PipelineError;
use crate::eval::TrajectoryTracker;
use crate::knowledge::{
    CaseStore, CaseTruth, EmbeddingProvider, FragmentStore, KnowledgeFragment, Policies, TelemetrySink,
    TrajectoryStore, TurnTelemetryDraft,
};
use crate::shared::{SessionState, StateUpdates, StyleDirectives, TurnRequest, TurnResponse};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

/// Retrieved fragment as seen by the reasoners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl From<&KnowledgeFragment> for Candidate {
    fn from(fragment: &KnowledgeFragment) -> Self {
        Self {
            id: fragment.id.to_string(),
            kind: fragment.kind.clone(),
            text: fragment.text.clone(),
            metadata: fragment.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReasonInput {
    pub case_truth: CaseTruth,
    pub session_state: SessionState,
    pub candidates: Vec<Candidate>,
    pub policies: Policies,
}

/// What the patient should say this turn and how the session state moves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasonOutput {
    pub content_plan: Vec<String>,
    /// Reserved; always empty.
    pub distortions_plan: Vec<Value>,
    pub style_directives: StyleDirectives,
    pub state_updates: StateUpdates,
    pub telemetry: Map<String, Value>,
}

/// Reasoning strategy. Implementations should absorb their own upstream failures; an `Err`
/// makes the pipeline fall back to [`StubReasoner`].
#[async_trait::async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &str;

    async fn reason(&self, input: &ReasonInput) -> Result<ReasonOutput, PipelineError>;
}

/// Reply text synthesis from a guarded plan. An `Err` falls back to the plain plan format.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        content_plan: &[String],
        style: &StyleDirectives,
        patient_context: Option<&str>,
    ) -> Result<String, PipelineError>;
}

pub struct TurnPipeline {
    cases: Arc<dyn CaseStore>,
    telemetry: Arc<dyn TelemetrySink>,
    retriever: Retriever,
    stub: StubReasoner,
    llm_reasoner: Option<Arc<dyn Reasoner>>,
    generator: Option<Arc<dyn Generator>>,
    tracker: TrajectoryTracker,
    rng: Mutex<StdRng>,
}

impl TurnPipeline {
    /// Pipeline over a single store that implements every collaborator trait.
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: FragmentStore + CaseStore + TrajectoryStore + TelemetrySink + 'static,
    {
        Self::from_parts(store.clone(), store.clone(), store.clone(), store)
    }

    pub fn from_parts(
        fragments: Arc<dyn FragmentStore>,
        cases: Arc<dyn CaseStore>,
        trajectories: Arc<dyn TrajectoryStore>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            cases,
            telemetry,
            retriever: Retriever::new(Arc::clone(&fragments)),
            stub: StubReasoner::new(),
            llm_reasoner: None,
            generator: None,
            tracker: TrajectoryTracker::new(trajectories, fragments),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.retriever = self.retriever.with_embedder(embedder);
        self
    }

    pub fn with_noise_probability(mut self, probability: f64) -> Self {
        self.retriever = self.retriever.with_noise_probability(probability);
        self
    }

    /// Fixes the retrieval noise source (tests, replays).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_llm_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.llm_reasoner = Some(reasoner);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn tracker(&self) -> &TrajectoryTracker {
        &self.tracker
    }

    /// Runs one turn. Never fails: any error becomes [`TurnResponse::safe_fallback`].
    pub async fn run_turn(&self, request: &TurnRequest, flags: &RuntimeFlags) -> TurnResponse {
        match self.process(request, flags).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(
                    target: "psim::pipeline",
                    case_id = %request.case_id,
                    session_id = %request.session_id,
                    error = %err,
                    "Turn failed; returning safe fallback"
                );
                TurnResponse::safe_fallback()
            }
        }
    }

    async fn process(&self, request: &TurnRequest, flags: &RuntimeFlags) -> Result<TurnResponse, PipelineError> {
        let case_id = PipelineError::parse_id("case_id", &request.case_id)?;
        let session_id = PipelineError::parse_id("session_id", &request.session_id)?;
        let state = &request.session_state;

        let policies = self.cases.get_policies(&case_id).await?;
        let case_truth = self.cases.get_case_truth(&case_id).await?;

        let normalized = normalize(&request.therapist_utterance, state, &policies.risk_protocol.trigger_keywords);

        let mut rng = StdRng::seed_from_u64(self.next_seed());
        let query = RetrievalQuery {
            case_id: &request.case_id,
            intent: normalized.intent,
            topics: &normalized.topics,
            state,
            top_k: flags.rag_top_k,
        };
        let candidates = self.retriever.retrieve(&query, flags.rag_use_vector, &mut rng).await?;

        let input = ReasonInput {
            case_truth,
            session_state: state.clone(),
            candidates,
            policies,
        };
        let reasoned = self.reason(&input, flags).await;
        let outcome = guard(Some(&reasoned), &input.policies, &normalized.risk_flags);
        let plan = &outcome.safe_output;

        let patient_reply = self.reply(plan, &normalized, outcome.risk_status.as_str(), flags).await;

        let deltas = plan.state_updates.clamped();
        let mut state_updates = Map::new();
        state_updates.insert("trust_delta".into(), json!(deltas.trust_delta));
        state_updates.insert("fatigue_delta".into(), json!(deltas.fatigue_delta));
        state_updates.insert("last_turn_summary".into(), json!(normalized.last_turn_summary));

        let used_fragments: Vec<String> = input.candidates.iter().map(|c| c.id.clone()).collect();

        let mut eval_markers = Map::new();
        eval_markers.insert("intent".into(), json!(normalized.intent.as_str()));
        eval_markers.insert("topics".into(), json!(normalized.topics));

        let turn_no = self
            .telemetry
            .append(
                &session_id,
                TurnTelemetryDraft {
                    used_fragments: used_fragments.clone(),
                    risk_status: outcome.risk_status,
                    eval_markers: eval_markers.clone(),
                },
            )
            .await?;

        self.tracker
            .record(&session_id, &case_id, &input.case_truth.trajectories, state.trust, &used_fragments)
            .await;

        tracing::info!(
            target: "psim::pipeline",
            case_id = %case_id,
            session_id = %session_id,
            turn_no,
            intent = %normalized.intent,
            risk_status = %outcome.risk_status,
            fragments = used_fragments.len(),
            "Turn processed"
        );

        Ok(TurnResponse {
            patient_reply,
            state_updates,
            used_fragments,
            risk_status: outcome.risk_status,
            eval_markers,
        })
    }

    async fn reason(&self, input: &ReasonInput, flags: &RuntimeFlags) -> ReasonOutput {
        if flags.use_llm_reason {
            match &self.llm_reasoner {
                Some(llm) => match llm.reason(input).await {
                    Ok(output) => return output,
                    Err(err) => {
                        tracing::warn!(
                            target: "psim::reason",
                            reasoner = llm.name(),
                            error = %err,
                            "LLM reasoner failed; using stub"
                        );
                    }
                },
                None => {
                    tracing::debug!(target: "psim::reason", "LLM reasoning enabled but no reasoner configured");
                }
            }
        }
        self.stub.plan(&input.candidates, &input.policies)
    }

    async fn reply(&self, plan: &ReasonOutput, normalized: &Normalized, risk: &str, flags: &RuntimeFlags) -> String {
        if flags.use_llm_gen {
            if let Some(generator) = &self.generator {
                match generator.generate(&plan.content_plan, &plan.style_directives, None).await {
                    Ok(text) => return text,
                    Err(err) => {
                        tracing::warn!(target: "psim::generate", error = %err, "Generator failed; using plan format");
                    }
                }
            }
        }
        format!("Plan:{} intent={} risk={}", plan.content_plan.len(), normalized.intent, risk)
    }

    fn next_seed(&self) -> u64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen(),
            Err(poisoned) => poisoned.into_inner().gen(),
        }
    }
}
