//! psim-core: patient simulator core (case types, fragment stores, turn pipeline, evaluation).
//!
//! Network-backed capabilities (LLM reasoning/generation, HTTP embeddings) live in
//! `psim-skills` and plug into the pipeline through the [`Reasoner`], [`Generator`]
//! and [`EmbeddingProvider`] traits defined here.

mod error;
mod eval;
mod knowledge;
mod orchestrator;
mod shared;

pub use error::{PipelineError, StoreError};

pub use shared::{
    CoreConfig, EmbeddingSettings, Intent, LlmSettings, RiskStatus, SessionState, StateUpdates,
    StyleDirectives, TurnRequest, TurnResponse, SAFE_FALLBACK_REPLY,
};

pub use knowledge::{
    Availability, CaseStore, CaseTruth, DisclosureRules, DistortionRules, EmbeddingProvider,
    FragmentStore, KnowledgeFragment, KnowledgeStore, MemoryStore, NewFragment, Policies,
    RiskProtocol, SessionLink, StyleProfile, TelemetrySink, Trajectory, TrajectoryStep,
    TrajectoryStore, TrustRequirement, TurnTelemetry, TurnTelemetryDraft,
};

pub use eval::{
    CaseTrajectoryReport, Evaluator, MissedKeys, QuestionQuality, SessionMetrics, SessionReport,
    TrajectoryAggregate, TrajectoryProgress, TrajectoryTracker,
};

pub use orchestrator::{
    guard, normalize, Candidate, ControlMessage, ControlReceiver, GuardOutcome, Generator,
    Normalized, ReasonInput, ReasonOutput, Reasoner, RetrievalQuery, Retriever, RuntimeControl,
    RuntimeFlags, StubReasoner, TurnPipeline, DEFAULT_NOISE_PROBABILITY, RISK_PROTOCOL_MESSAGE,
    SUICIDE_IDEATION,
};
