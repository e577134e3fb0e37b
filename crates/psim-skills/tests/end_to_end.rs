//! Full turns through the pipeline with in-memory storage and scripted model replies.

use async_trait::async_trait;
use psim_core::{
    Availability, Candidate, CaseTruth, Evaluator, Generator, Intent, MemoryStore, NewFragment, PipelineError,
    Policies, ReasonInput, Reasoner, RiskStatus, RuntimeFlags, SessionLink, SessionState, StubReasoner,
    StyleDirectives, Trajectory, TrajectoryStep, TrajectoryStore, TurnPipeline, TurnRequest,
    RISK_PROTOCOL_MESSAGE,
};
use psim_skills::llm::{parse_llm_json, validate_reason_payload, CONFUSED_SENTENCE};
use psim_skills::{ChatClient, ChatMessage, ChatParams, ChatResponse, LlmError, LlmReasoner};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Answers every request with the same text.
struct ScriptedClient {
    reply: String,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn chat(&self, _model: &str, _messages: &[ChatMessage], _params: &ChatParams) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse::from_text(&self.reply))
    }
}

struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(
        &self,
        content_plan: &[String],
        _style: &StyleDirectives,
        _patient_context: Option<&str>,
    ) -> Result<String, PipelineError> {
        Ok(content_plan.join(" | "))
    }
}

fn request(utterance: &str, case_id: &Uuid, session_id: &Uuid, trust: f64) -> TurnRequest {
    TurnRequest {
        therapist_utterance: utterance.to_string(),
        session_state: SessionState::default().with_trust(trust),
        case_id: case_id.to_string(),
        session_id: session_id.to_string(),
        options: None,
    }
}

fn candidate(id: &str, text: &str) -> Candidate {
    Candidate {
        id: id.to_string(),
        kind: "fact".to_string(),
        text: text.to_string(),
        metadata: Default::default(),
    }
}

fn sleep_case(store: &MemoryStore) -> Uuid {
    let case_id = store.create_case(CaseTruth::default(), json!({}));
    store
        .insert_fragment(
            &case_id,
            NewFragment::new("fact", "Засыпаю только под утро", Availability::Public)
                .topic("sleep")
                .tags(&["sleep"]),
        )
        .unwrap();
    case_id
}

#[tokio::test]
async fn sleep_question_retrieves_sleep_fragment() {
    let store = Arc::new(MemoryStore::new());
    let case_id = sleep_case(&store);
    let pipeline = TurnPipeline::new(Arc::clone(&store)).with_noise_probability(0.0);

    let response = pipeline
        .run_turn(
            &request("Как вы спите последние недели?", &case_id, &Uuid::new_v4(), 0.3),
            &RuntimeFlags::default(),
        )
        .await;

    assert!(!response.is_safe_fallback());
    assert_eq!(response.eval_markers["intent"], json!(Intent::Clarify.as_str()));
    assert_eq!(response.eval_markers["topics"], json!(["sleep"]));
    assert_eq!(response.risk_status, RiskStatus::None);
    assert_eq!(response.used_fragments.len(), 1);
    assert_eq!(response.patient_reply, "Plan:1 intent=clarify risk=none");
}

#[tokio::test]
async fn suicide_question_replaces_plan_with_protocol() {
    let store = Arc::new(MemoryStore::new());
    let case_id = sleep_case(&store);
    let pipeline = TurnPipeline::new(Arc::clone(&store))
        .with_noise_probability(0.0)
        .with_generator(Arc::new(EchoGenerator));
    let flags = RuntimeFlags {
        use_llm_gen: true,
        ..RuntimeFlags::default()
    };

    let response = pipeline
        .run_turn(&request("Бывают ли мысли о суициде?", &case_id, &Uuid::new_v4(), 0.5), &flags)
        .await;

    assert_eq!(response.eval_markers["intent"], json!("risk_check"));
    assert_eq!(response.risk_status, RiskStatus::Acute);
    assert_eq!(response.patient_reply, RISK_PROTOCOL_MESSAGE);
}

#[test]
fn stub_plan_takes_first_two_candidates() {
    let candidates = [
        candidate("a", "T1"),
        candidate("b", "T2"),
        candidate("c", "T3"),
    ];
    let plan = StubReasoner::new().plan(&candidates, &Policies::default());
    assert_eq!(plan.content_plan, vec!["T1".to_string(), "T2".to_string()]);
    assert_eq!(plan.state_updates.trust_delta, 0.02);
    assert_eq!(plan.telemetry["chosen_ids"], json!(["a", "b"]));
}

#[tokio::test]
async fn prose_reply_from_model_uses_confused_plan() {
    let client = ScriptedClient::new("Sorry, I cannot produce JSON today.");
    let reasoner = LlmReasoner::new(client.clone(), "deepseek-reasoner", "prompt");
    let input = ReasonInput {
        case_truth: CaseTruth::default(),
        session_state: SessionState::default(),
        candidates: vec![candidate("a", "T1")],
        policies: Policies::default(),
    };

    let output = reasoner.reason(&input).await.unwrap();
    assert_eq!(output.content_plan, vec![CONFUSED_SENTENCE.to_string()]);
    assert_eq!(output.telemetry["llm_parse_error"], json!(true));
    assert_eq!(output.state_updates.trust_delta, -0.1);

    let store = Arc::new(MemoryStore::new());
    let case_id = sleep_case(&store);
    let pipeline = TurnPipeline::new(Arc::clone(&store))
        .with_noise_probability(0.0)
        .with_llm_reasoner(Arc::new(reasoner));
    let flags = RuntimeFlags {
        use_llm_reason: true,
        ..RuntimeFlags::default()
    };
    let response = pipeline
        .run_turn(&request("Как вы спите?", &case_id, &Uuid::new_v4(), 0.3), &flags)
        .await;

    assert!(!response.is_safe_fallback());
    assert_eq!(response.deltas().trust_delta, -0.1);
    assert_eq!(response.patient_reply, "Plan:1 intent=clarify risk=none");
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn model_json_in_fence_drives_the_plan() {
    let client = ScriptedClient::new(
        "Here you go:\n```json\n{\"content_plan\": [\"Сплю плохо\"], \
         \"style_directives\": {\"tempo\": \"slow\", \"length\": \"short\"}, \
         \"state_updates\": {\"trust_delta\": 0.5, \"fatigue_delta\": 0.1}, \
         \"telemetry\": {\"chosen_ids\": [\"ghost\"]}}\n```",
    );
    let store = Arc::new(MemoryStore::new());
    let case_id = sleep_case(&store);
    let pipeline = TurnPipeline::new(Arc::clone(&store))
        .with_noise_probability(0.0)
        .with_llm_reasoner(Arc::new(LlmReasoner::new(client, "deepseek-reasoner", "prompt")))
        .with_generator(Arc::new(EchoGenerator));
    let flags = RuntimeFlags {
        use_llm_reason: true,
        use_llm_gen: true,
        ..RuntimeFlags::default()
    };

    let response = pipeline
        .run_turn(&request("Как вы спите?", &case_id, &Uuid::new_v4(), 0.3), &flags)
        .await;

    assert_eq!(response.patient_reply, "Сплю плохо");
    let deltas = response.deltas();
    assert_eq!(deltas.trust_delta, 0.2);
    assert_eq!(deltas.fatigue_delta, 0.1);
}

#[tokio::test]
async fn trajectory_coverage_spans_linked_sessions() {
    let store = Arc::new(MemoryStore::new());
    let truth = CaseTruth {
        trajectories: vec![Trajectory {
            id: "t1".into(),
            name: "Sleep and mood".into(),
            steps: vec![
                TrajectoryStep::new("sleep", &["sleep"], 0.3),
                TrajectoryStep::new("mood", &["mood"], 0.5),
            ],
        }],
        ..CaseTruth::default()
    };
    let case_id = store.create_case(truth, json!({}));
    store
        .insert_fragment(
            &case_id,
            NewFragment::new("fact", "Сплю по четыре часа", Availability::Public)
                .topic("sleep")
                .tags(&["sleep"]),
        )
        .unwrap();
    store
        .insert_fragment(
            &case_id,
            NewFragment::new("fact", "Настроение на нуле", Availability::Public)
                .topic("mood")
                .tags(&["mood"]),
        )
        .unwrap();

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    store
        .link_session(SessionLink {
            session_id: first,
            case_id,
            prev_session_id: None,
        })
        .await
        .unwrap();
    store
        .link_session(SessionLink {
            session_id: second,
            case_id,
            prev_session_id: Some(first),
        })
        .await
        .unwrap();

    let pipeline = TurnPipeline::new(Arc::clone(&store)).with_noise_probability(0.0);
    let flags = RuntimeFlags::default();
    pipeline
        .run_turn(&request("Как вы спите?", &case_id, &first, 0.4), &flags)
        .await;
    pipeline
        .run_turn(&request("Как ваше настроение?", &case_id, &second, 0.6), &flags)
        .await;

    let evaluator = Evaluator::new(Arc::clone(&store));
    let first_report = evaluator.session_report(&first.to_string(), &case_id.to_string()).await.unwrap();
    assert_eq!(first_report.metrics.trajectory_progress[0].completed_steps, vec!["sleep".to_string()]);

    let report = evaluator.case_trajectories(&case_id.to_string()).await.unwrap();
    assert_eq!(report.sessions, vec![first.to_string(), second.to_string()]);
    let aggregate = &report.trajectories[0];
    assert_eq!(aggregate.completed_steps_union, vec!["sleep".to_string(), "mood".to_string()]);
    assert_eq!(aggregate.coverage, 1.0);
}

#[test]
fn parser_prefers_fenced_object_and_tolerates_trailing_commas() {
    let parsed = parse_llm_json("noise {\"a\": 1} then ```json\n{\"b\": 2}\n```").unwrap();
    assert_eq!(parsed.get("b"), Some(&json!(2)));
    assert!(parsed.get("a").is_none());

    let parsed = parse_llm_json("{\"b\": [1, 2,],}").unwrap();
    assert_eq!(parsed.get("b"), Some(&json!([1, 2])));

    assert!(parse_llm_json("no braces at all").is_err());
    assert!(parse_llm_json("[1, 2, 3]").is_err());
}

#[test]
fn validator_output_always_fits_the_contract() {
    let candidates = [candidate("a", "T1"), candidate("b", "T2")];
    let payloads = [
        json!({}),
        json!({"content_plan": "oops", "style_directives": [], "state_updates": {"trust_delta": "NaN"}}),
        json!({
            "content_plan": ["  ", "x", "y", "z"],
            "style_directives": {"tempo": "calm", "length": "epic"},
            "state_updates": {"trust_delta": -3, "fatigue_delta": 9},
            "telemetry": {"chosen_ids": ["b", "b", "zzz"]}
        }),
    ];

    for payload in payloads {
        let (out, _warnings) = validate_reason_payload(&payload, &candidates);
        let plan = out["content_plan"].as_array().unwrap();
        assert!(!plan.is_empty() && plan.len() <= 2);

        let tempo = out["style_directives"]["tempo"].as_str().unwrap();
        assert!(["slow", "medium", "fast"].contains(&tempo));
        let length = out["style_directives"]["length"].as_str().unwrap();
        assert!(["short", "medium", "long"].contains(&length));

        let trust = out["state_updates"]["trust_delta"].as_f64().unwrap();
        let fatigue = out["state_updates"]["fatigue_delta"].as_f64().unwrap();
        assert!((-0.2..=0.2).contains(&trust));
        assert!((0.0..=0.2).contains(&fatigue));

        let ids: Vec<&str> = out["telemetry"]["chosen_ids"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(ids.iter().all(|id| ["a", "b"].contains(id)));
    }
}
