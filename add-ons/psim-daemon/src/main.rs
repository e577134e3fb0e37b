//! psim-daemon: command-line host for the patient simulator. Config-driven via CoreConfig.
//!
//! ```text
//! psim-daemon verify
//! psim-daemon load-case --file case.json
//! psim-daemon link --case-id <uuid> --session-id <uuid> [--prev-session-id <uuid>]
//! psim-daemon turn                 # JSON lines on stdin: turn requests or control messages
//! psim-daemon embed --case-id <uuid> [--batch 128]
//! psim-daemon report [--case-id <uuid>] [--session-id <uuid>]
//! ```

mod case_file;

use case_file::CaseFile;
use clap::{Parser, Subcommand};
use psim_core::{
    ControlMessage, CoreConfig, Evaluator, KnowledgeStore, RuntimeControl, SessionLink, TrajectoryStore, TurnPipeline,
    TurnRequest,
};
use psim_skills::{backfill_embeddings, embedder_from_settings, ChatClient, LlmGenerator, LlmReasoner, ModelRouter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const STORE_DIR: &str = "psim_knowledge";

#[derive(Parser)]
#[command(name = "psim-daemon", version, about = "Command-line host for the patient simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the store opens and prompt files are present
    Verify,
    /// Load a case file into the knowledge store and print its id
    LoadCase {
        #[arg(long)]
        file: PathBuf,
    },
    /// Link a session to a case, optionally after a previous session
    Link {
        #[arg(long)]
        case_id: Uuid,
        #[arg(long)]
        session_id: Uuid,
        #[arg(long)]
        prev_session_id: Option<Uuid>,
    },
    /// Run turns from JSON lines on stdin
    Turn,
    /// Backfill embeddings for a case
    Embed {
        #[arg(long)]
        case_id: Uuid,
        /// Defaults to embedding.batch_size
        #[arg(long)]
        batch: Option<usize>,
    },
    /// Print a session report, or all trajectories of a case
    Report {
        /// Optional when --session-id is linked to exactly one case
        #[arg(long)]
        case_id: Option<Uuid>,
        #[arg(long)]
        session_id: Option<Uuid>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Verify => "verify",
            Commands::LoadCase { .. } => "load-case",
            Commands::Link { .. } => "link",
            Commands::Turn => "turn",
            Commands::Embed { .. } => "embed",
            Commands::Report { .. } => "report",
        }
    }
}

fn store_path(config: &CoreConfig) -> PathBuf {
    Path::new(&config.storage_path).join(STORE_DIR)
}

fn open_store(config: &CoreConfig) -> Result<Arc<KnowledgeStore>, String> {
    let path = store_path(config);
    KnowledgeStore::open_path(&path)
        .map(Arc::new)
        .map_err(|e| format!("{} LOCKED or inaccessible: {}", path.display(), e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("encode failed: {}", e))?;
    println!("{}", text);
    Ok(())
}

/// Pre-flight check: store opens, trees are readable, prompt files are present.
fn run_verify(config: &CoreConfig) -> Result<(), String> {
    print!("Checking {}... ", store_path(config).display());
    let store = open_store(config)?;
    let counts = store.tree_counts().map_err(|e| format!("tree scan failed: {}", e))?;
    println!("OK");
    for (tree, len) in counts {
        println!("  {:<22} {}", tree, len);
    }

    let prompts = Path::new(&config.prompts_dir);
    for file in ["reasoning.prompt.txt", "generation.prompt.txt"] {
        let present = prompts.join(file).is_file();
        println!("Prompt {}: {}", file, if present { "found" } else { "missing (built-in fallback)" });
    }
    if config.use_llm_reason || config.use_llm_gen {
        let router = ModelRouter::from_settings(&config.llm).map_err(|e| format!("LLM client: {}", e))?;
        if !router.has_api_key() {
            println!("Warning: LLM stages enabled but llm.api_key is not set");
        }
    }
    println!("\nAll checks passed.");
    Ok(())
}

fn run_load_case(config: &CoreConfig, file: &Path) -> Result<(), String> {
    let store = open_store(config)?;
    let (case_id, summary) = CaseFile::read(file)?.load_into(&store)?;
    store.flush().map_err(|e| format!("flush failed: {}", e))?;
    println!("{}", case_id);
    eprintln!("fragments inserted: {}, skipped: {}", summary.inserted, summary.skipped);
    Ok(())
}

async fn run_link(config: &CoreConfig, link: SessionLink) -> Result<(), String> {
    let store = open_store(config)?;
    let chain = store.link_session(link).await.map_err(|e| format!("link failed: {}", e))?;
    store.flush().map_err(|e| format!("flush failed: {}", e))?;
    print_json(&chain.iter().map(Uuid::to_string).collect::<Vec<_>>())
}

fn build_pipeline(config: &CoreConfig, store: Arc<KnowledgeStore>) -> Result<TurnPipeline, String> {
    let embedder = embedder_from_settings(config).map_err(|e| e.to_string())?;
    let router: Arc<dyn ChatClient> =
        Arc::new(ModelRouter::from_settings(&config.llm).map_err(|e| format!("LLM client: {}", e))?);
    Ok(TurnPipeline::new(store)
        .with_noise_probability(config.noise_probability)
        .with_embedder(embedder)
        .with_llm_reasoner(Arc::new(LlmReasoner::from_config(config, Arc::clone(&router))))
        .with_generator(Arc::new(LlmGenerator::from_config(config, router))))
}

/// Reads JSON lines from stdin. Objects with a `type` field are control messages that
/// change the flags used by later turns; everything else is a turn request whose
/// response is written to stdout as one JSON line.
async fn run_turns(config: &CoreConfig) -> Result<(), String> {
    let store = open_store(config)?;
    let pipeline = build_pipeline(config, Arc::clone(&store))?;
    let control = RuntimeControl::from_config(config);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(|e| format!("stdin: {}", e))? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "psim::pipeline", error = %e, "Skipping malformed input line");
                continue;
            }
        };
        if value.get("type").is_some() {
            match serde_json::from_value::<ControlMessage>(value) {
                Ok(msg) => control.apply(msg),
                Err(e) => tracing::warn!(target: "psim::pipeline", error = %e, "Unknown control message"),
            }
            continue;
        }
        let request: TurnRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(target: "psim::pipeline", error = %e, "Skipping invalid turn request");
                continue;
            }
        };
        let response = pipeline.run_turn(&request, &control.snapshot()).await;
        let encoded = serde_json::to_string(&response).map_err(|e| format!("encode failed: {}", e))?;
        println!("{}", encoded);
    }
    store.flush().map_err(|e| format!("flush failed: {}", e))?;
    Ok(())
}

/// Returns the number of fragments that failed to embed.
async fn run_embed(config: &CoreConfig, case_id: Uuid, batch: Option<usize>) -> Result<usize, String> {
    let batch = batch.unwrap_or(config.embedding.batch_size);
    if batch > 1000 {
        tracing::warn!(target: "psim::embed", batch_size = batch, "Large batch size may use a lot of memory");
    }
    let store = open_store(config)?;
    let provider = embedder_from_settings(config).map_err(|e| e.to_string())?;
    let report = backfill_embeddings(store.as_ref(), provider.as_ref(), &case_id, batch)
        .await
        .map_err(|e| e.to_string())?;
    store.flush().map_err(|e| format!("flush failed: {}", e))?;
    print_json(&report)?;
    Ok(report.failed)
}

/// An explicit case id wins; otherwise the session's link decides.
async fn report_case(evaluator: &Evaluator, case_id: Option<Uuid>, session_id: Option<Uuid>) -> Result<Uuid, String> {
    match (case_id, session_id) {
        (Some(case_id), _) => Ok(case_id),
        (None, Some(session)) => evaluator
            .linked_case(&session.to_string())
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("session {} is not linked to exactly one case; pass --case-id", session)),
        (None, None) => Err("report needs --case-id or --session-id".into()),
    }
}

async fn run_report(config: &CoreConfig, case_id: Option<Uuid>, session_id: Option<Uuid>) -> Result<(), String> {
    let store = open_store(config)?;
    let evaluator = Evaluator::new(store);
    let case_id = report_case(&evaluator, case_id, session_id).await?.to_string();
    match session_id {
        Some(session) => {
            let report = evaluator
                .session_report(&session.to_string(), &case_id)
                .await
                .map_err(|e| e.to_string())?;
            print_json(&report)
        }
        None => {
            let report = evaluator.case_trajectories(&case_id).await.map_err(|e| e.to_string())?;
            print_json(&report)
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[psim-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match CoreConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config load failed: {}", e);
            std::process::exit(2);
        }
    };

    let cli = Cli::parse();
    let command = cli.command.name();
    let result = match cli.command {
        Commands::Verify => run_verify(&config),
        Commands::LoadCase { file } => run_load_case(&config, &file),
        Commands::Link { case_id, session_id, prev_session_id } => {
            run_link(&config, SessionLink { case_id, session_id, prev_session_id }).await
        }
        Commands::Turn => run_turns(&config).await,
        Commands::Embed { case_id, batch } => match run_embed(&config, case_id, batch).await {
            Ok(0) => Ok(()),
            Ok(failed) => Err(format!("{} fragments failed to embed", failed)),
            Err(e) => Err(e),
        },
        Commands::Report { case_id, session_id } => run_report(&config, case_id, session_id).await,
    };

    if let Err(e) = result {
        tracing::error!(target: "psim::pipeline", command, error = %e, "Command failed");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
