//! Runtime-mutable pipeline switches (retrieval mode, LLM stages, top_k).
//!
//! Turns never read the atomics directly: callers take a [`RuntimeFlags`] snapshot and pass
//! it into [`TurnPipeline::run_turn`](super::TurnPipeline::run_turn), so a flip in the middle
//! of a turn cannot change that turn's behaviour.

use crate::shared::CoreConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Immutable per-turn view of the runtime switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFlags {
    pub rag_use_vector: bool,
    pub use_llm_reason: bool,
    pub use_llm_gen: bool,
    pub rag_top_k: usize,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            rag_use_vector: false,
            use_llm_reason: false,
            use_llm_gen: false,
            rag_top_k: 3,
        }
    }
}

impl RuntimeFlags {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            rag_use_vector: config.rag_use_vector,
            use_llm_reason: config.use_llm_reason,
            use_llm_gen: config.use_llm_gen,
            rag_top_k: config.rag_top_k,
        }
    }

    pub fn rag_mode(&self) -> &'static str {
        if self.rag_use_vector {
            "vector"
        } else {
            "metadata"
        }
    }
}

/// Admin signal applied to a [`RuntimeControl`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    RagMode { use_vector: bool },
    /// `None` leaves the corresponding flag unchanged.
    LlmFlags {
        use_reason: Option<bool>,
        use_gen: Option<bool>,
    },
    TopK { top_k: usize },
    FullState { flags: RuntimeFlags },
}

pub type ControlReceiver = mpsc::Receiver<ControlMessage>;

pub struct RuntimeControl {
    rag_use_vector: AtomicBool,
    use_llm_reason: AtomicBool,
    use_llm_gen: AtomicBool,
    rag_top_k: AtomicUsize,
}

impl RuntimeControl {
    pub fn new(initial: RuntimeFlags) -> Self {
        Self {
            rag_use_vector: AtomicBool::new(initial.rag_use_vector),
            use_llm_reason: AtomicBool::new(initial.use_llm_reason),
            use_llm_gen: AtomicBool::new(initial.use_llm_gen),
            rag_top_k: AtomicUsize::new(initial.rag_top_k),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(RuntimeFlags::from_config(config))
    }

    pub fn apply(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::RagMode { use_vector } => {
                self.rag_use_vector.store(use_vector, Ordering::SeqCst);
            }
            ControlMessage::LlmFlags { use_reason, use_gen } => {
                if let Some(on) = use_reason {
                    self.use_llm_reason.store(on, Ordering::SeqCst);
                }
                if let Some(on) = use_gen {
                    self.use_llm_gen.store(on, Ordering::SeqCst);
                }
            }
            ControlMessage::TopK { top_k } => {
                self.rag_top_k.store(top_k, Ordering::SeqCst);
            }
            ControlMessage::FullState { flags } => {
                self.rag_use_vector.store(flags.rag_use_vector, Ordering::SeqCst);
                self.use_llm_reason.store(flags.use_llm_reason, Ordering::SeqCst);
                self.use_llm_gen.store(flags.use_llm_gen, Ordering::SeqCst);
                self.rag_top_k.store(flags.rag_top_k, Ordering::SeqCst);
            }
        }
        let flags = self.snapshot();
        tracing::info!(
            target: "psim::pipeline",
            rag_mode = flags.rag_mode(),
            use_llm_reason = flags.use_llm_reason,
            use_llm_gen = flags.use_llm_gen,
            top_k = flags.rag_top_k,
            "Runtime flags updated"
        );
    }

    pub fn snapshot(&self) -> RuntimeFlags {
        RuntimeFlags {
            rag_use_vector: self.rag_use_vector.load(Ordering::Acquire),
            use_llm_reason: self.use_llm_reason.load(Ordering::Acquire),
            use_llm_gen: self.use_llm_gen.load(Ordering::Acquire),
            rag_top_k: self.rag_top_k.load(Ordering::Acquire),
        }
    }

    /// Spawns a background task that applies every message received on `receiver`.
    pub fn spawn_control_listener(self: Arc<Self>, mut receiver: ControlReceiver) {
        tokio::spawn(async move {
            while let Some(msg) = receiver.recv().await {
                self.apply(msg);
            }
        });
    }
}
