//! Network-backed capabilities that plug into the `psim-core` turn pipeline.

pub use psim_core::{EmbeddingProvider, Generator, Reasoner};

mod embed_job;
mod embeddings;
mod error;
mod generate_llm;
pub mod llm;
mod reason_llm;

pub use embed_job::{backfill_embeddings, BackfillReport};
pub use embeddings::{compact_metadata, embedder_from_settings, fragment_embedding_text, HashingEmbedder, HttpEmbedder};
pub use error::LlmError;
pub use generate_llm::LlmGenerator;
pub use llm::{ChatClient, ChatMessage, ChatParams, ChatResponse, ModelRouter, RetryPolicy};
pub use reason_llm::LlmReasoner;
