//! Batch backfill of fragment embeddings for one case.

use crate::embeddings::fragment_embedding_text;
use psim_core::{EmbeddingProvider, FragmentStore, PipelineError};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub processed: usize,
    pub failed: usize,
    pub batches: usize,
    /// Dimension of the first vector written; 0 when nothing was embedded.
    pub dimensions: usize,
}

/// Embeds every fragment of the case whose embedding is still null, `batch_size` at a
/// time, committing after each batch. Re-running is a no-op once everything is embedded.
///
/// A failing batch is counted in `failed` and ends the run: its rows are still null, so
/// the next run picks them up again.
pub async fn backfill_embeddings(
    store: &dyn FragmentStore,
    provider: &dyn EmbeddingProvider,
    case_id: &Uuid,
    batch_size: usize,
) -> Result<BackfillReport, PipelineError> {
    if batch_size == 0 {
        return Err(PipelineError::BadInput("batch size must be positive".into()));
    }
    let total = store.get_fragments(case_id).await?.len();
    if total == 0 {
        return Err(PipelineError::NotFound(format!("no knowledge fragments for case {}", case_id)));
    }
    tracing::info!(target: "psim::embed", case_id = %case_id, total, batch_size, "Starting embedding backfill");

    let mut report = BackfillReport::default();
    loop {
        let fragments = store.fragments_missing_embedding(case_id, batch_size).await?;
        if fragments.is_empty() {
            break;
        }

        let texts: Vec<String> = fragments.iter().map(fragment_embedding_text).collect();
        let outcome = match provider.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == fragments.len() => {
                let updates: Vec<(Uuid, Vec<f32>)> = fragments.iter().map(|f| f.id).zip(vectors).collect();
                let dims = updates.first().map_or(0, |(_, v)| v.len());
                store
                    .set_embeddings(case_id, &updates)
                    .await
                    .map(|n| (n, dims))
                    .map_err(PipelineError::from)
            }
            Ok(vectors) => Err(PipelineError::Upstream(format!(
                "embedding count mismatch: got {}, expected {}",
                vectors.len(),
                fragments.len()
            ))),
            Err(err) => Err(err),
        };

        match outcome {
            Ok((updated, dims)) => {
                report.processed += updated;
                report.batches += 1;
                if report.dimensions == 0 {
                    report.dimensions = dims;
                }
                tracing::info!(
                    target: "psim::embed",
                    batch = report.batches,
                    size = fragments.len(),
                    updated,
                    total_processed = report.processed,
                    "Batch embedded"
                );
                if updated == 0 {
                    break;
                }
            }
            Err(err) => {
                report.failed += fragments.len();
                tracing::error!(
                    target: "psim::embed",
                    batch = report.batches + 1,
                    size = fragments.len(),
                    error = %err,
                    "Batch failed; stopping backfill"
                );
                break;
            }
        }
    }

    tracing::info!(
        target: "psim::embed",
        case_id = %case_id,
        processed = report.processed,
        failed = report.failed,
        batches = report.batches,
        dimensions = report.dimensions,
        "Embedding backfill completed"
    );
    Ok(report)
}
