//! Narrow seam for the out-of-scope artifact writer (spec.md §6).
//!
//! The real JSON artifact writer (run directories, atomic file replace) is
//! an external collaborator. This crate only needs a trait object it can
//! call best-effort after a swap or evaluation, matching the
//! `PersistenceBestEffort` error kind: failures here are logged, never
//! propagated to the caller of the primary operation.

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait ArtifactWriter: Send + Sync {
    async fn write_json(&self, path: &str, value: &serde_json::Value) -> anyhow::Result<()>;
}

/// Default no-op writer; swapped out by the external collaborator in a real
/// deployment.
pub struct NullArtifactWriter;

#[async_trait]
impl ArtifactWriter for NullArtifactWriter {
    async fn write_json(&self, _path: &str, _value: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Call a writer best-effort: log and swallow any error rather than letting
/// a secondary write affect the primary trade path.
pub async fn write_best_effort(writer: &dyn ArtifactWriter, path: &str, value: &serde_json::Value) {
    if let Err(e) = writer.write_json(path, value).await {
        warn!(error = %e, path, "best-effort artifact write failed");
    }
}
