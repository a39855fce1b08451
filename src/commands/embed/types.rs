use serde::Serialize;

pub(super) const SEMANTIC_MODEL_CONFIG_LOCK_FILE: &str = "semantic_model_config.lock.json";

/// One corpus caption ready for the store, keyed the same way `fuse`
/// keys JSON corpus entries.
#[derive(Debug, Clone)]
pub(super) struct PreparedCaption {
    pub(super) caption_id: String,
    pub(super) image_name: String,
    pub(super) caption: String,
    pub(super) text_hash: String,
    pub(super) precomputed: Option<Vec<f32>>,
}

#[derive(Debug, Default)]
pub(super) struct PreparedCorpus {
    pub(super) captions: Vec<PreparedCaption>,
    pub(super) skipped_empty: usize,
    pub(super) skipped_dimension_mismatch: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct RefreshCounts {
    pub(super) stale_rows_before: usize,
    pub(super) updated_captions: usize,
    pub(super) pruned_captions: usize,
    pub(super) stale_rows_after: usize,
}

#[derive(Debug, Serialize)]
pub(super) struct EmbeddingRunManifest {
    pub(super) manifest_version: u32,
    pub(super) run_id: String,
    pub(super) generated_at: String,
    pub(super) captions_path: String,
    pub(super) corpus_sha256: String,
    pub(super) db_path: String,
    pub(super) model_id: String,
    pub(super) model_name: String,
    pub(super) embedding_dim: usize,
    pub(super) normalization: String,
    pub(super) backend: String,
    pub(super) db_schema_version: String,
    pub(super) refresh_mode: String,
    pub(super) caption_records: usize,
    pub(super) eligible_captions: usize,
    pub(super) embedded_captions: usize,
    pub(super) updated_captions: usize,
    pub(super) skipped_empty_captions: usize,
    pub(super) skipped_dimension_mismatch: usize,
    pub(super) pruned_captions: usize,
    pub(super) stale_rows_before: usize,
    pub(super) stale_rows_after: usize,
    pub(super) batch_size: usize,
    pub(super) duration_ms: u128,
    pub(super) status: String,
    pub(super) warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct SemanticModelConfigLock {
    pub(super) manifest_version: u32,
    pub(super) model_id: String,
    pub(super) model_name: String,
    pub(super) embedding_dim: usize,
    pub(super) normalization: String,
    pub(super) runtime_backend: String,
    pub(super) created_at: String,
    pub(super) checksum: String,
}
