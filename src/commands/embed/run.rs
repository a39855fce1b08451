use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cli::{EmbedArgs, EmbedRefreshMode};
use crate::commands::model_config;
use crate::inputs::{caption_id, read_json_file};
use crate::model::CaptionRecord;
use crate::semantic::{
    DEFAULT_BACKEND, LocalHashEmbedder, SemanticModelConfig, TextEmbedder, embedding_text_hash,
    encode_embedding_blob, has_embeddable_text, is_zero_vector, normalize_whitespace, normalized,
};
use crate::store::{
    PendingCaption, STORE_SCHEMA_VERSION, default_db_path, ensure_model_entry,
    load_existing_embedding, open_store, prune_captions, upsert_caption_embedding,
};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

use super::types::{
    EmbeddingRunManifest, PreparedCaption, PreparedCorpus, RefreshCounts,
    SEMANTIC_MODEL_CONFIG_LOCK_FILE, SemanticModelConfigLock,
};

pub fn run(args: EmbedArgs) -> Result<()> {
    let batch_size = args.batch_size.max(1);
    let model = model_config(&args.model);

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| default_db_path(&args.cache_root));
    if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }
    let manifest_dir = args.cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;
    let semantic_model_lock_path = args
        .semantic_model_lock_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join(SEMANTIC_MODEL_CONFIG_LOCK_FILE));

    let started_at = now_utc_string();
    let started = Instant::now();
    let run_id = format!("embed-{}", utc_compact_string(Utc::now()));
    let mut warnings = Vec::<String>::new();

    let records: Vec<CaptionRecord> = read_json_file(&args.captions)
        .with_context(|| format!("failed to load caption corpus {}", args.captions.display()))?;
    let corpus_sha256 = sha256_file(&args.captions)?;
    let caption_records = records.len();
    let corpus = prepare_captions(records, model.dimensions, &mut warnings);

    let mut connection = open_store(&db_path)?;
    ensure_model_entry(&connection, &model)?;
    write_semantic_model_config_lockfile(&model, &semantic_model_lock_path)?;

    let counts = refresh_captions(
        &mut connection,
        &model,
        &corpus.captions,
        args.refresh_mode,
        batch_size,
    )?;

    let eligible_captions = corpus.captions.len();
    if eligible_captions == 0 {
        warnings.push("no eligible captions in corpus".to_string());
    }
    let embedded_captions = eligible_captions.saturating_sub(counts.stale_rows_after);

    let manifest = EmbeddingRunManifest {
        manifest_version: 1,
        run_id,
        generated_at: started_at,
        captions_path: args.captions.display().to_string(),
        corpus_sha256,
        db_path: db_path.display().to_string(),
        model_id: model.model_id.clone(),
        model_name: model.model_name.clone(),
        embedding_dim: model.dimensions,
        normalization: model.normalization.clone(),
        backend: model.backend.clone(),
        db_schema_version: STORE_SCHEMA_VERSION.to_string(),
        refresh_mode: args.refresh_mode.as_str().to_string(),
        caption_records,
        eligible_captions,
        embedded_captions,
        updated_captions: counts.updated_captions,
        skipped_empty_captions: corpus.skipped_empty,
        skipped_dimension_mismatch: corpus.skipped_dimension_mismatch,
        pruned_captions: counts.pruned_captions,
        stale_rows_before: counts.stale_rows_before,
        stale_rows_after: counts.stale_rows_after,
        batch_size,
        duration_ms: started.elapsed().as_millis(),
        status: "completed".to_string(),
        warnings,
    };

    let manifest_path = manifest_dir.join(format!(
        "embedding_run_{}.json",
        utc_compact_string(Utc::now())
    ));
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        model_id = %model.model_id,
        eligible_captions,
        updated_captions = counts.updated_captions,
        pruned_captions = counts.pruned_captions,
        stale_rows_after = counts.stale_rows_after,
        "caption embedding refresh completed"
    );

    Ok(())
}

/// Assigns caption ids by corpus position and filters out records that
/// cannot be stored for this model.
fn prepare_captions(
    records: Vec<CaptionRecord>,
    dimensions: usize,
    warnings: &mut Vec<String>,
) -> PreparedCorpus {
    let mut corpus = PreparedCorpus::default();

    for (ordinal, record) in records.into_iter().enumerate() {
        let id = caption_id(&record.image_name, ordinal);
        let caption = normalize_whitespace(&record.caption);
        if caption.is_empty() {
            debug!(caption_id = %id, "skipping empty caption");
            corpus.skipped_empty += 1;
            continue;
        }

        let no_direction = match record.embedding.as_deref() {
            Some(vector) => vector.len() == dimensions && is_zero_vector(vector),
            None => !has_embeddable_text(&caption),
        };
        if no_direction {
            warn!(caption_id = %id, "skipping caption that embeds to a zero vector");
            warnings.push(format!("{id}: caption embeds to a zero vector"));
            corpus.skipped_empty += 1;
            continue;
        }

        if let Some(vector) = record.embedding.as_ref()
            && vector.len() != dimensions
        {
            warn!(
                caption_id = %id,
                found = vector.len(),
                expected = dimensions,
                "skipping caption with pre-computed vector of wrong size"
            );
            warnings.push(format!(
                "{id}: embedding has {} values, expected {dimensions}",
                vector.len()
            ));
            corpus.skipped_dimension_mismatch += 1;
            continue;
        }

        let text_hash = caption_payload_hash(&caption, record.embedding.as_deref());
        corpus.captions.push(PreparedCaption {
            caption_id: id,
            image_name: record.image_name,
            caption,
            text_hash,
            precomputed: record.embedding,
        });
    }

    corpus
}

/// SHA-256 over the normalized caption, plus the supplied vector when the
/// corpus carries one, so an edited vector also counts as stale. Locally
/// embedded captions hash the encoder backend too, so rows written by an
/// older encoder are refreshed.
fn caption_payload_hash(caption: &str, precomputed: Option<&[f32]>) -> String {
    let Some(vector) = precomputed else {
        return embedding_text_hash(&format!("{DEFAULT_BACKEND}\n{caption}"));
    };
    let mut hasher = Sha256::new();
    hasher.update(caption.as_bytes());
    hasher.update([0_u8]);
    hasher.update(encode_embedding_blob(vector));
    format!("{:x}", hasher.finalize())
}

fn is_stale(
    connection: &Connection,
    caption: &PreparedCaption,
    model: &SemanticModelConfig,
) -> Result<bool> {
    let existing = load_existing_embedding(connection, &caption.caption_id, &model.model_id)?;
    Ok(existing
        .as_ref()
        .map(|row| row.text_hash != caption.text_hash || row.embedding_dim != model.dimensions)
        .unwrap_or(true))
}

fn refresh_captions(
    connection: &mut Connection,
    model: &SemanticModelConfig,
    captions: &[PreparedCaption],
    refresh_mode: EmbedRefreshMode,
    batch_size: usize,
) -> Result<RefreshCounts> {
    let embedder = LocalHashEmbedder::new(model.clone());
    let mut counts = RefreshCounts::default();
    let mut pending_updates = Vec::<PendingCaption>::new();

    for caption in captions {
        let stale = is_stale(connection, caption, model)?;
        if stale {
            counts.stale_rows_before += 1;
        }

        let should_update = match refresh_mode {
            EmbedRefreshMode::Full => true,
            EmbedRefreshMode::MissingOrStale => stale,
        };
        if !should_update {
            continue;
        }

        let embedding = match caption.precomputed.as_ref() {
            Some(vector) => normalized(vector),
            None => embedder.embed(&caption.caption),
        };
        pending_updates.push(PendingCaption {
            caption_id: caption.caption_id.clone(),
            image_name: caption.image_name.clone(),
            caption: caption.caption.clone(),
            text_hash: caption.text_hash.clone(),
            embedding_blob: encode_embedding_blob(&embedding),
            embedding_dim: embedding.len(),
        });

        if pending_updates.len() >= batch_size {
            counts.updated_captions +=
                flush_embed_batch(connection, &model.model_id, &mut pending_updates)?;
            info!(
                model_id = %model.model_id,
                updated_captions = counts.updated_captions,
                captions = captions.len(),
                "embed batch committed"
            );
        }
    }

    counts.updated_captions += flush_embed_batch(connection, &model.model_id, &mut pending_updates)?;

    let keep = captions
        .iter()
        .map(|caption| caption.caption_id.clone())
        .collect::<HashSet<String>>();
    counts.pruned_captions = prune_captions(connection, &model.model_id, &keep)?;
    if counts.pruned_captions > 0 {
        info!(
            model_id = %model.model_id,
            pruned = counts.pruned_captions,
            "removed captions no longer in corpus"
        );
    }

    for caption in captions {
        if is_stale(connection, caption, model)? {
            counts.stale_rows_after += 1;
        }
    }

    Ok(counts)
}

fn flush_embed_batch(
    connection: &mut Connection,
    model_id: &str,
    pending_updates: &mut Vec<PendingCaption>,
) -> Result<usize> {
    if pending_updates.is_empty() {
        return Ok(0);
    }

    let tx = connection.transaction()?;
    let mut updated = 0usize;
    for pending in pending_updates.drain(..) {
        upsert_caption_embedding(&tx, model_id, &pending)?;
        updated += 1;
    }
    tx.commit()?;

    Ok(updated)
}

fn write_semantic_model_config_lockfile(
    model: &SemanticModelConfig,
    lock_path: &Path,
) -> Result<()> {
    let checksum_input = format!(
        "{}|{}|{}|{}|{}",
        model.model_id, model.model_name, model.dimensions, model.normalization, model.backend
    );
    let mut hasher = Sha256::new();
    hasher.update(checksum_input.as_bytes());

    let lock = SemanticModelConfigLock {
        manifest_version: 1,
        model_id: model.model_id.clone(),
        model_name: model.model_name.clone(),
        embedding_dim: model.dimensions,
        normalization: model.normalization.clone(),
        runtime_backend: model.backend.clone(),
        created_at: now_utc_string(),
        checksum: format!("{:x}", hasher.finalize()),
    };

    write_json_pretty(lock_path, &lock)
}
