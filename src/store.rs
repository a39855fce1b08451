//! SQLite caption store: embedded caption corpus rows keyed by
//! `(caption_id, model_id)`, with a text hash for staleness checks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::warn;

use crate::model::CaptionEntry;
use crate::semantic::{SemanticModelConfig, decode_embedding_blob, is_zero_vector};
use crate::util::now_utc_string;

pub const STORE_SCHEMA_VERSION: &str = "0.1.0";
const STORE_FILE_NAME: &str = "caption_index.sqlite";

pub fn default_db_path(cache_root: &Path) -> PathBuf {
    cache_root.join(STORE_FILE_NAME)
}

pub fn open_store(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open caption store: {}", db_path.display()))?;

    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;

    ensure_store_schema(&connection)?;
    Ok(connection)
}

pub fn open_store_read_only(db_path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| {
        format!(
            "failed to open caption store read-only: {}",
            db_path.display()
        )
    })
}

pub fn ensure_store_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS embedding_models (
              model_id TEXT PRIMARY KEY,
              backend TEXT NOT NULL,
              model_name TEXT NOT NULL,
              dimensions INTEGER NOT NULL,
              normalize INTEGER NOT NULL,
              created_at TEXT NOT NULL,
              config_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS caption_embeddings (
              caption_id TEXT NOT NULL,
              model_id TEXT NOT NULL,
              image_name TEXT NOT NULL,
              caption TEXT NOT NULL,
              embedding BLOB NOT NULL,
              embedding_dim INTEGER NOT NULL,
              text_hash TEXT NOT NULL,
              generated_at TEXT NOT NULL,
              PRIMARY KEY(caption_id, model_id),
              FOREIGN KEY(model_id) REFERENCES embedding_models(model_id)
            );

            CREATE INDEX IF NOT EXISTS idx_caption_embeddings_model
              ON caption_embeddings(model_id);
            ",
        )
        .context("failed to create caption store schema")?;

    connection.execute(
        "
        INSERT INTO metadata(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value=excluded.value
        ",
        [STORE_SCHEMA_VERSION],
    )?;

    Ok(())
}

pub fn ensure_model_entry(connection: &Connection, model: &SemanticModelConfig) -> Result<()> {
    let created_at = now_utc_string();
    let config_json = serde_json::json!({
        "model_id": model.model_id,
        "model_name": model.model_name,
        "dimensions": model.dimensions,
        "normalization": model.normalization,
        "backend": model.backend,
    })
    .to_string();

    connection.execute(
        "
        INSERT INTO embedding_models(model_id, backend, model_name, dimensions, normalize, created_at, config_json)
        VALUES(?1, ?2, ?3, ?4, 1, ?5, ?6)
        ON CONFLICT(model_id) DO UPDATE SET
          backend=excluded.backend,
          model_name=excluded.model_name,
          dimensions=excluded.dimensions,
          normalize=excluded.normalize,
          config_json=excluded.config_json
        ",
        params![
            model.model_id,
            model.backend,
            model.model_name,
            model.dimensions as i64,
            created_at,
            config_json,
        ],
    )?;

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistingEmbeddingRow {
    pub text_hash: String,
    pub embedding_dim: usize,
}

pub fn load_existing_embedding(
    connection: &Connection,
    caption_id: &str,
    model_id: &str,
) -> Result<Option<ExistingEmbeddingRow>> {
    let row = connection
        .query_row(
            "
            SELECT text_hash, embedding_dim
            FROM caption_embeddings
            WHERE caption_id = ?1 AND model_id = ?2
            LIMIT 1
            ",
            params![caption_id, model_id],
            |row| {
                Ok(ExistingEmbeddingRow {
                    text_hash: row.get(0)?,
                    embedding_dim: row.get::<_, i64>(1)? as usize,
                })
            },
        )
        .optional()?;

    Ok(row)
}

#[derive(Debug, Clone)]
pub struct PendingCaption {
    pub caption_id: String,
    pub image_name: String,
    pub caption: String,
    pub text_hash: String,
    pub embedding_blob: Vec<u8>,
    pub embedding_dim: usize,
}

pub fn upsert_caption_embedding(
    connection: &Connection,
    model_id: &str,
    pending: &PendingCaption,
) -> Result<()> {
    connection.execute(
        "
        INSERT INTO caption_embeddings(caption_id, model_id, image_name, caption, embedding, embedding_dim, text_hash, generated_at)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(caption_id, model_id) DO UPDATE SET
          image_name=excluded.image_name,
          caption=excluded.caption,
          embedding=excluded.embedding,
          embedding_dim=excluded.embedding_dim,
          text_hash=excluded.text_hash,
          generated_at=excluded.generated_at
        ",
        params![
            pending.caption_id,
            model_id,
            pending.image_name,
            pending.caption,
            pending.embedding_blob,
            pending.embedding_dim as i64,
            pending.text_hash,
            now_utc_string(),
        ],
    )?;

    Ok(())
}

/// Removes rows of `model_id` whose caption is no longer in the corpus.
pub fn prune_captions(
    connection: &Connection,
    model_id: &str,
    keep: &HashSet<String>,
) -> Result<usize> {
    let mut statement =
        connection.prepare("SELECT caption_id FROM caption_embeddings WHERE model_id = ?1")?;
    let stored = statement
        .query_map([model_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut removed = 0usize;
    for caption_id in stored.iter().filter(|id| !keep.contains(*id)) {
        removed += connection.execute(
            "DELETE FROM caption_embeddings WHERE caption_id = ?1 AND model_id = ?2",
            params![caption_id, model_id],
        )?;
    }

    Ok(removed)
}

pub fn caption_table_exists(connection: &Connection) -> Result<bool> {
    let exists = connection
        .query_row(
            "
            SELECT name
            FROM sqlite_master
            WHERE type = 'table' AND name = 'caption_embeddings'
            LIMIT 1
            ",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

/// Caption entries for one model, in caption id order. Rows whose blob does
/// not decode at `dimensions`, or decodes to a zero vector, are skipped with
/// a warning.
pub fn load_caption_entries(
    connection: &Connection,
    model_id: &str,
    dimensions: usize,
) -> Result<Vec<CaptionEntry>> {
    let mut statement = connection.prepare(
        "
        SELECT caption_id, image_name, caption, embedding, embedding_dim
        FROM caption_embeddings
        WHERE model_id = ?1
        ORDER BY caption_id ASC
        ",
    )?;

    let mut rows = statement.query([model_id])?;
    let mut out = Vec::<CaptionEntry>::new();

    while let Some(row) = rows.next()? {
        let caption_id: String = row.get(0)?;
        let row_dim = row.get::<_, i64>(4)? as usize;
        let blob = row.get::<_, Vec<u8>>(3)?;

        let decoded = if row_dim == dimensions {
            decode_embedding_blob(&blob, dimensions)
        } else {
            None
        };
        let Some(embedding) = decoded else {
            warn!(
                caption_id = %caption_id,
                stored_dim = row_dim,
                expected_dim = dimensions,
                "skipping caption with unexpected embedding size"
            );
            continue;
        };
        if is_zero_vector(&embedding) {
            warn!(caption_id = %caption_id, "skipping caption with zero-norm embedding");
            continue;
        }

        out.push(CaptionEntry {
            caption_id,
            image_name: row.get(1)?,
            caption: row.get(2)?,
            embedding,
        });
    }

    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub model_id: String,
    pub dimensions: usize,
    pub caption_count: i64,
}

pub fn model_summaries(connection: &Connection) -> Result<Vec<ModelSummary>> {
    let mut statement = connection.prepare(
        "
        SELECT m.model_id, m.dimensions, COUNT(c.caption_id)
        FROM embedding_models m
        LEFT JOIN caption_embeddings c ON c.model_id = m.model_id
        GROUP BY m.model_id, m.dimensions
        ORDER BY m.model_id ASC
        ",
    )?;

    let summaries = statement
        .query_map([], |row| {
            Ok(ModelSummary {
                model_id: row.get(0)?,
                dimensions: row.get::<_, i64>(1)? as usize,
                caption_count: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<ModelSummary>>>()?;

    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{
        PendingCaption, caption_table_exists, ensure_model_entry, load_caption_entries,
        load_existing_embedding, model_summaries, open_store, prune_captions,
        upsert_caption_embedding,
    };
    use crate::semantic::{encode_embedding_blob, resolve_model_config};

    fn pending(caption_id: &str, caption: &str, embedding: &[f32]) -> PendingCaption {
        PendingCaption {
            caption_id: caption_id.to_string(),
            image_name: "rico.jpg".to_string(),
            caption: caption.to_string(),
            text_hash: format!("hash-{caption}"),
            embedding_blob: encode_embedding_blob(embedding),
            embedding_dim: embedding.len(),
        }
    }

    #[test]
    fn store_round_trips_caption_entries_by_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let connection = open_store(&dir.path().join("store.sqlite")).expect("store");
        assert!(caption_table_exists(&connection).expect("schema"));

        let model = resolve_model_config("test-model", Some(2));
        ensure_model_entry(&connection, &model).expect("model");
        upsert_caption_embedding(&connection, &model.model_id, &pending("b#1", "red icon", &[0.0, 1.0]))
            .expect("upsert");
        upsert_caption_embedding(&connection, &model.model_id, &pending("a#0", "blue button", &[1.0, 0.0]))
            .expect("upsert");
        upsert_caption_embedding(&connection, &model.model_id, &pending("c#2", "wide", &[1.0, 0.0, 0.0]))
            .expect("upsert");
        upsert_caption_embedding(&connection, &model.model_id, &pending("d#3", "blank", &[0.0, 0.0]))
            .expect("upsert");

        let entries = load_caption_entries(&connection, &model.model_id, 2).expect("load");
        let captions = entries
            .iter()
            .map(|entry| entry.caption.as_str())
            .collect::<Vec<&str>>();
        assert_eq!(captions, vec!["blue button", "red icon"]);
        assert_eq!(entries[0].embedding, vec![1.0, 0.0]);

        assert!(
            load_caption_entries(&connection, "other-model", 2)
                .expect("load")
                .is_empty()
        );

        let summaries = model_summaries(&connection).expect("summaries");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].caption_count, 4);
    }

    #[test]
    fn upsert_replaces_hash_and_prune_drops_removed_captions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let connection = open_store(&dir.path().join("store.sqlite")).expect("store");
        let model = resolve_model_config("test-model", Some(2));
        ensure_model_entry(&connection, &model).expect("model");

        upsert_caption_embedding(&connection, &model.model_id, &pending("a#0", "old", &[1.0, 0.0]))
            .expect("upsert");
        upsert_caption_embedding(&connection, &model.model_id, &pending("a#0", "new", &[0.0, 1.0]))
            .expect("upsert");
        upsert_caption_embedding(&connection, &model.model_id, &pending("z#9", "gone", &[0.0, 1.0]))
            .expect("upsert");

        let existing = load_existing_embedding(&connection, "a#0", &model.model_id)
            .expect("lookup")
            .expect("row");
        assert_eq!(existing.text_hash, "hash-new");
        assert_eq!(existing.embedding_dim, 2);

        let keep = HashSet::from(["a#0".to_string()]);
        assert_eq!(prune_captions(&connection, &model.model_id, &keep).expect("prune"), 1);
        assert!(
            load_existing_embedding(&connection, "z#9", &model.model_id)
                .expect("lookup")
                .is_none()
        );
    }
}
