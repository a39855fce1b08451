use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::{DescribeRunManifest, FuseRunManifest};
use crate::store::{caption_table_exists, default_db_path, model_summaries, open_store_read_only};

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| default_db_path(&args.cache_root));

    info!(cache_root = %args.cache_root.display(), "status requested");

    match latest_manifest(&manifest_dir, "fuse_run_")? {
        Some(path) => {
            let manifest: FuseRunManifest = read_manifest(&path)?;
            info!(
                path = %path.display(),
                run_id = %manifest.run_id,
                status = %manifest.status,
                images_total = manifest.images_total,
                images_fused = manifest.images_fused,
                images_skipped = manifest.images_skipped,
                elements_total = manifest.elements_total,
                elements_without_text = manifest.elements_without_text,
                elements_captioned = manifest.elements_captioned,
                warnings = manifest.warnings.len(),
                "latest fuse run"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no fuse run manifest found"),
    }

    match latest_manifest(&manifest_dir, "describe_run_")? {
        Some(path) => {
            let manifest: DescribeRunManifest = read_manifest(&path)?;
            info!(
                path = %path.display(),
                run_id = %manifest.run_id,
                status = %manifest.status,
                model_id = %manifest.model_id,
                descriptions = manifest.description_count,
                images_matched = manifest.images_matched,
                images_skipped = manifest.images_skipped,
                top1_agreement = manifest.top1_agreement.unwrap_or(0.0),
                "latest describe run"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no describe run manifest found"),
    }

    match latest_manifest(&manifest_dir, "embedding_run_")? {
        Some(path) => info!(path = %path.display(), "latest embedding run manifest"),
        None => warn!(path = %manifest_dir.display(), "no embedding run manifest found"),
    }

    if db_path.exists() {
        let connection = open_store_read_only(&db_path)?;
        if caption_table_exists(&connection)? {
            let summaries = model_summaries(&connection)?;
            if summaries.is_empty() {
                warn!(path = %db_path.display(), "caption store has no embedding models");
            }
            for summary in summaries {
                info!(
                    path = %db_path.display(),
                    model_id = %summary.model_id,
                    dimensions = summary.dimensions,
                    captions = summary.caption_count,
                    "caption store model"
                );
            }
        } else {
            warn!(path = %db_path.display(), "caption store has no caption table");
        }
    } else {
        warn!(path = %db_path.display(), "caption store missing");
    }

    Ok(())
}

/// Newest `<prefix><timestamp>.json` in `dir`. Compact UTC timestamps sort
/// lexicographically.
fn latest_manifest(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut latest: Option<PathBuf> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("failed to list {}", dir.display()))?
            .path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) || !name.ends_with(".json") {
            continue;
        }
        if latest
            .as_ref()
            .and_then(|current| current.file_name())
            .is_none_or(|current| &*current.to_string_lossy() < name)
        {
            latest = Some(path);
        }
    }

    Ok(latest)
}

fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::latest_manifest;

    #[test]
    fn latest_manifest_picks_newest_matching_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in [
            "fuse_run_20260101T000000Z.json",
            "fuse_run_20260301T000000Z.json",
            "describe_run_20270101T000000Z.json",
            "fuse_run_20260201T000000Z.json",
        ] {
            fs::write(dir.path().join(name), "{}").expect("write manifest");
        }

        let latest = latest_manifest(dir.path(), "fuse_run_")
            .expect("scan")
            .expect("manifest present");
        assert_eq!(
            latest.file_name().and_then(|name| name.to_str()),
            Some("fuse_run_20260301T000000Z.json")
        );
        assert!(
            latest_manifest(dir.path(), "embedding_run_")
                .expect("scan")
                .is_none()
        );
        assert!(
            latest_manifest(&dir.path().join("missing"), "fuse_run_")
                .expect("scan")
                .is_none()
        );
    }
}
