use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::cli::DescribeArgs;
use crate::fusion::{describe_image, run_batch};
use crate::inputs::{image_basename, read_json_file};
use crate::model::{DescribeRunManifest, DescriptionMatchRecord, DescriptionValue};
use crate::retrieval::DescriptionTable;
use crate::semantic::{TextEmbedder, cross_modal_warning};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

use super::text_embedder;

const IMAGE_FILE_PATTERN: &str = r"(?i)\.(png|jpe?g)$";

pub fn run(args: DescribeArgs) -> Result<()> {
    let started_at = now_utc_string();
    let started = Instant::now();
    let run_id = format!("describe-{}", utc_compact_string(Utc::now()));
    let mut warnings = Vec::<String>::new();

    let embedder = text_embedder(&args.model);
    let raw_descriptions: BTreeMap<String, DescriptionValue> = read_json_file(&args.descriptions)
        .with_context(|| {
            format!(
                "failed to load description table {}",
                args.descriptions.display()
            )
        })?;
    let table = DescriptionTable::build(raw_descriptions, &embedder, args.max_tokens)
        .context("failed to build description table")?;
    for key in table.rejected() {
        warnings.push(format!("{key}: description embeds to a zero vector"));
    }
    if let Some(warning) =
        cross_modal_warning(embedder.config(), table.locally_embedded(), "descriptions")
    {
        warn!(path = %args.descriptions.display(), "{warning}");
        warnings.push(warning);
    }
    if table.is_empty() {
        bail!(
            "description table {} has no entries",
            args.descriptions.display()
        );
    }
    info!(
        path = %args.descriptions.display(),
        descriptions = table.len(),
        dimension = table.dimension(),
        max_tokens = args.max_tokens,
        "description table built"
    );

    let raw_embeddings: BTreeMap<String, Vec<f32>> = read_json_file(&args.image_embeddings)
        .with_context(|| {
            format!(
                "failed to load image embeddings {}",
                args.image_embeddings.display()
            )
        })?;
    let images_total = raw_embeddings.len();
    let images = select_image_embeddings(raw_embeddings, &mut warnings)?;

    info!(
        images = images.len(),
        jobs = args.jobs,
        "matching screenshots against descriptions"
    );

    let outcome = run_batch(
        &images,
        args.jobs,
        |(image_name, _)| image_name.clone(),
        |(image_name, embedding)| describe_image(&table, image_name, embedding),
    )
    .context("failed to start worker pool")?;

    let mut matches_expected = 0usize;
    let mut results = BTreeMap::<String, DescriptionMatchRecord>::new();
    for (image_name, record) in outcome.results {
        debug!(
            image = %image_name,
            best_match = %record.best_match_key,
            score = record.similarity_score,
            "description matched"
        );
        if record.matches_expected {
            matches_expected += 1;
        }
        results.insert(image_name, record);
    }

    write_json_pretty(&args.output_json_path, &results)?;
    info!(
        path = %args.output_json_path.display(),
        images = results.len(),
        matches_expected,
        "wrote description matches"
    );

    let images_matched = results.len();
    let images_skipped = outcome.skipped.len();
    let top1_agreement = (images_matched > 0).then(|| matches_expected as f64 / images_matched as f64);
    let model = embedder.config();

    let manifest = DescribeRunManifest {
        manifest_version: 1,
        run_id,
        generated_at: started_at,
        descriptions_path: args.descriptions.display().to_string(),
        image_embeddings_path: args.image_embeddings.display().to_string(),
        output_path: args.output_json_path.display().to_string(),
        model_id: model.model_id.clone(),
        embedding_dim: table.dimension(),
        max_tokens: args.max_tokens,
        description_count: table.len(),
        images_total,
        images_matched,
        images_skipped,
        matches_expected,
        top1_agreement,
        duration_ms: started.elapsed().as_millis(),
        status: if images_skipped == 0 {
            "completed"
        } else {
            "completed_with_skips"
        }
        .to_string(),
        skipped: outcome.skipped,
        warnings,
    };

    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        args.cache_root.join("manifests").join(format!(
            "describe_run_{}.json",
            utc_compact_string(Utc::now())
        ))
    });
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        images_matched,
        images_skipped,
        top1_agreement = top1_agreement.unwrap_or(0.0),
        "describe run completed"
    );

    Ok(())
}

/// Keeps screenshot entries with a non-empty vector. Non-image keys and
/// AppleDouble `._` companions are dropped; both cases land in `warnings`.
fn select_image_embeddings(
    raw: BTreeMap<String, Vec<f32>>,
    warnings: &mut Vec<String>,
) -> Result<Vec<(String, Vec<f32>)>> {
    let image_file = Regex::new(IMAGE_FILE_PATTERN).context("invalid image file pattern")?;

    let mut selected = Vec::with_capacity(raw.len());
    for (image_name, embedding) in raw {
        if image_basename(&image_name).starts_with("._") {
            debug!(image = %image_name, "ignoring AppleDouble companion");
            continue;
        }
        if !image_file.is_match(&image_name) {
            warn!(image = %image_name, "ignoring non-image embedding key");
            warnings.push(format!("{image_name}: not an image file name"));
            continue;
        }
        if embedding.is_empty() {
            warn!(image = %image_name, "image has no embedding vector");
            warnings.push(format!("{image_name}: empty embedding vector"));
            continue;
        }
        selected.push((image_name, embedding));
    }

    Ok(selected)
}
