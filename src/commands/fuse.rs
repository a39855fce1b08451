use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::FuseArgs;
use crate::fusion::{DetectionSource, FuseContext, analysis_lines, fuse_image, run_batch};
use crate::inputs::{
    caption_entries, group_detections, index_crop_embeddings, read_json_file,
};
use crate::model::{
    CaptionRecord, CropEmbeddingRecord, DetectionRecord, FuseRunManifest, ImageElements,
    OcrImageRecord,
};
use crate::retrieval::CaptionCorpus;
use crate::semantic::{TextEmbedder, cross_modal_warning};
use crate::store::{caption_table_exists, load_caption_entries, open_store_read_only};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty, write_lines};

use super::{model_config, resolution_table, text_embedder};

pub fn run(args: FuseArgs) -> Result<()> {
    let started_at = now_utc_string();
    let started = Instant::now();
    let run_id = format!("fuse-{}", utc_compact_string(Utc::now()));
    let mut warnings = Vec::<String>::new();

    let ocr_records: Vec<OcrImageRecord> = read_json_file(&args.ocr_json_path)
        .with_context(|| format!("failed to load OCR results {}", args.ocr_json_path.display()))?;
    report_duplicate_images(&ocr_records, &mut warnings);

    let detections = load_detection_source(&args)?;
    let resolutions = resolution_table(&args.resolution)?;
    let (corpus, caption_source) = load_caption_corpus(&args, &mut warnings)?;

    let crop_embeddings = match args.crop_embeddings.as_ref() {
        Some(path) => {
            let records: Vec<CropEmbeddingRecord> = read_json_file(path)
                .with_context(|| format!("failed to load crop embeddings {}", path.display()))?;
            index_crop_embeddings(records)
        }
        None => Default::default(),
    };

    match (&corpus, crop_embeddings.is_empty()) {
        (Some(_), true) => warnings
            .push("caption corpus loaded but no crop embeddings given; no captions attached".to_string()),
        (None, false) => warnings
            .push("crop embeddings given without a caption corpus; ignored".to_string()),
        _ => {}
    }
    let caption_count = corpus.as_ref().map(CaptionCorpus::len).unwrap_or(0);

    let context = FuseContext {
        detections,
        resolutions,
        min_text_confidence: args.min_text_confidence,
        quad_mode: args.quad_mode.into(),
        corpus,
        crop_embeddings,
    };

    info!(
        images = ocr_records.len(),
        source = %context.detections.describe(),
        captions = caption_count,
        jobs = args.jobs,
        "fusing screenshots"
    );

    let outcome = run_batch(
        &ocr_records,
        args.jobs,
        |record| record.image_name.clone(),
        |record| fuse_image(&context, record),
    )
    .context("failed to start worker pool")?;

    let mut images = Vec::<ImageElements>::with_capacity(outcome.results.len());
    let mut elements_total = 0usize;
    let mut elements_without_text = 0usize;
    let mut elements_captioned = 0usize;
    let mut dropped_text_spans = 0usize;
    for (_, fused) in outcome.results {
        elements_total += fused.elements.ui_elements.len();
        elements_without_text += fused.without_text();
        elements_captioned += fused.captioned();
        dropped_text_spans += fused.dropped_spans;
        if fused.elements.ui_elements.is_empty() {
            warnings.push(format!("{}: no detections", fused.elements.image_name));
        }
        warnings.extend(fused.warnings);
        images.push(fused.elements);
    }

    write_json_pretty(&args.output_json_path, &images)?;
    info!(
        path = %args.output_json_path.display(),
        images = images.len(),
        elements = elements_total,
        "wrote fused UI elements"
    );

    if let Some(path) = args.analysis_path.as_ref() {
        let lines = analysis_lines(&images);
        write_lines(path, &lines)?;
        info!(path = %path.display(), lines = lines.len(), "wrote UI analysis lines");
    }

    let images_skipped = outcome.skipped.len();
    let manifest = FuseRunManifest {
        manifest_version: 1,
        run_id,
        generated_at: started_at,
        detection_source: context.detections.describe(),
        ocr_path: args.ocr_json_path.display().to_string(),
        output_path: args.output_json_path.display().to_string(),
        caption_source,
        caption_count,
        min_text_confidence: args.min_text_confidence,
        quad_mode: args.quad_mode.as_str().to_string(),
        jobs: args.jobs.max(1),
        images_total: ocr_records.len(),
        images_fused: images.len(),
        images_skipped,
        elements_total,
        elements_without_text,
        elements_captioned,
        dropped_text_spans,
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
            "fuse_run_{}.json",
            utc_compact_string(Utc::now())
        ))
    });
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        images_fused = manifest.images_fused,
        images_skipped,
        elements_without_text,
        elements_captioned,
        "fuse run completed"
    );

    Ok(())
}

fn load_detection_source(args: &FuseArgs) -> Result<DetectionSource> {
    if let Some(dir) = args.labels_dir.as_ref() {
        if !dir.is_dir() {
            bail!("labels directory does not exist: {}", dir.display());
        }
        return Ok(DetectionSource::Labels(dir.clone()));
    }

    let Some(path) = args.detections_json.as_ref() else {
        bail!("either --labels-dir or --detections-json is required");
    };
    let records: Vec<DetectionRecord> = read_json_file(path)
        .with_context(|| format!("failed to load detections {}", path.display()))?;
    Ok(DetectionSource::Exported(group_detections(records)))
}

fn load_caption_corpus(
    args: &FuseArgs,
    warnings: &mut Vec<String>,
) -> Result<(Option<CaptionCorpus>, Option<String>)> {
    let (entries, source) = if let Some(path) = args.captions.as_ref() {
        let records: Vec<CaptionRecord> = read_json_file(path)
            .with_context(|| format!("failed to load caption corpus {}", path.display()))?;
        let embedder = text_embedder(&args.model);
        let extraction = caption_entries(records, &embedder);
        if let Some(warning) =
            cross_modal_warning(embedder.config(), extraction.locally_embedded, "captions")
        {
            warn!(path = %path.display(), "{warning}");
            warnings.push(warning);
        }
        warnings.extend(extraction.rejected);
        (extraction.entries, format!("json:{}", path.display()))
    } else if let Some(path) = args.caption_store.as_ref() {
        let model = model_config(&args.model);
        let connection = open_store_read_only(path)?;
        if !caption_table_exists(&connection)? {
            bail!(
                "caption store {} has no caption_embeddings table; run embed first",
                path.display()
            );
        }
        let entries = load_caption_entries(&connection, &model.model_id, model.dimensions)?;
        if entries.is_empty() {
            warn!(
                path = %path.display(),
                model_id = %model.model_id,
                "caption store holds no captions for model"
            );
        }
        (entries, format!("store:{}#{}", path.display(), model.model_id))
    } else {
        return Ok((None, None));
    };

    let corpus = CaptionCorpus::build(entries).context("failed to build caption index")?;
    info!(
        source = %source,
        captions = corpus.len(),
        dimension = corpus.dimension(),
        "caption index built"
    );
    Ok((Some(corpus), Some(source)))
}

fn report_duplicate_images(records: &[OcrImageRecord], warnings: &mut Vec<String>) {
    let mut seen = HashSet::<&str>::new();
    for record in records {
        if !seen.insert(record.image_name.as_str()) {
            warnings.push(format!(
                "{} appears more than once in the OCR results",
                record.image_name
            ));
        }
    }
}
