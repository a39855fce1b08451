//! Per-image fusion and the batch driver that isolates per-image failures.

use std::collections::HashMap;
use std::path::PathBuf;

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::errors::{FusionError, FusionResult};
use crate::geometry::QuadMode;
use crate::inputs::{ResolutionTable, extract_text_spans, image_basename, load_yolo_label_file};
use crate::model::{
    DescriptionMatchRecord, Detection, ImageElements, NO_TEXT_NEARBY, OcrImageRecord, SkippedImage,
};
use crate::proximity::match_detections;
use crate::retrieval::{CaptionCorpus, DescriptionTable};

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Successful results in input order.
    pub results: Vec<(String, T)>,
    pub skipped: Vec<SkippedImage>,
}

/// Runs `process` over every item, on a rayon pool of `jobs` threads when
/// `jobs > 1`. A failing item is recorded in `skipped` and never stops the
/// batch.
pub fn run_batch<I, T, N, F>(
    items: &[I],
    jobs: usize,
    name_of: N,
    process: F,
) -> FusionResult<BatchOutcome<T>>
where
    I: Sync,
    T: Send,
    N: Fn(&I) -> String,
    F: Fn(&I) -> FusionResult<T> + Sync + Send,
{
    let jobs = jobs.max(1).min(items.len().max(1));

    let outcomes: Vec<FusionResult<T>> = if jobs == 1 {
        items.iter().map(&process).collect()
    } else {
        let pool = ThreadPoolBuilder::new().num_threads(jobs).build()?;
        pool.install(|| items.par_iter().map(&process).collect())
    };

    let mut batch = BatchOutcome {
        results: Vec::with_capacity(items.len()),
        skipped: Vec::new(),
    };
    for (item, outcome) in items.iter().zip(outcomes) {
        let image_name = name_of(item);
        match outcome {
            Ok(value) => batch.results.push((image_name, value)),
            Err(err) => {
                warn!(image = %image_name, kind = err.kind(), error = %err, "skipping image");
                batch.skipped.push(SkippedImage {
                    image_name,
                    kind: err.kind().to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(batch)
}

pub enum DetectionSource {
    /// Directory of YOLO label files, one `<stem>.txt` per image.
    Labels(PathBuf),
    /// Pixel-space detections grouped by image basename.
    Exported(HashMap<String, Vec<Detection>>),
}

impl DetectionSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Labels(dir) => format!("labels:{}", dir.display()),
            Self::Exported(grouped) => format!("detections:{} images", grouped.len()),
        }
    }

    fn load(&self, image_name: &str, resolutions: &ResolutionTable) -> FusionResult<Vec<Detection>> {
        match self {
            Self::Labels(dir) => {
                load_yolo_label_file(dir, image_name, resolutions.size_for(image_name))
            }
            // The detector export has no rows for a screen without widgets.
            Self::Exported(grouped) => Ok(grouped
                .get(image_basename(image_name))
                .cloned()
                .unwrap_or_default()),
        }
    }
}

/// Read-only inputs shared by every image of a fuse batch.
pub struct FuseContext {
    pub detections: DetectionSource,
    pub resolutions: ResolutionTable,
    pub min_text_confidence: f32,
    pub quad_mode: QuadMode,
    pub corpus: Option<CaptionCorpus>,
    pub crop_embeddings: HashMap<(String, usize), Vec<f32>>,
}

#[derive(Debug)]
pub struct FusedImage {
    pub elements: ImageElements,
    pub dropped_spans: usize,
    pub warnings: Vec<String>,
}

impl FusedImage {
    pub fn without_text(&self) -> usize {
        self.elements
            .ui_elements
            .iter()
            .filter(|element| element.matched_text == NO_TEXT_NEARBY)
            .count()
    }

    pub fn captioned(&self) -> usize {
        self.elements
            .ui_elements
            .iter()
            .filter(|element| element.matched_caption.is_some())
            .count()
    }
}

pub fn fuse_image(context: &FuseContext, record: &OcrImageRecord) -> FusionResult<FusedImage> {
    let detections = context.detections.load(&record.image_name, &context.resolutions)?;
    let extraction = extract_text_spans(record, context.min_text_confidence, context.quad_mode);
    let rejected_spans = extraction.rejected.len();
    let mut warnings = extraction.rejected;

    let mut ui_elements = match_detections(&detections, &extraction.spans);

    if let Some(corpus) = context.corpus.as_ref().filter(|corpus| !corpus.is_empty()) {
        let image_key = image_basename(&record.image_name).to_string();
        for (detection_index, element) in ui_elements.iter_mut().enumerate() {
            let Some(crop) = context
                .crop_embeddings
                .get(&(image_key.clone(), detection_index))
            else {
                continue;
            };
            match corpus.nearest(crop) {
                Ok(Some(hit)) => {
                    element.matched_caption = Some(hit.caption.to_string());
                    element.similarity_score = Some(round2(hit.similarity));
                }
                Ok(None) => {}
                Err(err) => warnings.push(format!(
                    "{} detection {detection_index}: caption lookup failed: {err}",
                    record.image_name
                )),
            }
        }
    }

    debug!(
        image = %record.image_name,
        detections = detections.len(),
        spans = extraction.spans.len(),
        "fused image"
    );

    Ok(FusedImage {
        elements: ImageElements {
            image_name: record.image_name.clone(),
            ui_elements,
        },
        dropped_spans: extraction.below_threshold + rejected_spans,
        warnings,
    })
}

/// Whole-image mode for one screenshot embedding.
pub fn describe_image(
    table: &DescriptionTable,
    image_name: &str,
    image_embedding: &[f32],
) -> FusionResult<DescriptionMatchRecord> {
    let expected_key = table.resolve_key(image_name).ok_or_else(|| {
        FusionError::MissingInput(format!("no description found for {image_name}"))
    })?;

    let best = table.best_match(image_embedding)?.ok_or_else(|| {
        FusionError::MissingInput("description table is empty".to_string())
    })?;

    Ok(DescriptionMatchRecord {
        best_match_description: best.description.to_string(),
        similarity_score: round2(best.score),
        best_match_key: best.key.to_string(),
        expected_description_key: expected_key.to_string(),
        matches_expected: best.key == expected_key,
    })
}

/// Summary lines for downstream prompt assembly, one per captioned element.
/// The confidence shown is the OCR confidence of the matched text.
pub fn analysis_lines(images: &[ImageElements]) -> Vec<String> {
    images
        .iter()
        .flat_map(|image| image.ui_elements.iter())
        .filter_map(|element| {
            element.matched_caption.as_ref().map(|caption| match element.text_confidence {
                Some(text_confidence) => format!(
                    "- The screen contains a '{caption}' (Detected: {}, Confidence: {text_confidence:.2})",
                    element.matched_text
                ),
                None => format!(
                    "- The screen contains a '{caption}' (Detected: {})",
                    element.matched_text
                ),
            })
        })
        .collect()
}
