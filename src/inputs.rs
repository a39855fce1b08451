//! Loaders for collaborator outputs. Every payload is parsed into a typed
//! record at this boundary so shape errors surface before matching starts.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::errors::{FusionError, FusionResult};
use crate::geometry::{BBox, CenterBox, ImageSize, QuadMode};
use crate::model::{
    CaptionEntry, CaptionRecord, CropEmbeddingRecord, Detection, DetectionRecord, OcrImageRecord,
    TextSpan,
};
use crate::semantic::{TextEmbedder, is_zero_vector, normalized};

pub const DEFAULT_IMAGE_WIDTH: u32 = 1080;
pub const DEFAULT_IMAGE_HEIGHT: u32 = 1920;
pub const DEFAULT_MIN_TEXT_CONFIDENCE: f32 = 0.80;

pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> FusionResult<T> {
    if !path.exists() {
        return Err(FusionError::MissingInput(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let raw = fs::read(path)?;
    serde_json::from_slice(&raw).map_err(|err| {
        FusionError::MalformedInput(format!("failed to parse {}: {err}", path.display()))
    })
}

/// File name without directories, used as the image identifier everywhere.
pub fn image_basename(image_name: &str) -> &str {
    Path::new(image_name)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(image_name)
}

pub fn label_path_for(labels_dir: &Path, image_name: &str) -> PathBuf {
    let stem = Path::new(image_basename(image_name))
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(image_name);
    labels_dir.join(format!("{stem}.txt"))
}

/// Parses YOLO label lines `class xc yc w h [conf]` into pixel-space detections.
/// Blank lines are ignored; any other malformed line fails the whole file.
pub fn parse_yolo_labels(content: &str, size: ImageSize) -> FusionResult<Vec<Detection>> {
    let mut detections = Vec::new();

    for (line_index, line) in content.lines().enumerate() {
        let line_no = line_index + 1;
        let fields = line.split_whitespace().collect::<Vec<&str>>();
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 5 && fields.len() != 6 {
            return Err(FusionError::MalformedInput(format!(
                "line {line_no}: expected 5 or 6 fields, found {}",
                fields.len()
            )));
        }

        let class_id = fields[0].parse::<u32>().map_err(|err| {
            FusionError::MalformedInput(format!(
                "line {line_no}: invalid class id '{}': {err}",
                fields[0]
            ))
        })?;

        let mut values = [0_f64; 4];
        for (slot, raw) in values.iter_mut().zip(&fields[1..5]) {
            *slot = parse_number(raw, line_no)?;
        }
        let confidence = match fields.get(5) {
            Some(raw) => parse_number(raw, line_no)? as f32,
            None => 1.0,
        };

        let center = CenterBox {
            x_center: values[0],
            y_center: values[1],
            width: values[2],
            height: values[3],
        };
        detections.push(Detection {
            class_id,
            bbox: BBox::from_center_form(center, size),
            confidence,
        });
    }

    Ok(detections)
}

fn parse_number(raw: &str, line_no: usize) -> FusionResult<f64> {
    let value = raw.parse::<f64>().map_err(|err| {
        FusionError::MalformedInput(format!("line {line_no}: invalid number '{raw}': {err}"))
    })?;
    if !value.is_finite() {
        return Err(FusionError::MalformedInput(format!(
            "line {line_no}: non-finite number '{raw}'"
        )));
    }
    Ok(value)
}

pub fn load_yolo_label_file(
    labels_dir: &Path,
    image_name: &str,
    size: ImageSize,
) -> FusionResult<Vec<Detection>> {
    let path = label_path_for(labels_dir, image_name);
    if !path.exists() {
        return Err(FusionError::MissingInput(format!(
            "no label file {} for {image_name}",
            path.display()
        )));
    }

    let content = fs::read_to_string(&path)?;
    parse_yolo_labels(&content, size).map_err(|err| match err {
        FusionError::MalformedInput(detail) => {
            FusionError::MalformedInput(format!("{}: {detail}", path.display()))
        }
        other => other,
    })
}

/// Detections from a pixel-space detector export, grouped by image basename in
/// the order they appear.
pub fn group_detections(records: Vec<DetectionRecord>) -> HashMap<String, Vec<Detection>> {
    let mut grouped = HashMap::<String, Vec<Detection>>::new();
    for record in records {
        grouped
            .entry(image_basename(&record.image_name).to_string())
            .or_default()
            .push(Detection {
                class_id: record.class_id,
                bbox: record.bbox,
                confidence: record.confidence,
            });
    }
    grouped
}

#[derive(Debug, Clone, Default)]
pub struct SpanExtraction {
    pub spans: Vec<TextSpan>,
    pub below_threshold: usize,
    pub rejected: Vec<String>,
}

/// Keeps spans with `confidence > min_confidence` whose quadrilateral reduces
/// to a valid box under `quad_mode`. Rejected quads are reported, not fatal.
pub fn extract_text_spans(
    record: &OcrImageRecord,
    min_confidence: f32,
    quad_mode: QuadMode,
) -> SpanExtraction {
    let mut extraction = SpanExtraction::default();

    for (position, text) in record.texts.iter().enumerate() {
        if text.confidence <= min_confidence {
            extraction.below_threshold += 1;
            continue;
        }
        match BBox::from_quad(&text.bbox, quad_mode) {
            Ok(bbox) => extraction.spans.push(TextSpan {
                text: text.text.clone(),
                bbox,
                confidence: text.confidence,
            }),
            Err(err) => extraction.rejected.push(format!(
                "{} span {position} ('{}'): {err}",
                record.image_name, text.text
            )),
        }
    }

    debug!(
        image = %record.image_name,
        kept = extraction.spans.len(),
        below_threshold = extraction.below_threshold,
        rejected = extraction.rejected.len(),
        "extracted text spans"
    );
    extraction
}

pub fn caption_id(image_name: &str, ordinal: usize) -> String {
    format!("{image_name}#{ordinal}")
}

#[derive(Debug, Clone, Default)]
pub struct CaptionExtraction {
    pub entries: Vec<CaptionEntry>,
    pub rejected: Vec<String>,
    pub locally_embedded: usize,
}

/// Caption corpus entries with unit-norm embeddings. Records that carry a
/// pre-computed vector keep it (normalized); the rest are embedded with
/// `embedder`. Captions whose vector has zero norm, such as text without
/// letters or digits, are left out and reported in `rejected`.
pub fn caption_entries(
    records: Vec<CaptionRecord>,
    embedder: &dyn TextEmbedder,
) -> CaptionExtraction {
    let mut extraction = CaptionExtraction::default();

    for (ordinal, record) in records.into_iter().enumerate() {
        let id = caption_id(&record.image_name, ordinal);
        let embedding = match &record.embedding {
            Some(vector) => normalized(vector),
            None => {
                extraction.locally_embedded += 1;
                embedder.embed(&record.caption)
            }
        };
        if is_zero_vector(&embedding) {
            warn!(caption_id = %id, caption = %record.caption, "skipping caption with zero-norm embedding");
            extraction
                .rejected
                .push(format!("{id}: caption embeds to a zero vector"));
            continue;
        }
        extraction.entries.push(CaptionEntry {
            caption_id: id,
            image_name: record.image_name,
            caption: record.caption,
            embedding,
        });
    }

    extraction
}

/// Crop embeddings keyed by (image basename, detection index).
pub fn index_crop_embeddings(
    records: Vec<CropEmbeddingRecord>,
) -> HashMap<(String, usize), Vec<f32>> {
    records
        .into_iter()
        .map(|record| {
            (
                (
                    image_basename(&record.image_name).to_string(),
                    record.detection_index,
                ),
                record.embedding,
            )
        })
        .collect()
}

/// Per-image resolution metadata with a default for unlisted images.
#[derive(Debug, Clone)]
pub struct ResolutionTable {
    default: ImageSize,
    overrides: HashMap<String, ImageSize>,
}

impl ResolutionTable {
    pub fn new(default: ImageSize) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_overrides(default: ImageSize, overrides: HashMap<String, ImageSize>) -> FusionResult<Self> {
        let mut table = Self::new(default);
        for (image_name, size) in overrides {
            if size.width == 0 || size.height == 0 {
                return Err(FusionError::MalformedInput(format!(
                    "resolution for {image_name} has a zero dimension"
                )));
            }
            table
                .overrides
                .insert(image_basename(&image_name).to_string(), size);
        }
        Ok(table)
    }

    pub fn size_for(&self, image_name: &str) -> ImageSize {
        self.overrides
            .get(image_basename(image_name))
            .copied()
            .unwrap_or(self.default)
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use super::{
        ResolutionTable, caption_entries, extract_text_spans, group_detections, label_path_for,
        load_yolo_label_file, parse_yolo_labels, read_json_file,
    };
    use crate::geometry::{BBox, ImageSize, QuadMode};
    use crate::model::{CaptionRecord, DetectionRecord, OcrImageRecord, OcrTextRecord};
    use crate::retrieval::CaptionCorpus;
    use crate::semantic::{LocalHashEmbedder, dot, resolve_model_config};

    fn ocr_text(text: &str, quad: [[f64; 2]; 4], confidence: f32) -> OcrTextRecord {
        OcrTextRecord {
            text: text.to_string(),
            bbox: quad,
            confidence,
        }
    }

    #[test]
    fn yolo_lines_become_pixel_boxes() {
        let content = "6 0.5 0.5 0.2 0.1\n\n2 0.25 0.75 0.1 0.1 0.87\n";
        let detections = parse_yolo_labels(content, ImageSize::new(1000, 2000)).expect("labels");
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 6);
        assert_eq!(detections[0].bbox, BBox::from_corners(400.0, 900.0, 600.0, 1100.0));
        assert_eq!(detections[0].confidence, 1.0);
        assert!((detections[1].confidence - 0.87).abs() < 1e-6);
    }

    #[test]
    fn malformed_yolo_line_reports_line_number() {
        let err = parse_yolo_labels("1 0.5 0.5 0.1 0.1\n1 0.5 abc 0.1 0.1\n", ImageSize::new(10, 10))
            .expect_err("bad number");
        assert_eq!(err.kind(), "malformed_input");
        assert!(err.to_string().contains("line 2"));

        assert!(parse_yolo_labels("1 0.5 0.5\n", ImageSize::new(10, 10)).is_err());
        assert!(parse_yolo_labels("x 0.5 0.5 0.1 0.1\n", ImageSize::new(10, 10)).is_err());
    }

    #[test]
    fn label_path_uses_image_stem() {
        let dir = std::path::Path::new("labels");
        assert_eq!(label_path_for(dir, "shots/Home.png"), dir.join("Home.txt"));
        assert_eq!(label_path_for(dir, "a.b.jpg"), dir.join("a.b.txt"));
    }

    #[test]
    fn missing_label_file_is_missing_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_yolo_label_file(dir.path(), "absent.jpg", ImageSize::new(10, 10))
            .expect_err("missing label");
        assert_eq!(err.kind(), "missing_input");

        fs::write(dir.path().join("present.txt"), "0 0.5 0.5 1 1\n").expect("write label");
        let detections = load_yolo_label_file(dir.path(), "present.jpg", ImageSize::new(10, 10))
            .expect("label file");
        assert_eq!(detections[0].bbox, BBox::from_corners(0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn span_extraction_filters_confidence_and_bad_quads() {
        let record = OcrImageRecord {
            image_name: "a.jpg".to_string(),
            texts: vec![
                ocr_text("Login", [[0.0, 0.0], [10.0, 0.0], [10.0, 5.0], [0.0, 5.0]], 0.95),
                ocr_text("faint", [[0.0, 0.0], [10.0, 0.0], [10.0, 5.0], [0.0, 5.0]], 0.80),
                ocr_text("flipped", [[10.0, 5.0], [0.0, 5.0], [0.0, 0.0], [10.0, 0.0]], 0.99),
            ],
        };

        let strict = extract_text_spans(&record, 0.80, QuadMode::Corners);
        assert_eq!(strict.spans.len(), 1);
        assert_eq!(strict.spans[0].text, "Login");
        assert_eq!(strict.below_threshold, 1);
        assert_eq!(strict.rejected.len(), 1);

        let envelope = extract_text_spans(&record, 0.80, QuadMode::Envelope);
        assert_eq!(envelope.spans.len(), 2);
        assert!(envelope.rejected.is_empty());
    }

    #[test]
    fn detections_group_by_basename_in_order() {
        let records: Vec<DetectionRecord> = serde_json::from_str(
            r#"[
              {"image": "runs/a.png", "class_id": 1, "confidence": 0.9, "bbox_xyxy": [0, 0, 1, 1]},
              {"image": "runs/b.png", "class_id": 2, "confidence": 0.8, "bbox_xyxy": [0, 0, 2, 2]},
              {"image": "runs/a.png", "class_id": 3, "confidence": 0.7, "bbox_xyxy": [0, 0, 3, 3]}
            ]"#,
        )
        .expect("records");
        let grouped = group_detections(records);
        let a = grouped.get("a.png").expect("a.png");
        assert_eq!(a.iter().map(|d| d.class_id).collect::<Vec<u32>>(), vec![1, 3]);
        assert_eq!(grouped.get("b.png").map(Vec::len), Some(1));
    }

    #[test]
    fn caption_entries_normalize_given_vectors_and_embed_the_rest() {
        let embedder = LocalHashEmbedder::new(resolve_model_config("", Some(2)));
        let records = vec![
            CaptionRecord {
                image_name: "1.jpg".to_string(),
                caption: "blue button".to_string(),
                embedding: Some(vec![3.0, 4.0]),
            },
            CaptionRecord {
                image_name: "2.jpg".to_string(),
                caption: "red icon".to_string(),
                embedding: None,
            },
        ];
        let extraction = caption_entries(records, &embedder);
        let entries = &extraction.entries;
        assert_eq!(entries[0].caption_id, "1.jpg#0");
        assert_eq!(entries[0].embedding, vec![0.6, 0.8]);
        assert!((dot(&entries[1].embedding, &entries[1].embedding) - 1.0).abs() < 1e-5);
        assert_eq!(extraction.locally_embedded, 1);
        assert!(extraction.rejected.is_empty());
    }

    #[test]
    fn captions_without_a_direction_never_reach_the_corpus() {
        let embedder = LocalHashEmbedder::new(resolve_model_config("", Some(2)));
        let records = vec![
            CaptionRecord {
                image_name: "1.jpg".to_string(),
                caption: "blue button".to_string(),
                embedding: Some(vec![1.0, 0.0]),
            },
            CaptionRecord {
                image_name: "2.jpg".to_string(),
                caption: "red icon".to_string(),
                embedding: Some(vec![0.0, 1.0]),
            },
            CaptionRecord {
                image_name: "3.jpg".to_string(),
                caption: String::new(),
                embedding: None,
            },
            CaptionRecord {
                image_name: "4.jpg".to_string(),
                caption: "blank".to_string(),
                embedding: Some(vec![0.0, 0.0]),
            },
        ];

        let extraction = caption_entries(records, &embedder);
        assert_eq!(extraction.entries.len(), 2);
        assert_eq!(extraction.rejected.len(), 2);
        assert!(extraction.rejected[0].starts_with("3.jpg#2"));
        assert!(extraction.rejected[1].starts_with("4.jpg#3"));

        let corpus = CaptionCorpus::build(extraction.entries).expect("corpus");
        let hit = corpus.nearest(&[-0.6, -0.8]).expect("query").expect("hit");
        assert_eq!(hit.caption, "blue button");
    }

    #[test]
    fn resolution_table_prefers_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("dir/tablet.png".to_string(), ImageSize::new(2048, 1536));
        let table = ResolutionTable::with_overrides(ImageSize::new(1080, 1920), overrides)
            .expect("table");
        assert_eq!(table.size_for("tablet.png"), ImageSize::new(2048, 1536));
        assert_eq!(table.size_for("phone.png"), ImageSize::new(1080, 1920));

        let mut zero = HashMap::new();
        zero.insert("bad.png".to_string(), ImageSize::new(0, 10));
        assert!(ResolutionTable::with_overrides(ImageSize::new(1, 1), zero).is_err());
    }

    #[test]
    fn json_loader_distinguishes_missing_and_malformed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = read_json_file::<Vec<OcrImageRecord>>(&dir.path().join("none.json"))
            .expect_err("missing");
        assert_eq!(missing.kind(), "missing_input");

        let path = dir.path().join("ocr.json");
        fs::write(&path, r#"{"not": "a list"}"#).expect("write");
        let malformed = read_json_file::<Vec<OcrImageRecord>>(&path).expect_err("malformed");
        assert_eq!(malformed.kind(), "malformed_input");
    }
}
