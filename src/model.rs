use serde::{Deserialize, Serialize};

use crate::geometry::{BBox, Quad};

pub const NO_TEXT_NEARBY: &str = "No text nearby";

/// Detector class ids, indexed by id.
pub const WIDGET_CLASSES: &[&str] = &[
    "BackgroundImage",
    "CheckedTextView",
    "Icon",
    "EditText",
    "Image",
    "Text",
    "Text Button",
    "Drawer",
    "PageIndicator",
    "UpperTaskBar",
    "Modal",
    "Switch",
    "Spinner",
    "Card",
    "Multi-tab",
    "Toolbar",
    "Bottom-Navigation",
    "Remember",
    "TextButton",
];

pub fn widget_class_name(class_id: u32) -> Option<&'static str> {
    WIDGET_CLASSES.get(class_id as usize).copied()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub bbox: BBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub bbox: BBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionEntry {
    pub caption_id: String,
    pub image_name: String,
    pub caption: String,
    /// Unit L2 norm.
    pub embedding: Vec<f32>,
}

/// One fused UI element: a detection plus the text and caption matched to it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UiElement {
    pub class_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub bbox: BBox,
    pub confidence: f32,
    pub matched_text: String,
    /// OCR confidence of the span behind `matched_text`; absent when no text
    /// was matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageElements {
    pub image_name: String,
    pub ui_elements: Vec<UiElement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DescriptionMatchRecord {
    pub best_match_description: String,
    pub similarity_score: f64,
    pub best_match_key: String,
    pub expected_description_key: String,
    pub matches_expected: bool,
}

// Boundary schemas. Shapes are validated by serde on load.

#[derive(Debug, Clone, Deserialize)]
pub struct OcrImageRecord {
    pub image_name: String,
    #[serde(default)]
    pub texts: Vec<OcrTextRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrTextRecord {
    pub text: String,
    pub bbox: Quad,
    pub confidence: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionRecord {
    #[serde(alias = "image")]
    pub image_name: String,
    pub class_id: u32,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(alias = "bbox_xyxy")]
    pub bbox: BBox,
}

fn default_confidence() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptionRecord {
    #[serde(default)]
    pub image_name: String,
    pub caption: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DescriptionValue {
    Text(String),
    Embedded {
        description: String,
        embedding: Vec<f32>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CropEmbeddingRecord {
    pub image_name: String,
    pub detection_index: usize,
    pub embedding: Vec<f32>,
}

// Run manifests.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedImage {
    pub image_name: String,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuseRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub detection_source: String,
    pub ocr_path: String,
    pub output_path: String,
    pub caption_source: Option<String>,
    pub caption_count: usize,
    pub min_text_confidence: f32,
    pub quad_mode: String,
    pub jobs: usize,
    pub images_total: usize,
    pub images_fused: usize,
    pub images_skipped: usize,
    pub elements_total: usize,
    pub elements_without_text: usize,
    pub elements_captioned: usize,
    pub dropped_text_spans: usize,
    pub duration_ms: u128,
    pub status: String,
    pub skipped: Vec<SkippedImage>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub descriptions_path: String,
    pub image_embeddings_path: String,
    pub output_path: String,
    pub model_id: String,
    pub embedding_dim: usize,
    pub max_tokens: usize,
    pub description_count: usize,
    pub images_total: usize,
    pub images_matched: usize,
    pub images_skipped: usize,
    pub matches_expected: usize,
    pub top1_agreement: Option<f64>,
    pub duration_ms: u128,
    pub status: String,
    pub skipped: Vec<SkippedImage>,
    pub warnings: Vec<String>,
}
