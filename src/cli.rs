use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::geometry::QuadMode;
use crate::inputs::{DEFAULT_IMAGE_HEIGHT, DEFAULT_IMAGE_WIDTH, DEFAULT_MIN_TEXT_CONFIDENCE};
use crate::retrieval::DEFAULT_MAX_TOKENS;
use crate::semantic::DEFAULT_MODEL_ID;

#[derive(Parser, Debug)]
#[command(
    name = "screenfuse",
    version,
    about = "Fuse widget detections, OCR text and caption embeddings into per-screen UI element records"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Match OCR text (and optionally corpus captions) to detected widgets.
    Fuse(FuseArgs),
    /// Pick the best description for each screenshot embedding.
    Describe(DescribeArgs),
    /// Embed a caption corpus into the caption store.
    Embed(EmbedArgs),
    /// Convert pixel-space detections into YOLO label files.
    Labels(LabelsArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum QuadModeArg {
    Corners,
    Envelope,
}

impl QuadModeArg {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Corners => "corners",
            Self::Envelope => "envelope",
        }
    }
}

impl From<QuadModeArg> for QuadMode {
    fn from(value: QuadModeArg) -> Self {
        match value {
            QuadModeArg::Corners => QuadMode::Corners,
            QuadModeArg::Envelope => QuadMode::Envelope,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EmbedRefreshMode {
    Full,
    MissingOrStale,
}

impl EmbedRefreshMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::MissingOrStale => "missing-or-stale",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ResolutionArgs {
    #[arg(long, default_value_t = DEFAULT_IMAGE_WIDTH)]
    pub image_width: u32,

    #[arg(long, default_value_t = DEFAULT_IMAGE_HEIGHT)]
    pub image_height: u32,

    /// JSON object mapping image name to `[width, height]`.
    #[arg(long)]
    pub resolutions: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    #[arg(long)]
    pub embedding_dim: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct FuseArgs {
    #[arg(long, default_value = ".cache/screenfuse")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub ocr_json_path: PathBuf,

    #[arg(long, required_unless_present = "detections_json", conflicts_with = "detections_json")]
    pub labels_dir: Option<PathBuf>,

    #[arg(long)]
    pub detections_json: Option<PathBuf>,

    #[arg(long)]
    pub output_json_path: PathBuf,

    #[arg(long)]
    pub analysis_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[command(flatten)]
    pub resolution: ResolutionArgs,

    #[arg(long, default_value_t = DEFAULT_MIN_TEXT_CONFIDENCE)]
    pub min_text_confidence: f32,

    #[arg(long, value_enum, default_value_t = QuadModeArg::Corners)]
    pub quad_mode: QuadModeArg,

    /// Caption corpus JSON; captions without an embedding are embedded locally.
    #[arg(long, conflicts_with = "caption_store")]
    pub captions: Option<PathBuf>,

    /// SQLite caption store written by `embed`.
    #[arg(long)]
    pub caption_store: Option<PathBuf>,

    #[arg(long)]
    pub crop_embeddings: Option<PathBuf>,

    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long, default_value_t = 1)]
    pub jobs: usize,
}

#[derive(Args, Debug, Clone)]
pub struct DescribeArgs {
    #[arg(long, default_value = ".cache/screenfuse")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub descriptions: PathBuf,

    #[arg(long)]
    pub image_embeddings: PathBuf,

    #[arg(long)]
    pub output_json_path: PathBuf,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: usize,

    #[arg(long, default_value_t = 1)]
    pub jobs: usize,
}

#[derive(Args, Debug, Clone)]
pub struct EmbedArgs {
    #[arg(long, default_value = ".cache/screenfuse")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub captions: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long, value_enum, default_value_t = EmbedRefreshMode::MissingOrStale)]
    pub refresh_mode: EmbedRefreshMode,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    #[arg(long)]
    pub semantic_model_lock_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct LabelsArgs {
    #[arg(long)]
    pub detections_json: PathBuf,

    #[arg(long)]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub resolution: ResolutionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/screenfuse")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands, QuadModeArg};

    #[test]
    fn fuse_defaults_match_collaborator_conventions() {
        let cli = Cli::try_parse_from([
            "screenfuse",
            "fuse",
            "--ocr-json-path",
            "ocr.json",
            "--labels-dir",
            "labels",
            "--output-json-path",
            "out.json",
        ])
        .expect("fuse args");

        let Commands::Fuse(args) = cli.command else {
            panic!("expected fuse command");
        };
        assert_eq!(args.resolution.image_width, 1080);
        assert_eq!(args.resolution.image_height, 1920);
        assert!((args.min_text_confidence - 0.80).abs() < f32::EPSILON);
        assert_eq!(args.quad_mode, QuadModeArg::Corners);
        assert_eq!(args.jobs, 1);
    }

    #[test]
    fn fuse_requires_exactly_one_detection_source() {
        let neither = Cli::try_parse_from([
            "screenfuse",
            "fuse",
            "--ocr-json-path",
            "ocr.json",
            "--output-json-path",
            "out.json",
        ]);
        assert!(neither.is_err());

        let both = Cli::try_parse_from([
            "screenfuse",
            "fuse",
            "--ocr-json-path",
            "ocr.json",
            "--labels-dir",
            "labels",
            "--detections-json",
            "det.json",
            "--output-json-path",
            "out.json",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn describe_defaults_to_512_token_budget() {
        let cli = Cli::try_parse_from([
            "screenfuse",
            "describe",
            "--descriptions",
            "ui.json",
            "--image-embeddings",
            "img.json",
            "--output-json-path",
            "out.json",
        ])
        .expect("describe args");
        let Commands::Describe(args) = cli.command else {
            panic!("expected describe command");
        };
        assert_eq!(args.max_tokens, 512);
        assert_eq!(args.model.model_id, "ui-caption-local-v1");
    }
}
