pub mod describe;
pub mod embed;
pub mod fuse;
pub mod labels;
pub mod status;

use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::{ModelArgs, ResolutionArgs};
use crate::geometry::ImageSize;
use crate::inputs::{ResolutionTable, read_json_file};
use crate::semantic::{LocalHashEmbedder, SemanticModelConfig, resolve_model_config};

pub(crate) fn resolution_table(args: &ResolutionArgs) -> Result<ResolutionTable> {
    let default = ImageSize::new(args.image_width, args.image_height);
    if default.width == 0 || default.height == 0 {
        anyhow::bail!(
            "image resolution must be non-zero, got {}x{}",
            default.width,
            default.height
        );
    }

    let Some(path) = args.resolutions.as_ref() else {
        return Ok(ResolutionTable::new(default));
    };

    let overrides: HashMap<String, ImageSize> = read_json_file(path)
        .with_context(|| format!("failed to load resolution table {}", path.display()))?;
    let table = ResolutionTable::with_overrides(default, overrides)?;
    info!(
        path = %path.display(),
        overrides = table.override_count(),
        "loaded per-image resolutions"
    );
    Ok(table)
}

pub(crate) fn model_config(args: &ModelArgs) -> SemanticModelConfig {
    resolve_model_config(&args.model_id, args.embedding_dim)
}

pub(crate) fn text_embedder(args: &ModelArgs) -> LocalHashEmbedder {
    LocalHashEmbedder::new(model_config(args))
}
