use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::LabelsArgs;
use crate::geometry::ImageSize;
use crate::inputs::{ResolutionTable, group_detections, label_path_for, read_json_file};
use crate::model::{Detection, DetectionRecord};
use crate::util::{ensure_directory, write_lines};

use super::resolution_table;

pub fn run(args: LabelsArgs) -> Result<()> {
    let records: Vec<DetectionRecord> = read_json_file(&args.detections_json).with_context(|| {
        format!(
            "failed to load detections {}",
            args.detections_json.display()
        )
    })?;
    let resolutions = resolution_table(&args.resolution)?;
    ensure_directory(&args.output_dir)?;

    let record_count = records.len();
    let written = write_label_files(records, &resolutions, &args.output_dir)?;

    info!(
        output_dir = %args.output_dir.display(),
        detections = record_count,
        label_files = written,
        "wrote YOLO label files"
    );

    Ok(())
}

fn write_label_files(
    records: Vec<DetectionRecord>,
    resolutions: &ResolutionTable,
    output_dir: &Path,
) -> Result<usize> {
    let mut grouped = group_detections(records).into_iter().collect::<Vec<_>>();
    grouped.sort_by(|left, right| left.0.cmp(&right.0));

    for (image_name, detections) in &grouped {
        let size = resolutions.size_for(image_name);
        let path = label_path_for(output_dir, image_name);
        let lines = detections
            .iter()
            .map(|detection| label_line(detection, size))
            .collect::<Vec<String>>();
        write_lines(&path, &lines)?;
        debug!(image = %image_name, path = %path.display(), lines = lines.len(), "label file written");
    }

    Ok(grouped.len())
}

fn label_line(detection: &Detection, size: ImageSize) -> String {
    let center = detection.bbox.to_center_form(size);
    format!(
        "{} {:.6} {:.6} {:.6} {:.6}",
        detection.class_id, center.x_center, center.y_center, center.width, center.height
    )
}
