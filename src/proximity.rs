//! Assigns each detected widget the OCR span whose box center is closest.
//!
//! Assignment is greedy and independent per detection: one span may serve
//! several detections, and no global matching is attempted.

use crate::geometry::BBox;
use crate::model::{Detection, NO_TEXT_NEARBY, TextSpan, UiElement, widget_class_name};

/// Index and center distance of the nearest span. The first span wins ties.
pub fn nearest_span(bbox: &BBox, spans: &[TextSpan]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;

    for (index, span) in spans.iter().enumerate() {
        let distance = bbox.center_distance(&span.bbox);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((index, distance)),
        }
    }

    best
}

/// Nearest span, unless its text is empty.
pub fn matched_span<'a>(bbox: &BBox, spans: &'a [TextSpan]) -> Option<&'a TextSpan> {
    nearest_span(bbox, spans)
        .map(|(index, _)| &spans[index])
        .filter(|span| !span.text.is_empty())
}

pub fn match_detections(detections: &[Detection], spans: &[TextSpan]) -> Vec<UiElement> {
    detections
        .iter()
        .map(|detection| {
            let span = matched_span(&detection.bbox, spans);
            UiElement {
                class_id: detection.class_id,
                class_name: widget_class_name(detection.class_id).map(str::to_string),
                bbox: detection.bbox,
                confidence: detection.confidence,
                matched_text: span
                    .map(|span| span.text.clone())
                    .unwrap_or_else(|| NO_TEXT_NEARBY.to_string()),
                text_confidence: span.map(|span| span.confidence),
                matched_caption: None,
                similarity_score: None,
            }
        })
        .collect()
}
