// THEORY:
// The `suppressor` is a stateless utility of the detection layer. Text detectors
// tend to report the same line several times with slightly different boxes; the
// suppressor keeps the most confident report of each and drops the echoes.
//
// The algorithm is plain greedy non-max suppression: sort by confidence, walk the
// list, accept a box only when it overlaps every accepted box by less than the
// IoU threshold. Detector output is small (tens of boxes per frame) so the
// quadratic walk needs no spatial index.
//
// Degenerate boxes must be removed before suppression with `retain_min_area`.

use crate::core_modules::candidate::Candidate;
use crate::core_modules::geometry::{CoordinateSpace, Rect};

/// Greedy non-max suppression.
///
/// Candidates are ordered by confidence, highest first. The sort is stable, so
/// equally confident candidates keep their input order. At most `max_boxes`
/// candidates are returned.
pub fn suppress<S: CoordinateSpace>(
    mut candidates: Vec<Candidate<S>>,
    iou_threshold: f64,
    max_boxes: usize,
) -> Vec<Candidate<S>> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate<S>> = Vec::with_capacity(max_boxes.min(candidates.len()));
    'outer: for candidate in candidates {
        if kept.len() >= max_boxes {
            break;
        }
        for accepted in &kept {
            if candidate.rect.iou(&accepted.rect) >= iou_threshold {
                continue 'outer;
            }
        }
        kept.push(candidate);
    }
    kept
}

/// Drops candidates whose bounding frame is smaller than `min_area` (or has no area at all).
pub fn retain_min_area<S: CoordinateSpace>(candidates: &mut Vec<Candidate<S>>, min_area: f64) {
    candidates.retain(|c| {
        let area = c.bounds().area();
        area > 0.0 && area >= min_area
    });
}

/// Drops candidates whose centroid falls outside `region`.
pub fn retain_in_region<S: CoordinateSpace>(candidates: &mut Vec<Candidate<S>>, region: &Rect<S>) {
    candidates.retain(|c| region.contains_point(c.rect.centroid()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::geometry::DetectorNormalized;

    fn boxed(x: f64, y: f64, w: f64, h: f64, confidence: f32) -> Candidate<DetectorNormalized> {
        Candidate::from_rect(Rect::new(x, y, w, h), confidence)
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(suppress::<DetectorNormalized>(Vec::new(), 0.5, 10).is_empty());
    }

    #[test]
    fn identical_boxes_collapse_to_most_confident() {
        let candidates = vec![
            boxed(0.1, 0.1, 0.3, 0.1, 0.4).with_text("low"),
            boxed(0.1, 0.1, 0.3, 0.1, 0.9).with_text("high"),
            boxed(0.1, 0.1, 0.3, 0.1, 0.6).with_text("mid"),
            boxed(0.1, 0.1, 0.3, 0.1, 0.2).with_text("lowest"),
        ];
        let kept = suppress(candidates, 0.5, 10);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].text.as_deref(), Some("high"));
    }

    #[test]
    fn ties_keep_input_order() {
        let candidates = vec![
            boxed(0.1, 0.1, 0.3, 0.1, 0.5).with_text("first"),
            boxed(0.1, 0.1, 0.3, 0.1, 0.5).with_text("second"),
        ];
        let kept = suppress(candidates, 0.5, 10);
        assert_eq!(kept[0].text.as_deref(), Some("first"));
    }

    #[test]
    fn disjoint_boxes_survive_in_confidence_order() {
        let candidates = vec![
            boxed(0.0, 0.0, 0.1, 0.1, 0.3),
            boxed(0.5, 0.5, 0.1, 0.1, 0.8),
            boxed(0.0, 0.5, 0.1, 0.1, 0.5),
        ];
        let kept = suppress(candidates, 0.5, 10);
        let confidences: Vec<f32> = kept.iter().map(|c| c.confidence).collect();
        assert_eq!(confidences, vec![0.8, 0.5, 0.3]);
    }

    #[test]
    fn overlap_below_threshold_is_kept() {
        // IoU of these two is 1/3.
        let candidates = vec![boxed(0.0, 0.0, 0.2, 0.2, 0.9), boxed(0.1, 0.0, 0.2, 0.2, 0.8)];
        assert_eq!(suppress(candidates.clone(), 0.5, 10).len(), 2);
        assert_eq!(suppress(candidates, 0.3, 10).len(), 1);
    }

    #[test]
    fn stops_at_max_boxes() {
        let candidates: Vec<_> = (0..10)
            .map(|i| boxed(i as f64 * 0.1, 0.0, 0.05, 0.05, i as f32))
            .collect();
        let kept = suppress(candidates, 0.5, 3);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 9.0);
        assert!(suppress(vec![boxed(0.0, 0.0, 0.1, 0.1, 1.0)], 0.5, 0).is_empty());
    }

    #[test]
    fn min_area_filter_removes_degenerate_boxes() {
        let mut candidates = vec![
            boxed(0.0, 0.0, 0.0, 0.1, 1.0),
            boxed(0.0, 0.0, 0.01, 0.01, 1.0),
            boxed(0.0, 0.0, 0.2, 0.2, 1.0),
        ];
        retain_min_area(&mut candidates, 0.001);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].bounds().width, 0.2);
    }

    #[test]
    fn region_filter_uses_centroid() {
        let mut candidates = vec![boxed(0.1, 0.1, 0.2, 0.2, 1.0), boxed(0.7, 0.7, 0.2, 0.2, 1.0)];
        retain_in_region(&mut candidates, &Rect::new(0.0, 0.0, 0.5, 0.5));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].bounds().x, 0.1);
    }
}
