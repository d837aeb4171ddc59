//! Assignment of detector boxes to catalog regions.
//!
//! Every (detection, entry) pair whose IoU is strictly above the threshold is
//! a candidate. Candidates are ranked by IoU, then detection confidence, then
//! `product_id`, then detection index, and assigned greedily one-to-one. The
//! ranking is a total order, so the same input always yields the same
//! matched/unlabeled/missing partition.

use std::cmp::Ordering;

use crate::catalog::Catalog;

use super::result::{DetectionResult, MatchedProduct, RawDetection};

pub const DEFAULT_IOU_THRESHOLD: f64 = 0.5;

struct Candidate<'a> {
    detection: usize,
    product_id: &'a str,
    iou: f64,
    confidence: f32,
}

fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.iou
        .total_cmp(&a.iou)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.product_id.cmp(b.product_id))
        .then_with(|| a.detection.cmp(&b.detection))
}

/// Partition `detections` against `catalog`. Pure: neither input is modified.
pub fn match_detections(
    detections: &[RawDetection],
    catalog: &Catalog,
    iou_threshold: f64,
) -> DetectionResult {
    let mut candidates = Vec::new();
    for (index, detection) in detections.iter().enumerate() {
        if !detection.bbox.is_valid() {
            continue;
        }
        for entry in catalog.entries() {
            let iou = detection.bbox.iou(&entry.bounding_box);
            if iou > iou_threshold {
                candidates.push(Candidate {
                    detection: index,
                    product_id: &entry.product_id,
                    iou,
                    confidence: sanitize_confidence(detection.confidence),
                });
            }
        }
    }
    candidates.sort_by(rank);

    let mut detection_taken = vec![false; detections.len()];
    let mut matched: Vec<MatchedProduct> = Vec::new();
    for cand in candidates {
        if detection_taken[cand.detection] || matched.iter().any(|m| m.product_id == cand.product_id) {
            continue;
        }
        detection_taken[cand.detection] = true;
        matched.push(MatchedProduct {
            product_id: cand.product_id.to_string(),
            matched_box: detections[cand.detection].bbox,
            confidence: cand.confidence,
            iou: cand.iou,
        });
    }
    matched.sort_by(|a, b| a.product_id.cmp(&b.product_id));

    let unlabeled = detections
        .iter()
        .zip(&detection_taken)
        .filter(|(_, taken)| !**taken)
        .map(|(d, _)| d.clone())
        .collect();

    let missing = catalog
        .entries()
        .filter(|entry| !matched.iter().any(|m| m.product_id == entry.product_id))
        .map(|entry| entry.product_id.clone())
        .collect();

    DetectionResult {
        matched,
        unlabeled,
        missing,
        ..DetectionResult::default()
    }
}

fn sanitize_confidence(confidence: f32) -> f32 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BoundingBox, CatalogEntry};

    fn entry(id: &str, b: [i32; 4]) -> CatalogEntry {
        CatalogEntry {
            product_id: id.to_string(),
            display_name: id.to_string(),
            bounding_box: BoundingBox::new(b[0], b[1], b[2], b[3]),
        }
    }

    fn det(b: [i32; 4], confidence: f32) -> RawDetection {
        RawDetection::new(BoundingBox::new(b[0], b[1], b[2], b[3]), confidence)
    }

    #[test]
    fn shampoo_box_is_matched_with_detector_confidence() {
        let catalog = Catalog::from_entries(vec![entry("shampoo", [10, 10, 50, 50])]).unwrap();
        let result = match_detections(&[det([12, 11, 48, 49], 0.9)], &catalog, 0.5);

        assert_eq!(result.matched.len(), 1);
        let m = &result.matched[0];
        assert_eq!(m.product_id, "shampoo");
        assert_eq!(m.confidence, 0.9);
        assert_eq!(m.matched_box, BoundingBox::new(12, 11, 48, 49));
        assert!(result.unlabeled.is_empty());
        assert!(result.missing.is_empty());
    }

    #[test]
    fn non_overlapping_box_is_unlabeled_and_entry_missing() {
        let catalog = Catalog::from_entries(vec![entry("shampoo", [10, 10, 50, 50])]).unwrap();
        let result = match_detections(&[det([200, 200, 240, 240], 0.8)], &catalog, 0.0);

        assert!(result.matched.is_empty());
        assert_eq!(result.unlabeled, vec![det([200, 200, 240, 240], 0.8)]);
        assert_eq!(result.missing, vec!["shampoo".to_string()]);
    }

    #[test]
    fn detection_goes_to_the_entry_with_highest_overlap() {
        let catalog = Catalog::from_entries(vec![
            entry("left", [0, 0, 10, 10]),
            entry("right", [6, 0, 16, 10]),
        ])
        .unwrap();
        let result = match_detections(&[det([5, 0, 15, 10], 0.7)], &catalog, 0.1);
        assert_eq!(result.matched[0].product_id, "right");
        assert_eq!(result.missing, vec!["left".to_string()]);
    }

    #[test]
    fn competing_detections_resolved_by_confidence() {
        let catalog = Catalog::from_entries(vec![entry("cola", [0, 0, 10, 10])]).unwrap();
        let low = det([0, 0, 10, 10], 0.4);
        let high = det([0, 0, 10, 10], 0.95);
        let result = match_detections(&[low.clone(), high], &catalog, 0.5);

        assert_eq!(result.matched[0].confidence, 0.95);
        assert_eq!(result.unlabeled, vec![low]);
    }

    #[test]
    fn equal_overlap_resolved_by_lowest_product_id() {
        let catalog = Catalog::from_entries(vec![
            entry("b_item", [0, 0, 10, 10]),
            entry("a_item", [0, 0, 10, 10]),
        ])
        .unwrap();
        let result = match_detections(&[det([0, 0, 10, 10], 0.5)], &catalog, 0.5);
        assert_eq!(result.matched[0].product_id, "a_item");
        assert_eq!(result.missing, vec!["b_item".to_string()]);
    }

    #[test]
    fn partition_is_deterministic_and_complete() {
        let catalog = Catalog::from_entries(
            (0..6)
                .map(|i| entry(&format!("p{i}"), [i * 20, 0, i * 20 + 15, 15]))
                .collect(),
        )
        .unwrap();
        let detections: Vec<_> = (0..9)
            .map(|i| det([i * 13, 1, i * 13 + 14, 16], 0.1 * (i % 4) as f32 + 0.3))
            .collect();

        let first = match_detections(&detections, &catalog, 0.3);
        for _ in 0..10 {
            assert_eq!(match_detections(&detections, &catalog, 0.3), first);
        }
        assert_eq!(first.matched.len() + first.unlabeled.len(), detections.len());
        assert_eq!(first.matched.len() + first.missing.len(), catalog.len());
    }

    #[test]
    fn threshold_is_strict() {
        let catalog = Catalog::from_entries(vec![entry("a", [0, 0, 10, 10])]).unwrap();
        // IoU of these boxes is exactly 0.5.
        let d = det([0, 0, 10, 5], 0.9);
        assert!(match_detections(&[d.clone()], &catalog, 0.5).matched.is_empty());
        assert_eq!(match_detections(&[d], &catalog, 0.49).matched.len(), 1);
    }
}
