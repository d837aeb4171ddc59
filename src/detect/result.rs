use serde::{Deserialize, Serialize};

use crate::catalog::BoundingBox;

/// A box reported by a detector backend, before catalog matching.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Backend-specific class label, if the model produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RawDetection {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            label: None,
        }
    }
}

/// A detector box assigned to a catalog entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchedProduct {
    pub product_id: String,
    pub matched_box: BoundingBox,
    pub confidence: f32,
    pub iou: f64,
}

/// Outcome of one detection pass. Immutable once produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub frame_sequence: u64,
    /// Frame capture time, milliseconds since the epoch.
    pub captured_at_ms: u64,
    /// Time the pass finished, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Sorted by `product_id`.
    pub matched: Vec<MatchedProduct>,
    /// Detector boxes with no catalog entry, in detector order.
    pub unlabeled: Vec<RawDetection>,
    /// Catalog entries with no detection, sorted.
    pub missing: Vec<String>,
}

impl DetectionResult {
    pub fn matched_product(&self, product_id: &str) -> Option<&MatchedProduct> {
        self.matched.iter().find(|m| m.product_id == product_id)
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}
