use serde::{Deserialize, Serialize};

/// Label reported for any face that could not be attributed to an enrolled person.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Returns true when `label` denotes an unrecognized face.
pub fn is_unknown_label(label: &str) -> bool {
    let label = label.trim();
    label.is_empty() || label.eq_ignore_ascii_case(UNKNOWN_LABEL)
}

/// Face location in pixel coordinates, stored as (top, right, bottom, left).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl FaceBox {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self { top, right, bottom, left }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    /// Multiply every coordinate by `factor`, rounding to the nearest pixel.
    ///
    /// Used to map boxes found on a downsampled frame back onto the full frame.
    pub fn scaled(&self, factor: f32) -> Self {
        let s = |v: i32| (v as f32 * factor).round() as i32;
        Self {
            top: s(self.top),
            right: s(self.right),
            bottom: s(self.bottom),
            left: s(self.left),
        }
    }

    /// Grow the box by `padding` pixels on each side, clamped to a `width`×`height` frame.
    pub fn padded(&self, padding: i32, width: u32, height: u32) -> Self {
        Self {
            top: (self.top - padding).max(0),
            right: (self.right + padding).min(width as i32),
            bottom: (self.bottom + padding).min(height as i32),
            left: (self.left - padding).max(0),
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Scale to unit length. Zero vectors are returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}

/// Cosine similarity of two vectors over their common length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

/// One face found by a detection pass, with its identity embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub face_box: FaceBox,
    pub embedding: Embedding,
    /// Detector confidence for the box, in [0, 1].
    pub score: f32,
}

/// Raw classifier output before the acceptance threshold is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

/// Identity decision for a detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    /// Enrolled identity label, or [`UNKNOWN_LABEL`].
    pub label: String,
    pub confidence: f32,
}

impl ClassificationResult {
    pub fn unknown(confidence: f32) -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            confidence,
        }
    }

    /// Apply the acceptance threshold to a raw prediction.
    pub fn from_prediction(prediction: Prediction, threshold: f32) -> Self {
        if prediction.confidence < threshold || is_unknown_label(&prediction.label) {
            Self::unknown(prediction.confidence)
        } else {
            Self {
                label: prediction.label,
                confidence: prediction.confidence,
            }
        }
    }

    pub fn is_unknown(&self) -> bool {
        is_unknown_label(&self.label)
    }
}
