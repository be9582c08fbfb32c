//! Open-set centroid classifier over face embeddings.
//!
//! Each enrolled identity is represented by the unit-length mean of its
//! training embeddings. A query is scored against every centroid by cosine
//! similarity, and the scores are turned into probabilities with a softmax
//! that includes one extra "reject" logit, so a single enrolled identity
//! still yields a meaningful confidence.

use crate::types::{cosine_similarity, Embedding, Prediction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const DEFAULT_SCALE: f32 = 10.0;
const DEFAULT_REJECT_SIMILARITY: f32 = 0.5;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}; run `muster train` first")]
    ModelNotFound(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed model file {path}: {source}")]
    Format {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("model has {centroids} centroids but label encoder has {labels} classes")]
    LabelMismatch { centroids: usize, labels: usize },
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("classifier has no classes")]
    Empty,
}

/// Maps an embedding to the most likely enrolled identity.
pub trait IdentityClassifier {
    fn classify(&self, embedding: &Embedding) -> Result<Prediction, ClassifierError>;
}

/// Sorted set of identity labels; a label's class index is its position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Build an encoder from raw (possibly repeated) labels.
    pub fn fit<S: AsRef<str>>(names: &[S]) -> Self {
        let mut classes: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        classes.sort();
        classes.dedup();
        Self { classes }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn transform(&self, label: &str) -> Option<usize> {
        self.classes.binary_search_by(|c| c.as_str().cmp(label)).ok()
    }

    pub fn inverse(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ClassifierError> {
        write_json(path, self)
    }
}

/// Serialized centroid model. Centroid `i` belongs to label-encoder class `i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidModel {
    pub dimension: usize,
    pub centroids: Vec<Vec<f32>>,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default = "default_reject_similarity")]
    pub reject_similarity: f32,
}

fn default_scale() -> f32 {
    DEFAULT_SCALE
}

fn default_reject_similarity() -> f32 {
    DEFAULT_REJECT_SIMILARITY
}

/// Trained model plus its label encoder.
#[derive(Debug, Clone)]
pub struct CentroidClassifier {
    model: CentroidModel,
    labels: LabelEncoder,
}

impl CentroidClassifier {
    /// Pair a model with its label encoder, checking that they agree.
    pub fn new(model: CentroidModel, labels: LabelEncoder) -> Result<Self, ClassifierError> {
        if model.centroids.is_empty() {
            return Err(ClassifierError::Empty);
        }
        if model.centroids.len() != labels.len() {
            return Err(ClassifierError::LabelMismatch {
                centroids: model.centroids.len(),
                labels: labels.len(),
            });
        }
        if let Some(bad) = model.centroids.iter().find(|c| c.len() != model.dimension) {
            return Err(ClassifierError::DimensionMismatch {
                expected: model.dimension,
                actual: bad.len(),
            });
        }
        Ok(Self { model, labels })
    }

    /// Load the model (`recognizer_path`) and label encoder (`le_path`).
    pub fn load(model_path: &Path, labels_path: &Path) -> Result<Self, ClassifierError> {
        let model: CentroidModel = read_json(model_path)?;
        let labels = LabelEncoder::load(labels_path)?;
        tracing::info!(
            path = %model_path.display(),
            classes = labels.len(),
            dimension = model.dimension,
            "loaded centroid classifier"
        );
        Self::new(model, labels)
    }

    pub fn save(&self, model_path: &Path, labels_path: &Path) -> Result<(), ClassifierError> {
        write_json(model_path, &self.model)?;
        self.labels.save(labels_path)
    }

    pub fn labels(&self) -> &LabelEncoder {
        &self.labels
    }

    pub fn model(&self) -> &CentroidModel {
        &self.model
    }

    /// Per-class probabilities (same order as the label encoder) and the reject probability.
    pub fn probabilities(&self, embedding: &Embedding) -> Result<(Vec<f32>, f32), ClassifierError> {
        if embedding.len() != self.model.dimension {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.model.dimension,
                actual: embedding.len(),
            });
        }

        let scale = self.model.scale;
        let logits: Vec<f32> = self
            .model
            .centroids
            .iter()
            .map(|c| scale * cosine_similarity(&embedding.values, c))
            .collect();
        let reject_logit = scale * self.model.reject_similarity;

        // Subtract the max logit for numerical stability.
        let max = logits.iter().copied().fold(reject_logit, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let reject_exp = (reject_logit - max).exp();
        let total: f32 = exps.iter().sum::<f32>() + reject_exp;

        Ok((exps.iter().map(|e| e / total).collect(), reject_exp / total))
    }
}

impl IdentityClassifier for CentroidClassifier {
    fn classify(&self, embedding: &Embedding) -> Result<Prediction, ClassifierError> {
        let (probs, _reject) = self.probabilities(embedding)?;

        let mut best = 0usize;
        for (i, p) in probs.iter().enumerate() {
            if *p > probs[best] {
                best = i;
            }
        }

        let label = self.labels.inverse(best).ok_or(ClassifierError::Empty)?;
        Ok(Prediction {
            label: label.to_string(),
            confidence: probs[best],
        })
    }
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ClassifierError> {
    if !path.exists() {
        return Err(ClassifierError::ModelNotFound(path.display().to_string()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ClassifierError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ClassifierError::Format {
        path: path.display().to_string(),
        source,
    })
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ClassifierError> {
    let io_err = |source| ClassifierError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let body = serde_json::to_string(value).map_err(|source| ClassifierError::Format {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, body).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_class() -> CentroidClassifier {
        let model = CentroidModel {
            dimension: 3,
            centroids: vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
            scale: DEFAULT_SCALE,
            reject_similarity: DEFAULT_REJECT_SIMILARITY,
        };
        CentroidClassifier::new(model, LabelEncoder::fit(&["007", "042"])).unwrap()
    }

    #[test]
    fn test_label_encoder_sorts_and_dedups() {
        let le = LabelEncoder::fit(&["b", "a", "b", "c"]);
        assert_eq!(le.classes(), &["a", "b", "c"]);
        assert_eq!(le.transform("b"), Some(1));
        assert_eq!(le.inverse(2), Some("c"));
        assert_eq!(le.transform("z"), None);
    }

    #[test]
    fn test_classify_picks_nearest_centroid() {
        let clf = two_class();
        let p = clf.classify(&Embedding::new(vec![0.1, 0.95, 0.0])).unwrap();
        assert_eq!(p.label, "042");
        assert!(p.confidence > 0.5);
    }

    #[test]
    fn test_exact_centroid_is_confident() {
        let clf = two_class();
        let p = clf.classify(&Embedding::new(vec![1.0, 0.0, 0.0])).unwrap();
        assert_eq!(p.label, "007");
        assert!(p.confidence > 0.8, "confidence {}", p.confidence);
    }

    #[test]
    fn test_far_query_has_low_confidence() {
        let clf = two_class();
        let p = clf.classify(&Embedding::new(vec![0.0, 0.0, 1.0])).unwrap();
        assert!(p.confidence < 0.1, "confidence {}", p.confidence);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let clf = two_class();
        let (probs, reject) = clf.probabilities(&Embedding::new(vec![0.5, 0.5, 0.2])).unwrap();
        let total: f32 = probs.iter().sum::<f32>() + reject;
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_dimension_mismatch() {
        let clf = two_class();
        let err = clf.classify(&Embedding::new(vec![1.0, 0.0])).unwrap_err();
        assert!(matches!(err, ClassifierError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_label_mismatch_rejected() {
        let model = CentroidModel {
            dimension: 2,
            centroids: vec![vec![1.0, 0.0]],
            scale: DEFAULT_SCALE,
            reject_similarity: DEFAULT_REJECT_SIMILARITY,
        };
        let err = CentroidClassifier::new(model, LabelEncoder::fit(&["a", "b"])).unwrap_err();
        assert!(matches!(err, ClassifierError::LabelMismatch { centroids: 1, labels: 2 }));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("output/recognizer.json");
        let le_path = dir.path().join("output/le.json");
        let clf = two_class();
        clf.save(&model_path, &le_path).unwrap();

        let loaded = CentroidClassifier::load(&model_path, &le_path).unwrap();
        assert_eq!(loaded.labels(), clf.labels());
        let query = Embedding::new(vec![0.9, 0.1, 0.0]);
        assert_eq!(loaded.classify(&query).unwrap(), clf.classify(&query).unwrap());
    }

    #[test]
    fn test_load_missing_model() {
        let err = CentroidClassifier::load(Path::new("/nonexistent/m.json"), Path::new("/nonexistent/l.json"))
            .unwrap_err();
        assert!(matches!(err, ClassifierError::ModelNotFound(_)));
    }
}
