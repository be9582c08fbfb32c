//! muster-core: Face analysis and identity classification.
//!
//! SCRFD detection and ArcFace embedding run through ONNX Runtime; identities
//! are assigned by an open-set centroid classifier trained on enrollment
//! images.

pub mod analyzer;
pub mod classifier;
pub mod training;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxFaceAnalyzer};
pub use classifier::{CentroidClassifier, ClassifierError, IdentityClassifier, LabelEncoder};
pub use training::{EncodingSet, TrainingError};
pub use types::{
    is_unknown_label, ClassificationResult, DetectedFace, Embedding, FaceBox, Prediction, UNKNOWN_LABEL,
};
