//! Dataset encoding and classifier training.
//!
//! `encode_dataset` turns a directory tree of enrollment images
//! (`<root>/<class>/<id>/00000.png`) into an [`EncodingSet`]; `train` fits a
//! [`CentroidClassifier`] on that set.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::classifier::{self, CentroidClassifier, CentroidModel, ClassifierError, LabelEncoder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("no images found under {0}")]
    NoImages(String),
    #[error("no face encodings found; encode faces first")]
    NoEncodings,
    #[error("encodings file not found: {0}; run `muster encode` first")]
    EncodingsNotFound(String),
    #[error("{encodings} encodings but {names} names")]
    CountMismatch { encodings: usize, names: usize },
    #[error("encoding {index} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("failed to read dataset {path}: {source}")]
    Dataset {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("analyzer: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Known embeddings and the identity each one belongs to (parallel vectors).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodingSet {
    pub encodings: Vec<Vec<f32>>,
    pub names: Vec<String>,
}

impl EncodingSet {
    pub fn push(&mut self, name: &str, encoding: Vec<f32>) {
        self.encodings.push(encoding);
        self.names.push(name.to_string());
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self, TrainingError> {
        classifier::read_json(path).map_err(|e| match e {
            ClassifierError::ModelNotFound(path) => TrainingError::EncodingsNotFound(path),
            other => other.into(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        Ok(classifier::write_json(path, self)?)
    }
}

/// Summary of an encoding run.
#[derive(Debug, Clone, Default)]
pub struct EncodeReport {
    pub images: usize,
    pub skipped: usize,
    pub encodings: usize,
}

/// Recursively list image files under `root`, sorted for a stable encoding order.
pub fn list_images(root: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut out = Vec::new();
    collect_images(root, &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), TrainingError> {
    let entries = std::fs::read_dir(dir).map_err(|source| TrainingError::Dataset {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let path = entry
            .map_err(|source| TrainingError::Dataset {
                path: dir.display().to_string(),
                source,
            })?
            .path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if is_image(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Identity for an image: the name of the directory that holds it.
pub fn identity_for(path: &Path) -> Option<String> {
    path.parent()?.file_name()?.to_str().map(str::to_string)
}

/// Encode every face in every image under `root`.
///
/// `progress` is called with (done, total) after each image.
pub fn encode_dataset(
    root: &Path,
    analyzer: &mut dyn FaceAnalyzer,
    mut progress: impl FnMut(usize, usize),
) -> Result<(EncodingSet, EncodeReport), TrainingError> {
    let images = list_images(root)?;
    if images.is_empty() {
        return Err(TrainingError::NoImages(root.display().to_string()));
    }

    let mut set = EncodingSet::default();
    let mut report = EncodeReport {
        images: images.len(),
        ..Default::default()
    };

    for (i, path) in images.iter().enumerate() {
        progress(i + 1, images.len());

        let Some(name) = identity_for(path) else {
            report.skipped += 1;
            continue;
        };

        let rgb = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable image, skipping");
                report.skipped += 1;
                continue;
            }
        };

        let faces = analyzer.analyze(rgb.as_raw(), rgb.width(), rgb.height())?;
        if faces.is_empty() {
            tracing::warn!(path = %path.display(), "no face found, skipping");
            report.skipped += 1;
            continue;
        }

        for face in faces {
            set.push(&name, face.embedding.values);
        }
    }

    report.encodings = set.len();
    tracing::info!(
        images = report.images,
        skipped = report.skipped,
        encodings = report.encodings,
        "dataset encoded"
    );
    Ok((set, report))
}

/// Fit a centroid classifier: one unit-length mean vector per identity.
pub fn train(set: &EncodingSet) -> Result<CentroidClassifier, TrainingError> {
    if set.encodings.is_empty() {
        return Err(TrainingError::NoEncodings);
    }
    if set.encodings.len() != set.names.len() {
        return Err(TrainingError::CountMismatch {
            encodings: set.encodings.len(),
            names: set.names.len(),
        });
    }

    let dimension = set.encodings[0].len();
    if let Some((index, bad)) = set
        .encodings
        .iter()
        .enumerate()
        .find(|(_, e)| e.len() != dimension)
    {
        return Err(TrainingError::DimensionMismatch {
            index,
            expected: dimension,
            actual: bad.len(),
        });
    }

    let labels = LabelEncoder::fit(&set.names);
    let mut sums = vec![vec![0.0f32; dimension]; labels.len()];

    for (encoding, name) in set.encodings.iter().zip(set.names.iter()) {
        let Some(class) = labels.transform(name) else {
            continue;
        };
        let norm: f32 = encoding.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm = if norm > 0.0 { norm } else { 1.0 };
        for (acc, v) in sums[class].iter_mut().zip(encoding.iter()) {
            *acc += v / norm;
        }
    }

    let centroids = sums
        .into_iter()
        .map(|c| crate::types::Embedding::new(c).normalized().values)
        .collect();

    tracing::info!(classes = labels.len(), samples = set.len(), dimension, "classifier trained");

    Ok(CentroidClassifier::new(
        CentroidModel {
            dimension,
            centroids,
            scale: 10.0,
            reject_similarity: 0.5,
        },
        labels,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::IdentityClassifier;
    use crate::types::{DetectedFace, Embedding, FaceBox};

    fn fixture() -> EncodingSet {
        let mut set = EncodingSet::default();
        set.push("007", vec![1.0, 0.1, 0.0]);
        set.push("007", vec![0.9, 0.0, 0.1]);
        set.push("042", vec![0.0, 1.0, 0.1]);
        set.push("042", vec![0.1, 0.9, 0.0]);
        set.push("113", vec![0.0, 0.1, 1.0]);
        set
    }

    #[test]
    fn test_train_rejects_empty() {
        assert!(matches!(train(&EncodingSet::default()), Err(TrainingError::NoEncodings)));
    }

    #[test]
    fn test_train_rejects_ragged_vectors() {
        let mut set = fixture();
        set.push("999", vec![1.0]);
        assert!(matches!(
            train(&set),
            Err(TrainingError::DimensionMismatch { index: 5, expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn test_train_rejects_count_mismatch() {
        let mut set = fixture();
        set.names.pop();
        assert!(matches!(train(&set), Err(TrainingError::CountMismatch { .. })));
    }

    #[test]
    fn test_training_samples_classify_to_own_label_deterministically() {
        let set = fixture();
        let clf = train(&set).unwrap();
        for (encoding, name) in set.encodings.iter().zip(set.names.iter()) {
            let query = Embedding::new(encoding.clone());
            let first = clf.classify(&query).unwrap();
            assert_eq!(&first.label, name);
            for _ in 0..10 {
                assert_eq!(clf.classify(&query).unwrap(), first);
            }
        }
    }

    #[test]
    fn test_encoding_set_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output/encodings.json");
        fixture().save(&path).unwrap();
        let loaded = EncodingSet::load(&path).unwrap();
        assert_eq!(loaded.names, fixture().names);
    }

    #[test]
    fn test_missing_encodings_points_at_encode() {
        let dir = tempfile::tempdir().unwrap();
        let err = EncodingSet::load(&dir.path().join("encodings.json")).unwrap_err();
        assert!(matches!(err, TrainingError::EncodingsNotFound(_)));
        assert!(err.to_string().contains("muster encode"));
    }

    #[test]
    fn test_identity_for_uses_parent_dir() {
        let p = Path::new("dataset/PROJECT/007/00001.png");
        assert_eq!(identity_for(p).as_deref(), Some("007"));
    }

    struct OneFace;

    impl FaceAnalyzer for OneFace {
        fn analyze(&mut self, _frame: &[u8], width: u32, _height: u32) -> Result<Vec<DetectedFace>, AnalyzerError> {
            // Narrow images carry no face.
            if width < 4 {
                return Ok(vec![]);
            }
            Ok(vec![DetectedFace {
                face_box: FaceBox::new(0, 4, 4, 0),
                embedding: Embedding::new(vec![width as f32, 1.0]),
                score: 0.9,
            }])
        }
    }

    #[test]
    fn test_encode_dataset_walks_identity_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dataset");
        for (id, w) in [("007", 8u32), ("042", 6), ("042", 2)] {
            let d = root.join("PROJECT").join(id);
            std::fs::create_dir_all(&d).unwrap();
            let n = std::fs::read_dir(&d).unwrap().count();
            image::RgbImage::new(w, 4)
                .save(d.join(format!("{n:05}.png")))
                .unwrap();
        }
        std::fs::write(root.join("notes.txt"), "ignored").unwrap();

        let mut calls = 0;
        let (set, report) = encode_dataset(&root, &mut OneFace, |_, _| calls += 1).unwrap();
        assert_eq!(calls, 3);
        assert_eq!(report.images, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(set.names, vec!["007".to_string(), "042".to_string()]);
    }

    #[test]
    fn test_encode_dataset_empty_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = encode_dataset(dir.path(), &mut OneFace, |_, _| {}).unwrap_err();
        assert!(matches!(err, TrainingError::NoImages(_)));
    }
}
