//! Face detection (SCRFD) and embedding (ArcFace) via ONNX Runtime.
//!
//! Frames are packed RGB (`width * height * 3` bytes). Detection runs on a
//! letterboxed 640×640 input; each surviving box is cropped square, resized
//! to 112×112 and embedded into an L2-normalized 512-d vector.

use crate::types::{DetectedFace, Embedding, FaceBox};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("model file not found: {0}; download from insightface and place in the model dir")]
    ModelNotFound(String),
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in an RGB frame and embeds each one.
pub trait FaceAnalyzer {
    fn analyze(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<DetectedFace>, AnalyzerError>;
}

/// Coordinate mapping from letterboxed model space back to the frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn for_frame(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Box candidate in frame coordinates, before NMS.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// SCRFD detector + ArcFace embedder pair.
pub struct OnnxFaceAnalyzer {
    detector: Session,
    embedder: Session,
    /// (score, bbox) output indices for strides 8, 16, 32.
    stride_outputs: [(usize, usize); 3],
}

impl OnnxFaceAnalyzer {
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self, AnalyzerError> {
        for path in [detector_path, embedder_path] {
            if !path.exists() {
                return Err(AnalyzerError::ModelNotFound(path.display().to_string()));
            }
        }

        let detector = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(detector_path)?;
        let embedder = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(embedder_path)?;

        let names: Vec<String> = detector.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(AnalyzerError::InferenceFailed(format!(
                "SCRFD model requires score+bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let stride_outputs = stride_output_indices(&names);

        tracing::info!(
            detector = %detector_path.display(),
            embedder = %embedder_path.display(),
            ?stride_outputs,
            "face models loaded"
        );

        Ok(Self {
            detector,
            embedder,
            stride_outputs,
        })
    }

    fn detect(&mut self, img: &RgbImage) -> Result<Vec<(FaceBox, f32)>, AnalyzerError> {
        let letterbox = Letterbox::for_frame(img.width(), img.height());
        let input = letterbox_tensor(img, &letterbox);
        let stride_outputs = self.stride_outputs;

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| AnalyzerError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| AnalyzerError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }

        let (w, h) = (img.width() as f32, img.height() as f32);
        Ok(nms(candidates, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .map(|c| {
                let face_box = FaceBox::new(
                    c.y1.clamp(0.0, h).round() as i32,
                    c.x2.clamp(0.0, w).round() as i32,
                    c.y2.clamp(0.0, h).round() as i32,
                    c.x1.clamp(0.0, w).round() as i32,
                );
                (face_box, c.score)
            })
            .filter(|(b, _)| b.width() > 0 && b.height() > 0)
            .collect())
    }

    fn embed(&mut self, img: &RgbImage, face: &FaceBox) -> Result<Embedding, AnalyzerError> {
        let crop = square_crop(img, face);
        let input = chw_tensor(&crop, ARCFACE_MEAN, ARCFACE_STD);

        let outputs = self
            .embedder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalyzerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(AnalyzerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding::new(raw.to_vec()).normalized())
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let img = to_image(frame, width, height)?;
        let boxes = self.detect(&img)?;

        let mut faces = Vec::with_capacity(boxes.len());
        for (face_box, score) in boxes {
            let embedding = self.embed(&img, &face_box)?;
            faces.push(DetectedFace {
                face_box,
                embedding,
                score,
            });
        }
        Ok(faces)
    }
}

fn to_image(frame: &[u8], width: u32, height: u32) -> Result<RgbImage, AnalyzerError> {
    let expected = (width * height * 3) as usize;
    if frame.len() < expected {
        return Err(AnalyzerError::InvalidFrame {
            expected,
            actual: frame.len(),
        });
    }
    RgbImage::from_raw(width, height, frame[..expected].to_vec()).ok_or(AnalyzerError::InvalidFrame {
        expected,
        actual: frame.len(),
    })
}

/// Output (score, bbox) indices by tensor name, falling back to the standard
/// positional layout `[scores 8/16/32, bboxes 8/16/32, ...]`.
fn stride_output_indices(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| names.iter().position(|n| *n == format!("{prefix}_{stride}"));

    let named: Option<Vec<(usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

fn letterbox_tensor(img: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE as usize;
    let new_w = ((img.width() as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((img.height() as f32 * letterbox.scale).round() as u32).max(1);
    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);

    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (px, py) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + px, y as usize + py);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    tensor
}

fn chw_tensor(img: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Square crop centred on the face, resized to the ArcFace input size.
fn square_crop(img: &RgbImage, face: &FaceBox) -> RgbImage {
    let side = face.width().max(face.height()).max(1) as u32;
    let cx = (face.left + face.right) / 2;
    let cy = (face.top + face.bottom) / 2;
    let x = (cx - side as i32 / 2).clamp(0, img.width().saturating_sub(1) as i32) as u32;
    let y = (cy - side as i32 / 2).clamp(0, img.height().saturating_sub(1) as i32) as u32;
    let w = side.min(img.width() - x).max(1);
    let h = side.min(img.height() - y).max(1);

    let crop = image::imageops::crop_imm(img, x, y, w, h).to_image();
    image::imageops::resize(&crop, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle)
}

fn decode_stride(scores: &[f32], bboxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<Candidate> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let (x1, y1) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
        let (x2, y2) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);
        out.push(Candidate { x1, y1, x2, y2, score });
    }
    out
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// Greedy non-maximum suppression; output is sorted by descending score.
fn nms(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(k, &c) <= threshold) {
            keep.push(c);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate { x1, y1, x2, y2, score }
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(5.0, 0.0, 15.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                cand(5.0, 5.0, 105.0, 105.0, 0.8),
                cand(0.0, 0.0, 100.0, 100.0, 0.9),
                cand(200.0, 200.0, 250.0, 250.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_unmap_inverts_mapping() {
        let lb = Letterbox::for_frame(320, 240);
        let (x, y) = (100.0f32, 50.0f32);
        let (rx, ry) = lb.unmap(x * lb.scale + lb.pad_x, y * lb.scale + lb.pad_y);
        assert!((rx - x).abs() < 0.1 && (ry - y).abs() < 0.1);
    }

    #[test]
    fn test_stride_indices_named_and_positional() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(stride_output_indices(&named), [(1, 0), (3, 2), (5, 4)]);

        let generic: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(stride_output_indices(&generic), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_stride_threshold_and_position() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let grid = SCRFD_INPUT_SIZE as usize / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        // Anchor index 2 → cell 1 → (x=32, y=0).
        scores[2] = 0.9;
        bboxes[8..12].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);

        let out = decode_stride(&scores, &bboxes, 32, &lb);
        assert_eq!(out.len(), 1);
        assert!((out[0].x1 - 16.0).abs() < 1e-4);
        assert!((out[0].x2 - 48.0).abs() < 1e-4);
        assert!((out[0].y2 - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_tensor_pads_to_zero() {
        let img = RgbImage::from_pixel(64, 32, image::Rgb([255, 255, 255]));
        let lb = Letterbox::for_frame(64, 32);
        let t = letterbox_tensor(&img, &lb);
        assert_eq!(t.shape(), &[1, 3, 640, 640]);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        assert!(t[[0, 0, 320, 320]] > 0.9);
    }

    #[test]
    fn test_square_crop_size() {
        let img = RgbImage::new(100, 80);
        let crop = square_crop(&img, &FaceBox::new(10, 60, 70, 30));
        assert_eq!(crop.dimensions(), (ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            to_image(&[0u8; 10], 4, 4),
            Err(AnalyzerError::InvalidFrame { expected: 48, actual: 10 })
        ));
    }
}
