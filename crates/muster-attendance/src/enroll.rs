//! Enrollment: capture padded face crops for a new person and register them.
//!
//! Crops land in `<dataset>/<class>/<id>/00000.png, 00001.png, ...`. The
//! directory entry is written only once the full crop count was captured.

use crate::directory::{Directory, DirectoryError};
use image::imageops;
use muster_core::{AnalyzerError, FaceAnalyzer};
use muster_hw::{CameraError, Frame, FrameSource};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Pixels added around each detected face before cropping.
pub const CROP_PADDING: i32 = 70;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("please provide a name and an id")]
    MissingField,
    #[error("id '{0}' must be numeric")]
    NonNumericId(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("failed to save {path}: {message}")]
    Save { path: String, message: String },
    #[error("capture ended after {saved} of {required} faces")]
    Incomplete { saved: usize, required: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Completed { saved: usize },
    /// The operator stopped capture; nothing was registered.
    Stopped { saved: usize },
}

/// Trimmed `(id, name)` if both are present and the id is all digits.
pub fn validate_identity(id: &str, name: &str) -> Result<(String, String), EnrollError> {
    let (id, name) = (id.trim(), name.trim());
    if id.is_empty() || name.is_empty() {
        return Err(EnrollError::MissingField);
    }
    if !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(EnrollError::NonNumericId(id.to_string()));
    }
    Ok((id.to_string(), name.to_string()))
}

pub struct CaptureOptions<'a> {
    pub out_dir: PathBuf,
    pub face_count: usize,
    pub stop: &'a AtomicBool,
}

/// Save mirrored, padded face crops until `face_count` are written or `stop` is set.
pub fn capture_faces(
    source: &mut dyn FrameSource,
    analyzer: &mut dyn FaceAnalyzer,
    options: &CaptureOptions<'_>,
    mut progress: impl FnMut(usize, usize),
) -> Result<EnrollOutcome, EnrollError> {
    let required = options.face_count;
    std::fs::create_dir_all(&options.out_dir).map_err(|e| save_error(&options.out_dir, e))?;

    let mut saved = 0;
    while saved < required {
        if options.stop.load(Ordering::SeqCst) {
            tracing::info!(saved, required, "enrollment stopped");
            return Ok(EnrollOutcome::Stopped { saved });
        }

        let frame = match source.read_frame() {
            Ok(frame) => frame.mirrored(),
            Err(CameraError::NoFrame) => {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(CameraError::Closed) => return Err(EnrollError::Incomplete { saved, required }),
            Err(e) => return Err(e.into()),
        };

        let faces = analyzer.analyze(&frame.data, frame.width, frame.height)?;
        for face in faces {
            if saved == required {
                break;
            }
            let path = options.out_dir.join(format!("{saved:05}.png"));
            save_crop(&frame, face.face_box.padded(CROP_PADDING, frame.width, frame.height), &path)?;
            saved += 1;
            progress(saved, required);
        }
    }

    Ok(EnrollOutcome::Completed { saved })
}

fn save_crop(frame: &Frame, b: muster_core::FaceBox, path: &Path) -> Result<(), EnrollError> {
    if b.width() == 0 || b.height() == 0 {
        return Err(EnrollError::Save {
            path: path.display().to_string(),
            message: "empty face box".into(),
        });
    }
    let img = frame.to_image().ok_or_else(|| EnrollError::Save {
        path: path.display().to_string(),
        message: "frame buffer does not match its dimensions".into(),
    })?;
    let crop = imageops::crop_imm(&img, b.left as u32, b.top as u32, b.width() as u32, b.height() as u32).to_image();
    crop.save(path).map_err(|e| save_error(path, e))
}

fn save_error(path: &Path, e: impl std::fmt::Display) -> EnrollError {
    EnrollError::Save {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// Validate, capture, and on completion register `id` in the directory.
pub fn enroll(
    directory: &mut Directory,
    id: &str,
    name: &str,
    source: &mut dyn FrameSource,
    analyzer: &mut dyn FaceAnalyzer,
    options: &CaptureOptions<'_>,
    progress: impl FnMut(usize, usize),
) -> Result<EnrollOutcome, EnrollError> {
    let (id, name) = validate_identity(id, name)?;
    if directory.contains(&id) {
        return Err(DirectoryError::AlreadyEnrolled(id).into());
    }

    tracing::info!(id = %id, name = %name, dir = %options.out_dir.display(), "enrollment started");
    let outcome = capture_faces(source, analyzer, options, progress)?;
    if let EnrollOutcome::Completed { .. } = outcome {
        directory.enroll(&id, &name)?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::tests::ScriptedSource;
    use image::RgbImage;
    use muster_core::{DetectedFace, Embedding, FaceBox};

    struct CenterFace;

    impl FaceAnalyzer for CenterFace {
        fn analyze(&mut self, _frame: &[u8], _w: u32, _h: u32) -> Result<Vec<DetectedFace>, AnalyzerError> {
            Ok(vec![DetectedFace {
                face_box: FaceBox::new(10, 40, 40, 20),
                embedding: Embedding::new(vec![1.0]),
                score: 0.9,
            }])
        }
    }

    #[test]
    fn test_validate_identity() {
        assert!(matches!(validate_identity("", "Asha"), Err(EnrollError::MissingField)));
        assert!(matches!(validate_identity("007", "  "), Err(EnrollError::MissingField)));
        assert!(matches!(validate_identity("7a", "Asha"), Err(EnrollError::NonNumericId(_))));
        assert_eq!(validate_identity(" 007 ", "Asha ").unwrap(), ("007".into(), "Asha".into()));
    }

    #[test]
    fn test_enroll_saves_crops_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = Directory::open(dir.path().join("db.json")).unwrap();
        let stop = AtomicBool::new(false);
        let options = CaptureOptions {
            out_dir: dir.path().join("dataset/PROJECT/007"),
            face_count: 3,
            stop: &stop,
        };
        let mut ticks = Vec::new();

        let outcome = enroll(
            &mut directory,
            "007",
            "Asha",
            &mut ScriptedSource::frames(5),
            &mut CenterFace,
            &options,
            |saved, total| ticks.push((saved, total)),
        )
        .unwrap();

        assert_eq!(outcome, EnrollOutcome::Completed { saved: 3 });
        assert_eq!(ticks, [(1, 3), (2, 3), (3, 3)]);
        assert!(options.out_dir.join("00002.png").exists());
        assert!(!options.out_dir.join("00003.png").exists());
        assert_eq!(directory.lookup("007").map(|e| e.name).as_deref(), Some("Asha"));

        // 64x48 frame, box padded by 70 on every side is clamped to the frame.
        let crop = image::open(options.out_dir.join("00000.png")).unwrap();
        assert_eq!((crop.width(), crop.height()), (64, 48));
    }

    #[test]
    fn test_stopped_enrollment_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = Directory::open(dir.path().join("db.json")).unwrap();
        let stop = AtomicBool::new(true);
        let options = CaptureOptions {
            out_dir: dir.path().join("out"),
            face_count: 3,
            stop: &stop,
        };
        let outcome = enroll(
            &mut directory,
            "007",
            "Asha",
            &mut ScriptedSource::frames(5),
            &mut CenterFace,
            &options,
            |_, _| {},
        )
        .unwrap();
        assert_eq!(outcome, EnrollOutcome::Stopped { saved: 0 });
        assert!(!directory.contains("007"));
    }

    #[test]
    fn test_duplicate_id_rejected_before_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = Directory::open(dir.path().join("db.json")).unwrap();
        directory.enroll("007", "Asha").unwrap();
        let stop = AtomicBool::new(false);
        let options = CaptureOptions {
            out_dir: dir.path().join("out"),
            face_count: 3,
            stop: &stop,
        };
        let err = enroll(
            &mut directory,
            "007",
            "Other",
            &mut ScriptedSource::frames(5),
            &mut CenterFace,
            &options,
            |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, EnrollError::Directory(DirectoryError::AlreadyEnrolled(_))));
        assert!(!options.out_dir.exists());
    }

    #[test]
    fn test_source_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let stop = AtomicBool::new(false);
        let options = CaptureOptions {
            out_dir: dir.path().join("out"),
            face_count: 3,
            stop: &stop,
        };
        let mut source = ScriptedSource::frames(1);
        source.frames.push_back(None);
        let err = capture_faces(&mut source, &mut CenterFace, &options, |_, _| {}).unwrap_err();
        assert!(matches!(err, EnrollError::Camera(CameraError::CaptureFailed(_))));
        assert!(options.out_dir.join("00000.png").exists());
    }

    #[test]
    fn test_crop_is_mirrored() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = RgbImage::new(64, 48);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let mut source = ScriptedSource {
            frames: [Some(Frame::from_image(img, 0))].into_iter().collect(),
        };
        let stop = AtomicBool::new(false);
        let options = CaptureOptions {
            out_dir: dir.path().join("out"),
            face_count: 1,
            stop: &stop,
        };
        capture_faces(&mut source, &mut CenterFace, &options, |_, _| {}).unwrap();
        let crop = image::open(options.out_dir.join("00000.png")).unwrap().to_rgb8();
        assert_eq!(*crop.get_pixel(63, 0), image::Rgb([255, 0, 0]));
    }
}
