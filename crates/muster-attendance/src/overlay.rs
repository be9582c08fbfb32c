//! Box/label overlay and the display surfaces annotated frames are handed to.

use ab_glyph::{FontVec, PxScale};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use muster_core::FaceBox;
use muster_hw::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

const RECOGNIZED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 18.0;
const LABEL_OFFSET: i32 = 20;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("frame buffer does not match its dimensions")]
    BadFrame,
    #[error("failed to write preview {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// A remembered face to draw on every frame until the next classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Full-resolution coordinates.
    pub face_box: FaceBox,
    pub label: String,
    pub recognized: bool,
}

pub struct OverlayRenderer {
    font: Option<FontVec>,
}

impl OverlayRenderer {
    /// Labels are drawn only if a usable font is given.
    pub fn new(font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| {
            let bytes = match std::fs::read(path) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "overlay font unreadable, labels disabled");
                    return None;
                }
            };
            match FontVec::try_from_vec(bytes) {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "overlay font invalid, labels disabled");
                    None
                }
            }
        });
        Self { font }
    }

    pub fn has_labels(&self) -> bool {
        self.font.is_some()
    }

    /// Draw every annotation onto a copy of `frame`.
    pub fn render(&self, frame: &Frame, annotations: &[Annotation]) -> Result<Frame, DisplayError> {
        let mut img = frame.to_image().ok_or(DisplayError::BadFrame)?;
        for annotation in annotations {
            self.draw(&mut img, annotation);
        }
        Ok(Frame {
            timestamp: frame.timestamp,
            ..Frame::from_image(img, frame.sequence)
        })
    }

    fn draw(&self, img: &mut RgbImage, annotation: &Annotation) {
        let color = if annotation.recognized {
            RECOGNIZED_COLOR
        } else {
            UNKNOWN_COLOR
        };
        let b = annotation.face_box;

        for inset in 0..BOX_THICKNESS {
            let (w, h) = (b.width() - 2 * inset, b.height() - 2 * inset);
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(b.left + inset, b.top + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(img, rect, color);
        }

        if let Some(font) = &self.font {
            let y = if b.top - LABEL_OFFSET > 0 { b.top - LABEL_OFFSET } else { b.top + LABEL_OFFSET };
            draw_text_mut(img, color, b.left, y, PxScale::from(LABEL_SCALE), font, &annotation.label);
        } else if b.width() > 0 {
            // No font: mark the label slot so unknown faces still stand out.
            let rect = Rect::at(b.left, (b.top - 6).max(0)).of_size(b.width() as u32, 4);
            draw_filled_rect_mut(img, rect, color);
        }
    }
}

/// Where annotated frames go.
pub trait DisplaySink {
    fn show(&mut self, frame: &Frame) -> Result<(), DisplayError>;
}

/// Discards frames; used when nothing presents the preview.
pub struct NullSink;

impl DisplaySink for NullSink {
    fn show(&mut self, _frame: &Frame) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// Overwrites a JPEG preview file every `every` frames.
pub struct SnapshotSink {
    path: PathBuf,
    every: u64,
    count: u64,
}

impl SnapshotSink {
    pub fn new(path: impl Into<PathBuf>, every: u64) -> Self {
        Self {
            path: path.into(),
            every: every.max(1),
            count: 0,
        }
    }
}

impl DisplaySink for SnapshotSink {
    fn show(&mut self, frame: &Frame) -> Result<(), DisplayError> {
        self.count += 1;
        if (self.count - 1) % self.every != 0 {
            return Ok(());
        }
        let img = frame.to_image().ok_or(DisplayError::BadFrame)?;
        img.save_with_format(&self.path, ImageFormat::Jpeg)
            .map_err(|source| DisplayError::Write {
                path: self.path.display().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(w: u32, h: u32) -> Frame {
        Frame::from_image(RgbImage::new(w, h), 0)
    }

    fn annotation(recognized: bool) -> Annotation {
        Annotation {
            face_box: FaceBox::new(20, 60, 60, 20),
            label: if recognized { "Asha".into() } else { "Unknown".into() },
            recognized,
        }
    }

    #[test]
    fn test_box_color_by_recognition() {
        let renderer = OverlayRenderer::new(None);
        let frame = blank(100, 100);

        let known = renderer.render(&frame, &[annotation(true)]).unwrap().to_image().unwrap();
        assert_eq!(*known.get_pixel(20, 40), RECOGNIZED_COLOR);
        assert_eq!(*known.get_pixel(21, 40), RECOGNIZED_COLOR);
        assert_eq!(*known.get_pixel(40, 40), Rgb([0, 0, 0]));

        let unknown = renderer.render(&frame, &[annotation(false)]).unwrap().to_image().unwrap();
        assert_eq!(*unknown.get_pixel(59, 40), UNKNOWN_COLOR);
    }

    #[test]
    fn test_render_leaves_source_untouched() {
        let renderer = OverlayRenderer::new(None);
        let frame = blank(100, 100);
        let out = renderer.render(&frame, &[annotation(true)]).unwrap();
        assert!(frame.data.iter().all(|&p| p == 0));
        assert_eq!((out.width, out.height), (100, 100));
    }

    #[test]
    fn test_box_outside_frame_is_clipped() {
        let renderer = OverlayRenderer::new(None);
        let a = Annotation {
            face_box: FaceBox::new(-10, 300, 300, 90),
            label: "Edge".into(),
            recognized: true,
        };
        assert!(renderer.render(&blank(100, 100), &[a]).is_ok());
    }

    #[test]
    fn test_missing_font_disables_labels() {
        let renderer = OverlayRenderer::new(Some(Path::new("/nonexistent/font.ttf")));
        assert!(!renderer.has_labels());
    }

    #[test]
    fn test_snapshot_sink_writes_every_nth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let mut sink = SnapshotSink::new(&path, 3);

        sink.show(&blank(8, 8)).unwrap();
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();

        sink.show(&blank(8, 8)).unwrap();
        sink.show(&blank(8, 8)).unwrap();
        assert!(!path.exists());
        sink.show(&blank(8, 8)).unwrap();
        assert!(path.exists());
    }
}
