//! Live recognition: frame in, attendance and annotated preview out.
//!
//! Each tick reads one frame, downsamples it, and on every `frame_skip`-th
//! frame runs detection and classification. Boxes from the last
//! classification pass are redrawn on every frame in between.

use crate::config::Config;
use crate::directory::DirectoryLookup;
use crate::ledger::{AttendanceLedger, Outcome};
use crate::overlay::{Annotation, DisplaySink, NullSink, OverlayRenderer};
use crate::status::StatusBus;
use chrono::NaiveDateTime;
use muster_core::{ClassificationResult, DetectedFace, FaceAnalyzer, IdentityClassifier, UNKNOWN_LABEL};
use muster_hw::{CameraError, Frame, FrameSource};
use std::time::Duration;

pub const TICK_INTERVAL: Duration = Duration::from_millis(50);
pub const DOWNSAMPLE_FACTOR: f32 = 0.5;
pub const FRAME_SKIP: u64 = 8;

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub tick_interval: Duration,
    pub downsample_factor: f32,
    pub frame_skip: u64,
    pub confidence_threshold: f32,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            downsample_factor: DOWNSAMPLE_FACTOR,
            frame_skip: FRAME_SKIP,
            confidence_threshold: 0.8,
        }
    }
}

impl RecognitionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No frame was available; nothing changed.
    NoFrame,
    /// A frame was drawn and shown; `classified` if this tick ran detection.
    Rendered { classified: bool },
}

pub struct RecognitionLoop {
    source: Box<dyn FrameSource + Send>,
    analyzer: Box<dyn FaceAnalyzer + Send>,
    classifier: Box<dyn IdentityClassifier + Send>,
    directory: Box<dyn DirectoryLookup + Send>,
    display: Box<dyn DisplaySink + Send>,
    ledger: AttendanceLedger,
    overlay: OverlayRenderer,
    status: StatusBus,
    settings: RecognitionSettings,
    frame_count: u64,
    annotations: Vec<Annotation>,
    /// Set once the source reported `Closed`, so the loss is published once.
    source_closed: bool,
}

impl RecognitionLoop {
    pub fn new(
        source: Box<dyn FrameSource + Send>,
        analyzer: Box<dyn FaceAnalyzer + Send>,
        classifier: Box<dyn IdentityClassifier + Send>,
        directory: Box<dyn DirectoryLookup + Send>,
        ledger: AttendanceLedger,
        status: StatusBus,
    ) -> Self {
        Self {
            source,
            analyzer,
            classifier,
            directory,
            display: Box::new(NullSink),
            ledger,
            overlay: OverlayRenderer::new(None),
            status,
            settings: RecognitionSettings::default(),
            frame_count: 0,
            annotations: Vec::new(),
            source_closed: false,
        }
    }

    pub fn with_display(mut self, display: Box<dyn DisplaySink + Send>) -> Self {
        self.display = display;
        self
    }

    pub fn with_overlay(mut self, overlay: OverlayRenderer) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn with_settings(mut self, settings: RecognitionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &RecognitionSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn status(&self) -> &StatusBus {
        &self.status
    }

    /// Boxes and labels currently drawn on every frame.
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Run one iteration. Never fails: errors go to the status bus.
    pub fn tick(&mut self, now: NaiveDateTime) -> TickOutcome {
        let frame = match self.source.read_frame() {
            Ok(frame) => {
                self.source_closed = false;
                frame
            }
            Err(CameraError::NoFrame) => return TickOutcome::NoFrame,
            Err(CameraError::Closed) => {
                if !self.source_closed {
                    self.source_closed = true;
                    tracing::warn!("camera stopped delivering frames");
                    self.status.error("Camera disconnected; no frames are being captured");
                }
                return TickOutcome::NoFrame;
            }
            Err(e) => {
                tracing::debug!(error = %e, "frame read failed");
                return TickOutcome::NoFrame;
            }
        };

        let small = frame.downsample(self.settings.downsample_factor);
        self.frame_count += 1;

        let classified = self.frame_count % self.settings.frame_skip.max(1) == 0;
        if classified {
            self.classify_frame(&small, now);
        }

        match self.overlay.render(&frame, &self.annotations) {
            Ok(annotated) => {
                if let Err(e) = self.display.show(&annotated) {
                    tracing::warn!(error = %e, "display failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "overlay failed"),
        }

        TickOutcome::Rendered { classified }
    }

    fn classify_frame(&mut self, small: &Frame, now: NaiveDateTime) {
        let faces = match self.analyzer.analyze(&small.data, small.width, small.height) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face analysis failed");
                self.status.error(format!("Recognition error: {e}"));
                return;
            }
        };

        let upscale = 1.0 / self.settings.downsample_factor;
        let mut annotations = Vec::with_capacity(faces.len());
        for face in &faces {
            let Some((label, name)) = self.identify(face) else {
                continue;
            };
            self.submit(&label, &name, now);
            annotations.push(Annotation {
                face_box: face.face_box.scaled(upscale),
                recognized: label != UNKNOWN_LABEL,
                label: name,
            });
        }
        tracing::trace!(faces = faces.len(), frame = self.frame_count, "classification pass");
        self.annotations = annotations;
    }

    /// Resolve a face to `(label, display name)`; unresolvable faces are Unknown.
    fn identify(&self, face: &DetectedFace) -> Option<(String, String)> {
        let prediction = match self.classifier.classify(&face.embedding) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "classification failed");
                self.status.error(format!("Recognition error: {e}"));
                return None;
            }
        };
        let result = ClassificationResult::from_prediction(prediction, self.settings.confidence_threshold);
        if result.is_unknown() {
            return Some(unknown());
        }
        match self.directory.display_name(&result.label) {
            Some(name) => Some((result.label, name)),
            None => {
                tracing::debug!(label = %result.label, "label not in directory");
                Some(unknown())
            }
        }
    }

    fn submit(&mut self, label: &str, name: &str, now: NaiveDateTime) {
        match self.ledger.record_if_new_at(label, name, now) {
            Ok(Outcome::Stored) => self.status.info(format!("Attendance stored for {name}")),
            Ok(Outcome::AlreadyRecorded) => tracing::trace!(id = label, "already recorded"),
            Ok(Outcome::RejectedUnknown) => {}
            Err(e) => {
                tracing::error!(id = label, error = %e, "failed to persist attendance");
                self.status.error(format!("Could not save attendance: {e}"));
            }
        }
    }

    /// Release the frame source and hand back the ledger.
    pub fn shutdown(self) -> AttendanceLedger {
        drop(self.source);
        tracing::info!(frames = self.frame_count, "recognition stopped");
        self.ledger
    }
}

fn unknown() -> (String, String) {
    (UNKNOWN_LABEL.to_string(), UNKNOWN_LABEL.to_string())
}
