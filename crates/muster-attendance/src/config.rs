use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file used when neither `--config` nor `MUSTER_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file '{0}' not found")]
    NotFound(String),
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {message}")]
    Invalid { path: String, message: String },
}

/// Flat key/value configuration shared by the daemon and the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root of the enrollment image tree.
    pub dataset_path: PathBuf,
    /// Sub-directory of `dataset_path` that new enrollments are written to.
    #[serde(default = "default_class_name")]
    pub class_name: String,
    pub encodings_path: PathBuf,
    pub recognizer_path: PathBuf,
    /// Label encoder written next to the recognizer.
    pub le_path: PathBuf,
    /// Directory store (`student` table).
    pub db_path: PathBuf,
    /// Local attendance ledger file.
    #[serde(default = "default_attendance_path")]
    pub attendance_path: PathBuf,
    /// Where `<YYYY-MM-DD>_Attendance.csv` files go; defaults to the
    /// directory holding `attendance_path`.
    #[serde(default)]
    pub export_dir: Option<PathBuf>,
    /// SQLite database standing in for the remote attendance collection.
    #[serde(default = "default_remote_db_path")]
    pub remote_db_path: PathBuf,
    /// Directory containing ONNX model files.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// "hog" selects the light detector, "cnn" the accurate one; any other
    /// value names a model file stem in `model_dir`.
    #[serde(default = "default_detection_method")]
    pub detection_method: String,
    /// Face crops captured per enrollment.
    #[serde(default = "default_face_count")]
    pub face_count: usize,
    #[serde(default = "default_camera_device")]
    pub camera_device: String,
    /// Minimum classifier confidence to accept an identity.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_alert_phrase")]
    pub alert_phrase: String,
    /// Text-to-speech program; the phrase is passed as its last argument.
    /// Empty disables audio alerts.
    #[serde(default = "default_speech_command")]
    pub speech_command: String,
    /// Where the annotated preview frame is written, if anywhere.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// TTF/OTF font for overlay labels; boxes are drawn without labels if unset.
    #[serde(default)]
    pub font_path: Option<PathBuf>,
}

fn default_class_name() -> String {
    "PROJECT".into()
}

fn default_attendance_path() -> PathBuf {
    PathBuf::from("attendance.json")
}

fn default_remote_db_path() -> PathBuf {
    PathBuf::from("attendance_remote.db")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_detection_method() -> String {
    "hog".into()
}

fn default_face_count() -> usize {
    10
}

fn default_camera_device() -> String {
    "/dev/video0".into()
}

fn default_confidence_threshold() -> f32 {
    0.8
}

fn default_alert_phrase() -> String {
    "Unknown person detected".into()
}

fn default_speech_command() -> String {
    "espeak".into()
}

impl Config {
    /// Load a JSON config, or TOML when the file extension is `.toml`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::NotFound(display));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;

        let is_toml = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        let config: Config = if is_toml {
            toml::from_str(&raw).map_err(|e| ConfigError::Invalid {
                path: display.clone(),
                message: e.to_string(),
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
                path: display.clone(),
                message: e.to_string(),
            })?
        };

        let config = config.with_env_overrides();
        config.validate(&display)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Apply `MUSTER_*` environment overrides for per-host settings.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var("MUSTER_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        if let Ok(dir) = std::env::var("MUSTER_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        self.confidence_threshold = env_f32("MUSTER_CONFIDENCE_THRESHOLD", self.confidence_threshold);
        self.face_count = env_usize("MUSTER_FACE_COUNT", self.face_count);
        self
    }

    /// Config path from `MUSTER_CONFIG`, falling back to [`DEFAULT_CONFIG_PATH`].
    pub fn default_path() -> PathBuf {
        std::env::var("MUSTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    fn validate(&self, path: &str) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::Invalid {
            path: path.to_string(),
            message: message.to_string(),
        };
        if self.face_count == 0 {
            return Err(invalid("face_count must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(invalid("confidence_threshold must be within [0, 1]"));
        }
        if self.class_name.trim().is_empty() {
            return Err(invalid("class_name must not be empty"));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model chosen by `detection_method`.
    pub fn detector_model_path(&self) -> PathBuf {
        let stem = match self.detection_method.as_str() {
            "hog" => "det_500m",
            "cnn" => "det_10g",
            other => other,
        };
        self.model_dir.join(format!("{stem}.onnx"))
    }

    /// Path to the ArcFace embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    /// Directory the per-day attendance exports are written to.
    pub fn daily_export_dir(&self) -> PathBuf {
        match &self.export_dir {
            Some(dir) => dir.clone(),
            None => self
                .attendance_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }

    /// Directory new enrollment crops for `id` are written to.
    pub fn enrollment_dir(&self, id: &str) -> PathBuf {
        self.dataset_path.join(&self.class_name).join(id)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
