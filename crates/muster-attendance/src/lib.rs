//! muster-attendance: shift-scoped attendance on top of live face recognition.
//!
//! The [`RecognitionLoop`] feeds recognitions into an [`AttendanceLedger`],
//! which persists the current shift's sheet locally and appends each new
//! record to a per-day [`DailyExport`]; [`push_today`] mirrors the sheet to a
//! day-keyed [`RemoteStore`]. Unknown faces raise an [`AlertNotifier`] alert.
//! Everything user-facing goes out over a [`StatusBus`].

pub mod alert;
pub mod config;
pub mod directory;
pub mod engine;
pub mod enroll;
pub mod export;
pub mod ledger;
pub mod overlay;
pub mod recognition;
pub mod remote;
pub mod shift;
pub mod status;

pub use alert::{AlertDispatch, AlertError, AlertNotifier, CommandSpeaker, SilentSpeaker, Speaker};
pub use config::{Config, ConfigError, DEFAULT_CONFIG_PATH};
pub use directory::{Directory, DirectoryEntry, DirectoryError, DirectoryLookup};
pub use engine::{spawn_engine, spawn_engine_with_clock, EngineError, EngineHandle, LedgerSnapshot};
pub use enroll::{capture_faces, enroll, validate_identity, CaptureOptions, EnrollError, EnrollOutcome};
pub use export::{DailyExport, ExportError, ExportRow};
pub use ledger::{AttendanceLedger, AttendanceRecord, LedgerError, Outcome};
pub use overlay::{Annotation, DisplayError, DisplaySink, NullSink, OverlayRenderer, SnapshotSink};
pub use recognition::{RecognitionLoop, RecognitionSettings, TickOutcome};
pub use remote::{push_today, DayDocument, RemoteEntry, RemoteError, RemoteStore, SqliteRemoteStore};
pub use shift::ShiftMode;
pub use status::{StatusBus, StatusEvent};
