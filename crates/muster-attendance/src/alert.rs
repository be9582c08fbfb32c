//! Unknown-face alerts: one spoken phrase at a time plus a transient status message.
//!
//! The audio side is a single-slot mailbox with drop-newest semantics: while
//! an utterance is in flight, further alerts are discarded rather than queued.

use crate::status::StatusBus;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long the visual alert stays up.
pub const ALERT_DISPLAY_DURATION: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("failed to run speech program {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("speech program {program} exited with {status}")]
    Failed { program: String, status: String },
}

/// Plays a phrase; blocking until done is expected.
pub trait Speaker: Send + Sync {
    fn speak(&self, phrase: &str) -> Result<(), AlertError>;
}

/// Runs an external text-to-speech program with the phrase as the last argument.
pub struct CommandSpeaker {
    program: String,
    args: Vec<String>,
}

impl CommandSpeaker {
    /// Parse a whitespace-separated command line such as `"espeak -s 150"`.
    /// Returns `None` for an empty command.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Speaker for CommandSpeaker {
    fn speak(&self, phrase: &str) -> Result<(), AlertError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(phrase)
            .status()
            .map_err(|source| AlertError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(AlertError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
            })
        }
    }
}

/// Speaker used when audio alerts are disabled.
pub struct SilentSpeaker;

impl Speaker for SilentSpeaker {
    fn speak(&self, phrase: &str) -> Result<(), AlertError> {
        tracing::debug!(phrase, "audio alerts disabled");
        Ok(())
    }
}

/// What happened to an alert request's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDispatch {
    Spoken,
    /// Another utterance was still playing.
    Dropped,
}

struct Inner {
    speaker: Box<dyn Speaker>,
    phrase: String,
    speaking: AtomicBool,
    dropped: AtomicU64,
    status: StatusBus,
    display_for: Duration,
}

/// Cloneable handle to the alert channel.
#[derive(Clone)]
pub struct AlertNotifier {
    inner: Arc<Inner>,
}

/// Clears the in-flight flag even if the speaker panics.
struct SpeakingGuard(Arc<Inner>);

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        self.0.speaking.store(false, Ordering::SeqCst);
    }
}

impl AlertNotifier {
    pub fn new(speaker: Box<dyn Speaker>, phrase: impl Into<String>, status: StatusBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                speaker,
                phrase: phrase.into(),
                speaking: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                status,
                display_for: ALERT_DISPLAY_DURATION,
            }),
        }
    }

    /// Same notifier with a different visual display duration.
    pub fn with_display_duration(speaker: Box<dyn Speaker>, phrase: impl Into<String>, status: StatusBus, display_for: Duration) -> Self {
        let mut notifier = Self::new(speaker, phrase, status);
        if let Some(inner) = Arc::get_mut(&mut notifier.inner) {
            inner.display_for = display_for;
        }
        notifier
    }

    /// Raise an unknown-face alert. Never blocks.
    pub fn notify(&self) -> AlertDispatch {
        let inner = &self.inner;
        inner.status.alert_transient(inner.phrase.clone(), inner.display_for);

        if inner
            .speaking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let dropped = inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped, "alert already playing, dropping");
            return AlertDispatch::Dropped;
        }

        let guard = SpeakingGuard(Arc::clone(inner));
        let spawned = std::thread::Builder::new()
            .name("muster-alert".into())
            .spawn(move || {
                let inner = &guard.0;
                if let Err(e) = inner.speaker.speak(&inner.phrase) {
                    tracing::warn!(error = %e, "alert speech failed");
                }
            });

        match spawned {
            Ok(_) => AlertDispatch::Spoken,
            Err(e) => {
                // The closure (and its guard) was dropped, so the slot is free again.
                tracing::warn!(error = %e, "could not spawn alert thread");
                AlertDispatch::Dropped
            }
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.speaking.load(Ordering::SeqCst)
    }

    /// Alerts discarded because one was already playing.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusEvent;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Mutex};
    use std::time::Instant;

    /// Blocks each utterance until the test sends a release token.
    struct GatedSpeaker {
        calls: Arc<AtomicUsize>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl Speaker for GatedSpeaker {
        fn speak(&self, _phrase: &str) -> Result<(), AlertError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap();
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(())
        }
    }

    fn wait_idle(n: &AlertNotifier) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while n.is_speaking() {
            assert!(Instant::now() < deadline, "speaker never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_overlapping_alerts_are_dropped_not_queued() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = mpsc::channel();
        let speaker = GatedSpeaker {
            calls: Arc::clone(&calls),
            gate: Mutex::new(gate),
        };
        let notifier = AlertNotifier::new(Box::new(speaker), "Unknown person detected", StatusBus::new());

        assert_eq!(notifier.notify(), AlertDispatch::Spoken);
        assert_eq!(notifier.notify(), AlertDispatch::Dropped);
        assert_eq!(notifier.notify(), AlertDispatch::Dropped);
        assert_eq!(notifier.dropped_count(), 2);

        release.send(()).unwrap();
        wait_idle(&notifier);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(notifier.notify(), AlertDispatch::Spoken);
        release.send(()).unwrap();
        wait_idle(&notifier);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_every_alert_is_shown_even_when_audio_drops() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe();
        let (release, gate) = mpsc::channel();
        let speaker = GatedSpeaker {
            calls: Arc::new(AtomicUsize::new(0)),
            gate: Mutex::new(gate),
        };
        let notifier = AlertNotifier::with_display_duration(Box::new(speaker), "Intruder", bus, Duration::from_secs(60));

        notifier.notify();
        notifier.notify();
        assert_eq!(rx.try_recv().unwrap(), StatusEvent::Alert("Intruder".into()));
        assert_eq!(rx.try_recv().unwrap(), StatusEvent::Alert("Intruder".into()));

        release.send(()).unwrap();
        wait_idle(&notifier);
    }

    #[test]
    fn test_command_speaker_parsing() {
        assert!(CommandSpeaker::from_command_line("   ").is_none());
        let s = CommandSpeaker::from_command_line("espeak -s 150").unwrap();
        assert_eq!(s.program, "espeak");
        assert_eq!(s.args, vec!["-s", "150"]);
    }

    #[test]
    fn test_command_speaker_missing_program() {
        let s = CommandSpeaker::from_command_line("/nonexistent/tts-binary").unwrap();
        assert!(matches!(s.speak("hello"), Err(AlertError::Spawn { .. })));
    }
}
