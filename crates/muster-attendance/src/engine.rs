use crate::ledger::AttendanceRecord;
use crate::recognition::RecognitionLoop;
use crate::remote::{push_today, RemoteError, RemoteStore};
use crate::shift::ShiftMode;
use crate::status::StatusEvent;
use chrono::{Local, NaiveDate, NaiveDateTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("remote sync failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Point-in-time copy of the current attendance sheet.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub date: Option<NaiveDate>,
    pub mode: Option<ShiftMode>,
    pub records: Vec<AttendanceRecord>,
    pub frames: u64,
}

/// Messages sent from operator front-ends to the engine thread.
enum EngineRequest {
    PushToday {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<LedgerSnapshot>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    running: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Mirror today's records to the remote store. Returns how many were new.
    pub async fn push_today(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::PushToday { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn snapshot(&self) -> Result<LedgerSnapshot, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Ask the loop to stop after the tick in progress.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Spawn the recognition loop on a dedicated OS thread, using the local clock.
pub fn spawn_engine(
    recognition: RecognitionLoop,
    remote: Box<dyn RemoteStore + Send>,
) -> Result<(EngineHandle, JoinHandle<()>), EngineError> {
    spawn_engine_with_clock(recognition, remote, || Local::now().naive_local())
}

/// Like [`spawn_engine`], reading wall-clock time from `clock`.
///
/// The thread ticks at the loop's interval and serves operator requests
/// between ticks. It exits once [`EngineHandle::stop`] is called or every
/// handle is dropped, then releases the frame source and publishes
/// [`StatusEvent::Stopped`].
pub fn spawn_engine_with_clock<C>(
    mut recognition: RecognitionLoop,
    remote: Box<dyn RemoteStore + Send>,
    clock: C,
) -> Result<(EngineHandle, JoinHandle<()>), EngineError>
where
    C: Fn() -> NaiveDateTime + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);
    let running = Arc::new(AtomicBool::new(true));
    let thread_running = Arc::clone(&running);

    let join = std::thread::Builder::new()
        .name("muster-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let interval = recognition.settings().tick_interval;

            while thread_running.load(Ordering::SeqCst) {
                let started = Instant::now();

                loop {
                    match rx.try_recv() {
                        Ok(req) => handle_request(req, &recognition, remote.as_ref(), &clock),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            tracing::info!("all engine handles dropped");
                            thread_running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                if !thread_running.load(Ordering::SeqCst) {
                    break;
                }

                recognition.tick(clock());
                if let Some(rest) = interval.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
            }

            let status = recognition.status().clone();
            recognition.shutdown();
            status.publish(StatusEvent::Stopped);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok((EngineHandle { tx, running }, join))
}

fn handle_request<C>(req: EngineRequest, recognition: &RecognitionLoop, remote: &dyn RemoteStore, clock: &C)
where
    C: Fn() -> NaiveDateTime,
{
    match req {
        EngineRequest::PushToday { reply } => {
            let today = clock().date();
            let result = push_today(recognition.ledger(), remote, today).map_err(EngineError::from);
            match &result {
                Ok(0) => recognition.status().info("Nothing new to push"),
                Ok(n) => recognition.status().info(format!("Pushed {n} attendance record(s)")),
                Err(e) => {
                    tracing::error!(error = %e, "push failed");
                    recognition.status().error(format!("Push failed: {e}"));
                }
            }
            let _ = reply.send(result);
        }
        EngineRequest::Snapshot { reply } => {
            let ledger = recognition.ledger();
            let _ = reply.send(LedgerSnapshot {
                date: ledger.date(),
                mode: ledger.mode(),
                records: ledger.records().to_vec(),
                frames: recognition.frame_count(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AttendanceLedger;
    use crate::recognition::tests::{FixedAnalyzer, MapDirectory, ScriptedSource, TableClassifier};
    use crate::remote::SqliteRemoteStore;
    use crate::status::StatusBus;
    use muster_core::{FaceBox, Prediction};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn noon() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-03-04 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn recognition(dir: &std::path::Path, status: StatusBus) -> RecognitionLoop {
        let analyzer = FixedAnalyzer {
            boxes: vec![FaceBox::new(2, 12, 12, 2)],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let classifier = TableClassifier {
            table: vec![Prediction {
                label: "007".into(),
                confidence: 0.95,
            }],
        };
        let directory = MapDirectory(HashMap::from([("007".to_string(), "Asha".to_string())]));
        RecognitionLoop::new(
            Box::new(ScriptedSource::frames(16)),
            Box::new(analyzer),
            Box::new(classifier),
            Box::new(directory),
            AttendanceLedger::open(dir.join("attendance.json")),
            status,
        )
    }

    async fn wait_for_record(handle: &EngineHandle) -> LedgerSnapshot {
        for _ in 0..200 {
            let snapshot = handle.snapshot().await.unwrap();
            if !snapshot.records.is_empty() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never recorded attendance");
    }

    #[tokio::test]
    async fn test_push_today_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let remote = SqliteRemoteStore::open(&dir.path().join("remote.db")).unwrap();
        let (handle, join) =
            spawn_engine_with_clock(recognition(dir.path(), StatusBus::new()), Box::new(remote), noon).unwrap();

        let snapshot = wait_for_record(&handle).await;
        assert_eq!(snapshot.mode, Some(ShiftMode::Lunch));
        assert_eq!(snapshot.records[0].name, "Asha");

        assert_eq!(handle.push_today().await.unwrap(), 1);
        assert_eq!(handle.push_today().await.unwrap(), 0);

        handle.stop();
        tokio::task::spawn_blocking(move || join.join().unwrap()).await.unwrap();

        let doc = SqliteRemoteStore::open(&dir.path().join("remote.db"))
            .unwrap()
            .fetch_or_create_day(noon().date())
            .unwrap();
        assert_eq!(doc.students.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_publishes_stopped_and_closes_handle() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusBus::new();
        let mut rx = status.subscribe();
        let (handle, join) = spawn_engine_with_clock(
            recognition(dir.path(), status),
            Box::new(SqliteRemoteStore::open_in_memory().unwrap()),
            noon,
        )
        .unwrap();

        assert!(handle.is_running());
        handle.stop();
        tokio::task::spawn_blocking(move || join.join().unwrap()).await.unwrap();

        let mut saw_stopped = false;
        while let Ok(event) = rx.try_recv() {
            saw_stopped |= event == StatusEvent::Stopped;
        }
        assert!(saw_stopped);
        assert!(matches!(handle.snapshot().await, Err(EngineError::ChannelClosed)));
    }
}
