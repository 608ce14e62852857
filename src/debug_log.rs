// Debug log module - toggleable capture of proxied traffic
//
// When debug mode is switched on, a session log file is created and every
// proxied exchange is appended to it in JSON Lines format: one JSON object
// per line, easy to stream and grep. One file per enabled interval:
//   debug_session_YYYYMMDDTHHMMSS.jsonl
//
// At most one session is open at a time. File writes happen on a dedicated
// writer task fed by an unbounded channel: an append is just a queue push,
// so relaying a streaming chunk never waits on disk. Records are written in
// send order. Append failures (disk full, etc.) are logged and never fail
// the request being proxied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// The inbound request, as captured into log records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// The upstream response, as captured into log records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status: u16,
    pub data: serde_json::Value,
}

/// One line of a session log file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebugRecord {
    SessionStart {
        session_start: DateTime<Utc>,
        message: String,
    },
    SessionEnd {
        session_end: DateTime<Utc>,
        message: String,
        duration_seconds: u64,
    },
    RequestResponse {
        timestamp: DateTime<Utc>,
        request: CapturedRequest,
        response: CapturedResponse,
    },
    StreamChunk {
        timestamp: DateTime<Utc>,
        request: CapturedRequest,
        chunk: String,
    },
}

struct ActiveLog {
    tx: mpsc::UnboundedSender<DebugRecord>,
    done_rx: oneshot::Receiver<()>,
    path: PathBuf,
    started_at: DateTime<Utc>,
}

/// Handle to the process-wide capture session
///
/// Cheap to clone; all clones share the same session state. The log
/// directory must exist before a session is opened - creating it is part
/// of process initialization, not of this type.
#[derive(Clone)]
pub struct DebugSession {
    log_dir: PathBuf,
    inner: Arc<Mutex<Option<ActiveLog>>>,
}

impl DebugSession {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a capture session is currently open
    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Path of the open session log, if any
    pub fn log_path(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().as_ref().map(|l| l.path.clone())
    }

    /// Open a new session log, write the session_start marker and spawn the
    /// writer task. A no-op returning the current path when a session is
    /// already open.
    pub fn open(&self) -> anyhow::Result<PathBuf> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(active) = inner.as_ref() {
            return Ok(active.path.clone());
        }

        let started_at = Utc::now();
        let path = self.log_dir.join(format!(
            "debug_session_{}.jsonl",
            started_at.format("%Y%m%dT%H%M%S")
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("Failed to open debug log {:?}: {}", path, e))?;

        write_record(
            &mut file,
            &DebugRecord::SessionStart {
                session_start: started_at,
                message: "debug mode enabled".to_string(),
            },
        )?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(run_writer(file, rx, done_tx));

        tracing::info!("Debug capture session opened: {:?}", path);
        *inner = Some(ActiveLog {
            tx,
            done_rx,
            path: path.clone(),
            started_at,
        });
        Ok(path)
    }

    /// Queue the session_end marker and close the session, waiting until the
    /// writer has drained everything queued before it. A no-op when no
    /// session is open.
    pub async fn close(&self) {
        let active = self.inner.lock().unwrap().take();
        let Some(active) = active else {
            return;
        };

        let ended_at = Utc::now();
        let duration = (ended_at - active.started_at)
            .num_seconds()
            .max(0) as u64;
        let _ = active.tx.send(DebugRecord::SessionEnd {
            session_end: ended_at,
            message: "debug mode disabled".to_string(),
            duration_seconds: duration,
        });
        drop(active.tx);
        let _ = active.done_rx.await;
        tracing::info!("Debug capture session closed: {:?}", active.path);
    }

    /// Queue one record for the open session log. Never blocks on I/O.
    /// Silently does nothing when no session is open; write failures are
    /// logged by the writer task so they can never fail the proxied request.
    pub fn append(&self, record: DebugRecord) {
        let tx = {
            let inner = self.inner.lock().unwrap();
            match inner.as_ref() {
                Some(active) => active.tx.clone(),
                None => return,
            }
        };
        // Fails only while the session is shutting down; such stragglers
        // are dropped, matching the no-session case
        let _ = tx.send(record);
    }
}

/// Single writer for one session file. Drains the queue in send order and
/// exits after the session_end record (or when every sender is gone).
async fn run_writer(
    mut file: File,
    mut rx: mpsc::UnboundedReceiver<DebugRecord>,
    done_tx: oneshot::Sender<()>,
) {
    while let Some(record) = rx.recv().await {
        let is_end = matches!(record, DebugRecord::SessionEnd { .. });
        if let Err(e) = write_record(&mut file, &record) {
            tracing::warn!("Failed to append debug record: {}", e);
        }
        if is_end {
            break;
        }
    }
    let _ = done_tx.send(());
}

/// Serialize one record as a single JSON line and flush it, so records are
/// visible on disk even if the process dies mid-session
fn write_record(file: &mut File, record: &DebugRecord) -> anyhow::Result<()> {
    let json = serde_json::to_string(record)?;
    writeln!(file, "{}", json)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_session() -> (DebugSession, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "multiapi-debug-test-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).unwrap();
        (DebugSession::new(dir.clone()), dir)
    }

    fn read_records(path: &PathBuf) -> Vec<DebugRecord> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn chunk_record(text: &str) -> DebugRecord {
        DebugRecord::StreamChunk {
            timestamp: Utc::now(),
            request: CapturedRequest {
                method: "POST".to_string(),
                url: "https://api.example.com/v1/chat/completions".to_string(),
                headers: BTreeMap::new(),
                body: None,
                query: None,
            },
            chunk: text.to_string(),
        }
    }

    #[tokio::test]
    async fn session_lifecycle_writes_start_and_end_markers() {
        let (session, dir) = temp_session();
        assert!(!session.is_active());

        let path = session.open().unwrap();
        assert!(session.is_active());
        assert_eq!(session.log_path(), Some(path.clone()));

        session.close().await;
        assert!(!session.is_active());
        assert!(session.log_path().is_none());

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], DebugRecord::SessionStart { .. }));
        match &records[1] {
            // u64 duration is non-negative by construction; the assertion
            // documents the contract for the serialized form
            DebugRecord::SessionEnd {
                duration_seconds, ..
            } => assert!(*duration_seconds < 60),
            other => panic!("expected session_end, got {:?}", other),
        }

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn appends_are_ordered_and_drained_by_close() {
        let (session, dir) = temp_session();
        let path = session.open().unwrap();

        for text in ["a", "b", "c"] {
            session.append(chunk_record(text));
        }
        // close() waits for the writer, so everything queued above is on
        // disk when it returns
        session.close().await;

        let records = read_records(&path);
        let chunks: Vec<String> = records
            .iter()
            .filter_map(|r| match r {
                DebugRecord::StreamChunk { chunk, .. } => Some(chunk.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["a", "b", "c"]);
        // session_end comes after every queued record
        assert!(matches!(
            records.last(),
            Some(DebugRecord::SessionEnd { .. })
        ));

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn append_without_session_is_a_no_op() {
        let (session, dir) = temp_session();
        session.append(chunk_record("dropped"));
        assert!(session.log_path().is_none());

        // Directory stays empty - no file is created outside a session
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let (session, dir) = temp_session();
        let first = session.open().unwrap();
        let second = session.open().unwrap();
        assert_eq!(first, second);
        session.close().await;

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn append_never_blocks_on_the_writer() {
        let (session, dir) = temp_session();
        session.open().unwrap();

        // Queue a burst larger than any reasonable write batch; the calls
        // must all return immediately even while the writer is behind
        let started = std::time::Instant::now();
        for i in 0..1000 {
            session.append(chunk_record(&format!("chunk-{}", i)));
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        session.close().await;
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn records_round_trip_with_type_tags() {
        let json = serde_json::to_string(&chunk_record("data: {}\n\n")).unwrap();
        assert!(json.contains("\"type\":\"stream_chunk\""));

        let start = DebugRecord::SessionStart {
            session_start: Utc::now(),
            message: "debug mode enabled".to_string(),
        };
        assert!(serde_json::to_string(&start)
            .unwrap()
            .contains("\"type\":\"session_start\""));
    }
}
