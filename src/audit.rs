// =============================================================================
// Audit Sink — append-only, greppable event trail shared by every subsystem
// =============================================================================
//
// One record per line: `<ISO-8601> {<JSON body>}`. Body keys are wrapped in
// literal square brackets ("[TES_EVENT]", "[CHANNEL]", ...) so operators can
// pattern-match with plain grep. Records carry a truncated SHA-256 content
// signature for later integrity spot-checks.
//
// Producers never block: submit() is a bounded try_send, and any failure to
// enqueue or to write falls back to stderr. Per-producer order is preserved
// by the channel; there is no cross-producer ordering guarantee.
//
// Retention is time-bounded, not size-bounded: the writer rotates to
// `audit-YYYYMMDD.log` daily and deletes files older than the configured
// retention on rotation.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Truncated signature length in hex characters.
const SIGNATURE_LEN: usize = 16;

// =============================================================================
// Record
// =============================================================================

/// A single structured audit event.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event: String,
    pub channel: String,
    pub thread_group: String,
    pub thread_id: String,
    pub payload: Map<String, Value>,
    /// Milliseconds since epoch; stamped by the sink at submit time when 0.
    pub timestamp: i64,
}

impl AuditRecord {
    pub fn new(event: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            channel: channel.into(),
            thread_group: "core".to_string(),
            thread_id: format!("{:?}", std::thread::current().id()),
            payload: Map::new(),
            timestamp: 0,
        }
    }

    pub fn group(mut self, thread_group: impl Into<String>) -> Self {
        self.thread_group = thread_group.into();
        self
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn field_str(self, key: &str, value: impl Into<String>) -> Self {
        self.field(key, Value::String(value.into()))
    }
}

// =============================================================================
// Rendering helpers
// =============================================================================

/// Deterministic HSL color for an event key (hash → hue). Related records
/// group visually in log viewers that colorize on this field.
fn hsl_for_event(event: &str) -> String {
    let mut h: u32 = 2166136261;
    for b in event.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(16777619);
    }
    format!("hsl({}, 70%, 45%)", h % 360)
}

/// Truncated SHA-256 over the content-identifying fields.
fn sign(event: &str, timestamp: i64, payload: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.as_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(Value::Object(payload.clone()).to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..SIGNATURE_LEN].to_string()
}

/// Render one record to its on-disk line (without trailing newline).
fn render_line(record: &AuditRecord) -> String {
    let ts = DateTime::<Utc>::from_timestamp_millis(record.timestamp)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap());

    let mut body = Map::new();
    body.insert(
        "[TES_EVENT]".to_string(),
        Value::String(record.event.clone()),
    );
    body.insert(
        "[THREAD_GROUP]".to_string(),
        Value::String(record.thread_group.clone()),
    );
    body.insert(
        "[THREAD_ID]".to_string(),
        Value::String(record.thread_id.clone()),
    );
    body.insert(
        "[CHANNEL]".to_string(),
        Value::String(record.channel.clone()),
    );
    body.insert(
        "[HSL]".to_string(),
        Value::String(hsl_for_event(&record.event)),
    );
    body.insert(
        "[SIGNED]".to_string(),
        Value::String(sign(&record.event, record.timestamp, &record.payload)),
    );
    for (k, v) in &record.payload {
        body.insert(k.clone(), v.clone());
    }

    format!(
        "{} {}",
        ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        Value::Object(body)
    )
}

// =============================================================================
// Sink handle
// =============================================================================

/// Cheap-to-clone producer handle. All components hold one of these.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditRecord>>,
    clock: Arc<dyn Clock>,
}

impl AuditSink {
    /// Spawn the writer task and return the shared handle plus its join
    /// handle (awaited during shutdown to flush).
    pub fn spawn(
        dir: impl Into<PathBuf>,
        retention_days: u32,
        queue_depth: usize,
        clock: Arc<dyn Clock>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(16));
        let writer = AuditWriter {
            dir: dir.into(),
            retention_days,
            current_day: String::new(),
            file: None,
        };
        let handle = tokio::spawn(writer.run(rx));
        (
            Self {
                tx: Some(tx),
                clock,
            },
            handle,
        )
    }

    /// Handle that drops every record. Used in tests that do not assert on
    /// the trail.
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self { tx: None, clock }
    }

    /// Enqueue a record. Never blocks and never panics; when the queue is
    /// full or the writer is gone the record goes to stderr instead.
    pub fn submit(&self, mut record: AuditRecord) {
        if record.timestamp == 0 {
            record.timestamp = self.clock.now_ms();
        }
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(record) {
            let record = match err {
                mpsc::error::TrySendError::Full(r) => r,
                mpsc::error::TrySendError::Closed(r) => r,
            };
            eprintln!("[audit-overflow] {}", render_line(&record));
        }
    }

    /// Convenience for the common one-liner call sites.
    pub fn event(&self, event: &str, channel: &str) {
        self.submit(AuditRecord::new(event, channel));
    }

    /// Drop the producer side so the writer drains and exits; await the
    /// returned handle from `spawn` afterwards.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("connected", &self.tx.is_some())
            .finish()
    }
}

// =============================================================================
// Writer task
// =============================================================================

struct AuditWriter {
    dir: PathBuf,
    retention_days: u32,
    current_day: String,
    file: Option<File>,
}

impl AuditWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<AuditRecord>) {
        while let Some(record) = rx.recv().await {
            self.write(&record);
        }
        if let Some(file) = &mut self.file {
            let _ = file.flush();
        }
        debug!("audit writer drained and stopped");
    }

    fn write(&mut self, record: &AuditRecord) {
        let day = DateTime::<Utc>::from_timestamp_millis(record.timestamp)
            .map(|t| t.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "00000000".to_string());

        if day != self.current_day {
            self.rotate(&day);
        }

        let line = render_line(record);
        let ok = match &mut self.file {
            Some(file) => writeln!(file, "{line}").is_ok(),
            None => false,
        };
        if !ok {
            // AuditWriteFailed: stderr only, never back to the submitter.
            eprintln!("[audit-write-failed] {line}");
        }
    }

    fn rotate(&mut self, day: &str) {
        if let Some(file) = &mut self.file {
            let _ = file.flush();
        }
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(error = %e, dir = %self.dir.display(), "failed to create audit directory");
        }

        let path = self.dir.join(format!("audit-{day}.log"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                self.file = Some(file);
                self.current_day = day.to_string();
                debug!(path = %path.display(), "audit log rotated");
            }
            Err(e) => {
                eprintln!("[audit-write-failed] cannot open {}: {e}", path.display());
                self.file = None;
                self.current_day = day.to_string();
            }
        }

        self.prune(day);
    }

    /// Delete audit files whose date stamp is older than the retention
    /// horizon. Filenames outside the audit-YYYYMMDD.log pattern are left
    /// alone.
    fn prune(&self, current_day: &str) {
        let Ok(today) = chrono::NaiveDate::parse_from_str(current_day, "%Y%m%d") else {
            return;
        };
        let horizon = today - chrono::Days::new(self.retention_days as u64);

        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stamp) = name
                .strip_prefix("audit-")
                .and_then(|s| s.strip_suffix(".log"))
            else {
                continue;
            };
            if let Ok(stamp) = chrono::NaiveDate::parse_from_str(stamp, "%Y%m%d") {
                if stamp < horizon {
                    if std::fs::remove_file(entry.path()).is_ok() {
                        debug!(file = name, "pruned expired audit log");
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
