// =============================================================================
// Lifecycle Manager — per-session phase tracking and tension scoring
// =============================================================================
//
// Observes open/frame/close from the stream client through the observer
// interface; never touches the socket. Each socket open starts a session:
//
//   INIT --first frame--> AUTH --first payload frame--> ACTIVE
//   ACTIVE --renewal marker--> RENEW --next ordinary frame--> ACTIVE
//   close --> EVICT --grace >= 5 s--> erased
//
// Renewal markers: a binary frame whose first byte is opcode 0x01, or a JSON
// frame with {"type":"renew"}, {"opcode":1}, or {"renewal":true}.
//
// Every transition computes a tension score in [0, 1] from frame latency,
// error rate, queue depth, and memory pressure, weighted by phase. Scores
// above 0.7 raise TENSION_SPIKE with an EVICT_IMMINENT forecast.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink};
use crate::clock::Clock;
use crate::upstream::stream::{RawFrame, StreamObserver};

/// How long an evicted session lingers before erasure.
const EVICT_GRACE_MS: i64 = 5_000;

/// Tension score above which the session is forecast to evict.
const TENSION_SPIKE_THRESHOLD: f64 = 0.7;

/// Renewal opcode carried in the first byte of binary renewal frames.
const RENEWAL_OPCODE: u8 = 0x01;

/// Binary frames at or under this size are heartbeats unless they carry the
/// renewal opcode.
const CONTROL_BINARY_MAX: usize = 16;

// =============================================================================
// Phases and scoring
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Auth,
    Active,
    Renew,
    Evict,
}

impl Phase {
    /// Phase weight applied to the combined tension score.
    fn weight(&self) -> f64 {
        match self {
            Self::Auth => 1.5,
            Self::Renew => 2.0,
            _ => 1.0,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Auth => "AUTH",
            Self::Active => "ACTIVE",
            Self::Renew => "RENEW",
            Self::Evict => "EVICT",
        };
        write!(f, "{s}")
    }
}

/// Raw gauges feeding the tension score.
#[derive(Debug, Clone, Copy, Default)]
pub struct TensionInputs {
    pub latency_ms: f64,
    pub error_rate: f64,
    pub queue_depth: f64,
    pub mem_mb: f64,
}

/// `base = min(1, latency/100ms + error_rate)`;
/// `advanced = min(1, queue/100 + min(1, mem/1024))`;
/// `combined = 0.6*base + 0.4*advanced`, phase-weighted, clamped to [0, 1].
pub fn tension_score(inputs: &TensionInputs, phase: Phase) -> f64 {
    let base = (inputs.latency_ms / 100.0 + inputs.error_rate).min(1.0);
    let advanced = (inputs.queue_depth / 100.0 + (inputs.mem_mb / 1024.0).min(1.0)).min(1.0);
    let combined = 0.6 * base + 0.4 * advanced;
    (combined * phase.weight()).clamp(0.0, 1.0)
}

/// Snapshot of one tracked session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: Uuid,
    pub phase: Phase,
    pub entered_at: i64,
    pub tension: f64,
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Default)]
struct Inner {
    session: Option<SessionState>,
    frames: u64,
    errors: u64,
    last_frame_ms: i64,
    queue_depth: f64,
    mem_mb: f64,
    evicted_at: i64,
}

pub struct LifecycleManager {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl LifecycleManager {
    pub fn new(clock: Arc<dyn Clock>, audit: AuditSink) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            audit,
        }
    }

    pub fn session(&self) -> Option<SessionState> {
        self.inner.lock().session.clone()
    }

    /// Feed operational gauges (tick-queue depth, resident memory) that the
    /// observer cannot see on its own. Called from the watchdog task.
    pub fn set_gauges(&self, queue_depth: f64, mem_mb: f64) {
        let mut inner = self.inner.lock();
        inner.queue_depth = queue_depth;
        inner.mem_mb = mem_mb;
    }

    /// Record an out-of-band error against the current session.
    pub fn note_error(&self) {
        self.inner.lock().errors += 1;
    }

    /// Erase an evicted session once its grace period has passed. Driven by
    /// a periodic task; also implied by the next `on_open`.
    pub fn reap(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let expired = matches!(&inner.session, Some(s) if s.phase == Phase::Evict)
            && now - inner.evicted_at >= EVICT_GRACE_MS;
        if expired {
            if let Some(s) = inner.session.take() {
                debug!(session_id = %s.session_id, "evicted session erased");
                self.audit.submit(
                    AuditRecord::new("SESSION_ERASED", "lifecycle")
                        .field_str("sessionId", s.session_id.to_string()),
                );
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: Phase) {
        let now = self.clock.now_ms();
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        let from = session.phase;

        let latency_ms = if inner.last_frame_ms > 0 {
            (now - inner.last_frame_ms) as f64
        } else {
            0.0
        };
        let inputs = TensionInputs {
            latency_ms,
            error_rate: inner.errors as f64 / inner.frames.max(1) as f64,
            queue_depth: inner.queue_depth,
            mem_mb: inner.mem_mb,
        };
        let tension = tension_score(&inputs, to);

        session.phase = to;
        session.entered_at = now;
        session.tension = tension;
        let session_id = session.session_id;

        let forecast = if tension > TENSION_SPIKE_THRESHOLD {
            "EVICT_IMMINENT"
        } else {
            "STABLE"
        };

        info!(
            session_id = %session_id,
            from = %from,
            to = %to,
            tension = format!("{tension:.3}"),
            forecast,
            "session transition"
        );
        self.audit.submit(
            AuditRecord::new("SESSION_PHASE", "lifecycle")
                .field_str("sessionId", session_id.to_string())
                .field_str("from", from.to_string())
                .field_str("to", to.to_string())
                .field("tension", serde_json::json!(tension))
                .field_str("forecast", forecast),
        );

        if tension > TENSION_SPIKE_THRESHOLD {
            self.audit.submit(
                AuditRecord::new("TENSION_SPIKE", "lifecycle")
                    .field_str("sessionId", session_id.to_string())
                    .field("tension", serde_json::json!(tension))
                    .field_str("phase", to.to_string()),
            );
        }
    }
}

/// Resident set size in MiB, best effort. Feeds the memory term of the
/// tension score; 0.0 when the platform offers no cheap answer.
pub fn resident_mem_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                return (rss_pages * 4096) as f64 / (1024.0 * 1024.0);
            }
        }
    }
    0.0
}

// =============================================================================
// Frame classification
// =============================================================================

enum FrameClass {
    /// Keep-alives and heartbeats; never advance the phase machine.
    Control,
    /// Server-pushed token renewal indicator.
    Renewal,
    /// Anything else carrying a payload.
    Ordinary,
}

fn classify(frame: &RawFrame<'_>) -> FrameClass {
    match frame {
        RawFrame::Text(text) => {
            let trimmed = text.trim();
            if trimmed == "ok" {
                return FrameClass::Control;
            }
            if trimmed.starts_with('{') {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                    let is_renewal = value["type"] == "renew"
                        || value["opcode"] == 1
                        || value["renewal"] == true;
                    if is_renewal {
                        return FrameClass::Renewal;
                    }
                }
            }
            FrameClass::Ordinary
        }
        RawFrame::Binary(data) => {
            if data.first() == Some(&RENEWAL_OPCODE) {
                return FrameClass::Renewal;
            }
            if data.len() <= CONTROL_BINARY_MAX {
                return FrameClass::Control;
            }
            FrameClass::Ordinary
        }
    }
}

// =============================================================================
// Observer wiring
// =============================================================================

impl StreamObserver for LifecycleManager {
    fn on_open(&self, group: &str) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.session.take() {
            self.audit.submit(
                AuditRecord::new("SESSION_ERASED", "lifecycle")
                    .field_str("sessionId", old.session_id.to_string()),
            );
        }

        let session_id = Uuid::new_v4();
        let now = self.clock.now_ms();
        inner.session = Some(SessionState {
            session_id,
            phase: Phase::Init,
            entered_at: now,
            tension: 0.0,
        });
        inner.frames = 0;
        inner.errors = 0;
        inner.last_frame_ms = 0;

        info!(session_id = %session_id, group, "session opened");
        self.audit.submit(
            AuditRecord::new("SESSION_OPEN", "lifecycle")
                .field_str("sessionId", session_id.to_string())
                .field_str("group", group),
        );
    }

    fn on_frame(&self, frame: &RawFrame<'_>) {
        let mut inner = self.inner.lock();
        let Some(phase) = inner.session.as_ref().map(|s| s.phase) else {
            return;
        };
        inner.frames += 1;

        let next = match (phase, classify(frame)) {
            // The upstream accepted the token at the upgrade; the first frame
            // of any kind confirms auth.
            (Phase::Init, _) => Some(Phase::Auth),
            (Phase::Auth, FrameClass::Ordinary) => Some(Phase::Active),
            (Phase::Auth, FrameClass::Renewal) => Some(Phase::Renew),
            (Phase::Active, FrameClass::Renewal) => Some(Phase::Renew),
            (Phase::Renew, FrameClass::Ordinary) => Some(Phase::Active),
            _ => None,
        };

        if let Some(next) = next {
            self.transition(&mut inner, next);
        }
        inner.last_frame_ms = self.clock.now_ms();
    }

    fn on_close(&self, code: u16) {
        let mut inner = self.inner.lock();
        if code != 1000 {
            inner.errors += 1;
        }
        if inner.session.is_some() {
            self.transition(&mut inner, Phase::Evict);
            inner.evicted_at = self.clock.now_ms();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
