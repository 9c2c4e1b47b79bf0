//! Proctor events: what the session reports to the remote collector.

use serde::Serialize;
use serde_json::{json, Value};

use crate::policy::WarningCounts;
use crate::stage::ReleaseHandle;

/// Name of the Socket.IO event every proctor event is sent under.
pub const PROCTOR_EVENT: &str = "proctor_event";

/// Final score breakdown attached to the terminal events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub score: u32,
    pub threshold: u32,
    pub warnings: WarningCounts,
}

/// A condition worth reporting, before it is stamped with a session and time.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    TestConnection,
    LookingAway { yaw_angle: f32 },
    FaceNotDetected,
    MultipleFacesDetected { count: usize },
    ObjectDetected { label: String, confidence: f32 },
    SessionFlagged(ScoreSummary),
    InterviewTerminated(ScoreSummary),
}

impl Signal {
    /// Wire value of the event `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::TestConnection => "test_connection",
            Signal::LookingAway { .. } => "looking_away",
            Signal::FaceNotDetected => "face_not_detected",
            Signal::MultipleFacesDetected { .. } => "multiple_faces_detected",
            Signal::ObjectDetected { .. } => "object_detected",
            Signal::SessionFlagged(_) => "session_flagged",
            Signal::InterviewTerminated(_) => "interview_terminated",
        }
    }

    /// Event-specific `meta` object.
    pub fn meta(&self) -> Value {
        match self {
            Signal::TestConnection | Signal::FaceNotDetected => json!({}),
            Signal::LookingAway { yaw_angle } => json!({ "yaw_angle": yaw_angle }),
            Signal::MultipleFacesDetected { count } => json!({ "count": count }),
            Signal::ObjectDetected { label, confidence } => {
                json!({ "label": label, "confidence": confidence })
            }
            Signal::SessionFlagged(summary) | Signal::InterviewTerminated(summary) => {
                serde_json::to_value(summary).unwrap_or_else(|_| json!({}))
            }
        }
    }
}

/// One `proctor_event` payload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProctorEvent {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    meta: Value,
    at: f64,
}

impl ProctorEvent {
    /// Stamp a signal with the session id and the current wall-clock time.
    pub fn new(session_id: &str, signal: &Signal) -> Self {
        let now = chrono::Utc::now();
        Self::at(session_id, signal, now.timestamp_micros() as f64 / 1_000_000.0)
    }

    /// Stamp a signal with an explicit Unix-epoch timestamp in seconds.
    pub fn at(session_id: &str, signal: &Signal, at: f64) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind: signal.kind(),
            meta: signal.meta(),
            at,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }

    pub fn timestamp(&self) -> f64 {
        self.at
    }
}

/// Destination for proctor events.
///
/// Emission is fire-and-forget: implementations swallow and log delivery
/// failures. `close` must be idempotent.
pub trait EventSink {
    fn emit(&mut self, event: ProctorEvent);
    fn close(&mut self);

    /// Handle that closes the sink from another thread, including while the
    /// owner is blocked in `emit`.
    fn close_handle(&self) -> Option<ReleaseHandle> {
        None
    }
}
