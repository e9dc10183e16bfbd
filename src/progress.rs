//! Upload and question progress reporting.
//!
//! Indexing and answering emit a sequence of [`ProgressEvent`]s ending in
//! exactly one terminal event (`Indexed`, `Answer` or `Error`). The HTTP
//! layer streams them as newline-delimited JSON through a [`ChannelProgress`];
//! the CLI prints them on stderr (human or JSON) so stdout stays parseable
//! for scripts.

use std::io::Write;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

pub const MSG_PROCESSING: &str = "Analyzing: Processing the query. Please wait!";
pub const MSG_SMALL_SHEETS: &str = "Analyzing: Checking against small sheets. Please wait!";
pub const MSG_LARGE_SHEETS: &str =
    "Analyzing: No related data in small sheets, checking against large sheets. Please wait!";
pub const MSG_CORRECTING: &str = "Analyzing: Correcting query. Please wait!";
pub const MSG_TABLES: &str = "Analyzing: Checking against individual large sheets. Please wait!";

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Status(String),
    Processing(String),
    /// Terminal event of an upload.
    Indexed(String),
    /// Terminal event of a question.
    Answer { text: String, cost: f64 },
    Error(String),
}

impl ProgressEvent {
    pub fn processing(msg: &str) -> Self {
        ProgressEvent::Processing(msg.to_string())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Indexed(_) | ProgressEvent::Answer { .. } | ProgressEvent::Error(_)
        )
    }

    /// Wire shape of the event.
    pub fn to_json(&self) -> Value {
        match self {
            ProgressEvent::Status(msg) => json!({ "success": msg }),
            ProgressEvent::Processing(msg) => json!({ "success": msg, "action": "processing" }),
            ProgressEvent::Indexed(id) => json!({ "success": "indexed", "cuuid": id }),
            ProgressEvent::Answer { text, cost } => json!({
                "success": text,
                "action": "answer",
                "cost": format!("${:.4}", cost),
            }),
            ProgressEvent::Error(msg) => json!({ "error": msg }),
        }
    }

    /// One NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = self.to_json().to_string();
        line.push('\n');
        line
    }
}

/// Receives progress events. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Forwards events into a channel; the receiving end feeds the HTTP body.
/// A dropped receiver (client went away) is ignored.
pub struct ChannelProgress {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelProgress {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Human-friendly progress on stderr. Terminal events are left to the caller.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn emit(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Status(msg) | ProgressEvent::Processing(msg) => format!("{}\n", msg),
            ProgressEvent::Error(msg) => format!("error: {}\n", msg),
            ProgressEvent::Indexed(_) | ProgressEvent::Answer { .. } => return,
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: the wire NDJSON, one object per line on stdout.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn emit(&self, event: ProgressEvent) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(event.to_line().as_bytes());
        let _ = out.flush();
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Collects events in memory.
#[derive(Default)]
pub struct RecordingProgress {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stdout).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
