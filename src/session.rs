//! Per-session bookkeeping: usage ledger and audit log.
//!
//! A [`SessionContext`] is created for each question and passed to every
//! stage. Records go through the [`LogSink`] seam, so the same ledger can be
//! backed by a JSON Lines file in the session directory or by memory in tests.
//! Appends are serialized by the sink, which keeps concurrent SQL-generation
//! calls from interleaving records. Questions on the same session are
//! serialized by [`SessionLocks`], since each one resets the session's logs.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OwnedMutexGuard;

use crate::error::{PipelineError, Result};

pub const USAGE_FILE: &str = "usage.jsonl";
pub const AUDIT_FILE: &str = "audit.jsonl";

/// Append-only record sink.
pub trait LogSink: Send + Sync {
    fn append(&self, record: &Value) -> Result<()>;
    fn records(&self) -> Result<Vec<Value>>;
    /// Drops every record. Called at the start of each question.
    fn reset(&self) -> Result<()>;
}

/// JSON Lines file sink. One record per line.
pub struct JsonlFileSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn log_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::SessionLog(e.to_string())
}

impl LogSink for JsonlFileSink {
    fn append(&self, record: &Value) -> Result<()> {
        let _guard = self.lock.lock().map_err(log_err)?;
        let mut line = serde_json::to_string(record).map_err(log_err)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(log_err)?;
        file.write_all(line.as_bytes()).map_err(log_err)?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<Value>> {
        let _guard = self.lock.lock().map_err(log_err)?;
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path).map_err(log_err)?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(log_err)?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line).map_err(log_err)?);
        }
        Ok(out)
    }

    fn reset(&self) -> Result<()> {
        let _guard = self.lock.lock().map_err(log_err)?;
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(log_err)?;
        }
        Ok(())
    }
}

/// In-memory sink.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for MemorySink {
    fn append(&self, record: &Value) -> Result<()> {
        self.records.lock().map_err(log_err)?.push(record.clone());
        Ok(())
    }

    fn records(&self) -> Result<Vec<Value>> {
        Ok(self.records.lock().map_err(log_err)?.clone())
    }

    fn reset(&self) -> Result<()> {
        self.records.lock().map_err(log_err)?.clear();
        Ok(())
    }
}

/// Token counts reported by the backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Per-1000-token cost factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl CostRates {
    pub fn input_cost(&self, tokens: u64) -> f64 {
        round4(tokens as f64 / 1000.0 * self.input_per_1k)
    }

    pub fn output_cost(&self, tokens: u64) -> f64 {
        round4(tokens as f64 / 1000.0 * self.output_per_1k)
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub run_name: String,
    pub input_tokens: u64,
    pub input_cost: f64,
    pub output_tokens: u64,
    pub output_cost: f64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

pub struct UsageLedger {
    sink: Arc<dyn LogSink>,
    rates: CostRates,
}

impl UsageLedger {
    pub fn new(sink: Arc<dyn LogSink>, rates: CostRates) -> Self {
        Self { sink, rates }
    }

    pub fn record(&self, stage: &str, usage: TokenUsage) -> Result<UsageEntry> {
        let input_cost = self.rates.input_cost(usage.prompt_tokens);
        let output_cost = self.rates.output_cost(usage.completion_tokens);
        let entry = UsageEntry {
            run_name: stage.to_string(),
            input_tokens: usage.prompt_tokens,
            input_cost,
            output_tokens: usage.completion_tokens,
            output_cost,
            total_tokens: usage.total_tokens,
            total_cost: round4(input_cost + output_cost),
            timestamp: Utc::now().to_rfc3339(),
        };
        self.sink
            .append(&serde_json::to_value(&entry).map_err(log_err)?)?;
        Ok(entry)
    }

    pub fn entries(&self) -> Result<Vec<UsageEntry>> {
        self.sink
            .records()?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(log_err))
            .collect()
    }

    pub fn totals(&self) -> Result<UsageTotals> {
        let entries = self.entries()?;
        let mut totals = UsageTotals {
            calls: entries.len(),
            ..Default::default()
        };
        for e in &entries {
            totals.input_tokens += e.input_tokens;
            totals.output_tokens += e.output_tokens;
            totals.total_tokens += e.total_tokens;
            totals.total_cost += e.total_cost;
        }
        totals.total_cost = round4(totals.total_cost);
        Ok(totals)
    }

    pub fn reset(&self) -> Result<()> {
        self.sink.reset()
    }
}

/// Full request/response payloads per stage.
pub struct AuditLog {
    sink: Arc<dyn LogSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, process: &str, data: &Value) -> Result<()> {
        self.sink.append(&json!({
            "timestamp": Utc::now().to_rfc3339(),
            "process": process,
            "data": data,
        }))
    }

    pub fn entries(&self) -> Result<Vec<Value>> {
        self.sink.records()
    }

    /// Process names in append order.
    pub fn processes(&self) -> Result<Vec<String>> {
        Ok(self
            .entries()?
            .iter()
            .filter_map(|r| r.get("process").and_then(|p| p.as_str()))
            .map(|s| s.to_string())
            .collect())
    }

    pub fn reset(&self) -> Result<()> {
        self.sink.reset()
    }
}

/// Everything a stage needs to account for its completion calls.
pub struct SessionContext {
    pub session_id: String,
    pub ledger: UsageLedger,
    pub audit: AuditLog,
}

impl SessionContext {
    /// File-backed context writing into the session directory.
    pub fn for_session_dir(session_id: &str, dir: &Path, rates: CostRates) -> Self {
        Self {
            session_id: session_id.to_string(),
            ledger: UsageLedger::new(Arc::new(JsonlFileSink::new(dir.join(USAGE_FILE))), rates),
            audit: AuditLog::new(Arc::new(JsonlFileSink::new(dir.join(AUDIT_FILE)))),
        }
    }

    pub fn in_memory(session_id: &str, rates: CostRates) -> Self {
        Self {
            session_id: session_id.to_string(),
            ledger: UsageLedger::new(Arc::new(MemorySink::new()), rates),
            audit: AuditLog::new(Arc::new(MemorySink::new())),
        }
    }

    /// Clears the ledger and audit log before a new question.
    pub fn reset(&self) -> Result<()> {
        self.ledger.reset()?;
        self.audit.reset()
    }
}

/// One async lock per session id. A question holds its session's guard from
/// the log reset until its answer is produced.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other question holds `session_id`.
    pub async fn acquire(&self, session_id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().map_err(log_err)?;
            locks.entry(session_id.to_string()).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }
}
