//! Error taxonomy for the question-answering pipeline.
//!
//! Stage-internal failures (a single table's SQL statement) never surface as
//! a [`PipelineError`] to the caller; they are folded into
//! [`QueryResult`](crate::models::QueryResult) entries. Everything else aborts
//! the question and is reported as one terminal error event.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network or HTTP failure talking to the completion backend, including timeouts.
    #[error("completion backend unavailable: {0}")]
    CompletionTransport(String),

    /// The backend answered, but not with the expected strict-JSON shape.
    #[error("malformed completion response from {stage}: {reason}")]
    MalformedResponse { stage: String, reason: String },

    /// A single generated SQL statement failed.
    #[error("query execution failed: {0}")]
    QueryExecution(String),

    #[error("no indexed data for session {0}: workbook has neither small nor big sheets")]
    NoIndexedData(String),

    #[error("session {0} is not indexed yet")]
    IndexIncomplete(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no table matched the search term")]
    NoMatchFound,

    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("relational store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("failed to read tabular data: {0}")]
    Dataset(String),

    #[error("session log write failed: {0}")]
    SessionLog(String),
}

impl PipelineError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::CompletionTransport(_) => "completion_transport",
            PipelineError::MalformedResponse { .. } => "malformed_response",
            PipelineError::QueryExecution(_) => "query_execution",
            PipelineError::NoIndexedData(_) => "no_indexed_data",
            PipelineError::IndexIncomplete(_) => "index_incomplete",
            PipelineError::SessionNotFound(_) => "session_not_found",
            PipelineError::NoMatchFound => "no_match_found",
            PipelineError::InvalidPrompt(_) => "invalid_prompt",
            PipelineError::Store(_) => "store",
            PipelineError::Dataset(_) => "dataset",
            PipelineError::SessionLog(_) => "session_log",
        }
    }

    pub(crate) fn malformed(stage: &str, reason: impl Into<String>) -> Self {
        PipelineError::MalformedResponse {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
