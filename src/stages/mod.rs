//! Completion-driven pipeline stages.
//!
//! Each stage owns its prompt and returns a typed value. Stages that may have
//! nothing to say return [`Lookup::NotFound`] instead of a sentinel string, so
//! the orchestrator branches on a type rather than on string comparison.
//!
//! | Stage | Module | JSON field |
//! |-------|--------|------------|
//! | Small-sheet answerer | [`small_sheet`] | `answer` |
//! | Search-term extractor | [`extract`] | `search` |
//! | Query corrector | [`correct`] | `query` |
//! | Table selector | [`select`] | (no completion call) |
//! | SQL generator | [`sql`] | `query` |
//! | Response humanizer | [`humanize`] | `response` |

pub mod correct;
pub mod extract;
pub mod humanize;
pub mod select;
pub mod small_sheet;
pub mod sql;

pub use correct::QueryCorrector;
pub use extract::SearchTermExtractor;
pub use humanize::{RawAnswer, ResponseHumanizer};
pub use select::TableSelector;
pub use small_sheet::SmallSheetAnswerer;
pub use sql::SqlGenerator;

/// Reply of the small-sheet check when the images do not answer the question.
pub const NO_ANSWER_FOUND: &str = "no_answer_found";
/// Reply of the extractor when the question names no specific entity.
pub const NO_SEARCH_TERM_FOUND: &str = "no_search_term_found";

/// Result of a stage that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(&self) -> Option<&T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }
}

impl Lookup<String> {
    /// Maps a backend reply to a lookup. The sentinel is matched ignoring
    /// case and the space/underscore/hyphen spelling; an empty reply is
    /// `NotFound` too.
    pub fn from_reply(reply: String, sentinel: &str) -> Self {
        let trimmed = reply.trim();
        if trimmed.is_empty() || normalize(trimmed) == normalize(sentinel) {
            Lookup::NotFound
        } else {
            Lookup::Found(trimmed.to_string())
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim()
        .trim_matches('"')
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}
