//! Query correction against fuzzy-matched cell text.
//!
//! The extracted phrase may be misspelled or carry a prefix that is not in
//! the data ("TENDER-", "(Tender)"). The corrector asks the backend to
//! substitute the best real substring from the fuzzy scan. Without a term or
//! without candidates the question passes through unchanged and no call is
//! made.

use tracing::info;

use crate::completion::CompletionClient;
use crate::error::Result;
use crate::fuzzy::MatchSet;
use crate::prompt::Prompt;
use crate::session::SessionContext;

use super::Lookup;

pub const STAGE: &str = "search_term_query_correction_agent";

const SYSTEM_PROMPT: &str = r#"
You are a search query correction bot that helps in fixing query params to aid in better and accurate database search.

You have to keep the following in mind:
- You will be given a query that will contain some search word or string.
- You will also be given a list of possible highest matching substrings from the database.
- You have to replace the search term in the query with the correct term from the list of substrings.
- You will respond in a json format.
- Only create one response for each query. Despite the number of possible correct terms, you have to choose the best one that matches the query.

The json format is as follows:
{"query": "This is the 'corrected term' query"}

Respond in pure directly parseable json format.
"#;

struct Example {
    query: &'static str,
    candidates: &'static [&'static str],
    corrected: &'static str,
}

const EXAMPLES: &[Example] = &[
    Example {
        query: "What was the issue date of tender bond for 'TENDER-Construction of Internal Roads at Airport Showroom Zone at Duqm (Phase 1)'?",
        candidates: &["Construction of Internal Roads at Airport Showroom Zone at Duqm (Phase 1)"],
        corrected: r#"{"query": "What was the issue date of tender bond for 'Construction of Internal Roads at Airport Showroom Zone at Duqm (Phase 1)'?"}"#,
    },
    Example {
        query: "What is the expiry date of tender bond for “TENDER BOND NAME - Fishery Harbour At Khasab-Onshore Facilities and Associated Infrastrucutre-Construction of Fish Auctation Hall, Guard House and Boundary Wall”?",
        candidates: &[
            "Fishery Harbour At Khasab-Onshore Facilities and Associated Infrastrucutre-Construction of Fish Auctation Hall, Guard House and Boundary Wall",
            "NAME - Fishery Harbour At Khasab-Onshore Facilities and Associated Infrastrucutre-Construction of Fish Auctation Hall, Guard House and Boundary",
        ],
        corrected: r#"{"query": "What is the expiry date of tender bond for “Fishery Harbour At Khasab-Onshore Facilities and Associated Infrastrucutre-Construction of Fish Auctation Hall, Guard House and Boundary Wall”?"}"#,
    },
    Example {
        query: "What was the tender received date for “Civil Works for ESSAR at Duqm Refinery Phase 3 paCKAGE c (Tender)”?",
        candidates: &["Civil Works for ESSAR at Duqm Refinery Phase 3 paCKAGE c"],
        corrected: r#"{"query": "What was the tender received date for “Civil Works for ESSAR at Duqm Refinery Phase 3 paCKAGE c”?"}"#,
    },
];

fn candidate_list<S: AsRef<str>>(candidates: &[S]) -> String {
    candidates
        .iter()
        .map(|c| format!("\n - \"{}\"", c.as_ref()))
        .collect()
}

fn frame<S: AsRef<str>>(query: &str, candidates: &[S]) -> String {
    format!(
        "Following is a query to review and correct the search term in it:\n\"{}\"\n\n\
         Following are the possible correct search terms:\n{}\n",
        query,
        candidate_list(candidates)
    )
}

pub struct QueryCorrector {
    client: CompletionClient,
}

impl QueryCorrector {
    pub fn new(client: CompletionClient) -> Self {
        Self { client }
    }

    pub fn prompt(question: &str, candidates: &[String]) -> Prompt {
        EXAMPLES
            .iter()
            .fold(Prompt::new(SYSTEM_PROMPT), |p, ex| {
                p.few_shot(frame(ex.query, ex.candidates), ex.corrected)
            })
            .text(frame(question, candidates))
    }

    pub async fn correct(
        &self,
        ctx: &SessionContext,
        question: &str,
        term: &Lookup<String>,
        matches: &MatchSet,
    ) -> Result<String> {
        if !term.is_found() {
            info!("no search term; question passes through uncorrected");
            return Ok(question.to_string());
        }
        let candidates = matches.substrings();
        if candidates.is_empty() {
            info!("no fuzzy candidates; question passes through uncorrected");
            return Ok(question.to_string());
        }

        info!(session = %ctx.session_id, candidates = candidates.len(), "running query correction");
        let corrected = self
            .client
            .complete(ctx, STAGE, &Self::prompt(question, &candidates), "query")
            .await?;
        if corrected.trim().is_empty() {
            return Ok(question.to_string());
        }
        Ok(corrected)
    }
}
