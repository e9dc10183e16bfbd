//! Search-term extraction.
//!
//! Pulls a quoted, proper-noun-like phrase (typically a tender title) out of
//! the question. Aggregate questions yield [`Lookup::NotFound`].

use tracing::info;

use crate::completion::CompletionClient;
use crate::error::Result;
use crate::prompt::Prompt;
use crate::session::SessionContext;

use super::{Lookup, NO_SEARCH_TERM_FOUND};

pub const STAGE: &str = "search_term_extraction_agent";

const SYSTEM_PROMPT: &str = r#"
You are a search term extraction bot that helps in extracting search terms from queries to aid in better query processing and database search.

You have to keep the following in mind:
- You will be given a query that will contain some search word or string.
- You have extract the search term from the query.
- You will respond in a json format.
- If you can't find any valid search term in the the question, just return "no_search_term_found".

The json format is as follows:
{"search": "The answer to the question"}

If you can't find any valid search term in the the question, just return:
{"search": "no_search_term_found"}

Respond in pure directly parseable json format.
"#;

const FEW_SHOTS: &[(&str, &str)] = &[
    (
        "What was the issue date of tender bond for 'TENDER-Construction of Internal Roads at Airport Showroom Zone at Duqm (Phase 1)'?",
        r#"{"search": "TENDER-Construction of Internal Roads at Airport Showroom Zone at Duqm (Phase 1)"}"#,
    ),
    (
        "How many tenders were win in year 2016?",
        r#"{"search": "no_search_term_found"}"#,
    ),
    (
        "What was the submission date for “TENDER- Lulu at Palm Mall”?",
        r#"{"search": "TENDER- Lulu at Palm Mall"}"#,
    ),
    (
        "How many tenders were lost in year 2018?",
        r#"{"search": "no_search_term_found"}"#,
    ),
];

fn frame(query: &str) -> String {
    format!(
        "\nFollowing is a query to review and extract the search term:\n\" {} \"\n",
        query
    )
}

pub struct SearchTermExtractor {
    client: CompletionClient,
}

impl SearchTermExtractor {
    pub fn new(client: CompletionClient) -> Self {
        Self { client }
    }

    pub fn prompt(question: &str) -> Prompt {
        FEW_SHOTS
            .iter()
            .fold(Prompt::new(SYSTEM_PROMPT), |p, (q, a)| p.few_shot(frame(q), *a))
            .text(frame(question))
    }

    pub async fn extract(&self, ctx: &SessionContext, question: &str) -> Result<Lookup<String>> {
        info!(session = %ctx.session_id, "running search term extraction");
        let reply = self
            .client
            .complete(ctx, STAGE, &Self::prompt(question), "search")
            .await?;
        let term = Lookup::from_reply(reply, NO_SEARCH_TERM_FOUND);
        info!(found = term.is_found(), "search term extracted");
        Ok(term)
    }
}
