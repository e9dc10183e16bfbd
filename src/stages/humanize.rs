//! Response humanization.
//!
//! Turns the raw outcome of a question (a small-sheet answer, the per-table
//! query results, or nothing) into a sentence, then appends the running cost
//! of every completion call made for the question.

use tracing::info;

use crate::completion::CompletionClient;
use crate::error::Result;
use crate::models::QueryResult;
use crate::prompt::Prompt;
use crate::session::SessionContext;

use super::NO_ANSWER_FOUND;

pub const STAGE: &str = "response_humanizer_agent";

const SYSTEM_PROMPT: &str = r#"
You are a response humanizer bot that helps in converting raw answers and responses to a more human format.

Things to note:
- You will be given a query and a list of raw responses.
- The raw responses are generated by AI and may not be human readable.
- You have to convert the raw responses to a more human readable format.
- If the raw response is "no_answer_found", politely say that the workbook does not contain the answer.
- You will respond in a json format.

The json format is as follows:
{"response": "The human readable response"}
"#;

const FEW_SHOTS: &[(&str, &str, &str)] = &[
    (
        "What was the bid value of tender submitted for “TENDER-Civil Work for construction work of Central Stores and Work shop”?",
        "[[152138.798]]",
        r#"{"response": "The bid value of tender submitted for “TENDER-Civil Work for construction work of Central Stores and Work shop” was $152,138.80"}"#,
    ),
    (
        "How many tenders have been submitted in year 2015?",
        "31",
        r#"{"response": "31 tenders have been submitted in year 2015"}"#,
    ),
];

/// What the pipeline found before humanization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawAnswer {
    /// Answer read off the small-sheet images.
    Text(String),
    /// One entry per selected table, successful or not.
    Results(Vec<QueryResult>),
    NoAnswer,
}

impl RawAnswer {
    pub fn render(&self) -> String {
        match self {
            RawAnswer::Text(text) => text.clone(),
            RawAnswer::Results(results) => {
                serde_json::to_string(results).unwrap_or_else(|_| "[]".to_string())
            }
            RawAnswer::NoAnswer => NO_ANSWER_FOUND.to_string(),
        }
    }
}

fn frame(query: &str, raw: &str) -> String {
    format!(
        "Following is a query to review and humanize the response:\n\" {} \"\n\n\
         Following is the raw response:\n```\n{}\n```\n",
        query, raw
    )
}

pub fn cost_line(total_cost: f64) -> String {
    format!("Running cost of this answer: ${:.4}", total_cost)
}

pub struct ResponseHumanizer {
    client: CompletionClient,
}

impl ResponseHumanizer {
    pub fn new(client: CompletionClient) -> Self {
        Self { client }
    }

    pub fn prompt(question: &str, raw: &RawAnswer) -> Prompt {
        FEW_SHOTS
            .iter()
            .fold(Prompt::new(SYSTEM_PROMPT), |p, (q, r, a)| {
                p.few_shot(frame(q, r), *a)
            })
            .text(frame(question, &raw.render()))
    }

    /// Returns the humanized text with the cost line appended, and the
    /// accumulated cost it reports.
    pub async fn humanize(
        &self,
        ctx: &SessionContext,
        question: &str,
        raw: &RawAnswer,
    ) -> Result<(String, f64)> {
        info!(session = %ctx.session_id, "humanizing response");
        let response = self
            .client
            .complete(ctx, STAGE, &Self::prompt(question, raw), "response")
            .await?;
        let total = ctx.ledger.totals()?.total_cost;
        Ok((format!("{}\n\n{}", response.trim(), cost_line(total)), total))
    }
}
