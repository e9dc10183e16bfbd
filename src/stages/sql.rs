//! Per-table SQL generation.
//!
//! One vision call per selected table: the prompt carries the table name,
//! its columns and the sample-rows image. Calls run concurrently up to
//! `max_parallel`; results come back in selection order.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::completion::CompletionClient;
use crate::error::{PipelineError, Result};
use crate::models::{GeneratedQuery, TableDescriptor};
use crate::prompt::Prompt;
use crate::render::read_data_url;
use crate::session::SessionContext;

const SYSTEM_PROMPT: &str = r#"
You are an SQL bot that helps in generating SQL queries from natural language queries.

You have to keep the following in mind:
- You will be given a query in natural language.
- You will be given the table name and the columns of the table along with their types.
- The attached image shows the first few rows of the table, use it to understand the data format.
- You have to generate the SQL query for the given natural language query.
- Always wrap the table name, column names and string values in double quotes.
- You will respond in a json format.

The json format is as follows:
{"query": "SELECT \"SOME COLUMN\" FROM \"table_name\" WHERE \"SOME OTHER COLUMN\" = \"some value\""}

Respond in pure directly parseable json format.
"#;

pub fn stage_name(index: usize) -> String {
    format!("sql_generator_{}", index)
}

pub struct SqlGenerator {
    client: CompletionClient,
    max_parallel: usize,
}

impl SqlGenerator {
    pub fn new(client: CompletionClient, max_parallel: usize) -> Self {
        Self {
            client,
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn prompt(
        question: &str,
        table: &TableDescriptor,
        image: Option<String>,
    ) -> Result<Prompt> {
        let columns = columns_json(&table.columns)?;
        let prompt = Prompt::new(SYSTEM_PROMPT).text(format!(
            "\nCarefully review the attached image and table structure.\n\
             Based on the information provided, please formulate an SQL query for the following query: \n\" {} \"\n\n\
             Table details:\n\nName: {}\n\nColumns:\n```\n{}\n```\n",
            question, table.table_name, columns
        ));
        Ok(match image {
            Some(url) => prompt.image(url),
            None => prompt,
        })
    }

    async fn generate_one(
        &self,
        ctx: &SessionContext,
        index: usize,
        question: &str,
        table: &TableDescriptor,
    ) -> Result<GeneratedQuery> {
        let image = match &table.sample_image {
            Some(path) => match read_data_url(path) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(table = %table.table_name, error = %e, "sample image unreadable");
                    None
                }
            },
            None => None,
        };
        let prompt = Self::prompt(question, table, image)?;
        let sql = self
            .client
            .complete(ctx, &stage_name(index), &prompt, "query")
            .await?;
        Ok(GeneratedQuery {
            table_name: table.table_name.clone(),
            sql: sql.trim().to_string(),
        })
    }

    pub async fn generate(
        &self,
        ctx: &SessionContext,
        question: &str,
        tables: &[TableDescriptor],
    ) -> Result<Vec<GeneratedQuery>> {
        info!(
            tables = tables.len(),
            parallel = self.max_parallel,
            "generating sql"
        );
        // A mapping closure kept inside the stream makes this future non-Send under tokio::spawn.
        let calls: Vec<_> = tables
            .iter()
            .enumerate()
            .map(|(i, table)| self.generate_one(ctx, i, question, table))
            .collect();
        stream::iter(calls)
            .buffered(self.max_parallel)
            .try_collect()
            .await
    }
}

fn columns_json(columns: &impl Serialize) -> Result<String> {
    serde_json::to_string_pretty(columns)
        .map_err(|e| PipelineError::InvalidPrompt(format!("column list: {}", e)))
}
