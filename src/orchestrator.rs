//! Question answering state machine.
//!
//! ```text
//! START -> SMALL_SHEET_CHECK -> ANSWERED ----------------------------> HUMANIZATION -> DONE
//!                            \-> BIG_SHEET_SEARCH -> TERM_EXTRACTION
//!                                -> TERM_CORRECTION -> TABLE_SELECTION
//!                                -> SQL_GENERATION -> EXECUTION -> HUMANIZATION -> DONE
//! ```
//!
//! Every question ends in exactly one terminal progress event: an answer or
//! an error. Index problems (`NoIndexedData`, `IndexIncomplete`) are detected
//! before any completion call. A failing SQL statement is recorded in its
//! [`QueryResult`] and never aborts the batch.

use std::fmt;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::completion::CompletionClient;
use crate::config::{Config, RetrievalConfig};
use crate::error::{PipelineError, Result};
use crate::fuzzy::{locate_term, MatchSet};
use crate::index::{load_index, session_dir};
use crate::models::{BigSheetTable, GeneratedQuery, QueryOutcome, QueryResult, WorkbookIndex};
use crate::progress::{self, ProgressEvent, ProgressSink};
use crate::session::{CostRates, SessionContext, SessionLocks};
use crate::stages::{
    Lookup, QueryCorrector, RawAnswer, ResponseHumanizer, SearchTermExtractor, SmallSheetAnswerer,
    SqlGenerator, TableSelector,
};
use crate::store::RelationalStore;
use crate::tabular::Dataset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    SmallSheetCheck,
    Answered,
    BigSheetSearch,
    TermExtraction,
    TermCorrection,
    TableSelection,
    SqlGeneration,
    Execution,
    Humanization,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Start => "START",
            PipelineState::SmallSheetCheck => "SMALL_SHEET_CHECK",
            PipelineState::Answered => "ANSWERED",
            PipelineState::BigSheetSearch => "BIG_SHEET_SEARCH",
            PipelineState::TermExtraction => "TERM_EXTRACTION",
            PipelineState::TermCorrection => "TERM_CORRECTION",
            PipelineState::TableSelection => "TABLE_SELECTION",
            PipelineState::SqlGeneration => "SQL_GENERATION",
            PipelineState::Execution => "EXECUTION",
            PipelineState::Humanization => "HUMANIZATION",
            PipelineState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Which branch produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerPath {
    SmallSheets,
    BigSheets,
    NoAnswer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub total_cost: f64,
    pub path: AnswerPath,
    /// Per-table results in selection order; empty unless the big-sheet branch ran.
    pub results: Vec<QueryResult>,
    /// States visited, in order.
    pub trace: Vec<PipelineState>,
}

/// Runs each generated statement on its own; a failure becomes an error
/// entry for that table. Output order follows the input.
pub async fn execute_queries(store: &RelationalStore, queries: &[GeneratedQuery]) -> Vec<QueryResult> {
    let mut results = Vec::with_capacity(queries.len());
    for query in queries {
        let outcome = match store.execute(&query.sql).await {
            Ok(rows) => {
                debug!(table = %query.table_name, rows = rows.len(), "query executed");
                QueryOutcome::Rows(rows)
            }
            Err(e) => {
                warn!(table = %query.table_name, error = %e, "query failed");
                QueryOutcome::Error(match e {
                    PipelineError::QueryExecution(msg) => msg,
                    other => other.to_string(),
                })
            }
        };
        results.push(QueryResult {
            table_name: query.table_name.clone(),
            query: query.sql.clone(),
            outcome,
        });
    }
    results
}

pub struct Pipeline {
    small_sheet: SmallSheetAnswerer,
    extractor: SearchTermExtractor,
    corrector: QueryCorrector,
    selector: TableSelector,
    sql: SqlGenerator,
    humanizer: ResponseHumanizer,
    retrieval: RetrievalConfig,
    locks: SessionLocks,
}

struct Run<'a> {
    ctx: &'a SessionContext,
    progress: &'a dyn ProgressSink,
    trace: Vec<PipelineState>,
}

impl Run<'_> {
    fn enter(&mut self, state: PipelineState) {
        debug!(session = %self.ctx.session_id, %state, "pipeline state");
        self.trace.push(state);
    }

    fn processing(&self, msg: &str) {
        self.progress.emit(ProgressEvent::processing(msg));
    }
}

impl Pipeline {
    pub fn new(client: CompletionClient, config: &Config) -> Self {
        Self {
            small_sheet: SmallSheetAnswerer::new(client.clone()),
            extractor: SearchTermExtractor::new(client.clone()),
            corrector: QueryCorrector::new(client.clone()),
            selector: TableSelector::new(config.retrieval.no_match_policy),
            sql: SqlGenerator::new(client.clone(), config.completion.max_parallel),
            humanizer: ResponseHumanizer::new(client),
            retrieval: config.retrieval.clone(),
            locks: SessionLocks::new(),
        }
    }

    /// Answers a question and emits the terminal `Answer` or `Error` event.
    pub async fn ask(
        &self,
        ctx: &SessionContext,
        index: &WorkbookIndex,
        question: &str,
        progress: &dyn ProgressSink,
    ) -> Result<Answer> {
        let mut run = Run {
            ctx,
            progress,
            trace: Vec::new(),
        };
        match self.run(&mut run, index, question).await {
            Ok(answer) => {
                progress.emit(ProgressEvent::Answer {
                    text: answer.text.clone(),
                    cost: answer.total_cost,
                });
                Ok(answer)
            }
            Err(e) => {
                warn!(session = %ctx.session_id, code = e.code(), error = %e, "question failed");
                progress.emit(ProgressEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run(&self, run: &mut Run<'_>, index: &WorkbookIndex, question: &str) -> Result<Answer> {
        run.enter(PipelineState::Start);
        let session = run.ctx.session_id.clone();
        if !index.is_complete() {
            return Err(PipelineError::IndexIncomplete(session));
        }
        let small = index.small_sheets();
        let has_store = index.has_relational_store();
        if small.is_none() && !has_store {
            return Err(PipelineError::NoIndexedData(session));
        }
        run.processing(progress::MSG_PROCESSING);

        if let Some(images) = small {
            run.enter(PipelineState::SmallSheetCheck);
            run.processing(progress::MSG_SMALL_SHEETS);
            if let Lookup::Found(answer) = self.small_sheet.answer(run.ctx, question, images).await? {
                run.enter(PipelineState::Answered);
                info!(session = %session, "answered from small sheets");
                return self
                    .finish(run, question, RawAnswer::Text(answer), AnswerPath::SmallSheets, Vec::new())
                    .await;
            }
        }

        let (tables, store_path) = match (index.big_sheets(), &index.relational_store_path) {
            (Some(tables), Some(path)) if has_store => (tables, path),
            _ => {
                return self
                    .finish(run, question, RawAnswer::NoAnswer, AnswerPath::NoAnswer, Vec::new())
                    .await;
            }
        };

        run.enter(PipelineState::BigSheetSearch);
        run.processing(progress::MSG_LARGE_SHEETS);

        run.enter(PipelineState::TermExtraction);
        run.processing(progress::MSG_CORRECTING);
        let term = self.extractor.extract(run.ctx, question).await?;
        let matches = self.scan(&term, tables)?;

        run.enter(PipelineState::TermCorrection);
        let corrected = self
            .corrector
            .correct(run.ctx, question, &term, &matches)
            .await?;
        if corrected != question {
            info!(session = %session, corrected = %corrected, "question corrected");
        }

        run.enter(PipelineState::TableSelection);
        let store = RelationalStore::open_read_only(store_path).await?;
        let results = self
            .query_tables(run, &corrected, tables, &matches, &store)
            .await;
        store.close().await;
        let results = results?;

        self.finish(
            run,
            &corrected,
            RawAnswer::Results(results.clone()),
            AnswerPath::BigSheets,
            results,
        )
        .await
    }

    /// One fuzzy scan over every big sheet's CSV; skipped for `NotFound`.
    fn scan(&self, term: &Lookup<String>, tables: &[BigSheetTable]) -> Result<MatchSet> {
        locate_term(
            term,
            || {
                tables
                    .iter()
                    .map(|t| {
                        Dataset::read_csv(&t.table_name, &t.tabular_path)
                            .map_err(|e| PipelineError::Dataset(format!("{:#}", e)))
                    })
                    .collect()
            },
            self.retrieval.fuzzy_threshold,
            self.retrieval.max_cell_tokens,
        )
    }

    async fn query_tables(
        &self,
        run: &mut Run<'_>,
        question: &str,
        tables: &[BigSheetTable],
        matches: &MatchSet,
        store: &RelationalStore,
    ) -> Result<Vec<QueryResult>> {
        let descriptors = self.selector.select(tables, matches, store).await?;

        run.enter(PipelineState::SqlGeneration);
        run.processing(progress::MSG_TABLES);
        let queries = self.sql.generate(run.ctx, question, &descriptors).await?;

        run.enter(PipelineState::Execution);
        Ok(execute_queries(store, &queries).await)
    }

    async fn finish(
        &self,
        run: &mut Run<'_>,
        question: &str,
        raw: RawAnswer,
        path: AnswerPath,
        results: Vec<QueryResult>,
    ) -> Result<Answer> {
        run.enter(PipelineState::Humanization);
        let (text, total_cost) = self.humanizer.humanize(run.ctx, question, &raw).await?;
        run.enter(PipelineState::Done);
        Ok(Answer {
            text,
            total_cost,
            path,
            results,
            trace: std::mem::take(&mut run.trace),
        })
    }
}

/// Loads the session, resets its usage and audit logs, and answers.
///
/// Questions on one session run one at a time; the session lock is held from
/// the reset to the answer. Lookup failures are reported through `progress`
/// like any other error.
pub async fn ask_session(
    pipeline: &Pipeline,
    root: &Path,
    rates: CostRates,
    session_id: &str,
    question: &str,
    progress: &dyn ProgressSink,
) -> Result<Answer> {
    let index = match load_index(root, session_id) {
        Ok(index) => index,
        Err(e) => {
            progress.emit(ProgressEvent::Error(e.to_string()));
            return Err(e);
        }
    };
    let _guard = match pipeline.locks.acquire(session_id).await {
        Ok(guard) => guard,
        Err(e) => {
            progress.emit(ProgressEvent::Error(e.to_string()));
            return Err(e);
        }
    };
    let ctx = SessionContext::for_session_dir(session_id, &session_dir(root, session_id), rates);
    if let Err(e) = ctx.reset() {
        progress.emit(ProgressEvent::Error(e.to_string()));
        return Err(e);
    }
    info!(session = %session_id, "answering question");
    pipeline.ask(&ctx, &index, question, progress).await
}

pub fn cost_rates(config: &Config) -> CostRates {
    CostRates {
        input_per_1k: config.completion.input_cost_per_1k,
        output_per_1k: config.completion.output_cost_per_1k,
    }
}
