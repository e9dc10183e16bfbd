//! Table selection. No completion call.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::config::NoMatchPolicy;
use crate::error::{PipelineError, Result};
use crate::fuzzy::MatchSet;
use crate::models::{BigSheetTable, TableDescriptor};
use crate::store::RelationalStore;

pub struct TableSelector {
    policy: NoMatchPolicy,
}

impl TableSelector {
    pub fn new(policy: NoMatchPolicy) -> Self {
        Self { policy }
    }

    /// Picks the tables to query, in workbook sheet order.
    ///
    /// Tables named by the match set are kept. An empty match set (no term,
    /// or a term that matched nothing) falls back according to the policy.
    pub fn choose<'a>(
        &self,
        tables: &'a [BigSheetTable],
        matches: &MatchSet,
    ) -> Result<Vec<&'a BigSheetTable>> {
        if matches.is_empty() {
            return match self.policy {
                NoMatchPolicy::AllTables => {
                    info!(tables = tables.len(), "no fuzzy match; selecting every table");
                    Ok(tables.iter().collect())
                }
                NoMatchPolicy::Fail => Err(PipelineError::NoMatchFound),
            };
        }
        let wanted: HashSet<String> = matches.tables().into_iter().collect();
        let chosen: Vec<&BigSheetTable> = tables
            .iter()
            .filter(|t| wanted.contains(&t.table_name))
            .collect();
        if chosen.is_empty() {
            warn!("matched tables are not part of the index");
            return Err(PipelineError::NoMatchFound);
        }
        Ok(chosen)
    }

    pub async fn select(
        &self,
        tables: &[BigSheetTable],
        matches: &MatchSet,
        store: &RelationalStore,
    ) -> Result<Vec<TableDescriptor>> {
        let mut out = Vec::new();
        for table in self.choose(tables, matches)? {
            out.push(TableDescriptor {
                table_name: table.table_name.clone(),
                columns: store.describe(&table.table_name).await?,
                sample_image: table.sample_image.clone(),
            });
        }
        info!(selected = out.len(), "tables selected");
        Ok(out)
    }
}
