//! Fuzzy substring location over tabular cell text.
//!
//! Every cell is split on whitespace and each contiguous run of tokens is
//! compared against the search phrase with [`sequence_ratio`], a
//! longest-matching-blocks similarity in `[0, 1]`. The best run per
//! `(table, row, column)` is kept when it reaches the threshold.
//!
//! The scan is quadratic in tokens per cell, so cells are cut to
//! [`MAX_CELL_CHARS`] characters and `max_cell_tokens` tokens before
//! scanning. Runs too long to reach the threshold are never scored.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::error::Result;
use crate::models::FuzzyMatch;
use crate::stages::Lookup;
use crate::tabular::Dataset;

/// Characters of a cell considered by the scan.
pub const MAX_CELL_CHARS: usize = 4096;

/// Similarity ratio `2 * M / T` where `M` is the total size of the matching
/// blocks found by recursive longest-common-substring splitting and `T` is
/// the combined length of both strings, counted in characters.
///
/// Two empty strings are identical (`1.0`).
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matches = matching_characters(&a, &b);
    2.0 * matches as f64 / total as f64
}

fn matching_characters(a: &[char], b: &[char]) -> usize {
    let mut total = 0;
    let mut queue = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, k) = longest_match(a, b, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        total += k;
        if alo < i && blo < j {
            queue.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            queue.push((i + k, ahi, j + k, bhi));
        }
    }
    total
}

/// Longest common run in `a[alo..ahi]` / `b[blo..bhi]`. Ties resolve to the
/// earliest start in `a`, then the earliest start in `b`.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_k) = (alo, blo, 0);
    let width = bhi - blo;
    // prev[x + 1] holds the run length ending at a[i - 1], b[blo + x]
    let mut prev = vec![0usize; width + 1];
    let mut cur = vec![0usize; width + 1];
    for i in alo..ahi {
        for x in 0..width {
            cur[x + 1] = if a[i] == b[blo + x] { prev[x] + 1 } else { 0 };
            let k = cur[x + 1];
            if k > best_k {
                best_i = i + 1 - k;
                best_j = blo + x + 1 - k;
                best_k = k;
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    (best_i, best_j, best_k)
}

/// Matches from one scan, ordered by table, then row, then column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSet {
    matches: Vec<FuzzyMatch>,
}

impl MatchSet {
    pub fn matches(&self) -> &[FuzzyMatch] {
        &self.matches
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// Distinct matched tables, in first-seen order.
    pub fn tables(&self) -> Vec<String> {
        distinct(self.matches.iter().map(|m| m.table.as_str()))
    }

    /// Distinct matched substrings, in first-seen order.
    pub fn substrings(&self) -> Vec<String> {
        distinct(self.matches.iter().map(|m| m.substring.as_str()))
    }
}

fn distinct<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .filter(|s| seen.insert(*s))
        .map(|s| s.to_string())
        .collect()
}

/// Scans every cell of every dataset for the best sub-span matching `phrase`.
///
/// An empty or whitespace-only phrase returns no matches without scanning.
pub fn locate(
    datasets: &[Dataset],
    phrase: &str,
    threshold: f64,
    max_cell_tokens: usize,
) -> MatchSet {
    if phrase.trim().is_empty() {
        return MatchSet::default();
    }

    let mut matches = Vec::new();
    for dataset in datasets {
        // (row, column index) -> best match, ordered for deterministic output
        let mut best: BTreeMap<(usize, usize), (String, f64)> = BTreeMap::new();
        for (row_idx, row) in dataset.rows.iter().enumerate() {
            for (col_idx, cell) in row.iter().enumerate() {
                if let Some((substring, score)) =
                    best_span(cell, phrase, threshold, max_cell_tokens)
                {
                    best.insert((row_idx, col_idx), (substring, score));
                }
            }
        }
        for ((row, col), (substring, score)) in best {
            matches.push(FuzzyMatch {
                table: dataset.name.clone(),
                row,
                column: dataset
                    .columns
                    .get(col)
                    .cloned()
                    .unwrap_or_else(|| col.to_string()),
                substring,
                score,
            });
        }
    }
    debug!(phrase, matches = matches.len(), "fuzzy scan finished");
    MatchSet { matches }
}

fn best_span(
    cell: &str,
    phrase: &str,
    threshold: f64,
    max_cell_tokens: usize,
) -> Option<(String, f64)> {
    let cell = match cell.char_indices().nth(MAX_CELL_CHARS) {
        Some((end, _)) => &cell[..end],
        None => cell,
    };
    let words: Vec<&str> = cell.split_whitespace().take(max_cell_tokens).collect();
    let max_len = max_candidate_chars(phrase.chars().count(), threshold);
    let mut best: Option<(String, f64)> = None;
    for i in 0..words.len() {
        let mut len = 0usize;
        for j in (i + 1)..=words.len() {
            len += words[j - 1].chars().count() + usize::from(j > i + 1);
            if len > max_len {
                break;
            }
            let candidate = words[i..j].join(" ");
            let score = sequence_ratio(phrase, &candidate);
            if score < threshold {
                continue;
            }
            let better = match &best {
                Some((_, s)) => score > *s,
                None => true,
            };
            if better {
                best = Some((candidate, score));
            }
        }
    }
    best
}

/// Longest candidate (in characters) whose ratio against a phrase of
/// `phrase_len` characters can still reach `threshold`: the ratio is at most
/// `2p / (p + c)` when `c > p`.
fn max_candidate_chars(phrase_len: usize, threshold: f64) -> usize {
    if threshold <= 0.0 {
        return usize::MAX;
    }
    ((2.0 - threshold) * phrase_len as f64 / threshold + 1e-9).floor() as usize
}

/// Runs [`locate`] for an extracted term. A `NotFound` term short-circuits
/// before `load` is called, so no dataset is read or scanned.
pub fn locate_term<F>(
    term: &Lookup<String>,
    load: F,
    threshold: f64,
    max_cell_tokens: usize,
) -> Result<MatchSet>
where
    F: FnOnce() -> Result<Vec<Dataset>>,
{
    match term {
        Lookup::Found(phrase) if !phrase.trim().is_empty() => {
            let datasets = load()?;
            Ok(locate(&datasets, phrase, threshold, max_cell_tokens))
        }
        _ => Ok(MatchSet::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn tenders() -> Dataset {
        Dataset {
            name: "Tenders".into(),
            columns: vec!["Title".into(), "Issue Date".into()],
            rows: vec![
                vec!["TENDER-Roads Phase 1".into(), "2016-03-01".into()],
                vec!["Lulu at Palm Mall".into(), "2017-05-09".into()],
                vec!["Roads Phase 1 maintenance works".into(), "2018-01-01".into()],
            ],
        }
    }

    #[test]
    fn ratio_matches_reference_values() {
        assert_eq!(sequence_ratio("abcd", "bcde"), 0.75);
        assert_eq!(sequence_ratio("abc", "abc"), 1.0);
        assert_eq!(sequence_ratio("abc", "xyz"), 0.0);
        assert_eq!(sequence_ratio("", ""), 1.0);
        assert_eq!(sequence_ratio("abc", ""), 0.0);
    }

    #[test]
    fn ratio_is_symmetric_for_simple_inputs() {
        let a = "TENDER-Roads Phase 1";
        let b = "Roads Phase 1";
        assert_eq!(sequence_ratio(a, b), sequence_ratio(b, a));
    }

    #[test]
    fn ratio_counts_split_blocks() {
        // "ab" and "cd" match in order around a mismatch: M = 4, T = 10
        assert_eq!(sequence_ratio("abXcd", "abYcd"), 0.8);
    }

    #[test]
    fn exact_cell_matches_with_full_score() {
        let set = locate(&[tenders()], "TENDER-Roads Phase 1", 0.8, 64);
        let first = &set.matches()[0];
        assert_eq!(first.table, "Tenders");
        assert_eq!(first.row, 0);
        assert_eq!(first.column, "Title");
        assert_eq!(first.substring, "TENDER-Roads Phase 1");
        assert_eq!(first.score, 1.0);
    }

    #[test]
    fn all_matches_meet_threshold_and_keys_are_unique() {
        for threshold in [0.5, 0.6, 0.8, 0.95] {
            let set = locate(&[tenders()], "Roads Phase 1", threshold, 64);
            let mut keys = HashSet::new();
            for m in set.matches() {
                assert!(m.score >= threshold);
                assert!(keys.insert((m.table.clone(), m.row, m.column.clone())));
            }
        }
    }

    #[test]
    fn best_sub_span_is_kept_per_cell() {
        let set = locate(&[tenders()], "Roads Phase 1", 0.8, 64);
        let row2 = set.matches().iter().find(|m| m.row == 2).unwrap();
        assert_eq!(row2.substring, "Roads Phase 1");
        assert_eq!(row2.score, 1.0);
    }

    #[test]
    fn views_are_distinct_and_ordered() {
        let mut other = tenders();
        other.name = "Archive".into();
        let set = locate(&[tenders(), other], "Roads Phase 1", 0.8, 64);
        assert_eq!(set.tables(), vec!["Tenders", "Archive"]);
        let subs = set.substrings();
        let unique: HashSet<_> = subs.iter().collect();
        assert_eq!(unique.len(), subs.len());
    }

    #[test]
    fn empty_phrase_scans_nothing() {
        assert!(locate(&[tenders()], "   ", 0.0, 64).is_empty());
    }

    #[test]
    fn truncation_bounds_cell_tokens() {
        let ds = Dataset {
            name: "T".into(),
            columns: vec!["c".into()],
            rows: vec![vec!["alpha beta gamma target".into()]],
        };
        assert!(locate(&[ds.clone()], "target", 0.9, 3).is_empty());
        assert_eq!(locate(&[ds], "target", 0.9, 4).len(), 1);
    }

    #[test]
    fn not_found_term_never_loads_datasets() {
        let mut loaded = false;
        let set = locate_term(
            &Lookup::NotFound,
            || {
                loaded = true;
                Err(PipelineError::Dataset("should not be read".into()))
            },
            0.8,
            64,
        )
        .unwrap();
        assert!(set.is_empty());
        assert!(!loaded);
    }

    #[test]
    fn found_term_loads_and_scans() {
        let set = locate_term(
            &Lookup::Found("Lulu at Palm Mall".to_string()),
            || Ok(vec![tenders()]),
            0.8,
            64,
        )
        .unwrap();
        assert_eq!(set.tables(), vec!["Tenders"]);
    }

    #[test]
    fn span_length_cutoff_keeps_boundary_scores() {
        assert_eq!(max_candidate_chars(4, 0.8), 6);
        assert_eq!(
            best_span("abcdxy", "abcd", 0.8, 64),
            Some(("abcdxy".to_string(), 0.8))
        );
        assert_eq!(best_span("abcdxyz", "abcd", 0.8, 64), None);
        assert_eq!(max_candidate_chars(4, 0.0), usize::MAX);
    }

    #[test]
    fn very_long_tokens_are_cut_before_scanning() {
        let long = "x".repeat(100_000);
        let cell = format!("Lulu at Palm Mall {}", vec![long.as_str(); 64].join(" "));
        let found = best_span(&cell, "Lulu at Palm Mall", 0.8, 64);
        assert_eq!(found, Some(("Lulu at Palm Mall".to_string(), 1.0)));

        let hidden = format!("{} Lulu at Palm Mall", "y".repeat(MAX_CELL_CHARS));
        assert_eq!(best_span(&hidden, "Lulu at Palm Mall", 0.8, 64), None);
    }
}
