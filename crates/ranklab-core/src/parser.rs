//! Free-text score-matrix extraction (the PARSE stage).
//!
//! Models restate, hedge, and decorate their answers; the parser's contract
//! is to find the final well-formed k×k numeric block anyway, or to say
//! precisely why it could not. Parse failure is data, never a panic and
//! never an `Err` that aborts a pipeline: each failure kind is recorded and
//! counted against the replication's failure budget.

use serde::{Deserialize, Serialize};

/// A parsed k×k real-valued score matrix. `rows[i][j]` is the score of
/// candidate column `j` for stimulus row `i`. Out-of-range values are kept
/// as-is; range sanity is a downstream concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreMatrix {
    pub size: usize,
    pub rows: Vec<Vec<f64>>,
}

/// Typed reasons a response failed to parse. Each is independently
/// reportable and aggregated into the replication's [`ParseSummary`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseFailure {
    #[error("empty or whitespace-only response")]
    EmptyResponse,

    #[error("no {expected}x{expected} score block found")]
    NoMatrixFound { expected: usize },

    #[error("score block has {found} rows, expected {expected}")]
    WrongRowCount { expected: usize, found: usize },

    #[error("row {row} of the score block has {found} numeric values, expected {expected}")]
    TokenMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Per-replication tally of parse outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParseSummary {
    pub n_success: usize,
    pub n_empty: usize,
    pub n_no_matrix: usize,
    pub n_wrong_shape: usize,
}

impl ParseSummary {
    pub fn record_success(&mut self) {
        self.n_success += 1;
    }

    pub fn record_failure(&mut self, failure: &ParseFailure) {
        match failure {
            ParseFailure::EmptyResponse => self.n_empty += 1,
            ParseFailure::NoMatrixFound { .. } => self.n_no_matrix += 1,
            ParseFailure::WrongRowCount { .. } | ParseFailure::TokenMismatch { .. } => {
                self.n_wrong_shape += 1
            }
        }
    }

    pub fn n_failed(&self) -> usize {
        self.n_empty + self.n_no_matrix + self.n_wrong_shape
    }
}

/// The trailing numeric values of one line, after stripping any label or
/// commentary prefix. `1. Ada | 3 7 2` yields `[3.0, 7.0, 2.0]`.
fn trailing_numbers(line: &str) -> Vec<f64> {
    let mut values: Vec<f64> = Vec::new();
    for raw in line
        .split(|c: char| c.is_whitespace() || c == ',' || c == '|' || c == ';')
        .rev()
    {
        if raw.is_empty() {
            // Separator artifact ("3,  7" splits with empty fields).
            continue;
        }
        let token =
            raw.trim_matches(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'));
        if token.is_empty() {
            // A word: the numeric suffix ends here.
            break;
        }
        match token.parse::<f64>() {
            Ok(v) => values.push(v),
            Err(_) => break,
        }
    }
    values.reverse();
    values
}

/// Extract the final k×k score block from free-form text.
///
/// A qualifying run is exactly `k` consecutive lines, each ending in exactly
/// `k` numeric tokens. When several disjoint qualifying runs exist the last
/// one wins — models often restate earlier, incorrect tables before the
/// final answer.
pub fn parse_score_matrix(text: &str, k: usize) -> Result<ScoreMatrix, ParseFailure> {
    if text.trim().is_empty() {
        return Err(ParseFailure::EmptyResponse);
    }

    // Per-line trailing numeric values, blank lines dropped from run
    // accounting only when they carry no numbers at all.
    let lines: Vec<Vec<f64>> = text
        .lines()
        .map(trailing_numbers)
        .collect();

    // Maximal runs of consecutive lines with exactly k trailing numbers.
    let mut qualifying_runs: Vec<(usize, usize)> = Vec::new(); // (start, len)
    let mut run_start: Option<usize> = None;
    for (i, values) in lines.iter().enumerate() {
        if values.len() == k {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take() {
            qualifying_runs.push((start, i - start));
        }
    }
    if let Some(start) = run_start {
        qualifying_runs.push((start, lines.len() - start));
    }

    if let Some(&(start, _)) = qualifying_runs
        .iter()
        .filter(|&&(_, len)| len == k)
        .last()
    {
        let rows = lines[start..start + k].to_vec();
        return Ok(ScoreMatrix { size: k, rows });
    }

    // No exact-shape run. Diagnose the most specific failure we can.
    //
    // First: a run of at least k consecutive lines that all carry numbers,
    // where some row in the final k-line window has the wrong token count.
    // This catches a table with one short row, which fragments the
    // qualifying runs above.
    let mut numeric_runs: Vec<(usize, usize)> = Vec::new();
    let mut start: Option<usize> = None;
    for (i, values) in lines.iter().enumerate() {
        if !values.is_empty() {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            numeric_runs.push((s, i - s));
        }
    }
    if let Some(s) = start {
        numeric_runs.push((s, lines.len() - s));
    }
    if let Some(&(s, len)) = numeric_runs.last() {
        if len >= k {
            let window = s + len - k;
            for (row, values) in lines[window..window + k].iter().enumerate() {
                if values.len() != k {
                    return Err(ParseFailure::TokenMismatch {
                        row: row + 1,
                        expected: k,
                        found: values.len(),
                    });
                }
            }
        }
    }

    // Otherwise: well-shaped rows exist but grouped in a run of the wrong
    // length (truncated table, or a header row glued to the block).
    if let Some(&(_, len)) = qualifying_runs.last() {
        return Err(ParseFailure::WrongRowCount {
            expected: k,
            found: len,
        });
    }

    Err(ParseFailure::NoMatrixFound { expected: k })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_matrix() {
        let text = "1 2 3\n4 5 6\n7 8 9\n";
        let m = parse_score_matrix(text, 3).expect("parse");
        assert_eq!(m.rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0], vec![7.0, 8.0, 9.0]]);
    }

    #[test]
    fn test_prose_prefixes_are_stripped() {
        let text = "\
Here is my final answer.

1. Ada:    3 7 2
2. Grace:  8 1 4
3. Mary:   2 2 9
";
        let m = parse_score_matrix(text, 3).expect("parse");
        assert_eq!(m.rows[0], vec![3.0, 7.0, 2.0]);
        assert_eq!(m.rows[2], vec![2.0, 2.0, 9.0]);
    }

    #[test]
    fn test_last_qualifying_run_wins() {
        // The model restates a wrong table before the corrected one.
        let text = "\
First attempt (wrong):
1 1 1
2 2 2
3 3 3

Actually, the corrected scores:
9 8 7
6 5 4
3 2 1
";
        let m = parse_score_matrix(text, 3).expect("parse");
        assert_eq!(m.rows[0], vec![9.0, 8.0, 7.0]);
    }

    #[test]
    fn test_commas_pipes_and_decimals() {
        let text = "a | 1.5, 2.0, 3.25\nb | 4.0, 5.5, 6.0\nc | 7.0, 8.0, 9.5\n";
        let m = parse_score_matrix(text, 3).expect("parse");
        assert_eq!(m.rows[0], vec![1.5, 2.0, 3.25]);
    }

    #[test]
    fn test_out_of_range_values_accepted() {
        let text = "99 -4 1000\n1 2 3\n4 5 6\n";
        // The run is 3 lines long and each has 3 numbers; values pass through.
        let m = parse_score_matrix(text, 3).expect("parse");
        assert_eq!(m.rows[0], vec![99.0, -4.0, 1000.0]);
    }

    #[test]
    fn test_empty_response() {
        assert_eq!(parse_score_matrix("   \n\n  ", 3), Err(ParseFailure::EmptyResponse));
    }

    #[test]
    fn test_no_matrix_in_pure_prose() {
        let text = "I cannot produce a table for this request.";
        assert_eq!(
            parse_score_matrix(text, 3),
            Err(ParseFailure::NoMatrixFound { expected: 3 })
        );
    }

    #[test]
    fn test_wrong_row_count() {
        let text = "1 2 3\n4 5 6\n"; // only two qualifying rows for k=3
        assert_eq!(
            parse_score_matrix(text, 3),
            Err(ParseFailure::WrongRowCount { expected: 3, found: 2 })
        );
    }

    #[test]
    fn test_token_mismatch_inside_block() {
        let text = "1 2 3\n4 5\n7 8 9\n"; // middle row short for k=3
        assert_eq!(
            parse_score_matrix(text, 3),
            Err(ParseFailure::TokenMismatch { row: 2, expected: 3, found: 2 })
        );
    }

    #[test]
    fn test_header_row_breaks_exact_shape() {
        // Four consecutive lines of 3 numbers is a run of length 4, not 3.
        let text = "0 0 0\n1 2 3\n4 5 6\n7 8 9\n";
        assert_eq!(
            parse_score_matrix(text, 3),
            Err(ParseFailure::WrongRowCount { expected: 3, found: 4 })
        );
    }

    #[test]
    fn test_parse_summary_tally() {
        let mut summary = ParseSummary::default();
        summary.record_success();
        summary.record_failure(&ParseFailure::EmptyResponse);
        summary.record_failure(&ParseFailure::NoMatrixFound { expected: 5 });
        summary.record_failure(&ParseFailure::TokenMismatch { row: 1, expected: 5, found: 2 });
        assert_eq!(summary.n_success, 1);
        assert_eq!(summary.n_failed(), 3);
        assert_eq!(summary.n_wrong_shape, 1);
    }

    #[test]
    fn test_failure_serde_roundtrip() {
        let failures = [
            ParseFailure::EmptyResponse,
            ParseFailure::NoMatrixFound { expected: 5 },
            ParseFailure::WrongRowCount { expected: 5, found: 2 },
            ParseFailure::TokenMismatch { row: 3, expected: 5, found: 4 },
        ];
        for f in &failures {
            let json = serde_json::to_string(f).expect("serialize");
            let back: ParseFailure = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(*f, back);
        }
    }
}
