//! Performance and bias metrics (the ANALYZE stage).
//!
//! Chance expectations are closed-form in `k`, so every observed metric has
//! a "lift" twin (observed / chance) that is comparable across group sizes.

use serde::{Deserialize, Serialize};

use crate::parser::ScoreMatrix;
use crate::stats::students_t_p_value;

/// k-th harmonic number.
pub fn harmonic(k: usize) -> f64 {
    (1..=k).map(|j| 1.0 / j as f64).sum()
}

/// Chance-level MRR: `(1/k) * sum_{j=1..k} 1/j`.
pub fn chance_mrr(k: usize) -> f64 {
    harmonic(k) / k as f64
}

/// Chance-level top-1 accuracy.
pub fn chance_top1(k: usize) -> f64 {
    1.0 / k as f64
}

/// Chance-level top-3 accuracy.
pub fn chance_top3(k: usize) -> f64 {
    3.min(k) as f64 / k as f64
}

/// Rank (1-based) of the value at `col` within its row under descending
/// order. Ties share the average rank, so ranks may be fractional.
pub fn rank_with_ties(row: &[f64], col: usize) -> f64 {
    let target = row[col];
    let greater = row.iter().filter(|&&v| v > target).count() as f64;
    let ties = row.iter().filter(|&&v| v == target).count() as f64;
    greater + (ties + 1.0) / 2.0
}

/// Per-trial metric record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialMetrics {
    pub trial_index: usize,
    /// Mean rank of the correct identity across the k rows.
    pub mean_rank: f64,
    /// Mean reciprocal rank across the k rows.
    pub mrr: f64,
    /// Fraction of rows where the correct identity ranked first.
    pub top1: f64,
    /// Fraction of rows where the correct identity ranked in the top 3.
    pub top3: f64,
    /// Per row: (1-based column position of the correct identity, its rank).
    /// Feeds the positional-bias regression.
    pub position_rank_pairs: Vec<(usize, f64)>,
}

/// Score one parsed trial against its answer key.
pub fn score_trial(trial_index: usize, matrix: &ScoreMatrix, answer_key: &[usize]) -> TrialMetrics {
    let k = matrix.size;
    let mut ranks = Vec::with_capacity(k);
    let mut pairs = Vec::with_capacity(k);
    for (row_idx, &correct_col) in answer_key.iter().enumerate() {
        let rank = rank_with_ties(&matrix.rows[row_idx], correct_col);
        ranks.push(rank);
        pairs.push((correct_col + 1, rank));
    }
    let n = ranks.len() as f64;
    TrialMetrics {
        trial_index,
        mean_rank: ranks.iter().sum::<f64>() / n,
        mrr: ranks.iter().map(|r| 1.0 / r).sum::<f64>() / n,
        top1: ranks.iter().filter(|&&r| r <= 1.0).count() as f64 / n,
        top3: ranks.iter().filter(|&&r| r <= 3.0).count() as f64 / n,
        position_rank_pairs: pairs,
    }
}

/// Ordinary least squares fit of rank against list position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BiasFit {
    pub slope: f64,
    pub intercept: f64,
    /// Two-sided p-value of the slope (Student-t, n-2 df). `None` when the
    /// regression is degenerate: fewer than 3 points, or zero position
    /// variance. A non-finite float would not survive a JSON round trip,
    /// so degeneracy is typed rather than encoded as NaN.
    pub p_value: Option<f64>,
    pub n_points: usize,
}

/// Positional-bias diagnostic: regress the rank assigned to the correct
/// identity (y) on its 1-based position in the candidate list (x). A
/// significant slope means list position leaks into the scores.
pub fn positional_bias(pairs: &[(usize, f64)]) -> BiasFit {
    let n = pairs.len();
    if n < 3 {
        return BiasFit {
            slope: 0.0,
            intercept: 0.0,
            p_value: None,
            n_points: n,
        };
    }
    let nf = n as f64;
    let mean_x = pairs.iter().map(|(x, _)| *x as f64).sum::<f64>() / nf;
    let mean_y = pairs.iter().map(|(_, y)| *y).sum::<f64>() / nf;
    let sxx: f64 = pairs.iter().map(|(x, _)| (*x as f64 - mean_x).powi(2)).sum();
    let sxy: f64 = pairs
        .iter()
        .map(|(x, y)| (*x as f64 - mean_x) * (*y - mean_y))
        .sum();
    if sxx <= 0.0 {
        return BiasFit {
            slope: 0.0,
            intercept: mean_y,
            p_value: None,
            n_points: n,
        };
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let ss_res: f64 = pairs
        .iter()
        .map(|(x, y)| {
            let pred = intercept + slope * *x as f64;
            (*y - pred).powi(2)
        })
        .sum();
    let df = nf - 2.0;
    let se = (ss_res / df / sxx).sqrt();
    let p_value = if se > 0.0 {
        students_t_p_value(slope / se, df)
    } else {
        // Perfect fit: a zero slope is unremarkable, a nonzero one maximal.
        if slope.abs() > 0.0 {
            0.0
        } else {
            1.0
        }
    };
    BiasFit {
        slope,
        intercept,
        p_value: Some(p_value),
        n_points: n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chance_formulas() {
        // Harmonic-number formula for all k in a practical range.
        for k in 2..=20 {
            let expected: f64 = (1..=k).map(|j| 1.0 / j as f64).sum::<f64>() / k as f64;
            assert!((chance_mrr(k) - expected).abs() < 1e-12);
            assert!((chance_top1(k) - 1.0 / k as f64).abs() < 1e-12);
        }
        assert!((chance_mrr(5) - (1.0 + 0.5 + 1.0 / 3.0 + 0.25 + 0.2) / 5.0).abs() < 1e-12);
        assert!((chance_top3(5) - 0.6).abs() < 1e-12);
        assert!((chance_top3(2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rank_with_ties() {
        assert_eq!(rank_with_ties(&[9.0, 5.0, 1.0], 0), 1.0);
        assert_eq!(rank_with_ties(&[9.0, 5.0, 1.0], 2), 3.0);
        // Two-way tie for first: both rank 1.5.
        assert_eq!(rank_with_ties(&[9.0, 9.0, 1.0], 0), 1.5);
        assert_eq!(rank_with_ties(&[9.0, 9.0, 1.0], 1), 1.5);
        // All tied in a 4-row: everyone ranks 2.5.
        assert_eq!(rank_with_ties(&[3.0, 3.0, 3.0, 3.0], 2), 2.5);
    }

    #[test]
    fn test_score_trial_perfect_prediction() {
        // Diagonal dominant matrix with identity answer key.
        let matrix = ScoreMatrix {
            size: 3,
            rows: vec![
                vec![9.0, 1.0, 1.0],
                vec![1.0, 9.0, 1.0],
                vec![1.0, 1.0, 9.0],
            ],
        };
        let m = score_trial(1, &matrix, &[0, 1, 2]);
        assert_eq!(m.mean_rank, 1.0);
        assert_eq!(m.mrr, 1.0);
        assert_eq!(m.top1, 1.0);
        assert_eq!(m.top3, 1.0);
    }

    #[test]
    fn test_score_trial_worst_prediction() {
        let matrix = ScoreMatrix {
            size: 3,
            rows: vec![
                vec![1.0, 9.0, 5.0],
                vec![9.0, 1.0, 5.0],
                vec![9.0, 5.0, 1.0],
            ],
        };
        let m = score_trial(1, &matrix, &[0, 1, 2]);
        assert_eq!(m.mean_rank, 3.0);
        assert!((m.mrr - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(m.top1, 0.0);
        assert_eq!(m.top3, 1.0);
    }

    #[test]
    fn test_position_rank_pairs_are_one_based() {
        let matrix = ScoreMatrix {
            size: 2,
            rows: vec![vec![5.0, 1.0], vec![1.0, 5.0]],
        };
        let m = score_trial(1, &matrix, &[1, 0]);
        assert_eq!(m.position_rank_pairs, vec![(2, 2.0), (1, 2.0)]);
    }

    #[test]
    fn test_positional_bias_flat() {
        // Rank independent of position: slope ~ 0, p ~ 1.
        let pairs: Vec<(usize, f64)> = (1..=5).cycle().take(40).map(|x| (x, 2.0)).collect();
        let fit = positional_bias(&pairs);
        assert!(fit.slope.abs() < 1e-9);
    }

    #[test]
    fn test_positional_bias_strong_trend() {
        // Rank grows linearly with position plus tiny noise.
        let pairs: Vec<(usize, f64)> = (0..40)
            .map(|i| {
                let x = i % 5 + 1;
                (x, x as f64 + if i % 2 == 0 { 0.05 } else { -0.05 })
            })
            .collect();
        let fit = positional_bias(&pairs);
        assert!((fit.slope - 1.0).abs() < 0.05);
        assert!(fit.p_value.expect("non-degenerate fit") < 0.001);
    }

    #[test]
    fn test_positional_bias_degenerate() {
        let fit = positional_bias(&[(1, 1.0), (2, 2.0)]);
        assert_eq!(fit.p_value, None);
        // Single position value: sxx = 0.
        let fit = positional_bias(&[(2, 1.0), (2, 2.0), (2, 3.0)]);
        assert_eq!(fit.p_value, None);
        assert_eq!(fit.slope, 0.0);
    }
}
