//! Statistical analysis contract and the built-in backend.
//!
//! The aggregator consumes statistics purely through [`StatsBackend`]:
//! input is a tidy dataset with named factor and metric columns, output is
//! a set of significance tests with effect sizes. [`BuiltinStats`] supplies
//! one-way ANOVA per metric, degrading to Kruskal-Wallis when the variance
//! assumption fails and omitting a metric entirely (with a note) when the
//! data cannot support either — a statistics failure never aborts a compile.

use serde::{Deserialize, Serialize};

use crate::domain::MappingStrategy;

// ---------------------------------------------------------------------------
// Special functions
// ---------------------------------------------------------------------------

/// Natural log of the gamma function (Lanczos approximation).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_5e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in COEFFS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Continued-fraction evaluation for the incomplete beta function.
fn betacf(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 3.0e-12;
    const FPMIN: f64 = 1.0e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function I_x(a, b).
pub fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let bt = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        bt * betacf(a, b, x) / a
    } else {
        1.0 - bt * betacf(b, a, 1.0 - x) / b
    }
}

/// Two-sided p-value of a Student-t statistic with `df` degrees of freedom.
pub fn students_t_p_value(t: f64, df: f64) -> f64 {
    if df <= 0.0 || !t.is_finite() {
        return f64::NAN;
    }
    regularized_incomplete_beta(df / 2.0, 0.5, df / (df + t * t))
}

/// Upper-tail p-value of an F statistic with (d1, d2) degrees of freedom.
pub fn f_p_value(f: f64, d1: f64, d2: f64) -> f64 {
    if f <= 0.0 {
        return 1.0;
    }
    regularized_incomplete_beta(d2 / 2.0, d1 / 2.0, d2 / (d2 + d1 * f))
}

/// Standard normal CDF (Abramowitz & Stegun 7.1.26 via erf).
pub fn normal_cdf(z: f64) -> f64 {
    let x = z.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736
                + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let erf = 1.0 - poly * (-x * x).exp();
    if z >= 0.0 {
        0.5 * (1.0 + erf)
    } else {
        0.5 * (1.0 - erf)
    }
}

/// Upper-tail chi-square p-value via the Wilson-Hilferty approximation.
pub fn chi_square_p_value(x: f64, df: f64) -> f64 {
    if x <= 0.0 || df <= 0.0 {
        return 1.0;
    }
    let z = (((x / df).powf(1.0 / 3.0)) - (1.0 - 2.0 / (9.0 * df))) / (2.0 / (9.0 * df)).sqrt();
    1.0 - normal_cdf(z)
}

// ---------------------------------------------------------------------------
// Tidy dataset
// ---------------------------------------------------------------------------

/// One tidy row: the factor columns of an experiment condition plus the
/// replication-level metric columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudyRow {
    pub experiment: String,
    pub model: String,
    pub group_size: usize,
    pub mapping: MappingStrategy,
    pub replication: usize,
    pub n_valid_responses: usize,
    pub mean_rank: f64,
    pub mrr: f64,
    pub top1_accuracy: f64,
    pub top3_accuracy: f64,
    pub mrr_lift: f64,
    pub top1_lift: f64,
    pub top3_lift: f64,
}

/// The master cross-experiment dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyDataset {
    pub rows: Vec<StudyRow>,
}

impl StudyDataset {
    /// Group one metric column by experiment condition.
    fn metric_groups(&self, metric: &str) -> Vec<Vec<f64>> {
        let mut keys: Vec<&str> = self.rows.iter().map(|r| r.experiment.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.iter()
            .map(|key| {
                self.rows
                    .iter()
                    .filter(|r| r.experiment == *key)
                    .map(|r| match metric {
                        "mrr_lift" => r.mrr_lift,
                        "top1_lift" => r.top1_lift,
                        "top3_lift" => r.top3_lift,
                        "mean_rank" => r.mean_rank,
                        _ => f64::NAN,
                    })
                    .collect()
            })
            .collect()
    }
}

/// One significance test over a metric column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricTest {
    pub metric: String,
    pub method: String,
    pub statistic: f64,
    pub p_value: f64,
    /// Eta-squared for ANOVA; epsilon-squared for Kruskal-Wallis.
    pub effect_size: f64,
    pub note: Option<String>,
}

/// Output of the statistics collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub tests: Vec<MetricTest>,
    /// Metrics omitted with the reason, instead of aborting the compile.
    pub omitted: Vec<String>,
}

/// Function contract to the statistical analysis collaborator.
pub trait StatsBackend: Send + Sync {
    fn analyze(&self, dataset: &StudyDataset) -> AnalysisReport;
}

/// Metrics the built-in backend tests across experiment conditions.
const TESTED_METRICS: &[&str] = &["mrr_lift", "top1_lift", "top3_lift", "mean_rank"];

/// When the largest group variance exceeds the smallest by this factor, the
/// ANOVA homogeneity assumption is treated as unmet.
const VARIANCE_RATIO_LIMIT: f64 = 4.0;

/// Built-in backend: one-way ANOVA with Kruskal-Wallis fallback.
pub struct BuiltinStats;

impl StatsBackend for BuiltinStats {
    fn analyze(&self, dataset: &StudyDataset) -> AnalysisReport {
        let mut report = AnalysisReport::default();
        for metric in TESTED_METRICS {
            let groups = dataset.metric_groups(metric);
            let usable: Vec<&Vec<f64>> = groups.iter().filter(|g| g.len() >= 2).collect();
            if usable.len() < 2 {
                report.omitted.push(format!(
                    "{metric}: fewer than two conditions with >= 2 replications"
                ));
                continue;
            }
            let groups: Vec<Vec<f64>> = usable.into_iter().cloned().collect();

            if variances_homogeneous(&groups) {
                if let Some((f_stat, p, eta_sq)) = one_way_anova(&groups) {
                    report.tests.push(MetricTest {
                        metric: metric.to_string(),
                        method: "one_way_anova".to_string(),
                        statistic: f_stat,
                        p_value: p,
                        effect_size: eta_sq,
                        note: None,
                    });
                    continue;
                }
            }
            // Non-parametric fallback.
            if let Some((h, p, eps_sq)) = kruskal_wallis(&groups) {
                report.tests.push(MetricTest {
                    metric: metric.to_string(),
                    method: "kruskal_wallis".to_string(),
                    statistic: h,
                    p_value: p,
                    effect_size: eps_sq,
                    note: Some("variance assumption unmet; non-parametric fallback".to_string()),
                });
            } else {
                report.omitted.push(format!("{metric}: degenerate groups"));
            }
        }
        report
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() as f64 - 1.0)
}

fn variances_homogeneous(groups: &[Vec<f64>]) -> bool {
    let vars: Vec<f64> = groups.iter().map(|g| variance(g)).collect();
    let max = vars.iter().cloned().fold(f64::MIN, f64::max);
    let min = vars.iter().cloned().fold(f64::MAX, f64::min);
    if min <= 0.0 {
        return max <= 0.0;
    }
    max / min <= VARIANCE_RATIO_LIMIT
}

/// One-way ANOVA: returns (F, p, eta-squared), or `None` when degenerate.
pub fn one_way_anova(groups: &[Vec<f64>]) -> Option<(f64, f64, f64)> {
    let k = groups.len();
    let n: usize = groups.iter().map(Vec::len).sum();
    if k < 2 || n <= k {
        return None;
    }

    let all: Vec<f64> = groups.iter().flatten().copied().collect();
    let grand = mean(&all);

    let ss_between: f64 = groups
        .iter()
        .map(|g| g.len() as f64 * (mean(g) - grand).powi(2))
        .sum();
    let ss_within: f64 = groups
        .iter()
        .map(|g| {
            let m = mean(g);
            g.iter().map(|v| (v - m).powi(2)).sum::<f64>()
        })
        .sum();

    let d1 = (k - 1) as f64;
    let d2 = (n - k) as f64;
    if ss_within <= 0.0 {
        return None;
    }
    let f_stat = (ss_between / d1) / (ss_within / d2);
    let p = f_p_value(f_stat, d1, d2);
    let eta_sq = ss_between / (ss_between + ss_within);
    Some((f_stat, p, eta_sq))
}

/// Kruskal-Wallis H test: returns (H, p, epsilon-squared), or `None` when
/// degenerate. Ties share the average rank.
pub fn kruskal_wallis(groups: &[Vec<f64>]) -> Option<(f64, f64, f64)> {
    let k = groups.len();
    let n: usize = groups.iter().map(Vec::len).sum();
    if k < 2 || n <= k {
        return None;
    }

    // Pool, rank with average ties, then sum ranks per group.
    let mut pooled: Vec<(usize, f64)> = Vec::with_capacity(n);
    for (gi, g) in groups.iter().enumerate() {
        for &v in g {
            pooled.push((gi, v));
        }
    }
    pooled.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut rank_sums = vec![0.0; k];
    let mut i = 0;
    while i < pooled.len() {
        let mut j = i;
        while j < pooled.len() && pooled[j].1 == pooled[i].1 {
            j += 1;
        }
        let avg_rank = (i + 1 + j) as f64 / 2.0; // average of ranks i+1 ..= j
        for item in &pooled[i..j] {
            rank_sums[item.0] += avg_rank;
        }
        i = j;
    }

    let n_f = n as f64;
    let h: f64 = 12.0 / (n_f * (n_f + 1.0))
        * groups
            .iter()
            .enumerate()
            .map(|(gi, g)| rank_sums[gi].powi(2) / g.len() as f64)
            .sum::<f64>()
        - 3.0 * (n_f + 1.0);
    let df = (k - 1) as f64;
    let p = chi_square_p_value(h, df);
    let eps_sq = if n > k { (h - df) / (n_f - df - 1.0) } else { 0.0 };
    Some((h, p, eps_sq.max(0.0)))
}
