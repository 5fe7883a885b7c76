//! Replication report rendering and the versioned metrics schema
//! (the REPORT stage).
//!
//! The report is a human document with one machine-readable organ: a fenced
//! JSON block whose key set must exactly equal the compiled schema constant.
//! The auditor validates that block by set equality — a missing key and an
//! extra key are distinct, independently reportable defects.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::PROMPT_TEMPLATE;

/// Version tag carried inside the metrics block.
pub const METRICS_SCHEMA_VERSION: u32 = 1;

/// The exact key set of a v1 metrics block. Keep sorted.
pub const EXPECTED_METRIC_KEYS: &[&str] = &[
    "bias_intercept",
    "bias_p_value",
    "bias_slope",
    "chance_mrr",
    "chance_top1",
    "chance_top3",
    "failure_rate",
    "mean_rank",
    "mrr",
    "mrr_lift",
    "n_trials",
    "n_valid_responses",
    "schema_version",
    "top1_accuracy",
    "top1_lift",
    "top3_accuracy",
    "top3_lift",
];

/// The strongly-typed replication metrics record serialized into the
/// report's JSON block. Field names are the schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsRecord {
    pub schema_version: u32,
    pub n_trials: usize,
    pub n_valid_responses: usize,
    pub failure_rate: f64,
    pub mean_rank: f64,
    pub mrr: f64,
    pub top1_accuracy: f64,
    pub top3_accuracy: f64,
    pub chance_mrr: f64,
    pub chance_top1: f64,
    pub chance_top3: f64,
    pub mrr_lift: f64,
    pub top1_lift: f64,
    pub top3_lift: f64,
    pub bias_slope: f64,
    pub bias_intercept: f64,
    /// `None` (serialized as `null`, the key always present) when the bias
    /// regression was degenerate and no p-value exists.
    pub bias_p_value: Option<f64>,
}

/// Result of validating a report's JSON block against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaVerdict {
    Exact,
    /// `REPORT_INCOMPLETE_METRICS`: keys the schema expects but the block lacks.
    Incomplete { missing: Vec<String> },
    /// `REPORT_UNEXPECTED_METRICS`: keys the block carries beyond the schema.
    Unexpected { extra: Vec<String> },
    /// The fenced block is absent or not valid JSON.
    Unparseable { detail: String },
}

/// How the report header is dated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// First-time run.
    Original { run_at: DateTime<Utc> },
    /// Reprocessed from stored responses: the title is annotated with the
    /// reprocessing timestamp while `Date:` keeps the original run time.
    Reprocessed {
        run_at: DateTime<Utc>,
        reprocessed_at: DateTime<Utc>,
    },
}

/// Render the full replication report.
pub fn render_report(
    experiment_name: &str,
    replication_index: usize,
    mode: ReportMode,
    metrics: &MetricsRecord,
) -> String {
    let (title, run_at) = match mode {
        ReportMode::Original { run_at } => (
            format!("Replication {replication_index:02} Report"),
            run_at,
        ),
        ReportMode::Reprocessed {
            run_at,
            reprocessed_at,
        } => (
            format!(
                "Replication {replication_index:02} Report (reprocessed {})",
                reprocessed_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            run_at,
        ),
    };

    let json_block = serde_json::to_string_pretty(metrics)
        .unwrap_or_else(|_| "{}".to_string());
    let bias_p = match metrics.bias_p_value {
        Some(p) => format!("{p:.4}"),
        None => "n/a (degenerate regression)".to_string(),
    };

    format!(
        "# {title}\n\
         \n\
         Experiment: {experiment_name}\n\
         Date: {date}\n\
         \n\
         ## Prompt template\n\
         \n\
         ```text\n{prompt}\n```\n\
         \n\
         ## Summary\n\
         \n\
         - Trials: {n_trials} ({n_valid} with a parsed score matrix, failure rate {rate:.1}%)\n\
         - Mean rank of correct identity: {mean_rank:.3}\n\
         - MRR: {mrr:.3} (chance {chance_mrr:.3}, lift {mrr_lift:.2}x)\n\
         - Top-1: {top1:.3} (chance {chance_top1:.3}, lift {top1_lift:.2}x)\n\
         - Top-3: {top3:.3} (chance {chance_top3:.3}, lift {top3_lift:.2}x)\n\
         - Positional bias: slope {slope:.4}, intercept {intercept:.3}, p = {p}\n\
         \n\
         ## Metrics\n\
         \n\
         ```json\n{json_block}\n```\n",
        date = run_at.format("%Y-%m-%d %H:%M:%S UTC"),
        prompt = PROMPT_TEMPLATE,
        n_trials = metrics.n_trials,
        n_valid = metrics.n_valid_responses,
        rate = metrics.failure_rate * 100.0,
        mean_rank = metrics.mean_rank,
        mrr = metrics.mrr,
        chance_mrr = metrics.chance_mrr,
        mrr_lift = metrics.mrr_lift,
        top1 = metrics.top1_accuracy,
        chance_top1 = metrics.chance_top1,
        top1_lift = metrics.top1_lift,
        top3 = metrics.top3_accuracy,
        chance_top3 = metrics.chance_top3,
        top3_lift = metrics.top3_lift,
        slope = metrics.bias_slope,
        intercept = metrics.bias_intercept,
        p = bias_p,
    )
}

/// Extract the last fenced ```json block from report text.
pub fn extract_metrics_block(report: &str) -> Option<String> {
    let mut block: Option<String> = None;
    let mut current: Option<String> = None;
    for line in report.lines() {
        match &mut current {
            Some(buf) => {
                if line.trim_start().starts_with("```") {
                    block = current.take();
                } else {
                    buf.push_str(line);
                    buf.push('\n');
                }
            }
            None => {
                if line.trim_start() == "```json" {
                    current = Some(String::new());
                }
            }
        }
    }
    block
}

/// Validate a report's JSON block key set against [`EXPECTED_METRIC_KEYS`].
pub fn validate_metrics_block(report: &str) -> SchemaVerdict {
    let Some(block) = extract_metrics_block(report) else {
        return SchemaVerdict::Unparseable {
            detail: "no fenced json block found".to_string(),
        };
    };
    let value: serde_json::Value = match serde_json::from_str(&block) {
        Ok(v) => v,
        Err(e) => {
            return SchemaVerdict::Unparseable {
                detail: e.to_string(),
            }
        }
    };
    let Some(object) = value.as_object() else {
        return SchemaVerdict::Unparseable {
            detail: "json block is not an object".to_string(),
        };
    };

    let found: BTreeSet<&str> = object.keys().map(String::as_str).collect();
    let expected: BTreeSet<&str> = EXPECTED_METRIC_KEYS.iter().copied().collect();

    let missing: Vec<String> = expected.difference(&found).map(|s| s.to_string()).collect();
    let extra: Vec<String> = found.difference(&expected).map(|s| s.to_string()).collect();

    if !missing.is_empty() {
        SchemaVerdict::Incomplete { missing }
    } else if !extra.is_empty() {
        SchemaVerdict::Unexpected { extra }
    } else {
        SchemaVerdict::Exact
    }
}

/// Parse the typed metrics record back out of a report.
pub fn parse_metrics_block(report: &str) -> Option<MetricsRecord> {
    let block = extract_metrics_block(report)?;
    serde_json::from_str(&block).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metrics() -> MetricsRecord {
        MetricsRecord {
            schema_version: METRICS_SCHEMA_VERSION,
            n_trials: 10,
            n_valid_responses: 6,
            failure_rate: 0.4,
            mean_rank: 2.1,
            mrr: 0.62,
            top1_accuracy: 0.45,
            top3_accuracy: 0.83,
            chance_mrr: 0.4567,
            chance_top1: 0.2,
            chance_top3: 0.6,
            mrr_lift: 1.36,
            top1_lift: 2.25,
            top3_lift: 1.38,
            bias_slope: -0.02,
            bias_intercept: 2.2,
            bias_p_value: Some(0.71),
        }
    }

    #[test]
    fn test_schema_constant_matches_record_fields() {
        // The compiled schema constant and the struct's serde output must
        // agree exactly.
        let value = serde_json::to_value(sample_metrics()).expect("serialize");
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, EXPECTED_METRIC_KEYS);
    }

    #[test]
    fn test_render_and_validate_exact() {
        let report = render_report(
            "exp_m_k5_correct_20260314-092653",
            1,
            ReportMode::Original { run_at: Utc::now() },
            &sample_metrics(),
        );
        assert_eq!(validate_metrics_block(&report), SchemaVerdict::Exact);
        let parsed = parse_metrics_block(&report).expect("parse back");
        assert_eq!(parsed, sample_metrics());
    }

    #[test]
    fn test_degenerate_bias_p_value_round_trips_as_null() {
        // Too few rank/position pairs leave no p-value. The key must still
        // serialize (as null), satisfy the schema, and parse back as None.
        let metrics = MetricsRecord {
            bias_p_value: None,
            ..sample_metrics()
        };
        let report = render_report(
            "exp_m_k2_correct_20260314-092653",
            1,
            ReportMode::Original { run_at: Utc::now() },
            &metrics,
        );
        assert!(report.contains("p = n/a"));
        assert!(report.contains("\"bias_p_value\": null"));
        assert_eq!(validate_metrics_block(&report), SchemaVerdict::Exact);
        let parsed = parse_metrics_block(&report).expect("parse back");
        assert_eq!(parsed.bias_p_value, None);
    }

    #[test]
    fn test_report_carries_prompt_template() {
        let report = render_report(
            "exp",
            1,
            ReportMode::Original { run_at: Utc::now() },
            &sample_metrics(),
        );
        assert!(report.contains("personality descriptions"));
    }

    #[test]
    fn test_reprocess_mode_keeps_original_date() {
        let run_at = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 1, 2, 3, 4, 5).unwrap();
        let reprocessed_at = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 2, 3, 4, 5, 6).unwrap();
        let report = render_report(
            "exp",
            2,
            ReportMode::Reprocessed {
                run_at,
                reprocessed_at,
            },
            &sample_metrics(),
        );
        // Title carries the reprocessing stamp; Date keeps the original run.
        assert!(report.contains("(reprocessed 2026-02-03 04:05:06 UTC)"));
        assert!(report.contains("Date: 2026-01-02 03:04:05 UTC"));
    }

    #[test]
    fn test_removed_key_is_incomplete() {
        let report = render_report("exp", 1, ReportMode::Original { run_at: Utc::now() }, &sample_metrics());
        let block = extract_metrics_block(&report).expect("block");
        let mut value: serde_json::Value = serde_json::from_str(&block).unwrap();
        value.as_object_mut().unwrap().remove("mrr_lift");
        let doctored = report.replace(&block.trim().to_string(), &value.to_string());
        match validate_metrics_block(&doctored) {
            SchemaVerdict::Incomplete { missing } => assert_eq!(missing, vec!["mrr_lift"]),
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn test_extra_key_is_unexpected() {
        let report = render_report("exp", 1, ReportMode::Original { run_at: Utc::now() }, &sample_metrics());
        let block = extract_metrics_block(&report).expect("block");
        let mut value: serde_json::Value = serde_json::from_str(&block).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("debug_note".to_string(), serde_json::json!("x"));
        let doctored = report.replace(&block.trim().to_string(), &value.to_string());
        match validate_metrics_block(&doctored) {
            SchemaVerdict::Unexpected { extra } => assert_eq!(extra, vec!["debug_note"]),
            other => panic!("expected Unexpected, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_block_is_unparseable() {
        assert!(matches!(
            validate_metrics_block("# Report\nno json here\n"),
            SchemaVerdict::Unparseable { .. }
        ));
    }

    #[test]
    fn test_last_json_block_wins() {
        let report = "```json\n{\"old\": 1}\n```\ntext\n```json\n{\"new\": 2}\n```\n";
        let block = extract_metrics_block(report).expect("block");
        assert!(block.contains("new"));
    }
}
