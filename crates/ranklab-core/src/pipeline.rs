//! The six-stage replication pipeline:
//! BUILD -> RUN -> PARSE -> ANALYZE -> REPORT -> SUMMARIZE.
//!
//! BUILD and RUN are the only stages that spend API budget; everything after
//! them consumes stored raw responses. Reprocessing therefore re-enters at
//! PARSE and must never regenerate already-successful trial data.

use std::fs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::corpus::IdentityCorpus;
use crate::domain::{RanklabError, Result, RunContext};
use crate::layout::ReplicationPaths;
use crate::manifest::{build_manifest, write_queries, TrialManifest};
use crate::metrics::{
    chance_mrr, chance_top1, chance_top3, positional_bias, score_trial, TrialMetrics,
};
use crate::parser::{parse_score_matrix, ParseFailure, ParseSummary, ScoreMatrix};
use crate::report::{
    render_report, validate_metrics_block, MetricsRecord, ReportMode, SchemaVerdict,
    METRICS_SCHEMA_VERSION,
};
use crate::session::{classify_failure_rate, BatchVerdict, SessionManager};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Run,
    Parse,
    Analyze,
    Report,
    Summarize,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Build => "build",
            Stage::Run => "run",
            Stage::Parse => "parse",
            Stage::Analyze => "analyze",
            Stage::Report => "report",
            Stage::Summarize => "summarize",
        };
        write!(f, "{s}")
    }
}

/// Replication-level result row, persisted as `replication_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationSummary {
    pub replication_index: usize,
    pub experiment: String,
    pub run_at: DateTime<Utc>,
    pub reprocessed_at: Option<DateTime<Utc>>,
    pub n_trials: usize,
    pub n_call_failures: usize,
    pub n_parse_failures: usize,
    pub n_valid_responses: usize,
    /// Combined call + parse failure fraction.
    pub failure_rate: f64,
    pub parse_summary: ParseSummary,
    pub valid: bool,
    pub failed_stage: Option<Stage>,
    pub failure_detail: Option<String>,
    pub metrics: Option<MetricsRecord>,
}

impl ReplicationSummary {
    pub fn save(&self, paths: &ReplicationPaths) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        fs::write(paths.summary(), body)?;
        Ok(())
    }

    pub fn load(paths: &ReplicationPaths) -> Result<Self> {
        let path = paths.summary();
        let body = fs::read_to_string(&path)
            .map_err(|_| RanklabError::MissingArtifact { path: path.clone() })?;
        serde_json::from_str(&body).map_err(|e| RanklabError::MalformedArtifact {
            path,
            detail: e.to_string(),
        })
    }
}

/// Terminal state of one pipeline pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationOutcome {
    Valid(Box<ReplicationSummary>),
    Failed { stage: Stage, detail: String },
}

impl ReplicationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ReplicationOutcome::Valid(_))
    }
}

/// Executes replications for one experiment context.
pub struct ReplicationPipeline<'a> {
    pub ctx: &'a RunContext,
    pub corpus: &'a IdentityCorpus,
    pub sessions: &'a SessionManager,
}

impl<'a> ReplicationPipeline<'a> {
    pub fn new(ctx: &'a RunContext, corpus: &'a IdentityCorpus, sessions: &'a SessionManager) -> Self {
        Self { ctx, corpus, sessions }
    }

    fn experiment_name(&self) -> String {
        self.ctx
            .experiment_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Full pass: BUILD through SUMMARIZE.
    pub async fn execute(&self, replication_index: usize) -> Result<ReplicationOutcome> {
        let paths = ReplicationPaths::new(&self.ctx.experiment_dir, replication_index);
        let run_at = Utc::now();

        // BUILD
        info!(replication_index, stage = %Stage::Build, "building trial manifest");
        let manifest = build_manifest(&self.ctx.config, replication_index, self.corpus)?;
        paths.ensure_dirs()?;
        manifest.save(&paths)?;
        write_queries(&manifest, &paths)?;

        // RUN
        info!(replication_index, stage = %Stage::Run, "running session batch");
        let verdict = self.sessions.run_batch(&manifest, &paths).await?;
        if let BatchVerdict::Halted {
            n_trials,
            n_failed,
            failure_rate,
            hint,
        } = verdict
        {
            let detail = format!(
                "{n_failed}/{n_trials} trials failed ({:.0}%): {}",
                failure_rate * 100.0,
                hint.remediation()
            );
            let summary = ReplicationSummary {
                replication_index,
                experiment: self.experiment_name(),
                run_at,
                reprocessed_at: None,
                n_trials,
                n_call_failures: n_failed,
                n_parse_failures: 0,
                n_valid_responses: 0,
                failure_rate,
                parse_summary: ParseSummary::default(),
                valid: false,
                failed_stage: Some(Stage::Run),
                failure_detail: Some(detail.clone()),
                metrics: None,
            };
            summary.save(&paths)?;
            return Ok(ReplicationOutcome::Failed {
                stage: Stage::Run,
                detail,
            });
        }

        self.finish_from_responses(&paths, &manifest, ReportMode::Original { run_at })
    }

    /// Resume pass: re-enter at RUN against the existing manifest. Trials
    /// with a stored response are skipped; only the gaps are re-issued.
    pub async fn resume(&self, replication_index: usize) -> Result<ReplicationOutcome> {
        let paths = ReplicationPaths::new(&self.ctx.experiment_dir, replication_index);
        let manifest = TrialManifest::load(&paths)?;
        let run_at = ReplicationSummary::load(&paths)
            .map(|s| s.run_at)
            .unwrap_or_else(|_| Utc::now());

        info!(replication_index, stage = %Stage::Run, "resuming session batch");
        let verdict = self.sessions.run_batch(&manifest, &paths).await?;
        if let BatchVerdict::Halted {
            n_trials,
            n_failed,
            failure_rate,
            hint,
        } = verdict
        {
            let detail = format!(
                "{n_failed}/{n_trials} trials failed ({:.0}%): {}",
                failure_rate * 100.0,
                hint.remediation()
            );
            return Ok(ReplicationOutcome::Failed {
                stage: Stage::Run,
                detail,
            });
        }
        self.finish_from_responses(&paths, &manifest, ReportMode::Original { run_at })
    }

    /// Reprocess pass: PARSE through SUMMARIZE against stored responses.
    /// BUILD and RUN are skipped; no API call is ever issued.
    pub fn reprocess(&self, replication_index: usize) -> Result<ReplicationOutcome> {
        let paths = ReplicationPaths::new(&self.ctx.experiment_dir, replication_index);
        let manifest = TrialManifest::load(&paths)?;

        // The human header's Date field always reflects the original run.
        let run_at = ReplicationSummary::load(&paths)
            .map(|s| s.run_at)
            .unwrap_or(manifest.built_at);
        let mode = ReportMode::Reprocessed {
            run_at,
            reprocessed_at: Utc::now(),
        };
        info!(replication_index, "reprocessing from stored responses");
        self.finish_from_responses(&paths, &manifest, mode)
    }

    /// PARSE -> ANALYZE -> REPORT -> SUMMARIZE over stored responses.
    fn finish_from_responses(
        &self,
        paths: &ReplicationPaths,
        manifest: &TrialManifest,
        mode: ReportMode,
    ) -> Result<ReplicationOutcome> {
        let k = manifest.group_size;
        let n_trials = manifest.trials.len();
        let (run_at, reprocessed_at) = match mode {
            ReportMode::Original { run_at } => (run_at, None),
            ReportMode::Reprocessed {
                run_at,
                reprocessed_at,
            } => (run_at, Some(reprocessed_at)),
        };

        // PARSE: individual failures are recorded and counted, never fatal.
        let mut parse_summary = ParseSummary::default();
        let mut n_call_failures = 0usize;
        let mut parsed: Vec<(usize, ScoreMatrix)> = Vec::new();
        for trial in &manifest.trials {
            if !paths.has_stored_response(trial.index) {
                n_call_failures += 1;
                continue;
            }
            let text = fs::read_to_string(paths.response_file(trial.index))?;
            match parse_score_matrix(&text, k) {
                Ok(matrix) => {
                    fs::write(
                        paths.score_file(trial.index),
                        serde_json::to_string_pretty(&matrix)?,
                    )?;
                    parse_summary.record_success();
                    parsed.push((trial.index, matrix));
                }
                Err(failure) => {
                    debug!(trial = trial.index, %failure, "parse failure");
                    parse_summary.record_failure(&failure);
                    // A stale score file from an earlier pass must not
                    // survive a response that no longer parses.
                    let stale = paths.score_file(trial.index);
                    if stale.exists() {
                        fs::remove_file(stale)?;
                    }
                    record_parse_failure(paths, trial.index, &failure)?;
                }
            }
        }

        let n_parse_failures = parse_summary.n_failed();
        let n_valid = parsed.len();
        let failure_rate = (n_call_failures + n_parse_failures) as f64 / n_trials.max(1) as f64;

        let mut summary = ReplicationSummary {
            replication_index: manifest.replication_index,
            experiment: self.experiment_name(),
            run_at,
            reprocessed_at,
            n_trials,
            n_call_failures,
            n_parse_failures,
            n_valid_responses: n_valid,
            failure_rate,
            parse_summary,
            valid: false,
            failed_stage: None,
            failure_detail: None,
            metrics: None,
        };

        if let Some(hint) = classify_failure_rate(failure_rate) {
            let detail = format!(
                "{}/{} trials unusable ({:.0}%): {}",
                n_call_failures + n_parse_failures,
                n_trials,
                failure_rate * 100.0,
                hint.remediation()
            );
            warn!(failure_rate, "replication failed at parse");
            summary.failed_stage = Some(Stage::Parse);
            summary.failure_detail = Some(detail.clone());
            summary.save(paths)?;
            return Ok(ReplicationOutcome::Failed {
                stage: Stage::Parse,
                detail,
            });
        }

        if n_valid < self.ctx.config.min_valid_response_threshold {
            warn!(
                n_valid,
                threshold = self.ctx.config.min_valid_response_threshold,
                "valid responses below configured threshold; analysis proceeds"
            );
        }

        // ANALYZE
        info!(stage = %Stage::Analyze, n_valid, "computing metrics");
        let metrics = compute_metrics(manifest, &parsed, n_trials, n_valid, failure_rate);

        // REPORT
        let report = render_report(
            &self.experiment_name(),
            manifest.replication_index,
            mode,
            &metrics,
        );
        fs::write(paths.report(), &report)?;

        // SUMMARIZE: VALID only when the written report round-trips against
        // the compiled schema exactly.
        match validate_metrics_block(&report) {
            SchemaVerdict::Exact => {
                summary.valid = true;
                summary.metrics = Some(metrics);
                summary.save(paths)?;
                info!(replication = manifest.replication_index, "replication VALID");
                Ok(ReplicationOutcome::Valid(Box::new(summary)))
            }
            verdict => {
                let detail = format!("metrics block failed schema validation: {verdict:?}");
                summary.failed_stage = Some(Stage::Summarize);
                summary.failure_detail = Some(detail.clone());
                summary.save(paths)?;
                Ok(ReplicationOutcome::Failed {
                    stage: Stage::Summarize,
                    detail,
                })
            }
        }
    }
}

/// Persisted parse diagnostic next to the raw response.
fn record_parse_failure(
    paths: &ReplicationPaths,
    trial_index: usize,
    failure: &ParseFailure,
) -> Result<()> {
    let path = paths
        .scores_dir()
        .join(format!("trial_{trial_index:02}.parse_failure.json"));
    fs::write(path, serde_json::to_string_pretty(failure)?)?;
    Ok(())
}

/// Aggregate per-trial metrics into the replication metrics record.
fn compute_metrics(
    manifest: &TrialManifest,
    parsed: &[(usize, ScoreMatrix)],
    n_trials: usize,
    n_valid: usize,
    failure_rate: f64,
) -> MetricsRecord {
    let k = manifest.group_size;

    let per_trial: Vec<TrialMetrics> = parsed
        .iter()
        .filter_map(|(index, matrix)| {
            manifest
                .trials
                .iter()
                .find(|t| t.index == *index)
                .map(|t| score_trial(*index, matrix, &t.answer_key))
        })
        .collect();

    let n = per_trial.len().max(1) as f64;
    let mean_rank = per_trial.iter().map(|t| t.mean_rank).sum::<f64>() / n;
    let mrr = per_trial.iter().map(|t| t.mrr).sum::<f64>() / n;
    let top1 = per_trial.iter().map(|t| t.top1).sum::<f64>() / n;
    let top3 = per_trial.iter().map(|t| t.top3).sum::<f64>() / n;

    let pairs: Vec<(usize, f64)> = per_trial
        .iter()
        .flat_map(|t| t.position_rank_pairs.iter().copied())
        .collect();
    let bias = positional_bias(&pairs);

    let c_mrr = chance_mrr(k);
    let c_top1 = chance_top1(k);
    let c_top3 = chance_top3(k);

    MetricsRecord {
        schema_version: METRICS_SCHEMA_VERSION,
        n_trials,
        n_valid_responses: n_valid,
        failure_rate,
        mean_rank,
        mrr,
        top1_accuracy: top1,
        top3_accuracy: top3,
        chance_mrr: c_mrr,
        chance_top1: c_top1,
        chance_top3: c_top3,
        mrr_lift: mrr / c_mrr,
        top1_lift: top1 / c_top1,
        top3_lift: top3 / c_top3,
        bias_slope: bias.slope,
        bias_intercept: bias.intercept,
        bias_p_value: bias.p_value,
    }
}
