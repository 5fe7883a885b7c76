//! Read-only diagnostics over the directory tree (the Auditor).
//!
//! Every audit is a pure projection: it never mutates the target. Each
//! check yields at most one [`Issue`]; exactly one issue means a specific,
//! auto-repairable status, while two or more mean `RUN_CORRUPTED` — with
//! multiple simultaneous defects the engine refuses to guess which is cause
//! and which is effect, and recommends discard-and-rerun instead.
//!
//! The one-issue/many-issues split is a policy heuristic, not a proof of
//! fault independence; it is preserved here as specified.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{ExperimentConfig, Result};
use crate::layout::{
    self, ReplicationPaths, EXPERIMENT_SUMMARY_FILE, REPLICATION_RESULTS_CSV, STUDY_COMPLETE_FILE,
    STUDY_RESULTS_CSV,
};
use crate::manifest::TrialManifest;
use crate::pipeline::ReplicationSummary;
use crate::report::{validate_metrics_block, SchemaVerdict};
use crate::session::FAILURE_RATE_HALT;

/// Atomic issue codes. Each independent check contributes at most one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    InvalidName,
    ConfigIssue,
    QueryIssue,
    ResponseIssue,
    AnalysisIssue { sub: AnalysisIssueKind },
}

/// Sub-kinds of an analysis issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisIssueKind {
    ReportMissing,
    ReportStale,
    ReportIncompleteMetrics,
    ReportUnexpectedMetrics,
    SummaryMissing,
}

/// One detected defect with human detail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub kind: IssueKind,
    pub detail: String,
}

impl Issue {
    fn new(kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// The single cheapest sufficient fix for a one-issue verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Nothing to do.
    None,
    /// Re-archive the configuration snapshot.
    RearchiveConfig,
    /// Re-enter the pipeline at BUILD.
    RebuildQueries,
    /// Re-enter at RUN, re-issuing only trials without a stored response.
    RerunMissingResponses,
    /// Re-enter at ANALYZE with reprocess semantics.
    ReprocessAnalysis,
    /// Multi-issue corruption: discard the directory and rerun.
    DiscardAndRerun,
}

/// Classification of a replication directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Valid,
    /// Exactly one issue: auto-repairable.
    SingleIssue,
    /// Two or more simultaneous issues: no safe automatic repair.
    RunCorrupted,
}

/// Full replication verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationVerdict {
    pub path: PathBuf,
    pub replication_index: Option<usize>,
    pub status: AuditStatus,
    pub issues: Vec<Issue>,
    pub recommended: RepairAction,
}

impl ReplicationVerdict {
    pub fn is_valid(&self) -> bool {
        self.status == AuditStatus::Valid
    }

    /// The one issue of a single-issue verdict.
    pub fn single_issue(&self) -> Option<&Issue> {
        (self.issues.len() == 1).then(|| &self.issues[0])
    }
}

fn recommended_for(issue: &IssueKind) -> RepairAction {
    match issue {
        IssueKind::InvalidName => RepairAction::DiscardAndRerun,
        IssueKind::ConfigIssue => RepairAction::RearchiveConfig,
        IssueKind::QueryIssue => RepairAction::RebuildQueries,
        IssueKind::ResponseIssue => RepairAction::RerunMissingResponses,
        IssueKind::AnalysisIssue { .. } => RepairAction::ReprocessAnalysis,
    }
}

/// Audit one replication directory.
///
/// Independent checks, in order: directory name, archived config presence
/// and consistency, manifest/query artifacts, response files, analysis
/// artifacts and report schema exactness.
pub fn audit_replication(experiment_dir: &Path, replication_dir: &Path) -> ReplicationVerdict {
    let paths = ReplicationPaths::for_dir(replication_dir);
    let mut issues = Vec::new();

    // 1. Name well-formedness.
    let dir_name = replication_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let replication_index = layout::parse_replication_dir_name(&dir_name);
    if replication_index.is_none() {
        issues.push(Issue::new(
            IssueKind::InvalidName,
            format!("directory name {dir_name:?} is not replication_<NN>"),
        ));
    }

    // 2. Archived configuration presence and consistency.
    let config = match ExperimentConfig::load_archived(experiment_dir) {
        Ok(c) => Some(c),
        Err(e) => {
            issues.push(Issue::new(IssueKind::ConfigIssue, e.to_string()));
            None
        }
    };

    // 3. Manifest and query artifacts.
    let manifest = match TrialManifest::load(&paths) {
        Ok(m) => {
            let missing_queries = m
                .trials
                .iter()
                .filter(|t| !paths.query_file(t.index).exists())
                .count();
            if missing_queries > 0 {
                issues.push(Issue::new(
                    IssueKind::QueryIssue,
                    format!("{missing_queries} of {} query files missing", m.trials.len()),
                ));
            } else if let Some(config) = &config {
                if m.group_size != config.group_size {
                    // Manifest and archive disagree: the archive is suspect.
                    issues.push(Issue::new(
                        IssueKind::ConfigIssue,
                        format!(
                            "archived group_size {} disagrees with manifest {}",
                            config.group_size, m.group_size
                        ),
                    ));
                }
            }
            Some(m)
        }
        Err(e) => {
            issues.push(Issue::new(IssueKind::QueryIssue, e.to_string()));
            None
        }
    };

    // 4. Response files (needs the manifest for the expected trial set).
    if let Some(manifest) = &manifest {
        let mut responses_ok = true;
        let unrecorded = manifest
            .trials
            .iter()
            .filter(|t| !paths.is_recorded(t.index))
            .count();
        if unrecorded > 0 {
            responses_ok = false;
            issues.push(Issue::new(
                IssueKind::ResponseIssue,
                format!("{unrecorded} of {} trials unrecorded", manifest.trials.len()),
            ));
        } else {
            let n_failed = manifest
                .trials
                .iter()
                .filter(|t| !paths.has_stored_response(t.index))
                .count();
            let rate = n_failed as f64 / manifest.trials.len().max(1) as f64;
            if rate >= FAILURE_RATE_HALT {
                responses_ok = false;
                issues.push(Issue::new(
                    IssueKind::ResponseIssue,
                    format!(
                        "{n_failed} of {} trials carry failure markers ({:.0}%)",
                        manifest.trials.len(),
                        rate * 100.0
                    ),
                ));
            }
        }

        // 5. Analysis artifacts. Only assessed once responses are adequate:
        //    a halted run has no analysis to judge, and its missing report
        //    is the same defect as its missing responses, not a second one.
        if responses_ok {
            if let Some(issue) = audit_analysis(&paths, manifest) {
                issues.push(issue);
            }
        }
    }

    let (status, recommended) = classify(&issues);
    debug!(path = %replication_dir.display(), ?status, n_issues = issues.len(), "replication audited");
    ReplicationVerdict {
        path: replication_dir.to_path_buf(),
        replication_index,
        status,
        issues,
        recommended,
    }
}

/// Check report/summary presence, freshness, and schema exactness.
fn audit_analysis(paths: &ReplicationPaths, manifest: &TrialManifest) -> Option<Issue> {
    let report_path = paths.report();
    let report = match std::fs::read_to_string(&report_path) {
        Ok(r) => r,
        Err(_) => {
            return Some(Issue::new(
                IssueKind::AnalysisIssue {
                    sub: AnalysisIssueKind::ReportMissing,
                },
                "report.md is missing",
            ))
        }
    };

    // Freshness: a report older than the newest response was computed from
    // different data.
    let newest_response = manifest
        .trials
        .iter()
        .filter_map(|t| mtime(&paths.response_file(t.index)))
        .max();
    let report_mtime = mtime(&report_path);
    if let (Some(newest), Some(report_at)) = (newest_response, report_mtime) {
        if report_at < newest {
            return Some(Issue::new(
                IssueKind::AnalysisIssue {
                    sub: AnalysisIssueKind::ReportStale,
                },
                "report predates the newest stored response",
            ));
        }
    }

    match validate_metrics_block(&report) {
        SchemaVerdict::Exact => {}
        SchemaVerdict::Incomplete { missing } => {
            return Some(Issue::new(
                IssueKind::AnalysisIssue {
                    sub: AnalysisIssueKind::ReportIncompleteMetrics,
                },
                format!("metrics block missing keys: {}", missing.join(", ")),
            ))
        }
        SchemaVerdict::Unexpected { extra } => {
            return Some(Issue::new(
                IssueKind::AnalysisIssue {
                    sub: AnalysisIssueKind::ReportUnexpectedMetrics,
                },
                format!("metrics block has unexpected keys: {}", extra.join(", ")),
            ))
        }
        SchemaVerdict::Unparseable { detail } => {
            return Some(Issue::new(
                IssueKind::AnalysisIssue {
                    sub: AnalysisIssueKind::ReportIncompleteMetrics,
                },
                format!("metrics block unparseable: {detail}"),
            ))
        }
    }

    match ReplicationSummary::load(paths) {
        Ok(summary) if summary.valid => None,
        Ok(_) => Some(Issue::new(
            IssueKind::AnalysisIssue {
                sub: AnalysisIssueKind::SummaryMissing,
            },
            "replication summary is present but not marked valid",
        )),
        Err(e) => Some(Issue::new(
            IssueKind::AnalysisIssue {
                sub: AnalysisIssueKind::SummaryMissing,
            },
            e.to_string(),
        )),
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn classify(issues: &[Issue]) -> (AuditStatus, RepairAction) {
    match issues {
        [] => (AuditStatus::Valid, RepairAction::None),
        [one] => (AuditStatus::SingleIssue, recommended_for(&one.kind)),
        _ => (AuditStatus::RunCorrupted, RepairAction::DiscardAndRerun),
    }
}

// ---------------------------------------------------------------------------
// Experiment level
// ---------------------------------------------------------------------------

/// Aggregate status of an experiment directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    /// Every replication valid and the experiment summary compiled.
    Validated,
    /// Every replication valid; the experiment compile has not run yet.
    AwaitingCompile,
    /// At least one replication has a repairable issue.
    NeedsRepair,
    /// At least one replication is corrupted, or the directory itself is
    /// malformed.
    RunCorrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentVerdict {
    pub path: PathBuf,
    pub status: ExperimentStatus,
    pub replications: Vec<ReplicationVerdict>,
    /// Replications expected per config but absent on disk.
    pub missing_replications: usize,
    pub summary_compiled: bool,
    pub issues: Vec<Issue>,
}

impl ExperimentVerdict {
    pub fn n_valid(&self) -> usize {
        self.replications.iter().filter(|r| r.is_valid()).count()
    }
}

/// Audit an experiment directory: per-replication verdicts plus the
/// experiment-level summary artifacts.
pub fn audit_experiment(experiment_dir: &Path) -> Result<ExperimentVerdict> {
    let mut issues = Vec::new();

    let dir_name = experiment_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if layout::parse_experiment_dir_name(&dir_name).is_none() {
        issues.push(Issue::new(
            IssueKind::InvalidName,
            format!("directory name {dir_name:?} is not exp_<model>_k<k>_<mapping>_<ts>"),
        ));
    }

    let config = ExperimentConfig::load_archived(experiment_dir).ok();
    if config.is_none() {
        issues.push(Issue::new(
            IssueKind::ConfigIssue,
            "archived configuration missing or unreadable",
        ));
    }

    let (rep_dirs, malformed) = layout::list_replication_dirs(experiment_dir)?;
    let mut replications: Vec<ReplicationVerdict> = rep_dirs
        .iter()
        .map(|(_, dir)| audit_replication(experiment_dir, dir))
        .collect();
    for dir in malformed {
        replications.push(audit_replication(experiment_dir, &dir));
    }

    let missing_replications = config
        .as_ref()
        .map(|c| c.num_replications.saturating_sub(rep_dirs.len()))
        .unwrap_or(0);

    let summary_compiled = experiment_summary_validated(experiment_dir)
        && experiment_dir.join(REPLICATION_RESULTS_CSV).exists();

    let any_corrupted = replications
        .iter()
        .any(|r| r.status == AuditStatus::RunCorrupted);
    let any_issue = replications
        .iter()
        .any(|r| r.status == AuditStatus::SingleIssue)
        || missing_replications > 0;

    let status = if any_corrupted || !issues.is_empty() {
        ExperimentStatus::RunCorrupted
    } else if any_issue {
        ExperimentStatus::NeedsRepair
    } else if !summary_compiled {
        ExperimentStatus::AwaitingCompile
    } else {
        ExperimentStatus::Validated
    };

    Ok(ExperimentVerdict {
        path: experiment_dir.to_path_buf(),
        status,
        replications,
        missing_replications,
        summary_compiled,
        issues,
    })
}

/// Status block persisted by the experiment compile step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSummary {
    pub status: ExperimentStatus,
    pub n_replications: usize,
    pub compiled_at: chrono::DateTime<chrono::Utc>,
}

fn experiment_summary_validated(experiment_dir: &Path) -> bool {
    let path = experiment_dir.join(EXPERIMENT_SUMMARY_FILE);
    std::fs::read_to_string(path)
        .ok()
        .and_then(|body| serde_json::from_str::<ExperimentSummary>(&body).ok())
        .map(|s| s.status == ExperimentStatus::Validated)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Study level
// ---------------------------------------------------------------------------

/// One study-wide recommendation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StudyRecommendation {
    /// Every experiment is compile-ready; run the study compile.
    ProceedToCompile,
    /// Some experiments need repair or are corrupted.
    WaitForRepairs,
    /// Study artifacts are already present; re-compiling is a no-op.
    AlreadyComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudyVerdict {
    pub path: PathBuf,
    pub experiments: Vec<ExperimentVerdict>,
    pub results_present: bool,
    pub complete_marker: bool,
    pub recommendation: StudyRecommendation,
}

/// Audit a study directory: a quiet per-experiment audit of every child
/// plus the study-level artifacts, consolidated into one recommendation.
pub fn audit_study(study_dir: &Path) -> Result<StudyVerdict> {
    let mut experiments = Vec::new();
    for dir in layout::list_experiment_dirs(study_dir)? {
        experiments.push(audit_experiment(&dir)?);
    }

    let results_present = study_dir.join(STUDY_RESULTS_CSV).exists();
    let complete_marker = study_dir.join(STUDY_COMPLETE_FILE).exists();

    let any_unrepaired = experiments.iter().any(|e| {
        matches!(
            e.status,
            ExperimentStatus::NeedsRepair | ExperimentStatus::RunCorrupted
        )
    });

    let recommendation = if any_unrepaired {
        StudyRecommendation::WaitForRepairs
    } else if complete_marker && results_present {
        StudyRecommendation::AlreadyComplete
    } else {
        StudyRecommendation::ProceedToCompile
    };

    Ok(StudyVerdict {
        path: study_dir.to_path_buf(),
        experiments,
        results_present,
        complete_marker,
        recommendation,
    })
}
