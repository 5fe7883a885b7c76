//! Bottom-up result compilation (the aggregator).
//!
//! Compilation climbs the hierarchy: valid replications roll up into
//! per-experiment CSVs, validated experiments roll up into the study master
//! dataset, and the statistics backend runs over the master rows. Every
//! roll-up is gated by an audit: a replication that does not audit VALID
//! never contributes a row, and a study compile refuses to run while any
//! experiment still needs repair.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{self, AuditStatus, ExperimentStatus, ExperimentSummary, StudyRecommendation};
use crate::domain::{ExperimentConfig, MappingStrategy, RanklabError, Result};
use crate::layout::{
    self, ReplicationPaths, ANALYSIS_DIR, EXPERIMENT_RESULTS_CSV, EXPERIMENT_SUMMARY_FILE,
    REPLICATION_RESULTS_CSV, STUDY_COMPLETE_FILE, STUDY_RESULTS_CSV,
};
use crate::pipeline::ReplicationSummary;
use crate::stats::{AnalysisReport, StatsBackend, StudyDataset, StudyRow};

/// Marker written when a study compile completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyCompleteMarker {
    pub completed_at: DateTime<Utc>,
    pub n_experiments: usize,
    pub n_rows: usize,
}

/// One row of `EXPERIMENT_results.csv`: an experiment condition averaged
/// over its valid replications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentRow {
    pub experiment: String,
    pub model: String,
    pub group_size: usize,
    pub mapping: MappingStrategy,
    pub n_replications: usize,
    pub n_valid_responses: usize,
    pub mean_rank: f64,
    pub mrr: f64,
    pub top1_accuracy: f64,
    pub top3_accuracy: f64,
    pub mrr_lift: f64,
    pub top1_lift: f64,
    pub top3_lift: f64,
}

/// Build the per-replication rows for one experiment, one row per
/// replication that audits VALID. Audit failures are errors here: the
/// caller is expected to have repaired first.
fn replication_rows(experiment_dir: &Path, config: &ExperimentConfig) -> Result<Vec<StudyRow>> {
    let experiment = experiment_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let (dirs, malformed) = layout::list_replication_dirs(experiment_dir)?;
    if !malformed.is_empty() {
        return Err(RanklabError::NotValidated {
            path: experiment_dir.to_path_buf(),
            detail: format!("{} malformed replication directories", malformed.len()),
        });
    }

    let mut rows = Vec::with_capacity(dirs.len());
    for (index, dir) in dirs {
        let verdict = audit::audit_replication(experiment_dir, &dir);
        if verdict.status != AuditStatus::Valid {
            return Err(RanklabError::NotValidated {
                path: dir.clone(),
                detail: format!("{} issues found", verdict.issues.len()),
            });
        }
        let paths = ReplicationPaths::new(experiment_dir, index);
        let summary = ReplicationSummary::load(&paths)?;
        let metrics = summary.metrics.as_ref().ok_or_else(|| {
            RanklabError::MalformedArtifact {
                path: dir.clone(),
                detail: "valid summary carries no metrics".to_string(),
            }
        })?;
        rows.push(StudyRow {
            experiment: experiment.clone(),
            model: config.model.clone(),
            group_size: config.group_size,
            mapping: config.mapping,
            replication: index,
            n_valid_responses: metrics.n_valid_responses,
            mean_rank: metrics.mean_rank,
            mrr: metrics.mrr,
            top1_accuracy: metrics.top1_accuracy,
            top3_accuracy: metrics.top3_accuracy,
            mrr_lift: metrics.mrr_lift,
            top1_lift: metrics.top1_lift,
            top3_lift: metrics.top3_lift,
        });
    }
    rows.sort_by_key(|r| r.replication);
    Ok(rows)
}

/// Compile one experiment: write `REPLICATION_results.csv` and the
/// VALIDATED summary. Refuses if any replication does not audit VALID.
pub fn compile_experiment(experiment_dir: &Path) -> Result<Vec<StudyRow>> {
    let verdict = audit::audit_experiment(experiment_dir)?;
    let not_valid: Vec<String> = verdict
        .replications
        .iter()
        .filter(|r| !r.is_valid())
        .map(|r| r.path.display().to_string())
        .collect();
    if !not_valid.is_empty() {
        return Err(RanklabError::NotValidated {
            path: experiment_dir.to_path_buf(),
            detail: format!("replications not valid: {}", not_valid.join(", ")),
        });
    }
    if verdict.missing_replications > 0 {
        return Err(RanklabError::NotValidated {
            path: experiment_dir.to_path_buf(),
            detail: format!("{} replications not yet run", verdict.missing_replications),
        });
    }

    let config = ExperimentConfig::load_archived(experiment_dir)?;
    let rows = replication_rows(experiment_dir, &config)?;

    write_csv(&experiment_dir.join(REPLICATION_RESULTS_CSV), &rows)?;
    let summary = ExperimentSummary {
        status: ExperimentStatus::Validated,
        n_replications: rows.len(),
        compiled_at: Utc::now(),
    };
    std::fs::write(
        experiment_dir.join(EXPERIMENT_SUMMARY_FILE),
        serde_json::to_string_pretty(&summary)?,
    )?;
    info!(path = %experiment_dir.display(), n_replications = rows.len(), "experiment compiled");
    Ok(rows)
}

fn experiment_row(rows: &[StudyRow]) -> Option<ExperimentRow> {
    let first = rows.first()?;
    let n = rows.len() as f64;
    let mean = |f: fn(&StudyRow) -> f64| rows.iter().map(f).sum::<f64>() / n;
    Some(ExperimentRow {
        experiment: first.experiment.clone(),
        model: first.model.clone(),
        group_size: first.group_size,
        mapping: first.mapping,
        n_replications: rows.len(),
        n_valid_responses: rows.iter().map(|r| r.n_valid_responses).sum(),
        mean_rank: mean(|r| r.mean_rank),
        mrr: mean(|r| r.mrr),
        top1_accuracy: mean(|r| r.top1_accuracy),
        top3_accuracy: mean(|r| r.top3_accuracy),
        mrr_lift: mean(|r| r.mrr_lift),
        top1_lift: mean(|r| r.top1_lift),
        top3_lift: mean(|r| r.top3_lift),
    })
}

/// Everything a study compile produced.
#[derive(Debug, Clone)]
pub struct StudyCompiled {
    pub n_experiments: usize,
    pub n_rows: usize,
    pub analysis: AnalysisReport,
}

/// Compile a whole study.
///
/// Pre-flight audits every experiment; experiments whose replications are
/// all valid but that have not been compiled yet are compiled here. A
/// study already carrying a completion marker is refused unless `force`.
pub fn compile_study(
    study_dir: &Path,
    stats: &dyn StatsBackend,
    force: bool,
) -> Result<StudyCompiled> {
    let verdict = audit::audit_study(study_dir)?;

    if verdict.recommendation == StudyRecommendation::AlreadyComplete && !force {
        return Err(RanklabError::StudyAlreadyComplete {
            path: study_dir.to_path_buf(),
        });
    }
    if verdict.recommendation == StudyRecommendation::WaitForRepairs {
        let pending: Vec<String> = verdict
            .experiments
            .iter()
            .filter(|e| {
                matches!(
                    e.status,
                    ExperimentStatus::NeedsRepair | ExperimentStatus::RunCorrupted
                )
            })
            .map(|e| e.path.display().to_string())
            .collect();
        return Err(RanklabError::NotValidated {
            path: study_dir.to_path_buf(),
            detail: format!("experiments need repair: {}", pending.join(", ")),
        });
    }
    if verdict.experiments.is_empty() {
        return Err(RanklabError::NotValidated {
            path: study_dir.to_path_buf(),
            detail: "no experiment directories found".to_string(),
        });
    }

    let mut dataset = StudyDataset::default();
    let mut experiment_rows = Vec::new();
    for exp in &verdict.experiments {
        if exp.status == ExperimentStatus::AwaitingCompile {
            info!(path = %exp.path.display(), "compiling experiment inline before study roll-up");
        }
        // Compile (or re-compile under force) to get fresh rows.
        let rows = compile_experiment(&exp.path)?;
        if let Some(row) = experiment_row(&rows) {
            experiment_rows.push(row);
        } else {
            warn!(path = %exp.path.display(), "experiment contributed no rows");
        }
        dataset.rows.extend(rows);
    }
    experiment_rows.sort_by(|a, b| a.experiment.cmp(&b.experiment));
    dataset
        .rows
        .sort_by(|a, b| (a.experiment.as_str(), a.replication).cmp(&(b.experiment.as_str(), b.replication)));

    write_csv(&study_dir.join(EXPERIMENT_RESULTS_CSV), &experiment_rows)?;
    write_csv(&study_dir.join(STUDY_RESULTS_CSV), &dataset.rows)?;

    let analysis = stats.analyze(&dataset);
    let analysis_dir = study_dir.join(ANALYSIS_DIR);
    std::fs::create_dir_all(&analysis_dir)?;
    std::fs::write(
        analysis_dir.join("statistical_tests.json"),
        serde_json::to_string_pretty(&analysis)?,
    )?;
    std::fs::write(
        analysis_dir.join("analysis.md"),
        render_analysis(&analysis, &experiment_rows),
    )?;

    let marker = StudyCompleteMarker {
        completed_at: Utc::now(),
        n_experiments: experiment_rows.len(),
        n_rows: dataset.rows.len(),
    };
    std::fs::write(
        study_dir.join(STUDY_COMPLETE_FILE),
        serde_json::to_string_pretty(&marker)?,
    )?;

    info!(
        path = %study_dir.display(),
        n_experiments = experiment_rows.len(),
        n_rows = dataset.rows.len(),
        "study compiled"
    );
    Ok(StudyCompiled {
        n_experiments: experiment_rows.len(),
        n_rows: dataset.rows.len(),
        analysis,
    })
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn render_analysis(analysis: &AnalysisReport, experiments: &[ExperimentRow]) -> String {
    let mut out = String::from("# Cross-condition analysis\n\n## Conditions\n\n");
    for row in experiments {
        out.push_str(&format!(
            "- {}: k={}, mapping={}, {} replications, MRR lift {:.2}x\n",
            row.experiment, row.group_size, row.mapping, row.n_replications, row.mrr_lift
        ));
    }
    out.push_str("\n## Tests\n\n");
    if analysis.tests.is_empty() {
        out.push_str("No metric had enough groups to test.\n");
    }
    for test in &analysis.tests {
        out.push_str(&format!(
            "- {} ({}): statistic {:.4}, p = {:.4}, effect size {:.4}{}\n",
            test.metric,
            test.method,
            test.statistic,
            test.p_value,
            test.effect_size,
            test.note
                .as_deref()
                .map(|n| format!(" ({n})"))
                .unwrap_or_default()
        ));
    }
    if !analysis.omitted.is_empty() {
        out.push_str("\n## Omitted\n\n");
        for omitted in &analysis.omitted {
            out.push_str(&format!("- {omitted}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::replication_dir_name;
    use crate::stats::BuiltinStats;
    use crate::testutil::{corpus, make_valid_replication, setup_experiment, test_config};

    #[test]
    fn test_compile_experiment_writes_rows_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let exp_dir = dir.path().join("exp_m_k3_correct_20260314-090000");
        let mut config = test_config();
        config.num_replications = 2;
        let ctx = setup_experiment(&exp_dir, &config);
        let corpus = corpus();
        make_valid_replication(&ctx, &corpus, 1);
        make_valid_replication(&ctx, &corpus, 2);

        let rows = compile_experiment(&exp_dir).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].replication, 1);
        assert_eq!(rows[1].replication, 2);
        // Diagonal responses rank the correct identity first everywhere.
        assert_eq!(rows[0].mean_rank, 1.0);
        assert_eq!(rows[0].top1_accuracy, 1.0);

        let csv_body = std::fs::read_to_string(exp_dir.join(REPLICATION_RESULTS_CSV)).unwrap();
        assert_eq!(csv_body.lines().count(), 3); // header + 2 rows
        assert!(csv_body.lines().next().unwrap().starts_with("experiment,model,group_size"));

        let verdict = audit::audit_experiment(&exp_dir).unwrap();
        assert_eq!(verdict.status, ExperimentStatus::Validated);
    }

    #[test]
    fn test_compile_experiment_rejects_unrepaired_replication() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = setup_experiment(dir.path(), &test_config());
        make_valid_replication(&ctx, &corpus(), 1);
        std::fs::remove_file(dir.path().join(replication_dir_name(1)).join("report.md")).unwrap();

        let err = compile_experiment(dir.path()).unwrap_err();
        assert!(matches!(err, RanklabError::NotValidated { .. }));
        assert!(!dir.path().join(REPLICATION_RESULTS_CSV).exists());
    }

    #[test]
    fn test_compile_experiment_rejects_missing_replications() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.num_replications = 3;
        let ctx = setup_experiment(dir.path(), &config);
        make_valid_replication(&ctx, &corpus(), 1);

        let err = compile_experiment(dir.path()).unwrap_err();
        assert!(matches!(err, RanklabError::NotValidated { .. }));
    }

    fn make_study(dir: &Path) {
        let corpus = corpus();
        for (slug, mapping) in [
            ("exp_m_k3_correct_20260314-090000", crate::domain::MappingStrategy::Correct),
            ("exp_m_k3_random_20260314-100000", crate::domain::MappingStrategy::Random),
        ] {
            let mut config = test_config();
            config.mapping = mapping;
            config.num_replications = 2;
            let exp_dir = dir.join(slug);
            let ctx = setup_experiment(&exp_dir, &config);
            make_valid_replication(&ctx, &corpus, 1);
            make_valid_replication(&ctx, &corpus, 2);
        }
    }

    #[test]
    fn test_compile_study_end_to_end_and_idempotence_guard() {
        let dir = tempfile::tempdir().unwrap();
        make_study(dir.path());

        let compiled = compile_study(dir.path(), &BuiltinStats, false).unwrap();
        assert_eq!(compiled.n_experiments, 2);
        assert_eq!(compiled.n_rows, 4);

        assert!(dir.path().join(STUDY_RESULTS_CSV).exists());
        assert!(dir.path().join(EXPERIMENT_RESULTS_CSV).exists());
        assert!(dir.path().join(STUDY_COMPLETE_FILE).exists());
        assert!(dir
            .path()
            .join(ANALYSIS_DIR)
            .join("statistical_tests.json")
            .exists());

        let master = std::fs::read_to_string(dir.path().join(STUDY_RESULTS_CSV)).unwrap();
        assert_eq!(master.lines().count(), 5); // header + 4 rows
        assert!(master.contains(",correct,"));
        assert!(master.contains(",random,"));

        // Re-running without force is refused.
        let err = compile_study(dir.path(), &BuiltinStats, false).unwrap_err();
        assert!(matches!(err, RanklabError::StudyAlreadyComplete { .. }));
        // Force recompiles cleanly.
        let compiled = compile_study(dir.path(), &BuiltinStats, true).unwrap();
        assert_eq!(compiled.n_rows, 4);
    }

    #[test]
    fn test_compile_study_refuses_while_repairs_pending() {
        let dir = tempfile::tempdir().unwrap();
        make_study(dir.path());
        let broken = dir
            .path()
            .join("exp_m_k3_random_20260314-100000")
            .join(replication_dir_name(2));
        std::fs::remove_file(broken.join("report.md")).unwrap();

        let err = compile_study(dir.path(), &BuiltinStats, false).unwrap_err();
        assert!(matches!(err, RanklabError::NotValidated { .. }));
        assert!(!dir.path().join(STUDY_COMPLETE_FILE).exists());
    }
}
