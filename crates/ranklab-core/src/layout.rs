//! Directory-tree data store layout.
//!
//! The engine persists everything as files under a study directory:
//!
//! ```text
//! <study>/
//!     STUDY_results.csv
//!     EXPERIMENT_results.csv
//!     STUDY_COMPLETE.json
//!     analysis/
//!     exp_<model>_k<k>_<mapping>_<YYYYmmdd-HHMMSS>/
//!         config.snapshot.json
//!         REPLICATION_results.csv
//!         experiment_summary.json
//!         replication_<NN>/
//!             manifest.json
//!             queries/trial_<NN>.txt
//!             responses/trial_<NN>.txt            (raw text)
//!             responses/trial_<NN>.failed.json    (failure marker)
//!             scores/trial_<NN>.json
//!             report.md
//!             replication_summary.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::domain::{ExperimentConfig, MappingStrategy};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const REPORT_FILE: &str = "report.md";
pub const REPLICATION_SUMMARY_FILE: &str = "replication_summary.json";
pub const EXPERIMENT_SUMMARY_FILE: &str = "experiment_summary.json";
pub const REPLICATION_RESULTS_CSV: &str = "REPLICATION_results.csv";
pub const EXPERIMENT_RESULTS_CSV: &str = "EXPERIMENT_results.csv";
pub const STUDY_RESULTS_CSV: &str = "STUDY_results.csv";
pub const STUDY_COMPLETE_FILE: &str = "STUDY_COMPLETE.json";
pub const ANALYSIS_DIR: &str = "analysis";
pub const QUERIES_DIR: &str = "queries";
pub const RESPONSES_DIR: &str = "responses";
pub const SCORES_DIR: &str = "scores";
pub const LOCK_FILE: &str = ".ranklab.lock";

/// Build the timestamped directory name for a new experiment.
pub fn experiment_dir_name(config: &ExperimentConfig, created_at: DateTime<Utc>) -> String {
    format!(
        "exp_{}_k{}_{}_{}",
        config.model_slug(),
        config.group_size,
        config.mapping,
        created_at.format("%Y%m%d-%H%M%S")
    )
}

/// Parsed components of a well-formed experiment directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentDirName {
    pub model_slug: String,
    pub group_size: usize,
    pub mapping: MappingStrategy,
    pub timestamp: String,
}

/// Parse `exp_<model>_k<k>_<mapping>_<ts>`; `None` if malformed.
pub fn parse_experiment_dir_name(name: &str) -> Option<ExperimentDirName> {
    let rest = name.strip_prefix("exp_")?;
    // Timestamp and mapping are the last two underscore-separated fields;
    // the model slug may itself contain '-' but never '_'.
    let mut parts: Vec<&str> = rest.split('_').collect();
    if parts.len() < 4 {
        return None;
    }
    let timestamp = parts.pop()?.to_string();
    if timestamp.len() != 15 || !timestamp.as_bytes()[8].eq(&b'-') {
        return None;
    }
    let mapping = match parts.pop()? {
        "correct" => MappingStrategy::Correct,
        "random" => MappingStrategy::Random,
        _ => return None,
    };
    let k_field = parts.pop()?;
    let group_size: usize = k_field.strip_prefix('k')?.parse().ok()?;
    if group_size < 2 {
        return None;
    }
    let model_slug = parts.join("_");
    if model_slug.is_empty() {
        return None;
    }
    Some(ExperimentDirName {
        model_slug,
        group_size,
        mapping,
        timestamp,
    })
}

/// Build the directory name for replication `index` (1-based).
pub fn replication_dir_name(index: usize) -> String {
    format!("replication_{index:02}")
}

/// Parse `replication_<NN>` into its 1-based index; `None` if malformed.
pub fn parse_replication_dir_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("replication_")?;
    if digits.len() < 2 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let index: usize = digits.parse().ok()?;
    (index >= 1).then_some(index)
}

/// Resolved artifact paths for one replication directory.
#[derive(Debug, Clone)]
pub struct ReplicationPaths {
    pub root: PathBuf,
}

impl ReplicationPaths {
    pub fn new(experiment_dir: &Path, replication_index: usize) -> Self {
        Self {
            root: experiment_dir.join(replication_dir_name(replication_index)),
        }
    }

    pub fn for_dir(replication_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: replication_dir.into(),
        }
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn queries_dir(&self) -> PathBuf {
        self.root.join(QUERIES_DIR)
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.root.join(RESPONSES_DIR)
    }

    pub fn scores_dir(&self) -> PathBuf {
        self.root.join(SCORES_DIR)
    }

    pub fn query_file(&self, trial_index: usize) -> PathBuf {
        self.queries_dir().join(format!("trial_{trial_index:02}.txt"))
    }

    pub fn response_file(&self, trial_index: usize) -> PathBuf {
        self.responses_dir()
            .join(format!("trial_{trial_index:02}.txt"))
    }

    pub fn failure_file(&self, trial_index: usize) -> PathBuf {
        self.responses_dir()
            .join(format!("trial_{trial_index:02}.failed.json"))
    }

    pub fn score_file(&self, trial_index: usize) -> PathBuf {
        self.scores_dir().join(format!("trial_{trial_index:02}.json"))
    }

    pub fn report(&self) -> PathBuf {
        self.root.join(REPORT_FILE)
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join(REPLICATION_SUMMARY_FILE)
    }

    /// Create the queries/responses/scores subdirectories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.queries_dir())?;
        std::fs::create_dir_all(self.responses_dir())?;
        std::fs::create_dir_all(self.scores_dir())?;
        Ok(())
    }

    /// A trial has a usable stored response iff the raw text file exists and
    /// is non-empty. Failure markers do not count: a repair at the RUN stage
    /// re-issues exactly the trials for which this returns `false`.
    pub fn has_stored_response(&self, trial_index: usize) -> bool {
        std::fs::metadata(self.response_file(trial_index))
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    /// Whether the trial is recorded at all (raw text or failure marker).
    pub fn is_recorded(&self, trial_index: usize) -> bool {
        self.has_stored_response(trial_index) || self.failure_file(trial_index).exists()
    }
}

/// List child replication directories of an experiment, sorted by index.
/// Malformed names are returned separately so the auditor can flag them.
pub fn list_replication_dirs(experiment_dir: &Path) -> std::io::Result<(Vec<(usize, PathBuf)>, Vec<PathBuf>)> {
    let mut valid = Vec::new();
    let mut malformed = Vec::new();
    for entry in std::fs::read_dir(experiment_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ANALYSIS_DIR {
            continue;
        }
        match parse_replication_dir_name(&name) {
            Some(index) => valid.push((index, entry.path())),
            None => {
                if name.starts_with("replication") {
                    malformed.push(entry.path());
                }
            }
        }
    }
    valid.sort_by_key(|(i, _)| *i);
    Ok((valid, malformed))
}

/// List child experiment directories of a study, sorted by name.
pub fn list_experiment_dirs(study_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(study_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("exp_") {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}
