//! Experiment configuration, archived snapshots, and condition resolution.
//!
//! Configuration is an explicit value threaded through every component via
//! [`RunContext`] — there is no process-wide "current experiment" state.
//! At experiment creation the resolved config is copied verbatim into the
//! run directory as `config.snapshot.json`; the auditor later checks that
//! snapshot for presence and consistency, and only an explicit repair may
//! regenerate it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{RanklabError, Result};

/// File name of the archived configuration inside an experiment directory.
pub const CONFIG_SNAPSHOT_FILE: &str = "config.snapshot.json";

/// How stimulus descriptions are paired with candidate identities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MappingStrategy {
    /// Each description belongs to its true identity.
    Correct,
    /// Descriptions are shuffled among the group (null condition).
    Random,
}

impl std::fmt::Display for MappingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingStrategy::Correct => write!(f, "correct"),
            MappingStrategy::Random => write!(f, "random"),
        }
    }
}

/// One experimental condition: fixed model, group size `k`, mapping strategy,
/// plus the run parameters shared by every replication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentConfig {
    /// Model identifier passed to the text-generation service.
    pub model: String,

    /// Group size `k`: stimuli and candidates per trial.
    pub group_size: usize,

    /// Stimulus/identity pairing strategy.
    pub mapping: MappingStrategy,

    /// Trials per replication.
    pub num_trials: usize,

    /// Replications per experiment.
    pub num_replications: usize,

    /// Sampling temperature for the service.
    pub temperature: f64,

    /// Max tokens per completion.
    pub max_tokens: u32,

    /// Maximum in-flight requests during a session batch.
    pub max_parallel_sessions: usize,

    /// Base seed for deterministic manifest shuffles.
    pub seed: u64,

    /// Minimum parsed responses for the analysis to be considered meaningful.
    pub min_valid_response_threshold: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            group_size: 5,
            mapping: MappingStrategy::Correct,
            num_trials: 10,
            num_replications: 3,
            temperature: 0.2,
            max_tokens: 2048,
            max_parallel_sessions: 10,
            seed: 42,
            min_valid_response_threshold: 5,
        }
    }
}

impl ExperimentConfig {
    /// Validate parameter ranges before any directory is created.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(RanklabError::InvalidConfig("model must not be empty".into()));
        }
        if self.group_size < 2 {
            return Err(RanklabError::InvalidConfig(format!(
                "group_size must be >= 2, got {}",
                self.group_size
            )));
        }
        if self.num_trials == 0 {
            return Err(RanklabError::InvalidConfig("num_trials must be >= 1".into()));
        }
        if self.num_replications == 0 {
            return Err(RanklabError::InvalidConfig(
                "num_replications must be >= 1".into(),
            ));
        }
        if self.max_parallel_sessions == 0 {
            return Err(RanklabError::InvalidConfig(
                "max_parallel_sessions must be >= 1".into(),
            ));
        }
        if self.min_valid_response_threshold > self.num_trials {
            return Err(RanklabError::InvalidConfig(format!(
                "min_valid_response_threshold ({}) exceeds num_trials ({})",
                self.min_valid_response_threshold, self.num_trials
            )));
        }
        Ok(())
    }

    /// Filesystem-safe slug of the model identifier.
    pub fn model_slug(&self) -> String {
        self.model
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect::<String>()
            .trim_matches('-')
            .to_string()
    }

    /// Write the verbatim JSON snapshot into `experiment_dir`.
    pub fn archive(&self, experiment_dir: &Path) -> Result<PathBuf> {
        let path = experiment_dir.join(CONFIG_SNAPSHOT_FILE);
        let body = serde_json::to_string_pretty(self)?;
        fs::write(&path, body)?;
        Ok(path)
    }

    /// Load an archived snapshot from `experiment_dir`.
    pub fn load_archived(experiment_dir: &Path) -> Result<Self> {
        let path = experiment_dir.join(CONFIG_SNAPSHOT_FILE);
        let body = fs::read_to_string(&path)
            .map_err(|_| RanklabError::MissingArtifact { path: path.clone() })?;
        serde_json::from_str(&body).map_err(|e| RanklabError::MalformedArtifact {
            path,
            detail: e.to_string(),
        })
    }
}

/// Explicit context value handed to every component: the experiment directory
/// plus its resolved configuration.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub experiment_dir: PathBuf,
    pub config: ExperimentConfig,
}

impl RunContext {
    pub fn new(experiment_dir: impl Into<PathBuf>, config: ExperimentConfig) -> Self {
        Self {
            experiment_dir: experiment_dir.into(),
            config,
        }
    }

    /// Rebuild a context from an existing experiment directory by reading its
    /// archived configuration.
    pub fn from_dir(experiment_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = experiment_dir.into();
        let config = ExperimentConfig::load_archived(&dir)?;
        Ok(Self {
            experiment_dir: dir,
            config,
        })
    }
}

/// Declarative factor matrix for condition resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorMatrix {
    pub models: Vec<String>,
    pub group_sizes: Vec<usize>,
    pub mappings: Vec<MappingStrategy>,
    /// Shared run parameters applied to every combination.
    #[serde(default)]
    pub base: BaseParams,
}

/// Run parameters shared across all factor combinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseParams {
    pub num_trials: usize,
    pub num_replications: usize,
    pub temperature: f64,
    pub max_tokens: u32,
    pub max_parallel_sessions: usize,
    pub seed: u64,
    pub min_valid_response_threshold: usize,
}

impl Default for BaseParams {
    fn default() -> Self {
        let d = ExperimentConfig::default();
        Self {
            num_trials: d.num_trials,
            num_replications: d.num_replications,
            temperature: d.temperature,
            max_tokens: d.max_tokens,
            max_parallel_sessions: d.max_parallel_sessions,
            seed: d.seed,
            min_valid_response_threshold: d.min_valid_response_threshold,
        }
    }
}

/// Resolve a factor matrix into concrete conditions.
///
/// Pure data transform, decoupled from any terminal I/O: with
/// `selection = None` the full cross-product is returned in a stable order
/// (model-major, then group size, then mapping); with `selection = Some(i)`
/// only the i-th combination of that order.
pub fn resolve_conditions(
    matrix: &FactorMatrix,
    selection: Option<usize>,
) -> Result<Vec<ExperimentConfig>> {
    let mut out = Vec::new();
    for model in &matrix.models {
        for &group_size in &matrix.group_sizes {
            for &mapping in &matrix.mappings {
                let config = ExperimentConfig {
                    model: model.clone(),
                    group_size,
                    mapping,
                    num_trials: matrix.base.num_trials,
                    num_replications: matrix.base.num_replications,
                    temperature: matrix.base.temperature,
                    max_tokens: matrix.base.max_tokens,
                    max_parallel_sessions: matrix.base.max_parallel_sessions,
                    seed: matrix.base.seed,
                    min_valid_response_threshold: matrix.base.min_valid_response_threshold,
                };
                config.validate()?;
                out.push(config);
            }
        }
    }
    match selection {
        None => Ok(out),
        Some(i) if i < out.len() => Ok(vec![out.swap_remove(i)]),
        Some(i) => Err(RanklabError::InvalidConfig(format!(
            "condition index {i} out of range (matrix resolves to {} combinations)",
            out.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ExperimentConfig::default().validate().expect("default valid");
    }

    #[test]
    fn test_validate_rejects_small_group() {
        let config = ExperimentConfig {
            group_size: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_above_trials() {
        let config = ExperimentConfig {
            num_trials: 4,
            min_valid_response_threshold: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_slug() {
        let config = ExperimentConfig {
            model: "openai/GPT-4o".to_string(),
            ..Default::default()
        };
        assert_eq!(config.model_slug(), "openai-gpt-4o");
    }

    #[test]
    fn test_archive_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ExperimentConfig::default();
        config.archive(dir.path()).expect("archive");
        let loaded = ExperimentConfig::load_archived(dir.path()).expect("load");
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_archived_missing_is_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ExperimentConfig::load_archived(dir.path()).unwrap_err();
        assert!(matches!(err, RanklabError::MissingArtifact { .. }));
    }

    #[test]
    fn test_resolve_conditions_cross_product() {
        let matrix = FactorMatrix {
            models: vec!["a".into(), "b".into()],
            group_sizes: vec![5, 8],
            mappings: vec![MappingStrategy::Correct, MappingStrategy::Random],
            base: BaseParams::default(),
        };
        let all = resolve_conditions(&matrix, None).expect("resolve");
        assert_eq!(all.len(), 8);
        // Stable order: model-major.
        assert_eq!(all[0].model, "a");
        assert_eq!(all[7].model, "b");
        assert_eq!(all[7].group_size, 8);
        assert_eq!(all[7].mapping, MappingStrategy::Random);
    }

    #[test]
    fn test_resolve_conditions_selection() {
        let matrix = FactorMatrix {
            models: vec!["a".into()],
            group_sizes: vec![5],
            mappings: vec![MappingStrategy::Correct],
            base: BaseParams::default(),
        };
        let one = resolve_conditions(&matrix, Some(0)).expect("resolve");
        assert_eq!(one.len(), 1);
        assert!(resolve_conditions(&matrix, Some(3)).is_err());
    }
}
