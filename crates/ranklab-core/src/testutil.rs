//! Shared unit-test fixtures. Everything here works offline: replications
//! are materialized from canned response text, never from a live service.

use std::path::Path;
use std::sync::Arc;

use crate::corpus::IdentityCorpus;
use crate::domain::{ExperimentConfig, RunContext};
use crate::layout::ReplicationPaths;
use crate::manifest::{build_manifest, write_queries};
use crate::pipeline::ReplicationPipeline;
use crate::session::{CompletionClient, SessionError, SessionManager};

/// A client that must never be reached.
pub struct PanickingClient;

#[async_trait::async_trait]
impl CompletionClient for PanickingClient {
    async fn complete(&self, _prompt: &str) -> Result<String, SessionError> {
        panic!("this test must not call the completion service");
    }
}

pub fn test_config() -> ExperimentConfig {
    ExperimentConfig {
        group_size: 3,
        num_trials: 4,
        num_replications: 1,
        min_valid_response_threshold: 1,
        ..Default::default()
    }
}

pub fn corpus() -> IdentityCorpus {
    let body: String = (0..12)
        .map(|i| format!("P{i}\tDescription {i}.\n"))
        .collect();
    IdentityCorpus::from_str(&body).unwrap()
}

/// Archive the config into `dir` and return a run context for it.
pub fn setup_experiment(dir: &Path, config: &ExperimentConfig) -> RunContext {
    std::fs::create_dir_all(dir).unwrap();
    config.archive(dir).unwrap();
    RunContext::new(dir, config.clone())
}

/// A response whose score matrix puts row i's peak on column i.
pub fn diagonal_response(k: usize) -> String {
    (0..k)
        .map(|i| {
            (0..k)
                .map(|j| if i == j { "9" } else { "1" })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Materialize a fully valid replication: manifest, queries, stored
/// responses, and the analysis artifacts via the offline reprocess path.
pub fn make_valid_replication(ctx: &RunContext, corpus: &IdentityCorpus, index: usize) {
    let paths = ReplicationPaths::new(&ctx.experiment_dir, index);
    paths.ensure_dirs().unwrap();
    let manifest = build_manifest(&ctx.config, index, corpus).unwrap();
    manifest.save(&paths).unwrap();
    write_queries(&manifest, &paths).unwrap();

    let text = diagonal_response(ctx.config.group_size);
    for trial in &manifest.trials {
        std::fs::write(paths.response_file(trial.index), &text).unwrap();
    }

    let sessions = SessionManager::new(Arc::new(PanickingClient), 1);
    let pipeline = ReplicationPipeline::new(ctx, corpus, &sessions);
    assert!(pipeline.reprocess(index).unwrap().is_valid());
}
