//! Trial manifest construction (the BUILD stage).
//!
//! A manifest pins every random decision of a replication up front: which
//! identities enter each trial, the stimulus and candidate orderings, the
//! description/identity mapping, and the per-row answer key. Shuffles are
//! seeded from the configured base seed plus the replication index, so a
//! rebuilt manifest is byte-identical to the original.

use std::fs;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::corpus::IdentityCorpus;
use crate::domain::{ExperimentConfig, MappingStrategy, RanklabError, Result};
use crate::layout::ReplicationPaths;

/// Prompt template rendered per trial. `{k}` is the group size; the stimulus
/// and candidate sections are substituted in.
pub const PROMPT_TEMPLATE: &str = "\
You will see {k} personality descriptions (numbered 1..{k}) and {k} candidate \
names (lettered). Score how well each description matches each candidate on a \
0-10 scale. Respond with a final {k}x{k} table: one line per description, \
each line ending in exactly {k} numbers separated by spaces, in candidate \
order.\n\nDescriptions:\n{descriptions}\nCandidates:\n{candidates}";

/// One matching task: `k` descriptions scored against `k` candidates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialSpec {
    /// 1-based trial index.
    pub index: usize,

    /// Identity whose description appears at each stimulus row.
    pub stimulus_names: Vec<String>,

    /// Candidate names in presentation (column) order.
    pub candidate_names: Vec<String>,

    /// For each stimulus row, the 0-based column of the correct identity.
    pub answer_key: Vec<usize>,

    /// Fully rendered prompt text.
    pub prompt: String,
}

/// The replication-level trial manifest, written once at BUILD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialManifest {
    pub replication_index: usize,
    pub group_size: usize,
    pub mapping: MappingStrategy,
    pub seed: u64,
    pub built_at: chrono::DateTime<chrono::Utc>,
    pub trials: Vec<TrialSpec>,
}

impl TrialManifest {
    pub fn save(&self, paths: &ReplicationPaths) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        fs::write(paths.manifest(), body)?;
        Ok(())
    }

    pub fn load(paths: &ReplicationPaths) -> Result<Self> {
        let path = paths.manifest();
        let body = fs::read_to_string(&path)
            .map_err(|_| RanklabError::MissingArtifact { path: path.clone() })?;
        serde_json::from_str(&body).map_err(|e| RanklabError::MalformedArtifact {
            path,
            detail: e.to_string(),
        })
    }
}

/// Derive the per-replication shuffle seed from the base seed.
fn replication_seed(base: u64, replication_index: usize) -> u64 {
    base.wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(replication_index as u64)
}

/// Build the manifest for one replication.
///
/// Deterministic per `(config.seed, replication_index)`. Under the `correct`
/// mapping each description row belongs to its true identity; under `random`
/// the descriptions are shuffled within the group (the null condition). The
/// answer key always points at the description's true author, so `random`
/// runs measure chance-level performance.
pub fn build_manifest(
    config: &ExperimentConfig,
    replication_index: usize,
    corpus: &IdentityCorpus,
) -> Result<TrialManifest> {
    let k = config.group_size;
    corpus.require(k)?;

    let seed = replication_seed(config.seed, replication_index);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut trials = Vec::with_capacity(config.num_trials);
    for trial_index in 1..=config.num_trials {
        // Sample a group of k identities, then independent row/column orders.
        let mut pool: Vec<usize> = (0..corpus.len()).collect();
        pool.shuffle(&mut rng);
        let group: Vec<&crate::corpus::Identity> = pool[..k]
            .iter()
            .map(|&i| &corpus.identities()[i])
            .collect();

        let mut candidate_order: Vec<usize> = (0..k).collect();
        candidate_order.shuffle(&mut rng);
        let candidate_names: Vec<String> = candidate_order
            .iter()
            .map(|&i| group[i].name.clone())
            .collect();

        // Row r shows the description authored by stimulus_names[r]. Under
        // the random mapping the displayed descriptions are permuted, but
        // stimulus_names tracks the true author of each displayed text.
        let mut description_order: Vec<usize> = (0..k).collect();
        if config.mapping == MappingStrategy::Random {
            description_order.shuffle(&mut rng);
        }
        let stimulus_names: Vec<String> = description_order
            .iter()
            .map(|&i| group[i].name.clone())
            .collect();

        let answer_key: Vec<usize> = description_order
            .iter()
            .map(|&author| {
                candidate_order
                    .iter()
                    .position(|&c| c == author)
                    .unwrap_or(0)
            })
            .collect();

        let descriptions = description_order
            .iter()
            .enumerate()
            .map(|(row, &i)| format!("{}. {}", row + 1, group[i].description))
            .collect::<Vec<_>>()
            .join("\n");
        let candidates = candidate_names
            .iter()
            .enumerate()
            .map(|(col, name)| format!("{}. {}", (b'A' + col as u8) as char, name))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = PROMPT_TEMPLATE
            .replace("{k}", &k.to_string())
            .replace("{descriptions}", &descriptions)
            .replace("{candidates}", &candidates);

        trials.push(TrialSpec {
            index: trial_index,
            stimulus_names,
            candidate_names,
            answer_key,
            prompt,
        });
    }

    Ok(TrialManifest {
        replication_index,
        group_size: k,
        mapping: config.mapping,
        seed,
        built_at: chrono::Utc::now(),
        trials,
    })
}

/// Write each trial's prompt under `queries/`.
pub fn write_queries(manifest: &TrialManifest, paths: &ReplicationPaths) -> Result<()> {
    paths.ensure_dirs()?;
    for trial in &manifest.trials {
        fs::write(paths.query_file(trial.index), &trial.prompt)?;
    }
    Ok(())
}
