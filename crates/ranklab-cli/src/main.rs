//! Ranklab - matching-trial experiment engine CLI
//!
//! The `ranklab` command drives the full study lifecycle.
//!
//! ## Commands
//!
//! - `run`: Execute every replication of one experiment condition
//! - `reprocess`: Redo parsing and analysis from stored responses
//! - `audit`: Read-only integrity check of a replication, experiment, or study
//! - `repair`: Apply the minimal fix for auditable defects
//! - `compile-experiment`: Roll valid replications up into experiment CSVs
//! - `compile-study`: Build the study master dataset and run the statistics
//! - `resolve-conditions`: Expand a factor matrix into concrete conditions

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn, Level};

use ranklab_core::{
    audit_experiment, audit_replication, audit_study, compile_experiment, compile_study,
    init_tracing, layout, render, resolve_conditions, AuditStatus, BuiltinStats, ExperimentConfig,
    FactorMatrix, ForceAction, HttpCompletionClient, IdentityCorpus, RanklabError,
    RepairOrchestrator, ReplicationOutcome, ReplicationPipeline, RetryPolicy, RunContext,
    SessionManager, StudyRecommendation,
};

#[derive(Parser)]
#[command(name = "ranklab")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "LLM matching-trial experiment engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines, and JSON verdicts on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ForceArg {
    /// Re-issue missing trials, then redo the analysis
    Full,
    /// Redo parse/analyze/report only; no service calls
    Analysis,
    /// Rebuild the experiment-level aggregation artifacts only
    Reaggregate,
}

impl ForceArg {
    fn repair_action(self) -> Option<ForceAction> {
        match self {
            ForceArg::Full => Some(ForceAction::Full),
            ForceArg::Analysis => Some(ForceAction::AnalysisOnly),
            ForceArg::Reaggregate => None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every replication of one experiment condition
    Run {
        /// Experiment condition file (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Identity corpus file (tab-delimited)
        #[arg(long)]
        corpus: PathBuf,

        /// Study directory the experiment directory is created under
        #[arg(short, long, default_value = ".")]
        study_dir: PathBuf,

        /// Completion endpoint
        #[arg(long, default_value = HttpCompletionClient::DEFAULT_ENDPOINT)]
        endpoint: String,
    },

    /// Redo PARSE through SUMMARIZE from stored responses; never calls the service
    Reprocess {
        /// Experiment directory
        experiment: PathBuf,

        /// Single replication index (default: all found on disk)
        #[arg(short, long)]
        replication: Option<usize>,
    },

    /// Read-only integrity audit
    Audit {
        /// Study directory, or an experiment directory with --experiment
        path: PathBuf,

        /// Treat the path as one experiment directory
        #[arg(long)]
        experiment: bool,

        /// Audit one replication of the experiment directory
        #[arg(short, long, requires = "experiment")]
        replication: Option<usize>,
    },

    /// Repair auditable defects in an experiment's replications
    Repair {
        /// Experiment directory
        experiment: PathBuf,

        /// Identity corpus file, needed when queries must be rebuilt
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Single replication index (default: all)
        #[arg(short, long)]
        replication: Option<usize>,

        /// Force a pass over already-valid replications
        #[arg(long, value_enum)]
        force: Option<ForceArg>,

        /// Completion endpoint for re-issued trials
        #[arg(long, default_value = HttpCompletionClient::DEFAULT_ENDPOINT)]
        endpoint: String,
    },

    /// Compile one experiment's valid replications into CSVs
    CompileExperiment {
        /// Experiment directory
        experiment: PathBuf,
    },

    /// Compile the study master dataset and run the statistical analysis
    CompileStudy {
        /// Study directory
        study: PathBuf,

        /// Recompile even when the study is already marked complete
        #[arg(long)]
        force: bool,
    },

    /// Expand a factor matrix file into concrete experiment conditions
    ResolveConditions {
        /// Factor matrix file (JSON)
        matrix: PathBuf,

        /// Emit only the i-th condition (0-based) of the stable order
        #[arg(long)]
        select: Option<usize>,
    },
}

fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("reading condition file {}", path.display()))?;
    let config: ExperimentConfig = serde_json::from_str(&body)
        .with_context(|| format!("parsing condition file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn load_corpus(path: Option<&Path>, config: Option<&ExperimentConfig>) -> Result<IdentityCorpus> {
    match path {
        Some(path) => {
            let corpus = IdentityCorpus::load(path)?;
            if let Some(config) = config {
                corpus.require(config.group_size)?;
            }
            Ok(corpus)
        }
        // Analysis-only paths never touch the corpus.
        None => Ok(IdentityCorpus::from_str("")?),
    }
}

fn completion_client(
    endpoint: &str,
    config: &ExperimentConfig,
    required: bool,
) -> Result<Arc<HttpCompletionClient>> {
    let key = std::env::var("OPENROUTER_API_KEY").unwrap_or_default();
    if key.is_empty() && required {
        bail!("OPENROUTER_API_KEY is not set");
    }
    Ok(Arc::new(HttpCompletionClient::new(endpoint, key, config)))
}

/// A watch channel flipped to `true` on Ctrl-C.
fn cancellation_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining in-flight trials");
            tx.send(true).ok();
        }
    });
    rx
}

async fn cmd_run(
    config_path: &Path,
    corpus_path: &Path,
    study_dir: &Path,
    endpoint: &str,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let corpus = load_corpus(Some(corpus_path), Some(&config))?;

    let experiment_dir = study_dir.join(layout::experiment_dir_name(&config, Utc::now()));
    std::fs::create_dir_all(&experiment_dir)
        .with_context(|| format!("creating {}", experiment_dir.display()))?;
    config.archive(&experiment_dir)?;
    info!(path = %experiment_dir.display(), "experiment directory created");

    let client = completion_client(endpoint, &config, true)?;
    let sessions = SessionManager::new(client, config.max_parallel_sessions)
        .with_retry(RetryPolicy::default())
        .with_cancellation(cancellation_signal());
    let ctx = RunContext::new(&experiment_dir, config.clone());
    let pipeline = ReplicationPipeline::new(&ctx, &corpus, &sessions);

    let mut n_failed = 0usize;
    for index in 1..=config.num_replications {
        match pipeline.execute(index).await? {
            ReplicationOutcome::Valid(summary) => {
                info!(
                    replication = index,
                    n_valid = summary.n_valid_responses,
                    "replication valid"
                );
            }
            ReplicationOutcome::Failed { stage, detail } => {
                n_failed += 1;
                warn!(replication = index, %stage, %detail, "replication failed");
            }
        }
    }

    println!("{}", experiment_dir.display());
    Ok(if n_failed == 0 { 0 } else { 1 })
}

fn cmd_reprocess(experiment_dir: &Path, replication: Option<usize>) -> Result<i32> {
    let config = ExperimentConfig::load_archived(experiment_dir)?;
    let corpus = load_corpus(None, None)?;
    let ctx = RunContext::new(experiment_dir, config);
    // The client is never reached on this path; reprocess is offline.
    let client = completion_client(HttpCompletionClient::DEFAULT_ENDPOINT, &ctx.config, false)?;
    let sessions = SessionManager::new(client, ctx.config.max_parallel_sessions);
    let pipeline = ReplicationPipeline::new(&ctx, &corpus, &sessions);

    let indices: Vec<usize> = match replication {
        Some(index) => vec![index],
        None => layout::list_replication_dirs(experiment_dir)?
            .0
            .into_iter()
            .map(|(index, _)| index)
            .collect(),
    };

    let mut n_failed = 0usize;
    for index in indices {
        match pipeline.reprocess(index)? {
            ReplicationOutcome::Valid(summary) => {
                info!(replication = index, n_valid = summary.n_valid_responses, "reprocessed");
            }
            ReplicationOutcome::Failed { stage, detail } => {
                n_failed += 1;
                warn!(replication = index, %stage, %detail, "reprocess failed");
            }
        }
    }
    Ok(if n_failed == 0 { 0 } else { 1 })
}

fn cmd_audit(path: &Path, experiment: bool, replication: Option<usize>, json: bool) -> Result<i32> {
    let color = !json;
    if let Some(index) = replication {
        let rep_dir = path.join(layout::replication_dir_name(index));
        let verdict = audit_replication(path, &rep_dir);
        if json {
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        } else {
            println!("{}", render::render_replication(&verdict, color));
        }
        return Ok(if verdict.status == AuditStatus::Valid { 0 } else { 1 });
    }

    if experiment {
        let verdict = audit_experiment(path)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        } else {
            print!("{}", render::render_experiment(&verdict, color));
        }
        return Ok(match verdict.status {
            ranklab_core::ExperimentStatus::Validated
            | ranklab_core::ExperimentStatus::AwaitingCompile => 0,
            _ => 1,
        });
    }

    let verdict = audit_study(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print!("{}", render::render_study(&verdict, color));
    }
    Ok(match verdict.recommendation {
        StudyRecommendation::WaitForRepairs => 1,
        _ => 0,
    })
}

async fn cmd_repair(
    experiment_dir: &Path,
    corpus_path: Option<&Path>,
    replication: Option<usize>,
    force: Option<ForceArg>,
    endpoint: &str,
    json: bool,
) -> Result<i32> {
    let config = ExperimentConfig::load_archived(experiment_dir)?;
    let corpus = load_corpus(corpus_path, Some(&config))?;
    let ctx = RunContext::new(experiment_dir, config);
    let client = completion_client(endpoint, &ctx.config, false)?;
    let sessions = SessionManager::new(client, ctx.config.max_parallel_sessions)
        .with_retry(RetryPolicy::default());
    let orchestrator = RepairOrchestrator::new(&ctx, &corpus, &sessions);
    let reaggregate = force == Some(ForceArg::Reaggregate);
    let force = force.and_then(ForceArg::repair_action);

    let reports = match replication {
        Some(index) => vec![(index, orchestrator.repair_replication(index, force).await?)],
        None => orchestrator.repair_experiment(force).await?,
    };

    let mut n_unclean = 0usize;
    for (index, report) in &reports {
        if !report.is_clean() {
            n_unclean += 1;
        }
        if json {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            println!("{}", render::render_repair(*index, report, true));
        }
    }
    if reaggregate && n_unclean == 0 {
        compile_experiment(experiment_dir)?;
        info!(path = %experiment_dir.display(), "aggregation artifacts rebuilt");
    }
    Ok(if n_unclean == 0 { 0 } else { 1 })
}

fn cmd_compile_experiment(experiment_dir: &Path) -> Result<i32> {
    let rows = compile_experiment(experiment_dir)?;
    info!(
        path = %experiment_dir.display(),
        n_replications = rows.len(),
        "experiment compiled"
    );
    Ok(0)
}

fn cmd_compile_study(study_dir: &Path, force: bool, json: bool) -> Result<i32> {
    let compiled = compile_study(study_dir, &BuiltinStats, force)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&compiled.analysis)?);
    } else {
        println!(
            "compiled {} experiments ({} replication rows)",
            compiled.n_experiments, compiled.n_rows
        );
        for test in &compiled.analysis.tests {
            println!(
                "  {} [{}]: p = {:.4}, effect size {:.4}",
                test.metric, test.method, test.p_value, test.effect_size
            );
        }
    }
    Ok(0)
}

fn cmd_resolve_conditions(matrix_path: &Path, select: Option<usize>) -> Result<i32> {
    let body = std::fs::read_to_string(matrix_path)
        .with_context(|| format!("reading factor matrix {}", matrix_path.display()))?;
    let matrix: FactorMatrix = serde_json::from_str(&body)
        .with_context(|| format!("parsing factor matrix {}", matrix_path.display()))?;
    let conditions = resolve_conditions(&matrix, select)?;
    println!("{}", serde_json::to_string_pretty(&conditions)?);
    Ok(0)
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            corpus,
            study_dir,
            endpoint,
        } => cmd_run(&config, &corpus, &study_dir, &endpoint).await,
        Commands::Reprocess {
            experiment,
            replication,
        } => cmd_reprocess(&experiment, replication),
        Commands::Audit {
            path,
            experiment,
            replication,
        } => cmd_audit(&path, experiment, replication, cli.json),
        Commands::Repair {
            experiment,
            corpus,
            replication,
            force,
            endpoint,
        } => {
            cmd_repair(
                &experiment,
                corpus.as_deref(),
                replication,
                force,
                &endpoint,
                cli.json,
            )
            .await
        }
        Commands::CompileExperiment { experiment } => cmd_compile_experiment(&experiment),
        Commands::CompileStudy { study, force } => cmd_compile_study(&study, force, cli.json),
        Commands::ResolveConditions { matrix, select } => {
            cmd_resolve_conditions(&matrix, select)
        }
    }
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(error) => {
            if matches!(
                error.downcast_ref::<RanklabError>(),
                Some(RanklabError::LockBusy { .. })
            ) {
                eprintln!("error: {error:#}");
                2
            } else {
                eprintln!("error: {error:#}");
                1
            }
        }
    };
    std::process::exit(code);
}
