//! Ranklab Core Library
//!
//! Lifecycle engine for LLM matching-trial studies: building and running
//! replications, auditing their artifacts, repairing defects, and compiling
//! results up the study hierarchy.

pub mod aggregate;
pub mod audit;
pub mod corpus;
pub mod domain;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod render;
pub mod repair;
pub mod report;
pub mod session;
pub mod stats;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testutil;

pub use domain::{
    resolve_conditions, BaseParams, ExperimentConfig, FactorMatrix, MappingStrategy, RanklabError,
    Result, RunContext,
};

pub use audit::{
    audit_experiment, audit_replication, audit_study, AuditStatus, ExperimentStatus,
    ExperimentVerdict, ReplicationVerdict, StudyRecommendation, StudyVerdict,
};

pub use aggregate::{compile_experiment, compile_study, StudyCompiled};

pub use corpus::{Identity, IdentityCorpus};

pub use parser::{parse_score_matrix, ParseFailure, ScoreMatrix};

pub use pipeline::{ReplicationOutcome, ReplicationPipeline, ReplicationSummary, Stage};

pub use repair::{ForceAction, RepairOrchestrator, RepairReport, MAX_REPAIR_CYCLES};

pub use session::{
    BatchVerdict, CompletionClient, HttpCompletionClient, RetryPolicy, SessionError,
    SessionManager,
};

pub use stats::{AnalysisReport, BuiltinStats, StatsBackend, StudyDataset, StudyRow};

pub use telemetry::init_tracing;
