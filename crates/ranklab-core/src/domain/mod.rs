//! Core domain types: configuration, contexts, and the error taxonomy.

pub mod config;
pub mod error;

pub use config::{
    resolve_conditions, BaseParams, ExperimentConfig, FactorMatrix, MappingStrategy, RunContext,
    CONFIG_SNAPSHOT_FILE,
};
pub use error::{RanklabError, Result};
