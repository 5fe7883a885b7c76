//! Domain-level error taxonomy for Ranklab.

use std::path::PathBuf;

/// Ranklab domain errors.
///
/// Trial-level failures (a dropped call, an unparsable response) are *not*
/// errors — they are expected, budgeted outcomes carried as data in
/// [`crate::parser::ParseFailure`] and [`crate::session::TrialFailure`].
/// This enum covers conditions that stop an operation outright.
#[derive(Debug, thiserror::Error)]
pub enum RanklabError {
    #[error("invalid experiment config: {0}")]
    InvalidConfig(String),

    #[error("identity corpus line {line} is malformed: {detail}")]
    CorpusFormat { line: usize, detail: String },

    #[error("identity corpus too small: need {needed} identities, have {available}")]
    CorpusTooSmall { needed: usize, available: usize },

    #[error("missing artifact: {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("malformed artifact {}: {detail}", path.display())]
    MalformedArtifact { path: PathBuf, detail: String },

    #[error("cannot acquire lock on {}: another process is repairing this target", path.display())]
    LockBusy { path: PathBuf },

    #[error("target not validated: {} ({detail})", path.display())]
    NotValidated { path: PathBuf, detail: String },

    #[error("study already compiled: {} (re-run with a fresh study directory or remove the completion marker)", path.display())]
    StudyAlreadyComplete { path: PathBuf },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Ranklab domain operations.
pub type Result<T> = std::result::Result<T, RanklabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RanklabError::InvalidConfig("group_size must be >= 2".to_string());
        assert!(err.to_string().contains("invalid experiment config"));

        let err = RanklabError::CorpusTooSmall {
            needed: 5,
            available: 3,
        };
        assert!(err.to_string().contains("need 5"));
        assert!(err.to_string().contains("have 3"));
    }

    #[test]
    fn test_lock_busy_is_caller_visible() {
        let err = RanklabError::LockBusy {
            path: PathBuf::from("/tmp/exp_a"),
        };
        let msg = err.to_string();
        assert!(msg.contains("cannot acquire lock"));
        assert!(msg.contains("/tmp/exp_a"));
    }
}
