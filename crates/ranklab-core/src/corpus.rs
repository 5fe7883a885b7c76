//! Read-only identity corpus consumed from the data-preparation pipeline.
//!
//! The upstream pipeline produces a tab-delimited file of
//! `identity<TAB>description` pairs (one per line, `#` comments allowed).
//! Its construction is out of scope here; this module only loads and
//! validates it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{RanklabError, Result};

/// One identity with its prepared description text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub description: String,
}

/// The full identity pool available for trial sampling.
#[derive(Debug, Clone)]
pub struct IdentityCorpus {
    identities: Vec<Identity>,
}

impl IdentityCorpus {
    /// Load a tab-delimited corpus file.
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .map_err(|_| RanklabError::MissingArtifact { path: path.to_path_buf() })?;
        Self::from_str(&body)
    }

    /// Parse corpus text. Blank lines and `#` comments are skipped.
    pub fn from_str(body: &str) -> Result<Self> {
        let mut identities = Vec::new();
        for (lineno, line) in body.lines().enumerate() {
            let line = line.trim_end();
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let Some((name, description)) = line.split_once('\t') else {
                return Err(RanklabError::CorpusFormat {
                    line: lineno + 1,
                    detail: "expected identity<TAB>description".to_string(),
                });
            };
            let name = name.trim();
            let description = description.trim();
            if name.is_empty() || description.is_empty() {
                return Err(RanklabError::CorpusFormat {
                    line: lineno + 1,
                    detail: "identity and description must both be non-empty".to_string(),
                });
            }
            identities.push(Identity {
                name: name.to_string(),
                description: description.to_string(),
            });
        }
        Ok(Self { identities })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Ensure the pool can populate a group of `needed` identities.
    pub fn require(&self, needed: usize) -> Result<()> {
        if self.identities.len() < needed {
            return Err(RanklabError::CorpusTooSmall {
                needed,
                available: self.identities.len(),
            });
        }
        Ok(())
    }
}
