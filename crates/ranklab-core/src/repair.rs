//! Audit-driven repair (the repair orchestrator).
//!
//! Repair is the only write path driven by an audit verdict. It applies the
//! single cheapest sufficient action for a one-issue replication, re-audits,
//! and repeats up to [`MAX_REPAIR_CYCLES`] times. Corrupted replications
//! (two or more issues) are never touched: the recommendation there is
//! discard-and-rerun, a human decision.
//!
//! The whole experiment directory is held under an advisory lock for the
//! duration, see [`DirLock`].

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{audit_replication, AuditStatus, Issue, RepairAction, ReplicationVerdict};
use crate::corpus::IdentityCorpus;
use crate::domain::{Result, RunContext};
use crate::layout::{self, ReplicationPaths};
use crate::lock::DirLock;
use crate::manifest::{build_manifest, write_queries};
use crate::pipeline::ReplicationPipeline;
use crate::session::SessionManager;

/// Hard cap on audit -> act -> re-audit rounds per replication.
pub const MAX_REPAIR_CYCLES: usize = 3;

/// Explicit override for an already-valid target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceAction {
    /// Re-enter at RUN: re-issue missing trials, then redo the analysis.
    Full,
    /// Redo PARSE through SUMMARIZE only; never touches the service.
    AnalysisOnly,
}

/// Terminal outcome of one replication repair.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairReport {
    /// Audit found nothing; no file was touched.
    AlreadyValid,
    /// The replication audits clean after `cycles` rounds.
    Repaired { cycles: usize },
    /// The cycle cap was reached with issues still present.
    Unresolved { cycles: usize, issues: Vec<Issue> },
    /// Multi-issue corruption, or an issue with no automatic action.
    Corrupted { issues: Vec<Issue> },
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        matches!(self, RepairReport::AlreadyValid | RepairReport::Repaired { .. })
    }
}

/// Applies minimal repairs to replications of one experiment.
pub struct RepairOrchestrator<'a> {
    ctx: &'a RunContext,
    corpus: &'a IdentityCorpus,
    sessions: &'a SessionManager,
}

impl<'a> RepairOrchestrator<'a> {
    pub fn new(
        ctx: &'a RunContext,
        corpus: &'a IdentityCorpus,
        sessions: &'a SessionManager,
    ) -> Self {
        Self {
            ctx,
            corpus,
            sessions,
        }
    }

    fn pipeline(&self) -> ReplicationPipeline<'a> {
        ReplicationPipeline::new(self.ctx, self.corpus, self.sessions)
    }

    /// Repair a single replication under the experiment lock.
    pub async fn repair_replication(
        &self,
        replication_index: usize,
        force: Option<ForceAction>,
    ) -> Result<RepairReport> {
        let _lock = DirLock::acquire(&self.ctx.experiment_dir)?;
        self.repair_locked(replication_index, force).await
    }

    /// Repair every replication of the experiment under one lock.
    pub async fn repair_experiment(
        &self,
        force: Option<ForceAction>,
    ) -> Result<Vec<(usize, RepairReport)>> {
        let _lock = DirLock::acquire(&self.ctx.experiment_dir)?;
        let (dirs, _malformed) = layout::list_replication_dirs(&self.ctx.experiment_dir)?;
        let mut out = Vec::with_capacity(dirs.len());
        for (index, _) in dirs {
            let report = self.repair_locked(index, force).await?;
            out.push((index, report));
        }
        Ok(out)
    }

    async fn repair_locked(
        &self,
        replication_index: usize,
        force: Option<ForceAction>,
    ) -> Result<RepairReport> {
        let rep_dir = self
            .ctx
            .experiment_dir
            .join(layout::replication_dir_name(replication_index));

        let mut verdict = audit_replication(&self.ctx.experiment_dir, &rep_dir);
        if verdict.is_valid() {
            return match force {
                None => Ok(RepairReport::AlreadyValid),
                Some(action) => {
                    info!(replication_index, ?action, "forcing repair of a valid replication");
                    self.apply_force(replication_index, action).await?;
                    let verdict = audit_replication(&self.ctx.experiment_dir, &rep_dir);
                    if verdict.is_valid() {
                        Ok(RepairReport::Repaired { cycles: 1 })
                    } else {
                        Ok(RepairReport::Unresolved {
                            cycles: 1,
                            issues: verdict.issues,
                        })
                    }
                }
            };
        }

        for cycle in 1..=MAX_REPAIR_CYCLES {
            match verdict.status {
                AuditStatus::Valid => {
                    info!(replication_index, cycles = cycle - 1, "replication repaired");
                    return Ok(RepairReport::Repaired { cycles: cycle - 1 });
                }
                AuditStatus::RunCorrupted => {
                    warn!(replication_index, n_issues = verdict.issues.len(), "corrupted, not repairing");
                    return Ok(RepairReport::Corrupted {
                        issues: verdict.issues,
                    });
                }
                AuditStatus::SingleIssue => {
                    let action = verdict.recommended;
                    if action == RepairAction::DiscardAndRerun {
                        // Single issue but no safe automatic action.
                        return Ok(RepairReport::Corrupted {
                            issues: verdict.issues,
                        });
                    }
                    info!(replication_index, cycle, ?action, issue = ?single_kind(&verdict), "applying repair");
                    self.apply(replication_index, action).await?;
                }
            }
            verdict = audit_replication(&self.ctx.experiment_dir, &rep_dir);
        }

        if verdict.is_valid() {
            Ok(RepairReport::Repaired {
                cycles: MAX_REPAIR_CYCLES,
            })
        } else {
            warn!(replication_index, "repair cycle cap reached");
            Ok(RepairReport::Unresolved {
                cycles: MAX_REPAIR_CYCLES,
                issues: verdict.issues,
            })
        }
    }

    async fn apply(&self, replication_index: usize, action: RepairAction) -> Result<()> {
        match action {
            RepairAction::RearchiveConfig => {
                self.ctx.config.archive(&self.ctx.experiment_dir)?;
            }
            RepairAction::RebuildQueries => {
                // Manifests are seed-deterministic: rebuilding reproduces
                // the exact trial set the stored responses answered.
                let paths = ReplicationPaths::new(&self.ctx.experiment_dir, replication_index);
                let manifest = build_manifest(&self.ctx.config, replication_index, self.corpus)?;
                paths.ensure_dirs()?;
                manifest.save(&paths)?;
                write_queries(&manifest, &paths)?;
            }
            RepairAction::RerunMissingResponses => {
                self.pipeline().resume(replication_index).await?;
            }
            RepairAction::ReprocessAnalysis => {
                self.pipeline().reprocess(replication_index)?;
            }
            RepairAction::None | RepairAction::DiscardAndRerun => {}
        }
        Ok(())
    }

    async fn apply_force(&self, replication_index: usize, action: ForceAction) -> Result<()> {
        match action {
            ForceAction::Full => {
                self.pipeline().resume(replication_index).await?;
            }
            ForceAction::AnalysisOnly => {
                self.pipeline().reprocess(replication_index)?;
            }
        }
        Ok(())
    }
}

fn single_kind(verdict: &ReplicationVerdict) -> Option<&crate::audit::IssueKind> {
    verdict.single_issue().map(|i| &i.kind)
}
