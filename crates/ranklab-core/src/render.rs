//! Terminal rendering of audit and repair outcomes.
//!
//! Pure string builders so the formatting is testable; the CLI decides
//! where the text goes. Color is opt-out for pipes.

use crate::audit::{
    AuditStatus, ExperimentStatus, ExperimentVerdict, ReplicationVerdict, StudyRecommendation,
    StudyVerdict,
};
use crate::repair::RepairReport;

pub mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const RED: &str = "\x1b[31m";
    pub const CYAN: &str = "\x1b[36m";
}

fn paint(text: &str, color: &str, enabled: bool) -> String {
    if enabled {
        format!("{color}{text}{}", colors::RESET)
    } else {
        text.to_string()
    }
}

fn status_cell(status: &AuditStatus, color: bool) -> String {
    match status {
        AuditStatus::Valid => paint(&format!("{:<13}", "VALID"), colors::GREEN, color),
        AuditStatus::SingleIssue => paint(&format!("{:<13}", "NEEDS_REPAIR"), colors::YELLOW, color),
        AuditStatus::RunCorrupted => paint(&format!("{:<13}", "RUN_CORRUPTED"), colors::RED, color),
    }
}

/// One fixed-width status line for a replication.
pub fn render_replication(verdict: &ReplicationVerdict, color: bool) -> String {
    replication_line(verdict, color)
}

fn replication_line(verdict: &ReplicationVerdict, color: bool) -> String {
    let name = verdict
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let detail = match verdict.issues.as_slice() {
        [] => String::new(),
        [one] => one.detail.clone(),
        many => format!("{} issues", many.len()),
    };
    format!(
        "  {:<16} {} {}",
        name,
        status_cell(&verdict.status, color),
        paint(&detail, colors::DIM, color)
    )
}

/// One experiment block: a header line plus one line per replication.
pub fn render_experiment(verdict: &ExperimentVerdict, color: bool) -> String {
    let name = verdict
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (label, tint) = match verdict.status {
        ExperimentStatus::Validated => ("VALIDATED", colors::GREEN),
        ExperimentStatus::AwaitingCompile => ("AWAITING_COMPILE", colors::CYAN),
        ExperimentStatus::NeedsRepair => ("NEEDS_REPAIR", colors::YELLOW),
        ExperimentStatus::RunCorrupted => ("RUN_CORRUPTED", colors::RED),
    };

    let mut out = format!(
        "{} {}\n",
        paint(&name, colors::BOLD, color),
        paint(label, tint, color)
    );
    for issue in &verdict.issues {
        out.push_str(&format!(
            "  {}\n",
            paint(&issue.detail, colors::RED, color)
        ));
    }
    if verdict.missing_replications > 0 {
        out.push_str(&format!(
            "  {}\n",
            paint(
                &format!("{} replications not yet run", verdict.missing_replications),
                colors::YELLOW,
                color
            )
        ));
    }
    for replication in &verdict.replications {
        out.push_str(&replication_line(replication, color));
        out.push('\n');
    }
    out
}

/// Whole-study overview with the consolidated recommendation.
pub fn render_study(verdict: &StudyVerdict, color: bool) -> String {
    let mut out = String::new();
    for experiment in &verdict.experiments {
        out.push_str(&render_experiment(experiment, color));
        out.push('\n');
    }
    let line = match verdict.recommendation {
        StudyRecommendation::ProceedToCompile => {
            paint("All experiments clean: proceed to compile.", colors::GREEN, color)
        }
        StudyRecommendation::WaitForRepairs => paint(
            "Repairs pending: run repair before compiling.",
            colors::YELLOW,
            color,
        ),
        StudyRecommendation::AlreadyComplete => {
            paint("Study already compiled.", colors::CYAN, color)
        }
    };
    out.push_str(&line);
    out.push('\n');
    out
}

pub fn render_repair(index: usize, report: &RepairReport, color: bool) -> String {
    let name = crate::layout::replication_dir_name(index);
    match report {
        RepairReport::AlreadyValid => format!(
            "  {:<16} {}",
            name,
            paint("already valid, untouched", colors::GREEN, color)
        ),
        RepairReport::Repaired { cycles } => format!(
            "  {:<16} {}",
            name,
            paint(&format!("repaired in {cycles} cycle(s)"), colors::GREEN, color)
        ),
        RepairReport::Unresolved { cycles, issues } => format!(
            "  {:<16} {}",
            name,
            paint(
                &format!("unresolved after {cycles} cycles ({} issues left)", issues.len()),
                colors::YELLOW,
                color
            )
        ),
        RepairReport::Corrupted { issues } => format!(
            "  {:<16} {}",
            name,
            paint(
                &format!("corrupted ({} issues), discard and rerun", issues.len()),
                colors::RED,
                color
            )
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Issue, IssueKind, RepairAction};
    use std::path::PathBuf;

    fn verdict(status: AuditStatus, issues: Vec<Issue>) -> ReplicationVerdict {
        ReplicationVerdict {
            path: PathBuf::from("/tmp/replication_01"),
            replication_index: Some(1),
            status,
            issues,
            recommended: RepairAction::None,
        }
    }

    #[test]
    fn test_plain_rendering_has_no_escapes() {
        let line = replication_line(&verdict(AuditStatus::Valid, vec![]), false);
        assert!(!line.contains('\x1b'));
        assert!(line.contains("VALID"));
    }

    #[test]
    fn test_colored_rendering_tints_by_status() {
        let line = replication_line(
            &verdict(
                AuditStatus::RunCorrupted,
                vec![
                    Issue {
                        kind: IssueKind::ConfigIssue,
                        detail: "a".into(),
                    },
                    Issue {
                        kind: IssueKind::ResponseIssue,
                        detail: "b".into(),
                    },
                ],
            ),
            true,
        );
        assert!(line.contains(colors::RED));
        assert!(line.contains("2 issues"));
    }

    #[test]
    fn test_repair_lines() {
        let line = render_repair(3, &RepairReport::Repaired { cycles: 2 }, false);
        assert!(line.contains("replication_03"));
        assert!(line.contains("repaired in 2 cycle(s)"));
    }
}
