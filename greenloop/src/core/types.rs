//! Shared deterministic types for the convergence core.
//!
//! These types define stable contracts between the gate, the oracle port, the
//! applicator and the controller. They carry no I/O and serialize to the audit
//! artifacts written under the reports directory.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::gate::overall_pass;

/// Outcome of a single verification tool against the target tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// Exit code of the tool; `None` when it never ran or was killed.
    pub exit_status: Option<i32>,
    /// File name of the raw evidence artifact inside the reports directory.
    pub evidence_ref: String,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    /// Classifier explanation for a failure (matched marker, finding count).
    #[serde(default)]
    pub detail: Option<String>,
}

impl CheckResult {
    /// A check whose prerequisite is absent. Never forces the gate to fail.
    pub fn skipped(name: &str, evidence_ref: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            exit_status: None,
            evidence_ref: evidence_ref.to_string(),
            skipped: true,
            skip_reason: Some(reason.into()),
            timed_out: false,
            detail: None,
        }
    }

    /// A check that ran to completion (or was killed on timeout).
    pub fn ran(
        name: &str,
        evidence_ref: &str,
        exit_status: Option<i32>,
        passed: bool,
        timed_out: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            passed,
            exit_status,
            evidence_ref: evidence_ref.to_string(),
            skipped: false,
            skip_reason: None,
            timed_out,
            detail: None,
        }
    }

    /// True when this check ran and reported defects.
    pub fn failed(&self) -> bool {
        !self.skipped && !self.passed
    }

    pub fn status_label(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else if self.passed {
            "passed"
        } else {
            "failed"
        }
    }
}

/// One gate evaluation over the full roster. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub timestamp: String,
    pub checks: Vec<CheckResult>,
    pub overall_pass: bool,
}

impl GateReport {
    pub fn new(timestamp: impl Into<String>, checks: Vec<CheckResult>) -> Self {
        let overall_pass = overall_pass(&checks);
        Self {
            timestamp: timestamp.into(),
            checks,
            overall_pass,
        }
    }

    pub fn failing(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|check| check.failed())
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|check| check.name == name)
    }
}

/// Precondition object produced by the scaffold collaborator each iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldStatus {
    pub valid: bool,
    pub problems: Vec<String>,
}

impl ScaffoldStatus {
    pub fn valid() -> Self {
        Self {
            valid: true,
            problems: Vec::new(),
        }
    }

    pub fn invalid(problems: Vec<String>) -> Self {
        Self {
            valid: false,
            problems,
        }
    }
}

/// Why an oracle response was not accepted as a patch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProposalRejection {
    #[error("oracle returned an empty response")]
    Empty,
    #[error("oracle response is not a unified diff (starts with {preview:?})")]
    NotADiff { preview: String },
}

/// Candidate fix returned by the oracle. Consumed once by the applicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchProposal {
    pub raw_diff: String,
}

const DIFF_MARKERS: [&str; 2] = ["diff --git ", "--- "];

impl PatchProposal {
    /// Validate the shape of an oracle response.
    ///
    /// Accepts text whose first non-blank line is a `diff --git` header or a
    /// `---` file header followed by a `+++` header. Leading and trailing
    /// whitespace is dropped and a trailing newline is enforced.
    pub fn from_response(text: &str) -> Result<Self, ProposalRejection> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ProposalRejection::Empty);
        }
        if !looks_like_unified_diff(trimmed) {
            let preview: String = trimmed.chars().take(60).collect();
            return Err(ProposalRejection::NotADiff { preview });
        }
        let mut raw_diff = trimmed.to_string();
        raw_diff.push('\n');
        Ok(Self { raw_diff })
    }
}

fn looks_like_unified_diff(text: &str) -> bool {
    let mut lines = text.lines();
    let Some(first) = lines.next() else {
        return false;
    };
    if first.starts_with(DIFF_MARKERS[0]) {
        return true;
    }
    first.starts_with(DIFF_MARKERS[1]) && lines.next().is_some_and(|l| l.starts_with("+++ "))
}

/// Result of handing a proposal to the applicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Diff applied and recorded. `commit` is `None` when it changed nothing.
    Applied {
        checkpoint: String,
        commit: Option<String>,
    },
    /// Diff did not apply cleanly; the tree is back at `checkpoint`.
    Rejected { checkpoint: String, reason: String },
}

/// Why an iteration ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationFailure {
    Proposal { reason: String },
    Apply { reason: String },
    /// The run was aborted during this iteration.
    Fatal { reason: String },
}

/// Audit entry for one propose-apply-reverify cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: u32,
    pub scaffold: ScaffoldStatus,
    pub gate_report_before: GateReport,
    pub patch_proposal: Option<PatchProposal>,
    pub apply_outcome: Option<ApplyOutcome>,
    pub gate_report_after: Option<GateReport>,
    pub failure: Option<IterationFailure>,
}

/// Terminal state of a convergence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Verdict {
    /// The gate passed. `iteration` is 0 when the tree was already green.
    Converged { iteration: u32 },
    /// The iteration budget was consumed without a passing gate.
    Exhausted { iterations: u32 },
    /// The caller asked to stop at an iteration boundary.
    Stopped { after_iteration: u32 },
    /// A fatal error ended the run; `iteration` is the last one started.
    Aborted { iteration: u32 },
}
