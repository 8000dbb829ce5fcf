//! Reduction of per-check results into one gate verdict.

use crate::core::types::{CheckResult, GateReport};

/// Logical AND over every non-skipped check. Skipped checks never force failure.
pub fn overall_pass(checks: &[CheckResult]) -> bool {
    checks.iter().filter(|c| !c.skipped).all(|c| c.passed)
}

/// True when both reports cover the same roster with identical per-check verdicts.
///
/// Timestamps, exit codes and evidence are ignored; only `passed`/`skipped`
/// matter for convergence decisions.
pub fn same_verdicts(a: &GateReport, b: &GateReport) -> bool {
    a.checks.len() == b.checks.len()
        && a
            .checks
            .iter()
            .zip(&b.checks)
            .all(|(x, y)| x.name == y.name && x.passed == y.passed && x.skipped == y.skipped)
}
