//! Evidence bundler: read raw check artifacts for the failing checks.

use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::evidence::EvidenceBundle;
use crate::core::types::{GateReport, ScaffoldStatus};
use crate::io::iteration_log::ReportPaths;

/// Build a fresh bundle from the checks of `report` that ran and failed.
///
/// Only artifacts named by the report are read, in report order. A synthetic
/// `gate` entry lists every check status, and a `scaffold` entry is added when
/// the harness is not valid.
#[instrument(skip_all, fields(limit_bytes))]
pub fn bundle_evidence(
    report: &GateReport,
    paths: &ReportPaths,
    scaffold: &ScaffoldStatus,
    limit_bytes: usize,
) -> Result<EvidenceBundle> {
    let mut bundle = EvidenceBundle::default();
    bundle.push("gate", &gate_summary(report), limit_bytes);

    if !scaffold.valid {
        let text = scaffold
            .problems
            .iter()
            .map(|p| format!("- {p}"))
            .collect::<Vec<_>>()
            .join("\n");
        bundle.push("scaffold", &text, limit_bytes);
    }

    for check in report.failing() {
        let path = paths.dir.join(&check.evidence_ref);
        let mut text = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                format!("(no output captured at {})", check.evidence_ref)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read evidence {}", path.display()));
            }
        };
        if let Some(detail) = &check.detail {
            text = format!("[{detail}]\n{text}");
        }
        bundle.push(&check.name, &text, limit_bytes);
    }

    debug!(
        entries = bundle.entries.len(),
        total_bytes = bundle.total_bytes(),
        "evidence bundled"
    );
    Ok(bundle)
}

fn gate_summary(report: &GateReport) -> String {
    let mut lines = Vec::with_capacity(report.checks.len());
    for check in &report.checks {
        let mut line = format!("{}: {}", check.name, check.status_label());
        if let Some(code) = check.exit_status {
            line.push_str(&format!(" (exit {code})"));
        }
        if check.timed_out {
            line.push_str(" (timed out)");
        }
        if let Some(reason) = &check.skip_reason {
            line.push_str(&format!(" ({reason})"));
        }
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CheckResult;

    fn report() -> GateReport {
        let mut style = CheckResult::ran("style", "style.txt", Some(0), false, false);
        style.detail = Some("matched FOUND 1 ERROR".to_string());
        GateReport::new(
            "t",
            vec![
                CheckResult::ran("lint", "lint.txt", Some(0), true, false),
                style,
                CheckResult::skipped("security_scan", "security_scan.txt", "absent"),
                CheckResult::ran("tests", "tests.txt", Some(1), false, false),
            ],
        )
    }

    #[test]
    fn only_failing_checks_are_bundled_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ReportPaths::new(temp.path());
        fs::write(temp.path().join("lint.txt"), "clean").expect("write");
        fs::write(temp.path().join("style.txt"), "FOUND 1 ERROR").expect("write");
        fs::write(temp.path().join("tests.txt"), "x".repeat(500)).expect("write");

        let bundle =
            bundle_evidence(&report(), &paths, &ScaffoldStatus::valid(), 100).expect("bundle");
        let names: Vec<&str> = bundle.entries.iter().map(|e| e.check.as_str()).collect();
        assert_eq!(names, vec!["gate", "style", "tests"]);
        assert!(bundle.get("style").expect("style").starts_with("[matched"));
        let tests = &bundle.entries[2];
        assert_eq!(tests.text.len(), 100);
        assert_eq!(tests.truncated_bytes, 400);
        assert!(bundle.get("gate").expect("gate").contains("security_scan: skipped"));
    }

    #[test]
    fn scaffold_problems_are_included() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ReportPaths::new(temp.path());
        let scaffold = ScaffoldStatus::invalid(vec!["phpunit.xml.dist missing".to_string()]);
        let bundle = bundle_evidence(&report(), &paths, &scaffold, 1000).expect("bundle");
        assert_eq!(
            bundle.get("scaffold"),
            Some("- phpunit.xml.dist missing")
        );
        assert!(bundle.get("tests").expect("tests").contains("no output captured"));
    }
}
