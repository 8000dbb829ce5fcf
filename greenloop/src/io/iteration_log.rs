//! Audit artifact layout under the reports directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{IterationRecord, Verdict};

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub dir: PathBuf,
    pub gate_path: PathBuf,
    pub iterations_dir: PathBuf,
    pub run_summary_path: PathBuf,
    pub scaffold_log_path: PathBuf,
}

impl ReportPaths {
    pub fn new(reports_dir: &Path) -> Self {
        Self {
            dir: reports_dir.to_path_buf(),
            gate_path: reports_dir.join("gate.json"),
            iterations_dir: reports_dir.join("iterations"),
            run_summary_path: reports_dir.join("run.json"),
            scaffold_log_path: reports_dir.join("scaffold.txt"),
        }
    }

    /// Snapshot of the gate report for evaluation `seq` (0 is the baseline).
    pub fn gate_seq_path(&self, seq: u32) -> PathBuf {
        self.dir.join(format!("gate-{seq}.json"))
    }

    pub fn evidence_path(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("evidence-{iteration}.json"))
    }

    pub fn patch_path(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("autofix-diff-{iteration}.patch"))
    }

    /// Raw oracle text kept when it could not be used as a patch.
    pub fn rejected_response_path(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("autofix-response-{iteration}.txt"))
    }

    pub fn record_path(&self, iteration: u32) -> PathBuf {
        self.iterations_dir.join(format!("{iteration}.json"))
    }
}

/// Final summary written once per run to `run.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: String,
    pub ended_at: String,
    pub verdict: Verdict,
    pub max_iterations: u32,
    pub iterations: u32,
    pub gate_evaluations: u32,
    pub patch_requests: u32,
    pub final_pass: bool,
    /// Fatal error that aborted the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub records: Vec<IterationRecord>,
}

pub fn write_record(paths: &ReportPaths, record: &IterationRecord) -> Result<PathBuf> {
    fs::create_dir_all(&paths.iterations_dir)
        .with_context(|| format!("create iteration dir {}", paths.iterations_dir.display()))?;
    let path = paths.record_path(record.index);
    write_json(&path, record)?;
    Ok(path)
}

pub fn write_run_summary(paths: &ReportPaths, summary: &RunSummary) -> Result<()> {
    write_json(&paths.run_summary_path, summary)
}

pub fn read_run_summary(paths: &ReportPaths) -> Result<RunSummary> {
    let raw = fs::read_to_string(&paths.run_summary_path)
        .with_context(|| format!("read {}", paths.run_summary_path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", paths.run_summary_path.display()))
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GateReport, IterationFailure, ScaffoldStatus};

    #[test]
    fn report_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ReportPaths::new(temp.path());

        assert!(paths.gate_path.ends_with("gate.json"));
        assert!(paths.gate_seq_path(0).ends_with("gate-0.json"));
        assert!(paths.evidence_path(2).ends_with("evidence-2.json"));
        assert!(paths.patch_path(2).ends_with("autofix-diff-2.patch"));
        assert!(paths.rejected_response_path(2).ends_with("autofix-response-2.txt"));
        assert!(paths.record_path(3).ends_with(Path::new("iterations/3.json")));
    }

    #[test]
    fn writes_record_and_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ReportPaths::new(temp.path());
        let record = IterationRecord {
            index: 1,
            scaffold: ScaffoldStatus::valid(),
            gate_report_before: GateReport::new("2026-01-01T00:00:00Z", Vec::new()),
            patch_proposal: None,
            apply_outcome: None,
            gate_report_after: None,
            failure: Some(IterationFailure::Proposal {
                reason: "empty".to_string(),
            }),
        };
        let path = write_record(&paths, &record).expect("record");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with('\n'));
        let parsed: IterationRecord = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed, record);

        let summary = RunSummary {
            started_at: "a".to_string(),
            ended_at: "b".to_string(),
            verdict: Verdict::Exhausted { iterations: 1 },
            max_iterations: 1,
            iterations: 1,
            gate_evaluations: 1,
            patch_requests: 1,
            final_pass: false,
            error: None,
            records: vec![record],
        };
        write_run_summary(&paths, &summary).expect("summary");
        assert_eq!(read_run_summary(&paths).expect("read"), summary);
    }
}
