//! Gate aggregator: run the full roster and reduce it to one report.
//!
//! Checks are independent. A failing check never short-circuits the rest, so
//! every report covers the whole roster. Checks run sequentially; none of them
//! writes to the target tree.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::classifier::{Classification, ToolRun, by_exit_status, by_findings};
use crate::core::types::{CheckResult, GateReport};
use crate::io::check_runner::{CheckRunner, RunOutcome};
use crate::io::iteration_log::{ReportPaths, write_json};
use crate::io::roster::{CheckDescriptor, Roster, Strategy};

const GATE_REPORT_SCHEMA: &str = include_str!("../../schemas/gate_report.schema.json");

/// Machine-readable gate report written to `gate.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateArtifact {
    pub timestamp: String,
    pub checks: Vec<ArtifactCheck>,
    pub summary: GateSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCheck {
    pub name: String,
    pub passed: bool,
    pub rc: Option<i32>,
    pub artifact: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSummary {
    pub pass: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<&GateReport> for GateArtifact {
    fn from(report: &GateReport) -> Self {
        Self {
            timestamp: report.timestamp.clone(),
            checks: report
                .checks
                .iter()
                .map(|c| ArtifactCheck {
                    name: c.name.clone(),
                    passed: c.passed,
                    rc: c.exit_status,
                    artifact: c.evidence_ref.clone(),
                    skipped: c.skipped,
                    reason: c.skip_reason.clone(),
                    timed_out: c.timed_out,
                    detail: c.detail.clone(),
                })
                .collect(),
            summary: GateSummary {
                pass: report.overall_pass,
            },
        }
    }
}

/// Run every check in roster order and write `gate.json` plus `gate-<seq>.json`.
#[instrument(skip_all, fields(seq, checks = roster.checks().len()))]
pub fn evaluate_gate<R: CheckRunner>(
    roster: &Roster,
    runner: &R,
    paths: &ReportPaths,
    seq: u32,
) -> Result<GateReport> {
    let mut results = Vec::with_capacity(roster.checks().len());
    for check in roster.checks() {
        let result = run_check(check, runner)?;
        info!(
            check = %result.name,
            passed = result.passed,
            skipped = result.skipped,
            exit_code = ?result.exit_status,
            "check finished"
        );
        results.push(result);
    }

    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let report = GateReport::new(timestamp, results);
    let artifact = GateArtifact::from(&report);
    write_json(&paths.gate_seq_path(seq), &artifact)?;
    write_json(&paths.gate_path, &artifact)?;
    info!(pass = report.overall_pass, "gate evaluated");
    Ok(report)
}

fn run_check<R: CheckRunner>(check: &CheckDescriptor, runner: &R) -> Result<CheckResult> {
    let name = check.name();
    if let Strategy::FindingsCount { artifact } = &check.strategy {
        // A results file left over from an earlier evaluation must not be read as fresh.
        remove_if_exists(artifact)?;
    }

    let outcome = runner
        .run(&check.invocation)
        .with_context(|| format!("run check '{name}'"))?;

    let (exit_code, output) = match outcome {
        RunOutcome::Skipped { reason } => {
            return Ok(CheckResult::skipped(name, &check.evidence_ref, reason));
        }
        RunOutcome::Finished {
            exit_code,
            timed_out: true,
            ..
        } => {
            warn!(check = name, "check timed out");
            let mut result = CheckResult::ran(name, &check.evidence_ref, exit_code, false, true);
            result.detail = Some(format!(
                "timed out after {}s",
                check.invocation.timeout.as_secs()
            ));
            return Ok(result);
        }
        RunOutcome::Finished {
            exit_code, output, ..
        } => (exit_code, output),
    };

    let run = ToolRun {
        exit_code,
        output: &output,
    };
    let classification = match &check.strategy {
        Strategy::ExitStatus => by_exit_status(run),
        Strategy::Keyword(rule) => rule.classify(run),
        Strategy::FindingsCount { artifact } => {
            let contents = read_optional(artifact)?;
            by_findings(contents.as_deref())
        }
    };

    Ok(match classification {
        Classification::Pass => CheckResult::ran(name, &check.evidence_ref, exit_code, true, false),
        Classification::Fail { reason } => {
            let mut result = CheckResult::ran(name, &check.evidence_ref, exit_code, false, false);
            result.detail = Some(reason);
            result
        }
        Classification::Skip { reason } => {
            let mut result = CheckResult::skipped(name, &check.evidence_ref, reason);
            result.exit_status = exit_code;
            result
        }
    })
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove stale {}", path.display())),
    }
}

/// Parse a gate report artifact, validating it against the bundled schema.
pub fn read_gate_artifact(path: &Path) -> Result<GateArtifact> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let instance: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    let schema: Value = serde_json::from_str(GATE_REPORT_SCHEMA).context("parse gate schema")?;
    validate_schema(&instance, &schema)?;
    serde_json::from_value(instance).with_context(|| format!("decode {}", path.display()))
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
