//! Check runner: one external verification tool against the target tree.
//!
//! The [`CheckRunner`] trait decouples the gate from actual tool processes.
//! Tests use scripted runners that derive outcomes from the tree contents.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::iteration_log::write_text;
use crate::io::process::{find_program, is_not_found, run_command_with_timeout};

/// Tool invocation descriptor.
#[derive(Debug, Clone)]
pub struct CheckInvocation {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Working directory (the target tree).
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Binaries that must resolve before the tool is run.
    pub requires_bins: Vec<String>,
    /// Files, relative to `workdir`, that must exist before the tool is run.
    pub requires_files: Vec<PathBuf>,
    /// Where the raw combined output is written.
    pub output_path: PathBuf,
    pub output_limit_bytes: usize,
}

/// Raw result of one tool invocation, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A prerequisite is absent; the tool was not run.
    Skipped { reason: String },
    /// The tool ran (possibly killed on timeout).
    Finished {
        exit_code: Option<i32>,
        timed_out: bool,
        output: String,
    },
}

/// Abstraction over verification tool backends.
pub trait CheckRunner {
    /// Run the tool. Must write its output (or skip reason) to `invocation.output_path`.
    fn run(&self, invocation: &CheckInvocation) -> Result<RunOutcome>;
}

/// Runner that spawns the tool as a child process.
pub struct ProcessCheckRunner;

impl CheckRunner for ProcessCheckRunner {
    #[instrument(skip_all, fields(check = %invocation.name, timeout_secs = invocation.timeout.as_secs()))]
    fn run(&self, invocation: &CheckInvocation) -> Result<RunOutcome> {
        if let Some(reason) = missing_prerequisite(invocation) {
            debug!(%reason, "prerequisite missing, skipping");
            write_evidence(&invocation.output_path, &format!("skipped: {reason}\n"))?;
            return Ok(RunOutcome::Skipped { reason });
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).current_dir(&invocation.workdir);

        let output = match run_command_with_timeout(
            cmd,
            invocation.timeout,
            invocation.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => {
                let reason = format!("`{}` is not installed", invocation.program);
                write_evidence(&invocation.output_path, &format!("skipped: {reason}\n"))?;
                return Ok(RunOutcome::Skipped { reason });
            }
            Err(err) => {
                warn!(err = %err, "check could not be started");
                let output = format!("failed to start `{}`: {err:#}\n", invocation.program);
                write_evidence(&invocation.output_path, &output)?;
                return Ok(RunOutcome::Finished {
                    exit_code: None,
                    timed_out: false,
                    output,
                });
            }
        };

        let text = output.combined_text();
        write_evidence(&invocation.output_path, &text)?;
        if output.timed_out {
            warn!(timeout_secs = invocation.timeout.as_secs(), "check timed out");
        }
        Ok(RunOutcome::Finished {
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
            output: text,
        })
    }
}

/// First absent prerequisite, described for the skip reason.
pub fn missing_prerequisite(invocation: &CheckInvocation) -> Option<String> {
    for bin in &invocation.requires_bins {
        if find_program(bin, &invocation.workdir).is_none() {
            return Some(format!("`{bin}` is not installed"));
        }
    }
    for file in &invocation.requires_files {
        if !invocation.workdir.join(file).exists() {
            return Some(format!("required file `{}` is absent", file.display()));
        }
    }
    None
}

pub fn write_evidence(path: &Path, contents: &str) -> Result<()> {
    write_text(path, contents).context("write check evidence")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn invocation(dir: &Path, program: &str, args: &[&str]) -> CheckInvocation {
        CheckInvocation {
            name: "lint".to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            workdir: dir.to_path_buf(),
            timeout: Duration::from_secs(10),
            requires_bins: vec![program.to_string()],
            requires_files: Vec::new(),
            output_path: dir.join("reports").join("lint.txt"),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn captures_exit_status_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inv = invocation(temp.path(), "sh", &["-c", "echo defect found; exit 1"]);
        let outcome = ProcessCheckRunner.run(&inv).expect("run");
        match outcome {
            RunOutcome::Finished {
                exit_code,
                timed_out,
                output,
            } => {
                assert_eq!(exit_code, Some(1));
                assert!(!timed_out);
                assert!(output.contains("defect found"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let written = fs::read_to_string(&inv.output_path).expect("evidence");
        assert!(written.contains("defect found"));
    }

    #[test]
    fn missing_binary_is_skipped_not_crashed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let inv = invocation(temp.path(), "greenloop-definitely-missing-tool", &[]);
        let outcome = ProcessCheckRunner.run(&inv).expect("run");
        assert!(matches!(outcome, RunOutcome::Skipped { .. }));
        let written = fs::read_to_string(&inv.output_path).expect("evidence");
        assert!(written.starts_with("skipped:"));
    }

    #[test]
    fn missing_required_file_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut inv = invocation(temp.path(), "sh", &["-c", "exit 0"]);
        inv.requires_files = vec![PathBuf::from("phpunit.xml.dist")];
        let outcome = ProcessCheckRunner.run(&inv).expect("run");
        assert_eq!(
            outcome,
            RunOutcome::Skipped {
                reason: "required file `phpunit.xml.dist` is absent".to_string()
            }
        );
    }

    #[test]
    fn timeout_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut inv = invocation(temp.path(), "sleep", &["5"]);
        inv.timeout = Duration::from_millis(200);
        let outcome = ProcessCheckRunner.run(&inv).expect("run");
        assert!(matches!(
            outcome,
            RunOutcome::Finished {
                timed_out: true,
                exit_code: None,
                ..
            }
        ));
    }
}
