//! Scaffold collaborator: (re)provision and validate the test harness.
//!
//! Provisioning and validation are external commands. The loop only consumes
//! the resulting [`ScaffoldStatus`].

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::types::ScaffoldStatus;
use crate::io::config::ScaffoldConfig;
use crate::io::context::RunContext;
use crate::io::iteration_log::{ReportPaths, write_text};
use crate::io::process::{is_not_found, run_command_with_timeout};

pub trait Scaffold {
    /// Provision the harness if needed and report whether it is valid.
    fn ensure(&self, ctx: &RunContext) -> Result<ScaffoldStatus>;
}

/// Outcome of one scaffold command.
struct StepOutcome {
    ok: bool,
    output: String,
}

/// Scaffold backed by the configured provision and validate commands.
#[derive(Debug, Clone)]
pub struct CommandScaffold {
    config: ScaffoldConfig,
    paths: ReportPaths,
    output_limit_bytes: usize,
}

impl CommandScaffold {
    pub fn new(config: ScaffoldConfig, paths: ReportPaths, output_limit_bytes: usize) -> Self {
        Self {
            config,
            paths,
            output_limit_bytes,
        }
    }

    fn step(&self, label: &str, command: &[String], ctx: &RunContext) -> Result<Option<StepOutcome>> {
        let command = ctx.expand_all(command);
        let Some((program, args)) = command.split_first() else {
            return Ok(None);
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&ctx.target);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        match run_command_with_timeout(cmd, timeout, self.output_limit_bytes) {
            Ok(out) => Ok(Some(StepOutcome {
                ok: out.exit_code() == Some(0),
                output: out.combined_text(),
            })),
            Err(err) if is_not_found(&err) => Ok(Some(StepOutcome {
                ok: false,
                output: format!("{label}: `{program}` is not installed\n"),
            })),
            Err(err) => Err(err),
        }
    }
}

impl Scaffold for CommandScaffold {
    #[instrument(skip_all, fields(target = %ctx.target.display()))]
    fn ensure(&self, ctx: &RunContext) -> Result<ScaffoldStatus> {
        let mut log = String::new();
        let mut problems = Vec::new();

        if let Some(provision) = self.step("provision", &self.config.provision, ctx)? {
            log.push_str("== provision ==\n");
            log.push_str(&provision.output);
            if !provision.ok {
                warn!("scaffold provisioning failed");
                problems.push("scaffold provisioning failed".to_string());
            }
        }

        if let Some(validate) = self.step("validate", &self.config.validate, ctx)? {
            log.push_str("\n== validate ==\n");
            log.push_str(&validate.output);
            if !validate.ok {
                let reported: Vec<String> = validate
                    .output
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                if reported.is_empty() {
                    problems.push("scaffold validation failed".to_string());
                } else {
                    problems.extend(reported);
                }
            }
        }

        write_text(&self.paths.scaffold_log_path, &log)?;
        let status = if problems.is_empty() {
            ScaffoldStatus::valid()
        } else {
            ScaffoldStatus::invalid(problems)
        };
        info!(valid = status.valid, problems = status.problems.len(), "scaffold ensured");
        Ok(status)
    }
}
