//! Materialized check roster for one run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::core::classifier::KeywordRule;
use crate::io::check_runner::CheckInvocation;
use crate::io::config::{CheckSpec, ClassifierSpec};
use crate::io::context::RunContext;

/// Classification strategy with compiled rules and resolved paths.
#[derive(Debug, Clone)]
pub enum Strategy {
    ExitStatus,
    Keyword(KeywordRule),
    FindingsCount { artifact: PathBuf },
}

/// One check ready to run against the target tree.
#[derive(Debug, Clone)]
pub struct CheckDescriptor {
    pub invocation: CheckInvocation,
    pub strategy: Strategy,
    /// Evidence file name, relative to the reports dir.
    pub evidence_ref: String,
}

impl CheckDescriptor {
    pub fn name(&self) -> &str {
        &self.invocation.name
    }
}

/// Ordered, data-driven gate roster.
#[derive(Debug, Clone)]
pub struct Roster {
    checks: Vec<CheckDescriptor>,
}

impl Roster {
    pub fn build(specs: &[CheckSpec], ctx: &RunContext, output_limit_bytes: usize) -> Result<Self> {
        let checks = specs
            .iter()
            .map(|spec| describe(spec, ctx, output_limit_bytes))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { checks })
    }

    pub fn checks(&self) -> &[CheckDescriptor] {
        &self.checks
    }
}

fn describe(spec: &CheckSpec, ctx: &RunContext, output_limit_bytes: usize) -> Result<CheckDescriptor> {
    let mut command = ctx.expand_all(&spec.command);
    if command.is_empty() {
        return Err(anyhow!("check '{}' has an empty command", spec.name));
    }
    let program = command.remove(0);
    let evidence_ref = spec.evidence_file();
    let strategy = match &spec.classifier {
        ClassifierSpec::ExitStatus => Strategy::ExitStatus,
        ClassifierSpec::Keyword {
            patterns,
            require_zero_exit,
        } => Strategy::Keyword(
            KeywordRule::new(patterns, *require_zero_exit)
                .with_context(|| format!("check '{}': invalid keyword pattern", spec.name))?,
        ),
        ClassifierSpec::FindingsCount { artifact } => Strategy::FindingsCount {
            artifact: ctx.reports_dir.join(ctx.expand(artifact)),
        },
    };
    Ok(CheckDescriptor {
        invocation: CheckInvocation {
            name: spec.name.clone(),
            program,
            args: command,
            workdir: ctx.target.clone(),
            timeout: Duration::from_secs(spec.timeout_secs),
            requires_bins: ctx.expand_all(&spec.prerequisite_bins()),
            requires_files: spec
                .requires_files
                .iter()
                .map(|f| PathBuf::from(ctx.expand(f)))
                .collect(),
            output_path: ctx.reports_dir.join(&evidence_ref),
            output_limit_bytes,
        },
        strategy,
        evidence_ref,
    })
}
