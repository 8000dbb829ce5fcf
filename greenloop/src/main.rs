//! greenloop: drive a code tree to a passing quality gate.
//!
//! `greenloop run` evaluates the gate roster against the target, and while it
//! fails, requests a unified-diff repair from the patch oracle, applies it
//! atomically and re-gates, bounded by `--max-iterations`.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use greenloop::converge::{Collaborators, ConvergeConfig, run_convergence};
use greenloop::core::types::{GateReport, IterationRecord, Verdict};
use greenloop::exit_codes;
use greenloop::io::applicator::GitApplicator;
use greenloop::io::check_runner::ProcessCheckRunner;
use greenloop::io::config::{GreenloopConfig, load_config, write_config};
use greenloop::io::context::RunContext;
use greenloop::io::gate::{evaluate_gate, read_gate_artifact};
use greenloop::io::iteration_log::ReportPaths;
use greenloop::io::oracle::OpenAiOracle;
use greenloop::io::roster::Roster;
use greenloop::io::scaffold::CommandScaffold;
use greenloop::logging;

#[derive(Parser)]
#[command(
    name = "greenloop",
    version,
    about = "Gate-driven convergence loop for repairing a code tree"
)]
struct Cli {
    /// Log progress at info level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Code tree under repair.
    #[arg(long)]
    target: PathBuf,
    /// Where gate reports, evidence and patches are written.
    #[arg(long)]
    reports_dir: PathBuf,
    /// Target platform/version hint passed to the scaffold and the oracle.
    #[arg(long, default_value = "latest")]
    platform_version: String,
    /// Entry-point file consumed by scaffold validation.
    #[arg(long)]
    entry_point: String,
    /// TOML config; the built-in roster is used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the convergence loop until the gate passes or iterations run out.
    Run {
        #[command(flatten)]
        target: TargetArgs,
        /// Maximum number of patch requests.
        #[arg(long)]
        max_iterations: u32,
        /// Stop at the next iteration boundary once this file exists.
        #[arg(long)]
        stop_file: Option<PathBuf>,
    },
    /// Evaluate the gate once and write `gate.json`.
    Gate {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Validate a gate report against the bundled schema and print its verdict.
    VerifyReport {
        /// Path to a `gate.json` artifact.
        path: PathBuf,
    },
    /// Write the default configuration (roster, oracle, scaffold) to a file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FATAL
        }
    };
    std::process::exit(code);
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run {
            target,
            max_iterations,
            stop_file,
        } => cmd_run(&target, max_iterations, stop_file.as_deref()),
        Command::Gate { target } => cmd_gate(&target),
        Command::VerifyReport { path } => cmd_verify_report(&path),
        Command::InitConfig { force, path } => cmd_init_config(&path, force),
    }
}

fn load(args: &TargetArgs) -> Result<(GreenloopConfig, RunContext)> {
    let config = match &args.config {
        Some(path) if !path.exists() => bail!("config file {} does not exist", path.display()),
        Some(path) => load_config(path)?,
        None => {
            let config = GreenloopConfig::default();
            config.validate()?;
            config
        }
    };
    let ctx = RunContext::new(
        &args.target,
        &args.reports_dir,
        args.platform_version.as_str(),
        args.entry_point.as_str(),
    )?;
    Ok((config, ctx))
}

fn cmd_run(args: &TargetArgs, max_iterations: u32, stop_file: Option<&Path>) -> Result<i32> {
    let (config, ctx) = load(args)?;
    let roster = Roster::build(&config.checks, &ctx, config.output_limit_bytes)?;
    let applicator = GitApplicator::prepare(&ctx)?;
    let oracle = OpenAiOracle::new(&config.oracle, &ctx)?;
    let scaffold = CommandScaffold::new(
        config.scaffold.clone(),
        ReportPaths::new(&ctx.reports_dir),
        config.output_limit_bytes,
    );

    let outcome = run_convergence(
        &ctx,
        &roster,
        Collaborators {
            scaffold: &scaffold,
            runner: &ProcessCheckRunner,
            oracle: &oracle,
            applicator: &applicator,
        },
        &ConvergeConfig {
            max_iterations,
            evidence_limit_bytes: config.evidence_limit_bytes,
        },
        |record| {
            eprintln!("{}", describe_iteration(record));
            match stop_file {
                Some(path) if path.exists() => {
                    info!(stop_file = %path.display(), "stop requested");
                    ControlFlow::Break(())
                }
                _ => ControlFlow::Continue(()),
            }
        },
    )?;

    print_report(&outcome.final_report);
    let code = match outcome.verdict {
        Verdict::Converged { iteration } => {
            println!("converged at iteration {iteration}");
            exit_codes::OK
        }
        Verdict::Exhausted { iterations } => {
            println!("exhausted after {iterations} iteration(s); gate still failing");
            exit_codes::EXHAUSTED
        }
        Verdict::Stopped { after_iteration } => {
            println!("stopped after iteration {after_iteration}");
            exit_codes::STOPPED
        }
        // Aborted runs come back as `Err` from `run_convergence`.
        Verdict::Aborted { iteration } => {
            println!("aborted during iteration {iteration}");
            exit_codes::FATAL
        }
    };
    println!("reports: {}", ctx.reports_dir.display());
    Ok(code)
}

fn cmd_gate(args: &TargetArgs) -> Result<i32> {
    let (config, ctx) = load(args)?;
    let roster = Roster::build(&config.checks, &ctx, config.output_limit_bytes)?;
    let paths = ReportPaths::new(&ctx.reports_dir);
    let report = evaluate_gate(&roster, &ProcessCheckRunner, &paths, 0)?;
    print_report(&report);
    Ok(if report.overall_pass {
        exit_codes::OK
    } else {
        exit_codes::GATE_FAILED
    })
}

fn cmd_verify_report(path: &Path) -> Result<i32> {
    let artifact = read_gate_artifact(path)?;
    for check in &artifact.checks {
        let status = if check.skipped {
            "skipped"
        } else if check.passed {
            "passed"
        } else {
            "failed"
        };
        println!("{:<20} {status}", check.name);
    }
    println!("pass: {}", artifact.summary.pass);
    Ok(if artifact.summary.pass {
        exit_codes::OK
    } else {
        exit_codes::GATE_FAILED
    })
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &GreenloopConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn print_report(report: &GateReport) {
    for check in &report.checks {
        let mut line = format!("{:<20} {}", check.name, check.status_label());
        if let Some(reason) = check.skip_reason.as_deref().or(check.detail.as_deref()) {
            line.push_str(&format!(" ({reason})"));
        }
        println!("{line}");
    }
    println!("gate: {}", if report.overall_pass { "pass" } else { "fail" });
}

fn describe_iteration(record: &IterationRecord) -> String {
    let result = match (&record.failure, &record.gate_report_after) {
        (Some(failure), _) => format!("failed: {failure:?}"),
        (None, Some(after)) => format!(
            "applied; gate {}",
            if after.overall_pass { "pass" } else { "fail" }
        ),
        (None, None) => "applied; no change".to_string(),
    };
    format!("iteration {}: {result}", record.index)
}
