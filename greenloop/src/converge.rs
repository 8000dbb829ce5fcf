//! Convergence controller: ensure scaffold, gate, bundle, propose, apply, repeat.
//!
//! The baseline gate does not consume an iteration. Each iteration is one
//! patch request, so a green tree converges at iteration 0 and a tree fixed by
//! the first patch converges at iteration 1.
//!
//! A proposal or apply failure ends the iteration without re-gating: the tree
//! is unchanged, so by gate idempotence the previous report still holds. The
//! gate is re-run only after the tree or the scaffold status changed.

use std::ops::ControlFlow;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::IterationBudget;
use crate::core::evidence::EvidenceBundle;
use crate::core::phase::{Event, Phase, transition};
use crate::core::types::{
    ApplyOutcome, GateReport, IterationFailure, IterationRecord, ScaffoldStatus, Verdict,
};
use crate::io::applicator::PatchApplicator;
use crate::io::check_runner::CheckRunner;
use crate::io::context::RunContext;
use crate::io::evidence::bundle_evidence;
use crate::io::gate::evaluate_gate;
use crate::io::iteration_log::{
    ReportPaths, RunSummary, write_json, write_record, write_run_summary, write_text,
};
use crate::io::oracle::PatchOracle;
use crate::io::roster::Roster;
use crate::io::scaffold::Scaffold;

const SCAFFOLD_SNAPSHOT_MESSAGE: &str = "greenloop: scaffold provisioned";

/// External collaborators driven by the controller.
pub struct Collaborators<'a, S, R, O, A> {
    pub scaffold: &'a S,
    pub runner: &'a R,
    pub oracle: &'a O,
    pub applicator: &'a A,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergeConfig {
    pub max_iterations: u32,
    pub evidence_limit_bytes: usize,
}

/// Result of a finished (non-fatal) run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceOutcome {
    pub verdict: Verdict,
    pub records: Vec<IterationRecord>,
    pub final_report: GateReport,
    pub gate_evaluations: u32,
    pub patch_requests: u32,
}

/// Mutable bookkeeping for one run.
struct RunState {
    phase: Phase,
    budget: IterationBudget,
    scaffold: Option<ScaffoldStatus>,
    report: Option<GateReport>,
    regate: bool,
    current: Option<IterationRecord>,
    evidence: Option<EvidenceBundle>,
    records: Vec<IterationRecord>,
    gate_evaluations: u32,
    patch_requests: u32,
}

impl RunState {
    fn advance(&mut self, event: Event) -> Result<()> {
        let next = transition(self.phase, event)?;
        debug!(from = %self.phase, to = %next, ?event, "phase transition");
        self.phase = next;
        Ok(())
    }

    fn current_mut(&mut self) -> Result<&mut IterationRecord> {
        self.current
            .as_mut()
            .ok_or_else(|| anyhow!("no iteration in progress in phase {}", self.phase))
    }

    fn report(&self) -> Result<&GateReport> {
        self.report
            .as_ref()
            .ok_or_else(|| anyhow!("no gate report in phase {}", self.phase))
    }
}

/// Drive the target tree toward a passing gate.
///
/// `on_iteration` sees every finished iteration record. Returning
/// `ControlFlow::Break` stops the run at that boundary unless the gate already
/// passes. Fatal errors (credentials, transport, git) are returned as `Err`
/// after the in-flight record and an aborted `run.json` are written;
/// everything else is recorded and the loop moves on.
#[instrument(skip_all, fields(target = %ctx.target.display(), max_iterations = config.max_iterations))]
pub fn run_convergence<S, R, O, A, F>(
    ctx: &RunContext,
    roster: &Roster,
    parts: Collaborators<'_, S, R, O, A>,
    config: &ConvergeConfig,
    mut on_iteration: F,
) -> Result<ConvergenceOutcome>
where
    S: Scaffold,
    R: CheckRunner,
    O: PatchOracle,
    A: PatchApplicator,
    F: FnMut(&IterationRecord) -> ControlFlow<()>,
{
    let paths = ReportPaths::new(&ctx.reports_dir);
    let started_at = now();
    let mut st = RunState {
        phase: Phase::EnsuringScaffold,
        budget: IterationBudget::new(config.max_iterations),
        scaffold: None,
        report: None,
        regate: true,
        current: None,
        evidence: None,
        records: Vec::new(),
        gate_evaluations: 0,
        patch_requests: 0,
    };

    if let Err(err) = drive(&mut st, ctx, roster, &parts, config, &paths, &mut on_iteration) {
        record_abort(&mut st, &paths, config, started_at, &err);
        return Err(err);
    }

    let used = st.budget.used();
    let verdict = match st.phase {
        Phase::Converged => Verdict::Converged { iteration: used },
        Phase::Stopped => Verdict::Stopped {
            after_iteration: used,
        },
        _ => Verdict::Exhausted { iterations: used },
    };
    let final_report = st
        .report
        .take()
        .ok_or_else(|| anyhow!("run ended without a gate report"))?;

    write_run_summary(
        &paths,
        &RunSummary {
            started_at,
            ended_at: now(),
            verdict,
            max_iterations: config.max_iterations,
            iterations: used,
            gate_evaluations: st.gate_evaluations,
            patch_requests: st.patch_requests,
            final_pass: final_report.overall_pass,
            error: None,
            records: st.records.clone(),
        },
    )?;
    info!(
        verdict = ?verdict,
        iterations = used,
        gate_evaluations = st.gate_evaluations,
        "convergence finished"
    );

    Ok(ConvergenceOutcome {
        verdict,
        records: st.records,
        final_report,
        gate_evaluations: st.gate_evaluations,
        patch_requests: st.patch_requests,
    })
}

/// Step the phase machine until it reaches a terminal phase.
fn drive<S, R, O, A, F>(
    st: &mut RunState,
    ctx: &RunContext,
    roster: &Roster,
    parts: &Collaborators<'_, S, R, O, A>,
    config: &ConvergeConfig,
    paths: &ReportPaths,
    on_iteration: &mut F,
) -> Result<()>
where
    S: Scaffold,
    R: CheckRunner,
    O: PatchOracle,
    A: PatchApplicator,
    F: FnMut(&IterationRecord) -> ControlFlow<()>,
{
    while !st.phase.is_terminal() {
        match st.phase {
            Phase::EnsuringScaffold => {
                let status = parts.scaffold.ensure(ctx).context("ensure scaffold")?;
                let snapshot = parts.applicator.snapshot(SCAFFOLD_SNAPSHOT_MESSAGE)?;
                if snapshot.is_some() || st.scaffold.as_ref() != Some(&status) {
                    st.regate = true;
                }
                if !status.valid {
                    warn!(problems = ?status.problems, "scaffold is not valid");
                }
                st.scaffold = Some(status);
                st.advance(Event::ScaffoldEnsured)?;
            }
            Phase::Gating => {
                if st.regate {
                    let seq = st.budget.used();
                    let report = evaluate_gate(roster, parts.runner, paths, seq)?;
                    st.gate_evaluations += 1;
                    if let Some(record) = st.current.as_mut() {
                        record.gate_report_after = Some(report.clone());
                    }
                    st.report = Some(report);
                    st.regate = false;
                }

                let mut stop = false;
                if let Some(record) = st.current.take() {
                    write_record(paths, &record)?;
                    stop = on_iteration(&record).is_break();
                    st.records.push(record);
                }

                let event = if st.report()?.overall_pass {
                    Event::GatePassed
                } else if st.budget.exhausted() {
                    Event::GateFailed { budget_left: false }
                } else if stop {
                    Event::StopRequested
                } else {
                    Event::GateFailed { budget_left: true }
                };
                st.advance(event)?;
            }
            Phase::Bundling => {
                let index = st
                    .budget
                    .begin_iteration()
                    .ok_or_else(|| anyhow!("iteration budget exhausted"))?;
                info!(iteration = index, "iteration started");
                let before = st.report()?.clone();
                let scaffold = st.scaffold.clone().unwrap_or_else(ScaffoldStatus::valid);
                st.current = Some(IterationRecord {
                    index,
                    scaffold: scaffold.clone(),
                    gate_report_before: before.clone(),
                    patch_proposal: None,
                    apply_outcome: None,
                    gate_report_after: None,
                    failure: None,
                });
                let bundle =
                    bundle_evidence(&before, paths, &scaffold, config.evidence_limit_bytes)?;
                write_json(&paths.evidence_path(index), &bundle)?;
                st.evidence = Some(bundle);
                st.advance(Event::EvidenceBundled)?;
            }
            Phase::Requesting => {
                let bundle = st
                    .evidence
                    .take()
                    .ok_or_else(|| anyhow!("evidence missing before patch request"))?;
                st.patch_requests += 1;
                let result = parts.oracle.propose(&bundle);
                let record = st.current_mut()?;
                let index = record.index;
                let event = match result {
                    Ok(proposal) => {
                        write_text(&paths.patch_path(index), &proposal.raw_diff)?;
                        record.patch_proposal = Some(proposal);
                        Event::PatchProposed
                    }
                    Err(err) if err.is_fatal() => {
                        return Err(anyhow::Error::new(err)
                            .context(format!("iteration {index}: patch request failed")));
                    }
                    Err(err) => {
                        warn!(iteration = index, err = %err, "patch proposal rejected");
                        if let Some(raw) = err.rejected_response() {
                            write_text(&paths.rejected_response_path(index), raw)?;
                        }
                        record.failure = Some(IterationFailure::Proposal {
                            reason: err.to_string(),
                        });
                        Event::IterationFailed
                    }
                };
                st.advance(event)?;
            }
            Phase::Applying => {
                let record = st.current_mut()?;
                let index = record.index;
                let proposal = record
                    .patch_proposal
                    .as_ref()
                    .ok_or_else(|| anyhow!("iteration {index}: no proposal to apply"))?;
                let outcome = parts
                    .applicator
                    .apply(proposal, &paths.patch_path(index), index)
                    .with_context(|| format!("iteration {index}: apply patch"))?;
                let (event, changed) = match &outcome {
                    ApplyOutcome::Applied { commit, .. } => (Event::PatchApplied, commit.is_some()),
                    ApplyOutcome::Rejected { reason, .. } => {
                        warn!(iteration = index, %reason, "patch rejected by applicator");
                        record.failure = Some(IterationFailure::Apply {
                            reason: reason.clone(),
                        });
                        (Event::IterationFailed, false)
                    }
                };
                record.apply_outcome = Some(outcome);
                st.regate |= changed;
                st.advance(event)?;
            }
            Phase::Converged | Phase::Exhausted | Phase::Stopped => {}
        }
    }
    Ok(())
}

/// Persist what is known about a run that ended in a fatal error: the
/// in-flight iteration record (with the error as its failure) and a
/// `run.json` with an aborted verdict. Write failures here are only logged so
/// the original error is what the caller sees.
fn record_abort(
    st: &mut RunState,
    paths: &ReportPaths,
    config: &ConvergeConfig,
    started_at: String,
    err: &anyhow::Error,
) {
    let reason = format!("{err:#}");
    let used = st.budget.used();
    error!(iteration = used, phase = %st.phase, %reason, "convergence aborted");

    if let Some(mut record) = st.current.take() {
        record.failure = Some(IterationFailure::Fatal {
            reason: reason.clone(),
        });
        if let Err(write_err) = write_record(paths, &record) {
            warn!(err = %format!("{write_err:#}"), "failed to write aborted iteration record");
        }
        st.records.push(record);
    }

    let summary = RunSummary {
        started_at,
        ended_at: now(),
        verdict: Verdict::Aborted { iteration: used },
        max_iterations: config.max_iterations,
        iterations: used,
        gate_evaluations: st.gate_evaluations,
        patch_requests: st.patch_requests,
        final_pass: st.report.as_ref().is_some_and(|r| r.overall_pass),
        error: Some(reason),
        records: st.records.clone(),
    };
    if let Err(write_err) = write_run_summary(paths, &summary) {
        warn!(err = %format!("{write_err:#}"), "failed to write aborted run summary");
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
