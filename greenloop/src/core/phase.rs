//! Convergence controller state machine.
//!
//! ```text
//! EnsuringScaffold -> Gating -> Converged
//!       ^                |
//!       |                +-> Exhausted | Stopped
//!       |                |
//!       |                +-> Bundling -> Requesting -> Applying
//!       |                                    |            |
//!       +------------------------------------+------------+
//! ```
//!
//! `Gating` is the iteration boundary: once the current report is known the
//! caller may stop the run there, and only there.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    EnsuringScaffold,
    Gating,
    Bundling,
    Requesting,
    Applying,
    Converged,
    Exhausted,
    Stopped,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Converged | Phase::Exhausted | Phase::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::EnsuringScaffold => "ENSURING_SCAFFOLD",
            Phase::Gating => "GATING",
            Phase::Bundling => "BUNDLING",
            Phase::Requesting => "REQUESTING",
            Phase::Applying => "APPLYING",
            Phase::Converged => "CONVERGED",
            Phase::Exhausted => "EXHAUSTED",
            Phase::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ScaffoldEnsured,
    StopRequested,
    GatePassed,
    /// Gate failed; `budget_left` tells whether another iteration may start.
    GateFailed { budget_left: bool },
    EvidenceBundled,
    PatchProposed,
    PatchApplied,
    IterationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub event: Event,
}

/// Compute the next phase. Terminal phases accept no events.
pub fn transition(from: Phase, event: Event) -> Result<Phase, InvalidTransition> {
    let next = match (from, event) {
        (Phase::EnsuringScaffold, Event::ScaffoldEnsured) => Phase::Gating,
        (Phase::Gating, Event::GatePassed) => Phase::Converged,
        (Phase::Gating, Event::GateFailed { budget_left: true }) => Phase::Bundling,
        (Phase::Gating, Event::GateFailed { budget_left: false }) => Phase::Exhausted,
        (Phase::Gating, Event::StopRequested) => Phase::Stopped,
        (Phase::Bundling, Event::EvidenceBundled) => Phase::Requesting,
        (Phase::Requesting, Event::PatchProposed) => Phase::Applying,
        (Phase::Requesting | Phase::Applying, Event::IterationFailed) => Phase::EnsuringScaffold,
        (Phase::Applying, Event::PatchApplied) => Phase::EnsuringScaffold,
        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}
