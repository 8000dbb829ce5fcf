//! Gate-driven convergence loop for repairing a code tree.
//!
//! A fixed roster of verification tools is run against the target tree and
//! reduced to one pass/fail gate. While the gate fails, evidence from the
//! failing checks is sent to a patch oracle and the returned unified diff is
//! applied atomically, until the gate passes or the iteration budget runs out.
//!
//! - **[`core`]**: Pure, deterministic logic (types, classification, gate
//!   reduction, evidence truncation, the controller state machine).
//! - **[`io`]**: Side-effecting operations (processes, git, HTTP, artifacts).
//!   Every collaborator sits behind a trait so tests can script it.
//!
//! [`converge`] orchestrates core logic with I/O to implement `greenloop run`.

pub mod converge;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
