//! Stable exit codes for greenloop CLI commands.

/// The gate passes (converged, or a single `gate` run passed).
pub const OK: i32 = 0;
/// Fatal setup error: unreachable target, bad config, missing credentials, git failure.
pub const FATAL: i32 = 1;
/// `greenloop run` used every iteration without a passing gate.
pub const EXHAUSTED: i32 = 2;
/// `greenloop run` was stopped at an iteration boundary (its `--stop-file` appeared).
pub const STOPPED: i32 = 3;
/// `greenloop gate` or `greenloop verify-report` found a failing gate.
pub const GATE_FAILED: i32 = 4;
