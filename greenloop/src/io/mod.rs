//! I/O helpers: processes, checks, git, oracle and artifacts.

pub mod applicator;
pub mod check_runner;
pub mod config;
pub mod context;
pub mod evidence;
pub mod gate;
pub mod git;
pub mod iteration_log;
pub mod oracle;
pub mod process;
pub mod roster;
pub mod scaffold;
