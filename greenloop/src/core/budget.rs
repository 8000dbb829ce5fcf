//! Iteration budget for a convergence run.

/// Counts patch-request cycles against a fixed maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    max: u32,
    used: u32,
}

impl IterationBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Start the next iteration and return its 1-based index.
    ///
    /// Returns `None` once the budget is consumed.
    pub fn begin_iteration(&mut self) -> Option<u32> {
        if self.exhausted() {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }
}
