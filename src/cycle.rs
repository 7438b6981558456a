use serde::{Deserialize, Serialize};

pub const DEFAULT_CYCLE_BUDGET_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// The pass fit the budget; wait `wait_ms` to hold the cadence.
    OnTime { elapsed_ms: u64, wait_ms: u64 },
    /// The pass ran long. The next one starts immediately.
    Overrun { elapsed_ms: u64, excess_ms: u64 },
}

impl CycleOutcome {
    pub fn elapsed_ms(&self) -> u64 {
        match self {
            CycleOutcome::OnTime { elapsed_ms, .. } | CycleOutcome::Overrun { elapsed_ms, .. } => *elapsed_ms,
        }
    }

    pub fn wait_ms(&self) -> u64 {
        match self {
            CycleOutcome::OnTime { wait_ms, .. } => *wait_ms,
            CycleOutcome::Overrun { .. } => 0,
        }
    }

    pub fn is_overrun(&self) -> bool {
        matches!(self, CycleOutcome::Overrun { .. })
    }
}

/// Pads every poll cycle out to a constant length.
#[derive(Debug, Clone, Copy)]
pub struct CycleCompensator {
    budget_ms: u64,
}

impl CycleCompensator {
    pub fn new(budget_ms: u64) -> Self {
        Self { budget_ms }
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget_ms
    }

    pub fn evaluate(&self, cycle_start: u64, current_time: u64) -> CycleOutcome {
        let elapsed_ms = current_time.saturating_sub(cycle_start);
        if elapsed_ms <= self.budget_ms {
            CycleOutcome::OnTime {
                elapsed_ms,
                wait_ms: self.budget_ms - elapsed_ms,
            }
        } else {
            CycleOutcome::Overrun {
                elapsed_ms,
                excess_ms: elapsed_ms - self.budget_ms,
            }
        }
    }
}

impl Default for CycleCompensator {
    fn default() -> Self {
        Self::new(DEFAULT_CYCLE_BUDGET_MS)
    }
}
