//! Fixed phase sequence for one step's VM lifecycle.

use vmr_core::events::ProgressPhase;

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("invalid step phase transition: {from:?} -> {to:?}")]
    InvalidTransition { from: StepPhase, to: StepPhase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepPhase {
    Initializing,
    Reverting,
    Booting,
    LoggingIn,
    CopyingIn,
    Executing,
    Collecting,
    Screenshot,
    Evaluating,
    RevertingAfter,
    Completed,
    Failed,
}

impl StepPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StepPhase::Initializing => "initializing",
            StepPhase::Reverting => "reverting",
            StepPhase::Booting => "booting",
            StepPhase::LoggingIn => "logging_in",
            StepPhase::CopyingIn => "copying_in",
            StepPhase::Executing => "executing",
            StepPhase::Collecting => "collecting",
            StepPhase::Screenshot => "screenshot",
            StepPhase::Evaluating => "evaluating",
            StepPhase::RevertingAfter => "reverting_after",
            StepPhase::Completed => "completed",
            StepPhase::Failed => "failed",
        }
    }

    /// Phase tag carried by progress events.
    pub fn progress_phase(self) -> ProgressPhase {
        match self {
            StepPhase::Initializing => ProgressPhase::Initializing,
            StepPhase::Reverting | StepPhase::RevertingAfter => ProgressPhase::RevertingSnapshot,
            StepPhase::Booting | StepPhase::LoggingIn => ProgressPhase::WaitingForBoot,
            StepPhase::CopyingIn => ProgressPhase::CopyingFiles,
            StepPhase::Executing => ProgressPhase::ExecutingTest,
            StepPhase::Collecting | StepPhase::Screenshot | StepPhase::Evaluating => {
                ProgressPhase::CollectingResults
            }
            StepPhase::Completed => ProgressPhase::Completed,
            StepPhase::Failed => ProgressPhase::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepPhase::Completed | StepPhase::Failed)
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check if a phase transition is valid.
///
/// ```text
/// Initializing → Reverting → Booting → LoggingIn → CopyingIn → Executing
///   → Collecting → [Screenshot] → [Evaluating] → [RevertingAfter] → Completed
/// ```
///
/// Any non-terminal phase may jump to `RevertingAfter` (cleanup after a
/// fault) or `Failed`.
pub fn is_phase_transition_allowed(from: StepPhase, to: StepPhase) -> bool {
    use StepPhase::*;

    if from.is_terminal() {
        return false;
    }

    match (from, to) {
        (Initializing, Reverting)
        | (Reverting, Booting)
        | (Booting, LoggingIn)
        | (LoggingIn, CopyingIn)
        | (CopyingIn, Executing)
        | (Executing, Collecting) => true,
        (Collecting, Screenshot | Evaluating) => true,
        (Screenshot, Evaluating) => true,
        // Timed-out executions skip evaluation.
        (Collecting | Screenshot, Completed) => true,
        (Evaluating, Completed) => true,
        (_, RevertingAfter) => from != RevertingAfter,
        (RevertingAfter, Completed) => true,
        (_, Failed) => true,
        _ => false,
    }
}

/// Current phase of a running step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTracker {
    current: StepPhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            current: StepPhase::Initializing,
        }
    }
}

impl PhaseTracker {
    pub fn current(&self) -> StepPhase {
        self.current
    }

    pub fn advance(&mut self, to: StepPhase) -> Result<StepPhase, PhaseError> {
        let from = self.current;
        if !is_phase_transition_allowed(from, to) {
            return Err(PhaseError::InvalidTransition { from, to });
        }
        self.current = to;
        Ok(from)
    }
}
