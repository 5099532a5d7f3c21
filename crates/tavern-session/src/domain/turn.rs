//! Turn state machine and turn reporting.

use std::fmt;

use serde::Serialize;
use tavern_applier::domain::report::BatchReport;
use tavern_commands::domain::normalizer::MalformedReport;
use tavern_memory::application::fill::MemoryFillOutcome;
use tavern_memory::domain::pairing::PairingIssue;
use tavern_narrative::application::synthesis::SynthesisReport;
use tavern_rules::domain::guard::GuardReject;
use tracing::debug;

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// The narrative for the turn is known.
    NarrativeResolved,
    /// The state service has been asked for commands.
    StateServiceDispatched,
    /// State commands have been applied.
    StateApplied,
    /// The memory service has been asked for log rows.
    MemoryFillDispatched,
    /// Log rows have been applied and paired.
    MemoryApplied,
    /// The turn's effects are kept.
    TurnCommitted,
    /// The turn was cancelled; its effects were discarded.
    Cancelled,
    /// A service failure ended the turn; its effects were discarded.
    Failed,
}

impl TurnPhase {
    /// The phase that follows on success, or `None` for terminal phases.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::NarrativeResolved => Some(Self::StateServiceDispatched),
            Self::StateServiceDispatched => Some(Self::StateApplied),
            Self::StateApplied => Some(Self::MemoryFillDispatched),
            Self::MemoryFillDispatched => Some(Self::MemoryApplied),
            Self::MemoryApplied => Some(Self::TurnCommitted),
            Self::TurnCommitted | Self::Cancelled | Self::Failed => None,
        }
    }

    /// Whether the turn is over.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NarrativeResolved => "narrative_resolved",
            Self::StateServiceDispatched => "state_service_dispatched",
            Self::StateApplied => "state_applied",
            Self::MemoryFillDispatched => "memory_fill_dispatched",
            Self::MemoryApplied => "memory_applied",
            Self::TurnCommitted => "turn_committed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw command the normalizer dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedCommand {
    /// Position in the raw batch.
    pub index: usize,
    /// Why it was dropped.
    pub error: String,
}

impl From<&MalformedReport> for DroppedCommand {
    fn from(report: &MalformedReport) -> Self {
        Self {
            index: report.index,
            error: report.error.to_string(),
        }
    }
}

/// Memory fill counters for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    /// Requests sent to the memory service, repairs included.
    pub requests: usize,
    /// Commands handed to the applier.
    pub commands: usize,
    /// Raw entries dropped as malformed.
    pub malformed: usize,
    /// Commands dropped by the guard or the request's target sheet.
    pub screened: usize,
    /// Duplicate rows collapsed.
    pub deduplicated: usize,
    /// Turns whose AM-codes were assigned or realigned.
    pub realigned: Vec<u32>,
    /// Whether a targeted repair was requested.
    pub repaired: bool,
}

impl MemoryReport {
    /// Adds one fill outcome's counters.
    pub fn absorb(&mut self, outcome: &MemoryFillOutcome) {
        self.requests += outcome.requests;
        self.commands += outcome.commands.len();
        self.malformed += outcome.malformed;
        self.screened += outcome.guarded + outcome.out_of_scope;
        self.deduplicated += outcome.deduplicated;
    }
}

/// Everything that happened during one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    /// Turn number.
    pub turn: u32,
    /// Last phase reached.
    pub phase: TurnPhase,
    /// Raw commands dropped by the normalizer.
    pub malformed: Vec<DroppedCommand>,
    /// Commands dropped by the service guard.
    pub guard_rejections: Vec<GuardReject>,
    /// Applier outcome across every batch of the turn.
    pub batch: BatchReport,
    /// Fallback decisions for the state response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisReport>,
    /// Memory fill counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryReport>,
    /// Pairing issues left after the turn.
    pub pairing_issues: Vec<PairingIssue>,
    /// Repair notes from response extraction.
    pub repair_notes: Vec<String>,
    /// Whether the committed state was persisted.
    pub persisted: bool,
}

impl TurnReport {
    /// A fresh report for a turn whose narrative is known.
    #[must_use]
    pub fn new(turn: u32) -> Self {
        Self {
            turn,
            phase: TurnPhase::NarrativeResolved,
            malformed: Vec::new(),
            guard_rejections: Vec::new(),
            batch: BatchReport::default(),
            synthesis: None,
            memory: None,
            pairing_issues: Vec::new(),
            repair_notes: Vec::new(),
            persisted: false,
        }
    }

    /// Moves to the next phase. Terminal phases stay put.
    pub fn advance(&mut self) {
        if let Some(next) = self.phase.next() {
            debug!(turn = self.turn, from = %self.phase, to = %next, "turn phase advanced");
            self.phase = next;
        }
    }

    /// Folds an applier report into the turn's running totals.
    pub fn absorb_batch(&mut self, batch: BatchReport) {
        let offset = self.batch.applied + self.batch.rejected.len();
        self.batch.merge(batch, offset);
    }

    /// Records an extraction repair note.
    pub fn note_repair(&mut self, note: Option<String>) {
        self.repair_notes.extend(note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_applier::domain::report::RejectedCommand;

    #[test]
    fn test_phases_run_in_order_and_stop_at_commit() {
        // Arrange
        let mut report = TurnReport::new(4);
        let mut seen = vec![report.phase];

        // Act
        for _ in 0..8 {
            report.advance();
            if seen.last() != Some(&report.phase) {
                seen.push(report.phase);
            }
        }

        // Assert
        assert_eq!(
            seen,
            vec![
                TurnPhase::NarrativeResolved,
                TurnPhase::StateServiceDispatched,
                TurnPhase::StateApplied,
                TurnPhase::MemoryFillDispatched,
                TurnPhase::MemoryApplied,
                TurnPhase::TurnCommitted,
            ]
        );
        assert!(report.phase.is_terminal());
    }

    #[test]
    fn test_cancelled_and_failed_are_terminal() {
        assert!(TurnPhase::Cancelled.is_terminal());
        assert!(TurnPhase::Failed.is_terminal());
        assert!(!TurnPhase::StateApplied.is_terminal());
    }

    #[test]
    fn test_absorbed_batches_rebase_rejected_indices() {
        // Arrange
        let mut report = TurnReport::new(1);
        let first = BatchReport {
            applied: 2,
            ..BatchReport::default()
        };
        let second = BatchReport {
            applied: 1,
            rejected: vec![RejectedCommand {
                index: 1,
                action: "set".to_owned(),
                kind: "unknown-path",
                error: "unknown state path: x".to_owned(),
            }],
            ..BatchReport::default()
        };

        // Act
        report.absorb_batch(first);
        report.absorb_batch(second);

        // Assert
        assert_eq!(report.batch.applied, 3);
        assert_eq!(report.batch.rejected[0].index, 3);
    }

    #[test]
    fn test_report_serializes_phase_in_snake_case() {
        let value = serde_json::to_value(TurnReport::new(2)).unwrap();

        assert_eq!(value["phase"], "narrative_resolved");
        assert_eq!(value["turn"], 2);
        assert!(value.get("synthesis").is_none());
    }
}
