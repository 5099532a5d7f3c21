//! Batch outcome reporting.

use serde::Serialize;
use tavern_core::error::DomainError;
use tavern_world_state::domain::locks::Conflict;

/// A command the applier refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedCommand {
    /// Position in the batch.
    pub index: usize,
    /// Action of the command.
    pub action: String,
    /// Error class, see [`error_kind`].
    pub kind: &'static str,
    /// Rendered error.
    pub error: String,
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Commands whose effects were kept.
    pub applied: usize,
    /// Commands that were rolled back.
    pub rejected: Vec<RejectedCommand>,
    /// Every conflict recorded, fatal or not.
    pub conflicts: Vec<Conflict>,
    /// Ledger entries recorded by kept commands.
    pub ledger_entries: Vec<String>,
    /// Non-fatal oddities.
    pub warnings: Vec<String>,
}

impl BatchReport {
    /// Whether every command applied.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    /// Folds another report into this one, re-basing rejected indices.
    pub fn merge(&mut self, other: BatchReport, offset: usize) {
        self.applied += other.applied;
        self.rejected
            .extend(other.rejected.into_iter().map(|mut rejected| {
                rejected.index += offset;
                rejected
            }));
        self.conflicts.extend(other.conflicts);
        self.ledger_entries.extend(other.ledger_entries);
        self.warnings.extend(other.warnings);
    }
}

/// Short class name of an error, used in reports and logs.
#[must_use]
pub fn error_kind(error: &DomainError) -> &'static str {
    match error {
        DomainError::MalformedCommand { .. } => "malformed-command",
        DomainError::MalformedPayload { .. } => "malformed-payload",
        DomainError::OutOfScopeWrite { .. } => "out-of-scope",
        DomainError::EconomicInvariantViolation { .. } => "invariant-violation",
        DomainError::VersionConflict { .. } => "version-conflict",
        DomainError::UnknownPath(_) => "unknown-path",
        DomainError::UnsupportedAction(_) => "unsupported-action",
        DomainError::ServiceUnavailable(_) => "service-unavailable",
        DomainError::Aborted => "aborted",
        DomainError::SnapshotNotFound(_) => "snapshot-not-found",
        DomainError::TurnInProgress => "turn-in-progress",
        DomainError::Validation(_) => "validation",
        DomainError::Infrastructure(_) => "infrastructure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_rebases_rejected_indices() {
        // Arrange
        let mut first = BatchReport {
            applied: 2,
            ..BatchReport::default()
        };
        let second = BatchReport {
            applied: 1,
            rejected: vec![RejectedCommand {
                index: 0,
                action: "set".into(),
                kind: "unknown-path",
                error: "unknown state path: x".into(),
            }],
            ..BatchReport::default()
        };

        // Act
        first.merge(second, 3);

        // Assert
        assert_eq!(first.applied, 3);
        assert_eq!(first.rejected[0].index, 3);
        assert!(!first.is_clean());
    }

    #[test]
    fn test_error_kind_names_out_of_scope() {
        let error = DomainError::OutOfScopeWrite {
            sheet: "WORLD_News".into(),
            field: None,
        };

        assert_eq!(error_kind(&error), "out-of-scope");
    }
}
