//! Domain error types.

use std::fmt;

use thiserror::Error;

/// The command field whose absence made a command unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandField {
    /// No action/cmd/name could be found.
    Action,
    /// A path action carried no key.
    Key,
    /// An action that needs a value carried none.
    Value,
}

impl fmt::Display for CommandField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Action => "action",
            Self::Key => "key",
            Self::Value => "value",
        };
        f.write_str(name)
    }
}

fn field_suffix(field: &Option<String>) -> String {
    field.as_deref().map(|f| format!(".{f}")).unwrap_or_default()
}

/// Top-level domain error type.
///
/// Command-level variants are recovered inside a batch; turn-level variants
/// (`ServiceUnavailable`, `Aborted`, `TurnInProgress`) abort the current turn
/// only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DomainError {
    /// A command is missing a required field.
    #[error("malformed command: missing {missing}")]
    MalformedCommand {
        /// The missing field.
        missing: CommandField,
    },

    /// A command's value does not match the payload its action expects.
    #[error("malformed payload for {action}: {detail}")]
    MalformedPayload {
        /// The action whose payload failed to decode.
        action: String,
        /// Decoder message.
        detail: String,
    },

    /// A write targeted a sheet or field outside the permitted scope.
    #[error("out-of-scope write to {sheet}{}", field_suffix(.field))]
    OutOfScopeWrite {
        /// Target sheet.
        sheet: String,
        /// Target field, when the write is field-level.
        field: Option<String>,
    },

    /// Applying a command would break an economic or resource invariant.
    #[error("invariant violation {code} at {path}")]
    EconomicInvariantViolation {
        /// Invariant code, e.g. `MONEY_NEGATIVE`.
        code: String,
        /// State path that failed the check.
        path: String,
    },

    /// Two writers touched the same row or cell incompatibly.
    #[error("version conflict on {sheet}/{row_key}: {reason}")]
    VersionConflict {
        /// Target sheet.
        sheet: String,
        /// Target row key.
        row_key: String,
        /// Conflict reason code.
        reason: String,
    },

    /// A command path did not resolve to a known state location.
    #[error("unknown state path: {0}")]
    UnknownPath(String),

    /// An action the applier does not know how to execute.
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// A generation service could not be reached or returned an error.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The turn was cancelled.
    #[error("turn aborted")]
    Aborted,

    /// No snapshot exists for the requested slot.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A turn is already executing for this session.
    #[error("a turn is already in progress")]
    TurnInProgress,

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` for errors that end the current turn rather than a
    /// single command.
    #[must_use]
    pub fn is_turn_level(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable(_) | Self::Aborted | Self::TurnInProgress
        )
    }
}
