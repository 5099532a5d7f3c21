//! Outcome vocabulary shared by the fallback synthesizers.

use std::fmt;

use serde::Serialize;

/// Why a fallback did or did not synthesize anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackReason {
    /// Commands were synthesized.
    Applied,
    /// The service input was not a JSON object.
    NonStructuredInput,
    /// The fill task does not cover the target sheets.
    NoAccess,
    /// No signed amount was found in the prose.
    NoDelta,
    /// No non-narrator speaker was found.
    NoDialogue,
    /// The strict allowlist does not permit the write.
    OutOfScope,
    /// The batch already carries the write.
    AlreadyCovered,
}

impl FallbackReason {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::NonStructuredInput => "non-structured-input",
            Self::NoAccess => "no-access",
            Self::NoDelta => "no-delta",
            Self::NoDialogue => "no-dialogue",
            Self::OutOfScope => "out-of-scope",
            Self::AlreadyCovered => "already-covered",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
