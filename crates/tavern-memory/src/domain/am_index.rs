//! AM-codes: the zero-padded index shared by a summary row and its paired
//! outline row.

use std::fmt;

use serde::{Deserialize, Serialize};

const PREFIX: &str = "AM";

/// A memory index such as `AM0007`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AmCode(u32);

impl AmCode {
    /// The first code handed out.
    pub const FIRST: Self = Self(1);

    /// Wraps a sequence number.
    #[must_use]
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    /// The sequence number.
    #[must_use]
    pub fn number(self) -> u32 {
        self.0
    }

    /// The code after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Parses `AM<digits>`, case-insensitively and ignoring surrounding
    /// whitespace. Zero is not a code.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let digits = trimmed
            .get(..PREFIX.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(PREFIX))
            .and_then(|_| trimmed.get(PREFIX.len()..))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().filter(|n| *n > 0).map(Self)
    }
}

impl fmt::Display for AmCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{:04}", self.0)
    }
}

impl TryFrom<String> for AmCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid AM-code: {value}"))
    }
}

impl From<AmCode> for String {
    fn from(value: AmCode) -> Self {
        value.to_string()
    }
}

/// The code the next paired turn receives: one past the highest of
/// `in_use`.
#[must_use]
pub fn next_am_code(in_use: impl IntoIterator<Item = AmCode>) -> AmCode {
    in_use.into_iter().max().map_or(AmCode::FIRST, AmCode::next)
}
