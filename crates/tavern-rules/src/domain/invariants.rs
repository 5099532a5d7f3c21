//! Cross-cutting state invariants.
//!
//! The validator is run before and after each invariant-sensitive command;
//! only issues the command introduced count against it.

use std::fmt;

use serde::{Deserialize, Serialize};
use tavern_core::error::DomainError;
use tavern_world_state::domain::state::{Account, GameState};

/// Invariant families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvariantCode {
    /// A currency account went below zero.
    MoneyNegative,
    /// A bounded resource went below zero.
    ResourceBelowZero,
    /// A bounded resource exceeds its maximum.
    ResourceExceedsMax,
    /// Affinity left its configured range.
    AffinityOutOfRange,
}

impl InvariantCode {
    /// Wire code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MoneyNegative => "MONEY_NEGATIVE",
            Self::ResourceBelowZero => "RESOURCE_BELOW_ZERO",
            Self::ResourceExceedsMax => "RESOURCE_EXCEEDS_MAX",
            Self::AffinityOutOfRange => "AFFINITY_OUT_OF_RANGE",
        }
    }
}

impl fmt::Display for InvariantCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A violated invariant and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvariantIssue {
    /// Which invariant.
    pub code: InvariantCode,
    /// State path of the offending value.
    pub path: String,
}

impl InvariantIssue {
    fn new(code: InvariantCode, path: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
        }
    }
}

impl From<InvariantIssue> for DomainError {
    fn from(issue: InvariantIssue) -> Self {
        Self::EconomicInvariantViolation {
            code: issue.code.as_str().to_owned(),
            path: issue.path,
        }
    }
}

/// Tunables for the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvariantOptions {
    /// Permit negative balances.
    pub allow_debt: bool,
    /// Lowest legal affinity.
    pub affinity_min: i64,
    /// Highest legal affinity.
    pub affinity_max: i64,
}

impl Default for InvariantOptions {
    fn default() -> Self {
        Self {
            allow_debt: false,
            affinity_min: 0,
            affinity_max: 100,
        }
    }
}

fn check_resource(issues: &mut Vec<InvariantIssue>, path: &str, value: f64, max: f64) {
    if value < 0.0 || !value.is_finite() {
        issues.push(InvariantIssue::new(InvariantCode::ResourceBelowZero, path));
    } else if value > max {
        issues.push(InvariantIssue::new(InvariantCode::ResourceExceedsMax, path));
    }
}

/// Lists every invariant the state currently violates.
#[must_use]
pub fn validate_state(state: &GameState, options: &InvariantOptions) -> Vec<InvariantIssue> {
    let mut issues = Vec::new();
    for account in [Account::CharacterCurrency, Account::FamiliaFunds] {
        let balance = state.balance(account);
        if !balance.is_finite() || (!options.allow_debt && balance < 0.0) {
            issues.push(InvariantIssue::new(
                InvariantCode::MoneyNegative,
                account.as_str(),
            ));
        }
    }

    let c = &state.character;
    check_resource(&mut issues, "character.hp", c.hp, c.max_hp);
    check_resource(&mut issues, "character.mind", c.mind, c.max_mind);
    check_resource(&mut issues, "character.stamina", c.stamina, c.max_stamina);

    for npc in state.registry.iter() {
        if let (Some(hp), Some(max)) = (npc.hp, npc.max_hp) {
            check_resource(&mut issues, &format!("registry.{}.hp", npc.npc_id), hp, max);
        }
        if let Some(affinity) = npc.affinity
            && !(options.affinity_min..=options.affinity_max).contains(&affinity)
        {
            issues.push(InvariantIssue::new(
                InvariantCode::AffinityOutOfRange,
                format!("registry.{}.affinity", npc.npc_id),
            ));
        }
    }
    issues
}

/// Issues present in `after` that were not present in `before`.
#[must_use]
pub fn introduced_issues(
    before: &GameState,
    after: &GameState,
    options: &InvariantOptions,
) -> Vec<InvariantIssue> {
    let existing = validate_state(before, options);
    validate_state(after, options)
        .into_iter()
        .filter(|issue| !existing.contains(issue))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_world_state::domain::rows::NpcRecord;

    fn healthy_state() -> GameState {
        let mut state = GameState::default();
        state.character.currency = 100.0;
        state.character.hp = 50.0;
        state.character.max_hp = 100.0;
        state.character.mind = 10.0;
        state.character.max_mind = 50.0;
        state.character.stamina = 10.0;
        state.character.max_stamina = 100.0;
        state
    }

    #[test]
    fn test_healthy_state_has_no_issues() {
        let issues = validate_state(&healthy_state(), &InvariantOptions::default());

        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn test_negative_currency_is_reported() {
        // Arrange
        let mut state = healthy_state();
        state.character.currency = -1.0;

        // Act
        let issues = validate_state(&state, &InvariantOptions::default());

        // Assert
        assert_eq!(
            issues,
            vec![InvariantIssue::new(
                InvariantCode::MoneyNegative,
                "character.currency"
            )]
        );
    }

    #[test]
    fn test_allow_debt_skips_money_check() {
        let mut state = healthy_state();
        state.familia.funds = -50.0;
        let options = InvariantOptions {
            allow_debt: true,
            ..InvariantOptions::default()
        };

        assert!(validate_state(&state, &options).is_empty());
    }

    #[test]
    fn test_non_finite_balance_is_reported_even_with_debt_allowed() {
        // Arrange
        let mut state = healthy_state();
        state.character.currency = f64::NAN;
        let options = InvariantOptions {
            allow_debt: true,
            ..InvariantOptions::default()
        };

        // Act
        let issues = validate_state(&state, &options);

        // Assert
        assert_eq!(
            issues,
            vec![InvariantIssue::new(
                InvariantCode::MoneyNegative,
                "character.currency"
            )]
        );
    }

    #[test]
    fn test_resource_bounds_and_affinity() {
        // Arrange
        let mut state = healthy_state();
        state.character.hp = 120.0;
        state.character.mind = -3.0;
        state.registry.insert(NpcRecord {
            npc_id: "NPC_1".into(),
            name: "Aiz".into(),
            affinity: Some(140),
            ..NpcRecord::default()
        });

        // Act
        let codes: Vec<InvariantCode> = validate_state(&state, &InvariantOptions::default())
            .into_iter()
            .map(|issue| issue.code)
            .collect();

        // Assert
        assert_eq!(
            codes,
            vec![
                InvariantCode::ResourceExceedsMax,
                InvariantCode::ResourceBelowZero,
                InvariantCode::AffinityOutOfRange,
            ]
        );
    }

    #[test]
    fn test_only_introduced_issues_count() {
        // Arrange
        let mut before = healthy_state();
        before.character.hp = 150.0;
        let mut after = before.clone();
        after.character.currency = -20.0;

        // Act
        let issues = introduced_issues(&before, &after, &InvariantOptions::default());

        // Assert
        assert_eq!(issues.len(), 1);
        let err: DomainError = issues[0].clone().into();
        match err {
            DomainError::EconomicInvariantViolation { code, path } => {
                assert_eq!(code, "MONEY_NEGATIVE");
                assert_eq!(path, "character.currency");
            }
            other => panic!("expected EconomicInvariantViolation, got {other:?}"),
        }
    }
}
