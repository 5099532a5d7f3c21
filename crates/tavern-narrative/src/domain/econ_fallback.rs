//! Economic fallback.
//!
//! When the state service narrates a payment but emits no economic command,
//! the fallback books the net amount against the player's purse.

use serde_json::json;
use tavern_core::command::{Action, Command, ServiceKey};
use tavern_core::sheet::SheetId;
use tavern_rules::domain::scope::StrictAllowlist;
use tavern_world_state::domain::paths::StatePath;
use tavern_world_state::domain::state::Account;

use super::currency::extract_amounts;
use super::fallback::FallbackReason;
use super::payload::TurnPayload;

/// Reason and command reference stamped on synthesized deltas.
pub const ECON_FALLBACK_REF: &str = "state-fallback:narrative-econ";

/// Characters of context inspected on each side of an amount.
const WINDOW_CHARS: usize = 28;

const EXPENSE_KEYWORDS: &[&str] = &[
    "支付", "付款", "付钱", "花费", "消费", "买单", "结账", "购入", "购买", "买了", "买下", "花了",
    "花掉", "掏出", "摸出", "拍在柜台", "pay", "paid", "cost", "spend", "spent", "bought",
    "purchase",
];

const INCOME_KEYWORDS: &[&str] = &[
    "获得", "得到", "收入", "赚到", "报酬", "奖励", "赏金", "卖出", "售出", "变卖", "收到",
    "receive", "earned", "reward", "sold", "bounty",
];

const BALANCE_HINTS: &[&str] = &[
    "口袋里有", "余额", "现有", "拥有", "持有", "总计", "还剩", "剩余", "balance", "remaining",
    "left with",
];

/// Result of the economic fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct EconFallback {
    /// Reason class.
    pub reason: FallbackReason,
    /// Net delta booked, when applied.
    pub delta: Option<f64>,
    /// Observability marker, when applied.
    pub marker: Option<String>,
    /// The synthesized `apply_econ_delta`, when applied.
    pub command: Option<Command>,
}

impl EconFallback {
    fn skipped(reason: FallbackReason) -> Self {
        Self {
            reason,
            delta: None,
            marker: None,
            command: None,
        }
    }
}

/// Whether the batch already moves money: an economic action, a sheet
/// write on `ECON_Ledger`, or a path write on a currency account.
#[must_use]
pub fn has_economic_mutation(commands: &[Command]) -> bool {
    commands.iter().any(|command| match &command.action {
        action if action.is_economic() => true,
        Action::UpsertSheetRows | Action::DeleteSheetRows => command
            .payload_sheet()
            .is_some_and(|sheet| SheetId::parse(sheet) == SheetId::EconLedger),
        action if action.is_path_action() => command
            .key
            .as_deref()
            .and_then(|key| StatePath::parse(key).ok())
            .is_some_and(|path| path.account().is_some()),
        _ => false,
    })
}

fn keyword_hits(lowered: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|k| lowered.contains(*k)).count()
}

fn sign_of(expense: usize, income: usize) -> i8 {
    match expense.cmp(&income) {
        std::cmp::Ordering::Greater => -1,
        std::cmp::Ordering::Less => 1,
        std::cmp::Ordering::Equal => 0,
    }
}

/// Text within `radius` characters of the byte span `start..end`.
fn window(text: &str, start: usize, end: usize, radius: usize) -> &str {
    let from = text[..start]
        .char_indices()
        .rev()
        .nth(radius.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    let to = text[end..]
        .char_indices()
        .nth(radius)
        .map_or(text.len(), |(i, _)| end + i);
    &text[from..to]
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Net signed amount mentioned in the texts, or `None` if nothing could be
/// signed.
#[must_use]
pub fn narrative_delta(texts: &[String]) -> Option<f64> {
    if texts.is_empty() {
        return None;
    }
    let merged = texts.join("\n");
    let lowered_all = merged.to_lowercase();
    let global_sign = sign_of(
        keyword_hits(&lowered_all, EXPENSE_KEYWORDS),
        keyword_hits(&lowered_all, INCOME_KEYWORDS),
    );
    let mut total = 0.0;
    let mut matched = false;
    for found in extract_amounts(&merged) {
        if found.amount <= 0.0 {
            continue;
        }
        let context = window(&merged, found.start, found.end, WINDOW_CHARS).to_lowercase();
        let mut sign = sign_of(
            keyword_hits(&context, EXPENSE_KEYWORDS),
            keyword_hits(&context, INCOME_KEYWORDS),
        );
        if sign == 0 {
            if BALANCE_HINTS.iter().any(|hint| context.contains(hint)) || global_sign == 0 {
                continue;
            }
            sign = global_sign;
        }
        total += f64::from(sign) * found.amount;
        matched = true;
    }
    matched.then(|| round_cents(total))
}

/// Synthesizes a currency delta for money the prose mentions but the batch
/// does not book. `allowlist` is passed only in strict mode.
#[must_use]
pub fn synthesize_econ_fallback(
    input: &str,
    commands: &[Command],
    allowlist: Option<&StrictAllowlist>,
) -> EconFallback {
    if has_economic_mutation(commands) {
        return EconFallback::skipped(FallbackReason::AlreadyCovered);
    }
    let Some(payload) = TurnPayload::parse(input) else {
        return EconFallback::skipped(FallbackReason::NonStructuredInput);
    };
    if !payload.declared_scope().covers(&SheetId::EconLedger) {
        return EconFallback::skipped(FallbackReason::NoAccess);
    }
    let Some(delta) = narrative_delta(&payload.narrative_texts()).filter(|d| d.abs() > 0.0) else {
        return EconFallback::skipped(FallbackReason::NoDelta);
    };
    let currency = Account::CharacterCurrency;
    if allowlist.is_some_and(|list| {
        !list.has_any_field(
            &SheetId::CharacterResources,
            &[currency.resource_field(), "法利"],
        )
    }) {
        return EconFallback::skipped(FallbackReason::OutOfScope);
    }
    let direction = if delta < 0.0 { "expense" } else { "income" };
    EconFallback {
        reason: FallbackReason::Applied,
        delta: Some(delta),
        marker: Some(format!("econ-fallback(delta={delta},direction={direction})")),
        command: Some(Command::new(
            Action::ApplyEconDelta,
            json!({
                "account": currency.as_str(),
                "delta": delta,
                "reason": ECON_FALLBACK_REF,
                "commandRef": ECON_FALLBACK_REF,
            }),
            ServiceKey::State,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn input(narrative: &str) -> String {
        json!({ "叙事": narrative, "回合数": 3 }).to_string()
    }

    #[test]
    fn test_payment_in_prose_books_negative_delta() {
        // Arrange
        let input = input("你在柜台支付了120法利，买下一把短剑。");

        // Act
        let outcome = synthesize_econ_fallback(&input, &[], None);

        // Assert
        assert_eq!(outcome.reason, FallbackReason::Applied);
        assert_eq!(outcome.delta, Some(-120.0));
        assert_eq!(
            outcome.marker.as_deref(),
            Some("econ-fallback(delta=-120,direction=expense)")
        );
        let command = outcome.command.unwrap();
        assert_eq!(command.action, Action::ApplyEconDelta);
        assert_eq!(command.value["account"], "character.currency");
        assert_eq!(command.value["reason"], ECON_FALLBACK_REF);
    }

    #[test]
    fn test_income_and_expense_are_netted() {
        let texts = vec![
            "Your reward for the quest is 300 valis.".to_owned(),
            "After a long walk across the whole city at dusk, you spent 45.5 valis on potions."
                .to_owned(),
        ];

        assert_eq!(narrative_delta(&texts), Some(254.5));
    }

    #[test]
    fn test_balance_mentions_are_not_movements() {
        let texts = vec!["你的口袋里有500法利。".to_owned()];

        assert_eq!(narrative_delta(&texts), None);
    }

    #[test]
    fn test_existing_economic_command_short_circuits() {
        let commands = vec![Command::at_path(
            Action::Add,
            "gameState.角色.法利",
            json!(-10),
            ServiceKey::State,
        )];

        let outcome = synthesize_econ_fallback(&input("支付了10法利"), &commands, None);

        assert_eq!(outcome.reason, FallbackReason::AlreadyCovered);
        assert!(outcome.command.is_none());
    }

    #[test]
    fn test_ledger_sheet_write_counts_as_covered() {
        let commands = vec![Command::new(
            Action::UpsertSheetRows,
            json!({ "sheetId": "ECON_Ledger", "rows": [{ "delta": -5 }] }),
            ServiceKey::State,
        )];

        assert!(has_economic_mutation(&commands));
    }

    #[test]
    fn test_reason_classes_in_order() {
        // Arrange
        let no_access = json!({
            "叙事": "支付了10法利",
            "填表任务": { "requiredSheets": ["NPC_Registry"] }
        })
        .to_string();
        let strict = StrictAllowlist(BTreeMap::from([(
            "social".to_owned(),
            BTreeMap::from([("NPC_Registry".to_owned(), vec!["npc_id".to_owned()])]),
        )]));

        // Act & Assert
        assert_eq!(
            synthesize_econ_fallback("pay 10 valis", &[], None).reason,
            FallbackReason::NonStructuredInput
        );
        assert_eq!(
            synthesize_econ_fallback(&no_access, &[], None).reason,
            FallbackReason::NoAccess
        );
        assert_eq!(
            synthesize_econ_fallback(&input("A quiet evening."), &[], None).reason,
            FallbackReason::NoDelta
        );
        assert_eq!(
            synthesize_econ_fallback(&input("支付了10法利"), &[], Some(&strict)).reason,
            FallbackReason::OutOfScope
        );
    }

    #[test]
    fn test_window_is_measured_in_characters() {
        let text = "ab支付cd";

        assert_eq!(window(text, 2, 8, 1), "b支付c");
    }
}
