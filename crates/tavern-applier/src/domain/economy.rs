//! Currency movements and the economic ledger.
//!
//! Money only moves through [`apply_econ_delta`] or an account path write;
//! both record a ledger entry with the before/after balances.

use tavern_commands::domain::payloads::{EconDelta, econ_deltas};
use tavern_core::clock::Clock;
use tavern_core::command::{Command, ServiceKey};
use tavern_core::error::DomainError;
use tavern_core::sheet::SheetId;
use tavern_world_state::domain::rows::LedgerEntry;
use tavern_world_state::domain::state::{Account, GameState};

use super::gate::{CommandWriter, PLAYER_ROW, RowTouch, field_patch};

/// Ledger entries retained by default.
pub const DEFAULT_LEDGER_CAP: usize = 300;

/// What economic handlers need besides the state.
#[derive(Clone, Copy)]
pub struct EconomyContext<'a> {
    /// Timestamp source for ledger entries.
    pub clock: &'a dyn Clock,
    /// Maximum ledger length; oldest entries are dropped.
    pub ledger_cap: usize,
    /// Service that produced the command.
    pub source: ServiceKey,
}

/// One balance change to be written to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerLine<'a> {
    /// Account that moved.
    pub account: Account,
    /// Balance before.
    pub before: f64,
    /// Signed change.
    pub delta: f64,
    /// Balance after.
    pub after: f64,
    /// Why the money moved.
    pub reason: &'a str,
    /// Originating command reference.
    pub command_ref: Option<&'a str>,
}

/// Rounds to cents.
#[must_use]
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn next_ledger_id(state: &GameState) -> String {
    let mut n = state
        .ledger
        .iter()
        .filter(|entry| entry.turn == state.turn)
        .count()
        + 1;
    loop {
        let candidate = format!("LEDGER_{}_{n}", state.turn);
        if !state.ledger.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Appends a ledger entry and trims the ledger to its cap. Returns the
/// entry id.
pub fn record_ledger_entry(
    state: &mut GameState,
    ctx: &EconomyContext<'_>,
    line: &LedgerLine<'_>,
) -> String {
    let ledger_id = next_ledger_id(state);
    state.ledger.insert(LedgerEntry {
        ledger_id: ledger_id.clone(),
        turn: state.turn,
        timestamp: ctx.clock.timestamp(),
        account: line.account.as_str().to_owned(),
        before: line.before,
        delta: line.delta,
        after: line.after,
        reason: line.reason.to_owned(),
        command_ref: line.command_ref.map(str::to_owned),
        source: Some(ctx.source.as_str().to_owned()),
    });
    state.ledger.truncate_front(ctx.ledger_cap);
    ledger_id
}

/// Applies one signed delta to an account and records it.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an unknown account and propagates
/// conflict rejections on the player row.
pub fn apply_econ_delta(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    delta: &EconDelta,
) -> Result<(), DomainError> {
    let account = Account::parse(&delta.account)
        .ok_or_else(|| DomainError::Validation(format!("unknown account: {}", delta.account)))?;
    let before = state.balance(account);
    let after = round_cents(before + delta.delta);
    state.set_balance(account, after);

    let fields = field_patch(account.resource_field(), after.into());
    writer.track(&RowTouch {
        sheet: &SheetId::CharacterResources,
        row_key: PLAYER_ROW,
        fields: &fields,
        expected_version: None,
    })?;

    let reason = if delta.reason.trim().is_empty() {
        "apply_econ_delta"
    } else {
        delta.reason.as_str()
    };
    let ledger_id = record_ledger_entry(
        state,
        ctx,
        &LedgerLine {
            account,
            before,
            delta: delta.delta,
            after,
            reason,
            command_ref: delta.command_ref.as_deref(),
        },
    );
    writer.note_ledger_entry(ledger_id);
    Ok(())
}

/// Executes `apply_econ_delta` and `append_econ_ledger`. Both move money
/// and record the movement.
///
/// # Errors
///
/// Returns `DomainError::OutOfScopeWrite` when money may not move,
/// `DomainError::MalformedPayload` for an undecodable payload, and any
/// per-delta error.
pub fn apply_econ_command(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    command: &Command,
) -> Result<(), DomainError> {
    writer.permits_economy()?;
    for delta in econ_deltas(&command.action, &command.value)? {
        apply_econ_delta(state, writer, ctx, &delta)?;
    }
    Ok(())
}
