//! Game state fixtures.

use serde_json::{Value, json};
use tavern_world_state::domain::rows::NpcRecord;
use tavern_world_state::domain::state::GameState;

/// A registry row with an id and display name.
#[must_use]
pub fn npc(id: &str, name: &str) -> NpcRecord {
    NpcRecord {
        npc_id: id.to_owned(),
        name: name.to_owned(),
        ..NpcRecord::default()
    }
}

/// A default state whose purse holds `currency`.
#[must_use]
pub fn state_with_balance(currency: f64) -> GameState {
    let mut state = GameState::default();
    state.character.currency = currency;
    state
}

/// A state at turn 3 in Orario with two registered characters and 200
/// valis in the purse.
#[must_use]
pub fn sample_state() -> GameState {
    let mut state = state_with_balance(200.0);
    state.turn = 3;
    state.game_time = "Day 2 08:00".to_owned();
    state.location = "Orario".to_owned();
    state.registry.insert(npc("NPC_Eina", "Eina"));
    state.registry.insert(npc("NPC_Lili", "Lili"));
    state
}

/// A structured service input with the given narrative lines and fill
/// task.
#[must_use]
pub fn turn_input(turn: u32, lines: &[(&str, &str)], fill_task: Value) -> String {
    let narrative: Vec<Value> = lines
        .iter()
        .map(|(sender, text)| json!({ "sender": sender, "text": text }))
        .collect();
    json!({
        "叙事": narrative,
        "填表任务": fill_task,
        "回合数": turn,
        "玩家输入": "continue",
    })
    .to_string()
}
