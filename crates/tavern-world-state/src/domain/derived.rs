//! Derived fields recomputed once after every applied batch.

use super::rows::NpcRecord;
use super::state::{GameState, PlayerCharacter};

/// Recomputes maximum vitals, carry capacity, companion paired vitals and
/// NPC presence/status.
pub fn recompute_derived(state: &mut GameState) {
    recompute_character(&mut state.character);
    let keys: Vec<String> = state.registry.iter().map(|npc| npc.npc_id.clone()).collect();
    for key in keys {
        if let Some(npc) = state.registry.get_mut(&key) {
            normalize_companion_vitals(npc);
            normalize_presence(npc);
        }
    }
}

/// Maximum vitals and carry capacity implied by level and abilities.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Maximums {
    hp: f64,
    mind: f64,
    stamina: f64,
    carry: f64,
}

fn maximums(c: &PlayerCharacter) -> Maximums {
    let level_bonus = f64::from(c.level.saturating_sub(1));
    let a = &c.abilities;
    Maximums {
        hp: 100.0 + level_bonus * 20.0 + (a.endurance / 10.0).floor(),
        mind: 50.0 + level_bonus * 10.0 + (a.magic / 10.0).floor(),
        stamina: 100.0 + level_bonus * 10.0 + ((a.endurance + a.agility) / 20.0).floor(),
        carry: 50.0 + (a.strength / 5.0).floor(),
    }
}

/// Raises the player's maximum vitals to what the current level and
/// abilities allow, without clamping anything. Lets resource checks run
/// mid-batch against the bounds the batch will end with.
pub fn raise_maximums(state: &mut GameState) {
    let max = maximums(&state.character);
    let c = &mut state.character;
    c.max_hp = c.max_hp.max(max.hp);
    c.max_mind = c.max_mind.max(max.mind);
    c.max_stamina = c.max_stamina.max(max.stamina);
}

fn recompute_character(c: &mut PlayerCharacter) {
    let max = maximums(c);
    c.max_hp = max.hp;
    c.max_mind = max.mind;
    c.max_stamina = max.stamina;
    c.max_carry = max.carry;
    c.hp = c.hp.clamp(0.0, c.max_hp);
    c.mind = c.mind.clamp(0.0, c.max_mind);
    c.stamina = c.stamina.clamp(0.0, c.max_stamina);
}

fn normalize_companion_vitals(npc: &mut NpcRecord) {
    if npc.is_companion != Some(true) {
        return;
    }
    match (npc.hp, npc.max_hp) {
        (Some(hp), None) => npc.max_hp = Some(hp),
        (None, Some(max)) => npc.hp = Some(max),
        (Some(hp), Some(max)) if hp > max => npc.hp = Some(max),
        _ => {}
    }
    if let Some(hp) = npc.hp.filter(|hp| *hp < 0.0) {
        npc.hp = Some(hp.max(0.0));
    }
}

const PRESENT_WORDS: &[&str] = &["present", "在场"];
const ABSENT_WORDS: &[&str] = &["left", "离场", "dead", "死亡", "missing", "失踪", "absent"];

fn normalize_presence(npc: &mut NpcRecord) {
    let status = npc.status.as_deref().map(str::trim).unwrap_or_default();
    let lowered = status.to_lowercase();
    if PRESENT_WORDS.contains(&lowered.as_str()) {
        npc.present = Some(true);
    } else if ABSENT_WORDS.contains(&lowered.as_str()) {
        npc.present = Some(false);
    } else if status.is_empty() {
        npc.status = npc.present.map(|present| {
            if present { "present" } else { "left" }.to_owned()
        });
    }
}
