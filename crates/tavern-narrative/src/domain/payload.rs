//! The structured turn payload handed to the state service.
//!
//! The payload is a JSON object keyed by the game's native field names.
//! Only the handful of fields the fallbacks read are decoded; everything
//! else is ignored.

use serde_json::{Map, Value};
use tavern_core::service::FillTask;
use tavern_rules::domain::scope::DeclaredScope;

/// Speaker assigned to bare narrative strings.
pub const NARRATOR: &str = "旁白";

/// One `{speaker, text}` line of narrative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrativeLine {
    /// Who says it.
    pub speaker: String,
    /// What is said.
    pub text: String,
}

/// Decoded turn payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnPayload {
    narrative: Value,
    /// Fill task the service was invoked with.
    pub fill_task: Option<FillTask>,
    /// In-game clock text.
    pub game_time: Option<String>,
    /// Scene location.
    pub location: Option<String>,
    /// Turn number.
    pub turn: Option<u32>,
    /// The player's own input for the turn.
    pub player_input: Option<String>,
}

fn lookup<'a>(map: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| map.get(*name)).filter(|v| !v.is_null())
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_owned(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn non_empty_text(value: Option<&Value>) -> Option<String> {
    value.map(text_of).filter(|s| !s.is_empty())
}

fn turn_of(value: &Value) -> Option<u32> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    let number = number.floor();
    if !number.is_finite() || number < 0.0 || number > f64::from(u32::MAX) {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let turn = number as u32;
    Some(turn)
}

impl TurnPayload {
    /// Parses a service input string. Returns `None` unless it is a JSON
    /// object.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) else {
            return None;
        };
        let fill_task = lookup(&map, &["填表任务", "fillTask"])
            .filter(|v| v.is_object())
            .map(|v| serde_json::from_value::<FillTask>(v.clone()).unwrap_or_default());
        Some(Self {
            narrative: lookup(&map, &["叙事", "narrative"])
                .cloned()
                .unwrap_or(Value::Null),
            fill_task,
            game_time: non_empty_text(lookup(&map, &["游戏时间", "gameTime"])),
            location: non_empty_text(lookup(&map, &["当前地点", "location"])),
            turn: lookup(&map, &["回合数", "turn"]).and_then(turn_of),
            player_input: non_empty_text(lookup(&map, &["玩家输入", "playerInput"])),
        })
    }

    /// Scope declared by the fill task; open when there is none.
    #[must_use]
    pub fn declared_scope(&self) -> DeclaredScope {
        DeclaredScope::from_task(self.fill_task.as_ref())
    }

    /// All prose of the turn: narrative strings or line texts, then the
    /// player input.
    #[must_use]
    pub fn narrative_texts(&self) -> Vec<String> {
        let mut texts = Vec::new();
        match &self.narrative {
            Value::String(s) => texts.push(s.trim().to_owned()),
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(s) => texts.push(s.trim().to_owned()),
                        Value::Object(row) => {
                            let text = non_empty_text(lookup(row, &["text", "内容"]));
                            texts.push(text.unwrap_or_default());
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        if let Some(input) = &self.player_input {
            texts.push(input.clone());
        }
        texts.retain(|t| !t.is_empty());
        texts
    }

    /// Narrative as speaker lines. Bare strings are narrator lines; rows
    /// without a speaker or text are dropped.
    #[must_use]
    pub fn narrative_lines(&self) -> Vec<NarrativeLine> {
        let Value::Array(items) = &self.narrative else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => {
                    let text = s.trim();
                    (!text.is_empty()).then(|| NarrativeLine {
                        speaker: NARRATOR.to_owned(),
                        text: text.to_owned(),
                    })
                }
                Value::Object(row) => {
                    let speaker =
                        non_empty_text(lookup(row, &["sender", "发送者", "说话者", "speaker"]))?;
                    let text = non_empty_text(lookup(row, &["text", "内容"]))?;
                    Some(NarrativeLine { speaker, text })
                }
                _ => None,
            })
            .collect()
    }
}
