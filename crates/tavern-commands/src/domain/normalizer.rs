//! Command normalization.
//!
//! Services emit commands in several legacy shapes. Each shape has a
//! matcher; matchers are tried in a fixed order and the first one that
//! recognizes the input produces the raw parts of a command, which are then
//! validated into a canonical [`Command`].

use serde_json::{Map, Value};
use tavern_core::command::{Action, Command, ServiceKey};
use tavern_core::error::{CommandField, DomainError};
use thiserror::Error;
use tracing::warn;

use super::call_string::{parse_arg_list, parse_call};

/// Why a raw command could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    /// A required part is missing.
    #[error("malformed command: missing {missing}")]
    Malformed {
        /// The missing part.
        missing: CommandField,
    },
    /// No shape matcher recognized the input.
    #[error("unrecognized command shape")]
    UnrecognizedShape,
}

impl From<NormalizeError> for DomainError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::Malformed { missing } => Self::MalformedCommand { missing },
            NormalizeError::UnrecognizedShape => Self::MalformedPayload {
                action: "unknown".to_owned(),
                detail: "unrecognized command shape".to_owned(),
            },
        }
    }
}

/// A raw entry that was dropped from a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedReport {
    /// Position in the raw batch.
    pub index: usize,
    /// Why it was dropped.
    pub error: NormalizeError,
    /// The raw entry.
    pub raw: Value,
}

/// Result of normalizing a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    /// Canonical commands in input order.
    pub commands: Vec<Command>,
    /// Dropped entries.
    pub malformed: Vec<MalformedReport>,
}

#[derive(Debug, Default)]
struct RawParts {
    action: Option<String>,
    key: Option<String>,
    value: Option<Value>,
}

type ShapeMatcher = fn(&Value) -> Option<RawParts>;

const SHAPES: &[(&str, ShapeMatcher)] = &[
    ("canonical", match_canonical),
    ("cmd+args", match_cmd_args),
    ("name+args", match_name_args),
    ("call-string", match_call_string),
];

fn str_field(map: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| map.get(*name))
        .find_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn key_field(map: &Map<String, Value>) -> Option<String> {
    str_field(map, &["key", "path"])
}

fn match_canonical(raw: &Value) -> Option<RawParts> {
    let map = raw.as_object()?;
    if !["action", "type", "command"]
        .iter()
        .any(|name| map.contains_key(*name))
    {
        return None;
    }
    Some(RawParts {
        action: str_field(map, &["action", "type", "command"]),
        key: key_field(map),
        value: map.get("value").cloned(),
    })
}

fn match_cmd_args(raw: &Value) -> Option<RawParts> {
    let map = raw.as_object()?;
    if !map.contains_key("cmd") {
        return None;
    }
    let args = map.get("args").or_else(|| map.get("arguments"));
    Some(parts_from_args(str_field(map, &["cmd"]), args, map))
}

fn match_name_args(raw: &Value) -> Option<RawParts> {
    let map = raw.as_object()?;
    if !map.contains_key("name") {
        return None;
    }
    let args = map.get("args").or_else(|| map.get("arguments"));
    if args.is_none() && !map.contains_key("value") {
        return None;
    }
    Some(parts_from_args(str_field(map, &["name"]), args, map))
}

fn match_call_string(raw: &Value) -> Option<RawParts> {
    let call = parse_call(raw.as_str()?)?;
    let action = Action::parse(&call.name);
    Some(parts_from_array(Some(call.name), &call.args, &action))
}

fn parts_from_args(
    action: Option<String>,
    args: Option<&Value>,
    outer: &Map<String, Value>,
) -> RawParts {
    let parsed_action = action.as_deref().map(Action::parse);
    let mut parts = match (args, &parsed_action) {
        (Some(Value::Array(items)), Some(a)) => parts_from_array(action.clone(), items, a),
        (Some(Value::Object(obj)), Some(a)) => {
            if let Some(key) = key_field(obj) {
                RawParts {
                    action: action.clone(),
                    key: Some(key),
                    value: obj.get("value").cloned(),
                }
            } else if a.is_path_action() {
                RawParts {
                    action: action.clone(),
                    key: None,
                    value: obj.get("value").cloned(),
                }
            } else {
                RawParts {
                    action: action.clone(),
                    key: None,
                    value: Some(Value::Object(obj.clone())),
                }
            }
        }
        (Some(Value::String(text)), Some(a)) => parts_from_arg_string(action.clone(), text, a),
        (Some(other), _) => RawParts {
            action: action.clone(),
            key: None,
            value: Some(other.clone()),
        },
        (None, _) => RawParts {
            action: action.clone(),
            key: None,
            value: None,
        },
    };
    if parts.key.is_none() {
        parts.key = key_field(outer);
    }
    if parts.value.is_none() {
        parts.value = outer.get("value").cloned();
    }
    parts
}

fn parts_from_array(action: Option<String>, items: &[Value], parsed: &Action) -> RawParts {
    if parsed.is_path_action() {
        RawParts {
            action,
            key: items.first().and_then(Value::as_str).map(str::to_owned),
            value: items.get(1).cloned(),
        }
    } else {
        RawParts {
            action,
            key: None,
            value: items.first().cloned(),
        }
    }
}

fn parts_from_arg_string(action: Option<String>, text: &str, parsed: &Action) -> RawParts {
    if let Some(call) = parse_call(text) {
        let action = action.or(Some(call.name));
        return parts_from_array(action, &call.args, parsed);
    }
    if let Some(args) = parse_arg_list(text) {
        return parts_from_array(action, &args, parsed);
    }
    if let Some(decoded) = decode_json_string(text) {
        return match decoded {
            Value::Array(items) => parts_from_array(action, &items, parsed),
            other => RawParts {
                action,
                key: None,
                value: Some(other),
            },
        };
    }
    if parsed.is_path_action() {
        RawParts {
            action,
            key: Some(text.trim().to_owned()),
            value: None,
        }
    } else {
        RawParts {
            action,
            key: None,
            value: Some(Value::String(text.to_owned())),
        }
    }
}

fn decode_json_string(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.starts_with(['{', '[']) {
        serde_json::from_str(trimmed).ok()
    } else {
        None
    }
}

fn finish(parts: RawParts, source: ServiceKey) -> Result<Command, NormalizeError> {
    let action = parts
        .action
        .map(|a| Action::parse(&a))
        .ok_or(NormalizeError::Malformed {
            missing: CommandField::Action,
        })?;
    if action.is_path_action() && parts.key.is_none() {
        return Err(NormalizeError::Malformed {
            missing: CommandField::Key,
        });
    }
    let mut value = parts.value.unwrap_or(Value::Null);
    if !action.is_path_action() {
        if let Some(decoded) = value.as_str().and_then(decode_json_string) {
            value = decoded;
        }
    }
    if action.requires_value() && value.is_null() {
        return Err(NormalizeError::Malformed {
            missing: CommandField::Value,
        });
    }
    Ok(Command {
        action,
        key: parts.key,
        value,
        source_service: source,
    })
}

/// Normalizes one raw command.
///
/// # Errors
///
/// Returns `NormalizeError::UnrecognizedShape` if no shape matches, or
/// `NormalizeError::Malformed` naming the missing part.
pub fn normalize(raw: &Value, source: ServiceKey) -> Result<Command, NormalizeError> {
    let parts = SHAPES
        .iter()
        .find_map(|(_, matcher)| matcher(raw))
        .ok_or(NormalizeError::UnrecognizedShape)?;
    finish(parts, source)
}

/// Normalizes a batch, dropping and logging entries that fail.
#[must_use]
pub fn normalize_batch(raws: &[Value], source: ServiceKey) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (index, raw) in raws.iter().enumerate() {
        match normalize(raw, source) {
            Ok(command) => batch.commands.push(command),
            Err(error) => {
                warn!(index, %error, service = %source, "dropping malformed command");
                batch.malformed.push(MalformedReport {
                    index,
                    error,
                    raw: raw.clone(),
                });
            }
        }
    }
    batch
}

/// Names of the shape matchers, in the order they are tried.
#[must_use]
pub fn shape_names() -> Vec<&'static str> {
    SHAPES.iter().map(|(name, _)| *name).collect()
}
