//! Command extraction from raw service text.
//!
//! Services answer with JSON that is often wrapped in prose, code fences,
//! chat-completion envelopes or SSE streams, and sometimes subtly broken.
//! Extraction tries the cheap interpretations first and falls back to
//! textual repairs, recording every repair it had to make.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tavern_core::error::DomainError;
use tavern_core::service::ServiceResponse;
use thiserror::Error;
use tracing::debug;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:[A-Za-z0-9_-]+)?\s*(.*?)```").expect("valid regex"));
static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid regex"));

const COMMAND_KEYS: &[&str] = &["tavern_commands", "tavernCommands", "commands"];

/// Extraction failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// The text was empty.
    #[error("empty response")]
    Empty,
    /// No interpretation produced a command array.
    #[error("no command array found: {0}")]
    NoCommands(String),
}

impl From<ExtractError> for DomainError {
    fn from(err: ExtractError) -> Self {
        Self::MalformedPayload {
            action: "response".to_owned(),
            detail: err.to_string(),
        }
    }
}

/// Commands pulled out of a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    /// Raw command values, not yet normalized.
    pub commands: Vec<Value>,
    /// The parsed top-level object, when there was one.
    pub document: Option<Value>,
    /// Repairs applied, in order.
    pub repairs: Vec<String>,
}

impl Extracted {
    /// Repairs joined into one human-readable note.
    #[must_use]
    pub fn repair_note(&self) -> Option<String> {
        (!self.repairs.is_empty()).then(|| self.repairs.join(" | "))
    }
}

/// Text blocks enclosed in code fences.
#[must_use]
pub fn fenced_blocks(text: &str) -> Vec<&str> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Scans for a balanced region starting at byte `start`, honoring strings.
fn balanced_from(text: &str, start: usize, open: char, close: char) -> Option<&str> {
    let mut depth = 0_i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if !in_string && c == open => depth += 1,
            c if !in_string && c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// The first balanced `{...}` object in the text.
#[must_use]
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    balanced_from(text, start, '{', '}')
}

/// Locates `"<key>": [...]` and returns the balanced array text.
#[must_use]
pub fn balanced_array_by_key<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let token = format!("\"{key}\"");
    let mut search_from = 0;
    while let Some(found) = text[search_from..].find(&token) {
        let key_index = search_from + found;
        let after_key = &text[key_index + token.len()..];
        let trimmed = after_key.trim_start();
        if let Some(rest) = trimmed.strip_prefix(':') {
            let value = rest.trim_start();
            if value.starts_with('[') {
                let start = text.len() - value.len();
                return balanced_from(text, start, '[', ']');
            }
        }
        search_from = key_index + 1;
    }
    None
}

/// Removes commas directly before a closing brace or bracket.
#[must_use]
pub fn remove_trailing_commas(text: &str) -> Option<String> {
    let repaired = TRAILING_COMMA_RE.replace_all(text, "$1");
    (repaired != text).then(|| repaired.into_owned())
}

/// Escapes raw control characters that appear inside string literals.
#[must_use]
pub fn escape_control_chars_in_strings(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;
    for ch in text.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                out.push(ch);
                escaped = in_string;
            }
            '"' => {
                out.push(ch);
                in_string = !in_string;
            }
            '\n' if in_string => {
                out.push_str("\\n");
                changed = true;
            }
            '\r' if in_string => {
                out.push_str("\\r");
                changed = true;
            }
            '\t' if in_string => {
                out.push_str("\\t");
                changed = true;
            }
            c if in_string && u32::from(c) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", u32::from(c)));
                changed = true;
            }
            c => out.push(c),
        }
    }
    changed.then_some(out)
}

/// Appends the closers for any braces or brackets left open.
#[must_use]
pub fn balance_brackets(text: &str) -> Option<String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    if stack.is_empty() {
        return None;
    }
    let mut out = text.to_owned();
    if in_string {
        out.push('"');
    }
    out.extend(stack.iter().rev());
    Some(out)
}

fn commands_in(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::Object(map) => COMMAND_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .cloned(),
        _ => None,
    }
}

/// Parses a response document, repairing it if needed. Returns the value
/// and the repairs applied.
fn parse_document(text: &str) -> Option<(Value, Vec<String>)> {
    let cleaned = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return Some((value, Vec::new()));
    }
    let first_object = first_json_object(cleaned);
    if let Some(object) = first_object.filter(|o| *o != cleaned) {
        if let Ok(value) = serde_json::from_str(object) {
            return Some((value, vec!["stripped text outside JSON".to_owned()]));
        }
    }
    for (i, block) in fenced_blocks(cleaned).into_iter().enumerate() {
        if let Ok(value) = serde_json::from_str(block) {
            let note = if i == 0 {
                "removed code fence".to_owned()
            } else {
                format!("removed code fence (block {})", i + 1)
            };
            return Some((value, vec![note]));
        }
    }

    let base = fenced_blocks(cleaned)
        .into_iter()
        .next()
        .or(first_object)
        .unwrap_or(cleaned);
    let mut repairs = Vec::new();
    let mut repaired = base.trim().to_owned();
    if let Some(fixed) = remove_trailing_commas(&repaired) {
        repaired = fixed;
        repairs.push("removed trailing commas".to_owned());
    }
    if let Some(fixed) = escape_control_chars_in_strings(&repaired) {
        repaired = fixed;
        repairs.push("escaped control characters in strings".to_owned());
    }
    if let Some(fixed) = balance_brackets(&repaired) {
        repaired = fixed;
        repairs.push("balanced missing braces".to_owned());
    }
    let value = serde_json::from_str(&repaired).ok()?;
    if repairs.is_empty() {
        repairs.push("repaired JSON structure".to_owned());
    }
    Some((value, repairs))
}

fn envelope_content(value: &Value) -> Option<&str> {
    [
        value.pointer("/choices/0/message/content"),
        value.pointer("/choices/0/delta/content"),
        value.pointer("/response/output_text"),
        value.pointer("/output_text"),
        value.pointer("/output/0/content/0/text"),
    ]
    .into_iter()
    .flatten()
    .find_map(Value::as_str)
    .filter(|s| !s.trim().is_empty())
}

fn sse_text(raw: &str) -> Option<String> {
    if !raw.contains("data:") {
        return None;
    }
    let mut full = String::new();
    for line in raw.lines().map(str::trim) {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            continue;
        };
        if data.is_empty() || data.eq_ignore_ascii_case("[done]") {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        if let Some(delta) = chunk
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            full.push_str(delta);
        } else if let Some(message) = chunk
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
        {
            if full.is_empty() {
                full.push_str(message);
            }
        }
    }
    (!full.trim().is_empty()).then_some(full)
}

/// Extracts raw commands from service text.
///
/// # Errors
///
/// Returns `ExtractError::Empty` for blank input and
/// `ExtractError::NoCommands` when no interpretation yields a command array.
pub fn extract_commands(raw: &str) -> Result<Extracted, ExtractError> {
    if raw.trim().is_empty() {
        return Err(ExtractError::Empty);
    }

    if raw.trim_start().starts_with("data:") {
        if let Some(text) = sse_text(raw) {
            if let Some((inner, mut repairs)) = parse_document(&text) {
                if let Some(commands) = commands_in(&inner) {
                    repairs.push("SSE payload extraction".to_owned());
                    return Ok(Extracted {
                        commands,
                        document: Some(inner),
                        repairs,
                    });
                }
            }
        }
    }

    let parsed = parse_document(raw);
    if let Some((document, repairs)) = &parsed {
        if let Some(commands) = commands_in(document) {
            return Ok(Extracted {
                commands,
                document: Some(document.clone()),
                repairs: repairs.clone(),
            });
        }
        if let Some(content) = envelope_content(document) {
            if let Some((inner, mut inner_repairs)) = parse_document(content) {
                if let Some(commands) = commands_in(&inner) {
                    let mut all = repairs.clone();
                    all.append(&mut inner_repairs);
                    all.push("envelope content extraction".to_owned());
                    return Ok(Extracted {
                        commands,
                        document: Some(inner),
                        repairs: all,
                    });
                }
            }
        }
    }

    for key in COMMAND_KEYS {
        if let Some(array) = balanced_array_by_key(raw, key) {
            if let Ok(Value::Array(commands)) = serde_json::from_str::<Value>(array) {
                debug!(key, "recovered command array by balanced scan");
                return Ok(Extracted {
                    commands,
                    document: parsed.map(|(document, _)| document),
                    repairs: vec![format!("balanced {key} extraction")],
                });
            }
        }
    }

    match parsed {
        Some((document, repairs)) => Ok(Extracted {
            commands: Vec::new(),
            document: Some(document),
            repairs,
        }),
        None => Err(ExtractError::NoCommands(
            raw.chars().take(80).collect::<String>(),
        )),
    }
}

/// Raw commands of a service response and the repair note that goes with
/// them. Commands the service already split out are used as-is; otherwise
/// they are extracted from the raw text.
///
/// # Errors
///
/// Returns `ExtractError` when neither source yields commands and the raw
/// text is not a JSON document.
pub fn response_commands(
    response: &ServiceResponse,
) -> Result<(Vec<Value>, Option<String>), ExtractError> {
    if !response.commands.is_empty() || response.raw_text.trim().is_empty() {
        return Ok((response.commands.clone(), response.repair_note.clone()));
    }
    let extracted = extract_commands(&response.raw_text)?;
    let note = match (response.repair_note.as_deref(), extracted.repair_note()) {
        (Some(upstream), Some(local)) => Some(format!("{upstream} | {local}")),
        (upstream, local) => local.or_else(|| upstream.map(str::to_owned)),
    };
    Ok((extracted.commands, note))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_document() {
        let extracted =
            extract_commands(r#"{"tavern_commands": [{"action": "set", "key": "weather", "value": "rain"}]}"#)
                .unwrap();

        assert_eq!(extracted.commands.len(), 1);
        assert_eq!(extracted.repair_note(), None);
    }

    #[test]
    fn test_prose_around_json_is_stripped() {
        let extracted =
            extract_commands("Sure! Here you go: {\"commands\": []} Let me know.").unwrap();

        assert!(extracted.commands.is_empty());
        assert_eq!(
            extracted.repair_note().as_deref(),
            Some("stripped text outside JSON")
        );
    }

    #[test]
    fn test_fenced_block_with_trailing_comma_is_repaired() {
        // Arrange
        let raw = "```json\n{\"tavern_commands\": [{\"action\": \"set\", \"key\": \"weather\", \"value\": \"fog\"},]}\n```";

        // Act
        let extracted = extract_commands(raw).unwrap();

        // Assert
        assert_eq!(extracted.commands[0]["value"], json!("fog"));
        assert_eq!(
            extracted.repair_note().as_deref(),
            Some("removed trailing commas")
        );
    }

    #[test]
    fn test_multiple_repairs_are_joined_with_pipes() {
        // Arrange
        let raw = "{\"tavern_commands\": [{\"action\": \"set\", \"key\": \"location\", \"value\": \"line\nbreak\"},]";

        // Act
        let extracted = extract_commands(raw).unwrap();

        // Assert
        assert_eq!(extracted.commands[0]["value"], json!("line\nbreak"));
        assert_eq!(
            extracted.repair_note().as_deref(),
            Some("removed trailing commas | escaped control characters in strings | balanced missing braces")
        );
    }

    #[test]
    fn test_chat_envelope_content() {
        let envelope = json!({
            "choices": [{ "message": { "content": "{\"tavern_commands\": [{\"action\": \"add\", \"key\": \"character.hp\", \"value\": 5}]}" } }]
        });

        let extracted = extract_commands(&envelope.to_string()).unwrap();

        assert_eq!(extracted.commands.len(), 1);
        assert_eq!(
            extracted.repair_note().as_deref(),
            Some("envelope content extraction")
        );
    }

    #[test]
    fn test_sse_stream_is_reassembled() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"tavern_commands\\\": [\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"action\\\":\\\"set\\\",\\\"key\\\":\\\"weather\\\",\\\"value\\\":\\\"sun\\\"}]}\"}}]}\n",
            "data: [DONE]\n"
        );

        let extracted = extract_commands(raw).unwrap();

        assert_eq!(extracted.commands[0]["value"], json!("sun"));
        assert_eq!(extracted.repair_note().as_deref(), Some("SSE payload extraction"));
    }

    #[test]
    fn test_balanced_array_scan_recovers_commands_from_broken_document() {
        let raw = "noise {\"narrative\": \"x\" \"tavern_commands\": [{\"action\": \"set\", \"key\": \"weather\", \"value\": \"snow\"}] trailing";

        let extracted = extract_commands(raw).unwrap();

        assert_eq!(extracted.commands.len(), 1);
        assert_eq!(
            extracted.repair_note().as_deref(),
            Some("balanced tavern_commands extraction")
        );
    }

    #[test]
    fn test_empty_and_hopeless_input() {
        assert_eq!(extract_commands("   "), Err(ExtractError::Empty));
        assert!(matches!(
            extract_commands("no json here"),
            Err(ExtractError::NoCommands(_))
        ));
    }

    #[test]
    fn test_balance_brackets_closes_in_reverse_order() {
        assert_eq!(balance_brackets("{\"a\": [1, {\"b\": 2").as_deref(), Some("{\"a\": [1, {\"b\": 2}]}"));
        assert_eq!(balance_brackets("{}"), None);
    }

    #[test]
    fn test_response_commands_prefers_split_commands() {
        let response = ServiceResponse {
            commands: vec![json!({ "action": "set", "key": "weather", "value": "rain" })],
            raw_text: "ignored".to_owned(),
            repair_note: None,
        };

        let (commands, note) = response_commands(&response).unwrap();

        assert_eq!(commands.len(), 1);
        assert_eq!(note, None);
    }

    #[test]
    fn test_response_commands_extracts_from_raw_text() {
        // Arrange
        let response = ServiceResponse {
            commands: Vec::new(),
            raw_text: "```json\n{\"tavern_commands\": [{\"action\": \"add\", \"key\": \"character.hp\", \"value\": 5},]}\n```".to_owned(),
            repair_note: Some("upstream retry".to_owned()),
        };

        // Act
        let (commands, note) = response_commands(&response).unwrap();

        // Assert
        assert_eq!(commands.len(), 1);
        let note = note.unwrap();
        assert!(note.starts_with("upstream retry | "));
        assert!(note.contains("trailing comma"));
    }
}
