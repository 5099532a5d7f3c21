//! Restricted call-string syntax: `set('character.hp', 10)`.
//!
//! Only a function name and a list of literal arguments are accepted.
//! Arguments are JSON literals, or single-quoted strings.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_\-]*)\s*\((.*)\)\s*;?\s*$").expect("valid regex")
});

/// A parsed call string.
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    /// Function name, used as the action.
    pub name: String,
    /// Decoded arguments.
    pub args: Vec<Value>,
}

/// Parses `name(arg, ...)`. Returns `None` when the text is not a call or
/// an argument is not a literal.
#[must_use]
pub fn parse_call(text: &str) -> Option<CallExpr> {
    let caps = CALL_RE.captures(text)?;
    let name = caps.get(1)?.as_str().to_owned();
    let body = caps.get(2)?.as_str();
    let args = split_args(body)?
        .into_iter()
        .map(|arg| parse_literal(&arg))
        .collect::<Option<Vec<_>>>()?;
    Some(CallExpr { name, args })
}

/// Parses the parenthesized argument list alone, e.g. `('path', 3)`.
#[must_use]
pub fn parse_arg_list(text: &str) -> Option<Vec<Value>> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix('(')?.strip_suffix(')')?;
    split_args(inner)?
        .into_iter()
        .map(|arg| parse_literal(&arg))
        .collect()
}

fn split_args(body: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in body.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            '[' | '{' | '(' => {
                depth += 1;
                current.push(ch);
            }
            ']' | '}' | ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
                current.push(ch);
            }
            ',' if depth == 0 => args.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if quote.is_some() || depth != 0 {
        return None;
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current);
    }
    Some(args)
}

fn parse_literal(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return Some(Value::String(unescape_single(inner)));
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    // Objects and arrays written with single quotes.
    if trimmed.starts_with(['{', '[']) {
        return serde_json::from_str(&trimmed.replace('\'', "\"")).ok();
    }
    None
}

fn unescape_single(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}
