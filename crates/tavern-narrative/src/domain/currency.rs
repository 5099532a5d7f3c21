//! Currency amounts in free text.
//!
//! An amount is an arabic or CJK numeral immediately followed by a
//! currency word (`valis`, `法利`, ...).

use std::sync::LazyLock;

use regex::Regex;

const CURRENCY_SUFFIX: &str = r"(?:法利|法莉|瓦利斯|瓦利|valis)";

static ARABIC_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)([+-]?[0-9]+(?:\.[0-9]+)?)\s*{CURRENCY_SUFFIX}"))
        .expect("valid regex")
});

static CJK_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)([正负負]?[零〇一二三四五六七八九十百千万萬亿億两兩壹贰貳叁參肆伍陆陸柒捌玖拾佰仟]+)\s*{CURRENCY_SUFFIX}"
    ))
    .expect("valid regex")
});

/// An amount found in text.
#[derive(Debug, Clone, PartialEq)]
pub struct AmountMatch {
    /// Signed amount.
    pub amount: f64,
    /// Byte offset of the match.
    pub start: usize,
    /// Byte offset just past the match.
    pub end: usize,
}

fn cjk_digit(c: char) -> Option<f64> {
    let digit = match c {
        '零' | '〇' => 0.0,
        '一' | '壹' => 1.0,
        '二' | '贰' | '貳' | '两' | '兩' => 2.0,
        '三' | '叁' | '參' => 3.0,
        '四' | '肆' => 4.0,
        '五' | '伍' => 5.0,
        '六' | '陆' | '陸' => 6.0,
        '七' | '柒' => 7.0,
        '八' | '捌' => 8.0,
        '九' | '玖' => 9.0,
        _ => return None,
    };
    Some(digit)
}

fn cjk_small_unit(c: char) -> Option<f64> {
    match c {
        '十' | '拾' => Some(10.0),
        '百' | '佰' => Some(100.0),
        '千' | '仟' => Some(1000.0),
        _ => None,
    }
}

fn cjk_large_unit(c: char) -> Option<f64> {
    match c {
        '万' | '萬' => Some(10_000.0),
        '亿' | '億' => Some(100_000_000.0),
        _ => None,
    }
}

fn or_one(value: f64) -> f64 {
    if value.abs() < f64::EPSILON { 1.0 } else { value }
}

/// Parses a CJK numeral such as `三百`, `两千五百` or `负十`.
#[must_use]
pub fn parse_cjk_amount(raw: &str) -> Option<f64> {
    let text = raw.trim();
    let (sign, body) = if let Some(rest) = text.strip_prefix(['负', '負']) {
        (-1.0, rest)
    } else {
        (1.0, text.strip_prefix('正').unwrap_or(text))
    };
    if body.is_empty() {
        return None;
    }
    let mut total = 0.0;
    let mut section = 0.0;
    let mut digit = 0.0;
    for c in body.chars() {
        if let Some(d) = cjk_digit(c) {
            digit = d;
        } else if let Some(unit) = cjk_small_unit(c) {
            section += or_one(digit) * unit;
            digit = 0.0;
        } else if let Some(unit) = cjk_large_unit(c) {
            section += digit;
            total += or_one(section) * unit;
            section = 0.0;
            digit = 0.0;
        } else {
            return None;
        }
    }
    let value = (total + section + digit) * sign;
    value.is_finite().then_some(value)
}

/// Finds every non-zero currency amount, ordered by position.
#[must_use]
pub fn extract_amounts(text: &str) -> Vec<AmountMatch> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut matches = Vec::new();
    for caps in ARABIC_AMOUNT.captures_iter(text) {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if let Ok(amount) = number.as_str().parse::<f64>() {
            matches.push(AmountMatch {
                amount,
                start: whole.start(),
                end: whole.end(),
            });
        }
    }
    for caps in CJK_AMOUNT.captures_iter(text) {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if let Some(amount) = parse_cjk_amount(number.as_str()) {
            matches.push(AmountMatch {
                amount,
                start: whole.start(),
                end: whole.end(),
            });
        }
    }
    matches.retain(|m| m.amount.is_finite() && m.amount.abs() >= f64::EPSILON);
    matches.sort_by_key(|m| m.start);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cjk_amounts() {
        assert_eq!(parse_cjk_amount("三百"), Some(300.0));
        assert_eq!(parse_cjk_amount("两千五百"), Some(2500.0));
        assert_eq!(parse_cjk_amount("十五"), Some(15.0));
        assert_eq!(parse_cjk_amount("一万二千"), Some(12_000.0));
        assert_eq!(parse_cjk_amount("负五十"), Some(-50.0));
        assert_eq!(parse_cjk_amount("负"), None);
    }

    #[test]
    fn test_extract_amounts_orders_mixed_numerals() {
        // Arrange
        let text = "He paid 三百法利 for the sword and 12.5 Valis for bread.";

        // Act
        let amounts: Vec<f64> = extract_amounts(text).iter().map(|m| m.amount).collect();

        // Assert
        assert_eq!(amounts, vec![300.0, 12.5]);
    }

    #[test]
    fn test_extract_amounts_ignores_bare_numbers_and_zero() {
        let amounts = extract_amounts("Floor 12, 0 valis left, 3 goblins.");

        assert!(amounts.is_empty());
    }

    #[test]
    fn test_match_span_covers_suffix() {
        let text = "cost: 40 valis";

        let found = extract_amounts(text);

        assert_eq!(&text[found[0].start..found[0].end], "40 valis");
    }
}
