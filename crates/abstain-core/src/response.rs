//! Answer extraction from free-form model replies.
//!
//! Parsing never fails: a reply without a usable answer becomes
//! [`ParsedAnswer::Unparsed`] or [`ParsedAnswer::Ambiguous`] so the session
//! can grade it under an explicit policy instead of aborting.

use crate::model::{Choice, MatchRule, ParsedAnswer, Question, UnparsedReason};

/// Marker that introduces the final answer line.
pub const ANSWER_MARKER: &str = "answer:";

/// Values that mean the model abstained. Compared case-insensitively.
const BLANK_TOKENS: &[&str] = &["", "blank", "unknown", "i don't know", "i don\u{2019}t know"];

/// Extract a normalized answer from a raw reply.
///
/// Uses the last `Answer:` marker in the text (models often reason first and
/// may restate the marker). Parsing the same text twice gives the same result.
pub fn parse(raw: &str, question: &Question) -> ParsedAnswer {
    let Some(value) = last_marker_value(raw, ANSWER_MARKER) else {
        return ParsedAnswer::Unparsed {
            reason: UnparsedReason::MissingMarker,
        };
    };

    if is_blank_token(value) {
        return ParsedAnswer::Blank;
    }

    if question.is_multiple_choice() {
        return match_choice(value, &question.choices);
    }

    if question.match_rule == MatchRule::Numeric && parse_number(value).is_none() {
        return ParsedAnswer::Unparsed {
            reason: UnparsedReason::UnparseableValue {
                value: value.to_string(),
            },
        };
    }

    ParsedAnswer::value(value)
}

/// Return the rest of the line following the last case-insensitive
/// occurrence of `marker`, trimmed of whitespace.
///
/// When the marker is wrapped in emphasis (`**Answer:** X` or
/// `**Answer: X**`) the matching closing run is removed; asterisks that are
/// part of the value itself are kept. `marker` must be ASCII.
pub fn last_marker_value<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    // ASCII lowercasing keeps byte offsets aligned with the original text.
    let lowered = text.to_ascii_lowercase();
    let needle = marker.to_ascii_lowercase();
    let found = lowered.rfind(&needle)?;
    let line = text[found + needle.len()..]
        .split('\n')
        .next()
        .unwrap_or_default()
        .trim();

    let before = &text[..found];
    let opening = &before[before.trim_end_matches('*').len()..];
    if opening.is_empty() {
        return Some(line);
    }
    let value = line
        .strip_prefix(opening)
        .or_else(|| line.strip_suffix(opening))
        .unwrap_or(line);
    Some(value.trim())
}

/// True if `value` is one of the abstention tokens.
pub fn is_blank_token(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    BLANK_TOKENS.contains(&lowered.as_str())
}

/// Parse a numeric answer, tolerating thousands separators, a trailing period
/// and trailing units ("42 moons").
pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .trim_end_matches('.')
        .chars()
        .filter(|c| *c != ',' && *c != '_')
        .collect();

    let parsed = cleaned.parse::<f64>().ok().or_else(|| {
        cleaned
            .split_whitespace()
            .next()
            .and_then(|token| token.parse::<f64>().ok())
    })?;

    parsed.is_finite().then_some(parsed)
}

fn match_choice(value: &str, choices: &[Choice]) -> ParsedAnswer {
    let cleaned = value
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']', '.'])
        .trim();

    let matched: Vec<&Choice> = choices
        .iter()
        .filter(|choice| choice_matches(choice, value, cleaned))
        .collect();

    match matched.as_slice() {
        [only] => ParsedAnswer::value(only.label.clone()),
        _ => ParsedAnswer::Ambiguous {
            value: value.to_string(),
        },
    }
}

fn choice_matches(choice: &Choice, raw: &str, cleaned: &str) -> bool {
    let label = choice.label.trim();
    let text = choice.text.trim();

    if cleaned.eq_ignore_ascii_case(label)
        || raw.eq_ignore_ascii_case(text)
        || cleaned.eq_ignore_ascii_case(text)
    {
        return true;
    }

    // Leading label: "B) Jupiter", "B. Jupiter", "B: Jupiter", "B Jupiter".
    let Some(rest) = strip_prefix_ignore_case(cleaned, label) else {
        return false;
    };
    match rest.chars().next() {
        Some(')' | '.' | ':' | ']') => true,
        Some(c) if c.is_whitespace() => rest.trim().eq_ignore_ascii_case(text),
        _ => false,
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &s[prefix.len()..])
}
