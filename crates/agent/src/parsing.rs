//! Deterministic readers for short user answers.
//!
//! Everything here runs before, and independently of, any model call.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use parley_core::domain::action::{FieldSpec, FieldType};

const QUANTITY_FIELD: &str = "quantity";

const AFFIRMATIVE: &[&str] = &[
    "yes",
    "y",
    "yeah",
    "yep",
    "sure",
    "ok",
    "okay",
    "confirm",
    "confirmed",
    "correct",
    "go ahead",
    "do it",
    "proceed",
    "create it",
];

const NEGATIVE: &[&str] = &["no", "n", "nope", "cancel", "stop", "abort", "don't", "do not"];

const CANCEL: &[&str] = &["cancel", "stop", "abort", "never mind", "nevermind", "quit"];

fn normalize(text: &str) -> String {
    text.trim().trim_end_matches(['.', '!', '?']).trim().to_lowercase()
}

pub fn is_affirmative(text: &str) -> bool {
    AFFIRMATIVE.contains(&normalize(text).as_str())
}

pub fn is_negative(text: &str) -> bool {
    NEGATIVE.contains(&normalize(text).as_str())
}

/// Whole-message requests to abandon the running workflow.
pub fn is_cancel(text: &str) -> bool {
    CANCEL.contains(&normalize(text).as_str())
}

/// Splits `"<items> for <name>"` at the last ` for `.
pub fn split_for_clause(text: &str) -> Option<(&str, &str)> {
    let lowered = text.to_ascii_lowercase();
    let index = lowered.rfind(" for ")?;
    let before = text[..index].trim();
    let after = text[index + " for ".len()..].trim().trim_end_matches(['.', '!', '?']).trim();
    (!before.is_empty() && !after.is_empty()).then_some((before, after))
}

/// Reads an item list such as `"Laptop x10, Mouse x2"` or `"3 x Desk and a
/// Monitor"`. Items without a quantity default to one.
pub fn parse_items(
    text: &str,
    identifier_field: &str,
    item_schema: &BTreeMap<String, FieldSpec>,
) -> Vec<Map<String, Value>> {
    let with_quantity = item_schema.is_empty() || item_schema.contains_key(QUANTITY_FIELD);
    let mut items = Vec::new();

    for chunk in split_chunks(text) {
        let Some((name, quantity)) = parse_item_chunk(&chunk) else {
            continue;
        };
        let mut item = Map::new();
        item.insert(identifier_field.to_string(), Value::from(name));
        if with_quantity {
            item.insert(QUANTITY_FIELD.to_string(), Value::from(quantity));
        }
        items.push(item);
    }
    items
}

fn split_chunks(text: &str) -> Vec<String> {
    text.split([',', ';', '\n'])
        .flat_map(|part| {
            let lowered = part.to_ascii_lowercase();
            let mut pieces = Vec::new();
            let mut start = 0;
            while let Some(offset) = lowered[start..].find(" and ") {
                pieces.push(part[start..start + offset].to_string());
                start += offset + " and ".len();
            }
            pieces.push(part[start..].to_string());
            pieces
        })
        .map(|chunk| chunk.trim().trim_end_matches(['.', '!', '?']).trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

fn parse_item_chunk(chunk: &str) -> Option<(String, i64)> {
    let mut tokens: Vec<&str> = chunk.split_whitespace().collect();
    if matches!(tokens.first().map(|t| t.to_ascii_lowercase()).as_deref(), Some("a" | "an")) {
        tokens.remove(0);
    }

    let (name_tokens, quantity) = match tokens.as_slice() {
        [] => return None,
        // "Laptop x 10"
        [name @ .., x, count] if is_times(x) && parse_count(count).is_some() => {
            (name.to_vec(), parse_count(count))
        }
        // "Laptop x10" / "Laptop 10x"
        [name @ .., last] if !name.is_empty() && parse_suffixed(last).is_some() => {
            (name.to_vec(), parse_suffixed(last))
        }
        // "3 x Desk"
        [count, x, name @ ..] if is_times(x) && parse_count(count).is_some() => {
            (name.to_vec(), parse_count(count))
        }
        // "3x Desk" / "3 Desks"
        [first, name @ ..]
            if !name.is_empty() && (parse_suffixed(first).or(parse_count(first))).is_some() =>
        {
            (name.to_vec(), parse_suffixed(first).or(parse_count(first)))
        }
        all => (all.to_vec(), Some(1)),
    };

    let name = name_tokens.join(" ");
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), quantity.unwrap_or(1)))
}

fn is_times(token: &str) -> bool {
    matches!(token, "x" | "X" | "×" | "*")
}

fn parse_count(token: &str) -> Option<i64> {
    token.parse::<i64>().ok().filter(|count| *count > 0)
}

fn parse_suffixed(token: &str) -> Option<i64> {
    let lowered = token.to_lowercase();
    let digits = lowered
        .strip_prefix('x')
        .or_else(|| lowered.strip_prefix('×'))
        .or_else(|| lowered.strip_suffix('x'))
        .or_else(|| lowered.strip_suffix('×'))?;
    parse_count(digits)
}

/// Converts a free-text answer into a value of the field's declared type.
pub fn coerce_answer(spec: &FieldSpec, text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match spec.field_type {
        FieldType::Integer => trimmed.replace(',', "").parse::<i64>().ok().map(Value::from),
        FieldType::Number => parse_number(trimmed),
        FieldType::Boolean => {
            if is_affirmative(trimmed) {
                Some(Value::Bool(true))
            } else if is_negative(trimmed) {
                Some(Value::Bool(false))
            } else {
                None
            }
        }
        FieldType::Array | FieldType::Object => None,
        FieldType::String | FieldType::Entity => Some(Value::from(trimmed)),
    }
}

fn parse_number(text: &str) -> Option<Value> {
    let cleaned = text.trim_start_matches('$').replace(',', "");
    let cleaned = cleaned.trim();
    if let Ok(integer) = cleaned.parse::<i64>() {
        return Some(Value::from(integer));
    }
    cleaned.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
}

/// Picks one of `candidates` (id, display name) from an answer: a 1-based
/// position first, then an exact id, then a unique exact name.
pub fn select_candidate(answer: &str, candidates: &[(i64, String)]) -> Option<usize> {
    let trimmed = answer.trim().trim_start_matches('#').trim();
    if let Ok(number) = trimmed.parse::<i64>() {
        if number >= 1 && (number as usize) <= candidates.len() {
            return Some(number as usize - 1);
        }
        return candidates.iter().position(|(id, _)| *id == number);
    }

    let mut matches = candidates
        .iter()
        .enumerate()
        .filter(|(_, (_, name))| name.eq_ignore_ascii_case(trimmed))
        .map(|(index, _)| index);
    match (matches.next(), matches.next()) {
        (Some(index), None) => Some(index),
        _ => None,
    }
}

/// Reads `set <field> to <value>`, `change <field> to <value>` and
/// `<field> = <value>` requests. The field comes back snake_cased.
pub fn parse_field_update(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim().trim_end_matches('.');
    let lowered = trimmed.to_ascii_lowercase();

    let (field, value) = if let Some(rest) =
        ["set ", "change ", "update "].iter().find_map(|verb| lowered.strip_prefix(verb))
    {
        let offset = trimmed.len() - rest.len();
        let split = rest.find(" to ")?;
        (&trimmed[offset..offset + split], &trimmed[offset + split + " to ".len()..])
    } else {
        trimmed.split_once('=')?
    };

    let field = field.trim().trim_start_matches("the ").trim();
    let value = value.trim();
    if field.is_empty() || value.is_empty() {
        return None;
    }
    let field = field.to_lowercase().split_whitespace().collect::<Vec<_>>().join("_");
    Some((field, value.to_string()))
}

/// Reads `remove <name>`, `drop <name>` and `delete <name>` requests.
pub fn parse_removal(text: &str) -> Option<String> {
    let trimmed = text.trim().trim_end_matches(['.', '!']);
    let lowered = trimmed.to_ascii_lowercase();
    let rest = ["remove ", "drop ", "delete ", "take out "]
        .iter()
        .find_map(|verb| lowered.strip_prefix(verb))?;
    let name = trimmed[trimmed.len() - rest.len()..].trim();
    let name = match name.get(..4) {
        Some(article) if article.eq_ignore_ascii_case("the ") => name[4..].trim(),
        _ => name,
    };
    (!name.is_empty()).then(|| name.to_string())
}
