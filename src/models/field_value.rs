use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Typed value of an extracted field.
///
/// Always an explicit tagged union, never a free-form map: serialization is
/// `{"kind": "number", "value": 1250.0}` so downstream consumers can dispatch
/// without sniffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Boolean(bool),
    Array(Vec<FieldValue>),
    /// Rows of cells, all the same width is not enforced.
    Table(Vec<Vec<FieldValue>>),
    Object(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Number(_) => "number",
            Self::Date(_) => "date",
            Self::Boolean(_) => "boolean",
            Self::Array(_) => "array",
            Self::Table(_) => "table",
            Self::Object(_) => "object",
        }
    }

    /// Numeric view, if this value carries one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => parse_amount(s),
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
            _ => None,
        }
    }

    /// Flat text rendering used for citation matching and full-text indexing.
    pub fn display_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Array(items) => items
                .iter()
                .map(FieldValue::display_text)
                .collect::<Vec<_>>()
                .join(", "),
            Self::Table(rows) => rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(FieldValue::display_text)
                        .collect::<Vec<_>>()
                        .join(" | ")
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Object(map) => map
                .iter()
                .map(|(k, v)| format!("{k}: {}", v.display_text()))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Parse a human-formatted amount ("$1,250.00", "1 250,00" is not supported)
/// into a number. Currency symbols and thousands separators are stripped.
pub fn parse_amount(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}
