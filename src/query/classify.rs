//! Query classification — keyword heuristics producing a QueryPlan.
//!
//! Extracts candidate target fields (canonical aliases + search hints),
//! filter predicates (numeric comparisons, date ranges, explicit
//! `field=value` pairs), an aggregation spec when one is recognizable, and a
//! parse confidence the router uses to decide direct execution vs LLM
//! refinement.

use chrono::NaiveDate;
use regex::Regex;

use super::types::{QueryIntent, QueryPlan, RouteState};
use crate::aggregation::{AggSpec, CalendarInterval};
use crate::backend::{FilterClause, FilterOp, Predicate};
use crate::models::{parse_amount, FieldKind, FieldValue, TemplateSchema};

/// Words that end a field-name phrase after an aggregation keyword.
const PHRASE_STOPS: &[&str] = &[
    "for", "where", "with", "by", "per", "in", "on", "since", "over", "under",
    "above", "below", "across", "from", "between", "during", "and", "or",
];

/// Canonical category used when a numeric comparison names no field.
const DEFAULT_NUMERIC_CATEGORY: &str = "amount";

/// Normalize a query for classification and cache keying: lowercase,
/// collapsed whitespace, no trailing punctuation.
pub fn normalize_query(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['?', '!', '.'])
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classify a query against every known template.
pub fn classify(raw: &str, schemas: &[TemplateSchema]) -> QueryPlan {
    let normalized = normalize_query(raw);
    let words: Vec<&str> = normalized.split_whitespace().collect();

    let not_extracted = schemas.iter().any(|s| {
        s.not_extracted_terms
            .iter()
            .any(|t| !t.is_empty() && normalized.contains(&t.to_lowercase()))
    });

    let mut target_fields: Vec<String> = Vec::new();
    let mut unresolved = 0usize;

    // Aggregation first: its metric field anchors numeric comparisons
    let (aggregation, metric_fields, ambiguous_metric) =
        detect_aggregation(&normalized, &words, schemas, &mut unresolved);
    target_fields.extend(metric_fields.iter().cloned());

    let mut clauses: Vec<FilterClause> = Vec::new();
    extract_equality_clauses(&normalized, schemas, &mut clauses, &mut unresolved);
    extract_numeric_clauses(
        &normalized,
        schemas,
        &metric_fields,
        &mut clauses,
        &mut unresolved,
    );
    extract_date_clauses(&normalized, schemas, &mut clauses, &mut unresolved);

    for clause in &clauses {
        target_fields.extend(clause.fields.iter().cloned());
    }
    target_fields.extend(resolve_ngrams(&words, schemas));
    target_fields.sort();
    target_fields.dedup();

    let intent = match (&aggregation, clauses.is_empty()) {
        (Some(_), false) => QueryIntent::Hybrid,
        (Some(_), true) => QueryIntent::Aggregation,
        (None, _) => QueryIntent::Filter,
    };

    // Full-text fallback when nothing structured came out of the query
    let full_text = if target_fields.is_empty() && clauses.is_empty() && aggregation.is_none() {
        Some(normalized.clone())
    } else {
        None
    };

    let structured = aggregation.is_some() || !clauses.is_empty();
    let mut parse_confidence: f32 = 0.2;
    if structured {
        parse_confidence += 0.3;
    }
    if !target_fields.is_empty() {
        parse_confidence += 0.3;
    }
    if structured && unresolved == 0 && !ambiguous_metric {
        parse_confidence += 0.2;
    }
    if ambiguous_metric {
        parse_confidence -= 0.3;
    }
    if not_extracted {
        parse_confidence = 1.0;
    }
    let parse_confidence = parse_confidence.clamp(0.0, 1.0);

    QueryPlan {
        raw_query: raw.to_string(),
        normalized_query: normalized,
        intent,
        target_fields,
        predicate: Predicate { clauses, full_text },
        aggregation,
        parse_confidence,
        used_llm_refine: false,
        not_extracted,
        state: RouteState::Received,
    }
}

/// Union of `resolve_term` across every template, sorted for determinism.
fn resolve_across(schemas: &[TemplateSchema], term: &str) -> Vec<String> {
    let mut fields: Vec<String> = schemas
        .iter()
        .flat_map(|s| s.resolve_term(term))
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

fn field_kind(schemas: &[TemplateSchema], name: &str) -> Option<FieldKind> {
    schemas.iter().find_map(|s| s.field(name).map(|f| f.kind))
}

fn fields_of_kind(schemas: &[TemplateSchema], fields: &[String], kind: FieldKind) -> Vec<String> {
    fields
        .iter()
        .filter(|f| field_kind(schemas, f) == Some(kind))
        .cloned()
        .collect()
}

/// All date-kind fields across templates (for bare "since 2024" ranges).
fn all_date_fields(schemas: &[TemplateSchema]) -> Vec<String> {
    let mut fields: Vec<String> = schemas
        .iter()
        .flat_map(|s| s.fields.iter())
        .filter(|f| f.kind == FieldKind::Date)
        .map(|f| f.name.clone())
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

enum MetricKind {
    Sum,
    Avg,
    Min,
    Max,
    Percentile(f64),
}

fn metric_keyword(word: &str) -> Option<MetricKind> {
    match word {
        "sum" | "total" => Some(MetricKind::Sum),
        "average" | "avg" | "mean" => Some(MetricKind::Avg),
        "minimum" | "lowest" | "min" | "smallest" => Some(MetricKind::Min),
        "maximum" | "highest" | "max" | "largest" => Some(MetricKind::Max),
        "median" => Some(MetricKind::Percentile(50.0)),
        _ => None,
    }
}

/// Detect an aggregation request. Returns the spec, the concrete fields the
/// metric resolved to (for ranking), and whether the metric term was
/// ambiguous across several concrete fields.
fn detect_aggregation(
    normalized: &str,
    words: &[&str],
    schemas: &[TemplateSchema],
    unresolved: &mut usize,
) -> (Option<AggSpec>, Vec<String>, bool) {
    let count_requested = normalized.contains("how many")
        || normalized.contains("number of")
        || words.contains(&"count");

    let percentile_re = Regex::new(r"\b(\d{1,3})(?:th|st|nd|rd) percentile\b").unwrap();
    let explicit_percentile = percentile_re
        .captures(normalized)
        .and_then(|c| c[1].parse::<f64>().ok());

    let mut metric: Option<MetricKind> = None;
    let mut metric_fields: Vec<String> = Vec::new();
    let mut ambiguous = false;

    for (i, word) in words.iter().enumerate() {
        let kind = match (metric_keyword(word), explicit_percentile) {
            (Some(k), _) => Some(k),
            (None, Some(p)) if *word == "percentile" => Some(MetricKind::Percentile(p)),
            _ => None,
        };
        let Some(kind) = kind else { continue };

        let mut fields = resolve_phrase_after(words, i + 1, schemas);
        if fields.is_empty() {
            // "total for acme" — the keyword itself may be a search hint
            fields = resolve_across(schemas, word);
        }

        if fields.is_empty() {
            *unresolved += 1;
            continue;
        }
        ambiguous = fields.len() > 1;
        metric = Some(kind);
        metric_fields = fields;
        break;
    }

    let bucket = detect_bucketing(normalized, words, schemas);

    let spec = match (metric, metric_fields.first(), bucket, count_requested) {
        // Metric with a group-by bucket
        (Some(kind), Some(field), Some(Bucketing::Terms(group_field)), _) => {
            Some(AggSpec::GroupBy {
                group_field,
                inner: Box::new(metric_spec(kind, field.clone())),
            })
        }
        (Some(kind), Some(field), None, _) => Some(metric_spec(kind, field.clone())),
        // A metric per calendar bucket is not expressible; the histogram
        // wins over a silently wrong number.
        (_, _, Some(Bucketing::Date(interval, date_field)), _) => {
            Some(AggSpec::DateHistogram { field: date_field, interval })
        }
        (None, _, Some(Bucketing::Terms(field)), true) => Some(AggSpec::Terms { field }),
        (None, _, _, true) => Some(AggSpec::Count),
        _ => None,
    };

    (spec, metric_fields, ambiguous)
}

fn metric_spec(kind: MetricKind, field: String) -> AggSpec {
    match kind {
        MetricKind::Sum => AggSpec::Sum { field },
        MetricKind::Avg => AggSpec::Avg { field },
        MetricKind::Min => AggSpec::Min { field },
        MetricKind::Max => AggSpec::Max { field },
        MetricKind::Percentile(p) => AggSpec::Percentile { field, percentile: p },
    }
}

enum Bucketing {
    Terms(String),
    Date(CalendarInterval, String),
}

fn detect_bucketing(
    normalized: &str,
    words: &[&str],
    schemas: &[TemplateSchema],
) -> Option<Bucketing> {
    let interval = if normalized.contains("per day") || normalized.contains("by day") || normalized.contains("daily") {
        Some(CalendarInterval::Day)
    } else if normalized.contains("per week") || normalized.contains("by week") || normalized.contains("weekly") {
        Some(CalendarInterval::Week)
    } else if normalized.contains("per month") || normalized.contains("by month") || normalized.contains("monthly") {
        Some(CalendarInterval::Month)
    } else if normalized.contains("per year") || normalized.contains("by year") || normalized.contains("yearly") || normalized.contains("annually") {
        Some(CalendarInterval::Year)
    } else {
        None
    };

    if let Some(interval) = interval {
        let date_fields = all_date_fields(schemas);
        if let Some(field) = date_fields.first() {
            return Some(Bucketing::Date(interval, field.clone()));
        }
        return None;
    }

    // "by <field>" / "per <field>" grouping on a text field
    for (i, word) in words.iter().enumerate() {
        if *word != "by" && *word != "per" {
            continue;
        }
        let fields = resolve_phrase_after(words, i + 1, schemas);
        if let Some(field) = fields
            .iter()
            .find(|f| field_kind(schemas, f) == Some(FieldKind::Text))
        {
            return Some(Bucketing::Terms(field.clone()));
        }
    }
    None
}

/// Resolve the word phrase starting at `start` (longest window first,
/// up to three words, stopping at phrase-stop words).
fn resolve_phrase_after(
    words: &[&str],
    start: usize,
    schemas: &[TemplateSchema],
) -> Vec<String> {
    let mut phrase: Vec<&str> = Vec::new();
    for word in words.iter().skip(start) {
        if PHRASE_STOPS.contains(word) {
            break;
        }
        if *word == "of" || *word == "the" {
            if phrase.is_empty() {
                continue;
            }
            break;
        }
        phrase.push(*word);
        if phrase.len() == 3 {
            break;
        }
    }

    for len in (1..=phrase.len()).rev() {
        let candidate = phrase[..len].join(" ");
        let fields = resolve_across(schemas, &candidate);
        if !fields.is_empty() {
            return fields;
        }
    }
    Vec::new()
}

/// `field=value` / `field:value` pairs, typed by the schema's field kind.
fn extract_equality_clauses(
    normalized: &str,
    schemas: &[TemplateSchema],
    clauses: &mut Vec<FilterClause>,
    unresolved: &mut usize,
) {
    let re = Regex::new(r"([a-z][a-z0-9_]*)\s*[:=]\s*([a-z0-9][a-z0-9_./-]*)").unwrap();
    for cap in re.captures_iter(normalized) {
        let field_token = &cap[1];
        let value_token = &cap[2];

        let fields = resolve_across(schemas, field_token);
        if fields.is_empty() {
            *unresolved += 1;
            tracing::debug!(field = field_token, "Equality filter on unknown field dropped");
            continue;
        }

        let kind = field_kind(schemas, &fields[0]).unwrap_or(FieldKind::Text);
        let value = typed_value(value_token, kind);
        clauses.push(FilterClause { fields, op: FilterOp::Eq, value });
    }
}

fn typed_value(token: &str, kind: FieldKind) -> FieldValue {
    match kind {
        FieldKind::Number => parse_amount(token)
            .map(FieldValue::Number)
            .unwrap_or_else(|| FieldValue::Text(token.to_string())),
        FieldKind::Date => NaiveDate::parse_from_str(token, "%Y-%m-%d")
            .map(FieldValue::Date)
            .unwrap_or_else(|_| FieldValue::Text(token.to_string())),
        FieldKind::Boolean => match token {
            "true" | "yes" => FieldValue::Boolean(true),
            "false" | "no" => FieldValue::Boolean(false),
            _ => FieldValue::Text(token.to_string()),
        },
        _ => FieldValue::Text(token.to_string()),
    }
}

/// "over $500", "at least 100" — anchored to the metric field when one was
/// recognized, otherwise to numeric target fields, otherwise to the
/// "amount" canonical category.
fn extract_numeric_clauses(
    normalized: &str,
    schemas: &[TemplateSchema],
    metric_fields: &[String],
    clauses: &mut Vec<FilterClause>,
    unresolved: &mut usize,
) {
    let re = Regex::new(
        r"\b(over|above|greater than|more than|at least|under|below|less than|at most|exactly)\s+\$?([0-9][0-9,]*(?:\.[0-9]+)?)",
    )
    .unwrap();

    for cap in re.captures_iter(normalized) {
        let op = match &cap[1] {
            "at least" => FilterOp::Gte,
            "at most" => FilterOp::Lte,
            "exactly" => FilterOp::Eq,
            "under" | "below" | "less than" => FilterOp::Lt,
            _ => FilterOp::Gt,
        };
        let Some(number) = parse_amount(&cap[2]) else {
            *unresolved += 1;
            continue;
        };

        let mut fields = fields_of_kind(schemas, metric_fields, FieldKind::Number);
        if fields.is_empty() {
            let mut canonical: Vec<String> = schemas
                .iter()
                .flat_map(|s| s.expand_canonical(DEFAULT_NUMERIC_CATEGORY))
                .collect();
            canonical.sort();
            canonical.dedup();
            fields = canonical;
        }
        if fields.is_empty() {
            *unresolved += 1;
            tracing::debug!("Numeric comparison with no resolvable field dropped");
            continue;
        }

        clauses.push(FilterClause { fields, op, value: FieldValue::Number(number) });
    }
}

/// "since 2024", "before 2023-06-01", "in 2024".
fn extract_date_clauses(
    normalized: &str,
    schemas: &[TemplateSchema],
    clauses: &mut Vec<FilterClause>,
    unresolved: &mut usize,
) {
    let date_fields = all_date_fields(schemas);

    let range_re =
        Regex::new(r"\b(since|after|before|until)\s+(\d{4})(?:-(\d{2}))?(?:-(\d{2}))?\b").unwrap();
    for cap in range_re.captures_iter(normalized) {
        let year: i32 = cap[2].parse().unwrap_or(1970);
        let month: u32 = cap.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(1);
        let day: u32 = cap.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(1);
        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
            *unresolved += 1;
            continue;
        };
        if date_fields.is_empty() {
            *unresolved += 1;
            continue;
        }
        let op = match &cap[1] {
            "since" => FilterOp::Gte,
            "after" => FilterOp::Gt,
            _ => FilterOp::Lt,
        };
        clauses.push(FilterClause {
            fields: date_fields.clone(),
            op,
            value: FieldValue::Date(date),
        });
    }

    let in_year_re = Regex::new(r"\bin (\d{4})\b").unwrap();
    for cap in in_year_re.captures_iter(normalized) {
        let year: i32 = cap[1].parse().unwrap_or(1970);
        let (Some(start), Some(end)) = (
            NaiveDate::from_ymd_opt(year, 1, 1),
            NaiveDate::from_ymd_opt(year + 1, 1, 1),
        ) else {
            continue;
        };
        if date_fields.is_empty() {
            *unresolved += 1;
            continue;
        }
        clauses.push(FilterClause {
            fields: date_fields.clone(),
            op: FilterOp::Gte,
            value: FieldValue::Date(start),
        });
        clauses.push(FilterClause {
            fields: date_fields.clone(),
            op: FilterOp::Lt,
            value: FieldValue::Date(end),
        });
    }
}

/// Resolve remaining word n-grams (longest first) against the schemas to
/// pick up bare field mentions like "vendor" or "grand total".
fn resolve_ngrams(words: &[&str], schemas: &[TemplateSchema]) -> Vec<String> {
    let mut found = Vec::new();
    for len in (1..=3usize).rev() {
        if words.len() < len {
            continue;
        }
        for window in words.windows(len) {
            let candidate = window.join(" ");
            found.extend(resolve_across(schemas, &candidate));
        }
    }
    found.sort();
    found.dedup();
    found
}
