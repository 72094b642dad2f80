//! Query filters evaluated either by the store or locally against rows.

use crate::core::Row;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gte(String, Value),
    Lte(String, Value),
    /// Case-insensitive substring match on a text column.
    ILike(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Conjunction of predicates with optional ordering and limit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: Vec<Predicate>,
    order: Option<(String, SortDirection)>,
    limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.predicates.push(Predicate::Eq(field.to_string(), value));
        self
    }

    pub fn in_list(mut self, field: &str, values: Vec<Value>) -> Self {
        self.predicates.push(Predicate::In(field.to_string(), values));
        self
    }

    pub fn gte(mut self, field: &str, value: Value) -> Self {
        self.predicates.push(Predicate::Gte(field.to_string(), value));
        self
    }

    pub fn lte(mut self, field: &str, value: Value) -> Self {
        self.predicates.push(Predicate::Lte(field.to_string(), value));
        self
    }

    pub fn ilike(mut self, field: &str, needle: &str) -> Self {
        self.predicates
            .push(Predicate::ILike(field.to_string(), needle.to_lowercase()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.order = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn order(&self) -> Option<(&str, SortDirection)> {
        self.order.as_ref().map(|(f, d)| (f.as_str(), *d))
    }

    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.predicates.iter().all(|p| predicate_matches(p, row))
    }

    /// Sorts rows according to the filter's ordering. Stable.
    pub fn sort(&self, rows: &mut [Row]) {
        if let Some((field, direction)) = &self.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(cell(a, field), cell(b, field));
                match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                }
            });
        }
    }

    /// Filters, sorts and truncates `rows`.
    pub fn apply<'a, I>(&self, rows: I) -> Vec<Row>
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut out: Vec<Row> = rows
            .into_iter()
            .filter(|row| self.matches(row))
            .cloned()
            .collect();
        self.sort(&mut out);
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

fn cell<'a>(row: &'a Row, field: &str) -> &'a Value {
    row.get(field).unwrap_or(&Value::Null)
}

fn predicate_matches(predicate: &Predicate, row: &Row) -> bool {
    match predicate {
        Predicate::Eq(field, value) => values_equal(cell(row, field), value),
        Predicate::In(field, values) => {
            let actual = cell(row, field);
            values.iter().any(|v| values_equal(actual, v))
        }
        Predicate::Gte(field, value) => {
            let actual = cell(row, field);
            !actual.is_null() && compare_values(actual, value) != Ordering::Less
        }
        Predicate::Lte(field, value) => {
            let actual = cell(row, field);
            !actual.is_null() && compare_values(actual, value) != Ordering::Greater
        }
        Predicate::ILike(field, needle) => cell(row, field)
            .as_str()
            .map(|s| s.to_lowercase().contains(needle.as_str()))
            .unwrap_or(false),
    }
}

/// Equality with the loose number/text coercion a relational store applies
/// to key columns: `1` equals `"1"`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => a == b,
    }
}

/// Total order used for sorting and range predicates. Nulls sort first,
/// RFC 3339 strings compare as instants.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => match (as_instant(x), as_instant(y)) {
            (Some(tx), Some(ty)) => tx.cmp(&ty),
            _ => x.cmp(y),
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn as_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
