//! Field-level change tracking between two states of a record.

pub mod relations;

use crate::core::FieldMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use relations::{
    RelationshipLink, RelationshipPlan, apply_relationship_plan, load_relationships,
    plan_relationship_changes,
};

/// One changed field. `None` means the field was absent on that side.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Field-level diff. Holds only fields whose values differ, in the order
/// they were first encountered.
///
/// Serialized as `{ field: { "old": .., "new": .. } }`, omitting the side on
/// which a field was absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "FieldMap", try_from = "FieldMap")]
pub struct ChangeSet {
    entries: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.entries.iter()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.entries.iter().find(|c| c.field == field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|c| c.field.as_str())
    }

    /// The partial update that applies this change set. Fields removed on
    /// the new side are written as null.
    pub fn updated_fields(&self) -> FieldMap {
        self.entries
            .iter()
            .map(|c| (c.field.clone(), c.new.clone().unwrap_or(Value::Null)))
            .collect()
    }

    fn push(&mut self, field: String, old: Option<Value>, new: Option<Value>) {
        self.entries.push(FieldChange { field, old, new });
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a FieldChange;
    type IntoIter = std::slice::Iter<'a, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl From<ChangeSet> for FieldMap {
    fn from(changes: ChangeSet) -> Self {
        changes
            .entries
            .into_iter()
            .map(|c| {
                let mut pair = Map::new();
                if let Some(old) = c.old {
                    pair.insert("old".to_string(), old);
                }
                if let Some(new) = c.new {
                    pair.insert("new".to_string(), new);
                }
                (c.field, Value::Object(pair))
            })
            .collect()
    }
}

impl TryFrom<FieldMap> for ChangeSet {
    type Error = String;

    fn try_from(map: FieldMap) -> Result<Self, Self::Error> {
        let mut changes = ChangeSet::new();
        for (field, pair) in map {
            let Value::Object(mut pair) = pair else {
                return Err(format!("change for '{field}' is not an object"));
            };
            changes.push(field, pair.remove("old"), pair.remove("new"));
        }
        Ok(changes)
    }
}

/// Canonical JSON text: object keys sorted at every level and integral
/// floats written as integers, so equal values always render identically.
/// An absent value renders as `None`.
pub fn stable_json(value: Option<&Value>) -> Option<String> {
    value.map(|v| canonical(v).to_string())
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
                Value::from(f as i64)
            }
            _ => value.clone(),
        },
        other => other.clone(),
    }
}

/// Computes the change set between two field mappings.
///
/// Every key present on either side is compared by its canonical JSON
/// form; keys from `original` come first, then keys only in `updated`.
pub fn diff(original: &FieldMap, updated: &FieldMap) -> ChangeSet {
    let mut changes = ChangeSet::new();

    let keys = original
        .keys()
        .chain(updated.keys().filter(|k| !original.contains_key(*k)));

    for key in keys {
        let old = original.get(key);
        let new = updated.get(key);
        if stable_json(old) != stable_json(new) {
            changes.push(key.clone(), old.cloned(), new.cloned());
        }
    }

    changes
}

/// Renders a value for people: strings raw, null or absent as `empty_marker`,
/// everything else as JSON.
pub fn display_value(value: Option<&Value>, empty_marker: &str) -> String {
    match value {
        None | Some(Value::Null) => empty_marker.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// One `field: old → new` line per change.
pub fn format_for_display(changes: &ChangeSet, empty_marker: &str) -> Vec<String> {
    changes
        .iter()
        .map(|c| {
            format!(
                "{}: {} → {}",
                c.field,
                display_value(c.old.as_ref(), empty_marker),
                display_value(c.new.as_ref(), empty_marker)
            )
        })
        .collect()
}
