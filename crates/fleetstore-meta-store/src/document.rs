//! Documents, filters and updates
//!
//! Documents are JSON objects keyed by `_id`. Field paths may be dotted
//! (`usage.read_bytes`) to address nested objects.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A stored document
pub type Document = Map<String, Value>;

/// Name of the primary key field
pub const ID_FIELD: &str = "_id";

/// Read a possibly dotted path
#[must_use]
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Mutable access to a possibly dotted path, creating intermediate objects
fn entry_path<'a>(doc: &'a mut Document, path: &str) -> &'a mut Value {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let slot = doc.entry(head.to_string()).or_insert(Value::Null);
    match rest {
        None => slot,
        Some(rest) => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            match slot {
                Value::Object(inner) => entry_path(inner, rest),
                _ => unreachable!("slot was just made an object"),
            }
        }
    }
}

/// Remove a possibly dotted path
fn remove_path(doc: &mut Document, path: &str) {
    match path.rsplit_once('.') {
        None => {
            doc.remove(path);
        }
        Some((parent, leaf)) => {
            if let Value::Object(inner) = entry_path(doc, parent) {
                inner.remove(leaf);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Condition {
    Eq(Value),
    In(Vec<Value>),
    Gte(Value),
    Lte(Value),
    Exists(bool),
}

/// Conjunction of per-field conditions
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    /// Filter matching every document
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter on the primary key
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::all().eq(ID_FIELD, id.into())
    }

    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), Condition::Eq(value.into())));
        self
    }

    #[must_use]
    pub fn one_of<V: Into<Value>>(mut self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push((field.into(), Condition::In(values)));
        self
    }

    #[must_use]
    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), Condition::Gte(value.into())));
        self
    }

    #[must_use]
    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), Condition::Lte(value.into())));
        self
    }

    #[must_use]
    pub fn exists(mut self, field: impl Into<String>, present: bool) -> Self {
        self.conditions.push((field.into(), Condition::Exists(present)));
        self
    }

    /// Whether `doc` satisfies every condition
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(field, cond)| {
            let value = get_path(doc, field);
            match cond {
                Condition::Eq(expected) => value == Some(expected),
                Condition::In(options) => value.is_some_and(|v| options.contains(v)),
                Condition::Gte(bound) => {
                    value.and_then(|v| compare(v, bound)).is_some_and(Ordering::is_ge)
                }
                Condition::Lte(bound) => {
                    value.and_then(|v| compare(v, bound)).is_some_and(Ordering::is_le)
                }
                Condition::Exists(present) => value.is_some() == *present,
            }
        })
    }

    /// The `_id` this filter pins, if it has a string equality on it
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.equalities()
            .find(|(field, _)| *field == ID_FIELD)
            .and_then(|(_, value)| value.as_str())
    }

    /// Equality conditions, used to seed an upserted document
    pub fn equalities(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.conditions.iter().filter_map(|(field, cond)| match cond {
            Condition::Eq(v) => Some((field.as_str(), v)),
            _ => None,
        })
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Field-level modifications applied atomically to one document
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    set: Vec<(String, Value)>,
    unset: Vec<String>,
    inc: Vec<(String, i64)>,
    push: Vec<(String, Value)>,
}

impl Update {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    /// Add `by` to an integer field, treating a missing field as zero
    #[must_use]
    pub fn inc(mut self, field: impl Into<String>, by: i64) -> Self {
        self.inc.push((field.into(), by));
        self
    }

    /// Append to an array field, creating it when missing
    #[must_use]
    pub fn push(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push.push((field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.inc.is_empty() && self.push.is_empty()
    }

    /// Apply every modification to `doc`
    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            *entry_path(doc, field) = value.clone();
        }
        for field in &self.unset {
            remove_path(doc, field);
        }
        for (field, by) in &self.inc {
            let slot = entry_path(doc, field);
            let current = slot.as_i64().unwrap_or(0);
            *slot = Value::from(current.saturating_add(*by));
        }
        for (field, value) in &self.push {
            let slot = entry_path(doc, field);
            match slot {
                Value::Array(items) => items.push(value.clone()),
                _ => *slot = Value::Array(vec![value.clone()]),
            }
        }
    }
}

/// Build the document created by an upsert that matched nothing
#[must_use]
pub fn seed_upsert(filter: &Filter, update: &Update) -> Document {
    let mut doc = Document::new();
    for (field, value) in filter.equalities() {
        *entry_path(&mut doc, field) = value.clone();
    }
    if !doc.contains_key(ID_FIELD) {
        doc.insert(ID_FIELD.to_string(), Value::from(uuid::Uuid::new_v4().to_string()));
    }
    update.apply(&mut doc);
    doc
}

/// The `_id` of a document as a string key
#[must_use]
pub fn document_id(doc: &Document) -> Option<String> {
    match doc.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
