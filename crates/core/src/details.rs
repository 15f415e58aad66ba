//! `Details`: the bag of typed values describing one object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::relation::keys;
use crate::Value;

/// Relation key (a short column name such as `name` or `assignee`).
pub type RelationKey = String;

/// Key/value pair carried by amend events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: RelationKey,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Details(BTreeMap<RelationKey, Value>);

impl Details {
    pub fn new() -> Self { Self(BTreeMap::new()) }

    /// Builder-style setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> { self.0.get(key) }
    pub fn has(&self, key: &str) -> bool { self.0.contains_key(key) }
    pub fn set(&mut self, key: &str, value: impl Into<Value>) { self.0.insert(key.to_string(), value.into()); }
    pub fn remove(&mut self, key: &str) -> Option<Value> { self.0.remove(key) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn keys(&self) -> impl Iterator<Item = &RelationKey> { self.0.keys() }
    pub fn iter(&self) -> impl Iterator<Item = (&RelationKey, &Value)> { self.0.iter() }

    pub fn id(&self) -> &str { self.get_str(keys::ID) }

    /// String value or `""` when missing or not a string.
    pub fn get_str(&self, key: &str) -> &str {
        self.0.get(key).and_then(Value::as_str).unwrap_or("")
    }

    pub fn try_str(&self, key: &str) -> Option<&str> { self.0.get(key).and_then(Value::as_str) }
    pub fn get_bool(&self, key: &str) -> bool { self.0.get(key).and_then(Value::as_bool).unwrap_or(false) }
    pub fn get_f64(&self, key: &str) -> Option<f64> { self.0.get(key).and_then(Value::as_f64) }

    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        self.0.get(key).map(Value::string_list).unwrap_or_default()
    }

    /// Projection onto `keys`; an empty key list keeps everything.
    pub fn project(&self, keys: &[RelationKey]) -> Details {
        if keys.is_empty() {
            return self.clone();
        }
        let mut out = BTreeMap::new();
        for k in keys {
            if let Some(v) = self.0.get(k) { out.insert(k.clone(), v.clone()); }
        }
        Details(out)
    }

    /// Changed-or-added values and removed keys between `self` (old) and `new`,
    /// restricted to `keys` (all keys when empty).
    pub fn diff(&self, new: &Details, keys: &[RelationKey]) -> (Vec<KeyValue>, Vec<RelationKey>) {
        let mut changed = Vec::new();
        let mut removed = Vec::new();
        let mut visit = |k: &RelationKey| match (self.0.get(k), new.0.get(k)) {
            (Some(a), Some(b)) if a == b => {}
            (_, Some(b)) => changed.push(KeyValue { key: k.clone(), value: b.clone() }),
            (Some(_), None) => removed.push(k.clone()),
            (None, None) => {}
        };
        if keys.is_empty() {
            let mut all: Vec<&RelationKey> = self.0.keys().chain(new.0.keys()).collect();
            all.sort();
            all.dedup();
            for k in all { visit(k); }
        } else {
            for k in keys { visit(k); }
        }
        (changed, removed)
    }
}

impl FromIterator<(RelationKey, Value)> for Details {
    fn from_iter<T: IntoIterator<Item = (RelationKey, Value)>>(iter: T) -> Self { Details(iter.into_iter().collect()) }
}

impl From<serde_json::Value> for Details {
    fn from(v: serde_json::Value) -> Self {
        match Value::from(v) {
            Value::Struct(m) => Details(m),
            _ => Details::new(),
        }
    }
}

/// One change record delivered by the store firehose.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub details: std::sync::Arc<Details>,
}

impl Record {
    pub fn new(details: Details) -> Self { Self { details: std::sync::Arc::new(details) } }
    pub fn id(&self) -> &str { self.details.id() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_changed_and_removed() {
        let old = Details::new().with("id", "a").with("name", "x").with("done", true);
        let new = Details::new().with("id", "a").with("name", "y").with("tag", vec!["t1"]);
        let (changed, removed) = old.diff(&new, &[]);
        assert_eq!(changed.iter().map(|kv| kv.key.as_str()).collect::<Vec<_>>(), vec!["name", "tag"]);
        assert_eq!(removed, vec!["done".to_string()]);

        let (changed, removed) = old.diff(&new, &["id".to_string(), "done".to_string()]);
        assert!(changed.is_empty());
        assert_eq!(removed, vec!["done".to_string()]);
    }

    #[test]
    fn project_keeps_requested_keys() {
        let d = Details::new().with("id", "a").with("name", "x").with("n", 3);
        let p = d.project(&["id".into(), "n".into(), "missing".into()]);
        assert_eq!(p.len(), 2);
        assert_eq!(p.get("n"), Some(&Value::Int(3)));
    }
}
