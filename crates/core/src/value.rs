//! Typed detail values.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One typed scalar (or list/struct) stored under a relation key.
///
/// Numbers are compared numerically regardless of whether they were stored as
/// `Int` or `Float`; values of different kinds compare by kind rank so the
/// order is total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringList(Vec<String>),
    IntList(Vec<i64>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::StringList(_) => 4,
            Value::IntList(_) => 5,
            Value::Struct(_) => 6,
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }
    pub fn is_list(&self) -> bool { matches!(self, Value::StringList(_) | Value::IntList(_)) }

    /// Uniform emptiness: null, "", 0, false, [] and {} are all empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !*b,
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            Value::String(s) => s.is_empty(),
            Value::StringList(l) => l.is_empty(),
            Value::IntList(l) => l.is_empty(),
            Value::Struct(m) => m.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = self { Some(s) } else { None }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(b) = self { Some(*b) } else { None }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        if let Value::StringList(l) = self { Some(l) } else { None }
    }

    pub fn as_f64_list(&self) -> Option<Vec<f64>> {
        if let Value::IntList(l) = self { Some(l.iter().map(|i| *i as f64).collect()) } else { None }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        if let Value::Struct(m) = self { Some(m) } else { None }
    }

    /// Strings wrapped into a one-element list; lists returned as is.
    pub fn string_list(&self) -> Vec<String> {
        match self {
            Value::String(s) if !s.is_empty() => vec![s.clone()],
            Value::StringList(l) => l.clone(),
            _ => Vec::new(),
        }
    }

    /// Wraps scalars into a list of values, used by `In` style conditions.
    pub fn wrap_to_list(&self) -> Option<Vec<Value>> {
        match self {
            Value::StringList(l) => Some(l.iter().cloned().map(Value::String).collect()),
            Value::IntList(l) => Some(l.iter().copied().map(Value::Int).collect()),
            Value::Null => Some(Vec::new()),
            Value::Struct(_) => None,
            v => Some(vec![v.clone()]),
        }
    }

    /// Total order across all kinds.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) if a.rank() == 2 && b.rank() == 2 => {
                let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
                x.total_cmp(&y)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::StringList(a), Value::StringList(b)) => a.cmp(b),
            (Value::IntList(a), Value::IntList(b)) => a.cmp(b),
            (Value::Struct(a), Value::Struct(b)) => {
                let mut ia = a.iter();
                let mut ib = b.iter();
                loop {
                    match (ia.next(), ib.next()) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some((ka, va)), Some((kb, vb))) => {
                            let o = ka.cmp(kb).then_with(|| va.compare(vb));
                            if o != Ordering::Equal { return o; }
                        }
                    }
                }
            }
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    /// Human readable rendering used by `Like` and the CLI.
    pub fn to_display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::StringList(l) => l.join(", "),
            Value::IntList(l) => l.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", "),
            Value::Struct(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self { Value::Int(i as i64) }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self { Value::Float(f) }
}

impl From<Vec<String>> for Value {
    fn from(l: Vec<String>) -> Self { Value::StringList(l) }
}

impl From<Vec<&str>> for Value {
    fn from(l: Vec<&str>) -> Self { Value::StringList(l.into_iter().map(str::to_string).collect()) }
}

impl From<Vec<i64>> for Value {
    fn from(l: Vec<i64>) -> Self { Value::IntList(l) }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match v {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            J::String(s) => Value::String(s),
            J::Array(items) => {
                if items.iter().all(|i| i.is_i64()) && !items.is_empty() {
                    Value::IntList(items.iter().filter_map(|i| i.as_i64()).collect())
                } else {
                    Value::StringList(
                        items
                            .into_iter()
                            .map(|i| match i {
                                J::String(s) => s,
                                other => other.to_string(),
                            })
                            .collect(),
                    )
                }
            }
            J::Object(m) => Value::Struct(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_uniform() {
        for v in [Value::Null, Value::Bool(false), Value::Int(0), Value::Float(0.0), "".into(), Value::StringList(vec![]), Value::Struct(BTreeMap::new())] {
            assert!(v.is_empty(), "{:?} should be empty", v);
        }
        assert!(!Value::from("x").is_empty());
        assert!(!Value::from(vec!["a"]).is_empty());
    }

    #[test]
    fn numbers_compare_across_kinds() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.0)), Ordering::Equal);
        assert_eq!(Value::Int(1).compare(&Value::Float(1.5)), Ordering::Less);
        assert_eq!(Value::Null.compare(&Value::Int(-5)), Ordering::Less);
        assert_eq!(Value::from("a").compare(&Value::Int(100)), Ordering::Greater);
    }

    #[test]
    fn json_conversion_picks_kinds() {
        let v: Value = serde_json::json!({"a": 1, "b": [1, 2], "c": ["x"], "d": 1.5, "e": []}).into();
        let m = v.as_struct().expect("struct");
        assert_eq!(m["a"], Value::Int(1));
        assert_eq!(m["b"], Value::IntList(vec![1, 2]));
        assert_eq!(m["c"], Value::from(vec!["x"]));
        assert_eq!(m["d"], Value::Float(1.5));
        assert_eq!(m["e"], Value::StringList(vec![]));
    }
}
