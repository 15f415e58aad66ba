//! Compiled filter tree evaluated against object details.

use std::cmp::Ordering;

use quarry_core::{Details, RelationKey, Value};
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqCond {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches everything (empty conjunction).
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Eq { key: RelationKey, cond: EqCond, value: Value },
    In { key: RelationKey, values: Vec<Value> },
    /// Case-insensitive substring; `value` is stored lowercased.
    Like { key: RelationKey, value: String },
    Exists { key: RelationKey },
    Empty { key: RelationKey },
    AllIn { key: RelationKey, values: Vec<Value> },
    /// Set equality after dropping values that are not live options.
    ExactIn { key: RelationKey, values: Vec<String>, options: Option<FxHashSet<String>> },
    /// `key` references one of `ids`, resolved once from `inner` at build time.
    NestedIn { key: RelationKey, inner: Box<Filter>, ids: FxHashSet<String> },
    NestedNotIn { key: RelationKey, inner: Box<Filter>, ids: FxHashSet<String> },
    /// Compares two relations of the same object.
    ValuesComp { key: RelationKey, other: RelationKey, cond: EqCond },
}

/// `filter_value.compare(obj_value)` read the way conditions are phrased:
/// `Greater` matches when the object value is greater than the filter value.
fn cond_holds(cond: EqCond, comp: Ordering) -> bool {
    match cond {
        EqCond::Equal => comp == Ordering::Equal,
        EqCond::NotEqual => comp != Ordering::Equal,
        EqCond::Greater => comp == Ordering::Less,
        EqCond::GreaterOrEqual => comp != Ordering::Greater,
        EqCond::Less => comp == Ordering::Greater,
        EqCond::LessOrEqual => comp != Ordering::Less,
    }
}

/// Scalar filter values match list object values element-wise (any element).
pub(crate) fn eq_matches(cond: EqCond, filter_value: &Value, obj: &Value) -> bool {
    if !filter_value.is_list() {
        match obj {
            Value::StringList(l) => return l.iter().any(|s| eq_matches(cond, filter_value, &Value::String(s.clone()))),
            Value::IntList(l) => return l.iter().any(|i| eq_matches(cond, filter_value, &Value::Int(*i))),
            _ => {}
        }
    }
    cond_holds(cond, filter_value.compare(obj))
}

static NULL: Value = Value::Null;

impl Filter {
    pub fn matches(&self, d: &Details) -> bool {
        let get = |k: &str| d.get(k).unwrap_or(&NULL);
        match self {
            Filter::All => true,
            Filter::And(fs) => fs.iter().all(|f| f.matches(d)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(d)),
            Filter::Not(f) => !f.matches(d),
            Filter::Eq { key, cond, value } => eq_matches(*cond, value, get(key)),
            Filter::In { key, values } => {
                let v = get(key);
                values.iter().any(|fv| eq_matches(EqCond::Equal, fv, v))
            }
            Filter::Like { key, value } => match get(key) {
                Value::String(s) => s.to_lowercase().contains(value.as_str()),
                Value::StringList(l) => l.iter().any(|s| s.to_lowercase().contains(value.as_str())),
                _ => false,
            },
            Filter::Exists { key } => d.has(key),
            Filter::Empty { key } => get(key).is_empty(),
            Filter::AllIn { key, values } => all_in(get(key), values),
            Filter::ExactIn { key, values, options } => exact_in(get(key), values, options.as_ref()),
            Filter::NestedIn { key, ids, .. } => references_any(get(key), ids),
            Filter::NestedNotIn { key, ids, .. } => !references_any(get(key), ids),
            Filter::ValuesComp { key, other, cond } => eq_matches(*cond, get(other), get(key)),
        }
    }

    /// Visits every node depth-first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Filter)) {
        f(self);
        match self {
            Filter::And(fs) | Filter::Or(fs) => {
                for x in fs { x.walk(f); }
            }
            Filter::Not(x) => x.walk(f),
            _ => {}
        }
    }

    /// Mutable access to nested-set nodes, in `walk` order.
    pub fn nested_ids_mut(&mut self) -> Vec<&mut FxHashSet<String>> {
        let mut out = Vec::new();
        fn go<'a>(f: &'a mut Filter, out: &mut Vec<&'a mut FxHashSet<String>>) {
            match f {
                Filter::NestedIn { ids, .. } | Filter::NestedNotIn { ids, .. } => out.push(ids),
                Filter::And(fs) | Filter::Or(fs) => fs.iter_mut().for_each(|x| go(x, out)),
                Filter::Not(x) => go(x, out),
                _ => {}
            }
        }
        go(self, &mut out);
        out
    }

    /// Inner filters of nested-set nodes, in `walk` order.
    pub fn nested_inners(&self) -> Vec<&Filter> {
        let mut out = Vec::new();
        self.walk(&mut |f| {
            if let Filter::NestedIn { inner, .. } | Filter::NestedNotIn { inner, .. } = f { out.push(inner.as_ref()); }
        });
        out
    }
}

fn references_any(v: &Value, ids: &FxHashSet<String>) -> bool {
    match v {
        Value::String(s) => ids.contains(s),
        Value::StringList(l) => l.iter().any(|s| ids.contains(s)),
        _ => false,
    }
}

fn all_in(v: &Value, want: &[Value]) -> bool {
    if v.is_null() {
        return false;
    }
    if want.is_empty() {
        return true;
    }
    match v {
        Value::String(_) | Value::Int(_) | Value::Float(_) => {
            want.len() == 1 && want[0].compare(v) == Ordering::Equal
        }
        Value::StringList(l) => want.iter().all(|w| w.as_str().map_or(false, |w| l.iter().any(|s| s == w))),
        Value::IntList(l) => want.iter().all(|w| w.as_f64().map_or(false, |w| l.iter().any(|i| *i as f64 == w))),
        _ => false,
    }
}

fn exact_in(v: &Value, want: &[String], options: Option<&FxHashSet<String>>) -> bool {
    if want.is_empty() {
        return false;
    }
    let allowed = |s: &str| options.map_or(true, |o| o.is_empty() || o.contains(s));
    match v {
        Value::String(s) => allowed(s.as_str()) && want.iter().any(|w| w == s),
        Value::StringList(l) => {
            let only: Vec<&String> = l.iter().filter(|s| allowed(s.as_str())).collect();
            only.len() == want.len() && want.iter().all(|w| only.iter().any(|s| *s == w))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj() -> Details {
        Details::new()
            .with("id", "o1")
            .with("name", "Hello World")
            .with("count", 5)
            .with("tag", vec!["a", "b", "c"])
            .with("done", false)
            .with("start", 10)
            .with("end", 20)
    }

    fn set(ids: &[&str]) -> FxHashSet<String> { ids.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn eq_conditions_read_object_relative_to_filter() {
        let d = obj();
        let f = |cond, v: i64| Filter::Eq { key: "count".into(), cond, value: v.into() }.matches(&d);
        assert!(f(EqCond::Greater, 4));
        assert!(!f(EqCond::Greater, 5));
        assert!(f(EqCond::GreaterOrEqual, 5));
        assert!(f(EqCond::Less, 6));
        assert!(f(EqCond::LessOrEqual, 5));
        assert!(!f(EqCond::Less, 5));
        assert!(f(EqCond::NotEqual, 7));
    }

    #[test]
    fn eq_on_list_matches_any_element() {
        let d = obj();
        assert!(Filter::Eq { key: "tag".into(), cond: EqCond::Equal, value: "b".into() }.matches(&d));
        assert!(!Filter::Eq { key: "tag".into(), cond: EqCond::Equal, value: "z".into() }.matches(&d));
        assert!(Filter::In { key: "tag".into(), values: vec!["z".into(), "c".into()] }.matches(&d));
    }

    #[test]
    fn like_is_case_insensitive() {
        let d = obj();
        assert!(Filter::Like { key: "name".into(), value: "o wor".into() }.matches(&d));
        assert!(!Filter::Like { key: "count".into(), value: "5".into() }.matches(&d));
    }

    #[test]
    fn empty_and_exists() {
        let d = obj();
        assert!(Filter::Empty { key: "done".into() }.matches(&d));
        assert!(Filter::Empty { key: "missing".into() }.matches(&d));
        assert!(!Filter::Empty { key: "tag".into() }.matches(&d));
        assert!(Filter::Exists { key: "done".into() }.matches(&d));
        assert!(!Filter::Exists { key: "missing".into() }.matches(&d));
    }

    #[test]
    fn all_in_requires_every_value() {
        let d = obj();
        assert!(Filter::AllIn { key: "tag".into(), values: vec!["a".into(), "c".into()] }.matches(&d));
        assert!(!Filter::AllIn { key: "tag".into(), values: vec!["a".into(), "x".into()] }.matches(&d));
        assert!(!Filter::AllIn { key: "missing".into(), values: vec!["a".into()] }.matches(&d));
    }

    #[test]
    fn exact_in_drops_unknown_options() {
        let d = obj();
        let want = vec!["a".to_string(), "b".to_string()];
        let live = Some(set(&["a", "c"]));
        assert!(!Filter::ExactIn { key: "tag".into(), values: want.clone(), options: live }.matches(&d));
        let live = Some(set(&["a", "b"]));
        assert!(Filter::ExactIn { key: "tag".into(), values: want.clone(), options: live }.matches(&d));
        assert!(!Filter::ExactIn { key: "tag".into(), values: want, options: None }.matches(&d));
        assert!(!Filter::ExactIn { key: "tag".into(), values: vec![], options: None }.matches(&d));
    }

    #[test]
    fn nested_sets_and_value_comparison() {
        let d = obj();
        let inner = Box::new(Filter::All);
        assert!(Filter::NestedIn { key: "tag".into(), inner: inner.clone(), ids: set(&["c"]) }.matches(&d));
        assert!(!Filter::NestedNotIn { key: "tag".into(), inner, ids: set(&["c"]) }.matches(&d));
        assert!(Filter::ValuesComp { key: "end".into(), other: "start".into(), cond: EqCond::Greater }.matches(&d));
        assert!(!Filter::ValuesComp { key: "start".into(), other: "end".into(), cond: EqCond::Greater }.matches(&d));
    }
}
