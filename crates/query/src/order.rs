//! Comparators over object details.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use quarry_core::{keys, layout, Details, RelationFormat, RelationKey, Result, Value};
use rustc_hash::FxHashMap;

use crate::request::{EmptyPlacement, SortRequest, SortType};
use crate::{collate, ObjectStore, OrderMap};

const DAY: i64 = 24 * 60 * 60;

/// Total comparator used by sorted subscriptions (id tiebreak is applied by the caller).
pub trait Order: Send + Sync + fmt::Debug {
    fn compare(&self, a: &Details, b: &Details) -> Ordering;

    /// Refreshes order strings of related objects; `true` when anything changed.
    fn update_order_map(&mut self, _details: &[Arc<Details>]) -> bool { false }

    /// Makes sure related objects referenced by `d` have order strings.
    fn ensure_related(&mut self, _store: &dyn ObjectStore, _d: &Details) -> Result<()> { Ok(()) }

    /// Relation keys whose values are object ids this order sorts by, with their format.
    fn related_keys(&self) -> Vec<(RelationKey, RelationFormat)> { Vec::new() }
}

/// First non-equal component wins.
#[derive(Debug, Default)]
pub struct SetOrder(pub Vec<Box<dyn Order>>);

impl Order for SetOrder {
    fn compare(&self, a: &Details, b: &Details) -> Ordering {
        for o in &self.0 {
            let c = o.compare(a, b);
            if c != Ordering::Equal { return c; }
        }
        Ordering::Equal
    }

    fn update_order_map(&mut self, details: &[Arc<Details>]) -> bool {
        self.0.iter_mut().fold(false, |acc, o| o.update_order_map(details) | acc)
    }

    fn ensure_related(&mut self, store: &dyn ObjectStore, d: &Details) -> Result<()> {
        for o in &mut self.0 { o.ensure_related(store, d)?; }
        Ok(())
    }

    fn related_keys(&self) -> Vec<(RelationKey, RelationFormat)> {
        self.0.iter().flat_map(|o| o.related_keys()).collect()
    }
}

#[derive(Debug)]
pub struct KeyOrder {
    pub key: RelationKey,
    pub desc: bool,
    pub empty: EmptyPlacement,
    pub format: RelationFormat,
    pub include_time: bool,
    disable_collator: bool,
    order_map: Option<OrderMap>,
}

impl KeyOrder {
    pub fn new(key: &str, desc: bool, format: RelationFormat) -> Self {
        Self {
            key: key.to_string(),
            desc,
            empty: EmptyPlacement::NotSpecified,
            format,
            include_time: false,
            disable_collator: key == keys::ORDER_ID || key == keys::SPACE_ORDER,
            order_map: None,
        }
    }

    /// Builds the order map from the store for object/file/tag/status keys.
    pub fn from_request(store: &dyn ObjectStore, s: &SortRequest) -> Result<Self> {
        let format = match s.format {
            Some(f) => f,
            None => store.relation_format(&s.relation_key).unwrap_or_default(),
        };
        let mut ko = KeyOrder::new(&s.relation_key, s.sort_type == SortType::Desc, format);
        ko.empty = s.empty_placement;
        ko.include_time = s.include_time;
        if format.is_dependency() {
            ko.order_map = Some(OrderMap::build(store, &s.relation_key, format)?);
        }
        Ok(ko)
    }

    pub fn with_order_map(mut self, om: OrderMap) -> Self {
        self.order_map = Some(om);
        self
    }

    /// Notes without a `name` key sort by their snippet.
    fn text<'a>(&self, d: &'a Details) -> &'a str {
        if self.key == keys::NAME && !d.has(keys::NAME) && d.get_str(keys::LAYOUT) == layout::NOTE {
            return d.get_str(keys::SNIPPET);
        }
        d.get_str(&self.key)
    }

    /// Whether empty placement applies to `d`. Numbers and dates are empty only
    /// when missing or not numeric; checkboxes never are.
    fn is_empty(&self, d: &Details) -> bool {
        match self.format {
            RelationFormat::Checkbox => false,
            RelationFormat::Number => d.get_f64(&self.key).is_none(),
            RelationFormat::Date => d.get(&self.key).and_then(Value::as_i64).is_none(),
            f if f.is_dependency() => d.get_string_list(&self.key).is_empty(),
            _ => match d.get(&self.key) {
                None | Some(Value::String(_)) => self.text(d).is_empty(),
                Some(v) => v.is_empty(),
            },
        }
    }

    /// `Some` when at least one side is empty and placement decides.
    fn try_compare_empty(&self, a: &Details, b: &Details) -> Option<Ordering> {
        match (self.is_empty(a), self.is_empty(b)) {
            (true, true) => Some(Ordering::Equal),
            (false, false) => None,
            (a_empty, _) => match self.empty {
                EmptyPlacement::Start => Some(if a_empty { Ordering::Less } else { Ordering::Greater }),
                EmptyPlacement::End => Some(if a_empty { Ordering::Greater } else { Ordering::Less }),
                EmptyPlacement::NotSpecified => None,
            },
        }
    }

    fn compare_values(&self, a: &Details, b: &Details) -> Ordering {
        match self.format {
            RelationFormat::Checkbox => a.get_bool(&self.key).cmp(&b.get_bool(&self.key)),
            RelationFormat::Number => {
                let (x, y) = (a.get_f64(&self.key), b.get_f64(&self.key));
                match (x, y) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    _ => x.is_some().cmp(&y.is_some()),
                }
            }
            RelationFormat::Date => {
                let day = |d: &Details| {
                    d.get(&self.key).and_then(Value::as_i64).map(|t| if self.include_time { t } else { t - t.rem_euclid(DAY) })
                };
                day(a).cmp(&day(b))
            }
            RelationFormat::Object | RelationFormat::File | RelationFormat::Tag | RelationFormat::Status => {
                let (la, lb) = (a.get_string_list(&self.key), b.get_string_list(&self.key));
                let (sa, sb) = match &self.order_map {
                    Some(om) => (om.build_order(&la), om.build_order(&lb)),
                    None => (la.join(""), lb.join("")),
                };
                sa.cmp(&sb).then_with(|| la.len().cmp(&lb.len()))
            }
            _ => match (a.get(&self.key), b.get(&self.key)) {
                (Some(Value::String(_)), _) | (_, Some(Value::String(_))) | (None, None) => {
                    let (x, y) = (self.text(a), self.text(b));
                    if self.disable_collator { x.cmp(y) } else { collate::compare(x, y) }
                }
                (x, y) => x.unwrap_or(&Value::Null).compare(y.unwrap_or(&Value::Null)),
            },
        }
    }
}

impl Order for KeyOrder {
    fn compare(&self, a: &Details, b: &Details) -> Ordering {
        if let Some(o) = self.try_compare_empty(a, b) {
            return o;
        }
        let c = self.compare_values(a, b);
        if self.desc { c.reverse() } else { c }
    }

    fn update_order_map(&mut self, details: &[Arc<Details>]) -> bool {
        self.order_map.as_mut().map_or(false, |om| om.update(details))
    }

    fn ensure_related(&mut self, store: &dyn ObjectStore, d: &Details) -> Result<()> {
        if let Some(om) = self.order_map.as_mut() {
            let ids = d.get_string_list(&self.key);
            if ids.iter().any(|id| !om.contains(id)) {
                om.set_orders(store, &ids)?;
            }
        }
        Ok(())
    }

    fn related_keys(&self) -> Vec<(RelationKey, RelationFormat)> {
        if self.format.is_dependency() { vec![(self.key.clone(), self.format)] } else { Vec::new() }
    }
}

/// Pinned permutation: mapped values first by index, the rest by `key_ord`.
#[derive(Debug)]
pub struct CustomOrder {
    pub key: RelationKey,
    index: FxHashMap<String, usize>,
    key_ord: KeyOrder,
}

impl CustomOrder {
    pub fn new(key: &str, values: &[Value], key_ord: KeyOrder) -> Self {
        let index = values.iter().enumerate().map(|(i, v)| (v.to_display(), i)).collect();
        Self { key: key.to_string(), index, key_ord }
    }

    fn position(&self, d: &Details) -> Option<usize> {
        d.get(&self.key).and_then(|v| self.index.get(&v.to_display())).copied()
    }
}

impl Order for CustomOrder {
    fn compare(&self, a: &Details, b: &Details) -> Ordering {
        match (self.position(a), self.position(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.key_ord.compare(a, b),
        }
    }

    fn update_order_map(&mut self, details: &[Arc<Details>]) -> bool { self.key_ord.update_order_map(details) }

    fn ensure_related(&mut self, store: &dyn ObjectStore, d: &Details) -> Result<()> { self.key_ord.ensure_related(store, d) }

    fn related_keys(&self) -> Vec<(RelationKey, RelationFormat)> { self.key_ord.related_keys() }
}

/// Compiles sort requests into a [`SetOrder`]; `None` when there are no sorts.
pub fn make_order(store: &dyn ObjectStore, sorts: &[SortRequest]) -> Result<Option<SetOrder>> {
    if sorts.is_empty() {
        return Ok(None);
    }
    let mut out: Vec<Box<dyn Order>> = Vec::with_capacity(sorts.len());
    for s in sorts {
        let ko = KeyOrder::from_request(store, s)?;
        if s.sort_type == SortType::Custom {
            out.push(Box::new(CustomOrder::new(&s.relation_key, &s.custom_order, ko)));
        } else {
            out.push(Box::new(ko));
        }
    }
    Ok(Some(SetOrder(out)))
}
