//! Compilation of filter requests into a [`Filter`] tree.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use quarry_core::{keys, layout, Details, Result, SubError, Value};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::filter::{EqCond, Filter};
use crate::quick::transform_quick_option;
use crate::request::{Condition, FilterOperator, FilterRequest};
use crate::store::{ObjectStore, Query};

/// Everything filter compilation may consult.
pub struct BuildCtx<'a> {
    pub store: &'a dyn ObjectStore,
    /// Reference time for quick date options, in the caller's time zone.
    pub now: DateTime<FixedOffset>,
}

impl<'a> BuildCtx<'a> {
    pub fn new(store: &'a dyn ObjectStore, tz_offset_secs: i32) -> Self {
        let tz = FixedOffset::east_opt(tz_offset_secs).unwrap_or_else(|| Utc.fix());
        Self { store, now: Utc::now().with_timezone(&tz) }
    }
}

/// Compiles the top-level conjunction of `reqs` and appends the default
/// filters (not archived, not deleted, not a space) unless the caller already
/// constrains those keys.
pub fn make_filters(ctx: &BuildCtx<'_>, reqs: &[FilterRequest]) -> Result<Filter> {
    let mut parts = Vec::with_capacity(reqs.len() + 3);
    for r in reqs {
        if let Some(f) = make_filter(ctx, r)? { parts.push(f); }
    }
    let mentions = |k: &str| reqs.iter().any(|r| r.mentions(k));
    if !mentions(keys::IS_ARCHIVED) {
        parts.push(Filter::Eq { key: keys::IS_ARCHIVED.into(), cond: EqCond::NotEqual, value: true.into() });
    }
    if !mentions(keys::IS_DELETED) {
        parts.push(Filter::Eq { key: keys::IS_DELETED.into(), cond: EqCond::NotEqual, value: true.into() });
    }
    if !mentions(keys::LAYOUT) {
        parts.push(Filter::Eq { key: keys::LAYOUT.into(), cond: EqCond::NotEqual, value: layout::SPACE.into() });
    }
    Ok(Filter::And(parts))
}

/// Compiles one request; `None` for requests without a condition.
pub fn make_filter(ctx: &BuildCtx<'_>, req: &FilterRequest) -> Result<Option<Filter>> {
    match req.operator {
        FilterOperator::And | FilterOperator::Or => {
            let mut parts = Vec::with_capacity(req.nested_filters.len());
            for r in &req.nested_filters {
                if let Some(f) = make_filter(ctx, r)? { parts.push(f); }
            }
            return Ok(Some(if req.operator == FilterOperator::And { Filter::And(parts) } else { Filter::Or(parts) }));
        }
        FilterOperator::No => {}
    }
    if req.condition == Condition::None {
        return Ok(None);
    }
    let expanded = transform_quick_option(req, ctx.now)?;
    if expanded.len() == 1 {
        return make_by_condition(ctx, &expanded[0]).map(Some);
    }
    let parts = expanded.iter().map(|r| make_by_condition(ctx, r)).collect::<Result<Vec<_>>>()?;
    Ok(Some(Filter::And(parts)))
}

fn invalid(req: &FilterRequest, what: &str) -> SubError {
    SubError::InvalidFilter(format!("{} {:?}: {}", req.relation_key, req.condition, what))
}

fn eq_cond(c: Condition) -> Option<EqCond> {
    Some(match c {
        Condition::Equal => EqCond::Equal,
        Condition::NotEqual => EqCond::NotEqual,
        Condition::Greater => EqCond::Greater,
        Condition::GreaterOrEqual => EqCond::GreaterOrEqual,
        Condition::Less => EqCond::Less,
        Condition::LessOrEqual => EqCond::LessOrEqual,
        _ => return None,
    })
}

fn string_list(v: &Value) -> Option<Vec<String>> {
    match v {
        Value::String(s) => Some(vec![s.clone()]),
        Value::StringList(l) => Some(l.clone()),
        _ => None,
    }
}

fn make_by_condition(ctx: &BuildCtx<'_>, req: &FilterRequest) -> Result<Filter> {
    if let Some((key, nested_key)) = req.relation_key.split_once('.') {
        return make_nested(ctx, req, key, nested_key);
    }
    let key = req.relation_key.clone();
    let mut cond = req.condition;
    let mut value = req.value.clone();
    // checkbox semantics: unset equals false
    if value == Value::Bool(false) {
        match cond {
            Condition::Equal => { cond = Condition::NotEqual; value = Value::Bool(true); }
            Condition::NotEqual => { cond = Condition::Equal; value = Value::Bool(true); }
            _ => {}
        }
    }
    if let Some(m) = value.as_struct() {
        if let (Some(ec), Some("valueFromRelation")) = (eq_cond(cond), m.get(keys::TYPE).and_then(Value::as_str)) {
            let other = m.get(keys::RELATION_KEY).and_then(Value::as_str).unwrap_or_default();
            return Ok(Filter::ValuesComp { key, other: other.to_string(), cond: ec });
        }
        return Err(invalid(req, "unsupported complex filter"));
    }
    if let Some(cond) = eq_cond(cond) {
        return Ok(Filter::Eq { key, cond, value });
    }
    let not = |f: Filter| Filter::Not(Box::new(f));
    Ok(match cond {
        Condition::None => Filter::All,
        Condition::Like => Filter::Like { key, value: value.to_display().to_lowercase() },
        Condition::NotLike => not(Filter::Like { key, value: value.to_display().to_lowercase() }),
        Condition::In | Condition::NotIn => {
            let values = value.wrap_to_list().ok_or_else(|| invalid(req, "value must be a list"))?;
            let f = Filter::In { key, values };
            if cond == Condition::In { f } else { not(f) }
        }
        Condition::Empty => Filter::Empty { key },
        Condition::NotEmpty => not(Filter::Empty { key }),
        Condition::AllIn | Condition::NotAllIn => {
            let values = match &value {
                Value::String(_) | Value::Int(_) | Value::Float(_) => vec![value.clone()],
                Value::StringList(_) | Value::IntList(_) => value.wrap_to_list().unwrap_or_default(),
                _ => return Err(invalid(req, "unsupported value type")),
            };
            let f = Filter::AllIn { key, values };
            if cond == Condition::AllIn { f } else { not(f) }
        }
        Condition::ExactIn | Condition::NotExactIn => {
            let values = string_list(&value).ok_or_else(|| invalid(req, "value must be a list"))?;
            let options = live_options(ctx, &key)?;
            let f = Filter::ExactIn { key, values, options };
            if cond == Condition::ExactIn { f } else { not(f) }
        }
        Condition::Exists => Filter::Exists { key },
        _ => return Err(invalid(req, "unexpected condition")),
    })
}

fn live_options(ctx: &BuildCtx<'_>, key: &str) -> Result<Option<FxHashSet<String>>> {
    match ctx.store.relation_format(key) {
        Ok(f) if f.is_option() => {}
        _ => return Ok(None),
    }
    let opts = ctx.store.list_relation_options(key)?;
    Ok(Some(opts.iter().filter(|o| !o.get_bool(keys::IS_DELETED)).map(|o| o.id().to_string()).collect()))
}

/// `a.b <cond> v` resolves the ids of objects with `b <cond> v` and keeps
/// objects whose `a` references them. Negative conditions select the complement.
fn make_nested(ctx: &BuildCtx<'_>, req: &FilterRequest, key: &str, nested_key: &str) -> Result<Filter> {
    let negative = matches!(req.condition, Condition::NotEqual | Condition::NotIn);
    let mut inner_req = req.clone();
    inner_req.relation_key = nested_key.to_string();
    if negative {
        inner_req.condition = if req.condition == Condition::NotEqual { Condition::Equal } else { Condition::In };
    }
    let inner = make_filter(ctx, &inner_req)?.unwrap_or(Filter::All);
    let ids = resolve_ids(ctx.store, &inner)?;
    debug!(key, nested_key, ids = ids.len(), "query: nested filter resolved");
    let inner = Box::new(inner);
    let key = key.to_string();
    Ok(if negative { Filter::NestedNotIn { key, inner, ids } } else { Filter::NestedIn { key, inner, ids } })
}

pub fn resolve_ids(store: &dyn ObjectStore, inner: &Filter) -> Result<FxHashSet<String>> {
    let records = store
        .query(&Query::new(inner))
        .map_err(|e| SubError::StoreUnavailable(format!("nested filter: {}", e)))?;
    Ok(records.iter().map(|d: &std::sync::Arc<Details>| d.id().to_string()).collect())
}
