//! Client-facing filter and sort requests, before compilation.

use quarry_core::{RelationFormat, RelationKey, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterOperator {
    #[default]
    No,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Condition {
    #[default]
    None,
    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Like,
    NotLike,
    In,
    NotIn,
    Empty,
    NotEmpty,
    AllIn,
    NotAllIn,
    ExactIn,
    NotExactIn,
    Exists,
}

/// Relative date shortcuts expanded into day-aligned bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuickOption {
    #[default]
    ExactDate,
    Today,
    Yesterday,
    Tomorrow,
    CurrentWeek,
    LastWeek,
    NextWeek,
    CurrentMonth,
    LastMonth,
    NextMonth,
    NumberOfDaysAgo,
    NumberOfDaysNow,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterRequest {
    pub operator: FilterOperator,
    pub relation_key: RelationKey,
    pub condition: Condition,
    pub value: Value,
    /// Only consulted for date relations (`format = Some(Date)`).
    pub quick_option: QuickOption,
    pub format: Option<RelationFormat>,
    pub nested_filters: Vec<FilterRequest>,
}

impl FilterRequest {
    pub fn new(key: &str, condition: Condition, value: impl Into<Value>) -> Self {
        Self { relation_key: key.to_string(), condition, value: value.into(), ..Default::default() }
    }

    pub fn and(nested: Vec<FilterRequest>) -> Self {
        Self { operator: FilterOperator::And, nested_filters: nested, ..Default::default() }
    }

    pub fn or(nested: Vec<FilterRequest>) -> Self {
        Self { operator: FilterOperator::Or, nested_filters: nested, ..Default::default() }
    }

    /// True when this request (or any nested one) constrains `key`.
    pub fn mentions(&self, key: &str) -> bool {
        self.relation_key == key || self.nested_filters.iter().any(|f| f.mentions(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortType {
    #[default]
    Asc,
    Desc,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmptyPlacement {
    #[default]
    NotSpecified,
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SortRequest {
    pub relation_key: RelationKey,
    #[serde(rename = "type")]
    pub sort_type: SortType,
    /// Pinned values for `SortType::Custom`.
    pub custom_order: Vec<Value>,
    pub format: Option<RelationFormat>,
    pub include_time: bool,
    pub empty_placement: EmptyPlacement,
}

impl SortRequest {
    pub fn asc(key: &str) -> Self { Self { relation_key: key.to_string(), ..Default::default() } }
    pub fn desc(key: &str) -> Self { Self { relation_key: key.to_string(), sort_type: SortType::Desc, ..Default::default() } }
}
