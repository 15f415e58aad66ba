//! Quarry core types: typed detail values, object details, relation metadata,
//! outbound subscription events and the shared error enum.

#![forbid(unsafe_code)]

mod details;
mod error;
mod event;
pub mod relation;
mod value;

pub use details::{Details, KeyValue, Record, RelationKey};
pub use error::{Result, SubError};
pub use event::{Counters, Event, EventMessage, Group, SubIds};
pub use relation::{keys, layout, RelationFormat, DEP_SUFFIX, ORDER_SUFFIX};
pub use value::Value;

pub mod prelude {
    pub use super::{keys, Counters, Details, EventMessage, Record, RelationFormat, RelationKey, Result, SubError, Value};
}
