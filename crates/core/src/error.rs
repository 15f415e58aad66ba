/// Errors surfaced by the subscription engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("unknown anchor: {0}")]
    UnknownAnchor(String),
    #[error("offset {offset} out of range (total {total})")]
    OffsetOutOfRange { offset: usize, total: usize },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("internal invariant: {0}")]
    InternalInvariant(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SubError>;
