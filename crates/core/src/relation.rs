use serde::{Deserialize, Serialize};

/// Well-known relation keys.
pub mod keys {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const SNIPPET: &str = "snippet";
    pub const LAYOUT: &str = "layout";
    pub const ORDER_ID: &str = "orderId";
    pub const SPACE_ORDER: &str = "spaceOrder";
    pub const SPACE_ID: &str = "spaceId";
    pub const IS_ARCHIVED: &str = "isArchived";
    pub const IS_DELETED: &str = "isDeleted";
    pub const RELATION_KEY: &str = "relationKey";
    pub const FEATURED_RELATIONS: &str = "featuredRelations";
    pub const TYPE: &str = "type";
}

/// Well-known object layouts (stored as strings under `layout`).
pub mod layout {
    pub const BASIC: &str = "basic";
    pub const NOTE: &str = "note";
    pub const SPACE: &str = "space";
    pub const RELATION_OPTION: &str = "relationOption";
}

/// Suffix of dependency child subscription ids.
pub const DEP_SUFFIX: &str = "/dep";
/// Suffix of order side-subscription ids.
pub const ORDER_SUFFIX: &str = "-order-sub";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationFormat {
    #[default]
    ShortText,
    LongText,
    Number,
    Date,
    Checkbox,
    Url,
    Email,
    Phone,
    Emoji,
    Object,
    File,
    Tag,
    Status,
}

impl RelationFormat {
    /// Formats whose values are ids of other objects.
    pub fn is_dependency(self) -> bool {
        matches!(self, RelationFormat::Object | RelationFormat::File | RelationFormat::Tag | RelationFormat::Status)
    }

    /// Tag and status values are first-class options with an `orderId`.
    pub fn is_option(self) -> bool { matches!(self, RelationFormat::Tag | RelationFormat::Status) }

    pub fn is_text(self) -> bool { matches!(self, RelationFormat::ShortText | RelationFormat::LongText) }
}
