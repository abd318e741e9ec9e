//! Inventory data model.

mod change;
mod relationship;
mod resource;
mod subscription;

pub use change::{ChangeRecord, ChangeSet, ChangeType};
pub use relationship::{RelationshipEdge, RelationshipType};
pub use resource::{
    is_sensitive_tag_key, redact_tags, ModelError, Relationships, ResourceDocument, ResourceId,
    DEFAULT_DOCUMENT_TTL_SECS, UNKNOWN_RESOURCE_TYPE,
};
pub use subscription::Subscription;
