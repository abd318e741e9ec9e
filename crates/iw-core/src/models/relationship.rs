use serde::{Deserialize, Serialize};
use std::fmt;

/// How two resources are related.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// The source cannot function without the target.
    DependsOn,
    /// The source is a container of the target.
    Contains,
    /// The target is attached to the source (e.g. a data disk).
    AttachedTo,
    /// The target mentions the source; the schema is not known.
    RelatedTo,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::DependsOn => "depends_on",
            RelationshipType::Contains => "contains",
            RelationshipType::AttachedTo => "attached_to",
            RelationshipType::RelatedTo => "related_to",
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed edge found by relationship extraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub source: String,
    pub target: String,
    pub relationship_type: RelationshipType,
    /// Hops from the resource extraction started at (1 or 2).
    pub depth: u8,
}
