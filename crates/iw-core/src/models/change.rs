use super::ResourceDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change observed by incremental discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

/// A resource together with the change that surfaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(flatten)]
    pub resource: ResourceDocument,
    pub change_type: ChangeType,
}

/// Changes found in one incremental scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub created: Vec<ChangeRecord>,
    pub modified: Vec<ChangeRecord>,
    pub deleted: Vec<ChangeRecord>,
    pub scanned_at: DateTime<Utc>,
}

impl ChangeSet {
    pub fn empty(scanned_at: DateTime<Utc>) -> Self {
        Self {
            created: Vec::new(),
            modified: Vec::new(),
            deleted: Vec::new(),
            scanned_at,
        }
    }

    pub fn push(&mut self, resource: ResourceDocument, change_type: ChangeType) {
        let record = ChangeRecord {
            resource,
            change_type,
        };
        match change_type {
            ChangeType::Created => self.created.push(record),
            ChangeType::Modified => self.modified.push(record),
            ChangeType::Deleted => self.deleted.push(record),
        }
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Created and modified records.
    pub fn upserts(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.created.iter().chain(self.modified.iter())
    }
}
