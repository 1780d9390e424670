//! Immutable snapshots of a document taken before a post-send edit
use super::document::{ContentBlock, Document, TimeStamp};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    #[n(0)]
    Edited,
    #[n(1)]
    Restored,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DocumentVersion {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub version_number: u32, // the version being superseded
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub content: Vec<ContentBlock>,
    #[n(4)]
    pub variables: BTreeMap<String, String>,
    #[n(5)]
    pub change_type: ChangeType,
    #[n(6)]
    pub change_description: Option<String>,
    #[n(7)]
    pub created_by: String,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

/// Capture the pre-edit state. The caller bumps `current_version` and writes
/// both records in the same transaction.
pub fn snapshot(
    document: &Document,
    change_type: ChangeType,
    change_description: Option<&str>,
    created_by: &str,
    now: DateTime<Utc>,
) -> DocumentVersion {
    DocumentVersion {
        document_id: document.id.clone(),
        version_number: document.current_version,
        title: document.title.clone(),
        content: document.content.clone(),
        variables: document.variables.clone(),
        change_type,
        change_description: change_description.map(str::to_string),
        created_by: created_by.to_string(),
        created_at: now.into(),
    }
}
