//! Local ⇄ remote record shapes

use crate::record::{Record, SyncStatus};

use super::RemoteDocument;

/// Address of a record on the remote store
pub fn remote_path(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

/// Split `{collection}/{id}`
pub fn parse_path(path: &str) -> Option<(&str, &str)> {
    let (collection, id) = path.split_once('/')?;
    if collection.is_empty() || id.is_empty() || id.contains('/') {
        return None;
    }
    Some((collection, id))
}

/// Strip engine bookkeeping and null fields from a local record
pub fn to_remote(record: &Record) -> RemoteDocument {
    let mut fields = record.data.clone();
    fields.retain(|_, value| !value.is_null());

    RemoteDocument {
        id: record.id.clone(),
        fields,
        created_at: record.created_at,
        updated_at: record.updated_at,
        modified_at: record.local_updated_at,
    }
}

/// Rebuild a synced local record from its remote copy
pub fn from_remote(doc: RemoteDocument, synced_at: i64) -> Record {
    Record {
        id: doc.id,
        data: doc.fields,
        created_at: doc.created_at,
        updated_at: doc.updated_at,
        sync_status: SyncStatus::Synced,
        local_updated_at: doc.modified_at,
        last_synced_at: Some(synced_at.max(doc.modified_at)),
        deleted: false,
    }
}
